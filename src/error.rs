//! Error types for poolgres.

use std::time::Duration;

use thiserror::Error;

/// Result type for poolgres operations.
pub type Result<T> = core::result::Result<T, Error>;

/// SQLSTATE reported by the server when a query is canceled.
pub const QUERY_CANCELED_SQLSTATE: &str = "57014";

/// Parsed fields of an ErrorResponse or NoticeResponse message.
#[derive(Debug, Clone, Default)]
pub struct ErrorFields {
    /// Severity (localized): ERROR, FATAL, PANIC, WARNING, NOTICE, ...
    pub severity: Option<String>,
    /// Severity (non-localized, PostgreSQL 9.6+)
    pub severity_non_localized: Option<String>,
    /// SQLSTATE code (5 characters)
    pub code: Option<String>,
    /// Primary error message
    pub message: Option<String>,
    /// Detailed error explanation
    pub detail: Option<String>,
    /// Suggestion for fixing the error
    pub hint: Option<String>,
    /// Cursor position in query string (1-based)
    pub position: Option<u32>,
    /// Position in internal query
    pub internal_position: Option<u32>,
    /// Failed internal command text
    pub internal_query: Option<String>,
    /// Context/stack trace
    pub where_: Option<String>,
    /// Schema name
    pub schema: Option<String>,
    /// Table name
    pub table: Option<String>,
    /// Column name
    pub column: Option<String>,
    /// Data type name
    pub data_type: Option<String>,
    /// Constraint name
    pub constraint: Option<String>,
    /// Source file name
    pub file: Option<String>,
    /// Source line number
    pub line: Option<u32>,
    /// Source routine name
    pub routine: Option<String>,
}

impl ErrorFields {
    /// Severity, preferring the non-localized variant.
    pub fn severity(&self) -> &str {
        self.severity_non_localized
            .as_deref()
            .or(self.severity.as_deref())
            .unwrap_or_default()
    }

    /// SQLSTATE code.
    pub fn code(&self) -> &str {
        self.code.as_deref().unwrap_or_default()
    }

    /// Primary message.
    pub fn message(&self) -> &str {
        self.message.as_deref().unwrap_or_default()
    }
}

impl std::fmt::Display for ErrorFields {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {} (SQLSTATE {})",
            self.severity(),
            self.message(),
            self.code()
        )?;
        if let Some(detail) = &self.detail {
            write!(f, "\nDETAIL: {}", detail)?;
        }
        if let Some(hint) = &self.hint {
            write!(f, "\nHINT: {}", hint)?;
        }
        Ok(())
    }
}

/// Error type for poolgres.
#[derive(Debug, Error)]
pub enum Error {
    /// The transport was closed by the peer, possibly mid-frame.
    #[error("connection closed by peer")]
    TransportClosed,

    /// A transport read or write exceeded its timeout.
    #[error("transport i/o timed out after {0:?}")]
    TransportTimeout(Duration),

    /// Protocol violation (malformed message, unexpected response, ...)
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The server requested an authentication method this client does not speak.
    #[error("unsupported authentication method: {0}")]
    UnsupportedAuth(String),

    /// The server rejected our credentials during startup.
    #[error("authentication failed: {0}")]
    AuthFailed(ErrorFields),

    /// Error response from the server during a query.
    #[error("server error: {0}")]
    Server(ErrorFields),

    /// The outstanding query was canceled (SQLSTATE 57014).
    #[error("query canceled: {0}")]
    QueryCanceled(ErrorFields),

    /// The connection entered a fatal state while operations were pending.
    #[error("connection lost")]
    ConnectionLost,

    /// A name-based column lookup was attempted on a row without metadata.
    #[error("row carries no description")]
    MissingRowMeta,

    /// The named column does not exist in the row description.
    #[error("column {0:?} not present in row")]
    ColumnNotPresent(String),

    /// No converter is registered for the requested type.
    #[error("no conversion registered for type {0:?}")]
    NoConversion(String),

    /// A converter rejected the raw value for the given column.
    #[error("cannot convert oid {oid} to {ty}: {cause}")]
    ConvertTo {
        /// Target type identifier
        ty: String,
        /// Source column type OID
        oid: u32,
        /// Underlying reason
        cause: String,
    },

    /// A converter produced a null value for non-null input.
    #[error("converter produced null for non-null data")]
    InvalidConvertDataType,

    /// The pool has been closed.
    #[error("pool is closed")]
    PoolClosed,

    /// No connection became available within the borrow timeout.
    #[error("timed out waiting for a pooled connection")]
    BorrowTimeout,

    /// The validation query failed on three successive connections.
    #[error("connection validation failed")]
    ValidationFailed,

    /// Invalid connection URL or option value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// I/O error
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build the conversion error for a column/target pair.
    pub(crate) fn convert(ty: impl Into<String>, oid: u32, cause: impl Into<String>) -> Self {
        Error::ConvertTo {
            ty: ty.into(),
            oid,
            cause: cause.into(),
        }
    }

    /// Returns true if the error leaves the connection unusable.
    ///
    /// Per-query server errors do not break the connection; transport and
    /// protocol failures do, as do FATAL/PANIC responses.
    pub fn is_connection_broken(&self) -> bool {
        match self {
            Error::Io(_)
            | Error::TransportClosed
            | Error::TransportTimeout(_)
            | Error::Protocol(_)
            | Error::ConnectionLost => true,
            Error::Server(fields) => matches!(fields.severity(), "FATAL" | "PANIC"),
            _ => false,
        }
    }

    /// The SQLSTATE code if this error came from the server.
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Server(fields) | Error::AuthFailed(fields) | Error::QueryCanceled(fields) => {
                Some(fields.code())
            }
            _ => None,
        }
    }

    /// Wrap server fields, recognizing cancellation by SQLSTATE.
    pub(crate) fn from_server_fields(fields: ErrorFields) -> Self {
        if fields.code() == QUERY_CANCELED_SQLSTATE {
            Error::QueryCanceled(fields)
        } else {
            Error::Server(fields)
        }
    }
}

impl From<std::convert::Infallible> for Error {
    fn from(err: std::convert::Infallible) -> Self {
        match err {}
    }
}
