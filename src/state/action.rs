//! Action types for state machine I/O requests.

use crate::error::ErrorFields;

/// Action requested by a state machine.
///
/// The driver performs the requested I/O and then calls `step()` again.
#[derive(Debug)]
pub enum Action {
    /// Write `bufs.write_buffer` to the server and flush.
    Write,

    /// Read one PostgreSQL message into the buffer set.
    ReadMessage,

    /// Write `bufs.write_buffer`, then read a single raw byte.
    ///
    /// Used for SSL negotiation: the response to SSLRequest is an
    /// unframed 'S' or 'N'.
    WriteAndReadByte,

    /// Write `bufs.write_buffer`, then read one message.
    WriteAndReadMessage,

    /// Upgrade the transport to TLS, then call `step()` again.
    TlsHandshake,

    /// An asynchronous message arrived.
    ///
    /// The driver should dispatch it, read the next message, and call
    /// `step()` again.
    HandleAsync(AsyncMessage),

    /// The state machine has finished successfully.
    Finished,
}

/// Asynchronous message from the server.
///
/// These can arrive at any point, including mid-result-set.
#[derive(Debug, Clone)]
pub enum AsyncMessage {
    /// Notification from LISTEN/NOTIFY.
    Notification {
        /// PID of the notifying backend process
        pid: u32,
        /// Channel name
        channel: String,
        /// Notification payload
        payload: String,
    },

    /// Non-fatal notice/warning from the server.
    Notice(ErrorFields),

    /// Server parameter value changed.
    ParameterChanged {
        /// Parameter name
        name: String,
        /// New value
        value: String,
    },
}
