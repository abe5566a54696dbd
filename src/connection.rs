//! Asynchronous PostgreSQL connection.

use std::collections::HashMap;

use crate::buffer_set::BufferSet;
use crate::cancel::CancelToken;
use crate::config::Config;
use crate::convert::Registry;
use crate::error::{Error, ErrorFields, Result};
use crate::protocol::backend::{BackendKeyData, ErrorResponse, RawMessage, ReadyForQuery, msg_type};
use crate::protocol::frontend::{
    write_bind, write_execute, write_parse, write_sync, write_terminate,
};
use crate::protocol::types::{Oid, TransactionStatus};
use crate::row::Row;
use crate::state::action::{Action, AsyncMessage};
use crate::state::{
    BatchFlow, ExtendedQueryFlow, PreparedStatement, QueryOutcome, ResultSet, SimpleQueryFlow,
    StateMachine, StartupFlow,
};
use crate::transport::Transport;
use crate::value::Value;

/// One PostgreSQL connection.
///
/// A connection drives exactly one operation at a time; the caller
/// observes operations complete in issue order. Fatal errors (I/O,
/// protocol violations, FATAL responses) mark it broken; per-query
/// server errors leave it usable at the next ReadyForQuery.
pub struct Connection {
    transport: Transport,
    bufs: BufferSet,
    config: Config,
    backend_key: Option<BackendKeyData>,
    parameters: HashMap<String, String>,
    transaction_status: TransactionStatus,
    broken: bool,
    closed: bool,
    statement_counter: u64,
    notice_sink: Option<Box<dyn Fn(&ErrorFields) + Send + Sync>>,
}

impl Connection {
    /// Connect and authenticate.
    pub async fn connect(config: Config) -> Result<Self> {
        if config.user.is_empty() {
            return Err(Error::InvalidConfig("user is required".into()));
        }
        let mut transport =
            Transport::connect(&config.host, config.port, config.io_timeout).await?;
        let mut bufs = BufferSet::new();
        let mut flow = StartupFlow::new(config.clone());

        loop {
            match flow.step(&mut bufs)? {
                Action::Write => {
                    transport.write_all(&bufs.write_buffer).await?;
                }
                Action::ReadMessage => {
                    transport.read_message(&mut bufs).await?;
                }
                Action::WriteAndReadByte => {
                    transport.write_all(&bufs.write_buffer).await?;
                    let byte = transport.read_u8().await?;
                    flow.set_ssl_response(byte);
                }
                Action::WriteAndReadMessage => {
                    transport.write_all(&bufs.write_buffer).await?;
                    transport.read_message(&mut bufs).await?;
                }
                Action::TlsHandshake => {
                    return Err(Error::InvalidConfig(
                        "server accepted SSL but no TLS upgrader is available".into(),
                    ));
                }
                Action::HandleAsync(_) => {
                    // Notices before authentication have nowhere to go yet.
                    transport.read_message(&mut bufs).await?;
                }
                Action::Finished => break,
            }
        }

        let parameters = flow.take_server_params().into_iter().collect();

        Ok(Self {
            transport,
            bufs,
            backend_key: flow.backend_key(),
            parameters,
            transaction_status: flow.transaction_status(),
            broken: false,
            closed: false,
            statement_counter: 0,
            notice_sink: None,
            config,
        })
    }

    /// Connect using a URL or prebuilt config.
    pub async fn connect_with<C: TryInto<Config>>(config: C) -> Result<Self>
    where
        Error: From<C::Error>,
    {
        Self::connect(config.try_into()?).await
    }

    /// Backend process ID, 0 if the server sent no key data.
    pub fn backend_pid(&self) -> u32 {
        self.backend_key.map_or(0, |key| key.process_id())
    }

    /// A token for cancelling this connection's outstanding query from
    /// elsewhere.
    pub fn cancel_token(&self) -> Option<CancelToken> {
        self.backend_key.map(|key| {
            CancelToken::new(
                self.config.host.clone(),
                self.config.port,
                key.process_id(),
                key.secret(),
                self.config.io_timeout,
            )
        })
    }

    /// The last reported value of a server parameter.
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    /// Current transaction status.
    pub fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }

    /// Check if currently inside a transaction block.
    pub fn in_transaction(&self) -> bool {
        self.transaction_status.in_transaction()
    }

    /// Check if the connection is broken and must not be reused.
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Check if the connection has been terminated.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Install a sink for NoticeResponse messages.
    ///
    /// Without a sink, notices are logged.
    pub fn set_notice_sink<F>(&mut self, sink: F)
    where
        F: Fn(&ErrorFields) + Send + Sync + 'static,
    {
        self.notice_sink = Some(Box::new(sink));
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.broken || self.closed {
            return Err(Error::ConnectionLost);
        }
        Ok(())
    }

    fn dispatch_async(&mut self, message: AsyncMessage) {
        match message {
            AsyncMessage::Notice(fields) => match &self.notice_sink {
                Some(sink) => sink(&fields),
                None => tracing::info!(notice = %fields, "server notice"),
            },
            AsyncMessage::Notification {
                pid,
                channel,
                payload,
            } => {
                let delivered = self
                    .config
                    .notification_handler
                    .as_ref()
                    .is_some_and(|handler| handler.deliver(&channel, pid, &payload));
                if !delivered {
                    tracing::debug!(channel = %channel, pid, "dropping undeliverable notification");
                }
            }
            AsyncMessage::ParameterChanged { name, value } => {
                self.parameters.insert(name, value);
            }
        }
    }

    /// Drive a state machine to completion.
    ///
    /// On a per-query server error the stream is drained to
    /// ReadyForQuery before the error is surfaced; fatal errors mark
    /// the connection broken instead.
    async fn drive<M: StateMachine>(&mut self, machine: &mut M) -> Result<()> {
        let result = self.drive_inner(machine).await;
        match result {
            Ok(()) => {
                self.transaction_status = machine.transaction_status();
                Ok(())
            }
            Err(error) if error.is_connection_broken() => {
                self.broken = true;
                Err(error)
            }
            Err(error) => {
                if let Err(drain_error) = self.drain_to_ready().await {
                    self.broken = true;
                    tracing::debug!(error = %drain_error, "drain after query error failed");
                }
                Err(error)
            }
        }
    }

    async fn drive_inner<M: StateMachine>(&mut self, machine: &mut M) -> Result<()> {
        loop {
            match machine.step(&mut self.bufs)? {
                Action::Write => {
                    self.transport.write_all(&self.bufs.write_buffer).await?;
                }
                Action::ReadMessage => {
                    self.transport.read_message(&mut self.bufs).await?;
                }
                Action::WriteAndReadMessage => {
                    self.transport.write_all(&self.bufs.write_buffer).await?;
                    self.transport.read_message(&mut self.bufs).await?;
                }
                Action::WriteAndReadByte | Action::TlsHandshake => {
                    return Err(Error::Protocol(
                        "startup-only action in query flow".into(),
                    ));
                }
                Action::HandleAsync(message) => {
                    self.dispatch_async(message);
                    self.transport.read_message(&mut self.bufs).await?;
                }
                Action::Finished => return Ok(()),
            }
        }
    }

    /// Consume messages until ReadyForQuery, keeping async dispatch
    /// and transaction bookkeeping intact.
    async fn drain_to_ready(&mut self) -> Result<()> {
        loop {
            self.transport.read_message(&mut self.bufs).await?;
            let type_byte = self.bufs.type_byte;

            if RawMessage::is_async_type(type_byte) {
                let message =
                    crate::state::parse_async_message(type_byte, &self.bufs.read_buffer)?;
                self.dispatch_async(message);
                continue;
            }

            match type_byte {
                msg_type::READY_FOR_QUERY => {
                    let ready = ReadyForQuery::parse(&self.bufs.read_buffer)?;
                    self.transaction_status = ready.transaction_status().unwrap_or_default();
                    return Ok(());
                }
                msg_type::ERROR_RESPONSE => {
                    // Secondary errors between the failure and Sync are
                    // logged, not surfaced.
                    let error = ErrorResponse::parse(&self.bufs.read_buffer)?;
                    tracing::debug!(error = %error.fields, "error while draining pipeline");
                }
                _ => {}
            }
        }
    }

    // === Simple query protocol ===

    /// Execute one or more SQL statements via the simple protocol.
    ///
    /// Per-statement failures are recorded on the corresponding
    /// [`ResultSet`]; use [`QueryOutcome::into_result`] to turn the
    /// first one into a hard error.
    pub async fn query(&mut self, sql: &str) -> Result<QueryOutcome> {
        self.ensure_usable()?;
        let mut flow = SimpleQueryFlow::new(sql);
        self.drive(&mut flow).await?;
        Ok(flow.take_outcome())
    }

    /// Execute a query and collect all rows, failing on any statement
    /// error.
    pub async fn query_rows(&mut self, sql: &str) -> Result<Vec<Row>> {
        Ok(self.query(sql).await?.into_result()?.into_rows())
    }

    /// Execute statements for their side effects; returns the affected
    /// row count of the last statement.
    pub async fn execute_simple(&mut self, sql: &str) -> Result<Option<u64>> {
        Ok(self.query(sql).await?.into_result()?.rows_affected())
    }

    /// Check connection aliveness with an empty query.
    pub async fn ping(&mut self) -> Result<()> {
        self.query("").await?;
        Ok(())
    }

    // === Extended query protocol ===

    fn encode_params(params: &[Value]) -> Result<(Vec<Oid>, Vec<crate::protocol::frontend::EncodedParam>)> {
        let registry = Registry::global();
        let oids = params.iter().map(Value::natural_oid).collect();
        let encoded = params
            .iter()
            .map(|value| registry.encode(value))
            .collect::<Result<Vec<_>>>()?;
        Ok((oids, encoded))
    }

    /// Prepare a named statement.
    pub async fn prepare(&mut self, sql: &str) -> Result<PreparedStatement> {
        self.ensure_usable()?;
        self.statement_counter += 1;
        let name = format!("pgs_{}", self.statement_counter);

        let mut flow = ExtendedQueryFlow::prepare(&mut self.bufs, &name, sql, &[]);
        self.drive(&mut flow).await?;
        flow.take_prepared_statement()
            .ok_or_else(|| Error::Protocol("prepare finished without a statement".into()))
    }

    /// Execute a parameterized statement via the unnamed prepared
    /// statement (Parse + Bind + Describe + Execute + Sync).
    pub async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<ResultSet> {
        self.ensure_usable()?;
        let (oids, encoded) = Self::encode_params(params)?;
        let mut flow = ExtendedQueryFlow::execute_sql(&mut self.bufs, sql, &oids, &encoded);
        self.drive(&mut flow).await?;
        Ok(flow.take_result())
    }

    /// Execute a previously prepared statement.
    pub async fn execute_prepared(
        &mut self,
        statement: &PreparedStatement,
        params: &[Value],
    ) -> Result<ResultSet> {
        self.ensure_usable()?;
        let (_, encoded) = Self::encode_params(params)?;
        let mut flow = ExtendedQueryFlow::execute_prepared(&mut self.bufs, statement, &encoded);
        self.drive(&mut flow).await?;
        Ok(flow.take_result())
    }

    /// Release a prepared statement on the server.
    pub async fn close_statement(&mut self, statement: &PreparedStatement) -> Result<()> {
        self.ensure_usable()?;
        let mut flow = ExtendedQueryFlow::close_statement(&mut self.bufs, &statement.name);
        self.drive(&mut flow).await
    }

    /// Execute one statement with many parameter sets, pipelined
    /// before a single Sync. Returns per-set affected row counts.
    pub async fn execute_batch(
        &mut self,
        sql: &str,
        param_sets: &[Vec<Value>],
    ) -> Result<Vec<Option<u64>>> {
        self.ensure_usable()?;
        if param_sets.is_empty() {
            return Ok(Vec::new());
        }

        let (oids, _) = Self::encode_params(&param_sets[0])?;

        self.bufs.write_buffer.clear();
        write_parse(&mut self.bufs.write_buffer, "", sql, &oids);
        for params in param_sets {
            let (_, encoded) = Self::encode_params(params)?;
            write_bind(&mut self.bufs.write_buffer, "", "", &encoded, &[]);
            write_execute(&mut self.bufs.write_buffer, "", 0);
        }
        write_sync(&mut self.bufs.write_buffer);

        let mut flow = BatchFlow::new(true);
        self.drive(&mut flow).await?;
        Ok(flow.take_rows_affected())
    }

    // === Lifecycle ===

    /// Send Terminate best-effort and close the transport. Idempotent.
    pub async fn terminate(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if !self.broken {
            self.bufs.write_buffer.clear();
            write_terminate(&mut self.bufs.write_buffer);
            let _ = self.transport.write_all(&self.bufs.write_buffer).await;
        }
        self.transport.close().await;
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("backend_pid", &self.backend_pid())
            .field("transaction_status", &self.transaction_status)
            .field("broken", &self.broken)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}
