//! Extended query protocol state machine.
//!
//! Parse → Describe → Bind → Describe → Execute → Sync, with a batch
//! variant that pipelines many Bind/Execute pairs before one Sync. On a
//! mid-pipeline error the server discards until Sync; the driver drains
//! the stream to ReadyForQuery correspondingly.

use std::sync::Arc;

use crate::buffer_set::BufferSet;
use crate::error::{Error, Result};
use crate::protocol::backend::{
    BindComplete, CloseComplete, CommandComplete, DataRow, EmptyQueryResponse, ErrorResponse,
    NoData, ParameterDescription, ParseComplete, PortalSuspended, RawMessage, ReadyForQuery,
    WireRowDescription, msg_type,
};
use crate::protocol::frontend::{
    EncodedParam, write_bind, write_close_statement, write_describe_portal,
    write_describe_statement, write_execute, write_parse, write_sync,
};
use crate::protocol::types::{Oid, TransactionStatus};
use crate::row::{Row, RowDescription};

use super::action::Action;
use super::simple_query::ResultSet;
use super::{StateMachine, parse_async_message};

/// A server-side prepared statement.
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    /// Wire name of the statement
    pub name: String,
    /// Parameter type OIDs reported by Describe
    pub param_oids: Vec<Oid>,
    /// Result description, absent for statements returning no rows
    pub row_description: Option<Arc<RowDescription>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Initial,
    AwaitParse,
    AwaitParamDescription,
    AwaitRowDescription,
    AwaitBind,
    Rows,
    AwaitReady,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    /// Parse + Describe(statement) + Sync
    Prepare,
    /// Bind + Describe(portal) + Execute + Sync
    Execute,
    /// Parse + Bind + Describe(portal) + Execute + Sync
    ExecuteSql,
    /// Close(statement) + Sync
    CloseStatement,
}

/// Extended query protocol state machine.
pub struct ExtendedQueryFlow {
    state: State,
    operation: Operation,
    transaction_status: TransactionStatus,
    prepared: Option<PreparedStatement>,
    current: Option<(Arc<RowDescription>, Vec<Row>)>,
    result: ResultSet,
}

impl ExtendedQueryFlow {
    fn new(operation: Operation) -> Self {
        Self {
            state: State::Initial,
            operation,
            transaction_status: TransactionStatus::Idle,
            prepared: None,
            current: None,
            result: ResultSet::default(),
        }
    }

    /// Prepare a named statement; fills `bufs.write_buffer`.
    pub fn prepare(bufs: &mut BufferSet, name: &str, sql: &str, param_oids: &[Oid]) -> Self {
        bufs.write_buffer.clear();
        write_parse(&mut bufs.write_buffer, name, sql, param_oids);
        write_describe_statement(&mut bufs.write_buffer, name);
        write_sync(&mut bufs.write_buffer);

        let mut flow = Self::new(Operation::Prepare);
        flow.prepared = Some(PreparedStatement {
            name: name.to_string(),
            param_oids: Vec::new(),
            row_description: None,
        });
        flow
    }

    /// Execute a previously prepared statement; fills `bufs.write_buffer`.
    pub fn execute_prepared(
        bufs: &mut BufferSet,
        statement: &PreparedStatement,
        params: &[EncodedParam],
    ) -> Self {
        bufs.write_buffer.clear();
        write_bind(&mut bufs.write_buffer, "", &statement.name, params, &[]);
        write_describe_portal(&mut bufs.write_buffer, "");
        write_execute(&mut bufs.write_buffer, "", 0);
        write_sync(&mut bufs.write_buffer);

        Self::new(Operation::Execute)
    }

    /// One-shot parameterized execution via the unnamed statement.
    pub fn execute_sql(
        bufs: &mut BufferSet,
        sql: &str,
        param_oids: &[Oid],
        params: &[EncodedParam],
    ) -> Self {
        bufs.write_buffer.clear();
        write_parse(&mut bufs.write_buffer, "", sql, param_oids);
        write_bind(&mut bufs.write_buffer, "", "", params, &[]);
        write_describe_portal(&mut bufs.write_buffer, "");
        write_execute(&mut bufs.write_buffer, "", 0);
        write_sync(&mut bufs.write_buffer);

        Self::new(Operation::ExecuteSql)
    }

    /// Release a prepared statement; fills `bufs.write_buffer`.
    pub fn close_statement(bufs: &mut BufferSet, name: &str) -> Self {
        bufs.write_buffer.clear();
        write_close_statement(&mut bufs.write_buffer, name);
        write_sync(&mut bufs.write_buffer);

        Self::new(Operation::CloseStatement)
    }

    /// Take the prepared statement after a prepare completes.
    pub fn take_prepared_statement(&mut self) -> Option<PreparedStatement> {
        self.prepared.take()
    }

    /// Take the collected result set after `Action::Finished`.
    pub fn take_result(&mut self) -> ResultSet {
        std::mem::take(&mut self.result)
    }

    fn handle_parse(&mut self, bufs: &BufferSet) -> Result<Action> {
        if bufs.type_byte != msg_type::PARSE_COMPLETE {
            return Err(Error::Protocol(format!(
                "expected ParseComplete, got '{}'",
                bufs.type_byte as char
            )));
        }
        ParseComplete::parse(&bufs.read_buffer)?;

        self.state = match self.operation {
            Operation::Prepare => State::AwaitParamDescription,
            Operation::ExecuteSql => State::AwaitBind,
            _ => return Err(Error::Protocol("ParseComplete outside parse flow".into())),
        };
        Ok(Action::ReadMessage)
    }

    fn handle_param_description(&mut self, bufs: &BufferSet) -> Result<Action> {
        if bufs.type_byte != msg_type::PARAMETER_DESCRIPTION {
            return Err(Error::Protocol(format!(
                "expected ParameterDescription, got '{}'",
                bufs.type_byte as char
            )));
        }

        let description = ParameterDescription::parse(&bufs.read_buffer)?;
        if let Some(statement) = self.prepared.as_mut() {
            statement.param_oids = description.oids().to_vec();
        }
        self.state = State::AwaitRowDescription;
        Ok(Action::ReadMessage)
    }

    fn handle_row_description(&mut self, bufs: &BufferSet) -> Result<Action> {
        match bufs.type_byte {
            msg_type::ROW_DESCRIPTION => {
                let wire = WireRowDescription::parse(&bufs.read_buffer)?;
                if let Some(statement) = self.prepared.as_mut() {
                    statement.row_description = Some(Arc::new(RowDescription::from_wire(&wire)));
                }
                self.state = State::AwaitReady;
                Ok(Action::ReadMessage)
            }
            msg_type::NO_DATA => {
                NoData::parse(&bufs.read_buffer)?;
                self.state = State::AwaitReady;
                Ok(Action::ReadMessage)
            }
            other => Err(Error::Protocol(format!(
                "expected RowDescription or NoData, got '{}'",
                other as char
            ))),
        }
    }

    fn handle_bind(&mut self, bufs: &BufferSet) -> Result<Action> {
        if bufs.type_byte != msg_type::BIND_COMPLETE {
            return Err(Error::Protocol(format!(
                "expected BindComplete, got '{}'",
                bufs.type_byte as char
            )));
        }
        BindComplete::parse(&bufs.read_buffer)?;
        self.state = State::Rows;
        Ok(Action::ReadMessage)
    }

    fn handle_rows(&mut self, bufs: &BufferSet) -> Result<Action> {
        let payload = &bufs.read_buffer;

        match bufs.type_byte {
            msg_type::ROW_DESCRIPTION => {
                let wire = WireRowDescription::parse(payload)?;
                self.current = Some((Arc::new(RowDescription::from_wire(&wire)), Vec::new()));
                Ok(Action::ReadMessage)
            }
            msg_type::NO_DATA => {
                NoData::parse(payload)?;
                Ok(Action::ReadMessage)
            }
            msg_type::DATA_ROW => {
                let Some((description, rows)) = self.current.as_mut() else {
                    return Err(Error::Protocol("DataRow before RowDescription".into()));
                };
                let row = DataRow::parse(payload)?;
                if row.len() != description.len() {
                    return Err(Error::Protocol(format!(
                        "DataRow has {} fields, description has {}",
                        row.len(),
                        description.len()
                    )));
                }
                let raw = row.iter().map(|field| field.map(<[u8]>::to_vec)).collect();
                rows.push(Row::new(Some(Arc::clone(description)), raw));
                Ok(Action::ReadMessage)
            }
            msg_type::COMMAND_COMPLETE => {
                let complete = CommandComplete::parse(payload)?;
                let rows = self.current.take().map(|(_, rows)| rows).unwrap_or_default();
                self.result = ResultSet {
                    rows,
                    command_tag: Some(complete.tag.to_string()),
                    error: None,
                };
                self.state = State::AwaitReady;
                Ok(Action::ReadMessage)
            }
            msg_type::EMPTY_QUERY_RESPONSE => {
                EmptyQueryResponse::parse(payload)?;
                self.state = State::AwaitReady;
                Ok(Action::ReadMessage)
            }
            msg_type::PORTAL_SUSPENDED => {
                PortalSuspended::parse(payload)?;
                self.state = State::AwaitReady;
                Ok(Action::ReadMessage)
            }
            other => Err(Error::Protocol(format!(
                "unexpected message in rows: '{}'",
                other as char
            ))),
        }
    }

    fn handle_ready(&mut self, bufs: &BufferSet) -> Result<Action> {
        match bufs.type_byte {
            msg_type::READY_FOR_QUERY => {
                let ready = ReadyForQuery::parse(&bufs.read_buffer)?;
                self.transaction_status = ready.transaction_status().unwrap_or_default();
                self.state = State::Finished;
                Ok(Action::Finished)
            }
            msg_type::CLOSE_COMPLETE => {
                CloseComplete::parse(&bufs.read_buffer)?;
                Ok(Action::ReadMessage)
            }
            other => Err(Error::Protocol(format!(
                "expected ReadyForQuery, got '{}'",
                other as char
            ))),
        }
    }
}

impl StateMachine for ExtendedQueryFlow {
    fn step(&mut self, bufs: &mut BufferSet) -> Result<Action> {
        if self.state == State::Initial {
            // The constructor pre-filled the write buffer.
            self.state = match self.operation {
                Operation::Prepare | Operation::ExecuteSql => State::AwaitParse,
                Operation::Execute => State::AwaitBind,
                Operation::CloseStatement => State::AwaitReady,
            };
            return Ok(Action::WriteAndReadMessage);
        }

        if RawMessage::is_async_type(bufs.type_byte) {
            return Ok(Action::HandleAsync(parse_async_message(
                bufs.type_byte,
                &bufs.read_buffer,
            )?));
        }

        if bufs.type_byte == msg_type::ERROR_RESPONSE {
            // The server discards the rest of the pipeline until Sync;
            // the driver drains to ReadyForQuery before surfacing this.
            let error = ErrorResponse::parse(&bufs.read_buffer)?;
            return Err(error.into_error());
        }

        match self.state {
            State::AwaitParse => self.handle_parse(bufs),
            State::AwaitParamDescription => self.handle_param_description(bufs),
            State::AwaitRowDescription => self.handle_row_description(bufs),
            State::AwaitBind => self.handle_bind(bufs),
            State::Rows => self.handle_rows(bufs),
            State::AwaitReady => self.handle_ready(bufs),
            state => Err(Error::Protocol(format!("unexpected state {:?}", state))),
        }
    }

    fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }
}

/// Batch execution: `Parse? + (Bind + Execute)* + Sync`, results
/// discarded except for per-statement row counts.
pub struct BatchFlow {
    state: BatchState,
    needs_parse: bool,
    rows_affected: Vec<Option<u64>>,
    transaction_status: TransactionStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BatchState {
    Initial,
    AwaitParse,
    Processing,
    Finished,
}

impl BatchFlow {
    /// Create a batch flow. The caller pre-fills `bufs.write_buffer`
    /// with the pipelined messages.
    pub fn new(needs_parse: bool) -> Self {
        Self {
            state: BatchState::Initial,
            needs_parse,
            rows_affected: Vec::new(),
            transaction_status: TransactionStatus::Idle,
        }
    }

    /// Per-execute row counts, in pipeline order.
    pub fn take_rows_affected(&mut self) -> Vec<Option<u64>> {
        std::mem::take(&mut self.rows_affected)
    }
}

impl StateMachine for BatchFlow {
    fn step(&mut self, bufs: &mut BufferSet) -> Result<Action> {
        if self.state == BatchState::Initial {
            self.state = if self.needs_parse {
                BatchState::AwaitParse
            } else {
                BatchState::Processing
            };
            return Ok(Action::WriteAndReadMessage);
        }

        if RawMessage::is_async_type(bufs.type_byte) {
            return Ok(Action::HandleAsync(parse_async_message(
                bufs.type_byte,
                &bufs.read_buffer,
            )?));
        }

        if bufs.type_byte == msg_type::ERROR_RESPONSE {
            let error = ErrorResponse::parse(&bufs.read_buffer)?;
            return Err(error.into_error());
        }

        match self.state {
            BatchState::AwaitParse => {
                if bufs.type_byte != msg_type::PARSE_COMPLETE {
                    return Err(Error::Protocol(format!(
                        "expected ParseComplete, got '{}'",
                        bufs.type_byte as char
                    )));
                }
                ParseComplete::parse(&bufs.read_buffer)?;
                self.state = BatchState::Processing;
                Ok(Action::ReadMessage)
            }
            BatchState::Processing => match bufs.type_byte {
                msg_type::BIND_COMPLETE | msg_type::NO_DATA | msg_type::DATA_ROW => {
                    Ok(Action::ReadMessage)
                }
                msg_type::ROW_DESCRIPTION => {
                    WireRowDescription::parse(&bufs.read_buffer)?;
                    Ok(Action::ReadMessage)
                }
                msg_type::COMMAND_COMPLETE => {
                    let complete = CommandComplete::parse(&bufs.read_buffer)?;
                    self.rows_affected.push(complete.rows_affected());
                    Ok(Action::ReadMessage)
                }
                msg_type::EMPTY_QUERY_RESPONSE => Ok(Action::ReadMessage),
                msg_type::READY_FOR_QUERY => {
                    let ready = ReadyForQuery::parse(&bufs.read_buffer)?;
                    self.transaction_status = ready.transaction_status().unwrap_or_default();
                    self.state = BatchState::Finished;
                    Ok(Action::Finished)
                }
                other => Err(Error::Protocol(format!(
                    "unexpected message in batch: '{}'",
                    other as char
                ))),
            },
            state => Err(Error::Protocol(format!("unexpected state {:?}", state))),
        }
    }

    fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }
}
