//! Simple query protocol state machine.
//!
//! One `Query` message may carry several statements; each produces its
//! own result set. A per-statement error marks the outstanding result
//! set failed but consumption continues until ReadyForQuery.

use std::sync::Arc;

use crate::buffer_set::BufferSet;
use crate::error::{Error, ErrorFields, Result};
use crate::protocol::backend::{
    CommandComplete, DataRow, EmptyQueryResponse, ErrorResponse, RawMessage, ReadyForQuery,
    WireRowDescription, msg_type,
};
use crate::protocol::frontend::{write_copy_fail, write_query};
use crate::protocol::types::TransactionStatus;
use crate::row::{Row, RowDescription};

use super::action::Action;
use super::{StateMachine, parse_async_message};

/// An opaque COPY sub-protocol frame surfaced to the caller.
#[derive(Debug, Clone)]
pub struct CopyFrame {
    /// Message type byte ('G', 'H', 'd' or 'c')
    pub type_byte: u8,
    /// Raw message payload
    pub payload: Vec<u8>,
}

/// The outcome of one statement within a query.
#[derive(Debug, Clone, Default)]
pub struct ResultSet {
    /// Rows delivered before completion or failure
    pub rows: Vec<Row>,
    /// Command tag from CommandComplete (absent on failure/empty query)
    pub command_tag: Option<String>,
    /// Error fields if this statement failed
    pub error: Option<ErrorFields>,
}

impl ResultSet {
    /// Rows affected, parsed from the command tag.
    pub fn rows_affected(&self) -> Option<u64> {
        let tag = self.command_tag.as_deref()?;
        CommandComplete { tag }.rows_affected()
    }
}

/// Everything one simple query produced.
#[derive(Debug, Clone, Default)]
pub struct QueryOutcome {
    /// Result sets in statement order
    pub results: Vec<ResultSet>,
    /// COPY frames, surfaced opaquely in arrival order
    pub copy_frames: Vec<CopyFrame>,
}

impl QueryOutcome {
    /// The first per-statement error, if any statement failed.
    pub fn first_error(&self) -> Option<&ErrorFields> {
        self.results.iter().find_map(|set| set.error.as_ref())
    }

    /// Rows affected by the last completed statement.
    pub fn rows_affected(&self) -> Option<u64> {
        self.results.iter().rev().find_map(ResultSet::rows_affected)
    }

    /// All rows across all result sets, in order.
    pub fn into_rows(self) -> Vec<Row> {
        self.results
            .into_iter()
            .flat_map(|set| set.rows)
            .collect()
    }

    /// Convert to a hard error if any statement failed.
    pub fn into_result(self) -> Result<QueryOutcome> {
        match self.first_error() {
            Some(fields) => Err(Error::from_server_fields(fields.clone())),
            None => Ok(self),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Initial,
    Receiving,
    Finished,
}

/// Simple query protocol state machine.
pub struct SimpleQueryFlow {
    state: State,
    sql: String,
    current: Option<(Arc<RowDescription>, Vec<Row>)>,
    outcome: QueryOutcome,
    transaction_status: TransactionStatus,
}

impl SimpleQueryFlow {
    /// Create a flow for one query string.
    pub fn new(sql: &str) -> Self {
        Self {
            state: State::Initial,
            sql: sql.to_string(),
            current: None,
            outcome: QueryOutcome::default(),
            transaction_status: TransactionStatus::Idle,
        }
    }

    /// Take the accumulated outcome after `Action::Finished`.
    pub fn take_outcome(&mut self) -> QueryOutcome {
        std::mem::take(&mut self.outcome)
    }

    fn handle_message(&mut self, bufs: &mut BufferSet) -> Result<Action> {
        let type_byte = bufs.type_byte;
        let payload = &bufs.read_buffer;

        match type_byte {
            msg_type::ROW_DESCRIPTION => {
                let wire = WireRowDescription::parse(payload)?;
                self.current = Some((Arc::new(RowDescription::from_wire(&wire)), Vec::new()));
                Ok(Action::ReadMessage)
            }
            msg_type::DATA_ROW => {
                let Some((description, rows)) = self.current.as_mut() else {
                    return Err(Error::Protocol("DataRow outside a result set".into()));
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
                self.outcome.results.push(ResultSet {
                    rows,
                    command_tag: Some(complete.tag.to_string()),
                    error: None,
                });
                Ok(Action::ReadMessage)
            }
            msg_type::EMPTY_QUERY_RESPONSE => {
                EmptyQueryResponse::parse(payload)?;
                self.outcome.results.push(ResultSet::default());
                Ok(Action::ReadMessage)
            }
            msg_type::ERROR_RESPONSE => {
                // The outstanding result set is flagged failed; the
                // stream keeps flowing until ReadyForQuery.
                let error = ErrorResponse::parse(payload)?;
                let rows = self.current.take().map(|(_, rows)| rows).unwrap_or_default();
                self.outcome.results.push(ResultSet {
                    rows,
                    command_tag: None,
                    error: Some(error.fields),
                });
                Ok(Action::ReadMessage)
            }
            msg_type::COPY_IN_RESPONSE => {
                // Payload semantics are passthrough; refuse the upload
                // so the server fails the statement and moves on.
                self.outcome.copy_frames.push(CopyFrame {
                    type_byte,
                    payload: payload.clone(),
                });
                bufs.write_buffer.clear();
                write_copy_fail(&mut bufs.write_buffer, "COPY FROM STDIN is not supported");
                Ok(Action::WriteAndReadMessage)
            }
            msg_type::COPY_OUT_RESPONSE | msg_type::COPY_DATA | msg_type::COPY_DONE => {
                self.outcome.copy_frames.push(CopyFrame {
                    type_byte,
                    payload: payload.clone(),
                });
                Ok(Action::ReadMessage)
            }
            msg_type::READY_FOR_QUERY => {
                let ready = ReadyForQuery::parse(payload)?;
                self.transaction_status = ready.transaction_status().unwrap_or_default();
                self.state = State::Finished;
                Ok(Action::Finished)
            }
            other => Err(Error::Protocol(format!(
                "unexpected message in query response: '{}'",
                other as char
            ))),
        }
    }
}

impl StateMachine for SimpleQueryFlow {
    fn step(&mut self, bufs: &mut BufferSet) -> Result<Action> {
        match self.state {
            State::Initial => {
                bufs.write_buffer.clear();
                write_query(&mut bufs.write_buffer, &self.sql);
                self.state = State::Receiving;
                Ok(Action::WriteAndReadMessage)
            }
            State::Receiving => {
                if RawMessage::is_async_type(bufs.type_byte) {
                    return Ok(Action::HandleAsync(parse_async_message(
                        bufs.type_byte,
                        &bufs.read_buffer,
                    )?));
                }
                self.handle_message(bufs)
            }
            State::Finished => Err(Error::Protocol("query flow already finished".into())),
        }
    }

    fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::oid;
    use crate::state::action::AsyncMessage;

    fn feed(bufs: &mut BufferSet, type_byte: u8, payload: &[u8]) {
        bufs.type_byte = type_byte;
        bufs.read_buffer.clear();
        bufs.read_buffer.extend_from_slice(payload);
    }

    fn row_description(columns: &[(&str, u32)]) -> Vec<u8> {
        let mut payload = (columns.len() as u16).to_be_bytes().to_vec();
        for (name, type_oid) in columns {
            payload.extend_from_slice(name.as_bytes());
            payload.push(0);
            payload.extend_from_slice(&0_u32.to_be_bytes());
            payload.extend_from_slice(&0_i16.to_be_bytes());
            payload.extend_from_slice(&type_oid.to_be_bytes());
            payload.extend_from_slice(&(-1_i16).to_be_bytes());
            payload.extend_from_slice(&(-1_i32).to_be_bytes());
            payload.extend_from_slice(&0_u16.to_be_bytes());
        }
        payload
    }

    fn data_row(fields: &[Option<&[u8]>]) -> Vec<u8> {
        let mut payload = (fields.len() as u16).to_be_bytes().to_vec();
        for field in fields {
            match field {
                Some(bytes) => {
                    payload.extend_from_slice(&(bytes.len() as i32).to_be_bytes());
                    payload.extend_from_slice(bytes);
                }
                None => payload.extend_from_slice(&(-1_i32).to_be_bytes()),
            }
        }
        payload
    }

    #[test]
    fn single_select() {
        let mut flow = SimpleQueryFlow::new("SELECT id FROM t");
        let mut bufs = BufferSet::new();

        assert!(matches!(
            flow.step(&mut bufs).unwrap(),
            Action::WriteAndReadMessage
        ));
        assert_eq!(bufs.write_buffer[0], b'Q');

        feed(&mut bufs, b'T', &row_description(&[("id", oid::INT4)]));
        assert!(matches!(flow.step(&mut bufs).unwrap(), Action::ReadMessage));

        feed(&mut bufs, b'D', &data_row(&[Some(b"7")]));
        assert!(matches!(flow.step(&mut bufs).unwrap(), Action::ReadMessage));
        feed(&mut bufs, b'D', &data_row(&[None]));
        assert!(matches!(flow.step(&mut bufs).unwrap(), Action::ReadMessage));

        feed(&mut bufs, b'C', b"SELECT 2\0");
        assert!(matches!(flow.step(&mut bufs).unwrap(), Action::ReadMessage));

        feed(&mut bufs, b'Z', b"T");
        assert!(matches!(flow.step(&mut bufs).unwrap(), Action::Finished));
        assert_eq!(flow.transaction_status(), TransactionStatus::InTransaction);

        let outcome = flow.take_outcome();
        assert_eq!(outcome.results.len(), 1);
        let set = &outcome.results[0];
        assert_eq!(set.command_tag.as_deref(), Some("SELECT 2"));
        assert_eq!(set.rows_affected(), Some(2));
        assert_eq!(set.rows.len(), 2);
        let id: i32 = set.rows[0].get_by_name("id").unwrap();
        assert_eq!(id, 7);
        let id: Option<i32> = set.rows[1].get(0).unwrap();
        assert_eq!(id, None);
    }

    #[test]
    fn multi_statement_produces_ordered_sets() {
        let mut flow = SimpleQueryFlow::new("SELECT 1; UPDATE t SET x = 0");
        let mut bufs = BufferSet::new();
        flow.step(&mut bufs).unwrap();

        feed(&mut bufs, b'T', &row_description(&[("?column?", oid::INT4)]));
        flow.step(&mut bufs).unwrap();
        feed(&mut bufs, b'D', &data_row(&[Some(b"1")]));
        flow.step(&mut bufs).unwrap();
        feed(&mut bufs, b'C', b"SELECT 1\0");
        flow.step(&mut bufs).unwrap();

        feed(&mut bufs, b'C', b"UPDATE 3\0");
        flow.step(&mut bufs).unwrap();

        feed(&mut bufs, b'Z', b"I");
        flow.step(&mut bufs).unwrap();

        let outcome = flow.take_outcome();
        assert_eq!(outcome.results.len(), 2);
        assert_eq!(outcome.results[0].command_tag.as_deref(), Some("SELECT 1"));
        assert_eq!(outcome.results[1].command_tag.as_deref(), Some("UPDATE 3"));
        assert_eq!(outcome.rows_affected(), Some(3));
    }

    #[test]
    fn error_flags_set_but_consumes_to_ready() {
        let mut flow = SimpleQueryFlow::new("SELECT 1; SELECT nope");
        let mut bufs = BufferSet::new();
        flow.step(&mut bufs).unwrap();

        feed(&mut bufs, b'T', &row_description(&[("?column?", oid::INT4)]));
        flow.step(&mut bufs).unwrap();
        feed(&mut bufs, b'D', &data_row(&[Some(b"1")]));
        flow.step(&mut bufs).unwrap();
        feed(&mut bufs, b'C', b"SELECT 1\0");
        flow.step(&mut bufs).unwrap();

        feed(&mut bufs, b'E', b"SERROR\0C42703\0Mno column\0\0");
        // The flow keeps reading rather than aborting.
        assert!(matches!(flow.step(&mut bufs).unwrap(), Action::ReadMessage));

        feed(&mut bufs, b'Z', b"I");
        assert!(matches!(flow.step(&mut bufs).unwrap(), Action::Finished));

        let outcome = flow.take_outcome();
        assert_eq!(outcome.results.len(), 2);
        assert!(outcome.results[0].error.is_none());
        assert_eq!(
            outcome.results[1].error.as_ref().map(|f| f.code()),
            Some("42703")
        );
        assert!(outcome.clone().into_result().is_err());
        assert_eq!(outcome.first_error().map(|f| f.code()), Some("42703"));
    }

    #[test]
    fn async_messages_tolerated_mid_result_set() {
        let mut flow = SimpleQueryFlow::new("SELECT 1");
        let mut bufs = BufferSet::new();
        flow.step(&mut bufs).unwrap();

        feed(&mut bufs, b'T', &row_description(&[("?column?", oid::INT4)]));
        flow.step(&mut bufs).unwrap();

        feed(&mut bufs, b'N', b"SWARNING\0C01000\0Mcareful\0\0");
        assert!(matches!(
            flow.step(&mut bufs).unwrap(),
            Action::HandleAsync(AsyncMessage::Notice(_))
        ));

        feed(&mut bufs, b'A', b"\x00\x00\x00\x07events\0ping\0");
        assert!(matches!(
            flow.step(&mut bufs).unwrap(),
            Action::HandleAsync(AsyncMessage::Notification { .. })
        ));

        feed(&mut bufs, b'D', &data_row(&[Some(b"1")]));
        flow.step(&mut bufs).unwrap();
        feed(&mut bufs, b'C', b"SELECT 1\0");
        flow.step(&mut bufs).unwrap();
        feed(&mut bufs, b'Z', b"I");
        flow.step(&mut bufs).unwrap();

        assert_eq!(flow.take_outcome().results[0].rows.len(), 1);
    }

    #[test]
    fn copy_out_frames_are_surfaced() {
        let mut flow = SimpleQueryFlow::new("COPY t TO STDOUT");
        let mut bufs = BufferSet::new();
        flow.step(&mut bufs).unwrap();

        let mut header = vec![0u8];
        header.extend_from_slice(&1_i16.to_be_bytes());
        header.extend_from_slice(&0_i16.to_be_bytes());
        feed(&mut bufs, b'H', &header);
        flow.step(&mut bufs).unwrap();

        feed(&mut bufs, b'd', b"1\tfoo\n");
        flow.step(&mut bufs).unwrap();
        feed(&mut bufs, b'c', b"");
        flow.step(&mut bufs).unwrap();
        feed(&mut bufs, b'C', b"COPY 1\0");
        flow.step(&mut bufs).unwrap();
        feed(&mut bufs, b'Z', b"I");
        flow.step(&mut bufs).unwrap();

        let outcome = flow.take_outcome();
        assert_eq!(outcome.copy_frames.len(), 3);
        assert_eq!(outcome.copy_frames[1].payload, b"1\tfoo\n");
        assert_eq!(outcome.results[0].command_tag.as_deref(), Some("COPY 1"));
    }

    #[test]
    fn copy_in_is_refused_with_copy_fail() {
        let mut flow = SimpleQueryFlow::new("COPY t FROM STDIN");
        let mut bufs = BufferSet::new();
        flow.step(&mut bufs).unwrap();

        let mut header = vec![0u8];
        header.extend_from_slice(&0_i16.to_be_bytes());
        feed(&mut bufs, b'G', &header);
        assert!(matches!(
            flow.step(&mut bufs).unwrap(),
            Action::WriteAndReadMessage
        ));
        assert_eq!(bufs.write_buffer[0], b'f');

        feed(&mut bufs, b'E', b"SERROR\0C57014\0Mcopy aborted\0\0");
        flow.step(&mut bufs).unwrap();
        feed(&mut bufs, b'Z', b"I");
        flow.step(&mut bufs).unwrap();

        let outcome = flow.take_outcome();
        assert!(outcome.clone().into_result().is_err());
        assert_eq!(outcome.copy_frames.len(), 1);
    }

    #[test]
    fn mismatched_row_width_is_protocol_violation() {
        let mut flow = SimpleQueryFlow::new("SELECT 1");
        let mut bufs = BufferSet::new();
        flow.step(&mut bufs).unwrap();

        feed(&mut bufs, b'T', &row_description(&[("a", oid::INT4)]));
        flow.step(&mut bufs).unwrap();
        feed(&mut bufs, b'D', &data_row(&[Some(b"1"), Some(b"2")]));
        assert!(matches!(
            flow.step(&mut bufs).unwrap_err(),
            Error::Protocol(_)
        ));
    }
}
