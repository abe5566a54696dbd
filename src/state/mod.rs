//! Sans-I/O state machines for the PostgreSQL protocol.
//!
//! The machines hold no sockets; each `step` consumes the message in
//! the buffer set and answers with an [`Action`] telling the driver
//! what I/O to perform next.

pub mod action;
pub mod extended;
pub mod simple_query;
pub mod startup;

pub use action::{Action, AsyncMessage};
pub use extended::{BatchFlow, ExtendedQueryFlow, PreparedStatement};
pub use simple_query::{CopyFrame, QueryOutcome, ResultSet, SimpleQueryFlow};
pub use startup::StartupFlow;

use crate::buffer_set::BufferSet;
use crate::error::{Error, Result};
use crate::protocol::backend::{NoticeResponse, NotificationResponse, ParameterStatus, msg_type};
use crate::protocol::types::TransactionStatus;

/// A protocol state machine drivable by a connection.
///
/// The driver loop:
/// 1. call `step()` to get the next action,
/// 2. perform the requested I/O,
/// 3. repeat until `Action::Finished` or an error.
pub trait StateMachine {
    /// Process input and return the next action to perform.
    fn step(&mut self, bufs: &mut BufferSet) -> Result<Action>;

    /// Transaction status from the final ReadyForQuery.
    fn transaction_status(&self) -> TransactionStatus;
}

/// Parse one of the three asynchronous backend messages.
pub(crate) fn parse_async_message(type_byte: u8, payload: &[u8]) -> Result<AsyncMessage> {
    match type_byte {
        msg_type::NOTICE_RESPONSE => {
            let notice = NoticeResponse::parse(payload)?;
            Ok(AsyncMessage::Notice(notice.fields))
        }
        msg_type::PARAMETER_STATUS => {
            let param = ParameterStatus::parse(payload)?;
            Ok(AsyncMessage::ParameterChanged {
                name: param.name.to_string(),
                value: param.value.to_string(),
            })
        }
        msg_type::NOTIFICATION_RESPONSE => {
            let notification = NotificationResponse::parse(payload)?;
            Ok(AsyncMessage::Notification {
                pid: notification.pid,
                channel: notification.channel.to_string(),
                payload: notification.payload.to_string(),
            })
        }
        other => Err(Error::Protocol(format!(
            "not an async message type: '{}'",
            other as char
        ))),
    }
}
