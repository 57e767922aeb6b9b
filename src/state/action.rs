//! Action types for state machine I/O requests.

use crate::error::{Error, ErrorFields, Result};
use crate::protocol::backend::{
    NoticeResponse, NotificationResponse, ParameterStatus, RawMessage, msg_type,
};

/// Action requested by a state machine.
///
/// The caller should perform the requested I/O and then feed the next
/// message to the state machine's `step()` method.
#[derive(Debug)]
pub enum Action {
    /// Send the bytes the state machine appended to the write buffer,
    /// then read the next message.
    Write,

    /// Read the next message from the server.
    ReadMessage,

    /// An asynchronous message was received.
    ///
    /// The caller should handle the message, read the next message,
    /// then call `step()` again.
    HandleAsyncMessageAndReadMessage(AsyncMessage),

    /// The state machine has finished successfully.
    Finished,
}

/// A LISTEN/NOTIFY notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// PID of the notifying backend process
    pub pid: u32,
    /// Channel name
    pub channel: String,
    /// Notification payload
    pub payload: String,
}

/// Asynchronous message from the server.
///
/// These can arrive at any time, including in the middle of a result.
#[derive(Debug, Clone)]
pub enum AsyncMessage {
    /// Notification from LISTEN/NOTIFY.
    Notification(Notification),

    /// Non-fatal notice/warning from server.
    Notice(ErrorFields),

    /// Server parameter value changed.
    ParameterChanged {
        /// Parameter name
        name: String,
        /// New value
        value: String,
    },
}

impl AsyncMessage {
    /// Parse an asynchronous message. The caller checks
    /// [`RawMessage::is_async_type`] first.
    pub fn parse(msg: &RawMessage<'_>) -> Result<Self> {
        match msg.type_byte {
            msg_type::NOTICE_RESPONSE => {
                let notice = NoticeResponse::parse(msg.payload)?;
                Ok(AsyncMessage::Notice(notice.fields))
            }
            msg_type::PARAMETER_STATUS => {
                let param = ParameterStatus::parse(msg.payload)?;
                Ok(AsyncMessage::ParameterChanged {
                    name: param.name.to_string(),
                    value: param.value.to_string(),
                })
            }
            msg_type::NOTIFICATION_RESPONSE => {
                let notification = NotificationResponse::parse(msg.payload)?;
                Ok(AsyncMessage::Notification(Notification {
                    pid: notification.pid,
                    channel: notification.channel.to_string(),
                    payload: notification.payload.to_string(),
                }))
            }
            other => Err(Error::Protocol(format!(
                "Unknown async message type: '{}'",
                other as char
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_notification() {
        let mut payload = 99_u32.to_be_bytes().to_vec();
        payload.extend_from_slice(b"jobs\0ready\0");
        let msg = RawMessage::new(msg_type::NOTIFICATION_RESPONSE, &payload);
        match AsyncMessage::parse(&msg).unwrap() {
            AsyncMessage::Notification(n) => {
                assert_eq!(n.pid, 99);
                assert_eq!(n.channel, "jobs");
                assert_eq!(n.payload, "ready");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn rejects_non_async_type() {
        let msg = RawMessage::new(msg_type::DATA_ROW, b"");
        assert!(AsyncMessage::parse(&msg).is_err());
    }
}
