//! Query response state machine.
//!
//! Assembles backend messages into [`PgResult`]s for both the simple and
//! the extended query protocol. One query string may hold several SQL
//! commands; each produces its own result, in order, until ReadyForQuery.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::protocol::backend::{
    CommandComplete, DataRow, ErrorResponse, RawMessage, ReadyForQuery, RowDescription, msg_type,
};
use crate::protocol::types::TransactionStatus;
use crate::raw::result::{Field, PgResult, ResultStatus};

use super::action::{Action, AsyncMessage};

/// Query response state machine.
#[derive(Debug)]
pub struct QueryStateMachine {
    single_row: bool,
    fields: Option<Arc<[Field]>>,
    rows: Vec<Vec<Option<String>>>,
    ready: VecDeque<PgResult>,
    transaction_status: TransactionStatus,
    finished: bool,
}

impl QueryStateMachine {
    /// Create a state machine for one dispatched query.
    pub fn new(single_row: bool) -> Self {
        Self {
            single_row,
            fields: None,
            rows: Vec::new(),
            ready: VecDeque::new(),
            transaction_status: TransactionStatus::Idle,
            finished: false,
        }
    }

    /// Switch to single-row delivery. Only effective before the first row.
    pub fn set_single_row(&mut self) -> bool {
        if self.fields.is_some() || !self.ready.is_empty() {
            return false;
        }
        self.single_row = true;
        true
    }

    /// True once ReadyForQuery has been seen.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// True if a completed result is waiting.
    pub fn has_result(&self) -> bool {
        !self.ready.is_empty()
    }

    /// Pop the next completed result.
    pub fn pop_result(&mut self) -> Option<PgResult> {
        self.ready.pop_front()
    }

    /// Transaction status from the final ReadyForQuery.
    pub fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }

    /// Process a message from the server.
    pub fn step(&mut self, msg: &RawMessage<'_>) -> Result<Action> {
        if RawMessage::is_async_type(msg.type_byte) {
            return Ok(Action::HandleAsyncMessageAndReadMessage(AsyncMessage::parse(
                msg,
            )?));
        }

        match msg.type_byte {
            msg_type::PARSE_COMPLETE | msg_type::BIND_COMPLETE | msg_type::NO_DATA => {}
            msg_type::ROW_DESCRIPTION => {
                let desc = RowDescription::parse(msg.payload)?;
                let fields: Arc<[Field]> = desc
                    .iter()
                    .map(|f| Field {
                        name: f.name.to_string(),
                        type_oid: f.type_oid(),
                        table_oid: f.table_oid(),
                    })
                    .collect();
                self.fields = Some(fields);
                self.rows.clear();
            }
            msg_type::DATA_ROW => {
                let fields = self
                    .fields
                    .as_ref()
                    .ok_or_else(|| Error::Protocol("DataRow without RowDescription".into()))?;
                let row = DataRow::parse(msg.payload)?;
                if row.len() != fields.len() {
                    return Err(Error::Protocol(format!(
                        "DataRow has {} columns, RowDescription has {}",
                        row.len(),
                        fields.len()
                    )));
                }
                let values = row.to_text_values()?;
                if self.single_row {
                    let mut result = PgResult::new(ResultStatus::SingleTuple, Arc::clone(fields));
                    result.rows.push(values);
                    self.ready.push_back(result);
                } else {
                    self.rows.push(values);
                }
            }
            msg_type::COMMAND_COMPLETE | msg_type::PORTAL_SUSPENDED => {
                let tag = if msg.type_byte == msg_type::COMMAND_COMPLETE {
                    Some(CommandComplete::parse(msg.payload)?.tag.to_string())
                } else {
                    None
                };
                let mut result = match self.fields.take() {
                    Some(fields) => {
                        let mut result = PgResult::new(ResultStatus::TuplesOk, fields);
                        result.rows = std::mem::take(&mut self.rows);
                        result
                    }
                    None => PgResult::new(ResultStatus::CommandOk, Arc::from([])),
                };
                result.command_tag = tag;
                self.ready.push_back(result);
            }
            msg_type::EMPTY_QUERY_RESPONSE => {
                self.ready
                    .push_back(PgResult::new(ResultStatus::EmptyQuery, Arc::from([])));
            }
            msg_type::ERROR_RESPONSE => {
                let error = ErrorResponse::parse(msg.payload)?;
                // Rows of the failed command are discarded; the error replaces them.
                self.fields = None;
                self.rows.clear();
                self.ready.push_back(PgResult::fatal(error.fields));
            }
            msg_type::READY_FOR_QUERY => {
                let ready = ReadyForQuery::parse(msg.payload)?;
                self.transaction_status = ready.transaction_status().unwrap_or_default();
                self.finished = true;
                return Ok(Action::Finished);
            }
            b'G' | b'H' | b'W' => {
                return Err(Error::Unsupported("COPY is not supported".into()));
            }
            other => {
                return Err(Error::Protocol(format!(
                    "Unexpected message during query: '{}'",
                    other as char
                )));
            }
        }
        Ok(Action::ReadMessage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::codec::MessageBuilder;

    fn row_description(names: &[&str]) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut msg = MessageBuilder::new(&mut buf, msg_type::ROW_DESCRIPTION);
        msg.write_i16(names.len() as i16);
        for name in names {
            msg.write_cstr(name);
            msg.write_u32(0);
            msg.write_i16(0);
            msg.write_u32(23);
            msg.write_i16(4);
            msg.write_i32(-1);
            msg.write_i16(0);
        }
        msg.finish();
        buf
    }

    fn data_row(values: &[Option<&str>]) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut msg = MessageBuilder::new(&mut buf, msg_type::DATA_ROW);
        msg.write_i16(values.len() as i16);
        for value in values {
            match value {
                Some(v) => {
                    msg.write_i32(v.len() as i32);
                    msg.write_bytes(v.as_bytes());
                }
                None => msg.write_i32(-1),
            }
        }
        msg.finish();
        buf
    }

    fn feed(sm: &mut QueryStateMachine, bytes: &[u8]) -> Action {
        let (msg, used) = RawMessage::split_from(bytes).unwrap().unwrap();
        assert_eq!(used, bytes.len());
        sm.step(&msg).unwrap()
    }

    #[test]
    fn two_commands_two_results() {
        let mut sm = QueryStateMachine::new(false);
        feed(&mut sm, &row_description(&["n"]));
        feed(&mut sm, &data_row(&[Some("1")]));
        feed(&mut sm, &data_row(&[None]));
        feed(&mut sm, b"C\0\0\0\x0dSELECT 2\0");
        feed(&mut sm, b"C\0\0\0\x0fINSERT 0 1\0");
        assert!(matches!(feed(&mut sm, b"Z\0\0\0\x05I"), Action::Finished));

        let first = sm.pop_result().unwrap();
        assert_eq!(first.status(), ResultStatus::TuplesOk);
        assert_eq!(first.ntuples(), 2);
        assert_eq!(first.get_value(0, 0), Some("1"));
        assert!(first.get_is_null(1, 0));

        let second = sm.pop_result().unwrap();
        assert_eq!(second.status(), ResultStatus::CommandOk);
        assert_eq!(second.cmd_tuples(), Some(1));
        assert!(sm.pop_result().is_none());
    }

    #[test]
    fn single_row_mode_emits_each_row() {
        let mut sm = QueryStateMachine::new(false);
        assert!(sm.set_single_row());
        feed(&mut sm, &row_description(&["n"]));
        feed(&mut sm, &data_row(&[Some("1")]));
        feed(&mut sm, &data_row(&[Some("2")]));
        feed(&mut sm, b"C\0\0\0\x0dSELECT 2\0");

        let statuses: Vec<_> = std::iter::from_fn(|| sm.pop_result())
            .map(|r| (r.status(), r.ntuples()))
            .collect();
        assert_eq!(
            statuses,
            vec![
                (ResultStatus::SingleTuple, 1),
                (ResultStatus::SingleTuple, 1),
                (ResultStatus::TuplesOk, 0),
            ]
        );
    }

    #[test]
    fn error_discards_partial_rows() {
        let mut sm = QueryStateMachine::new(false);
        feed(&mut sm, &row_description(&["n"]));
        feed(&mut sm, &data_row(&[Some("1")]));
        let mut err = Vec::new();
        let mut msg = MessageBuilder::new(&mut err, msg_type::ERROR_RESPONSE);
        msg.write_bytes(b"SERROR\0C22012\0Mdivision by zero\0\0");
        msg.finish();
        feed(&mut sm, &err);

        let result = sm.pop_result().unwrap();
        assert_eq!(result.status(), ResultStatus::FatalError);
        assert_eq!(result.to_error().unwrap().sqlstate(), Some("22012"));
        assert!(sm.pop_result().is_none());
    }
}
