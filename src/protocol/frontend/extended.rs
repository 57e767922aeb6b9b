//! Extended query protocol messages.
//!
//! Only the unnamed statement and unnamed portal are used. Parameters are
//! always sent in text format so that they go through the same literal
//! rendering as inline values.

use crate::error::{Error, Result};
use crate::protocol::codec::MessageBuilder;
use crate::protocol::types::{FormatCode, Oid};

fn param_count(len: usize) -> Result<i16> {
    i16::try_from(len)
        .map_err(|_| Error::Encode(format!("{len} parameters exceed the protocol limit of {}", i16::MAX)))
}

/// Write a Parse message.
///
/// - `name`: Statement name (empty string for unnamed statement)
/// - `query`: SQL query with $1, $2, ... placeholders
/// - `param_oids`: Parameter type OIDs (0 = let server infer)
pub fn write_parse(buf: &mut Vec<u8>, name: &str, query: &str, param_oids: &[Oid]) -> Result<()> {
    let count = param_count(param_oids.len())?;
    let mut msg = MessageBuilder::new(buf, super::msg_type::PARSE);
    msg.write_cstr(name);
    msg.write_cstr(query);
    msg.write_i16(count);
    for &oid in param_oids {
        msg.write_u32(oid);
    }
    msg.finish();
    Ok(())
}

/// Write a Bind message with text-format parameters.
///
/// `None` binds SQL NULL. Results are requested in text format. Fails
/// without writing anything if a count or length does not fit the message.
pub fn write_bind(
    buf: &mut Vec<u8>,
    portal: &str,
    statement: &str,
    params: &[Option<String>],
) -> Result<()> {
    let count = param_count(params.len())?;
    let lengths = params
        .iter()
        .map(|param| match param {
            Some(text) => i32::try_from(text.len()).map_err(|_| {
                Error::Encode(format!("parameter of {} bytes is too large", text.len()))
            }),
            None => Ok(-1),
        })
        .collect::<Result<Vec<i32>>>()?;

    let mut msg = MessageBuilder::new(buf, super::msg_type::BIND);
    msg.write_cstr(portal);
    msg.write_cstr(statement);

    // A single format code applies to every parameter.
    msg.write_i16(1);
    msg.write_i16(FormatCode::Text as i16);

    msg.write_i16(count);
    for (param, len) in params.iter().zip(lengths) {
        msg.write_i32(len);
        if let Some(text) = param {
            msg.write_bytes(text.as_bytes());
        }
    }

    msg.write_i16(1);
    msg.write_i16(FormatCode::Text as i16);
    msg.finish();
    Ok(())
}

/// Write a Describe message for a portal.
pub fn write_describe_portal(buf: &mut Vec<u8>, name: &str) {
    let mut msg = MessageBuilder::new(buf, super::msg_type::DESCRIBE);
    msg.write_u8(b'P');
    msg.write_cstr(name);
    msg.finish();
}

/// Write an Execute message to run a portal.
///
/// - `max_rows`: Maximum number of rows to return (0 = unlimited)
pub fn write_execute(buf: &mut Vec<u8>, portal: &str, max_rows: u32) {
    let mut msg = MessageBuilder::new(buf, super::msg_type::EXECUTE);
    msg.write_cstr(portal);
    msg.write_u32(max_rows);
    msg.finish();
}

/// Write a Sync message.
pub fn write_sync(buf: &mut Vec<u8>) {
    let msg = MessageBuilder::new(buf, super::msg_type::SYNC);
    msg.finish();
}
