//! Text literal encoder.
//!
//! Values are rendered in PostgreSQL's input syntax. Composite values
//! (arrays, rows, ranges and JSON) nest: an array element that is itself an
//! array or a row is written as a quoted string, so every `"` or `\` inside
//! it must be escaped once more per level. A character written at depth `d`
//! is preceded by `2^d - 1` backslashes, which is what repeated escaping
//! produces and what the server undoes level by level.

use std::borrow::Cow;
use std::fmt::Write as _;
use std::ops::Bound;

use chrono::SecondsFormat;

use crate::error::{Error, Result};

use super::{Interval, Range, Value};

/// Deepest nesting the encoder accepts. Each level doubles the escapes.
const MAX_DEPTH: u32 = 16;

/// The context a value is written into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parent {
    /// A standalone literal.
    Top,
    /// An element of an array literal.
    Array,
    /// A field of a row literal.
    Row,
    /// A bound of a range literal.
    Range,
    /// A member of a JSON document.
    Json,
}

/// Append the literal text of `value` to `out`.
///
/// `depth` is the escaping depth of the enclosing literal's structural
/// characters. Top-level callers pass 0; the result is the unescaped
/// literal text, ready to be quoted as a SQL string.
pub fn encode(value: &Value, parent: Parent, depth: u32, out: &mut String) -> Result<()> {
    match parent {
        Parent::Top => write_literal(value, depth, out),
        Parent::Json => write_json(value, depth, out),
        Parent::Array | Parent::Row | Parent::Range => write_element(value, parent, depth, out),
    }
}

/// Render a standalone literal.
pub fn encode_to_string(value: &Value) -> Result<String> {
    let mut out = String::new();
    encode(value, Parent::Top, 0, &mut out)?;
    Ok(out)
}

fn push_char(out: &mut String, c: char, depth: u32) {
    if c == '"' || c == '\\' {
        let escapes = (1_usize << depth) - 1;
        out.extend(std::iter::repeat_n('\\', escapes));
    }
    out.push(c);
}

fn push_text(out: &mut String, text: &str, depth: u32) {
    if depth == 0 {
        out.push_str(text);
        return;
    }
    for c in text.chars() {
        push_char(out, c, depth);
    }
}

fn write_literal(value: &Value, depth: u32, out: &mut String) -> Result<()> {
    match value {
        Value::Null => out.push_str("NULL"),
        Value::Range(range) => write_range(range, depth, out)?,
        Value::Array(items) => {
            out.push('{');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_element(item, Parent::Array, depth, out)?;
            }
            out.push('}');
        }
        Value::Row(fields) => {
            out.push('(');
            for (i, field) in fields.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_element(field, Parent::Row, depth, out)?;
            }
            out.push(')');
        }
        Value::Json(_) | Value::Object(_) => write_json(value, depth, out)?,
        scalar => push_text(out, &scalar_text(scalar), depth),
    }
    Ok(())
}

fn write_element(value: &Value, parent: Parent, depth: u32, out: &mut String) -> Result<()> {
    if depth >= MAX_DEPTH {
        return Err(Error::Encode(format!(
            "values nested deeper than {MAX_DEPTH} levels"
        )));
    }
    match value {
        Value::Null => {
            // Rows and ranges spell NULL as an empty field.
            if parent == Parent::Array {
                out.push_str("NULL");
            }
        }
        composite if !composite.is_scalar() => {
            if parent == Parent::Range {
                return Err(Error::Encode("range bounds must be scalar values".into()));
            }
            push_char(out, '"', depth);
            write_literal(composite, depth + 1, out)?;
            push_char(out, '"', depth);
        }
        scalar => {
            let text = scalar_text(scalar);
            if needs_quotes(&text, parent) {
                push_char(out, '"', depth);
                push_text(out, &text, depth + 1);
                push_char(out, '"', depth);
            } else {
                out.push_str(&text);
            }
        }
    }
    Ok(())
}

fn write_range(range: &Range, depth: u32, out: &mut String) -> Result<()> {
    let (lower, upper) = match range {
        Range::Empty => {
            out.push_str("empty");
            return Ok(());
        }
        Range::Bounded(lower, upper) => (lower, upper),
    };

    match lower {
        Bound::Included(v) if !v.is_null() => out.push('['),
        _ => out.push('('),
    }
    if let Bound::Included(v) | Bound::Excluded(v) = lower {
        write_element(v, Parent::Range, depth, out)?;
    }
    out.push(',');
    if let Bound::Included(v) | Bound::Excluded(v) = upper {
        write_element(v, Parent::Range, depth, out)?;
    }
    match upper {
        Bound::Included(v) if !v.is_null() => out.push(']'),
        _ => out.push(')'),
    }
    Ok(())
}

fn write_json(value: &Value, depth: u32, out: &mut String) -> Result<()> {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Int(n) => {
            let _ = write!(out, "{n}");
        }
        Value::Float(f) => {
            if !f.is_finite() {
                return Err(Error::Encode(format!("{f} cannot be represented in JSON")));
            }
            out.push_str(&float_text(*f));
        }
        Value::Numeric(n) => push_text(out, n, depth),
        Value::Text(s) => write_json_string(s, depth, out),
        Value::Bytes(_) => {
            return Err(Error::Encode("binary data cannot be represented in JSON".into()));
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_json(item, depth, out)?;
            }
            out.push(']');
        }
        Value::Object(pairs) => {
            out.push('{');
            for (i, (key, item)) in pairs.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_json_string(key, depth, out);
                out.push(':');
                write_json(item, depth, out)?;
            }
            out.push('}');
        }
        Value::Json(json) => write_serde_json(json, depth, out),
        // Rows and ranges have no JSON form; they travel as their literal text.
        Value::Row(_) | Value::Range(_) => {
            let mut literal = String::new();
            write_literal(value, 0, &mut literal)?;
            write_json_string(&literal, depth, out);
        }
        scalar => write_json_string(&scalar_text(scalar), depth, out),
    }
    Ok(())
}

fn write_serde_json(json: &serde_json::Value, depth: u32, out: &mut String) {
    match json {
        serde_json::Value::Null => out.push_str("null"),
        serde_json::Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        serde_json::Value::Number(n) => out.push_str(&n.to_string()),
        serde_json::Value::String(s) => write_json_string(s, depth, out),
        serde_json::Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_serde_json(item, depth, out);
            }
            out.push(']');
        }
        serde_json::Value::Object(map) => {
            out.push('{');
            for (i, (key, item)) in map.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_json_string(key, depth, out);
                out.push(':');
                write_serde_json(item, depth, out);
            }
            out.push('}');
        }
    }
}

/// JSON string syntax is structural at `depth`; its content is one level deeper.
fn write_json_string(s: &str, depth: u32, out: &mut String) {
    push_char(out, '"', depth);
    for c in s.chars() {
        match c {
            '"' | '\\' => push_char(out, c, depth + 1),
            '\n' => {
                push_char(out, '\\', depth);
                out.push('n');
            }
            '\r' => {
                push_char(out, '\\', depth);
                out.push('r');
            }
            '\t' => {
                push_char(out, '\\', depth);
                out.push('t');
            }
            c if c.is_control() && (c as u32) < 0x20 => {
                push_char(out, '\\', depth);
                let _ = write!(out, "u{:04x}", c as u32);
            }
            c => out.push(c),
        }
    }
    push_char(out, '"', depth);
}

/// Unescaped text of a scalar value.
fn scalar_text(value: &Value) -> Cow<'_, str> {
    match value {
        Value::Null => Cow::Borrowed("NULL"),
        Value::Bool(true) => Cow::Borrowed("true"),
        Value::Bool(false) => Cow::Borrowed("false"),
        Value::Int(n) => Cow::Owned(n.to_string()),
        Value::Float(f) => Cow::Owned(float_text(*f)),
        Value::Numeric(s) | Value::Text(s) => Cow::Borrowed(s),
        Value::Bytes(bytes) => {
            let mut hex = String::with_capacity(2 + bytes.len() * 2);
            hex.push_str("\\x");
            for b in bytes {
                let _ = write!(hex, "{b:02x}");
            }
            Cow::Owned(hex)
        }
        Value::Timestamp(ts) => Cow::Owned(ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
        Value::LocalTimestamp(ts) => Cow::Owned(ts.format("%Y-%m-%dT%H:%M:%S%.f").to_string()),
        Value::Date(date) => Cow::Owned(date.format("%Y-%m-%d").to_string()),
        Value::Interval(interval) => Cow::Owned(interval_iso(interval)),
        Value::Range(_) | Value::Array(_) | Value::Row(_) | Value::Json(_) | Value::Object(_) => {
            Cow::Borrowed("")
        }
    }
}

pub(crate) fn float_text(f: f64) -> String {
    if f.is_nan() {
        "NaN".into()
    } else if f.is_infinite() {
        if f > 0.0 { "Infinity" } else { "-Infinity" }.into()
    } else {
        // Debug output is the shortest form that round-trips, with an
        // exponent for very large or small magnitudes.
        format!("{f:?}")
    }
}

/// ISO 8601 duration, e.g. `P1Y2M3DT4H5M6.5S`.
pub(crate) fn interval_iso(interval: &Interval) -> String {
    let mut out = String::from("P");
    let years = interval.months / 12;
    let months = interval.months % 12;
    if years != 0 {
        let _ = write!(out, "{years}Y");
    }
    if months != 0 {
        let _ = write!(out, "{months}M");
    }
    if interval.days != 0 {
        let _ = write!(out, "{}D", interval.days);
    }

    let micros = interval.microseconds;
    if micros != 0 {
        out.push('T');
        let sign = if micros < 0 { "-" } else { "" };
        let abs = micros.unsigned_abs();
        let hours = abs / 3_600_000_000;
        let minutes = abs / 60_000_000 % 60;
        let seconds = abs / 1_000_000 % 60;
        let fraction = abs % 1_000_000;
        if hours != 0 {
            let _ = write!(out, "{sign}{hours}H");
        }
        if minutes != 0 {
            let _ = write!(out, "{sign}{minutes}M");
        }
        if seconds != 0 || fraction != 0 {
            let _ = write!(out, "{sign}{seconds}");
            if fraction != 0 {
                let digits = format!("{fraction:06}");
                let _ = write!(out, ".{}", digits.trim_end_matches('0'));
            }
            out.push('S');
        }
    }

    if out.len() == 1 {
        out.push_str("T0S");
    }
    out
}

fn is_array_space(c: char) -> bool {
    matches!(c, ' ' | '\t' | '\n' | '\r' | '\x0B' | '\x0C')
}

fn needs_quotes(text: &str, parent: Parent) -> bool {
    if text.is_empty() {
        return true;
    }
    match parent {
        Parent::Array => {
            text.eq_ignore_ascii_case("NULL")
                || text
                    .chars()
                    .any(|c| matches!(c, '{' | '}' | '"' | ',' | '\\') || is_array_space(c))
        }
        Parent::Row => text
            .chars()
            .any(|c| matches!(c, '(' | ')' | '"' | ',' | '\\') || is_array_space(c)),
        Parent::Range => text.chars().any(|c| {
            matches!(c, '"' | '\\' | '(' | ')' | '[' | ']' | ',') || is_array_space(c)
        }),
        Parent::Top | Parent::Json => false,
    }
}
