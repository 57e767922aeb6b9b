//! Decoding of text-format column values.

use std::ops::Bound;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

use crate::error::{Error, Result};
use crate::protocol::types::{Oid, oid};

use super::{Interval, Range, Value};

/// Trait for decoding text-format PostgreSQL values into Rust types.
pub trait FromValue: Sized {
    /// Decode from NULL value.
    ///
    /// Default implementation returns an error. Override for types that can
    /// represent NULL (like `Option<T>`).
    fn from_null() -> Result<Self> {
        Err(Error::Decode("unexpected NULL value".into()))
    }

    /// Decode from the text representation of a value of type `oid`.
    fn from_text(oid: Oid, text: &str) -> Result<Self>;

    /// Decode an optional column value.
    fn decode(oid: Oid, text: Option<&str>) -> Result<Self> {
        match text {
            Some(text) => Self::from_text(oid, text),
            None => Self::from_null(),
        }
    }
}

fn invalid(what: &str, text: &str) -> Error {
    Error::Decode(format!("invalid {what}: {text:?}"))
}

impl FromValue for bool {
    fn from_text(oid: Oid, text: &str) -> Result<Self> {
        if oid != oid::BOOL && oid != oid::UNKNOWN {
            return Err(Error::Decode(format!("cannot decode oid {oid} as bool")));
        }
        match text {
            "t" | "true" | "TRUE" | "T" | "1" => Ok(true),
            "f" | "false" | "FALSE" | "F" | "0" => Ok(false),
            _ => Err(invalid("boolean", text)),
        }
    }
}

macro_rules! impl_from_value_parse {
    ($($ty:ty => $what:literal),* $(,)?) => {
        $(
            impl FromValue for $ty {
                fn from_text(_oid: Oid, text: &str) -> Result<Self> {
                    text.parse().map_err(|_| invalid($what, text))
                }
            }
        )*
    };
}

impl_from_value_parse!(
    i16 => "i16",
    i32 => "i32",
    i64 => "i64",
    u32 => "u32",
);

impl FromValue for f64 {
    fn from_text(_oid: Oid, text: &str) -> Result<Self> {
        match text {
            "NaN" => Ok(f64::NAN),
            "Infinity" => Ok(f64::INFINITY),
            "-Infinity" => Ok(f64::NEG_INFINITY),
            _ => text.parse().map_err(|_| invalid("float", text)),
        }
    }
}

impl FromValue for f32 {
    fn from_text(oid: Oid, text: &str) -> Result<Self> {
        f64::from_text(oid, text).map(|f| f as f32)
    }
}

impl FromValue for String {
    fn from_text(_oid: Oid, text: &str) -> Result<Self> {
        Ok(text.to_string())
    }
}

impl FromValue for Vec<u8> {
    fn from_text(oid: Oid, text: &str) -> Result<Self> {
        if oid != oid::BYTEA && oid != oid::UNKNOWN {
            return Err(Error::Decode(format!("cannot decode oid {oid} as Vec<u8>")));
        }
        decode_bytea(text)
    }
}

impl FromValue for NaiveDate {
    fn from_text(_oid: Oid, text: &str) -> Result<Self> {
        NaiveDate::parse_from_str(text, "%Y-%m-%d").map_err(|_| invalid("date", text))
    }
}

impl FromValue for NaiveDateTime {
    fn from_text(_oid: Oid, text: &str) -> Result<Self> {
        let normalized = text.replacen('T', " ", 1);
        NaiveDateTime::parse_from_str(&normalized, "%Y-%m-%d %H:%M:%S%.f")
            .map_err(|_| invalid("timestamp", text))
    }
}

impl FromValue for DateTime<Utc> {
    fn from_text(_oid: Oid, text: &str) -> Result<Self> {
        if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
            return Ok(ts.with_timezone(&Utc));
        }
        DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f%#z")
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(|_| invalid("timestamptz", text))
    }
}

impl FromValue for Interval {
    fn from_text(_oid: Oid, text: &str) -> Result<Self> {
        parse_interval(text)
    }
}

impl FromValue for serde_json::Value {
    fn from_text(_oid: Oid, text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::Decode(format!("invalid JSON: {e}")))
    }
}

impl FromValue for Value {
    fn from_null() -> Result<Self> {
        Ok(Value::Null)
    }

    fn from_text(oid: Oid, text: &str) -> Result<Self> {
        decode_value(oid, text)
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_null() -> Result<Self> {
        Ok(None)
    }

    fn from_text(oid: Oid, text: &str) -> Result<Self> {
        T::from_text(oid, text).map(Some)
    }
}

fn decode_array<T: FromValue>(oid: Oid, text: &str) -> Result<Vec<T>> {
    let element = oid::array_element(oid).unwrap_or(oid::UNKNOWN);
    parse_array(text)?
        .iter()
        .map(|item| T::decode(element, item.as_deref()))
        .collect()
}

macro_rules! impl_from_value_array {
    ($($ty:ty),*) => {
        $(
            impl FromValue for Vec<$ty> {
                fn from_text(oid: Oid, text: &str) -> Result<Self> {
                    decode_array(oid, text)
                }
            }
        )*
    };
}

impl_from_value_array!(bool, i16, i32, i64, f32, f64, String, NaiveDate, Value);

impl<T: FromValue> FromValue for Vec<Option<T>> {
    fn from_text(oid: Oid, text: &str) -> Result<Self> {
        decode_array(oid, text)
    }
}

impl<T> FromValue for Vec<Vec<T>>
where
    Vec<T>: FromValue,
{
    fn from_text(oid: Oid, text: &str) -> Result<Self> {
        // Sub-arrays keep the array type so their elements decode correctly.
        parse_array(text)?
            .iter()
            .map(|item| Vec::<T>::decode(oid, item.as_deref()))
            .collect()
    }
}

#[cfg(feature = "with-uuid")]
impl FromValue for uuid::Uuid {
    fn from_text(_oid: Oid, text: &str) -> Result<Self> {
        uuid::Uuid::parse_str(text).map_err(|_| invalid("uuid", text))
    }
}

#[cfg(feature = "with-rust-decimal")]
impl FromValue for rust_decimal::Decimal {
    fn from_text(_oid: Oid, text: &str) -> Result<Self> {
        text.parse().map_err(|_| invalid("numeric", text))
    }
}

/// Decode a column into a [`Value`] according to its type OID.
///
/// Types without a dedicated variant decode as [`Value::Text`].
pub fn decode_value(type_oid: Oid, text: &str) -> Result<Value> {
    if let Some(element) = oid::array_element(type_oid) {
        return parse_array(text)?
            .iter()
            .map(|item| match item {
                Some(item) => decode_value(element, item),
                None => Ok(Value::Null),
            })
            .collect::<Result<Vec<_>>>()
            .map(Value::Array);
    }
    if let Some(subtype) = oid::range_subtype(type_oid) {
        return parse_range(subtype, text).map(Value::from);
    }

    Ok(match type_oid {
        oid::BOOL => Value::Bool(bool::from_text(type_oid, text)?),
        oid::INT2 | oid::INT4 | oid::INT8 | oid::OID => Value::Int(i64::from_text(type_oid, text)?),
        oid::FLOAT4 | oid::FLOAT8 => Value::Float(f64::from_text(type_oid, text)?),
        oid::NUMERIC => Value::Numeric(text.to_string()),
        oid::BYTEA => Value::Bytes(decode_bytea(text)?),
        oid::TIMESTAMPTZ => Value::Timestamp(DateTime::<Utc>::from_text(type_oid, text)?),
        oid::TIMESTAMP => Value::LocalTimestamp(NaiveDateTime::from_text(type_oid, text)?),
        oid::DATE => Value::Date(NaiveDate::from_text(type_oid, text)?),
        oid::INTERVAL => Value::Interval(parse_interval(text)?),
        oid::JSON | oid::JSONB => Value::Json(serde_json::Value::from_text(type_oid, text)?),
        oid::RECORD => Value::Row(
            parse_row(text)?
                .into_iter()
                .map(|field| field.map_or(Value::Null, Value::Text))
                .collect(),
        ),
        _ => Value::Text(text.to_string()),
    })
}

fn decode_bytea(text: &str) -> Result<Vec<u8>> {
    let Some(hex) = text.strip_prefix("\\x") else {
        return Ok(text.as_bytes().to_vec());
    };
    if hex.len() % 2 != 0 {
        return Err(invalid("bytea", text));
    }
    hex.as_bytes()
        .chunks(2)
        .map(|pair| {
            std::str::from_utf8(pair)
                .ok()
                .and_then(|digits| u8::from_str_radix(digits, 16).ok())
                .ok_or_else(|| invalid("bytea", text))
        })
        .collect()
}

fn is_array_space(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\n' | b'\r' | 0x0B | 0x0C)
}

fn skip_space(bytes: &[u8], mut pos: usize) -> usize {
    while pos < bytes.len() && is_array_space(bytes[pos]) {
        pos += 1;
    }
    pos
}

fn utf8(bytes: Vec<u8>) -> Result<String> {
    String::from_utf8(bytes).map_err(|e| Error::Decode(format!("invalid UTF-8: {e}")))
}

/// Split a one-dimensional array literal into its elements.
///
/// Sub-arrays of a multi-dimensional array come back as their literal text,
/// so they can be parsed again. A dimension prefix like `[0:1]=` is skipped.
pub fn parse_array(text: &str) -> Result<Vec<Option<String>>> {
    let body = match text.strip_prefix('[') {
        Some(_) => text
            .split_once('=')
            .map(|(_, rest)| rest)
            .ok_or_else(|| invalid("array", text))?,
        None => text,
    };
    let bytes = body.trim().as_bytes();
    if bytes.first() != Some(&b'{') || bytes.last() != Some(&b'}') {
        return Err(invalid("array", text));
    }

    let end = bytes.len() - 1;
    let mut items = Vec::new();
    let mut pos = skip_space(bytes, 1);
    if pos == end {
        return Ok(items);
    }

    loop {
        pos = skip_space(bytes, pos);
        let mut item = Vec::new();
        let mut quoted = false;

        match bytes.get(pos) {
            Some(b'"') => {
                quoted = true;
                pos += 1;
                loop {
                    match bytes.get(pos) {
                        Some(b'\\') => {
                            item.push(*bytes.get(pos + 1).ok_or_else(|| invalid("array", text))?);
                            pos += 2;
                        }
                        Some(b'"') => {
                            pos += 1;
                            break;
                        }
                        Some(b) => {
                            item.push(*b);
                            pos += 1;
                        }
                        None => return Err(invalid("array", text)),
                    }
                }
            }
            Some(b'{') => {
                let start = pos;
                let mut level = 0_usize;
                let mut in_quotes = false;
                while pos < end {
                    match bytes[pos] {
                        b'\\' if in_quotes => pos += 1,
                        b'"' => in_quotes = !in_quotes,
                        b'{' if !in_quotes => level += 1,
                        b'}' if !in_quotes => {
                            level -= 1;
                            if level == 0 {
                                pos += 1;
                                break;
                            }
                        }
                        _ => {}
                    }
                    pos += 1;
                }
                if level != 0 {
                    return Err(invalid("array", text));
                }
                item.extend_from_slice(&bytes[start..pos]);
                quoted = true;
            }
            _ => {
                while pos < end && bytes[pos] != b',' {
                    if bytes[pos] == b'\\' {
                        pos += 1;
                        quoted = true;
                    }
                    if let Some(b) = bytes.get(pos).filter(|_| pos < end) {
                        item.push(*b);
                    }
                    pos += 1;
                }
                while item.last().is_some_and(|b| is_array_space(*b)) {
                    item.pop();
                }
            }
        }

        let item = utf8(item)?;
        if !quoted && item.eq_ignore_ascii_case("NULL") {
            items.push(None);
        } else {
            items.push(Some(item));
        }

        pos = skip_space(bytes, pos);
        match bytes.get(pos) {
            Some(b',') if pos < end => pos += 1,
            _ if pos == end => return Ok(items),
            _ => return Err(invalid("array", text)),
        }
    }
}

/// Read one field of a row or range literal, stopping at any of `stops`
/// outside quotes. Returns `None` for an empty unquoted field.
fn read_field(bytes: &[u8], pos: &mut usize, stops: &[u8]) -> Result<Option<String>> {
    let mut item = Vec::new();
    let mut quoted = false;
    let mut in_quotes = false;
    while let Some(&b) = bytes.get(*pos) {
        if !in_quotes && stops.contains(&b) {
            break;
        }
        match b {
            b'\\' => {
                *pos += 1;
                if let Some(&next) = bytes.get(*pos) {
                    item.push(next);
                }
            }
            b'"' if in_quotes && bytes.get(*pos + 1) == Some(&b'"') => {
                item.push(b'"');
                *pos += 1;
            }
            b'"' => {
                in_quotes = !in_quotes;
                quoted = true;
            }
            _ => item.push(b),
        }
        *pos += 1;
    }
    if in_quotes {
        return Err(Error::Decode("unterminated quoted field".into()));
    }
    if item.is_empty() && !quoted {
        return Ok(None);
    }
    utf8(item).map(Some)
}

/// Split a row literal like `(1,,"a b")` into its fields. Empty fields are NULL.
pub fn parse_row(text: &str) -> Result<Vec<Option<String>>> {
    let bytes = text.trim().as_bytes();
    if bytes.first() != Some(&b'(') || bytes.last() != Some(&b')') {
        return Err(invalid("row", text));
    }
    let inner = &bytes[1..bytes.len() - 1];
    let mut fields = Vec::new();
    let mut pos = 0;
    loop {
        fields.push(read_field(inner, &mut pos, b",")?);
        if pos >= inner.len() {
            return Ok(fields);
        }
        pos += 1;
    }
}

fn parse_range(subtype: Oid, text: &str) -> Result<Range> {
    let text = text.trim();
    if text.eq_ignore_ascii_case("empty") {
        return Ok(Range::Empty);
    }
    let bytes = text.as_bytes();
    let (Some(&open), Some(&close)) = (bytes.first(), bytes.last()) else {
        return Err(invalid("range", text));
    };
    if !matches!(open, b'[' | b'(') || !matches!(close, b']' | b')') || bytes.len() < 3 {
        return Err(invalid("range", text));
    }

    let inner = &bytes[1..bytes.len() - 1];
    let mut pos = 0;
    let lower = read_field(inner, &mut pos, b",")?;
    if inner.get(pos) != Some(&b',') {
        return Err(invalid("range", text));
    }
    pos += 1;
    let upper = read_field(inner, &mut pos, b",")?;

    let bound = |text: Option<String>, inclusive: bool| -> Result<Bound<Value>> {
        Ok(match text {
            None => Bound::Unbounded,
            Some(text) => {
                let value = decode_value(subtype, &text)?;
                if inclusive {
                    Bound::Included(value)
                } else {
                    Bound::Excluded(value)
                }
            }
        })
    };
    Ok(Range::Bounded(
        bound(lower, open == b'[')?,
        bound(upper, close == b']')?,
    ))
}

/// Parse an interval in the server's `postgres` output style
/// (`1 year 2 mons 3 days 04:05:06.5`) or ISO 8601 (`P1Y2M3DT4H5M6.5S`).
///
/// Components that overflow the interval fields are rejected.
pub fn parse_interval(text: &str) -> Result<Interval> {
    let text = text.trim();
    if text.starts_with('P') {
        return parse_interval_iso(text);
    }

    let mut interval = Interval::default();
    let mut tokens = text.split_whitespace();
    while let Some(token) = tokens.next() {
        let added = if token.contains(':') {
            parse_clock(token).and_then(|micros| add_micros(&mut interval, micros, 1))
        } else {
            let amount: i64 = token.parse().map_err(|_| invalid("interval", text))?;
            let unit = tokens.next().ok_or_else(|| invalid("interval", text))?;
            match unit.trim_end_matches('s') {
                "year" => add_months(&mut interval, amount, 12),
                "mon" => add_months(&mut interval, amount, 1),
                "day" => add_days(&mut interval, amount, 1),
                "hour" => add_micros(&mut interval, amount, 3_600_000_000),
                "min" => add_micros(&mut interval, amount, 60_000_000),
                "sec" => add_micros(&mut interval, amount, 1_000_000),
                _ => None,
            }
        };
        added.ok_or_else(|| invalid("interval", text))?;
    }
    Ok(interval)
}

fn add_months(interval: &mut Interval, amount: i64, scale: i64) -> Option<()> {
    let months = i32::try_from(amount.checked_mul(scale)?).ok()?;
    interval.months = interval.months.checked_add(months)?;
    Some(())
}

fn add_days(interval: &mut Interval, amount: i64, scale: i64) -> Option<()> {
    let days = i32::try_from(amount.checked_mul(scale)?).ok()?;
    interval.days = interval.days.checked_add(days)?;
    Some(())
}

fn add_micros(interval: &mut Interval, amount: i64, scale: i64) -> Option<()> {
    interval.microseconds = interval
        .microseconds
        .checked_add(amount.checked_mul(scale)?)?;
    Some(())
}

/// `[-]HH:MM:SS[.ffffff]` to microseconds.
fn parse_clock(token: &str) -> Option<i64> {
    let (negative, clock) = match token.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, token.strip_prefix('+').unwrap_or(token)),
    };
    let mut parts = clock.splitn(3, ':');
    let hours: i64 = parts.next()?.parse().ok()?;
    let minutes: i64 = parts.next()?.parse().ok()?;
    let seconds = parse_seconds(parts.next().unwrap_or("0"))?;
    let micros = hours
        .checked_mul(3_600_000_000)?
        .checked_add(minutes.checked_mul(60_000_000)?)?
        .checked_add(seconds)?;
    if negative { micros.checked_neg() } else { Some(micros) }
}

/// `S[.ffffff]` to microseconds, keeping the sign.
fn parse_seconds(text: &str) -> Option<i64> {
    let (negative, text) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let (whole, fraction) = text.split_once('.').unwrap_or((text, ""));
    let whole: i64 = if whole.is_empty() { 0 } else { whole.parse().ok()? };
    let mut micros = 0_i64;
    let mut scale = 100_000_i64;
    for digit in fraction.bytes().take(6) {
        if !digit.is_ascii_digit() {
            return None;
        }
        micros += i64::from(digit - b'0') * scale;
        scale /= 10;
    }
    let total = whole.checked_mul(1_000_000)?.checked_add(micros)?;
    if negative { total.checked_neg() } else { Some(total) }
}

fn parse_interval_iso(text: &str) -> Result<Interval> {
    let mut interval = Interval::default();
    let mut in_time = false;
    let mut number = String::new();
    for c in text.chars().skip(1) {
        match c {
            'T' => in_time = true,
            '0'..='9' | '-' | '+' | '.' => number.push(c),
            designator => {
                let added = if in_time && designator == 'S' {
                    parse_seconds(&number).and_then(|micros| add_micros(&mut interval, micros, 1))
                } else {
                    number.parse::<i64>().ok().and_then(|amount| match (in_time, designator) {
                        (false, 'Y') => add_months(&mut interval, amount, 12),
                        (false, 'M') => add_months(&mut interval, amount, 1),
                        (false, 'W') => add_days(&mut interval, amount, 7),
                        (false, 'D') => add_days(&mut interval, amount, 1),
                        (true, 'H') => add_micros(&mut interval, amount, 3_600_000_000),
                        (true, 'M') => add_micros(&mut interval, amount, 60_000_000),
                        _ => None,
                    })
                };
                added.ok_or_else(|| invalid("interval", text))?;
                number.clear();
            }
        }
    }
    if !number.is_empty() {
        return Err(invalid("interval", text));
    }
    Ok(interval)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::encode::{encode_to_string, interval_iso};

    #[test]
    fn array_elements_and_nulls() {
        let items = parse_array(r#"{1,NULL,"NULL","a \"b\"",  x y  ,""}"#).unwrap();
        assert_eq!(
            items,
            vec![
                Some("1".to_string()),
                None,
                Some("NULL".to_string()),
                Some(r#"a "b""#.to_string()),
                Some("x y".to_string()),
                Some(String::new()),
            ]
        );
        assert!(parse_array("{}").unwrap().is_empty());
        assert!(parse_array("nope").is_err());
    }

    #[test]
    fn array_dimension_prefix() {
        let items = parse_array("[0:1]={7,8}").unwrap();
        assert_eq!(items, vec![Some("7".into()), Some("8".into())]);
    }

    #[test]
    fn multi_dimensional_arrays() {
        let grid: Vec<Vec<i32>> = FromValue::from_text(oid::INT4_ARRAY, "{{1,2},{3,4}}").unwrap();
        assert_eq!(grid, vec![vec![1, 2], vec![3, 4]]);
    }

    #[test]
    fn nested_array_round_trip_through_encoder() {
        let value = Value::Array(vec![Value::Array(vec![r#"a"b"#.into(), r"c\d".into()])]);
        let text = encode_to_string(&value).unwrap();
        let outer = parse_array(&text).unwrap();
        let inner = parse_array(outer[0].as_deref().unwrap()).unwrap();
        assert_eq!(inner, vec![Some(r#"a"b"#.into()), Some(r"c\d".into())]);
    }

    #[test]
    fn row_fields() {
        let fields = parse_row(r#"(1,,"a ""q"" b",\))"#).unwrap();
        assert_eq!(
            fields,
            vec![
                Some("1".into()),
                None,
                Some(r#"a "q" b"#.into()),
                Some(")".into()),
            ]
        );
        assert_eq!(parse_row(r#"("")"#).unwrap(), vec![Some(String::new())]);
    }

    #[test]
    fn values_by_oid() {
        assert_eq!(decode_value(oid::INT4, "42").unwrap(), Value::Int(42));
        assert_eq!(decode_value(oid::BOOL, "t").unwrap(), Value::Bool(true));
        assert_eq!(
            decode_value(oid::INT4_ARRAY, "{1,NULL}").unwrap(),
            Value::Array(vec![Value::Int(1), Value::Null])
        );
        assert_eq!(
            decode_value(oid::BYTEA, "\\x01ff").unwrap(),
            Value::Bytes(vec![1, 255])
        );
        assert_eq!(
            decode_value(oid::INT4RANGE, "[1,10)").unwrap(),
            Value::from(Range::half_open(1, 10))
        );
        assert_eq!(
            decode_value(oid::INT4RANGE, "empty").unwrap(),
            Value::from(Range::Empty)
        );
        assert_eq!(
            decode_value(oid::TEXT, "hello").unwrap(),
            Value::Text("hello".into())
        );
    }

    #[test]
    fn timestamps() {
        let ts = DateTime::<Utc>::from_text(oid::TIMESTAMPTZ, "2024-01-02 03:04:05.5+00").unwrap();
        assert_eq!(ts.to_rfc3339(), "2024-01-02T03:04:05.500+00:00");
        let local = NaiveDateTime::from_text(oid::TIMESTAMP, "2024-01-02 03:04:05").unwrap();
        assert_eq!(local.to_string(), "2024-01-02 03:04:05");
    }

    #[test]
    fn intervals() {
        let iv = parse_interval("1 year 2 mons 3 days 04:05:06.5").unwrap();
        assert_eq!(iv, Interval::new(14, 3, 4 * 3_600_000_000 + 5 * 60_000_000 + 6_500_000));
        let negative = parse_interval("-1 days -00:00:01.25").unwrap();
        assert_eq!(negative, Interval::new(0, -1, -1_250_000));
        assert_eq!(parse_interval("00:00:00").unwrap(), Interval::default());
    }

    #[test]
    fn oversized_intervals_are_rejected() {
        for text in [
            "9223372036854775807 hours",
            "3000000000 days",
            "200000000 years",
            "99999999999:00:00",
            "2147483647 mons 1 mon",
            "P999999999999Y",
            "PT9223372036854775807H",
        ] {
            let err = parse_interval(text).unwrap_err();
            assert!(matches!(err, Error::Decode(_)), "{text}: {err:?}");
        }
        assert_eq!(
            parse_interval("2147483647 mons").unwrap(),
            Interval::new(i32::MAX, 0, 0)
        );
    }

    #[test]
    fn iso_intervals_match_encoder() {
        for iv in [
            Interval::new(14, 3, 4 * 3_600_000_000 + 5_500_000),
            Interval::new(-1, 0, -90_000_000),
            Interval::default(),
        ] {
            assert_eq!(parse_interval(&interval_iso(&iv)).unwrap(), iv);
        }
    }

    #[test]
    fn option_and_null() {
        assert_eq!(Option::<i32>::decode(oid::INT4, None).unwrap(), None);
        assert!(i32::decode(oid::INT4, None).is_err());
        let items: Vec<Option<i64>> = FromValue::from_text(oid::INT8_ARRAY, "{1,NULL}").unwrap();
        assert_eq!(items, vec![Some(1), None]);
    }
}
