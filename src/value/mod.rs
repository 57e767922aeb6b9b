//! Dynamic SQL values.
//!
//! [`Value`] is what templates interpolate and what [`Row::value`](crate::Row::value)
//! decodes. [`encode`] renders a value as PostgreSQL literal text, [`decode`]
//! parses text columns back.

pub mod decode;
pub mod encode;

use std::ops::Bound;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

use crate::error::{Error, Result};

pub use decode::{FromValue, parse_array, parse_row};
pub use encode::{Parent, encode, encode_to_string};

/// A calendar interval, stored the way PostgreSQL stores it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Interval {
    pub months: i32,
    pub days: i32,
    pub microseconds: i64,
}

impl Interval {
    pub const fn new(months: i32, days: i32, microseconds: i64) -> Self {
        Self {
            months,
            days,
            microseconds,
        }
    }
}

impl From<std::time::Duration> for Interval {
    fn from(duration: std::time::Duration) -> Self {
        Self::new(0, 0, duration.as_micros().min(i64::MAX as u128) as i64)
    }
}

/// A range value. Bounds must be scalars.
#[derive(Debug, Clone, PartialEq)]
pub enum Range {
    /// The literal `empty`.
    Empty,
    /// Lower and upper bound. `Unbounded` renders as an omitted bound.
    Bounded(Bound<Value>, Bound<Value>),
}

impl Range {
    /// `[lower,upper)`, the canonical form for discrete ranges.
    pub fn half_open(lower: impl Into<Value>, upper: impl Into<Value>) -> Self {
        Range::Bounded(
            Bound::Included(lower.into()),
            Bound::Excluded(upper.into()),
        )
    }

    /// `[lower,upper]`
    pub fn closed(lower: impl Into<Value>, upper: impl Into<Value>) -> Self {
        Range::Bounded(
            Bound::Included(lower.into()),
            Bound::Included(upper.into()),
        )
    }
}

/// A value that can be interpolated into SQL text or decoded from a row.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// Arbitrary precision number, kept as its decimal text.
    Numeric(String),
    Text(String),
    Bytes(Vec<u8>),
    Timestamp(DateTime<Utc>),
    /// Timestamp without time zone.
    LocalTimestamp(NaiveDateTime),
    Date(NaiveDate),
    Interval(Interval),
    Range(Box<Range>),
    Array(Vec<Value>),
    /// Composite type (anonymous record).
    Row(Vec<Value>),
    Json(serde_json::Value),
    /// Key/value pairs rendered as a JSON object.
    Object(Vec<(String, Value)>),
}

impl Value {
    /// Serialize any `serde` value into [`Value::Json`].
    pub fn json<T: serde::Serialize + ?Sized>(value: &T) -> Result<Self> {
        serde_json::to_value(value)
            .map(Value::Json)
            .map_err(|e| Error::Encode(format!("cannot serialize JSON: {e}")))
    }

    /// Build a [`Value::Object`] from key/value pairs.
    pub fn object<K: Into<String>, V: Into<Value>>(pairs: impl IntoIterator<Item = (K, V)>) -> Self {
        Value::Object(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Build a [`Value::Row`] from fields.
    pub fn row<V: Into<Value>>(fields: impl IntoIterator<Item = V>) -> Self {
        Value::Row(fields.into_iter().map(Into::into).collect())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// True for values that have no nested structure.
    pub fn is_scalar(&self) -> bool {
        !matches!(
            self,
            Value::Range(_) | Value::Array(_) | Value::Row(_) | Value::Json(_) | Value::Object(_)
        )
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) | Value::Numeric(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

macro_rules! impl_from_int {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Value {
                fn from(value: $ty) -> Self {
                    Value::Int(i64::from(value))
                }
            }
        )*
    };
}

impl_from_int!(i8, i16, i32, i64, u8, u16, u32);

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<f32> for Value {
    fn from(value: f32) -> Self {
        Value::Float(f64::from(value))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<&String> for Value {
    fn from(value: &String) -> Self {
        Value::Text(value.clone())
    }
}

impl From<&[u8]> for Value {
    fn from(value: &[u8]) -> Self {
        Value::Bytes(value.to_vec())
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Value::Timestamp(value)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(value: NaiveDateTime) -> Self {
        Value::LocalTimestamp(value)
    }
}

impl From<NaiveDate> for Value {
    fn from(value: NaiveDate) -> Self {
        Value::Date(value)
    }
}

impl From<Interval> for Value {
    fn from(value: Interval) -> Self {
        Value::Interval(value)
    }
}

impl From<Range> for Value {
    fn from(value: Range) -> Self {
        Value::Range(Box::new(value))
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        Value::Json(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(value: Vec<T>) -> Self {
        Value::Array(value.into_iter().map(Into::into).collect())
    }
}

#[cfg(feature = "with-uuid")]
impl From<uuid::Uuid> for Value {
    fn from(value: uuid::Uuid) -> Self {
        Value::Text(value.hyphenated().to_string())
    }
}

#[cfg(feature = "with-rust-decimal")]
impl From<rust_decimal::Decimal> for Value {
    fn from(value: rust_decimal::Decimal) -> Self {
        Value::Numeric(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn option_maps_to_null() {
        assert_eq!(Value::from(None::<i32>), Value::Null);
        assert_eq!(Value::from(Some(3_i32)), Value::Int(3));
    }

    #[test]
    fn json_from_serde() {
        #[derive(serde::Serialize)]
        struct Point {
            x: i32,
        }
        let value = Value::json(&Point { x: 1 }).unwrap();
        assert_eq!(value, Value::Json(serde_json::json!({ "x": 1 })));
    }

    #[test]
    fn scalar_classification() {
        assert!(Value::Int(1).is_scalar());
        assert!(Value::Null.is_scalar());
        assert!(!Value::Array(vec![]).is_scalar());
        assert!(!Value::from(Range::Empty).is_scalar());
    }
}
