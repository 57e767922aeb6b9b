//! Result rows.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::raw::{Field, PgResult};
use crate::value::{FromValue, Value};

/// One row of a result, with the column metadata it shares with its siblings.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[Field]>,
    values: Vec<Option<String>>,
}

impl Row {
    pub(crate) fn new(columns: Arc<[Field]>, values: Vec<Option<String>>) -> Self {
        Self { columns, values }
    }

    /// Split a result into rows.
    pub(crate) fn from_result(result: PgResult) -> Vec<Row> {
        let (columns, rows) = result.into_rows();
        rows.into_iter()
            .map(|values| Row::new(Arc::clone(&columns), values))
            .collect()
    }

    pub fn columns(&self) -> &[Field] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Text of a column, `None` for NULL.
    pub fn get_raw(&self, index: impl ColumnIndex) -> Result<Option<&str>> {
        let idx = index.index(&self.columns)?;
        Ok(self.values.get(idx).and_then(|v| v.as_deref()))
    }

    /// Decode a column.
    pub fn get<T: FromValue>(&self, index: impl ColumnIndex) -> Result<T> {
        let idx = index.index(&self.columns)?;
        let oid = self.columns[idx].type_oid;
        T::decode(oid, self.values.get(idx).and_then(|v| v.as_deref()))
            .map_err(|e| Error::Decode(format!("column {:?}: {e}", self.columns[idx].name)))
    }

    /// Decode a column into a dynamic [`Value`].
    pub fn value(&self, index: impl ColumnIndex) -> Result<Value> {
        self.get(index)
    }

    /// Decode the whole row into a tuple or other [`FromRow`] type.
    pub fn decode<T: FromRow>(&self) -> Result<T> {
        T::from_row(self)
    }

    /// Column name and decoded value pairs.
    pub fn to_values(&self) -> Result<Vec<(String, Value)>> {
        (0..self.len())
            .map(|i| Ok((self.columns[i].name.clone(), self.value(i)?)))
            .collect()
    }
}

/// Column lookup by position or name.
pub trait ColumnIndex {
    fn index(&self, columns: &[Field]) -> Result<usize>;
}

impl ColumnIndex for usize {
    fn index(&self, columns: &[Field]) -> Result<usize> {
        if *self < columns.len() {
            Ok(*self)
        } else {
            Err(Error::Decode(format!(
                "column index {} out of range for {} columns",
                self,
                columns.len()
            )))
        }
    }
}

impl ColumnIndex for &str {
    fn index(&self, columns: &[Field]) -> Result<usize> {
        columns
            .iter()
            .position(|c| c.name == *self)
            .ok_or_else(|| Error::Decode(format!("no column named {self:?}")))
    }
}

/// Trait for decoding a [`Row`] into a Rust type.
pub trait FromRow: Sized {
    fn from_row(row: &Row) -> Result<Self>;
}

impl FromRow for Row {
    fn from_row(row: &Row) -> Result<Self> {
        Ok(row.clone())
    }
}

macro_rules! impl_from_row_tuple {
    ($count:literal; $($ty:ident => $idx:tt),+) => {
        impl<$($ty: FromValue),+> FromRow for ($($ty,)+) {
            fn from_row(row: &Row) -> Result<Self> {
                if row.len() < $count {
                    return Err(Error::Decode("not enough columns for tuple".into()));
                }
                Ok(($(row.get::<$ty>($idx)?,)+))
            }
        }
    };
}

impl_from_row_tuple!(1; T1 => 0);
impl_from_row_tuple!(2; T1 => 0, T2 => 1);
impl_from_row_tuple!(3; T1 => 0, T2 => 1, T3 => 2);
impl_from_row_tuple!(4; T1 => 0, T2 => 1, T3 => 2, T4 => 3);
impl_from_row_tuple!(5; T1 => 0, T2 => 1, T3 => 2, T4 => 3, T5 => 4);
impl_from_row_tuple!(6; T1 => 0, T2 => 1, T3 => 2, T4 => 3, T5 => 4, T6 => 5);
impl_from_row_tuple!(7; T1 => 0, T2 => 1, T3 => 2, T4 => 3, T5 => 4, T6 => 5, T7 => 6);
impl_from_row_tuple!(8; T1 => 0, T2 => 1, T3 => 2, T4 => 3, T5 => 4, T6 => 5, T7 => 6, T8 => 7);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::oid;

    fn row() -> Row {
        let columns: Arc<[Field]> = Arc::from(vec![
            Field {
                name: "id".into(),
                type_oid: oid::INT4,
                table_oid: 0,
            },
            Field {
                name: "tags".into(),
                type_oid: oid::TEXT_ARRAY,
                table_oid: 0,
            },
            Field {
                name: "note".into(),
                type_oid: oid::TEXT,
                table_oid: 0,
            },
        ]);
        Row::new(columns, vec![Some("7".into()), Some("{a,\"b c\"}".into()), None])
    }

    #[test]
    fn get_by_index_and_name() {
        let row = row();
        assert_eq!(row.get::<i32>(0).unwrap(), 7);
        assert_eq!(row.get::<Vec<String>>("tags").unwrap(), vec!["a", "b c"]);
        assert_eq!(row.get::<Option<String>>("note").unwrap(), None);
        assert!(row.get::<String>("note").is_err());
        assert!(row.get::<i32>("missing").is_err());
        assert!(row.get::<i32>(9).is_err());
    }

    #[test]
    fn dynamic_values() {
        let row = row();
        assert_eq!(row.value(0).unwrap(), Value::Int(7));
        assert_eq!(row.value("note").unwrap(), Value::Null);
    }

    #[test]
    fn decode_tuple() {
        let (id, tags, note): (i64, Vec<String>, Option<String>) = row().decode().unwrap();
        assert_eq!((id, tags.len(), note), (7, 2, None));
        assert!(row().decode::<(i32, i32, i32, i32)>().is_err());
    }
}
