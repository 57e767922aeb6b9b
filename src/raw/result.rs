//! Completed command results.

use std::sync::Arc;

use crate::error::{Error, ErrorFields};
use crate::protocol::backend::query::rows_affected;
use crate::protocol::types::Oid;

/// Outcome of one SQL command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultStatus {
    /// A command that returns no rows finished.
    CommandOk,
    /// A row-returning command finished. In single-row mode this result
    /// carries no rows and terminates the command.
    TuplesOk,
    /// One row of a command running in single-row mode.
    SingleTuple,
    /// The query string was empty.
    EmptyQuery,
    /// The server reported an error.
    FatalError,
}

/// Column metadata from a RowDescription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    /// Column name
    pub name: String,
    /// Data type OID
    pub type_oid: Oid,
    /// Source table OID, 0 for computed columns
    pub table_oid: Oid,
}

/// One result object, in the manner of a libpq `PGresult`.
#[derive(Debug, Clone)]
pub struct PgResult {
    pub(crate) status: ResultStatus,
    pub(crate) fields: Arc<[Field]>,
    pub(crate) rows: Vec<Vec<Option<String>>>,
    pub(crate) command_tag: Option<String>,
    pub(crate) error: Option<ErrorFields>,
}

impl PgResult {
    pub(crate) fn new(status: ResultStatus, fields: Arc<[Field]>) -> Self {
        Self {
            status,
            fields,
            rows: Vec::new(),
            command_tag: None,
            error: None,
        }
    }

    pub(crate) fn fatal(error: ErrorFields) -> Self {
        Self {
            error: Some(error),
            ..Self::new(ResultStatus::FatalError, Arc::from([]))
        }
    }

    /// Result status.
    pub fn status(&self) -> ResultStatus {
        self.status
    }

    /// Column metadata shared by every row of this result.
    pub fn fields(&self) -> &Arc<[Field]> {
        &self.fields
    }

    /// Number of columns.
    pub fn nfields(&self) -> usize {
        self.fields.len()
    }

    /// Number of rows.
    pub fn ntuples(&self) -> usize {
        self.rows.len()
    }

    /// Column name by index.
    pub fn field_name(&self, col: usize) -> Option<&str> {
        self.fields.get(col).map(|f| f.name.as_str())
    }

    /// Column type OID by index.
    pub fn field_type(&self, col: usize) -> Option<Oid> {
        self.fields.get(col).map(|f| f.type_oid)
    }

    /// Cell text. `None` for NULL or out-of-range indices.
    pub fn get_value(&self, row: usize, col: usize) -> Option<&str> {
        self.rows.get(row)?.get(col)?.as_deref()
    }

    /// Whether a cell is NULL.
    pub fn get_is_null(&self, row: usize, col: usize) -> bool {
        self.rows
            .get(row)
            .and_then(|r| r.get(col))
            .is_none_or(Option::is_none)
    }

    /// Command tag, e.g. `INSERT 0 3`.
    pub fn command_status(&self) -> Option<&str> {
        self.command_tag.as_deref()
    }

    /// Rows affected or returned, parsed from the command tag.
    pub fn cmd_tuples(&self) -> Option<u64> {
        self.command_tag.as_deref().and_then(rows_affected)
    }

    /// Server error fields of a `FatalError` result.
    pub fn error_fields(&self) -> Option<&ErrorFields> {
        self.error.as_ref()
    }

    /// Convert a `FatalError` result into an error.
    pub fn to_error(&self) -> Option<Error> {
        self.error.clone().map(Error::server)
    }

    /// Take the rows out of the result.
    pub fn into_rows(self) -> (Arc<[Field]>, Vec<Vec<Option<String>>>) {
        (self.fields, self.rows)
    }
}
