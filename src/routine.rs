//! Binding database routines to a client.
//!
//! Generated bindings are plain structs holding a [`Client`]:
//!
//! ```
//! use pg_nano::routine::{Routine, Routines};
//! use pg_nano::query::{Query, shape::SingleValue};
//! use pg_nano::Client;
//!
//! struct Api {
//!     client: Client,
//! }
//!
//! impl Routines for Api {
//!     fn bind(client: Client) -> Self {
//!         Self { client }
//!     }
//! }
//!
//! impl Api {
//!     const ADD: Routine = Routine::new("api", "add");
//!
//!     fn add(&self, a: i32, b: i32) -> Query<SingleValue<i32>> {
//!         Self::ADD.call(&self.client, vec![a.into(), b.into()]).reshape()
//!     }
//! }
//! ```

use crate::client::Client;
use crate::query::{Query, shape::Full};
use crate::raw::escape_identifier;
use crate::value::Value;

/// A set of routines bound to one client.
pub trait Routines: Sized {
    fn bind(client: Client) -> Self;
}

/// A set-returning or scalar function called as `SELECT * FROM schema.name(...)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Routine {
    schema: &'static str,
    name: &'static str,
}

impl Routine {
    pub const fn new(schema: &'static str, name: &'static str) -> Self {
        Self { schema, name }
    }

    pub fn schema(&self) -> &'static str {
        self.schema
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// `SELECT * FROM "schema"."name"($1, .., $arity)`
    pub fn sql(&self, arity: usize) -> String {
        let placeholders: Vec<String> = (1..=arity).map(|i| format!("${i}")).collect();
        format!(
            "SELECT * FROM {}.{}({})",
            escape_identifier(self.schema),
            escape_identifier(self.name),
            placeholders.join(", ")
        )
    }

    /// Call the routine with `args` as parameters.
    #[track_caller]
    pub fn call(&self, client: &Client, args: Vec<Value>) -> Query<Full> {
        client.query_params(self.sql(args.len()), args)
    }
}
