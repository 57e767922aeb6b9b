//! Sans-I/O state machines for PostgreSQL protocol.
//!
//! These state machines handle the protocol logic without performing any I/O.
//! They produce `Action` values that tell the caller what to do next.

pub mod action;
pub mod connection;
pub mod query;

pub use action::{Action, AsyncMessage, Notification};
pub use connection::{ConnectionState, ConnectionStateMachine};
pub use query::QueryStateMachine;
