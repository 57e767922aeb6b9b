//! Lifecycle hooks for pool and connection events.
//!
//! The pool receives an [`Observer`] through [`PoolOpts`](crate::PoolOpts)
//! instead of consulting global logging state. Every method has a no-op
//! default so implementors only override what they need.

use std::time::Duration;

use crate::error::{Error, ErrorFields};
use crate::raw::Notification;

/// Why a connection left the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Unused for longer than the idle timeout.
    IdleTimeout,
    /// The socket failed or the server hung up.
    Broken,
    /// The pool was closed.
    PoolClosed,
    /// Dropped while a query was still in flight.
    Abandoned,
}

/// Receives pool and connection lifecycle events.
pub trait Observer: Send + Sync {
    /// A connection finished startup.
    fn connection_opened(&self, _connection_id: u64, _server_pid: u32) {}

    /// A connection attempt failed. `retry_in` is `None` when no retry follows.
    fn connect_failed(&self, _attempt: u32, _retry_in: Option<Duration>, _error: &Error) {}

    /// A connection was closed and removed from the pool.
    fn connection_closed(&self, _connection_id: u64, _reason: CloseReason) {}

    /// A query was sent on a connection.
    fn query(&self, _connection_id: u64, _sql: &str) {}

    /// The server sent a NoticeResponse.
    fn notice(&self, _connection_id: u64, _notice: &ErrorFields) {}

    /// The server delivered a LISTEN/NOTIFY notification.
    fn notification(&self, _connection_id: u64, _notification: &Notification) {}
}

/// Default observer that logs through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn connection_opened(&self, connection_id: u64, server_pid: u32) {
        tracing::debug!(connection_id, server_pid, "connection opened");
    }

    fn connect_failed(&self, attempt: u32, retry_in: Option<Duration>, error: &Error) {
        match retry_in {
            Some(delay) => tracing::warn!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                %error,
                "connection attempt failed, retrying"
            ),
            None => tracing::error!(attempt, %error, "connection attempt failed"),
        }
    }

    fn connection_closed(&self, connection_id: u64, reason: CloseReason) {
        tracing::debug!(connection_id, ?reason, "connection closed");
    }

    fn query(&self, connection_id: u64, sql: &str) {
        tracing::trace!(connection_id, sql, "query");
    }

    fn notice(&self, connection_id: u64, notice: &ErrorFields) {
        tracing::info!(connection_id, %notice, "server notice");
    }

    fn notification(&self, connection_id: u64, notification: &Notification) {
        tracing::debug!(
            connection_id,
            channel = %notification.channel,
            pid = notification.pid,
            "notification"
        );
    }
}
