//! A pooled connection with an explicit lifecycle status.
//!
//! A [`Connection`] runs one command at a time:
//! `Idle -> Writing -> Reading -> Idle`. It becomes `Closed` when closed
//! explicitly or when the socket fails.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::observer::{CloseReason, Observer};
use crate::opts::Opts;
use crate::protocol::types::TransactionStatus;
use crate::raw::{CancelToken, PgResult, RawConn, ResultStatus};
use crate::session::SessionParams;

/// Lifecycle status of a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Open and ready for a command.
    Idle,
    /// A command is being sent.
    Writing,
    /// Results of a command are being read.
    Reading,
    /// Not open.
    Closed,
}

/// One server connection.
pub struct Connection {
    id: u64,
    raw: Option<RawConn>,
    status: ConnectionStatus,
    session: SessionParams,
    observer: Arc<dyn Observer>,
    shutdown: CancellationToken,
}

impl Connection {
    /// A closed connection. `shutdown` force-closes it while it waits on the socket.
    pub fn new(id: u64, observer: Arc<dyn Observer>, shutdown: CancellationToken) -> Self {
        Self {
            id,
            raw: None,
            status: ConnectionStatus::Closed,
            session: SessionParams::default(),
            observer,
            shutdown,
        }
    }

    /// Open the connection and apply `session` once established.
    pub async fn connect(&mut self, opts: &Opts, session: &SessionParams) -> Result<()> {
        if self.raw.is_some() {
            return Err(Error::Connection("connection is already open".into()));
        }

        let raw = tokio::select! {
            raw = RawConn::connect(opts) => raw?,
            () = self.shutdown.cancelled() => {
                return Err(Error::Connection("pool was closed".into()));
            }
        };
        self.observer
            .connection_opened(self.id, raw.backend_pid().unwrap_or_default());
        self.raw = Some(raw);
        self.status = ConnectionStatus::Idle;

        if let Some(sql) = session.apply_sql() {
            if let Err(e) = self.query(&sql).await {
                self.close(CloseReason::Broken);
                return Err(e);
            }
        }
        self.session = session.clone();
        Ok(())
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    /// Session parameters this connection was configured with.
    pub fn session(&self) -> &SessionParams {
        &self.session
    }

    pub fn backend_pid(&self) -> Option<u32> {
        self.raw.as_ref().and_then(RawConn::backend_pid)
    }

    pub fn transaction_status(&self) -> Option<TransactionStatus> {
        self.raw.as_ref().map(RawConn::transaction_status)
    }

    pub fn cancel_token(&self) -> Option<CancelToken> {
        self.raw.as_ref().and_then(RawConn::cancel_token)
    }

    /// True if the connection can take another command from the pool.
    pub(crate) fn is_reusable(&self) -> bool {
        self.status == ConnectionStatus::Idle
            && self.raw.as_ref().is_some_and(|raw| {
                !raw.is_broken()
                    && !raw.in_progress()
                    && raw.transaction_status() == TransactionStatus::Idle
            })
    }

    /// Read anything that arrived while idle. Returns false if the server hung up.
    pub(crate) fn check_alive(&mut self) -> bool {
        let Some(raw) = self.raw.as_mut() else {
            return false;
        };
        let alive = raw.consume_input().is_ok();
        self.forward_async();
        if !alive {
            self.close(CloseReason::Broken);
        }
        alive
    }

    /// Send a command. With `params`, the extended protocol is used and the
    /// text may hold a single statement only.
    pub async fn dispatch(
        &mut self,
        sql: &str,
        params: Option<&[Option<String>]>,
        single_row: bool,
    ) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return self.shut_down();
        }
        if self.status != ConnectionStatus::Idle {
            return Err(Error::Connection(format!(
                "connection is not idle ({:?})",
                self.status
            )));
        }
        let Some(raw) = self.raw.as_mut() else {
            return Err(Error::Connection("connection is not open".into()));
        };

        let sent = match params {
            Some(params) => raw.send_query_params(sql, params),
            None => raw.send_query(sql),
        };
        if let Err(e) = sent {
            return self.fail(e);
        }
        if single_row {
            raw.set_single_row_mode();
        }
        self.status = ConnectionStatus::Writing;
        self.observer.query(self.id, sql);

        loop {
            let Some(raw) = self.raw.as_mut() else {
                return Err(Error::ConnectionClosed);
            };
            match raw.flush() {
                Ok(false) => break,
                Ok(true) => {}
                Err(e) => return self.fail(e),
            }
            let waited = tokio::select! {
                waited = raw.writable() => waited,
                () = self.shutdown.cancelled() => return self.shut_down(),
            };
            if let Err(e) = waited {
                return self.fail(e);
            }
        }
        self.status = ConnectionStatus::Reading;
        Ok(())
    }

    /// Next result of the dispatched command, `None` once it is complete.
    pub async fn next_result(&mut self) -> Result<Option<PgResult>> {
        loop {
            let Some(raw) = self.raw.as_mut() else {
                return Err(Error::ConnectionClosed);
            };
            if !raw.is_busy() {
                let result = raw.get_result();
                self.forward_async();
                if result.is_none() {
                    self.status = ConnectionStatus::Idle;
                }
                return Ok(result);
            }

            let waited = tokio::select! {
                waited = raw.readable() => waited,
                () = self.shutdown.cancelled() => return self.shut_down(),
            };
            let consumed = waited.and_then(|()| raw.consume_input());
            self.forward_async();
            if let Err(e) = consumed {
                return self.fail(e);
            }
        }
    }

    /// Like [`Connection::next_result`], sending one cancel request when
    /// `signal` fires. The command is still drained to completion.
    pub(crate) async fn next_result_or_cancel(
        &mut self,
        signal: Option<&CancellationToken>,
        cancelled: &mut bool,
    ) -> Result<Option<PgResult>> {
        let Some(signal) = signal.filter(|_| !*cancelled) else {
            return self.next_result().await;
        };
        let next = tokio::select! {
            biased;
            () = signal.cancelled() => None,
            next = self.next_result() => Some(next),
        };
        match next {
            Some(next) => next,
            None => {
                *cancelled = true;
                if let Err(e) = self.cancel().await {
                    tracing::debug!(connection_id = self.id, error = %e, "cancel request failed");
                }
                self.next_result().await
            }
        }
    }

    /// Run a command and collect every result, including failed ones.
    pub(crate) async fn execute(
        &mut self,
        sql: &str,
        params: Option<&[Option<String>]>,
        signal: Option<&CancellationToken>,
    ) -> Result<Vec<PgResult>> {
        if signal.is_some_and(CancellationToken::is_cancelled) {
            return Err(Error::Aborted);
        }
        self.dispatch(sql, params, false).await?;

        let mut results = Vec::new();
        let mut cancelled = false;
        while let Some(result) = self.next_result_or_cancel(signal, &mut cancelled).await? {
            results.push(result);
        }
        if cancelled {
            return Err(Error::Aborted);
        }
        Ok(results)
    }

    /// Run a command; the first failed result becomes the error.
    pub async fn query(&mut self, sql: &str) -> Result<Vec<PgResult>> {
        let results = self.execute(sql, None, None).await?;
        check_results(results, sql)
    }

    /// Ask the server to cancel the running command. Best effort; does
    /// nothing unless a command is in flight.
    pub async fn cancel(&self) -> Result<()> {
        if !matches!(
            self.status,
            ConnectionStatus::Writing | ConnectionStatus::Reading
        ) {
            return Ok(());
        }
        match self.cancel_token() {
            Some(token) => token.cancel().await,
            None => Ok(()),
        }
    }

    /// Reset session state and apply `session` instead.
    pub async fn reconfigure(&mut self, session: &SessionParams) -> Result<()> {
        tracing::debug!(connection_id = self.id, "reconfiguring session");
        self.query(&session.reconfigure_sql()).await?;
        self.session = session.clone();
        Ok(())
    }

    /// Close the socket. Does nothing if already closed.
    pub fn close(&mut self, reason: CloseReason) {
        if let Some(mut raw) = self.raw.take() {
            raw.terminate();
            self.observer.connection_closed(self.id, reason);
        }
        self.status = ConnectionStatus::Closed;
    }

    fn forward_async(&mut self) {
        let Some(raw) = self.raw.as_mut() else {
            return;
        };
        while let Some(notice) = raw.take_notice() {
            self.observer.notice(self.id, &notice);
        }
        while let Some(notification) = raw.notifies() {
            self.observer.notification(self.id, &notification);
        }
    }

    fn fail<T>(&mut self, error: Error) -> Result<T> {
        let broken = error.is_connection_broken()
            || self.raw.as_ref().is_none_or(RawConn::is_broken);
        if broken {
            self.close(CloseReason::Broken);
        }
        Err(error)
    }

    fn shut_down<T>(&mut self) -> Result<T> {
        self.close(CloseReason::PoolClosed);
        Err(Error::Connection("pool was closed".into()))
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("status", &self.status)
            .field("raw", &self.raw)
            .finish_non_exhaustive()
    }
}

/// Turn the first failed result into an error carrying the command text.
pub(crate) fn check_results(results: Vec<PgResult>, sql: &str) -> Result<Vec<PgResult>> {
    if let Some(error) = results
        .iter()
        .find(|r| r.status() == ResultStatus::FatalError)
        .and_then(PgResult::to_error)
    {
        return Err(error.with_command(sql));
    }
    Ok(results)
}
