//! Connection pool.
//!
//! The pool keeps up to `max_connections` connections. `min_connections` is
//! a floor: that many are opened on connect, and whenever a close takes the
//! pool below it a replacement is opened. Callers that find no idle
//! connection and no spare capacity wait in a FIFO backlog; a released
//! connection goes straight to the oldest waiter.
//!
//! The pool state sits behind one mutex that is never held across an await.

use std::collections::VecDeque;
use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::observer::CloseReason;
use crate::opts::{Opts, PoolOpts};
use crate::session::SessionParams;

type Handoff = oneshot::Sender<Result<PooledConnection>>;

enum Slot {
    Connecting,
    Idle {
        conn: Connection,
        timer: Option<AbortHandle>,
    },
    Busy,
}

struct Entry {
    id: u64,
    slot: Slot,
}

struct Waiter {
    id: u64,
    session: SessionParams,
    tx: Handoff,
}

struct State {
    target: Option<Arc<Opts>>,
    shutdown: CancellationToken,
    entries: Vec<Entry>,
    /// Ids of required connections waiting out a retry delay.
    retrying: Vec<u64>,
    backlog: VecDeque<Waiter>,
}

impl State {
    fn position(&self, id: u64) -> Option<usize> {
        self.entries.iter().position(|e| e.id == id)
    }

    fn set_slot(&mut self, id: u64, slot: Slot) -> bool {
        match self.entries.iter_mut().find(|e| e.id == id) {
            Some(entry) => {
                entry.slot = slot;
                true
            }
            None => false,
        }
    }

    /// Reserve the first idle connection accepted by `pred`.
    fn take_idle(&mut self, pred: impl Fn(&Connection) -> bool) -> Option<Connection> {
        let entry = self
            .entries
            .iter_mut()
            .find(|e| matches!(&e.slot, Slot::Idle { conn, .. } if pred(conn)))?;
        match std::mem::replace(&mut entry.slot, Slot::Busy) {
            Slot::Idle { conn, timer } => {
                if let Some(timer) = timer {
                    timer.abort();
                }
                Some(conn)
            }
            other => {
                entry.slot = other;
                None
            }
        }
    }

    /// Queue `waiter` by arrival, ahead of everyone who came after it.
    fn enqueue(&mut self, waiter: Waiter) {
        let at = self
            .backlog
            .iter()
            .position(|w| w.id > waiter.id)
            .unwrap_or(self.backlog.len());
        self.backlog.insert(at, waiter);
    }

    fn pop_waiter(&mut self) -> Option<Waiter> {
        while let Some(waiter) = self.backlog.pop_front() {
            if !waiter.tx.is_closed() {
                return Some(waiter);
            }
        }
        None
    }
}

struct Shared {
    opts: PoolOpts,
    state: Mutex<State>,
    next_id: AtomicU64,
}

enum Plan {
    Idle(Connection),
    Wait(u64, oneshot::Receiver<Result<PooledConnection>>),
}

/// Outcome of [`Shared::open`].
enum Opened {
    Connected(Connection),
    /// Other connections took the capacity during backoff.
    PoolFull,
}

/// Outcome of a single connection attempt.
enum Attempt {
    Connected(Connection),
    /// Failed with a retryable error. The entry was removed for the delay.
    Retry {
        delay: Duration,
        shutdown: CancellationToken,
    },
}

fn pool_closed() -> Error {
    Error::Connection("pool was closed".into())
}

/// Errors worth retrying: the server may become reachable or accept more
/// connections later.
fn is_retryable(error: &Error) -> bool {
    match error.root() {
        Error::Io(_) | Error::ConnectionClosed | Error::Protocol(_) => true,
        // insufficient_resources (e.g. too_many_connections), cannot_connect_now
        Error::Server(err) => err
            .fields
            .code
            .as_deref()
            .is_some_and(|code| code.starts_with("53") || code == "57P03"),
        _ => false,
    }
}

/// A shared set of connections.
#[derive(Clone)]
pub struct Pool {
    shared: Arc<Shared>,
}

impl Pool {
    pub fn new(opts: PoolOpts) -> Result<Self> {
        opts.validate()?;
        Ok(Self {
            shared: Arc::new(Shared {
                opts,
                state: Mutex::new(State {
                    target: None,
                    shutdown: CancellationToken::new(),
                    entries: Vec::new(),
                    retrying: Vec::new(),
                    backlog: VecDeque::new(),
                }),
                next_id: AtomicU64::new(1),
            }),
        })
    }

    pub fn opts(&self) -> &PoolOpts {
        &self.shared.opts
    }

    /// Start serving `target`. The first required connection is opened
    /// before returning so configuration errors surface here; the rest are
    /// opened in the background.
    ///
    /// The first connection uses the `max_adhoc_retries` budget.
    pub async fn connect(&self, target: Opts) -> Result<()> {
        {
            let mut state = self.shared.state.lock();
            if state.target.is_some() {
                return Err(Error::Connection("already connected".into()));
            }
            state.target = Some(Arc::new(target));
            state.shutdown = CancellationToken::new();
        }

        let min = self.shared.opts.min_connections;
        if min == 0 {
            return Ok(());
        }

        let id = self.shared.reserve();
        let retries = Some(self.shared.opts.max_adhoc_retries);
        match self.shared.open(id, true, &SessionParams::default(), retries).await {
            Ok(Opened::Connected(conn)) => self.shared.release(conn),
            Ok(Opened::PoolFull) => {}
            Err(e) => {
                self.shared.close();
                return Err(e);
            }
        }
        self.shared.replenish();
        Ok(())
    }

    /// Check out a connection configured for `session`.
    ///
    /// Prefers an idle connection with matching session parameters, then
    /// opens a new one if below `max_connections`, then reconfigures an idle
    /// connection of another session, and finally waits in the backlog.
    /// `signal` aborts the wait with [`Error::Aborted`].
    pub async fn get_connection(
        &self,
        session: &SessionParams,
        signal: Option<&CancellationToken>,
    ) -> Result<PooledConnection> {
        if signal.is_some_and(CancellationToken::is_cancelled) {
            return Err(Error::Aborted);
        }
        loop {
            let mut guard = match self.shared.plan(session)? {
                Plan::Idle(conn) => {
                    let mut guard = PooledConnection::new(conn, Arc::clone(&self.shared));
                    if !guard.check_alive() {
                        // Dropping the closed guard removes it and replaces it if required.
                        continue;
                    }
                    guard
                }
                Plan::Wait(waiter_id, rx) => self.shared.wait(waiter_id, rx, signal).await?,
            };

            if guard.session().hash_value() != session.hash_value() {
                if let Err(e) = guard.reconfigure(session).await {
                    guard.close(CloseReason::Broken);
                    return Err(e);
                }
            }
            return Ok(guard);
        }
    }

    /// Close every connection and reject every waiter. Idempotent.
    pub fn close(&self) {
        self.shared.close();
    }

    pub fn is_connected(&self) -> bool {
        self.shared.state.lock().target.is_some()
    }

    /// Connections open or being opened.
    pub fn num_connections(&self) -> usize {
        self.shared.state.lock().entries.len()
    }

    pub fn num_idle(&self) -> usize {
        self.shared
            .state
            .lock()
            .entries
            .iter()
            .filter(|e| matches!(e.slot, Slot::Idle { .. }))
            .count()
    }

    pub fn backlog_len(&self) -> usize {
        self.shared
            .state
            .lock()
            .backlog
            .iter()
            .filter(|w| !w.tx.is_closed())
            .count()
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("opts", &self.shared.opts)
            .field("num_connections", &self.num_connections())
            .finish_non_exhaustive()
    }
}

impl Shared {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Add a connecting entry and return its id.
    fn reserve(&self) -> u64 {
        let id = self.next_id();
        self.state.lock().entries.push(Entry {
            id,
            slot: Slot::Connecting,
        });
        id
    }

    fn remove_entry(&self, id: u64) -> Option<Entry> {
        let mut state = self.state.lock();
        let idx = state.position(id)?;
        Some(state.entries.remove(idx))
    }

    fn plan(self: &Arc<Self>, session: &SessionParams) -> Result<Plan> {
        let mut state = self.state.lock();
        if state.target.is_none() {
            return Err(Error::Connection("client is not connected".into()));
        }

        let hash = session.hash_value();
        if let Some(conn) = state.take_idle(|c| c.session().hash_value() == hash) {
            return Ok(Plan::Idle(conn));
        }

        let (tx, rx) = oneshot::channel();
        let waiter_id = self.next_id();
        if state.entries.len() < self.opts.max_connections {
            let id = self.next_id();
            state.entries.push(Entry {
                id,
                slot: Slot::Connecting,
            });
            let shared = Arc::clone(self);
            let session = session.clone();
            tokio::spawn(async move {
                shared.open_adhoc(id, waiter_id, session, tx).await;
            });
            return Ok(Plan::Wait(waiter_id, rx));
        }

        if let Some(conn) = state.take_idle(|_| true) {
            return Ok(Plan::Idle(conn));
        }

        tracing::debug!(backlog = state.backlog.len() + 1, "pool exhausted, waiting");
        state.enqueue(Waiter {
            id: waiter_id,
            session: session.clone(),
            tx,
        });
        Ok(Plan::Wait(waiter_id, rx))
    }

    async fn wait(
        &self,
        waiter_id: u64,
        mut rx: oneshot::Receiver<Result<PooledConnection>>,
        signal: Option<&CancellationToken>,
    ) -> Result<PooledConnection> {
        let received = match signal {
            Some(signal) => tokio::select! {
                biased;
                received = &mut rx => Some(received),
                () = signal.cancelled() => None,
            },
            None => Some((&mut rx).await),
        };
        match received {
            Some(Ok(result)) => result,
            Some(Err(_)) => Err(pool_closed()),
            None => {
                self.state.lock().backlog.retain(|w| w.id != waiter_id);
                // A connection handed over meanwhile goes back to the pool when `rx` drops.
                Err(Error::Aborted)
            }
        }
    }

    /// Open a connection, retrying with exponential backoff.
    ///
    /// The entry is removed while backing off, so the slot is free for
    /// others; if the pool is full by the time the delay ends, the attempt
    /// gives up with [`Opened::PoolFull`].
    async fn open(
        self: &Arc<Self>,
        id: u64,
        required: bool,
        session: &SessionParams,
        max_retries: Option<u32>,
    ) -> Result<Opened> {
        let mut attempt = 0_u32;
        loop {
            attempt += 1;
            let (delay, shutdown) = match self
                .attempt(id, required, session, attempt, max_retries)
                .await?
            {
                Attempt::Connected(conn) => return Ok(Opened::Connected(conn)),
                Attempt::Retry { delay, shutdown } => (delay, shutdown),
            };
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = shutdown.cancelled() => return Err(pool_closed()),
            }
            if !self.readmit(id)? {
                return Ok(Opened::PoolFull);
            }
        }
    }

    /// Try once to open the connecting entry `id`.
    ///
    /// On failure the entry is removed. A required entry is remembered as
    /// retrying until [`Shared::readmit`] so it is not replaced twice.
    async fn attempt(
        self: &Arc<Self>,
        id: u64,
        required: bool,
        session: &SessionParams,
        attempt: u32,
        max_retries: Option<u32>,
    ) -> Result<Attempt> {
        let (target, shutdown) = {
            let state = self.state.lock();
            match &state.target {
                Some(target) => (Arc::clone(target), state.shutdown.clone()),
                None => {
                    drop(state);
                    self.remove_entry(id);
                    return Err(pool_closed());
                }
            }
        };

        let mut conn = Connection::new(id, Arc::clone(&self.opts.observer), shutdown.child_token());
        let error = match conn.connect(&target, session).await {
            Ok(()) => return Ok(Attempt::Connected(conn)),
            Err(e) => e,
        };

        let retry = is_retryable(&error)
            && !shutdown.is_cancelled()
            && max_retries.is_none_or(|max| attempt <= max);
        {
            let mut state = self.state.lock();
            if let Some(idx) = state.position(id) {
                state.entries.remove(idx);
            }
            if retry && required {
                state.retrying.push(id);
            }
        }
        self.serve_backlog();
        if !retry {
            self.opts.observer.connect_failed(attempt, None, &error);
            return Err(error);
        }

        let delay = self.opts.retry_delay(attempt);
        self.opts.observer.connect_failed(attempt, Some(delay), &error);
        Ok(Attempt::Retry { delay, shutdown })
    }

    /// Put `id` back after a retry delay. False if the pool filled up.
    fn readmit(&self, id: u64) -> Result<bool> {
        let mut state = self.state.lock();
        state.retrying.retain(|&r| r != id);
        if state.target.is_none() {
            return Err(pool_closed());
        }
        if state.entries.len() >= self.opts.max_connections {
            tracing::debug!(connection_id = id, "pool filled up during backoff");
            return Ok(false);
        }
        state.entries.push(Entry {
            id,
            slot: Slot::Connecting,
        });
        Ok(true)
    }

    async fn open_adhoc(self: Arc<Self>, id: u64, waiter_id: u64, session: SessionParams, tx: Handoff) {
        let retries = Some(self.opts.max_adhoc_retries);
        match self.open(id, false, &session, retries).await {
            Ok(Opened::Connected(conn)) => {
                self.state.lock().set_slot(id, Slot::Busy);
                let guard = PooledConnection::new(conn, Arc::clone(&self));
                // If the caller gave up, the returned guard drops back into the pool.
                let _ = tx.send(Ok(guard));
            }
            Ok(Opened::PoolFull) => {
                let mut state = self.state.lock();
                if state.target.is_none() {
                    drop(state);
                    let _ = tx.send(Err(pool_closed()));
                    return;
                }
                // Back in line at its original arrival position.
                state.enqueue(Waiter {
                    id: waiter_id,
                    session,
                    tx,
                });
            }
            Err(e) => {
                let _ = tx.send(Err(e));
            }
        }
    }

    /// Open connections until `min_connections` exist or are retrying.
    ///
    /// Does nothing outside a tokio runtime.
    fn replenish(self: &Arc<Self>) {
        let Ok(handle) = Handle::try_current() else {
            return;
        };
        let ids: Vec<u64> = {
            let mut state = self.state.lock();
            if state.target.is_none() {
                return;
            }
            let counted = state.entries.len() + state.retrying.len();
            let missing = self
                .opts
                .min_connections
                .saturating_sub(counted)
                .min(self.opts.max_connections.saturating_sub(state.entries.len()));
            (0..missing)
                .map(|_| {
                    let id = self.next_id();
                    state.entries.push(Entry {
                        id,
                        slot: Slot::Connecting,
                    });
                    id
                })
                .collect()
        };
        for id in ids {
            tracing::debug!(connection_id = id, "opening required connection");
            self.spawn_open(&handle, id);
        }
    }

    /// Open a required connection for the connecting entry `id`.
    ///
    /// The task only holds the pool during an attempt, so a pool dropped
    /// without `close()` stops retrying.
    fn spawn_open(self: &Arc<Self>, handle: &Handle, id: u64) {
        let weak = Arc::downgrade(self);
        let retries = self.opts.max_retries;
        handle.spawn(async move {
            let session = SessionParams::default();
            let mut attempt = 0_u32;
            loop {
                attempt += 1;
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                let attempted = shared.attempt(id, true, &session, attempt, retries).await;
                let (delay, shutdown) = match attempted {
                    Ok(Attempt::Connected(conn)) => return shared.release(conn),
                    Ok(Attempt::Retry { delay, shutdown }) => (delay, shutdown),
                    Err(e) => {
                        tracing::warn!(connection_id = id, error = %e, "required connection abandoned");
                        return;
                    }
                };
                drop(shared);

                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = shutdown.cancelled() => return,
                }
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                if !matches!(shared.readmit(id), Ok(true)) {
                    return;
                }
            }
        });
    }

    /// Return a connection after use: hand it to the oldest waiter or park it.
    fn release(self: &Arc<Self>, mut conn: Connection) {
        if !conn.is_reusable() {
            // Closed connections are only removed; open ones were left mid-command
            // or inside a transaction.
            self.discard(conn, CloseReason::Abandoned);
            return;
        }

        loop {
            let waiter = {
                let mut state = self.state.lock();
                if state.target.is_none() || state.position(conn.id()).is_none() {
                    drop(state);
                    conn.close(CloseReason::PoolClosed);
                    return;
                }
                match state.pop_waiter() {
                    Some(waiter) => waiter,
                    None => {
                        let timer = self.idle_timer(conn.id());
                        let id = conn.id();
                        state.set_slot(id, Slot::Idle { conn, timer });
                        return;
                    }
                }
            };

            // Sent outside the lock: a late-dropped receiver drops the guard
            // and re-enters `release`.
            tracing::trace!(connection_id = conn.id(), "handing connection to waiter");
            let guard = PooledConnection::new(conn, Arc::clone(self));
            match waiter.tx.send(Ok(guard)) {
                Ok(()) => return,
                Err(Ok(guard)) => conn = guard.into_inner(),
                Err(Err(_)) => return,
            }
        }
    }

    fn idle_timer(self: &Arc<Self>, id: u64) -> Option<AbortHandle> {
        let handle = Handle::try_current().ok()?;
        let weak: Weak<Self> = Arc::downgrade(self);
        let timeout = self.opts.idle_timeout;
        let task = handle.spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(shared) = weak.upgrade() {
                shared.expire_idle(id);
            }
        });
        Some(task.abort_handle())
    }

    fn expire_idle(self: &Arc<Self>, id: u64) {
        let slot = {
            let mut state = self.state.lock();
            let Some(idx) = state
                .entries
                .iter()
                .position(|e| e.id == id && matches!(e.slot, Slot::Idle { .. }))
            else {
                return;
            };
            state.entries.remove(idx).slot
        };
        if let Slot::Idle { mut conn, .. } = slot {
            conn.close(CloseReason::IdleTimeout);
        }
        self.serve_backlog();
        self.replenish();
    }

    /// Drop a connection from the pool, replacing it if the pool falls
    /// below `min_connections`.
    fn discard(self: &Arc<Self>, mut conn: Connection, reason: CloseReason) {
        let removed = self.remove_entry(conn.id()).is_some();
        conn.close(reason);
        if removed {
            // Capacity freed: the oldest waiter may open its own connection.
            self.serve_backlog();
            self.replenish();
        }
    }

    /// Start a connection for the oldest waiter if there is spare capacity.
    fn serve_backlog(self: &Arc<Self>) {
        let Ok(handle) = Handle::try_current() else {
            return;
        };
        let mut state = self.state.lock();
        if state.target.is_none() || state.entries.len() >= self.opts.max_connections {
            return;
        }
        let Some(waiter) = state.pop_waiter() else {
            return;
        };
        let id = self.next_id();
        state.entries.push(Entry {
            id,
            slot: Slot::Connecting,
        });
        drop(state);
        let shared = Arc::clone(self);
        handle.spawn(async move {
            shared
                .open_adhoc(id, waiter.id, waiter.session, waiter.tx)
                .await;
        });
    }

    fn close(&self) {
        let (entries, backlog) = {
            let mut state = self.state.lock();
            if state.target.is_none() && state.entries.is_empty() && state.backlog.is_empty() {
                return;
            }
            state.target = None;
            state.shutdown.cancel();
            state.retrying.clear();
            (
                std::mem::take(&mut state.entries),
                std::mem::take(&mut state.backlog),
            )
        };

        tracing::debug!(
            connections = entries.len(),
            waiters = backlog.len(),
            "closing pool"
        );
        for waiter in backlog {
            let _ = waiter.tx.send(Err(pool_closed()));
        }
        for entry in entries {
            if let Slot::Idle { mut conn, timer } = entry.slot {
                if let Some(timer) = timer {
                    timer.abort();
                }
                conn.close(CloseReason::PoolClosed);
            }
        }
    }
}

/// A checked-out connection. Returned to the pool on drop.
pub struct PooledConnection {
    conn: ManuallyDrop<Connection>,
    pool: ManuallyDrop<Arc<Shared>>,
}

impl PooledConnection {
    fn new(conn: Connection, pool: Arc<Shared>) -> Self {
        Self {
            conn: ManuallyDrop::new(conn),
            pool: ManuallyDrop::new(pool),
        }
    }

    /// Take the connection out without returning it to the pool.
    fn into_inner(self) -> Connection {
        let mut this = ManuallyDrop::new(self);
        // SAFETY: `this` is never dropped, so `pool` is dropped exactly once here.
        unsafe { ManuallyDrop::drop(&mut this.pool) };
        // SAFETY: as above, `conn` is taken exactly once.
        unsafe { ManuallyDrop::take(&mut this.conn) }
    }
}

impl Deref for PooledConnection {
    type Target = Connection;
    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.conn
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        // SAFETY: conn and pool are never accessed after this
        let conn = unsafe { ManuallyDrop::take(&mut self.conn) };
        // SAFETY: as above
        let pool = unsafe { ManuallyDrop::take(&mut self.pool) };
        pool.release(conn);
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PooledConnection").field(&*self.conn).finish()
    }
}
