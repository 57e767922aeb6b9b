//! Native connection handle.
//!
//! [`RawConn`] is a one-command-at-a-time protocol handle with a libpq-shaped
//! interface: sending never blocks, [`RawConn::flush`] reports whether bytes
//! remain, [`RawConn::consume_input`] reads whatever the socket has, and
//! [`RawConn::get_result`] hands out completed results until the command is
//! done. Waiting is left to the caller through [`RawConn::readable`] and
//! [`RawConn::writable`].

mod cancel;
pub mod escape;
pub mod result;
mod socket;

use std::collections::VecDeque;
use std::io;

use crate::buffer_pool::{GLOBAL_BUFFER_POOL, PooledBufferSet};
use crate::error::{Error, ErrorFields, Result};
use crate::opts::Opts;
use crate::protocol::backend::{ErrorResponse, RawMessage, msg_type};
use crate::protocol::frontend::{
    write_bind, write_describe_portal, write_execute, write_parse, write_query, write_sync,
    write_terminate,
};
use crate::protocol::types::TransactionStatus;
use crate::state::{Action, AsyncMessage, ConnectionStateMachine, QueryStateMachine};

pub use cancel::CancelToken;
pub use crate::state::Notification;
pub use escape::{escape_identifier, escape_literal};
pub use result::{Field, PgResult, ResultStatus};

use socket::{Socket, Target};

const READ_CHUNK: usize = 8192;

/// A single PostgreSQL protocol connection.
pub struct RawConn {
    socket: Socket,
    target: Target,
    buffers: PooledBufferSet,
    backend_key: Option<(u32, u32)>,
    server_params: Vec<(String, String)>,
    transaction_status: TransactionStatus,
    query: Option<QueryStateMachine>,
    notifies: VecDeque<Notification>,
    notices: VecDeque<ErrorFields>,
    eof: bool,
    broken: bool,
}

impl RawConn {
    /// Connect and run the startup exchange.
    pub async fn connect(opts: &Opts) -> Result<Self> {
        let mut state_machine = ConnectionStateMachine::new(opts)?;
        let target = Target::from_opts(opts)?;
        let socket = Socket::connect(&target).await?;

        let mut conn = Self {
            socket,
            target,
            buffers: GLOBAL_BUFFER_POOL.get_buffer_set(),
            backend_key: None,
            server_params: Vec::new(),
            transaction_status: TransactionStatus::Idle,
            query: None,
            notifies: VecDeque::new(),
            notices: VecDeque::new(),
            eof: false,
            broken: false,
        };

        let mut action = state_machine.start(&mut conn.buffers.write_buffer);
        loop {
            match action {
                Action::Write => {
                    conn.flush_all().await?;
                    action = conn.step_startup(&mut state_machine).await?;
                }
                Action::ReadMessage => {
                    action = conn.step_startup(&mut state_machine).await?;
                }
                Action::HandleAsyncMessageAndReadMessage(msg) => {
                    conn.handle_async(msg);
                    action = conn.step_startup(&mut state_machine).await?;
                }
                Action::Finished => break,
            }
        }

        conn.backend_key = state_machine
            .backend_key()
            .map(|key| (key.process_id(), key.secret()));
        conn.server_params = state_machine.take_server_params();
        conn.transaction_status = state_machine.transaction_status();
        Ok(conn)
    }

    async fn step_startup(&mut self, state_machine: &mut ConnectionStateMachine) -> Result<Action> {
        loop {
            let buffers = &mut *self.buffers;
            if let Some((msg, used)) = RawMessage::split_from(&buffers.read_buffer[buffers.read_pos..])? {
                let action = state_machine.step(&msg, &mut buffers.write_buffer);
                buffers.read_pos += used;
                return action;
            }
            self.fill().await?;
        }
    }

    /// Wait until at least one byte was read.
    async fn fill(&mut self) -> Result<()> {
        loop {
            self.socket.readable().await?;
            if self.read_available()? > 0 {
                return Ok(());
            }
        }
    }

    /// Read everything the socket has without blocking.
    fn read_available(&mut self) -> Result<usize> {
        if self.eof {
            self.broken = true;
            return Err(Error::ConnectionClosed);
        }

        let buffers = &mut *self.buffers;
        buffers.compact();
        let mut total = 0;
        loop {
            let len = buffers.read_buffer.len();
            buffers.read_buffer.resize(len + READ_CHUNK, 0);
            let result = self.socket.try_read(&mut buffers.read_buffer[len..]);
            match result {
                Ok(0) => {
                    buffers.read_buffer.truncate(len);
                    self.eof = true;
                    if total > 0 {
                        return Ok(total);
                    }
                    self.broken = true;
                    return Err(Error::ConnectionClosed);
                }
                Ok(n) => {
                    buffers.read_buffer.truncate(len + n);
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    buffers.read_buffer.truncate(len);
                    return Ok(total);
                }
                Err(e) => {
                    buffers.read_buffer.truncate(len);
                    self.broken = true;
                    return Err(e.into());
                }
            }
        }
    }

    fn begin(&mut self) -> Result<()> {
        if self.broken {
            return Err(Error::ConnectionClosed);
        }
        if self.query.is_some() {
            return Err(Error::Connection(
                "another command is already in progress".into(),
            ));
        }
        Ok(())
    }

    /// Queue a simple-protocol query. The text may hold several commands.
    pub fn send_query(&mut self, sql: &str) -> Result<()> {
        self.begin()?;
        write_query(&mut self.buffers.write_buffer, sql);
        self.query = Some(QueryStateMachine::new(false));
        Ok(())
    }

    /// Queue a single command with text-format parameters (`$1`, `$2`, ...).
    pub fn send_query_params(&mut self, sql: &str, params: &[Option<String>]) -> Result<()> {
        self.begin()?;
        let buf = &mut self.buffers.write_buffer;
        let start = buf.len();
        let written = write_parse(buf, "", sql, &[]).and_then(|()| write_bind(buf, "", "", params));
        if let Err(e) = written {
            buf.truncate(start);
            return Err(e);
        }
        write_describe_portal(buf, "");
        write_execute(buf, "", 0);
        write_sync(buf);
        self.query = Some(QueryStateMachine::new(false));
        Ok(())
    }

    /// Deliver rows of the current command one result at a time.
    ///
    /// Returns false if no command is in progress or rows already arrived.
    pub fn set_single_row_mode(&mut self) -> bool {
        self.query
            .as_mut()
            .is_some_and(QueryStateMachine::set_single_row)
    }

    /// Try to send queued bytes. Returns true while bytes remain.
    pub fn flush(&mut self) -> Result<bool> {
        let buffers = &mut *self.buffers;
        while buffers.has_pending_write() {
            let result = self
                .socket
                .try_write(&buffers.write_buffer[buffers.write_pos..]);
            match result {
                Ok(0) => {
                    self.broken = true;
                    return Err(io::Error::from(io::ErrorKind::WriteZero).into());
                }
                Ok(n) => buffers.write_pos += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(true),
                Err(e) => {
                    self.broken = true;
                    return Err(e.into());
                }
            }
        }
        buffers.write_buffer.clear();
        buffers.write_pos = 0;
        Ok(false)
    }

    /// Flush, waiting for writability as often as needed.
    pub async fn flush_all(&mut self) -> Result<()> {
        while self.flush()? {
            self.writable().await?;
        }
        Ok(())
    }

    /// Wait until the socket may accept more bytes.
    pub async fn writable(&self) -> Result<()> {
        Ok(self.socket.writable().await?)
    }

    /// Wait until the socket has bytes to read (or hit EOF).
    pub async fn readable(&self) -> Result<()> {
        if self.eof {
            return Ok(());
        }
        Ok(self.socket.readable().await?)
    }

    /// Read available input and parse every complete message.
    pub fn consume_input(&mut self) -> Result<()> {
        let read = self.read_available();
        // Messages that arrived before EOF are still processed.
        self.process_input()?;
        read.map(|_| ())
    }

    fn process_input(&mut self) -> Result<()> {
        loop {
            let buffers = &mut *self.buffers;
            let Some((msg, used)) = RawMessage::split_from(&buffers.read_buffer[buffers.read_pos..])? else {
                return Ok(());
            };

            let active = self.query.as_mut().filter(|q| !q.is_finished());
            let action = match active {
                Some(query) => query.step(&msg),
                None if RawMessage::is_async_type(msg.type_byte) => AsyncMessage::parse(&msg)
                    .map(Action::HandleAsyncMessageAndReadMessage),
                None if msg.type_byte == msg_type::ERROR_RESPONSE => {
                    // e.g. admin_shutdown: the server is about to hang up.
                    self.broken = true;
                    Err(ErrorResponse::parse(msg.payload)?.into_error())
                }
                None => Err(Error::Protocol(format!(
                    "Unexpected message while idle: '{}'",
                    msg.type_byte as char
                ))),
            };
            buffers.read_pos += used;

            match action {
                Ok(Action::HandleAsyncMessageAndReadMessage(async_msg)) => {
                    self.handle_async(async_msg)
                }
                Ok(_) => {}
                Err(e) => {
                    self.broken = true;
                    return Err(e);
                }
            }
        }
    }

    fn handle_async(&mut self, msg: AsyncMessage) {
        match msg {
            AsyncMessage::Notification(n) => self.notifies.push_back(n),
            AsyncMessage::Notice(fields) => self.notices.push_back(fields),
            AsyncMessage::ParameterChanged { name, value } => {
                match self.server_params.iter_mut().find(|(n, _)| *n == name) {
                    Some(entry) => entry.1 = value,
                    None => self.server_params.push((name, value)),
                }
            }
        }
    }

    /// True if a command is in progress and no result is ready yet.
    pub fn is_busy(&self) -> bool {
        self.query
            .as_ref()
            .is_some_and(|q| !q.has_result() && !q.is_finished())
    }

    /// Next completed result of the current command.
    ///
    /// Returns `None` once the command finished; the connection then
    /// accepts a new command. Call only when [`RawConn::is_busy`] is false.
    pub fn get_result(&mut self) -> Option<PgResult> {
        let query = self.query.as_mut()?;
        if let Some(result) = query.pop_result() {
            return Some(result);
        }
        if query.is_finished() {
            self.transaction_status = query.transaction_status();
            self.query = None;
        }
        None
    }

    /// True while a command has been sent and not completely read.
    pub fn in_progress(&self) -> bool {
        self.query.is_some()
    }

    /// Pop a pending LISTEN/NOTIFY notification.
    pub fn notifies(&mut self) -> Option<Notification> {
        self.notifies.pop_front()
    }

    /// Pop a pending notice.
    pub fn take_notice(&mut self) -> Option<ErrorFields> {
        self.notices.pop_front()
    }

    /// Quote a SQL literal.
    pub fn escape_literal(&self, text: &str) -> String {
        escape_literal(text)
    }

    /// Quote a SQL identifier.
    pub fn escape_identifier(&self, name: &str) -> String {
        escape_identifier(name)
    }

    /// Token for cancelling the running command from elsewhere.
    pub fn cancel_token(&self) -> Option<CancelToken> {
        self.backend_key.map(|(pid, secret)| CancelToken {
            target: self.target.clone(),
            pid,
            secret,
        })
    }

    /// Backend process ID, if the server sent one.
    pub fn backend_pid(&self) -> Option<u32> {
        self.backend_key.map(|(pid, _)| pid)
    }

    /// Server parameter reported by ParameterStatus.
    pub fn server_param(&self, name: &str) -> Option<&str> {
        self.server_params
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Transaction status after the last completed command.
    pub fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }

    /// True after an I/O failure, EOF or protocol violation.
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Send Terminate without waiting. The socket closes on drop.
    pub fn terminate(&mut self) {
        if self.broken {
            return;
        }
        let buffers = &mut *self.buffers;
        buffers.write_buffer.clear();
        buffers.write_pos = 0;
        write_terminate(&mut buffers.write_buffer);
        let _ = self.flush();
        self.broken = true;
    }
}

impl std::fmt::Debug for RawConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawConn")
            .field("target", &self.target)
            .field("backend_pid", &self.backend_pid())
            .field("in_progress", &self.in_progress())
            .field("broken", &self.broken)
            .finish_non_exhaustive()
    }
}
