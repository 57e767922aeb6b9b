//! In-process PostgreSQL stand-in for integration tests.
//!
//! Speaks enough of the v3 protocol for the client: trust authentication,
//! simple and unnamed extended queries, cancel requests and a handful of
//! recognizable statements:
//!
//! - `SELECT pg_sleep(s)` sleeps, honoring cancel requests
//! - `SELECT generate_series(a, b)` returns `b - a + 1` int4 rows
//! - `SELECT fail_after(n)` returns `n` rows, then division by zero
//! - `SELECT set_config('k', 'v', false), ...`, `RESET ALL`,
//!   `SELECT current_setting('k')`
//! - `BEGIN`, `COMMIT`, `ROLLBACK`
//! - `SELECT pg_terminate_backend(pg_backend_pid())` hangs up
//! - anything mentioning `missing_table` fails with 42P01
//! - `SELECT <literal>, ...` echoes literals, with optional `::type` casts

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use pg_nano::protocol::codec::MessageBuilder;
use pg_nano::protocol::types::oid;
use pg_nano::{Oid, Opts, SslMode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const PROTOCOL_3_0: i32 = 196_608;
const CANCEL_REQUEST: i32 = 80_877_102;
const SSL_REQUEST: i32 = 80_877_103;
const VOID: Oid = 2278;

#[derive(Default)]
struct ServerState {
    next_pid: AtomicU32,
    open: AtomicUsize,
    total: AtomicUsize,
    refuse: AtomicUsize,
    cancels: AtomicUsize,
    running: Mutex<HashMap<u32, CancellationToken>>,
    statements: Mutex<Vec<String>>,
}

pub struct FakeServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
    task: JoinHandle<()>,
}

impl FakeServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(ServerState::default());
        let accept_state = Arc::clone(&state);
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let state = Arc::clone(&accept_state);
                tokio::spawn(async move {
                    let _ = handle(stream, state).await;
                });
            }
        });
        Self { addr, state, task }
    }

    pub fn url(&self) -> String {
        format!(
            "postgres://tester@127.0.0.1:{}/app?sslmode=disable",
            self.addr.port()
        )
    }

    pub fn opts(&self) -> Opts {
        Opts {
            host: "127.0.0.1".into(),
            port: self.addr.port(),
            user: "tester".into(),
            database: Some("app".into()),
            ssl_mode: SslMode::Disable,
            ..Opts::default()
        }
    }

    /// Sessions currently connected.
    pub fn open_sessions(&self) -> usize {
        self.state.open.load(Ordering::SeqCst)
    }

    /// Sessions ever accepted, including refused ones.
    pub fn total_sessions(&self) -> usize {
        self.state.total.load(Ordering::SeqCst)
    }

    /// Reject the next `n` startups with SQLSTATE 53300.
    pub fn refuse_next(&self, n: usize) {
        self.state.refuse.store(n, Ordering::SeqCst);
    }

    pub fn cancel_requests(&self) -> usize {
        self.state.cancels.load(Ordering::SeqCst)
    }

    /// Every statement executed so far, in arrival order.
    pub fn statements(&self) -> Vec<String> {
        self.state.statements.lock().clone()
    }
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct Session {
    pid: u32,
    settings: HashMap<String, String>,
    transaction: u8,
    state: Arc<ServerState>,
    out: Vec<u8>,
}

enum Outcome {
    Rows {
        columns: Vec<(String, Oid)>,
        rows: Vec<Vec<Option<String>>>,
        tag: String,
        fail: Option<(String, String)>,
    },
    Command(String),
    Error(String, String),
    Empty,
    Terminate,
}

async fn read_startup(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let len = stream.read_i32().await?;
    let mut body = vec![0; usize::try_from(len - 4).unwrap_or_default()];
    stream.read_exact(&mut body).await?;
    Ok(body)
}

async fn handle(mut stream: TcpStream, state: Arc<ServerState>) -> std::io::Result<()> {
    let mut body = read_startup(&mut stream).await?;
    let mut code = i32::from_be_bytes([body[0], body[1], body[2], body[3]]);
    if code == SSL_REQUEST {
        stream.write_all(b"N").await?;
        body = read_startup(&mut stream).await?;
        code = i32::from_be_bytes([body[0], body[1], body[2], body[3]]);
    }

    if code == CANCEL_REQUEST {
        let pid = u32::from_be_bytes([body[4], body[5], body[6], body[7]]);
        state.cancels.fetch_add(1, Ordering::SeqCst);
        if let Some(token) = state.running.lock().get(&pid) {
            token.cancel();
        }
        return Ok(());
    }
    assert_eq!(code, PROTOCOL_3_0, "unexpected startup code");
    state.total.fetch_add(1, Ordering::SeqCst);

    let refused = state
        .refuse
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    if refused {
        let mut out = Vec::new();
        error_response(&mut out, "FATAL", "53300", "sorry, too many clients already");
        stream.write_all(&out).await?;
        return Ok(());
    }

    let pid = state.next_pid.fetch_add(1, Ordering::SeqCst) + 1000;
    let mut session = Session {
        pid,
        settings: HashMap::new(),
        transaction: b'I',
        state: Arc::clone(&state),
        out: Vec::new(),
    };
    session.greet();
    stream.write_all(&session.out).await?;
    session.out.clear();

    state.open.fetch_add(1, Ordering::SeqCst);
    let result = session.serve(&mut stream).await;
    state.open.fetch_sub(1, Ordering::SeqCst);
    state.running.lock().remove(&pid);
    result
}

impl Session {
    fn greet(&mut self) {
        let mut msg = MessageBuilder::new(&mut self.out, b'R');
        msg.write_i32(0);
        msg.finish();

        let mut msg = MessageBuilder::new(&mut self.out, b'K');
        msg.write_u32(self.pid);
        msg.write_u32(self.pid.wrapping_mul(7));
        msg.finish();

        for (name, value) in [("server_version", "16.0"), ("client_encoding", "UTF8")] {
            let mut msg = MessageBuilder::new(&mut self.out, b'S');
            msg.write_cstr(name);
            msg.write_cstr(value);
            msg.finish();
        }
        self.ready();
    }

    fn ready(&mut self) {
        let mut msg = MessageBuilder::new(&mut self.out, b'Z');
        msg.write_u8(self.transaction);
        msg.finish();
    }

    async fn serve(&mut self, stream: &mut TcpStream) -> std::io::Result<()> {
        let mut pending: Option<Outcome> = None;
        let mut skip_to_sync = false;
        loop {
            let Ok(kind) = stream.read_u8().await else {
                return Ok(());
            };
            let len = stream.read_i32().await?;
            let mut payload = vec![0; usize::try_from(len - 4).unwrap_or_default()];
            stream.read_exact(&mut payload).await?;

            match kind {
                b'Q' => {
                    let sql = cstr(&payload).0;
                    if self.simple_query(&sql).await {
                        stream.write_all(&self.out).await?;
                        return Ok(());
                    }
                    self.ready();
                }
                b'P' if !skip_to_sync => {
                    let (_, rest) = cstr(&payload);
                    let (sql, _) = cstr(rest);
                    self.statements_push(&sql);
                    pending = Some(Outcome::Command(sql));
                    simple(&mut self.out, b'1');
                }
                b'B' if !skip_to_sync => {
                    let params = bind_params(&payload);
                    let sql = match pending.take() {
                        Some(Outcome::Command(sql)) => substitute(&sql, &params),
                        _ => String::new(),
                    };
                    pending = Some(self.run(&sql).await);
                    simple(&mut self.out, b'2');
                }
                b'D' if !skip_to_sync => match &pending {
                    Some(Outcome::Rows { columns, .. }) => {
                        let columns = columns.clone();
                        row_description(&mut self.out, &columns);
                    }
                    _ => simple(&mut self.out, b'n'),
                },
                b'E' if !skip_to_sync => {
                    if let Some(outcome) = pending.take() {
                        let (failed, terminate) = self.emit(outcome, false);
                        if terminate {
                            stream.write_all(&self.out).await?;
                            return Ok(());
                        }
                        skip_to_sync = failed;
                    }
                }
                b'S' => {
                    skip_to_sync = false;
                    pending = None;
                    self.ready();
                }
                b'X' => return Ok(()),
                _ => {}
            }
            if !self.out.is_empty() {
                stream.write_all(&self.out).await?;
                self.out.clear();
            }
        }
    }

    fn statements_push(&self, sql: &str) {
        self.state.statements.lock().push(sql.to_string());
    }

    /// Returns true if the session must hang up.
    async fn simple_query(&mut self, sql: &str) -> bool {
        let statements = split_statements(sql);
        if statements.is_empty() {
            simple(&mut self.out, b'I');
            return false;
        }
        for statement in statements {
            self.statements_push(&statement);
            let outcome = self.run(&statement).await;
            let (failed, terminate) = self.emit(outcome, true);
            if terminate {
                return true;
            }
            if failed {
                break;
            }
        }
        false
    }

    /// Write an outcome. Returns (failed, terminate).
    fn emit(&mut self, outcome: Outcome, describe: bool) -> (bool, bool) {
        match outcome {
            Outcome::Rows {
                columns,
                rows,
                tag,
                fail,
            } => {
                if describe {
                    row_description(&mut self.out, &columns);
                }
                for row in &rows {
                    data_row(&mut self.out, row);
                }
                match fail {
                    Some((code, message)) => {
                        self.fail(&code, &message);
                        (true, false)
                    }
                    None => {
                        command_complete(&mut self.out, &tag);
                        (false, false)
                    }
                }
            }
            Outcome::Command(tag) => {
                command_complete(&mut self.out, &tag);
                (false, false)
            }
            Outcome::Error(code, message) => {
                self.fail(&code, &message);
                (true, false)
            }
            Outcome::Empty => {
                simple(&mut self.out, b'I');
                (false, false)
            }
            Outcome::Terminate => {
                error_response(
                    &mut self.out,
                    "FATAL",
                    "57P01",
                    "terminating connection due to administrator command",
                );
                (true, true)
            }
        }
    }

    fn fail(&mut self, code: &str, message: &str) {
        if self.transaction == b'T' {
            self.transaction = b'E';
        }
        error_response(&mut self.out, "ERROR", code, message);
    }

    async fn run(&mut self, sql: &str) -> Outcome {
        let sql = sql.trim();
        if sql.is_empty() {
            return Outcome::Empty;
        }
        if sql.contains("missing_table") {
            return Outcome::Error(
                "42P01".into(),
                "relation \"missing_table\" does not exist".into(),
            );
        }
        if self.transaction == b'E' && !matches!(sql, "ROLLBACK" | "COMMIT") {
            return Outcome::Error(
                "25P02".into(),
                "current transaction is aborted, commands ignored until end of transaction block"
                    .into(),
            );
        }
        match sql {
            "BEGIN" => {
                self.transaction = b'T';
                return Outcome::Command("BEGIN".into());
            }
            "COMMIT" | "ROLLBACK" => {
                self.transaction = b'I';
                return Outcome::Command(sql.into());
            }
            "RESET ALL" => {
                self.settings.clear();
                return Outcome::Command("RESET".into());
            }
            "SELECT pg_terminate_backend(pg_backend_pid())" => return Outcome::Terminate,
            _ => {}
        }
        if let Some(args) = call_args(sql, "SELECT pg_sleep(") {
            return self.sleep(&args).await;
        }
        if let Some(args) = call_args(sql, "SELECT generate_series(") {
            let bounds: Vec<i64> = args
                .split(',')
                .filter_map(|s| s.trim().parse().ok())
                .collect();
            let rows = (bounds[0]..=bounds[1])
                .map(|n| vec![Some(n.to_string())])
                .collect::<Vec<_>>();
            return rows_outcome(vec![("generate_series".into(), oid::INT4)], rows, None);
        }
        if let Some(args) = call_args(sql, "SELECT fail_after(") {
            let n: i64 = args.trim().parse().unwrap_or_default();
            let rows = (1..=n).map(|i| vec![Some(i.to_string())]).collect();
            return rows_outcome(
                vec![("fail_after".into(), oid::INT4)],
                rows,
                Some(("22012".into(), "division by zero".into())),
            );
        }
        if sql.starts_with("SELECT set_config(") {
            return self.set_config(sql);
        }
        if let Some(rest) = sql.strip_prefix("INSERT ") {
            let count = rest.matches("),").count() + 1;
            return Outcome::Command(format!("INSERT 0 {count}"));
        }
        match sql.strip_prefix("SELECT ") {
            Some(list) => self.select_list(list),
            None => Outcome::Error("42601".into(), format!("syntax error at or near \"{sql}\"")),
        }
    }

    async fn sleep(&mut self, args: &str) -> Outcome {
        let seconds: f64 = args.trim().parse().unwrap_or_default();
        let token = CancellationToken::new();
        self.state.running.lock().insert(self.pid, token.clone());
        let cancelled = tokio::select! {
            () = tokio::time::sleep(Duration::from_secs_f64(seconds)) => false,
            () = token.cancelled() => true,
        };
        self.state.running.lock().remove(&self.pid);
        if cancelled {
            return Outcome::Error(
                "57014".into(),
                "canceling statement due to user request".into(),
            );
        }
        rows_outcome(vec![("pg_sleep".into(), VOID)], vec![vec![Some(String::new())]], None)
    }

    fn set_config(&mut self, sql: &str) -> Outcome {
        let mut columns = Vec::new();
        let mut values = Vec::new();
        for call in sql.split("set_config(").skip(1) {
            let literals = quoted_literals(call);
            if let [name, value, ..] = literals.as_slice() {
                self.settings.insert(name.clone(), value.clone());
                columns.push(("set_config".to_string(), oid::TEXT));
                values.push(Some(value.clone()));
            }
        }
        rows_outcome(columns, vec![values], None)
    }

    fn select_list(&self, list: &str) -> Outcome {
        let mut columns = Vec::new();
        let mut values = Vec::new();
        for item in split_top_level(list, ',') {
            let (expr, name) = match item.rsplit_once(" AS ") {
                Some((expr, name)) => (expr.trim(), name.trim().to_string()),
                None => (item.trim(), "?column?".to_string()),
            };
            match self.literal(expr) {
                Some((type_oid, value)) => {
                    columns.push((name, type_oid));
                    values.push(value);
                }
                None => {
                    return Outcome::Error(
                        "42703".into(),
                        format!("column \"{expr}\" does not exist"),
                    );
                }
            }
        }
        rows_outcome(columns, vec![values], None)
    }

    fn literal(&self, expr: &str) -> Option<(Oid, Option<String>)> {
        let (expr, cast) = match split_cast(expr) {
            Some((expr, cast)) => (expr, Some(cast)),
            None => (expr, None),
        };
        let expr = expr.trim();
        let (default_oid, value) = if expr == "NULL" {
            (oid::TEXT, None)
        } else if expr == "true" || expr == "false" {
            (oid::BOOL, Some(expr[..1].to_string()))
        } else if expr == "pg_backend_pid()" {
            (oid::INT4, Some(self.pid.to_string()))
        } else if let Some(name) = call_args(expr, "current_setting(") {
            let name = quoted_literals(&name).into_iter().next()?;
            (oid::TEXT, Some(self.settings.get(&name).cloned().unwrap_or_default()))
        } else if expr.starts_with('\'') || expr.starts_with("E'") {
            (oid::UNKNOWN, Some(unquote(expr)?))
        } else {
            let number = expr.trim_start_matches('(').trim_end_matches(')');
            if number.parse::<i32>().is_ok() {
                (oid::INT4, Some(number.to_string()))
            } else if number.parse::<i64>().is_ok() {
                (oid::INT8, Some(number.to_string()))
            } else if number.parse::<f64>().is_ok() {
                (oid::NUMERIC, Some(number.to_string()))
            } else {
                return None;
            }
        };
        let type_oid = match cast {
            Some(cast) => cast_oid(cast)?,
            None if default_oid == oid::UNKNOWN => oid::TEXT,
            None => default_oid,
        };
        Some((type_oid, value))
    }
}

fn rows_outcome(
    columns: Vec<(String, Oid)>,
    rows: Vec<Vec<Option<String>>>,
    fail: Option<(String, String)>,
) -> Outcome {
    let tag = format!("SELECT {}", rows.len());
    Outcome::Rows {
        columns,
        rows,
        tag,
        fail,
    }
}

fn cast_oid(cast: &str) -> Option<Oid> {
    Some(match cast {
        "text" => oid::TEXT,
        "int4" | "integer" => oid::INT4,
        "int8" | "bigint" => oid::INT8,
        "float8" => oid::FLOAT8,
        "bool" => oid::BOOL,
        "bytea" => oid::BYTEA,
        "date" => oid::DATE,
        "timestamptz" => oid::TIMESTAMPTZ,
        "interval" => oid::INTERVAL,
        "json" => oid::JSON,
        "jsonb" => oid::JSONB,
        "int4[]" => oid::INT4_ARRAY,
        "int8[]" => oid::INT8_ARRAY,
        "text[]" => oid::TEXT_ARRAY,
        "int4range" => oid::INT4RANGE,
        "record" => oid::RECORD,
        _ => return None,
    })
}

/// Split `expr::type` outside of quotes.
fn split_cast(expr: &str) -> Option<(&str, &str)> {
    let mut quoted = false;
    let bytes = expr.as_bytes();
    for i in 0..bytes.len() {
        match bytes[i] {
            b'\'' => quoted = !quoted,
            b':' if !quoted && bytes.get(i + 1) == Some(&b':') => {
                return Some((&expr[..i], &expr[i + 2..]));
            }
            _ => {}
        }
    }
    None
}

/// Undo literal quoting: `'it''s'` and ` E'a\\b'`.
fn unquote(expr: &str) -> Option<String> {
    let (escaped, body) = match expr.strip_prefix("E'") {
        Some(body) => (true, body),
        None => (false, expr.strip_prefix('\'')?),
    };
    let body = body.strip_suffix('\'')?;
    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars();
    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                chars.next();
                out.push('\'');
            }
            '\\' if escaped => out.extend(chars.next()),
            c => out.push(c),
        }
    }
    Some(out)
}

/// Every `'...'` literal in `text`, unquoted.
fn quoted_literals(text: &str) -> Vec<String> {
    let mut literals = Vec::new();
    let mut current: Option<String> = None;
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match (&mut current, c) {
            (None, '\'') => current = Some(String::new()),
            (Some(s), '\'') if chars.peek() == Some(&'\'') => {
                chars.next();
                s.push('\'');
            }
            (Some(_), '\'') => literals.extend(current.take()),
            (Some(s), c) => s.push(c),
            (None, _) => {}
        }
    }
    literals
}

/// Arguments of `prefix...)` when `sql` is exactly that call.
fn call_args(sql: &str, prefix: &str) -> Option<String> {
    sql.strip_prefix(prefix)?
        .strip_suffix(')')
        .map(str::to_string)
}

fn split_statements(sql: &str) -> Vec<String> {
    split_top_level(sql, ';')
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Split on `sep` outside of quotes and parentheses.
fn split_top_level(text: &str, sep: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut depth = 0_i32;
    for c in text.chars() {
        match c {
            '\'' => quoted = !quoted,
            '(' if !quoted => depth += 1,
            ')' if !quoted => depth -= 1,
            c if c == sep && !quoted && depth == 0 => {
                parts.push(std::mem::take(&mut current));
                continue;
            }
            _ => {}
        }
        current.push(c);
    }
    parts.push(current);
    parts
}

/// Replace `$n` with quoted parameter literals, highest index first.
fn substitute(sql: &str, params: &[Option<String>]) -> String {
    let mut sql = sql.to_string();
    for (i, param) in params.iter().enumerate().rev() {
        let literal = match param {
            Some(text) => format!("'{}'", text.replace('\'', "''")),
            None => "NULL".to_string(),
        };
        sql = sql.replace(&format!("${}", i + 1), &literal);
    }
    sql
}

fn cstr(data: &[u8]) -> (String, &[u8]) {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    let text = String::from_utf8_lossy(&data[..end]).into_owned();
    (text, data.get(end + 1..).unwrap_or_default())
}

fn bind_params(payload: &[u8]) -> Vec<Option<String>> {
    let (_, rest) = cstr(payload);
    let (_, mut rest) = cstr(rest);
    let formats = i16::from_be_bytes([rest[0], rest[1]]) as usize;
    rest = &rest[2 + formats * 2..];
    let count = i16::from_be_bytes([rest[0], rest[1]]) as usize;
    rest = &rest[2..];
    let mut params = Vec::with_capacity(count);
    for _ in 0..count {
        let len = i32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]);
        rest = &rest[4..];
        if len < 0 {
            params.push(None);
        } else {
            let len = len as usize;
            params.push(Some(String::from_utf8_lossy(&rest[..len]).into_owned()));
            rest = &rest[len..];
        }
    }
    params
}

fn simple(out: &mut Vec<u8>, kind: u8) {
    MessageBuilder::new(out, kind).finish();
}

fn row_description(out: &mut Vec<u8>, columns: &[(String, Oid)]) {
    let mut msg = MessageBuilder::new(out, b'T');
    msg.write_i16(columns.len() as i16);
    for (name, type_oid) in columns {
        msg.write_cstr(name);
        msg.write_u32(0);
        msg.write_i16(0);
        msg.write_u32(*type_oid);
        msg.write_i16(-1);
        msg.write_i32(-1);
        msg.write_i16(0);
    }
    msg.finish();
}

fn data_row(out: &mut Vec<u8>, values: &[Option<String>]) {
    let mut msg = MessageBuilder::new(out, b'D');
    msg.write_i16(values.len() as i16);
    for value in values {
        match value {
            Some(v) => {
                msg.write_i32(v.len() as i32);
                msg.write_bytes(v.as_bytes());
            }
            None => msg.write_i32(-1),
        }
    }
    msg.finish();
}

fn command_complete(out: &mut Vec<u8>, tag: &str) {
    let mut msg = MessageBuilder::new(out, b'C');
    msg.write_cstr(tag);
    msg.finish();
}

fn error_response(out: &mut Vec<u8>, severity: &str, code: &str, message: &str) {
    let mut msg = MessageBuilder::new(out, b'E');
    for (field, value) in [(b'S', severity), (b'V', severity), (b'C', code), (b'M', message)] {
        msg.write_u8(field);
        msg.write_cstr(value);
    }
    msg.write_u8(0);
    msg.finish();
}
