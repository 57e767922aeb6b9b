//! Lazily executed queries.
//!
//! A [`Query`] does nothing until it is awaited or streamed. Its shape type
//! decides what awaiting it produces and how many rows it may return.

use std::future::{Future, IntoFuture};
use std::marker::PhantomData;
use std::panic::Location;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_core::future::BoxFuture;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::connection::{Connection, check_results};
use crate::error::{Error, Result};
use crate::pool::Pool;
use crate::raw::{Field, PgResult, ResultStatus};
use crate::row::Row;
use crate::session::SessionParams;
use crate::template::{SqlTemplate, render};
use crate::value::{FromValue, Value, encode_to_string};

/// Rows buffered between the connection task and a [`RowStream`].
const STREAM_BUFFER: usize = 64;

/// How many rows a shape accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expect {
    Any,
    ZeroOrOne,
    ExactlyOne,
}

impl Expect {
    /// Check a row count. `done` is false while more rows may follow.
    fn check(self, count: usize, done: bool) -> Result<()> {
        match self {
            Expect::ZeroOrOne | Expect::ExactlyOne if count > 1 => {
                Err(Error::Contract(format!("expected at most one row, got {count}")))
            }
            Expect::ExactlyOne if done && count == 0 => {
                Err(Error::Contract("expected exactly one row, got none".into()))
            }
            _ => Ok(()),
        }
    }
}

/// The result of one SQL command.
#[derive(Debug, Clone)]
pub struct QueryResult {
    /// Command tag, e.g. `INSERT 0 3`.
    pub command: Option<String>,
    /// Rows affected or returned, from the command tag.
    pub rows_affected: Option<u64>,
    pub columns: Arc<[Field]>,
    pub rows: Vec<Row>,
}

/// Decides what a [`Query`] resolves to.
pub trait Shape: Send + 'static {
    /// Awaited result.
    type Output: Send + 'static;
    /// Streamed item.
    type Item: Send + 'static;
    const EXPECT: Expect;

    fn finish(results: Vec<PgResult>) -> Result<Self::Output>;
    fn item(row: Row) -> Result<Self::Item>;
}

fn all_rows(results: Vec<PgResult>) -> Vec<Row> {
    results
        .into_iter()
        .filter(|r| matches!(r.status(), ResultStatus::TuplesOk | ResultStatus::SingleTuple))
        .flat_map(Row::from_result)
        .collect()
}

fn checked_rows(results: Vec<PgResult>, expect: Expect) -> Result<Vec<Row>> {
    let rows = all_rows(results);
    expect.check(rows.len(), true)?;
    Ok(rows)
}

fn single_value<T: FromValue>(row: &Row) -> Result<T> {
    if row.len() != 1 {
        return Err(Error::Contract(format!(
            "expected exactly one column, got {}",
            row.len()
        )));
    }
    row.get(0)
}

/// Shape markers.
pub mod shape {
    use super::*;

    /// Every result of every command.
    #[derive(Debug)]
    pub struct Full;

    /// All rows.
    #[derive(Debug)]
    pub struct RowList;

    /// The only column of every row.
    #[derive(Debug)]
    pub struct ValueList<T>(PhantomData<fn() -> T>);

    /// At most one row.
    #[derive(Debug)]
    pub struct RowOrNull;

    /// Exactly one row.
    #[derive(Debug)]
    pub struct SingleRow;

    /// The only column of at most one row.
    #[derive(Debug)]
    pub struct ValueOrNull<T>(PhantomData<fn() -> T>);

    /// The only column of exactly one row.
    #[derive(Debug)]
    pub struct SingleValue<T>(PhantomData<fn() -> T>);

    impl Shape for Full {
        type Output = Vec<QueryResult>;
        type Item = Row;
        const EXPECT: Expect = Expect::Any;

        fn finish(results: Vec<PgResult>) -> Result<Self::Output> {
            Ok(results
                .into_iter()
                .filter(|r| r.status() != ResultStatus::EmptyQuery)
                .map(|r| QueryResult {
                    command: r.command_status().map(str::to_string),
                    rows_affected: r.cmd_tuples(),
                    columns: Arc::clone(r.fields()),
                    rows: Row::from_result(r),
                })
                .collect())
        }

        fn item(row: Row) -> Result<Row> {
            Ok(row)
        }
    }

    impl Shape for RowList {
        type Output = Vec<Row>;
        type Item = Row;
        const EXPECT: Expect = Expect::Any;

        fn finish(results: Vec<PgResult>) -> Result<Self::Output> {
            Ok(all_rows(results))
        }

        fn item(row: Row) -> Result<Row> {
            Ok(row)
        }
    }

    impl<T: FromValue + Send + 'static> Shape for ValueList<T> {
        type Output = Vec<T>;
        type Item = T;
        const EXPECT: Expect = Expect::Any;

        fn finish(results: Vec<PgResult>) -> Result<Self::Output> {
            all_rows(results).iter().map(single_value).collect()
        }

        fn item(row: Row) -> Result<T> {
            single_value(&row)
        }
    }

    impl Shape for RowOrNull {
        type Output = Option<Row>;
        type Item = Row;
        const EXPECT: Expect = Expect::ZeroOrOne;

        fn finish(results: Vec<PgResult>) -> Result<Self::Output> {
            Ok(checked_rows(results, Self::EXPECT)?.into_iter().next())
        }

        fn item(row: Row) -> Result<Row> {
            Ok(row)
        }
    }

    impl Shape for SingleRow {
        type Output = Row;
        type Item = Row;
        const EXPECT: Expect = Expect::ExactlyOne;

        fn finish(results: Vec<PgResult>) -> Result<Self::Output> {
            checked_rows(results, Self::EXPECT)?
                .into_iter()
                .next()
                .ok_or_else(|| Error::Contract("expected exactly one row, got none".into()))
        }

        fn item(row: Row) -> Result<Row> {
            Ok(row)
        }
    }

    impl<T: FromValue + Send + 'static> Shape for ValueOrNull<T> {
        type Output = Option<T>;
        type Item = T;
        const EXPECT: Expect = Expect::ZeroOrOne;

        fn finish(results: Vec<PgResult>) -> Result<Self::Output> {
            checked_rows(results, Self::EXPECT)?
                .first()
                .map(single_value)
                .transpose()
        }

        fn item(row: Row) -> Result<T> {
            single_value(&row)
        }
    }

    impl<T: FromValue + Send + 'static> Shape for SingleValue<T> {
        type Output = T;
        type Item = T;
        const EXPECT: Expect = Expect::ExactlyOne;

        fn finish(results: Vec<PgResult>) -> Result<Self::Output> {
            let rows = checked_rows(results, Self::EXPECT)?;
            let row = rows
                .first()
                .ok_or_else(|| Error::Contract("expected exactly one row, got none".into()))?;
            single_value(row)
        }

        fn item(row: Row) -> Result<T> {
            single_value(&row)
        }
    }
}

/// A query body that drives a checked-out connection itself.
///
/// The returned results are shaped like those of a template query.
pub type Hook =
    Box<dyn for<'c> FnOnce(&'c mut Connection) -> BoxFuture<'c, Result<Vec<PgResult>>> + Send>;

enum Source {
    Template(SqlTemplate),
    Params { sql: String, params: Vec<Value> },
    Hook(Hook),
}

/// What goes over the wire once a connection is checked out.
enum Prepared {
    Sql {
        sql: String,
        params: Option<Vec<Option<String>>>,
    },
    Hook(Hook),
}

impl Source {
    /// SQL text and text-format parameters, if any.
    fn prepare(&self) -> Result<(String, Option<Vec<Option<String>>>)> {
        match self {
            Source::Template(template) => Ok((render(template)?, None)),
            Source::Params { sql, params } => {
                let params = params
                    .iter()
                    .map(|v| match v {
                        Value::Null => Ok(None),
                        v => encode_to_string(v).map(Some),
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok((sql.clone(), Some(params)))
            }
            Source::Hook(_) => Err(Error::Unsupported(
                "hook queries have no SQL text".into(),
            )),
        }
    }

    fn into_prepared(self) -> Result<Prepared> {
        match self {
            Source::Hook(hook) => Ok(Prepared::Hook(hook)),
            source => {
                let (sql, params) = source.prepare()?;
                Ok(Prepared::Sql { sql, params })
            }
        }
    }
}

impl std::fmt::Debug for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Source::Template(template) => f.debug_tuple("Template").field(template).finish(),
            Source::Params { sql, params } => f
                .debug_struct("Params")
                .field("sql", sql)
                .field("params", params)
                .finish(),
            Source::Hook(_) => f.write_str("Hook"),
        }
    }
}

/// Run `hook` on `conn`. When `signal` fires, one cancel request is sent and
/// the hook still runs to completion so the connection is left idle.
async fn run_hook(
    conn: &mut Connection,
    hook: Hook,
    signal: Option<&CancellationToken>,
) -> Result<Vec<PgResult>> {
    let Some(signal) = signal else {
        return hook(conn).await;
    };
    let id = conn.id();
    let cancel = conn.cancel_token();
    let mut body = hook(conn);
    tokio::select! {
        biased;
        results = &mut body => return results,
        () = signal.cancelled() => {}
    }
    if let Some(cancel) = cancel {
        if let Err(e) = cancel.cancel().await {
            tracing::debug!(connection_id = id, error = %e, "cancel request failed");
        }
    }
    // The hook's own outcome is superseded by the abort.
    let _ = body.await;
    Err(Error::Aborted)
}

/// A query that runs when awaited or streamed.
#[must_use = "queries do nothing unless awaited or streamed"]
pub struct Query<S: Shape> {
    pool: Pool,
    session: SessionParams,
    source: Source,
    signal: Option<CancellationToken>,
    location: Option<&'static Location<'static>>,
    _shape: PhantomData<fn() -> S>,
}

impl<S: Shape> Query<S> {
    pub(crate) fn template(
        pool: Pool,
        session: SessionParams,
        template: SqlTemplate,
        location: Option<&'static Location<'static>>,
    ) -> Self {
        Self {
            pool,
            session,
            source: Source::Template(template),
            signal: None,
            location,
            _shape: PhantomData,
        }
    }

    pub(crate) fn params(
        pool: Pool,
        session: SessionParams,
        sql: String,
        params: Vec<Value>,
        location: Option<&'static Location<'static>>,
    ) -> Self {
        Self {
            pool,
            session,
            source: Source::Params { sql, params },
            signal: None,
            location,
            _shape: PhantomData,
        }
    }

    pub(crate) fn hook(
        pool: Pool,
        session: SessionParams,
        hook: Hook,
        location: Option<&'static Location<'static>>,
    ) -> Self {
        Self {
            pool,
            session,
            source: Source::Hook(hook),
            signal: None,
            location,
            _shape: PhantomData,
        }
    }

    /// Abort the query when `token` is cancelled.
    ///
    /// Before the query is sent, cancellation only stops the wait for a
    /// connection. Afterwards a cancel request goes to the server and the
    /// query fails with [`Error::Aborted`] once the connection is drained.
    pub fn signal(mut self, token: CancellationToken) -> Self {
        self.signal = Some(token);
        self
    }

    /// The same query with a different result shape.
    pub fn reshape<T: Shape>(self) -> Query<T> {
        Query {
            pool: self.pool,
            session: self.session,
            source: self.source,
            signal: self.signal,
            location: self.location,
            _shape: PhantomData,
        }
    }

    /// The SQL this query sends. Hook queries have none.
    pub fn sql(&self) -> Result<String> {
        self.source.prepare().map(|(sql, _)| sql)
    }

    /// Stream items one row at a time.
    ///
    /// Rows arrive as the server produces them. A failure after some rows
    /// is delivered as the final item.
    pub fn stream(self) -> RowStream<S::Item> {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let location = self.location;
        tokio::spawn(async move {
            if let Err(e) = self.stream_rows(&tx).await {
                let e = match location {
                    Some(location) => e.at(location),
                    None => e,
                };
                let _ = tx.send(Err(e)).await;
            }
        });
        RowStream {
            rx,
            decode: S::item,
            location,
        }
    }

    async fn run(self) -> Result<S::Output> {
        let location = self.location;
        self.execute().await.map_err(|e| match location {
            Some(location) => e.at(location),
            None => e,
        })
    }

    async fn execute(self) -> Result<S::Output> {
        let prepared = self.source.into_prepared()?;
        let signal = self.signal.as_ref();
        if signal.is_some_and(CancellationToken::is_cancelled) {
            return Err(Error::Aborted);
        }

        let mut conn = self.pool.get_connection(&self.session, signal).await?;
        let results = match prepared {
            Prepared::Sql { sql, params } => {
                let results = conn
                    .execute(&sql, params.as_deref(), signal)
                    .await
                    .map_err(|e| e.with_command(&sql))?;
                check_results(results, &sql)?
            }
            Prepared::Hook(hook) => run_hook(&mut conn, hook, signal).await?,
        };
        drop(conn);
        S::finish(results)
    }

    async fn stream_rows(self, tx: &mpsc::Sender<Result<Row>>) -> Result<()> {
        let prepared = self.source.into_prepared()?;
        let signal = self.signal.as_ref();
        if signal.is_some_and(CancellationToken::is_cancelled) {
            return Err(Error::Aborted);
        }

        let mut conn = self.pool.get_connection(&self.session, signal).await?;
        let (sql, params) = match prepared {
            Prepared::Sql { sql, params } => (sql, params),
            Prepared::Hook(hook) => {
                // Hooks collect their results; rows are forwarded afterwards.
                let results = run_hook(&mut conn, hook, signal).await?;
                drop(conn);
                let rows = checked_rows(results, S::EXPECT)?;
                for row in rows {
                    if tx.send(Ok(row)).await.is_err() {
                        break;
                    }
                }
                return Ok(());
            }
        };
        conn.dispatch(&sql, params.as_deref(), true).await?;

        let mut cancelled = false;
        let mut failure: Option<Error> = None;
        let mut count = 0_usize;
        let mut consumer_gone = false;
        // Drain every result so the connection goes back to the pool idle.
        while let Some(result) = conn
            .next_result_or_cancel(signal, &mut cancelled)
            .await
            .map_err(|e| e.with_command(&sql))?
        {
            if result.status() == ResultStatus::FatalError {
                if failure.is_none() {
                    failure = result.to_error().map(|e| e.with_command(&sql));
                }
                continue;
            }
            for row in Row::from_result(result) {
                count += 1;
                if failure.is_some() || consumer_gone {
                    continue;
                }
                if let Err(e) = S::EXPECT.check(count, false) {
                    failure = Some(e);
                    continue;
                }
                if tx.send(Ok(row)).await.is_err() {
                    consumer_gone = true;
                }
            }
        }
        drop(conn);

        if cancelled {
            return Err(Error::Aborted);
        }
        if let Some(e) = failure {
            return Err(e);
        }
        S::EXPECT.check(count, true)
    }
}

impl<S: Shape> IntoFuture for Query<S> {
    type Output = Result<S::Output>;
    type IntoFuture = Pin<Box<dyn Future<Output = Self::Output> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.run())
    }
}

impl<S: Shape> std::fmt::Debug for Query<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("source", &self.source)
            .field("session", &self.session)
            .field("location", &self.location)
            .finish_non_exhaustive()
    }
}

/// Rows of a streamed [`Query`].
pub struct RowStream<T> {
    rx: mpsc::Receiver<Result<Row>>,
    decode: fn(Row) -> Result<T>,
    location: Option<&'static Location<'static>>,
}

impl<T> RowStream<T> {
    /// Next item, `Ok(None)` at the end.
    pub async fn try_next(&mut self) -> Result<Option<T>> {
        match self.rx.recv().await {
            Some(item) => self.map_item(item).map(Some),
            None => Ok(None),
        }
    }

    fn map_item(&self, item: Result<Row>) -> Result<T> {
        item.and_then(|row| {
            (self.decode)(row).map_err(|e| match self.location {
                Some(location) => e.at(location),
                None => e,
            })
        })
    }
}

impl<T> futures_core::Stream for RowStream<T> {
    type Item = Result<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(item)) => Poll::Ready(Some(this.map_item(item))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> std::fmt::Debug for RowStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowStream").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::shape::*;
    use super::*;
    use crate::protocol::types::oid;

    fn result(values: &[&str]) -> PgResult {
        let fields: Arc<[Field]> = Arc::from(vec![Field {
            name: "n".into(),
            type_oid: oid::INT4,
            table_oid: 0,
        }]);
        let mut result = PgResult::new(ResultStatus::TuplesOk, fields);
        result.rows = values.iter().map(|v| vec![Some(v.to_string())]).collect();
        result.command_tag = Some(format!("SELECT {}", values.len()));
        result
    }

    #[test]
    fn expected_counts() {
        assert!(Expect::ExactlyOne.check(0, true).is_err());
        assert!(Expect::ExactlyOne.check(0, false).is_ok());
        assert!(Expect::ZeroOrOne.check(0, true).is_ok());
        assert!(Expect::ZeroOrOne.check(2, false).is_err());
        assert!(Expect::Any.check(5, true).is_ok());
    }

    #[test]
    fn value_shapes() {
        assert_eq!(SingleValue::<i32>::finish(vec![result(&["7"])]).unwrap(), 7);
        assert_eq!(ValueOrNull::<i32>::finish(vec![result(&[])]).unwrap(), None);
        assert_eq!(
            ValueList::<i64>::finish(vec![result(&["1", "2"])]).unwrap(),
            vec![1, 2]
        );
        let err = SingleValue::<i32>::finish(vec![result(&["1", "2"])]).unwrap_err();
        assert!(matches!(err, Error::Contract(_)));
        let err = SingleRow::finish(vec![result(&[])]).unwrap_err();
        assert!(matches!(err, Error::Contract(_)));
    }

    #[test]
    fn full_keeps_each_command() {
        let mut insert = PgResult::new(ResultStatus::CommandOk, Arc::from([]));
        insert.command_tag = Some("INSERT 0 3".into());
        let out = Full::finish(vec![insert, result(&["1"])]).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].rows_affected, Some(3));
        assert_eq!(out[1].rows.len(), 1);
    }

    #[test]
    fn rows_span_commands() {
        let rows = RowList::finish(vec![result(&["1"]), result(&["2", "3"])]).unwrap();
        assert_eq!(rows.len(), 3);
        assert!(RowOrNull::finish(vec![result(&["1"]), result(&["2"])]).is_err());
    }

    fn select_one(conn: &mut Connection) -> BoxFuture<'_, Result<Vec<PgResult>>> {
        Box::pin(conn.query("SELECT 1"))
    }

    #[test]
    fn hooks_have_no_sql_text() {
        let source = Source::Hook(Box::new(select_one));
        assert!(matches!(source.prepare(), Err(Error::Unsupported(_))));
        assert!(matches!(source.into_prepared(), Ok(Prepared::Hook(_))));
    }

    #[test]
    fn params_are_encoded_as_text() {
        let source = Source::Params {
            sql: "SELECT $1, $2".into(),
            params: vec![Value::Null, Value::from(vec![1, 2])],
        };
        let (_, params) = source.prepare().unwrap();
        assert_eq!(params, Some(vec![None, Some("{1,2}".to_string())]));
    }
}
