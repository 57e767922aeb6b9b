//! The public entry point.

use std::panic::Location;

use futures_core::future::BoxFuture;

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::opts::{Opts, PoolOpts};
use crate::pool::Pool;
use crate::query::Query;
use crate::query::shape::{
    Full, RowList, RowOrNull, SingleRow, SingleValue, ValueList, ValueOrNull,
};
use crate::raw::PgResult;
use crate::routine::Routines;
use crate::session::SessionParams;
use crate::template::{SqlTemplate, render};
use crate::value::{FromValue, Value};

/// A pooled PostgreSQL client.
///
/// Clones share the pool. [`Client::with_session`] derives a client that
/// shares the pool but only receives connections configured for its own
/// session parameters.
///
/// ```no_run
/// use pg_nano::{Client, PoolOpts, sql};
///
/// # async fn run() -> pg_nano::Result<()> {
/// let client = Client::new(PoolOpts::default())?;
/// client.connect("postgres://postgres@localhost/app").await?;
///
/// let name: String = client
///     .query_value(sql!("SELECT name FROM users WHERE id = {}", 7))
///     .await?;
/// println!("{name}");
///
/// client.close().await;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Client {
    pool: Pool,
    session: SessionParams,
}

impl Client {
    pub fn new(opts: PoolOpts) -> Result<Self> {
        Ok(Self {
            pool: Pool::new(opts)?,
            session: SessionParams::default(),
        })
    }

    /// Connect the pool to `target`, a URL or [`Opts`].
    ///
    /// Waits for the first required connection so misconfiguration is
    /// reported here. Fails if already connected.
    pub async fn connect<T>(&self, target: T) -> Result<()>
    where
        T: TryInto<Opts>,
        T::Error: Into<Error>,
    {
        let opts = target.try_into().map_err(Into::into)?;
        self.pool.connect(opts).await
    }

    /// Close every connection and reject every waiting query. Idempotent.
    pub async fn close(&self) {
        self.pool.close();
        tokio::task::yield_now().await;
    }

    pub fn is_connected(&self) -> bool {
        self.pool.is_connected()
    }

    /// Live and connecting connections.
    pub fn num_connections(&self) -> usize {
        self.pool.num_connections()
    }

    pub fn num_idle(&self) -> usize {
        self.pool.num_idle()
    }

    /// Queries waiting for a connection.
    pub fn backlog_len(&self) -> usize {
        self.pool.backlog_len()
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn session(&self) -> &SessionParams {
        &self.session
    }

    /// A client sharing this pool whose connections carry `params` on top
    /// of this client's session parameters.
    pub fn with_session<K, V>(&self, params: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            pool: self.pool.clone(),
            session: self.session.merged(&SessionParams::new(params)),
        }
    }

    /// Every result of every command in `template`.
    #[track_caller]
    pub fn query(&self, template: impl Into<SqlTemplate>) -> Query<Full> {
        self.make(template.into())
    }

    /// All rows.
    #[track_caller]
    pub fn query_row_list(&self, template: impl Into<SqlTemplate>) -> Query<RowList> {
        self.make(template.into())
    }

    /// The only column of every row.
    #[track_caller]
    pub fn query_value_list<T: FromValue + Send + 'static>(
        &self,
        template: impl Into<SqlTemplate>,
    ) -> Query<ValueList<T>> {
        self.make(template.into())
    }

    /// At most one row; `None` when there is none.
    #[track_caller]
    pub fn query_row_or_null(&self, template: impl Into<SqlTemplate>) -> Query<RowOrNull> {
        self.make(template.into())
    }

    /// Exactly one row.
    #[track_caller]
    pub fn query_row(&self, template: impl Into<SqlTemplate>) -> Query<SingleRow> {
        self.make(template.into())
    }

    /// The only column of at most one row.
    #[track_caller]
    pub fn query_value_or_null<T: FromValue + Send + 'static>(
        &self,
        template: impl Into<SqlTemplate>,
    ) -> Query<ValueOrNull<T>> {
        self.make(template.into())
    }

    /// The only column of exactly one row.
    #[track_caller]
    pub fn query_value<T: FromValue + Send + 'static>(
        &self,
        template: impl Into<SqlTemplate>,
    ) -> Query<SingleValue<T>> {
        self.make(template.into())
    }

    /// A single statement with `$n` placeholders bound to `params`.
    ///
    /// Parameters are sent separately from the SQL in text format. Use
    /// [`Query::reshape`] for a shape other than [`Full`].
    #[track_caller]
    pub fn query_params(&self, sql: impl Into<String>, params: Vec<Value>) -> Query<Full> {
        Query::params(
            self.pool.clone(),
            self.session.clone(),
            sql.into(),
            params,
            self.call_site(),
        )
    }

    /// Run `hook` on a checked-out connection and shape what it returns.
    ///
    /// The connection goes back to the pool when the hook finishes. A
    /// cancelled signal sends one cancel request and waits for the hook.
    ///
    /// ```no_run
    /// # async fn run(client: pg_nano::Client) -> pg_nano::Result<()> {
    /// let n: i64 = client
    ///     .query_hook(|conn| Box::pin(async move {
    ///         conn.query("SET LOCAL statement_timeout = 100").await?;
    ///         conn.query("SELECT count(*) FROM items").await
    ///     }))
    ///     .reshape::<pg_nano::query::shape::SingleValue<i64>>()
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    #[track_caller]
    pub fn query_hook<F>(&self, hook: F) -> Query<Full>
    where
        F: for<'c> FnOnce(&'c mut Connection) -> BoxFuture<'c, Result<Vec<PgResult>>>
            + Send
            + 'static,
    {
        Query::hook(
            self.pool.clone(),
            self.session.clone(),
            Box::new(hook),
            self.call_site(),
        )
    }

    /// Render `template` to SQL text without running it.
    pub fn stringify(&self, template: &SqlTemplate) -> Result<String> {
        render(template)
    }

    /// Attach a set of generated routines to this client.
    pub fn bind<R: Routines>(&self) -> R {
        R::bind(self.clone())
    }

    #[track_caller]
    fn make<S: crate::query::Shape>(&self, template: SqlTemplate) -> Query<S> {
        Query::template(
            self.pool.clone(),
            self.session.clone(),
            template,
            self.call_site(),
        )
    }

    #[track_caller]
    fn call_site(&self) -> Option<&'static Location<'static>> {
        if self.pool.opts().debug {
            Some(Location::caller())
        } else {
            None
        }
    }
}
