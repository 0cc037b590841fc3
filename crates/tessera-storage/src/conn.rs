// SPDX-FileCopyrightText: 2026 Tessera Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Physical connections and the slots that own them.
//!
//! A [`Slot`] is one physical connection plus its private statement cache.
//! The write slot and every read pool slot sit behind a `tokio::sync::Mutex`,
//! so whoever holds the guard has the connection to themselves.

use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use rusqlite::params_from_iter;
use tessera_config::model::StorageConfig;
use tessera_core::{Backend, TesseraError};
use tokio::task::JoinHandle;
use tokio_postgres::error::SqlState;
use tokio_postgres::tls::{MakeTlsConnect, TlsConnect};
use tokio_postgres::types::ToSql;
use tokio_postgres::{NoTls, Socket};
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::{debug, warn};

use crate::cache::StatementCache;
use crate::dialect::{ConnRole, Dialect, Tuning};
use crate::tls::{self, SslMode};
use crate::value::{pg_row_values, Row, Value};

/// Native statements kept in rusqlite's per-connection cache. Our own cache
/// decides what is live; this only has to hold the working set.
const SQLITE_STATEMENT_CAPACITY: usize = 256;

/// Native handle stored in a [`StatementCache`].
///
/// SQLite statements borrow their connection, so they stay inside rusqlite's
/// statement cache on the connection thread; the entry is only a ticket.
#[derive(Clone, Debug)]
pub enum Handle {
    Sqlite,
    Postgres(tokio_postgres::Statement),
}

/// Result of one statement: returned rows and affected row count.
#[derive(Debug, Default)]
pub(crate) struct Output {
    pub rows: Vec<Row>,
    pub affected: u64,
}

/// How a statement is prepared for a single run.
#[derive(Clone, Copy)]
pub(crate) enum Prep<'a> {
    Cached(&'a Handle),
    AdHoc,
}

pub(crate) enum NativeConn {
    Sqlite(tokio_rusqlite::Connection),
    Postgres {
        client: tokio_postgres::Client,
        driver: JoinHandle<()>,
    },
}

impl NativeConn {
    async fn close(self) -> Result<(), String> {
        match self {
            NativeConn::Sqlite(conn) => conn.close().await.map_err(|e| e.to_string()),
            NativeConn::Postgres { client, driver } => {
                drop(client);
                // Dropping the client lets the driver send Terminate and finish.
                match tokio::time::timeout(Duration::from_secs(5), driver).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(format!("connection task failed: {e}")),
                    Err(_) => Err("connection task did not finish within 5s".to_string()),
                }
            }
        }
    }
}

enum Target {
    Sqlite {
        path: PathBuf,
    },
    Postgres {
        config: tokio_postgres::Config,
        tls: Option<MakeRustlsConnect>,
        redacted_url: String,
    },
}

/// Everything needed to open a tuned connection for either role.
pub(crate) struct Connector {
    pub dialect: &'static Dialect,
    target: Target,
    tuning: Tuning,
    statement_ttl: Duration,
}

impl Connector {
    /// Validate the backend selection and its parameters.
    pub fn from_config(config: &StorageConfig) -> Result<Self, TesseraError> {
        let backend: Backend = config.backend.parse().map_err(|_| {
            TesseraError::Config(format!(
                "unsupported storage backend `{}` (expected sqlite or postgres)",
                config.backend
            ))
        })?;

        let target = match backend {
            Backend::Sqlite => {
                let path = config.sqlite.path.trim();
                if path.is_empty() {
                    return Err(TesseraError::Config(
                        "storage.sqlite.path must not be empty".to_string(),
                    ));
                }
                if path == ":memory:" || path.starts_with("file::memory:") {
                    return Err(TesseraError::Config(
                        "in-memory SQLite databases cannot be shared between the writer and readers"
                            .to_string(),
                    ));
                }
                Target::Sqlite {
                    path: PathBuf::from(path),
                }
            }
            Backend::Postgres => {
                let pg = &config.postgres;
                let mode: SslMode = pg.sslmode.parse()?;
                let root_cert = pg
                    .sslrootcert
                    .as_deref()
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(std::path::Path::new);
                let tls = tls::connector(mode, root_cert)?;
                // The driver only knows disable/prefer/require; certificate
                // checks for the stricter modes live in the TLS connector.
                let mut wire = pg.clone();
                wire.sslmode = mode.wire_name().to_string();
                let url = tessera_config::postgres_url(&wire).ok_or_else(|| {
                    TesseraError::Config(
                        "storage.postgres.host, user and database are required".to_string(),
                    )
                })?;
                let config = url.parse::<tokio_postgres::Config>().map_err(|e| {
                    TesseraError::Config(format!("invalid postgres connection settings: {e}"))
                })?;
                Target::Postgres {
                    config,
                    tls,
                    redacted_url: tessera_config::redacted_postgres_url(pg).unwrap_or_default(),
                }
            }
        };

        Ok(Self {
            dialect: Dialect::for_backend(backend),
            target,
            tuning: Tuning {
                busy_timeout: Duration::from_millis(config.sqlite.busy_timeout_ms),
            },
            statement_ttl: Duration::from_secs(config.statement_cache.ttl_secs.max(1)),
        })
    }

    pub fn backend(&self) -> Backend {
        self.dialect.backend
    }

    /// Human-readable target for logs. Never includes the password.
    pub fn describe(&self) -> String {
        match &self.target {
            Target::Sqlite { path } => path.display().to_string(),
            Target::Postgres { redacted_url, .. } => redacted_url.clone(),
        }
    }

    pub fn sqlite_path(&self) -> Option<&std::path::Path> {
        match &self.target {
            Target::Sqlite { path } => Some(path),
            Target::Postgres { .. } => None,
        }
    }

    /// Open, tune and ping a new connection.
    pub async fn connect(&self, role: ConnRole) -> Result<NativeConn, TesseraError> {
        let directives = self.dialect.tuning(role, self.tuning);
        match &self.target {
            Target::Sqlite { path } => {
                let conn = tokio_rusqlite::Connection::open(path)
                    .await
                    .map_err(|e| connectivity(Backend::Sqlite, e))?;
                conn.call(move |c| -> Result<(), rusqlite::Error> {
                    c.set_prepared_statement_cache_capacity(SQLITE_STATEMENT_CAPACITY);
                    for sql in &directives {
                        drain_statement(c, sql)?;
                    }
                    c.query_row("SELECT 1", [], |_| Ok(()))
                })
                .await
                .map_err(|e| connectivity(Backend::Sqlite, e))?;
                debug!(path = %path.display(), role = ?role, "sqlite connection opened");
                Ok(NativeConn::Sqlite(conn))
            }
            Target::Postgres {
                config,
                tls,
                redacted_url,
            } => {
                let (client, driver) = match tls {
                    Some(tls) => spawn_postgres(config, tls.clone()).await,
                    None => spawn_postgres(config, NoTls).await,
                }
                .map_err(|e| connectivity(Backend::Postgres, e))?;
                for sql in &directives {
                    client
                        .batch_execute(sql)
                        .await
                        .map_err(|e| connectivity(Backend::Postgres, e))?;
                }
                client
                    .simple_query("SELECT 1")
                    .await
                    .map_err(|e| connectivity(Backend::Postgres, e))?;
                debug!(url = %redacted_url, role = ?role, "postgres connection opened");
                Ok(NativeConn::Postgres { client, driver })
            }
        }
    }

    /// A slot for `role` whose connection is opened on first use.
    pub fn slot(self: &Arc<Self>, role: ConnRole) -> Slot {
        let retired = Arc::new(Mutex::new(Vec::new()));
        let sink = retired.clone();
        let cache = Arc::new(StatementCache::new(
            self.statement_ttl,
            Box::new(move |query: &str, handle: Handle| match handle {
                // Discarded natively by the owning connection before its next call.
                Handle::Sqlite => lock(&sink).push(query.to_string()),
                // Dropping the last clone closes the server-side statement.
                Handle::Postgres(stmt) => drop(stmt),
            }),
        ));
        Slot {
            role,
            connector: self.clone(),
            conn: None,
            opened_at: Instant::now(),
            in_tx: false,
            closed: false,
            broken: AtomicBool::new(false),
            cache,
            retired,
        }
    }
}

/// Connect and spawn the driver task that owns the socket.
async fn spawn_postgres<T>(
    config: &tokio_postgres::Config,
    tls: T,
) -> Result<(tokio_postgres::Client, JoinHandle<()>), tokio_postgres::Error>
where
    T: MakeTlsConnect<Socket> + Send,
    T::Stream: Send + 'static,
    T::TlsConnect: Send,
    <T::TlsConnect as TlsConnect<Socket>>::Future: Send,
{
    let (client, connection) = config.connect(tls).await?;
    let driver = tokio::spawn(async move {
        if let Err(e) = connection.await {
            warn!(error = %e, "postgres connection terminated");
        }
    });
    Ok((client, driver))
}

fn connectivity(backend: Backend, e: impl std::error::Error + Send + Sync + 'static) -> TesseraError {
    TesseraError::Connectivity {
        backend: backend.to_string(),
        source: Box::new(e),
    }
}

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Run a statement that may or may not return rows (e.g. `PRAGMA journal_mode`),
/// discarding any rows.
fn drain_statement(c: &rusqlite::Connection, sql: &str) -> Result<(), rusqlite::Error> {
    let mut stmt = c.prepare(sql)?;
    let mut rows = stmt.query([])?;
    while rows.next()?.is_some() {}
    Ok(())
}

fn sqlite_run(
    stmt: &mut rusqlite::Statement<'_>,
    args: &[Value],
) -> Result<(Vec<Row>, bool), rusqlite::Error> {
    let readonly = stmt.readonly();
    if stmt.column_count() == 0 {
        stmt.execute(params_from_iter(args.iter()))?;
        return Ok((Vec::new(), readonly));
    }
    let columns: Arc<[String]> = stmt.column_names().into_iter().map(String::from).collect();
    let width = columns.len();
    let mut out = Vec::new();
    let mut rows = stmt.query(params_from_iter(args.iter()))?;
    while let Some(row) = rows.next()? {
        let mut values = Vec::with_capacity(width);
        for i in 0..width {
            values.push(Value::from(row.get_ref(i)?));
        }
        out.push(Row::new(columns.clone(), values));
    }
    Ok((out, readonly))
}

/// Convert a tokio-rusqlite failure for `query` into the engine error.
pub(crate) fn map_tr_err(query: &str, e: tokio_rusqlite::Error<rusqlite::Error>) -> TesseraError {
    match e {
        tokio_rusqlite::Error::Error(err) => map_sqlite_err(query, err),
        tokio_rusqlite::Error::ConnectionClosed => TesseraError::Closed,
        other => TesseraError::query(query, other.to_string()),
    }
}

fn map_sqlite_err(query: &str, err: rusqlite::Error) -> TesseraError {
    if let rusqlite::Error::SqliteFailure(f, _) = &err
        && f.code == rusqlite::ErrorCode::SchemaChanged
    {
        return TesseraError::StaleStatement {
            query: query.to_string(),
        };
    }
    TesseraError::query(query, err)
}

/// Convert a tokio-postgres failure for `query` into the engine error.
pub(crate) fn map_pg_err(query: &str, e: tokio_postgres::Error) -> TesseraError {
    if let Some(code) = e.code() {
        // 26000 after a reconnect; 0A000 "cached plan must not change result type" after DDL.
        let stale = *code == SqlState::INVALID_SQL_STATEMENT_NAME
            || (*code == SqlState::FEATURE_NOT_SUPPORTED && e.to_string().contains("cached plan"));
        if stale {
            return TesseraError::StaleStatement {
                query: query.to_string(),
            };
        }
    }
    TesseraError::query(query, e)
}

/// One physical connection, its statement cache and its transaction state.
pub(crate) struct Slot {
    pub role: ConnRole,
    connector: Arc<Connector>,
    conn: Option<NativeConn>,
    opened_at: Instant,
    /// Set before `BEGIN` is sent and cleared only after `COMMIT`/`ROLLBACK`
    /// succeeds, so an abandoned transaction is rolled back on next checkout.
    pub in_tx: bool,
    closed: bool,
    broken: AtomicBool,
    pub cache: Arc<StatementCache<Handle>>,
    retired: Arc<Mutex<Vec<String>>>,
}

impl Slot {
    pub fn backend(&self) -> Backend {
        self.connector.backend()
    }

    pub fn dialect(&self) -> &'static Dialect {
        self.connector.dialect
    }

    pub fn is_open(&self) -> bool {
        self.conn.is_some()
    }

    fn conn(&self) -> Result<&NativeConn, TesseraError> {
        self.conn.as_ref().ok_or(TesseraError::Closed)
    }

    /// The PostgreSQL client, for work that needs the driver's own API
    /// (client-side transactions, `COPY`).
    pub fn pg_client_mut(&mut self) -> Result<&mut tokio_postgres::Client, TesseraError> {
        match self.conn.as_mut() {
            Some(NativeConn::Postgres { client, .. }) => Ok(client),
            Some(NativeConn::Sqlite(_)) => Err(TesseraError::Config(
                "operation requires the postgres backend".to_string(),
            )),
            None => Err(TesseraError::Closed),
        }
    }

    fn take_retired(&self) -> Vec<String> {
        std::mem::take(&mut *lock(&self.retired))
    }

    /// Open the connection if needed, roll back an abandoned transaction and
    /// recycle a connection older than `max_lifetime`.
    pub async fn ensure_ready(&mut self, max_lifetime: Option<Duration>) -> Result<(), TesseraError> {
        if self.closed {
            return Err(TesseraError::Closed);
        }
        if self.broken.load(Ordering::Acquire) {
            debug!(role = ?self.role, "replacing broken connection");
            self.reopen().await?;
        }
        if self.conn.is_none() {
            self.open().await?;
        }
        if self.in_tx {
            match self.batch("ROLLBACK").await {
                Ok(()) => debug!(role = ?self.role, "rolled back abandoned transaction"),
                // "no transaction is active": BEGIN never reached the server.
                Err(e) => debug!(role = ?self.role, error = %e, "rollback of abandoned transaction failed"),
            }
            self.in_tx = false;
        }
        if let Some(max) = max_lifetime
            && self.opened_at.elapsed() >= max
        {
            debug!(role = ?self.role, age_secs = self.opened_at.elapsed().as_secs(), "recycling connection");
            self.reopen().await?;
        }
        Ok(())
    }

    async fn open(&mut self) -> Result<(), TesseraError> {
        let conn = self.connector.connect(self.role).await?;
        self.conn = Some(conn);
        self.opened_at = Instant::now();
        self.in_tx = false;
        self.broken.store(false, Ordering::Release);
        Ok(())
    }

    async fn reopen(&mut self) -> Result<(), TesseraError> {
        if let Some(old) = self.conn.take()
            && let Err(e) = old.close().await
        {
            debug!(error = %e, "closing recycled connection failed");
        }
        self.cache.clear();
        lock(&self.retired).clear();
        self.open().await
    }

    /// Close the native connection. The statement cache is closed separately.
    pub async fn close(&mut self) -> Result<(), String> {
        self.closed = true;
        lock(&self.retired).clear();
        match self.conn.take() {
            Some(conn) => conn.close().await,
            None => Ok(()),
        }
    }

    fn mark_if_broken(&self, err: &TesseraError) {
        if matches!(err, TesseraError::Closed) {
            self.broken.store(true, Ordering::Release);
        }
    }

    /// Run one or more argument-free statements (transaction control, scripts).
    pub async fn batch(&self, sql: &str) -> Result<(), TesseraError> {
        let result = match self.conn()? {
            NativeConn::Sqlite(conn) => {
                let retired = self.take_retired();
                let owned = sql.to_string();
                conn.call(move |c| -> Result<(), rusqlite::Error> {
                    discard_retired(c, &retired);
                    c.execute_batch(&owned)
                })
                .await
                .map_err(|e| map_tr_err(sql, e))
            }
            NativeConn::Postgres { client, .. } => {
                let result = client.batch_execute(sql).await;
                if let Err(e) = &result
                    && e.is_closed()
                {
                    self.broken.store(true, Ordering::Release);
                }
                result.map_err(|e| map_pg_err(sql, e))
            }
        };
        if let Err(e) = &result {
            self.mark_if_broken(e);
        }
        result
    }

    /// Prepare `sql` natively and return a handle for the cache.
    pub async fn prepare(&self, sql: &str) -> Result<Handle, TesseraError> {
        match self.conn()? {
            NativeConn::Sqlite(conn) => {
                let retired = self.take_retired();
                let owned = sql.to_string();
                conn.call(move |c| -> Result<(), rusqlite::Error> {
                    discard_retired(c, &retired);
                    c.prepare_cached(&owned).map(|_| ())
                })
                .await
                .map_err(|e| map_tr_err(sql, e))?;
                Ok(Handle::Sqlite)
            }
            NativeConn::Postgres { client, .. } => client
                .prepare(sql)
                .await
                .map(Handle::Postgres)
                .map_err(|e| map_pg_err(sql, e)),
        }
    }

    /// Execute `sql` once with the given preparation strategy. `want_rows`
    /// selects between returning rows and reporting the affected row count
    /// where the driver distinguishes the two.
    pub async fn execute(
        &self,
        sql: &str,
        args: &[Value],
        prep: Prep<'_>,
        want_rows: bool,
    ) -> Result<Output, TesseraError> {
        let result = match self.conn()? {
            NativeConn::Sqlite(conn) => {
                let retired = self.take_retired();
                let owned = sql.to_string();
                let args = args.to_vec();
                let cached = matches!(prep, Prep::Cached(_));
                conn.call(move |c| -> Result<Output, rusqlite::Error> {
                    discard_retired(c, &retired);
                    let before = c.total_changes();
                    let (rows, readonly) = if cached {
                        let mut stmt = c.prepare_cached(&owned)?;
                        sqlite_run(&mut stmt, &args)?
                    } else {
                        let mut stmt = c.prepare(&owned)?;
                        sqlite_run(&mut stmt, &args)?
                    };
                    // changes() keeps the last DML count across DDL, so only
                    // trust it when this statement moved the running total.
                    let affected = if readonly || c.total_changes() == before {
                        0
                    } else {
                        c.changes()
                    };
                    Ok(Output { rows, affected })
                })
                .await
                .map_err(|e| map_tr_err(sql, e))
            }
            NativeConn::Postgres { client, .. } => {
                let params: Vec<&(dyn ToSql + Sync)> =
                    args.iter().map(|v| v as &(dyn ToSql + Sync)).collect();
                let stmt = match prep {
                    Prep::Cached(Handle::Postgres(stmt)) => Some(stmt),
                    _ => None,
                };
                let result = match (want_rows, stmt) {
                    (true, Some(s)) => client.query(s, &params).await.map(PgResult::Rows),
                    (true, None) => client.query(sql, &params).await.map(PgResult::Rows),
                    (false, Some(s)) => client.execute(s, &params).await.map(PgResult::Affected),
                    (false, None) => client.execute(sql, &params).await.map(PgResult::Affected),
                };
                match result {
                    Ok(PgResult::Rows(pg_rows)) => pg_output(sql, pg_rows),
                    Ok(PgResult::Affected(affected)) => Ok(Output {
                        rows: Vec::new(),
                        affected,
                    }),
                    Err(e) => {
                        if e.is_closed() {
                            self.broken.store(true, Ordering::Release);
                        }
                        Err(map_pg_err(sql, e))
                    }
                }
            }
        };
        if let Err(e) = &result {
            self.mark_if_broken(e);
        }
        result
    }

    /// Execute through this connection's statement cache, preparing on miss.
    ///
    /// A stale cached handle is dropped (only if it is still the entry we
    /// used) and the statement retried exactly once with a fresh prepare.
    pub async fn execute_cached(
        &self,
        sql: &str,
        args: &[Value],
        want_rows: bool,
    ) -> Result<Output, TesseraError> {
        retry_stale(
            self.cache.as_ref(),
            sql,
            || self.prepare(sql),
            move |handle: Handle| async move {
                self.execute(sql, args, Prep::Cached(&handle), want_rows).await
            },
        )
        .await
    }
}

/// Run `sql` with its cached handle, preparing on miss. A stale handle is
/// dropped (only if it is still the entry we used) and the statement retried
/// exactly once with a fresh prepare.
async fn retry_stale<H, T, P, PF, R, RF>(
    cache: &StatementCache<H>,
    sql: &str,
    mut prepare: P,
    mut run: R,
) -> Result<T, TesseraError>
where
    H: Clone,
    P: FnMut() -> PF,
    PF: Future<Output = Result<H, TesseraError>>,
    R: FnMut(H) -> RF,
    RF: Future<Output = Result<T, TesseraError>>,
{
    let mut retried = false;
    loop {
        let (handle, generation) = match cache.get(sql) {
            Some((handle, generation)) => (handle, Some(generation)),
            None => {
                let handle = prepare().await?;
                let generation = cache.set(sql, handle.clone());
                (handle, generation)
            }
        };
        match run(handle).await {
            Err(TesseraError::StaleStatement { .. }) if !retried => {
                retried = true;
                crate::telemetry::record_stale_retry();
                debug!(query = %sql, "stale prepared statement, retrying once");
                match generation {
                    Some(g) => {
                        cache.invalidate_if(sql, g);
                    }
                    None => {
                        cache.invalidate(sql);
                    }
                }
            }
            other => return other,
        }
    }
}

/// Finalize native statements whose cache entries were evicted.
fn discard_retired(c: &rusqlite::Connection, retired: &[String]) {
    for query in retired {
        // Re-fetching an evicted entry from rusqlite's cache and discarding it
        // finalizes the native statement; a failed prepare has nothing to free.
        if let Ok(stmt) = c.prepare_cached(query) {
            stmt.discard();
        }
    }
}

enum PgResult {
    Rows(Vec<tokio_postgres::Row>),
    Affected(u64),
}

fn pg_output(sql: &str, pg_rows: Vec<tokio_postgres::Row>) -> Result<Output, TesseraError> {
    let Some(first) = pg_rows.first() else {
        return Ok(Output::default());
    };
    let columns: Arc<[String]> = first.columns().iter().map(|c| c.name().to_string()).collect();
    let mut rows = Vec::with_capacity(pg_rows.len());
    for row in &pg_rows {
        let values = pg_row_values(row).map_err(|e| TesseraError::query(sql, e))?;
        rows.push(Row::new(columns.clone(), values));
    }
    Ok(Output {
        affected: rows.len() as u64,
        rows,
    })
}
