// SPDX-FileCopyrightText: 2026 Tessera Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The connection manager.
//!
//! One write slot serialized by a gate, a read pool, per-slot statement
//! caches and the background maintenance tasks. Writes always go through the
//! single write slot; do NOT open extra connections for writing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tessera_config::model::StorageConfig;
use tessera_core::{Backend, HealthStatus, TesseraError};
use tokio::sync::{OnceCell, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::StatementCache;
use crate::classify::{self, Route};
use crate::conn::{lock, Connector, Handle, Output, Slot};
use crate::context::Ctx;
use crate::dialect::{ConnRole, Dialect};
use crate::executor::Executor;
use crate::migrations::{self, MigrationStatus};
use crate::pool::ReadPool;
use crate::string_pool;
use crate::transaction::{Transaction, TxOptions};
use crate::value::{ExecResult, Row, Value};

/// Upper bound on the interval between statement cache sweeps.
const CACHE_SWEEP_MAX: Duration = Duration::from_secs(60);

/// Switches for [`Database::open_with`].
#[derive(Debug, Clone, Copy)]
pub struct OpenOptions {
    /// Apply pending migrations before returning.
    pub migrate: bool,
    /// Start the string pool cleanup loop and the cache sweeper.
    pub background: bool,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            migrate: true,
            background: true,
        }
    }
}

/// Point-in-time view of the manager, for status output.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PoolStats {
    pub backend: Backend,
    pub target: String,
    pub read_pool_size: usize,
    /// Read connections currently open; grows on demand up to `read_pool_size`.
    pub read_pool_open: usize,
    pub writer_cached_statements: usize,
    pub reader_cached_statements: usize,
    pub closed: bool,
}

#[derive(Debug, Clone)]
struct CloseOutcome {
    writer: Option<String>,
    reader: Option<String>,
}

impl CloseOutcome {
    fn to_result(&self) -> Result<(), TesseraError> {
        if self.writer.is_none() && self.reader.is_none() {
            Ok(())
        } else {
            Err(TesseraError::Close {
                writer: self.writer.clone(),
                reader: self.reader.clone(),
            })
        }
    }
}

pub(crate) struct Inner {
    connector: Arc<Connector>,
    writer: Arc<tokio::sync::Mutex<Slot>>,
    readers: ReadPool,
    /// Every slot's cache, kept here so sweeps and shutdown need no slot lock.
    caches: Vec<Arc<StatementCache<Handle>>>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    pub(crate) cleanup_running: AtomicBool,
    closed: AtomicBool,
    close_outcome: OnceCell<CloseOutcome>,
}

/// Handle to an open database. Cheap to clone; all clones share one manager.
#[derive(Clone)]
pub struct Database {
    pub(crate) inner: Arc<Inner>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("backend", &self.backend())
            .field("target", &self.inner.connector.describe())
            .finish()
    }
}

impl Database {
    /// Open the configured backend, apply migrations and start maintenance.
    ///
    /// `shutdown` stops the background loops when cancelled; [`close`](Self::close)
    /// cancels a child of it, so closing never cancels the caller's token.
    pub async fn open(config: &StorageConfig, shutdown: &CancellationToken) -> Result<Self, TesseraError> {
        Self::open_with(config, shutdown, OpenOptions::default()).await
    }

    pub async fn open_with(
        config: &StorageConfig,
        shutdown: &CancellationToken,
        options: OpenOptions,
    ) -> Result<Self, TesseraError> {
        crate::init();
        let connector = Arc::new(Connector::from_config(config)?);

        if let Some(path) = connector.sqlite_path()
            && let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| TesseraError::Connectivity {
                backend: Backend::Sqlite.to_string(),
                source: Box::new(e),
            })?;
        }

        let shutdown = shutdown.child_token();
        let ctx = Ctx::new(shutdown.clone());

        let mut writer = connector.slot(ConnRole::ReadWrite);
        ctx.run(writer.ensure_ready(None)).await?;

        if options.migrate
            && let Err(e) = migrations::run(&ctx, &mut writer).await
        {
            if let Err(close_err) = writer.close().await {
                debug!(error = %close_err, "closing writer after failed migration");
            }
            return Err(e);
        }

        let readers = ReadPool::new(
            &connector,
            config.pool.max_open,
            Duration::from_secs(config.pool.max_lifetime_secs),
        );
        if let Err(e) = readers.warm(config.pool.max_idle.min(readers.size())).await {
            if let Err(close_err) = writer.close().await {
                debug!(error = %close_err, "closing writer after failed pool warm-up");
            }
            return Err(e);
        }

        let mut caches = vec![writer.cache.clone()];
        for slot in readers.slots() {
            caches.push(slot.lock().await.cache.clone());
        }

        let db = Database {
            inner: Arc::new(Inner {
                connector,
                writer: Arc::new(tokio::sync::Mutex::new(writer)),
                readers,
                caches,
                shutdown,
                tasks: Mutex::new(Vec::new()),
                cleanup_running: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                close_outcome: OnceCell::new(),
            }),
        };

        if options.background {
            let mut tasks = vec![db.spawn_cache_sweeper(Duration::from_secs(
                config.statement_cache.ttl_secs.max(1),
            ))];
            if config.string_pool.cleanup_enabled {
                tasks.push(string_pool::spawn_cleanup_loop(&db, &config.string_pool));
            }
            lock(&db.inner.tasks).extend(tasks);
        }

        info!(
            backend = %db.backend(),
            target = %db.inner.connector.describe(),
            read_pool = db.inner.readers.size(),
            "database opened"
        );
        Ok(db)
    }

    pub fn dialect(&self) -> &'static Dialect {
        self.inner.connector.dialect
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.inner.shutdown
    }

    fn ensure_open(&self) -> Result<(), TesseraError> {
        if self.inner.closed.load(Ordering::Acquire) {
            Err(TesseraError::Closed)
        } else {
            Ok(())
        }
    }

    /// Wait for the write gate and hand back the ready write slot.
    pub(crate) async fn lock_writer(&self, ctx: &Ctx) -> Result<OwnedMutexGuard<Slot>, TesseraError> {
        self.ensure_open()?;
        let writer = self.inner.writer.clone();
        let mut guard = ctx.run(async move { Ok(writer.lock_owned().await) }).await?;
        ctx.run(guard.ensure_ready(None)).await?;
        Ok(guard)
    }

    async fn run(
        &self,
        ctx: &Ctx,
        query: &str,
        args: &[Value],
        route: Route,
        want_rows: bool,
    ) -> Result<Output, TesseraError> {
        self.ensure_open()?;
        let sql = self.dialect().rewrite(query);
        let guard = match route {
            Route::Writer => self.lock_writer(ctx).await?,
            Route::Reader => self.inner.readers.checkout(ctx).await?,
        };
        ctx.run(guard.execute_cached(&sql, args, want_rows)).await
    }

    /// Run a statement on the write slot regardless of its leading keyword.
    pub async fn exec_on_writer(&self, ctx: &Ctx, query: &str, args: &[Value]) -> Result<ExecResult, TesseraError> {
        let out = self.run(ctx, query, args, Route::Writer, false).await?;
        Ok(ExecResult {
            rows_affected: out.affected,
        })
    }

    /// Query on the write slot, e.g. to read your own writes or for
    /// `WITH ... INSERT ... RETURNING` statements the classifier reads as reads.
    pub async fn query_on_writer(&self, ctx: &Ctx, query: &str, args: &[Value]) -> Result<Vec<Row>, TesseraError> {
        Ok(self.run(ctx, query, args, Route::Writer, true).await?.rows)
    }

    /// Start a native transaction.
    ///
    /// A write transaction holds the write gate until it is committed, rolled
    /// back or dropped. A connection found already inside a transaction is
    /// rolled back and `BEGIN` retried once.
    pub async fn begin_tx(&self, ctx: &Ctx, options: TxOptions) -> Result<Transaction, TesseraError> {
        let mut guard = if options.read_only {
            self.inner.readers.checkout(ctx).await?
        } else {
            self.lock_writer(ctx).await?
        };
        let begin = self.dialect().begin(options.read_only);

        guard.in_tx = true;
        match ctx.run(guard.batch(begin)).await {
            Ok(()) => {}
            Err(e) if is_nested_begin(&e) => {
                crate::telemetry::record_tx_begin_recovery();
                warn!(read_only = options.read_only, "connection was already inside a transaction, rolling back");
                ctx.run(guard.batch("ROLLBACK")).await?;
                ctx.run(guard.batch(begin)).await?;
            }
            Err(e) => return Err(e),
        }
        Ok(Transaction::new(guard, !options.read_only))
    }

    /// Apply pending migrations on the write slot.
    pub async fn migrate(&self, ctx: &Ctx) -> Result<Vec<String>, TesseraError> {
        let mut guard = self.lock_writer(ctx).await?;
        migrations::run(ctx, &mut guard).await
    }

    /// Applied and pending migration files.
    pub async fn migration_status(&self, ctx: &Ctx) -> Result<MigrationStatus, TesseraError> {
        let guard = self.lock_writer(ctx).await?;
        migrations::status(ctx, &guard).await
    }

    /// Delete string pool rows no interned column references.
    pub async fn cleanup_unused_strings(&self, ctx: &Ctx) -> Result<u64, TesseraError> {
        string_pool::cleanup_unused_strings(self, ctx).await
    }

    /// Round trip to both endpoints.
    pub async fn health(&self, ctx: &Ctx) -> HealthStatus {
        if self.ensure_open().is_err() {
            return HealthStatus::Unhealthy("database is closed".to_string());
        }
        let writer = self.exec_on_writer(ctx, "SELECT 1", &[]).await;
        let reader = self.query(ctx, "SELECT 1", &[]).await;
        match (writer, reader) {
            (Ok(_), Ok(_)) => HealthStatus::Healthy,
            (Err(e), _) => HealthStatus::Unhealthy(format!("writer: {e}")),
            (Ok(_), Err(e)) => HealthStatus::Degraded(format!("reader: {e}")),
        }
    }

    pub fn stats(&self) -> PoolStats {
        let (writer_cache, reader_caches) = self.inner.caches.split_at(1);
        PoolStats {
            backend: self.backend(),
            target: self.inner.connector.describe(),
            read_pool_size: self.inner.readers.size(),
            read_pool_open: self.inner.readers.open_connections(),
            writer_cached_statements: writer_cache.iter().map(|c| c.len()).sum(),
            reader_cached_statements: reader_caches.iter().map(|c| c.len()).sum(),
            closed: self.inner.closed.load(Ordering::Acquire),
        }
    }

    fn spawn_cache_sweeper(&self, ttl: Duration) -> JoinHandle<()> {
        let caches = self.inner.caches.clone();
        let cancel = self.inner.shutdown.clone();
        let period = ttl.min(CACHE_SWEEP_MAX);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let evicted: usize = caches.iter().map(|c| c.evict_expired()).sum();
                        if evicted > 0 {
                            debug!(evicted, "expired prepared statements closed");
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        })
    }

    /// Stop background work, close every cached statement and connection.
    ///
    /// Idempotent: later calls return the outcome of the first.
    pub async fn close(&self) -> Result<(), TesseraError> {
        self.inner
            .close_outcome
            .get_or_init(|| self.close_inner())
            .await
            .to_result()
    }

    async fn close_inner(&self) -> CloseOutcome {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.shutdown.cancel();

        let tasks = std::mem::take(&mut *lock(&self.inner.tasks));
        for task in tasks {
            if let Err(e) = task.await {
                debug!(error = %e, "background task ended abnormally");
            }
        }

        let mut writer = self.inner.writer.lock().await;
        if writer.is_open()
            && let Err(e) = writer.batch(self.dialect().optimize).await
        {
            debug!(error = %e, "optimize at close failed");
        }

        for cache in &self.inner.caches {
            cache.close_all();
        }

        let writer_err = writer.close().await.err();
        drop(writer);

        let mut reader_errs = Vec::new();
        for slot in self.inner.readers.slots() {
            if let Err(e) = slot.lock().await.close().await {
                reader_errs.push(e);
            }
        }
        let reader_err = (!reader_errs.is_empty()).then(|| reader_errs.join("; "));

        if writer_err.is_none() && reader_err.is_none() {
            info!(backend = %self.backend(), "database closed");
        } else {
            warn!(writer = ?writer_err, reader = ?reader_err, "database closed with errors");
        }
        CloseOutcome {
            writer: writer_err,
            reader: reader_err,
        }
    }
}

/// `BEGIN` rejected because the connection is already inside a transaction.
fn is_nested_begin(err: &TesseraError) -> bool {
    match err {
        TesseraError::Query { source, .. } => {
            let msg = source.to_string();
            msg.contains("within a transaction") || msg.contains("already a transaction in progress")
        }
        _ => false,
    }
}

#[async_trait]
impl Executor for Database {
    fn backend(&self) -> Backend {
        self.inner.connector.backend()
    }

    /// Routed by leading keyword.
    async fn exec(&self, ctx: &Ctx, query: &str, args: &[Value]) -> Result<ExecResult, TesseraError> {
        let out = self.run(ctx, query, args, classify::route(query), false).await?;
        Ok(ExecResult {
            rows_affected: out.affected,
        })
    }

    /// Routed by leading keyword, so `INSERT ... RETURNING` reaches the writer.
    async fn query(&self, ctx: &Ctx, query: &str, args: &[Value]) -> Result<Vec<Row>, TesseraError> {
        Ok(self.run(ctx, query, args, classify::route(query), true).await?.rows)
    }
}
