// SPDX-FileCopyrightText: 2026 Tessera Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Transactions bound to one slot.
//!
//! A write transaction owns the write gate guard for its whole lifetime.
//! `commit`, `rollback` and `Drop` each release it, and because the first two
//! consume the transaction the guard can only be released once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tessera_core::{Backend, TesseraError};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, warn};

use crate::cache::StatementCache;
use crate::conn::{lock, Handle, Output, Prep, Slot};
use crate::context::Ctx;
use crate::dialect::Dialect;
use crate::executor::Executor;
use crate::value::{ExecResult, Row, Value};

/// Upper bound on moving a finished transaction's statements into the cache.
const PROMOTION_TIMEOUT: Duration = Duration::from_secs(5);

/// Options for [`Database::begin_tx`](crate::Database::begin_tx).
#[derive(Debug, Clone, Copy, Default)]
pub struct TxOptions {
    /// Run on a read pool connection without taking the write gate.
    pub read_only: bool,
}

impl TxOptions {
    pub fn write() -> Self {
        Self { read_only: false }
    }

    pub fn read_only() -> Self {
        Self { read_only: true }
    }
}

/// An open native transaction.
pub struct Transaction {
    guard: Option<OwnedMutexGuard<Slot>>,
    write: bool,
    dialect: &'static Dialect,
    /// Statements first prepared inside this transaction, promoted into the
    /// connection's cache once it finishes.
    touched: Mutex<HashMap<String, Handle>>,
}

impl Transaction {
    pub(crate) fn new(guard: OwnedMutexGuard<Slot>, write: bool) -> Self {
        let dialect = guard.dialect();
        Self {
            guard: Some(guard),
            write,
            dialect,
            touched: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_read_only(&self) -> bool {
        !self.write
    }

    fn slot(&self) -> Result<&Slot, TesseraError> {
        self.guard
            .as_deref()
            .ok_or_else(|| TesseraError::Internal("transaction already finished".to_string()))
    }

    fn remember(&self, sql: &str, handle: Handle) {
        lock(&self.touched)
            .entry(sql.to_string())
            .or_insert(handle);
    }

    async fn run(&self, ctx: &Ctx, query: &str, args: &[Value], want_rows: bool) -> Result<Output, TesseraError> {
        let slot = self.slot()?;
        let sql = self.dialect.rewrite(query);
        ctx.run(self.run_on(slot, &sql, args, want_rows)).await
    }

    async fn run_on(&self, slot: &Slot, sql: &str, args: &[Value], want_rows: bool) -> Result<Output, TesseraError> {
        if let Some((handle, generation)) = slot.cache.get(sql) {
            match slot.execute(sql, args, Prep::Cached(&handle), want_rows).await {
                Err(TesseraError::StaleStatement { query }) => {
                    slot.cache.invalidate_if(sql, generation);
                    // A failed statement aborts a PostgreSQL transaction, so
                    // only the embedded engine can retry in place.
                    if slot.backend() == Backend::Postgres {
                        return Err(TesseraError::StaleStatement { query });
                    }
                    crate::telemetry::record_stale_retry();
                    debug!(query = %sql, "stale prepared statement inside transaction, retrying once");
                }
                other => return other,
            }
        }

        match (slot.backend(), self.write) {
            // The single writer runs uncached statements ad hoc; they reach
            // the cache by promotion after the transaction ends.
            (Backend::Sqlite, true) => {
                let out = slot.execute(sql, args, Prep::AdHoc, want_rows).await?;
                self.remember(sql, Handle::Sqlite);
                Ok(out)
            }
            (Backend::Sqlite, false) => {
                let out = slot
                    .execute(sql, args, Prep::Cached(&Handle::Sqlite), want_rows)
                    .await?;
                self.remember(sql, Handle::Sqlite);
                Ok(out)
            }
            (Backend::Postgres, _) => {
                let handle = slot.prepare(sql).await?;
                let out = slot.execute(sql, args, Prep::Cached(&handle), want_rows).await?;
                self.remember(sql, handle);
                Ok(out)
            }
        }
    }

    /// Commit and release the connection (and the write gate).
    pub async fn commit(mut self, ctx: &Ctx) -> Result<(), TesseraError> {
        self.finish(ctx, "COMMIT").await
    }

    /// Roll back and release the connection (and the write gate).
    pub async fn rollback(mut self, ctx: &Ctx) -> Result<(), TesseraError> {
        self.finish(ctx, "ROLLBACK").await
    }

    async fn finish(&mut self, ctx: &Ctx, statement: &str) -> Result<(), TesseraError> {
        let Some(mut guard) = self.guard.take() else {
            return Err(TesseraError::Internal(
                "transaction already finished".to_string(),
            ));
        };
        let result = ctx.run(guard.batch(statement)).await;
        if result.is_ok() {
            guard.in_tx = false;
        }
        // On failure `in_tx` stays set and the next checkout rolls back.
        let cache = guard.cache.clone();
        drop(guard);

        let touched = std::mem::take(&mut *lock(&self.touched));
        promote(cache, touched);
        result
    }
}

/// Move statements first seen inside a finished transaction into the cache.
/// Best effort: runs detached, bounded by [`PROMOTION_TIMEOUT`].
fn promote(cache: Arc<StatementCache<Handle>>, touched: HashMap<String, Handle>) {
    if touched.is_empty() {
        return;
    }
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        return;
    };
    runtime.spawn(async move {
        let count = touched.len();
        let work = async move {
            for (sql, handle) in touched {
                if cache.is_closed() {
                    break;
                }
                if cache.get(&sql).is_none() {
                    cache.set(&sql, handle);
                }
                tokio::task::yield_now().await;
            }
        };
        match tokio::time::timeout(PROMOTION_TIMEOUT, work).await {
            Ok(()) => debug!(count, "promoted transaction statements into cache"),
            Err(_) => warn!(count, "statement promotion timed out"),
        }
    });
}

impl Drop for Transaction {
    fn drop(&mut self) {
        let Some(mut guard) = self.guard.take() else {
            return;
        };
        debug!(write = self.write, "transaction dropped without commit or rollback, rolling back");
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            // The guard moves into the task, so the gate opens only after ROLLBACK.
            runtime.spawn(async move {
                match guard.batch("ROLLBACK").await {
                    Ok(()) => guard.in_tx = false,
                    Err(e) => debug!(error = %e, "rollback of dropped transaction failed"),
                }
            });
        }
        // Without a runtime the guard drops here and `in_tx` forces a
        // rollback on the next checkout.
    }
}

#[async_trait]
impl Executor for Transaction {
    fn backend(&self) -> Backend {
        self.dialect.backend
    }

    async fn exec(&self, ctx: &Ctx, query: &str, args: &[Value]) -> Result<ExecResult, TesseraError> {
        let out = self.run(ctx, query, args, false).await?;
        Ok(ExecResult {
            rows_affected: out.affected,
        })
    }

    async fn query(&self, ctx: &Ctx, query: &str, args: &[Value]) -> Result<Vec<Row>, TesseraError> {
        Ok(self.run(ctx, query, args, true).await?.rows)
    }
}
