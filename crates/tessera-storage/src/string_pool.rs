// SPDX-FileCopyrightText: 2026 Tessera Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! String interning with garbage collection.
//!
//! Repeated strings (names, titles, MIME types, tags, actors, actions) are
//! stored once in `string_pool` and referenced by id. A periodic sweep
//! deletes rows no interned column references any more.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tessera_config::model::StringPoolConfig;
use tessera_core::TesseraError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::context::Ctx;
use crate::database::Database;
use crate::dialect::Backend;
use crate::executor::Executor;
use crate::transaction::TxOptions;
use crate::value::Value;

/// Every `(table, column)` holding a string pool id. A column missing here
/// would have its strings deleted by the next sweep.
pub const INTERNED_COLUMNS: &[(&str, &str)] = &[
    ("collections", "name_id"),
    ("documents", "title_id"),
    ("documents", "mime_type_id"),
    ("document_tags", "tag_id"),
    ("audit_events", "actor_id"),
    ("audit_events", "action_id"),
];

/// Ids per `IN (...)` lookup, well under either engine's parameter limit.
const LOOKUP_CHUNK: usize = 500;

const INSERT: &str =
    "INSERT INTO string_pool (value) VALUES (?) ON CONFLICT (value) DO NOTHING RETURNING id";

const LOOKUP: &str = "SELECT id FROM string_pool WHERE value = ?";

/// Intern `value`, returning its id. Concurrent callers with the same value
/// converge on one id.
///
/// An existing value is read back instead of rewritten, so interning a known
/// string never takes a row lock or writes a new row version.
pub async fn get_or_create_string_id<E: Executor + ?Sized>(
    exec: &E,
    ctx: &Ctx,
    value: &str,
) -> Result<i64, TesseraError> {
    let args = [Value::from(value)];
    if let Some(row) = exec.query_row(ctx, INSERT, &args).await? {
        return row.get(0);
    }
    let row = exec.query_row(ctx, LOOKUP, &args).await?.ok_or_else(|| {
        TesseraError::Internal(format!("string pool value `{value}` neither inserted nor found"))
    })?;
    row.get(0)
}

pub async fn get_string_by_id<E: Executor + ?Sized>(
    exec: &E,
    ctx: &Ctx,
    id: i64,
) -> Result<Option<String>, TesseraError> {
    match exec
        .query_row(ctx, "SELECT value FROM string_pool WHERE id = ?", &[id.into()])
        .await?
    {
        Some(row) => row.get(0).map(Some),
        None => Ok(None),
    }
}

/// Resolve many ids at once. Unknown ids are absent from the result.
pub async fn get_strings_by_ids<E: Executor + ?Sized>(
    exec: &E,
    ctx: &Ctx,
    ids: &[i64],
) -> Result<HashMap<i64, String>, TesseraError> {
    let mut out = HashMap::new();
    if ids.is_empty() {
        return Ok(out);
    }
    let unique: Vec<i64> = ids.iter().copied().collect::<BTreeSet<_>>().into_iter().collect();
    for chunk in unique.chunks(LOOKUP_CHUNK) {
        let placeholders = vec!["?"; chunk.len()].join(", ");
        let query = format!("SELECT id, value FROM string_pool WHERE id IN ({placeholders})");
        let args: Vec<Value> = chunk.iter().map(|id| Value::from(*id)).collect();
        for row in exec.query(ctx, &query, &args).await? {
            out.insert(row.get::<i64>(0)?, row.get::<String>(1)?);
        }
    }
    Ok(out)
}

fn create_refs_table(backend: Backend) -> &'static str {
    match backend {
        Backend::Sqlite => "CREATE TEMP TABLE IF NOT EXISTS string_pool_refs (id INTEGER PRIMARY KEY)",
        Backend::Postgres => {
            "CREATE TEMP TABLE IF NOT EXISTS string_pool_refs (id BIGINT PRIMARY KEY) ON COMMIT DROP"
        }
    }
}

/// Resets the single-flight flag however the sweep ends.
struct RunningGuard<'a>(&'a std::sync::atomic::AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Delete every string pool row no interned column references.
///
/// Runs in one write transaction. Returns `0` without doing anything when
/// another sweep is already running.
pub async fn cleanup_unused_strings(db: &Database, ctx: &Ctx) -> Result<u64, TesseraError> {
    let flag = &db.inner.cleanup_running;
    if flag.swap(true, Ordering::AcqRel) {
        debug!("string pool cleanup already running, skipping");
        return Ok(0);
    }
    let _running = RunningGuard(flag);

    let started = Instant::now();
    let tx = db.begin_tx(ctx, TxOptions::write()).await?;
    let swept = async {
        tx.exec(ctx, create_refs_table(tx.backend()), &[]).await?;
        for (table, column) in INTERNED_COLUMNS {
            // The WHERE clause keeps SQLite from parsing ON CONFLICT as a join constraint.
            let collect = format!(
                "INSERT INTO string_pool_refs (id) SELECT DISTINCT {column} FROM {table} \
                 WHERE {column} IS NOT NULL ON CONFLICT DO NOTHING"
            );
            tx.exec(ctx, &collect, &[]).await?;
        }
        let deleted = tx
            .exec(
                ctx,
                "DELETE FROM string_pool WHERE id NOT IN (SELECT id FROM string_pool_refs)",
                &[],
            )
            .await?
            .rows_affected;
        tx.exec(ctx, "DROP TABLE IF EXISTS string_pool_refs", &[]).await?;
        Ok::<_, TesseraError>(deleted)
    }
    .await;

    match swept {
        Ok(deleted) => {
            tx.commit(ctx).await?;
            let elapsed = started.elapsed();
            crate::telemetry::record_string_pool_cleanup(deleted, elapsed.as_secs_f64());
            info!(deleted, elapsed_ms = elapsed.as_millis() as u64, "string pool cleanup complete");
            Ok(deleted)
        }
        Err(e) => {
            if let Err(rollback_err) = tx.rollback(ctx).await {
                debug!(error = %rollback_err, "rollback after failed string pool cleanup");
            }
            Err(e)
        }
    }
}

/// Periodic sweep: first run after `initial_delay_secs`, then every
/// `interval_secs`, until shutdown. Holds only a weak reference between runs.
pub(crate) fn spawn_cleanup_loop(db: &Database, config: &StringPoolConfig) -> JoinHandle<()> {
    let weak = Arc::downgrade(&db.inner);
    let cancel = db.shutdown_token().clone();
    let initial_delay = Duration::from_secs(config.initial_delay_secs);
    let period = Duration::from_secs(config.interval_secs.max(1));
    let threshold = config.failure_escalation_threshold.max(1);

    tokio::spawn(async move {
        let ctx = Ctx::new(cancel.clone());
        if ctx.sleep(initial_delay).await.is_err() {
            return;
        }
        let mut interval = tokio::time::interval(period);
        let mut failures: u32 = 0;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let Some(inner) = weak.upgrade() else {
                        debug!("database dropped, string pool cleanup loop exiting");
                        break;
                    };
                    let db = Database { inner };
                    match cleanup_unused_strings(&db, &ctx).await {
                        Ok(_) => failures = 0,
                        Err(e) if e.is_interrupted() && ctx.is_cancelled() => break,
                        Err(e) => {
                            failures = failures.saturating_add(1);
                            crate::telemetry::record_string_pool_failure();
                            if failures >= threshold {
                                error!(error = %e, consecutive_failures = failures, "string pool cleanup keeps failing");
                            } else {
                                warn!(error = %e, consecutive_failures = failures, "string pool cleanup failed");
                            }
                        }
                    }
                }
                _ = cancel.cancelled() => {
                    debug!("string pool cleanup loop shutting down");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tessera_config::model::StorageConfig;
    use tokio_util::sync::CancellationToken;

    #[test]
    fn interned_columns_are_unique_and_named_by_convention() {
        let unique: HashSet<_> = INTERNED_COLUMNS.iter().collect();
        assert_eq!(unique.len(), INTERNED_COLUMNS.len());
        assert!(INTERNED_COLUMNS.iter().all(|(_, column)| column.ends_with("_id")));
    }

    #[test]
    fn refs_table_is_temporary_on_both_backends() {
        assert!(create_refs_table(Backend::Sqlite).starts_with("CREATE TEMP TABLE"));
        assert!(create_refs_table(Backend::Postgres).contains("ON COMMIT DROP"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn overlapping_cleanup_returns_zero_for_the_second_caller() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = StorageConfig::default();
        config.sqlite.path = dir.path().join("pool.db").display().to_string();
        config.string_pool.cleanup_enabled = false;
        let db = Arc::new(Database::open(&config, &CancellationToken::new()).await.unwrap());
        let ctx = Ctx::background();
        get_or_create_string_id(db.as_ref(), &ctx, "orphan").await.unwrap();

        // Hold the write gate so the first sweep parks inside begin_tx.
        let held = db.begin_tx(&ctx, TxOptions::write()).await.unwrap();
        let first = {
            let db = db.clone();
            tokio::spawn(async move { cleanup_unused_strings(&db, &Ctx::background()).await })
        };
        tokio::time::timeout(Duration::from_secs(5), async {
            while !db.inner.cleanup_running.load(Ordering::Acquire) {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("first sweep should start");

        assert_eq!(cleanup_unused_strings(&db, &ctx).await.unwrap(), 0);
        assert!(!first.is_finished());

        held.rollback(&ctx).await.unwrap();
        assert_eq!(first.await.unwrap().unwrap(), 1);
        assert!(!db.inner.cleanup_running.load(Ordering::Acquire));
        db.close().await.unwrap();
    }
}
