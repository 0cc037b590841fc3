// SPDX-FileCopyrightText: 2026 Tessera Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Embedded schema migrations.
//!
//! SQL files are compiled into the binary per backend and applied in
//! filename order. Applied files are recorded in `schema_migrations`; on the
//! client/server backend a cluster-wide advisory lock serializes concurrent
//! migrators.

use std::collections::HashSet;
use std::time::Duration;

use serde::Serialize;
use tessera_core::{Backend, TesseraError};
use tracing::{debug, info, warn};

use crate::conn::{Prep, Slot};
use crate::context::Ctx;
use crate::dialect::Dialect;
use crate::value::Value;

/// One bundled migration script.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub filename: &'static str,
    pub sql: &'static str,
}

macro_rules! bundle {
    ($dir:literal: $($file:literal),+ $(,)?) => {
        &[$(Migration {
            filename: $file,
            sql: include_str!(concat!("../migrations/", $dir, "/", $file)),
        }),+]
    };
}

const SQLITE_MIGRATIONS: &[Migration] = bundle!("sqlite":
    "001_string_pool.sql",
    "002_collections_documents.sql",
    "003_audit_events.sql",
    "004_documents_rebuild.sql",
    "005_string_pool_reference_indexes.sql",
);

const POSTGRES_MIGRATIONS: &[Migration] = bundle!("postgres":
    "001_string_pool.sql",
    "002_collections_documents.sql",
    "003_audit_events.sql",
    "004_documents_rebuild.sql",
    "005_string_pool_reference_indexes.sql",
);

/// Ledger entries recorded under an earlier filename: `(old, new)`.
const LEDGER_RENAMES: &[(&str, &str)] = &[("004_audit_events.sql", "003_audit_events.sql")];

/// Scripts that rebuild tables other tables reference. Run with foreign key
/// enforcement off where the backend needs that for a table rewrite.
const FOREIGN_KEYS_OFF: &[&str] = &["004_documents_rebuild.sql"];

/// `pg_try_advisory_lock` key guarding the migrator.
const MIGRATION_LOCK_KEY: i64 = 0x7465_7373_6572_6101;
const LOCK_POLL: Duration = Duration::from_millis(250);

const SQLITE_LEDGER: &str = "CREATE TABLE IF NOT EXISTS schema_migrations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    filename TEXT NOT NULL UNIQUE,
    applied_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
)";

const POSTGRES_LEDGER: &str = "CREATE TABLE IF NOT EXISTS schema_migrations (
    id BIGSERIAL PRIMARY KEY,
    filename TEXT NOT NULL UNIQUE,
    applied_at TEXT NOT NULL DEFAULT to_char(now() AT TIME ZONE 'UTC', 'YYYY-MM-DD\"T\"HH24:MI:SS.MS\"Z\"')
)";

/// Applied and pending migration files, in filename order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationStatus {
    pub applied: Vec<String>,
    pub pending: Vec<String>,
}

/// Bundled migrations for `backend`, sorted by filename.
pub fn bundled(backend: Backend) -> Vec<Migration> {
    let mut all = match backend {
        Backend::Sqlite => SQLITE_MIGRATIONS.to_vec(),
        Backend::Postgres => POSTGRES_MIGRATIONS.to_vec(),
    };
    all.sort_by_key(|m| m.filename);
    all
}

fn ledger_ddl(backend: Backend) -> &'static str {
    match backend {
        Backend::Sqlite => SQLITE_LEDGER,
        Backend::Postgres => POSTGRES_LEDGER,
    }
}

fn migration_err(filename: &str, e: TesseraError) -> TesseraError {
    TesseraError::Migration {
        filename: filename.to_string(),
        source: Box::new(e),
    }
}

/// Run `sql` on `slot`, rewriting `?` placeholders for the backend.
async fn exec(slot: &Slot, sql: &str, args: &[Value]) -> Result<u64, TesseraError> {
    let sql = slot.dialect().rewrite(sql);
    Ok(slot.execute(&sql, args, Prep::AdHoc, false).await?.affected)
}

async fn query_strings(slot: &Slot, sql: &str, args: &[Value]) -> Result<Vec<String>, TesseraError> {
    let sql = slot.dialect().rewrite(sql);
    let out = slot.execute(&sql, args, Prep::AdHoc, true).await?;
    out.rows.iter().map(|r| r.get::<String>(0)).collect()
}

/// Apply every pending migration on `slot` (the write slot).
/// Returns the filenames applied by this call.
pub(crate) async fn run(ctx: &Ctx, slot: &mut Slot) -> Result<Vec<String>, TesseraError> {
    let dialect = slot.dialect();
    if dialect.advisory_locks {
        acquire_lock(ctx, slot).await?;
    }
    let result = ctx
        .run(apply(slot, dialect, bundled(dialect.backend), FOREIGN_KEYS_OFF))
        .await;
    if dialect.advisory_locks {
        // An interrupted run may leave an aborted transaction that would
        // reject the unlock.
        if slot.in_tx && slot.batch("ROLLBACK").await.is_ok() {
            slot.in_tx = false;
        }
        let unlocked = slot
            .execute(
                "SELECT pg_advisory_unlock($1)",
                &[Value::Integer(MIGRATION_LOCK_KEY)],
                Prep::AdHoc,
                true,
            )
            .await;
        if let Err(e) = unlocked {
            warn!(error = %e, "failed to release migration lock");
        }
    }
    result
}

async fn acquire_lock(ctx: &Ctx, slot: &Slot) -> Result<(), TesseraError> {
    let mut waited = false;
    loop {
        let out = ctx
            .run(slot.execute(
                "SELECT pg_try_advisory_lock($1)",
                &[Value::Integer(MIGRATION_LOCK_KEY)],
                Prep::AdHoc,
                true,
            ))
            .await?;
        let acquired = out.rows.first().map(|r| r.get::<bool>(0)).transpose()?.unwrap_or(false);
        if acquired {
            if waited {
                debug!("migration lock acquired");
            }
            return Ok(());
        }
        if !waited {
            info!("another process is migrating, waiting for migration lock");
            waited = true;
        }
        ctx.sleep(LOCK_POLL).await?;
    }
}

async fn apply(
    slot: &mut Slot,
    dialect: &'static Dialect,
    migrations: Vec<Migration>,
    foreign_keys_off: &[&str],
) -> Result<Vec<String>, TesseraError> {
    slot.batch(ledger_ddl(dialect.backend)).await?;

    for (old, new) in LEDGER_RENAMES {
        let renamed = exec(
            slot,
            "UPDATE schema_migrations SET filename = ? WHERE filename = ? \
             AND NOT EXISTS (SELECT 1 FROM schema_migrations WHERE filename = ?)",
            &[(*new).into(), (*old).into(), (*new).into()],
        )
        .await?;
        if renamed > 0 {
            info!(from = %old, to = %new, "renamed migration ledger entry");
        }
    }

    let applied: HashSet<String> = query_strings(slot, "SELECT filename FROM schema_migrations", &[])
        .await?
        .into_iter()
        .collect();
    let pending: Vec<Migration> = migrations
        .into_iter()
        .filter(|m| !applied.contains(m.filename))
        .collect();
    if pending.is_empty() {
        debug!(applied = applied.len(), "schema is up to date");
        return Ok(Vec::new());
    }

    let mut done = Vec::with_capacity(pending.len());
    begin(slot, dialect).await?;
    for migration in &pending {
        let outcome = if foreign_keys_off.contains(&migration.filename) && dialect.fk_disable.is_some() {
            // Enforcement cannot be toggled inside a transaction.
            async {
                end(slot, "COMMIT").await?;
                apply_without_foreign_keys(slot, dialect, migration).await?;
                begin(slot, dialect).await
            }
            .await
        } else {
            apply_one(slot, migration).await
        };

        if let Err(e) = outcome {
            if slot.in_tx
                && let Err(rollback_err) = end(slot, "ROLLBACK").await
            {
                debug!(error = %rollback_err, "rollback after failed migration");
            }
            return Err(e);
        }
        debug!(filename = migration.filename, "migration applied");
        done.push(migration.filename.to_string());
    }
    end(slot, "COMMIT").await?;

    info!(count = done.len(), last = %done.last().map(String::as_str).unwrap_or_default(), "migrations applied");
    Ok(done)
}

async fn begin(slot: &mut Slot, dialect: &Dialect) -> Result<(), TesseraError> {
    slot.in_tx = true;
    slot.batch(dialect.begin_write).await
}

async fn end(slot: &mut Slot, statement: &str) -> Result<(), TesseraError> {
    slot.batch(statement).await?;
    slot.in_tx = false;
    Ok(())
}

async fn apply_one(slot: &Slot, migration: &Migration) -> Result<(), TesseraError> {
    slot.batch(migration.sql)
        .await
        .map_err(|e| migration_err(migration.filename, e))?;
    exec(
        slot,
        "INSERT INTO schema_migrations (filename) VALUES (?)",
        &[migration.filename.into()],
    )
    .await
    .map_err(|e| migration_err(migration.filename, e))?;
    Ok(())
}

/// Rebuild with enforcement off in a transaction of its own, verify, then
/// always try to switch enforcement back on. Failing to re-enable is fatal.
async fn apply_without_foreign_keys(
    slot: &mut Slot,
    dialect: &'static Dialect,
    migration: &Migration,
) -> Result<(), TesseraError> {
    let (Some(disable), Some(enable)) = (dialect.fk_disable, dialect.fk_enable) else {
        return apply_one(slot, migration).await;
    };
    slot.batch(disable)
        .await
        .map_err(|e| migration_err(migration.filename, e))?;
    info!(filename = migration.filename, "foreign key enforcement disabled for table rebuild");

    let rebuilt = rebuild(slot, dialect, migration).await;

    if let Err(e) = slot.batch(enable).await {
        return Err(TesseraError::ForeignKeyReenable {
            filename: migration.filename.to_string(),
            source: Box::new(e),
        });
    }
    debug!(filename = migration.filename, "foreign key enforcement re-enabled");
    rebuilt
}

async fn rebuild(slot: &mut Slot, dialect: &Dialect, migration: &Migration) -> Result<(), TesseraError> {
    begin(slot, dialect)
        .await
        .map_err(|e| migration_err(migration.filename, e))?;
    let result = async {
        apply_one(slot, migration).await?;
        if let Some(check) = dialect.fk_check {
            let out = slot
                .execute(check, &[], Prep::AdHoc, true)
                .await
                .map_err(|e| migration_err(migration.filename, e))?;
            if !out.rows.is_empty() {
                return Err(migration_err(
                    migration.filename,
                    TesseraError::Internal(format!(
                        "{} foreign key violation(s) after rebuild",
                        out.rows.len()
                    )),
                ));
            }
        }
        Ok(())
    }
    .await;

    match result {
        Ok(()) => end(slot, "COMMIT")
            .await
            .map_err(|e| migration_err(migration.filename, e)),
        Err(e) => {
            if let Err(rollback_err) = end(slot, "ROLLBACK").await {
                debug!(error = %rollback_err, "rollback after failed rebuild");
            }
            Err(e)
        }
    }
}

/// Applied and pending files without changing anything.
pub(crate) async fn status(ctx: &Ctx, slot: &Slot) -> Result<MigrationStatus, TesseraError> {
    let backend = slot.backend();
    let exists_sql = match backend {
        Backend::Sqlite => {
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'schema_migrations'"
        }
        Backend::Postgres => "SELECT to_regclass('schema_migrations')::text AS name",
    };
    let found = ctx.run(returns_value(slot, exists_sql)).await?;
    let applied: HashSet<String> = if found {
        ctx.run(query_strings(slot, "SELECT filename FROM schema_migrations", &[]))
            .await?
            .into_iter()
            .collect()
    } else {
        HashSet::new()
    };

    let mut status = MigrationStatus::default();
    for migration in bundled(backend) {
        if applied.contains(migration.filename) {
            status.applied.push(migration.filename.to_string());
        } else {
            status.pending.push(migration.filename.to_string());
        }
    }
    Ok(status)
}

/// Whether `sql` returned a row whose first column is not NULL.
async fn returns_value(slot: &Slot, sql: &str) -> Result<bool, TesseraError> {
    let out = slot.execute(sql, &[], Prep::AdHoc, true).await?;
    Ok(out
        .rows
        .first()
        .and_then(|r| r.values().first())
        .is_some_and(|v| !v.is_null()))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tessera_config::model::StorageConfig;
    use tempfile::TempDir;

    use super::*;
    use crate::conn::Connector;
    use crate::dialect::ConnRole;

    #[test]
    fn bundles_are_sorted_and_parallel() {
        let sqlite: Vec<_> = bundled(Backend::Sqlite).iter().map(|m| m.filename).collect();
        let postgres: Vec<_> = bundled(Backend::Postgres).iter().map(|m| m.filename).collect();
        let mut sorted = sqlite.clone();
        sorted.sort();
        assert_eq!(sqlite, sorted);
        assert_eq!(sqlite, postgres);
    }

    #[test]
    fn renames_point_at_bundled_files() {
        let names: Vec<_> = bundled(Backend::Sqlite).iter().map(|m| m.filename).collect();
        for (old, new) in LEDGER_RENAMES {
            assert!(names.contains(new));
            assert!(!names.contains(old));
        }
        for name in FOREIGN_KEYS_OFF {
            assert!(names.contains(name));
        }
    }

    #[test]
    fn scripts_do_not_manage_their_own_transactions() {
        for backend in [Backend::Sqlite, Backend::Postgres] {
            for m in bundled(backend) {
                let upper = m.sql.to_uppercase();
                assert!(!upper.contains("BEGIN;") && !upper.contains("COMMIT;"), "{}", m.filename);
            }
        }
    }

    // ---- Failure handling ----

    const CREATE_A: Migration = Migration {
        filename: "001_a.sql",
        sql: "CREATE TABLE a (id INTEGER PRIMARY KEY);",
    };
    const REBUILD_A: Migration = Migration {
        filename: "002_rebuild_a.sql",
        sql: "CREATE TABLE a_new (id INTEGER PRIMARY KEY);
              INSERT INTO a_new SELECT id FROM a;
              DROP TABLE a;
              ALTER TABLE a_new RENAME TO a;",
    };
    const CREATE_B: Migration = Migration {
        filename: "003_b.sql",
        sql: "CREATE TABLE b (id INTEGER);",
    };
    const BROKEN: Migration = Migration {
        filename: "004_broken.sql",
        sql: "CREATE TABLE c (id INTEGER); INSERT INTO no_such_table VALUES (1);",
    };
    const CREATE_D: Migration = Migration {
        filename: "005_d.sql",
        sql: "CREATE TABLE d (id INTEGER);",
    };

    async fn writer(dir: &TempDir) -> Slot {
        let mut config = StorageConfig::default();
        config.sqlite.path = dir.path().join("m.db").display().to_string();
        let connector = Arc::new(Connector::from_config(&config).unwrap());
        let mut slot = connector.slot(ConnRole::ReadWrite);
        slot.ensure_ready(None).await.unwrap();
        slot
    }

    async fn ledger(slot: &Slot) -> Vec<String> {
        query_strings(slot, "SELECT filename FROM schema_migrations ORDER BY filename", &[])
            .await
            .unwrap()
    }

    async fn has_table(slot: &Slot, name: &str) -> bool {
        let sql = format!("SELECT name FROM sqlite_master WHERE type = 'table' AND name = '{name}'");
        returns_value(slot, &sql).await.unwrap()
    }

    #[tokio::test]
    async fn failing_file_aborts_the_rest_and_keeps_committed_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut slot = writer(&dir).await;
        let sqlite = Dialect::for_backend(Backend::Sqlite);

        let err = apply(
            &mut slot,
            sqlite,
            vec![CREATE_A, REBUILD_A, CREATE_B, BROKEN, CREATE_D],
            &["002_rebuild_a.sql"],
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TesseraError::Migration { ref filename, .. } if filename == "004_broken.sql"));
        assert!(!slot.in_tx);

        // The rebuild committed everything before it; 003 shared a
        // transaction with the broken file and was rolled back.
        assert_eq!(ledger(&slot).await, vec!["001_a.sql", "002_rebuild_a.sql"]);
        assert!(has_table(&slot, "a").await);
        for gone in ["b", "c", "d"] {
            assert!(!has_table(&slot, gone).await, "{gone} should not exist");
        }

        // Fix forward: the next run picks up where the failure left off.
        let applied = apply(
            &mut slot,
            sqlite,
            vec![CREATE_A, REBUILD_A, CREATE_B, CREATE_D],
            &["002_rebuild_a.sql"],
        )
        .await
        .unwrap();
        assert_eq!(applied, vec!["003_b.sql", "005_d.sql"]);
        slot.close().await.unwrap();
    }

    #[tokio::test]
    async fn foreign_key_reenable_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut slot = writer(&dir).await;
        let broken_enable: &'static Dialect = Box::leak(Box::new(Dialect {
            fk_enable: Some("UPDATE no_such_table SET enforced = 1"),
            ..*Dialect::for_backend(Backend::Sqlite)
        }));

        let err = apply(
            &mut slot,
            broken_enable,
            vec![CREATE_A, REBUILD_A, CREATE_B],
            &["002_rebuild_a.sql"],
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            TesseraError::ForeignKeyReenable { ref filename, .. } if filename == "002_rebuild_a.sql"
        ));
        assert_eq!(ledger(&slot).await, vec!["001_a.sql", "002_rebuild_a.sql"]);
        assert!(!has_table(&slot, "b").await);
        slot.close().await.unwrap();
    }
}
