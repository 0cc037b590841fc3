// SPDX-FileCopyrightText: 2026 Tessera Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! One-shot maintenance commands: migrate, string cleanup, bulk copy and
//! metrics rendering.

use std::path::Path;
use std::str::FromStr;

use tessera_config::model::StorageConfig;
use tessera_core::{Backend, TesseraError};
use tessera_prometheus::{record_pool_stats, set_build_info, PrometheusExporter};
use tessera_storage::{copy_sqlite_to_postgres, BulkOptions, Ctx, Database, OpenOptions};
use tokio_util::sync::CancellationToken;
use tracing::info;

const FOREGROUND: OpenOptions = OpenOptions {
    migrate: false,
    background: false,
};

/// Open without side effects, run `work`, and close even when `work` fails.
async fn with_database<T, F, Fut>(
    config: &StorageConfig,
    shutdown: &CancellationToken,
    work: F,
) -> Result<T, TesseraError>
where
    F: FnOnce(Database, Ctx) -> Fut,
    Fut: std::future::Future<Output = Result<T, TesseraError>>,
{
    let db = Database::open_with(config, shutdown, FOREGROUND).await?;
    let ctx = Ctx::new(shutdown.clone());
    let result = work(db.clone(), ctx).await;
    let closed = db.close().await;
    let value = result?;
    closed?;
    Ok(value)
}

/// `tessera migrate`: apply pending migrations and list them.
pub async fn run_migrate(config: &StorageConfig, shutdown: &CancellationToken) -> Result<(), TesseraError> {
    let applied = with_database(config, shutdown, |db, ctx| async move { db.migrate(&ctx).await }).await?;
    if applied.is_empty() {
        println!("tessera: schema is up to date");
    } else {
        for filename in &applied {
            println!("applied  {filename}");
        }
        println!("tessera: {} migration(s) applied", applied.len());
    }
    Ok(())
}

/// `tessera cleanup-strings`: one garbage collection sweep of the string pool.
pub async fn run_cleanup_strings(
    config: &StorageConfig,
    shutdown: &CancellationToken,
) -> Result<(), TesseraError> {
    let deleted = with_database(config, shutdown, |db, ctx| async move {
        db.migrate(&ctx).await?;
        db.cleanup_unused_strings(&ctx).await
    })
    .await?;
    println!("tessera: deleted {deleted} unreferenced string(s)");
    Ok(())
}

/// `tessera copy-to-postgres`: copy a SQLite file into the configured
/// PostgreSQL database, or report what would be copied.
pub async fn run_copy_to_postgres(
    config: &StorageConfig,
    shutdown: &CancellationToken,
    source: &Path,
    options: BulkOptions,
) -> Result<(), TesseraError> {
    let backend = Backend::from_str(&config.backend)
        .map_err(|_| TesseraError::Config(format!("unknown storage backend '{}'", config.backend)))?;
    if backend != Backend::Postgres {
        return Err(TesseraError::Config(
            "copy-to-postgres needs storage.backend = \"postgres\" as the destination".to_string(),
        ));
    }
    if !source.is_file() {
        return Err(TesseraError::Config(format!(
            "source database {} does not exist",
            source.display()
        )));
    }

    info!(source = %source.display(), apply = options.apply, "starting bulk copy");
    let report = with_database(config, shutdown, |db, ctx| async move {
        copy_sqlite_to_postgres(&ctx, source, &db, options).await
    })
    .await?;

    let rendered = serde_json::to_string_pretty(&report)
        .map_err(|e| TesseraError::Internal(format!("failed to encode report: {e}")))?;
    println!("{rendered}");
    Ok(())
}

/// `tessera metrics`: install the recorder, snapshot the database and print
/// the Prometheus text exposition.
pub async fn run_metrics(config: &StorageConfig, shutdown: &CancellationToken) -> Result<(), TesseraError> {
    let exporter = PrometheusExporter::install()?;
    set_build_info(env!("CARGO_PKG_VERSION"));

    with_database(config, shutdown, |db, ctx| async move {
        // A round trip on each endpoint so the query counters have samples.
        db.health(&ctx).await;
        record_pool_stats(&db.stats());
        Ok(())
    })
    .await?;

    print!("{}", exporter.render());
    Ok(())
}
