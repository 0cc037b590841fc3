// SPDX-FileCopyrightText: 2026 Tessera Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! `tessera status` command implementation.
//!
//! Opens the configured database without migrating it and reports health,
//! applied and pending migrations, and connection manager statistics.

use serde::Serialize;
use tessera_config::model::StorageConfig;
use tessera_core::{HealthStatus, TesseraError};
use tessera_storage::{Ctx, Database, MigrationStatus, OpenOptions, PoolStats};
use tokio_util::sync::CancellationToken;

/// Structured status output for `--json` mode.
#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub health: String,
    pub migrations: MigrationStatus,
    pub pool: PoolStats,
}

fn describe_health(health: &HealthStatus) -> String {
    match health {
        HealthStatus::Healthy => "healthy".to_string(),
        HealthStatus::Degraded(reason) => format!("degraded: {reason}"),
        HealthStatus::Unhealthy(reason) => format!("unhealthy: {reason}"),
    }
}

/// Run the `tessera status` command.
pub async fn run_status(
    config: &StorageConfig,
    shutdown: &CancellationToken,
    json: bool,
) -> Result<(), TesseraError> {
    let options = OpenOptions {
        migrate: false,
        background: false,
    };
    let db = Database::open_with(config, shutdown, options).await?;
    let ctx = Ctx::new(shutdown.clone());

    let collected = async {
        let health = db.health(&ctx).await;
        let migrations = db.migration_status(&ctx).await?;
        Ok::<_, TesseraError>(StatusReport {
            health: describe_health(&health),
            migrations,
            pool: db.stats(),
        })
    }
    .await;
    let closed = db.close().await;
    let report = collected?;
    closed?;

    if json {
        let rendered = serde_json::to_string_pretty(&report)
            .map_err(|e| TesseraError::Internal(format!("failed to encode status: {e}")))?;
        println!("{rendered}");
    } else {
        print_status(&report);
    }
    Ok(())
}

fn print_status(report: &StatusReport) {
    println!();
    println!("  tessera status");
    println!("  {}", "-".repeat(35));
    println!("    Backend:    {}", report.pool.backend);
    println!("    Target:     {}", report.pool.target);
    println!("    Health:     {}", report.health);
    println!(
        "    Read pool:  {} of {} connections open",
        report.pool.read_pool_open, report.pool.read_pool_size
    );
    println!(
        "    Statements: {} writer, {} reader",
        report.pool.writer_cached_statements, report.pool.reader_cached_statements
    );
    println!(
        "    Migrations: {} applied, {} pending",
        report.migrations.applied.len(),
        report.migrations.pending.len()
    );
    for filename in &report.migrations.pending {
        println!("      pending  {filename}");
    }
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::Backend;

    #[test]
    fn health_is_described_with_reason() {
        assert_eq!(describe_health(&HealthStatus::Healthy), "healthy");
        assert_eq!(
            describe_health(&HealthStatus::Degraded("reader: busy".into())),
            "degraded: reader: busy"
        );
    }

    #[test]
    fn status_report_serializes() {
        let report = StatusReport {
            health: "healthy".to_string(),
            migrations: MigrationStatus {
                applied: vec!["001_string_pool.sql".to_string()],
                pending: vec![],
            },
            pool: PoolStats {
                backend: Backend::Sqlite,
                target: "/tmp/t.db".to_string(),
                read_pool_size: 4,
                read_pool_open: 1,
                writer_cached_statements: 0,
                reader_cached_statements: 0,
                closed: false,
            },
        };
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"health\":\"healthy\""));
        assert!(json.contains("\"pending\":[]"));
        assert!(json.contains("\"read_pool_size\":4"));
    }
}
