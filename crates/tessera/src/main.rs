// SPDX-FileCopyrightText: 2026 Tessera Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Tessera - operator CLI for the Tessera storage engine.

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

mod commands;
mod shutdown;
mod status;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tessera_config::model::TesseraConfig;
use tessera_storage::bulk::DEFAULT_BATCH_SIZE;
use tessera_storage::BulkOptions;

/// Tessera - embedded storage engine over SQLite or PostgreSQL.
#[derive(Parser, Debug)]
#[command(name = "tessera", version, about, long_about = None)]
struct Cli {
    /// Read configuration from this file instead of the standard locations.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
enum Commands {
    /// Apply pending schema migrations.
    Migrate,
    /// Show backend, health, migration state and cache sizes.
    Status {
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Delete string pool entries no longer referenced.
    CleanupStrings,
    /// Copy a SQLite database into the configured PostgreSQL database.
    CopyToPostgres {
        /// SQLite file to read from.
        #[arg(long, value_name = "PATH")]
        source: PathBuf,
        /// Write to PostgreSQL. Without it only a dry-run report is printed.
        #[arg(long)]
        apply: bool,
        /// Rows per COPY batch.
        #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
        batch_size: usize,
    },
    /// Print metrics in Prometheus text format.
    Metrics,
}

fn load_config(path: Option<&PathBuf>) -> TesseraConfig {
    let loaded = match path {
        Some(path) => tessera_config::load_and_validate_path(path),
        None => tessera_config::load_and_validate(),
    };
    match loaded {
        Ok(config) => config,
        Err(errors) => {
            tessera_config::render_errors(&errors);
            std::process::exit(1);
        }
    }
}

/// Initialize the tracing subscriber on stderr so command output stays
/// machine-readable. `RUST_LOG` overrides the configured level.
fn init_tracing(log_level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("tessera={log_level},warn")));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_names(false)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref());
    init_tracing(&config.logging.level);

    let shutdown = shutdown::install_signal_handler();
    let storage = &config.storage;

    let result = match cli.command {
        Commands::Migrate => commands::run_migrate(storage, &shutdown).await,
        Commands::Status { json } => status::run_status(storage, &shutdown, json).await,
        Commands::CleanupStrings => commands::run_cleanup_strings(storage, &shutdown).await,
        Commands::CopyToPostgres {
            source,
            apply,
            batch_size,
        } => {
            let options = BulkOptions { apply, batch_size };
            commands::run_copy_to_postgres(storage, &shutdown, &source, options).await
        }
        Commands::Metrics => commands::run_metrics(storage, &shutdown).await,
    };

    if let Err(e) = result {
        eprintln!("tessera: {e}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(not(target_env = "msvc"))]
    fn jemalloc_is_active() {
        // Only jemalloc supports advancing the epoch.
        use tikv_jemalloc_ctl::{epoch, stats};
        epoch::advance().unwrap();
        let allocated = stats::allocated::read().unwrap();
        assert!(allocated > 0, "jemalloc should report non-zero allocation");
    }

    #[test]
    fn copy_defaults_to_dry_run() {
        let cli = Cli::try_parse_from(["tessera", "copy-to-postgres", "--source", "old.db"]).unwrap();
        match cli.command {
            Commands::CopyToPostgres {
                source,
                apply,
                batch_size,
            } => {
                assert_eq!(source, PathBuf::from("old.db"));
                assert!(!apply);
                assert_eq!(batch_size, DEFAULT_BATCH_SIZE);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn config_flag_is_global() {
        let cli = Cli::try_parse_from(["tessera", "status", "--json", "--config", "t.toml"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("t.toml")));
        assert!(matches!(cli.command, Commands::Status { json: true }));
    }

    #[test]
    fn copy_requires_source() {
        assert!(Cli::try_parse_from(["tessera", "copy-to-postgres", "--apply"]).is_err());
    }
}
