// SPDX-FileCopyrightText: 2026 Tessera Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration model structs for the Tessera storage engine.
//!
//! All structs use `#[serde(deny_unknown_fields)]` to reject unrecognized
//! config keys at startup, providing actionable error messages.

use serde::{Deserialize, Serialize};

/// Top-level Tessera configuration.
///
/// Loaded from TOML files following XDG hierarchy, with environment variable overrides.
/// All sections are optional and default to sensible values.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TesseraConfig {
    /// Storage backend settings.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Storage backend configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    /// Engine name: `sqlite` (aliases `sqlite3`, `embedded`) or `postgres`
    /// (aliases `postgresql`, `pg`, `client-server`).
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Embedded engine settings.
    #[serde(default)]
    pub sqlite: SqliteConfig,

    /// Client/server engine settings.
    #[serde(default)]
    pub postgres: PostgresConfig,

    /// Read pool sizing.
    #[serde(default)]
    pub pool: PoolConfig,

    /// Prepared statement cache settings.
    #[serde(default)]
    pub statement_cache: StatementCacheConfig,

    /// String pool garbage collection settings.
    #[serde(default)]
    pub string_pool: StringPoolConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            sqlite: SqliteConfig::default(),
            postgres: PostgresConfig::default(),
            pool: PoolConfig::default(),
            statement_cache: StatementCacheConfig::default(),
            string_pool: StringPoolConfig::default(),
        }
    }
}

fn default_backend() -> String {
    "sqlite".to_string()
}

/// Embedded engine (SQLite) configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SqliteConfig {
    /// Path to the database file.
    #[serde(default = "default_database_path")]
    pub path: String,

    /// How long a connection waits on a locked database before failing.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

fn default_database_path() -> String {
    dirs::data_dir()
        .map(|p| p.join("tessera").join("tessera.db"))
        .unwrap_or_else(|| std::path::PathBuf::from("tessera.db"))
        .to_string_lossy()
        .into_owned()
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

/// Client/server engine (PostgreSQL) configuration.
///
/// `host`, `user` and `database` are required when the postgres backend is selected.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PostgresConfig {
    #[serde(default)]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub user: String,

    /// Password. `None` relies on server-side trust or `.pgpass`-style auth.
    #[serde(default)]
    pub password: Option<String>,

    #[serde(default)]
    pub database: String,

    /// libpq TLS mode: `disable`, `allow`, `prefer`, `require`, `verify-ca`
    /// or `verify-full`.
    #[serde(default = "default_sslmode")]
    pub sslmode: String,

    /// PEM file with extra trusted roots. When set, `allow`, `prefer` and
    /// `require` also verify the certificate chain.
    #[serde(default)]
    pub sslrootcert: Option<String>,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_port(),
            user: String::new(),
            password: None,
            database: String::new(),
            sslmode: default_sslmode(),
            sslrootcert: None,
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

fn default_port() -> u16 {
    5432
}

fn default_sslmode() -> String {
    "disable".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    10
}

/// Read pool sizing.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PoolConfig {
    /// Ceiling on read connections. Beyond the `max_idle` opened at startup,
    /// another connection opens only when every open one is busy. On SQLite
    /// each reader is a file handle with its own page cache (64 MB budget),
    /// so size this to peak read concurrency rather than core count.
    #[serde(default = "default_max_open")]
    pub max_open: usize,

    /// Read connections opened eagerly at startup (capped at `max_open`).
    #[serde(default = "default_max_idle")]
    pub max_idle: usize,

    /// Connections older than this are reopened on their next checkout.
    #[serde(default = "default_max_lifetime_secs")]
    pub max_lifetime_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_open: default_max_open(),
            max_idle: default_max_idle(),
            max_lifetime_secs: default_max_lifetime_secs(),
        }
    }
}

fn default_max_open() -> usize {
    8
}

fn default_max_idle() -> usize {
    2
}

fn default_max_lifetime_secs() -> u64 {
    3_600
}

/// Prepared statement cache configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct StatementCacheConfig {
    /// Idle time after which a cached statement is closed.
    #[serde(default = "default_statement_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for StatementCacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_statement_ttl_secs(),
        }
    }
}

fn default_statement_ttl_secs() -> u64 {
    600
}

/// String pool garbage collection configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct StringPoolConfig {
    /// Run the background cleanup loop.
    #[serde(default = "default_cleanup_enabled")]
    pub cleanup_enabled: bool,

    /// Delay between startup and the first sweep.
    #[serde(default = "default_initial_delay_secs")]
    pub initial_delay_secs: u64,

    /// Period between sweeps.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Consecutive failures after which failures are logged at error level.
    #[serde(default = "default_failure_escalation_threshold")]
    pub failure_escalation_threshold: u32,
}

impl Default for StringPoolConfig {
    fn default() -> Self {
        Self {
            cleanup_enabled: default_cleanup_enabled(),
            initial_delay_secs: default_initial_delay_secs(),
            interval_secs: default_interval_secs(),
            failure_escalation_threshold: default_failure_escalation_threshold(),
        }
    }
}

fn default_cleanup_enabled() -> bool {
    true
}

fn default_initial_delay_secs() -> u64 {
    300
}

fn default_interval_secs() -> u64 {
    86_400
}

fn default_failure_escalation_threshold() -> u32 {
    3
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
