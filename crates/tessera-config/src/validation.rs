// SPDX-FileCopyrightText: 2026 Tessera Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Post-deserialization validation for configuration values.
//!
//! Validates semantic constraints that cannot be expressed via serde attributes,
//! such as backend names, required connection parameters and positive intervals.

use std::path::Path;

use tessera_core::Backend;

use crate::diagnostic::{closest, ConfigError};
use crate::model::TesseraConfig;

/// TLS modes accepted for the client/server backend, with their libpq meaning.
pub const SUPPORTED_SSL_MODES: &[&str] = &[
    "disable",
    "allow",
    "prefer",
    "require",
    "verify-ca",
    "verify-full",
];

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Every spelling `storage.backend` accepts.
const BACKEND_NAMES: &[&str] = &[
    "sqlite",
    "sqlite3",
    "embedded",
    "postgres",
    "postgresql",
    "pg",
    "client-server",
];

const BACKEND_HINT: &str = "use `sqlite` (or `embedded`) for a local file, `postgres` (or `client-server`) for a server";

/// Validate a deserialized configuration for semantic correctness.
///
/// Returns `Ok(())` if all validations pass, or `Err(Vec<ConfigError>)` with
/// all collected validation errors (does not fail fast).
pub fn validate_config(config: &TesseraConfig) -> Result<(), Vec<ConfigError>> {
    let mut errors = Vec::new();
    let storage = &config.storage;

    let backend = match storage.backend.parse::<Backend>() {
        Ok(b) => Some(b),
        Err(_) => {
            let err = ConfigError::invalid(
                "storage.backend",
                format!("`{}` is not a supported backend", storage.backend),
            );
            errors.push(match closest(&storage.backend, BACKEND_NAMES) {
                Some(name) => err.with_hint(format!("did you mean `{name}`?")),
                None => err.with_hint(BACKEND_HINT),
            });
            None
        }
    };

    match backend {
        Some(Backend::Sqlite) => {
            let path = storage.sqlite.path.trim();
            if path.is_empty() {
                errors.push(
                    ConfigError::invalid("storage.sqlite.path", "must not be empty")
                        .with_hint("set it to a database file, e.g. `/var/lib/tessera/tessera.db`"),
                );
            } else if path == ":memory:" || path.starts_with("file::memory:") {
                // Each pooled connection would see its own private database.
                errors.push(
                    ConfigError::invalid(
                        "storage.sqlite.path",
                        "must be a file; in-memory databases are not shared across connections",
                    )
                    .with_hint("for throwaway data point it at a file in a temporary directory"),
                );
            } else if let Some(parent) = Path::new(path).parent()
                && !parent.as_os_str().is_empty()
                && parent.exists()
                && !parent.is_dir()
            {
                errors.push(ConfigError::invalid(
                    "storage.sqlite.path",
                    format!("parent `{}` is not a directory", parent.display()),
                ));
            }
        }
        Some(Backend::Postgres) => {
            let pg = &storage.postgres;
            for (name, value) in [
                ("host", &pg.host),
                ("user", &pg.user),
                ("database", &pg.database),
            ] {
                if value.trim().is_empty() {
                    errors.push(
                        ConfigError::invalid(
                            &format!("storage.postgres.{name}"),
                            "is required when storage.backend is postgres",
                        )
                        .with_hint(format!(
                            "add `{name} = \"...\"` under [storage.postgres] or set TESSERA_STORAGE_POSTGRES_{}",
                            name.to_ascii_uppercase()
                        )),
                    );
                }
            }
            if pg.port == 0 {
                errors.push(ConfigError::invalid("storage.postgres.port", "must be non-zero"));
            }
        }
        None => {}
    }

    let sslmode = &storage.postgres.sslmode;
    if !SUPPORTED_SSL_MODES.contains(&sslmode.as_str()) {
        let err = ConfigError::invalid(
            "storage.postgres.sslmode",
            format!("`{sslmode}` is not a supported TLS mode"),
        );
        errors.push(match closest(sslmode, SUPPORTED_SSL_MODES) {
            Some(mode) => err.with_hint(format!("did you mean `{mode}`?")),
            None => err.with_hint(format!("expected one of: {}", SUPPORTED_SSL_MODES.join(", "))),
        });
    }

    if let Some(root) = storage.postgres.sslrootcert.as_deref()
        && !root.trim().is_empty()
    {
        if !Path::new(root.trim()).is_file() {
            errors.push(
                ConfigError::invalid(
                    "storage.postgres.sslrootcert",
                    format!("`{root}` is not a readable file"),
                )
                .with_hint("point it at a PEM file with the server's CA, or remove the key"),
            );
        } else if sslmode == "disable" {
            errors.push(
                ConfigError::invalid("storage.postgres.sslrootcert", "is set but sslmode is `disable`")
                    .with_hint("use sslmode `verify-ca` or `verify-full` to check the server"),
            );
        }
    }

    if storage.pool.max_open < 1 {
        errors.push(ConfigError::invalid("storage.pool.max_open", "must be at least 1"));
    }

    if storage.statement_cache.ttl_secs == 0 {
        errors.push(ConfigError::invalid(
            "storage.statement_cache.ttl_secs",
            "must be greater than 0",
        ));
    }

    if storage.string_pool.interval_secs == 0 {
        errors.push(ConfigError::invalid(
            "storage.string_pool.interval_secs",
            "must be greater than 0",
        ));
    }

    if storage.string_pool.failure_escalation_threshold == 0 {
        errors.push(ConfigError::invalid(
            "storage.string_pool.failure_escalation_threshold",
            "must be at least 1",
        ));
    }

    if !LOG_LEVELS.contains(&config.logging.level.to_ascii_lowercase().as_str()) {
        errors.push(
            ConfigError::invalid("logging.level", format!("`{}` is not a log level", config.logging.level))
                .with_hint(format!("expected one of: {}", LOG_LEVELS.join(", "))),
        );
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
