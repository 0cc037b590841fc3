// SPDX-FileCopyrightText: 2026 Tessera Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration loader using Figment for layered config merging.
//!
//! Supports XDG hierarchy: `./tessera.toml` > `~/.config/tessera/tessera.toml` > `/etc/tessera/tessera.toml`
//! with environment variable overrides via `TESSERA_` prefix.

#![allow(clippy::result_large_err)] // figment::Error is external and cannot be boxed without wrapper

use std::path::{Path, PathBuf};

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};

use crate::model::TesseraConfig;

/// Section prefixes in the order they are tried; nested sections first so
/// `storage_pool_max_open` is not claimed by the bare `storage_` prefix.
const ENV_SECTIONS: &[(&str, &str)] = &[
    ("storage_sqlite_", "storage.sqlite."),
    ("storage_postgres_", "storage.postgres."),
    ("storage_pool_", "storage.pool."),
    ("storage_statement_cache_", "storage.statement_cache."),
    ("storage_string_pool_", "storage.string_pool."),
    ("storage_", "storage."),
    ("logging_", "logging."),
];

/// Load defaults, then every file in [`search_paths`], then `TESSERA_*`
/// environment variables. Later sources win.
pub fn load_config() -> Result<TesseraConfig, figment::Error> {
    build_figment().extract()
}

/// Load configuration from a TOML string only (no XDG lookup, no env).
///
/// Used for testing and explicit configuration.
pub fn load_config_from_str(toml_content: &str) -> Result<TesseraConfig, figment::Error> {
    Figment::new()
        .merge(Serialized::defaults(TesseraConfig::default()))
        .merge(Toml::string(toml_content))
        .extract()
}

/// Load configuration from a specific file path with env var overrides.
pub fn load_config_from_path(path: &Path) -> Result<TesseraConfig, figment::Error> {
    Figment::new()
        .merge(Serialized::defaults(TesseraConfig::default()))
        .merge(Toml::file(path))
        .merge(env_provider())
        .extract()
}

/// Config files in merge order, lowest precedence first.
pub fn search_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("/etc/tessera/tessera.toml")];
    if let Some(dir) = dirs::config_dir() {
        paths.push(dir.join("tessera/tessera.toml"));
    }
    paths.push(PathBuf::from("tessera.toml"));
    paths
}

/// Build the Figment used internally for config loading (exposed for diagnostic use).
///
/// Returns the Figment before extraction so callers can inspect metadata.
pub fn build_figment() -> Figment {
    search_paths()
        .into_iter()
        .fold(
            Figment::new().merge(Serialized::defaults(TesseraConfig::default())),
            |figment, path| figment.merge(Toml::file(path)),
        )
        .merge(env_provider())
}

/// Map a lowercased, prefix-stripped env var name onto its dotted config key.
///
/// Uses an explicit section table instead of `Env::split("_")` because key
/// names contain underscores: `TESSERA_STORAGE_POOL_MAX_OPEN` must become
/// `storage.pool.max_open`, not `storage.pool.max.open`.
pub fn map_env_key(key: &str) -> String {
    for (prefix, section) in ENV_SECTIONS {
        if let Some(rest) = key.strip_prefix(prefix) {
            return format!("{section}{rest}");
        }
    }
    key.to_string()
}

fn env_provider() -> Env {
    Env::prefixed("TESSERA_").map(|key| map_env_key(key.as_str()).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_paths_run_from_system_to_local() {
        let paths = search_paths();
        assert_eq!(paths.first(), Some(&PathBuf::from("/etc/tessera/tessera.toml")));
        assert_eq!(paths.last(), Some(&PathBuf::from("tessera.toml")));
        assert!(paths.len() <= 3);
    }

    #[test]
    fn env_keys_map_to_nested_sections() {
        assert_eq!(map_env_key("storage_backend"), "storage.backend");
        assert_eq!(map_env_key("storage_sqlite_path"), "storage.sqlite.path");
        assert_eq!(
            map_env_key("storage_sqlite_busy_timeout_ms"),
            "storage.sqlite.busy_timeout_ms"
        );
        assert_eq!(map_env_key("storage_pool_max_open"), "storage.pool.max_open");
        assert_eq!(
            map_env_key("storage_statement_cache_ttl_secs"),
            "storage.statement_cache.ttl_secs"
        );
        assert_eq!(
            map_env_key("storage_string_pool_interval_secs"),
            "storage.string_pool.interval_secs"
        );
        assert_eq!(map_env_key("logging_level"), "logging.level");
    }

    #[test]
    fn env_overrides_apply_on_top_of_file() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "tessera.toml",
                r#"
[storage]
backend = "sqlite"

[storage.pool]
max_open = 4
"#,
            )?;
            jail.set_env("TESSERA_STORAGE_POOL_MAX_OPEN", "16");
            jail.set_env("TESSERA_STORAGE_POSTGRES_HOST", "db.internal");

            let config = load_config_from_path(Path::new("tessera.toml"))?;
            assert_eq!(config.storage.pool.max_open, 16);
            assert_eq!(config.storage.postgres.host, "db.internal");
            assert_eq!(config.storage.backend, "sqlite");
            Ok(())
        });
    }
}
