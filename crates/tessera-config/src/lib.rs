// SPDX-FileCopyrightText: 2026 Tessera Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration for the Tessera storage engine.
//!
//! Settings come from built-in defaults, then the files listed by
//! [`loader::search_paths`], then `TESSERA_*` environment variables. The
//! result is checked by [`validation::validate_config`]. Parse and
//! validation failures are returned together as [`ConfigError`]s, pointing
//! at the offending key in its source file where one can be found.
//!
//! ```no_run
//! let config = tessera_config::load_and_validate().unwrap_or_else(|errors| {
//!     tessera_config::render_errors(&errors);
//!     std::process::exit(1);
//! });
//! println!("backend: {}", config.storage.backend);
//! ```

pub mod connection;
pub mod diagnostic;
pub mod loader;
pub mod model;
pub mod validation;

use std::path::Path;

pub use connection::{postgres_url, redacted_postgres_url};
pub use diagnostic::{render_errors, ConfigError};
pub use loader::{load_config, load_config_from_path, load_config_from_str};
pub use model::TesseraConfig;

/// Load from the search paths and the environment, then validate.
pub fn load_and_validate() -> Result<TesseraConfig, Vec<ConfigError>> {
    finish(loader::load_config(), || {
        loader::search_paths()
            .iter()
            .filter_map(|path| read_source(path))
            .collect()
    })
}

/// Load one explicit file plus environment overrides, then validate.
pub fn load_and_validate_path(path: &Path) -> Result<TesseraConfig, Vec<ConfigError>> {
    finish(loader::load_config_from_path(path), || {
        read_source(path).into_iter().collect()
    })
}

/// Validate an in-memory TOML document. Environment variables are ignored.
pub fn load_and_validate_str(toml_content: &str) -> Result<TesseraConfig, Vec<ConfigError>> {
    finish(loader::load_config_from_str(toml_content), || {
        vec![("<inline>".to_string(), toml_content.to_string())]
    })
}

/// Validate a loaded config, or turn the load error into diagnostics. The
/// sources are only read on failure, for span resolution.
fn finish(
    loaded: Result<TesseraConfig, figment::Error>,
    sources: impl FnOnce() -> Vec<(String, String)>,
) -> Result<TesseraConfig, Vec<ConfigError>> {
    match loaded {
        Ok(config) => {
            validation::validate_config(&config)?;
            Ok(config)
        }
        Err(err) => Err(diagnostic::figment_to_config_errors(err, &sources())),
    }
}

fn read_source(path: &Path) -> Option<(String, String)> {
    let content = std::fs::read_to_string(path).ok()?;
    let shown = if path.is_relative() {
        std::env::current_dir()
            .map(|dir| dir.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    } else {
        path.to_path_buf()
    };
    Some((shown.display().to_string(), content))
}
