// SPDX-FileCopyrightText: 2026 Tessera Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration diagnostics.
//!
//! Figment extraction errors and validation failures become miette reports
//! that point at the offending line of `tessera.toml`. An unknown key gets a
//! suggestion scoped to the section it was written in, or is redirected to
//! the section it actually belongs to (`busy_timeout_ms` under `[storage]`
//! belongs in `[storage.sqlite]`).

#![allow(unused_assignments)] // miette's Diagnostic derive generates code triggering this lint

use miette::{Diagnostic, NamedSource, SourceSpan};
use thiserror::Error;

/// Minimum Jaro-Winkler similarity for a "did you mean" suggestion.
const SUGGESTION_THRESHOLD: f64 = 0.75;

/// Keys accepted in each section, by dotted section path.
pub const SECTION_KEYS: &[(&str, &[&str])] = &[
    ("", &["storage", "logging"]),
    (
        "storage",
        &["backend", "sqlite", "postgres", "pool", "statement_cache", "string_pool"],
    ),
    ("storage.sqlite", &["path", "busy_timeout_ms"]),
    (
        "storage.postgres",
        &[
            "host",
            "port",
            "user",
            "password",
            "database",
            "sslmode",
            "sslrootcert",
            "connect_timeout_secs",
        ],
    ),
    ("storage.pool", &["max_open", "max_idle", "max_lifetime_secs"]),
    ("storage.statement_cache", &["ttl_secs"]),
    (
        "storage.string_pool",
        &["cleanup_enabled", "initial_delay_secs", "interval_secs", "failure_escalation_threshold"],
    ),
    ("logging", &["level"]),
];

/// What an unknown key probably meant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Suggestion {
    /// A close spelling of a key in the same section.
    Spelling(String),
    /// The key is valid verbatim in this other section.
    Elsewhere(String),
}

/// A configuration problem, rendered by miette.
#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("unknown key `{key}` in {}", section_label(.section))]
    #[diagnostic(
        code(tessera::config::unknown_key),
        help("{}", unknown_key_help(section, key, suggestion.as_ref(), valid_keys))
    )]
    UnknownKey {
        /// Dotted section the key was found in; empty at the top level.
        section: String,
        key: String,
        suggestion: Option<Suggestion>,
        /// Comma-separated keys the section accepts.
        valid_keys: String,
        #[label("not recognized here")]
        span: Option<SourceSpan>,
        #[source_code]
        src: Option<NamedSource<String>>,
    },

    #[error("`{key}` should be {expected}, found {found}")]
    #[diagnostic(code(tessera::config::invalid_type))]
    InvalidType {
        /// Full dotted key.
        key: String,
        found: String,
        expected: String,
        #[help]
        hint: Option<String>,
        #[label("wrong type")]
        span: Option<SourceSpan>,
        #[source_code]
        src: Option<NamedSource<String>>,
    },

    /// A value that parsed but is not acceptable.
    #[error("`{key}` {message}")]
    #[diagnostic(code(tessera::config::invalid_value))]
    InvalidValue {
        key: String,
        message: String,
        #[help]
        hint: Option<String>,
    },

    #[error("configuration error: {0}")]
    #[diagnostic(code(tessera::config::other))]
    Other(String),
}

impl ConfigError {
    pub fn invalid(key: &str, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            key: key.to_string(),
            message: message.into(),
            hint: None,
        }
    }

    /// Attach a help line. No effect on variants that compute their own.
    pub fn with_hint(mut self, text: impl Into<String>) -> Self {
        if let ConfigError::InvalidValue { hint, .. } | ConfigError::InvalidType { hint, .. } = &mut self {
            *hint = Some(text.into());
        }
        self
    }

    /// The dotted key this error is about, if it names one.
    pub fn key(&self) -> Option<&str> {
        match self {
            ConfigError::UnknownKey { key, .. }
            | ConfigError::InvalidType { key, .. }
            | ConfigError::InvalidValue { key, .. } => Some(key),
            ConfigError::Other(_) => None,
        }
    }
}

fn section_label(section: &str) -> String {
    if section.is_empty() {
        "the top level".to_string()
    } else {
        format!("[{section}]")
    }
}

fn dotted(section: &str, key: &str) -> String {
    if section.is_empty() {
        key.to_string()
    } else {
        format!("{section}.{key}")
    }
}

fn unknown_key_help(
    section: &str,
    key: &str,
    suggestion: Option<&Suggestion>,
    valid_keys: &str,
) -> String {
    match suggestion {
        Some(Suggestion::Spelling(s)) => format!(
            "did you mean `{}`? Keys in {}: {valid_keys}",
            dotted(section, s),
            section_label(section)
        ),
        Some(Suggestion::Elsewhere(home)) => {
            format!("`{key}` belongs in {}; move it there", section_label(home))
        }
        None => format!("keys in {}: {valid_keys}", section_label(section)),
    }
}

/// Suggest what `key`, found in `section`, was meant to be.
///
/// A key that exists verbatim in another section wins over a fuzzy match,
/// since a misplaced key is the likelier mistake.
pub fn suggest_for(section: &str, key: &str, valid: &[&str]) -> Option<Suggestion> {
    let home = SECTION_KEYS
        .iter()
        .find(|(name, keys)| *name != section && keys.contains(&key));
    if let Some((name, _)) = home {
        return Some(Suggestion::Elsewhere(name.to_string()));
    }
    closest(key, valid).map(|s| Suggestion::Spelling(s.to_string()))
}

/// The candidate most similar to `input`, if any is close enough.
pub fn closest<'a>(input: &str, candidates: &[&'a str]) -> Option<&'a str> {
    let input = input.trim().to_ascii_lowercase();
    candidates
        .iter()
        .map(|&c| (c, strsim::jaro_winkler(&input, c)))
        .filter(|(_, score)| *score > SUGGESTION_THRESHOLD)
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(c, _)| c)
}

/// What a well-typed value for `key` looks like.
fn type_hint(key: &str) -> Option<&'static str> {
    let field = key.rsplit('.').next().unwrap_or(key);
    let hint = match field {
        "port" => "a TCP port number without quotes, e.g. `5432`",
        "cleanup_enabled" => "`true` or `false` without quotes",
        "max_open" | "max_idle" | "failure_escalation_threshold" => "a positive whole number",
        "password" | "sslrootcert" | "path" | "host" => "a quoted string",
        f if f.ends_with("_secs") => "a whole number of seconds, e.g. `30`",
        f if f.ends_with("_ms") => "a whole number of milliseconds, e.g. `5000`",
        _ => return None,
    };
    Some(hint)
}

/// Convert every error inside a `figment::Error` into a diagnostic.
///
/// `toml_sources` holds `(path, content)` for each file that may have
/// contributed, so spans can point into the right one.
pub fn figment_to_config_errors(
    err: figment::Error,
    toml_sources: &[(String, String)],
) -> Vec<ConfigError> {
    use figment::error::Kind;

    err.into_iter()
        .map(|error| {
            let path: Vec<String> = error.path.clone();
            match &error.kind {
                Kind::UnknownField(field, expected) => {
                    let section = path.join(".");
                    let (span, src) = locate(&error, &path, field, toml_sources);
                    ConfigError::UnknownKey {
                        suggestion: suggest_for(&section, field, expected),
                        valid_keys: expected.join(", "),
                        section,
                        key: field.clone(),
                        span,
                        src,
                    }
                }
                Kind::InvalidType(actual, expected) => {
                    let (section, field) = match path.split_last() {
                        Some((field, section)) => (section.to_vec(), field.clone()),
                        None => (Vec::new(), String::new()),
                    };
                    let (span, src) = locate(&error, &section, &field, toml_sources);
                    let key = path.join(".");
                    ConfigError::InvalidType {
                        hint: type_hint(&key).map(str::to_string),
                        found: actual.to_string(),
                        expected: expected.clone(),
                        key,
                        span,
                        src,
                    }
                }
                Kind::MissingField(field) => {
                    ConfigError::invalid(&dotted(&path.join("."), field), "is required")
                }
                _ => ConfigError::Other(error.to_string()),
            }
        })
        .collect()
}

/// Find the span of `field` inside `section` in the file the error came from.
fn locate(
    error: &figment::error::Error,
    section: &[String],
    field: &str,
    toml_sources: &[(String, String)],
) -> (Option<SourceSpan>, Option<NamedSource<String>>) {
    let origin = error
        .metadata
        .as_ref()
        .and_then(|m| m.source.as_ref())
        .and_then(|s| match s {
            figment::Source::File(path) => Some(path.display().to_string()),
            _ => None,
        });
    let found = toml_sources
        .iter()
        .filter(|(p, _)| origin.as_deref().is_none_or(|o| o == p.as_str()))
        .find_map(|(p, content)| find_key_offset(content, section, field).map(|o| (p, content, o)));

    match found {
        Some((path, content, offset)) => (
            Some(SourceSpan::new(offset.into(), field.len())),
            Some(NamedSource::new(path, content.clone())),
        ),
        None => (None, None),
    }
}

/// Byte offset of `field` as a key inside table `[section]` (dotted path),
/// or before the first table header when `section` is empty.
pub fn find_key_offset(content: &str, section: &[String], field: &str) -> Option<usize> {
    let wanted = section.join(".");
    let mut current = String::new();
    let mut offset = 0;
    for line in content.split_inclusive('\n') {
        let trimmed = line.trim_start();
        let indent = line.len() - trimmed.len();
        if let Some(header) = trimmed.strip_prefix('[') {
            if let Some(end) = header.find(']') {
                current = header[..end].trim().to_string();
            }
        } else if current == wanted
            && let Some(rest) = trimmed.strip_prefix(field)
            && rest.trim_start().starts_with('=')
        {
            return Some(offset + indent);
        }
        offset += line.len();
    }
    None
}

/// Render diagnostics to stderr with miette's graphical handler.
pub fn render_errors(errors: &[ConfigError]) {
    let handler = miette::GraphicalReportHandler::new();
    let mut out = String::new();
    for error in errors {
        let before = out.len();
        if handler.render_report(&mut out, error as &dyn Diagnostic).is_err() {
            out.truncate(before);
            out.push_str(&format!("Error: {error}\n"));
        }
    }
    eprint!("{out}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typo_is_suggested_within_its_section() {
        let valid = &["max_open", "max_idle", "max_lifetime_secs"];
        assert_eq!(
            suggest_for("storage.pool", "max_opne", valid),
            Some(Suggestion::Spelling("max_open".to_string()))
        );
        assert_eq!(suggest_for("storage.pool", "zzzzzz", valid), None);
    }

    #[test]
    fn misplaced_key_points_at_its_section() {
        let valid = &["backend", "sqlite", "postgres", "pool", "statement_cache", "string_pool"];
        assert_eq!(
            suggest_for("storage", "busy_timeout_ms", valid),
            Some(Suggestion::Elsewhere("storage.sqlite".to_string()))
        );
        assert_eq!(
            suggest_for("storage.pool", "ttl_secs", &["max_open"]),
            Some(Suggestion::Elsewhere("storage.statement_cache".to_string()))
        );
    }

    #[test]
    fn help_names_the_full_key() {
        let help = unknown_key_help(
            "storage.pool",
            "max_opne",
            Some(&Suggestion::Spelling("max_open".to_string())),
            "max_open, max_idle",
        );
        assert!(help.contains("`storage.pool.max_open`"), "{help}");
        assert!(help.contains("[storage.pool]"), "{help}");
    }

    #[test]
    fn closest_matches_values_case_insensitively() {
        let modes = &["disable", "require", "verify-ca", "verify-full"];
        assert_eq!(closest("Verify_Full", modes), Some("verify-full"));
        assert_eq!(closest("postgre", &["sqlite", "postgres"]), Some("postgres"));
        assert_eq!(closest("oracle", &["sqlite", "postgres"]), None);
    }

    #[test]
    fn key_offset_respects_table_boundaries() {
        let content = "[storage]\nttl_secs = 1\n\n[storage.statement_cache]\n  ttl_secs = 2\n";
        let section = vec!["storage".to_string(), "statement_cache".to_string()];
        let o = find_key_offset(content, &section, "ttl_secs").unwrap();
        assert_eq!(&content[o..o + 12], "ttl_secs = 2");

        let o = find_key_offset(content, &["storage".to_string()], "ttl_secs").unwrap();
        assert_eq!(&content[o..o + 12], "ttl_secs = 1");
        assert!(find_key_offset(content, &[], "ttl_secs").is_none());
    }

    #[test]
    fn type_hints_follow_key_suffixes() {
        assert!(type_hint("storage.pool.max_lifetime_secs").unwrap().contains("seconds"));
        assert!(type_hint("storage.sqlite.busy_timeout_ms").unwrap().contains("milliseconds"));
        assert!(type_hint("storage.postgres.port").unwrap().contains("5432"));
        assert!(type_hint("logging.level").is_none());
    }

    #[test]
    fn section_table_covers_every_serialized_key() {
        let value = toml::Value::try_from(crate::model::TesseraConfig::default()).unwrap();
        fn walk(prefix: &str, table: &toml::Table) {
            let keys = SECTION_KEYS
                .iter()
                .find(|(name, _)| *name == prefix)
                .map(|(_, keys)| *keys)
                .unwrap_or_else(|| panic!("section [{prefix}] missing"));
            for (key, value) in table {
                assert!(keys.contains(&key.as_str()), "{prefix}.{key} missing");
                if let toml::Value::Table(inner) = value {
                    walk(&dotted(prefix, key), inner);
                }
            }
        }
        walk("", value.as_table().unwrap());
    }
}
