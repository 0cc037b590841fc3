// SPDX-FileCopyrightText: 2026 Tessera Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Integration tests for the Tessera configuration system.

use miette::Diagnostic;
use tessera_config::diagnostic::{ConfigError, Suggestion};
use tessera_config::model::TesseraConfig;
use tessera_config::{load_and_validate_str, load_config_from_str, postgres_url};

/// Valid TOML with all known fields deserializes successfully.
#[test]
fn valid_toml_deserializes_into_tessera_config() {
    let toml = r#"
[storage]
backend = "postgres"

[storage.sqlite]
path = "/tmp/tessera-test.db"
busy_timeout_ms = 2500

[storage.postgres]
host = "localhost"
port = 6543
user = "tessera"
password = "secret"
database = "docs"
sslmode = "verify-full"
connect_timeout_secs = 3

[storage.pool]
max_open = 4
max_idle = 1
max_lifetime_secs = 60

[storage.statement_cache]
ttl_secs = 30

[storage.string_pool]
cleanup_enabled = false
initial_delay_secs = 5
interval_secs = 60
failure_escalation_threshold = 5

[logging]
level = "debug"
"#;

    let config = load_config_from_str(toml).expect("valid TOML should deserialize");
    assert_eq!(config.storage.backend, "postgres");
    assert_eq!(config.storage.sqlite.path, "/tmp/tessera-test.db");
    assert_eq!(config.storage.sqlite.busy_timeout_ms, 2500);
    assert_eq!(config.storage.postgres.port, 6543);
    assert_eq!(config.storage.postgres.password.as_deref(), Some("secret"));
    assert_eq!(config.storage.postgres.sslmode, "verify-full");
    assert!(config.storage.postgres.sslrootcert.is_none());
    assert_eq!(config.storage.pool.max_open, 4);
    assert_eq!(config.storage.pool.max_idle, 1);
    assert_eq!(config.storage.statement_cache.ttl_secs, 30);
    assert!(!config.storage.string_pool.cleanup_enabled);
    assert_eq!(config.storage.string_pool.failure_escalation_threshold, 5);
    assert_eq!(config.logging.level, "debug");
}

/// Missing optional sections use defaults without error.
#[test]
fn missing_optional_sections_use_defaults() {
    let config = load_config_from_str("").expect("empty TOML should use defaults");

    assert_eq!(config.storage.backend, "sqlite");
    assert!(config.storage.sqlite.path.ends_with("tessera.db"));
    assert_eq!(config.storage.sqlite.busy_timeout_ms, 5000);
    assert_eq!(config.storage.postgres.port, 5432);
    assert!(config.storage.postgres.password.is_none());
    assert_eq!(config.storage.postgres.sslmode, "disable");
    assert_eq!(config.storage.pool.max_open, 8);
    assert_eq!(config.storage.statement_cache.ttl_secs, 600);
    assert_eq!(config.storage.string_pool.interval_secs, 86_400);
    assert_eq!(config.logging.level, "info");
}

/// Unknown field in a nested section produces an error.
#[test]
fn unknown_field_in_pool_produces_error() {
    let toml = r#"
[storage.pool]
max_opne = 3
"#;

    let err = load_config_from_str(toml).expect_err("should reject unknown field");
    let err_str = format!("{err}");
    assert!(
        err_str.contains("unknown field") || err_str.contains("max_opne"),
        "error should mention unknown field or the bad key, got: {err_str}"
    );
}

/// Unknown top-level section is rejected.
#[test]
fn deny_unknown_fields_at_top_level() {
    let toml = r#"
[agent]
name = "x"
"#;
    assert!(load_config_from_str(toml).is_err());
}

/// Error output from load_and_validate_str includes the unknown key and a suggestion.
#[test]
fn diagnostic_error_includes_unknown_key() {
    let toml = r#"
[storage]
bakend = "sqlite"
"#;

    let errors = load_and_validate_str(toml).expect_err("should produce errors");
    let has_unknown_key = errors.iter().any(|e| {
        matches!(e, ConfigError::UnknownKey { section, key, suggestion, valid_keys, .. } if {
            section == "storage"
                && key == "bakend"
                && *suggestion == Some(Suggestion::Spelling("backend".to_string()))
                && valid_keys.contains("statement_cache")
        })
    });
    assert!(
        has_unknown_key,
        "should have UnknownKey error for 'bakend' with suggestion 'backend', got: {errors:?}"
    );
}

/// A key written in the wrong table is pointed at the table it belongs to,
/// with a span on the offending line.
#[test]
fn misplaced_key_is_redirected_with_span() {
    let toml = r#"
[storage]
backend = "sqlite"
busy_timeout_ms = 100
"#;

    let errors = load_and_validate_str(toml).expect_err("should produce errors");
    let error = errors
        .iter()
        .find(|e| e.key() == Some("busy_timeout_ms"))
        .unwrap_or_else(|| panic!("no error for busy_timeout_ms: {errors:?}"));
    match error {
        ConfigError::UnknownKey { suggestion, span, .. } => {
            assert_eq!(*suggestion, Some(Suggestion::Elsewhere("storage.sqlite".to_string())));
            let span = span.expect("span into the inline source");
            assert_eq!(&toml[span.offset()..span.offset() + span.len()], "busy_timeout_ms");
        }
        other => panic!("unexpected {other:?}"),
    }
    let help = error.help().unwrap().to_string();
    assert!(help.contains("[storage.sqlite]"), "got: {help}");
}

/// A wrongly typed value is reported with its full key and a unit hint.
#[test]
fn invalid_type_names_key_and_unit() {
    let toml = r#"
[storage.statement_cache]
ttl_secs = "ten minutes"
"#;

    let errors = load_and_validate_str(toml).expect_err("should reject invalid type");
    let error = errors
        .iter()
        .find(|e| matches!(e, ConfigError::InvalidType { .. }))
        .unwrap_or_else(|| panic!("no type error: {errors:?}"));
    assert_eq!(error.key(), Some("storage.statement_cache.ttl_secs"));
    assert!(error.help().unwrap().to_string().contains("seconds"));
}

/// Invalid type (string where number expected) produces clear message.
#[test]
fn diagnostic_invalid_type_message() {
    let toml = r#"
[storage.statement_cache]
ttl_secs = "ten minutes"
"#;

    let err = load_config_from_str(toml).expect_err("should reject invalid type");
    let err_str = format!("{err}");
    assert!(
        err_str.contains("invalid type") || err_str.contains("ttl_secs"),
        "error should mention type mismatch, got: {err_str}"
    );
}

/// ConfigError can be rendered using miette's graphical handler.
#[test]
fn config_error_renders_with_miette() {
    use miette::GraphicalReportHandler;

    let error = ConfigError::UnknownKey {
        section: "storage".to_string(),
        key: "bakend".to_string(),
        suggestion: Some(Suggestion::Spelling("backend".to_string())),
        valid_keys: "backend, sqlite, postgres".to_string(),
        span: None,
        src: None,
    };

    let help = error.help().expect("should have help text").to_string();
    assert!(help.contains("did you mean `storage.backend`"), "got: {help}");

    let handler = GraphicalReportHandler::new();
    let mut buf = String::new();
    handler
        .render_report(&mut buf, &error)
        .expect("should render without error");
    assert!(buf.contains("bakend"));
}

/// Postgres backend without connection parameters fails validation.
#[test]
fn validation_requires_postgres_parameters() {
    let toml = r#"
[storage]
backend = "client-server"

[storage.postgres]
host = "localhost"
"#;

    let errors = load_and_validate_str(toml).expect_err("missing user/database should fail");
    let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
    assert!(messages.iter().any(|m| m.contains("storage.postgres.user")));
    assert!(messages.iter().any(|m| m.contains("storage.postgres.database")));
    assert!(!messages.iter().any(|m| m.contains("storage.postgres.host")));
}

/// A validated postgres config yields a connection URL.
#[test]
fn validated_postgres_config_builds_url() {
    let toml = r#"
[storage]
backend = "pg"

[storage.postgres]
host = "localhost"
user = "tessera"
database = "docs"
"#;

    let config: TesseraConfig = load_and_validate_str(toml).expect("should validate");
    let url = postgres_url(&config.storage.postgres).expect("url");
    assert_eq!(
        url,
        "postgres://tessera@localhost:5432/docs?sslmode=disable&connect_timeout=10"
    );
}
