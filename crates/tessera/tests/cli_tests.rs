// SPDX-FileCopyrightText: 2026 Tessera Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end tests that drive the `tessera` binary against a temp SQLite file.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

fn write_config(dir: &Path) -> PathBuf {
    let db = dir.join("data").join("tessera.db");
    let config = dir.join("tessera.toml");
    let toml = format!(
        "[storage]\nbackend = \"sqlite\"\n\n[storage.sqlite]\npath = \"{}\"\n\n[storage.string_pool]\ncleanup_enabled = false\n",
        db.display().to_string().replace('\\', "/")
    );
    std::fs::write(&config, toml).unwrap();
    config
}

fn tessera(config: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_tessera"))
        .arg("--config")
        .arg(config)
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .unwrap()
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

// ---- Migrations ----

#[test]
fn migrate_then_status_reports_nothing_pending() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());

    let first = tessera(&config, &["migrate"]);
    assert!(first.status.success(), "{}", String::from_utf8_lossy(&first.stderr));
    assert!(stdout(&first).contains("001_string_pool.sql"));

    let second = tessera(&config, &["migrate"]);
    assert!(second.status.success());
    assert!(stdout(&second).contains("up to date"));

    let status = tessera(&config, &["status", "--json"]);
    assert!(status.status.success());
    let report: serde_json::Value = serde_json::from_str(&stdout(&status)).unwrap();
    assert_eq!(report["pool"]["backend"], "sqlite");
    assert_eq!(report["health"], "healthy");
    assert_eq!(report["migrations"]["pending"].as_array().unwrap().len(), 0);
    assert_eq!(report["migrations"]["applied"].as_array().unwrap().len(), 5);
}

#[test]
fn status_lists_pending_before_first_migrate() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());

    let status = tessera(&config, &["status", "--json"]);
    assert!(status.status.success(), "{}", String::from_utf8_lossy(&status.stderr));
    let report: serde_json::Value = serde_json::from_str(&stdout(&status)).unwrap();
    assert_eq!(report["migrations"]["pending"].as_array().unwrap().len(), 5);
}

// ---- Maintenance ----

#[test]
fn cleanup_strings_on_empty_pool_deletes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());

    let output = tessera(&config, &["cleanup-strings"]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert!(stdout(&output).contains("deleted 0"));
}

#[test]
fn copy_to_postgres_rejects_sqlite_destination() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());

    let output = tessera(&config, &["copy-to-postgres", "--source", "missing.db"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("postgres"));
}

#[test]
fn metrics_renders_prometheus_text() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());

    let output = tessera(&config, &["metrics"]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let text = stdout(&output);
    assert!(text.contains("tessera_build_info"));
    assert!(text.contains("tessera_read_pool_size"));
}

// ---- Configuration errors ----

#[test]
fn unknown_config_key_fails_fast() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("tessera.toml");
    std::fs::write(&config, "[storage]\nbakend = \"sqlite\"\n").unwrap();

    let output = tessera(&config, &["status"]);
    assert!(!output.status.success());
}
