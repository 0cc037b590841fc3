// SPDX-FileCopyrightText: 2026 Tessera Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Common types shared by the configuration and storage crates.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Database backend variant.
///
/// Parsed case-insensitively from the configured engine name; the aliases
/// accept the names operators commonly use for each engine.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize,
)]
#[strum(ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Embedded single-file engine (SQLite).
    #[strum(to_string = "sqlite", serialize = "sqlite3", serialize = "embedded")]
    Sqlite,
    /// Client/server engine (PostgreSQL).
    #[strum(
        to_string = "postgres",
        serialize = "postgresql",
        serialize = "pg",
        serialize = "client-server"
    )]
    Postgres,
}

/// Health status reported by storage health checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    /// Backend is fully operational.
    Healthy,
    /// Backend is operational but experiencing issues.
    Degraded(String),
    /// Backend is not operational.
    Unhealthy(String),
}
