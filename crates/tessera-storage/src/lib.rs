// SPDX-FileCopyrightText: 2026 Tessera Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Storage engine for Tessera.
//!
//! One API over an embedded SQLite file or a PostgreSQL server: a single
//! serialized write connection, a read pool, per-connection prepared
//! statement caches with idle expiry, transactions, an interned string pool,
//! bundled migrations and a one-shot SQLite to PostgreSQL copier.
//!
//! Call [`init`] once at startup, then [`Database::open`].

pub mod bulk;
pub mod cache;
pub mod classify;
mod conn;
pub mod context;
pub mod database;
pub mod dialect;
pub mod executor;
pub mod migrations;
mod pool;
mod tls;
pub mod string_pool;
pub mod telemetry;
pub mod transaction;
pub mod value;

use std::sync::Once;

pub use bulk::{copy_sqlite_to_postgres, BulkOptions, BulkReport, TableReport};
pub use context::Ctx;
pub use database::{Database, OpenOptions, PoolStats};
pub use dialect::{rewrite_placeholders, Backend, Dialect};
pub use executor::Executor;
pub use migrations::MigrationStatus;
pub use string_pool::{get_or_create_string_id, get_string_by_id, get_strings_by_ids};
pub use transaction::{Transaction, TxOptions};
pub use value::{ExecResult, FromValue, Row, Value};

static INIT: Once = Once::new();

/// Process-wide setup: registers metric descriptions with whatever recorder
/// is installed. Idempotent; [`Database::open`] calls it too.
pub fn init() {
    INIT.call_once(|| {
        telemetry::describe_metrics();
        tracing::debug!("tessera storage initialized");
    });
}
