// SPDX-FileCopyrightText: 2026 Tessera Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types for the Tessera storage engine.

use thiserror::Error;

/// Boxed error source carried by the storage variants.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The primary error type returned by every Tessera crate.
///
/// Variants that wrap a failing statement carry the query text but never the
/// bound argument values, so errors can be logged without leaking data.
#[derive(Debug, Error)]
pub enum TesseraError {
    /// Configuration errors (missing connection parameters, unsupported backend).
    #[error("configuration error: {0}")]
    Config(String),

    /// The initial handshake with a backend failed.
    #[error("cannot connect to {backend}: {source}")]
    Connectivity { backend: String, source: BoxError },

    /// A statement failed to prepare or execute.
    #[error("query failed: {query}: {source}")]
    Query { query: String, source: BoxError },

    /// A cached prepared statement was closed underneath its caller.
    #[error("prepared statement unexpectedly closed: {query}")]
    StaleStatement { query: String },

    /// The caller's cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,

    /// The caller's deadline passed.
    #[error("operation timed out after {duration:?}")]
    Timeout { duration: std::time::Duration },

    /// A migration script failed to apply or to be recorded.
    #[error("migration {filename} failed: {source}")]
    Migration { filename: String, source: BoxError },

    /// Foreign key enforcement could not be restored after a table rewrite.
    #[error(
        "foreign key checks could not be re-enabled after {filename}, manual intervention required: {source}"
    )]
    ForeignKeyReenable { filename: String, source: BoxError },

    /// Bulk copy row counts disagree for a table.
    #[error(
        "row count mismatch for `{table}`: source={source_rows} destination={destination_rows} copied={copied_rows}"
    )]
    BulkMismatch {
        table: String,
        source_rows: u64,
        destination_rows: u64,
        copied_rows: u64,
    },

    /// Closing the write connection and/or the read pool failed.
    #[error("close failed (writer: {}, reader: {})", writer.as_deref().unwrap_or("ok"), reader.as_deref().unwrap_or("ok"))]
    Close {
        writer: Option<String>,
        reader: Option<String>,
    },

    /// The database handle has been closed.
    #[error("database is closed")]
    Closed,

    /// A column value could not be converted to the requested Rust type.
    #[error("cannot decode column {column}: {detail}")]
    Decode { column: String, detail: String },

    /// Internal or unexpected errors.
    #[error("internal error: {0}")]
    Internal(String),
}

impl TesseraError {
    /// Wrap a driver error for `query`.
    pub fn query(query: &str, source: impl Into<BoxError>) -> Self {
        Self::Query {
            query: query.to_string(),
            source: source.into(),
        }
    }

    /// Whether the error came from cancellation or a deadline rather than the backend.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Timeout { .. })
    }
}
