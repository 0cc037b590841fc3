// SPDX-FileCopyrightText: 2026 Tessera Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Storage metric names, descriptions and recording helpers.
//!
//! Uses the metrics-rs facade; nothing is recorded anywhere until the
//! process installs a recorder.

use metrics::{counter, describe_counter, describe_histogram, histogram};

pub const TX_BEGIN_RECOVERIES: &str = "tessera_storage_tx_begin_recoveries_total";
pub const STALE_STATEMENT_RETRIES: &str = "tessera_storage_stale_statement_retries_total";
pub const STATEMENT_CACHE_EVICTIONS: &str = "tessera_storage_statement_cache_evictions_total";
pub const STRING_POOL_DELETED: &str = "tessera_storage_string_pool_deleted_total";
pub const STRING_POOL_CLEANUP_FAILURES: &str = "tessera_storage_string_pool_cleanup_failures_total";
pub const STRING_POOL_CLEANUP_SECONDS: &str = "tessera_storage_string_pool_cleanup_seconds";

/// Register metric descriptions with the installed recorder.
pub fn describe_metrics() {
    describe_counter!(
        TX_BEGIN_RECOVERIES,
        "Write transactions that found their connection already inside a transaction and recovered"
    );
    describe_counter!(
        STALE_STATEMENT_RETRIES,
        "Statements retried after their cached prepared handle went stale"
    );
    describe_counter!(
        STATEMENT_CACHE_EVICTIONS,
        "Prepared statements closed by replacement, expiry or shutdown"
    );
    describe_counter!(STRING_POOL_DELETED, "Unreferenced string pool rows deleted");
    describe_counter!(
        STRING_POOL_CLEANUP_FAILURES,
        "String pool cleanup runs that failed"
    );
    describe_histogram!(
        STRING_POOL_CLEANUP_SECONDS,
        "Duration of successful string pool cleanup runs in seconds"
    );
}

pub(crate) fn record_tx_begin_recovery() {
    counter!(TX_BEGIN_RECOVERIES).increment(1);
}

pub(crate) fn record_stale_retry() {
    counter!(STALE_STATEMENT_RETRIES).increment(1);
}

pub(crate) fn record_cache_evictions(n: usize) {
    counter!(STATEMENT_CACHE_EVICTIONS).increment(n as u64);
}

pub(crate) fn record_string_pool_cleanup(deleted: u64, seconds: f64) {
    counter!(STRING_POOL_DELETED).increment(deleted);
    histogram!(STRING_POOL_CLEANUP_SECONDS).record(seconds);
}

pub(crate) fn record_string_pool_failure() {
    counter!(STRING_POOL_CLEANUP_FAILURES).increment(1);
}
