// SPDX-FileCopyrightText: 2026 Tessera Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Metric registration and process-level gauges.
//!
//! Engine counters are described by the storage crate; the gauges here
//! snapshot the connection manager for scrapes.

use metrics::{describe_gauge, gauge};
use tessera_storage::PoolStats;

pub const READ_POOL_SIZE: &str = "tessera_read_pool_size";
pub const READ_POOL_OPEN: &str = "tessera_read_pool_open";
pub const CACHED_STATEMENTS: &str = "tessera_cached_statements";
pub const BUILD_INFO: &str = "tessera_build_info";

/// Register all Tessera metric descriptions.
///
/// Called once after the recorder is installed; descriptions registered
/// before that are lost.
pub fn register_metrics() {
    tessera_storage::telemetry::describe_metrics();
    describe_gauge!(READ_POOL_SIZE, "Maximum connections in the read pool");
    describe_gauge!(READ_POOL_OPEN, "Read connections currently open");
    describe_gauge!(
        CACHED_STATEMENTS,
        "Prepared statements currently cached, by endpoint"
    );
    describe_gauge!(BUILD_INFO, "Build metadata; always 1");
}

/// Snapshot the connection manager into gauges.
pub fn record_pool_stats(stats: &PoolStats) {
    let backend = stats.backend.to_string();
    gauge!(READ_POOL_SIZE, "backend" => backend.clone()).set(stats.read_pool_size as f64);
    gauge!(READ_POOL_OPEN, "backend" => backend.clone()).set(stats.read_pool_open as f64);
    gauge!(CACHED_STATEMENTS, "backend" => backend.clone(), "endpoint" => "writer")
        .set(stats.writer_cached_statements as f64);
    gauge!(CACHED_STATEMENTS, "backend" => backend, "endpoint" => "reader")
        .set(stats.reader_cached_statements as f64);
}

pub fn set_build_info(version: &str) {
    gauge!(BUILD_INFO, "version" => version.to_string()).set(1.0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_exporter_prometheus::PrometheusBuilder;
    use tessera_core::Backend;

    fn stats() -> PoolStats {
        PoolStats {
            backend: Backend::Sqlite,
            target: "/tmp/t.db".to_string(),
            read_pool_size: 4,
            read_pool_open: 2,
            writer_cached_statements: 3,
            reader_cached_statements: 7,
            closed: false,
        }
    }

    #[test]
    fn pool_stats_render_as_labelled_gauges() {
        // A local recorder avoids fighting over the global one.
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        metrics::with_local_recorder(&recorder, || {
            register_metrics();
            record_pool_stats(&stats());
            set_build_info("0.1.0");
        });

        let text = handle.render();
        assert!(text.contains("tessera_read_pool_size{backend=\"sqlite\"} 4"));
        assert!(text.contains("tessera_read_pool_open{backend=\"sqlite\"} 2"));
        assert!(text.contains("endpoint=\"reader\""));
        assert!(text.contains("tessera_build_info{version=\"0.1.0\"} 1"));
    }
}
