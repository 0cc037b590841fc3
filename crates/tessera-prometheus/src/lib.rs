// SPDX-FileCopyrightText: 2026 Tessera Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Prometheus exporter for Tessera.
//!
//! Uses the metrics-rs facade with the Prometheus exporter. The storage
//! engine records through the facade; this crate installs the recorder and
//! renders the Prometheus text format.

pub mod recording;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tessera_core::TesseraError;

pub use recording::{record_pool_stats, register_metrics, set_build_info};

/// Installed Prometheus recorder.
pub struct PrometheusExporter {
    handle: PrometheusHandle,
}

impl PrometheusExporter {
    /// Install the Prometheus recorder globally and register every metric
    /// description.
    ///
    /// Only one recorder can be installed per process. Returns an error if a
    /// recorder is already installed.
    pub fn install() -> Result<Self, TesseraError> {
        let handle = PrometheusBuilder::new().install_recorder().map_err(|e| {
            TesseraError::Internal(format!("failed to install Prometheus recorder: {e}"))
        })?;

        register_metrics();

        tracing::info!("prometheus metrics recorder installed");

        Ok(Self { handle })
    }

    pub fn handle(&self) -> &PrometheusHandle {
        &self.handle
    }

    /// Render all collected metrics in Prometheus text format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}
