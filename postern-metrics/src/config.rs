//! Metrics configuration

use serde::Deserialize;

/// Configuration for metrics collection and export
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Enable or disable metrics collection.
    ///
    /// When disabled, all metrics operations become no-ops with minimal
    /// overhead.
    #[serde(default)]
    pub enabled: bool,

    /// OTLP endpoint URL for metrics export.
    ///
    /// Common values:
    /// - `http://localhost:4318/v1/metrics` (local development)
    /// - `http://otel-collector:4318/v1/metrics` (Docker Compose)
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
}

fn default_endpoint() -> String {
    "http://localhost:4318/v1/metrics".to_string()
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_endpoint(),
        }
    }
}
