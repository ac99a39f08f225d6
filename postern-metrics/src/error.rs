//! Error types for metrics operations

use thiserror::Error;

/// Errors that can occur during metrics operations
#[derive(Debug, Error)]
pub enum MetricsError {
    /// Metrics system has already been initialized
    #[error("Metrics system already initialized")]
    AlreadyInitialized,

    /// The configured endpoint is not an OTLP-over-HTTP URL
    #[error("Metrics endpoint must be an http(s) URL, got {0}")]
    InvalidEndpoint(String),

    /// The OTLP exporter could not be constructed
    #[error("Unable to build metrics exporter: {0}")]
    Exporter(String),
}
