//! Observability instrumentation for the SMTP server.
//!
//! Metrics are pushed over OTLP to a collector, which can expose them in
//! Prometheus format for scraping. When metrics are disabled (the
//! default), every recording site is a no-op.

mod config;
mod error;
mod smtp;

pub use config::MetricsConfig;
pub use error::MetricsError;
use once_cell::sync::OnceCell;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
pub use smtp::SmtpMetrics;

/// Global metrics instance
static METRICS_INSTANCE: OnceCell<Metrics> = OnceCell::new();

/// Root metrics container
#[derive(Debug)]
pub struct Metrics {
    pub smtp: SmtpMetrics,
}

/// Initialize the metrics system.
///
/// Must be called once at startup before any metrics are recorded. A
/// disabled config makes this a no-op and leaves every recording site
/// inert.
///
/// # Errors
///
/// Returns an error if the endpoint is not an HTTP(S) URL, if the
/// exporter cannot be built, or if called twice.
pub fn init_metrics(config: &MetricsConfig) -> Result<(), MetricsError> {
    if !config.enabled {
        tracing::info!("metrics collection is disabled");
        return Ok(());
    }

    // OTLP-over-HTTP is the only transport wired up, so catch a grpc://
    // or bare host:port endpoint before handing it to the exporter.
    if !config.endpoint.starts_with("http://") && !config.endpoint.starts_with("https://") {
        return Err(MetricsError::InvalidEndpoint(config.endpoint.clone()));
    }

    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_http()
        .with_endpoint(&config.endpoint)
        .build()
        .map_err(|err| MetricsError::Exporter(err.to_string()))?;

    let provider = SdkMeterProvider::builder()
        .with_reader(PeriodicReader::builder(exporter).build())
        .build();
    opentelemetry::global::set_meter_provider(provider);

    METRICS_INSTANCE
        .set(Metrics {
            smtp: SmtpMetrics::new(),
        })
        .map_err(|_| MetricsError::AlreadyInitialized)?;

    tracing::info!(endpoint = %config.endpoint, "metrics push enabled");
    Ok(())
}

/// Whether metrics were initialized and enabled.
#[must_use]
pub fn is_enabled() -> bool {
    METRICS_INSTANCE.get().is_some()
}

/// The global instance, if metrics are enabled.
#[must_use]
pub fn try_metrics() -> Option<&'static Metrics> {
    METRICS_INSTANCE.get()
}

#[cfg(test)]
mod test {
    use super::{MetricsConfig, MetricsError, init_metrics, is_enabled};

    #[test]
    fn disabled_config_is_a_noop() {
        let config = MetricsConfig::default();
        assert!(init_metrics(&config).is_ok());
        assert!(!is_enabled());
    }

    #[test]
    fn non_http_endpoint_is_refused() {
        let config = MetricsConfig {
            enabled: true,
            endpoint: "collector:4318".to_string(),
        };

        assert!(matches!(
            init_metrics(&config),
            Err(MetricsError::InvalidEndpoint(_))
        ));
        assert!(!is_enabled());
    }
}
