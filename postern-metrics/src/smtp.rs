//! SMTP session metrics
//!
//! Tracks server performance:
//! - Total and active connections (opened/closed increments are paired
//!   exactly once per connection)
//! - SMTP errors by response code
//! - Session durations
//! - Messages received and their sizes

use std::sync::atomic::{AtomicU64, Ordering};

use opentelemetry::{
    KeyValue,
    metrics::{Counter, Histogram, Meter, UpDownCounter},
};

/// SMTP metrics collector
#[derive(Debug)]
pub struct SmtpMetrics {
    /// Total number of SMTP connections established
    connections_total: Counter<u64>,

    /// Number of currently active SMTP connections
    connections_active: UpDownCounter<i64>,

    /// Total number of SMTP errors by response code
    errors_total: Counter<u64>,

    /// Distribution of SMTP session durations in seconds
    session_duration: Histogram<f64>,

    /// Total number of messages received via SMTP
    messages_received: Counter<u64>,

    /// Distribution of message sizes in bytes
    message_size_bytes: Histogram<u64>,

    // Local counter for tracking active connections
    active_count: AtomicU64,
}

impl SmtpMetrics {
    /// Create a new SMTP metrics collector
    #[must_use]
    pub fn new() -> Self {
        let meter = meter();

        let connections_total = meter
            .u64_counter("postern.smtp.connections.total")
            .with_description("Total number of SMTP connections established")
            .build();

        let connections_active = meter
            .i64_up_down_counter("postern.smtp.connections.active")
            .with_description("Number of currently active SMTP connections")
            .build();

        let errors_total = meter
            .u64_counter("postern.smtp.errors.total")
            .with_description("Total number of SMTP errors by response code")
            .build();

        let session_duration = meter
            .f64_histogram("postern.smtp.session.duration.seconds")
            .with_description("Distribution of SMTP session durations")
            .build();

        let messages_received = meter
            .u64_counter("postern.smtp.messages.received.total")
            .with_description("Total number of messages received via SMTP")
            .build();

        let message_size_bytes = meter
            .u64_histogram("postern.smtp.message.size.bytes")
            .with_description("Distribution of received message sizes")
            .build();

        Self {
            connections_total,
            connections_active,
            errors_total,
            session_duration,
            messages_received,
            message_size_bytes,
            active_count: AtomicU64::new(0),
        }
    }

    /// Record a new SMTP connection
    pub fn record_connection(&self) {
        self.connections_total.add(1, &[]);
        self.connections_active.add(1, &[]);
        self.active_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a closed SMTP connection with its duration
    pub fn record_connection_closed(&self, duration_secs: f64) {
        self.connections_active.add(-1, &[]);
        self.active_count.fetch_sub(1, Ordering::Relaxed);
        self.session_duration.record(duration_secs, &[]);
    }

    /// Record an SMTP error
    pub fn record_error(&self, code: u32) {
        let attributes = [KeyValue::new("code", code.to_string())];
        self.errors_total.add(1, &attributes);
    }

    /// Record a received message
    pub fn record_message_received(&self, size_bytes: u64) {
        self.messages_received.add(1, &[]);
        self.message_size_bytes.record(size_bytes, &[]);
    }

    /// Get the current number of active connections
    #[must_use]
    pub fn active_connections(&self) -> u64 {
        self.active_count.load(Ordering::Relaxed)
    }
}

impl Default for SmtpMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Get the OpenTelemetry meter for SMTP metrics
fn meter() -> Meter {
    opentelemetry::global::meter("postern.smtp")
}

#[cfg(test)]
mod test {
    use super::SmtpMetrics;

    #[test]
    fn active_count_pairs_open_and_close() {
        let metrics = SmtpMetrics::new();

        metrics.record_connection();
        metrics.record_connection();
        assert_eq!(metrics.active_connections(), 2);

        metrics.record_connection_closed(0.5);
        metrics.record_connection_closed(1.5);
        assert_eq!(metrics.active_connections(), 0);
    }
}
