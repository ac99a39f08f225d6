use chrono::{DateTime, Utc};
use serde::Serialize;

/// The SMTP-layer metadata delivered alongside a message: who it is from,
/// who it is for, and where it came from. Immutable once the end-of-data
/// marker has been accepted.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    /// Reverse path. Empty for the null sender (`MAIL FROM:<>`).
    sender: String,
    recipients: Vec<String>,
    received: DateTime<Utc>,
    client_ip: String,
    client_helo: String,
}

impl Envelope {
    #[must_use]
    pub fn new(
        sender: String,
        recipients: Vec<String>,
        client_ip: String,
        client_helo: String,
    ) -> Self {
        Self {
            sender,
            recipients,
            received: Utc::now(),
            client_ip,
            client_helo,
        }
    }

    /// Replace the received stamp, e.g. when reconstructing an envelope
    /// that was serialized by another process.
    #[must_use]
    pub const fn with_received(mut self, received: DateTime<Utc>) -> Self {
        self.received = received;
        self
    }

    #[must_use]
    pub fn sender(&self) -> &str {
        &self.sender
    }

    #[must_use]
    pub const fn is_bounce(&self) -> bool {
        self.sender.is_empty()
    }

    #[must_use]
    pub fn recipients(&self) -> &[String] {
        &self.recipients
    }

    #[must_use]
    pub const fn received(&self) -> DateTime<Utc> {
        self.received
    }

    #[must_use]
    pub fn client_ip(&self) -> &str {
        &self.client_ip
    }

    #[must_use]
    pub fn client_helo(&self) -> &str {
        &self.client_helo
    }
}
