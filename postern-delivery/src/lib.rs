//! Message delivery.
//!
//! The SMTP core hands every accepted message to exactly one
//! [`DeliveryAgent`] and reports the outcome inside the DATA reply. Two
//! agents ship with the server: a direct file store, and a wrapper that
//! spawns a single-purpose child process per message for privilege
//! separation.

use std::fmt::Debug;

use async_trait::async_trait;
use postern_common::envelope::Envelope;
use thiserror::Error;
use tokio::io::AsyncRead;

pub mod store;
pub mod subprocess;

pub use store::FileStoreAgent;
pub use subprocess::{SubprocessAgent, SubprocessAgentConfig, WireEnvelope, run_delivery_child};

#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The store could not accept the message right now; the client
    /// should retry.
    #[error("Temporary delivery failure: {0}")]
    Temporary(String),

    /// The store will never accept this message.
    #[error("Permanent delivery failure: {0}")]
    Permanent(String),

    /// I/O failure while writing the message. Treated as temporary.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DeliveryError {
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }
}

/// Proof of durable acceptance by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReceipt {
    id: String,
}

impl DeliveryReceipt {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }
}

/// Accepts one message for durable storage.
#[async_trait]
pub trait DeliveryAgent: Send + Sync + Debug {
    /// Store the message. `message` is positioned at the first byte of the
    /// RFC 5322 content. Returns only after the store has durably accepted
    /// the message.
    async fn deliver(
        &self,
        envelope: &Envelope,
        message: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<DeliveryReceipt, DeliveryError>;
}
