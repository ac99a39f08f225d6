//! Error types shared by every protocol component.

use std::io;

use thiserror::Error;

/// Errors that can occur while a session is being handled.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Protocol error occurred during the session.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Connection error occurred.
    #[error("Connection error: {0}")]
    Connection(#[from] io::Error),

    /// A command or data line exceeded the wire limit.
    #[error("Line too long")]
    LineTooLong,

    /// Session was cancelled (e.g., client disconnected).
    #[error("Session cancelled")]
    Cancelled,

    /// Shutdown signal received.
    #[error("Shutdown requested")]
    Shutdown,

    /// The client failed to produce a command or data within the deadline.
    #[error("Session timed out after {0} seconds")]
    Timeout(u64),
}

impl SessionError {
    /// Returns `true` if the error indicates a graceful shutdown.
    #[must_use]
    pub const fn is_shutdown(&self) -> bool {
        matches!(self, Self::Shutdown | Self::Cancelled)
    }

    /// Returns `true` if the error is a client-side issue.
    #[must_use]
    pub const fn is_client_error(&self) -> bool {
        matches!(self, Self::Protocol(_) | Self::Timeout(_) | Self::LineTooLong)
    }
}

/// Errors that can occur in a listener.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// Failed to bind to socket address.
    #[error("Failed to bind to {address}: {source}")]
    BindFailed {
        address: String,
        #[source]
        source: io::Error,
    },

    /// Failed to accept an incoming connection.
    #[error("Failed to accept connection: {0}")]
    AcceptFailed(#[from] io::Error),

    /// The listener's single connection has already been handed out.
    #[error("Listener closed")]
    Closed,

    /// A listener configuration is unusable (e.g. implicit TLS without
    /// certificate material).
    #[error("Invalid listener configuration: {0}")]
    InvalidConfiguration(String),

    /// Shutdown signal received.
    #[error("Shutdown requested")]
    Shutdown,
}

/// Errors that can occur in the controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// A listener error occurred.
    #[error("Listener error: {0}")]
    Listener(#[from] ListenerError),

    /// A listener task failed unexpectedly.
    #[error("Listener task failed: {0}")]
    ListenerFailed(#[from] tokio::task::JoinError),

    /// Shutdown timed out waiting for sessions to complete.
    #[error("Shutdown timeout after {0} seconds")]
    ShutdownTimeout(u64),
}

#[cfg(test)]
mod tests {
    use std::error::Error as StdError;

    use super::*;

    #[test]
    fn session_error_classification() {
        assert!(SessionError::Shutdown.is_shutdown());
        assert!(!SessionError::Shutdown.is_client_error());

        assert!(SessionError::Timeout(30).is_client_error());
        assert!(SessionError::LineTooLong.is_client_error());
        assert!(!SessionError::Protocol("bad".into()).is_shutdown());
    }

    #[test]
    fn bind_failure_preserves_source() {
        let err = ListenerError::BindFailed {
            address: "0.0.0.0:25".to_string(),
            source: io::Error::new(io::ErrorKind::PermissionDenied, "access denied"),
        };

        assert!(err.source().is_some());
        assert_eq!(
            err.to_string(),
            "Failed to bind to 0.0.0.0:25: access denied"
        );
    }
}
