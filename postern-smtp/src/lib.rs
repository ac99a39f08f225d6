pub mod command;
pub mod connection;
pub mod error;
pub mod extensions;
pub mod listener;
pub mod session;
pub mod state;

use std::{path::PathBuf, sync::Arc};

use postern_delivery::DeliveryAgent;
use postern_directory::{DomainRegistry, TokenValidator};
use postern_filter::{CheckPolicy, ContentChecker};
use serde::Deserialize;

pub use crate::connection::TlsContext;

/// Default cap on stored message bytes: 10 MiB.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// SMTP server-side timeout configuration
///
/// These timeouts prevent resource exhaustion from slow or malicious
/// clients and follow RFC 5321 Section 4.5.3.2 recommendations.
#[derive(Clone, Debug, Deserialize)]
pub struct SmtpTimeouts {
    /// Timeout for regular SMTP commands (EHLO, MAIL FROM, RCPT TO, etc.)
    ///
    /// Default: 300 seconds (5 minutes)
    #[serde(default = "default_command_timeout")]
    pub command_secs: u64,

    /// Timeout between data lines while receiving the message body
    ///
    /// Default: 180 seconds (3 minutes)
    #[serde(default = "default_data_block_timeout")]
    pub data_block_secs: u64,

    /// Maximum total session duration
    ///
    /// Default: 1800 seconds (30 minutes)
    #[serde(default = "default_connection_timeout")]
    pub connection_secs: u64,

    /// How long shutdown waits for in-flight sessions before closing their
    /// sockets
    ///
    /// Default: 30 seconds
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

impl Default for SmtpTimeouts {
    fn default() -> Self {
        Self {
            command_secs: default_command_timeout(),
            data_block_secs: default_data_block_timeout(),
            connection_secs: default_connection_timeout(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

const fn default_command_timeout() -> u64 {
    300 // 5 minutes per RFC 5321
}

const fn default_data_block_timeout() -> u64 {
    180 // 3 minutes per RFC 5321
}

const fn default_connection_timeout() -> u64 {
    1800 // 30 minutes
}

const fn default_shutdown_grace() -> u64 {
    30
}

/// Everything a session needs beyond its own socket. Built once per
/// listener and shared by every connection it accepts.
#[derive(Debug)]
pub struct SessionConfig {
    /// Hostname used in the greeting and EHLO banner.
    pub hostname: String,

    /// Cap on stored (post-unstuff) message bytes. 0 disables the cap.
    pub max_message_size: usize,

    /// Recipients allowed per transaction.
    pub max_recipients: usize,

    pub timeouts: SmtpTimeouts,

    /// Certificate material for STARTTLS. `None` suppresses the
    /// advertisement.
    pub tls: Option<TlsContext>,

    /// Accepted domains and their user directories.
    pub registry: Arc<DomainRegistry>,

    /// Server-wide delivery agent, used when the recipient's domain does
    /// not route elsewhere.
    pub delivery: Option<Arc<dyn DeliveryAgent>>,

    /// Content checker consulted during DATA, if any.
    pub checker: Option<Arc<dyn ContentChecker>>,

    pub policy: CheckPolicy,

    /// OAUTHBEARER token validation back-end.
    pub token_validator: Option<Arc<dyn TokenValidator>>,

    /// Whether AUTH is offered at all.
    pub auth_enabled: bool,

    /// Directory message bodies are buffered in while a transaction is in
    /// flight.
    pub spool_dir: PathBuf,
}

impl SessionConfig {
    #[must_use]
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::default()
    }
}

/// Builder for [`SessionConfig`].
#[derive(Debug)]
pub struct SessionConfigBuilder {
    hostname: String,
    max_message_size: usize,
    max_recipients: usize,
    timeouts: SmtpTimeouts,
    tls: Option<TlsContext>,
    registry: Arc<DomainRegistry>,
    delivery: Option<Arc<dyn DeliveryAgent>>,
    checker: Option<Arc<dyn ContentChecker>>,
    policy: CheckPolicy,
    token_validator: Option<Arc<dyn TokenValidator>>,
    auth_enabled: bool,
    spool_dir: PathBuf,
}

impl Default for SessionConfigBuilder {
    fn default() -> Self {
        Self {
            hostname: String::new(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_recipients: 1,
            timeouts: SmtpTimeouts::default(),
            tls: None,
            registry: Arc::new(DomainRegistry::default()),
            delivery: None,
            checker: None,
            policy: CheckPolicy::default(),
            token_validator: None,
            auth_enabled: false,
            spool_dir: std::env::temp_dir(),
        }
    }
}

impl SessionConfigBuilder {
    #[must_use]
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    #[must_use]
    pub const fn with_max_message_size(mut self, max: usize) -> Self {
        self.max_message_size = max;
        self
    }

    #[must_use]
    pub const fn with_max_recipients(mut self, max: usize) -> Self {
        self.max_recipients = max;
        self
    }

    #[must_use]
    pub const fn with_timeouts(mut self, timeouts: SmtpTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    #[must_use]
    pub fn with_tls(mut self, tls: Option<TlsContext>) -> Self {
        self.tls = tls;
        self
    }

    #[must_use]
    pub fn with_registry(mut self, registry: Arc<DomainRegistry>) -> Self {
        self.registry = registry;
        self
    }

    #[must_use]
    pub fn with_delivery(mut self, delivery: Option<Arc<dyn DeliveryAgent>>) -> Self {
        self.delivery = delivery;
        self
    }

    #[must_use]
    pub fn with_checker(mut self, checker: Option<Arc<dyn ContentChecker>>) -> Self {
        self.checker = checker;
        self
    }

    #[must_use]
    pub fn with_policy(mut self, policy: CheckPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn with_token_validator(mut self, validator: Option<Arc<dyn TokenValidator>>) -> Self {
        self.token_validator = validator;
        self
    }

    #[must_use]
    pub const fn with_auth_enabled(mut self, enabled: bool) -> Self {
        self.auth_enabled = enabled;
        self
    }

    #[must_use]
    pub fn with_spool_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.spool_dir = dir.into();
        self
    }

    #[must_use]
    pub fn build(self) -> SessionConfig {
        SessionConfig {
            hostname: if self.hostname.is_empty() {
                std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
            } else {
                self.hostname
            },
            max_message_size: self.max_message_size,
            max_recipients: self.max_recipients,
            timeouts: self.timeouts,
            tls: self.tls,
            registry: self.registry,
            delivery: self.delivery,
            checker: self.checker,
            policy: self.policy,
            token_validator: self.token_validator,
            auth_enabled: self.auth_enabled,
            spool_dir: self.spool_dir,
        }
    }
}
