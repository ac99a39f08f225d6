//! User directories and per-domain configuration.
//!
//! A [`Directory`] answers two questions for exactly one domain: does this
//! user exist, and are these credentials valid. The SMTP core only ever
//! talks to the trait; the file-backed implementation here is the default
//! back-end, and deployments with an external store supply their own.

use std::fmt::Debug;

use async_trait::async_trait;
use thiserror::Error;

pub mod file;
pub mod registry;
pub mod token;

pub use file::FileDirectory;
pub use registry::{DomainConfig, DomainHandle, DomainRegistry};
pub use token::{StaticTokenValidator, TokenValidator};

#[derive(Debug, Error)]
pub enum DirectoryError {
    /// Authentication failed: the user does not exist or the password does
    /// not match. Callers must not reveal which.
    #[error("Invalid credentials")]
    InvalidCredentials,

    /// The back-end could not be consulted right now.
    #[error("Lookup failed: {0}")]
    Lookup(String),

    /// I/O failure talking to the back-end.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DirectoryError {
    /// Transient errors map to a 4xx reply so the client retries later;
    /// everything else is a permanent 5xx.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Lookup(_) | Self::Io(_))
    }
}

/// An authenticated identity returned by a successful credential check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSession {
    user: String,
}

impl AuthSession {
    #[must_use]
    pub fn new(user: impl Into<String>) -> Self {
        Self { user: user.into() }
    }

    #[must_use]
    pub fn user(&self) -> &str {
        &self.user
    }
}

/// The credential and user-existence back-end for one domain.
#[async_trait]
pub trait Directory: Send + Sync + Debug {
    /// Verify credentials. `user` may be a bare local part or a fully
    /// qualified `local@domain` name.
    async fn authenticate(&self, user: &str, password: &str)
    -> Result<AuthSession, DirectoryError>;

    /// Whether the named user can receive mail in this domain.
    async fn user_exists(&self, user: &str) -> Result<bool, DirectoryError>;

    /// Release any held resources. Idempotent.
    async fn close(&self) -> Result<(), DirectoryError>;
}
