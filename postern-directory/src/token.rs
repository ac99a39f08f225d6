//! Bearer-token validation for OAUTHBEARER.
//!
//! Token verification belongs to the identity provider, not the SMTP core,
//! so the core only sees this trait. The static validator serves tests and
//! small deployments with pre-issued tokens.

use std::{collections::HashMap, fmt::Debug};

use async_trait::async_trait;

use crate::DirectoryError;

/// Validates a bearer token and resolves it to the authenticated username.
#[async_trait]
pub trait TokenValidator: Send + Sync + Debug {
    async fn validate(&self, token: &str) -> Result<String, DirectoryError>;
}

/// Fixed token → username map.
#[derive(Debug, Default)]
pub struct StaticTokenValidator {
    tokens: HashMap<String, String>,
}

impl StaticTokenValidator {
    #[must_use]
    pub const fn new(tokens: HashMap<String, String>) -> Self {
        Self { tokens }
    }
}

#[async_trait]
impl TokenValidator for StaticTokenValidator {
    async fn validate(&self, token: &str) -> Result<String, DirectoryError> {
        self.tokens
            .get(token)
            .cloned()
            .ok_or(DirectoryError::InvalidCredentials)
    }
}
