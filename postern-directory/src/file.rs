//! File-backed directory: a user map loaded from the domain's config file.

use std::collections::HashMap;

use async_trait::async_trait;
use postern_common::Domain;
use sha2::{Digest, Sha256};

use crate::{AuthSession, Directory, DirectoryError};

/// Compute the stored form of a password: `sha256:<hex>`.
#[must_use]
pub fn password_digest(password: &str) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(password.as_bytes())))
}

/// In-process directory for one domain, backed by the user map in the
/// domain's config file. Lookups never fail transiently.
#[derive(Debug, Clone)]
pub struct FileDirectory {
    domain: Domain,
    users: HashMap<String, String>,
}

impl FileDirectory {
    #[must_use]
    pub fn new(domain: Domain, users: HashMap<String, String>) -> Self {
        Self { domain, users }
    }

    #[must_use]
    pub const fn domain(&self) -> &Domain {
        &self.domain
    }

    /// Strip a fully-qualified name down to its local part when the domain
    /// matches ours; reject fully-qualified names for other domains by
    /// returning a name that will not resolve.
    fn local_part<'a>(&self, user: &'a str) -> Option<&'a str> {
        match user.rsplit_once('@') {
            None => Some(user),
            Some((local, domain)) if Domain::new(domain) == self.domain => Some(local),
            Some(_) => None,
        }
    }
}

#[async_trait]
impl Directory for FileDirectory {
    async fn authenticate(
        &self,
        user: &str,
        password: &str,
    ) -> Result<AuthSession, DirectoryError> {
        let local = self
            .local_part(user)
            .ok_or(DirectoryError::InvalidCredentials)?;

        let stored = self
            .users
            .get(local)
            .ok_or(DirectoryError::InvalidCredentials)?;

        if *stored == password_digest(password) {
            Ok(AuthSession::new(format!("{local}@{}", self.domain)))
        } else {
            Err(DirectoryError::InvalidCredentials)
        }
    }

    async fn user_exists(&self, user: &str) -> Result<bool, DirectoryError> {
        Ok(self
            .local_part(user)
            .is_some_and(|local| self.users.contains_key(local)))
    }

    async fn close(&self) -> Result<(), DirectoryError> {
        Ok(())
    }
}
