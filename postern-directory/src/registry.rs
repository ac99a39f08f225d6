//! The per-domain configuration tree.
//!
//! Each accepted domain is a subdirectory of the configured root holding a
//! `domain.ron`:
//!
//! ```ron
//! DomainConfig(
//!     users: {
//!         "alice": "sha256:9b8769a4a742959a2d0298c36fb70623f2dfacda8436237df08d8dfd5b37374c",
//!     },
//!     deliver_to: Some("/var/mail/test.local"),
//! )
//! ```
//!
//! The registry is loaded once at startup and read-only afterwards; every
//! session shares the same handles.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use postern_common::Domain;
use serde::Deserialize;
use thiserror::Error;

use crate::{Directory, FileDirectory};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Unable to read domain tree at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unable to parse {path}: {reason}")]
    Parse { path: PathBuf, reason: String },
}

/// On-disk shape of `<root>/<domain>/domain.ron`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DomainConfig {
    /// Local part → password digest (`sha256:<hex>`). Users listed here
    /// exist for RCPT validation whether or not they can authenticate.
    #[serde(default)]
    pub users: HashMap<String, String>,

    /// Per-domain message store directory. When unset the domain uses the
    /// server-wide delivery agent.
    #[serde(default)]
    pub deliver_to: Option<PathBuf>,
}

/// Everything the SMTP core needs to know about one accepted domain.
#[derive(Debug)]
pub struct DomainHandle {
    domain: Domain,
    directory: Arc<dyn Directory>,
    deliver_to: Option<PathBuf>,
}

impl DomainHandle {
    #[must_use]
    pub fn new(domain: Domain, directory: Arc<dyn Directory>, deliver_to: Option<PathBuf>) -> Self {
        Self {
            domain,
            directory,
            deliver_to,
        }
    }

    #[must_use]
    pub const fn domain(&self) -> &Domain {
        &self.domain
    }

    #[must_use]
    pub fn directory(&self) -> &Arc<dyn Directory> {
        &self.directory
    }

    #[must_use]
    pub fn deliver_to(&self) -> Option<&Path> {
        self.deliver_to.as_deref()
    }
}

/// All domains this server accepts mail for.
#[derive(Debug, Default)]
pub struct DomainRegistry {
    domains: HashMap<Domain, Arc<DomainHandle>>,
}

impl DomainRegistry {
    /// Load every `<root>/<domain>/domain.ron` in the tree. Entries that
    /// are not directories are skipped; a directory without a config file
    /// is a configuration error.
    pub fn load(root: &Path) -> Result<Self, RegistryError> {
        let mut domains = HashMap::new();

        let entries = std::fs::read_dir(root).map_err(|source| RegistryError::Io {
            path: root.to_path_buf(),
            source,
        })?;

        for entry in entries {
            let entry = entry.map_err(|source| RegistryError::Io {
                path: root.to_path_buf(),
                source,
            })?;

            if !entry.path().is_dir() {
                continue;
            }

            let domain = Domain::new(&entry.file_name().to_string_lossy());
            let config_path = entry.path().join("domain.ron");
            let content =
                std::fs::read_to_string(&config_path).map_err(|source| RegistryError::Io {
                    path: config_path.clone(),
                    source,
                })?;

            let config: DomainConfig =
                ron::from_str(&content).map_err(|err| RegistryError::Parse {
                    path: config_path,
                    reason: err.to_string(),
                })?;

            tracing::debug!(%domain, users = config.users.len(), "loaded domain");
            domains.insert(
                domain.clone(),
                Arc::new(DomainHandle::new(
                    domain.clone(),
                    Arc::new(FileDirectory::new(domain, config.users)),
                    config.deliver_to,
                )),
            );
        }

        Ok(Self { domains })
    }

    /// Register a domain programmatically. Used by tests and by embedders
    /// that bring their own [`Directory`].
    pub fn insert(&mut self, handle: DomainHandle) {
        self.domains.insert(handle.domain().clone(), Arc::new(handle));
    }

    #[must_use]
    pub fn lookup(&self, domain: &Domain) -> Option<Arc<DomainHandle>> {
        self.domains.get(domain).cloned()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.domains.len()
    }
}

#[cfg(test)]
mod test {
    use postern_common::Domain;

    use super::DomainRegistry;
    use crate::file::password_digest;

    #[test]
    fn loads_domain_tree() {
        let root = tempfile::tempdir().unwrap();
        let domain_dir = root.path().join("test.local");
        std::fs::create_dir(&domain_dir).unwrap();
        std::fs::write(
            domain_dir.join("domain.ron"),
            format!(
                "DomainConfig(users: {{ \"alice\": \"{}\" }})",
                password_digest("sekrit")
            ),
        )
        .unwrap();

        let registry = DomainRegistry::load(root.path()).unwrap();
        assert_eq!(registry.len(), 1);

        let handle = registry.lookup(&Domain::new("test.local")).unwrap();
        assert_eq!(handle.domain().as_str(), "test.local");
        assert!(handle.deliver_to().is_none());

        assert!(registry.lookup(&Domain::new("other.example")).is_none());
    }

    #[test]
    fn rejects_unparsable_config() {
        let root = tempfile::tempdir().unwrap();
        let domain_dir = root.path().join("bad.local");
        std::fs::create_dir(&domain_dir).unwrap();
        std::fs::write(domain_dir.join("domain.ron"), "not ron at all }{").unwrap();

        assert!(DomainRegistry::load(root.path()).is_err());
    }
}
