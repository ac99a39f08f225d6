use std::fmt::{self, Display};

use mailparse::{MailAddr, SingleInfo};
use serde::{Serialize, Serializer};
use thiserror::Error;

use crate::domain::Domain;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("Malformed address: {0}")]
    Malformed(String),

    #[error("Group addresses are not valid in an envelope")]
    Group,

    #[error("Address is missing a domain part")]
    MissingDomain,

    #[error("Address is missing a local part")]
    MissingLocalPart,
}

/// A single envelope mailbox (`local@domain`), validated through
/// [`mailparse`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address(SingleInfo);

impl Address {
    /// Parse a single mailbox. Display names and groups are rejected since
    /// an envelope path carries a bare mailbox only.
    pub fn parse(raw: &str) -> Result<Self, AddressError> {
        let parsed =
            mailparse::addrparse(raw).map_err(|err| AddressError::Malformed(err.to_string()))?;

        let single = match parsed.first() {
            Some(MailAddr::Single(single)) => single.clone(),
            Some(MailAddr::Group(_)) => return Err(AddressError::Group),
            None => return Err(AddressError::Malformed(raw.to_owned())),
        };

        let (local, domain) = single
            .addr
            .rsplit_once('@')
            .ok_or(AddressError::MissingDomain)?;
        if local.is_empty() {
            return Err(AddressError::MissingLocalPart);
        }
        if domain.is_empty() {
            return Err(AddressError::MissingDomain);
        }

        Ok(Self(single))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0.addr
    }

    #[must_use]
    pub fn local_part(&self) -> &str {
        self.0
            .addr
            .rsplit_once('@')
            .map_or(self.0.addr.as_str(), |(local, _)| local)
    }

    #[must_use]
    pub fn domain(&self) -> Domain {
        self.0
            .addr
            .rsplit_once('@')
            .map_or_else(|| Domain::new(""), |(_, domain)| Domain::new(domain))
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.addr)
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.addr)
    }
}

#[cfg(test)]
mod test {
    use super::{Address, AddressError};

    #[test]
    fn parses_bare_mailbox() {
        let addr = Address::parse("alice@test.local").unwrap();
        assert_eq!(addr.as_str(), "alice@test.local");
        assert_eq!(addr.local_part(), "alice");
        assert_eq!(addr.domain().as_str(), "test.local");
    }

    #[test]
    fn parses_bracketed_mailbox() {
        let addr = Address::parse("<s@example.com>").unwrap();
        assert_eq!(addr.as_str(), "s@example.com");
    }

    #[test]
    fn domain_is_lowercased() {
        let addr = Address::parse("Alice@TEST.Local").unwrap();
        assert_eq!(addr.domain().as_str(), "test.local");
    }

    #[test]
    fn rejects_missing_parts() {
        assert!(Address::parse("---").is_err());
        assert!(Address::parse("").is_err());
        // The null path `<>` is an envelope-level concept, not a mailbox.
        assert!(matches!(
            Address::parse("<>"),
            Err(AddressError::Malformed(_) | AddressError::MissingDomain)
        ));
    }
}
