use std::net::SocketAddr;

/// Facts about the peer of one accepted connection, captured at accept time
/// and carried through the session for logging, policy, and the check
/// pipeline.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    peer: SocketAddr,
    /// Reverse-DNS name of the peer, when a resolver was consulted.
    reverse_name: Option<String>,
    /// How many connections this listener had accepted when this one
    /// arrived, including it.
    ordinal: u64,
}

impl ConnectionInfo {
    #[must_use]
    pub const fn new(peer: SocketAddr, ordinal: u64) -> Self {
        Self {
            peer,
            reverse_name: None,
            ordinal,
        }
    }

    #[must_use]
    pub fn with_reverse_name(mut self, name: Option<String>) -> Self {
        self.reverse_name = name;
        self
    }

    #[must_use]
    pub const fn peer(&self) -> SocketAddr {
        self.peer
    }

    #[must_use]
    pub fn ip(&self) -> String {
        self.peer.ip().to_string()
    }

    #[must_use]
    pub fn reverse_name(&self) -> Option<&str> {
        self.reverse_name.as_deref()
    }

    #[must_use]
    pub const fn ordinal(&self) -> u64 {
        self.ordinal
    }

    /// Whether the peer connected over a loopback address. Cleartext AUTH
    /// is only offered to these peers.
    #[must_use]
    pub fn is_loopback(&self) -> bool {
        self.peer.ip().is_loopback()
    }
}
