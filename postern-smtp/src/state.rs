use core::fmt::{self, Display, Formatter};
use std::sync::Arc;

use postern_common::Domain;
use postern_delivery::DeliveryAgent;

/// Where the conversation stands. Commands are only legal from specific
/// phases; everything else answers `503`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Default)]
pub enum Phase {
    /// Connected, nothing said yet.
    #[default]
    Init,
    /// EHLO/HELO accepted.
    Greeted,
    /// MAIL FROM accepted, transaction open.
    MailSeen,
    /// At least one recipient accepted.
    RcptSeen,
    /// DATA accepted, body being read.
    Data,
}

impl Display for Phase {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Init => "initial",
            Self::Greeted => "greeted",
            Self::MailSeen => "mail",
            Self::RcptSeen => "rcpt",
            Self::Data => "data",
        })
    }
}

/// The delivery destination fixed at RCPT time, so a missing agent is
/// caught before the body is ever read.
#[derive(Debug, Clone)]
pub struct ResolvedRoute {
    pub domain: Domain,
    pub agent: Arc<dyn DeliveryAgent>,
}

/// Everything one connection remembers between commands. Owned by the
/// session driver; nothing else mutates it.
#[derive(Debug, Default)]
pub struct SessionState {
    phase: Phase,
    helo_domain: String,
    extended: bool,
    sender: String,
    mail_from_seen: bool,
    recipients: Vec<String>,
    auth_identity: String,
    auth_mechanism: String,
    tls_active: bool,
    route: Option<ResolvedRoute>,
}

impl SessionState {
    #[must_use]
    pub const fn phase(&self) -> Phase {
        self.phase
    }

    #[must_use]
    pub fn helo_domain(&self) -> &str {
        &self.helo_domain
    }

    #[must_use]
    pub const fn is_extended(&self) -> bool {
        self.extended
    }

    /// The accepted reverse path. Empty both before MAIL FROM and for the
    /// null sender; [`Self::mail_from_seen`] distinguishes the two.
    #[must_use]
    pub fn sender(&self) -> &str {
        &self.sender
    }

    #[must_use]
    pub const fn mail_from_seen(&self) -> bool {
        self.mail_from_seen
    }

    #[must_use]
    pub fn recipients(&self) -> &[String] {
        &self.recipients
    }

    #[must_use]
    pub fn auth_identity(&self) -> &str {
        &self.auth_identity
    }

    #[must_use]
    pub fn auth_mechanism(&self) -> &str {
        &self.auth_mechanism
    }

    #[must_use]
    pub const fn is_authenticated(&self) -> bool {
        !self.auth_identity.is_empty()
    }

    #[must_use]
    pub const fn tls_active(&self) -> bool {
        self.tls_active
    }

    #[must_use]
    pub const fn route(&self) -> Option<&ResolvedRoute> {
        self.route.as_ref()
    }

    /// EHLO/HELO: remember the client name and abandon any transaction in
    /// flight.
    pub fn greet(&mut self, domain: &str, extended: bool) {
        self.helo_domain = domain.to_string();
        self.extended = extended;
        self.clear_transaction();
        self.phase = Phase::Greeted;
    }

    /// MAIL FROM: open a transaction, replacing any open one.
    pub fn begin_mail(&mut self, sender: &str) {
        self.clear_transaction();
        self.sender = sender.to_string();
        self.mail_from_seen = true;
        self.phase = Phase::MailSeen;
    }

    /// RCPT accepted: record the mailbox and the route that will deliver
    /// to it.
    pub fn add_recipient(&mut self, recipient: String, route: ResolvedRoute) {
        self.recipients.push(recipient);
        self.route = Some(route);
        self.phase = Phase::RcptSeen;
    }

    /// DATA accepted.
    pub const fn enter_data(&mut self) {
        self.phase = Phase::Data;
    }

    /// RSET, or the end of a DATA transaction (either outcome): drop the
    /// transaction but keep the greeting and any authenticated identity.
    pub fn reset_transaction(&mut self) {
        self.clear_transaction();
        self.phase = if self.helo_domain.is_empty() {
            Phase::Init
        } else {
            Phase::Greeted
        };
    }

    /// Successful STARTTLS handshake: everything except the TCP endpoint
    /// identity is forgotten, per RFC 3207 §4.2 — including the
    /// authenticated identity.
    pub fn reset_for_tls(&mut self) {
        self.clear_transaction();
        self.helo_domain.clear();
        self.extended = false;
        self.auth_identity.clear();
        self.auth_mechanism.clear();
        self.phase = Phase::Init;
        self.tls_active = true;
    }

    /// Mark the connection as encrypted from the first byte (implicit-TLS
    /// listeners).
    pub const fn set_tls_active(&mut self) {
        self.tls_active = true;
    }

    pub fn authenticated(&mut self, identity: String, mechanism: &str) {
        self.auth_identity = identity;
        self.auth_mechanism = mechanism.to_string();
    }

    fn clear_transaction(&mut self) {
        self.sender.clear();
        self.mail_from_seen = false;
        self.recipients.clear();
        self.route = None;
    }
}
