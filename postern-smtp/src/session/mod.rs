use std::{sync::Arc, time::Duration};

use postern_common::{
    Signal, address::Address, error::SessionError, info::ConnectionInfo, reply::Reply,
    status::Status, wire,
};
use postern_delivery::{DeliveryAgent, FileStoreAgent};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    SessionConfig,
    command::{Command, HeloVariant, MailParameters, ParseError},
    connection::Connection,
    error::ConnectionError,
    extensions::Extension,
    state::{Phase, ResolvedRoute, SessionState},
};

mod auth;
mod data;

#[cfg(test)]
pub(crate) mod testutil;

/// What the driver does after a command's reply has been written.
#[derive(PartialEq, Eq, Debug)]
pub enum Event {
    KeepAlive,
    Close,
    UpgradeTls,
}

pub(crate) fn to_session_error(err: ConnectionError) -> SessionError {
    match err {
        ConnectionError::Io(io) => SessionError::Connection(io),
        ConnectionError::LineTooLong => SessionError::LineTooLong,
        ConnectionError::Closed => SessionError::Cancelled,
    }
}

fn bad_sequence() -> Reply {
    Reply::new(
        Status::InvalidCommandSequence,
        "5.5.1 Bad sequence of commands",
    )
}

/// One SMTP conversation over one accepted connection.
pub struct Session<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> {
    pub(crate) connection: Connection<Stream>,
    pub(crate) info: ConnectionInfo,
    pub(crate) state: SessionState,
    pub(crate) config: Arc<SessionConfig>,
    started: std::time::Instant,
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> Session<Stream> {
    pub fn create(
        connection: Connection<Stream>,
        info: ConnectionInfo,
        config: Arc<SessionConfig>,
    ) -> Self {
        let mut state = SessionState::default();
        if connection.is_tls() {
            state.set_tls_active();
        }

        Self {
            connection,
            info,
            state,
            config,
            started: std::time::Instant::now(),
        }
    }

    /// Drive the conversation to completion. Returns when the client
    /// quits, the connection drops, a fatal protocol error occurs, or the
    /// server shuts down.
    pub async fn run(
        self,
        mut signal: tokio::sync::broadcast::Receiver<Signal>,
    ) -> Result<(), SessionError> {
        tracing::debug!(
            peer = %self.info.peer(),
            reverse = self.info.reverse_name().unwrap_or("-"),
            "connected"
        );
        if let Some(metrics) = postern_metrics::try_metrics() {
            metrics.smtp.record_connection();
        }

        let started = self.started;
        let result = Self::run_inner(self, &mut signal).await;

        if let Some(metrics) = postern_metrics::try_metrics() {
            metrics
                .smtp
                .record_connection_closed(started.elapsed().as_secs_f64());
        }
        tracing::debug!("connection closed");

        result
    }

    async fn run_inner(
        mut session: Self,
        signal: &mut tokio::sync::broadcast::Receiver<Signal>,
    ) -> Result<(), SessionError> {
        let hostname = session.config.hostname.clone();

        session
            .send(&Reply::new(
                Status::ServiceReady,
                format!("{hostname} ESMTP ready"),
            ))
            .await?;

        let command_secs = session.config.timeouts.command_secs;
        let connection_secs = session.config.timeouts.connection_secs;

        loop {
            if session.started.elapsed() >= Duration::from_secs(connection_secs) {
                tracing::warn!(
                    peer = ?session.info.peer(),
                    lifetime = connection_secs,
                    "session exceeded maximum lifetime"
                );
                let _ = session
                    .send(&Reply::new(
                        Status::Unavailable,
                        format!("{hostname} session lifetime exceeded"),
                    ))
                    .await;
                return Err(SessionError::Timeout(connection_secs));
            }

            let command_timeout = Duration::from_secs(command_secs);

            let line = tokio::select! {
                _ = signal.recv() => {
                    let _ = session
                        .send(&Reply::new(
                            Status::Unavailable,
                            format!("{hostname} shutdown in progress"),
                        ))
                        .await;
                    return Ok(());
                }

                result = tokio::time::timeout(command_timeout, session.connection.read_line()) => {
                    match result {
                        Err(_) => {
                            tracing::warn!(
                                peer = ?session.info.peer(),
                                timeout_secs = command_secs,
                                "client timed out waiting for a command"
                            );
                            let _ = session
                                .send(&Reply::new(
                                    Status::Unavailable,
                                    format!("{hostname} timeout"),
                                ))
                                .await;
                            return Err(SessionError::Timeout(command_secs));
                        }
                        Ok(Err(ConnectionError::LineTooLong)) => {
                            let _ = session
                                .send(&Reply::new(Status::CommandUnrecognised, "5.5.2 Line too long"))
                                .await;
                            return Err(SessionError::LineTooLong);
                        }
                        Ok(Err(err)) => return Err(to_session_error(err)),
                        // EOF: the peer hung up, close silently.
                        Ok(Ok(None)) => return Ok(()),
                        Ok(Ok(Some(line))) => line,
                    }
                }
            };

            if line.is_empty() {
                continue;
            }

            let command = match Command::try_from(line.as_slice()) {
                Ok(command) => command,
                Err(err) => {
                    let reply = match &err {
                        ParseError::Unrecognised(_) => {
                            Reply::new(Status::CommandUnrecognised, format!("5.5.2 {err}"))
                        }
                        ParseError::Syntax(_) => {
                            Reply::new(Status::SyntaxError, format!("5.5.4 {err}"))
                        }
                    };
                    session.send(&reply).await?;
                    continue;
                }
            };

            wire!(rx: "{command}");

            match session.handle_command(command).await? {
                Event::KeepAlive => {}
                Event::Close => return Ok(()),
                Event::UpgradeTls => {
                    let Some(tls) = session.config.tls.clone() else {
                        return Err(SessionError::Protocol(
                            "TLS upgrade without certificate material".to_string(),
                        ));
                    };

                    match session.connection.upgrade(&tls).await {
                        Ok((connection, tls_info)) => {
                            session.connection = connection;
                            session.state.reset_for_tls();
                            tracing::debug!(
                                protocol = %tls_info.proto(),
                                cipher = %tls_info.cipher(),
                                "connection upgraded"
                            );
                        }
                        Err(err) => {
                            // The stream is in an unknown state; nothing
                            // can be written anymore.
                            return Err(SessionError::Protocol(format!(
                                "TLS handshake failed: {err}"
                            )));
                        }
                    }
                }
            }
        }
    }

    async fn handle_command(&mut self, command: Command) -> Result<Event, SessionError> {
        let (reply, event) = match command {
            Command::Helo(variant) => self.handle_helo(&variant),
            Command::MailFrom { path, params } => self.handle_mail(path.as_ref(), &params),
            Command::RcptTo { path, .. } => self.handle_rcpt(&path).await,
            Command::Rset => self.handle_rset(),
            Command::Noop(_) => (Reply::new(Status::Ok, "OK"), Event::KeepAlive),
            Command::Quit => (Reply::new(Status::GoodBye, "Goodbye"), Event::Close),
            Command::StartTls => self.handle_starttls(),
            // DATA and AUTH run their own read/write exchanges.
            Command::Data => return self.handle_data().await,
            Command::Auth { mechanism, initial } => {
                return self.handle_auth(&mechanism, initial).await;
            }
        };

        self.send(&reply).await?;
        Ok(event)
    }

    /// Write one reply, recording error metrics for 4xx/5xx.
    pub(crate) async fn send(&mut self, reply: &Reply) -> Result<(), SessionError> {
        wire!(tx: "{reply}");

        if let Some(metrics) = postern_metrics::try_metrics()
            && (reply.is_temporary() || reply.is_permanent())
        {
            metrics.smtp.record_error(reply.status().code());
        }

        self.connection
            .send_reply(reply)
            .await
            .map_err(to_session_error)
    }

    fn capabilities(&self) -> Vec<Extension> {
        let mut capabilities = vec![
            Extension::Size(self.config.max_message_size),
            Extension::EightBitMime,
        ];

        if self.config.tls.is_some() && !self.connection.is_tls() {
            capabilities.push(Extension::StartTls);
        }

        // Cleartext credentials only ever over TLS or loopback.
        if self.config.auth_enabled && (self.state.tls_active() || self.info.is_loopback()) {
            capabilities.push(Extension::Auth(vec!["PLAIN", "OAUTHBEARER"]));
        }

        capabilities
    }

    fn handle_helo(&mut self, variant: &HeloVariant) -> (Reply, Event) {
        let domain = variant.domain();
        let extended = matches!(variant, HeloVariant::Ehlo(_));
        self.state.greet(domain, extended);

        let banner = format!(
            "{} Hello {domain} [{}]",
            self.config.hostname,
            self.info.ip()
        );

        let reply = if extended {
            self.capabilities()
                .iter()
                .fold(Reply::new(Status::Ok, banner), |reply, extension| {
                    reply.line(extension.to_string())
                })
        } else {
            // Legacy HELO: a single line, no capability advertisement.
            Reply::new(Status::Ok, banner)
        };

        (reply, Event::KeepAlive)
    }

    fn handle_mail(&mut self, path: Option<&Address>, params: &MailParameters) -> (Reply, Event) {
        if self.state.phase() < Phase::Greeted {
            return (bad_sequence(), Event::KeepAlive);
        }

        // RFC 1870: refuse a declared size beyond the cap before the body
        // is ever sent.
        if let Some(declared) = params.size()
            && self.config.max_message_size > 0
            && declared > self.config.max_message_size
        {
            return (
                Reply::new(
                    Status::ExceededStorage,
                    format!(
                        "5.3.4 Declared message size {declared} exceeds maximum {}",
                        self.config.max_message_size
                    ),
                ),
                Event::KeepAlive,
            );
        }

        self.state.begin_mail(path.map_or("", Address::as_str));
        (Reply::new(Status::Ok, "OK"), Event::KeepAlive)
    }

    async fn handle_rcpt(&mut self, path: &Address) -> (Reply, Event) {
        if self.state.phase() < Phase::MailSeen {
            return (bad_sequence(), Event::KeepAlive);
        }

        let domain = path.domain();
        if domain.is_empty() {
            return (
                Reply::new(Status::Error, "5.1.2 Invalid address"),
                Event::KeepAlive,
            );
        }

        if self.state.recipients().len() >= self.config.max_recipients {
            return (
                Reply::new(Status::InsufficientStorage, "4.5.3 Too many recipients"),
                Event::KeepAlive,
            );
        }

        let Some(handle) = self.config.registry.lookup(&domain) else {
            return (
                Reply::new(Status::Error, "5.1.2 Domain not accepted"),
                Event::KeepAlive,
            );
        };

        match handle.directory().user_exists(path.local_part()).await {
            Ok(true) => {}
            Ok(false) => {
                return (
                    Reply::new(Status::Error, "5.1.1 User unknown"),
                    Event::KeepAlive,
                );
            }
            Err(err) => {
                tracing::warn!(%domain, %err, "user lookup failed");
                return (
                    Reply::new(Status::ActionAborted, "4.3.0 Temporary lookup failure"),
                    Event::KeepAlive,
                );
            }
        }

        // Fix the delivery destination now, so a missing agent rejects the
        // recipient instead of the fully-transferred message.
        let agent: Option<Arc<dyn DeliveryAgent>> = handle
            .deliver_to()
            .map(|path| Arc::new(FileStoreAgent::new(path)) as Arc<dyn DeliveryAgent>)
            .or_else(|| self.config.delivery.clone());

        let Some(agent) = agent else {
            return (
                Reply::new(
                    Status::InsufficientStorage,
                    "4.3.5 Delivery not available, try again later",
                ),
                Event::KeepAlive,
            );
        };

        self.state
            .add_recipient(path.as_str().to_string(), ResolvedRoute { domain, agent });

        (Reply::new(Status::Ok, "OK"), Event::KeepAlive)
    }

    fn handle_rset(&mut self) -> (Reply, Event) {
        self.state.reset_transaction();
        (Reply::new(Status::Ok, "OK"), Event::KeepAlive)
    }

    fn handle_starttls(&self) -> (Reply, Event) {
        if self.config.tls.is_none() {
            return (
                Reply::new(Status::NotImplemented, "5.5.1 STARTTLS not offered"),
                Event::KeepAlive,
            );
        }

        if self.connection.is_tls() {
            return (
                Reply::new(Status::InvalidCommandSequence, "5.5.1 TLS already active"),
                Event::KeepAlive,
            );
        }

        (
            Reply::new(Status::ServiceReady, "Ready to start TLS"),
            Event::UpgradeTls,
        )
    }
}
