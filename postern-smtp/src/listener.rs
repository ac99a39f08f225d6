use core::fmt::{self, Display};
use std::{
    net::{IpAddr, SocketAddr},
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use futures_util::future::join_all;
use postern_common::{Signal, error::ListenerError, info::ConnectionInfo};
use serde::Deserialize;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{broadcast, oneshot},
};
use trust_dns_resolver::TokioAsyncResolver;

use crate::{
    SessionConfig,
    connection::{Connection, build_acceptor},
    session::Session,
};

/// How long one PTR query may hold up a new session.
const REVERSE_LOOKUP_TIMEOUT: Duration = Duration::from_secs(2);

/// Best-effort PTR lookup for the peer. Loopback peers are skipped, and
/// any failure just leaves the connection without a reverse name.
async fn reverse_lookup(resolver: Option<&TokioAsyncResolver>, ip: IpAddr) -> Option<String> {
    let resolver = resolver?;
    if ip.is_loopback() {
        return None;
    }

    match tokio::time::timeout(REVERSE_LOOKUP_TIMEOUT, resolver.reverse_lookup(ip)).await {
        Ok(Ok(ptr)) => ptr
            .iter()
            .next()
            .map(|name| name.to_utf8().trim_end_matches('.').to_string()),
        Ok(Err(err)) => {
            tracing::trace!(%ip, %err, "reverse lookup failed");
            None
        }
        Err(_) => {
            tracing::trace!(%ip, "reverse lookup timed out");
            None
        }
    }
}

/// Security profile of one listening socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenerMode {
    /// Port 25 style: cleartext with opportunistic STARTTLS.
    Plain,
    /// Port 587 style: cleartext submission with STARTTLS.
    Submission,
    /// Port 465 style: TLS from the first byte.
    ImplicitTls,
    /// An additional cleartext port (testing, odd firewalls).
    Alt,
}

impl Display for ListenerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Plain => "plain",
            Self::Submission => "submission",
            Self::ImplicitTls => "implicit_tls",
            Self::Alt => "alt",
        })
    }
}

impl FromStr for ListenerMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plain" => Ok(Self::Plain),
            "submission" => Ok(Self::Submission),
            "implicit_tls" => Ok(Self::ImplicitTls),
            "alt" => Ok(Self::Alt),
            other => Err(format!("unknown listener mode: {other}")),
        }
    }
}

/// One bound socket accepting SMTP connections, each served by its own
/// task.
pub struct Listener {
    address: SocketAddr,
    mode: ListenerMode,
    session_config: Arc<SessionConfig>,
}

impl Listener {
    #[must_use]
    pub const fn new(
        address: SocketAddr,
        mode: ListenerMode,
        session_config: Arc<SessionConfig>,
    ) -> Self {
        Self {
            address,
            mode,
            session_config,
        }
    }

    #[must_use]
    pub const fn mode(&self) -> ListenerMode {
        self.mode
    }

    /// Validate the listener's TLS requirements and bind its socket.
    pub async fn bind(self) -> Result<BoundListener, ListenerError> {
        let acceptor = match self.mode {
            ListenerMode::ImplicitTls => {
                let tls = self.session_config.tls.as_ref().ok_or_else(|| {
                    ListenerError::InvalidConfiguration(format!(
                        "{} requires TLS certificate material",
                        self.mode
                    ))
                })?;
                Some(
                    build_acceptor(tls)
                        .map_err(|err| ListenerError::InvalidConfiguration(err.to_string()))?,
                )
            }
            _ => None,
        };

        let listener =
            TcpListener::bind(self.address)
                .await
                .map_err(|source| ListenerError::BindFailed {
                    address: self.address.to_string(),
                    source,
                })?;

        let resolver = match TokioAsyncResolver::tokio_from_system_conf() {
            Ok(resolver) => Some(resolver),
            Err(err) => {
                tracing::debug!(%err, "no system resolver; reverse DNS disabled");
                None
            }
        };

        tracing::info!(address = %self.address, mode = %self.mode, "listening");

        Ok(BoundListener {
            listener,
            acceptor,
            mode: self.mode,
            session_config: self.session_config,
            resolver,
        })
    }

    /// Bind, then accept until shutdown. See [`BoundListener::serve`].
    pub async fn serve(self, shutdown: broadcast::Receiver<Signal>) -> Result<(), ListenerError> {
        self.bind().await?.serve(shutdown).await
    }
}

/// A listener whose socket is bound; the local address is now known even
/// when the configuration asked for port 0.
pub struct BoundListener {
    listener: TcpListener,
    acceptor: Option<tokio_rustls::TlsAcceptor>,
    mode: ListenerMode,
    session_config: Arc<SessionConfig>,
    resolver: Option<TokioAsyncResolver>,
}

impl BoundListener {
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    #[must_use]
    pub const fn mode(&self) -> ListenerMode {
        self.mode
    }

    /// Accept until the shutdown signal arrives, then wait for in-flight
    /// sessions up to the configured grace period.
    pub async fn serve(
        &self,
        mut shutdown: broadcast::Receiver<Signal>,
    ) -> Result<(), ListenerError> {
        let mut ordinal: u64 = 0;
        let mut sessions = Vec::new();

        loop {
            tokio::select! {
                sig = shutdown.recv() => {
                    if matches!(sig, Ok(Signal::Shutdown) | Err(_)) {
                        tracing::info!(
                            in_flight = sessions.len(),
                            "listener received shutdown, finishing sessions"
                        );
                        self.drain(sessions).await;
                        break;
                    }
                }

                connection = self.listener.accept() => {
                    let (stream, peer) = connection?;
                    ordinal += 1;
                    tracing::debug!(%peer, ordinal, "connection received");

                    let config = Arc::clone(&self.session_config);
                    let acceptor = self.acceptor.clone();
                    let resolver = self.resolver.clone();
                    let signal = shutdown.resubscribe();

                    sessions.push(tokio::spawn(async move {
                        let reverse_name = reverse_lookup(resolver.as_ref(), peer.ip()).await;
                        let info = ConnectionInfo::new(peer, ordinal)
                            .with_reverse_name(reverse_name);

                        let connection = match acceptor {
                            Some(acceptor) => match acceptor.accept(stream).await {
                                Ok(tls) => Connection::tls(tls),
                                Err(err) => {
                                    tracing::error!(%peer, %err, "TLS accept failed");
                                    return;
                                }
                            },
                            None => Connection::plain(stream),
                        };

                        if let Err(err) = Session::create(connection, info, config).run(signal).await
                            && !err.is_shutdown()
                        {
                            tracing::error!(%peer, %err, "session ended with error");
                        }
                    }));

                    sessions.retain(|session| !session.is_finished());
                }
            }
        }

        Ok(())
    }

    async fn drain(&self, sessions: Vec<tokio::task::JoinHandle<()>>) {
        let grace = Duration::from_secs(self.session_config.timeouts.shutdown_grace_secs);
        let aborts: Vec<_> = sessions
            .iter()
            .map(tokio::task::JoinHandle::abort_handle)
            .collect();

        if tokio::time::timeout(grace, join_all(sessions)).await.is_err() {
            tracing::warn!("shutdown grace period expired, closing remaining sessions");
            for abort in aborts {
                abort.abort();
            }
        }
    }
}

/// A listener over one inherited, already-accepted socket. The first
/// accept yields it; every later accept waits for either the session to
/// end or a stop request and then reports [`ListenerError::Closed`].
///
/// The two conditions arrive on separate channels on purpose: the session
/// side closes its channel by dropping the [`SessionTicket`], the
/// supervisor side by dropping or firing the stop sender. Neither path
/// ever touches the other's channel, so finishing a session while a stop
/// request lands cannot double-close anything.
pub struct OneShotListener {
    slot: Option<TcpStream>,
    session_done: oneshot::Receiver<()>,
    stop: oneshot::Receiver<()>,
}

/// Held alongside the inherited connection; dropping it tells the
/// listener the session is over.
#[derive(Debug)]
pub struct SessionTicket {
    _done: oneshot::Sender<()>,
}

impl OneShotListener {
    #[must_use]
    pub fn new(stream: TcpStream, stop: oneshot::Receiver<()>) -> (Self, SessionTicket) {
        let (done_tx, done_rx) = oneshot::channel();

        (
            Self {
                slot: Some(stream),
                session_done: done_rx,
                stop,
            },
            SessionTicket { _done: done_tx },
        )
    }

    pub async fn accept(&mut self) -> Result<TcpStream, ListenerError> {
        if let Some(stream) = self.slot.take() {
            return Ok(stream);
        }

        tokio::select! {
            _ = &mut self.session_done => {}
            _ = &mut self.stop => {}
        }

        Err(ListenerError::Closed)
    }
}

#[cfg(test)]
mod test {
    use postern_common::error::ListenerError;
    use tokio::sync::oneshot;

    use super::{ListenerMode, OneShotListener};

    #[test]
    fn listener_mode_round_trip() {
        for mode in [
            ListenerMode::Plain,
            ListenerMode::Submission,
            ListenerMode::ImplicitTls,
            ListenerMode::Alt,
        ] {
            assert_eq!(mode.to_string().parse::<ListenerMode>().unwrap(), mode);
        }

        assert!("smtp".parse::<ListenerMode>().is_err());
    }

    #[tokio::test]
    async fn one_shot_listener_yields_exactly_once() {
        let bound = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = bound.local_addr().unwrap();
        let client = tokio::net::TcpStream::connect(addr);
        let server = bound.accept();
        let (server, _client) = tokio::join!(server, client);
        let (stream, _) = server.unwrap();

        let (_stop_tx, stop_rx) = oneshot::channel();
        let (mut listener, ticket) = OneShotListener::new(stream, stop_rx);

        let accepted = listener.accept().await;
        assert!(accepted.is_ok());

        // Session finishes: the ticket drops, the next accept closes.
        drop(ticket);
        assert!(matches!(listener.accept().await, Err(ListenerError::Closed)));
    }

    #[tokio::test]
    async fn one_shot_listener_honours_stop_requests() {
        let bound = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = bound.local_addr().unwrap();
        let client = tokio::net::TcpStream::connect(addr);
        let server = bound.accept();
        let (server, _client) = tokio::join!(server, client);
        let (stream, _) = server.unwrap();

        let (stop_tx, stop_rx) = oneshot::channel();
        let (mut listener, ticket) = OneShotListener::new(stream, stop_rx);
        let _session_still_running = ticket;

        let _ = listener.accept().await.unwrap();

        // The supervisor asks us to stop while the session is alive.
        stop_tx.send(()).unwrap();
        assert!(matches!(listener.accept().await, Err(ListenerError::Closed)));
    }
}
