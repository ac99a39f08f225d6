//! Process-per-connection operation.
//!
//! The supervisor binds the same listeners as in-process mode, but each
//! accepted socket is handed to a fresh child process (this same binary's
//! `protocol-handler` subcommand) as inherited file descriptor 3. A crash
//! or corruption in one session cannot touch any other, and the child can
//! be sandboxed independently of the acceptor.

use std::{
    net::SocketAddr,
    os::fd::{FromRawFd, IntoRawFd, OwnedFd, RawFd},
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use futures_util::future::join_all;
use postern_common::{Signal, error::ListenerError, info::ConnectionInfo};
use postern_smtp::{
    connection::{Connection, build_acceptor},
    listener::{ListenerMode, OneShotListener},
    session::Session,
};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{broadcast, oneshot},
};

use crate::config::{ListenerEntry, PosternConfig};

/// Where the accepted socket lands in the child.
pub const INHERITED_SOCKET_FD: RawFd = 3;

pub const ENV_CLIENT_IP: &str = "SMTPD_CLIENT_IP";
pub const ENV_LISTENER_MODE: &str = "SMTPD_LISTENER_MODE";

/// Bind every configured listener and hand connections to children until
/// shutdown.
pub async fn serve_all(
    config: &PosternConfig,
    config_path: &Path,
    shutdown: &broadcast::Sender<Signal>,
) -> anyhow::Result<()> {
    join_all(config.listeners.iter().map(|entry| {
        serve(
            entry.clone(),
            config_path.to_path_buf(),
            shutdown.subscribe(),
        )
    }))
    .await
    .into_iter()
    .collect()
}

async fn serve(
    entry: ListenerEntry,
    config_path: PathBuf,
    mut shutdown: broadcast::Receiver<Signal>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(entry.address).await?;
    tracing::info!(address = %entry.address, mode = %entry.mode, "supervising");

    let active = Arc::new(AtomicU64::new(0));

    loop {
        tokio::select! {
            sig = shutdown.recv() => {
                if matches!(sig, Ok(Signal::Shutdown) | Err(_)) {
                    tracing::info!(
                        address = %entry.address,
                        outstanding = active.load(Ordering::Relaxed),
                        "supervisor shutting down"
                    );
                    break;
                }
            }

            connection = listener.accept() => {
                let (stream, peer) = connection?;
                if let Err(err) = spawn_child(stream, peer, entry.mode, &config_path, &active) {
                    tracing::error!(%peer, %err, "unable to spawn protocol handler");
                }
            }
        }
    }

    Ok(())
}

/// Hand one accepted socket to a fresh protocol-handler child and reap it
/// in the background. The supervisor's copy of the socket is closed
/// before this returns.
fn spawn_child(
    stream: TcpStream,
    peer: SocketAddr,
    mode: ListenerMode,
    config_path: &Path,
    active: &Arc<AtomicU64>,
) -> std::io::Result<()> {
    let std_stream = stream.into_std()?;
    // The child expects an ordinary blocking socket.
    std_stream.set_nonblocking(false)?;
    let fd: RawFd = std_stream.into_raw_fd();

    let mut command = tokio::process::Command::new(std::env::current_exe()?);
    command
        .arg("protocol-handler")
        .arg("--config")
        .arg(config_path)
        .env(ENV_CLIENT_IP, peer.ip().to_string())
        .env(ENV_LISTENER_MODE, mode.to_string());

    // SAFETY: dup2 is async-signal-safe and `fd` stays open until after
    // spawn; dup2 also clears CLOEXEC on the duplicate, so the socket
    // survives the exec.
    unsafe {
        command.pre_exec(move || {
            if libc::dup2(fd, INHERITED_SOCKET_FD) == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let spawned = command.spawn();

    // Whether or not the child exists, the parent's copy is done.
    // SAFETY: `fd` came from into_raw_fd above and is not used again.
    drop(unsafe { OwnedFd::from_raw_fd(fd) });

    let mut child = spawned?;
    tracing::debug!(%peer, pid = child.id(), "protocol handler spawned");

    active.fetch_add(1, Ordering::Relaxed);
    let active = Arc::clone(active);

    // Reap asynchronously. The session's outcome is the child's own
    // business; there is no back-channel.
    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) if status.success() => {
                tracing::debug!(%peer, "protocol handler finished");
            }
            Ok(status) => {
                tracing::warn!(%peer, %status, "protocol handler exited abnormally");
            }
            Err(err) => {
                tracing::error!(%peer, %err, "unable to reap protocol handler");
            }
        }
        active.fetch_sub(1, Ordering::Relaxed);
    });

    Ok(())
}

/// The child half: wrap inherited fd 3 in a one-shot listener, run exactly
/// one session through the ordinary driver, and exit.
pub async fn run_protocol_handler(
    config: PosternConfig,
    config_path: &Path,
) -> anyhow::Result<()> {
    let mode = std::env::var(ENV_LISTENER_MODE)
        .ok()
        .and_then(|raw| raw.parse::<ListenerMode>().ok())
        .unwrap_or(ListenerMode::Plain);
    let client_ip = std::env::var(ENV_CLIENT_IP).unwrap_or_default();

    // SAFETY: the supervisor contract places the accepted socket at fd 3,
    // and nothing else in this process has claimed it.
    let std_stream = unsafe { std::net::TcpStream::from_raw_fd(INHERITED_SOCKET_FD) };
    std_stream.set_nonblocking(true)?;
    let stream = TcpStream::from_std(std_stream)?;

    let peer = stream
        .peer_addr()
        .ok()
        .or_else(|| format!("{client_ip}:0").parse().ok())
        .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));

    let session_config = Arc::new(config.session_config(config_path)?);

    // The supervisor's stop request and the session's own completion are
    // deliberately separate channels; see OneShotListener.
    let (stop_tx, stop_rx) = oneshot::channel();
    tokio::spawn(async move {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
                let _ = stop_tx.send(());
            }
            Err(err) => {
                tracing::error!(%err, "unable to install SIGTERM handler");
            }
        }
    });

    let (mut listener, ticket) = OneShotListener::new(stream, stop_rx);
    let mut ticket = Some(ticket);

    // Held for the process lifetime: a dropped sender reads as shutdown.
    let (signal_tx, _signal_rx) = broadcast::channel::<Signal>(1);

    loop {
        match listener.accept().await {
            Ok(stream) => {
                let connection = if mode == ListenerMode::ImplicitTls {
                    let tls = session_config.tls.as_ref().ok_or_else(|| {
                        anyhow::anyhow!("implicit TLS listener without certificate material")
                    })?;
                    let acceptor = build_acceptor(tls)
                        .map_err(|err| anyhow::anyhow!("TLS setup failed: {err}"))?;
                    Connection::tls(acceptor.accept(stream).await?)
                } else {
                    Connection::plain(stream)
                };

                let info = ConnectionInfo::new(peer, 1);
                let guard = ticket.take();
                let result = Session::create(connection, info, Arc::clone(&session_config))
                    .run(signal_tx.subscribe())
                    .await;
                drop(guard);

                if let Err(err) = result
                    && !err.is_shutdown()
                {
                    tracing::error!(%err, "session ended with error");
                }
            }
            Err(ListenerError::Closed) => break,
            Err(err) => return Err(err.into()),
        }
    }

    Ok(())
}
