//! Owns the listeners and drives them until shutdown.

use std::{path::PathBuf, sync::{Arc, LazyLock}};

use futures_util::future::join_all;
use postern_common::{Signal, logging};
use postern_delivery::FileStoreAgent;
use postern_smtp::listener::Listener;
use tokio::sync::broadcast;

use crate::{
    config::{DeliveryConfig, IsolationMode, PosternConfig},
    supervisor,
};

pub static SHUTDOWN_BROADCAST: LazyLock<broadcast::Sender<Signal>> = LazyLock::new(|| {
    let (sender, _receiver) = broadcast::channel(64);
    sender
});

/// Wait for ctrl-c or SIGTERM, then tell everyone to wind down.
async fn shutdown() -> anyhow::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("CTRL+C entered, shutting down");
        }
        _ = terminate.recv() => {
            tracing::info!("terminate signal received, shutting down");
        }
    }

    SHUTDOWN_BROADCAST
        .send(Signal::Shutdown)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Interrupted, e.to_string()))?;

    Ok(())
}

/// The whole receiving server: configuration, listeners, and the shutdown
/// plumbing that ties them together.
pub struct Postern {
    config: PosternConfig,
    config_path: PathBuf,
}

impl Postern {
    #[must_use]
    pub const fn new(config: PosternConfig, config_path: PathBuf) -> Self {
        Self { config, config_path }
    }

    /// Run until a shutdown signal arrives or a listener fails fatally.
    pub async fn run(self) -> anyhow::Result<()> {
        logging::init();
        postern_metrics::init_metrics(&self.config.metrics)?;

        if let DeliveryConfig::File(file) = &self.config.delivery {
            FileStoreAgent::new(&file.path).init().await?;
        }

        if self.config.listeners.is_empty() {
            anyhow::bail!("no listeners configured");
        }

        tracing::info!(hostname = %self.config.hostname, "controller running");

        // The signal watcher broadcasts Shutdown; the listeners then
        // finish their in-flight sessions and return on their own.
        tokio::spawn(async {
            if let Err(err) = shutdown().await {
                tracing::error!(%err, "signal watcher failed");
            }
        });

        let ret = match self.config.isolation {
            IsolationMode::InProcess => {
                let session_config = Arc::new(self.config.session_config(&self.config_path)?);

                let listeners: Vec<_> = self
                    .config
                    .listeners
                    .iter()
                    .map(|entry| {
                        Listener::new(entry.address, entry.mode, Arc::clone(&session_config))
                    })
                    .collect();

                join_all(
                    listeners
                        .into_iter()
                        .map(|listener| listener.serve(SHUTDOWN_BROADCAST.subscribe())),
                )
                .await
                .into_iter()
                .try_for_each(|result| result.map_err(anyhow::Error::from))
            }
            IsolationMode::Subprocess => {
                supervisor::serve_all(&self.config, &self.config_path, &SHUTDOWN_BROADCAST).await
            }
        };

        tracing::info!("shutting down");

        ret
    }
}
