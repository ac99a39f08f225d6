//! Shared scaffolding for session tests: an in-memory client/server pair
//! and a delivery agent that captures what it is given.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use postern_common::{envelope::Envelope, info::ConnectionInfo};
use postern_delivery::{DeliveryAgent, DeliveryError, DeliveryReceipt};
use postern_directory::{
    DomainHandle, DomainRegistry, FileDirectory, StaticTokenValidator, file::password_digest,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, BufReader, DuplexStream, ReadHalf, WriteHalf},
    sync::broadcast,
    task::JoinHandle,
};

use super::Session;
use crate::{SessionConfig, connection::Connection};

/// Records everything it is asked to deliver.
#[derive(Debug, Default)]
pub(crate) struct CapturingAgent {
    delivered: Arc<tokio::sync::Mutex<Vec<(Envelope, Vec<u8>)>>>,
}

#[derive(Debug, Clone)]
pub(crate) struct StoreHandle {
    delivered: Arc<tokio::sync::Mutex<Vec<(Envelope, Vec<u8>)>>>,
}

impl StoreHandle {
    pub(crate) async fn delivered(&self) -> Vec<(Envelope, Vec<u8>)> {
        self.delivered.lock().await.clone()
    }
}

impl CapturingAgent {
    pub(crate) fn handle(&self) -> StoreHandle {
        StoreHandle {
            delivered: Arc::clone(&self.delivered),
        }
    }
}

#[async_trait]
impl DeliveryAgent for CapturingAgent {
    async fn deliver(
        &self,
        envelope: &Envelope,
        message: &mut (dyn tokio::io::AsyncRead + Send + Unpin),
    ) -> Result<DeliveryReceipt, DeliveryError> {
        let mut content = Vec::new();
        message.read_to_end(&mut content).await?;
        self.delivered.lock().await.push((envelope.clone(), content));
        Ok(DeliveryReceipt::new("test"))
    }
}

/// A delivery agent that always fails, optionally permanently.
#[derive(Debug)]
pub(crate) struct FailingAgent {
    pub permanent: bool,
}

#[async_trait]
impl DeliveryAgent for FailingAgent {
    async fn deliver(
        &self,
        _envelope: &Envelope,
        message: &mut (dyn tokio::io::AsyncRead + Send + Unpin),
    ) -> Result<DeliveryReceipt, DeliveryError> {
        let mut sink = Vec::new();
        message.read_to_end(&mut sink).await?;

        if self.permanent {
            Err(DeliveryError::Permanent("store refused".to_string()))
        } else {
            Err(DeliveryError::Temporary("store busy".to_string()))
        }
    }
}

pub(crate) fn registry() -> DomainRegistry {
    let mut users = HashMap::new();
    users.insert("alice".to_string(), password_digest("sekrit"));

    let mut registry = DomainRegistry::default();
    registry.insert(DomainHandle::new(
        "test.local".into(),
        Arc::new(FileDirectory::new("test.local".into(), users)),
        None,
    ));
    registry
}

/// A session config backed by an in-memory capturing store, plus the
/// handle to inspect it.
pub(crate) async fn config() -> (SessionConfig, StoreHandle) {
    let agent = CapturingAgent::default();
    let store = agent.handle();

    let config = SessionConfig::builder()
        .with_hostname("mail.example.com")
        .with_registry(Arc::new(registry()))
        .with_delivery(Some(Arc::new(agent)))
        .with_spool_dir(std::env::temp_dir())
        .build();

    (config, store)
}

/// As [`config`], with AUTH offered and a static bearer token registered.
pub(crate) async fn config_with_auth() -> (SessionConfig, StoreHandle) {
    let agent = CapturingAgent::default();
    let store = agent.handle();

    let mut tokens = HashMap::new();
    tokens.insert("tok-1".to_string(), "alice@test.local".to_string());

    let config = SessionConfig::builder()
        .with_hostname("mail.example.com")
        .with_registry(Arc::new(registry()))
        .with_delivery(Some(Arc::new(agent)))
        .with_spool_dir(std::env::temp_dir())
        .with_auth_enabled(true)
        .with_token_validator(Some(Arc::new(StaticTokenValidator::new(tokens))))
        .build();

    (config, store)
}

/// Reads reply lines off the client half with a test deadline.
pub(crate) struct Lines {
    reader: BufReader<ReadHalf<DuplexStream>>,
}

impl Lines {
    pub(crate) async fn next(&mut self) -> String {
        let mut line = String::new();
        tokio::time::timeout(Duration::from_secs(5), self.reader.read_line(&mut line))
            .await
            .expect("timed out waiting for a reply line")
            .expect("read failed");
        line.trim_end_matches(['\r', '\n']).to_string()
    }

    /// Consume the rest of a multi-line reply (through the `NNN ` line).
    pub(crate) async fn drain_multiline(&mut self) {
        loop {
            let line = self.next().await;
            if line.len() < 4 || line.as_bytes()[3] == b' ' {
                break;
            }
        }
    }
}

/// A session running against the far end of an in-memory duplex stream.
pub(crate) struct TestServer {
    handle: Mutex<Option<JoinHandle<()>>>,
    client: Mutex<Option<DuplexStream>>,
}

impl TestServer {
    pub(crate) fn spawn(config: SessionConfig) -> Self {
        let (_tx, rx) = broadcast::channel(4);
        Self::spawn_with_signal(config, rx)
    }

    pub(crate) fn spawn_with_peer(config: SessionConfig, peer: &str) -> Self {
        let (_tx, rx) = broadcast::channel(4);
        Self::new(config, rx, peer)
    }

    pub(crate) fn spawn_with_signal(
        config: SessionConfig,
        signal: broadcast::Receiver<postern_common::Signal>,
    ) -> Self {
        Self::new(config, signal, "127.0.0.1:50000")
    }

    fn new(
        config: SessionConfig,
        signal: broadcast::Receiver<postern_common::Signal>,
        peer: &str,
    ) -> Self {
        let (client, server) = tokio::io::duplex(1 << 16);

        let session = Session::create(
            Connection::plain(server),
            ConnectionInfo::new(peer.parse().unwrap(), 1),
            Arc::new(config),
        );

        let handle = tokio::spawn(async move {
            let _ = session.run(signal).await;
        });

        Self {
            handle: Mutex::new(Some(handle)),
            client: Mutex::new(Some(client)),
        }
    }

    pub(crate) async fn connect(&self) -> (Lines, WriteHalf<DuplexStream>) {
        let stream = self
            .client
            .lock()
            .expect("client mutex poisoned")
            .take()
            .expect("connect may only be called once");

        let (read, write) = tokio::io::split(stream);
        (
            Lines {
                reader: BufReader::new(read),
            },
            write,
        )
    }

    pub(crate) async fn join(&self) {
        let handle = self
            .handle
            .lock()
            .expect("handle mutex poisoned")
            .take()
            .expect("join may only be called once");

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("session did not finish in time")
            .expect("session task panicked");
    }
}
