//! In-process end-to-end harness: a real listener on a random port, a
//! file-backed domain tree, and a file store to assert against.

use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use postern_common::Signal;
use postern_delivery::FileStoreAgent;
use postern_directory::{DomainRegistry, file::password_digest};
use postern_smtp::{
    SessionConfig,
    listener::{Listener, ListenerMode},
};
use tokio::{sync::broadcast, task::JoinHandle};

use super::TestClient;

pub struct Harness {
    addr: SocketAddr,
    store: PathBuf,
    shutdown: broadcast::Sender<Signal>,
    server: JoinHandle<()>,
    _dirs: Vec<tempfile::TempDir>,
}

impl Harness {
    pub async fn start() -> Self {
        let domains = tempfile::tempdir().expect("tempdir");
        let store_dir = tempfile::tempdir().expect("tempdir");
        let spool = tempfile::tempdir().expect("tempdir");

        let domain_dir = domains.path().join("test.local");
        std::fs::create_dir(&domain_dir).expect("domain dir");
        std::fs::write(
            domain_dir.join("domain.ron"),
            format!(
                "DomainConfig(users: {{ \"alice\": \"{}\" }})",
                password_digest("sekrit")
            ),
        )
        .expect("domain config");

        let registry = DomainRegistry::load(domains.path()).expect("registry");

        let agent = FileStoreAgent::new(store_dir.path());
        agent.init().await.expect("store init");

        let config = SessionConfig::builder()
            .with_hostname("mail.example.com")
            .with_registry(Arc::new(registry))
            .with_delivery(Some(Arc::new(agent)))
            .with_spool_dir(spool.path())
            .build();

        let bound = Listener::new(
            "127.0.0.1:0".parse().expect("addr"),
            ListenerMode::Plain,
            Arc::new(config),
        )
        .bind()
        .await
        .expect("bind");

        let addr = bound.local_addr().expect("local addr");
        let (shutdown, _) = broadcast::channel(4);
        let receiver = shutdown.subscribe();

        let server = tokio::spawn(async move {
            if let Err(err) = bound.serve(receiver).await {
                panic!("listener failed: {err}");
            }
        });

        Self {
            addr,
            store: store_dir.path().to_path_buf(),
            shutdown,
            server,
            _dirs: vec![domains, store_dir, spool],
        }
    }

    pub async fn client(&self) -> TestClient {
        TestClient::connect(&self.addr.to_string()).await
    }

    /// The stored messages, oldest first.
    pub fn delivered(&self) -> Vec<Vec<u8>> {
        let mut names: Vec<_> = std::fs::read_dir(&self.store)
            .expect("store dir")
            .map(|entry| entry.expect("entry").path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "eml"))
            .collect();
        names.sort();

        names
            .into_iter()
            .map(|path| std::fs::read(path).expect("message"))
            .collect()
    }

    /// Poll the store until `count` messages have landed.
    pub async fn wait_for_delivery(&self, count: usize) {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while self.delivered().len() < count {
            assert!(
                std::time::Instant::now() < deadline,
                "timed out waiting for {count} message(s)"
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(Signal::Shutdown);
        let _ = tokio::time::timeout(Duration::from_secs(5), self.server).await;
    }
}
