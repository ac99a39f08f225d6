//! Daemon configuration: one RON document describing listeners, domains,
//! delivery, content checking, and observability.
//!
//! ```ron
//! Postern(
//!     hostname: "mail.example.com",
//!     listeners: [
//!         (address: "0.0.0.0:25", mode: plain),
//!         (address: "0.0.0.0:465", mode: implicit_tls),
//!     ],
//!     tls: Some((
//!         certificate: "/etc/postern/cert.pem",
//!         key: "/etc/postern/key.pem",
//!     )),
//!     domains: Some("/etc/postern/domains"),
//!     delivery: File((path: "/var/mail/postern")),
//!     spool: (path: "/var/spool/postern"),
//! )
//! ```

use std::{collections::HashMap, net::SocketAddr, path::PathBuf, sync::Arc};

use postern_delivery::{
    DeliveryAgent, FileStoreAgent, SubprocessAgent, SubprocessAgentConfig,
};
use postern_directory::{DomainRegistry, StaticTokenValidator, TokenValidator};
use postern_filter::{CheckPolicy, ContentChecker, HttpChecker, HttpCheckerConfig};
use postern_metrics::MetricsConfig;
use postern_smtp::{
    DEFAULT_MAX_MESSAGE_SIZE, SessionConfig, SmtpTimeouts, TlsContext, listener::ListenerMode,
};
use postern_spool::SpoolConfig;
use serde::Deserialize;

/// One listening socket.
#[derive(Debug, Clone, Deserialize)]
pub struct ListenerEntry {
    pub address: SocketAddr,
    pub mode: ListenerMode,
}

/// Where accepted messages go.
#[derive(Debug, Clone, Default, Deserialize)]
pub enum DeliveryConfig {
    /// No server-wide agent; only domains with their own `deliver_to`
    /// accept mail.
    #[default]
    None,
    /// Write messages into a directory from this process.
    File(FileDeliveryConfig),
    /// Spawn a single-purpose child per message, dropping privileges
    /// before it touches the store.
    Subprocess(SubprocessDeliveryConfig),
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileDeliveryConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubprocessDeliveryConfig {
    /// Store directory the delivery child writes into.
    pub path: PathBuf,

    /// Executable to spawn; defaults to this binary's own `deliver`
    /// subcommand.
    #[serde(default)]
    pub command: Option<PathBuf>,

    #[serde(default)]
    pub uid: u32,
    #[serde(default)]
    pub gid: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Pre-issued bearer tokens for OAUTHBEARER, token → identity.
    #[serde(default)]
    pub tokens: HashMap<String, String>,
}

/// Whether connections are handled in this process or one child process
/// each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationMode {
    #[default]
    InProcess,
    Subprocess,
}

#[derive(Debug, Deserialize)]
#[serde(rename = "Postern")]
pub struct PosternConfig {
    #[serde(default = "default_hostname")]
    pub hostname: String,

    #[serde(default)]
    pub listeners: Vec<ListenerEntry>,

    #[serde(default)]
    pub tls: Option<TlsContext>,

    #[serde(default)]
    pub timeouts: SmtpTimeouts,

    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    #[serde(default = "default_max_recipients")]
    pub max_recipients: usize,

    /// Root of the per-domain configuration tree.
    #[serde(default)]
    pub domains: Option<PathBuf>,

    #[serde(default)]
    pub spool: SpoolConfig,

    #[serde(default)]
    pub delivery: DeliveryConfig,

    #[serde(default)]
    pub checker: Option<HttpCheckerConfig>,

    #[serde(default)]
    pub policy: CheckPolicy,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,

    #[serde(default)]
    pub isolation: IsolationMode,
}

fn default_hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

const fn default_max_message_size() -> usize {
    DEFAULT_MAX_MESSAGE_SIZE
}

const fn default_max_recipients() -> usize {
    1
}

impl PosternConfig {
    pub fn parse(content: &str) -> anyhow::Result<Self> {
        ron::from_str(content).map_err(|err| anyhow::anyhow!("configuration error: {err}"))
    }

    /// The store directory the `deliver` subcommand writes into.
    #[must_use]
    pub fn store_root(&self) -> Option<PathBuf> {
        match &self.delivery {
            DeliveryConfig::None => None,
            DeliveryConfig::File(file) => Some(file.path.clone()),
            DeliveryConfig::Subprocess(subprocess) => Some(subprocess.path.clone()),
        }
    }

    fn delivery_agent(&self, config_path: &std::path::Path) -> Option<Arc<dyn DeliveryAgent>> {
        match &self.delivery {
            DeliveryConfig::None => None,
            DeliveryConfig::File(file) => Some(Arc::new(FileStoreAgent::new(&file.path))),
            DeliveryConfig::Subprocess(subprocess) => {
                let command = subprocess.command.clone().unwrap_or_else(|| {
                    std::env::current_exe().unwrap_or_else(|_| PathBuf::from("postern"))
                });

                Some(Arc::new(SubprocessAgent::new(SubprocessAgentConfig {
                    command,
                    args: vec![
                        "deliver".to_string(),
                        "--config".to_string(),
                        config_path.display().to_string(),
                    ],
                    uid: subprocess.uid,
                    gid: subprocess.gid,
                })))
            }
        }
    }

    /// Assemble the shared per-session configuration: load the domain
    /// tree, build the delivery agent and checker, wire up auth.
    pub fn session_config(&self, config_path: &std::path::Path) -> anyhow::Result<SessionConfig> {
        let registry = match &self.domains {
            Some(root) => DomainRegistry::load(root)?,
            None => DomainRegistry::default(),
        };

        let checker: Option<Arc<dyn ContentChecker>> = match &self.checker {
            Some(checker) => Some(Arc::new(HttpChecker::new(checker.clone())?)),
            None => None,
        };

        let token_validator: Option<Arc<dyn TokenValidator>> = if self.auth.tokens.is_empty() {
            None
        } else {
            Some(Arc::new(StaticTokenValidator::new(self.auth.tokens.clone())))
        };

        Ok(SessionConfig::builder()
            .with_hostname(self.hostname.clone())
            .with_max_message_size(self.max_message_size)
            .with_max_recipients(self.max_recipients)
            .with_timeouts(self.timeouts.clone())
            .with_tls(self.tls.clone())
            .with_registry(Arc::new(registry))
            .with_delivery(self.delivery_agent(config_path))
            .with_checker(checker)
            .with_policy(self.policy.clone())
            .with_token_validator(token_validator)
            .with_auth_enabled(self.auth.enabled)
            .with_spool_dir(self.spool.path.clone())
            .build())
    }
}

/// Find the configuration file using the following precedence:
/// 1. The `--config` flag
/// 2. `POSTERN_CONFIG` environment variable
/// 3. `./postern.config.ron` (current working directory)
/// 4. `/etc/postern/postern.config.ron` (system-wide config)
pub fn find_config_file(flag: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    if let Some(path) = flag {
        if path.exists() {
            return Ok(path);
        }
        anyhow::bail!("--config points to non-existent file: {}", path.display());
    }

    if let Ok(env_path) = std::env::var("POSTERN_CONFIG") {
        let path = PathBuf::from(env_path);
        if path.exists() {
            return Ok(path);
        }
        anyhow::bail!(
            "POSTERN_CONFIG points to non-existent file: {}",
            path.display()
        );
    }

    let default_paths = [
        PathBuf::from("./postern.config.ron"),
        PathBuf::from("/etc/postern/postern.config.ron"),
    ];

    for path in &default_paths {
        if path.exists() {
            return Ok(path.clone());
        }
    }

    let paths_tried = default_paths
        .iter()
        .map(|p| format!("  - {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n");

    anyhow::bail!(
        "No configuration file found. Tried:\n  - --config flag\n  - POSTERN_CONFIG environment variable\n{paths_tried}"
    )
}

#[cfg(test)]
mod test {
    use super::{DeliveryConfig, IsolationMode, PosternConfig};

    #[test]
    fn minimal_config_uses_defaults() {
        let config = PosternConfig::parse("Postern()").unwrap();
        assert!(config.listeners.is_empty());
        assert_eq!(config.max_recipients, 1);
        assert!(matches!(config.delivery, DeliveryConfig::None));
        assert_eq!(config.isolation, IsolationMode::InProcess);
        assert!(!config.metrics.enabled);
    }

    #[test]
    fn full_config_parses() {
        let config = PosternConfig::parse(
            r#"Postern(
                hostname: "mail.example.com",
                listeners: [
                    (address: "0.0.0.0:2525", mode: plain),
                    (address: "0.0.0.0:4650", mode: implicit_tls),
                ],
                tls: Some((
                    certificate: "/tmp/cert.pem",
                    key: "/tmp/key.pem",
                )),
                timeouts: (command_secs: 60),
                max_message_size: 1048576,
                domains: Some("/tmp/domains"),
                spool: (path: "/tmp/spool"),
                delivery: Subprocess((path: "/tmp/store", uid: 1000, gid: 1000)),
                checker: Some((endpoint: "http://127.0.0.1:11333/checkv2")),
                policy: (fail_mode: tempfail, add_headers: true),
                auth: (enabled: true, tokens: {"tok": "alice@test.local"}),
                isolation: subprocess,
            )"#,
        )
        .unwrap();

        assert_eq!(config.hostname, "mail.example.com");
        assert_eq!(config.listeners.len(), 2);
        assert_eq!(config.timeouts.command_secs, 60);
        assert_eq!(config.max_message_size, 1_048_576);
        assert!(config.auth.enabled);
        assert_eq!(config.isolation, IsolationMode::Subprocess);
        assert_eq!(
            config.store_root().unwrap().display().to_string(),
            "/tmp/store"
        );
    }

    #[test]
    fn garbage_config_is_an_error() {
        assert!(PosternConfig::parse("not ron }{").is_err());
    }
}
