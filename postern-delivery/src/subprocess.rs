//! Delivery through a single-purpose child process.
//!
//! The parent never touches the store: it feeds the child a one-line JSON
//! envelope header followed by the raw message on stdin and judges the
//! outcome by the exit status. The child drops to the configured uid/gid
//! before writing anything, so the listening process needs no write access
//! to the mail store at all.

use std::{path::PathBuf, process::Stdio};

use chrono::{DateTime, Utc};
use postern_common::envelope::Envelope;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};

use crate::{DeliveryAgent, DeliveryError, DeliveryReceipt, FileStoreAgent};

/// Wire protocol version spoken on the child's stdin.
pub const WIRE_VERSION: u32 = 1;

/// Line 1 of the child's stdin: the envelope, as a single JSON object.
/// Everything after the terminating newline is the raw RFC 5322 message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WireEnvelope {
    pub version: u32,
    pub sender: String,
    pub recipients: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_hostname: Option<String>,
    /// Target uid for the privilege drop; 0 means keep the current user.
    #[serde(default)]
    pub uid: u32,
    /// Target gid for the privilege drop; 0 means keep the current group.
    #[serde(default)]
    pub gid: u32,
}

impl WireEnvelope {
    #[must_use]
    pub fn from_envelope(envelope: &Envelope, uid: u32, gid: u32) -> Self {
        Self {
            version: WIRE_VERSION,
            sender: envelope.sender().to_string(),
            recipients: envelope.recipients().to_vec(),
            received_time: Some(envelope.received().to_rfc3339()),
            client_ip: Some(envelope.client_ip().to_string()),
            client_hostname: Some(envelope.client_helo().to_string()),
            uid,
            gid,
        }
    }
}

/// Parse and version-check the header line.
pub fn parse_wire_header(line: &str) -> Result<WireEnvelope, DeliveryError> {
    let header: WireEnvelope = serde_json::from_str(line)
        .map_err(|err| DeliveryError::Permanent(format!("malformed envelope header: {err}")))?;

    if header.version != WIRE_VERSION {
        return Err(DeliveryError::Permanent(format!(
            "unsupported wire version {} (expected {WIRE_VERSION})",
            header.version
        )));
    }

    Ok(header)
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubprocessAgentConfig {
    /// Executable to spawn for each message. Defaults to the running
    /// binary's own `deliver` subcommand when assembled by the server.
    pub command: PathBuf,

    /// Arguments passed verbatim before the message is written.
    #[serde(default)]
    pub args: Vec<String>,

    /// uid/gid the child switches to before touching the store. 0 keeps
    /// the spawning identity.
    #[serde(default)]
    pub uid: u32,
    #[serde(default)]
    pub gid: u32,
}

/// A [`DeliveryAgent`] that spawns `command` once per message.
#[derive(Debug)]
pub struct SubprocessAgent {
    config: SubprocessAgentConfig,
}

impl SubprocessAgent {
    #[must_use]
    pub const fn new(config: SubprocessAgentConfig) -> Self {
        Self { config }
    }
}

#[async_trait::async_trait]
impl DeliveryAgent for SubprocessAgent {
    async fn deliver(
        &self,
        envelope: &Envelope,
        message: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<DeliveryReceipt, DeliveryError> {
        let mut child = tokio::process::Command::new(&self.config.command)
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| DeliveryError::Temporary(format!("spawn failed: {err}")))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| DeliveryError::Temporary("child stdin unavailable".to_string()))?;

        let header = WireEnvelope::from_envelope(envelope, self.config.uid, self.config.gid);
        let mut header = serde_json::to_string(&header)
            .map_err(|err| DeliveryError::Permanent(format!("envelope encode: {err}")))?;
        header.push('\n');

        stdin.write_all(header.as_bytes()).await?;
        tokio::io::copy(message, &mut stdin).await?;
        stdin.shutdown().await?;
        drop(stdin);

        let output = child.wait_with_output().await?;

        if output.status.success() {
            let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
            Ok(DeliveryReceipt::new(if id.is_empty() {
                "delivered".to_string()
            } else {
                id
            }))
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::error!(
                status = ?output.status,
                stderr = %stderr.trim(),
                "delivery child failed"
            );
            Err(DeliveryError::Temporary(format!(
                "delivery child exited with {}",
                output.status
            )))
        }
    }
}

/// Give up the spawning identity. gid first, since a process that has
/// already dropped uid may no longer change groups.
fn drop_privileges(uid: u32, gid: u32) -> Result<(), DeliveryError> {
    if gid != 0 {
        // SAFETY: setgid has no memory-safety concerns; the result is checked.
        if unsafe { libc::setgid(gid) } != 0 {
            return Err(DeliveryError::Permanent(format!(
                "setgid({gid}) failed: {}",
                std::io::Error::last_os_error()
            )));
        }
    }

    if uid != 0 {
        // SAFETY: as above.
        if unsafe { libc::setuid(uid) } != 0 {
            return Err(DeliveryError::Permanent(format!(
                "setuid({uid}) failed: {}",
                std::io::Error::last_os_error()
            )));
        }
    }

    Ok(())
}

/// Entry point for the child half of the protocol: consume the envelope
/// header and message from stdin and write the message into `store_root`.
/// Prints the store id on stdout for the parent's diagnostics.
pub async fn run_delivery_child(store_root: PathBuf) -> Result<(), DeliveryError> {
    let mut stdin = BufReader::new(tokio::io::stdin());

    let mut line = String::new();
    stdin.read_line(&mut line).await?;
    let header = parse_wire_header(line.trim_end())?;

    drop_privileges(header.uid, header.gid)?;

    let received = header
        .received_time
        .as_deref()
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map_or_else(Utc::now, |parsed| parsed.with_timezone(&Utc));

    let envelope = Envelope::new(
        header.sender,
        header.recipients,
        header.client_ip.unwrap_or_default(),
        header.client_hostname.unwrap_or_default(),
    )
    .with_received(received);

    let agent = FileStoreAgent::new(store_root);
    agent.init().await?;
    let receipt = agent.deliver(&envelope, &mut stdin).await?;

    println!("{}", receipt.id());

    Ok(())
}
