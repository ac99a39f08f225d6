//! Direct-to-filesystem delivery.

use std::path::{Path, PathBuf};

use postern_common::envelope::Envelope;
use tokio::{
    fs::{self, OpenOptions},
    io::{AsyncRead, AsyncWriteExt},
};
use ulid::Ulid;

use crate::{DeliveryAgent, DeliveryError, DeliveryReceipt};

/// Writes each message into a flat directory, one `<ulid>.eml` per message
/// with a `<ulid>.json` envelope sidecar. The message lands under a dotted
/// temporary name first and is renamed into place only after it has been
/// fully written and synced, so readers never observe a partial message.
#[derive(Debug, Clone)]
pub struct FileStoreAgent {
    root: PathBuf,
}

impl FileStoreAgent {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the store directory if it is missing.
    pub async fn init(&self) -> Result<(), DeliveryError> {
        fs::create_dir_all(&self.root).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl DeliveryAgent for FileStoreAgent {
    async fn deliver(
        &self,
        envelope: &Envelope,
        message: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<DeliveryReceipt, DeliveryError> {
        let id = Ulid::new().to_string();
        let staging = self.root.join(format!(".{id}.tmp"));
        let target = self.root.join(format!("{id}.eml"));

        let mut file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&staging)
            .await?;

        let written = match tokio::io::copy(message, &mut file).await {
            Ok(written) => written,
            Err(err) => {
                drop(file);
                let _ = fs::remove_file(&staging).await;
                return Err(err.into());
            }
        };

        file.sync_all().await?;
        drop(file);

        fs::rename(&staging, &target).await?;

        let meta = serde_json::to_vec(envelope)
            .map_err(|err| DeliveryError::Permanent(format!("envelope encode: {err}")))?;
        fs::write(self.root.join(format!("{id}.json")), meta).await?;

        tracing::debug!(%id, written, recipients = envelope.recipients().len(), "message stored");

        Ok(DeliveryReceipt::new(id))
    }
}
