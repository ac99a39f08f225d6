//! Write-once/read-once buffer for an in-flight message body.
//!
//! The buffer prefers a uniquely-named file in the configured spool
//! directory and silently degrades to memory when the file cannot be
//! created (read-only filesystem, missing directory, scratch container).
//! Either way the caller gets the same two-phase contract: write the whole
//! body, then turn the buffer into a reader positioned at the start.

use std::{
    io::{self, Cursor, SeekFrom},
    path::{Path, PathBuf},
    pin::Pin,
    task::{Context, Poll},
};

use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncRead, AsyncSeekExt, AsyncWriteExt, ReadBuf},
};
use ulid::Ulid;

use crate::error::Result;

/// Unlinks the backing file when dropped, whatever path the transaction
/// took to get there.
#[derive(Debug)]
struct FileGuard {
    path: PathBuf,
}

impl Drop for FileGuard {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path)
            && err.kind() != io::ErrorKind::NotFound
        {
            tracing::warn!(path = %self.path.display(), %err, "failed to remove spool file");
        }
    }
}

#[derive(Debug)]
enum Backing {
    File {
        file: File,
        guard: FileGuard,
        written: u64,
    },
    Memory {
        buf: Vec<u8>,
    },
}

#[derive(Debug)]
pub struct SpoolBuffer {
    backing: Backing,
}

impl SpoolBuffer {
    /// Open a buffer in `dir`, falling back to memory when the directory
    /// is unusable.
    pub async fn create(dir: &Path) -> Self {
        let path = dir.join(format!("{}.tmp", Ulid::new()));

        let backing = match OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)
            .await
        {
            Ok(file) => Backing::File {
                file,
                guard: FileGuard { path },
                written: 0,
            },
            Err(err) => {
                tracing::debug!(path = %path.display(), %err, "spooling to memory instead");
                Backing::Memory { buf: Vec::new() }
            }
        };

        Self { backing }
    }

    /// An in-memory buffer, used directly by tests and by deployments with
    /// no writable spool directory.
    #[must_use]
    pub const fn in_memory() -> Self {
        Self {
            backing: Backing::Memory { buf: Vec::new() },
        }
    }

    #[must_use]
    pub const fn is_in_memory(&self) -> bool {
        matches!(self.backing, Backing::Memory { .. })
    }

    pub async fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        match &mut self.backing {
            Backing::File { file, written, .. } => {
                file.write_all(bytes).await?;
                *written += bytes.len() as u64;
            }
            Backing::Memory { buf } => buf.extend_from_slice(bytes),
        }

        Ok(())
    }

    /// Bytes written so far.
    #[must_use]
    pub fn written(&self) -> u64 {
        match &self.backing {
            Backing::File { written, .. } => *written,
            Backing::Memory { buf } => buf.len() as u64,
        }
    }

    /// Finish writing and rewind. May be called exactly once; the backing
    /// file is removed when the returned reader is dropped.
    pub async fn into_reader(self) -> Result<SpoolReader> {
        match self.backing {
            Backing::File {
                mut file, guard, ..
            } => {
                file.flush().await?;
                file.seek(SeekFrom::Start(0)).await?;
                Ok(SpoolReader {
                    backing: ReaderBacking::File { file, guard },
                })
            }
            Backing::Memory { buf } => Ok(SpoolReader {
                backing: ReaderBacking::Memory(Cursor::new(buf)),
            }),
        }
    }
}

#[derive(Debug)]
enum ReaderBacking {
    File {
        file: File,
        #[allow(dead_code)]
        guard: FileGuard,
    },
    Memory(Cursor<Vec<u8>>),
}

/// Reader over a finished [`SpoolBuffer`], positioned at the first byte of
/// the stored message.
#[derive(Debug)]
pub struct SpoolReader {
    backing: ReaderBacking,
}

impl AsyncRead for SpoolReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut self.get_mut().backing {
            ReaderBacking::File { file, .. } => Pin::new(file).poll_read(cx, buf),
            ReaderBacking::Memory(cursor) => Pin::new(cursor).poll_read(cx, buf),
        }
    }
}

#[cfg(test)]
mod test {
    use tokio::io::AsyncReadExt;

    use super::SpoolBuffer;

    #[tokio::test]
    async fn file_round_trip_and_cleanup() {
        let dir = tempfile::tempdir().unwrap();

        let mut buffer = SpoolBuffer::create(dir.path()).await;
        assert!(!buffer.is_in_memory());

        buffer.write_all(b"Subject: T\r\n").await.unwrap();
        buffer.write_all(b"\r\nBody\r\n").await.unwrap();
        assert_eq!(buffer.written(), 19);

        let mut reader = buffer.into_reader().await.unwrap();
        let mut content = Vec::new();
        reader.read_to_end(&mut content).await.unwrap();
        assert_eq!(content, b"Subject: T\r\n\r\nBody\r\n");

        drop(reader);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn unusable_directory_falls_back_to_memory() {
        let mut buffer = SpoolBuffer::create("/nonexistent/spool/dir".as_ref()).await;
        assert!(buffer.is_in_memory());

        buffer.write_all(b"hello").await.unwrap();

        let mut reader = buffer.into_reader().await.unwrap();
        let mut content = Vec::new();
        reader.read_to_end(&mut content).await.unwrap();
        assert_eq!(content, b"hello");
    }

    #[tokio::test]
    async fn buffer_dropped_mid_transaction_is_removed() {
        let dir = tempfile::tempdir().unwrap();

        let mut buffer = SpoolBuffer::create(dir.path()).await;
        buffer.write_all(b"partial").await.unwrap();
        drop(buffer);

        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
