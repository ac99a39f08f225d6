use std::{fs::File, io::BufReader, path::PathBuf, sync::Arc};

use postern_common::reply::Reply;
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_rustls::{
    TlsAcceptor,
    rustls::{
        ProtocolVersion, ServerConfig, SupportedCipherSuite,
        pki_types::{CertificateDer, PrivateKeyDer},
        server::ServerConnection,
    },
    server::TlsStream,
};

use crate::error::{ConnectionError, ConnectionResult, TlsError, TlsResult};

/// Hard cap on one wire line, command or data. RFC 5321 allows much less
/// for commands; the slack covers long ESMTP parameter lists.
pub const MAX_LINE_LEN: usize = 4096;

const READ_BUFFER_SIZE: usize = 8192;

/// Certificate material for one listener.
#[derive(Clone, Debug, Deserialize)]
pub struct TlsContext {
    pub certificate: PathBuf,
    pub key: PathBuf,
}

#[derive(Debug)]
pub struct TlsInfo {
    version: ProtocolVersion,
    ciphers: SupportedCipherSuite,
}

impl TlsInfo {
    fn of(conn: &ServerConnection) -> TlsResult<Self> {
        Ok(Self {
            version: conn
                .protocol_version()
                .ok_or_else(|| TlsError::Rustls("protocol version missing".to_string()))?,
            ciphers: conn
                .negotiated_cipher_suite()
                .ok_or_else(|| TlsError::Rustls("cipher suite missing".to_string()))?,
        })
    }

    #[must_use]
    pub fn proto(&self) -> String {
        self.version.as_str().unwrap_or_default().to_string()
    }

    #[must_use]
    pub fn cipher(&self) -> String {
        self.ciphers.suite().as_str().unwrap_or_default().to_string()
    }
}

/// Load certificate chain and key for a listener. Shared by the STARTTLS
/// upgrade path and implicit-TLS listeners.
pub fn build_acceptor(tls: &TlsContext) -> TlsResult<TlsAcceptor> {
    let certs = load_certs(&tls.certificate).map_err(|e| TlsError::CertificateLoad {
        path: tls.certificate.display().to_string(),
        source: e,
    })?;
    let key = load_key(&tls.key)?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn load_certs(path: &PathBuf) -> std::io::Result<Vec<CertificateDer<'static>>> {
    rustls_pemfile::certs(&mut BufReader::new(File::open(path)?)).collect()
}

fn load_key(path: &PathBuf) -> TlsResult<PrivateKeyDer<'static>> {
    let path_str = path.display().to_string();
    let mut reader = BufReader::new(File::open(path).map_err(|e| TlsError::KeyLoad {
        path: path_str.clone(),
        reason: e.to_string(),
    })?);

    match rustls_pemfile::read_one(&mut reader).map_err(|e| TlsError::KeyLoad {
        path: path_str.clone(),
        reason: e.to_string(),
    })? {
        Some(rustls_pemfile::Item::Pkcs1Key(key)) => Ok(PrivateKeyDer::Pkcs1(key)),
        Some(rustls_pemfile::Item::Pkcs8Key(key)) => Ok(PrivateKeyDer::Pkcs8(key)),
        Some(rustls_pemfile::Item::Sec1Key(key)) => Ok(PrivateKeyDer::Sec1(key)),
        _ => Err(TlsError::KeyLoad {
            path: path_str,
            reason: "Unable to determine key file format (expected PKCS1, PKCS8, or SEC1)"
                .to_string(),
        }),
    }
}

enum Io<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> {
    Plain(Stream),
    Tls(Box<TlsStream<Stream>>),
}

/// Buffered line-oriented I/O over one client socket, cleartext or TLS.
/// The internal read buffer survives a STARTTLS upgrade.
pub struct Connection<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> {
    io: Io<Stream>,
    read_buf: Vec<u8>,
    read_pos: usize,
    read_len: usize,
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> Connection<Stream> {
    pub fn plain(stream: Stream) -> Self {
        Self {
            io: Io::Plain(stream),
            read_buf: Vec::new(),
            read_pos: 0,
            read_len: 0,
        }
    }

    /// Wrap an already-established TLS stream (implicit-TLS listeners).
    pub fn tls(stream: TlsStream<Stream>) -> Self {
        Self {
            io: Io::Tls(Box::new(stream)),
            read_buf: Vec::new(),
            read_pos: 0,
            read_len: 0,
        }
    }

    #[must_use]
    pub const fn is_tls(&self) -> bool {
        matches!(self.io, Io::Tls(_))
    }

    async fn fill(&mut self) -> ConnectionResult<usize> {
        if self.read_buf.is_empty() {
            self.read_buf.resize(READ_BUFFER_SIZE, 0);
        }

        let bytes_read = match &mut self.io {
            Io::Plain(stream) => stream.read(&mut self.read_buf).await?,
            Io::Tls(stream) => stream.read(&mut self.read_buf).await?,
        };

        self.read_pos = 0;
        self.read_len = bytes_read;
        Ok(bytes_read)
    }

    /// Read one line, stripped of its CR LF terminator. `Ok(None)` means
    /// the peer closed the connection. Lines longer than [`MAX_LINE_LEN`]
    /// are fatal.
    pub async fn read_line(&mut self) -> ConnectionResult<Option<Vec<u8>>> {
        let mut line = Vec::new();

        loop {
            if self.read_pos >= self.read_len && self.fill().await? == 0 {
                // EOF. A partial line with no terminator is discarded.
                return Ok(None);
            }

            while self.read_pos < self.read_len {
                let byte = self.read_buf[self.read_pos];
                self.read_pos += 1;

                if byte == b'\n' {
                    if line.last() == Some(&b'\r') {
                        line.pop();
                    }
                    return Ok(Some(line));
                }

                if line.len() >= MAX_LINE_LEN {
                    return Err(ConnectionError::LineTooLong);
                }

                line.push(byte);
            }
        }
    }

    /// Write a complete (possibly multi-line) reply and flush it.
    pub async fn send_reply(&mut self, reply: &Reply) -> ConnectionResult<()> {
        let mut wire = String::new();
        for line in reply.wire_lines() {
            wire.push_str(&line);
            wire.push_str("\r\n");
        }

        match &mut self.io {
            Io::Plain(stream) => {
                stream.write_all(wire.as_bytes()).await?;
                stream.flush().await?;
            }
            Io::Tls(stream) => {
                stream.write_all(wire.as_bytes()).await?;
                stream.flush().await?;
            }
        }

        Ok(())
    }

    /// Perform the STARTTLS handshake. Consumes the connection; on failure
    /// the socket is unusable and must be dropped.
    pub async fn upgrade(self, tls: &TlsContext) -> TlsResult<(Self, TlsInfo)> {
        tracing::debug!("Upgrading connection ...");

        let acceptor = build_acceptor(tls)?;

        match self.io {
            Io::Plain(stream) => {
                let stream = acceptor.accept(stream).await?;
                let info = TlsInfo::of(stream.get_ref().1)?;

                Ok((
                    Self {
                        io: Io::Tls(Box::new(stream)),
                        read_buf: self.read_buf,
                        read_pos: self.read_pos,
                        read_len: self.read_len,
                    },
                    info,
                ))
            }
            Io::Tls(_) => Err(TlsError::AlreadyActive),
        }
    }
}
