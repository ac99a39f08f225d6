//! A minimal scripted SMTP client for exercising a live listener.

use std::time::Duration;

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
};

pub struct TestClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl TestClient {
    /// Connect, retrying briefly so tests do not race server startup.
    pub async fn connect(addr: &str) -> Self {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);

        loop {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    let (read, writer) = stream.into_split();
                    return Self {
                        reader: BufReader::new(read),
                        writer,
                    };
                }
                Err(err) if std::time::Instant::now() < deadline => {
                    let _ = err;
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                Err(err) => panic!("unable to connect to {addr}: {err}"),
            }
        }
    }

    pub async fn send(&mut self, line: &str) {
        self.writer
            .write_all(format!("{line}\r\n").as_bytes())
            .await
            .expect("write failed");
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.expect("write failed");
    }

    pub async fn line(&mut self) -> String {
        let mut line = String::new();
        tokio::time::timeout(Duration::from_secs(5), self.reader.read_line(&mut line))
            .await
            .expect("timed out waiting for a reply")
            .expect("read failed");
        line.trim_end_matches(['\r', '\n']).to_string()
    }

    /// Consume the rest of a multi-line reply (through the `NNN ` line).
    pub async fn drain_multiline(&mut self) {
        loop {
            let line = self.line().await;
            if line.len() < 4 || line.as_bytes()[3] == b' ' {
                break;
            }
        }
    }
}
