//! The DATA pipeline: stream the body into a spillable buffer, offer it
//! to the content checker on the way past, and hand the accepted message
//! to the resolved delivery agent — all inside one SMTP reply.

use std::{io::Cursor, time::Duration};

use postern_common::{envelope::Envelope, error::SessionError, reply::Reply, status::Status};
use postern_filter::{CheckOptions, Disposition};
use postern_spool::SpoolBuffer;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use ulid::Ulid;

use super::{Event, Session, to_session_error};
use crate::error::ConnectionError;

const TEE_PIPE_CAPACITY: usize = 8192;

enum BodyOutcome {
    /// End-of-data seen; the buffer holds the whole message.
    Complete,
    /// The running size crossed the cap; reading was aborted.
    TooLarge,
    /// The spool could not keep up; the body was drained but not stored.
    StorageFailed,
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> Session<Stream> {
    pub(super) async fn handle_data(&mut self) -> Result<Event, SessionError> {
        // Re-checked here so a client that skipped MAIL or RCPT never gets
        // to transmit a body, and so a transaction whose delivery agent
        // vanished fails before the first body byte.
        if !self.state.mail_from_seen()
            || self.state.recipients().is_empty()
            || self.state.route().is_none()
        {
            self.send(&super::bad_sequence()).await?;
            return Ok(Event::KeepAlive);
        }

        self.state.enter_data();
        self.send(&Reply::new(
            Status::StartMailInput,
            "Start mail input; end with <CRLF>.<CRLF>",
        ))
        .await?;

        let queue_id = Ulid::new().to_string();
        let mut buffer = SpoolBuffer::create(&self.config.spool_dir).await;

        let (outcome, verdict) = if let Some(checker) = self.config.checker.clone() {
            let (tee, checker_side) = tokio::io::duplex(TEE_PIPE_CAPACITY);
            let opts = self.check_options(&queue_id);

            let check = async move { checker.check(Box::new(checker_side), &opts).await };
            let (outcome, verdict) =
                tokio::join!(self.read_body(&mut buffer, Some(tee)), check);

            (outcome?, Some(verdict))
        } else {
            (self.read_body(&mut buffer, None).await?, None)
        };

        match outcome {
            BodyOutcome::TooLarge => {
                drop(buffer);
                self.send(&Reply::new(
                    Status::ExceededStorage,
                    "5.3.4 Message too large",
                ))
                .await?;
                self.state.reset_transaction();
                return Ok(Event::KeepAlive);
            }
            BodyOutcome::StorageFailed => {
                drop(buffer);
                self.send(&Reply::new(
                    Status::ActionAborted,
                    "4.3.0 Temporary storage failure",
                ))
                .await?;
                self.state.reset_transaction();
                return Ok(Event::KeepAlive);
            }
            BodyOutcome::Complete => {}
        }

        let disposition = match verdict {
            None => Disposition::Deliver {
                headers: Vec::new(),
            },
            Some(Ok(result)) => {
                tracing::debug!(
                    checker = %result.checker,
                    score = result.score,
                    verdict = ?result.verdict,
                    %queue_id,
                    "content check verdict"
                );
                self.config.policy.disposition(&result)
            }
            Some(Err(err)) => self.config.policy.on_error(&err),
        };

        match disposition {
            Disposition::Reject(message) => {
                drop(buffer);
                self.send(&Reply::new(Status::Error, format!("5.7.1 {message}")))
                    .await?;
                self.state.reset_transaction();
                Ok(Event::KeepAlive)
            }
            Disposition::TempFail(message) => {
                drop(buffer);
                self.send(&Reply::new(
                    Status::ActionAborted,
                    format!("4.7.1 {message}"),
                ))
                .await?;
                self.state.reset_transaction();
                Ok(Event::KeepAlive)
            }
            Disposition::Deliver { headers } => self.deliver(buffer, headers, &queue_id).await,
        }
    }

    /// Read body lines until the lone dot, unstuffing and re-terminating
    /// each, while feeding the buffer and (when checking) the tee. The tee
    /// is dropped on return, which is the checker's EOF.
    async fn read_body(
        &mut self,
        buffer: &mut SpoolBuffer,
        mut tee: Option<DuplexStream>,
    ) -> Result<BodyOutcome, SessionError> {
        let cap = self.config.max_message_size;
        let line_timeout = Duration::from_secs(self.config.timeouts.data_block_secs);
        let mut stored: usize = 0;
        let mut storage_failed = false;

        loop {
            let line = match tokio::time::timeout(line_timeout, self.connection.read_line()).await
            {
                Err(_) => {
                    return Err(SessionError::Timeout(self.config.timeouts.data_block_secs));
                }
                Ok(Err(ConnectionError::LineTooLong)) => {
                    let _ = self
                        .send(&Reply::new(Status::CommandUnrecognised, "5.5.2 Line too long"))
                        .await;
                    return Err(SessionError::LineTooLong);
                }
                Ok(Err(err)) => return Err(to_session_error(err)),
                // The peer vanished mid-body; nothing to salvage.
                Ok(Ok(None)) => return Err(SessionError::Cancelled),
                Ok(Ok(Some(line))) => line,
            };

            if line == b"." {
                return Ok(if storage_failed {
                    BodyOutcome::StorageFailed
                } else {
                    BodyOutcome::Complete
                });
            }

            // Dot-unstuffing (RFC 5321 §4.5.2): the first dot of a
            // dot-initial line came from the client's transparency step.
            let content = if line.first() == Some(&b'.') {
                &line[1..]
            } else {
                &line[..]
            };

            stored += content.len() + 2;
            if cap > 0 && stored > cap {
                return Ok(BodyOutcome::TooLarge);
            }

            if !storage_failed
                && (buffer.write_all(content).await.is_err()
                    || buffer.write_all(b"\r\n").await.is_err())
            {
                tracing::error!("spool write failed, draining remaining body");
                storage_failed = true;
            }

            if let Some(writer) = &mut tee
                && (writer.write_all(content).await.is_err()
                    || writer.write_all(b"\r\n").await.is_err())
            {
                // The checker hung up early; its verdict or error arrives
                // through its own future.
                tee = None;
            }
        }
    }

    async fn deliver(
        &mut self,
        buffer: SpoolBuffer,
        headers: Vec<(String, String)>,
        queue_id: &str,
    ) -> Result<Event, SessionError> {
        let size = buffer.written();

        let Some(route) = self.state.route().cloned() else {
            // Guarded at DATA entry; kept as a reply rather than a panic.
            self.send(&Reply::new(Status::ActionAborted, "4.3.0 Delivery failed"))
                .await?;
            self.state.reset_transaction();
            return Ok(Event::KeepAlive);
        };

        let envelope = Envelope::new(
            self.state.sender().to_string(),
            self.state.recipients().to_vec(),
            self.info.ip(),
            self.state.helo_domain().to_string(),
        );

        let delivered = match buffer.into_reader().await {
            Err(err) => {
                tracing::error!(%err, "unable to rewind spool buffer");
                Err(postern_delivery::DeliveryError::Temporary(err.to_string()))
            }
            Ok(mut reader) => {
                if headers.is_empty() {
                    route.agent.deliver(&envelope, &mut reader).await
                } else {
                    let mut prefix = String::new();
                    for (name, value) in &headers {
                        prefix.push_str(name);
                        prefix.push_str(": ");
                        prefix.push_str(value);
                        prefix.push_str("\r\n");
                    }

                    let mut message = Cursor::new(prefix.into_bytes()).chain(reader);
                    route.agent.deliver(&envelope, &mut message).await
                }
            }
        };

        let reply = match delivered {
            Ok(receipt) => {
                tracing::info!(
                    %queue_id,
                    store_id = %receipt.id(),
                    size,
                    sender = %envelope.sender(),
                    "message queued"
                );
                if let Some(metrics) = postern_metrics::try_metrics() {
                    metrics.smtp.record_message_received(size);
                }
                Reply::new(Status::Ok, "Message queued")
            }
            Err(err) if err.is_permanent() => {
                tracing::error!(%queue_id, %err, "delivery refused");
                Reply::new(Status::TransactionFailed, "5.3.0 Delivery failed")
            }
            Err(err) => {
                tracing::error!(%queue_id, %err, "delivery failed");
                Reply::new(Status::ActionAborted, "4.3.0 Delivery failed")
            }
        };

        self.send(&reply).await?;
        self.state.reset_transaction();
        Ok(Event::KeepAlive)
    }

    fn check_options(&self, queue_id: &str) -> CheckOptions {
        CheckOptions {
            sender: self.state.sender().to_string(),
            recipients: self.state.recipients().to_vec(),
            client_ip: self.info.ip(),
            helo: self.state.helo_domain().to_string(),
            hostname: self.config.hostname.clone(),
            authenticated_user: if self.state.is_authenticated() {
                Some(self.state.auth_identity().to_string())
            } else {
                None
            },
            queue_id: queue_id.to_string(),
        }
    }
}
