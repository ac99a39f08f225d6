//! SASL authentication: PLAIN (RFC 4616) and OAUTHBEARER (RFC 7628).

use std::time::Duration;

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use postern_common::{Domain, error::SessionError, reply::Reply, status::Status};
use postern_directory::DirectoryError;
use tokio::io::{AsyncRead, AsyncWrite};

use super::{Event, Session, to_session_error};
use crate::state::Phase;

/// Pull the bearer token out of an OAUTHBEARER payload:
/// `gs2-header ^A [key=value ^A]* ^A`.
fn extract_bearer_token(payload: &str) -> Option<&str> {
    payload
        .split('\x01')
        .find_map(|part| part.strip_prefix("auth="))
        .and_then(|auth| auth.strip_prefix("Bearer "))
        .map(str::trim)
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> Session<Stream> {
    pub(super) async fn handle_auth(
        &mut self,
        mechanism: &str,
        initial: Option<String>,
    ) -> Result<Event, SessionError> {
        if !self.config.auth_enabled {
            self.send(&Reply::new(
                Status::NotImplemented,
                "5.5.1 Authentication not available",
            ))
            .await?;
            return Ok(Event::KeepAlive);
        }

        if self.state.phase() < Phase::Greeted {
            self.send(&Reply::new(
                Status::InvalidCommandSequence,
                "5.5.1 Say EHLO first",
            ))
            .await?;
            return Ok(Event::KeepAlive);
        }

        if self.state.phase() > Phase::Greeted {
            self.send(&Reply::new(
                Status::InvalidCommandSequence,
                "5.5.1 Authentication not allowed during a mail transaction",
            ))
            .await?;
            return Ok(Event::KeepAlive);
        }

        if self.state.is_authenticated() {
            self.send(&Reply::new(
                Status::InvalidCommandSequence,
                "5.5.1 Already authenticated",
            ))
            .await?;
            return Ok(Event::KeepAlive);
        }

        match mechanism {
            "PLAIN" => self.auth_plain(initial).await,
            "OAUTHBEARER" if self.config.token_validator.is_some() => {
                self.auth_oauthbearer(initial).await
            }
            _ => {
                self.send(&Reply::new(
                    Status::ParamNotImplemented,
                    "5.5.4 Unrecognized authentication type",
                ))
                .await?;
                Ok(Event::KeepAlive)
            }
        }
    }

    /// Challenge for the client's (or next) SASL response. `None` means
    /// the client cancelled with `*`.
    async fn read_auth_response(&mut self, challenge: &str) -> Result<Option<String>, SessionError> {
        self.send(&Reply::new(Status::AuthContinue, challenge)).await?;

        let timeout = Duration::from_secs(self.config.timeouts.command_secs);
        let line = match tokio::time::timeout(timeout, self.connection.read_line()).await {
            Err(_) => return Err(SessionError::Timeout(self.config.timeouts.command_secs)),
            Ok(Err(err)) => return Err(to_session_error(err)),
            Ok(Ok(None)) => return Err(SessionError::Cancelled),
            Ok(Ok(Some(line))) => line,
        };

        let line = String::from_utf8_lossy(&line).trim().to_string();
        if line == "*" {
            return Ok(None);
        }

        Ok(Some(line))
    }

    async fn cancelled(&mut self) -> Result<Event, SessionError> {
        self.send(&Reply::new(
            Status::SyntaxError,
            "5.7.0 Authentication cancelled",
        ))
        .await?;
        Ok(Event::KeepAlive)
    }

    async fn auth_plain(&mut self, initial: Option<String>) -> Result<Event, SessionError> {
        // Cleartext credentials never cross an unencrypted non-local link.
        if !(self.state.tls_active() || self.info.is_loopback()) {
            self.send(&Reply::new(
                Status::EncryptionRequired,
                "5.7.11 Encryption required for requested authentication mechanism",
            ))
            .await?;
            return Ok(Event::KeepAlive);
        }

        let payload = match initial {
            Some(payload) => payload,
            None => match self.read_auth_response("").await? {
                Some(payload) => payload,
                None => return self.cancelled().await,
            },
        };

        // RFC 4616: base64([authzid] NUL authcid NUL password). The
        // authorization identity is accepted and ignored.
        let Ok(decoded) = BASE64.decode(payload.trim()) else {
            self.send(&Reply::new(
                Status::SyntaxError,
                "5.5.2 Cannot decode authentication payload",
            ))
            .await?;
            return Ok(Event::KeepAlive);
        };

        let parts: Vec<&[u8]> = decoded.split(|byte| *byte == 0).collect();
        let (user, password) = match (
            parts.as_slice(),
            parts.get(1).map(|u| std::str::from_utf8(u)),
            parts.get(2).map(|p| std::str::from_utf8(p)),
        ) {
            ([_, _, _], Some(Ok(user)), Some(Ok(password))) => (user, password),
            _ => {
                self.send(&Reply::new(
                    Status::SyntaxError,
                    "5.5.2 Cannot decode authentication payload",
                ))
                .await?;
                return Ok(Event::KeepAlive);
            }
        };

        match self.authenticate(user, password).await {
            Ok(identity) => {
                tracing::info!(user = %identity, "authenticated");
                self.state.authenticated(identity, "PLAIN");
                self.send(&Reply::new(
                    Status::AuthSuccessful,
                    "2.7.0 Authentication succeeded",
                ))
                .await?;
            }
            Err(err) if err.is_transient() => {
                self.send(&Reply::new(
                    Status::TemporaryAuthFailure,
                    "4.7.0 Temporary authentication failure",
                ))
                .await?;
            }
            // Unknown user and wrong password answer identically, so the
            // reply cannot be used to enumerate accounts.
            Err(_) => {
                self.send(&Reply::new(
                    Status::AuthInvalid,
                    "5.7.8 Authentication credentials invalid",
                ))
                .await?;
            }
        }

        Ok(Event::KeepAlive)
    }

    async fn authenticate(&self, user: &str, password: &str) -> Result<String, DirectoryError> {
        let handle = user
            .rsplit_once('@')
            .and_then(|(_, domain)| self.config.registry.lookup(&Domain::new(domain)))
            .ok_or(DirectoryError::InvalidCredentials)?;

        let session = handle.directory().authenticate(user, password).await?;
        Ok(session.user().to_string())
    }

    async fn auth_oauthbearer(&mut self, initial: Option<String>) -> Result<Event, SessionError> {
        let payload = match initial {
            Some(payload) => payload,
            None => match self.read_auth_response("").await? {
                Some(payload) => payload,
                None => return self.cancelled().await,
            },
        };

        let decoded = BASE64
            .decode(payload.trim())
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok());

        let Some(decoded) = decoded else {
            self.send(&Reply::new(
                Status::SyntaxError,
                "5.5.2 Cannot decode authentication payload",
            ))
            .await?;
            return Ok(Event::KeepAlive);
        };

        let Some(token) = extract_bearer_token(&decoded) else {
            return self.oauth_failure().await;
        };

        let Some(validator) = self.config.token_validator.clone() else {
            // Gated by the caller; kept as a reply rather than a panic.
            self.send(&Reply::new(
                Status::ParamNotImplemented,
                "5.5.4 Unrecognized authentication type",
            ))
            .await?;
            return Ok(Event::KeepAlive);
        };

        match validator.validate(token).await {
            Ok(user) => {
                tracing::info!(%user, "authenticated");
                self.state.authenticated(user, "OAUTHBEARER");
                self.send(&Reply::new(
                    Status::AuthSuccessful,
                    "2.7.0 Authentication succeeded",
                ))
                .await?;
                Ok(Event::KeepAlive)
            }
            Err(err) if err.is_transient() => {
                self.send(&Reply::new(
                    Status::TemporaryAuthFailure,
                    "4.7.0 Temporary authentication failure",
                ))
                .await?;
                Ok(Event::KeepAlive)
            }
            Err(_) => self.oauth_failure().await,
        }
    }

    /// RFC 7628 failure exchange: an error document in a 334 challenge,
    /// one dummy client response, then the final 535.
    async fn oauth_failure(&mut self) -> Result<Event, SessionError> {
        let error_doc = BASE64.encode(r#"{"status":"invalid_token"}"#);
        // The dummy response's content does not matter, only that the
        // exchange completed.
        let _ = self.read_auth_response(&error_doc).await?;

        self.send(&Reply::new(
            Status::AuthInvalid,
            "5.7.8 Authentication credentials invalid",
        ))
        .await?;
        Ok(Event::KeepAlive)
    }
}

#[cfg(test)]
mod test {
    use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
    use tokio::io::AsyncWriteExt;

    use super::extract_bearer_token;
    use super::super::testutil::{TestServer, config, config_with_auth};

    fn plain_payload(user: &str, password: &str) -> String {
        BASE64.encode(format!("\0{user}\0{password}"))
    }

    #[test]
    fn bearer_token_extraction() {
        let payload = "n,a=user@example.com,\x01host=server\x01auth=Bearer tok-1\x01\x01";
        assert_eq!(extract_bearer_token(payload), Some("tok-1"));

        assert_eq!(extract_bearer_token("n,,\x01\x01"), None);
        assert_eq!(
            extract_bearer_token("n,,\x01auth=Basic dXNlcg==\x01\x01"),
            None
        );
    }

    #[tokio::test]
    async fn plain_with_initial_response() {
        let (config, _store) = config_with_auth().await;
        let server = TestServer::spawn(config);
        let (mut lines, mut client) = server.connect().await;
        lines.next().await;

        client.write_all(b"EHLO c.example\r\n").await.unwrap();
        lines.drain_multiline().await;

        let payload = plain_payload("alice@test.local", "sekrit");
        client
            .write_all(format!("AUTH PLAIN {payload}\r\n").as_bytes())
            .await
            .unwrap();
        assert_eq!(lines.next().await, "235 2.7.0 Authentication succeeded");

        // A second AUTH is a sequencing error.
        client
            .write_all(format!("AUTH PLAIN {payload}\r\n").as_bytes())
            .await
            .unwrap();
        assert_eq!(lines.next().await, "503 5.5.1 Already authenticated");

        client.write_all(b"QUIT\r\n").await.unwrap();
        lines.next().await;
        server.join().await;
    }

    #[tokio::test]
    async fn plain_challenge_flow() {
        let (config, _store) = config_with_auth().await;
        let server = TestServer::spawn(config);
        let (mut lines, mut client) = server.connect().await;
        lines.next().await;

        client.write_all(b"EHLO c.example\r\n").await.unwrap();
        lines.drain_multiline().await;

        client.write_all(b"AUTH PLAIN\r\n").await.unwrap();
        assert_eq!(lines.next().await, "334 ");

        let payload = plain_payload("alice@test.local", "sekrit");
        client
            .write_all(format!("{payload}\r\n").as_bytes())
            .await
            .unwrap();
        assert_eq!(lines.next().await, "235 2.7.0 Authentication succeeded");

        client.write_all(b"QUIT\r\n").await.unwrap();
        lines.next().await;
        server.join().await;
    }

    #[tokio::test]
    async fn wrong_password_and_unknown_user_answer_identically() {
        let (config, _store) = config_with_auth().await;
        let server = TestServer::spawn(config);
        let (mut lines, mut client) = server.connect().await;
        lines.next().await;

        client.write_all(b"EHLO c.example\r\n").await.unwrap();
        lines.drain_multiline().await;

        let wrong_password = plain_payload("alice@test.local", "wrong");
        client
            .write_all(format!("AUTH PLAIN {wrong_password}\r\n").as_bytes())
            .await
            .unwrap();
        let wrong_password_reply = lines.next().await;

        let unknown_user = plain_payload("mallory@test.local", "sekrit");
        client
            .write_all(format!("AUTH PLAIN {unknown_user}\r\n").as_bytes())
            .await
            .unwrap();
        let unknown_user_reply = lines.next().await;

        assert_eq!(wrong_password_reply, unknown_user_reply);
        assert!(wrong_password_reply.starts_with("535 5.7.8"));

        client.write_all(b"QUIT\r\n").await.unwrap();
        lines.next().await;
        server.join().await;
    }

    #[tokio::test]
    async fn plain_requires_tls_or_loopback() {
        let (config, _store) = config_with_auth().await;
        let server = TestServer::spawn_with_peer(config, "192.0.2.9:40000");
        let (mut lines, mut client) = server.connect().await;
        lines.next().await;

        client.write_all(b"EHLO c.example\r\n").await.unwrap();
        lines.drain_multiline().await;

        let payload = plain_payload("alice@test.local", "sekrit");
        client
            .write_all(format!("AUTH PLAIN {payload}\r\n").as_bytes())
            .await
            .unwrap();
        assert!(lines.next().await.starts_with("538 5.7.11"));

        client.write_all(b"QUIT\r\n").await.unwrap();
        lines.next().await;
        server.join().await;
    }

    #[tokio::test]
    async fn auth_requires_greeting() {
        let (config, _store) = config_with_auth().await;
        let server = TestServer::spawn(config);
        let (mut lines, mut client) = server.connect().await;
        lines.next().await;

        client.write_all(b"AUTH PLAIN\r\n").await.unwrap();
        assert_eq!(lines.next().await, "503 5.5.1 Say EHLO first");

        client.write_all(b"QUIT\r\n").await.unwrap();
        lines.next().await;
        server.join().await;
    }

    #[tokio::test]
    async fn auth_disabled_answers_502() {
        let (config, _store) = config().await;
        let server = TestServer::spawn(config);
        let (mut lines, mut client) = server.connect().await;
        lines.next().await;

        client.write_all(b"EHLO c.example\r\n").await.unwrap();
        lines.drain_multiline().await;

        client.write_all(b"AUTH PLAIN\r\n").await.unwrap();
        assert!(lines.next().await.starts_with("502 5.5.1"));

        client.write_all(b"QUIT\r\n").await.unwrap();
        lines.next().await;
        server.join().await;
    }

    #[tokio::test]
    async fn unknown_mechanism_answers_504() {
        let (config, _store) = config_with_auth().await;
        let server = TestServer::spawn(config);
        let (mut lines, mut client) = server.connect().await;
        lines.next().await;

        client.write_all(b"EHLO c.example\r\n").await.unwrap();
        lines.drain_multiline().await;

        client.write_all(b"AUTH CRAM-MD5\r\n").await.unwrap();
        assert!(lines.next().await.starts_with("504 5.5.4"));

        client.write_all(b"QUIT\r\n").await.unwrap();
        lines.next().await;
        server.join().await;
    }

    #[tokio::test]
    async fn oauthbearer_success() {
        let (config, _store) = config_with_auth().await;
        let server = TestServer::spawn(config);
        let (mut lines, mut client) = server.connect().await;
        lines.next().await;

        client.write_all(b"EHLO c.example\r\n").await.unwrap();
        lines.drain_multiline().await;

        let payload =
            BASE64.encode("n,a=alice@test.local,\x01auth=Bearer tok-1\x01\x01");
        client
            .write_all(format!("AUTH OAUTHBEARER {payload}\r\n").as_bytes())
            .await
            .unwrap();
        assert_eq!(lines.next().await, "235 2.7.0 Authentication succeeded");

        client.write_all(b"QUIT\r\n").await.unwrap();
        lines.next().await;
        server.join().await;
    }

    #[tokio::test]
    async fn oauthbearer_invalid_token_runs_failure_exchange() {
        let (config, _store) = config_with_auth().await;
        let server = TestServer::spawn(config);
        let (mut lines, mut client) = server.connect().await;
        lines.next().await;

        client.write_all(b"EHLO c.example\r\n").await.unwrap();
        lines.drain_multiline().await;

        let payload = BASE64.encode("n,,\x01auth=Bearer bogus\x01\x01");
        client
            .write_all(format!("AUTH OAUTHBEARER {payload}\r\n").as_bytes())
            .await
            .unwrap();

        // The error document arrives as a challenge.
        let challenge = lines.next().await;
        assert!(challenge.starts_with("334 "));
        let doc = BASE64
            .decode(challenge.trim_start_matches("334 "))
            .unwrap();
        assert_eq!(doc, br#"{"status":"invalid_token"}"#);

        // Dummy response completes the exchange.
        client.write_all(b"\x01\r\n").await.unwrap();
        assert!(lines.next().await.starts_with("535 5.7.8"));

        client.write_all(b"QUIT\r\n").await.unwrap();
        lines.next().await;
        server.join().await;
    }
}
