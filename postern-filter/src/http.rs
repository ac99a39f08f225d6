//! HTTP content checker.
//!
//! Speaks the rspamd-style check protocol: the message is POSTed to the
//! configured endpoint with the envelope facts carried in request headers,
//! and the verdict comes back as a JSON object with an `action` and a
//! `score`. The body is streamed straight off the tee, so the message is
//! never held in memory on this side.

use std::{collections::HashMap, time::Duration};

use bytes::Bytes;
use futures_util::TryStreamExt;
use http_body_util::{BodyExt, StreamBody, combinators::BoxBody};
use hyper::{Request, body::Frame};
use hyper_rustls::HttpsConnectorBuilder;
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use serde::Deserialize;
use tokio_util::io::ReaderStream;

use crate::{BodyStream, CheckOptions, CheckResult, ContentChecker, FilterError, Verdict};

type HttpsConn = hyper_rustls::HttpsConnector<HttpConnector>;
type CheckerBody = BoxBody<Bytes, std::io::Error>;
type CheckerHttpClient = Client<HttpsConn, CheckerBody>;

#[derive(Debug, Clone, Deserialize)]
pub struct HttpCheckerConfig {
    /// Full check URL, e.g. `http://127.0.0.1:11333/checkv2`.
    pub endpoint: String,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_name")]
    pub name: String,
}

const fn default_timeout_secs() -> u64 {
    15
}

fn default_name() -> String {
    "rspamd".to_string()
}

/// The verdict document returned by the check endpoint.
#[derive(Debug, Deserialize)]
struct CheckResponse {
    action: String,
    #[serde(default)]
    score: f64,
    #[serde(default)]
    messages: HashMap<String, String>,
}

#[derive(Debug)]
pub struct HttpChecker {
    config: HttpCheckerConfig,
    client: CheckerHttpClient,
    user_agent: String,
}

impl HttpChecker {
    pub fn new(config: HttpCheckerConfig) -> Result<Self, FilterError> {
        let https = HttpsConnectorBuilder::new()
            .with_native_roots()
            .map_err(|err| FilterError::Http(format!("unable to load root certificates: {err}")))?
            .https_or_http()
            .enable_http1()
            .build();

        let client: CheckerHttpClient = Client::builder(TokioExecutor::new()).build(https);

        let user_agent = format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

        Ok(Self {
            config,
            client,
            user_agent,
        })
    }

    fn interpret(&self, response: &CheckResponse) -> CheckResult {
        let verdict = match response.action.as_str() {
            "reject" => Verdict::Reject,
            "soft reject" | "soft_reject" | "greylist" => Verdict::TempFail,
            "add header" | "add_header" | "rewrite subject" | "rewrite_subject" => Verdict::Flag,
            _ => Verdict::Accept,
        };

        let is_spam = matches!(verdict, Verdict::Flag | Verdict::Reject);

        let mut headers = Vec::new();
        if is_spam {
            headers.push(("X-Spam-Flag".to_string(), "YES".to_string()));
        }
        headers.push(("X-Spam-Checker".to_string(), self.config.name.clone()));
        headers.push(("X-Spam-Score".to_string(), format!("{:.2}", response.score)));

        CheckResult {
            checker: self.config.name.clone(),
            score: response.score,
            verdict,
            is_spam,
            headers,
            message: response.messages.get("smtp_message").cloned(),
        }
    }
}

#[async_trait::async_trait]
impl ContentChecker for HttpChecker {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn check(
        &self,
        body: BodyStream,
        opts: &CheckOptions,
    ) -> Result<CheckResult, FilterError> {
        let stream = ReaderStream::new(body).map_ok(Frame::data);
        let body: CheckerBody = BoxBody::new(StreamBody::new(stream));

        let mut request = Request::builder()
            .method(hyper::Method::POST)
            .uri(&self.config.endpoint)
            .header("content-type", "message/rfc822")
            .header("user-agent", &self.user_agent)
            .header("From", &opts.sender)
            .header("Ip", &opts.client_ip)
            .header("Helo", &opts.helo)
            .header("Hostname", &opts.hostname)
            .header("Queue-Id", &opts.queue_id);

        for recipient in &opts.recipients {
            request = request.header("Rcpt", recipient);
        }

        if let Some(user) = &opts.authenticated_user {
            request = request.header("User", user);
        }

        let request = request
            .body(body)
            .map_err(|err| FilterError::Http(err.to_string()))?;

        let timeout = Duration::from_secs(self.config.timeout_secs);
        let response = tokio::time::timeout(timeout, self.client.request(request))
            .await
            .map_err(|_| FilterError::Timeout)?
            .map_err(|err| FilterError::Http(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FilterError::Http(format!(
                "check endpoint answered {status}"
            )));
        }

        let bytes = response
            .into_body()
            .collect()
            .await
            .map_err(|err| FilterError::Http(err.to_string()))?
            .to_bytes();

        let parsed: CheckResponse = serde_json::from_slice(&bytes)
            .map_err(|err| FilterError::Protocol(err.to_string()))?;

        tracing::debug!(
            checker = %self.config.name,
            action = %parsed.action,
            score = parsed.score,
            "content check verdict"
        );

        Ok(self.interpret(&parsed))
    }

    async fn close(&self) -> Result<(), FilterError> {
        Ok(())
    }
}
