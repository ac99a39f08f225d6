//! Content inspection for accepted message bodies.
//!
//! A [`ContentChecker`] consumes the message stream once while the body is
//! still arriving and renders a [`Verdict`]. The SMTP core applies the
//! verdict synchronously, inside the DATA reply, under the configured
//! [`CheckPolicy`]. When the checker itself is unreachable, [`FailMode`]
//! decides whether mail flows, defers, or bounces at the door.

use std::fmt::Debug;

use async_trait::async_trait;
use thiserror::Error;

pub mod http;
pub mod multi;

pub use http::{HttpChecker, HttpCheckerConfig};
pub use multi::MultiChecker;

/// A message stream handed to a checker. Checkers consume it to EOF.
pub type BodyStream = Box<dyn tokio::io::AsyncRead + Send + Sync + Unpin>;

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("Checker request failed: {0}")]
    Http(String),

    #[error("Checker timed out")]
    Timeout,

    #[error("Malformed checker response: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// What the checker thinks should happen to the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Deliver as-is.
    Accept,
    /// Deliver, but mark it (headers prepended under the add-headers
    /// policy).
    Flag,
    /// Defer: the client should retry later.
    TempFail,
    /// Refuse permanently.
    Reject,
}

/// Session facts offered to the checker alongside the body.
#[derive(Debug, Clone, Default)]
pub struct CheckOptions {
    pub sender: String,
    pub recipients: Vec<String>,
    pub client_ip: String,
    pub helo: String,
    pub hostname: String,
    pub authenticated_user: Option<String>,
    pub queue_id: String,
}

/// One checker's opinion of one message.
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub checker: String,
    pub score: f64,
    pub verdict: Verdict,
    pub is_spam: bool,
    /// Headers the checker wants prepended to the stored message.
    pub headers: Vec<(String, String)>,
    /// Text for the SMTP reply on TempFail/Reject.
    pub message: Option<String>,
}

impl CheckResult {
    #[must_use]
    pub fn accept(checker: impl Into<String>) -> Self {
        Self {
            checker: checker.into(),
            score: 0.0,
            verdict: Verdict::Accept,
            is_spam: false,
            headers: Vec::new(),
            message: None,
        }
    }
}

/// Inspects message content and renders a verdict.
#[async_trait]
pub trait ContentChecker: Send + Sync + Debug {
    fn name(&self) -> &str;

    /// Consume the entire body stream and produce a verdict. The stream
    /// must be read to EOF even when the verdict is already clear, so the
    /// caller's tee sees the whole message.
    async fn check(&self, body: BodyStream, opts: &CheckOptions)
    -> Result<CheckResult, FilterError>;

    /// Release any held resources. Idempotent.
    async fn close(&self) -> Result<(), FilterError>;
}

/// What to do when the checker cannot be consulted at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailMode {
    /// Deliver as if the checker had accepted.
    #[default]
    Open,
    /// Defer with a 4xx.
    TempFail,
    /// Refuse with a 5xx.
    Reject,
}

/// How verdicts and scores translate into SMTP outcomes.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct CheckPolicy {
    #[serde(default)]
    pub fail_mode: FailMode,

    /// Score at or above which the message is refused outright.
    #[serde(default)]
    pub reject_threshold: Option<f64>,

    /// Score at or above which the message is deferred. Ignored unless
    /// positive.
    #[serde(default)]
    pub tempfail_threshold: Option<f64>,

    /// Whether checker-supplied headers are prepended to the message.
    #[serde(default)]
    pub add_headers: bool,
}

impl Default for CheckPolicy {
    fn default() -> Self {
        Self {
            fail_mode: FailMode::Open,
            reject_threshold: None,
            tempfail_threshold: None,
            add_headers: false,
        }
    }
}

/// The policy's decision for one message, ready to act on.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    /// Carry on to delivery, prepending these headers first.
    Deliver { headers: Vec<(String, String)> },
    TempFail(String),
    Reject(String),
}

impl CheckPolicy {
    /// Fold a checker verdict and the configured thresholds into a final
    /// outcome.
    #[must_use]
    pub fn disposition(&self, result: &CheckResult) -> Disposition {
        let over = |threshold: Option<f64>| threshold.is_some_and(|t| t > 0.0 && result.score >= t);

        let reply = |fallback: &str| {
            result
                .message
                .clone()
                .unwrap_or_else(|| fallback.to_string())
        };

        if result.verdict == Verdict::Reject || over(self.reject_threshold) {
            return Disposition::Reject(reply("Message refused by content policy"));
        }

        if result.verdict == Verdict::TempFail || over(self.tempfail_threshold) {
            return Disposition::TempFail(reply("Message deferred by content policy"));
        }

        let headers = if self.add_headers {
            result.headers.clone()
        } else {
            Vec::new()
        };

        Disposition::Deliver { headers }
    }

    /// The outcome when the checker errored instead of answering.
    #[must_use]
    pub fn on_error(&self, err: &FilterError) -> Disposition {
        match self.fail_mode {
            FailMode::Open => {
                tracing::warn!(%err, "content checker unavailable, delivering unchecked");
                Disposition::Deliver {
                    headers: Vec::new(),
                }
            }
            FailMode::TempFail => Disposition::TempFail("Content check unavailable".to_string()),
            FailMode::Reject => Disposition::Reject("Content check unavailable".to_string()),
        }
    }
}
