//! Fan one message body out to several checkers and fold their verdicts.

use std::sync::Arc;

use futures_util::future::join_all;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::{BodyStream, CheckOptions, CheckResult, ContentChecker, FilterError, Verdict};

const FANOUT_PIPE_CAPACITY: usize = 8192;

const fn severity(verdict: Verdict) -> u8 {
    match verdict {
        Verdict::Accept => 0,
        Verdict::Flag => 1,
        Verdict::TempFail => 2,
        Verdict::Reject => 3,
    }
}

/// Runs every configured checker over the same single-pass body stream.
///
/// The stream is copied into one bounded pipe per checker; a checker that
/// stops reading early (error, early verdict) just sees its pipe close.
/// The harshest verdict wins; headers from all agreeing checkers are
/// merged.
#[derive(Debug)]
pub struct MultiChecker {
    checkers: Vec<Arc<dyn ContentChecker>>,
}

impl MultiChecker {
    #[must_use]
    pub const fn new(checkers: Vec<Arc<dyn ContentChecker>>) -> Self {
        Self { checkers }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.checkers.is_empty()
    }

    fn fold(results: Vec<Result<CheckResult, FilterError>>) -> Result<CheckResult, FilterError> {
        let mut worst: Option<CheckResult> = None;
        let mut headers = Vec::new();
        let mut first_error = None;

        for result in results {
            match result {
                Ok(result) => {
                    headers.extend(result.headers.clone());
                    let replace = worst
                        .as_ref()
                        .is_none_or(|w| severity(result.verdict) > severity(w.verdict));
                    if replace {
                        worst = Some(result);
                    }
                }
                Err(err) => {
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }

        // A definite rejection outranks another checker being down.
        match (worst, first_error) {
            (Some(worst), Some(err)) if worst.verdict != Verdict::Reject => Err(err),
            (Some(mut worst), _) => {
                worst.headers = headers;
                Ok(worst)
            }
            (None, Some(err)) => Err(err),
            (None, None) => Ok(CheckResult::accept("none")),
        }
    }
}

#[async_trait::async_trait]
impl ContentChecker for MultiChecker {
    fn name(&self) -> &str {
        "multi"
    }

    async fn check(
        &self,
        mut body: BodyStream,
        opts: &CheckOptions,
    ) -> Result<CheckResult, FilterError> {
        if self.checkers.is_empty() {
            // Still obligated to drain the stream for the caller's tee.
            tokio::io::copy(&mut body, &mut tokio::io::sink()).await?;
            return Ok(CheckResult::accept("none"));
        }

        let mut writers = Vec::with_capacity(self.checkers.len());
        let mut checks = Vec::with_capacity(self.checkers.len());

        for checker in &self.checkers {
            let (writer, reader) = tokio::io::duplex(FANOUT_PIPE_CAPACITY);
            writers.push(Some(writer));
            checks.push(checker.check(Box::new(reader), opts));
        }

        let feed = async move {
            let mut chunk = [0u8; FANOUT_PIPE_CAPACITY];
            loop {
                let read = body.read(&mut chunk).await?;
                if read == 0 {
                    break;
                }

                for slot in &mut writers {
                    if let Some(writer) = slot
                        && writer.write_all(&chunk[..read]).await.is_err()
                    {
                        // That checker stopped listening; its verdict (or
                        // error) arrives through its own future.
                        *slot = None;
                    }
                }
            }

            drop(writers);
            Ok::<(), FilterError>(())
        };

        let (fed, results) = tokio::join!(feed, join_all(checks));
        fed?;

        Self::fold(results)
    }

    async fn close(&self) -> Result<(), FilterError> {
        for checker in &self.checkers {
            checker.close().await?;
        }
        Ok(())
    }
}
