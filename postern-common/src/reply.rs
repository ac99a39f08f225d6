use core::fmt::{self, Display, Formatter};

use crate::status::Status;

/// A complete SMTP reply: one status code and one or more text lines.
///
/// Multi-line replies use the RFC 5321 continuation convention: every line
/// but the last is written as `NNN-text`, the last as `NNN text`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reply {
    status: Status,
    lines: Vec<String>,
}

impl Reply {
    #[must_use]
    pub fn new(status: Status, text: impl Into<String>) -> Self {
        Self {
            status,
            lines: vec![text.into()],
        }
    }

    /// Append a continuation line.
    #[must_use]
    pub fn line(mut self, text: impl Into<String>) -> Self {
        self.lines.push(text.into());
        self
    }

    #[must_use]
    pub const fn status(&self) -> Status {
        self.status
    }

    #[must_use]
    pub fn text(&self) -> &str {
        self.lines.first().map_or("", String::as_str)
    }

    /// The wire form of each reply line, without terminators.
    pub fn wire_lines(&self) -> impl Iterator<Item = String> + '_ {
        let last = self.lines.len().saturating_sub(1);
        self.lines.iter().enumerate().map(move |(idx, line)| {
            if idx == last {
                format!("{} {line}", self.status)
            } else {
                format!("{}-{line}", self.status)
            }
        })
    }

    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        self.status.is_permanent()
    }

    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        self.status.is_temporary()
    }
}

impl Display for Reply {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        let mut first = true;
        for line in self.wire_lines() {
            if !first {
                fmt.write_str("\r\n")?;
            }
            first = false;
            fmt.write_str(&line)?;
        }
        Ok(())
    }
}
