use core::fmt::{self, Display};

/// Capabilities advertised in the EHLO reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extension {
    /// RFC 1870. A zero cap advertises `SIZE` with no fixed maximum.
    Size(usize),
    /// RFC 6152.
    EightBitMime,
    /// RFC 3207. Only advertised while the connection is still cleartext
    /// and certificate material is configured.
    StartTls,
    /// RFC 4954, with the offered mechanisms.
    Auth(Vec<&'static str>),
}

impl Display for Extension {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            Self::Size(max) => {
                if *max == 0 {
                    fmt.write_str("SIZE")
                } else {
                    write!(fmt, "SIZE {max}")
                }
            }
            Self::EightBitMime => fmt.write_str("8BITMIME"),
            Self::StartTls => fmt.write_str("STARTTLS"),
            Self::Auth(mechanisms) => write!(fmt, "AUTH {}", mechanisms.join(" ")),
        }
    }
}
