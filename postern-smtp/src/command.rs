use core::fmt::{self, Display, Formatter};

use postern_common::address::Address;

/// Longest accepted mailbox, per RFC 5321 §4.5.3.1 with the widest
/// interpretation (64 local + 1 + 255 domain).
pub const MAX_EMAIL_LEN: usize = 320;

/// Longest accepted EHLO/HELO argument.
pub const MAX_HELO_DOMAIN_LEN: usize = 255;

#[derive(PartialEq, Eq, Hash, Debug)]
pub enum HeloVariant {
    Ehlo(String),
    Helo(String),
}

impl HeloVariant {
    #[must_use]
    pub fn domain(&self) -> &str {
        match self {
            Self::Ehlo(domain) | Self::Helo(domain) => domain,
        }
    }
}

impl Display for HeloVariant {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ehlo(_) => "EHLO",
            Self::Helo(_) => "HELO",
        })
    }
}

/// ESMTP parameters trailing a MAIL FROM / RCPT TO path. Keys are
/// uppercased at parse time; values are kept verbatim. The core only
/// interprets SIZE, everything else rides along uninterpreted.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MailParameters(Vec<(String, Option<String>)>);

impl MailParameters {
    #[must_use]
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<Option<&str>> {
        self.0
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_deref())
    }

    /// The declared SIZE parameter (RFC 1870), when present and sane.
    /// `SIZE=0` means "no fixed size declared" and reads as absent.
    #[must_use]
    pub fn size(&self) -> Option<usize> {
        self.get("SIZE")
            .flatten()
            .and_then(|raw| raw.parse::<usize>().ok())
            .filter(|size| *size > 0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// One parsed SMTP command line.
#[derive(Debug, PartialEq, Eq)]
pub enum Command {
    Helo(HeloVariant),
    /// `path` is `None` for the null reverse path (`MAIL FROM:<>`), used
    /// by bounce envelopes.
    MailFrom {
        path: Option<Address>,
        params: MailParameters,
    },
    RcptTo {
        path: Address,
        params: MailParameters,
    },
    Data,
    Rset,
    Noop(String),
    Quit,
    StartTls,
    Auth {
        mechanism: String,
        initial: Option<String>,
    },
}

impl Display for Command {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Helo(variant) => write!(f, "{variant} {}", variant.domain()),
            Self::MailFrom { path, .. } => write!(
                f,
                "MAIL FROM:<{}>",
                path.as_ref().map_or_else(String::new, Address::to_string)
            ),
            Self::RcptTo { path, .. } => write!(f, "RCPT TO:<{path}>"),
            Self::Data => f.write_str("DATA"),
            Self::Rset => f.write_str("RSET"),
            Self::Noop(_) => f.write_str("NOOP"),
            Self::Quit => f.write_str("QUIT"),
            Self::StartTls => f.write_str("STARTTLS"),
            Self::Auth { mechanism, .. } => write!(f, "AUTH {mechanism}"),
        }
    }
}

/// Why a command line did not parse. Unrecognised verbs answer `500`,
/// recognised verbs with bad arguments answer `501`.
#[derive(Debug, PartialEq, Eq)]
pub enum ParseError {
    Unrecognised(String),
    Syntax(String),
}

impl Display for ParseError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unrecognised(verb) => write!(f, "Command not recognised: {verb}"),
            Self::Syntax(reason) => f.write_str(reason),
        }
    }
}

/// Split `<path> [params]`, requiring the angle brackets RFC 5321 asks
/// clients to send. The bracketed text is returned verbatim.
fn split_path(rest: &str) -> Result<(&str, &str), ParseError> {
    let rest = rest.trim_start();

    let Some(stripped) = rest.strip_prefix('<') else {
        return Err(ParseError::Syntax(
            "Path must be enclosed in angle brackets".to_string(),
        ));
    };

    let Some(close) = stripped.find('>') else {
        return Err(ParseError::Syntax("Unterminated path".to_string()));
    };

    Ok((&stripped[..close], &stripped[close + 1..]))
}

fn parse_params(raw: &str) -> Result<MailParameters, ParseError> {
    let mut params = Vec::new();

    for token in raw.split_whitespace() {
        let (key, value) = token.split_once('=').map_or_else(
            || (token.to_ascii_uppercase(), None),
            |(key, value)| (key.to_ascii_uppercase(), Some(value.to_string())),
        );

        if key == "SIZE" && params.iter().any(|(name, _)| name == "SIZE") {
            return Err(ParseError::Syntax(
                "Duplicate SIZE parameter not allowed".to_string(),
            ));
        }

        params.push((key, value));
    }

    Ok(MailParameters(params))
}

fn parse_mailbox(raw: &str) -> Result<Address, ParseError> {
    if raw.len() > MAX_EMAIL_LEN {
        return Err(ParseError::Syntax("Address too long".to_string()));
    }

    Address::parse(raw).map_err(|err| ParseError::Syntax(err.to_string()))
}

fn parse_helo(command: &str, upper: &str) -> Result<Command, ParseError> {
    let argument = command[4..].trim();

    if argument.is_empty() {
        return Err(ParseError::Syntax("Expected a domain".to_string()));
    }

    if argument.split_whitespace().count() > 1 {
        return Err(ParseError::Syntax(
            "Unexpected text after domain".to_string(),
        ));
    }

    if argument.len() > MAX_HELO_DOMAIN_LEN {
        return Err(ParseError::Syntax("Domain too long".to_string()));
    }

    Ok(Command::Helo(if upper.starts_with("EHLO") {
        HeloVariant::Ehlo(argument.to_string())
    } else {
        HeloVariant::Helo(argument.to_string())
    }))
}

fn parse_auth(command: &str) -> Result<Command, ParseError> {
    let mut tokens = command[4..].split_whitespace();

    let Some(mechanism) = tokens.next() else {
        return Err(ParseError::Syntax(
            "Expected an authentication mechanism".to_string(),
        ));
    };

    let initial = tokens.next().map(ToString::to_string);

    if tokens.next().is_some() {
        return Err(ParseError::Syntax(
            "Unexpected text after initial response".to_string(),
        ));
    }

    Ok(Command::Auth {
        mechanism: mechanism.to_ascii_uppercase(),
        initial,
    })
}

/// Reject trailing arguments on commands that take none; bare trailing
/// whitespace is tolerated.
fn bare(command: &str, parsed: Command) -> Result<Command, ParseError> {
    let verb_len = parsed.to_string().len();
    if command[verb_len..].trim().is_empty() {
        Ok(parsed)
    } else {
        Err(ParseError::Syntax(format!(
            "{parsed} does not take arguments"
        )))
    }
}

/// Whether `upper` starts with `verb` as a whole word.
fn has_verb(upper: &str, verb: &str) -> bool {
    upper
        .strip_prefix(verb)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with(' '))
}

impl TryFrom<&str> for Command {
    type Error = ParseError;

    fn try_from(command: &str) -> Result<Self, Self::Error> {
        let upper = command.to_ascii_uppercase();
        let upper = upper.trim();
        let command = command.trim();

        if upper.starts_with("MAIL FROM:") {
            let (path, params) = split_path(&command[10..])?;
            let path = if path.is_empty() {
                None
            } else {
                Some(parse_mailbox(path)?)
            };

            Ok(Self::MailFrom {
                path,
                params: parse_params(params)?,
            })
        } else if upper.starts_with("RCPT TO:") {
            let (path, params) = split_path(&command[8..])?;
            if path.is_empty() {
                return Err(ParseError::Syntax("Empty forward path".to_string()));
            }

            Ok(Self::RcptTo {
                path: parse_mailbox(path)?,
                params: parse_params(params)?,
            })
        } else if has_verb(upper, "EHLO") || has_verb(upper, "HELO") {
            parse_helo(command, upper)
        } else if has_verb(upper, "AUTH") {
            parse_auth(command)
        } else if has_verb(upper, "NOOP") {
            Ok(Self::Noop(command[4..].trim().to_string()))
        } else if has_verb(upper, "DATA") {
            bare(command, Self::Data)
        } else if has_verb(upper, "RSET") {
            bare(command, Self::Rset)
        } else if has_verb(upper, "QUIT") {
            bare(command, Self::Quit)
        } else if has_verb(upper, "STARTTLS") {
            bare(command, Self::StartTls)
        } else {
            Err(ParseError::Unrecognised(
                upper.split_whitespace().next().unwrap_or("").to_string(),
            ))
        }
    }
}

impl TryFrom<&[u8]> for Command {
    type Error = ParseError;

    fn try_from(command: &[u8]) -> Result<Self, Self::Error> {
        std::str::from_utf8(command).map_or_else(
            |_| Err(ParseError::Syntax("Unable to interpret command".to_string())),
            Self::try_from,
        )
    }
}

#[cfg(test)]
mod test {
    use super::{Command, HeloVariant, MAX_EMAIL_LEN, MAX_HELO_DOMAIN_LEN, ParseError};

    // Idea copied from https://gitlab.com/erichdongubler-experiments/rust_case_permutations/blob/master/src/lib.rs#L97
    fn string_casing(string: &str) -> impl Iterator<Item = String> {
        let len = string.len();
        let num_cases = usize::pow(2, u32::try_from(len).unwrap_or(0));

        let (upper, lower) = string.chars().fold(
            (Vec::with_capacity(len), Vec::with_capacity(len)),
            |(mut upper, mut lower), c| {
                upper.push(c.to_ascii_uppercase());
                lower.push(c.to_ascii_lowercase());
                (upper, lower)
            },
        );

        (0..num_cases).map(move |i| {
            (0..len).fold(String::with_capacity(len), |mut s, idx| {
                if (i & (1 << idx)) == 0 {
                    s.push(lower[idx]);
                } else {
                    s.push(upper[idx]);
                }
                s
            })
        })
    }

    #[test]
    fn mail_from_command() {
        let command = Command::try_from("MAIL FROM:<test@example.com>").unwrap();
        assert!(matches!(
            &command,
            Command::MailFrom { path: Some(path), .. } if path.as_str() == "test@example.com"
        ));

        // The null reverse path is a valid bounce envelope.
        assert!(matches!(
            Command::try_from("MAIL FROM:<>").unwrap(),
            Command::MailFrom { path: None, .. }
        ));

        // Angle brackets are mandatory.
        assert!(Command::try_from("MAIL FROM:test@example.com").is_err());
        assert!(Command::try_from("MAIL FROM:").is_err());
        assert!(Command::try_from("MAIL FROM:<unterminated@example.com").is_err());

        for comm in string_casing("mail from") {
            assert!(matches!(
                Command::try_from(format!("{comm}:<test@example.com>").as_str()),
                Ok(Command::MailFrom { .. })
            ));
        }
    }

    #[test]
    fn mail_from_parameters() {
        let Command::MailFrom { params, .. } =
            Command::try_from("MAIL FROM:<test@example.com> SIZE=12345 BODY=8BITMIME").unwrap()
        else {
            panic!("expected MAIL FROM");
        };

        assert_eq!(params.size(), Some(12345));
        assert_eq!(params.get("BODY"), Some(Some("8BITMIME")));

        // SIZE=0 declares nothing.
        let Command::MailFrom { params, .. } =
            Command::try_from("MAIL FROM:<> SIZE=0").unwrap()
        else {
            panic!("expected MAIL FROM");
        };
        assert_eq!(params.size(), None);

        // Case-insensitive keys.
        let Command::MailFrom { params, .. } =
            Command::try_from("MAIL FROM:<a@b.example> size=5000").unwrap()
        else {
            panic!("expected MAIL FROM");
        };
        assert_eq!(params.size(), Some(5000));

        // Duplicate SIZE parameters are rejected.
        assert!(matches!(
            Command::try_from("MAIL FROM:<a@b.example> SIZE=1 SIZE=2"),
            Err(ParseError::Syntax(_))
        ));

        // Malformed values are ignored, not fatal.
        let Command::MailFrom { params, .. } =
            Command::try_from("MAIL FROM:<a@b.example> SIZE=abc").unwrap()
        else {
            panic!("expected MAIL FROM");
        };
        assert_eq!(params.size(), None);
    }

    #[test]
    fn rcpt_to_command() {
        let command = Command::try_from("RCPT TO:<alice@test.local>").unwrap();
        assert!(matches!(
            &command,
            Command::RcptTo { path, .. } if path.as_str() == "alice@test.local"
        ));

        // The null path is never a valid recipient.
        assert!(Command::try_from("RCPT TO:<>").is_err());
        assert!(Command::try_from("RCPT TO:alice@test.local").is_err());
        assert!(Command::try_from("RCPT TO:").is_err());

        for comm in string_casing("rcpt to") {
            assert!(matches!(
                Command::try_from(format!("{comm}:<alice@test.local>").as_str()),
                Ok(Command::RcptTo { .. })
            ));
        }
    }

    #[test]
    fn address_length_cap() {
        let local = "a".repeat(MAX_EMAIL_LEN - "@example.com".len());
        let at_cap = format!("MAIL FROM:<{local}@example.com>");
        assert!(Command::try_from(at_cap.as_str()).is_ok());

        let over = format!("MAIL FROM:<a{local}@example.com>");
        assert!(matches!(
            Command::try_from(over.as_str()),
            Err(ParseError::Syntax(_))
        ));
    }

    #[test]
    fn helo_ehlo_command() {
        assert!(Command::try_from("EHLO").is_err());
        assert!(Command::try_from("HELO").is_err());
        assert!(Command::try_from("EHLO one two").is_err());

        // Trailing whitespace is tolerated.
        assert_eq!(
            Command::try_from("EHLO c.example  ").unwrap(),
            Command::Helo(HeloVariant::Ehlo("c.example".to_string()))
        );

        let domain = "d".repeat(MAX_HELO_DOMAIN_LEN);
        assert!(Command::try_from(format!("EHLO {domain}").as_str()).is_ok());
        assert!(Command::try_from(format!("EHLO x{domain}").as_str()).is_err());

        for comm in string_casing("ehlo") {
            assert!(
                matches!(
                    Command::try_from(format!("{comm} test").as_str()),
                    Ok(Command::Helo(HeloVariant::Ehlo(_)))
                ),
                "'{comm}' should map to Ehlo"
            );
        }

        for comm in string_casing("helo") {
            assert!(
                matches!(
                    Command::try_from(format!("{comm} test").as_str()),
                    Ok(Command::Helo(HeloVariant::Helo(_))),
                ),
                "'{comm}' should map to Helo"
            );
        }
    }

    #[test]
    fn auth_command() {
        assert_eq!(
            Command::try_from("AUTH PLAIN").unwrap(),
            Command::Auth {
                mechanism: "PLAIN".to_string(),
                initial: None
            }
        );

        assert_eq!(
            Command::try_from("auth plain AGFsaWNlAHNla3JpdA==").unwrap(),
            Command::Auth {
                mechanism: "PLAIN".to_string(),
                initial: Some("AGFsaWNlAHNla3JpdA==".to_string())
            }
        );

        assert!(Command::try_from("AUTH").is_err());
        assert!(Command::try_from("AUTH PLAIN abc extra").is_err());
    }

    #[test]
    fn bare_commands() {
        for comm in string_casing("data") {
            assert_eq!(Command::try_from(comm.as_str()), Ok(Command::Data));
        }
        for comm in string_casing("quit") {
            assert_eq!(Command::try_from(comm.as_str()), Ok(Command::Quit));
        }
        for comm in string_casing("rset") {
            assert_eq!(Command::try_from(comm.as_str()), Ok(Command::Rset));
        }

        assert_eq!(Command::try_from("STARTTLS"), Ok(Command::StartTls));
        assert_eq!(Command::try_from("DATA  "), Ok(Command::Data));

        // Arguments on bare commands are syntax errors.
        assert!(matches!(
            Command::try_from("DATA now"),
            Err(ParseError::Syntax(_))
        ));
        assert!(matches!(
            Command::try_from("RSET please"),
            Err(ParseError::Syntax(_))
        ));
    }

    #[test]
    fn noop_accepts_anything() {
        assert_eq!(
            Command::try_from("NOOP"),
            Ok(Command::Noop(String::new()))
        );
        assert_eq!(
            Command::try_from("NOOP whatever you say"),
            Ok(Command::Noop("whatever you say".to_string()))
        );
    }

    #[test]
    fn unrecognised_commands() {
        assert!(matches!(
            Command::try_from("VRFY alice"),
            Err(ParseError::Unrecognised(_))
        ));
        assert!(matches!(
            Command::try_from("FOO"),
            Err(ParseError::Unrecognised(_))
        ));
        // Verbs only match on word boundaries.
        assert!(matches!(
            Command::try_from("EHLOfoo"),
            Err(ParseError::Unrecognised(_))
        ));
        assert!(matches!(
            Command::try_from("DATAX"),
            Err(ParseError::Unrecognised(_))
        ));
    }
}
