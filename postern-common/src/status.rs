use core::fmt::{self, Display, Formatter};

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Debug)]
pub enum Status {
    ServiceReady = 220,
    GoodBye = 221,
    AuthSuccessful = 235,
    Ok = 250,
    AuthContinue = 334,
    StartMailInput = 354,
    Unavailable = 421,
    ActionAborted = 451,
    InsufficientStorage = 452,
    TemporaryAuthFailure = 454,
    CommandUnrecognised = 500,
    SyntaxError = 501,
    NotImplemented = 502,
    InvalidCommandSequence = 503,
    ParamNotImplemented = 504,
    AuthInvalid = 535,
    EncryptionRequired = 538,
    Error = 550,
    ExceededStorage = 552,
    TransactionFailed = 554,
}

impl Status {
    /// Checks if the status is a permanent rejection
    #[must_use]
    pub const fn is_permanent(self) -> bool {
        self as u32 >= 500
    }

    /// Checks if the status is a temporary rejection
    #[must_use]
    pub const fn is_temporary(self) -> bool {
        let code = self as u32;
        code >= 400 && code < 500
    }

    #[must_use]
    pub const fn code(self) -> u32 {
        self as u32
    }
}

impl From<Status> for u32 {
    fn from(value: Status) -> Self {
        value as Self
    }
}

impl Display for Status {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        write!(fmt, "{}", *self as u32)
    }
}
