use std::fmt;

/// Error taxonomy for the Data-Plane Adapter, matching the subset of
/// `vpnctl-control::Error` that applies to C1 operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    InvalidArgument(String),
    NotFound(String),
    Unavailable(String),
    Exhausted(String),
    Conflict(String),
}

impl Error {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    pub fn exhausted(msg: impl Into<String>) -> Self {
        Self::Exhausted(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn message(&self) -> &str {
        match self {
            Self::InvalidArgument(m) | Self::NotFound(m) | Self::Unavailable(m) | Self::Exhausted(m) | Self::Conflict(m) => m,
        }
    }
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Self::InvalidArgument(_) => "invalid argument",
            Self::NotFound(_) => "not found",
            Self::Unavailable(_) => "unavailable",
            Self::Exhausted(_) => "exhausted",
            Self::Conflict(_) => "conflict",
        };

        write!(f, "{}: {}", kind, self.message())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
