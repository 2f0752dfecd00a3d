use std::fmt;

/// Error taxonomy for the peer-side client, the mirror image of
/// `vpnctl-control::Error` for the subset of failure modes a peer observes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    Unauthenticated(String),
    InvalidArgument(String),
    NotFound(String),
    Timeout(String),
    Unavailable(String),
}

impl Error {
    pub fn unauthenticated(msg: impl Into<String>) -> Self {
        Self::Unauthenticated(msg.into())
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Unauthenticated(m) | Self::InvalidArgument(m) | Self::NotFound(m) | Self::Timeout(m) | Self::Unavailable(m) => m,
        }
    }
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Self::Unauthenticated(_) => "unauthenticated",
            Self::InvalidArgument(_) => "invalid argument",
            Self::NotFound(_) => "not found",
            Self::Timeout(_) => "timeout",
            Self::Unavailable(_) => "unavailable",
        };

        write!(f, "{}: {}", kind, self.message())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
