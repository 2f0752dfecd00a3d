use std::fmt;

/// Error taxonomy for the coordinator-side control plane.
///
/// Kept as a flat, hand-rolled enum rather than a derive-macro error type:
/// the taxonomy is small, fixed, and every variant maps to exactly one gRPC
/// status code at the RPC boundary (see `vpnctl-coordinator::grpc`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Signature verification failed, or a non-auth message arrived first
    /// on a new stream. Terminates the stream.
    Unauthenticated(String),
    /// Malformed role, malformed key, or a missing required payload field.
    InvalidArgument(String),
    /// No session for peer_id, no peer for public_key, no allocation for id.
    NotFound(String),
    /// The directory returned no candidates, or every candidate failed.
    NoCandidate(String),
    /// An awaited response (auth, command, heartbeat) did not arrive in time.
    Timeout(String),
    /// A data-plane operation could not complete, or a transport dial failed.
    Unavailable(String),
    /// An IP pool has no free addresses.
    Exhausted(String),
    /// Attempted to add a client_id already present in an exit's active set.
    Conflict(String),
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

    pub fn no_candidate(msg: impl Into<String>) -> Self {
        Self::NoCandidate(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
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
            Self::Unauthenticated(m)
            | Self::InvalidArgument(m)
            | Self::NotFound(m)
            | Self::NoCandidate(m)
            | Self::Timeout(m)
            | Self::Unavailable(m)
            | Self::Exhausted(m)
            | Self::Conflict(m) => m,
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
            Self::NoCandidate(_) => "no candidate",
            Self::Timeout(_) => "timeout",
            Self::Unavailable(_) => "unavailable",
            Self::Exhausted(_) => "exhausted",
            Self::Conflict(_) => "conflict",
        };

        write!(f, "{}: {}", kind, self.message())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
