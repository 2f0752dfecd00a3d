use std::{fmt, str::FromStr};

use crate::error::{Error, Result};

/// Mirrors `vpnctl_control::session::Role` from the peer's own point of
/// view. Role is data, not type: kept as a plain enum rather than a set of
/// marker types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Client,
    Exit,
    Hybrid,
}

impl Role {
    pub fn requires_exit_interface(self) -> bool {
        matches!(self, Self::Exit | Self::Hybrid)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Exit => "exit",
            Self::Hybrid => "hybrid",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "client" => Ok(Self::Client),
            "exit" => Ok(Self::Exit),
            "hybrid" => Ok(Self::Hybrid),
            other => Err(Error::invalid_argument(format!("unknown role: {other}"))),
        }
    }
}

impl From<Role> for proto::proto::Role {
    fn from(value: Role) -> Self {
        match value {
            Role::Client => proto::proto::Role::Client,
            Role::Exit => proto::proto::Role::Exit,
            Role::Hybrid => proto::proto::Role::Hybrid,
        }
    }
}
