use std::{fs::read_to_string, str::FromStr};

use anyhow::Result;
use clap::Parser;
use serde::Deserialize;

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct ExitInterface {
    #[serde(default = "ExitInterface::interface")]
    pub interface: String,
    pub egress_interface: String,
    pub private_key: String,
    pub public_key: String,
    pub listen_port: Option<u16>,
    #[serde(default = "ExitInterface::pool_name")]
    pub pool_name: String,
    pub pool_cidr: String,
    /// Externally reachable `host:port` advertised back to a requester as
    /// `ExitPeerInfo.endpoint` when this peer is acting as the exit side of
    /// an allocation (spec §4.5 step 2c).
    pub public_endpoint: String,
}

impl ExitInterface {
    fn interface() -> String {
        "wg-exit0".to_string()
    }

    fn pool_name() -> String {
        "exit-pool".to_string()
    }
}

#[derive(Deserialize, Debug, Clone, Copy, Default)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_level(self) -> log::Level {
        match self {
            Self::Error => log::Level::Error,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match value.to_ascii_lowercase().as_str() {
            "error" => Self::Error,
            "warn" => Self::Warn,
            "info" => Self::Info,
            "debug" => Self::Debug,
            "trace" => Self::Trace,
            other => return Err(format!("unknown log level: {other}")),
        })
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct Log {
    #[serde(default)]
    pub level: LogLevel,
}

/// Static identity (spec §9 Open Question #1: a deployment MAY configure
/// `auth_key` and `tunnel_key` equal, but this crate never assumes it — so
/// both are configured independently here).
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Identity {
    pub auth_private_key_b64: String,
    #[serde(default)]
    pub tunnel_public_key: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    pub peer_id: String,
    pub region: String,
    pub coordinator_address: String,

    /// Role this peer declares on every `AuthRequest` until changed at
    /// runtime by a `CHANGE_ROLE` command (spec §4.6), handled by
    /// `vpnctl_peer::handlers::ChangeRoleHandler` and dispatched through
    /// `RoleController::transition`.
    #[serde(default = "Config::initial_role")]
    pub initial_role: String,

    /// Local WireGuard interface `ROTATE_PEER` configures when this peer is
    /// acting as a client (spec §4.5 step 4). Distinct from `exit.interface`,
    /// which only exists when this peer can also act as an exit.
    #[serde(default = "Config::client_interface")]
    pub client_interface: String,

    pub identity: Identity,

    #[serde(default)]
    pub exit: Option<ExitInterface>,

    #[serde(default)]
    pub log: Log,
}

impl Config {
    fn initial_role() -> String {
        "client".to_string()
    }

    fn client_interface() -> String {
        "wg-client0".to_string()
    }
}

#[derive(Parser, Debug)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
    author = env!("CARGO_PKG_AUTHORS"),
)]
struct Cli {
    /// Specify the configuration file path.
    ///
    /// Example: vpnctl-peer --config /etc/vpnctl/peer.json5
    #[arg(long, short)]
    config: String,
}

impl Config {
    pub fn load() -> Result<Self> {
        let raw = read_to_string(Cli::parse().config)?;
        Ok(serde_json5::from_str(&raw)?)
    }
}
