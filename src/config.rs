use std::{fs::read_to_string, net::SocketAddr, str::FromStr};

use anyhow::Result;
use clap::Parser;
use serde::Deserialize;

/// One remote coordinator address to register with on startup (spec §4.2
/// "Directory" bootstrap). Coordinators otherwise discover each other purely
/// by receiving `RegisterCoordinator` calls; this list exists only to seed
/// that first handshake in a freshly started deployment.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct PeerCoordinator {
    pub address: String,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Relay {
    /// Local WireGuard interface used to splice relayed paths (spec §4.5
    /// step 3).
    #[serde(default = "Relay::iface")]
    pub iface: String,
    #[serde(default = "Relay::pool_name")]
    pub pool_name: String,
    #[serde(default = "Relay::pool_cidr")]
    pub pool_cidr: String,
    pub egress_iface: String,
    /// Endpoint handed back to the requester in place of the exit's own
    /// when a grant is relayed.
    pub public_endpoint: String,
}

impl Relay {
    fn iface() -> String {
        "wg-relay0".to_string()
    }

    fn pool_name() -> String {
        "relay-pool".to_string()
    }

    fn pool_cidr() -> String {
        "10.60.0.0/24".to_string()
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
pub struct Reachability {
    /// Static fallback used when a request carries no explicit
    /// `prefer_relay` override (spec §4.5, Open Question #2).
    #[serde(default)]
    pub relay_by_default: bool,
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

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// This coordinator's identifier, unique within the deployment (spec §3
    /// "DirectoryEntry.coordinator_id").
    pub coordinator_id: String,

    /// Region this coordinator serves (spec §3 "Session.region").
    pub region: String,

    /// Address the Control, Directory, and InterCoordinator gRPC services
    /// bind to.
    #[serde(default = "Config::bind")]
    pub bind: SocketAddr,

    /// Externally reachable address advertised to the Directory, used by
    /// other coordinators' InterCoordinator clients to reach this one.
    pub advertise_address: String,

    /// Coordinators to register with at startup (see [`PeerCoordinator`]).
    #[serde(default)]
    pub directory_peers: Vec<PeerCoordinator>,

    /// Capacity advertised on every directory registration (spec §4.2
    /// "Candidates" ordering and filtering).
    #[serde(default = "Config::max_capacity")]
    pub max_capacity: u32,

    /// Tokio runtime worker threads. Defaults to the host's core count, same
    /// as the teacher's own `threads` config field.
    #[serde(default = "num_cpus::get")]
    pub worker_threads: usize,

    #[serde(default)]
    pub relay: Option<Relay>,

    #[serde(default)]
    pub reachability: Reachability,

    #[serde(default)]
    pub log: Log,
}

impl Config {
    fn bind() -> SocketAddr {
        "0.0.0.0:7000".parse().unwrap()
    }

    fn max_capacity() -> u32 {
        1000
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
    /// Example: vpnctl-coordinator --config /etc/vpnctl/coordinator.json5
    #[arg(long, short)]
    config: String,
}

impl Config {
    /// Loads configuration from the file named on the command line. There
    /// is no built-in default configuration: `coordinator_id`, `region`, and
    /// `advertise_address` have no safe defaults across a fleet.
    pub fn load() -> Result<Self> {
        let raw = read_to_string(Cli::parse().config)?;
        Ok(serde_json5::from_str(&raw)?)
    }
}
