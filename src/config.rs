use std::{
    fs::read_to_string,
    net::{IpAddr, SocketAddr},
    str::FromStr,
};

use anyhow::Result;
use clap::Parser;
use codec::{address::PeerAddress, id::Id160};
use serde::Deserialize;

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Network {
    ///
    /// Overlay network identifier shared by every peer on the same overlay;
    /// messages from other overlays are dropped.
    ///
    #[serde(default = "Network::version")]
    pub version: u32,
    ///
    /// TCP listen address.
    ///
    #[serde(default = "Network::listen")]
    pub tcp_listen: SocketAddr,
    ///
    /// UDP listen address.
    ///
    #[serde(default = "Network::listen")]
    pub udp_listen: SocketAddr,
    ///
    /// Externally visible IP address.
    ///
    /// For the case of exposing the node through a NAT with manual port
    /// forwarding, specify the external address here; otherwise it is
    /// discovered from the bound interfaces.
    ///
    #[serde(default)]
    pub external_ip: Option<IpAddr>,
    ///
    /// Externally mapped ports, when they differ from the bound ones.
    ///
    #[serde(default)]
    pub external_tcp_port: Option<u16>,
    #[serde(default)]
    pub external_udp_port: Option<u16>,
    ///
    /// Whether this node sits behind a firewall or NAT without port
    /// forwarding. A firewalled node rents relay connectivity instead of
    /// offering it.
    ///
    #[serde(default)]
    pub firewalled: bool,
    ///
    /// Maximum Transmission Unit (MTU) size for network packets.
    ///
    #[serde(default = "Network::mtu")]
    pub mtu: usize,
    ///
    /// Well-known peers used to join the overlay.
    ///
    #[serde(default)]
    pub bootstrap: Vec<PeerEntry>,
}

impl Network {
    fn version() -> u32 {
        1
    }

    fn listen() -> SocketAddr {
        "0.0.0.0:7700".parse().unwrap()
    }

    fn mtu() -> usize {
        1500
    }
}

impl Default for Network {
    fn default() -> Self {
        Self {
            version: Self::version(),
            tcp_listen: Self::listen(),
            udp_listen: Self::listen(),
            external_ip: None,
            external_tcp_port: None,
            external_udp_port: None,
            firewalled: false,
            mtu: Self::mtu(),
            bootstrap: Vec::new(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Runtime {
    ///
    /// Maximum number of threads the node can use.
    ///
    #[serde(default = "Runtime::max_threads")]
    pub max_threads: usize,
    ///
    /// Upper bound on requests in flight.
    ///
    #[serde(default = "Runtime::reservations")]
    pub reservations: usize,
    ///
    /// Seconds a request waits for its response.
    ///
    #[serde(default = "Runtime::timeout")]
    pub timeout: u64,
    ///
    /// Liveness interval in seconds.
    ///
    #[serde(default = "Runtime::heartbeat")]
    pub heartbeat: u64,
}

impl Runtime {
    fn max_threads() -> usize {
        num_cpus::get()
    }

    fn reservations() -> usize {
        64
    }

    fn timeout() -> u64 {
        5
    }

    fn heartbeat() -> u64 {
        30
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self {
            max_threads: Self::max_threads(),
            reservations: Self::reservations(),
            timeout: Self::timeout(),
            heartbeat: Self::heartbeat(),
        }
    }
}

/// One peer in a configured list: identity plus transport coordinates.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct PeerEntry {
    pub id: String,
    pub ip: IpAddr,
    pub tcp_port: u16,
    pub udp_port: u16,
}

impl PeerEntry {
    pub fn to_address(&self) -> Result<PeerAddress> {
        Ok(PeerAddress::new(
            Id160::from_hex(&self.id)?,
            self.ip,
            self.tcp_port,
            self.udp_port,
        ))
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Relay {
    ///
    /// Target number of live relay connections for a firewalled node.
    ///
    #[serde(default = "Relay::max_relays")]
    pub max_relays: usize,
    ///
    /// Seconds a failed relay candidate stays quarantined.
    ///
    #[serde(default = "Relay::failure_ttl")]
    pub failure_ttl: u64,
    ///
    /// Use these relays instead of asking the routing layer; failures are
    /// retried, the list is never filtered.
    ///
    #[serde(default)]
    pub manual_relays: Vec<PeerEntry>,
    ///
    /// Advertise the relayed address as slow.
    ///
    #[serde(default)]
    pub slow: bool,
    ///
    /// How many firewalled peers this node is willing to relay for when it
    /// is itself reachable.
    ///
    #[serde(default = "Relay::max_clients")]
    pub max_clients: usize,
}

impl Relay {
    fn max_relays() -> usize {
        codec::address::MAX_RELAYS
    }

    fn failure_ttl() -> u64 {
        60
    }

    fn max_clients() -> usize {
        32
    }
}

impl Default for Relay {
    fn default() -> Self {
        Self {
            max_relays: Self::max_relays(),
            failure_ttl: Self::failure_ttl(),
            manual_relays: Vec::new(),
            slow: false,
            max_clients: Self::max_clients(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value {
            "trace" => Self::Trace,
            "debug" => Self::Debug,
            "info" => Self::Info,
            "warn" => Self::Warn,
            "error" => Self::Error,
            _ => return Err(format!("unknown log level: {value}")),
        })
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match *self {
            Self::Error => log::Level::Error,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
        }
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Log {
    ///
    /// log level
    ///
    /// An enum representing the available verbosity levels of the logger.
    ///
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub network: Network,
    #[serde(default)]
    pub runtime: Runtime,
    #[serde(default)]
    pub relay: Relay,
    #[serde(default)]
    pub log: Log,
}

#[derive(Parser, Debug)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    ///
    /// Specify the configuration file path
    ///
    /// Example: dht-node --config /etc/dht-node/config.toml
    ///
    #[arg(long, short)]
    config: Option<String>,
}

impl Config {
    ///
    /// Load configure from config file and command line parameters.
    ///
    /// Load command line parameters, if the configuration file path is
    /// specified, the configuration is read from the configuration file,
    /// otherwise the default configuration is used.
    ///
    pub fn load() -> Result<Self> {
        Ok(match Cli::parse().config {
            Some(path) => toml::from_str::<Self>(&read_to_string(&path)?)?,
            None => Self::default(),
        })
    }
}
