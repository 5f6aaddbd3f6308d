//! Bridge Configuration
//!
//! Structured form of a bridge session: where the relay lives, whether the
//! protocol-info header is in use, and how the TUN interface should look.
//! Loaded from TOML:
//!
//! ```toml
//! session_name = "lab"
//! packet_info = true
//!
//! [remote]
//! host = "relay.example.net"
//! port = 7777
//! kind = "tcp"
//!
//! [tun]
//! address = "10.0.0.2"
//! prefix_len = 24
//! mtu = 1400
//! routes = [{ address = "0.0.0.0", prefix_len = 0 }]
//! dns = ["10.0.0.1"]
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

/// Wire used to reach the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Stream socket, one packet per read/write
    #[default]
    Tcp,
    /// One packet per datagram
    Udp,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Tcp => write!(f, "tcp"),
            TransportKind::Udp => write!(f, "udp"),
        }
    }
}

/// Remote relay endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEndpoint {
    /// Hostname or IP literal
    pub host: String,
    /// Port
    pub port: u16,
    /// Transport
    #[serde(default)]
    pub kind: TransportKind,
}

impl RemoteEndpoint {
    pub fn new(host: impl Into<String>, port: u16, kind: TransportKind) -> Self {
        Self {
            host: host.into(),
            port,
            kind,
        }
    }

    /// `host:port`, suitable for `ToSocketAddrs`.
    pub fn authority(&self) -> String {
        match self.host.parse::<IpAddr>() {
            Ok(IpAddr::V6(v6)) => format!("[{}]:{}", v6, self.port),
            _ => format!("{}:{}", self.host, self.port),
        }
    }
}

impl fmt::Display for RemoteEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.kind, self.authority())
    }
}

/// A route pushed into the interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub address: IpAddr,
    pub prefix_len: u8,
}

impl Route {
    pub fn new(address: IpAddr, prefix_len: u8) -> Self {
        Self {
            address,
            prefix_len,
        }
    }

    /// 0.0.0.0/0
    pub fn default_v4() -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

/// Parameters handed to the TUN provisioner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunConfig {
    /// Interface name; the platform picks one when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Local address of the interface
    pub address: IpAddr,
    /// Prefix length of `address`
    #[serde(default = "default_prefix_len")]
    pub prefix_len: u8,
    /// Interface MTU
    #[serde(default = "default_mtu")]
    pub mtu: u16,
    /// DNS servers for the session
    #[serde(default)]
    pub dns: Vec<IpAddr>,
    /// Routes to send through the interface
    #[serde(default)]
    pub routes: Vec<Route>,
}

fn default_prefix_len() -> u8 {
    32
}

fn default_mtu() -> u16 {
    1500
}

impl Default for TunConfig {
    fn default() -> Self {
        Self {
            name: None,
            address: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            prefix_len: default_prefix_len(),
            mtu: default_mtu(),
            dns: Vec::new(),
            routes: vec![Route::default_v4()],
        }
    }
}

/// Loop timing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    /// Pause when neither side had data
    pub idle_interval_ms: u64,
    /// Pause between connection attempts
    pub retry_delay_ms: u64,
}

impl RelaySettings {
    pub fn idle_interval(&self) -> Duration {
        Duration::from_millis(self.idle_interval_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            idle_interval_ms: 30,
            retry_delay_ms: 3000,
        }
    }
}

/// Complete bridge configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Session label shown by the platform
    pub session_name: String,
    /// Prefix every frame on the transport with a protocol-info header
    #[serde(default)]
    pub packet_info: bool,
    /// Relay endpoint
    pub remote: RemoteEndpoint,
    /// Interface parameters
    #[serde(default)]
    pub tun: TunConfig,
    /// Loop timing
    #[serde(default)]
    pub relay: RelaySettings,
}

impl BridgeConfig {
    /// Configuration with default interface and timing
    pub fn new(session_name: impl Into<String>, remote: RemoteEndpoint) -> Self {
        Self {
            session_name: session_name.into(),
            packet_info: false,
            remote,
            tun: TunConfig::default(),
            relay: RelaySettings::default(),
        }
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&source)
    }

    /// Serialize back to TOML
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session_name.trim().is_empty() {
            return Err(ConfigError::EmptySessionName);
        }
        if self.remote.host.trim().is_empty() {
            return Err(ConfigError::EmptyHost);
        }
        if self.remote.port == 0 {
            return Err(ConfigError::InvalidPort);
        }
        if self.tun.mtu < 68 {
            return Err(ConfigError::InvalidMtu(self.tun.mtu));
        }
        check_prefix(self.tun.address, self.tun.prefix_len)?;
        for route in &self.tun.routes {
            check_prefix(route.address, route.prefix_len)?;
        }
        Ok(())
    }
}

fn check_prefix(address: IpAddr, prefix_len: u8) -> Result<(), ConfigError> {
    let max = match address {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    };
    if prefix_len > max {
        return Err(ConfigError::InvalidPrefix {
            address,
            prefix_len,
        });
    }
    Ok(())
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self::new(
            "tunbridge",
            RemoteEndpoint::new("127.0.0.1", 7777, TransportKind::Tcp),
        )
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid remote port")]
    InvalidPort,

    #[error("Remote host is empty")]
    EmptyHost,

    #[error("Session name is empty")]
    EmptySessionName,

    #[error("MTU too small: {0} (minimum 68)")]
    InvalidMtu(u16),

    #[error("Invalid prefix length {prefix_len} for {address}")]
    InvalidPrefix { address: IpAddr, prefix_len: u8 },

    #[error("Cannot parse configuration: {0}")]
    Parse(String),

    #[error("Cannot read configuration: {0}")]
    Read(String),
}
