//! Error types shared across the bridge.

use crate::cancel::Cancelled;
use crate::config::ConfigError;
use std::io;

/// Malformed wire data (protocol-info header, Ethernet header, ARP packet).
///
/// Never fatal to a session: the relay drops the offending frame and keeps
/// forwarding.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FormatError {
    #[error("invalid PI length: {0}")]
    InvalidPiLength(usize),

    #[error("truncated {what}: got {len} bytes, need {needed}")]
    Truncated {
        what: &'static str,
        len: usize,
        needed: usize,
    },

    #[error("bad hardware type: {0}")]
    HardwareType(u16),

    #[error("bad protocol type: {0:#06x}")]
    ProtocolType(u16),

    #[error("bad hardware size: {0}")]
    HardwareSize(u8),

    #[error("bad protocol size: {0}")]
    ProtocolSize(u8),

    #[error("bad opcode: {0}")]
    Opcode(u16),

    #[error("not an ARP frame: EtherType {0:#06x}")]
    NotArp(u16),

    #[error("invalid MAC address: {0}")]
    MacAddr(String),

    #[error("buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },
}

/// Errors that end a single connection attempt.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Cannot protect the tunnel socket")]
    ProtectionDenied,

    #[error("Interface provisioning failed: {0}")]
    Provision(String),

    #[error("Failed to spawn bridge worker: {0}")]
    Spawn(io::Error),

    #[error("Cancelled")]
    Cancelled,
}

impl BridgeError {
    /// Whether this error came from a stop request rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, BridgeError::Cancelled)
    }
}

impl From<Cancelled> for BridgeError {
    fn from(_: Cancelled) -> Self {
        BridgeError::Cancelled
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
