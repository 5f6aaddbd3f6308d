//! tunbridge - TUN-to-Transport Packet Bridge
//!
//! Relays IP packets between a local TUN interface and a remote peer over a
//! single TCP or UDP connection, with an optional 4-byte protocol-info
//! header on every frame.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                        BridgeService                          │
//! │                                                               │
//! │   start/stop ──▶ worker thread "tunbridge-<session>"          │
//! │                   │                                           │
//! │                   ▼                                           │
//! │   ┌────────────┐     ┌────────────────────────────────────┐   │
//! │   │ Supervisor │────▶│            PacketRelay             │   │
//! │   │ (retries)  │     │                                    │   │
//! │   └─────┬──────┘     │  TUN ──add PI──▶ Transport         │   │
//! │         │            │  TUN ◀─strip PI, IPv4 only── Trans │   │
//! │         ▼            └────────────────────────────────────┘   │
//! │   StatusObserver                                              │
//! └───────────────────────────────────────────────────────────────┘
//!                             │
//!                             ▼ TCP / UDP
//!                   ┌───────────────────┐
//!                   │    Remote Peer    │
//!                   └───────────────────┘
//! ```
//!
//! # Capabilities
//!
//! The host platform plugs in through traits:
//!
//! - [`TransportFactory`]: opens the connection to the peer
//! - [`TunProvisioner`]: materializes the TUN interface
//! - [`SocketProtector`]: exempts the transport socket from the tunnel
//! - [`StatusObserver`]: receives connecting/connected/disconnected events
//!
//! Layer-2 helpers ([`ethernet`], [`arp`]) are available for peers that
//! speak Ethernet frames.

pub mod arp;
pub mod ethernet;
pub mod framer;

mod cancel;
mod config;
mod error;
mod relay;
mod service;
mod status;
mod supervisor;
mod transport;
mod tun;

pub use cancel::{cancel_pair, CancelHandle, CancelToken, Cancelled};
pub use config::{
    BridgeConfig, ConfigError, RelaySettings, RemoteEndpoint, Route, TransportKind, TunConfig,
};
pub use error::{BridgeError, FormatError, Result};
pub use ethernet::{EtherType, EthernetHeader, MacAddr};
pub use relay::{PacketRelay, RelayEnd, RelayOutcome, RelayStats, Session, PACKET_BUFFER_SIZE};
pub use service::BridgeService;
pub use status::{LogObserver, StatusEvent, StatusObserver};
pub use supervisor::{Capabilities, Supervisor, SupervisorEnd, SupervisorState, MAX_ATTEMPTS};
pub use transport::{
    is_pending, NetTransportFactory, NoopProtector, RawSocket, SocketProtector, TcpTransport,
    Transport, TransportFactory, UdpTransport,
};
pub use tun::{IoTun, TunDevice, TunProvisioner};
