//! Packet Relay
//!
//! Shuttles packets between a TUN interface and the transport for one
//! session. Both directions are serviced from one control flow with
//! non-blocking reads:
//!
//! ```text
//!   loop {
//!       tun  --read--> [add PI] --write--> transport
//!       transport --read--> [strip PI, drop non-IPv4] --write--> tun
//!       nothing moved? sleep idle_interval (wakes on cancel)
//!   }
//! ```
//!
//! One 32767-byte buffer holds the frame in flight. When the loop ends,
//! for whatever reason, the transport is closed first, then the interface,
//! then the buffer is released.

use crate::cancel::CancelToken;
use crate::framer::{self, PI_HEADER_LEN};
use crate::transport::{is_pending, Transport};
use crate::tun::TunDevice;
use std::io;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Capacity of the packet buffer.
pub const PACKET_BUFFER_SIZE: usize = 32767;

/// The two endpoints of a session, torn down together.
///
/// Dropping a session closes the transport and then the interface, each at
/// most once and ignoring errors. The supervisor creates one as soon as the
/// transport exists so that every early return releases it.
pub struct Session {
    transport: Option<Box<dyn Transport>>,
    tun: Option<Box<dyn TunDevice>>,
}

impl Session {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport: Some(transport),
            tun: None,
        }
    }

    pub fn with_tun(transport: Box<dyn Transport>, tun: Box<dyn TunDevice>) -> Self {
        Self {
            transport: Some(transport),
            tun: Some(tun),
        }
    }

    pub fn transport_mut(&mut self) -> Option<&mut (dyn Transport + 'static)> {
        self.transport.as_deref_mut()
    }

    pub fn attach_tun(&mut self, tun: Box<dyn TunDevice>) {
        if let Some(mut old) = self.tun.replace(tun) {
            let _ = old.close();
        }
    }

    /// Close transport, then interface. Idempotent.
    pub fn close(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            if let Err(e) = transport.close() {
                debug!("Ignoring transport close error: {}", e);
            }
        }
        if let Some(mut tun) = self.tun.take() {
            if let Err(e) = tun.close() {
                debug!("Ignoring interface close error: {}", e);
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

/// Why the loop stopped
#[derive(Debug)]
pub enum RelayEnd {
    /// Stop requested
    Cancelled,
    /// Remote side hung up
    TransportClosed,
    /// Read or write failed on either endpoint
    Io(io::Error),
}

impl RelayEnd {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RelayEnd::Cancelled)
    }
}

/// Relay statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Packets read from the interface and sent to the relay
    pub packets_out: u64,
    /// Bytes of those packets, framing excluded
    pub bytes_out: u64,
    /// Packets received from the relay and injected into the interface
    pub packets_in: u64,
    /// Bytes of those packets, framing excluded
    pub bytes_in: u64,
    /// Frames from the relay that were malformed or not IPv4
    pub dropped: u64,
    /// Idle pauses taken
    pub idle_sleeps: u64,
}

impl RelayStats {
    /// Format as human-readable string
    pub fn format(&self) -> String {
        format!(
            "TX: {:.2}MB ({} pkts), RX: {:.2}MB ({} pkts), dropped: {}, idle: {}",
            self.bytes_out as f64 / (1024.0 * 1024.0),
            self.packets_out,
            self.bytes_in as f64 / (1024.0 * 1024.0),
            self.packets_in,
            self.dropped,
            self.idle_sleeps
        )
    }
}

/// Result of one relay run
#[derive(Debug)]
pub struct RelayOutcome {
    /// The forwarding loop was entered on an established connection
    pub reached_steady_state: bool,
    pub end: RelayEnd,
    pub stats: RelayStats,
}

/// Duplex forwarding loop for one session
pub struct PacketRelay {
    cancel: CancelToken,
    idle_interval: Duration,
    stats: RelayStats,
    reached_steady_state: bool,
}

impl PacketRelay {
    pub fn new(cancel: CancelToken, idle_interval: Duration) -> Self {
        Self {
            cancel,
            idle_interval,
            stats: RelayStats::default(),
            reached_steady_state: false,
        }
    }

    /// Forward until cancelled, until the transport closes, or until an
    /// endpoint fails. Consumes and tears down the session.
    pub fn run(mut self, mut session: Session) -> RelayOutcome {
        let mut buffer = vec![0u8; PACKET_BUFFER_SIZE];

        let end = match (session.transport.as_deref_mut(), session.tun.as_deref_mut()) {
            (Some(transport), Some(tun)) => self.forward(transport, tun, &mut buffer),
            _ => RelayEnd::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                "session is missing an endpoint",
            )),
        };

        match &end {
            RelayEnd::Cancelled => info!("Relay cancelled"),
            RelayEnd::TransportClosed => info!("Relay ended: transport closed by peer"),
            RelayEnd::Io(e) => warn!("Relay ended: {}", e),
        }
        debug!("Relay stats: {}", self.stats.format());

        drop(session);
        drop(buffer);

        RelayOutcome {
            reached_steady_state: self.reached_steady_state,
            end,
            stats: self.stats,
        }
    }

    fn forward(
        &mut self,
        transport: &mut dyn Transport,
        tun: &mut dyn TunDevice,
        buffer: &mut [u8],
    ) -> RelayEnd {
        let framing = tun.framing_enabled();
        // Leave room to shift the packet forward for its header.
        let tun_room = if framing {
            buffer.len() - PI_HEADER_LEN
        } else {
            buffer.len()
        };

        loop {
            if self.cancel.is_cancelled() {
                return RelayEnd::Cancelled;
            }
            self.reached_steady_state = true;
            let mut idle = true;

            // Interface -> relay
            match tun.read(&mut buffer[..tun_room]) {
                Ok(0) => {}
                Ok(length) => {
                    let frame_len = if framing {
                        match framer::add_in_place(buffer, length) {
                            Ok(len) => len,
                            Err(e) => {
                                return RelayEnd::Io(io::Error::new(io::ErrorKind::InvalidData, e));
                            }
                        }
                    } else {
                        length
                    };
                    if let Err(e) = transport.write(&buffer[..frame_len], &self.cancel) {
                        // A write parked on a full send buffer gives up on cancel.
                        if self.cancel.is_cancelled() {
                            return RelayEnd::Cancelled;
                        }
                        return RelayEnd::Io(e);
                    }
                    self.stats.packets_out += 1;
                    self.stats.bytes_out += length as u64;
                    idle = false;
                }
                Err(e) if is_pending(&e) => {}
                Err(e) => return RelayEnd::Io(e),
            }

            // Relay -> interface
            match transport.read(buffer) {
                Ok(0) => return RelayEnd::TransportClosed,
                Ok(length) => {
                    if let Err(e) = self.deliver(tun, &buffer[..length], framing) {
                        return RelayEnd::Io(e);
                    }
                    idle = false;
                }
                Err(e) if is_pending(&e) => {}
                Err(e) => return RelayEnd::Io(e),
            }

            if idle {
                self.stats.idle_sleeps += 1;
                if self.cancel.sleep(self.idle_interval).is_err() {
                    return RelayEnd::Cancelled;
                }
            }
        }
    }

    /// Write one frame from the relay into the interface, dropping it when
    /// its header is malformed or it is not IPv4.
    fn deliver(&mut self, tun: &mut dyn TunDevice, frame: &[u8], framing: bool) -> io::Result<()> {
        let packet = if framing {
            match framer::strip(frame) {
                Ok(stripped) if stripped.is_ipv4() => stripped.payload,
                Ok(stripped) => {
                    debug!("PI: dropped non-IP proto: {:#06x}", stripped.info.protocol);
                    self.stats.dropped += 1;
                    return Ok(());
                }
                Err(e) => {
                    info!("PI: dropped packet: {}", e);
                    self.stats.dropped += 1;
                    return Ok(());
                }
            }
        } else {
            frame
        };

        tun.write(packet)?;
        self.stats.packets_in += 1;
        self.stats.bytes_in += packet.len() as u64;
        Ok(())
    }
}
