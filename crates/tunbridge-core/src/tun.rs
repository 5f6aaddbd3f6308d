//! TUN endpoint seam
//!
//! Creating and configuring the interface is a platform service; the bridge
//! only needs something it can read packets from and write packets to, plus
//! a way to ask the platform for one.

use crate::config::BridgeConfig;
use crate::error::BridgeError;
use std::io::{self, Read, Write};

/// A provisioned TUN interface.
pub trait TunDevice: Send {
    /// Read one outgoing packet. `Ok(0)` or `WouldBlock` when nothing is queued.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Inject one packet into the interface.
    fn write(&mut self, packet: &[u8]) -> io::Result<()>;

    /// Release the interface. Called at most once by the relay.
    fn close(&mut self) -> io::Result<()>;

    /// Whether frames on the transport carry a protocol-info header.
    /// Fixed when the interface is provisioned.
    fn framing_enabled(&self) -> bool;
}

/// Materializes a TUN interface for a session.
///
/// Implementations get the full session configuration: name, address,
/// routes, DNS, MTU and the framing flag.
pub trait TunProvisioner: Send + Sync {
    fn establish(&self, config: &BridgeConfig) -> Result<Box<dyn TunDevice>, BridgeError>;
}

/// Any packet-oriented `Read + Write` handle (a TUN file descriptor, a
/// device from a platform crate) as a [`TunDevice`].
pub struct IoTun<D> {
    device: Option<D>,
    framing: bool,
}

impl<D: Read + Write + Send> IoTun<D> {
    pub fn new(device: D, framing: bool) -> Self {
        Self {
            device: Some(device),
            framing,
        }
    }

    fn device(&mut self) -> io::Result<&mut D> {
        self.device
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "interface closed"))
    }
}

impl<D: Read + Write + Send> TunDevice for IoTun<D> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.device()?.read(buf)
    }

    fn write(&mut self, packet: &[u8]) -> io::Result<()> {
        // One write per packet; a TUN device never accepts half a packet.
        let written = self.device()?.write(packet)?;
        if written != packet.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short write to interface: {} of {}", written, packet.len()),
            ));
        }
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        if let Some(mut device) = self.device.take() {
            device.flush()?;
        }
        Ok(())
    }

    fn framing_enabled(&self) -> bool {
        self.framing
    }
}
