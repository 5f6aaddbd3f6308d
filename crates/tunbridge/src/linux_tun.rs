//! Kernel TUN interface provisioning.

use std::net::{IpAddr, Ipv4Addr};
use tracing::{info, warn};
use tunbridge_core::{BridgeConfig, BridgeError, IoTun, TunDevice, TunProvisioner};

/// Creates a layer-3 TUN interface per session.
///
/// Routes and DNS servers are only logged; installing them is left to the
/// system's network configuration.
#[derive(Debug, Default)]
pub struct LinuxTunProvisioner;

impl TunProvisioner for LinuxTunProvisioner {
    fn establish(&self, config: &BridgeConfig) -> Result<Box<dyn TunDevice>, BridgeError> {
        let IpAddr::V4(address) = config.tun.address else {
            return Err(BridgeError::Provision(format!(
                "IPv6 interface address {} is not supported",
                config.tun.address
            )));
        };

        let mut tun_config = tun::Configuration::default();
        tun_config
            .layer(tun::Layer::L3)
            .address(address)
            .netmask(netmask(config.tun.prefix_len))
            .mtu(i32::from(config.tun.mtu))
            .up();
        if let Some(name) = &config.tun.name {
            tun_config.name(name);
        }
        tun_config.platform(|platform| {
            // Framing on the transport is handled by the relay.
            platform.packet_information(false);
        });

        let device = tun::create(&tun_config)
            .map_err(|e| BridgeError::Provision(format!("failed to create interface: {}", e)))?;
        device.set_nonblock()?;

        info!(
            "Interface up: {}/{} mtu {}",
            address, config.tun.prefix_len, config.tun.mtu
        );
        for route in &config.tun.routes {
            warn!("Route {} not applied", route);
        }
        for server in &config.tun.dns {
            warn!("DNS server {} not applied", server);
        }

        Ok(Box::new(IoTun::new(device, config.packet_info)))
    }
}

/// Dotted netmask for a prefix length.
fn netmask(prefix_len: u8) -> Ipv4Addr {
    let bits = u32::MAX
        .checked_shl(32 - u32::from(prefix_len.min(32)))
        .unwrap_or(0);
    Ipv4Addr::from(bits)
}
