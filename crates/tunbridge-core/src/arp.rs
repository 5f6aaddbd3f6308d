//! ARP request/reply codec
//!
//! L3 packet layout (28 bytes, big-endian):
//!
//! ```text
//!  0      2      4    5    6      8          14       18         24       28
//!  +------+------+----+----+------+----------+--------+----------+--------+
//!  | htype| ptype|hlen|plen|  op  | sha      | spa    | tha      | tpa    |
//!  |  1   |0x0800|  6 |  4 | 1/2  | (6)      | (4)    | (6)      | (4)    |
//!  +------+------+----+----+------+----------+--------+----------+--------+
//! ```
//!
//! [`parse`] only understands the L3 packet; strip the 14-byte Ethernet
//! header first (or use [`parse_frame`]).

use crate::error::FormatError;
use crate::ethernet::{EtherType, EthernetHeader, MacAddr, ETHERNET_HEADER_LEN};
use std::net::Ipv4Addr;

/// Size of an L3 ARP packet for Ethernet/IPv4.
pub const ARP_PACKET_LEN: usize = 28;

/// Size of a full ARP frame (Ethernet header + ARP packet).
pub const ARP_FRAME_LEN: usize = ETHERNET_HEADER_LEN + ARP_PACKET_LEN;

const HARDWARE_TYPE_ETHERNET: u16 = 1;
const PROTOCOL_TYPE_IPV4: u16 = 0x0800;
const HARDWARE_SIZE: u8 = 6;
const PROTOCOL_SIZE: u8 = 4;

/// ARP opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ArpOperation {
    Request = 1,
    Reply = 2,
}

impl TryFrom<u16> for ArpOperation {
    type Error = FormatError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Request),
            2 => Ok(Self::Reply),
            other => Err(FormatError::Opcode(other)),
        }
    }
}

/// "Who has `target_ip`? Tell `sender_ip`."
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpRequest {
    pub sender_mac: MacAddr,
    pub sender_ip: Ipv4Addr,
    pub target_mac: MacAddr,
    pub target_ip: Ipv4Addr,
}

impl ArpRequest {
    pub fn requester_mac(&self) -> MacAddr {
        self.sender_mac
    }

    pub fn requester_ip(&self) -> Ipv4Addr {
        self.sender_ip
    }

    /// The address whose owner is being looked for.
    pub fn requested_ip(&self) -> Ipv4Addr {
        self.target_ip
    }
}

/// "`sender_ip` is at `sender_mac`."
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpReply {
    pub sender_mac: MacAddr,
    pub sender_ip: Ipv4Addr,
    pub target_mac: MacAddr,
    pub target_ip: Ipv4Addr,
}

impl ArpReply {
    pub fn replier_mac(&self) -> MacAddr {
        self.sender_mac
    }

    pub fn replier_ip(&self) -> Ipv4Addr {
        self.sender_ip
    }
}

/// A validated ARP packet. The variant is the opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArpPacket {
    Request(ArpRequest),
    Reply(ArpReply),
}

impl ArpPacket {
    /// Build a packet from a raw opcode, rejecting anything but request/reply.
    pub fn from_parts(
        opcode: u16,
        sender_mac: MacAddr,
        sender_ip: Ipv4Addr,
        target_mac: MacAddr,
        target_ip: Ipv4Addr,
    ) -> Result<Self, FormatError> {
        Ok(match ArpOperation::try_from(opcode)? {
            ArpOperation::Request => Self::Request(ArpRequest {
                sender_mac,
                sender_ip,
                target_mac,
                target_ip,
            }),
            ArpOperation::Reply => Self::Reply(ArpReply {
                sender_mac,
                sender_ip,
                target_mac,
                target_ip,
            }),
        })
    }

    /// Parse an L3 ARP packet (no Ethernet header).
    ///
    /// Fixed fields are checked in wire order; the first mismatch is
    /// reported with the value that was seen.
    pub fn parse(packet: &[u8]) -> Result<Self, FormatError> {
        if packet.len() < ARP_PACKET_LEN {
            return Err(FormatError::Truncated {
                what: "ARP packet",
                len: packet.len(),
                needed: ARP_PACKET_LEN,
            });
        }

        let hardware_type = u16::from_be_bytes([packet[0], packet[1]]);
        let protocol_type = u16::from_be_bytes([packet[2], packet[3]]);
        let hardware_size = packet[4];
        let protocol_size = packet[5];
        let opcode = u16::from_be_bytes([packet[6], packet[7]]);

        if hardware_type != HARDWARE_TYPE_ETHERNET {
            return Err(FormatError::HardwareType(hardware_type));
        }
        if protocol_type != PROTOCOL_TYPE_IPV4 {
            return Err(FormatError::ProtocolType(protocol_type));
        }
        if hardware_size != HARDWARE_SIZE {
            return Err(FormatError::HardwareSize(hardware_size));
        }
        if protocol_size != PROTOCOL_SIZE {
            return Err(FormatError::ProtocolSize(protocol_size));
        }

        Self::from_parts(
            opcode,
            read_mac(&packet[8..14]),
            read_ip(&packet[14..18]),
            read_mac(&packet[18..24]),
            read_ip(&packet[24..28]),
        )
    }

    pub fn operation(&self) -> ArpOperation {
        match self {
            Self::Request(_) => ArpOperation::Request,
            Self::Reply(_) => ArpOperation::Reply,
        }
    }

    pub fn opcode(&self) -> u16 {
        self.operation() as u16
    }

    pub fn sender_mac(&self) -> MacAddr {
        match self {
            Self::Request(r) => r.sender_mac,
            Self::Reply(r) => r.sender_mac,
        }
    }

    pub fn sender_ip(&self) -> Ipv4Addr {
        match self {
            Self::Request(r) => r.sender_ip,
            Self::Reply(r) => r.sender_ip,
        }
    }

    pub fn target_mac(&self) -> MacAddr {
        match self {
            Self::Request(r) => r.target_mac,
            Self::Reply(r) => r.target_mac,
        }
    }

    pub fn target_ip(&self) -> Ipv4Addr {
        match self {
            Self::Request(r) => r.target_ip,
            Self::Reply(r) => r.target_ip,
        }
    }

    /// Encode to the 28-byte L3 form.
    pub fn encode(&self) -> [u8; ARP_PACKET_LEN] {
        let mut packet = [0u8; ARP_PACKET_LEN];
        packet[0..2].copy_from_slice(&HARDWARE_TYPE_ETHERNET.to_be_bytes());
        packet[2..4].copy_from_slice(&PROTOCOL_TYPE_IPV4.to_be_bytes());
        packet[4] = HARDWARE_SIZE;
        packet[5] = PROTOCOL_SIZE;
        packet[6..8].copy_from_slice(&self.opcode().to_be_bytes());
        packet[8..14].copy_from_slice(&self.sender_mac().0);
        packet[14..18].copy_from_slice(&self.sender_ip().octets());
        packet[18..24].copy_from_slice(&self.target_mac().0);
        packet[24..28].copy_from_slice(&self.target_ip().octets());
        packet
    }

    /// Encode as a full L2 frame addressed from the sender to the target MAC.
    pub fn to_frame(&self) -> Vec<u8> {
        EthernetHeader::new(self.target_mac(), self.sender_mac(), EtherType::Arp)
            .prepend(&self.encode())
    }
}

fn read_mac(bytes: &[u8]) -> MacAddr {
    let mut mac = [0u8; 6];
    mac.copy_from_slice(bytes);
    MacAddr(mac)
}

fn read_ip(bytes: &[u8]) -> Ipv4Addr {
    Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3])
}

/// Parse an L3 ARP packet. See [`ArpPacket::parse`].
pub fn parse(packet: &[u8]) -> Result<ArpPacket, FormatError> {
    ArpPacket::parse(packet)
}

/// Parse a full L2 frame, checking that it carries ARP.
pub fn parse_frame(frame: &[u8]) -> Result<(EthernetHeader, ArpPacket), FormatError> {
    let (header, payload) = EthernetHeader::parse(frame)?;
    if header.ether_type != EtherType::Arp {
        return Err(FormatError::NotArp(header.ether_type.to_u16()));
    }
    Ok((header, ArpPacket::parse(payload)?))
}

/// Broadcast "who has `target_ip`" from `local_mac`/`local_ip`.
pub fn create_request_frame(
    local_mac: MacAddr,
    local_ip: Ipv4Addr,
    target_ip: Ipv4Addr,
) -> Vec<u8> {
    ArpPacket::Request(ArpRequest {
        sender_mac: local_mac,
        sender_ip: local_ip,
        target_mac: MacAddr::BROADCAST,
        target_ip,
    })
    .to_frame()
}

/// Answer `request`, claiming the requested address for `local_mac`.
pub fn create_response_frame(local_mac: MacAddr, request: &ArpRequest) -> Vec<u8> {
    ArpPacket::Reply(ArpReply {
        sender_mac: local_mac,
        sender_ip: request.requested_ip(),
        target_mac: request.requester_mac(),
        target_ip: request.requester_ip(),
    })
    .to_frame()
}
