//! Protocol-info framing
//!
//! Some TUN transports prefix every packet with the kernel's `struct tun_pi`:
//!
//! ```text
//!  0       2       4
//!  +-------+-------+----------------
//!  | flags | proto |  IP packet ...
//!  +-------+-------+----------------
//! ```
//!
//! Both fields are big-endian. Only IPv4 (`proto == 0x0800`) is forwarded
//! into the interface.

use crate::error::FormatError;
use tracing::warn;

/// Size of the protocol-info header.
pub const PI_HEADER_LEN: usize = 4;

/// `ETH_P_IP`
pub const PROTO_IPV4: u16 = 0x0800;

/// Decoded protocol-info header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolInfo {
    pub flags: u16,
    pub protocol: u16,
}

impl ProtocolInfo {
    /// Header written in front of every outgoing packet.
    pub const IPV4: Self = Self {
        flags: 0,
        protocol: PROTO_IPV4,
    };

    /// Read the header from the first four bytes of `frame`.
    pub fn parse(frame: &[u8]) -> Result<Self, FormatError> {
        if frame.len() < PI_HEADER_LEN {
            return Err(FormatError::InvalidPiLength(frame.len()));
        }
        Ok(Self {
            flags: u16::from_be_bytes([frame[0], frame[1]]),
            protocol: u16::from_be_bytes([frame[2], frame[3]]),
        })
    }

    pub fn to_bytes(&self) -> [u8; PI_HEADER_LEN] {
        let flags = self.flags.to_be_bytes();
        let proto = self.protocol.to_be_bytes();
        [flags[0], flags[1], proto[0], proto[1]]
    }

    pub fn is_ipv4(&self) -> bool {
        self.protocol == PROTO_IPV4
    }
}

/// A frame with its protocol-info header removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stripped<'a> {
    pub info: ProtocolInfo,
    pub payload: &'a [u8],
}

impl Stripped<'_> {
    /// Only IPv4 payloads may be written to the interface.
    pub fn is_ipv4(&self) -> bool {
        self.info.is_ipv4()
    }
}

/// Remove the protocol-info header from a frame received from the transport.
///
/// Non-zero flags are logged and otherwise ignored. A non-IPv4 protocol is
/// reported through [`Stripped::is_ipv4`]; dropping the frame is up to the
/// caller.
pub fn strip(frame: &[u8]) -> Result<Stripped<'_>, FormatError> {
    let info = ProtocolInfo::parse(frame)?;
    if info.flags != 0 {
        warn!("PI: received non-zero flags: {:#06x}", info.flags);
    }
    Ok(Stripped {
        info,
        payload: &frame[PI_HEADER_LEN..],
    })
}

/// Prefix `payload` with an IPv4 protocol-info header.
pub fn add(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(PI_HEADER_LEN + payload.len());
    frame.extend_from_slice(&ProtocolInfo::IPV4.to_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Prefix the first `len` bytes of `buf` with an IPv4 protocol-info header,
/// shifting the packet forward by four bytes. Returns the new frame length.
pub fn add_in_place(buf: &mut [u8], len: usize) -> Result<usize, FormatError> {
    let framed = len + PI_HEADER_LEN;
    if buf.len() < framed {
        return Err(FormatError::BufferTooSmall {
            needed: framed,
            available: buf.len(),
        });
    }
    buf.copy_within(..len, PI_HEADER_LEN);
    buf[..PI_HEADER_LEN].copy_from_slice(&ProtocolInfo::IPV4.to_bytes());
    Ok(framed)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PACKET: &[u8] = &[0x45, 0x00, 0x00, 0x1c, 0xde, 0xad, 0xbe, 0xef];

    #[test]
    fn test_add_prepends_ipv4_header() {
        let frame = add(PACKET);
        assert_eq!(frame.len(), PACKET.len() + 4);
        assert_eq!(&frame[..4], &[0x00, 0x00, 0x08, 0x00]);
        assert_eq!(&frame[4..], PACKET);
    }

    #[test]
    fn test_strip_inverts_add() {
        for len in [0usize, 1, 20, 1500] {
            let payload: Vec<u8> = (0..len).map(|i| i as u8).collect();
            let frame = add(&payload);
            let stripped = strip(&frame).unwrap();
            assert!(stripped.is_ipv4());
            assert_eq!(stripped.info.flags, 0);
            assert_eq!(stripped.payload, payload.as_slice());
        }
    }

    #[test]
    fn test_strip_returns_tail() {
        let frame = [0x00, 0x01, 0x86, 0xdd, 1, 2, 3];
        let stripped = strip(&frame).unwrap();
        assert_eq!(stripped.payload, &[1, 2, 3]);
        assert_eq!(stripped.info.flags, 1);
        assert_eq!(stripped.info.protocol, 0x86dd);
        assert!(!stripped.is_ipv4());

        // A bare header is a valid, empty frame.
        let stripped = strip(&[0, 0, 0x08, 0x00]).unwrap();
        assert!(stripped.payload.is_empty());
    }

    #[test]
    fn test_strip_rejects_short_frames() {
        for len in 0..PI_HEADER_LEN {
            let frame = vec![0u8; len];
            assert_eq!(strip(&frame), Err(FormatError::InvalidPiLength(len)));
        }
    }

    #[test]
    fn test_add_in_place_shifts_payload() {
        let mut buf = [0u8; 16];
        buf[..PACKET.len()].copy_from_slice(PACKET);

        let len = add_in_place(&mut buf, PACKET.len()).unwrap();

        assert_eq!(len, PACKET.len() + 4);
        assert_eq!(&buf[..len], add(PACKET).as_slice());
    }

    #[test]
    fn test_add_in_place_needs_room() {
        let mut buf = [0u8; 6];
        assert_eq!(
            add_in_place(&mut buf, 4),
            Err(FormatError::BufferTooSmall {
                needed: 8,
                available: 6
            })
        );
    }
}
