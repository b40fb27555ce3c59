//! Packets carried over a transport.
//!
//! ```text
//! | type (1) | route id (u32 BE) | size (u16 BE) | payload (size) |
//! ```

use std::fmt;
use std::io;

use thiserror::Error;

use crate::core::Duplex;

/// Length of the packet header.
pub const PACKET_HEADER_SIZE: usize = 7;

/// Packet codec errors.
#[derive(Debug, Error)]
pub enum PacketError {
    /// The type byte is not a known packet type.
    #[error("unknown packet type {0:#04x}")]
    UnknownType(u8),

    /// The payload does not fit the u16 size field.
    #[error("payload of {0} bytes is too large")]
    PayloadTooLarge(usize),

    /// The buffer is shorter than its header claims.
    #[error("packet truncated: need {need} bytes, have {have}")]
    Truncated {
        /// Bytes the header requires.
        need: usize,
        /// Bytes available.
        have: usize,
    },

    /// I/O error while reading or writing.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Kind of a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Application data for a route.
    Data = 0x0,
    /// Closes a route; the payload is one reason byte.
    Close = 0x1,
    /// Keeps a route alive.
    KeepAlive = 0x2,
}

impl PacketType {
    /// Parse a type byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x0 => Some(Self::Data),
            0x1 => Some(Self::Close),
            0x2 => Some(Self::KeepAlive),
            _ => None,
        }
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Data => "DataPacket",
            Self::Close => "ClosePacket",
            Self::KeepAlive => "KeepAlivePacket",
        })
    }
}

/// One encoded packet.
#[derive(Clone, PartialEq, Eq)]
pub struct Packet {
    bytes: Vec<u8>,
}

impl Packet {
    fn encode(ty: PacketType, route_id: u32, size: u16, payload: &[u8]) -> Self {
        let mut bytes = Vec::with_capacity(PACKET_HEADER_SIZE + payload.len());
        bytes.push(ty as u8);
        bytes.extend_from_slice(&route_id.to_be_bytes());
        bytes.extend_from_slice(&size.to_be_bytes());
        bytes.extend_from_slice(payload);
        Self { bytes }
    }

    /// A data packet for `route_id`.
    pub fn data(route_id: u32, payload: &[u8]) -> Result<Self, PacketError> {
        let size = u16::try_from(payload.len())
            .map_err(|_| PacketError::PayloadTooLarge(payload.len()))?;
        Ok(Self::encode(PacketType::Data, route_id, size, payload))
    }

    /// A close packet for `route_id`.
    pub fn close(route_id: u32, code: u8) -> Self {
        Self::encode(PacketType::Close, route_id, 1, &[code])
    }

    /// A keep-alive packet for `route_id`.
    pub fn keep_alive(route_id: u32) -> Self {
        Self::encode(PacketType::KeepAlive, route_id, 0, &[])
    }

    /// Decode one packet from `bytes`, which must hold exactly one.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, PacketError> {
        if bytes.len() < PACKET_HEADER_SIZE {
            return Err(PacketError::Truncated {
                need: PACKET_HEADER_SIZE,
                have: bytes.len(),
            });
        }
        PacketType::from_byte(bytes[0]).ok_or(PacketError::UnknownType(bytes[0]))?;
        let need = PACKET_HEADER_SIZE + u16::from_be_bytes([bytes[5], bytes[6]]) as usize;
        if bytes.len() != need {
            return Err(PacketError::Truncated {
                need,
                have: bytes.len(),
            });
        }
        Ok(Self { bytes })
    }

    /// Read one packet from `io`.
    pub async fn read_from<D: Duplex + ?Sized>(io: &D) -> Result<Self, PacketError> {
        let mut header = [0u8; PACKET_HEADER_SIZE];
        io.read_exact(&mut header).await?;
        PacketType::from_byte(header[0]).ok_or(PacketError::UnknownType(header[0]))?;
        let size = u16::from_be_bytes([header[5], header[6]]) as usize;
        let mut bytes = vec![0u8; PACKET_HEADER_SIZE + size];
        bytes[..PACKET_HEADER_SIZE].copy_from_slice(&header);
        io.read_exact(&mut bytes[PACKET_HEADER_SIZE..]).await?;
        Ok(Self { bytes })
    }

    /// Packet type.
    pub fn packet_type(&self) -> PacketType {
        // The type byte is validated by every constructor.
        PacketType::from_byte(self.bytes[0]).unwrap_or(PacketType::Data)
    }

    /// Route the packet belongs to.
    pub fn route_id(&self) -> u32 {
        u32::from_be_bytes([self.bytes[1], self.bytes[2], self.bytes[3], self.bytes[4]])
    }

    /// Payload length from the header.
    pub fn size(&self) -> usize {
        u16::from_be_bytes([self.bytes[5], self.bytes[6]]) as usize
    }

    /// Payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.bytes[PACKET_HEADER_SIZE..]
    }

    /// Encoded packet.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Consume the packet into its encoding.
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("type", &self.packet_type())
            .field("route_id", &self.route_id())
            .field("size", &self.size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::memory_pipe;

    #[test]
    fn test_header_layout() {
        let p = Packet::data(0x01020304, b"hey").unwrap();
        assert_eq!(p.as_bytes(), &[0, 1, 2, 3, 4, 0, 3, b'h', b'e', b'y']);
        assert_eq!(p.route_id(), 0x01020304);
        assert_eq!(p.payload(), b"hey");
        assert_eq!(Packet::from_bytes(p.clone().into_bytes()).unwrap(), p);

        let c = Packet::close(9, 2);
        assert_eq!(c.packet_type(), PacketType::Close);
        assert_eq!(c.payload(), &[2]);
        assert_eq!(Packet::keep_alive(9).size(), 0);
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(matches!(
            Packet::data(1, &vec![0u8; 70_000]),
            Err(PacketError::PayloadTooLarge(70_000))
        ));
        assert!(matches!(
            Packet::from_bytes(vec![7, 0, 0, 0, 1, 0, 0]),
            Err(PacketError::UnknownType(7))
        ));
        assert!(matches!(
            Packet::from_bytes(vec![0, 0, 0, 0, 1, 0, 5, 1]),
            Err(PacketError::Truncated { need: 12, have: 8 })
        ));
    }

    #[tokio::test]
    async fn test_read_consecutive_packets() {
        let (a, b) = memory_pipe(1024);
        let first = Packet::data(1, b"one").unwrap();
        let second = Packet::keep_alive(2);
        let mut wire = first.as_bytes().to_vec();
        wire.extend_from_slice(second.as_bytes());
        a.write_all(&wire).await.unwrap();

        assert_eq!(Packet::read_from(&b).await.unwrap(), first);
        assert_eq!(Packet::read_from(&b).await.unwrap(), second);
    }
}
