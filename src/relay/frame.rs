//! Relay frame encoding and decoding.
//!
//! Wire format (5-byte header):
//! ```text
//! +------+-----------+-------------+-----------------+
//! | type | stream id | payload len | payload         |
//! | u8   | u16 BE    | u16 BE      | payload len     |
//! +------+-----------+-------------+-----------------+
//! ```

use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::{Addr, Duplex, RELAY_HANDSHAKE_VERSION, RELAY_HEADER_LEN};

/// Frame parsing errors.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Not enough bytes for the expected structure.
    #[error("frame too short: expected {expected}, got {actual}")]
    TooShort {
        /// Expected number of bytes.
        expected: usize,
        /// Actual number of bytes.
        actual: usize,
    },

    /// Unknown frame type byte.
    #[error("invalid frame type: 0x{0:02x}")]
    InvalidType(u8),

    /// Payload does not fit the 16-bit length field.
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    /// Handshake data could not be decoded.
    #[error("invalid handshake data: {0}")]
    InvalidHandshake(String),

    /// I/O error while reading or writing a frame.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl From<FrameError> for io::Error {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}

/// Relay frame types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    /// Keep-alive / no-op.
    Ok = 0x0,
    /// Open a stream.
    Request = 0x1,
    /// Accept a stream.
    Accept = 0x2,
    /// Close a stream.
    Close = 0x3,
    /// Forward stream data.
    Fwd = 0xa,
    /// Acknowledge consumed stream data.
    Ack = 0xb,
}

impl FrameType {
    /// Parse frame type from a byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x0 => Some(Self::Ok),
            0x1 => Some(Self::Request),
            0x2 => Some(Self::Accept),
            0x3 => Some(Self::Close),
            0xa => Some(Self::Fwd),
            0xb => Some(Self::Ack),
            _ => None,
        }
    }

    /// Convert frame type to its byte representation.
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ok => "OK",
            Self::Request => "REQUEST",
            Self::Accept => "ACCEPT",
            Self::Close => "CLOSE",
            Self::Fwd => "FWD",
            Self::Ack => "ACK",
        };
        f.write_str(name)
    }
}

/// CLOSE reason for an orderly close.
///
/// Any other reason byte is a relay error code explaining why a stream
/// request was refused or torn down.
pub const CLOSE_NORMAL: u8 = 0;

/// Whether a stream id was allocated by the initiating client.
///
/// Clients allocate even ids; the relay server allocates odd ids on the
/// responder's session.
pub fn is_initiator_id(id: u16) -> bool {
    id % 2 == 0
}

/// A relay frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame type.
    pub frame_type: FrameType,
    /// Stream id, local to one session.
    pub stream_id: u16,
    /// Payload bytes.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a frame.
    pub fn new(frame_type: FrameType, stream_id: u16, payload: Vec<u8>) -> Self {
        Self {
            frame_type,
            stream_id,
            payload,
        }
    }

    /// ACK frame restoring `n` bytes of window.
    pub fn ack(stream_id: u16, n: u16) -> Self {
        Self::new(FrameType::Ack, stream_id, n.to_be_bytes().to_vec())
    }

    /// CLOSE frame for an orderly close.
    pub fn close(stream_id: u16) -> Self {
        Self::reject(stream_id, CLOSE_NORMAL)
    }

    /// CLOSE frame carrying an error code.
    pub fn reject(stream_id: u16, code: u8) -> Self {
        Self::new(FrameType::Close, stream_id, vec![code])
    }

    /// Reason byte of a CLOSE frame.
    pub fn close_reason(&self) -> u8 {
        self.payload.first().copied().unwrap_or(CLOSE_NORMAL)
    }

    /// Encode to wire bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, FrameError> {
        let len = u16::try_from(self.payload.len())
            .map_err(|_| FrameError::PayloadTooLarge(self.payload.len()))?;
        let mut buf = Vec::with_capacity(RELAY_HEADER_LEN + self.payload.len());
        buf.push(self.frame_type.as_byte());
        buf.extend_from_slice(&self.stream_id.to_be_bytes());
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }

    /// Decode a complete frame from bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self, FrameError> {
        let (frame_type, stream_id, len) = Self::parse_header(data)?;
        let end = RELAY_HEADER_LEN + len as usize;
        if data.len() < end {
            return Err(FrameError::TooShort {
                expected: end,
                actual: data.len(),
            });
        }
        Ok(Self::new(
            frame_type,
            stream_id,
            data[RELAY_HEADER_LEN..end].to_vec(),
        ))
    }

    fn parse_header(data: &[u8]) -> Result<(FrameType, u16, u16), FrameError> {
        if data.len() < RELAY_HEADER_LEN {
            return Err(FrameError::TooShort {
                expected: RELAY_HEADER_LEN,
                actual: data.len(),
            });
        }
        let frame_type = FrameType::from_byte(data[0]).ok_or(FrameError::InvalidType(data[0]))?;
        let stream_id = u16::from_be_bytes([data[1], data[2]]);
        let len = u16::from_be_bytes([data[3], data[4]]);
        Ok((frame_type, stream_id, len))
    }

    /// Read one frame from `io`.
    pub async fn read_from(io: &dyn Duplex) -> Result<Self, FrameError> {
        let mut header = [0u8; RELAY_HEADER_LEN];
        io.read_exact(&mut header).await?;
        let (frame_type, stream_id, len) = Self::parse_header(&header)?;
        let mut payload = vec![0u8; len as usize];
        io.read_exact(&mut payload).await?;
        Ok(Self::new(frame_type, stream_id, payload))
    }

    /// Write this frame to `io` in a single write.
    pub async fn write_to(&self, io: &dyn Duplex) -> Result<(), FrameError> {
        io.write_all(&self.to_bytes()?).await?;
        Ok(())
    }

    /// Decode the byte count of an ACK payload.
    pub fn ack_offset(&self) -> Result<u16, FrameError> {
        match self.payload.as_slice() {
            [hi, lo] => Ok(u16::from_be_bytes([*hi, *lo])),
            other => Err(FrameError::TooShort {
                expected: 2,
                actual: other.len(),
            }),
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<type:{}><id:{}><size:{}>",
            self.frame_type,
            self.stream_id,
            self.payload.len()
        )?;
        if self.frame_type == FrameType::Ack {
            match self.ack_offset() {
                Ok(n) => write!(f, "<offset:{n}>")?,
                Err(e) => write!(f, "<offset:{e}>")?,
            }
        }
        Ok(())
    }
}

/// Payload of REQUEST and ACCEPT frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeData {
    /// Payload format version.
    pub version: String,
    /// Address of the stream initiator.
    #[serde(rename = "init_address")]
    pub init_addr: Addr,
    /// Address of the stream responder.
    #[serde(rename = "resp_address")]
    pub resp_addr: Addr,
    /// Read window advertised by the sender of this payload.
    pub window: i32,
}

impl HandshakeData {
    /// Create handshake data with the current version.
    pub fn new(init_addr: Addr, resp_addr: Addr, window: usize) -> Self {
        Self {
            version: RELAY_HANDSHAKE_VERSION.to_string(),
            init_addr,
            resp_addr,
            window: i32::try_from(window).unwrap_or(i32::MAX),
        }
    }

    /// Encode as JSON.
    pub fn to_bytes(&self) -> Result<Vec<u8>, FrameError> {
        serde_json::to_vec(self).map_err(|e| FrameError::InvalidHandshake(e.to_string()))
    }

    /// Decode from JSON and check version and window.
    pub fn from_bytes(data: &[u8]) -> Result<Self, FrameError> {
        let hd: Self =
            serde_json::from_slice(data).map_err(|e| FrameError::InvalidHandshake(e.to_string()))?;
        if hd.version != RELAY_HANDSHAKE_VERSION {
            return Err(FrameError::InvalidHandshake(format!(
                "unsupported version {}",
                hd.version
            )));
        }
        if hd.window <= 0 {
            return Err(FrameError::InvalidHandshake(format!(
                "invalid window {}",
                hd.window
            )));
        }
        Ok(hd)
    }

    /// Advertised window as a byte count.
    pub fn window_size(&self) -> usize {
        self.window.max(0) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::memory_pipe;
    use crate::crypto::Keypair;

    #[test]
    fn test_frame_type_roundtrip() {
        for ty in [
            FrameType::Ok,
            FrameType::Request,
            FrameType::Accept,
            FrameType::Close,
            FrameType::Fwd,
            FrameType::Ack,
        ] {
            assert_eq!(FrameType::from_byte(ty.as_byte()), Some(ty));
        }
        assert_eq!(FrameType::from_byte(0x04), None);
    }

    #[test]
    fn test_frame_wire_layout() {
        let frame = Frame::new(FrameType::Fwd, 0x0102, b"abc".to_vec());
        let bytes = frame.to_bytes().unwrap();
        assert_eq!(bytes, [0x0a, 0x01, 0x02, 0x00, 0x03, b'a', b'b', b'c']);
        assert_eq!(Frame::from_bytes(&bytes).unwrap(), frame);
    }

    #[test]
    fn test_frame_too_short() {
        assert!(matches!(
            Frame::from_bytes(&[0x0a, 0x00]),
            Err(FrameError::TooShort {
                expected: 5,
                actual: 2
            })
        ));
        assert!(matches!(
            Frame::from_bytes(&[0x0a, 0x00, 0x01, 0x00, 0x04, 1]),
            Err(FrameError::TooShort { .. })
        ));
        assert!(matches!(
            Frame::from_bytes(&[0x07, 0, 0, 0, 0]),
            Err(FrameError::InvalidType(0x07))
        ));
    }

    #[test]
    fn test_payload_too_large() {
        let frame = Frame::new(FrameType::Fwd, 0, vec![0u8; u16::MAX as usize + 1]);
        assert!(matches!(
            frame.to_bytes(),
            Err(FrameError::PayloadTooLarge(_))
        ));
    }

    #[test]
    fn test_ack_payload() {
        let frame = Frame::ack(4, 65535);
        assert_eq!(frame.ack_offset().unwrap(), 65535);
        assert_eq!(frame.to_string(), "<type:ACK><id:4><size:2><offset:65535>");
    }

    #[test]
    fn test_initiator_ids() {
        assert!(is_initiator_id(0));
        assert!(is_initiator_id(2));
        assert!(!is_initiator_id(1));
    }

    #[test]
    fn test_handshake_data_validation() {
        let a = Addr::new(Keypair::generate().pk(), 49152);
        let b = Addr::new(Keypair::generate().pk(), 80);
        let hd = HandshakeData::new(a, b, 65536);
        let parsed = HandshakeData::from_bytes(&hd.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed, hd);
        assert_eq!(parsed.window_size(), 65536);

        let mut bad = hd.clone();
        bad.version = "1.0".into();
        assert!(HandshakeData::from_bytes(&bad.to_bytes().unwrap()).is_err());

        let mut bad = hd;
        bad.window = 0;
        assert!(HandshakeData::from_bytes(&bad.to_bytes().unwrap()).is_err());
    }

    #[tokio::test]
    async fn test_read_write_frames() {
        let (a, b) = memory_pipe(1024);
        Frame::close(9).write_to(&a).await.unwrap();
        Frame::reject(3, 56).write_to(&a).await.unwrap();
        Frame::ack(9, 10).write_to(&a).await.unwrap();

        let first = Frame::read_from(&b).await.unwrap();
        assert_eq!(first.frame_type, FrameType::Close);
        assert_eq!(first.close_reason(), CLOSE_NORMAL);
        assert_eq!(Frame::read_from(&b).await.unwrap().close_reason(), 56);
        assert_eq!(Frame::read_from(&b).await.unwrap().ack_offset().unwrap(), 10);
    }
}
