//! Data-plane datagram framing.
//!
//! ```text
//! length:  u32 big-endian (4)
//! payload: [u8; length]
//! ```
//!
//! One datagram carries exactly one frame. Bytes past `4 + length` are ignored.

use crate::error::FramingError;

/// Size of the length prefix.
pub const HEADER_LEN: usize = 4;
/// Largest UDP payload over IPv4 (65535 - 8 UDP - 20 IP).
pub const MAX_DATAGRAM: usize = 65_507;
/// Largest frame payload that still fits in one datagram.
pub const MAX_PAYLOAD: usize = MAX_DATAGRAM - HEADER_LEN;

/// A parsed datagram, borrowing its payload from the receive buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramePacket<'a> {
    pub length: u32,
    pub payload: &'a [u8],
}

/// Length-prefix codec bounded by a payload ceiling.
#[derive(Debug, Clone, Copy)]
pub struct DatagramFramer {
    max_payload: usize,
}

impl Default for DatagramFramer {
    fn default() -> Self {
        Self::new(MAX_PAYLOAD)
    }
}

impl DatagramFramer {
    /// Ceilings above [`MAX_PAYLOAD`] are clamped.
    pub fn new(max_payload: usize) -> Self {
        Self {
            max_payload: max_payload.min(MAX_PAYLOAD),
        }
    }

    #[cfg(test)]
    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    pub fn encode(&self, payload: &[u8]) -> Result<Vec<u8>, FramingError> {
        if payload.len() > self.max_payload {
            return Err(FramingError::PayloadTooLarge {
                size: payload.len(),
                max: self.max_payload,
            });
        }
        let mut datagram = Vec::with_capacity(HEADER_LEN + payload.len());
        datagram.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        datagram.extend_from_slice(payload);
        Ok(datagram)
    }

    pub fn decode<'a>(&self, buf: &'a [u8]) -> Result<FramePacket<'a>, FramingError> {
        let Some(header) = buf.get(..HEADER_LEN) else {
            return Err(FramingError::TruncatedPacket {
                needed: HEADER_LEN,
                available: buf.len(),
            });
        };
        let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        let size = length as usize;
        if size > self.max_payload {
            return Err(FramingError::PayloadTooLarge {
                size,
                max: self.max_payload,
            });
        }
        let payload = buf
            .get(HEADER_LEN..HEADER_LEN + size)
            .ok_or(FramingError::TruncatedPacket {
                needed: HEADER_LEN + size,
                available: buf.len(),
            })?;
        Ok(FramePacket { length, payload })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_preserves_payload_and_length() {
        let framer = DatagramFramer::default();
        for payload in [vec![], vec![0xAB], vec![7u8; 1400], vec![1u8; MAX_PAYLOAD]] {
            let datagram = framer.encode(&payload).unwrap();
            assert_eq!(datagram.len(), HEADER_LEN + payload.len());
            let packet = framer.decode(&datagram).unwrap();
            assert_eq!(packet.payload, &payload[..]);
            assert_eq!(packet.length as usize, payload.len());
        }
    }

    #[test]
    fn test_header_is_big_endian() {
        let datagram = DatagramFramer::default().encode(&[9u8; 258]).unwrap();
        assert_eq!(&datagram[..4], &[0, 0, 1, 2]);
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let framer = DatagramFramer::new(16);
        assert_eq!(
            framer.encode(&[0u8; 17]),
            Err(FramingError::PayloadTooLarge { size: 17, max: 16 })
        );
        assert!(framer.encode(&[0u8; 16]).is_ok());

        let default = DatagramFramer::default();
        assert!(default.encode(&vec![0u8; MAX_PAYLOAD + 1]).is_err());
    }

    #[test]
    fn test_ceiling_clamped_to_datagram_limit() {
        assert_eq!(DatagramFramer::new(1 << 20).max_payload(), MAX_PAYLOAD);
    }

    #[test]
    fn test_truncated_packets_rejected() {
        let framer = DatagramFramer::default();
        assert_eq!(
            framer.decode(&[0, 0]),
            Err(FramingError::TruncatedPacket { needed: 4, available: 2 })
        );

        let mut datagram = framer.encode(b"hello world").unwrap();
        datagram.truncate(10);
        assert_eq!(
            framer.decode(&datagram),
            Err(FramingError::TruncatedPacket { needed: 15, available: 10 })
        );
    }

    #[test]
    fn test_declared_length_over_ceiling_rejected() {
        let framer = DatagramFramer::new(8);
        let mut buf = 9u32.to_be_bytes().to_vec();
        buf.extend_from_slice(&[0u8; 9]);
        assert_eq!(
            framer.decode(&buf),
            Err(FramingError::PayloadTooLarge { size: 9, max: 8 })
        );
    }

    #[test]
    fn test_trailing_bytes_ignored() {
        let framer = DatagramFramer::default();
        let mut datagram = framer.encode(b"abc").unwrap();
        datagram.extend_from_slice(b"garbage");
        let packet = framer.decode(&datagram).unwrap();
        assert_eq!(packet.payload, b"abc");
        assert_eq!(packet.length, 3);
    }
}
