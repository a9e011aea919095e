//! Wire format of advertised packets
//!
//! A packet is the manufacturer-specific data placed in one advertisement.
//! Bare packets carry a whole message verbatim. Fragment packets start with a
//! 3-byte header:
//!
//! ```text
//! +-------------+----------------+------------+----------------
//! | total_count | sequence_index | message_id | chunk ...
//! |   (u8)      |     (u8)       |    (u8)    |
//! +-------------+----------------+------------+----------------
//! ```
//!
//! Bare packets have no header, so the receiver classifies data as a fragment
//! when the first two bytes form a consistent header (`2 <= total_count <= 127`,
//! `sequence_index < total_count`) and as bare otherwise. Header bytes are read
//! as signed by Android receivers, so a leading byte of `0x80` or above always
//! means bare data.

use serde::{Deserialize, Serialize};

use crate::errors::PacketError;
use crate::types::MessageId;

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Size of the fragment header in bytes
pub const HEADER_SIZE: usize = 3;

/// Largest fragment count receivers accept (positive signed byte)
pub const MAX_TOTAL_COUNT: usize = i8::MAX as usize;

// ----------------------------------------------------------------------------
// Fragment Header
// ----------------------------------------------------------------------------

/// Header stamped on every fragment of a multi-packet message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FragmentHeader {
    pub message_id: MessageId,
    /// 0-based position of the chunk within the message
    pub sequence_index: u8,
    /// Number of fragments in the message, 2 to [`MAX_TOTAL_COUNT`]
    pub total_count: u8,
}

impl FragmentHeader {
    /// Create a header, rejecting combinations a receiver would not accept
    pub fn new(
        message_id: MessageId,
        sequence_index: u8,
        total_count: u8,
    ) -> Result<Self, PacketError> {
        if total_count < 2 || total_count as usize > MAX_TOTAL_COUNT || sequence_index >= total_count {
            return Err(PacketError::InconsistentHeader {
                sequence_index,
                total_count,
            });
        }
        Ok(Self {
            message_id,
            sequence_index,
            total_count,
        })
    }

    pub fn is_first(&self) -> bool {
        self.sequence_index == 0
    }

    pub fn is_last(&self) -> bool {
        self.sequence_index + 1 == self.total_count
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        [self.total_count, self.sequence_index, self.message_id.value()]
    }
}

// ----------------------------------------------------------------------------
// Fragment
// ----------------------------------------------------------------------------

/// One packet of a multi-packet message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub header: FragmentHeader,
    pub chunk: Vec<u8>,
}

impl Fragment {
    pub fn new(header: FragmentHeader, chunk: Vec<u8>) -> Self {
        Self { header, chunk }
    }

    pub fn message_id(&self) -> MessageId {
        self.header.message_id
    }

    pub fn sequence_index(&self) -> u8 {
        self.header.sequence_index
    }

    pub fn total_count(&self) -> u8 {
        self.header.total_count
    }
}

// ----------------------------------------------------------------------------
// Packet
// ----------------------------------------------------------------------------

/// Unit placed on the air
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Whole message, no header
    Bare(Vec<u8>),
    Fragment(Fragment),
}

impl Packet {
    /// Serialize to advertisement manufacturer data
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Packet::Bare(data) => data.clone(),
            Packet::Fragment(fragment) => {
                let mut bytes = Vec::with_capacity(HEADER_SIZE + fragment.chunk.len());
                bytes.extend_from_slice(&fragment.header.to_bytes());
                bytes.extend_from_slice(&fragment.chunk);
                bytes
            }
        }
    }

    /// Classify and parse advertisement manufacturer data
    pub fn decode(data: &[u8]) -> Result<Self, PacketError> {
        if data.is_empty() {
            return Err(PacketError::Empty);
        }

        if !has_fragment_header(data) {
            return Ok(Packet::Bare(data.to_vec()));
        }

        let header = FragmentHeader {
            total_count: data[0],
            sequence_index: data[1],
            message_id: MessageId::new(data[2]),
        };
        if data.len() == HEADER_SIZE {
            return Err(PacketError::EmptyChunk {
                sequence_index: header.sequence_index,
                total_count: header.total_count,
            });
        }

        Ok(Packet::Fragment(Fragment::new(
            header,
            data[HEADER_SIZE..].to_vec(),
        )))
    }

    /// Encoded size in bytes
    pub fn encoded_len(&self) -> usize {
        match self {
            Packet::Bare(data) => data.len(),
            Packet::Fragment(fragment) => HEADER_SIZE + fragment.chunk.len(),
        }
    }

    pub fn is_fragment(&self) -> bool {
        matches!(self, Packet::Fragment(_))
    }
}

/// Whether a receiver would read `data` as carrying a fragment header
pub fn has_fragment_header(data: &[u8]) -> bool {
    data.len() >= HEADER_SIZE
        && (2..=MAX_TOTAL_COUNT).contains(&(data[0] as usize))
        && data[1] < data[0]
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_validation() {
        let id = MessageId::new(7);
        assert!(FragmentHeader::new(id, 0, 2).is_ok());
        assert!(FragmentHeader::new(id, 1, 2).unwrap().is_last());
        assert!(matches!(
            FragmentHeader::new(id, 2, 2),
            Err(PacketError::InconsistentHeader { .. })
        ));
        assert!(FragmentHeader::new(id, 0, 1).is_err());
    }

    #[test]
    fn test_fragment_layout() {
        let header = FragmentHeader::new(MessageId::new(0xAB), 1, 3).unwrap();
        let packet = Packet::Fragment(Fragment::new(header, b"xyz".to_vec()));
        assert_eq!(packet.to_bytes(), vec![3, 1, 0xAB, b'x', b'y', b'z']);
        assert_eq!(packet.encoded_len(), 6);
        assert_eq!(Packet::decode(&packet.to_bytes()).unwrap(), packet);
    }

    #[test]
    fn test_bare_text_is_not_a_fragment() {
        // 'H' (0x48) < 'e' (0x65): no consistent header
        let packet = Packet::decode(b"Hello").unwrap();
        assert_eq!(packet, Packet::Bare(b"Hello".to_vec()));
        assert!(!packet.is_fragment());
    }

    #[test]
    fn test_high_leading_byte_is_bare() {
        let text = "été".as_bytes();
        assert_eq!(text[0], 0xC3);
        assert_eq!(Packet::decode(text).unwrap(), Packet::Bare(text.to_vec()));
        assert!(!has_fragment_header(&[0x80, 0x01, 0x05, 0x42]));
        assert!(has_fragment_header(&[0x7F, 0x01, 0x05, 0x42]));
        assert!(FragmentHeader::new(MessageId::new(1), 0, 128).is_err());
        assert!(FragmentHeader::new(MessageId::new(1), 126, 127).is_ok());
    }

    #[test]
    fn test_short_data_is_bare() {
        assert_eq!(Packet::decode(&[5, 1]).unwrap(), Packet::Bare(vec![5, 1]));
        assert_eq!(Packet::decode(&[1, 0, 9, 9]).unwrap(), Packet::Bare(vec![1, 0, 9, 9]));
    }

    #[test]
    fn test_malformed_data() {
        assert_eq!(Packet::decode(&[]), Err(PacketError::Empty));
        assert_eq!(
            Packet::decode(&[2, 0, 17]),
            Err(PacketError::EmptyChunk {
                sequence_index: 0,
                total_count: 2
            })
        );
    }

    #[test]
    fn test_has_fragment_header() {
        assert!(has_fragment_header(&[2, 1, 0, 0]));
        assert!(!has_fragment_header(&[2, 2, 0, 0]));
        assert!(!has_fragment_header(b"Hi there"));
        assert!(has_fragment_header(b"ba!"));
    }
}
