//! Splitting payloads into advertisement-sized packets
//!
//! A payload that fits in one advertisement is sent bare. Anything larger is
//! cut into equally sized chunks (the last one may be shorter), each prefixed
//! with a [`FragmentHeader`] carrying the same message id and total count.
//!
//! Bare packets have no header, so a short payload whose first bytes look like
//! one would be misread by receivers. [`Fragmenter::split_for_air`] sends such
//! payloads as fragments instead.

use core::cmp;

use crate::errors::{BlecastError, Result};
use crate::packet::{has_fragment_header, Fragment, FragmentHeader, Packet, HEADER_SIZE, MAX_TOTAL_COUNT};
use crate::types::MessageId;

// ----------------------------------------------------------------------------
// Fragmenter
// ----------------------------------------------------------------------------

/// Stateless payload splitter
pub struct Fragmenter;

impl Fragmenter {
    /// Payload bytes available to each fragment
    pub fn chunk_capacity(max_advertise_length: usize) -> Result<usize> {
        if max_advertise_length <= HEADER_SIZE {
            return Err(BlecastError::config_error(format!(
                "Maximum advertise length {} cannot fit the {}-byte fragment header and any data",
                max_advertise_length, HEADER_SIZE
            )));
        }
        Ok(max_advertise_length - HEADER_SIZE)
    }

    /// Number of packets `split` produces for a payload of `payload_len` bytes
    pub fn packet_count(payload_len: usize, max_advertise_length: usize) -> Result<usize> {
        let chunk_capacity = Self::chunk_capacity(max_advertise_length)?;
        if payload_len <= max_advertise_length {
            return Ok(1);
        }
        Ok(payload_len.div_ceil(chunk_capacity))
    }

    /// Split `payload` into packets of at most `max_advertise_length` bytes
    pub fn split(
        payload: &[u8],
        max_advertise_length: usize,
        message_id: MessageId,
    ) -> Result<Vec<Packet>> {
        let chunk_capacity = Self::chunk_capacity(max_advertise_length)?;

        if payload.len() <= max_advertise_length {
            return Ok(vec![Packet::Bare(payload.to_vec())]);
        }

        Self::fragment(payload, chunk_capacity, message_id)
    }

    /// Split `payload` into at least two fragments, however short it is
    ///
    /// Needs at least two payload bytes so that every chunk is non-empty.
    pub fn split_fragmented(
        payload: &[u8],
        max_advertise_length: usize,
        message_id: MessageId,
    ) -> Result<Vec<Packet>> {
        let chunk_capacity = Self::chunk_capacity(max_advertise_length)?;
        if payload.len() < 2 {
            return Err(BlecastError::config_error(format!(
                "A {}-byte payload cannot be split into two fragments",
                payload.len()
            )));
        }
        let chunk_size = cmp::min(chunk_capacity, payload.len().div_ceil(2));
        Self::fragment(payload, chunk_size, message_id)
    }

    /// Split `payload` so that receivers read every packet back as sent
    ///
    /// Same as [`split`](Self::split), except that a bare packet receivers
    /// would take for a fragment is replaced by a fragmented message.
    pub fn split_for_air(
        payload: &[u8],
        max_advertise_length: usize,
        message_id: MessageId,
    ) -> Result<Vec<Packet>> {
        if Self::is_ambiguous_bare(payload, max_advertise_length) {
            return Self::split_fragmented(payload, max_advertise_length, message_id);
        }
        Self::split(payload, max_advertise_length, message_id)
    }

    fn fragment(payload: &[u8], chunk_size: usize, message_id: MessageId) -> Result<Vec<Packet>> {
        let total_count = payload.len().div_ceil(chunk_size);
        if total_count > MAX_TOTAL_COUNT {
            return Err(BlecastError::PayloadTooLarge {
                fragments: total_count,
                max: MAX_TOTAL_COUNT,
            });
        }

        let mut packets = Vec::with_capacity(total_count);
        for (index, chunk) in payload.chunks(chunk_size).enumerate() {
            let header = FragmentHeader::new(message_id, index as u8, total_count as u8)?;
            packets.push(Packet::Fragment(Fragment::new(header, chunk.to_vec())));
        }

        Ok(packets)
    }

    /// Whether `payload` would go out bare but be read back as a fragment
    pub fn is_ambiguous_bare(payload: &[u8], max_advertise_length: usize) -> bool {
        payload.len() <= max_advertise_length && has_fragment_header(payload)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn chunks(packets: &[Packet]) -> Vec<&[u8]> {
        packets
            .iter()
            .map(|packet| match packet {
                Packet::Fragment(fragment) => fragment.chunk.as_slice(),
                Packet::Bare(_) => panic!("expected fragment"),
            })
            .collect()
    }

    #[test]
    fn test_hello_world_splits_in_two() {
        let id = MessageId::new(42);
        let packets = Fragmenter::split(b"Hello World!", 10, id).unwrap();

        assert_eq!(packets.len(), 2);
        assert_eq!(chunks(&packets), vec![&b"Hello W"[..], &b"orld!"[..]]);
        for (index, packet) in packets.iter().enumerate() {
            let Packet::Fragment(fragment) = packet else {
                panic!("expected fragment");
            };
            assert_eq!(fragment.message_id(), id);
            assert_eq!(fragment.total_count(), 2);
            assert_eq!(fragment.sequence_index() as usize, index);
            assert!(packet.encoded_len() <= 10);
        }
    }

    #[test]
    fn test_small_payload_is_bare() {
        let packets = Fragmenter::split(b"Hello", 10, MessageId::new(1)).unwrap();
        assert_eq!(packets, vec![Packet::Bare(b"Hello".to_vec())]);

        // Exactly at the limit still needs no header
        let packets = Fragmenter::split(&[b'a'; 10], 10, MessageId::new(1)).unwrap();
        assert_eq!(packets.len(), 1);
        assert!(!packets[0].is_fragment());
    }

    #[test]
    fn test_one_byte_over_limit() {
        let packets = Fragmenter::split(&[b'a'; 11], 10, MessageId::new(1)).unwrap();
        assert_eq!(packets.len(), 2);
        assert_eq!(chunks(&packets), vec![&[b'a'; 7][..], &[b'a'; 4][..]]);
    }

    #[test]
    fn test_header_must_fit() {
        for max in 0..=HEADER_SIZE {
            assert!(matches!(
                Fragmenter::split(b"payload", max, MessageId::new(0)),
                Err(BlecastError::InvalidConfiguration { .. })
            ));
        }
        assert!(Fragmenter::split(b"payload", HEADER_SIZE + 1, MessageId::new(0)).is_ok());
    }

    #[test]
    fn test_too_many_fragments() {
        // 4-byte budget carries one byte per fragment
        let payload = vec![0x55; MAX_TOTAL_COUNT + 1];
        assert!(matches!(
            Fragmenter::split(&payload, 4, MessageId::new(0)),
            Err(BlecastError::PayloadTooLarge { fragments: 128, max: 127 })
        ));

        let payload = vec![0x55; MAX_TOTAL_COUNT];
        assert_eq!(Fragmenter::split(&payload, 4, MessageId::new(0)).unwrap().len(), 127);
    }

    #[test]
    fn test_packet_count_matches_split() {
        for len in [0usize, 1, 10, 11, 14, 15, 100] {
            let payload = vec![b'z'; len];
            let packets = Fragmenter::split(&payload, 10, MessageId::new(3)).unwrap();
            assert_eq!(Fragmenter::packet_count(len, 10).unwrap(), packets.len());
        }
    }

    #[test]
    fn test_ambiguous_bare_detection() {
        assert!(Fragmenter::is_ambiguous_bare(&[3, 1, 0, 9], 10));
        assert!(!Fragmenter::is_ambiguous_bare(b"Hello", 10));
        // Fragmented payloads are never ambiguous
        assert!(!Fragmenter::is_ambiguous_bare(&[3, 1, 0, 9, 9, 9, 9, 9, 9, 9, 9], 10));
    }

    #[test]
    fn test_lookalike_payload_goes_out_fragmented() {
        // 'h' (0x68) > 'e' (0x65): bare "hello" reads as fragment 101 of 104
        assert!(Fragmenter::is_ambiguous_bare(b"hello", 10));

        let packets = Fragmenter::split_for_air(b"hello", 10, MessageId::new(6)).unwrap();
        assert_eq!(packets.len(), 2);
        assert_eq!(chunks(&packets), vec![&b"hel"[..], &b"lo"[..]]);
        for packet in &packets {
            assert_eq!(&Packet::decode(&packet.to_bytes()).unwrap(), packet);
        }

        // Unambiguous payloads are untouched
        assert_eq!(
            Fragmenter::split_for_air(b"Hello", 10, MessageId::new(6)).unwrap(),
            vec![Packet::Bare(b"Hello".to_vec())]
        );
    }

    #[test]
    fn test_split_fragmented_limits() {
        assert!(Fragmenter::split_fragmented(b"x", 10, MessageId::new(0)).is_err());

        let packets = Fragmenter::split_fragmented(b"xy", 10, MessageId::new(0)).unwrap();
        assert_eq!(chunks(&packets), vec![&b"x"[..], &b"y"[..]]);

        // Never more per chunk than the radio allows
        let packets = Fragmenter::split_fragmented(&[9u8; 6], 5, MessageId::new(0)).unwrap();
        assert_eq!(chunks(&packets), vec![&[9u8; 2][..], &[9u8; 2][..], &[9u8; 2][..]]);
    }
}
