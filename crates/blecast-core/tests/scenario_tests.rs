//! End-to-end receive path scenarios
//!
//! Packets produced by the fragmenter are wrapped into scan events and fed
//! through `ScanIngest`, checking what reaches the consumer channel.

use std::sync::Arc;

use blecast_core::{
    config::{ProtocolConfig, ReassemblyConfig, TEST_COMPANY_ID},
    dispatch::{Dispatcher, ObservedMessage},
    fragmentation::Fragmenter,
    ingest::{IngestOutcome, ScanEvent, ScanIngest},
    reassembly::ReassemblyBuffer,
    types::{ChannelId, DeviceAddress, MessageId, Timestamp},
};
use core::time::Duration;
use tokio::sync::mpsc;

struct Receiver {
    ingest: ScanIngest<mpsc::UnboundedSender<ObservedMessage>>,
    messages: mpsc::UnboundedReceiver<ObservedMessage>,
}

impl Receiver {
    fn new() -> Self {
        Self::with_reassembly(ReassemblyConfig::default())
    }

    fn with_reassembly(config: ReassemblyConfig) -> Self {
        let (tx, messages) = mpsc::unbounded_channel();
        let ingest = ScanIngest::new(
            ProtocolConfig::default(),
            Arc::new(ReassemblyBuffer::new(config)),
            Dispatcher::new(tx),
        );
        Self { ingest, messages }
    }

    fn hear(&self, channel: ChannelId, data: Vec<u8>, at: u64) -> IngestOutcome {
        self.ingest.handle(ScanEvent::new(
            channel,
            TEST_COMPANY_ID,
            data,
            DeviceAddress::new([0x0A, 0x0B, 0x0C, 0x0D, 0x0E, 0x0F]),
            -48,
            Timestamp::new(at),
        ))
    }

    fn drain(&mut self) -> Vec<ObservedMessage> {
        let mut out = Vec::new();
        while let Ok(message) = self.messages.try_recv() {
            out.push(message);
        }
        out
    }
}

#[test]
fn hello_world_reassembles_from_two_fragments() {
    let mut receiver = Receiver::new();
    let channel = ChannelId::generate(0x00);
    let packets = Fragmenter::split(b"Hello World!", 10, MessageId::new(0x5A)).unwrap();
    assert_eq!(packets.len(), 2);

    // Fragment 1 before fragment 0
    assert_eq!(receiver.hear(channel, packets[1].to_bytes(), 100), IngestOutcome::Buffered);
    assert_eq!(receiver.hear(channel, packets[0].to_bytes(), 600), IngestOutcome::Reassembled);

    let messages = receiver.drain();
    assert_eq!(messages.len(), 1);
    let message = &messages[0];
    assert_eq!(message.payload(), b"Hello World!");
    assert!(message.is_reassembled());
    assert_eq!(message.fragment_count(), 2);
    assert_eq!(message.channel(), channel);
    assert_eq!(message.timestamp(), Timestamp::new(600));
    match message {
        ObservedMessage::Reassembled { first_seen_at, message_id, .. } => {
            assert_eq!(*first_seen_at, Timestamp::new(100));
            assert_eq!(*message_id, MessageId::new(0x5A));
        }
        other => panic!("expected reassembled message, got {:?}", other),
    }
}

#[test]
fn five_byte_payload_is_single() {
    let mut receiver = Receiver::new();
    let channel = ChannelId::generate(0x00);
    let packets = Fragmenter::split(b"Howdy", 10, MessageId::new(1)).unwrap();
    assert_eq!(packets.len(), 1);

    assert_eq!(receiver.hear(channel, packets[0].to_bytes(), 0), IngestOutcome::Single);
    let messages = receiver.drain();
    assert_eq!(messages.len(), 1);
    assert!(!messages[0].is_reassembled());
    assert_eq!(messages[0].fragment_count(), 1);
    assert_eq!(messages[0].payload(), b"Howdy");
}

#[test]
fn repeated_cycles_deliver_once_per_completion() {
    let mut receiver = Receiver::new();
    let channel = ChannelId::generate(0x00);
    let packets = Fragmenter::split(&[0x42; 40], 10, MessageId::new(7)).unwrap();
    assert_eq!(packets.len(), 6);

    // Same fragment heard many times while in range
    for at in 0..5 {
        receiver.hear(channel, packets[2].to_bytes(), at);
    }
    assert!(receiver.drain().is_empty());

    for (i, packet) in packets.iter().enumerate() {
        receiver.hear(channel, packet.to_bytes(), 10 + i as u64);
    }
    let messages = receiver.drain();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].payload(), &[0x42; 40][..]);
    assert_eq!(receiver.ingest.buffer().stats().duplicates, 5);
}

#[test]
fn lost_fragment_produces_no_message() {
    let mut receiver = Receiver::with_reassembly(ReassemblyConfig::default().with_ttl(Duration::from_secs(2)));
    let channel = ChannelId::generate(0x00);
    let packets = Fragmenter::split(b"a message that never finishes", 10, MessageId::new(8)).unwrap();

    for packet in packets.iter().skip(1) {
        receiver.hear(channel, packet.to_bytes(), 1_000);
    }
    assert_eq!(receiver.ingest.buffer().sweep(Timestamp::new(3_001)), 1);
    assert!(receiver.drain().is_empty());
    assert_eq!(receiver.ingest.buffer().stats().expired, 1);
}

#[test]
fn channels_do_not_share_reassembly_state() {
    let mut receiver = Receiver::new();
    let left = ChannelId::generate(0x00);
    let right = ChannelId::generate(0x00);
    let packets = Fragmenter::split(b"Hello World!", 10, MessageId::new(4)).unwrap();

    receiver.hear(left, packets[0].to_bytes(), 0);
    assert_eq!(receiver.hear(right, packets[1].to_bytes(), 1), IngestOutcome::Buffered);
    assert!(receiver.drain().is_empty());
    assert_eq!(receiver.ingest.buffer().active_entries(), 2);
}

#[test]
fn malformed_data_does_not_disturb_other_messages() {
    let mut receiver = Receiver::new();
    let channel = ChannelId::generate(0x00);
    let packets = Fragmenter::split(b"Hello World!", 10, MessageId::new(2)).unwrap();

    receiver.hear(channel, packets[0].to_bytes(), 0);
    assert!(matches!(receiver.hear(channel, vec![3, 1, 2], 1), IngestOutcome::Malformed(_)));
    receiver.hear(channel, packets[1].to_bytes(), 2);

    let messages = receiver.drain();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].payload(), b"Hello World!");
    assert_eq!(receiver.ingest.stats().malformed, 1);
}
