//! Transmission lifecycle of one message on one channel
//!
//! A [`BroadcastSession`] owns everything needed to keep a message on the air:
//! the encoded packets, the cycling task that rotates them, and the channel it
//! advertises on. Stopping aborts the cycling task and waits for it to finish
//! before the radio is told to stop, so once [`BroadcastSession::stop`]
//! returns the radio receives no further updates from this session.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand_core::{OsRng, RngCore};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use blecast_core::{BlecastError, ChannelId, Fragmenter, MessageId, Result};

use crate::radio::Advertiser;

// ----------------------------------------------------------------------------
// Session State
// ----------------------------------------------------------------------------

/// Where a session is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    /// One bare packet advertised continuously
    Single,
    /// Fragments rotated on a timer
    Cycling,
    /// Cycling cancelled, radio not yet confirmed stopped
    Stopped,
}

impl SessionState {
    pub fn is_active(self) -> bool {
        matches!(self, SessionState::Single | SessionState::Cycling)
    }
}

/// Result of starting a broadcast
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastOutcome {
    Single,
    /// Cycling has begun; nothing is implied about how many cycles completed
    Multi {
        total_packets: usize,
        message_id: MessageId,
        chunk_capacity: usize,
    },
}

impl BroadcastOutcome {
    pub fn total_packets(&self) -> usize {
        match self {
            BroadcastOutcome::Single => 1,
            BroadcastOutcome::Multi { total_packets, .. } => *total_packets,
        }
    }

    pub fn is_multi(&self) -> bool {
        matches!(self, BroadcastOutcome::Multi { .. })
    }
}

// ----------------------------------------------------------------------------
// Message Id Allocation
// ----------------------------------------------------------------------------

/// Random message ids that never repeat back-to-back on a channel
pub struct MessageIdAllocator {
    rng: Box<dyn RngCore + Send>,
    last: HashMap<ChannelId, MessageId>,
}

impl MessageIdAllocator {
    pub fn new(rng: Box<dyn RngCore + Send>) -> Self {
        Self {
            rng,
            last: HashMap::new(),
        }
    }

    /// Draw an id for the next message on `channel`
    pub fn next(&mut self, channel: ChannelId) -> MessageId {
        let previous = self.last.get(&channel).copied();
        let id = loop {
            let candidate = MessageId::new((self.rng.next_u32() & 0xFF) as u8);
            if Some(candidate) != previous {
                break candidate;
            }
        };
        self.last.insert(channel, id);
        id
    }
}

impl Default for MessageIdAllocator {
    fn default() -> Self {
        Self::new(Box::new(OsRng))
    }
}

// ----------------------------------------------------------------------------
// Broadcast Session
// ----------------------------------------------------------------------------

/// Sender-side state for one channel
pub struct BroadcastSession<A: Advertiser> {
    channel: ChannelId,
    company_id: u16,
    dwell: Duration,
    advertiser: Arc<A>,
    state: SessionState,
    message_id: Option<MessageId>,
    cycle: Option<JoinHandle<()>>,
    /// Packets handed to the radio, shared with the cycling task
    packets_sent: Arc<AtomicU64>,
}

impl<A: Advertiser> BroadcastSession<A> {
    pub fn new(channel: ChannelId, company_id: u16, dwell: Duration, advertiser: Arc<A>) -> Self {
        Self {
            channel,
            company_id,
            dwell,
            advertiser,
            state: SessionState::Idle,
            message_id: None,
            cycle: None,
            packets_sent: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Id stamped on the fragments currently cycling
    pub fn message_id(&self) -> Option<MessageId> {
        self.message_id
    }

    pub fn packets_sent(&self) -> u64 {
        self.packets_sent.load(Ordering::Relaxed)
    }

    /// Put `payload` on the air, replacing whatever this session was sending
    ///
    /// `max_advertise_length` is the manufacturer payload budget per packet.
    /// Returns as soon as the first packet is advertised.
    pub async fn start(
        &mut self,
        payload: &[u8],
        max_advertise_length: usize,
        message_id: MessageId,
    ) -> Result<BroadcastOutcome> {
        if payload.is_empty() {
            return Err(BlecastError::EmptyPayload);
        }
        let packets = Fragmenter::split_for_air(payload, max_advertise_length, message_id)?;

        if self.state != SessionState::Idle {
            self.stop().await?;
        }

        if packets.len() == 1 {
            let data = packets[0].to_bytes();
            self.advertiser
                .start_advertising(self.channel, self.company_id, data)
                .await?;
            self.packets_sent.fetch_add(1, Ordering::Relaxed);
            self.state = SessionState::Single;
            self.message_id = None;
            info!("Advertising {} bytes on {}", payload.len(), self.channel);
            return Ok(BroadcastOutcome::Single);
        }

        let encoded: Vec<Vec<u8>> = packets.iter().map(|packet| packet.to_bytes()).collect();
        let total_packets = encoded.len();
        self.advertiser
            .start_advertising(self.channel, self.company_id, encoded[0].clone())
            .await?;
        self.packets_sent.fetch_add(1, Ordering::Relaxed);

        self.cycle = Some(tokio::spawn(cycle_packets(
            Arc::clone(&self.advertiser),
            self.channel,
            self.company_id,
            self.dwell,
            encoded,
            Arc::clone(&self.packets_sent),
        )));
        self.state = SessionState::Cycling;
        self.message_id = Some(message_id);

        let chunk_capacity = Fragmenter::chunk_capacity(max_advertise_length)?;
        info!(
            "Cycling message {} on {}: {} bytes in {} packets every {:?}",
            message_id,
            self.channel,
            payload.len(),
            total_packets,
            self.dwell
        );
        Ok(BroadcastOutcome::Multi {
            total_packets,
            message_id,
            chunk_capacity,
        })
    }

    /// Cancel cycling and take the advertisement off the air
    ///
    /// Calling this on an idle session does nothing. If the radio fails to
    /// stop, the session stays `Stopped` and a later call retries.
    pub async fn stop(&mut self) -> Result<()> {
        if self.state == SessionState::Idle {
            return Ok(());
        }

        if let Some(handle) = self.cycle.take() {
            handle.abort();
            let _ = handle.await;
        }
        self.state = SessionState::Stopped;

        self.advertiser.stop_advertising(self.channel).await?;
        self.state = SessionState::Idle;
        self.message_id = None;
        debug!("Broadcast on {} stopped", self.channel);
        Ok(())
    }
}

impl<A: Advertiser> Drop for BroadcastSession<A> {
    fn drop(&mut self) {
        if let Some(handle) = self.cycle.take() {
            handle.abort();
        }
    }
}

/// Rotate `packets` on the radio until aborted
async fn cycle_packets<A: Advertiser>(
    advertiser: Arc<A>,
    channel: ChannelId,
    company_id: u16,
    dwell: Duration,
    packets: Vec<Vec<u8>>,
    packets_sent: Arc<AtomicU64>,
) {
    let mut ticker = interval_at(Instant::now() + dwell, dwell);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut position = 0;

    loop {
        ticker.tick().await;
        position = (position + 1) % packets.len();
        match advertiser
            .update_advertising(channel, company_id, packets[position].clone())
            .await
        {
            Ok(()) => {
                packets_sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                warn!("Failed to advance cycle on {} to packet {}: {}", channel, position, err);
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radio::loopback::{LoopbackAir, LoopbackConfig, LoopbackRadio};
    use crate::radio::AdapterState;
    use async_trait::async_trait;
    use blecast_core::{Packet, RadioError, TEST_COMPANY_ID};
    use std::sync::atomic::AtomicBool;
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;

    const DWELL: Duration = Duration::from_millis(500);

    fn session() -> (BroadcastSession<LoopbackRadio>, LoopbackRadio) {
        // 37 raw bytes leave a 10-byte manufacturer payload
        let air = LoopbackAir::new(LoopbackConfig::default().with_max_advertising_length(37));
        let radio = air.radio();
        let session = BroadcastSession::new(
            ChannelId::generate(0x00),
            TEST_COMPANY_ID,
            DWELL,
            Arc::new(radio.clone()),
        );
        (session, radio)
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_payload_is_single() {
        let (mut session, radio) = session();

        let outcome = session.start(b"Hello", 10, MessageId::new(1)).await.unwrap();
        assert_eq!(outcome, BroadcastOutcome::Single);
        assert_eq!(session.state(), SessionState::Single);

        tokio::time::sleep(DWELL * 4).await;
        assert_eq!(radio.history().await, vec![b"Hello".to_vec()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fragments_cycle_and_wrap() {
        let (mut session, radio) = session();

        let outcome = session
            .start(b"Hello World!", 10, MessageId::new(0x21))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            BroadcastOutcome::Multi {
                total_packets: 2,
                message_id: MessageId::new(0x21),
                chunk_capacity: 7,
            }
        );
        assert_eq!(session.state(), SessionState::Cycling);

        tokio::time::sleep(DWELL * 3 + Duration::from_millis(10)).await;
        let history = radio.history().await;
        assert_eq!(history.len(), 4);
        assert_eq!(&history[0][3..], b"Hello W");
        assert_eq!(&history[1][3..], b"orld!");
        assert_eq!(history[2], history[0]);
        assert_eq!(history[3], history[1]);
        assert_eq!(session.packets_sent(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_halts_updates_and_is_idempotent() {
        let (mut session, radio) = session();
        let channel = session.channel();
        session.start(&[7u8; 30], 10, MessageId::new(3)).await.unwrap();
        tokio::time::sleep(DWELL + Duration::from_millis(1)).await;

        session.stop().await.unwrap();
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(radio.air().advertised(radio.address(), channel).await, None);
        let sent = radio.history().await.len();

        tokio::time::sleep(DWELL * 10).await;
        assert_eq!(radio.history().await.len(), sent);

        session.stop().await.unwrap();
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_replaces_previous_cycle() {
        let (mut session, radio) = session();
        session.start(&[1u8; 30], 10, MessageId::new(1)).await.unwrap();
        session.start(&[2u8; 30], 10, MessageId::new(2)).await.unwrap();
        assert_eq!(session.message_id(), Some(MessageId::new(2)));

        tokio::time::sleep(DWELL * 6).await;
        let history = radio.history().await;
        // Only the first packet of message 1 ever went out
        assert_eq!(history.iter().filter(|p| p[2] == 1).count(), 1);
        assert!(history[1..].iter().all(|p| p[2] == 2));
    }

    #[tokio::test]
    async fn test_empty_payload_rejected() {
        let (mut session, _radio) = session();
        let err = session.start(&[], 10, MessageId::new(1)).await.unwrap_err();
        assert!(matches!(err, BlecastError::EmptyPayload));
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_budget_too_small_is_configuration_error() {
        let (mut session, _radio) = session();
        let err = session.start(b"Hello", 3, MessageId::new(1)).await.unwrap_err();
        assert!(matches!(err, BlecastError::InvalidConfiguration { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lookalike_payload_is_sent_as_fragments() {
        let (mut session, radio) = session();

        let outcome = session.start(b"hello", 10, MessageId::new(9)).await.unwrap();
        assert_eq!(outcome.total_packets(), 2);
        assert_eq!(session.state(), SessionState::Cycling);

        tokio::time::sleep(DWELL + Duration::from_millis(1)).await;
        let history = radio.history().await;
        assert_eq!(history[0], vec![2, 0, 9, b'h', b'e', b'l']);
        assert_eq!(history[1], vec![2, 1, 9, b'l', b'o']);
        assert!(history.iter().all(|data| Packet::decode(data).unwrap().is_fragment()));
    }

    /// Loopback radio whose stop can be made to fail
    struct StubbornRadio {
        inner: LoopbackRadio,
        fail_stop: AtomicBool,
    }

    #[async_trait]
    impl Advertiser for StubbornRadio {
        async fn adapter_state(&self) -> AdapterState {
            self.inner.adapter_state().await
        }

        async fn max_advertising_length(&self) -> Result<usize> {
            self.inner.max_advertising_length().await
        }

        async fn start_advertising(&self, channel: ChannelId, company_id: u16, data: Vec<u8>) -> Result<()> {
            self.inner.start_advertising(channel, company_id, data).await
        }

        async fn update_advertising(&self, channel: ChannelId, company_id: u16, data: Vec<u8>) -> Result<()> {
            self.inner.update_advertising(channel, company_id, data).await
        }

        async fn stop_advertising(&self, channel: ChannelId) -> Result<()> {
            if self.fail_stop.load(Ordering::SeqCst) {
                return Err(RadioError::StopFailed {
                    reason: "adapter busy".into(),
                }
                .into());
            }
            self.inner.stop_advertising(channel).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_stop_leaves_session_stopped_until_retried() {
        let air = LoopbackAir::new(LoopbackConfig::default().with_max_advertising_length(37));
        let radio = Arc::new(StubbornRadio {
            inner: air.radio(),
            fail_stop: AtomicBool::new(true),
        });
        let channel = ChannelId::generate(0x00);
        let mut session = BroadcastSession::new(channel, TEST_COMPANY_ID, DWELL, Arc::clone(&radio));

        session.start(&[4u8; 30], 10, MessageId::new(4)).await.unwrap();
        assert!(session.stop().await.is_err());
        assert_eq!(session.state(), SessionState::Stopped);

        // Cycling is already cancelled even though the radio kept the packet
        let sent = session.packets_sent();
        tokio::time::sleep(DWELL * 4).await;
        assert_eq!(session.packets_sent(), sent);
        assert!(air.advertised(radio.inner.address(), channel).await.is_some());

        // A restart also has to stop first, and fails the same way
        assert!(session.start(b"Hello", 10, MessageId::new(5)).await.is_err());
        assert_eq!(session.state(), SessionState::Stopped);

        radio.fail_stop.store(false, Ordering::SeqCst);
        session.stop().await.unwrap();
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(air.advertised(radio.inner.address(), channel).await, None);

        let outcome = session.start(b"Hello", 10, MessageId::new(5)).await.unwrap();
        assert_eq!(outcome, BroadcastOutcome::Single);
    }

    #[test]
    fn test_message_ids_never_repeat_back_to_back() {
        let mut ids = MessageIdAllocator::new(Box::new(ChaCha8Rng::seed_from_u64(42)));
        let channel = ChannelId::generate(0x00);
        let mut previous = ids.next(channel);
        for _ in 0..2_000 {
            let id = ids.next(channel);
            assert_ne!(id, previous);
            previous = id;
        }
    }
}
