//! Per-channel broadcast management
//!
//! Holds at most one [`BroadcastSession`] per channel. Starting a broadcast on
//! a channel that is already on the air replaces the running session; the
//! replacement is counted in [`BroadcastStats`] rather than reported as an
//! error.

use std::collections::HashMap;
use std::sync::Arc;

use rand_core::RngCore;
use tracing::{debug, info};

use blecast_core::{BlecastError, BroadcastConfig, ChannelId, ProtocolConfig, Result};

use crate::radio::Advertiser;
use crate::session::{BroadcastOutcome, BroadcastSession, MessageIdAllocator, SessionState};

/// Counters of broadcast activity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub sessions_started: u64,
    pub single_sessions: u64,
    pub cycling_sessions: u64,
    /// Starts that took over a channel already on the air
    pub sessions_replaced: u64,
    pub active_sessions: usize,
    /// Packets handed to the radio by all sessions, including cycle updates
    pub packets_advertised: u64,
}

pub struct Broadcaster<A: Advertiser> {
    advertiser: Arc<A>,
    protocol: ProtocolConfig,
    config: BroadcastConfig,
    sessions: HashMap<ChannelId, BroadcastSession<A>>,
    ids: MessageIdAllocator,
    stats: BroadcastStats,
    /// Packets sent by sessions that no longer exist
    retired_packets: u64,
}

impl<A: Advertiser> Broadcaster<A> {
    pub fn new(advertiser: Arc<A>, protocol: ProtocolConfig, config: BroadcastConfig) -> Self {
        Self::with_ids(advertiser, protocol, config, MessageIdAllocator::default())
    }

    pub fn with_rng(
        advertiser: Arc<A>,
        protocol: ProtocolConfig,
        config: BroadcastConfig,
        rng: Box<dyn RngCore + Send>,
    ) -> Self {
        Self::with_ids(advertiser, protocol, config, MessageIdAllocator::new(rng))
    }

    fn with_ids(
        advertiser: Arc<A>,
        protocol: ProtocolConfig,
        config: BroadcastConfig,
        ids: MessageIdAllocator,
    ) -> Self {
        Self {
            advertiser,
            protocol,
            config,
            sessions: HashMap::new(),
            ids,
            stats: BroadcastStats::default(),
            retired_packets: 0,
        }
    }

    /// Start broadcasting `payload` on `channel`
    ///
    /// `max_advertise_length` is the manufacturer payload budget per packet.
    pub async fn broadcast(
        &mut self,
        channel: ChannelId,
        payload: &[u8],
        max_advertise_length: usize,
    ) -> Result<BroadcastOutcome> {
        if !channel.carries_marker(self.protocol.channel_marker) {
            return Err(BlecastError::config_error(format!(
                "Channel {} does not end in protocol marker {:#04x}",
                channel, self.protocol.channel_marker
            )));
        }

        let message_id = self.ids.next(channel);
        let advertiser = &self.advertiser;
        let (company_id, dwell) = (self.protocol.company_id, self.config.cycle_dwell);
        let session = self
            .sessions
            .entry(channel)
            .or_insert_with(|| BroadcastSession::new(channel, company_id, dwell, Arc::clone(advertiser)));

        let replacing = session.state().is_active();
        let outcome = session.start(payload, max_advertise_length, message_id).await?;

        if replacing {
            self.stats.sessions_replaced += 1;
            info!("Replaced running broadcast on {}", channel);
        }
        self.stats.sessions_started += 1;
        match outcome {
            BroadcastOutcome::Single => self.stats.single_sessions += 1,
            BroadcastOutcome::Multi { .. } => self.stats.cycling_sessions += 1,
        }
        Ok(outcome)
    }

    /// Stop the session on `channel`, if any
    pub async fn stop_channel(&mut self, channel: ChannelId) -> Result<()> {
        if let Some(session) = self.sessions.get_mut(&channel) {
            session.stop().await?;
            if let Some(session) = self.sessions.remove(&channel) {
                self.retired_packets += session.packets_sent();
            }
            debug!("Released session for {}", channel);
        }
        Ok(())
    }

    /// Stop every session; the first radio error is returned after all were tried
    pub async fn stop_all(&mut self) -> Result<()> {
        let channels: Vec<ChannelId> = self.sessions.keys().copied().collect();
        let mut first_error = None;
        for channel in channels {
            if let Err(err) = self.stop_channel(channel).await {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn state(&self, channel: ChannelId) -> SessionState {
        self.sessions
            .get(&channel)
            .map_or(SessionState::Idle, BroadcastSession::state)
    }

    pub fn active_channels(&self) -> Vec<ChannelId> {
        self.sessions
            .values()
            .filter(|session| session.state().is_active())
            .map(BroadcastSession::channel)
            .collect()
    }

    pub fn stats(&self) -> BroadcastStats {
        let live: u64 = self.sessions.values().map(BroadcastSession::packets_sent).sum();
        BroadcastStats {
            active_sessions: self.active_channels().len(),
            packets_advertised: self.retired_packets + live,
            ..self.stats
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radio::loopback::{LoopbackAir, LoopbackConfig, LoopbackRadio};
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;

    fn broadcaster() -> (Broadcaster<LoopbackRadio>, LoopbackRadio) {
        let air = LoopbackAir::new(LoopbackConfig::default().with_max_advertising_length(37));
        let radio = air.radio();
        let broadcaster = Broadcaster::with_rng(
            Arc::new(radio.clone()),
            ProtocolConfig::default(),
            BroadcastConfig::default(),
            Box::new(ChaCha8Rng::seed_from_u64(5)),
        );
        (broadcaster, radio)
    }

    #[tokio::test(start_paused = true)]
    async fn test_replace_is_counted_not_raised() {
        let (mut broadcaster, _radio) = broadcaster();
        let channel = ChannelId::generate(0x00);

        let first = broadcaster.broadcast(channel, &[1; 30], 10).await.unwrap();
        let second = broadcaster.broadcast(channel, &[2; 30], 10).await.unwrap();

        let (BroadcastOutcome::Multi { message_id: a, .. }, BroadcastOutcome::Multi { message_id: b, .. }) =
            (first, second)
        else {
            panic!("expected two cycling sessions");
        };
        assert_ne!(a, b);

        let stats = broadcaster.stats();
        assert_eq!(stats.sessions_started, 2);
        assert_eq!(stats.sessions_replaced, 1);
        assert_eq!(stats.active_sessions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_channels_are_independent() {
        let (mut broadcaster, radio) = broadcaster();
        let left = ChannelId::generate(0x00);
        let right = ChannelId::generate(0x00);

        broadcaster.broadcast(left, b"left", 10).await.unwrap();
        broadcaster.broadcast(right, &[9; 25], 10).await.unwrap();
        assert_eq!(radio.air().active_advertisements().await, 2);

        broadcaster.stop_channel(left).await.unwrap();
        assert_eq!(broadcaster.state(left), SessionState::Idle);
        assert_eq!(broadcaster.state(right), SessionState::Cycling);
        assert_eq!(radio.air().active_advertisements().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_all_idempotent() {
        let (mut broadcaster, radio) = broadcaster();
        broadcaster.broadcast(ChannelId::generate(0x00), &[1; 30], 10).await.unwrap();
        broadcaster.broadcast(ChannelId::generate(0x00), b"hi", 10).await.unwrap();

        broadcaster.stop_all().await.unwrap();
        broadcaster.stop_all().await.unwrap();
        assert!(broadcaster.active_channels().is_empty());
        assert_eq!(radio.air().active_advertisements().await, 0);
        assert_eq!(broadcaster.stats().packets_advertised, 2);
    }

    #[tokio::test]
    async fn test_foreign_channel_rejected() {
        let (mut broadcaster, _radio) = broadcaster();
        let err = broadcaster
            .broadcast(ChannelId::generate(0x5A), b"hi", 10)
            .await
            .unwrap_err();
        assert!(matches!(err, BlecastError::InvalidConfiguration { .. }));
    }
}
