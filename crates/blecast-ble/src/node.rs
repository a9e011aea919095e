//! Application-facing node
//!
//! [`BlecastNode`] ties the sending and receiving halves together behind the
//! operations an application uses: broadcast a payload on a channel, scan for
//! other devices' payloads and consume them as [`ObservedMessage`]s.

use std::sync::{Arc, PoisonError, RwLock};

use rand_core::RngCore;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, trace};

use blecast_core::{
    BlecastConfig, BlecastError, ChannelId, Dispatcher, IngestStats, MessageSink, ObservedMessage,
    ReassemblyBuffer, ReassemblyStats, Result, ScanFilter, ScanIngest, SystemTimeSource,
    TimeSource,
};

use crate::broadcaster::{BroadcastStats, Broadcaster};
use crate::pipeline::ScanPipeline;
use crate::radio::{Advertiser, Scanner};
use crate::session::{BroadcastOutcome, SessionState};

// ----------------------------------------------------------------------------
// Subscriber Sink
// ----------------------------------------------------------------------------

/// Message sink forwarding to the most recent subscriber
#[derive(Clone, Default)]
pub struct SubscriberSink {
    sender: Arc<RwLock<Option<mpsc::UnboundedSender<ObservedMessage>>>>,
}

impl SubscriberSink {
    /// Replace the current subscriber with a fresh channel
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ObservedMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.sender.write().unwrap_or_else(PoisonError::into_inner) = Some(tx);
        rx
    }
}

impl MessageSink for SubscriberSink {
    fn deliver(&self, message: ObservedMessage) -> Result<()> {
        let sender = self.sender.read().unwrap_or_else(PoisonError::into_inner);
        match sender.as_ref() {
            Some(tx) => tx
                .send(message)
                .map_err(|_| BlecastError::channel_error("Subscriber dropped its receiver")),
            None => {
                trace!("No subscriber, discarding message on {}", message.channel());
                Ok(())
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Node
// ----------------------------------------------------------------------------

/// A device speaking the multi-packet advertising protocol
pub struct BlecastNode<A: Advertiser, S: Scanner> {
    config: BlecastConfig,
    advertiser: Arc<A>,
    scanner: Arc<S>,
    broadcaster: Mutex<Broadcaster<A>>,
    buffer: Arc<ReassemblyBuffer>,
    subscribers: SubscriberSink,
    scan: Mutex<Option<ScanPipeline<SubscriberSink>>>,
    last_scan_stats: Mutex<IngestStats>,
    max_length: Mutex<Option<usize>>,
    clock: Arc<dyn TimeSource>,
}

impl<A: Advertiser, S: Scanner> BlecastNode<A, S> {
    /// Create a node; the configuration is validated here
    pub fn new(config: BlecastConfig, advertiser: A, scanner: S) -> Result<Self> {
        config.validate()?;
        let advertiser = Arc::new(advertiser);
        let broadcaster = Broadcaster::new(
            Arc::clone(&advertiser),
            config.protocol.clone(),
            config.broadcast.clone(),
        );

        Ok(Self {
            buffer: Arc::new(ReassemblyBuffer::new(config.reassembly.clone())),
            broadcaster: Mutex::new(broadcaster),
            advertiser,
            scanner: Arc::new(scanner),
            subscribers: SubscriberSink::default(),
            scan: Mutex::new(None),
            last_scan_stats: Mutex::new(IngestStats::default()),
            max_length: Mutex::new(None),
            clock: Arc::new(SystemTimeSource),
            config,
        })
    }

    /// Use `clock` for stamping received reports and expiring reassembly entries
    ///
    /// Scanner timestamps are replaced on arrival, so this is the only clock
    /// reassembly ages are measured on.
    pub fn with_clock(mut self, clock: Arc<dyn TimeSource>) -> Self {
        self.clock = clock;
        self
    }

    /// Draw message ids from `rng`
    pub fn with_id_rng(mut self, rng: Box<dyn RngCore + Send>) -> Self {
        self.broadcaster = Mutex::new(Broadcaster::with_rng(
            Arc::clone(&self.advertiser),
            self.config.protocol.clone(),
            self.config.broadcast.clone(),
            rng,
        ));
        self
    }

    pub fn config(&self) -> &BlecastConfig {
        &self.config
    }

    // ---- Sending ----

    /// Raw advertising limit reported by the radio, refreshing the cached value
    pub async fn max_advertising_length(&self) -> Result<usize> {
        let length = self.advertiser.max_advertising_length().await?;
        *self.max_length.lock().await = Some(length);
        Ok(length)
    }

    /// Manufacturer payload bytes per advertisement
    pub async fn payload_budget(&self) -> Result<usize> {
        let cached = *self.max_length.lock().await;
        let raw = match cached {
            Some(length) => length,
            None => self.max_advertising_length().await?,
        };
        self.config.protocol.payload_budget(raw)
    }

    /// Put `payload` on the air on `channel`
    ///
    /// Replaces any broadcast already running on that channel. For multi-packet
    /// payloads this returns once cycling has begun.
    pub async fn broadcast(&self, channel: ChannelId, payload: &[u8]) -> Result<BroadcastOutcome> {
        self.advertiser.adapter_state().await.ensure_available()?;
        let budget = self.payload_budget().await?;
        self.broadcaster
            .lock()
            .await
            .broadcast(channel, payload, budget)
            .await
    }

    /// Stop every broadcast; safe to call when nothing is on the air
    pub async fn stop_broadcast(&self) -> Result<()> {
        self.broadcaster.lock().await.stop_all().await
    }

    pub async fn stop_channel(&self, channel: ChannelId) -> Result<()> {
        self.broadcaster.lock().await.stop_channel(channel).await
    }

    pub async fn broadcast_state(&self, channel: ChannelId) -> SessionState {
        self.broadcaster.lock().await.state(channel)
    }

    pub async fn broadcast_stats(&self) -> BroadcastStats {
        self.broadcaster.lock().await.stats()
    }

    // ---- Receiving ----

    /// Receive observed messages; a later call replaces the earlier receiver
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ObservedMessage> {
        self.subscribers.subscribe()
    }

    /// Start scanning, restarting with the new filter if already scanning
    pub async fn scan(&self, filter: ScanFilter) -> Result<()> {
        if let Some(channel) = filter.channel {
            if !channel.carries_marker(self.config.protocol.channel_marker) {
                return Err(BlecastError::config_error(format!(
                    "Scan filter channel {} does not carry the protocol marker",
                    channel
                )));
            }
        }
        self.scanner.adapter_state().await.ensure_available()?;

        let mut scan = self.scan.lock().await;
        if let Some(pipeline) = scan.take() {
            *self.last_scan_stats.lock().await = pipeline.shutdown().await;
            self.scanner.stop_scan().await?;
        }

        let events = self.scanner.start_scan().await?;
        let ingest = ScanIngest::new(
            self.config.protocol.clone(),
            Arc::clone(&self.buffer),
            Dispatcher::new(self.subscribers.clone()),
        )
        .with_filter(filter);

        *scan = Some(ScanPipeline::spawn(
            ingest,
            events,
            self.config.reassembly.sweep_interval,
            Arc::clone(&self.clock),
        ));
        info!(
            "Scanning for {}",
            filter
                .channel
                .map_or_else(|| "all protocol channels".to_string(), |c| c.to_string())
        );
        Ok(())
    }

    /// Stop scanning and discard partially received messages
    pub async fn stop_scan(&self) -> Result<()> {
        let Some(pipeline) = self.scan.lock().await.take() else {
            return Ok(());
        };
        *self.last_scan_stats.lock().await = pipeline.shutdown().await;
        self.buffer.clear();
        self.scanner.stop_scan().await?;
        info!("Scanning stopped");
        Ok(())
    }

    pub async fn is_scanning(&self) -> bool {
        self.scan.lock().await.is_some()
    }

    /// Ingestion counters of the running scan, or of the last one
    pub async fn ingest_stats(&self) -> IngestStats {
        match self.scan.lock().await.as_ref() {
            Some(pipeline) => pipeline.stats(),
            None => *self.last_scan_stats.lock().await,
        }
    }

    pub fn reassembly_stats(&self) -> ReassemblyStats {
        self.buffer.stats()
    }

    /// Stop broadcasting and scanning
    pub async fn shutdown(&self) -> Result<()> {
        let broadcast = self.stop_broadcast().await;
        let scan = self.stop_scan().await;
        info!("Node shut down");
        broadcast.and(scan)
    }
}
