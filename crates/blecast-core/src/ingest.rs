//! Scan event ingestion
//!
//! Raw advertisement reports from the radio are filtered to this protocol's
//! channels, classified as bare packets or fragments, and routed either
//! straight to the [`Dispatcher`] or through the [`ReassemblyBuffer`]. Nothing
//! that happens here is returned as an error: a bad advertisement from one
//! device must not interrupt delivery of everybody else's messages.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use smallvec::SmallVec;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::config::ProtocolConfig;
use crate::dispatch::{Dispatcher, MessageSink, Observation};
use crate::errors::PacketError;
use crate::packet::Packet;
use crate::reassembly::ReassemblyBuffer;
use crate::types::{ChannelId, DeviceAddress, Timestamp};

// ----------------------------------------------------------------------------
// Scan Event
// ----------------------------------------------------------------------------

/// One advertisement report from the radio
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanEvent {
    /// Service UUIDs listed in the advertisement
    pub advertised_channels: SmallVec<[Uuid; 2]>,
    /// Manufacturer-specific data keyed by company identifier
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
    pub address: DeviceAddress,
    pub rssi: i16,
    pub timestamp: Timestamp,
}

impl ScanEvent {
    /// Report carrying one channel and one manufacturer payload
    pub fn new(
        channel: ChannelId,
        company_id: u16,
        data: Vec<u8>,
        address: DeviceAddress,
        rssi: i16,
        timestamp: Timestamp,
    ) -> Self {
        let mut manufacturer_data = HashMap::new();
        manufacturer_data.insert(company_id, data);
        Self {
            advertised_channels: smallvec::smallvec![*channel.as_uuid()],
            manufacturer_data,
            address,
            rssi,
            timestamp,
        }
    }
}

// ----------------------------------------------------------------------------
// Scan Filter
// ----------------------------------------------------------------------------

/// Restricts which protocol channels are accepted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanFilter {
    /// Accept only this channel; any channel carrying the marker when `None`
    pub channel: Option<ChannelId>,
}

impl ScanFilter {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn channel(channel: ChannelId) -> Self {
        Self {
            channel: Some(channel),
        }
    }
}

// ----------------------------------------------------------------------------
// Outcome and Statistics
// ----------------------------------------------------------------------------

/// What became of one scan event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// No advertised channel belongs to this protocol
    Foreign,
    /// Data could not be parsed; dropped
    Malformed(PacketError),
    /// Bare packet delivered as a complete message
    Single,
    /// Fragment stored, message still incomplete
    Buffered,
    /// Fragment completed a message, which was delivered
    Reassembled,
}

/// Snapshot of ingestion counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub events: u64,
    pub foreign: u64,
    pub malformed: u64,
    pub single: u64,
    pub fragments: u64,
    pub reassembled: u64,
    pub undelivered: u64,
}

#[derive(Debug, Default)]
struct IngestCounters {
    events: AtomicU64,
    foreign: AtomicU64,
    malformed: AtomicU64,
    single: AtomicU64,
    fragments: AtomicU64,
    reassembled: AtomicU64,
    undelivered: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

// ----------------------------------------------------------------------------
// Scan Ingest
// ----------------------------------------------------------------------------

/// Entry point of the receive path
pub struct ScanIngest<S> {
    protocol: ProtocolConfig,
    filter: ScanFilter,
    buffer: Arc<ReassemblyBuffer>,
    dispatcher: Dispatcher<S>,
    counters: IngestCounters,
}

impl<S: MessageSink> ScanIngest<S> {
    pub fn new(protocol: ProtocolConfig, buffer: Arc<ReassemblyBuffer>, dispatcher: Dispatcher<S>) -> Self {
        Self {
            protocol,
            filter: ScanFilter::any(),
            buffer,
            dispatcher,
            counters: IngestCounters::default(),
        }
    }

    pub fn with_filter(mut self, filter: ScanFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn filter(&self) -> ScanFilter {
        self.filter
    }

    pub fn buffer(&self) -> &Arc<ReassemblyBuffer> {
        &self.buffer
    }

    /// First advertised channel this node listens to
    fn select_channel(&self, event: &ScanEvent) -> Option<ChannelId> {
        event
            .advertised_channels
            .iter()
            .map(|uuid| ChannelId::new(*uuid))
            .find(|channel| {
                channel.carries_marker(self.protocol.channel_marker)
                    && self.filter.channel.map_or(true, |wanted| wanted == *channel)
            })
    }

    /// Route one advertisement report
    pub fn handle(&self, event: ScanEvent) -> IngestOutcome {
        bump(&self.counters.events);

        let Some(channel) = self.select_channel(&event) else {
            bump(&self.counters.foreign);
            trace!("Ignoring advertisement from {}: no protocol channel", event.address);
            return IngestOutcome::Foreign;
        };

        let observation = Observation {
            channel,
            address: event.address,
            rssi: event.rssi,
            timestamp: event.timestamp,
        };

        let data = event
            .manufacturer_data
            .get(&self.protocol.company_id)
            .map(Vec::as_slice)
            .unwrap_or_default();

        let packet = match Packet::decode(data) {
            Ok(packet) => packet,
            Err(err) => {
                bump(&self.counters.malformed);
                debug!("Dropping malformed advertisement from {} on {}: {}", event.address, channel, err);
                return IngestOutcome::Malformed(err);
            }
        };

        match packet {
            Packet::Bare(payload) => {
                bump(&self.counters.single);
                self.deliver(self.dispatcher.dispatch_single(observation, payload));
                IngestOutcome::Single
            }
            Packet::Fragment(fragment) => {
                bump(&self.counters.fragments);
                match self.buffer.ingest(fragment, observation) {
                    Some(completed) => {
                        bump(&self.counters.reassembled);
                        self.deliver(self.dispatcher.dispatch_reassembled(completed));
                        IngestOutcome::Reassembled
                    }
                    None => IngestOutcome::Buffered,
                }
            }
        }
    }

    fn deliver(&self, result: crate::Result<()>) {
        if let Err(err) = result {
            bump(&self.counters.undelivered);
            warn!("Observed message not delivered: {}", err);
        }
    }

    pub fn stats(&self) -> IngestStats {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        IngestStats {
            events: load(&self.counters.events),
            foreign: load(&self.counters.foreign),
            malformed: load(&self.counters.malformed),
            single: load(&self.counters.single),
            fragments: load(&self.counters.fragments),
            reassembled: load(&self.counters.reassembled),
            undelivered: load(&self.counters.undelivered),
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
