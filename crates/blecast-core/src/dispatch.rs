//! Normalization of received messages into one event type
//!
//! Bare packets and completed reassemblies both end up as an
//! [`ObservedMessage`]. The variant tells them apart, so a consumer can never
//! see a reassembled flag without a fragment count or the other way round.

use tokio::sync::mpsc;

use crate::errors::{BlecastError, Result};
use crate::reassembly::CompletedReassembly;
use crate::types::{ChannelId, DeviceAddress, MessageId, Timestamp};

// ----------------------------------------------------------------------------
// Observation
// ----------------------------------------------------------------------------

/// Where and when an advertisement was heard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    pub channel: ChannelId,
    pub address: DeviceAddress,
    /// Received signal strength in dBm
    pub rssi: i16,
    pub timestamp: Timestamp,
}

// ----------------------------------------------------------------------------
// Observed Message
// ----------------------------------------------------------------------------

/// A complete message heard from another device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObservedMessage {
    /// Payload carried by one bare advertisement
    Single {
        observation: Observation,
        payload: Vec<u8>,
    },
    /// Payload rebuilt from a cycle of fragments
    Reassembled {
        observation: Observation,
        payload: Vec<u8>,
        message_id: MessageId,
        fragment_count: u8,
        first_seen_at: Timestamp,
    },
}

impl ObservedMessage {
    pub fn observation(&self) -> &Observation {
        match self {
            ObservedMessage::Single { observation, .. }
            | ObservedMessage::Reassembled { observation, .. } => observation,
        }
    }

    pub fn channel(&self) -> ChannelId {
        self.observation().channel
    }

    pub fn source_address(&self) -> DeviceAddress {
        self.observation().address
    }

    pub fn signal_strength(&self) -> i16 {
        self.observation().rssi
    }

    pub fn timestamp(&self) -> Timestamp {
        self.observation().timestamp
    }

    pub fn payload(&self) -> &[u8] {
        match self {
            ObservedMessage::Single { payload, .. }
            | ObservedMessage::Reassembled { payload, .. } => payload,
        }
    }

    pub fn into_payload(self) -> Vec<u8> {
        match self {
            ObservedMessage::Single { payload, .. }
            | ObservedMessage::Reassembled { payload, .. } => payload,
        }
    }

    pub fn is_reassembled(&self) -> bool {
        matches!(self, ObservedMessage::Reassembled { .. })
    }

    /// Number of advertisements the payload arrived in
    pub fn fragment_count(&self) -> usize {
        match self {
            ObservedMessage::Single { .. } => 1,
            ObservedMessage::Reassembled { fragment_count, .. } => *fragment_count as usize,
        }
    }
}

impl From<CompletedReassembly> for ObservedMessage {
    fn from(completed: CompletedReassembly) -> Self {
        ObservedMessage::Reassembled {
            observation: completed.observation,
            payload: completed.payload,
            message_id: completed.message_id,
            fragment_count: completed.fragment_count,
            first_seen_at: completed.first_seen_at,
        }
    }
}

// ----------------------------------------------------------------------------
// Message Sink
// ----------------------------------------------------------------------------

/// Consumer of observed messages
pub trait MessageSink: Send + Sync {
    fn deliver(&self, message: ObservedMessage) -> Result<()>;
}

impl MessageSink for mpsc::UnboundedSender<ObservedMessage> {
    fn deliver(&self, message: ObservedMessage) -> Result<()> {
        self.send(message)
            .map_err(|_| BlecastError::channel_error("Observed message receiver dropped"))
    }
}

impl MessageSink for mpsc::Sender<ObservedMessage> {
    fn deliver(&self, message: ObservedMessage) -> Result<()> {
        self.try_send(message).map_err(|e| {
            BlecastError::channel_error(format!("Observed message channel rejected event: {}", e))
        })
    }
}

// ----------------------------------------------------------------------------
// Dispatcher
// ----------------------------------------------------------------------------

/// Stateless mapping from receive-path results to consumer events
#[derive(Debug, Clone)]
pub struct Dispatcher<S> {
    sink: S,
}

impl<S: MessageSink> Dispatcher<S> {
    pub fn new(sink: S) -> Self {
        Self { sink }
    }

    /// Forward a bare packet's payload
    pub fn dispatch_single(&self, observation: Observation, payload: Vec<u8>) -> Result<()> {
        self.sink.deliver(ObservedMessage::Single {
            observation,
            payload,
        })
    }

    /// Forward a completed reassembly
    pub fn dispatch_reassembled(&self, completed: CompletedReassembly) -> Result<()> {
        self.sink.deliver(completed.into())
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }
}
