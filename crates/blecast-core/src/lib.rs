//! Multi-packet BLE advertising protocol
//!
//! A legacy advertisement carries only a few bytes of manufacturer data. This
//! crate provides the pure protocol that lets a device broadcast larger
//! payloads anyway: payloads are cut into fragments with a three-byte header,
//! the sender cycles through them, and receivers rebuild the message from
//! whatever order and duplicates the air delivers. Radio I/O lives in
//! `blecast-ble`.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod config;
pub mod dispatch;
pub mod errors;
pub mod fragmentation;
pub mod ingest;
pub mod packet;
pub mod reassembly;
pub mod types;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use config::{
    BlecastConfig, BroadcastConfig, ProtocolConfig, ReassemblyConfig, DEFAULT_BLE_OVERHEAD,
    LEGACY_MAX_ADVERTISING_LENGTH, TEST_COMPANY_ID,
};
pub use dispatch::{Dispatcher, MessageSink, Observation, ObservedMessage};
pub use errors::{BlecastError, PacketError, RadioError, Result};
pub use fragmentation::Fragmenter;
pub use ingest::{IngestOutcome, IngestStats, ScanEvent, ScanFilter, ScanIngest};
pub use packet::{Fragment, FragmentHeader, Packet, HEADER_SIZE, MAX_TOTAL_COUNT};
pub use reassembly::{CompletedReassembly, ReassemblyBuffer, ReassemblyKey, ReassemblyStats};
pub use types::{
    ChannelId, DeviceAddress, ManualTimeSource, MessageId, SystemTimeSource, TimeSource,
    Timestamp, DEFAULT_CHANNEL_MARKER,
};
