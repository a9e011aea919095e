//! Radio collaborator seams
//!
//! The protocol never talks to an adapter directly. Sending goes through
//! [`Advertiser`], receiving through [`Scanner`]; backends implement both for
//! a real stack (`bluez` feature) or an in-memory medium ([`loopback`]).

#[cfg(feature = "bluez")]
pub mod bluez;
pub mod loopback;

use futures::stream::BoxStream;

use blecast_core::{BlecastError, ChannelId, Result, ScanEvent};

// ----------------------------------------------------------------------------
// Adapter State
// ----------------------------------------------------------------------------

/// Power and permission state of the local adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    On,
    Off,
    /// Permission to use Bluetooth was denied
    Unauthorized,
    Unsupported,
}

impl AdapterState {
    /// Fail with `BluetoothUnavailable` unless the adapter is usable
    pub fn ensure_available(self) -> Result<()> {
        match self {
            AdapterState::On => Ok(()),
            AdapterState::Off => Err(BlecastError::unavailable("Bluetooth adapter is powered off")),
            AdapterState::Unauthorized => Err(BlecastError::unavailable(
                "Bluetooth permission has not been granted",
            )),
            AdapterState::Unsupported => Err(BlecastError::unavailable(
                "No Bluetooth LE adapter on this system",
            )),
        }
    }
}

// ----------------------------------------------------------------------------
// Radio Traits
// ----------------------------------------------------------------------------

/// Stream of advertisement reports produced while scanning
pub type ScanEventStream = BoxStream<'static, ScanEvent>;

/// Sending half of the radio
///
/// One advertisement is kept per channel. `update_advertising` replaces its
/// manufacturer data in place; implementations without in-place update may
/// restart the advertisement.
#[async_trait::async_trait]
pub trait Advertiser: Send + Sync + 'static {
    async fn adapter_state(&self) -> AdapterState;

    /// Raw advertising data limit of the adapter in bytes
    async fn max_advertising_length(&self) -> Result<usize>;

    async fn start_advertising(&self, channel: ChannelId, company_id: u16, data: Vec<u8>) -> Result<()>;

    async fn update_advertising(&self, channel: ChannelId, company_id: u16, data: Vec<u8>) -> Result<()>;

    /// Stop advertising on `channel`; a channel not advertised is not an error
    async fn stop_advertising(&self, channel: ChannelId) -> Result<()>;
}

/// Receiving half of the radio
#[async_trait::async_trait]
pub trait Scanner: Send + Sync + 'static {
    async fn adapter_state(&self) -> AdapterState;

    /// Begin scanning and hand out the report stream
    async fn start_scan(&self) -> Result<ScanEventStream>;

    async fn stop_scan(&self) -> Result<()>;
}
