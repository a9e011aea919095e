//! Centralized configuration
//!
//! All tunables of the protocol live here so that one value can be loaded from
//! a file and passed to both the sending and the receiving side.

use core::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{BlecastError, Result};
use crate::packet::HEADER_SIZE;
use crate::types::DEFAULT_CHANNEL_MARKER;

/// Company identifier reserved for testing (Bluetooth SIG 0xFFFF)
pub const TEST_COMPANY_ID: u16 = 0xFFFF;

/// Legacy advertising data limit in bytes
pub const LEGACY_MAX_ADVERTISING_LENGTH: usize = 31;

/// Bytes consumed by the service UUID and manufacturer AD structures
pub const DEFAULT_BLE_OVERHEAD: usize = 27;

// ----------------------------------------------------------------------------
// Protocol Configuration
// ----------------------------------------------------------------------------

/// Framing parameters shared by every device speaking the protocol
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Manufacturer company identifier the payload is registered under
    pub company_id: u16,
    /// Low byte every channel UUID of this application carries
    pub channel_marker: u8,
    /// Advertisement bytes not available to the manufacturer payload
    pub ble_overhead: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            company_id: TEST_COMPANY_ID,
            channel_marker: DEFAULT_CHANNEL_MARKER,
            ble_overhead: DEFAULT_BLE_OVERHEAD,
        }
    }
}

impl ProtocolConfig {
    pub fn with_company_id(mut self, company_id: u16) -> Self {
        self.company_id = company_id;
        self
    }

    pub fn with_channel_marker(mut self, marker: u8) -> Self {
        self.channel_marker = marker;
        self
    }

    pub fn with_ble_overhead(mut self, overhead: usize) -> Self {
        self.ble_overhead = overhead;
        self
    }

    /// Manufacturer payload bytes available per advertisement for a radio
    /// whose raw advertising limit is `raw_max_length`
    pub fn payload_budget(&self, raw_max_length: usize) -> Result<usize> {
        let budget = raw_max_length.saturating_sub(self.ble_overhead);
        if budget <= HEADER_SIZE {
            return Err(BlecastError::config_error(format!(
                "Advertising length {} leaves {} payload bytes after {} bytes of overhead, \
                 fragment header needs more than {}",
                raw_max_length, budget, self.ble_overhead, HEADER_SIZE
            )));
        }
        Ok(budget)
    }
}

// ----------------------------------------------------------------------------
// Broadcast Configuration
// ----------------------------------------------------------------------------

/// Sender-side cycling parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    /// Time each fragment stays on the air before the next one replaces it
    #[serde(with = "duration_millis")]
    pub cycle_dwell: Duration,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            cycle_dwell: Duration::from_millis(500),
        }
    }
}

impl BroadcastConfig {
    pub fn with_cycle_dwell(mut self, dwell: Duration) -> Self {
        self.cycle_dwell = dwell;
        self
    }
}

// ----------------------------------------------------------------------------
// Reassembly Configuration
// ----------------------------------------------------------------------------

/// Receiver-side buffering parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReassemblyConfig {
    /// Incomplete entries not touched for this long are dropped
    #[serde(with = "duration_millis")]
    pub ttl: Duration,
    /// Period of the expiry sweep
    #[serde(with = "duration_millis")]
    pub sweep_interval: Duration,
    /// Upper bound on concurrently buffered messages
    pub max_entries: usize,
}

impl Default for ReassemblyConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(5),
            max_entries: 256,
        }
    }
}

impl ReassemblyConfig {
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }
}

// ----------------------------------------------------------------------------
// Combined Configuration
// ----------------------------------------------------------------------------

/// Complete configuration of a blecast node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlecastConfig {
    pub protocol: ProtocolConfig,
    pub broadcast: BroadcastConfig,
    pub reassembly: ReassemblyConfig,
}

impl BlecastConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_protocol(mut self, protocol: ProtocolConfig) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_broadcast(mut self, broadcast: BroadcastConfig) -> Self {
        self.broadcast = broadcast;
        self
    }

    pub fn with_reassembly(mut self, reassembly: ReassemblyConfig) -> Self {
        self.reassembly = reassembly;
        self
    }

    /// Reject values that cannot drive a working node
    pub fn validate(&self) -> Result<()> {
        if self.protocol.company_id == 0 {
            return Err(BlecastError::config_error("Company id 0x0000 is not valid"));
        }
        if self.broadcast.cycle_dwell.is_zero() {
            return Err(BlecastError::config_error("Cycle dwell must be positive"));
        }
        if self.reassembly.ttl.is_zero() {
            return Err(BlecastError::config_error("Reassembly TTL must be positive"));
        }
        if self.reassembly.sweep_interval.is_zero() {
            return Err(BlecastError::config_error("Sweep interval must be positive"));
        }
        if self.reassembly.max_entries == 0 {
            return Err(BlecastError::config_error(
                "Reassembly buffer must hold at least one entry",
            ));
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Serde Helpers
// ----------------------------------------------------------------------------

mod duration_millis {
    use core::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = BlecastConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.broadcast.cycle_dwell, Duration::from_millis(500));
        assert_eq!(config.reassembly.ttl, Duration::from_secs(10));
    }

    #[test]
    fn test_zero_company_id_rejected() {
        let config = BlecastConfig::new()
            .with_protocol(ProtocolConfig::default().with_company_id(0));
        assert!(matches!(
            config.validate(),
            Err(BlecastError::InvalidConfiguration { .. })
        ));
    }

    #[test]
    fn test_payload_budget() {
        let protocol = ProtocolConfig::default();
        // Legacy advertising leaves 4 bytes: one chunk byte per fragment
        assert_eq!(protocol.payload_budget(LEGACY_MAX_ADVERTISING_LENGTH).unwrap(), 4);
        assert_eq!(protocol.payload_budget(251).unwrap(), 224);
        assert!(protocol.payload_budget(30).is_err());
        assert!(protocol.payload_budget(0).is_err());

        let bare = ProtocolConfig::default().with_ble_overhead(0);
        assert_eq!(bare.payload_budget(10).unwrap(), 10);
    }
}
