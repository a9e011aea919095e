//! Core types for the blecast protocol
//!
//! Newtypes keep channel identifiers, message ids and device addresses from
//! being mixed up with plain integers and byte slices.

use core::fmt;
use core::ops::{Add, Sub};
use core::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::BlecastError;

// ----------------------------------------------------------------------------
// Channel Identifier
// ----------------------------------------------------------------------------

/// Default protocol marker carried in the low byte of every channel UUID
pub const DEFAULT_CHANNEL_MARKER: u8 = 0x00;

/// Application channel: a 128-bit service UUID whose low byte is the protocol marker
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChannelId(Uuid);

impl ChannelId {
    /// Wrap an existing UUID without touching its marker byte
    pub fn new(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Generate a random channel carrying `marker` in its low byte
    pub fn generate(marker: u8) -> Self {
        Self::with_marker(Uuid::new_v4(), marker)
    }

    /// Overwrite the low byte of `uuid` with `marker`
    pub fn with_marker(uuid: Uuid, marker: u8) -> Self {
        let mut bytes = *uuid.as_bytes();
        bytes[15] = marker;
        Self(Uuid::from_bytes(bytes))
    }

    /// Low byte of the identifier
    pub fn marker(&self) -> u8 {
        self.0.as_bytes()[15]
    }

    /// Whether this channel belongs to the protocol identified by `marker`
    pub fn carries_marker(&self, marker: u8) -> bool {
        self.marker() == marker
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl From<Uuid> for ChannelId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for ChannelId {
    type Err = BlecastError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| BlecastError::config_error(format!("Invalid channel UUID '{}': {}", s, e)))
    }
}

// ----------------------------------------------------------------------------
// Message Identifier
// ----------------------------------------------------------------------------

/// Identifier shared by all fragments of one multi-packet message
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId(u8);

impl MessageId {
    pub fn new(value: u8) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ----------------------------------------------------------------------------
// Device Address
// ----------------------------------------------------------------------------

/// Bluetooth device address of the advertiser an event was heard from
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceAddress([u8; 6]);

impl DeviceAddress {
    pub fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|b| hex::encode_upper([*b])).collect();
        write!(f, "{}", parts.join(":"))
    }
}

impl FromStr for DeviceAddress {
    type Err = BlecastError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || BlecastError::config_error(format!("Invalid device address '{}'", s));

        let mut bytes = [0u8; 6];
        let mut parts = s.split(':');
        for byte in bytes.iter_mut() {
            let part = parts.next().ok_or_else(invalid)?;
            let decoded = hex::decode(part).map_err(|_| invalid())?;
            if decoded.len() != 1 {
                return Err(invalid());
            }
            *byte = decoded[0];
        }
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(Self(bytes))
    }
}

// ----------------------------------------------------------------------------
// Timestamp
// ----------------------------------------------------------------------------

/// Millisecond timestamp since Unix epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Add<u64> for Timestamp {
    type Output = Timestamp;

    fn add(self, other: u64) -> Timestamp {
        Timestamp(self.0.saturating_add(other))
    }
}

impl Sub for Timestamp {
    type Output = u64;

    fn sub(self, other: Timestamp) -> u64 {
        self.0.saturating_sub(other.0)
    }
}

impl Timestamp {
    pub fn new(millis: u64) -> Self {
        Self(millis)
    }

    /// Current wall-clock time
    pub fn now() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(duration.as_millis() as u64)
    }

    pub fn as_millis(&self) -> u64 {
        self.0
    }

    /// Duration elapsed since `earlier`, zero if `earlier` is in the future
    pub fn duration_since(&self, earlier: Self) -> core::time::Duration {
        core::time::Duration::from_millis(self.0.saturating_sub(earlier.0))
    }
}

// ----------------------------------------------------------------------------
// Time Source
// ----------------------------------------------------------------------------

/// Source of timestamps, injectable so expiry can be tested without sleeping
pub trait TimeSource: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Wall-clock time source
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

/// Manually advanced time source; clones share the same clock
#[derive(Debug, Clone, Default)]
pub struct ManualTimeSource {
    current: Arc<AtomicU64>,
}

impl ManualTimeSource {
    pub fn new_at(start_millis: u64) -> Self {
        Self {
            current: Arc::new(AtomicU64::new(start_millis)),
        }
    }

    /// Advance the clock by `millis`
    pub fn advance(&self, millis: u64) {
        self.current.fetch_add(millis, Ordering::SeqCst);
    }

    pub fn set(&self, millis: u64) {
        self.current.store(millis, Ordering::SeqCst);
    }
}

impl TimeSource for ManualTimeSource {
    fn now(&self) -> Timestamp {
        Timestamp(self.current.load(Ordering::SeqCst))
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_marker() {
        let channel = ChannelId::generate(0x00);
        assert_eq!(channel.marker(), 0x00);
        assert!(channel.carries_marker(0x00));
        assert!(!channel.carries_marker(0x01));

        let uuid = Uuid::from_u128(0x6E400001_B5A3_F393_E0A9_E50E24DCCA9E);
        let channel = ChannelId::with_marker(uuid, 0x00);
        assert_eq!(
            channel.to_string(),
            "6e400001-b5a3-f393-e0a9-e50e24dcca00"
        );
    }

    #[test]
    fn test_channel_parse() {
        let channel: ChannelId = "6e400001-b5a3-f393-e0a9-e50e24dcca00".parse().unwrap();
        assert!(channel.carries_marker(0x00));
        assert!("not-a-uuid".parse::<ChannelId>().is_err());
    }

    #[test]
    fn test_device_address_round_trip() {
        let address = DeviceAddress::new([0xAA, 0xBB, 0xCC, 0x01, 0x02, 0x03]);
        assert_eq!(address.to_string(), "AA:BB:CC:01:02:03");
        assert_eq!("AA:BB:CC:01:02:03".parse::<DeviceAddress>().unwrap(), address);
        assert!("AA:BB:CC".parse::<DeviceAddress>().is_err());
        assert!("AA:BB:CC:01:02:03:04".parse::<DeviceAddress>().is_err());
        assert!("GG:BB:CC:01:02:03".parse::<DeviceAddress>().is_err());
    }

    #[test]
    fn test_manual_time_source() {
        let clock = ManualTimeSource::new_at(1_000);
        let shared = clock.clone();
        clock.advance(500);
        assert_eq!(shared.now(), Timestamp::new(1_500));
        assert_eq!(
            shared.now().duration_since(Timestamp::new(1_000)),
            core::time::Duration::from_millis(500)
        );
        assert_eq!(Timestamp::new(10) - Timestamp::new(20), 0);
    }
}
