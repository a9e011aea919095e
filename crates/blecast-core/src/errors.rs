//! Error types for the blecast protocol
//!
//! Specific error enums describe one failure domain each and convert into the
//! crate-wide [`BlecastError`] through `#[from]`, so call sites can use `?`
//! regardless of which layer failed.

// ----------------------------------------------------------------------------
// Specific Error Types
// ----------------------------------------------------------------------------

/// Errors produced while decoding advertisement data
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PacketError {
    #[error("Advertisement carries no manufacturer data")]
    Empty,
    #[error("Fragment {sequence_index}/{total_count} carries an empty chunk")]
    EmptyChunk { sequence_index: u8, total_count: u8 },
    #[error("Fragment header inconsistent: index {sequence_index} of {total_count}")]
    InconsistentHeader { sequence_index: u8, total_count: u8 },
}

/// Errors reported by the radio collaborator
#[derive(Debug, thiserror::Error)]
pub enum RadioError {
    #[error("Failed to start advertising: {reason}")]
    AdvertiseFailed { reason: String },
    #[error("Failed to update advertised data: {reason}")]
    UpdateFailed { reason: String },
    #[error("Failed to stop advertising: {reason}")]
    StopFailed { reason: String },
    #[error("Failed to control scanning: {reason}")]
    ScanFailed { reason: String },
    #[error("Advertisement of {size} bytes exceeds radio limit of {max_size}")]
    DataTooLarge { size: usize, max_size: usize },
}

// ----------------------------------------------------------------------------
// Crate Error
// ----------------------------------------------------------------------------

/// Core error type for the blecast protocol
#[derive(Debug, thiserror::Error)]
pub enum BlecastError {
    /// Configuration cannot produce a valid packet
    #[error("Invalid configuration: {reason}")]
    InvalidConfiguration { reason: String },

    /// Adapter disabled, unsupported or permission missing
    #[error("Bluetooth unavailable: {reason}")]
    BluetoothUnavailable { reason: String },

    #[error("Payload needs {fragments} fragments (max {max})")]
    PayloadTooLarge { fragments: usize, max: usize },

    #[error("Cannot broadcast an empty payload")]
    EmptyPayload,

    #[error("Invalid packet: {0}")]
    InvalidPacket(#[from] PacketError),

    #[error("Radio error: {0}")]
    Radio(#[from] RadioError),

    /// Consumer side of a message channel went away
    #[error("Channel error: {message}")]
    Channel { message: String },
}

// ----------------------------------------------------------------------------
// Convenience Error Constructors
// ----------------------------------------------------------------------------

impl BlecastError {
    /// Create a configuration error with a reason
    pub fn config_error<T: Into<String>>(reason: T) -> Self {
        BlecastError::InvalidConfiguration {
            reason: reason.into(),
        }
    }

    /// Create an adapter availability error with a reason
    pub fn unavailable<T: Into<String>>(reason: T) -> Self {
        BlecastError::BluetoothUnavailable {
            reason: reason.into(),
        }
    }

    /// Create a channel error with a message
    pub fn channel_error<T: Into<String>>(message: T) -> Self {
        BlecastError::Channel {
            message: message.into(),
        }
    }

    /// Whether this error stems from adapter state rather than from the request
    pub fn is_adapter_state(&self) -> bool {
        matches!(self, BlecastError::BluetoothUnavailable { .. })
    }
}

/// Result alias used throughout the blecast crates
pub type Result<T> = core::result::Result<T, BlecastError>;
