//! Error types for radio backends

use blecast_core::{BlecastError, RadioError};
use thiserror::Error;

// ----------------------------------------------------------------------------
// Error Types
// ----------------------------------------------------------------------------

/// Failures raised inside a radio backend
#[derive(Error, Debug)]
pub enum BleError {
    #[error("BLE adapter not available: {0}")]
    AdapterNotAvailable(String),

    #[error("Advertisement too large: {size} bytes (max: {max_size})")]
    AdvertisementTooLarge { size: usize, max_size: usize },

    #[error("Failed to register advertisement: {0}")]
    AdvertiseFailed(String),

    #[error("Failed to get BLE events: {0}")]
    EventStreamFailed(String),

    #[error("Scan control failed: {0}")]
    ScanFailed(String),

    #[error("Scan already running")]
    AlreadyScanning,
}

// ----------------------------------------------------------------------------
// Conversions
// ----------------------------------------------------------------------------

impl From<BleError> for BlecastError {
    fn from(err: BleError) -> Self {
        match err {
            BleError::AdapterNotAvailable(reason) => BlecastError::unavailable(reason),
            BleError::AdvertisementTooLarge { size, max_size } => {
                BlecastError::Radio(RadioError::DataTooLarge { size, max_size })
            }
            BleError::AdvertiseFailed(reason) => {
                BlecastError::Radio(RadioError::AdvertiseFailed { reason })
            }
            BleError::EventStreamFailed(reason) | BleError::ScanFailed(reason) => {
                BlecastError::Radio(RadioError::ScanFailed { reason })
            }
            BleError::AlreadyScanning => BlecastError::Radio(RadioError::ScanFailed {
                reason: "scan already running".to_string(),
            }),
        }
    }
}
