//! CLI configuration
//!
//! One TOML file configures the protocol and the simulated radio used by the
//! `demo` command. Every section and key is optional:
//!
//! ```toml
//! [protocol]
//! company_id = 65535
//! ble_overhead = 27
//!
//! [broadcast]
//! cycle_dwell = 500
//!
//! [reassembly]
//! ttl = 10000
//! sweep_interval = 5000
//!
//! [demo]
//! loss_rate = 0.2
//! ```
//!
//! Durations are given in milliseconds.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use blecast_ble::LoopbackConfig;
use blecast_core::{
    BlecastConfig, BroadcastConfig, ProtocolConfig, ReassemblyConfig, LEGACY_MAX_ADVERTISING_LENGTH,
};

use crate::error::{CliError, Result};

// ----------------------------------------------------------------------------
// Application Configuration
// ----------------------------------------------------------------------------

/// Complete configuration of the CLI
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub protocol: ProtocolConfig,
    pub broadcast: BroadcastConfig,
    pub reassembly: ReassemblyConfig,
    pub demo: DemoConfig,
}

/// Simulated radio used by the demo
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DemoConfig {
    /// Fraction of scan reports lost
    pub loss_rate: f64,
    pub seed: u64,
    /// Raw advertising length the simulated radios report
    pub max_advertising_length: usize,
    /// How often the receiver hears each advertisement (ms)
    pub report_interval: u64,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            loss_rate: 0.1,
            seed: 7,
            max_advertising_length: LEGACY_MAX_ADVERTISING_LENGTH,
            report_interval: 100,
        }
    }
}

impl DemoConfig {
    pub fn loopback(&self, ble_overhead: usize) -> LoopbackConfig {
        LoopbackConfig::default()
            .with_max_advertising_length(self.max_advertising_length)
            .with_ble_overhead(ble_overhead)
            .with_report_interval(Duration::from_millis(self.report_interval))
            .with_loss_rate(self.loss_rate)
    }
}

impl AppConfig {
    /// Load and validate a TOML configuration file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading configuration file {}", path.display()))?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.node_config().validate()?;
        if !(0.0..=1.0).contains(&self.demo.loss_rate) {
            return Err(CliError::Config(format!(
                "demo.loss_rate must be between 0 and 1, got {}",
                self.demo.loss_rate
            )));
        }
        if self.demo.report_interval == 0 {
            return Err(CliError::Config("demo.report_interval must be positive".into()));
        }
        Ok(())
    }

    /// Configuration handed to each node
    pub fn node_config(&self) -> BlecastConfig {
        BlecastConfig::new()
            .with_protocol(self.protocol.clone())
            .with_broadcast(self.broadcast.clone())
            .with_reassembly(self.reassembly.clone())
    }
}
