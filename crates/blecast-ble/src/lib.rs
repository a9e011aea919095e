//! Radio runtime for the blecast protocol
//!
//! This crate drives the pure protocol in `blecast-core` against a radio:
//!
//! - [`radio`] - the [`Advertiser`] and [`Scanner`] seams, an in-memory
//!   loopback medium, and a BlueZ/btleplug backend behind the `bluez` feature
//! - [`session`] - one message's lifecycle on one channel, including the
//!   fragment cycling task
//! - [`broadcaster`] - one session per channel with replace semantics
//! - [`pipeline`] - scan ingestion and reassembly expiry tasks
//! - [`node`] - the application-facing [`BlecastNode`]
//!
//! ## Usage
//!
//! ```rust,no_run
//! use blecast_ble::{BlecastNode, LoopbackAir};
//! use blecast_core::{BlecastConfig, ChannelId, ScanFilter};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let air = LoopbackAir::default();
//! let (alice_radio, bob_radio) = (air.radio(), air.radio());
//! let alice = BlecastNode::new(BlecastConfig::default(), alice_radio.clone(), alice_radio)?;
//! let bob = BlecastNode::new(BlecastConfig::default(), bob_radio.clone(), bob_radio)?;
//!
//! let mut messages = bob.subscribe();
//! bob.scan(ScanFilter::any()).await?;
//! alice.broadcast(ChannelId::generate(0x00), b"Hello World!").await?;
//!
//! while let Some(message) = messages.recv().await {
//!     println!("{} bytes from {}", message.payload().len(), message.source_address());
//! }
//! # Ok(())
//! # }
//! ```

pub mod broadcaster;
pub mod clock;
pub mod error;
pub mod node;
pub mod pipeline;
pub mod radio;
pub mod session;

pub use broadcaster::{BroadcastStats, Broadcaster};
pub use clock::TokioClock;
pub use error::BleError;
pub use node::{BlecastNode, SubscriberSink};
pub use pipeline::ScanPipeline;
pub use radio::loopback::{LoopbackAir, LoopbackConfig, LoopbackRadio};
pub use radio::{AdapterState, Advertiser, ScanEventStream, Scanner};
pub use session::{BroadcastOutcome, BroadcastSession, MessageIdAllocator, SessionState};

#[cfg(feature = "bluez")]
pub use radio::bluez::{BluezAdvertiser, BtleplugScanner};
