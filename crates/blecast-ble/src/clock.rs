//! Clock that follows the tokio timer
//!
//! Under a paused test runtime tokio time only advances when the runtime is
//! idle or told to; reassembly expiry driven by this clock then moves in
//! lockstep with the cycling and sweep intervals.

use blecast_core::{TimeSource, Timestamp};
use tokio::time::Instant;

/// Milliseconds elapsed on the tokio clock, offset by a starting value
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    origin: Instant,
    base_millis: u64,
}

impl TokioClock {
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    pub fn starting_at(base_millis: u64) -> Self {
        Self {
            origin: Instant::now(),
            base_millis,
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for TokioClock {
    fn now(&self) -> Timestamp {
        Timestamp::new(self.base_millis + self.origin.elapsed().as_millis() as u64)
    }
}
