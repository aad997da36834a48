//! Time source for checkpoint timestamps.
//!
//! The engine never reads a clock directly: checkpoint headers carry whatever
//! the mounted [`Clock`] reports, so hosts with their own timebase (and
//! tests) can substitute one.

use std::time::{SystemTime, UNIX_EPOCH};

/// A monotonic-enough source of 64-bit timestamps.
///
/// The engine only ever compares timestamps for display; ordering between
/// checkpoints is carried by log sequence numbers, not by this value.
pub trait Clock: Send + Sync {
    /// Returns the current timestamp, in seconds.
    fn now(&self) -> u64;
}

/// Wall-clock [`Clock`] counting seconds since the Unix epoch.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}
