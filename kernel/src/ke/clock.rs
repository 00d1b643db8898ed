//! Tick Count
//!
//! Deadlines in the relay are expressed in milliseconds of a monotonic tick
//! count (KeQueryTickCount). The source is pluggable so timeout sweeps can
//! be driven by simulated time.

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Monotonic millisecond tick source
pub trait TickSource: Send + Sync + fmt::Debug {
    /// Milliseconds since an arbitrary fixed origin
    fn tick_count(&self) -> u64;
}

/// Shared handle to a tick source
pub type SharedClock = Arc<dyn TickSource>;

/// Wall tick count backed by `Instant`
#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    pub fn shared() -> SharedClock {
        Arc::new(Self::new())
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TickSource for SystemClock {
    fn tick_count(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

/// Tick count that only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock {
    ticks: AtomicU64,
}

impl ManualClock {
    pub const fn new(start: u64) -> Self {
        Self {
            ticks: AtomicU64::new(start),
        }
    }

    /// Move time forward by `ms` milliseconds, returning the new tick count
    pub fn advance(&self, ms: u64) -> u64 {
        self.ticks.fetch_add(ms, Ordering::SeqCst) + ms
    }

    pub fn set(&self, ticks: u64) {
        self.ticks.store(ticks, Ordering::SeqCst);
    }
}

impl TickSource for ManualClock {
    fn tick_count(&self) -> u64 {
        self.ticks.load(Ordering::SeqCst)
    }
}
