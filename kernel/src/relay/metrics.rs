//! Volume Metrics
//!
//! Lock-free counters kept per volume and reported through the metrics
//! control call.

use core::sync::atomic::{AtomicU64, Ordering};

/// Per-volume counters
#[derive(Debug, Default)]
pub struct VolumeMetrics {
    pub fcb_allocated: AtomicU64,
    pub fcb_deleted: AtomicU64,
    pub gc_cycles: AtomicU64,
    pub gc_collected: AtomicU64,
    pub gc_forced: AtomicU64,
    /// Reopens that pulled an FCB back off the garbage list
    pub gc_cancelled: AtomicU64,
    pub pending_registered: AtomicU64,
    pub pending_answered: AtomicU64,
    pub pending_cancelled: AtomicU64,
    pub pending_timed_out: AtomicU64,
    pub oplock_deferrals: AtomicU64,
    pub retries: AtomicU64,
    pub large_write_fetches: AtomicU64,
    pub events_published: AtomicU64,
    pub events_pulled: AtomicU64,
}

/// Point-in-time copy of [`VolumeMetrics`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub fcb_allocated: u64,
    pub fcb_deleted: u64,
    pub gc_cycles: u64,
    pub gc_collected: u64,
    pub gc_forced: u64,
    pub gc_cancelled: u64,
    pub pending_registered: u64,
    pub pending_answered: u64,
    pub pending_cancelled: u64,
    pub pending_timed_out: u64,
    pub oplock_deferrals: u64,
    pub retries: u64,
    pub large_write_fetches: u64,
    pub events_published: u64,
    pub events_pulled: u64,
}

impl VolumeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            fcb_allocated: get(&self.fcb_allocated),
            fcb_deleted: get(&self.fcb_deleted),
            gc_cycles: get(&self.gc_cycles),
            gc_collected: get(&self.gc_collected),
            gc_forced: get(&self.gc_forced),
            gc_cancelled: get(&self.gc_cancelled),
            pending_registered: get(&self.pending_registered),
            pending_answered: get(&self.pending_answered),
            pending_cancelled: get(&self.pending_cancelled),
            pending_timed_out: get(&self.pending_timed_out),
            oplock_deferrals: get(&self.oplock_deferrals),
            retries: get(&self.retries),
            large_write_fetches: get(&self.large_write_fetches),
            events_published: get(&self.events_published),
            events_pulled: get(&self.events_pulled),
        }
    }
}

impl MetricsSnapshot {
    /// Number of counters in the encoded form
    pub const FIELD_COUNT: usize = 15;

    fn fields(&self) -> [u64; Self::FIELD_COUNT] {
        [
            self.fcb_allocated,
            self.fcb_deleted,
            self.gc_cycles,
            self.gc_collected,
            self.gc_forced,
            self.gc_cancelled,
            self.pending_registered,
            self.pending_answered,
            self.pending_cancelled,
            self.pending_timed_out,
            self.oplock_deferrals,
            self.retries,
            self.large_write_fetches,
            self.events_published,
            self.events_pulled,
        ]
    }

    /// Little-endian u64 per counter, in declaration order
    pub fn encode(&self) -> Vec<u8> {
        self.fields().iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    /// Live FCBs according to the counters
    pub fn live_fcbs(&self) -> u64 {
        self.fcb_allocated.saturating_sub(self.fcb_deleted)
    }
}
