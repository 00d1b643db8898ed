//! Mount Configuration
//!
//! Everything a volume is started with. Options are fixed for the life of
//! the mount, except the pending timeout which user mode may change.

use std::sync::Arc;

use bitflags::bitflags;

use crate::ke::{ManualClock, SharedClock, SystemClock};

/// Default time a pending request may wait for user mode
pub const DEFAULT_IRP_TIMEOUT_MS: u64 = 15 * 1000;
/// Bounds for a user supplied timeout
pub const MIN_IRP_TIMEOUT_MS: u64 = 15 * 1000;
pub const MAX_IRP_TIMEOUT_MS: u64 = 5 * 60 * 1000;
/// Timeout thread wake interval
pub const TIMEOUT_CHECK_INTERVAL_MS: u64 = 1000;
/// Default garbage collection interval (0 disables collection)
pub const DEFAULT_GC_INTERVAL_MS: u64 = 2000;
/// Largest request message published inline; larger writes go two-phase
pub const EVENT_CONTEXT_MAX_SIZE: usize = 32 * 1024;
/// Pending entries allowed per device
pub const DEFAULT_MAX_PENDING_REQUESTS: usize = 64 * 1024;
/// Table size past which a miss forces a collection
pub const DEFAULT_FCB_SOFT_LIMIT: usize = 4096;

/// Reserved path whose handle keeps the volume alive
pub const KEEPALIVE_FILE_NAME: &str = "\\__drive_fs_keepalive";

bitflags! {
    /// Mount flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MountFlags: u32 {
        /// Reject every mutating operation
        const WRITE_PROTECT = 0x0001;
        /// Paths compare case sensitively
        const CASE_SENSITIVE = 0x0002;
        /// Allow `name:stream` paths
        const ALT_STREAM = 0x0004;
        /// Mounted as a network redirector
        const NETWORK = 0x0008;
        /// Report removable media
        const REMOVABLE = 0x0010;
        /// Relay byte-range locks to user mode instead of arbitrating them
        const FILELOCK_USER_MODE = 0x0020;
        /// Pull returns as many messages as fit
        const EVENT_BATCHING = 0x0040;
        /// Volume announced through the mount manager
        const MOUNT_MANAGER = 0x0080;
    }
}

/// Options a filesystem is started with
#[derive(Debug, Clone)]
pub struct MountOptions {
    /// Mount point, e.g. `M:` or a directory
    pub mount_point: String,
    /// UNC name for network mounts
    pub unc_name: Option<String>,
    pub flags: MountFlags,
    /// Pending request timeout
    pub irp_timeout_ms: u64,
    /// Timeout thread interval
    pub timeout_check_interval_ms: u64,
    /// Garbage collection interval, 0 deletes FCBs on last release
    pub gc_interval_ms: u64,
    /// FCB count that makes a table miss force a collection
    pub fcb_soft_limit: usize,
    /// Pending entries allowed before registration fails
    pub max_pending_requests: usize,
    /// Tick source for deadlines
    pub clock: SharedClock,
    /// Start the timeout and collector threads at mount
    pub background_threads: bool,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            mount_point: String::new(),
            unc_name: None,
            flags: MountFlags::empty(),
            irp_timeout_ms: DEFAULT_IRP_TIMEOUT_MS,
            timeout_check_interval_ms: TIMEOUT_CHECK_INTERVAL_MS,
            gc_interval_ms: DEFAULT_GC_INTERVAL_MS,
            fcb_soft_limit: DEFAULT_FCB_SOFT_LIMIT,
            max_pending_requests: DEFAULT_MAX_PENDING_REQUESTS,
            clock: SystemClock::shared(),
            background_threads: true,
        }
    }
}

impl MountOptions {
    pub fn new(mount_point: impl Into<String>) -> Self {
        Self {
            mount_point: mount_point.into(),
            ..Self::default()
        }
    }

    pub fn with_flags(mut self, flags: MountFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_unc_name(mut self, unc_name: impl Into<String>) -> Self {
        self.unc_name = Some(unc_name.into());
        self.flags |= MountFlags::NETWORK;
        self
    }

    pub fn with_irp_timeout_ms(mut self, ms: u64) -> Self {
        self.irp_timeout_ms = ms;
        self
    }

    pub fn with_gc_interval_ms(mut self, ms: u64) -> Self {
        self.gc_interval_ms = ms;
        self
    }

    pub fn with_fcb_soft_limit(mut self, limit: usize) -> Self {
        self.fcb_soft_limit = limit;
        self
    }

    pub fn with_max_pending_requests(mut self, max: usize) -> Self {
        self.max_pending_requests = max;
        self
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Simulated time, no background threads; sweeps are driven by hand
    pub fn manual(mut self, clock: Arc<ManualClock>) -> Self {
        self.clock = clock;
        self.background_threads = false;
        self
    }

    pub fn is_read_only(&self) -> bool {
        self.flags.contains(MountFlags::WRITE_PROTECT)
    }

    pub fn is_case_sensitive(&self) -> bool {
        self.flags.contains(MountFlags::CASE_SENSITIVE)
    }

    pub fn allows_streams(&self) -> bool {
        self.flags.contains(MountFlags::ALT_STREAM)
    }
}

/// Clamp a user supplied pending timeout
pub fn clamp_irp_timeout(ms: u64) -> u64 {
    ms.clamp(MIN_IRP_TIMEOUT_MS, MAX_IRP_TIMEOUT_MS)
}
