//! Debug Verbosity
//!
//! One global set of flags decides which subsystems emit `log::debug!`
//! tracing. It is changed through the set-debug-verbosity control call.

use core::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;

bitflags! {
    /// Subsystems with debug tracing
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DebugFlags: u32 {
        /// Every routed operation
        const DISPATCH = 0x0001;
        /// Pending registry and channel traffic
        const EVENT = 0x0002;
        /// Timeout sweeps and retries
        const TIMEOUT = 0x0004;
        /// FCB table and garbage collection
        const GC = 0x0008;
        /// Oplocks, byte-range locks, notifications
        const FSRTL = 0x0010;
    }
}

static DEBUG_FLAGS: AtomicU32 = AtomicU32::new(0);

/// Current debug flags
pub fn debug_flags() -> DebugFlags {
    DebugFlags::from_bits_truncate(DEBUG_FLAGS.load(Ordering::Relaxed))
}

/// Replace the debug flags, returning the previous set
pub fn set_debug_flags(flags: DebugFlags) -> DebugFlags {
    DebugFlags::from_bits_truncate(DEBUG_FLAGS.swap(flags.bits(), Ordering::Relaxed))
}

/// `log::debug!` gated by one [`DebugFlags`] bit
macro_rules! relay_debug {
    ($flag:ident, $($arg:tt)*) => {
        if $crate::debug::debug_flags().contains($crate::debug::DebugFlags::$flag) {
            log::debug!($($arg)*);
        }
    };
}
