//! File System Runtime Library (FSRTL)
//!
//! FSRTL provides common utilities for file system drivers:
//!
//! - **File Locks**: Byte-range locking for exclusive/shared access
//! - **Oplocks**: Opportunistic locks with deferred break waiters
//! - **Name Utilities**: Path normalization, comparison, containment
//! - **Notifications**: Directory change notifications

pub mod filelock;
pub mod name;
pub mod notify;
pub mod oplock;

pub use filelock::{lock_flags, FileLock, FileLockInfo, LockRequest};

pub use name::{
    fsrtl_are_names_equal, fsrtl_dissect_name, fsrtl_does_name_contain_wild_cards,
    fsrtl_final_component, fsrtl_normalize_path, fsrtl_parent_directory, fsrtl_path_key,
    fsrtl_relative_name, PATH_SEPARATOR, ROOT_PATH,
};

pub use notify::{
    encode_notify_information, file_action, notify_filter, NotifyEntry, NotifyList, NotifyOutcome,
};

pub use oplock::{
    fsctl_oplock, fsrtl_get_oplock_stats, oplock_break_info, BreakNotify, Oplock,
    OplockBreakRequest, OplockBreakStatus, OplockCheck, OplockContinuation, OplockFsctl,
    OplockOutcome, OplockStats, OplockType, OplockWaiter,
};
