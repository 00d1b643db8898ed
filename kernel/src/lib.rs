//! RelayFS Kernel
//!
//! The kernel half of a user-mode filesystem: every I/O Request Packet
//! the OS sends to a mounted volume is turned into a request message,
//! handed to a pool of user-mode workers, and completed when their answer
//! comes back.
//!
//! # Architecture Overview
//!
//! The crate follows the NT layering:
//!
//! - **ke** - Kernel Executive: events, tick count, lock ordering
//! - **io** - I/O Manager: IRPs, file objects, share access, completion
//! - **fsrtl** - File System Runtime: byte-range locks, oplocks, change
//!   notification, name utilities
//! - **relay** - The relay pipeline: control blocks, event codec, pending
//!   registry, notification channel, timeout manager, router
//!
//! # Request Lifecycle
//!
//! 1. The router applies volume policy and calls a per-operation handler
//! 2. The handler completes in-kernel or registers a pending entry
//! 3. A worker pulls the request message and answers by serial number
//! 4. The answer, a cancellation, or the timeout sweep completes the IRP,
//!    exactly one of them

#![allow(clippy::type_complexity)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::new_without_default)]
#![allow(clippy::collapsible_if)]

#[macro_use]
pub mod debug;

pub mod fsrtl;
pub mod io;
pub mod ke;
pub mod relay;
pub mod status;

pub use debug::{debug_flags, set_debug_flags, DebugFlags};
pub use status::NtStatus;
