//! Kernel Executive (ke)
//!
//! The primitives the relay pipeline is built on:
//!
//! - **Events**: KEVENT notification / synchronization objects
//! - **Tick count**: pluggable millisecond clock for deadlines
//! - **Lock ranks**: per-thread lock order verification

pub mod clock;
pub mod event;
pub mod lockorder;

pub use clock::{ManualClock, SharedClock, SystemClock, TickSource};
pub use event::{EventType, KEvent};
pub use lockorder::{LockOrderGuard, LockRank, Ranked};
