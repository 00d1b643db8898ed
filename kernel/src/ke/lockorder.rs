//! Lock Order Verification
//!
//! Control-block locks are ranked and must be taken in ascending rank on
//! any one thread: the VCB table lock before any FCB resource. Every ranked
//! acquisition goes through [`LockOrderGuard`], which keeps a per-thread
//! stack of held ranks and records an inversion whenever a lower rank is
//! requested while a higher one is held.
//!
//! Inversions are counted (globally and per thread) and logged with a
//! captured backtrace; they are never fatal, so a test harness can assert
//! on the counters after a stress run.

use core::cell::{Cell, RefCell};
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU64, Ordering};
use std::backtrace::Backtrace;

/// Lock ranks, lowest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LockRank {
    /// VCB FCB table
    Vcb = 1,
    /// FCB resource (path, flags, share access)
    Fcb = 2,
}

static INVERSIONS: AtomicU64 = AtomicU64::new(0);

thread_local! {
    static HELD: RefCell<Vec<LockRank>> = const { RefCell::new(Vec::new()) };
    static THREAD_INVERSIONS: Cell<u64> = const { Cell::new(0) };
}

/// Total inversions observed by any thread
pub fn lock_order_inversions() -> u64 {
    INVERSIONS.load(Ordering::Relaxed)
}

/// Inversions observed by the calling thread
pub fn thread_lock_order_inversions() -> u64 {
    THREAD_INVERSIONS.with(Cell::get)
}

/// Ranks currently held by the calling thread, in acquisition order
pub fn held_ranks() -> Vec<LockRank> {
    HELD.with(|held| held.borrow().clone())
}

/// Marks one ranked lock as held for as long as it lives
#[derive(Debug)]
pub struct LockOrderGuard {
    rank: LockRank,
}

impl LockOrderGuard {
    /// Record the intent to acquire `rank`
    ///
    /// Call before blocking on the lock itself so an inversion is reported
    /// even if the acquisition then deadlocks.
    pub fn enter(rank: LockRank) -> Self {
        HELD.with(|held| {
            let mut held = held.borrow_mut();
            if let Some(&highest) = held.iter().max() {
                if highest > rank {
                    INVERSIONS.fetch_add(1, Ordering::Relaxed);
                    THREAD_INVERSIONS.with(|c| c.set(c.get() + 1));
                    log::error!(
                        "[KE] lock order inversion: acquiring {:?} while holding {:?}\n{}",
                        rank,
                        highest,
                        Backtrace::capture()
                    );
                }
            }
            held.push(rank);
        });
        Self { rank }
    }
}

impl Drop for LockOrderGuard {
    fn drop(&mut self) {
        HELD.with(|held| {
            let mut held = held.borrow_mut();
            if let Some(pos) = held.iter().rposition(|&r| r == self.rank) {
                held.remove(pos);
            }
        });
    }
}

/// A lock guard paired with its rank bookkeeping
///
/// The inner guard is declared first so the lock is released before the
/// rank is popped.
#[derive(Debug)]
pub struct Ranked<G> {
    guard: G,
    _order: LockOrderGuard,
}

impl<G> Ranked<G> {
    /// Acquire through `lock` after registering `rank`
    pub fn acquire(rank: LockRank, lock: impl FnOnce() -> G) -> Self {
        let order = LockOrderGuard::enter(rank);
        Self {
            guard: lock(),
            _order: order,
        }
    }
}

impl<G: Deref> Deref for Ranked<G> {
    type Target = G::Target;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl<G: DerefMut> DerefMut for Ranked<G> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}
