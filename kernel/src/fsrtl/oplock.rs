//! Opportunistic Lock (Oplock) Support
//!
//! Oplocks let a client cache file data locally. When another handle
//! requests access that would invalidate that cache, the oplock is
//! "broken" and the caching client must flush before the other operation
//! may proceed.
//!
//! Oplock types:
//! - Level 1 (Exclusive): can cache reads and writes
//! - Batch: exclusive, additionally delays close
//! - Filter: exclusive, non-breaking for reads
//! - Level 2 (Shared): multiple readers, can cache reads only
//!
//! # Break Flow
//! 1. A conflicting operation calls [`Oplock::check`]
//! 2. No conflict: `Proceed`. Level 2 conflict: holders are told and the
//!    operation proceeds. Exclusive conflict: the holder's pending request
//!    IRP is completed with `FILE_OPLOCK_BROKEN_TO_*` and the operation is
//!    parked as a waiter (`Deferred`) together with its continuation
//! 3. The holder flushes and acknowledges through an FSCTL
//! 4. Acknowledge (or release, or break timeout) hands back every waiter;
//!    the caller resumes them after dropping its lock
//!
//! Nothing in here completes IRPs or runs continuations while `&mut self`
//! is borrowed: the work is returned as [`BreakNotify`] / [`OplockWaiter`]
//! values for the caller to deliver once the owning lock is released.

use std::sync::Arc;

use crate::io::{io_complete_request, Irp};
use crate::status::{
    NtStatus, STATUS_CANCELLED, STATUS_INSUFFICIENT_RESOURCES, STATUS_INVALID_OPLOCK_PROTOCOL,
    STATUS_OPLOCK_NOT_GRANTED, STATUS_PENDING, STATUS_SUCCESS,
};

/// Oplock types
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OplockType {
    /// No oplock held
    None = 0,
    /// Level 1 - exclusive, can cache reads and writes
    Level1 = 1,
    /// Batch oplock - exclusive with delayed close
    Batch = 2,
    /// Filter oplock - non-breaking shared read
    Filter = 3,
    /// Level 2 - shared, can cache reads
    Level2 = 4,
}

/// Oplock break status
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OplockBreakStatus {
    /// No break in progress
    None = 0,
    /// Breaking to Level 2
    ToLevel2 = 1,
    /// Breaking to None
    ToNone = 2,
}

/// Oplock flags
pub mod oplock_flags {
    /// Pending oplock break
    pub const OPLOCK_FLAG_BREAK_IN_PROGRESS: u32 = 0x0001;
    /// Break notification has been sent
    pub const OPLOCK_FLAG_BREAK_NOTIFY_SENT: u32 = 0x0004;
    /// Pending close for batch oplock
    pub const OPLOCK_FLAG_CLOSE_PENDING: u32 = 0x0020;
}

/// FSCTL codes for oplock operations
pub mod fsctl_oplock {
    /// Request a Level 1 oplock
    pub const FSCTL_REQUEST_OPLOCK_LEVEL_1: u32 = 0x00090000;
    /// Request a Level 2 oplock
    pub const FSCTL_REQUEST_OPLOCK_LEVEL_2: u32 = 0x00090004;
    /// Request a Batch oplock
    pub const FSCTL_REQUEST_BATCH_OPLOCK: u32 = 0x00090008;
    /// Acknowledge an oplock break
    pub const FSCTL_OPLOCK_BREAK_ACKNOWLEDGE: u32 = 0x0009000C;
    /// Close pending (Batch oplock)
    pub const FSCTL_OPBATCH_ACK_CLOSE_PENDING: u32 = 0x00090010;
    /// Notify when oplock break occurs
    pub const FSCTL_OPLOCK_BREAK_NOTIFY: u32 = 0x00090014;
    /// Request a Filter oplock
    pub const FSCTL_REQUEST_FILTER_OPLOCK: u32 = 0x0009005C;
    /// Acknowledge break to no oplock
    pub const FSCTL_OPLOCK_BREAK_ACK_NO_2: u32 = 0x00090050;

    pub fn is_oplock_fsctl(code: u32) -> bool {
        matches!(
            code,
            FSCTL_REQUEST_OPLOCK_LEVEL_1
                | FSCTL_REQUEST_OPLOCK_LEVEL_2
                | FSCTL_REQUEST_BATCH_OPLOCK
                | FSCTL_OPLOCK_BREAK_ACKNOWLEDGE
                | FSCTL_OPBATCH_ACK_CLOSE_PENDING
                | FSCTL_OPLOCK_BREAK_NOTIFY
                | FSCTL_REQUEST_FILTER_OPLOCK
                | FSCTL_OPLOCK_BREAK_ACK_NO_2
        )
    }
}

/// FILE_OPLOCK_BROKEN_TO_* constants for IoStatusBlock.Information
pub mod oplock_break_info {
    /// Oplock broken to Level 2
    pub const FILE_OPLOCK_BROKEN_TO_LEVEL_2: usize = 0x00000007;
    /// Oplock broken to None
    pub const FILE_OPLOCK_BROKEN_TO_NONE: usize = 0x00000008;
}

/// Request types that can break an oplock
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OplockBreakRequest {
    /// Read request
    Read = 0,
    /// Write request
    Write = 1,
    /// Handle create with write access
    HandleCreate = 2,
    /// Lock request
    Lock = 3,
    /// Flush request
    Flush = 4,
    /// Close handle (for batch)
    Close = 5,
    /// Metadata or security change
    SetInformation = 6,
}

/// Resumes a deferred operation once the break resolves
///
/// Called with STATUS_SUCCESS when the operation may proceed, or with the
/// failure status when it must be completed instead.
pub type OplockContinuation = Box<dyn FnOnce(NtStatus) + Send>;

/// Result of checking an operation against the oplock
pub enum OplockOutcome {
    /// No conflict; continue building the request
    Proceed,
    /// Complete the operation with this status
    Fail(NtStatus),
    /// Parked as a waiter; the oplock now owns the operation
    Deferred,
}

impl core::fmt::Debug for OplockOutcome {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Proceed => f.write_str("Proceed"),
            Self::Fail(status) => write!(f, "Fail({:#010x})", *status as u32),
            Self::Deferred => f.write_str("Deferred"),
        }
    }
}

/// An operation waiting for a break to resolve
pub struct OplockWaiter {
    /// Handle performing the operation
    pub owner: u64,
    /// Request that caused the break
    pub break_request: OplockBreakRequest,
    /// Tick count when the wait was queued
    pub queue_tick: u64,
    continuation: OplockContinuation,
}

impl OplockWaiter {
    /// Resume the operation
    pub fn resume(self, status: NtStatus) {
        update_stats(|s| s.waiters_completed += 1);
        (self.continuation)(status);
    }
}

impl core::fmt::Debug for OplockWaiter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("OplockWaiter")
            .field("owner", &self.owner)
            .field("break_request", &self.break_request)
            .field("queue_tick", &self.queue_tick)
            .finish()
    }
}

/// A break notification to deliver to an oplock holder
#[derive(Debug)]
pub struct BreakNotify {
    irp: Arc<Irp>,
    information: usize,
}

impl BreakNotify {
    /// Complete the holder's pending oplock request
    pub fn deliver(self) {
        if self.irp.clear_cancel_routine() {
            self.irp.set_information(self.information);
            io_complete_request(&self.irp, STATUS_SUCCESS);
        }
    }
}

/// Outcome of [`Oplock::check`], plus notifications to deliver unlocked
#[derive(Debug)]
pub struct OplockCheck {
    pub outcome: OplockOutcome,
    pub notify: Vec<BreakNotify>,
}

/// Outcome of [`Oplock::fsctrl`]
#[derive(Debug)]
pub struct OplockFsctl {
    /// STATUS_PENDING means the IRP was retained by the oplock
    pub status: NtStatus,
    /// Waiters released by an acknowledgement
    pub released: Vec<OplockWaiter>,
}

/// Maximum waiters for one oplock break
const MAX_OPLOCK_WAITERS: usize = 64;

/// Default break timeout in milliseconds
pub const OPLOCK_BREAK_TIMEOUT_MS: u64 = 35_000;

/// Level 2 oplock holder info
#[derive(Debug)]
struct Level2Holder {
    owner: u64,
    irp: Option<Arc<Irp>>,
}

/// Oplock statistics for monitoring
#[derive(Debug, Clone, Copy, Default)]
pub struct OplockStats {
    /// Total oplocks granted
    pub total_granted: u64,
    /// Level 1 oplocks granted
    pub level1_granted: u64,
    /// Batch oplocks granted
    pub batch_granted: u64,
    /// Filter oplocks granted
    pub filter_granted: u64,
    /// Level 2 oplocks granted
    pub level2_granted: u64,
    /// Total oplock breaks initiated
    pub total_breaks: u64,
    /// Breaks to Level 2
    pub breaks_to_level2: u64,
    /// Breaks to None
    pub breaks_to_none: u64,
    /// Break acknowledgements received
    pub break_acks: u64,
    /// Breaks forced by timeout
    pub break_timeouts: u64,
    /// Waiters queued for break completion
    pub waiters_queued: u64,
    /// Waiters completed
    pub waiters_completed: u64,
}

/// Global oplock statistics
static OPLOCK_STATS: spin::Mutex<OplockStats> = spin::Mutex::new(OplockStats {
    total_granted: 0,
    level1_granted: 0,
    batch_granted: 0,
    filter_granted: 0,
    level2_granted: 0,
    total_breaks: 0,
    breaks_to_level2: 0,
    breaks_to_none: 0,
    break_acks: 0,
    break_timeouts: 0,
    waiters_queued: 0,
    waiters_completed: 0,
});

/// Get current oplock statistics
pub fn fsrtl_get_oplock_stats() -> OplockStats {
    *OPLOCK_STATS.lock()
}

/// Update global oplock statistics
fn update_stats<F: FnOnce(&mut OplockStats)>(f: F) {
    let mut stats = OPLOCK_STATS.lock();
    f(&mut stats);
}

/// Oplock structure
///
/// Manages opportunistic locks for a single file. Owners are handle ids.
#[derive(Debug)]
pub struct Oplock {
    /// Current oplock type
    oplock_type: OplockType,
    /// Oplock flags
    flags: u32,
    /// Handle holding the exclusive oplock
    exclusive_owner: u64,
    /// Pending request IRP of the exclusive holder
    exclusive_irp: Option<Arc<Irp>>,
    /// Current break status
    break_status: OplockBreakStatus,
    /// Tick count when the current break started
    break_started: u64,
    /// Level 2 holders
    level2_holders: Vec<Level2Holder>,
    /// Waiters for break completion
    waiters: Vec<OplockWaiter>,
    /// Break timeout in milliseconds
    break_timeout_ms: u64,
}

impl Oplock {
    pub const fn new() -> Self {
        Self {
            oplock_type: OplockType::None,
            flags: 0,
            exclusive_owner: 0,
            exclusive_irp: None,
            break_status: OplockBreakStatus::None,
            break_started: 0,
            level2_holders: Vec::new(),
            waiters: Vec::new(),
            break_timeout_ms: OPLOCK_BREAK_TIMEOUT_MS,
        }
    }

    /// Check if an oplock is held
    pub fn is_oplock_held(&self) -> bool {
        self.oplock_type != OplockType::None
    }

    /// Check if a break is in progress
    pub fn is_break_in_progress(&self) -> bool {
        self.flags & oplock_flags::OPLOCK_FLAG_BREAK_IN_PROGRESS != 0
    }

    /// Check if this is an exclusive oplock (Level 1, Batch, or Filter)
    pub fn is_exclusive(&self) -> bool {
        matches!(
            self.oplock_type,
            OplockType::Level1 | OplockType::Batch | OplockType::Filter
        )
    }

    pub fn get_type(&self) -> OplockType {
        self.oplock_type
    }

    pub fn waiter_count(&self) -> usize {
        self.waiters.len()
    }

    pub fn level2_count(&self) -> usize {
        self.level2_holders.len()
    }

    // ------------------------------------------------------------------
    // Granting
    // ------------------------------------------------------------------

    fn request(&mut self, owner: u64, requested: OplockType, irp: &Arc<Irp>) -> bool {
        // Can't grant oplock during break
        if self.is_break_in_progress() {
            return false;
        }

        match requested {
            OplockType::None => false,

            OplockType::Level1 | OplockType::Batch | OplockType::Filter => {
                // Exclusive oplocks require no existing oplock
                if self.oplock_type != OplockType::None {
                    return false;
                }
                self.oplock_type = requested;
                self.exclusive_owner = owner;
                self.exclusive_irp = Some(Arc::clone(irp));
                true
            }

            OplockType::Level2 => match self.oplock_type {
                OplockType::None | OplockType::Level2 => {
                    self.oplock_type = OplockType::Level2;
                    self.level2_holders.push(Level2Holder {
                        owner,
                        irp: Some(Arc::clone(irp)),
                    });
                    true
                }
                _ => false,
            },
        }
    }

    // ------------------------------------------------------------------
    // Breaking
    // ------------------------------------------------------------------

    /// What break (if any) an operation by `owner` would cause
    pub fn break_needed(&self, owner: u64, request: OplockBreakRequest) -> OplockBreakStatus {
        use OplockBreakRequest as R;

        match self.oplock_type {
            OplockType::None => OplockBreakStatus::None,

            // Same handle doesn't break its own oplock
            _ if self.is_exclusive() && self.exclusive_owner == owner => OplockBreakStatus::None,

            OplockType::Level1 | OplockType::Batch => match request {
                R::Read => OplockBreakStatus::ToLevel2,
                R::Write | R::HandleCreate | R::Lock | R::SetInformation => {
                    OplockBreakStatus::ToNone
                }
                R::Close if self.oplock_type == OplockType::Batch => OplockBreakStatus::ToNone,
                R::Flush | R::Close => OplockBreakStatus::None,
            },

            // Filter oplock only breaks for modification
            OplockType::Filter => match request {
                R::Write | R::SetInformation => OplockBreakStatus::ToNone,
                _ => OplockBreakStatus::None,
            },

            // Level 2: only modification breaks the oplock
            OplockType::Level2 => match request {
                R::Write | R::Lock | R::SetInformation => OplockBreakStatus::ToNone,
                _ => OplockBreakStatus::None,
            },
        }
    }

    /// Check an operation against the oplock
    ///
    /// On `Deferred` the continuation is stored and will be handed back by
    /// acknowledge / release / timeout. On any other outcome it is dropped
    /// unused and the caller continues with the operation itself.
    pub fn check(
        &mut self,
        owner: u64,
        request: OplockBreakRequest,
        now: u64,
        continuation: OplockContinuation,
    ) -> OplockCheck {
        let break_to = self.break_needed(owner, request);
        let mut notify = Vec::new();

        if break_to == OplockBreakStatus::None && !self.is_break_in_progress() {
            return OplockCheck {
                outcome: OplockOutcome::Proceed,
                notify,
            };
        }

        // Level 2 holders cannot delay anyone: break them all and go on
        if self.oplock_type == OplockType::Level2 {
            if break_to == OplockBreakStatus::ToNone {
                notify.extend(self.break_level2());
            }
            return OplockCheck {
                outcome: OplockOutcome::Proceed,
                notify,
            };
        }

        // A break already in progress delays every non-holder operation
        if break_to == OplockBreakStatus::None && self.exclusive_owner == owner {
            return OplockCheck {
                outcome: OplockOutcome::Proceed,
                notify,
            };
        }

        if !self.is_break_in_progress() {
            self.flags |= oplock_flags::OPLOCK_FLAG_BREAK_IN_PROGRESS;
            self.break_status = break_to;
            self.break_started = now;

            update_stats(|s| {
                s.total_breaks += 1;
                match break_to {
                    OplockBreakStatus::ToLevel2 => s.breaks_to_level2 += 1,
                    OplockBreakStatus::ToNone => s.breaks_to_none += 1,
                    OplockBreakStatus::None => {}
                }
            });

            if let Some(irp) = self.exclusive_irp.take() {
                self.flags |= oplock_flags::OPLOCK_FLAG_BREAK_NOTIFY_SENT;
                notify.push(BreakNotify {
                    irp,
                    information: match break_to {
                        OplockBreakStatus::ToLevel2 => {
                            oplock_break_info::FILE_OPLOCK_BROKEN_TO_LEVEL_2
                        }
                        _ => oplock_break_info::FILE_OPLOCK_BROKEN_TO_NONE,
                    },
                });
            }
        } else if break_to == OplockBreakStatus::ToNone
            && self.break_status == OplockBreakStatus::ToLevel2
        {
            self.break_status = OplockBreakStatus::ToNone;
        }

        if self.waiters.len() >= MAX_OPLOCK_WAITERS {
            return OplockCheck {
                outcome: OplockOutcome::Fail(STATUS_INSUFFICIENT_RESOURCES),
                notify,
            };
        }

        self.waiters.push(OplockWaiter {
            owner,
            break_request: request,
            queue_tick: now,
            continuation,
        });
        update_stats(|s| s.waiters_queued += 1);

        OplockCheck {
            outcome: OplockOutcome::Deferred,
            notify,
        }
    }

    /// Break all Level 2 oplocks
    fn break_level2(&mut self) -> Vec<BreakNotify> {
        if self.oplock_type != OplockType::Level2 {
            return Vec::new();
        }
        update_stats(|s| {
            s.total_breaks += 1;
            s.breaks_to_none += 1;
        });
        self.oplock_type = OplockType::None;
        self.level2_holders
            .drain(..)
            .filter_map(|holder| holder.irp)
            .map(|irp| BreakNotify {
                irp,
                information: oplock_break_info::FILE_OPLOCK_BROKEN_TO_NONE,
            })
            .collect()
    }

    /// Acknowledge an oplock break
    fn acknowledge(
        &mut self,
        owner: u64,
        new_level: OplockType,
        irp: &Arc<Irp>,
    ) -> Option<Vec<OplockWaiter>> {
        // Must be the oplock holder, and must be breaking
        if self.exclusive_owner != owner || !self.is_break_in_progress() {
            return None;
        }

        let valid = match self.break_status {
            OplockBreakStatus::ToNone => new_level == OplockType::None,
            OplockBreakStatus::ToLevel2 => {
                matches!(new_level, OplockType::Level2 | OplockType::None)
            }
            OplockBreakStatus::None => false,
        };
        if !valid {
            return None;
        }

        self.end_break();
        if new_level == OplockType::Level2 {
            self.oplock_type = OplockType::Level2;
            self.level2_holders.push(Level2Holder {
                owner,
                irp: Some(Arc::clone(irp)),
            });
        }

        Some(core::mem::take(&mut self.waiters))
    }

    fn end_break(&mut self) {
        self.flags = 0;
        self.break_status = OplockBreakStatus::None;
        self.oplock_type = OplockType::None;
        self.exclusive_owner = 0;
        self.exclusive_irp = None;
    }

    /// Release whatever oplock `owner` holds (handle cleanup)
    ///
    /// Returns waiters that may now proceed and an orphaned request IRP of
    /// the holder to complete.
    pub fn release(&mut self, owner: u64) -> (Vec<OplockWaiter>, Vec<BreakNotify>) {
        let mut notify = Vec::new();
        match self.oplock_type {
            OplockType::Level1 | OplockType::Batch | OplockType::Filter => {
                if self.exclusive_owner == owner {
                    if let Some(irp) = self.exclusive_irp.take() {
                        notify.push(BreakNotify {
                            irp,
                            information: oplock_break_info::FILE_OPLOCK_BROKEN_TO_NONE,
                        });
                    }
                    self.end_break();
                    return (core::mem::take(&mut self.waiters), notify);
                }
            }
            OplockType::Level2 => {
                let (gone, kept): (Vec<_>, Vec<_>) = self
                    .level2_holders
                    .drain(..)
                    .partition(|holder| holder.owner == owner);
                self.level2_holders = kept;
                notify.extend(gone.into_iter().filter_map(|h| h.irp).map(|irp| BreakNotify {
                    irp,
                    information: oplock_break_info::FILE_OPLOCK_BROKEN_TO_NONE,
                }));
                if self.level2_holders.is_empty() {
                    self.oplock_type = OplockType::None;
                }
            }
            OplockType::None => {}
        }
        (Vec::new(), notify)
    }

    /// Force a break the holder never acknowledged
    pub fn expire_break(&mut self, now: u64) -> Vec<OplockWaiter> {
        if !self.is_break_in_progress()
            || now.saturating_sub(self.break_started) < self.break_timeout_ms
        {
            return Vec::new();
        }
        log::warn!(
            "[FSRTL] oplock break by handle {} not acknowledged after {} ms",
            self.exclusive_owner,
            self.break_timeout_ms
        );
        update_stats(|s| s.break_timeouts += 1);
        self.end_break();
        core::mem::take(&mut self.waiters)
    }

    /// Remove every waiter without resuming it (teardown)
    pub fn drain_waiters(&mut self) -> Vec<OplockWaiter> {
        core::mem::take(&mut self.waiters)
    }

    pub fn set_break_timeout(&mut self, ms: u64) {
        self.break_timeout_ms = ms;
    }

    // ------------------------------------------------------------------
    // FSCTL Handler
    // ------------------------------------------------------------------

    /// Handle FSCTL oplock operations
    ///
    /// A granted request retains `irp` and returns STATUS_PENDING; the IRP is
    /// completed when the oplock breaks or its holder cleans up.
    pub fn fsctrl(
        &mut self,
        fsctl_code: u32,
        owner: u64,
        open_count: u32,
        irp: &Arc<Irp>,
        now: u64,
    ) -> OplockFsctl {
        use fsctl_oplock::*;

        let done = |status| OplockFsctl {
            status,
            released: Vec::new(),
        };

        let exclusive = match fsctl_code {
            FSCTL_REQUEST_OPLOCK_LEVEL_1 => Some(OplockType::Level1),
            FSCTL_REQUEST_BATCH_OPLOCK => Some(OplockType::Batch),
            FSCTL_REQUEST_FILTER_OPLOCK => Some(OplockType::Filter),
            _ => None,
        };

        if let Some(kind) = exclusive {
            // Exclusive oplocks require a single opener
            if open_count != 1 || !self.request(owner, kind, irp) {
                return done(STATUS_OPLOCK_NOT_GRANTED);
            }
            update_stats(|s| {
                s.total_granted += 1;
                match kind {
                    OplockType::Level1 => s.level1_granted += 1,
                    OplockType::Batch => s.batch_granted += 1,
                    _ => s.filter_granted += 1,
                }
            });
            return done(STATUS_PENDING);
        }

        match fsctl_code {
            FSCTL_REQUEST_OPLOCK_LEVEL_2 => {
                if self.request(owner, OplockType::Level2, irp) {
                    update_stats(|s| {
                        s.total_granted += 1;
                        s.level2_granted += 1;
                    });
                    done(STATUS_PENDING)
                } else {
                    done(STATUS_OPLOCK_NOT_GRANTED)
                }
            }

            FSCTL_OPLOCK_BREAK_ACKNOWLEDGE | FSCTL_OPLOCK_BREAK_ACK_NO_2 => {
                let level = if fsctl_code == FSCTL_OPLOCK_BREAK_ACKNOWLEDGE
                    && self.break_status == OplockBreakStatus::ToLevel2
                {
                    OplockType::Level2
                } else {
                    OplockType::None
                };
                match self.acknowledge(owner, level, irp) {
                    Some(released) => {
                        update_stats(|s| s.break_acks += 1);
                        OplockFsctl {
                            // Acknowledging to Level 2 keeps the IRP as the new request
                            status: if level == OplockType::Level2 {
                                STATUS_PENDING
                            } else {
                                STATUS_SUCCESS
                            },
                            released,
                        }
                    }
                    None => done(STATUS_INVALID_OPLOCK_PROTOCOL),
                }
            }

            FSCTL_OPBATCH_ACK_CLOSE_PENDING => {
                if self.oplock_type == OplockType::Batch && self.exclusive_owner == owner {
                    self.flags |= oplock_flags::OPLOCK_FLAG_CLOSE_PENDING;
                }
                done(STATUS_SUCCESS)
            }

            FSCTL_OPLOCK_BREAK_NOTIFY => {
                if !self.is_break_in_progress() {
                    return done(STATUS_SUCCESS);
                }
                // Complete when the running break resolves
                let pending = Arc::clone(irp);
                let outcome = self.check(
                    0,
                    OplockBreakRequest::Flush,
                    now,
                    Box::new(move |status| {
                        let status = if status == STATUS_CANCELLED {
                            STATUS_CANCELLED
                        } else {
                            STATUS_SUCCESS
                        };
                        io_complete_request(&pending, status);
                    }),
                );
                match outcome.outcome {
                    OplockOutcome::Deferred => done(STATUS_PENDING),
                    OplockOutcome::Fail(status) => done(status),
                    OplockOutcome::Proceed => done(STATUS_SUCCESS),
                }
            }

            _ => done(STATUS_INVALID_OPLOCK_PROTOCOL),
        }
    }
}

impl Default for Oplock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::IrpParameters;
    use fsctl_oplock::*;
    use std::sync::atomic::{AtomicI32, Ordering};

    fn fsctl_irp(code: u32) -> Arc<Irp> {
        Irp::new(IrpParameters::FileSystemControl {
            fs_control_code: code,
            input: Vec::new(),
            output_length: 0,
        })
        .into_shared()
    }

    fn recorder() -> (Arc<AtomicI32>, OplockContinuation) {
        let seen = Arc::new(AtomicI32::new(-1));
        let slot = Arc::clone(&seen);
        (seen, Box::new(move |status| slot.store(status, Ordering::SeqCst)))
    }

    #[test]
    fn test_no_oplock_proceeds() {
        let mut oplock = Oplock::new();
        let (_, cont) = recorder();
        let check = oplock.check(1, OplockBreakRequest::Write, 0, cont);
        assert!(matches!(check.outcome, OplockOutcome::Proceed));
        assert!(check.notify.is_empty());
    }

    #[test]
    fn test_exclusive_break_defers_until_ack() {
        let mut oplock = Oplock::new();
        let request = fsctl_irp(FSCTL_REQUEST_OPLOCK_LEVEL_1);
        let granted = oplock.fsctrl(FSCTL_REQUEST_OPLOCK_LEVEL_1, 1, 1, &request, 0);
        assert_eq!(granted.status, STATUS_PENDING);

        // The holder itself is not delayed
        let (_, cont) = recorder();
        assert!(matches!(
            oplock.check(1, OplockBreakRequest::Write, 0, cont).outcome,
            OplockOutcome::Proceed
        ));

        let (seen, cont) = recorder();
        let check = oplock.check(2, OplockBreakRequest::Write, 10, cont);
        assert!(matches!(check.outcome, OplockOutcome::Deferred));
        assert_eq!(check.notify.len(), 1);
        for n in check.notify {
            n.deliver();
        }
        assert_eq!(
            request.io_status().map(|s| s.information),
            Some(oplock_break_info::FILE_OPLOCK_BROKEN_TO_NONE)
        );
        assert_eq!(oplock.waiter_count(), 1);

        let ack = fsctl_irp(FSCTL_OPLOCK_BREAK_ACK_NO_2);
        let result = oplock.fsctrl(FSCTL_OPLOCK_BREAK_ACK_NO_2, 1, 1, &ack, 20);
        assert_eq!(result.status, STATUS_SUCCESS);
        assert_eq!(result.released.len(), 1);
        for waiter in result.released {
            waiter.resume(STATUS_SUCCESS);
        }
        assert_eq!(seen.load(Ordering::SeqCst), STATUS_SUCCESS);
        assert!(!oplock.is_oplock_held());
    }

    #[test]
    fn test_exclusive_needs_single_opener() {
        let mut oplock = Oplock::new();
        let irp = fsctl_irp(FSCTL_REQUEST_BATCH_OPLOCK);
        let result = oplock.fsctrl(FSCTL_REQUEST_BATCH_OPLOCK, 1, 2, &irp, 0);
        assert_eq!(result.status, STATUS_OPLOCK_NOT_GRANTED);
    }

    #[test]
    fn test_close_breaks_only_batch() {
        let mut batch = Oplock::new();
        let irp = fsctl_irp(FSCTL_REQUEST_BATCH_OPLOCK);
        batch.fsctrl(FSCTL_REQUEST_BATCH_OPLOCK, 1, 1, &irp, 0);
        assert_eq!(batch.break_needed(1, OplockBreakRequest::Close), OplockBreakStatus::None);
        let (_, cont) = recorder();
        let check = batch.check(2, OplockBreakRequest::Close, 0, cont);
        assert!(matches!(check.outcome, OplockOutcome::Deferred));
        assert_eq!(check.notify.len(), 1);

        let mut level1 = Oplock::new();
        let irp = fsctl_irp(FSCTL_REQUEST_OPLOCK_LEVEL_1);
        level1.fsctrl(FSCTL_REQUEST_OPLOCK_LEVEL_1, 1, 1, &irp, 0);
        let (_, cont) = recorder();
        let check = level1.check(2, OplockBreakRequest::Close, 0, cont);
        assert!(matches!(check.outcome, OplockOutcome::Proceed));
        assert!(level1.is_oplock_held());
    }

    #[test]
    fn test_level2_breaks_without_waiting() {
        let mut oplock = Oplock::new();
        let a = fsctl_irp(FSCTL_REQUEST_OPLOCK_LEVEL_2);
        let b = fsctl_irp(FSCTL_REQUEST_OPLOCK_LEVEL_2);
        oplock.fsctrl(FSCTL_REQUEST_OPLOCK_LEVEL_2, 1, 2, &a, 0);
        oplock.fsctrl(FSCTL_REQUEST_OPLOCK_LEVEL_2, 2, 2, &b, 0);
        assert_eq!(oplock.level2_count(), 2);

        let (_, cont) = recorder();
        let check = oplock.check(3, OplockBreakRequest::Write, 0, cont);
        assert!(matches!(check.outcome, OplockOutcome::Proceed));
        assert_eq!(check.notify.len(), 2);
        assert_eq!(oplock.get_type(), OplockType::None);
    }

    #[test]
    fn test_release_frees_waiters() {
        let mut oplock = Oplock::new();
        let irp = fsctl_irp(FSCTL_REQUEST_OPLOCK_LEVEL_1);
        oplock.fsctrl(FSCTL_REQUEST_OPLOCK_LEVEL_1, 1, 1, &irp, 0);
        let (_, cont) = recorder();
        oplock.check(2, OplockBreakRequest::Read, 0, cont);
        let (waiters, _) = oplock.release(1);
        assert_eq!(waiters.len(), 1);
        assert!(!oplock.is_oplock_held());
    }

    #[test]
    fn test_break_timeout() {
        let mut oplock = Oplock::new();
        oplock.set_break_timeout(100);
        let irp = fsctl_irp(FSCTL_REQUEST_OPLOCK_LEVEL_1);
        oplock.fsctrl(FSCTL_REQUEST_OPLOCK_LEVEL_1, 1, 1, &irp, 0);
        let (_, cont) = recorder();
        oplock.check(2, OplockBreakRequest::Write, 0, cont);
        assert!(oplock.expire_break(50).is_empty());
        assert_eq!(oplock.expire_break(100).len(), 1);
        assert!(!oplock.is_break_in_progress());
        assert!(fsrtl_get_oplock_stats().break_timeouts >= 1);
    }
}
