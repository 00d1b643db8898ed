//! File Byte-Range Locking
//!
//! Provides byte-range locking for relayed files so lock requests can be
//! arbitrated in-kernel instead of round-tripping to user mode.
//!
//! Key features:
//! - Exclusive and shared locks
//! - Locks owned by one open handle; a handle never conflicts with itself
//! - Read / write access checks for non-paging I/O
//! - Unlock of everything a handle owns at cleanup
//!
//! Conflict rule: a requested range conflicts with an existing range on the
//! same file when the two overlap and the existing range belongs to another
//! handle. Shared vs exclusive only matters for read access checks.

use crate::status::{
    NtStatus, STATUS_FILE_LOCK_CONFLICT, STATUS_INVALID_PARAMETER, STATUS_LOCK_NOT_GRANTED,
    STATUS_RANGE_NOT_LOCKED,
};

/// Lock type flags
pub mod lock_flags {
    /// Exclusive lock (write access)
    pub const EXCLUSIVE_LOCK: u32 = 0x01;
    /// Fail immediately if lock not available
    pub const FAIL_IMMEDIATELY: u32 = 0x02;
}

/// Information about a single file lock
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileLockInfo {
    /// Starting byte offset of the locked range
    pub starting_byte: i64,
    /// Length of the locked range in bytes
    pub length: i64,
    /// Whether this is an exclusive lock
    pub exclusive_lock: bool,
    /// Lock key
    pub key: u32,
    /// Handle (CCB id) that owns this lock
    pub owner: u64,
    /// Process ID of lock owner
    pub process_id: u32,
}

impl FileLockInfo {
    /// One past the last locked byte
    pub fn ending_byte(&self) -> i64 {
        self.starting_byte.saturating_add(self.length)
    }

    /// Check if this lock overlaps with a range
    pub fn overlaps(&self, start: i64, end: i64) -> bool {
        self.starting_byte < end && self.ending_byte() > start
    }

    /// Check if this lock conflicts with a lock requested by `owner`
    pub fn conflicts_with(&self, owner: u64, start: i64, length: i64) -> bool {
        self.owner != owner && self.overlaps(start, start.saturating_add(length))
    }
}

/// A byte-range lock request
#[derive(Clone, Copy, Debug)]
pub struct LockRequest {
    pub owner: u64,
    pub process_id: u32,
    pub starting_byte: i64,
    pub length: i64,
    pub key: u32,
    pub fail_immediately: bool,
    pub exclusive: bool,
}

/// File lock structure
///
/// Manages all locks for a single file. The caller serializes access (the
/// FCB keeps it behind its own mutex).
#[derive(Debug, Default)]
pub struct FileLock {
    locks: Vec<FileLockInfo>,
    /// Whether fast I/O is questionable due to exclusive locks
    fast_io_is_questionable: bool,
}

impl FileLock {
    pub const fn new() -> Self {
        Self {
            locks: Vec::new(),
            fast_io_is_questionable: false,
        }
    }

    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }

    pub fn fast_io_is_questionable(&self) -> bool {
        self.fast_io_is_questionable
    }

    /// Locks currently held, in grant order
    pub fn locks(&self) -> &[FileLockInfo] {
        &self.locks
    }

    /// Grant a lock or report why not
    ///
    /// A conflicting request fails with STATUS_LOCK_NOT_GRANTED when the
    /// caller asked to fail immediately, STATUS_FILE_LOCK_CONFLICT otherwise.
    /// Waiting lock requests are not queued.
    pub fn process_lock(&mut self, request: &LockRequest) -> Result<(), NtStatus> {
        if request.starting_byte < 0 || request.length < 0 {
            return Err(STATUS_INVALID_PARAMETER);
        }

        let conflict = self.locks.iter().any(|existing| {
            existing.conflicts_with(request.owner, request.starting_byte, request.length)
        });

        if conflict {
            return Err(if request.fail_immediately {
                STATUS_LOCK_NOT_GRANTED
            } else {
                STATUS_FILE_LOCK_CONFLICT
            });
        }

        self.locks.push(FileLockInfo {
            starting_byte: request.starting_byte,
            length: request.length,
            exclusive_lock: request.exclusive,
            key: request.key,
            owner: request.owner,
            process_id: request.process_id,
        });

        if request.exclusive {
            self.fast_io_is_questionable = true;
        }

        Ok(())
    }

    /// Check if a read by `owner` would conflict with locks
    ///
    /// Only exclusive locks held by other handles block reads.
    pub fn check_read_access(
        &self,
        owner: u64,
        starting_byte: i64,
        length: u64,
    ) -> Result<(), NtStatus> {
        let end = range_end(starting_byte, length);
        let blocked = self
            .locks
            .iter()
            .any(|l| l.owner != owner && l.exclusive_lock && l.overlaps(starting_byte, end));
        if blocked {
            Err(STATUS_FILE_LOCK_CONFLICT)
        } else {
            Ok(())
        }
    }

    /// Check if a write by `owner` would conflict with locks
    ///
    /// Any lock held by another handle blocks writes.
    pub fn check_write_access(
        &self,
        owner: u64,
        starting_byte: i64,
        length: u64,
    ) -> Result<(), NtStatus> {
        let end = range_end(starting_byte, length);
        let blocked = self
            .locks
            .iter()
            .any(|l| l.owner != owner && l.overlaps(starting_byte, end));
        if blocked {
            Err(STATUS_FILE_LOCK_CONFLICT)
        } else {
            Ok(())
        }
    }

    /// Unlock a single lock
    pub fn unlock_single(
        &mut self,
        owner: u64,
        starting_byte: i64,
        length: i64,
        key: u32,
    ) -> Result<(), NtStatus> {
        let position = self.locks.iter().position(|l| {
            l.owner == owner
                && l.key == key
                && l.starting_byte == starting_byte
                && l.length == length
        });

        match position {
            Some(index) => {
                self.locks.remove(index);
                self.update_fast_io_flag();
                Ok(())
            }
            None => Err(STATUS_RANGE_NOT_LOCKED),
        }
    }

    /// Unlock all locks owned by a handle, returning how many were removed
    pub fn unlock_all(&mut self, owner: u64) -> usize {
        let before = self.locks.len();
        self.locks.retain(|l| l.owner != owner);
        self.update_fast_io_flag();
        before - self.locks.len()
    }

    /// Unlock all locks owned by a handle with a specific key
    pub fn unlock_all_by_key(&mut self, owner: u64, key: u32) -> usize {
        let before = self.locks.len();
        self.locks.retain(|l| !(l.owner == owner && l.key == key));
        self.update_fast_io_flag();
        before - self.locks.len()
    }

    /// Update the fast I/O questionable flag based on current locks
    fn update_fast_io_flag(&mut self) {
        self.fast_io_is_questionable = self.locks.iter().any(|l| l.exclusive_lock);
    }
}

fn range_end(starting_byte: i64, length: u64) -> i64 {
    starting_byte.saturating_add(i64::try_from(length).unwrap_or(i64::MAX))
}
