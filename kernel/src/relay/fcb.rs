//! File Control Block
//!
//! One FCB per distinct path on a volume. The FCB is owned by the VCB
//! table; handles reach it through an [`FcbRef`], which is the only way to
//! take or drop a reference and so the only way `file_count` changes.
//!
//! `file_count` is mutated only while the VCB table lock is held
//! exclusively. The path and key are mutated only while both the VCB lock
//! and this FCB's resource are held exclusively.

use core::ops::Deref;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use bitflags::bitflags;

use super::vcb::Vcb;
use crate::fsrtl::{FileLock, Oplock};
use crate::io::ShareAccess;
use crate::ke::{LockRank, Ranked};

bitflags! {
    /// FCB state flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FcbFlags: u32 {
        const DIRECTORY = 0x0001;
        /// Reserved keepalive path
        const KEEPALIVE = 0x0002;
        /// Delete disposition set; new opens fail
        const DELETE_PENDING = 0x0004;
    }
}

/// Mutable state behind the FCB resource
#[derive(Debug)]
pub struct FcbState {
    /// Normalized path
    pub path: String,
    /// Table key (upper-cased unless the volume is case sensitive)
    pub key: String,
    pub flags: FcbFlags,
    pub share_access: ShareAccess,
}

static NEXT_FCB_ID: AtomicU64 = AtomicU64::new(1);

/// File Control Block
#[derive(Debug)]
pub struct Fcb {
    id: u64,
    state: spin::RwLock<FcbState>,
    /// Outstanding references (open file objects)
    pub(super) file_count: AtomicU32,
    /// Handles not yet cleaned up
    open_handles: AtomicU32,
    pub(super) gc_pending: AtomicBool,
    pub(super) gc_grace_passed: AtomicBool,
    deleted: AtomicBool,
    pub file_lock: spin::Mutex<FileLock>,
    pub oplock: spin::Mutex<Oplock>,
}

impl Fcb {
    pub(super) fn new(path: &str, key: String) -> Self {
        Self {
            id: NEXT_FCB_ID.fetch_add(1, Ordering::Relaxed),
            state: spin::RwLock::new(FcbState {
                path: path.to_string(),
                key,
                flags: FcbFlags::empty(),
                share_access: ShareAccess::new(),
            }),
            file_count: AtomicU32::new(0),
            open_handles: AtomicU32::new(0),
            gc_pending: AtomicBool::new(false),
            gc_grace_passed: AtomicBool::new(false),
            deleted: AtomicBool::new(false),
            file_lock: spin::Mutex::new(FileLock::new()),
            oplock: spin::Mutex::new(Oplock::new()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Acquire the FCB resource shared
    pub fn read(&self) -> Ranked<spin::RwLockReadGuard<'_, FcbState>> {
        Ranked::acquire(LockRank::Fcb, || self.state.read())
    }

    /// Acquire the FCB resource exclusive
    pub fn write(&self) -> Ranked<spin::RwLockWriteGuard<'_, FcbState>> {
        Ranked::acquire(LockRank::Fcb, || self.state.write())
    }

    pub fn path(&self) -> String {
        self.read().path.clone()
    }

    pub fn flags(&self) -> FcbFlags {
        self.read().flags
    }

    pub fn set_flags(&self, flags: FcbFlags) {
        self.write().flags.insert(flags);
    }

    pub fn clear_flags(&self, flags: FcbFlags) {
        self.write().flags.remove(flags);
    }

    pub fn is_directory(&self) -> bool {
        self.flags().contains(FcbFlags::DIRECTORY)
    }

    pub fn is_delete_pending(&self) -> bool {
        self.flags().contains(FcbFlags::DELETE_PENDING)
    }

    pub fn file_count(&self) -> u32 {
        self.file_count.load(Ordering::SeqCst)
    }

    pub fn open_handles(&self) -> u32 {
        self.open_handles.load(Ordering::SeqCst)
    }

    pub(super) fn handle_opened(&self) {
        self.open_handles.fetch_add(1, Ordering::SeqCst);
    }

    pub(super) fn handle_cleaned_up(&self) {
        let _ = self
            .open_handles
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    /// Parked on the garbage list
    pub fn is_gc_pending(&self) -> bool {
        self.gc_pending.load(Ordering::SeqCst)
    }

    /// Removed from the table; no new reference can reach it
    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::SeqCst)
    }

    pub(super) fn mark_deleted(&self) {
        self.gc_pending.store(false, Ordering::SeqCst);
        self.deleted.store(true, Ordering::SeqCst);
    }
}

/// A counted reference to an FCB
///
/// Dropping it, or calling [`FcbRef::release`], performs the release
/// transition on the owning VCB exactly once.
#[derive(Debug)]
pub struct FcbRef {
    fcb: Arc<Fcb>,
    vcb: Arc<Vcb>,
    released: bool,
}

impl FcbRef {
    pub(super) fn new(fcb: Arc<Fcb>, vcb: Arc<Vcb>) -> Self {
        Self {
            fcb,
            vcb,
            released: false,
        }
    }

    pub fn fcb(&self) -> &Arc<Fcb> {
        &self.fcb
    }

    pub fn vcb(&self) -> &Arc<Vcb> {
        &self.vcb
    }

    pub fn release(mut self) {
        self.released = true;
        self.vcb.release_fcb(&self.fcb);
    }
}

impl Deref for FcbRef {
    type Target = Fcb;

    fn deref(&self) -> &Fcb {
        &self.fcb
    }
}

impl Drop for FcbRef {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            self.vcb.release_fcb(&self.fcb);
        }
    }
}
