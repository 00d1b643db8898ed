//! Volume Control Block
//!
//! The VCB owns the FCB table, the garbage list of unreferenced FCBs, the
//! volume's change-notification list and its metrics.
//!
//! # Garbage Collection
//!
//! When an FCB's last reference goes away it is either deleted at once
//! (collection disabled, or the volume is going down) or parked on the
//! garbage list. A reopen during that time pulls it back off the list.
//! Each collector pass deletes FCBs that were already parked during the
//! previous pass, so every parked FCB survives at least one full interval.
//! A forced pass deletes the whole list.
//!
//! # Locking
//!
//! The table lock ranks below every FCB resource. Nothing that can block
//! on user mode or complete an IRP runs while it is held; FCBs removed from
//! the table are dropped after the lock is released.

use core::sync::atomic::{AtomicU32, Ordering};
use std::backtrace::Backtrace;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use bitflags::bitflags;

use super::fcb::{Fcb, FcbRef};
use super::metrics::VolumeMetrics;
use crate::fsrtl::{fsrtl_path_key, NotifyList, OplockWaiter};
use crate::ke::{EventType, KEvent, LockRank, Ranked};
use crate::status::{NtStatus, STATUS_ACCESS_DENIED, STATUS_INSUFFICIENT_RESOURCES};

bitflags! {
    /// Volume state
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct VcbFlags: u32 {
        const MOUNTED = 0x0001;
        /// Unmount started; the router rejects new work
        const DISMOUNT_PENDING = 0x0002;
        /// A keepalive handle was activated
        const KEEPALIVE_ACTIVE = 0x0004;
    }
}

#[derive(Debug, Default)]
struct FcbTable {
    fcbs: HashMap<String, Arc<Fcb>>,
    garbage: VecDeque<Arc<Fcb>>,
}

/// Volume Control Block
#[derive(Debug)]
pub struct Vcb {
    mount_id: u32,
    case_sensitive: bool,
    gc_interval_ms: u64,
    fcb_soft_limit: usize,
    flags: AtomicU32,
    table: spin::RwLock<FcbTable>,
    notify: NotifyList,
    metrics: Arc<VolumeMetrics>,
    gc_stop: KEvent,
    gc_thread: spin::Mutex<Option<JoinHandle<()>>>,
}

impl Vcb {
    pub fn new(
        mount_id: u32,
        case_sensitive: bool,
        gc_interval_ms: u64,
        fcb_soft_limit: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            mount_id,
            case_sensitive,
            gc_interval_ms,
            fcb_soft_limit,
            flags: AtomicU32::new(VcbFlags::MOUNTED.bits()),
            table: spin::RwLock::new(FcbTable::default()),
            notify: NotifyList::new(case_sensitive),
            metrics: Arc::new(VolumeMetrics::new()),
            gc_stop: KEvent::new(EventType::Notification, false),
            gc_thread: spin::Mutex::new(None),
        })
    }

    pub fn mount_id(&self) -> u32 {
        self.mount_id
    }

    pub fn is_case_sensitive(&self) -> bool {
        self.case_sensitive
    }

    pub fn notify(&self) -> &NotifyList {
        &self.notify
    }

    pub fn metrics(&self) -> &Arc<VolumeMetrics> {
        &self.metrics
    }

    pub fn flags(&self) -> VcbFlags {
        VcbFlags::from_bits_truncate(self.flags.load(Ordering::SeqCst))
    }

    pub fn set_flags(&self, flags: VcbFlags) -> VcbFlags {
        VcbFlags::from_bits_truncate(self.flags.fetch_or(flags.bits(), Ordering::SeqCst))
    }

    pub fn clear_flags(&self, flags: VcbFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::SeqCst);
    }

    pub fn is_mounted(&self) -> bool {
        let flags = self.flags();
        flags.contains(VcbFlags::MOUNTED) && !flags.contains(VcbFlags::DISMOUNT_PENDING)
    }

    pub fn is_dismount_pending(&self) -> bool {
        self.flags().contains(VcbFlags::DISMOUNT_PENDING)
    }

    pub fn is_keepalive_active(&self) -> bool {
        self.flags().contains(VcbFlags::KEEPALIVE_ACTIVE)
    }

    /// Mark the volume as going away; returns false if it already was
    pub fn begin_dismount(&self) -> bool {
        !self.set_flags(VcbFlags::DISMOUNT_PENDING).contains(VcbFlags::DISMOUNT_PENDING)
    }

    fn table_read(&self) -> Ranked<spin::RwLockReadGuard<'_, FcbTable>> {
        Ranked::acquire(LockRank::Vcb, || self.table.read())
    }

    fn table_write(&self) -> Ranked<spin::RwLockWriteGuard<'_, FcbTable>> {
        Ranked::acquire(LockRank::Vcb, || self.table.write())
    }

    pub fn path_key(&self, path: &str) -> String {
        fsrtl_path_key(path, self.case_sensitive)
    }

    // ------------------------------------------------------------------
    // FCB table
    // ------------------------------------------------------------------

    /// Find or create the FCB for `path` and take a reference to it
    ///
    /// A hit on an FCB parked for collection cancels the collection.
    pub fn acquire_fcb(self: &Arc<Self>, path: &str) -> Result<FcbRef, NtStatus> {
        let key = self.path_key(path);
        let mut collected = Vec::new();

        let reference = {
            let mut table = self.table_write();

            if let Some(fcb) = table.fcbs.get(&key).cloned() {
                fcb.file_count.fetch_add(1, Ordering::SeqCst);
                if fcb.gc_pending.swap(false, Ordering::SeqCst) {
                    fcb.gc_grace_passed.store(false, Ordering::SeqCst);
                    table.garbage.retain(|f| !Arc::ptr_eq(f, &fcb));
                    VolumeMetrics::bump(&self.metrics.gc_cancelled);
                    relay_debug!(GC, "[GC] reopen of {} cancels its collection", path);
                }
                FcbRef::new(fcb, Arc::clone(self))
            } else {
                if table.fcbs.len() >= self.fcb_soft_limit && !table.garbage.is_empty() {
                    VolumeMetrics::bump(&self.metrics.gc_forced);
                    collected = self.collect_locked(&mut table, true);
                }
                table
                    .fcbs
                    .try_reserve(1)
                    .map_err(|_| STATUS_INSUFFICIENT_RESOURCES)?;
                let fcb = Arc::new(Fcb::new(path, key.clone()));
                fcb.file_count.store(1, Ordering::SeqCst);
                table.fcbs.insert(key, Arc::clone(&fcb));
                VolumeMetrics::bump(&self.metrics.fcb_allocated);
                FcbRef::new(fcb, Arc::clone(self))
            }
        };

        drop(collected);
        Ok(reference)
    }

    /// Last-reference transition; called only through [`FcbRef`]
    pub(super) fn release_fcb(&self, fcb: &Arc<Fcb>) {
        let removed = {
            let mut table = self.table_write();
            let count = fcb.file_count.load(Ordering::SeqCst);
            if count == 0 {
                log::error!(
                    "[GC] FCB {} released with zero references\n{}",
                    fcb.id(),
                    Backtrace::capture()
                );
                return;
            }
            fcb.file_count.store(count - 1, Ordering::SeqCst);
            if count > 1 {
                return;
            }

            if self.gc_interval_ms == 0 || !self.is_mounted() {
                self.remove_locked(&mut table, fcb)
            } else {
                fcb.gc_grace_passed.store(false, Ordering::SeqCst);
                fcb.gc_pending.store(true, Ordering::SeqCst);
                table.garbage.push_back(Arc::clone(fcb));
                None
            }
        };
        drop(removed);
    }

    fn remove_locked(&self, table: &mut FcbTable, fcb: &Arc<Fcb>) -> Option<Arc<Fcb>> {
        let key = fcb.read().key.clone();
        let removed = match table.fcbs.get(&key) {
            Some(entry) if Arc::ptr_eq(entry, fcb) => table.fcbs.remove(&key),
            _ => None,
        };
        if !fcb.is_deleted() {
            fcb.mark_deleted();
            VolumeMetrics::bump(&self.metrics.fcb_deleted);
        }
        removed
    }

    fn collect_locked(&self, table: &mut FcbTable, force: bool) -> Vec<Arc<Fcb>> {
        let mut victims = Vec::new();
        let mut kept = VecDeque::new();

        for fcb in core::mem::take(&mut table.garbage) {
            if fcb.file_count.load(Ordering::SeqCst) > 0 {
                fcb.gc_pending.store(false, Ordering::SeqCst);
                continue;
            }
            if force || fcb.gc_grace_passed.load(Ordering::SeqCst) {
                victims.push(fcb);
            } else {
                fcb.gc_grace_passed.store(true, Ordering::SeqCst);
                kept.push_back(fcb);
            }
        }
        table.garbage = kept;

        for fcb in &victims {
            if let Some(removed) = self.remove_locked(table, fcb) {
                drop(removed);
            }
        }
        VolumeMetrics::bump(&self.metrics.gc_cycles);
        VolumeMetrics::add(&self.metrics.gc_collected, victims.len() as u64);
        victims
    }

    /// One collector pass; returns the number of FCBs deleted
    pub fn collect_garbage(&self, force: bool) -> usize {
        let victims = {
            let mut table = self.table_write();
            if force {
                VolumeMetrics::bump(&self.metrics.gc_forced);
            }
            self.collect_locked(&mut table, force)
        };
        let count = victims.len();
        if count > 0 {
            relay_debug!(GC, "[GC] volume {} collected {} FCBs", self.mount_id, count);
        }
        count
    }

    /// Look up an FCB without taking a reference
    pub fn lookup_fcb(&self, path: &str) -> Option<Arc<Fcb>> {
        let key = self.path_key(path);
        self.table_read().fcbs.get(&key).cloned()
    }

    /// Move `fcb` to `new_path`
    ///
    /// Fails with STATUS_ACCESS_DENIED when a referenced FCB already owns the
    /// target path. An unreferenced FCB at the target is evicted.
    pub fn rename_fcb(&self, fcb: &Arc<Fcb>, new_path: &str) -> Result<(), NtStatus> {
        let new_key = self.path_key(new_path);
        let evicted = {
            let mut table = self.table_write();
            let mut state = fcb.write();

            let mut evicted = None;
            if state.key != new_key {
                if let Some(existing) = table.fcbs.get(&new_key).cloned() {
                    if existing.file_count.load(Ordering::SeqCst) > 0 {
                        return Err(STATUS_ACCESS_DENIED);
                    }
                    table.garbage.retain(|f| !Arc::ptr_eq(f, &existing));
                    table.fcbs.remove(&new_key);
                    existing.mark_deleted();
                    VolumeMetrics::bump(&self.metrics.fcb_deleted);
                    evicted = Some(existing);
                }
                let old_key = core::mem::replace(&mut state.key, new_key.clone());
                if let Some(entry) = table.fcbs.remove(&old_key) {
                    if !Arc::ptr_eq(&entry, fcb) {
                        table.fcbs.insert(old_key, entry);
                    }
                }
                table.fcbs.insert(new_key, Arc::clone(fcb));
            }
            state.path = new_path.to_string();
            evicted
        };
        drop(evicted);
        Ok(())
    }

    pub fn fcb_count(&self) -> usize {
        self.table_read().fcbs.len()
    }

    pub fn garbage_count(&self) -> usize {
        self.table_read().garbage.len()
    }

    fn fcbs(&self) -> Vec<Arc<Fcb>> {
        self.table_read().fcbs.values().cloned().collect()
    }

    // ------------------------------------------------------------------
    // Oplock sweeps
    // ------------------------------------------------------------------

    /// Breaks whose holder never acknowledged; waiters to resume
    pub fn expire_oplock_breaks(&self, now: u64) -> Vec<OplockWaiter> {
        self.fcbs()
            .iter()
            .flat_map(|fcb| fcb.oplock.lock().expire_break(now))
            .collect()
    }

    /// Every parked oplock waiter on the volume (teardown)
    pub fn drain_oplock_waiters(&self) -> Vec<OplockWaiter> {
        self.fcbs()
            .iter()
            .flat_map(|fcb| fcb.oplock.lock().drain_waiters())
            .collect()
    }

    // ------------------------------------------------------------------
    // Collector thread
    // ------------------------------------------------------------------

    pub fn gc_interval_ms(&self) -> u64 {
        self.gc_interval_ms
    }

    /// Start the collector; does nothing when collection is disabled
    pub fn start_gc_thread(self: &Arc<Self>) {
        if self.gc_interval_ms == 0 {
            return;
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        let interval = Duration::from_millis(self.gc_interval_ms);
        let spawned = std::thread::Builder::new()
            .name(format!("relay-gc-{}", self.mount_id))
            .spawn(move || loop {
                let Some(vcb) = weak.upgrade() else { break };
                if vcb.gc_stop.wait(Some(interval)) {
                    break;
                }
                vcb.collect_garbage(false);
            });
        match spawned {
            Ok(handle) => *self.gc_thread.lock() = Some(handle),
            Err(err) => log::warn!("[GC] could not start collector: {}", err),
        }
    }

    pub fn has_gc_thread(&self) -> bool {
        self.gc_thread.lock().is_some()
    }

    /// Stop the collector, joining it unless called from it
    pub fn stop_gc_thread(&self) {
        self.gc_stop.set();
        let handle = self.gc_thread.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    /// Final teardown: stop collecting and delete every parked FCB
    pub fn teardown(&self) -> usize {
        self.stop_gc_thread();
        self.clear_flags(VcbFlags::MOUNTED);
        let victims = {
            let mut table = self.table_write();
            self.collect_locked(&mut table, true)
        };
        victims.len()
    }
}
