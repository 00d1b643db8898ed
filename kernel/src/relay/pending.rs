//! Pending-Request Registry
//!
//! Every IRP handed to user mode is parked here under a fresh serial
//! number until exactly one of three things removes it: the matching
//! response, cancellation, or the timeout sweep.
//!
//! # Ownership
//!
//! Removal from the map is the first claim; the cancel hook is the second.
//! Whoever removes an entry must also win `clear_cancel_routine()` before
//! completing the IRP. If the hook already fired, the cancel routine owns
//! the completion and the remover only drops the entry, which undoes any
//! create-time side effects.
//!
//! Creates are never armed: once user mode may have created a file the
//! open has to finish or be expired by the sweep, which treats a create
//! with its cancel flag set as expired.

use core::sync::atomic::{AtomicU64, Ordering};
use std::collections::HashMap;
use std::sync::{Arc, Weak};

use bitflags::bitflags;

use super::context::RequestContext;
use super::event::{event_flags, EventRequest, EventResponse, RequestBody};
use super::metrics::VolumeMetrics;
use super::options::{clamp_irp_timeout, EVENT_CONTEXT_MAX_SIZE};
use crate::io::{io_complete_cancelled, io_complete_request, Irp};
use crate::ke::SharedClock;
use crate::status::{
    NtStatus, STATUS_CANCELLED, STATUS_INSUFFICIENT_RESOURCES, STATUS_INVALID_PARAMETER,
    STATUS_NO_SUCH_DEVICE, STATUS_PENDING,
};

bitflags! {
    /// Pending entry flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PendingFlags: u32 {
        const CREATE = 0x0001;
        /// Published header-only; payload fetched separately
        const LARGE_WRITE = 0x0002;
    }
}

/// One request waiting for user mode
#[derive(Debug)]
pub struct PendingEntry {
    pub serial: u64,
    pub context: RequestContext,
    /// Tick count after which the sweep expires the entry
    pub deadline: u64,
    pub flags: PendingFlags,
    /// Full request kept for the fetch-write call
    pub message: Option<Vec<u8>>,
}

impl PendingEntry {
    pub fn irp(&self) -> &Arc<Irp> {
        &self.context.irp
    }

    fn is_expired(&self, now: u64) -> bool {
        now >= self.deadline
            || (self.flags.contains(PendingFlags::CREATE) && self.irp().is_cancel_requested())
    }

    /// Status the sweep completes an expired entry with
    pub fn expiry_status(&self) -> NtStatus {
        if self.flags.contains(PendingFlags::CREATE) {
            STATUS_CANCELLED
        } else {
            STATUS_INSUFFICIENT_RESOURCES
        }
    }
}

#[derive(Debug, Default)]
struct PendingTable {
    entries: HashMap<u64, PendingEntry>,
    /// Set by `release_all`; no registration succeeds afterwards
    closed: bool,
}

/// A registered request, ready to publish
#[derive(Debug)]
pub struct Registered {
    pub serial: u64,
    pub message: Vec<u8>,
}

/// Pending-request registry of one device
#[derive(Debug)]
pub struct PendingRegistry {
    table: Arc<spin::Mutex<PendingTable>>,
    next_serial: AtomicU64,
    max_pending: usize,
    timeout_ms: u64,
    clock: SharedClock,
    metrics: Arc<VolumeMetrics>,
}

impl PendingRegistry {
    pub fn new(
        max_pending: usize,
        timeout_ms: u64,
        clock: SharedClock,
        metrics: Arc<VolumeMetrics>,
    ) -> Self {
        Self {
            table: Arc::new(spin::Mutex::new(PendingTable::default())),
            next_serial: AtomicU64::new(1),
            max_pending,
            timeout_ms,
            clock,
            metrics,
        }
    }

    pub fn len(&self) -> usize {
        self.table.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, serial: u64) -> bool {
        self.table.lock().entries.contains_key(&serial)
    }

    /// Park `context` and build the message to publish
    ///
    /// The serial is assigned here and written into `request`. On error the
    /// context is dropped (undoing its side effects) and the caller
    /// completes the IRP with the returned status.
    pub fn register(
        &self,
        context: RequestContext,
        mut request: EventRequest,
    ) -> Result<Registered, NtStatus> {
        if !context.vcb.is_mounted() {
            return Err(STATUS_NO_SUCH_DEVICE);
        }

        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        request.serial = serial;
        let full = request.encode()?;

        let mut flags = PendingFlags::empty();
        if context.is_create() {
            flags |= PendingFlags::CREATE;
        }

        // Oversized writes go out header-only
        let (message, kept) = match &request.body {
            RequestBody::Write {
                offset,
                length,
                path,
                ..
            } if full.len() > EVENT_CONTEXT_MAX_SIZE => {
                flags |= PendingFlags::LARGE_WRITE;
                let header = EventRequest {
                    flags: request.flags | event_flags::LARGE_WRITE,
                    body: RequestBody::Write {
                        offset: *offset,
                        length: *length,
                        path: path.clone(),
                        data: Vec::new(),
                    },
                    ..request.clone()
                };
                (header.encode()?, Some(full))
            }
            _ => (full, None),
        };

        let irp = Arc::clone(&context.irp);
        let deadline = self.clock.tick_count() + self.timeout_ms;

        let mut table = self.table.lock();
        if table.closed {
            return Err(STATUS_NO_SUCH_DEVICE);
        }
        if table.entries.len() >= self.max_pending {
            log::warn!("[RELAY] pending limit {} reached", self.max_pending);
            return Err(STATUS_INSUFFICIENT_RESOURCES);
        }
        table
            .entries
            .try_reserve(1)
            .map_err(|_| STATUS_INSUFFICIENT_RESOURCES)?;
        table.entries.insert(
            serial,
            PendingEntry {
                serial,
                context,
                deadline,
                flags,
                message: kept,
            },
        );
        irp.mark_pending();

        if !flags.contains(PendingFlags::CREATE) {
            irp.set_cancel_routine(self.cancel_routine(serial));
            // Canceled before the hook went in: nobody else will see it
            if irp.is_cancel_requested() && irp.clear_cancel_routine() {
                let undone = table.entries.remove(&serial);
                drop(table);
                drop(undone);
                return Err(STATUS_CANCELLED);
            }
        }
        drop(table);

        VolumeMetrics::bump(&self.metrics.pending_registered);
        relay_debug!(EVENT, "[RELAY] registered serial {} irp {}", serial, irp.id());
        Ok(Registered { serial, message })
    }

    fn cancel_routine(&self, serial: u64) -> Box<dyn FnOnce(&Arc<Irp>) + Send> {
        let table: Weak<spin::Mutex<PendingTable>> = Arc::downgrade(&self.table);
        let metrics = Arc::clone(&self.metrics);
        Box::new(move |irp: &Arc<Irp>| {
            let entry = table
                .upgrade()
                .and_then(|table| table.lock().entries.remove(&serial));
            if entry.is_some() {
                VolumeMetrics::bump(&metrics.pending_cancelled);
            }
            drop(entry);
            relay_debug!(EVENT, "[RELAY] serial {} canceled", serial);
            io_complete_cancelled(irp);
        })
    }

    /// Apply a user-mode response
    ///
    /// Returns false when no entry has the serial (already answered,
    /// canceled or expired) or the cancel routine won the IRP.
    pub fn complete(&self, response: &EventResponse) -> bool {
        let entry = self.table.lock().entries.remove(&response.serial);
        let Some(entry) = entry else {
            relay_debug!(EVENT, "[RELAY] response for unknown serial {}", response.serial);
            return false;
        };
        if !entry.irp().clear_cancel_routine() {
            return false;
        }
        VolumeMetrics::bump(&self.metrics.pending_answered);
        let irp = Arc::clone(entry.irp());
        let status = entry.context.finish(response);
        if status != STATUS_PENDING {
            io_complete_request(&irp, status);
        }
        true
    }

    /// Remove an entry whose message could not be published
    pub fn abort(&self, serial: u64, status: NtStatus) -> bool {
        let entry = self.table.lock().entries.remove(&serial);
        match entry {
            Some(entry) if entry.irp().clear_cancel_routine() => {
                let irp = Arc::clone(entry.irp());
                drop(entry);
                io_complete_request(&irp, status);
                true
            }
            _ => false,
        }
    }

    /// Remove every entry the sweep should expire at `now`
    pub fn take_expired(&self, now: u64) -> Vec<PendingEntry> {
        let mut table = self.table.lock();
        let serials: Vec<u64> = table
            .entries
            .values()
            .filter(|entry| entry.is_expired(now))
            .map(|entry| entry.serial)
            .collect();
        serials
            .into_iter()
            .filter_map(|serial| table.entries.remove(&serial))
            .collect()
    }

    /// Push an entry's deadline out from now
    pub fn reset_timeout(&self, serial: u64, timeout_ms: u64) -> Result<(), NtStatus> {
        let now = self.clock.tick_count();
        let mut table = self.table.lock();
        let entry = table
            .entries
            .get_mut(&serial)
            .ok_or(STATUS_INVALID_PARAMETER)?;
        entry.deadline = now + clamp_irp_timeout(timeout_ms);
        Ok(())
    }

    /// Full message of a large write
    pub fn fetch_write(&self, serial: u64) -> Result<Vec<u8>, NtStatus> {
        let table = self.table.lock();
        let message = table
            .entries
            .get(&serial)
            .and_then(|entry| entry.message.clone())
            .ok_or(STATUS_INVALID_PARAMETER)?;
        VolumeMetrics::bump(&self.metrics.large_write_fetches);
        Ok(message)
    }

    /// Close the registry and complete everything in it
    pub fn release_all(&self, status: NtStatus) -> usize {
        let entries: Vec<PendingEntry> = {
            let mut table = self.table.lock();
            table.closed = true;
            table.entries.drain().map(|(_, entry)| entry).collect()
        };
        let mut completed = 0;
        for entry in entries {
            let irp = Arc::clone(entry.irp());
            let owned = irp.clear_cancel_routine();
            drop(entry);
            if owned {
                io_complete_request(&irp, status);
                completed += 1;
            }
        }
        completed
    }
}
