//! Context Control Block
//!
//! One CCB per open handle. It holds the handle's FCB reference, the
//! opaque context user mode returned from create, and per-handle
//! directory enumeration state.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use bitflags::bitflags;

use super::fcb::{Fcb, FcbRef};
use crate::io::AccessGrant;

bitflags! {
    /// CCB flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CcbFlags: u32 {
        /// Handle on the reserved keepalive path
        const KEEPALIVE = 0x0001;
        const DELETE_ON_CLOSE = 0x0002;
        /// Cleanup ran; share access and locks are gone
        const CLEANED_UP = 0x0004;
        /// Handle created by FILE_CREATED disposition
        const CREATED = 0x0008;
    }
}

static NEXT_CCB_ID: AtomicU64 = AtomicU64::new(1);

/// Context Control Block
#[derive(Debug)]
pub struct Ccb {
    id: u64,
    fcb: Arc<Fcb>,
    reference: spin::Mutex<Option<FcbRef>>,
    user_context: AtomicU64,
    search_pattern: spin::Mutex<Option<String>>,
    directory_index: AtomicU64,
    flags: AtomicU32,
    process_id: u32,
    grant: AccessGrant,
}

impl Ccb {
    pub fn new(reference: FcbRef, process_id: u32, grant: AccessGrant) -> Self {
        Self {
            id: NEXT_CCB_ID.fetch_add(1, Ordering::Relaxed),
            fcb: Arc::clone(reference.fcb()),
            reference: spin::Mutex::new(Some(reference)),
            user_context: AtomicU64::new(0),
            search_pattern: spin::Mutex::new(None),
            directory_index: AtomicU64::new(0),
            flags: AtomicU32::new(0),
            process_id,
            grant,
        }
    }

    /// Handle id; owner of byte-range locks, oplocks and notify watches
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn fcb(&self) -> &Arc<Fcb> {
        &self.fcb
    }

    pub fn process_id(&self) -> u32 {
        self.process_id
    }

    pub fn grant(&self) -> &AccessGrant {
        &self.grant
    }

    pub fn context(&self) -> u64 {
        self.user_context.load(Ordering::SeqCst)
    }

    pub fn set_context(&self, context: u64) {
        self.user_context.store(context, Ordering::SeqCst);
    }

    pub fn flags(&self) -> CcbFlags {
        CcbFlags::from_bits_truncate(self.flags.load(Ordering::SeqCst))
    }

    pub fn set_flags(&self, flags: CcbFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::SeqCst);
    }

    /// Set `flags`, returning whether they were all already set
    pub fn test_and_set(&self, flags: CcbFlags) -> bool {
        let previous = self.flags.fetch_or(flags.bits(), Ordering::SeqCst);
        CcbFlags::from_bits_truncate(previous).contains(flags)
    }

    pub fn search_pattern(&self) -> Option<String> {
        self.search_pattern.lock().clone()
    }

    pub fn set_search_pattern(&self, pattern: Option<String>) {
        *self.search_pattern.lock() = pattern;
    }

    pub fn directory_index(&self) -> u64 {
        self.directory_index.load(Ordering::SeqCst)
    }

    pub fn set_directory_index(&self, index: u64) {
        self.directory_index.store(index, Ordering::SeqCst);
    }

    /// Drop the FCB reference; later calls do nothing
    pub fn release_reference(&self) -> bool {
        let reference = self.reference.lock().take();
        match reference {
            Some(reference) => {
                reference.release();
                true
            }
            None => false,
        }
    }

    pub fn holds_reference(&self) -> bool {
        self.reference.lock().is_some()
    }
}
