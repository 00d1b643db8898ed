//! File Object Implementation
//!
//! File objects represent open instances of files on a relayed volume.
//! When a process opens a file, a file object is created to track:
//! - Current file position
//! - Granted access and requested sharing
//! - FsContext (the per-path FCB) and FsContext2 (the per-open CCB)
//!
//! The filesystem owns what sits in the two context slots; the I/O layer
//! only stores them and hands them back typed.

use core::any::Any;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// File object flags
pub mod file_flags {
    /// Synchronous I/O
    pub const FO_SYNCHRONOUS_IO: u32 = 0x00000002;
    /// No intermediate buffering
    pub const FO_NO_INTERMEDIATE_BUFFERING: u32 = 0x00000008;
    /// Write through
    pub const FO_WRITE_THROUGH: u32 = 0x00000010;
    /// File modified
    pub const FO_FILE_MODIFIED: u32 = 0x00001000;
    /// Cleanup complete
    pub const FO_CLEANUP_COMPLETE: u32 = 0x00004000;
    /// Delete on close
    pub const FO_DELETE_ON_CLOSE: u32 = 0x00010000;
    /// Handle created
    pub const FO_HANDLE_CREATED: u32 = 0x00040000;
}

/// File access rights
pub mod file_access {
    /// Read data / list directory
    pub const FILE_READ_DATA: u32 = 0x0001;
    /// Write data / add file
    pub const FILE_WRITE_DATA: u32 = 0x0002;
    /// Append data / add subdirectory
    pub const FILE_APPEND_DATA: u32 = 0x0004;
    /// Read EA
    pub const FILE_READ_EA: u32 = 0x0008;
    /// Write EA
    pub const FILE_WRITE_EA: u32 = 0x0010;
    /// Execute
    pub const FILE_EXECUTE: u32 = 0x0020;
    /// Delete child
    pub const FILE_DELETE_CHILD: u32 = 0x0040;
    /// Read attributes
    pub const FILE_READ_ATTRIBUTES: u32 = 0x0080;
    /// Write attributes
    pub const FILE_WRITE_ATTRIBUTES: u32 = 0x0100;
    /// Delete
    pub const DELETE: u32 = 0x00010000;
    /// Read control
    pub const READ_CONTROL: u32 = 0x00020000;
    /// Write DAC
    pub const WRITE_DAC: u32 = 0x00040000;
    /// Write owner
    pub const WRITE_OWNER: u32 = 0x00080000;
    /// Synchronize
    pub const SYNCHRONIZE: u32 = 0x00100000;
    /// All access
    pub const FILE_ALL_ACCESS: u32 = 0x001F01FF;
    /// Generic read
    pub const FILE_GENERIC_READ: u32 = 0x00120089;
    /// Generic write
    pub const FILE_GENERIC_WRITE: u32 = 0x00120116;

    /// Rights that modify the file or its metadata
    pub const MODIFYING_ACCESS: u32 = FILE_WRITE_DATA
        | FILE_APPEND_DATA
        | FILE_WRITE_EA
        | FILE_WRITE_ATTRIBUTES
        | FILE_DELETE_CHILD
        | DELETE
        | WRITE_DAC
        | WRITE_OWNER;
}

/// File share modes
pub mod file_share {
    /// Share read
    pub const FILE_SHARE_READ: u32 = 0x00000001;
    /// Share write
    pub const FILE_SHARE_WRITE: u32 = 0x00000002;
    /// Share delete
    pub const FILE_SHARE_DELETE: u32 = 0x00000004;
    pub const FILE_SHARE_VALID_FLAGS: u32 = 0x00000007;
}

/// Create dispositions
pub mod create_disposition {
    pub const FILE_SUPERSEDE: u32 = 0;
    pub const FILE_OPEN: u32 = 1;
    pub const FILE_CREATE: u32 = 2;
    pub const FILE_OPEN_IF: u32 = 3;
    pub const FILE_OVERWRITE: u32 = 4;
    pub const FILE_OVERWRITE_IF: u32 = 5;
    pub const FILE_MAXIMUM_DISPOSITION: u32 = 5;
}

/// Create options
pub mod create_options {
    pub const FILE_DIRECTORY_FILE: u32 = 0x00000001;
    pub const FILE_WRITE_THROUGH: u32 = 0x00000002;
    pub const FILE_SEQUENTIAL_ONLY: u32 = 0x00000004;
    pub const FILE_NO_INTERMEDIATE_BUFFERING: u32 = 0x00000008;
    pub const FILE_SYNCHRONOUS_IO_ALERT: u32 = 0x00000010;
    pub const FILE_SYNCHRONOUS_IO_NONALERT: u32 = 0x00000020;
    pub const FILE_NON_DIRECTORY_FILE: u32 = 0x00000040;
    pub const FILE_DELETE_ON_CLOSE: u32 = 0x00001000;
    pub const FILE_OPEN_BY_FILE_ID: u32 = 0x00002000;
}

/// IoStatus.Information values for a successful create
pub mod create_information {
    pub const FILE_SUPERSEDED: usize = 0;
    pub const FILE_OPENED: usize = 1;
    pub const FILE_CREATED: usize = 2;
    pub const FILE_OVERWRITTEN: usize = 3;
    pub const FILE_EXISTS: usize = 4;
    pub const FILE_DOES_NOT_EXIST: usize = 5;
}

/// File attributes
pub mod file_attributes {
    pub const FILE_ATTRIBUTE_READONLY: u32 = 0x00000001;
    pub const FILE_ATTRIBUTE_HIDDEN: u32 = 0x00000002;
    pub const FILE_ATTRIBUTE_DIRECTORY: u32 = 0x00000010;
    pub const FILE_ATTRIBUTE_NORMAL: u32 = 0x00000080;
}

/// Opaque filesystem context stored on a file object
pub type FsContext = Arc<dyn Any + Send + Sync>;

static NEXT_FILE_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

/// File Object structure
pub struct FileObject {
    id: u64,
    /// Name as passed by the opener
    file_name: String,
    /// FO_* flags
    flags: AtomicU32,
    /// Current byte offset for synchronous I/O
    current_byte_offset: AtomicU64,
    /// Access granted at open
    granted_access: AtomicU32,
    /// Sharing requested at open
    share_access: AtomicU32,
    /// Per-path context (FCB)
    fs_context: spin::Mutex<Option<FsContext>>,
    /// Per-open context (CCB)
    fs_context2: spin::Mutex<Option<FsContext>>,
}

impl FileObject {
    pub fn new(file_name: impl Into<String>) -> Self {
        Self {
            id: NEXT_FILE_OBJECT_ID.fetch_add(1, Ordering::Relaxed),
            file_name: file_name.into(),
            flags: AtomicU32::new(0),
            current_byte_offset: AtomicU64::new(0),
            granted_access: AtomicU32::new(0),
            share_access: AtomicU32::new(0),
            fs_context: spin::Mutex::new(None),
            fs_context2: spin::Mutex::new(None),
        }
    }

    /// Mark the file object for synchronous I/O
    pub fn synchronous(self) -> Self {
        self.set_flag(file_flags::FO_SYNCHRONOUS_IO);
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.file_name
    }

    /// Get current file position
    pub fn position(&self) -> u64 {
        self.current_byte_offset.load(Ordering::SeqCst)
    }

    /// Set file position
    pub fn set_position(&self, offset: u64) {
        self.current_byte_offset.store(offset, Ordering::SeqCst);
    }

    /// Advance file position
    pub fn advance_position(&self, amount: u64) {
        self.current_byte_offset.fetch_add(amount, Ordering::SeqCst);
    }

    pub fn set_flag(&self, flag: u32) {
        self.flags.fetch_or(flag, Ordering::SeqCst);
    }

    pub fn clear_flag(&self, flag: u32) {
        self.flags.fetch_and(!flag, Ordering::SeqCst);
    }

    pub fn has_flag(&self, flag: u32) -> bool {
        (self.flags.load(Ordering::SeqCst) & flag) != 0
    }

    pub fn is_synchronous(&self) -> bool {
        self.has_flag(file_flags::FO_SYNCHRONOUS_IO)
    }

    pub fn granted_access(&self) -> u32 {
        self.granted_access.load(Ordering::SeqCst)
    }

    pub fn share_access(&self) -> u32 {
        self.share_access.load(Ordering::SeqCst)
    }

    /// Record access and sharing once the open succeeds
    pub fn set_access(&self, granted: u32, share: u32) {
        self.granted_access.store(granted, Ordering::SeqCst);
        self.share_access.store(share, Ordering::SeqCst);
    }

    /// Attach the FCB and CCB
    pub fn set_contexts(&self, fs_context: FsContext, fs_context2: FsContext) {
        *self.fs_context.lock() = Some(fs_context);
        *self.fs_context2.lock() = Some(fs_context2);
    }

    /// FsContext, downcast to the filesystem's FCB type
    pub fn fs_context<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let context = self.fs_context.lock().clone()?;
        context.downcast::<T>().ok()
    }

    /// FsContext2, downcast to the filesystem's CCB type
    pub fn fs_context2<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let context = self.fs_context2.lock().clone()?;
        context.downcast::<T>().ok()
    }

    /// Detach both contexts (on close)
    pub fn take_contexts(&self) -> (Option<FsContext>, Option<FsContext>) {
        (self.fs_context.lock().take(), self.fs_context2.lock().take())
    }
}

impl core::fmt::Debug for FileObject {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FileObject")
            .field("id", &self.id)
            .field("name", &self.file_name)
            .field("flags", &self.flags.load(Ordering::Relaxed))
            .field("position", &self.position())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_and_position() {
        let file = FileObject::new("\\x");
        assert!(!file.is_synchronous());
        file.set_flag(file_flags::FO_DELETE_ON_CLOSE);
        assert!(file.has_flag(file_flags::FO_DELETE_ON_CLOSE));
        file.clear_flag(file_flags::FO_DELETE_ON_CLOSE);
        assert!(!file.has_flag(file_flags::FO_DELETE_ON_CLOSE));
        file.set_position(10);
        file.advance_position(5);
        assert_eq!(file.position(), 15);
    }

    #[test]
    fn test_typed_contexts() {
        let file = FileObject::new("\\x");
        file.set_contexts(Arc::new(7u32), Arc::new(String::from("ccb")));
        assert_eq!(file.fs_context::<u32>().as_deref(), Some(&7));
        assert!(file.fs_context::<u64>().is_none());
        assert_eq!(file.fs_context2::<String>().as_deref().map(String::as_str), Some("ccb"));
        let (a, b) = file.take_contexts();
        assert!(a.is_some() && b.is_some());
        assert!(file.fs_context::<u32>().is_none());
    }
}
