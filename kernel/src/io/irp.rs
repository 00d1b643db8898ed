//! I/O Request Packet (IRP) Implementation
//!
//! IRPs are the fundamental data structure for I/O in NT. Every operation
//! the OS hands to the relay (create, read, write, ioctl, etc.) arrives as
//! one IRP and leaves through exactly one completion.
//!
//! # IRP Structure
//! - Major / minor function and typed parameters
//! - Requestor process and optional file object
//! - Cancel flag plus a cancel hook with compare-and-swap ownership
//! - Completion slot (status block and output bytes) and a completion event
//!
//! # Cancel Hook
//!
//! The hook is a tri-state (`Armed`, `Fired`, `Detached`, plus `None`
//! before anything is installed). Whichever side moves it out of `Armed`
//! owns the IRP's completion:
//! - `io_cancel_irp` moves `Armed -> Fired` and runs the routine
//! - a completer moves `Armed -> Detached` and completes normally
//!
//! The loser of that race must treat its own attempt as a no-op.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bitflags::bitflags;

use super::file::FileObject;
use crate::ke::{EventType, KEvent};
use crate::status::{NtStatus, STATUS_PENDING};

/// Major function codes (IRP types)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum IrpMajorFunction {
    Create = 0,
    Close = 2,
    Read = 3,
    Write = 4,
    QueryInformation = 5,
    SetInformation = 6,
    FlushBuffers = 9,
    QueryVolumeInformation = 10,
    SetVolumeInformation = 11,
    DirectoryControl = 12,
    FileSystemControl = 13,
    DeviceControl = 14,
    Shutdown = 16,
    LockControl = 17,
    Cleanup = 18,
    QuerySecurity = 20,
    SetSecurity = 21,
}

impl IrpMajorFunction {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::Create,
            2 => Self::Close,
            3 => Self::Read,
            4 => Self::Write,
            5 => Self::QueryInformation,
            6 => Self::SetInformation,
            9 => Self::FlushBuffers,
            10 => Self::QueryVolumeInformation,
            11 => Self::SetVolumeInformation,
            12 => Self::DirectoryControl,
            13 => Self::FileSystemControl,
            14 => Self::DeviceControl,
            16 => Self::Shutdown,
            17 => Self::LockControl,
            18 => Self::Cleanup,
            20 => Self::QuerySecurity,
            21 => Self::SetSecurity,
            _ => return None,
        })
    }
}

/// Get the name of an IRP major function
pub fn irp_major_function_name(major: IrpMajorFunction) -> &'static str {
    match major {
        IrpMajorFunction::Create => "IRP_MJ_CREATE",
        IrpMajorFunction::Close => "IRP_MJ_CLOSE",
        IrpMajorFunction::Read => "IRP_MJ_READ",
        IrpMajorFunction::Write => "IRP_MJ_WRITE",
        IrpMajorFunction::QueryInformation => "IRP_MJ_QUERY_INFORMATION",
        IrpMajorFunction::SetInformation => "IRP_MJ_SET_INFORMATION",
        IrpMajorFunction::FlushBuffers => "IRP_MJ_FLUSH_BUFFERS",
        IrpMajorFunction::QueryVolumeInformation => "IRP_MJ_QUERY_VOLUME_INFORMATION",
        IrpMajorFunction::SetVolumeInformation => "IRP_MJ_SET_VOLUME_INFORMATION",
        IrpMajorFunction::DirectoryControl => "IRP_MJ_DIRECTORY_CONTROL",
        IrpMajorFunction::FileSystemControl => "IRP_MJ_FILE_SYSTEM_CONTROL",
        IrpMajorFunction::DeviceControl => "IRP_MJ_DEVICE_CONTROL",
        IrpMajorFunction::Shutdown => "IRP_MJ_SHUTDOWN",
        IrpMajorFunction::LockControl => "IRP_MJ_LOCK_CONTROL",
        IrpMajorFunction::Cleanup => "IRP_MJ_CLEANUP",
        IrpMajorFunction::QuerySecurity => "IRP_MJ_QUERY_SECURITY",
        IrpMajorFunction::SetSecurity => "IRP_MJ_SET_SECURITY",
    }
}

/// Minor function codes
pub mod irp_minor {
    pub const IRP_MN_NORMAL: u8 = 0x00;
    /// Directory control
    pub const IRP_MN_QUERY_DIRECTORY: u8 = 0x01;
    pub const IRP_MN_NOTIFY_CHANGE_DIRECTORY: u8 = 0x02;
    /// Lock control
    pub const IRP_MN_LOCK: u8 = 0x01;
    pub const IRP_MN_UNLOCK_SINGLE: u8 = 0x02;
    pub const IRP_MN_UNLOCK_ALL: u8 = 0x03;
    pub const IRP_MN_UNLOCK_ALL_BY_KEY: u8 = 0x04;
    /// File system control
    pub const IRP_MN_USER_FS_REQUEST: u8 = 0x00;
}

/// Special byte offsets for read / write
pub mod byte_offset {
    /// Append to the end of the file
    pub const FILE_WRITE_TO_END_OF_FILE: i64 = -1;
    /// Use the file object's current position
    pub const FILE_USE_FILE_POINTER_POSITION: i64 = -2;
}

bitflags! {
    /// IRP flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct IrpFlags: u32 {
        /// Paging I/O issued by the memory manager
        const PAGING_IO = 0x0002;
        /// Bypass the cache
        const NOCACHE = 0x0001;
        /// Synchronous paging I/O
        const SYNCHRONOUS_PAGING_IO = 0x0040;
        /// Caller waits for completion
        const SYNCHRONOUS_API = 0x0004;
    }
}

/// Parameters of IRP_MJ_CREATE
#[derive(Debug, Clone, Default)]
pub struct CreateParameters {
    /// Path relative to the volume root
    pub file_name: String,
    pub desired_access: u32,
    pub share_access: u32,
    pub file_attributes: u32,
    /// FILE_SUPERSEDE .. FILE_OVERWRITE_IF
    pub create_disposition: u32,
    /// FILE_DIRECTORY_FILE, FILE_DELETE_ON_CLOSE, ...
    pub create_options: u32,
}

/// Parameters for different IRP major functions
#[derive(Debug, Clone)]
pub enum IrpParameters {
    Create(CreateParameters),
    Close,
    Cleanup,
    Read {
        byte_offset: i64,
        length: u32,
        key: u32,
    },
    Write {
        byte_offset: i64,
        data: Vec<u8>,
        key: u32,
    },
    QueryInformation {
        class: u32,
        length: u32,
    },
    SetInformation {
        class: u32,
        buffer: Vec<u8>,
    },
    FlushBuffers,
    QueryVolumeInformation {
        class: u32,
        length: u32,
    },
    SetVolumeInformation {
        class: u32,
        buffer: Vec<u8>,
    },
    QueryDirectory {
        class: u32,
        length: u32,
        pattern: Option<String>,
        restart_scan: bool,
        return_single_entry: bool,
    },
    NotifyChangeDirectory {
        completion_filter: u32,
        watch_tree: bool,
        length: u32,
    },
    FileSystemControl {
        fs_control_code: u32,
        input: Vec<u8>,
        output_length: u32,
    },
    DeviceControl {
        io_control_code: u32,
        input: Vec<u8>,
        output_length: u32,
    },
    Shutdown,
    LockControl {
        minor: u8,
        byte_offset: i64,
        length: i64,
        key: u32,
        fail_immediately: bool,
        exclusive: bool,
    },
    QuerySecurity {
        security_information: u32,
        length: u32,
    },
    SetSecurity {
        security_information: u32,
        descriptor: Vec<u8>,
    },
}

impl IrpParameters {
    pub fn major_function(&self) -> IrpMajorFunction {
        match self {
            Self::Create(_) => IrpMajorFunction::Create,
            Self::Close => IrpMajorFunction::Close,
            Self::Cleanup => IrpMajorFunction::Cleanup,
            Self::Read { .. } => IrpMajorFunction::Read,
            Self::Write { .. } => IrpMajorFunction::Write,
            Self::QueryInformation { .. } => IrpMajorFunction::QueryInformation,
            Self::SetInformation { .. } => IrpMajorFunction::SetInformation,
            Self::FlushBuffers => IrpMajorFunction::FlushBuffers,
            Self::QueryVolumeInformation { .. } => IrpMajorFunction::QueryVolumeInformation,
            Self::SetVolumeInformation { .. } => IrpMajorFunction::SetVolumeInformation,
            Self::QueryDirectory { .. } | Self::NotifyChangeDirectory { .. } => {
                IrpMajorFunction::DirectoryControl
            }
            Self::FileSystemControl { .. } => IrpMajorFunction::FileSystemControl,
            Self::DeviceControl { .. } => IrpMajorFunction::DeviceControl,
            Self::Shutdown => IrpMajorFunction::Shutdown,
            Self::LockControl { .. } => IrpMajorFunction::LockControl,
            Self::QuerySecurity { .. } => IrpMajorFunction::QuerySecurity,
            Self::SetSecurity { .. } => IrpMajorFunction::SetSecurity,
        }
    }

    pub fn minor_function(&self) -> u8 {
        match self {
            Self::QueryDirectory { .. } => irp_minor::IRP_MN_QUERY_DIRECTORY,
            Self::NotifyChangeDirectory { .. } => irp_minor::IRP_MN_NOTIFY_CHANGE_DIRECTORY,
            Self::LockControl { minor, .. } => *minor,
            _ => irp_minor::IRP_MN_NORMAL,
        }
    }
}

/// I/O Status Block - result of an I/O operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoStatusBlock {
    /// Status code (NTSTATUS)
    pub status: NtStatus,
    /// Information (bytes transferred, create disposition, etc.)
    pub information: usize,
}

impl IoStatusBlock {
    pub const fn new() -> Self {
        Self {
            status: STATUS_PENDING,
            information: 0,
        }
    }
}

impl Default for IoStatusBlock {
    fn default() -> Self {
        Self::new()
    }
}

/// Routine run when a canceled IRP's hook fires
pub type CancelRoutine = Box<dyn FnOnce(&Arc<Irp>) + Send>;

/// Cancel hook states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CancelHook {
    /// No routine installed
    None = 0,
    /// Routine installed, may fire
    Armed = 1,
    /// Canceller took ownership and ran the routine
    Fired = 2,
    /// Completer took ownership; the routine will never run
    Detached = 3,
}

impl CancelHook {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Armed,
            2 => Self::Fired,
            3 => Self::Detached,
            _ => Self::None,
        }
    }
}

/// Global IRP counter for ids
static NEXT_IRP_ID: AtomicU64 = AtomicU64::new(1);

/// I/O Request Packet
pub struct Irp {
    id: u64,
    parameters: IrpParameters,
    flags: IrpFlags,
    file_object: Option<Arc<FileObject>>,
    requestor_process_id: u32,

    /// Irp->Cancel
    cancel: AtomicBool,
    cancel_hook: AtomicU8,
    cancel_routine: spin::Mutex<Option<CancelRoutine>>,

    pending_returned: AtomicBool,
    completed: AtomicBool,
    completion_attempts: AtomicU32,
    pub(super) io_status: spin::Mutex<IoStatusBlock>,
    pub(super) output: spin::Mutex<Vec<u8>>,
    pub(super) completion_event: KEvent,
}

impl Irp {
    /// Allocate a new IRP
    pub fn new(parameters: IrpParameters) -> Self {
        Self {
            id: NEXT_IRP_ID.fetch_add(1, Ordering::Relaxed),
            parameters,
            flags: IrpFlags::empty(),
            file_object: None,
            requestor_process_id: 0,
            cancel: AtomicBool::new(false),
            cancel_hook: AtomicU8::new(CancelHook::None as u8),
            cancel_routine: spin::Mutex::new(None),
            pending_returned: AtomicBool::new(false),
            completed: AtomicBool::new(false),
            completion_attempts: AtomicU32::new(0),
            io_status: spin::Mutex::new(IoStatusBlock::new()),
            output: spin::Mutex::new(Vec::new()),
            completion_event: KEvent::new(EventType::Notification, false),
        }
    }

    pub fn with_file_object(mut self, file_object: Arc<FileObject>) -> Self {
        self.file_object = Some(file_object);
        self
    }

    pub fn with_flags(mut self, flags: IrpFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_process_id(mut self, process_id: u32) -> Self {
        self.requestor_process_id = process_id;
        self
    }

    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn parameters(&self) -> &IrpParameters {
        &self.parameters
    }

    pub fn major_function(&self) -> IrpMajorFunction {
        self.parameters.major_function()
    }

    pub fn minor_function(&self) -> u8 {
        self.parameters.minor_function()
    }

    pub fn flags(&self) -> IrpFlags {
        self.flags
    }

    pub fn is_paging_io(&self) -> bool {
        self.flags.contains(IrpFlags::PAGING_IO)
    }

    pub fn file_object(&self) -> Option<&Arc<FileObject>> {
        self.file_object.as_ref()
    }

    pub fn requestor_process_id(&self) -> u32 {
        self.requestor_process_id
    }

    /// IoMarkIrpPending
    pub fn mark_pending(&self) {
        self.pending_returned.store(true, Ordering::Release);
    }

    pub fn is_pending_returned(&self) -> bool {
        self.pending_returned.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------
    // Cancellation
    // ------------------------------------------------------------------

    /// Irp->Cancel
    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    pub fn cancel_hook(&self) -> CancelHook {
        CancelHook::from_u8(self.cancel_hook.load(Ordering::SeqCst))
    }

    /// IoSetCancelRoutine: install `routine` and arm the hook
    ///
    /// Returns false if the hook is already armed or has fired.
    pub fn set_cancel_routine(&self, routine: CancelRoutine) -> bool {
        let mut slot = self.cancel_routine.lock();
        let current = self.cancel_hook();
        if matches!(current, CancelHook::Armed | CancelHook::Fired) {
            return false;
        }
        *slot = Some(routine);
        self.cancel_hook
            .compare_exchange(
                current as u8,
                CancelHook::Armed as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// Take ownership of completion away from the cancel path
    ///
    /// Swaps `Armed -> Detached`. Returns true when the caller now owns the
    /// IRP's completion (including the case where no hook was ever
    /// installed). Returns false when the cancel routine already fired; the
    /// caller must then leave the IRP alone.
    pub fn clear_cancel_routine(&self) -> bool {
        match self.cancel_hook.compare_exchange(
            CancelHook::Armed as u8,
            CancelHook::Detached as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => {
                drop(self.cancel_routine.lock().take());
                true
            }
            Err(current) => CancelHook::from_u8(current) != CancelHook::Fired,
        }
    }

    /// Swap `Armed -> Fired`, handing back the routine to run
    pub(super) fn fire_cancel_hook(&self) -> Option<CancelRoutine> {
        self.cancel.store(true, Ordering::SeqCst);
        self.cancel_hook
            .compare_exchange(
                CancelHook::Armed as u8,
                CancelHook::Fired as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .ok()?;
        self.cancel_routine.lock().take()
    }

    // ------------------------------------------------------------------
    // Completion slot
    // ------------------------------------------------------------------

    /// Set Irp->IoStatus.Information ahead of completion
    pub fn set_information(&self, information: usize) {
        self.io_status.lock().information = information;
    }

    /// Attach output bytes; Information becomes their length
    pub fn set_output(&self, data: Vec<u8>) {
        let len = data.len();
        *self.output.lock() = data;
        self.io_status.lock().information = len;
    }

    pub fn information(&self) -> usize {
        self.io_status.lock().information
    }

    pub(super) fn begin_completion(&self) -> bool {
        self.completion_attempts.fetch_add(1, Ordering::SeqCst);
        !self.completed.swap(true, Ordering::SeqCst)
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    /// Number of times anyone tried to complete this IRP
    pub fn completion_attempts(&self) -> u32 {
        self.completion_attempts.load(Ordering::SeqCst)
    }

    /// Final status block, once completed
    pub fn io_status(&self) -> Option<IoStatusBlock> {
        self.is_completed().then(|| *self.io_status.lock())
    }

    /// Copy of the output bytes
    pub fn output(&self) -> Vec<u8> {
        self.output.lock().clone()
    }

    /// Block until the IRP is completed
    pub fn wait(&self, timeout: Option<Duration>) -> Option<IoStatusBlock> {
        if self.completion_event.wait(timeout) {
            self.io_status()
        } else {
            None
        }
    }
}

impl core::fmt::Debug for Irp {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Irp")
            .field("id", &self.id)
            .field("major", &self.major_function())
            .field("minor", &self.minor_function())
            .field("flags", &self.flags)
            .field("cancel", &self.is_cancel_requested())
            .field("hook", &self.cancel_hook())
            .field("completed", &self.is_completed())
            .finish()
    }
}
