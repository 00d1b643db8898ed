//! I/O Manager (io)
//!
//! The pieces of the I/O manager a filesystem driver sees:
//!
//! - **IRPs**: I/O Request Packets with typed parameters and a cancel hook
//! - **File Objects**: Open file state and filesystem contexts
//! - **Share Access**: Per-file sharing arbitration
//! - **Completion**: IoCompleteRequest / IoCancelIrp
//!
//! # I/O Flow
//!
//! 1. The OS builds an IRP for an operation
//! 2. The filesystem's dispatch routine handles it
//! 3. The IRP is completed inline or marked pending
//! 4. A pending IRP is completed later from another thread, or canceled

pub mod complete;
pub mod file;
pub mod irp;
pub mod share;

pub use complete::{
    io_cancel_irp, io_complete_cancelled, io_complete_request, io_complete_with_status,
    io_get_completion_stats,
};
pub use file::{
    create_disposition, create_information, create_options, file_access, file_attributes,
    file_flags, file_share, FileObject, FsContext,
};
pub use irp::{
    byte_offset, irp_major_function_name, irp_minor, CancelHook, CancelRoutine,
    CreateParameters, IoStatusBlock, Irp, IrpFlags, IrpMajorFunction, IrpParameters,
};
pub use share::{AccessGrant, ShareAccess};
