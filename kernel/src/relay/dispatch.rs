//! Request Router
//!
//! Single entry point for every IRP sent to a mounted volume. Volume-wide
//! policy is applied first, then the per-operation handler either
//! completes the IRP here or parks it and returns STATUS_PENDING.
//!
//! Handlers return `Result<NtStatus, NtStatus>`; both arms are completion
//! statuses, the `Err` arm just lets them use `?`. Whatever they return
//! other than STATUS_PENDING becomes the IRP's one completion.

use std::sync::Arc;

use super::context::IrpContext;
use super::dcb::Dcb;
use super::fileinfo::FILE_POSITION_INFORMATION;
use super::{
    close, create, devctrl, dirctrl, fileinfo, flush, fsctl, lockctrl, read, security, volume,
    write,
};
use crate::io::{
    create_disposition, create_options, file_access, io_complete_request, irp_major_function_name,
    Irp, IrpMajorFunction, IrpParameters,
};
use crate::status::{
    NtStatus, STATUS_MEDIA_WRITE_PROTECTED, STATUS_NO_SUCH_DEVICE, STATUS_PENDING, STATUS_SUCCESS,
};

/// Route `irp` and complete it unless it was parked
pub fn dispatch(dcb: &Arc<Dcb>, irp: &Arc<Irp>) -> NtStatus {
    let major = irp.major_function();
    relay_debug!(
        DISPATCH,
        "[RELAY] {} minor {} irp {} on {}",
        irp_major_function_name(major),
        irp.minor_function(),
        irp.id(),
        dcb.mount_point()
    );

    let status = match route(dcb, irp) {
        Ok(status) | Err(status) => status,
    };
    if status == STATUS_PENDING {
        return status;
    }
    if !crate::status::nt_success(status) {
        relay_debug!(
            DISPATCH,
            "[RELAY] {} irp {} failed: {}",
            irp_major_function_name(major),
            irp.id(),
            crate::status::status_name(status)
        );
    }
    io_complete_request(irp, status);
    status
}

fn route(dcb: &Arc<Dcb>, irp: &Arc<Irp>) -> Result<NtStatus, NtStatus> {
    let major = irp.major_function();

    if (dcb.is_released() || dcb.vcb().is_dismount_pending()) && !passes_unmount_gate(major) {
        return Err(STATUS_NO_SUCH_DEVICE);
    }
    if dcb.options().is_read_only() && is_mutating(irp.parameters()) {
        return Err(STATUS_MEDIA_WRITE_PROTECTED);
    }

    let ctx = IrpContext::new(dcb, irp);
    match major {
        IrpMajorFunction::Create => create::dispatch_create(ctx),
        IrpMajorFunction::Close => close::dispatch_close(ctx),
        IrpMajorFunction::Cleanup => close::dispatch_cleanup(ctx),
        IrpMajorFunction::Read => read::dispatch_read(ctx),
        IrpMajorFunction::Write => write::dispatch_write(ctx),
        IrpMajorFunction::QueryInformation => fileinfo::dispatch_query_information(ctx),
        IrpMajorFunction::SetInformation => fileinfo::dispatch_set_information(ctx),
        IrpMajorFunction::FlushBuffers => flush::dispatch_flush(ctx),
        IrpMajorFunction::QueryVolumeInformation => volume::dispatch_query_volume(ctx),
        IrpMajorFunction::SetVolumeInformation => volume::dispatch_set_volume(ctx),
        IrpMajorFunction::DirectoryControl => dirctrl::dispatch_directory_control(ctx),
        IrpMajorFunction::FileSystemControl => fsctl::dispatch_fs_control(ctx),
        IrpMajorFunction::DeviceControl => devctrl::dispatch_device_control(ctx),
        IrpMajorFunction::LockControl => lockctrl::dispatch_lock_control(ctx),
        IrpMajorFunction::QuerySecurity => security::dispatch_query_security(ctx),
        IrpMajorFunction::SetSecurity => security::dispatch_set_security(ctx),
        IrpMajorFunction::Shutdown => Ok(STATUS_SUCCESS),
    }
}

/// Operations still accepted while the volume goes away
pub fn passes_unmount_gate(major: IrpMajorFunction) -> bool {
    matches!(
        major,
        IrpMajorFunction::Close
            | IrpMajorFunction::Cleanup
            | IrpMajorFunction::Shutdown
            | IrpMajorFunction::DeviceControl
    )
}

/// Operations a write-protected volume rejects
pub fn is_mutating(parameters: &IrpParameters) -> bool {
    match parameters {
        IrpParameters::Write { .. }
        | IrpParameters::SetSecurity { .. }
        | IrpParameters::SetVolumeInformation { .. } => true,
        IrpParameters::SetInformation { class, .. } => *class != FILE_POSITION_INFORMATION,
        IrpParameters::Create(create) => {
            create.create_disposition != create_disposition::FILE_OPEN
                || create.desired_access & file_access::MODIFYING_ACCESS != 0
                || create.create_options & create_options::FILE_DELETE_ON_CLOSE != 0
        }
        _ => false,
    }
}
