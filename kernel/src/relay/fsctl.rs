//! IRP_MJ_FILE_SYSTEM_CONTROL
//!
//! Only oplock requests and the mounted-volume probe are understood.
//! A granted oplock keeps its IRP pending until the oplock breaks or the
//! holder cleans up.

use std::sync::Arc;

use super::context::IrpContext;
use crate::fsrtl::fsctl_oplock;
use crate::io::IrpParameters;
use crate::status::{
    NtStatus, STATUS_INVALID_DEVICE_REQUEST, STATUS_INVALID_PARAMETER, STATUS_PENDING,
    STATUS_SUCCESS,
};

pub const FSCTL_IS_VOLUME_MOUNTED: u32 = 0x0009_0028;

pub fn dispatch_fs_control(ctx: IrpContext<'_>) -> Result<NtStatus, NtStatus> {
    let IrpParameters::FileSystemControl {
        fs_control_code, ..
    } = *ctx.irp.parameters()
    else {
        return Err(STATUS_INVALID_PARAMETER);
    };

    if fs_control_code == FSCTL_IS_VOLUME_MOUNTED {
        return Ok(STATUS_SUCCESS);
    }
    if !fsctl_oplock::is_oplock_fsctl(fs_control_code) {
        return Err(STATUS_INVALID_DEVICE_REQUEST);
    }

    let ccb = ctx.ccb()?;
    let fcb = Arc::clone(ccb.fcb());
    let now = ctx.dcb.clock().tick_count();
    let result = fcb.oplock.lock().fsctrl(
        fs_control_code,
        ccb.id(),
        fcb.open_handles(),
        ctx.irp,
        now,
    );

    // Acknowledged: parked operations go back through the router
    for waiter in result.released {
        waiter.resume(STATUS_SUCCESS);
    }
    if result.status == STATUS_PENDING {
        ctx.irp.mark_pending();
    }
    relay_debug!(
        FSRTL,
        "[FSRTL] fsctl {:#x} on handle {}: {:#x}",
        fs_control_code,
        ccb.id(),
        result.status
    );
    Ok(result.status)
}
