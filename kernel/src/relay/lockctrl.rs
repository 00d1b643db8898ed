//! IRP_MJ_LOCK_CONTROL
//!
//! Byte-range locks are arbitrated in-kernel against the FCB's lock table
//! unless the volume asked for user-mode locking.

use std::sync::Arc;

use super::context::{Completion, IrpContext};
use super::event::{event_flags, RequestBody};
use super::options::MountFlags;
use crate::fsrtl::{LockRequest, OplockBreakRequest};
use crate::io::{irp_minor, IrpParameters};
use crate::status::{
    NtStatus, STATUS_INVALID_DEVICE_REQUEST, STATUS_INVALID_PARAMETER, STATUS_PENDING,
    STATUS_SUCCESS,
};

pub fn dispatch_lock_control(ctx: IrpContext<'_>) -> Result<NtStatus, NtStatus> {
    let IrpParameters::LockControl {
        minor,
        byte_offset,
        length,
        key,
        fail_immediately,
        exclusive,
    } = *ctx.irp.parameters()
    else {
        return Err(STATUS_INVALID_PARAMETER);
    };
    let ccb = ctx.ccb()?;
    let fcb = Arc::clone(ccb.fcb());

    if ctx
        .dcb
        .options()
        .flags
        .contains(MountFlags::FILELOCK_USER_MODE)
    {
        let mut request = ctx.request(
            Some(ccb.as_ref()),
            RequestBody::LockControl {
                offset: byte_offset,
                length,
                key,
                path: fcb.path(),
            },
        );
        if fail_immediately {
            request.flags |= event_flags::FAIL_IMMEDIATELY;
        }
        if exclusive {
            request.flags |= event_flags::EXCLUSIVE_LOCK;
        }
        return ctx.relay(Some(ccb), Completion::Status, request);
    }

    if !ctx.check_oplock(&fcb, ccb.id(), OplockBreakRequest::Lock)? {
        return Ok(STATUS_PENDING);
    }

    let mut locks = fcb.file_lock.lock();
    match minor {
        irp_minor::IRP_MN_LOCK => locks.process_lock(&LockRequest {
            owner: ccb.id(),
            process_id: ccb.process_id(),
            starting_byte: byte_offset,
            length,
            key,
            fail_immediately,
            exclusive,
        })?,
        irp_minor::IRP_MN_UNLOCK_SINGLE => locks.unlock_single(ccb.id(), byte_offset, length, key)?,
        irp_minor::IRP_MN_UNLOCK_ALL => {
            locks.unlock_all(ccb.id());
        }
        irp_minor::IRP_MN_UNLOCK_ALL_BY_KEY => {
            locks.unlock_all_by_key(ccb.id(), key);
        }
        _ => return Err(STATUS_INVALID_DEVICE_REQUEST),
    }
    Ok(STATUS_SUCCESS)
}
