//! IRP_MJ_READ

use std::sync::Arc;

use super::context::{Completion, IrpContext};
use super::event::RequestBody;
use crate::fsrtl::OplockBreakRequest;
use crate::io::{byte_offset, FileObject, IrpParameters};
use crate::status::{
    NtStatus, STATUS_FILE_IS_A_DIRECTORY, STATUS_INVALID_PARAMETER, STATUS_PENDING,
    STATUS_SUCCESS,
};

/// Resolve a transfer offset; `None` in the second slot means it came from
/// the file pointer
pub(super) fn resolve_offset(
    file: &Arc<FileObject>,
    requested: i64,
) -> Result<(u64, Option<u64>), NtStatus> {
    match requested {
        byte_offset::FILE_USE_FILE_POINTER_POSITION => Ok((file.position(), None)),
        offset if offset >= 0 => Ok((offset as u64, Some(offset as u64))),
        _ => Err(STATUS_INVALID_PARAMETER),
    }
}

pub fn dispatch_read(ctx: IrpContext<'_>) -> Result<NtStatus, NtStatus> {
    let IrpParameters::Read {
        byte_offset,
        length,
        ..
    } = *ctx.irp.parameters()
    else {
        return Err(STATUS_INVALID_PARAMETER);
    };
    let file = ctx.file_object()?;
    let ccb = ctx.ccb()?;
    let fcb = Arc::clone(ccb.fcb());

    if fcb.is_directory() {
        return Err(STATUS_FILE_IS_A_DIRECTORY);
    }
    if length == 0 {
        ctx.irp.set_information(0);
        return Ok(STATUS_SUCCESS);
    }

    let (offset, explicit) = resolve_offset(file, byte_offset)?;
    let paging = ctx.irp.is_paging_io();
    if !paging {
        fcb.file_lock
            .lock()
            .check_read_access(ccb.id(), offset as i64, length as u64)?;
        if !ctx.check_oplock(&fcb, ccb.id(), OplockBreakRequest::Read)? {
            return Ok(STATUS_PENDING);
        }
    }

    let request = ctx.request(
        Some(ccb.as_ref()),
        RequestBody::Read {
            offset: offset as i64,
            length,
            path: fcb.path(),
        },
    );
    ctx.relay(
        Some(ccb),
        Completion::Read {
            offset: explicit,
            length,
        },
        request,
    )
}
