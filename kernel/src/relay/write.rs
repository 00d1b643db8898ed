//! IRP_MJ_WRITE
//!
//! Writes whose request message would exceed the inline limit are sent
//! header-only; user mode fetches the data with the fetch-write call
//! before answering (see the pending registry).

use std::sync::Arc;

use super::context::{Completion, IrpContext};
use super::event::{event_flags, RequestBody};
use super::read::resolve_offset;
use crate::fsrtl::OplockBreakRequest;
use crate::io::{byte_offset, IrpParameters};
use crate::status::{
    NtStatus, STATUS_FILE_IS_A_DIRECTORY, STATUS_INVALID_PARAMETER, STATUS_PENDING,
    STATUS_SUCCESS,
};

pub fn dispatch_write(ctx: IrpContext<'_>) -> Result<NtStatus, NtStatus> {
    let IrpParameters::Write {
        byte_offset, data, ..
    } = ctx.irp.parameters()
    else {
        return Err(STATUS_INVALID_PARAMETER);
    };
    let file = ctx.file_object()?;
    let ccb = ctx.ccb()?;
    let fcb = Arc::clone(ccb.fcb());

    if fcb.is_directory() {
        return Err(STATUS_FILE_IS_A_DIRECTORY);
    }
    if data.is_empty() {
        ctx.irp.set_information(0);
        return Ok(STATUS_SUCCESS);
    }
    let length = u32::try_from(data.len()).map_err(|_| STATUS_INVALID_PARAMETER)?;

    let append = *byte_offset == byte_offset::FILE_WRITE_TO_END_OF_FILE;
    let (offset, explicit) = if append {
        (None, None)
    } else {
        let (offset, explicit) = resolve_offset(file, *byte_offset)?;
        (Some(offset), explicit)
    };

    let paging = ctx.irp.is_paging_io();
    if !paging {
        if let Some(offset) = offset {
            fcb.file_lock
                .lock()
                .check_write_access(ccb.id(), offset as i64, length as u64)?;
        }
        if !ctx.check_oplock(&fcb, ccb.id(), OplockBreakRequest::Write)? {
            return Ok(STATUS_PENDING);
        }
    }

    let mut request = ctx.request(
        Some(ccb.as_ref()),
        RequestBody::Write {
            offset: offset.map_or(byte_offset::FILE_WRITE_TO_END_OF_FILE, |o| o as i64),
            length,
            path: fcb.path(),
            data: data.clone(),
        },
    );
    if append {
        request.flags |= event_flags::WRITE_TO_END_OF_FILE;
    }
    ctx.relay(
        Some(ccb),
        Completion::Write {
            offset: explicit,
            length,
        },
        request,
    )
}
