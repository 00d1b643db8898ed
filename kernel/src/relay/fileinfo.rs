//! IRP_MJ_QUERY_INFORMATION / IRP_MJ_SET_INFORMATION
//!
//! Position information is answered in-kernel from the file object.
//! Everything else goes to user mode; a successful disposition or rename
//! is mirrored into the FCB table once the answer comes back.

use std::sync::Arc;

use super::ccb::Ccb;
use super::context::{Completion, IrpContext};
use super::event::{event_flags, EventResponse, RequestBody, WireReader, WireWriter};
use super::fcb::{Fcb, FcbFlags};
use super::vcb::Vcb;
use crate::fsrtl::{file_action, fsrtl_normalize_path, notify_filter, OplockBreakRequest};
use crate::io::IrpParameters;
use crate::status::{
    nt_success, NtStatus, STATUS_ACCESS_DENIED, STATUS_BUFFER_TOO_SMALL,
    STATUS_INFO_LENGTH_MISMATCH, STATUS_INVALID_PARAMETER, STATUS_PENDING, STATUS_SUCCESS,
};

// FILE_INFORMATION_CLASS values the relay looks at
pub const FILE_BASIC_INFORMATION: u32 = 4;
pub const FILE_STANDARD_INFORMATION: u32 = 5;
pub const FILE_RENAME_INFORMATION: u32 = 10;
pub const FILE_DISPOSITION_INFORMATION: u32 = 13;
pub const FILE_POSITION_INFORMATION: u32 = 14;
pub const FILE_ALLOCATION_INFORMATION: u32 = 19;
pub const FILE_END_OF_FILE_INFORMATION: u32 = 20;

/// Byte offset of FileName in FILE_RENAME_INFORMATION
const RENAME_NAME_OFFSET: usize = 20;

/// Build a FILE_RENAME_INFORMATION buffer
pub fn encode_rename_information(replace_if_exists: bool, file_name: &str) -> Vec<u8> {
    let units: Vec<u16> = file_name.encode_utf16().collect();
    let mut w = WireWriter::default();
    w.u8(replace_if_exists as u8)
        .raw(&[0; 7])
        .u64(0)
        .u32((units.len() * 2) as u32);
    for unit in units {
        w.u16(unit);
    }
    w.into_inner()
}

/// Parse a FILE_RENAME_INFORMATION buffer
pub fn decode_rename_information(buffer: &[u8]) -> Result<(bool, String), NtStatus> {
    if buffer.len() < RENAME_NAME_OFFSET {
        return Err(STATUS_INFO_LENGTH_MISMATCH);
    }
    let mut r = WireReader::new(buffer);
    let replace = r.u8()? != 0;
    r.take(15)?;
    let name_length = r.u32()? as usize;
    if name_length % 2 != 0 {
        return Err(STATUS_INFO_LENGTH_MISMATCH);
    }
    let units: Vec<u16> = r
        .take(name_length)?
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    let name = String::from_utf16(&units).map_err(|_| STATUS_INVALID_PARAMETER)?;
    Ok((replace, name))
}

pub fn dispatch_query_information(ctx: IrpContext<'_>) -> Result<NtStatus, NtStatus> {
    let IrpParameters::QueryInformation { class, length } = *ctx.irp.parameters() else {
        return Err(STATUS_INVALID_PARAMETER);
    };
    let file = ctx.file_object()?;
    let ccb = ctx.ccb()?;

    if class == FILE_POSITION_INFORMATION {
        if length < 8 {
            return Err(STATUS_BUFFER_TOO_SMALL);
        }
        ctx.irp.set_output(file.position().to_le_bytes().to_vec());
        return Ok(STATUS_SUCCESS);
    }

    let request = ctx.request(
        Some(ccb.as_ref()),
        RequestBody::QueryInformation {
            class,
            length,
            path: ccb.fcb().path(),
        },
    );
    ctx.relay(Some(ccb), Completion::Data, request)
}

/// What a set-information answer has to update
#[derive(Debug)]
pub struct SetInformationState {
    class: u32,
    old_path: String,
    rename_target: Option<String>,
    delete: bool,
}

pub fn dispatch_set_information(ctx: IrpContext<'_>) -> Result<NtStatus, NtStatus> {
    let IrpParameters::SetInformation { class, buffer } = ctx.irp.parameters() else {
        return Err(STATUS_INVALID_PARAMETER);
    };
    let class = *class;
    let file = ctx.file_object()?;
    let ccb = ctx.ccb()?;
    let fcb = Arc::clone(ccb.fcb());
    let vcb = ctx.vcb();

    let mut flags = 0;
    let mut rename_target = None;
    let mut delete = false;

    match class {
        FILE_POSITION_INFORMATION => {
            let mut r = WireReader::new(buffer);
            let position = r.u64()?;
            file.set_position(position);
            return Ok(STATUS_SUCCESS);
        }
        FILE_DISPOSITION_INFORMATION => {
            delete = buffer.first().copied().ok_or(STATUS_INFO_LENGTH_MISMATCH)? != 0;
        }
        FILE_RENAME_INFORMATION => {
            let (replace, name) = decode_rename_information(buffer)?;
            let target = fsrtl_normalize_path(&name, ctx.dcb.options().allows_streams())?;
            // A path some other handle has open cannot be replaced
            if let Some(existing) = vcb.lookup_fcb(&target) {
                if !Arc::ptr_eq(&existing, &fcb) && existing.file_count() > 0 {
                    return Err(STATUS_ACCESS_DENIED);
                }
            }
            if replace {
                flags |= event_flags::REPLACE_IF_EXISTS;
            }
            rename_target = Some(target);
        }
        _ => {}
    }

    if !ctx.check_oplock(&fcb, ccb.id(), OplockBreakRequest::SetInformation)? {
        return Ok(STATUS_PENDING);
    }

    let old_path = fcb.path();
    let mut request = ctx.request(
        Some(ccb.as_ref()),
        RequestBody::SetInformation {
            class,
            path: old_path.clone(),
            buffer: buffer.clone(),
            target: rename_target.clone().unwrap_or_default(),
        },
    );
    request.flags |= flags;
    let state = SetInformationState {
        class,
        old_path,
        rename_target,
        delete,
    };
    ctx.relay(Some(ccb), Completion::SetInformation(state), request)
}

fn name_filter(fcb: &Fcb) -> u32 {
    if fcb.is_directory() {
        notify_filter::FILE_NOTIFY_CHANGE_DIR_NAME
    } else {
        notify_filter::FILE_NOTIFY_CHANGE_FILE_NAME
    }
}

pub(super) fn complete_set_information(
    state: SetInformationState,
    vcb: &Vcb,
    ccb: Option<&Ccb>,
    response: &EventResponse,
) -> NtStatus {
    let status = response.status;
    let Some(ccb) = ccb else {
        return status;
    };
    if !nt_success(status) {
        return status;
    }
    let fcb = ccb.fcb();
    let notify = vcb.notify();

    match state.class {
        FILE_DISPOSITION_INFORMATION => {
            if state.delete {
                fcb.set_flags(FcbFlags::DELETE_PENDING);
            } else {
                fcb.clear_flags(FcbFlags::DELETE_PENDING);
            }
        }
        FILE_RENAME_INFORMATION => {
            if let Some(target) = &state.rename_target {
                if let Err(err) = vcb.rename_fcb(fcb, target) {
                    log::warn!(
                        "[RELAY] rename {} -> {} applied by user mode but not in the table: {:#x}",
                        state.old_path,
                        target,
                        err
                    );
                }
                let filter = name_filter(fcb);
                notify.report_change(
                    &state.old_path,
                    filter,
                    file_action::FILE_ACTION_RENAMED_OLD_NAME,
                );
                notify.report_change(target, filter, file_action::FILE_ACTION_RENAMED_NEW_NAME);
            }
        }
        FILE_END_OF_FILE_INFORMATION | FILE_ALLOCATION_INFORMATION => {
            notify.report_change(
                &state.old_path,
                notify_filter::FILE_NOTIFY_CHANGE_SIZE,
                file_action::FILE_ACTION_MODIFIED,
            );
        }
        FILE_BASIC_INFORMATION => {
            notify.report_change(
                &state.old_path,
                notify_filter::FILE_NOTIFY_CHANGE_ATTRIBUTES
                    | notify_filter::FILE_NOTIFY_CHANGE_LAST_WRITE,
                file_action::FILE_ACTION_MODIFIED,
            );
        }
        _ => {}
    }
    status
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rename_information_layout() {
        let buffer = encode_rename_information(true, "\\new name");
        assert_eq!(buffer[0], 1);
        assert_eq!(buffer.len(), RENAME_NAME_OFFSET + 18);
        assert_eq!(
            decode_rename_information(&buffer).unwrap(),
            (true, "\\new name".to_string())
        );
        assert_eq!(
            decode_rename_information(&buffer[..RENAME_NAME_OFFSET + 3]),
            Err(STATUS_INFO_LENGTH_MISMATCH)
        );
    }
}
