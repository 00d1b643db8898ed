//! IRP_MJ_CLEANUP / IRP_MJ_CLOSE
//!
//! Cleanup is the last handle going away: in-kernel state the handle owns
//! (byte-range locks, oplock, change watch, share access) is dropped here
//! before user mode hears about it. Close is the last reference to the
//! file object; user mode is told, but nothing waits for an answer.

use std::sync::Arc;

use super::ccb::{Ccb, CcbFlags};
use super::context::{Completion, IrpContext};
use super::event::{EventResponse, RequestBody};
use super::vcb::Vcb;
use crate::fsrtl::{file_action, notify_filter, OplockBreakRequest};
use crate::io::{file_flags, Irp};
use crate::status::{nt_success, NtStatus, STATUS_PENDING, STATUS_SUCCESS};

/// What cleanup still has to do once user mode answers
#[derive(Debug)]
pub struct CleanupState {
    /// Path to report as removed
    delete_path: Option<String>,
    directory: bool,
}

pub fn dispatch_cleanup(ctx: IrpContext<'_>) -> Result<NtStatus, NtStatus> {
    let file = ctx.file_object()?;
    let Some(ccb) = file.fs_context2::<Ccb>() else {
        return Ok(STATUS_SUCCESS);
    };
    if ccb.flags().contains(CcbFlags::CLEANED_UP) {
        return Ok(STATUS_SUCCESS);
    }

    let vcb = ctx.vcb();
    let fcb = Arc::clone(ccb.fcb());

    // Closing the last handle breaks a batch oplock held elsewhere
    if fcb.open_handles() <= 1
        && !ctx.check_oplock(&fcb, ccb.id(), OplockBreakRequest::Close)?
    {
        return Ok(STATUS_PENDING);
    }

    if ccb.test_and_set(CcbFlags::CLEANED_UP) {
        return Ok(STATUS_SUCCESS);
    }
    file.set_flag(file_flags::FO_CLEANUP_COMPLETE);

    let unlocked = fcb.file_lock.lock().unlock_all(ccb.id());
    let (waiters, notify) = fcb.oplock.lock().release(ccb.id());
    for notify in notify {
        notify.deliver();
    }
    for waiter in waiters {
        waiter.resume(STATUS_SUCCESS);
    }
    vcb.notify().cleanup(ccb.id());
    if ccb.grant().is_data_access() {
        fcb.write().share_access.remove(ccb.grant());
    }
    fcb.handle_cleaned_up();
    if unlocked > 0 {
        relay_debug!(FSRTL, "[FSRTL] cleanup of handle {} dropped {} locks", ccb.id(), unlocked);
    }

    if ccb.flags().contains(CcbFlags::KEEPALIVE) {
        if vcb.is_keepalive_active() {
            log::warn!(
                "[RELAY] keepalive handle on {} closed, user mode is gone",
                ctx.dcb.mount_point()
            );
            ctx.dcb.release();
        }
        return Ok(STATUS_SUCCESS);
    }

    if !vcb.is_mounted() {
        return Ok(STATUS_SUCCESS);
    }

    let wants_delete =
        ccb.flags().contains(CcbFlags::DELETE_ON_CLOSE) || fcb.is_delete_pending();
    let path = fcb.path();
    let state = CleanupState {
        delete_path: (wants_delete && fcb.open_handles() == 0).then(|| path.clone()),
        directory: fcb.is_directory(),
    };
    let request = ctx.request(Some(ccb.as_ref()), RequestBody::Cleanup { path });
    ctx.relay(Some(ccb), Completion::Cleanup(state), request)
}

pub(super) fn complete_cleanup(
    state: CleanupState,
    vcb: &Vcb,
    irp: &Irp,
    response: &EventResponse,
) -> NtStatus {
    if nt_success(response.status) {
        if let Some(path) = &state.delete_path {
            let filter = if state.directory {
                notify_filter::FILE_NOTIFY_CHANGE_DIR_NAME
            } else {
                notify_filter::FILE_NOTIFY_CHANGE_FILE_NAME
            };
            vcb.notify()
                .report_change(path, filter, file_action::FILE_ACTION_REMOVED);
        }
    }
    irp.set_information(0);
    response.status
}

pub fn dispatch_close(ctx: IrpContext<'_>) -> Result<NtStatus, NtStatus> {
    let file = ctx.file_object()?;
    let (_, ccb) = file.take_contexts();
    let Some(ccb) = ccb.and_then(|c| c.downcast::<Ccb>().ok()) else {
        return Ok(STATUS_SUCCESS);
    };

    if !ccb.flags().contains(CcbFlags::KEEPALIVE) && ctx.vcb().is_mounted() {
        let request = ctx.request(
            Some(ccb.as_ref()),
            RequestBody::Close {
                path: ccb.fcb().path(),
            },
        );
        if let Err(status) = ctx.dcb.publish_only(request) {
            relay_debug!(
                EVENT,
                "[RELAY] close of handle {} not published: {:#x}",
                ccb.id(),
                status
            );
        }
    }
    ccb.release_reference();
    Ok(STATUS_SUCCESS)
}
