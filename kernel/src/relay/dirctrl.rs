//! IRP_MJ_DIRECTORY_CONTROL
//!
//! Enumeration is relayed with the handle's search pattern and resume
//! index; change notification is served from the volume's notify list.

use std::sync::Arc;

use super::context::{Completion, IrpContext};
use super::event::{event_flags, RequestBody};
use crate::fsrtl::{notify_filter, NotifyOutcome};
use crate::io::IrpParameters;
use crate::status::{
    NtStatus, STATUS_INVALID_PARAMETER, STATUS_NOT_A_DIRECTORY, STATUS_PENDING,
};

/// Pattern used when the first query names none
const MATCH_ALL: &str = "*";

pub fn dispatch_directory_control(ctx: IrpContext<'_>) -> Result<NtStatus, NtStatus> {
    match ctx.irp.parameters() {
        IrpParameters::QueryDirectory { .. } => query_directory(ctx),
        IrpParameters::NotifyChangeDirectory { .. } => notify_change_directory(ctx),
        _ => Err(STATUS_INVALID_PARAMETER),
    }
}

fn query_directory(ctx: IrpContext<'_>) -> Result<NtStatus, NtStatus> {
    let IrpParameters::QueryDirectory {
        class,
        length,
        pattern,
        restart_scan,
        return_single_entry,
    } = ctx.irp.parameters()
    else {
        return Err(STATUS_INVALID_PARAMETER);
    };
    let ccb = ctx.ccb()?;
    let fcb = Arc::clone(ccb.fcb());
    if !fcb.is_directory() {
        return Err(STATUS_NOT_A_DIRECTORY);
    }

    // The first pattern sticks to the handle unless the scan restarts
    if let Some(pattern) = pattern {
        if *restart_scan || ccb.search_pattern().is_none() {
            ccb.set_search_pattern(Some(pattern.clone()));
        }
    }
    if *restart_scan {
        ccb.set_directory_index(0);
    }
    let pattern = ccb
        .search_pattern()
        .unwrap_or_else(|| MATCH_ALL.to_string());

    let mut request = ctx.request(
        Some(ccb.as_ref()),
        RequestBody::QueryDirectory {
            class: *class,
            length: *length,
            file_index: ccb.directory_index(),
            path: fcb.path(),
            pattern,
        },
    );
    if *restart_scan {
        request.flags |= event_flags::RESTART_SCAN;
    }
    if *return_single_entry {
        request.flags |= event_flags::RETURN_SINGLE_ENTRY;
    }
    ctx.relay(Some(ccb), Completion::QueryDirectory, request)
}

fn notify_change_directory(ctx: IrpContext<'_>) -> Result<NtStatus, NtStatus> {
    let IrpParameters::NotifyChangeDirectory {
        completion_filter,
        watch_tree,
        length,
    } = *ctx.irp.parameters()
    else {
        return Err(STATUS_INVALID_PARAMETER);
    };
    let ccb = ctx.ccb()?;
    let fcb = ccb.fcb();
    if !fcb.is_directory() {
        return Err(STATUS_NOT_A_DIRECTORY);
    }
    if completion_filter == 0 || completion_filter & !notify_filter::FILE_NOTIFY_VALID_MASK != 0 {
        return Err(STATUS_INVALID_PARAMETER);
    }

    let outcome = ctx.vcb().notify().change_directory(
        ccb.id(),
        &fcb.path(),
        completion_filter,
        watch_tree,
        ctx.irp,
        length as usize,
    );
    match outcome {
        NotifyOutcome::Complete(status, payload) => {
            ctx.irp.set_output(payload);
            Ok(status)
        }
        NotifyOutcome::Pending => {
            ctx.irp.mark_pending();
            Ok(STATUS_PENDING)
        }
    }
}
