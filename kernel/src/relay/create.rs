//! IRP_MJ_CREATE
//!
//! The FCB reference and share access are taken before the request is
//! relayed and handed to the new CCB only when user mode reports success.
//! Until then they live in a [`CreateState`], whose drop undoes them, so a
//! failed, canceled or expired create leaves nothing behind.

use std::sync::Arc;

use super::ccb::{Ccb, CcbFlags};
use super::context::{Completion, IrpContext};
use super::event::{response_flags, EventResponse, RequestBody};
use super::fcb::{FcbFlags, FcbRef};
use super::options::KEEPALIVE_FILE_NAME;
use super::vcb::Vcb;
use crate::fsrtl::{
    file_action, fsrtl_are_names_equal, fsrtl_normalize_path, notify_filter, OplockBreakRequest,
};
use crate::io::{
    create_disposition, create_information, create_options, file_flags, AccessGrant,
    CreateParameters, FileObject, FsContext, Irp, IrpParameters,
};
use crate::status::{
    nt_success, NtStatus, STATUS_DELETE_PENDING, STATUS_INVALID_PARAMETER, STATUS_PENDING,
    STATUS_SUCCESS,
};

/// Side effects of a create in flight
#[derive(Debug)]
pub struct CreateState {
    reference: Option<FcbRef>,
    grant: AccessGrant,
    share_added: bool,
    parameters: CreateParameters,
    path: String,
}

impl Drop for CreateState {
    fn drop(&mut self) {
        if let Some(reference) = self.reference.take() {
            if self.share_added {
                reference.write().share_access.remove(&self.grant);
            }
            reference.release();
        }
    }
}

pub fn dispatch_create(ctx: IrpContext<'_>) -> Result<NtStatus, NtStatus> {
    let IrpParameters::Create(parameters) = ctx.irp.parameters() else {
        return Err(STATUS_INVALID_PARAMETER);
    };
    let file = ctx.file_object()?;
    let options = ctx.dcb.options();

    if parameters.create_disposition > create_disposition::FILE_MAXIMUM_DISPOSITION {
        return Err(STATUS_INVALID_PARAMETER);
    }
    let both = create_options::FILE_DIRECTORY_FILE | create_options::FILE_NON_DIRECTORY_FILE;
    if parameters.create_options & both == both {
        return Err(STATUS_INVALID_PARAMETER);
    }

    let path = fsrtl_normalize_path(&parameters.file_name, options.allows_streams())?;
    if fsrtl_are_names_equal(&path, KEEPALIVE_FILE_NAME, true) {
        return open_keepalive(ctx, file, &path);
    }

    let reference = ctx.vcb().acquire_fcb(&path)?;
    if reference.is_delete_pending() {
        return Err(STATUS_DELETE_PENDING);
    }

    let grant = AccessGrant::from_masks(parameters.desired_access, parameters.share_access);
    if grant.is_data_access() {
        reference.read().share_access.check(&grant)?;
    }

    // An open against an exclusive oplock waits for the break
    if !ctx.check_oplock(&reference, 0, OplockBreakRequest::HandleCreate)? {
        return Ok(STATUS_PENDING);
    }

    let share_added = if grant.is_data_access() {
        reference.write().share_access.check_and_add(&grant)?;
        true
    } else {
        false
    };

    let request = ctx.request(
        None,
        RequestBody::Create {
            desired_access: parameters.desired_access,
            file_attributes: parameters.file_attributes,
            share_access: parameters.share_access,
            create_disposition: parameters.create_disposition,
            create_options: parameters.create_options,
            path: path.clone(),
        },
    );
    let state = CreateState {
        reference: Some(reference),
        grant,
        share_added,
        parameters: parameters.clone(),
        path,
    };
    ctx.relay(None, Completion::Create(state), request)
}

/// The reserved keepalive path never reaches user mode
fn open_keepalive(
    ctx: IrpContext<'_>,
    file: &Arc<FileObject>,
    path: &str,
) -> Result<NtStatus, NtStatus> {
    let reference = ctx.vcb().acquire_fcb(path)?;
    reference.set_flags(FcbFlags::KEEPALIVE);
    let fcb = Arc::clone(reference.fcb());
    fcb.handle_opened();

    let ccb = Arc::new(Ccb::new(
        reference,
        ctx.irp.requestor_process_id(),
        AccessGrant::default(),
    ));
    ccb.set_flags(CcbFlags::KEEPALIVE);
    file.set_contexts(fcb as FsContext, ccb as FsContext);
    ctx.irp.set_information(create_information::FILE_OPENED);
    relay_debug!(DISPATCH, "[RELAY] keepalive handle opened on {}", ctx.dcb.mount_point());
    Ok(STATUS_SUCCESS)
}

/// Apply the create response: build the CCB and bind it to the file object
pub(super) fn complete_create(
    mut state: CreateState,
    vcb: &Vcb,
    irp: &Irp,
    response: &EventResponse,
) -> NtStatus {
    let status = response.status;
    if !nt_success(status) {
        return status;
    }
    let Some(file) = irp.file_object() else {
        return STATUS_INVALID_PARAMETER;
    };
    let Some(reference) = state.reference.take() else {
        return STATUS_INVALID_PARAMETER;
    };
    // Share access now belongs to the handle and goes away at cleanup
    state.share_added = false;

    let parameters = &state.parameters;
    let is_directory = response.flags & response_flags::DIRECTORY != 0
        || parameters.create_options & create_options::FILE_DIRECTORY_FILE != 0;
    if is_directory {
        reference.set_flags(FcbFlags::DIRECTORY);
    }

    let fcb = Arc::clone(reference.fcb());
    fcb.handle_opened();
    let ccb = Arc::new(Ccb::new(reference, irp.requestor_process_id(), state.grant));
    ccb.set_context(response.context);
    if parameters.create_options & create_options::FILE_DELETE_ON_CLOSE != 0 {
        ccb.set_flags(CcbFlags::DELETE_ON_CLOSE);
        file.set_flag(file_flags::FO_DELETE_ON_CLOSE);
    }

    let information = response.information as usize;
    if information == create_information::FILE_CREATED {
        ccb.set_flags(CcbFlags::CREATED);
        let filter = if is_directory {
            notify_filter::FILE_NOTIFY_CHANGE_DIR_NAME
        } else {
            notify_filter::FILE_NOTIFY_CHANGE_FILE_NAME
        };
        vcb.notify()
            .report_change(&state.path, filter, file_action::FILE_ACTION_ADDED);
    }

    file.set_access(parameters.desired_access, parameters.share_access);
    file.set_flag(file_flags::FO_HANDLE_CREATED);
    file.set_contexts(fcb as FsContext, ccb as FsContext);
    irp.set_information(information);
    status
}
