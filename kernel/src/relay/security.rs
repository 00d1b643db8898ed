//! IRP_MJ_QUERY_SECURITY / IRP_MJ_SET_SECURITY
//!
//! Descriptors are opaque bytes here. When the caller's buffer is too
//! small user mode answers STATUS_BUFFER_OVERFLOW or
//! STATUS_BUFFER_TOO_SMALL with the needed size in Information, which is
//! passed through unchanged.

use super::context::{Completion, IrpContext};
use super::event::RequestBody;
use crate::fsrtl::OplockBreakRequest;
use crate::io::IrpParameters;
use crate::status::{NtStatus, STATUS_INVALID_PARAMETER, STATUS_PENDING};

pub fn dispatch_query_security(ctx: IrpContext<'_>) -> Result<NtStatus, NtStatus> {
    let IrpParameters::QuerySecurity {
        security_information,
        length,
    } = *ctx.irp.parameters()
    else {
        return Err(STATUS_INVALID_PARAMETER);
    };
    let ccb = ctx.ccb()?;
    let request = ctx.request(
        Some(ccb.as_ref()),
        RequestBody::QuerySecurity {
            security_information,
            length,
            path: ccb.fcb().path(),
        },
    );
    ctx.relay(Some(ccb), Completion::Data, request)
}

pub fn dispatch_set_security(ctx: IrpContext<'_>) -> Result<NtStatus, NtStatus> {
    let IrpParameters::SetSecurity {
        security_information,
        descriptor,
    } = ctx.irp.parameters()
    else {
        return Err(STATUS_INVALID_PARAMETER);
    };
    if descriptor.is_empty() {
        return Err(STATUS_INVALID_PARAMETER);
    }
    let ccb = ctx.ccb()?;
    // A security change breaks oplocks like any other metadata change
    if !ctx.check_oplock(ccb.fcb(), ccb.id(), OplockBreakRequest::SetInformation)? {
        return Ok(STATUS_PENDING);
    }
    let request = ctx.request(
        Some(ccb.as_ref()),
        RequestBody::SetSecurity {
            security_information: *security_information,
            path: ccb.fcb().path(),
            descriptor: descriptor.clone(),
        },
    );
    ctx.relay(Some(ccb), Completion::Status, request)
}
