//! IRP_MJ_FLUSH_BUFFERS

use std::sync::Arc;

use super::context::{Completion, IrpContext};
use super::event::RequestBody;
use crate::fsrtl::OplockBreakRequest;
use crate::status::{NtStatus, STATUS_PENDING};

pub fn dispatch_flush(ctx: IrpContext<'_>) -> Result<NtStatus, NtStatus> {
    let ccb = ctx.ccb()?;
    let fcb = Arc::clone(ccb.fcb());
    if !ctx.check_oplock(&fcb, ccb.id(), OplockBreakRequest::Flush)? {
        return Ok(STATUS_PENDING);
    }
    let request = ctx.request(Some(ccb.as_ref()), RequestBody::Flush { path: fcb.path() });
    ctx.relay(Some(ccb), Completion::Status, request)
}
