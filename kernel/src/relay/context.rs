//! Request Contexts
//!
//! [`IrpContext`] is what a handler works with while it still owns the IRP.
//! [`RequestContext`] is what it leaves behind in the pending registry:
//! the IRP, the control blocks it needs, and a [`Completion`] describing
//! how to apply the user-mode response.

use std::sync::Arc;

use super::ccb::{Ccb, CcbFlags};
use super::close::{self, CleanupState};
use super::create::{self, CreateState};
use super::dcb::Dcb;
use super::event::{event_flags, EventRequest, EventResponse, RequestBody};
use super::fcb::Fcb;
use super::fileinfo::{self, SetInformationState};
use super::metrics::VolumeMetrics;
use super::vcb::Vcb;
use crate::fsrtl::{OplockBreakRequest, OplockContinuation, OplockOutcome};
use crate::io::{io_complete_with_status, FileObject, Irp, IrpFlags};
use crate::status::{nt_success, NtStatus, STATUS_INVALID_PARAMETER, STATUS_NO_SUCH_DEVICE};

/// How a response is applied to the IRP
#[derive(Debug)]
pub enum Completion {
    /// Payload becomes the output; without one, Information is copied
    Data,
    /// Status and Information only
    Status,
    Read {
        /// Explicit offset, for the synchronous file pointer
        offset: Option<u64>,
        length: u32,
    },
    Write {
        offset: Option<u64>,
        length: u32,
    },
    /// Information carries the next enumeration index
    QueryDirectory,
    Create(CreateState),
    SetInformation(SetInformationState),
    Cleanup(CleanupState),
}

/// A request parked in the pending registry
#[derive(Debug)]
pub struct RequestContext {
    pub vcb: Arc<Vcb>,
    pub irp: Arc<Irp>,
    pub ccb: Option<Arc<Ccb>>,
    pub completion: Completion,
}

impl RequestContext {
    pub fn is_create(&self) -> bool {
        matches!(self.completion, Completion::Create(_))
    }

    /// Apply `response` and return the completion status
    pub fn finish(self, response: &EventResponse) -> NtStatus {
        let Self {
            vcb,
            irp,
            ccb,
            completion,
        } = self;
        let status = response.status;

        match completion {
            Completion::Data => {
                if response.payload.is_empty() {
                    irp.set_information(response.information as usize);
                } else {
                    irp.set_output(response.payload.clone());
                }
                status
            }
            Completion::Status => {
                irp.set_information(response.information as usize);
                status
            }
            Completion::Read { offset, length } => {
                let mut data = response.payload.clone();
                data.truncate(length as usize);
                if nt_success(status) {
                    sync_position(&irp, offset);
                }
                irp.set_output(data);
                status
            }
            Completion::Write { offset, length } => {
                if nt_success(status) {
                    sync_position(&irp, offset);
                }
                irp.set_information(response.information.min(length as u64) as usize);
                status
            }
            Completion::QueryDirectory => {
                if nt_success(status) {
                    if let Some(ccb) = &ccb {
                        ccb.set_directory_index(response.information);
                    }
                }
                irp.set_output(response.payload.clone());
                status
            }
            Completion::Create(state) => create::complete_create(state, &vcb, &irp, response),
            Completion::SetInformation(state) => {
                fileinfo::complete_set_information(state, &vcb, ccb.as_deref(), response)
            }
            Completion::Cleanup(state) => close::complete_cleanup(state, &vcb, &irp, response),
        }
    }
}

/// Explicit offsets reset the pointer before completion advances it
fn sync_position(irp: &Irp, offset: Option<u64>) {
    if let (Some(offset), Some(file)) = (offset, irp.file_object()) {
        if file.is_synchronous() && !irp.is_paging_io() {
            file.set_position(offset);
        }
    }
}

/// Handler-side view of one IRP
#[derive(Debug, Clone, Copy)]
pub struct IrpContext<'a> {
    pub dcb: &'a Arc<Dcb>,
    pub irp: &'a Arc<Irp>,
}

impl<'a> IrpContext<'a> {
    pub fn new(dcb: &'a Arc<Dcb>, irp: &'a Arc<Irp>) -> Self {
        Self { dcb, irp }
    }

    pub fn vcb(&self) -> &'a Arc<Vcb> {
        self.dcb.vcb()
    }

    pub fn file_object(&self) -> Result<&'a Arc<FileObject>, NtStatus> {
        self.irp.file_object().ok_or(STATUS_INVALID_PARAMETER)
    }

    /// The handle's CCB
    pub fn ccb(&self) -> Result<Arc<Ccb>, NtStatus> {
        self.file_object()?
            .fs_context2::<Ccb>()
            .ok_or(STATUS_INVALID_PARAMETER)
    }

    fn request_flags(&self, ccb: Option<&Ccb>) -> u32 {
        let mut flags = 0;
        let irp_flags = self.irp.flags();
        if irp_flags.contains(IrpFlags::PAGING_IO) {
            flags |= event_flags::PAGING_IO;
        }
        if irp_flags.contains(IrpFlags::NOCACHE) {
            flags |= event_flags::NOCACHE;
        }
        if self.irp.file_object().is_some_and(|f| f.is_synchronous()) {
            flags |= event_flags::SYNCHRONOUS_IO;
        }
        if self.vcb().is_case_sensitive() {
            flags |= event_flags::CASE_SENSITIVE;
        }
        if let Some(ccb) = ccb {
            if ccb.fcb().is_directory() {
                flags |= event_flags::DIRECTORY;
            }
            if ccb.flags().contains(CcbFlags::DELETE_ON_CLOSE) {
                flags |= event_flags::DELETE_ON_CLOSE;
            }
        }
        flags
    }

    /// Build the request message for this IRP; the serial is filled in later
    pub fn request(&self, ccb: Option<&Ccb>, body: RequestBody) -> EventRequest {
        EventRequest {
            serial: 0,
            mount_id: self.dcb.mount_id(),
            minor: self.irp.minor_function(),
            flags: self.request_flags(ccb),
            process_id: self.irp.requestor_process_id(),
            file_context: ccb.map_or(0, Ccb::context),
            body,
        }
    }

    /// Hand the IRP to user mode
    pub fn relay(
        &self,
        ccb: Option<Arc<Ccb>>,
        completion: Completion,
        request: EventRequest,
    ) -> Result<NtStatus, NtStatus> {
        let context = RequestContext {
            vcb: Arc::clone(self.vcb()),
            irp: Arc::clone(self.irp),
            ccb,
            completion,
        };
        self.dcb.submit(context, request)
    }

    /// Consult the FCB's oplock before doing `request`
    ///
    /// `Ok(true)` means go on, `Ok(false)` means the IRP was parked behind a
    /// break and the handler must return STATUS_PENDING.
    pub fn check_oplock(
        &self,
        fcb: &Fcb,
        owner: u64,
        request: OplockBreakRequest,
    ) -> Result<bool, NtStatus> {
        let irp = Arc::clone(self.irp);
        let dcb = Arc::downgrade(self.dcb);
        let continuation: OplockContinuation = Box::new(move |status| {
            if !nt_success(status) {
                io_complete_with_status(&irp, status);
                return;
            }
            match dcb.upgrade() {
                Some(dcb) => dcb.queue_retry(irp),
                None => {
                    io_complete_with_status(&irp, STATUS_NO_SUCH_DEVICE);
                }
            }
        });

        let now = self.dcb.clock().tick_count();
        let check = fcb.oplock.lock().check(owner, request, now, continuation);
        for notify in check.notify {
            notify.deliver();
        }

        match check.outcome {
            OplockOutcome::Proceed => Ok(true),
            OplockOutcome::Fail(status) => Err(status),
            OplockOutcome::Deferred => {
                self.irp.mark_pending();
                VolumeMetrics::bump(&self.vcb().metrics().oplock_deferrals);
                relay_debug!(FSRTL, "[FSRTL] irp {} waits for an oplock break", self.irp.id());
                Ok(false)
            }
        }
    }
}
