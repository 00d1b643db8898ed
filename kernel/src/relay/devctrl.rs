//! IRP_MJ_DEVICE_CONTROL
//!
//! The control surface user-mode workers talk to. Every call carries a
//! byte buffer that is decoded here, at the boundary; nothing past this
//! module sees raw IOCTL input.
//!
//! Volume controls arrive through the router like any other IRP. The
//! driver-wide ones (version, mount list, debug verbosity, unmount by
//! name) go to [`Driver::device_control`](super::Driver::device_control).

use std::time::Duration;

use super::ccb::CcbFlags;
use super::channel::PullError;
use super::context::IrpContext;
use super::event::{EventResponse, WireReader, WireWriter};
use super::vcb::VcbFlags;
use crate::fsrtl::fsrtl_normalize_path;
use crate::io::{Irp, IrpParameters};
use crate::status::{
    status_name, NtStatus, STATUS_BUFFER_TOO_SMALL, STATUS_INVALID_DEVICE_REQUEST,
    STATUS_INVALID_PARAMETER, STATUS_NO_SUCH_DEVICE, STATUS_SUCCESS, STATUS_TIMEOUT,
};

/// Version reported by the get-version calls
pub const DRIVER_VERSION: u32 = 0x0000_0190;

const FILE_DEVICE_UNKNOWN: u32 = 0x0000_0022;
const METHOD_BUFFERED: u32 = 0;
const FILE_ANY_ACCESS: u32 = 0;

/// CTL_CODE
pub const fn ctl_code(device_type: u32, function: u32, method: u32, access: u32) -> u32 {
    (device_type << 16) | (access << 14) | (function << 2) | method
}

const fn relay_ioctl(function: u32) -> u32 {
    ctl_code(FILE_DEVICE_UNKNOWN, function, METHOD_BUFFERED, FILE_ANY_ACCESS)
}

/// Pull requests, optionally answering one first
pub const IOCTL_EVENT_WAIT: u32 = relay_ioctl(0x800);
/// Answer one request
pub const IOCTL_EVENT_INFO: u32 = relay_ioctl(0x801);
/// Fetch the full message of a large write
pub const IOCTL_EVENT_WRITE: u32 = relay_ioctl(0x802);
/// Unmount this volume
pub const IOCTL_EVENT_RELEASE: u32 = relay_ioctl(0x803);
pub const IOCTL_RESET_TIMEOUT: u32 = relay_ioctl(0x804);
pub const IOCTL_ACTIVATE_KEEPALIVE: u32 = relay_ioctl(0x805);
/// Report a change made behind the kernel's back
pub const IOCTL_NOTIFY_PATH: u32 = relay_ioctl(0x806);
pub const IOCTL_GET_VOLUME_METRICS: u32 = relay_ioctl(0x807);
pub const IOCTL_GET_VERSION: u32 = relay_ioctl(0x808);
pub const IOCTL_SET_DEBUG_FLAGS: u32 = relay_ioctl(0x809);
pub const IOCTL_GET_MOUNT_LIST: u32 = relay_ioctl(0x80A);
pub const IOCTL_UNMOUNT: u32 = relay_ioctl(0x80B);

/// Event-wait timeout meaning "forever"
pub const WAIT_INFINITE: u32 = u32::MAX;

/// Header of an event-wait input buffer; a response may follow it
pub const EVENT_WAIT_HEADER_SIZE: usize = 8;

/// Input of IOCTL_EVENT_WAIT
pub fn encode_event_wait(timeout_ms: u32, response: Option<&EventResponse>) -> Vec<u8> {
    let mut w = WireWriter::default();
    w.u32(timeout_ms).u32(0);
    if let Some(response) = response {
        w.raw(&response.encode());
    }
    w.into_inner()
}

/// Input of IOCTL_RESET_TIMEOUT
pub fn encode_reset_timeout(serial: u64, timeout_ms: u32) -> Vec<u8> {
    let mut w = WireWriter::default();
    w.u64(serial).u32(timeout_ms);
    w.into_inner()
}

/// Input of IOCTL_NOTIFY_PATH
pub fn encode_notify_path(action: u32, filter: u32, path: &str) -> Vec<u8> {
    let mut w = WireWriter::default();
    w.u32(action).u32(filter).string(path);
    w.into_inner()
}

/// Copy `data` to the output or report the size needed
pub(super) fn write_output(
    irp: &Irp,
    output_length: u32,
    data: Vec<u8>,
) -> Result<NtStatus, NtStatus> {
    if data.len() > output_length as usize {
        irp.set_information(data.len());
        return Err(STATUS_BUFFER_TOO_SMALL);
    }
    irp.set_output(data);
    Ok(STATUS_SUCCESS)
}

pub fn dispatch_device_control(ctx: IrpContext<'_>) -> Result<NtStatus, NtStatus> {
    let IrpParameters::DeviceControl {
        io_control_code,
        input,
        output_length,
    } = ctx.irp.parameters()
    else {
        return Err(STATUS_INVALID_PARAMETER);
    };
    let output_length = *output_length;

    match *io_control_code {
        IOCTL_EVENT_WAIT => event_wait(ctx, input, output_length),
        IOCTL_EVENT_INFO => {
            answer(ctx, input)?;
            Ok(STATUS_SUCCESS)
        }
        IOCTL_EVENT_WRITE => {
            let serial = WireReader::new(input).u64()?;
            let message = ctx.dcb.registry().fetch_write(serial)?;
            write_output(ctx.irp, output_length, message)
        }
        IOCTL_EVENT_RELEASE => {
            ctx.dcb.release();
            Ok(STATUS_SUCCESS)
        }
        IOCTL_RESET_TIMEOUT => {
            let mut r = WireReader::new(input);
            let serial = r.u64()?;
            let timeout_ms = r.u32()?;
            ctx.dcb
                .registry()
                .reset_timeout(serial, u64::from(timeout_ms))?;
            Ok(STATUS_SUCCESS)
        }
        IOCTL_ACTIVATE_KEEPALIVE => activate_keepalive(ctx),
        IOCTL_NOTIFY_PATH => notify_path(ctx, input),
        IOCTL_GET_VOLUME_METRICS => {
            let snapshot = ctx.vcb().metrics().snapshot();
            write_output(ctx.irp, output_length, snapshot.encode())
        }
        IOCTL_GET_VERSION => {
            write_output(ctx.irp, output_length, DRIVER_VERSION.to_le_bytes().to_vec())
        }
        code => {
            log::warn!(
                "[RELAY] unknown device control {:#x} on {}",
                code,
                ctx.dcb.mount_point()
            );
            Err(STATUS_INVALID_DEVICE_REQUEST)
        }
    }
}

/// Apply one response message from a worker
fn answer(ctx: IrpContext<'_>, buffer: &[u8]) -> Result<(), NtStatus> {
    let response = EventResponse::decode(buffer)?;
    if !ctx.dcb.complete_response(&response) {
        // Late answers to canceled or expired requests are normal
        relay_debug!(
            EVENT,
            "[RELAY] response {} ({}) matched nothing",
            response.serial,
            status_name(response.status)
        );
    }
    Ok(())
}

fn event_wait(ctx: IrpContext<'_>, input: &[u8], output_length: u32) -> Result<NtStatus, NtStatus> {
    let mut r = WireReader::new(input);
    let timeout_ms = r.u32()?;
    let _reserved = r.u32()?;
    if r.remaining() > 0 {
        answer(ctx, &input[EVENT_WAIT_HEADER_SIZE..])?;
    }

    let wait = match timeout_ms {
        WAIT_INFINITE => None,
        ms => Some(Duration::from_millis(u64::from(ms))),
    };
    match ctx.dcb.pull(output_length as usize, wait) {
        Ok(batch) if batch.is_empty() => Ok(STATUS_TIMEOUT),
        Ok(batch) => {
            ctx.irp.set_output(batch);
            Ok(STATUS_SUCCESS)
        }
        Err(PullError::Released) => Err(STATUS_NO_SUCH_DEVICE),
        Err(PullError::TooSmall(needed)) => {
            ctx.irp.set_information(needed);
            Err(STATUS_BUFFER_TOO_SMALL)
        }
    }
}

fn activate_keepalive(ctx: IrpContext<'_>) -> Result<NtStatus, NtStatus> {
    let ccb = ctx.ccb()?;
    if !ccb.flags().contains(CcbFlags::KEEPALIVE) {
        return Err(STATUS_INVALID_PARAMETER);
    }
    let vcb = ctx.vcb();
    if !vcb.is_mounted() {
        return Err(STATUS_NO_SUCH_DEVICE);
    }
    let previous = vcb.set_flags(VcbFlags::KEEPALIVE_ACTIVE);
    if previous.contains(VcbFlags::KEEPALIVE_ACTIVE) {
        log::warn!("[RELAY] keepalive already active on {}", ctx.dcb.mount_point());
    } else {
        log::info!("[RELAY] keepalive active on {}", ctx.dcb.mount_point());
    }
    Ok(STATUS_SUCCESS)
}

fn notify_path(ctx: IrpContext<'_>, input: &[u8]) -> Result<NtStatus, NtStatus> {
    let mut r = WireReader::new(input);
    let action = r.u32()?;
    let filter = r.u32()?;
    let path = r.string()?;
    let path = fsrtl_normalize_path(&path, ctx.dcb.options().allows_streams())?;
    let completed = ctx.vcb().notify().report_change(&path, filter, action);
    relay_debug!(
        FSRTL,
        "[FSRTL] user-mode change {} on {} woke {} watches",
        action,
        path,
        completed
    );
    Ok(STATUS_SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ioctl_codes() {
        assert_eq!(IOCTL_EVENT_WAIT, 0x0022_2000);
        assert_eq!(IOCTL_EVENT_INFO, 0x0022_2004);
        assert_eq!(IOCTL_UNMOUNT, 0x0022_202C);
    }

    #[test]
    fn test_event_wait_input() {
        let response = EventResponse::new(9, STATUS_SUCCESS);
        let input = encode_event_wait(250, Some(&response));
        let mut r = WireReader::new(&input);
        assert_eq!(r.u32(), Ok(250));
        assert_eq!(r.u32(), Ok(0));
        assert_eq!(
            EventResponse::decode(&input[EVENT_WAIT_HEADER_SIZE..]),
            Ok(response)
        );
        assert_eq!(encode_event_wait(WAIT_INFINITE, None).len(), EVENT_WAIT_HEADER_SIZE);
    }
}
