//! IRP_MJ_QUERY_VOLUME_INFORMATION / IRP_MJ_SET_VOLUME_INFORMATION

use super::context::{Completion, IrpContext};
use super::event::{RequestBody, WireWriter};
use super::options::{MountFlags, MountOptions};
use crate::io::IrpParameters;
use crate::status::{NtStatus, STATUS_BUFFER_TOO_SMALL, STATUS_INVALID_PARAMETER, STATUS_SUCCESS};

/// FS_INFORMATION_CLASS answered in-kernel
pub const FILE_FS_DEVICE_INFORMATION: u32 = 4;

pub const FILE_DEVICE_DISK: u32 = 0x0000_0007;
pub const FILE_DEVICE_NETWORK_FILE_SYSTEM: u32 = 0x0000_0014;

pub const FILE_REMOVABLE_MEDIA: u32 = 0x0000_0001;
pub const FILE_READ_ONLY_DEVICE: u32 = 0x0000_0002;
pub const FILE_REMOTE_DEVICE: u32 = 0x0000_0010;

/// FILE_FS_DEVICE_INFORMATION for a mount
pub fn device_information(options: &MountOptions) -> Vec<u8> {
    let network = options.flags.contains(MountFlags::NETWORK);
    let device_type = if network {
        FILE_DEVICE_NETWORK_FILE_SYSTEM
    } else {
        FILE_DEVICE_DISK
    };
    let mut characteristics = 0;
    if options.flags.contains(MountFlags::REMOVABLE) {
        characteristics |= FILE_REMOVABLE_MEDIA;
    }
    if options.is_read_only() {
        characteristics |= FILE_READ_ONLY_DEVICE;
    }
    if network {
        characteristics |= FILE_REMOTE_DEVICE;
    }
    let mut w = WireWriter::default();
    w.u32(device_type).u32(characteristics);
    w.into_inner()
}

pub fn dispatch_query_volume(ctx: IrpContext<'_>) -> Result<NtStatus, NtStatus> {
    let IrpParameters::QueryVolumeInformation { class, length } = *ctx.irp.parameters() else {
        return Err(STATUS_INVALID_PARAMETER);
    };

    if class == FILE_FS_DEVICE_INFORMATION {
        let info = device_information(ctx.dcb.options());
        if (length as usize) < info.len() {
            return Err(STATUS_BUFFER_TOO_SMALL);
        }
        ctx.irp.set_output(info);
        return Ok(STATUS_SUCCESS);
    }

    let ccb = ctx.ccb().ok();
    let request = ctx.request(ccb.as_deref(), RequestBody::QueryVolume { class, length });
    ctx.relay(ccb, Completion::Data, request)
}

pub fn dispatch_set_volume(ctx: IrpContext<'_>) -> Result<NtStatus, NtStatus> {
    let IrpParameters::SetVolumeInformation { class, buffer } = ctx.irp.parameters() else {
        return Err(STATUS_INVALID_PARAMETER);
    };
    let ccb = ctx.ccb().ok();
    let request = ctx.request(
        ccb.as_deref(),
        RequestBody::SetVolume {
            class: *class,
            buffer: buffer.clone(),
        },
    );
    ctx.relay(ccb, Completion::Status, request)
}
