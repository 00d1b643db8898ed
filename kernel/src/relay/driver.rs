//! Relay Driver
//!
//! The driver object: a table of mounted devices and the driver-wide
//! control calls. A mount registers a [`Dcb`] under a unique mount point
//! and starts its background threads; unmount tears it down and drops it
//! from the table, though the DCB itself lives on while file objects or
//! pending entries still reference it.

use core::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use super::dcb::Dcb;
use super::devctrl::{
    write_output, DRIVER_VERSION, IOCTL_GET_MOUNT_LIST, IOCTL_GET_VERSION, IOCTL_SET_DEBUG_FLAGS,
    IOCTL_UNMOUNT,
};
use super::event::{WireReader, WireWriter};
use super::options::MountOptions;
use crate::debug::{set_debug_flags, DebugFlags};
use crate::fsrtl::fsrtl_are_names_equal;
use crate::io::{io_complete_request, Irp, IrpMajorFunction, IrpParameters};
use crate::status::{
    NtStatus, STATUS_INVALID_DEVICE_REQUEST, STATUS_INVALID_PARAMETER,
    STATUS_OBJECT_NAME_COLLISION, STATUS_OBJECT_NAME_NOT_FOUND, STATUS_PENDING, STATUS_SUCCESS,
};

/// One row of the mount list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub mount_id: u32,
    pub mount_point: String,
    pub unc_name: Option<String>,
    pub flags: u32,
}

/// Relay driver object
pub struct Driver {
    this: Weak<Driver>,
    mounts: spin::RwLock<Vec<Arc<Dcb>>>,
    next_mount_id: AtomicU32,
}

impl Driver {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            mounts: spin::RwLock::new(Vec::new()),
            next_mount_id: AtomicU32::new(1),
        })
    }

    pub fn version(&self) -> u32 {
        DRIVER_VERSION
    }

    /// Register a device for `options` and mount it
    pub fn start_filesystem(&self, options: MountOptions) -> Result<Arc<Dcb>, NtStatus> {
        if options.mount_point.is_empty() {
            return Err(STATUS_INVALID_PARAMETER);
        }

        let dcb = {
            let mut mounts = self.mounts.write();
            if mounts
                .iter()
                .any(|dcb| fsrtl_are_names_equal(dcb.mount_point(), &options.mount_point, true))
            {
                log::warn!("[RELAY] mount point {} already in use", options.mount_point);
                return Err(STATUS_OBJECT_NAME_COLLISION);
            }
            let mount_id = self.next_mount_id.fetch_add(1, Ordering::Relaxed);
            let dcb = Dcb::new(mount_id, options, self.this.clone());
            mounts.push(Arc::clone(&dcb));
            dcb
        };

        dcb.start_threads();
        log::info!(
            "[RELAY] mounted {} as device {} (timeout {} ms)",
            dcb.mount_point(),
            dcb.mount_id(),
            dcb.options().irp_timeout_ms
        );
        Ok(dcb)
    }

    /// Unmount by mount point; false when nothing is mounted there
    pub fn unmount(&self, mount_point: &str) -> bool {
        let Some(dcb) = self.find(mount_point) else {
            return false;
        };
        // Release takes the table lock itself to remove the entry
        dcb.release()
    }

    pub fn find(&self, mount_point: &str) -> Option<Arc<Dcb>> {
        self.mounts
            .read()
            .iter()
            .find(|dcb| fsrtl_are_names_equal(dcb.mount_point(), mount_point, true))
            .cloned()
    }

    pub fn mounts(&self) -> Vec<MountEntry> {
        self.mounts
            .read()
            .iter()
            .map(|dcb| MountEntry {
                mount_id: dcb.mount_id(),
                mount_point: dcb.mount_point().to_string(),
                unc_name: dcb.options().unc_name.clone(),
                flags: dcb.options().flags.bits(),
            })
            .collect()
    }

    pub fn mount_count(&self) -> usize {
        self.mounts.read().len()
    }

    pub(super) fn remove_mount(&self, mount_id: u32) {
        self.mounts.write().retain(|dcb| dcb.mount_id() != mount_id);
    }

    /// Unmount everything
    pub fn shutdown(&self) -> usize {
        let mounts: Vec<Arc<Dcb>> = self.mounts.read().clone();
        mounts.iter().filter(|dcb| dcb.release()).count()
    }

    // ------------------------------------------------------------------
    // Driver-wide control calls
    // ------------------------------------------------------------------

    /// Handle an IRP sent to the driver's own control device
    pub fn device_control(&self, irp: &Arc<Irp>) -> NtStatus {
        let status = match self.route_control(irp) {
            Ok(status) | Err(status) => status,
        };
        if status != STATUS_PENDING {
            io_complete_request(irp, status);
        }
        status
    }

    fn route_control(&self, irp: &Irp) -> Result<NtStatus, NtStatus> {
        if irp.major_function() != IrpMajorFunction::DeviceControl {
            return Err(STATUS_INVALID_DEVICE_REQUEST);
        }
        let IrpParameters::DeviceControl {
            io_control_code,
            input,
            output_length,
        } = irp.parameters()
        else {
            return Err(STATUS_INVALID_PARAMETER);
        };

        match *io_control_code {
            IOCTL_GET_VERSION => {
                write_output(irp, *output_length, self.version().to_le_bytes().to_vec())
            }
            IOCTL_SET_DEBUG_FLAGS => {
                let bits = WireReader::new(input).u32()?;
                let previous = set_debug_flags(DebugFlags::from_bits_truncate(bits));
                log::info!("[RELAY] debug flags {:#x} -> {:#x}", previous.bits(), bits);
                write_output(irp, *output_length, previous.bits().to_le_bytes().to_vec())
            }
            IOCTL_GET_MOUNT_LIST => write_output(irp, *output_length, self.encode_mounts()),
            IOCTL_UNMOUNT => {
                let mount_point = WireReader::new(input).string()?;
                if self.unmount(&mount_point) {
                    Ok(STATUS_SUCCESS)
                } else {
                    Err(STATUS_OBJECT_NAME_NOT_FOUND)
                }
            }
            _ => Err(STATUS_INVALID_DEVICE_REQUEST),
        }
    }

    /// Mount list wire form: count, then id, flags, mount point, UNC name
    pub fn encode_mounts(&self) -> Vec<u8> {
        let mounts = self.mounts();
        let mut w = WireWriter::default();
        w.u32(mounts.len() as u32);
        for entry in &mounts {
            w.u32(entry.mount_id)
                .u32(entry.flags)
                .string(&entry.mount_point)
                .string(entry.unc_name.as_deref().unwrap_or(""));
        }
        w.into_inner()
    }
}

/// Parse [`Driver::encode_mounts`] output
pub fn decode_mounts(buffer: &[u8]) -> Result<Vec<MountEntry>, NtStatus> {
    let mut r = WireReader::new(buffer);
    let count = r.u32()? as usize;
    let mut mounts = Vec::new();
    for _ in 0..count {
        let mount_id = r.u32()?;
        let flags = r.u32()?;
        let mount_point = r.string()?;
        let unc_name = r.string()?;
        mounts.push(MountEntry {
            mount_id,
            mount_point,
            unc_name: (!unc_name.is_empty()).then_some(unc_name),
            flags,
        });
    }
    Ok(mounts)
}

impl core::fmt::Debug for Driver {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Driver")
            .field("mounts", &self.mount_count())
            .finish()
    }
}
