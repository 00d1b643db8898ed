//! Timeout and Retry Manager
//!
//! A per-device thread wakes every check interval (or when woken) to
//! 1. redispatch IRPs parked on the retry list, from the top of the router
//! 2. expire pending entries past their deadline
//! 3. force oplock breaks the holder never acknowledged
//!
//! Expired creates complete with STATUS_CANCELLED, anything else with
//! STATUS_INSUFFICIENT_RESOURCES. If anything expired and no keepalive
//! handle is active, user mode is assumed dead and the device is released.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use super::dcb::Dcb;
use super::metrics::VolumeMetrics;
use crate::io::io_complete_request;
use crate::status::STATUS_SUCCESS;

/// Redispatch every IRP on the retry list
pub fn process_retries(dcb: &Arc<Dcb>) -> usize {
    let retries = dcb.take_retries();
    let count = retries.len();
    for irp in retries {
        relay_debug!(TIMEOUT, "[TIMEOUT] retrying irp {}", irp.id());
        VolumeMetrics::bump(&dcb.vcb().metrics().retries);
        dcb.dispatch(&irp);
    }
    count
}

/// One sweep over the pending registry and the volume's oplocks
///
/// Returns the number of entries expired.
pub fn check_timeouts(dcb: &Arc<Dcb>) -> usize {
    let now = dcb.clock().tick_count();

    for waiter in dcb.vcb().expire_oplock_breaks(now) {
        waiter.resume(STATUS_SUCCESS);
    }

    let expired = dcb.registry().take_expired(now);
    let count = expired.len();
    for entry in expired {
        let irp = Arc::clone(entry.irp());
        let status = entry.expiry_status();
        let owned = irp.clear_cancel_routine();
        log::warn!(
            "[TIMEOUT] serial {} ({:?}) expired after deadline {}",
            entry.serial,
            irp.major_function(),
            entry.deadline
        );
        drop(entry);
        if owned {
            VolumeMetrics::bump(&dcb.vcb().metrics().pending_timed_out);
            io_complete_request(&irp, status);
        }
    }

    if count > 0 && !dcb.vcb().is_keepalive_active() {
        log::warn!(
            "[TIMEOUT] {} requests expired without a keepalive handle, releasing {}",
            count,
            dcb.mount_point()
        );
        dcb.release();
    }
    count
}

/// Start the device's timeout thread
pub(super) fn spawn_timeout_thread(dcb: &Arc<Dcb>) -> Option<JoinHandle<()>> {
    let weak = Arc::downgrade(dcb);
    let interval = Duration::from_millis(dcb.options().timeout_check_interval_ms);
    let spawned = std::thread::Builder::new()
        .name(format!("relay-timeout-{}", dcb.mount_id()))
        .spawn(move || loop {
            let Some(dcb) = weak.upgrade() else { break };
            if dcb.is_released() {
                break;
            }
            dcb.timeout_wake().wait(Some(interval));
            if dcb.is_released() {
                break;
            }
            process_retries(&dcb);
            check_timeouts(&dcb);
        });
    match spawned {
        Ok(handle) => Some(handle),
        Err(err) => {
            log::warn!("[TIMEOUT] could not start timeout thread: {}", err);
            None
        }
    }
}
