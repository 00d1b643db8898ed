//! IRP Completion Implementation
//!
//! When a handler finishes an IRP it calls [`io_complete_request`]. This
//! routine:
//! 1. Refuses a second completion of the same IRP
//! 2. Records the final status block
//! 3. Advances the file position after a successful synchronous transfer
//! 4. Signals the IRP's completion event
//!
//! Cancellation goes through [`io_cancel_irp`], which only runs a cancel
//! routine when it wins the hook from the registry (see `irp.rs`).

use core::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::irp::{Irp, IrpMajorFunction};
use crate::status::{nt_success, NtStatus, STATUS_CANCELLED};

/// Completion statistics
pub struct CompletionStats {
    pub completed: AtomicU64,
    pub double_completions: AtomicU64,
    pub cancel_requests: AtomicU64,
    pub cancel_routines_run: AtomicU64,
}

static COMPLETION_STATS: CompletionStats = CompletionStats {
    completed: AtomicU64::new(0),
    double_completions: AtomicU64::new(0),
    cancel_requests: AtomicU64::new(0),
    cancel_routines_run: AtomicU64::new(0),
};

/// Get completion statistics
pub fn io_get_completion_stats() -> (u64, u64, u64, u64) {
    (
        COMPLETION_STATS.completed.load(Ordering::Relaxed),
        COMPLETION_STATS.double_completions.load(Ordering::Relaxed),
        COMPLETION_STATS.cancel_requests.load(Ordering::Relaxed),
        COMPLETION_STATS.cancel_routines_run.load(Ordering::Relaxed),
    )
}

/// Complete an I/O request
///
/// Information and output bytes must already be attached with
/// `Irp::set_information` / `Irp::set_output`. Returns false (and logs a
/// warning) if the IRP was already completed.
pub fn io_complete_request(irp: &Irp, status: NtStatus) -> bool {
    if !irp.begin_completion() {
        COMPLETION_STATS
            .double_completions
            .fetch_add(1, Ordering::Relaxed);
        log::warn!(
            "[IO] WARNING: IRP {} already completed! (status {:#010x})",
            irp.id(),
            status as u32
        );
        return false;
    }

    let information = {
        let mut io_status = irp.io_status.lock();
        io_status.status = status;
        io_status.information
    };

    // Synchronous reads / writes move the file pointer
    if nt_success(status) && information > 0 && !irp.is_paging_io() {
        if let Some(file) = irp.file_object() {
            if matches!(
                irp.major_function(),
                IrpMajorFunction::Read | IrpMajorFunction::Write
            ) && file.is_synchronous()
            {
                file.advance_position(information as u64);
            }
        }
    }

    COMPLETION_STATS.completed.fetch_add(1, Ordering::Relaxed);
    irp.completion_event.set();
    true
}

/// Complete with a status and no output
pub fn io_complete_with_status(irp: &Irp, status: NtStatus) -> bool {
    irp.set_information(0);
    io_complete_request(irp, status)
}

/// Cancel an IRP
///
/// Sets the cancel flag and, if the cancel hook was armed, takes it over and
/// runs the cancel routine. Returns true if a routine ran. An IRP with no
/// armed hook stays pending; whoever owns it observes the flag later.
pub fn io_cancel_irp(irp: &Arc<Irp>) -> bool {
    COMPLETION_STATS
        .cancel_requests
        .fetch_add(1, Ordering::Relaxed);

    match irp.fire_cancel_hook() {
        Some(routine) => {
            COMPLETION_STATS
                .cancel_routines_run
                .fetch_add(1, Ordering::Relaxed);
            routine(irp);
            true
        }
        None => false,
    }
}

/// Default cancel routine body: complete with STATUS_CANCELLED
pub fn io_complete_cancelled(irp: &Irp) -> bool {
    io_complete_with_status(irp, STATUS_CANCELLED)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::file::FileObject;
    use crate::io::irp::IrpParameters;
    use crate::status::STATUS_SUCCESS;
    use std::time::Duration;

    #[test]
    fn test_double_completion_refused() {
        let irp = Irp::new(IrpParameters::FlushBuffers);
        assert!(io_complete_request(&irp, STATUS_SUCCESS));
        assert!(!io_complete_request(&irp, STATUS_CANCELLED));
        assert_eq!(irp.io_status().map(|s| s.status), Some(STATUS_SUCCESS));
        assert_eq!(irp.completion_attempts(), 2);
        let (_, double_completions, _, _) = io_get_completion_stats();
        assert!(double_completions >= 1);
    }

    #[test]
    fn test_completion_signals_waiter() {
        let irp = Irp::new(IrpParameters::FlushBuffers).into_shared();
        let waiter = {
            let irp = Arc::clone(&irp);
            std::thread::spawn(move || irp.wait(Some(Duration::from_secs(5))))
        };
        irp.set_output(vec![1, 2, 3]);
        io_complete_request(&irp, STATUS_SUCCESS);
        let block = waiter.join().unwrap().unwrap();
        assert_eq!(block.information, 3);
    }

    #[test]
    fn test_cancel_runs_routine_once() {
        let irp = Irp::new(IrpParameters::FlushBuffers).into_shared();
        irp.set_cancel_routine(Box::new(|irp| {
            io_complete_cancelled(irp);
        }));
        assert!(io_cancel_irp(&irp));
        assert!(!io_cancel_irp(&irp));
        assert_eq!(irp.io_status().map(|s| s.status), Some(STATUS_CANCELLED));
    }

    #[test]
    fn test_synchronous_read_advances_position() {
        let file = Arc::new(FileObject::new("\\a.txt").synchronous());
        let irp = Irp::new(IrpParameters::Read {
            byte_offset: 0,
            length: 4,
            key: 0,
        })
        .with_file_object(Arc::clone(&file));
        irp.set_output(vec![0; 4]);
        io_complete_request(&irp, STATUS_SUCCESS);
        assert_eq!(file.position(), 4);
    }
}
