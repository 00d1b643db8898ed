//! Directory Change Notification Support
//!
//! Applications watch directories with IRP_MN_NOTIFY_CHANGE_DIRECTORY and
//! receive notifications when files are created, modified, renamed or
//! deleted underneath them.
//!
//! A watch belongs to one open handle and lives until that handle is
//! cleaned up. Each notify IRP either drains changes buffered since the
//! previous one or waits for the next matching report. Waiting IRPs are
//! cancelable. Reports come from in-kernel events and from user mode.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use super::name::fsrtl_relative_name;
use crate::io::{io_complete_request, Irp};
use crate::status::{
    NtStatus, STATUS_CANCELLED, STATUS_NOTIFY_CLEANUP, STATUS_NOTIFY_ENUM_DIR, STATUS_SUCCESS,
};

/// Maximum notifications to buffer per watch
const MAX_BUFFERED_NOTIFICATIONS: usize = 64;

/// File action codes for notifications
pub mod file_action {
    pub const FILE_ACTION_ADDED: u32 = 0x00000001;
    pub const FILE_ACTION_REMOVED: u32 = 0x00000002;
    pub const FILE_ACTION_MODIFIED: u32 = 0x00000003;
    pub const FILE_ACTION_RENAMED_OLD_NAME: u32 = 0x00000004;
    pub const FILE_ACTION_RENAMED_NEW_NAME: u32 = 0x00000005;
}

/// Notification filter flags
pub mod notify_filter {
    pub const FILE_NOTIFY_CHANGE_FILE_NAME: u32 = 0x00000001;
    pub const FILE_NOTIFY_CHANGE_DIR_NAME: u32 = 0x00000002;
    pub const FILE_NOTIFY_CHANGE_ATTRIBUTES: u32 = 0x00000004;
    pub const FILE_NOTIFY_CHANGE_SIZE: u32 = 0x00000008;
    pub const FILE_NOTIFY_CHANGE_LAST_WRITE: u32 = 0x00000010;
    pub const FILE_NOTIFY_CHANGE_LAST_ACCESS: u32 = 0x00000020;
    pub const FILE_NOTIFY_CHANGE_CREATION: u32 = 0x00000040;
    pub const FILE_NOTIFY_CHANGE_EA: u32 = 0x00000080;
    pub const FILE_NOTIFY_CHANGE_SECURITY: u32 = 0x00000100;
    pub const FILE_NOTIFY_VALID_MASK: u32 = 0x00000FFF;
}

/// A single notification entry
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NotifyEntry {
    /// File action (added, removed, modified, etc.)
    pub action: u32,
    /// Name relative to the watched directory
    pub name: String,
}

/// Encode entries as a chain of FILE_NOTIFY_INFORMATION records
///
/// Layout per record: NextEntryOffset u32, Action u32, FileNameLength u32
/// (bytes), FileName UTF-16LE; records are 4-byte aligned and the last one
/// has NextEntryOffset 0.
pub fn encode_notify_information(entries: &[NotifyEntry]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut previous: Option<usize> = None;

    for entry in entries {
        let start = out.len();
        if let Some(prev) = previous {
            let offset = (start - prev) as u32;
            out[prev..prev + 4].copy_from_slice(&offset.to_le_bytes());
        }
        let name: Vec<u16> = entry.name.encode_utf16().collect();
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&entry.action.to_le_bytes());
        out.extend_from_slice(&((name.len() * 2) as u32).to_le_bytes());
        for unit in name {
            out.extend_from_slice(&unit.to_le_bytes());
        }
        while out.len() % 4 != 0 {
            out.push(0);
        }
        previous = Some(start);
    }
    out
}

/// Directory change notification watch
#[derive(Debug)]
struct NotifyChange {
    /// Handle that owns this watch
    owner: u64,
    /// Normalized path of the watched directory
    directory: String,
    /// Filter mask for this watch
    completion_filter: u32,
    /// Watch subtree flag
    watch_subtree: bool,
    /// Output buffer size of the latest notify IRP
    buffer_length: usize,
    /// Buffered notifications
    notifications: VecDeque<NotifyEntry>,
    /// Too many changes were buffered; next IRP gets NOTIFY_ENUM_DIR
    overflowed: bool,
    /// IRP waiting for notification
    pending_irp: Option<Arc<Irp>>,
}

impl NotifyChange {
    /// Build the result for an IRP from buffered changes
    fn drain(&mut self) -> (NtStatus, Vec<u8>) {
        if self.overflowed {
            self.overflowed = false;
            self.notifications.clear();
            return (STATUS_NOTIFY_ENUM_DIR, Vec::new());
        }
        let entries: Vec<NotifyEntry> = self.notifications.drain(..).collect();
        let payload = encode_notify_information(&entries);
        if payload.len() > self.buffer_length {
            (STATUS_NOTIFY_ENUM_DIR, Vec::new())
        } else {
            (STATUS_SUCCESS, payload)
        }
    }
}

/// Result of submitting a notify IRP
#[derive(Debug, PartialEq, Eq)]
pub enum NotifyOutcome {
    /// Buffered changes were already available; complete now
    Complete(NtStatus, Vec<u8>),
    /// The IRP is parked on the watch
    Pending,
}

#[derive(Debug, Default)]
struct NotifyState {
    watches: Vec<NotifyChange>,
}

/// Notification list of one volume
#[derive(Debug)]
pub struct NotifyList {
    state: Arc<spin::Mutex<NotifyState>>,
    ignore_case: bool,
}

/// An IRP taken off the list, to be completed after the lock is dropped
type Completion = (Arc<Irp>, NtStatus, Vec<u8>);

fn complete_all(completions: Vec<Completion>) {
    for (irp, status, payload) in completions {
        // A fired cancel hook owns the IRP now
        if irp.clear_cancel_routine() {
            irp.set_output(payload);
            io_complete_request(&irp, status);
        }
    }
}

impl NotifyList {
    pub fn new(case_sensitive: bool) -> Self {
        Self {
            state: Arc::new(spin::Mutex::new(NotifyState::default())),
            ignore_case: !case_sensitive,
        }
    }

    /// Number of watches
    pub fn watch_count(&self) -> usize {
        self.state.lock().watches.len()
    }

    /// Number of IRPs currently waiting
    pub fn pending_count(&self) -> usize {
        self.state
            .lock()
            .watches
            .iter()
            .filter(|w| w.pending_irp.is_some())
            .count()
    }

    /// FsRtlNotifyFullChangeDirectory
    ///
    /// The first call for a handle creates its watch with `directory`,
    /// `completion_filter` and `watch_subtree`; later calls reuse it.
    pub fn change_directory(
        &self,
        owner: u64,
        directory: &str,
        completion_filter: u32,
        watch_subtree: bool,
        irp: &Arc<Irp>,
        buffer_length: usize,
    ) -> NotifyOutcome {
        let mut state = self.state.lock();

        let index = match state.watches.iter().position(|w| w.owner == owner) {
            Some(index) => index,
            None => {
                state.watches.push(NotifyChange {
                    owner,
                    directory: directory.to_string(),
                    completion_filter,
                    watch_subtree,
                    buffer_length,
                    notifications: VecDeque::new(),
                    overflowed: false,
                    pending_irp: None,
                });
                state.watches.len() - 1
            }
        };

        let watch = &mut state.watches[index];
        watch.buffer_length = buffer_length;

        if watch.overflowed || !watch.notifications.is_empty() {
            let (status, payload) = watch.drain();
            return NotifyOutcome::Complete(status, payload);
        }

        if watch.pending_irp.is_some() {
            // One outstanding notify IRP per handle
            return NotifyOutcome::Complete(STATUS_NOTIFY_ENUM_DIR, Vec::new());
        }

        watch.pending_irp = Some(Arc::clone(irp));

        // Arm under the list lock; a concurrent canceller spins on it
        let weak: Weak<spin::Mutex<NotifyState>> = Arc::downgrade(&self.state);
        let irp_id = irp.id();
        irp.set_cancel_routine(Box::new(move |irp| {
            if let Some(state) = weak.upgrade() {
                let mut state = state.lock();
                for watch in state.watches.iter_mut() {
                    if watch.pending_irp.as_ref().map(|p| p.id()) == Some(irp_id) {
                        watch.pending_irp = None;
                    }
                }
            }
            irp.set_output(Vec::new());
            io_complete_request(irp, STATUS_CANCELLED);
        }));

        // Canceled before the hook was armed
        if irp.is_cancel_requested() && irp.clear_cancel_routine() {
            state.watches[index].pending_irp = None;
            return NotifyOutcome::Complete(STATUS_CANCELLED, Vec::new());
        }

        NotifyOutcome::Pending
    }

    /// FsRtlNotifyFullReportChange
    ///
    /// `target` is the normalized full path of the changed item.
    /// Returns how many watches matched.
    pub fn report_change(&self, target: &str, filter_match: u32, action: u32) -> usize {
        let mut completions = Vec::new();
        let mut matched = 0;

        {
            let mut state = self.state.lock();
            for watch in state.watches.iter_mut() {
                // Check if this notification matches the watch filter
                if watch.completion_filter & filter_match == 0 {
                    continue;
                }
                let Some(relative) = fsrtl_relative_name(
                    &watch.directory,
                    target,
                    watch.watch_subtree,
                    self.ignore_case,
                ) else {
                    continue;
                };

                matched += 1;
                if watch.notifications.len() >= MAX_BUFFERED_NOTIFICATIONS {
                    watch.overflowed = true;
                } else {
                    watch.notifications.push_back(NotifyEntry {
                        action,
                        name: relative.to_string(),
                    });
                }

                if let Some(irp) = watch.pending_irp.take() {
                    let (status, payload) = watch.drain();
                    completions.push((irp, status, payload));
                }
            }
        }

        complete_all(completions);
        matched
    }

    /// FsRtlNotifyCleanup: drop the handle's watch
    pub fn cleanup(&self, owner: u64) {
        let completions: Vec<Completion> = {
            let mut state = self.state.lock();
            let (gone, kept): (Vec<_>, Vec<_>) =
                state.watches.drain(..).partition(|w| w.owner == owner);
            state.watches = kept;
            gone.into_iter()
                .filter_map(|w| w.pending_irp)
                .map(|irp| (irp, STATUS_NOTIFY_CLEANUP, Vec::new()))
                .collect()
        };
        complete_all(completions);
    }

    /// Drop every watch (volume teardown)
    pub fn cleanup_all(&self) -> usize {
        let completions: Vec<Completion> = {
            let mut state = self.state.lock();
            state
                .watches
                .drain(..)
                .filter_map(|w| w.pending_irp)
                .map(|irp| (irp, STATUS_NOTIFY_CLEANUP, Vec::new()))
                .collect()
        };
        let count = completions.len();
        complete_all(completions);
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{io_cancel_irp, IrpParameters};
    use file_action::*;
    use notify_filter::*;

    fn notify_irp() -> Arc<Irp> {
        Irp::new(IrpParameters::NotifyChangeDirectory {
            completion_filter: FILE_NOTIFY_CHANGE_FILE_NAME,
            watch_tree: false,
            length: 1024,
        })
        .into_shared()
    }

    #[test]
    fn test_report_completes_waiter() {
        let list = NotifyList::new(false);
        let irp = notify_irp();
        let outcome =
            list.change_directory(1, "\\dir", FILE_NOTIFY_CHANGE_FILE_NAME, false, &irp, 1024);
        assert_eq!(outcome, NotifyOutcome::Pending);

        // Filter and location must both match
        let name = FILE_NOTIFY_CHANGE_FILE_NAME;
        let size = FILE_NOTIFY_CHANGE_SIZE;
        assert_eq!(list.report_change("\\dir\\a", size, FILE_ACTION_MODIFIED), 0);
        assert_eq!(list.report_change("\\other\\a", name, FILE_ACTION_ADDED), 0);
        assert_eq!(list.report_change("\\DIR\\a.txt", name, FILE_ACTION_ADDED), 1);

        assert_eq!(irp.io_status().map(|s| s.status), Some(STATUS_SUCCESS));
        let expected = encode_notify_information(&[NotifyEntry {
            action: FILE_ACTION_ADDED,
            name: "a.txt".to_string(),
        }]);
        assert_eq!(irp.output(), expected);
        assert_eq!(list.pending_count(), 0);
    }

    #[test]
    fn test_buffered_changes_complete_next_irp_inline() {
        let list = NotifyList::new(false);
        let first = notify_irp();
        list.change_directory(1, "\\", FILE_NOTIFY_CHANGE_FILE_NAME, true, &first, 1024);
        list.report_change("\\x", FILE_NOTIFY_CHANGE_FILE_NAME, FILE_ACTION_ADDED);
        list.report_change("\\y", FILE_NOTIFY_CHANGE_FILE_NAME, FILE_ACTION_REMOVED);

        let second = notify_irp();
        match list.change_directory(1, "\\", FILE_NOTIFY_CHANGE_FILE_NAME, true, &second, 1024) {
            NotifyOutcome::Complete(status, payload) => {
                assert_eq!(status, STATUS_SUCCESS);
                assert!(!payload.is_empty());
            }
            NotifyOutcome::Pending => panic!("expected inline completion"),
        }
    }

    #[test]
    fn test_small_buffer_reports_enum_dir() {
        let list = NotifyList::new(false);
        let irp = notify_irp();
        list.change_directory(1, "\\", FILE_NOTIFY_CHANGE_FILE_NAME, false, &irp, 4);
        list.report_change("\\long-name", FILE_NOTIFY_CHANGE_FILE_NAME, FILE_ACTION_ADDED);
        assert_eq!(irp.io_status().map(|s| s.status), Some(STATUS_NOTIFY_ENUM_DIR));
    }

    #[test]
    fn test_cleanup_and_cancel() {
        let list = NotifyList::new(false);
        let a = notify_irp();
        let b = notify_irp();
        list.change_directory(1, "\\", FILE_NOTIFY_CHANGE_FILE_NAME, false, &a, 64);
        list.change_directory(2, "\\", FILE_NOTIFY_CHANGE_FILE_NAME, false, &b, 64);

        assert!(io_cancel_irp(&b));
        assert_eq!(b.io_status().map(|s| s.status), Some(STATUS_CANCELLED));
        assert_eq!(list.pending_count(), 1);

        list.cleanup(1);
        assert_eq!(a.io_status().map(|s| s.status), Some(STATUS_NOTIFY_CLEANUP));
        assert_eq!(list.watch_count(), 1);
        list.cleanup_all();
        assert_eq!(list.watch_count(), 0);
    }
}
