//! Relay Pipeline
//!
//! Turns the IRP stream of a mounted volume into request messages for
//! user-mode workers and their answers back into IRP completions:
//!
//! - **Control blocks**: DCB (device), VCB (volume, FCB table, GC),
//!   FCB (per path), CCB (per handle)
//! - **Event codec**: request and response wire formats
//! - **Pending registry**: in-flight requests by serial, with cancellation
//! - **Notification channel**: queue of messages workers pull from
//! - **Timeout manager**: deadline sweep and retry redispatch
//! - **Router and handlers**: one module per IRP major function
//! - **Driver**: mount table and control calls

pub mod ccb;
pub mod channel;
pub mod context;
pub mod dcb;
pub mod devctrl;
pub mod dispatch;
pub mod driver;
pub mod event;
pub mod fcb;
pub mod metrics;
pub mod options;
pub mod pending;
pub mod timeout;
pub mod vcb;

mod close;
mod create;
mod dirctrl;
mod fileinfo;
mod flush;
mod fsctl;
mod lockctrl;
mod read;
mod security;
mod volume;
mod write;

#[cfg(test)]
mod tests;

pub use ccb::{Ccb, CcbFlags};
pub use channel::{NotificationChannel, PullError};
pub use context::{Completion, IrpContext, RequestContext};
pub use dcb::Dcb;
pub use devctrl::{
    encode_event_wait, encode_notify_path, encode_reset_timeout, DRIVER_VERSION,
    IOCTL_ACTIVATE_KEEPALIVE, IOCTL_EVENT_INFO, IOCTL_EVENT_RELEASE, IOCTL_EVENT_WAIT,
    IOCTL_EVENT_WRITE, IOCTL_GET_MOUNT_LIST, IOCTL_GET_VERSION, IOCTL_GET_VOLUME_METRICS,
    IOCTL_NOTIFY_PATH, IOCTL_RESET_TIMEOUT, IOCTL_SET_DEBUG_FLAGS, IOCTL_UNMOUNT, WAIT_INFINITE,
};
pub use driver::{decode_mounts, Driver, MountEntry};
pub use event::{
    decode_batch, event_flags, response_flags, EventRequest, EventResponse, RequestBody,
};
pub use fcb::{Fcb, FcbFlags, FcbRef};
pub use fileinfo::{
    decode_rename_information, encode_rename_information, FILE_ALLOCATION_INFORMATION,
    FILE_BASIC_INFORMATION, FILE_DISPOSITION_INFORMATION, FILE_END_OF_FILE_INFORMATION,
    FILE_POSITION_INFORMATION, FILE_RENAME_INFORMATION, FILE_STANDARD_INFORMATION,
};
pub use fsctl::FSCTL_IS_VOLUME_MOUNTED;
pub use metrics::{MetricsSnapshot, VolumeMetrics};
pub use options::{MountFlags, MountOptions, KEEPALIVE_FILE_NAME};
pub use pending::{PendingEntry, PendingFlags, PendingRegistry};
pub use vcb::{Vcb, VcbFlags};
pub use volume::{device_information, FILE_FS_DEVICE_INFORMATION};
