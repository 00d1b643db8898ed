//! Device Control Block
//!
//! One DCB per mounted filesystem. It ties the volume to its pending
//! registry, its notification channel, its retry list and the timeout
//! thread, and owns the unmount sequence.
//!
//! The DCB is shared: file objects and pending entries keep it alive after
//! it leaves the driver's mount table, and every IRP that reaches it after
//! unmount fails at the router's unmount gate.

use core::sync::atomic::{AtomicBool, Ordering};
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use super::channel::{NotificationChannel, PullError};
use super::context::RequestContext;
use super::dispatch;
use super::driver::Driver;
use super::event::{EventRequest, EventResponse};
use super::options::{MountFlags, MountOptions};
use super::pending::PendingRegistry;
use super::timeout;
use super::vcb::Vcb;
use crate::io::{io_complete_with_status, Irp};
use crate::ke::{EventType, KEvent, SharedClock};
use crate::status::{NtStatus, STATUS_CANCELLED, STATUS_NO_SUCH_DEVICE, STATUS_PENDING};

/// Device Control Block
pub struct Dcb {
    mount_id: u32,
    options: MountOptions,
    vcb: Arc<Vcb>,
    registry: PendingRegistry,
    channel: NotificationChannel,
    retries: spin::Mutex<VecDeque<Arc<Irp>>>,
    /// Wakes the timeout thread early (retry queued, unmount)
    timeout_wake: KEvent,
    timeout_thread: spin::Mutex<Option<JoinHandle<()>>>,
    released: AtomicBool,
    driver: Weak<Driver>,
}

impl Dcb {
    pub fn new(mount_id: u32, options: MountOptions, driver: Weak<Driver>) -> Arc<Self> {
        let vcb = Vcb::new(
            mount_id,
            options.is_case_sensitive(),
            options.gc_interval_ms,
            options.fcb_soft_limit,
        );
        let metrics = Arc::clone(vcb.metrics());
        Arc::new(Self {
            mount_id,
            registry: PendingRegistry::new(
                options.max_pending_requests,
                options.irp_timeout_ms,
                Arc::clone(&options.clock),
                Arc::clone(&metrics),
            ),
            channel: NotificationChannel::new(metrics),
            options,
            vcb,
            retries: spin::Mutex::new(VecDeque::new()),
            timeout_wake: KEvent::new(EventType::Synchronization, false),
            timeout_thread: spin::Mutex::new(None),
            released: AtomicBool::new(false),
            driver,
        })
    }

    /// Start the timeout and collector threads when configured to
    pub fn start_threads(self: &Arc<Self>) {
        if !self.options.background_threads {
            return;
        }
        self.vcb.start_gc_thread();
        *self.timeout_thread.lock() = timeout::spawn_timeout_thread(self);
    }

    pub fn mount_id(&self) -> u32 {
        self.mount_id
    }

    pub fn options(&self) -> &MountOptions {
        &self.options
    }

    pub fn mount_point(&self) -> &str {
        &self.options.mount_point
    }

    pub fn vcb(&self) -> &Arc<Vcb> {
        &self.vcb
    }

    pub fn clock(&self) -> &SharedClock {
        &self.options.clock
    }

    pub fn registry(&self) -> &PendingRegistry {
        &self.registry
    }

    pub fn channel(&self) -> &NotificationChannel {
        &self.channel
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    pub(super) fn timeout_wake(&self) -> &KEvent {
        &self.timeout_wake
    }

    // ------------------------------------------------------------------
    // Request flow
    // ------------------------------------------------------------------

    /// Route one IRP; returns STATUS_PENDING if it completes later
    pub fn dispatch(self: &Arc<Self>, irp: &Arc<Irp>) -> NtStatus {
        dispatch::dispatch(self, irp)
    }

    /// Register `context` and publish its message
    pub fn submit(
        &self,
        context: RequestContext,
        request: EventRequest,
    ) -> Result<NtStatus, NtStatus> {
        let registered = self.registry.register(context, request)?;
        if let Err(status) = self.channel.publish(registered.message) {
            self.registry.abort(registered.serial, status);
        }
        Ok(STATUS_PENDING)
    }

    /// Publish a message nobody answers (close)
    pub fn publish_only(&self, request: EventRequest) -> Result<(), NtStatus> {
        self.channel.publish(request.encode()?)
    }

    /// Apply a worker's response
    pub fn complete_response(&self, response: &EventResponse) -> bool {
        self.registry.complete(response)
    }

    /// Pull request messages for a worker
    pub fn pull(&self, capacity: usize, wait: Option<Duration>) -> Result<Vec<u8>, PullError> {
        let batch = self.options.flags.contains(MountFlags::EVENT_BATCHING);
        self.channel.pull(capacity, wait, batch)
    }

    /// Park an IRP for redispatch by the timeout thread
    pub fn queue_retry(&self, irp: Arc<Irp>) {
        if self.is_released() {
            io_complete_with_status(&irp, STATUS_NO_SUCH_DEVICE);
            return;
        }
        self.retries.lock().push_back(irp);
        self.timeout_wake.set();
    }

    pub(super) fn take_retries(&self) -> VecDeque<Arc<Irp>> {
        core::mem::take(&mut *self.retries.lock())
    }

    pub fn retry_count(&self) -> usize {
        self.retries.lock().len()
    }

    /// Redispatch every parked IRP from the top of the router
    pub fn process_retries(self: &Arc<Self>) -> usize {
        timeout::process_retries(self)
    }

    /// One timeout sweep
    pub fn check_timeouts(self: &Arc<Self>) -> usize {
        timeout::check_timeouts(self)
    }

    // ------------------------------------------------------------------
    // Unmount
    // ------------------------------------------------------------------

    /// Tear the device down; later calls return false
    ///
    /// Every pending IRP, retry and oplock waiter is completed, change
    /// notification waiters get STATUS_NOTIFY_CLEANUP, the threads are
    /// stopped and the DCB leaves the mount table.
    pub fn release(&self) -> bool {
        if self.released.swap(true, Ordering::SeqCst) {
            return false;
        }
        log::info!("[RELAY] unmounting {} (device {})", self.mount_point(), self.mount_id);

        self.vcb.begin_dismount();
        self.channel.release();

        let pending = self.registry.release_all(STATUS_CANCELLED);

        for irp in self.take_retries() {
            io_complete_with_status(&irp, STATUS_NO_SUCH_DEVICE);
        }
        for waiter in self.vcb.drain_oplock_waiters() {
            waiter.resume(STATUS_CANCELLED);
        }
        let watches = self.vcb.notify().cleanup_all();

        self.stop_timeout_thread();
        let collected = self.vcb.teardown();

        if let Some(driver) = self.driver.upgrade() {
            driver.remove_mount(self.mount_id);
        }

        relay_debug!(
            EVENT,
            "[RELAY] device {} released: {} pending, {} watches, {} FCBs collected",
            self.mount_id,
            pending,
            watches,
            collected
        );
        true
    }

    /// Timeout and collector threads still attached to the device
    pub fn background_thread_count(&self) -> usize {
        usize::from(self.timeout_thread.lock().is_some()) + usize::from(self.vcb.has_gc_thread())
    }

    fn stop_timeout_thread(&self) {
        self.timeout_wake.set();
        let handle = self.timeout_thread.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl core::fmt::Debug for Dcb {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Dcb")
            .field("mount_id", &self.mount_id)
            .field("mount_point", &self.options.mount_point)
            .field("released", &self.is_released())
            .field("pending", &self.registry.len())
            .finish()
    }
}
