//! Notification Channel
//!
//! FIFO of encoded request messages waiting for a user-mode worker. The
//! ready event is kept signaled exactly while the queue is non-empty (or
//! the channel is released), so any number of pullers can wait on it.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::metrics::VolumeMetrics;
use crate::ke::{EventType, KEvent};
use crate::status::{NtStatus, STATUS_INSUFFICIENT_RESOURCES, STATUS_NO_SUCH_DEVICE};

/// Why a pull returned nothing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullError {
    /// The channel was released; the device is going away
    Released,
    /// The first queued message needs this many bytes
    TooSmall(usize),
}

#[derive(Debug, Default)]
struct ChannelState {
    messages: VecDeque<Vec<u8>>,
    released: bool,
}

/// Kernel to user message queue
#[derive(Debug)]
pub struct NotificationChannel {
    state: spin::Mutex<ChannelState>,
    ready: KEvent,
    metrics: Arc<VolumeMetrics>,
}

impl NotificationChannel {
    pub fn new(metrics: Arc<VolumeMetrics>) -> Self {
        Self {
            state: spin::Mutex::new(ChannelState::default()),
            ready: KEvent::new(EventType::Notification, false),
            metrics,
        }
    }

    /// Queue one message, waking pullers on the empty to non-empty edge
    pub fn publish(&self, message: Vec<u8>) -> Result<(), NtStatus> {
        let mut state = self.state.lock();
        if state.released {
            return Err(STATUS_NO_SUCH_DEVICE);
        }
        state
            .messages
            .try_reserve(1)
            .map_err(|_| STATUS_INSUFFICIENT_RESOURCES)?;
        let was_empty = state.messages.is_empty();
        state.messages.push_back(message);
        VolumeMetrics::bump(&self.metrics.events_published);
        if was_empty {
            self.ready.set();
        }
        Ok(())
    }

    /// Take whole messages that fit in `capacity`
    ///
    /// Waits up to `timeout` (forever with `None`) for the queue to become
    /// non-empty and returns an empty buffer if it stays empty. Without
    /// `batch` at most one message is returned. Messages that do not fit
    /// stay queued and the ready event stays signaled for them.
    pub fn pull(
        &self,
        capacity: usize,
        timeout: Option<Duration>,
        batch: bool,
    ) -> Result<Vec<u8>, PullError> {
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            {
                let mut state = self.state.lock();
                if state.released {
                    return Err(PullError::Released);
                }
                if let Some(front) = state.messages.front() {
                    if front.len() > capacity {
                        return Err(PullError::TooSmall(front.len()));
                    }
                    let mut out = Vec::new();
                    let mut taken = 0u64;
                    while let Some(next) = state.messages.front() {
                        if out.len() + next.len() > capacity || (taken > 0 && !batch) {
                            break;
                        }
                        if let Some(message) = state.messages.pop_front() {
                            out.extend_from_slice(&message);
                            taken += 1;
                        }
                    }
                    if state.messages.is_empty() {
                        self.ready.clear();
                    } else {
                        self.ready.set();
                    }
                    VolumeMetrics::add(&self.metrics.events_pulled, taken);
                    return Ok(out);
                }
                self.ready.clear();
            }

            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(Vec::new());
                    }
                    Some(deadline - now)
                }
                None => None,
            };
            self.ready.wait(wait);
        }
    }

    /// Fail every later pull and wake all waiters
    pub fn release(&self) {
        let dropped = {
            let mut state = self.state.lock();
            state.released = true;
            core::mem::take(&mut state.messages)
        };
        self.ready.set();
        if !dropped.is_empty() {
            log::warn!("[RELAY] channel released with {} unpulled messages", dropped.len());
        }
    }

    pub fn is_released(&self) -> bool {
        self.state.lock().released
    }

    pub fn len(&self) -> usize {
        self.state.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
