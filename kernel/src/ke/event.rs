//! Kernel Event Implementation (KEVENT)
//!
//! Events are synchronization objects used for signaling between threads.
//! A thread can wait for an event to be signaled, and another thread
//! can signal the event to wake the waiting thread(s).
//!
//! Two types of events:
//! - **Notification (Manual Reset)**: Stays signaled until explicitly reset.
//!   Wakes ALL waiting threads when signaled.
//! - **Synchronization (Auto Reset)**: Automatically resets after waking
//!   ONE thread. Only one waiter is released per signal.
//!
//! # Usage
//! ```
//! use relayfs::ke::{EventType, KEvent};
//! use std::time::Duration;
//!
//! let event = KEvent::new(EventType::Notification, false);
//! event.set();
//! assert!(event.wait(Some(Duration::from_millis(10))));
//! ```

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Event type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EventType {
    /// Notification event (manual reset)
    /// - Wakes ALL waiters when signaled
    /// - Stays signaled until explicitly reset
    Notification = 0,
    /// Synchronization event (auto reset)
    /// - Wakes ONE waiter when signaled
    /// - Automatically resets after waking a thread
    Synchronization = 1,
}

/// Kernel Event
///
/// Equivalent to NT's KEVENT, built on a mutex-protected signal state and a
/// condition variable.
#[derive(Debug)]
pub struct KEvent {
    event_type: EventType,
    signaled: Mutex<bool>,
    waiters: Condvar,
}

impl KEvent {
    /// Create a new event
    ///
    /// # Arguments
    /// * `event_type` - Notification (manual reset) or Synchronization (auto reset)
    /// * `initial_state` - true = signaled, false = not signaled
    pub const fn new(event_type: EventType, initial_state: bool) -> Self {
        Self {
            event_type,
            signaled: Mutex::new(initial_state),
            waiters: Condvar::new(),
        }
    }

    /// Get the event type
    #[inline]
    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    fn state(&self) -> MutexGuard<'_, bool> {
        self.signaled.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Check if the event is signaled
    pub fn is_signaled(&self) -> bool {
        *self.state()
    }

    /// Set (signal) the event
    ///
    /// For notification events: wakes all waiters, stays signaled
    /// For synchronization events: wakes one waiter, auto-resets
    ///
    /// Returns the previous signal state
    pub fn set(&self) -> bool {
        let mut signaled = self.state();
        let previous = *signaled;
        *signaled = true;
        drop(signaled);

        match self.event_type {
            EventType::Notification => self.waiters.notify_all(),
            EventType::Synchronization => self.waiters.notify_one(),
        }

        previous
    }

    /// Reset (clear) the event, returning the previous signal state
    pub fn clear(&self) -> bool {
        let mut signaled = self.state();
        let previous = *signaled;
        *signaled = false;
        previous
    }

    /// Wait for the event
    ///
    /// `None` waits forever. Returns true if the event was signaled, false
    /// if the timeout elapsed first. Synchronization events are consumed
    /// by the waiter that observes them.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut signaled = self.state();

        while !*signaled {
            match deadline {
                None => {
                    signaled = self
                        .waiters
                        .wait(signaled)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    let (guard, _) = self
                        .waiters
                        .wait_timeout(signaled, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner);
                    signaled = guard;
                }
            }
        }

        if self.event_type == EventType::Synchronization {
            *signaled = false;
        }
        true
    }
}
