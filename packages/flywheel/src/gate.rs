//! One-shot startup gate for child state machine synchronization.
//!
//! Actions must never be forwarded to a child machine before the child's
//! state stream is being observed, since the child's dispatch contract fails
//! fast when not collected. The gate starts blocked and is released exactly
//! once, when the child subscription is live; forwarders await the gate
//! before every dispatch.
//!
//! Once released the gate stays released forever. There is no re-block
//! operation; a new activation creates a new gate.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

/// A one-shot latch: starts blocked, released exactly once, never re-blocks.
#[derive(Debug, Default)]
pub struct StartupGate {
    released: AtomicBool,
    notify: Notify,
}

impl StartupGate {
    /// Create a gate in the blocked state.
    pub fn new() -> Self {
        Self {
            released: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Release the gate, waking every waiter.
    ///
    /// Calling this more than once has no effect.
    pub fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.notify.notify_waiters();
        }
    }

    /// Wait until the gate has been released.
    ///
    /// Returns immediately if it already was.
    pub async fn released(&self) {
        loop {
            // Register before rechecking: Notify is edge-triggered, and
            // release() flips the flag before notifying.
            let notified = self.notify.notified();
            if self.released.load(Ordering::Acquire) {
                return;
            }
            notified.await;
        }
    }

    /// Whether the gate has been released.
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}
