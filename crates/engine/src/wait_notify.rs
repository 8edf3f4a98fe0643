//! Edge-triggered notification primitive
//!
//! Park a thread until notified or a deadline passes; the notification is
//! consumed on wake. A notify that arrives while nobody waits is latched
//! and satisfies the next wait immediately; the background timer relies
//! on this to coalesce wakeups that race its sleep.

use parking_lot::{Condvar, Mutex};
use std::time::Duration;

/// One-slot wait/notify pair.
#[derive(Default)]
pub struct WaitNotify {
    notified: Mutex<bool>,
    condvar: Condvar,
}

impl WaitNotify {
    /// A fresh, unnotified primitive.
    pub fn new() -> Self {
        Self::default()
    }

    /// Park until notified. Consumes the notification.
    pub fn wait(&self) {
        let mut notified = self.notified.lock();
        if !*notified {
            self.condvar.wait(&mut notified);
        }
        *notified = false;
    }

    /// Park until notified or `timeout` elapses. Returns true when woken
    /// by a notification, false on timeout. Consumes the notification
    /// either way.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut notified = self.notified.lock();
        if !*notified {
            self.condvar.wait_for(&mut notified, timeout);
        }
        let was_notified = *notified;
        *notified = false;
        was_notified
    }

    /// Wake one waiter, or latch the notification for the next wait.
    pub fn notify(&self) {
        let mut notified = self.notified.lock();
        *notified = true;
        drop(notified);
        self.condvar.notify_one();
    }
}
