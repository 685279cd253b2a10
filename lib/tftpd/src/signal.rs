//! Edge-triggered one-shot wakeup. Any number of emits between two waits
//! collapse into a single notification; a successful wait consumes it.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

pub struct Signal {
    pending: Mutex<bool>,
    bell: Condvar,
}

impl Signal {
    pub fn new() -> Signal {
        Signal {
            pending: Mutex::new(false),
            bell: Condvar::new(),
        }
    }

    /// Posts the notification. Idempotent until the next wait.
    pub fn emit(&self) {
        let mut pending = self.pending.lock().unwrap();
        if !*pending {
            *pending = true;
            self.bell.notify_one();
        }
    }

    /// Waits up to `timeout` for a notification and consumes it.
    /// Returns whether one was consumed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut pending = self.pending.lock().unwrap();

        while !*pending {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }

            let (guard, result) = self.bell.wait_timeout(pending, deadline - now).unwrap();
            pending = guard;

            if result.timed_out() && !*pending {
                return false;
            }
        }

        *pending = false;
        true
    }

    /// Discards any pending notification.
    pub fn reset(&self) {
        let mut pending = self.pending.lock().unwrap();
        *pending = false;
    }
}
