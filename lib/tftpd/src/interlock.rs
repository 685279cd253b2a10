//! Multi-reader/single-writer interlock over a single atomic counter.
//! This is an admission gate, not a mutex: acquisition makes a few
//! attempts and reports failure instead of blocking, and callers surface
//! the failure to the peer.

use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;

const WRITE_FLAG: u32 = 0x8000_0000;
const ATTEMPTS: u32 = 3;

pub struct Interlock {
    counter: AtomicU32,
}

impl Interlock {
    pub fn new() -> Interlock {
        Interlock {
            counter: AtomicU32::new(0),
        }
    }

    /// Up to three attempts with a yield in between; never blocks.
    pub fn try_lock_read(&self) -> bool {
        for _ in 0..ATTEMPTS {
            if self.lock_read_attempt() {
                return true;
            }
            thread::yield_now();
        }

        false
    }

    /// Up to three attempts with a yield in between; never blocks.
    pub fn try_lock_write(&self) -> bool {
        for _ in 0..ATTEMPTS {
            if self.lock_write_attempt() {
                return true;
            }
            thread::yield_now();
        }

        false
    }

    pub fn unlock_read(&self) {
        let previous = self.counter.fetch_sub(1, Ordering::AcqRel);
        debug_assert!((previous & !WRITE_FLAG) > 0, "read unlock without holder");
    }

    pub fn unlock_write(&self) {
        self.counter.fetch_and(!WRITE_FLAG, Ordering::AcqRel);
    }

    pub fn is_free(&self) -> bool {
        self.counter.load(Ordering::Acquire) == 0
    }

    fn lock_read_attempt(&self) -> bool {
        if self.counter.fetch_add(1, Ordering::AcqRel) & WRITE_FLAG != 0 {
            // A writer holds the lock; undo the optimistic increment.
            self.counter.fetch_sub(1, Ordering::AcqRel);
            return false;
        }

        true
    }

    fn lock_write_attempt(&self) -> bool {
        let previous = self.counter.fetch_or(WRITE_FLAG, Ordering::AcqRel);

        if previous & WRITE_FLAG != 0 {
            // Another writer holds the lock; leave its flag alone.
            return false;
        }

        if previous != 0 {
            // Readers hold the lock; retract the write flag.
            self.counter.fetch_and(!WRITE_FLAG, Ordering::AcqRel);
            return false;
        }

        true
    }
}
