//! Single-producer single-consumer queue over a fixed ring of slots.
//! One slot is sacrificed to tell full from empty, so a ring of size N
//! holds N - 1 values.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Safety contract: at most one thread calls `push` and at most one
/// thread calls `pop` at any given time. The head/tail handoff uses
/// acquire/release pairs so the value written by the producer is visible
/// to the consumer before the slot is published.
pub struct SpscRing<T> {
    read_head: AtomicUsize,
    write_head: AtomicUsize,
    slots: Box<[UnsafeCell<Option<T>>]>,
}

unsafe impl<T: Send> Send for SpscRing<T> {}
unsafe impl<T: Send> Sync for SpscRing<T> {}

impl<T> SpscRing<T> {
    pub fn new(size: usize) -> SpscRing<T> {
        if size < 4 {
            panic!("Ring size must be at least 4");
        }

        let slots: Vec<UnsafeCell<Option<T>>> = (0..size).map(|_| UnsafeCell::new(None)).collect();

        SpscRing {
            read_head: AtomicUsize::new(0),
            write_head: AtomicUsize::new(0),
            slots: slots.into_boxed_slice(),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.read_head.load(Ordering::Acquire) == self.write_head.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        let write = self.write_head.load(Ordering::Acquire);
        (write + 1) % self.slots.len() == self.read_head.load(Ordering::Acquire)
    }

    /// Producer side. Hands the value back when the ring is full.
    pub fn push(&self, value: T) -> Result<(), T> {
        let write = self.write_head.load(Ordering::Relaxed);
        let next = (write + 1) % self.slots.len();

        if next == self.read_head.load(Ordering::Acquire) {
            return Err(value);
        }

        unsafe {
            *self.slots[write].get() = Some(value);
        }
        self.write_head.store(next, Ordering::Release);

        Ok(())
    }

    /// Consumer side.
    pub fn pop(&self) -> Option<T> {
        let read = self.read_head.load(Ordering::Relaxed);

        if read == self.write_head.load(Ordering::Acquire) {
            return None;
        }

        let value = unsafe { (*self.slots[read].get()).take() };
        self.read_head
            .store((read + 1) % self.slots.len(), Ordering::Release);

        debug_assert!(value.is_some(), "published ring slot was empty");
        value
    }
}
