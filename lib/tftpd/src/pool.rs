//! Fixed-capacity pool of uniform-size byte buffers. Buffers leave the
//! pool as owned leases and are returned by the datagram drop path, so
//! the steady state allocates nothing.

use std::sync::Mutex;

/// A buffer on loan from a `BufferPool`. The lease remembers the slot it
/// came from; handing it back to any other pool is a bug.
pub struct Lease {
    index: usize,
    buffer: Vec<u8>,
}

impl Lease {
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.buffer
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    /// The backing vector itself; needed by the ancillary-data receive
    /// path, which requires a `Vec`.
    #[inline]
    pub fn vec_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buffer
    }

    /// Zero-length stand-in for moving a real lease out of a drop path.
    /// Must never be handed back to a pool.
    #[inline]
    pub(crate) fn placeholder() -> Lease {
        Lease {
            index: 0,
            buffer: Vec::new(),
        }
    }
}

pub struct BufferPool {
    buffer_size: usize,
    inner: Mutex<Inner>,
}

struct Inner {
    // A slot is None while its buffer is out on lease.
    slots: Vec<Option<Vec<u8>>>,
    cursor: usize,
}

impl BufferPool {
    pub fn new(buffer_size: usize, pool_size: usize) -> BufferPool {
        if buffer_size == 0 {
            panic!("Pool buffer size must be greater than 0");
        }
        if pool_size == 0 {
            panic!("Pool size must be greater than 0");
        }

        let slots = (0..pool_size).map(|_| Some(vec![0u8; buffer_size])).collect();

        BufferPool {
            buffer_size,
            inner: Mutex::new(Inner { slots, cursor: 0 }),
        }
    }

    #[inline]
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Takes a free buffer, scanning from a rotating cursor. Returns
    /// `None` when every slot is on lease; never blocks beyond the
    /// internal mutex.
    pub fn alloc(&self) -> Option<Lease> {
        let mut inner = self.inner.lock().unwrap();
        let slot_count = inner.slots.len();
        let start = inner.cursor;

        loop {
            let current = inner.cursor;
            inner.cursor = (current + 1) % slot_count;

            if let Some(buffer) = inner.slots[current].take() {
                return Some(Lease {
                    index: current,
                    buffer,
                });
            }

            if inner.cursor == start {
                return None;
            }
        }
    }

    /// Returns a lease to its slot. The buffer is restored to the pool's
    /// uniform size in case the holder resized it.
    pub fn free(&self, lease: Lease) {
        let Lease { index, mut buffer } = lease;

        buffer.resize(self.buffer_size, 0);

        let mut inner = self.inner.lock().unwrap();
        debug_assert!(inner.slots[index].is_none(), "double free of pool slot");
        inner.slots[index] = Some(buffer);
    }

    /// Number of buffers currently available.
    pub fn free_count(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.slots.iter().filter(|slot| slot.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_until_exhaustion() {
        let pool = BufferPool::new(64, 3);

        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        let c = pool.alloc().unwrap();

        assert!(pool.alloc().is_none());
        assert_eq!(pool.free_count(), 0);

        // Indices are distinct slots.
        let mut indices = vec![a.index(), b.index(), c.index()];
        indices.sort();
        assert_eq!(indices, vec![0, 1, 2]);

        pool.free(b);
        assert_eq!(pool.free_count(), 1);
        assert!(pool.alloc().is_some());
    }

    #[test]
    fn test_buffers_have_uniform_size() {
        let pool = BufferPool::new(128, 2);

        let lease = pool.alloc().unwrap();
        assert_eq!(lease.as_slice().len(), 128);
        pool.free(lease);
    }

    #[test]
    fn test_free_restores_resized_buffer() {
        let pool = BufferPool::new(32, 1);

        let mut lease = pool.alloc().unwrap();
        lease.vec_mut().truncate(4);
        pool.free(lease);

        let lease = pool.alloc().unwrap();
        assert_eq!(lease.as_slice().len(), 32);
        pool.free(lease);
    }

    #[test]
    fn test_cursor_rotates() {
        let pool = BufferPool::new(8, 2);

        let first = pool.alloc().unwrap();
        let first_index = first.index();
        pool.free(first);

        // The cursor moved past the first slot, so the next allocation
        // picks the other one.
        let second = pool.alloc().unwrap();
        assert_ne!(second.index(), first_index);
        pool.free(second);
    }

    #[test]
    #[should_panic(expected = "Pool size must be greater than 0")]
    fn test_zero_pool_size_panics() {
        let _ = BufferPool::new(8, 0);
    }
}
