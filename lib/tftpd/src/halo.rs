//! Ring buffer with a mirrored upper half: capacity `N` backed by `2N`
//! bytes where every write lands twice, at `i` and `i + N`. Any read of
//! up to `N` contiguous bytes starting inside the first half never
//! crosses the wrap seam, which is what the streaming EOL rewriter
//! relies on for its look-ahead.

pub struct HaloBuffer {
    data: Box<[u8]>,
    capacity: usize,
}

impl HaloBuffer {
    pub fn new(capacity: usize) -> HaloBuffer {
        if capacity == 0 {
            panic!("Halo buffer capacity must be greater than 0");
        }

        HaloBuffer {
            data: vec![0u8; capacity * 2].into_boxed_slice(),
            capacity,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Writes `src` at the given logical offset (taken modulo capacity),
    /// mirroring every byte into the upper half. `src` must not exceed
    /// one full capacity.
    pub fn write(&mut self, at: usize, src: &[u8]) {
        if src.len() > self.capacity {
            panic!("Halo buffer write larger than capacity");
        }

        let start = at % self.capacity;
        let first = src.len().min(self.capacity - start);

        self.copy_mirrored(start, &src[..first]);

        if first < src.len() {
            self.copy_mirrored(0, &src[first..]);
        }
    }

    /// A contiguous view of `len` bytes starting at the logical offset.
    /// `len` must not exceed one full capacity.
    #[inline]
    pub fn slice(&self, at: usize, len: usize) -> &[u8] {
        if len > self.capacity {
            panic!("Halo buffer read larger than capacity");
        }

        let start = at % self.capacity;
        &self.data[start..start + len]
    }

    #[inline]
    pub fn get(&self, at: usize) -> u8 {
        self.data[at % self.capacity]
    }

    #[inline]
    fn copy_mirrored(&mut self, start: usize, src: &[u8]) {
        let capacity = self.capacity;
        self.data[start..start + src.len()].copy_from_slice(src);
        self.data[capacity + start..capacity + start + src.len()].copy_from_slice(src);
    }
}
