//! Self-managing contiguous byte buffer.
//!
//! Each connection owns one `ElasticBuffer` for reads and one for writes.
//! Bytes are appended at the back and consumed from the front; the readable
//! region is always a single contiguous slice.
//!
//! ## Growth Policy
//!
//! When an append does not fit in the tail free space:
//! 1. If tail + head free space together fit the request, the live region is
//!    moved down to offset 0 (compaction) and reused in place.
//! 2. Otherwise a new store is allocated, doubling the capacity until the
//!    live data plus the request fit.
//!
//! Capacity never shrinks. A buffer that becomes empty after a consume resets
//! both offsets, so the next append sees the whole store as tail space.

/// Alignment of every capacity, in bytes.
pub const CAPACITY_ALIGN: usize = 64;

/// Contiguous byte region with independent read and write offsets.
///
/// Invariant: `read <= write <= storage.len()`.
#[derive(Debug)]
pub struct ElasticBuffer {
    storage: Vec<u8>,
    /// Start of the readable region.
    read: usize,
    /// End of the readable region.
    write: usize,
}

impl ElasticBuffer {
    /// Create a buffer with at least `size` bytes of capacity, rounded up to
    /// a multiple of [`CAPACITY_ALIGN`].
    pub fn with_capacity(size: usize) -> Self {
        Self {
            storage: vec![0u8; align_capacity(size)],
            read: 0,
            write: 0,
        }
    }

    /// Number of readable bytes.
    pub fn size(&self) -> usize {
        self.write - self.read
    }

    pub fn is_empty(&self) -> bool {
        self.read == self.write
    }

    /// Length of the backing store.
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// View of the readable region. Invalidated by the next mutating call.
    pub fn data(&self) -> &[u8] {
        &self.storage[self.read..self.write]
    }

    /// Reset to empty without releasing storage.
    pub fn clear(&mut self) {
        self.read = 0;
        self.write = 0;
    }

    /// Drop `n` bytes from the front of the readable region.
    ///
    /// # Panics
    /// Panics if `n` exceeds [`size`](Self::size).
    pub fn consume(&mut self, n: usize) {
        assert!(
            n <= self.size(),
            "consume({n}) exceeds buffered size {}",
            self.size()
        );
        self.read += n;
        if self.read == self.write {
            self.clear();
        }
    }

    /// Append `bytes` contiguously after the readable region.
    pub fn append(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        self.reserve(bytes.len());
        let end = self.write + bytes.len();
        self.storage[self.write..end].copy_from_slice(bytes);
        self.write = end;
    }

    /// Make room for `additional` bytes at the back.
    fn reserve(&mut self, additional: usize) {
        let tail = self.storage.len() - self.write;
        if tail >= additional {
            return;
        }

        let head = self.read;
        if tail + head >= additional {
            self.compact();
            return;
        }

        let live = self.size();
        let required = live
            .checked_add(additional)
            .expect("buffer capacity overflow");
        let mut capacity = self.storage.len();
        while capacity < required {
            capacity = capacity.checked_mul(2).expect("buffer capacity overflow");
        }

        let mut storage = vec![0u8; capacity];
        storage[..live].copy_from_slice(self.data());
        self.storage = storage;
        self.read = 0;
        self.write = live;
    }

    /// Slide the live region down to offset 0.
    fn compact(&mut self) {
        let live = self.size();
        self.storage.copy_within(self.read..self.write, 0);
        self.read = 0;
        self.write = live;
    }
}

/// Round `size` up to the next multiple of [`CAPACITY_ALIGN`] (minimum one block).
fn align_capacity(size: usize) -> usize {
    let size = size.max(1);
    (size + CAPACITY_ALIGN - 1) & !(CAPACITY_ALIGN - 1)
}
