//! Circular byte buffer with exclusive region access
//!
//! A producer and a consumer on different tasks exchange a byte stream
//! through fixed storage. Access goes through regions: an open call waits
//! for the single lock, computes a contiguous span that never crosses the
//! end of storage, and hands it out as a guard. Closing the guard commits
//! the bytes actually moved and releases the lock. Dropping a guard without
//! closing it commits nothing.

use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

use crate::error::BufferError;

struct Cursors {
    storage: Box<[u8]>,
    left: usize,
    right: usize,
    size: usize,
}

impl Cursors {
    fn capacity(&self) -> usize {
        self.storage.len()
    }

    fn read_span(&self, request: usize) -> usize {
        request.min(self.size).min(self.capacity() - self.left)
    }

    fn write_span(&self, request: usize) -> usize {
        request
            .min(self.capacity() - self.size)
            .min(self.capacity() - self.right)
    }

    fn consume(&mut self, n: usize) {
        self.left = (self.left + n) % self.capacity();
        self.size -= n.min(self.size);
    }

    fn commit(&mut self, n: usize) {
        self.right = (self.right + n) % self.capacity();
        self.size = (self.size + n).min(self.capacity());
    }

    fn reset(&mut self) {
        self.left = 0;
        self.right = 0;
        self.size = 0;
    }
}

/// Fixed-capacity circular byte buffer
pub struct RegionBuffer {
    capacity: usize,
    inner: Mutex<Cursors>,
}

impl RegionBuffer {
    /// Create a buffer holding `capacity` bytes
    pub fn new(capacity: usize) -> Result<Self, BufferError> {
        if capacity == 0 {
            return Err(BufferError::ZeroCapacity);
        }

        Ok(Self {
            capacity,
            inner: Mutex::new(Cursors {
                storage: vec![0u8; capacity].into_boxed_slice(),
                left: 0,
                right: 0,
                size: 0,
            }),
        })
    }

    /// Buffer capacity in bytes
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Wait for the buffer and claim up to `request` readable bytes
    pub async fn open_read_region(&self, request: usize) -> ReadRegion<'_> {
        ReadRegion::new(self.inner.lock().await, request)
    }

    /// Wait for the buffer and claim up to `request` writable bytes
    pub async fn open_write_region(&self, request: usize) -> WriteRegion<'_> {
        WriteRegion::new(self.inner.lock().await, request)
    }

    /// Blocking variant of [`open_read_region`](Self::open_read_region)
    ///
    /// Panics when called from inside an async runtime.
    pub fn blocking_open_read_region(&self, request: usize) -> ReadRegion<'_> {
        ReadRegion::new(self.inner.blocking_lock(), request)
    }

    /// Blocking variant of [`open_write_region`](Self::open_write_region)
    ///
    /// Panics when called from inside an async runtime.
    pub fn blocking_open_write_region(&self, request: usize) -> WriteRegion<'_> {
        WriteRegion::new(self.inner.blocking_lock(), request)
    }

    /// Number of valid bytes
    pub async fn size(&self) -> usize {
        self.inner.lock().await.size
    }

    /// Check if no bytes are buffered
    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.size == 0
    }

    /// Drop all buffered bytes and rewind both cursors
    pub async fn clear(&self) {
        self.inner.lock().await.reset();
    }

    /// Copy as much of `data` as fits, wrapping if needed
    ///
    /// Returns the number of bytes written. Never waits for space.
    pub async fn push(&self, data: &[u8]) -> usize {
        let mut written = 0;
        while written < data.len() {
            let mut region = self.open_write_region(data.len() - written).await;
            let n = region.len();
            if n == 0 {
                break;
            }
            region
                .as_mut_slice()
                .copy_from_slice(&data[written..written + n]);
            region.close(n);
            written += n;
        }
        written
    }

    /// Move up to `out.len()` buffered bytes into `out`
    ///
    /// Returns the number of bytes read. Never waits for data.
    pub async fn pop(&self, out: &mut [u8]) -> usize {
        let mut read = 0;
        while read < out.len() {
            let region = self.open_read_region(out.len() - read).await;
            let n = region.len();
            if n == 0 {
                break;
            }
            out[read..read + n].copy_from_slice(region.as_slice());
            region.close(n);
            read += n;
        }
        read
    }

    /// Blocking variant of [`push`](Self::push) for capture threads
    pub fn blocking_push(&self, data: &[u8]) -> usize {
        let mut written = 0;
        while written < data.len() {
            let mut region = self.blocking_open_write_region(data.len() - written);
            let n = region.len();
            if n == 0 {
                break;
            }
            region
                .as_mut_slice()
                .copy_from_slice(&data[written..written + n]);
            region.close(n);
            written += n;
        }
        written
    }

    /// Blocking variant of [`pop`](Self::pop) for playback threads
    pub fn blocking_pop(&self, out: &mut [u8]) -> usize {
        let mut read = 0;
        while read < out.len() {
            let region = self.blocking_open_read_region(out.len() - read);
            let n = region.len();
            if n == 0 {
                break;
            }
            out[read..read + n].copy_from_slice(region.as_slice());
            region.close(n);
            read += n;
        }
        read
    }
}

impl std::fmt::Debug for RegionBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegionBuffer")
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

/// Claimed readable span; holds the buffer lock until dropped
pub struct ReadRegion<'a> {
    cursors: MutexGuard<'a, Cursors>,
    offset: usize,
    len: usize,
}

impl<'a> ReadRegion<'a> {
    fn new(cursors: MutexGuard<'a, Cursors>, request: usize) -> Self {
        let len = cursors.read_span(request);
        let offset = cursors.left;
        Self {
            cursors,
            offset,
            len,
        }
    }

    /// Bytes available in this region
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Position of the region inside the storage
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.cursors.storage[self.offset..self.offset + self.len]
    }

    /// Mark `consumed` bytes as read and release the buffer
    ///
    /// `consumed` is clamped to the region length.
    pub fn close(mut self, consumed: usize) {
        let n = consumed.min(self.len);
        self.cursors.consume(n);
    }
}

/// Claimed writable span; holds the buffer lock until dropped
pub struct WriteRegion<'a> {
    cursors: MutexGuard<'a, Cursors>,
    offset: usize,
    len: usize,
}

impl<'a> WriteRegion<'a> {
    fn new(cursors: MutexGuard<'a, Cursors>, request: usize) -> Self {
        let len = cursors.write_span(request);
        let offset = cursors.right;
        Self {
            cursors,
            offset,
            len,
        }
    }

    /// Bytes that may be written into this region
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Position of the region inside the storage
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let (start, end) = (self.offset, self.offset + self.len);
        &mut self.cursors.storage[start..end]
    }

    /// Mark `produced` bytes as written and release the buffer
    ///
    /// `produced` is clamped to the region length.
    pub fn close(mut self, produced: usize) {
        let n = produced.min(self.len);
        self.cursors.commit(n);
    }
}

/// Handle to a region buffer shared between producer and session
pub type SharedRegionBuffer = Arc<RegionBuffer>;

/// Create a new shared region buffer
pub fn create_shared_buffer(capacity: usize) -> Result<SharedRegionBuffer, BufferError> {
    RegionBuffer::new(capacity).map(Arc::new)
}
