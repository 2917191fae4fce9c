//! Host staging memory used by transfers.
//!
//! Buffers are zero-initialized on allocation and recycled through a bounded free list when
//! dropped, so repeated transfers of similar sizes do not hit the system allocator.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

const DEFAULT_MAX_CACHED: usize = 16;

struct HostAllocatorInner {
    free: Mutex<Vec<Vec<u8>>>,
    max_cached: usize,
    live_bytes: AtomicUsize,
    peak_bytes: AtomicUsize,
    allocations: AtomicUsize,
    reuses: AtomicUsize,
}

/// Shared host allocator; clones share the same free list and statistics.
#[derive(Clone)]
pub struct HostAllocator {
    inner: Arc<HostAllocatorInner>,
}

impl HostAllocator {
    pub fn new() -> Self {
        Self::with_max_cached(DEFAULT_MAX_CACHED)
    }

    /// Allocator keeping at most `max_cached` released buffers for reuse.
    pub fn with_max_cached(max_cached: usize) -> Self {
        Self {
            inner: Arc::new(HostAllocatorInner {
                free: Mutex::new(Vec::new()),
                max_cached,
                live_bytes: AtomicUsize::new(0),
                peak_bytes: AtomicUsize::new(0),
                allocations: AtomicUsize::new(0),
                reuses: AtomicUsize::new(0),
            }),
        }
    }

    /// Returns a zero-filled buffer of exactly `len` bytes.
    pub fn allocate(&self, len: usize) -> HostBuffer {
        let recycled = {
            let mut free = self.inner.free.lock();
            let slot = free.iter().position(|buf| buf.capacity() >= len);
            slot.map(|idx| free.swap_remove(idx))
        };
        let data = match recycled {
            Some(mut buf) => {
                self.inner.reuses.fetch_add(1, Ordering::Relaxed);
                buf.clear();
                buf.resize(len, 0);
                buf
            }
            None => vec![0u8; len],
        };
        self.inner.allocations.fetch_add(1, Ordering::Relaxed);
        let live = self.inner.live_bytes.fetch_add(len, Ordering::Relaxed) + len;
        self.inner.peak_bytes.fetch_max(live, Ordering::Relaxed);
        HostBuffer {
            data,
            allocator: Arc::clone(&self.inner),
        }
    }

    /// Bytes held by buffers that have not been dropped yet.
    pub fn live_bytes(&self) -> usize {
        self.inner.live_bytes.load(Ordering::Relaxed)
    }

    pub fn peak_bytes(&self) -> usize {
        self.inner.peak_bytes.load(Ordering::Relaxed)
    }

    pub fn allocation_count(&self) -> usize {
        self.inner.allocations.load(Ordering::Relaxed)
    }

    /// Allocations served from the free list.
    pub fn reuse_count(&self) -> usize {
        self.inner.reuses.load(Ordering::Relaxed)
    }

    pub fn cached_buffers(&self) -> usize {
        self.inner.free.lock().len()
    }
}

impl Default for HostAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HostAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostAllocator")
            .field("live_bytes", &self.live_bytes())
            .field("peak_bytes", &self.peak_bytes())
            .field("allocations", &self.allocation_count())
            .finish()
    }
}

/// Host byte buffer returned to its allocator on drop.
pub struct HostBuffer {
    data: Vec<u8>,
    allocator: Arc<HostAllocatorInner>,
}

impl HostBuffer {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Deref for HostBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for HostBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl fmt::Debug for HostBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostBuffer").field("len", &self.data.len()).finish()
    }
}

impl Drop for HostBuffer {
    fn drop(&mut self) {
        let data = std::mem::take(&mut self.data);
        self.allocator
            .live_bytes
            .fetch_sub(data.len(), Ordering::Relaxed);
        let mut free = self.allocator.free.lock();
        if free.len() < self.allocator.max_cached && data.capacity() > 0 {
            free.push(data);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_are_zeroed_and_tracked() {
        let allocator = HostAllocator::new();
        let mut buf = allocator.allocate(16);
        assert_eq!(buf.len(), 16);
        assert!(buf.iter().all(|b| *b == 0));
        buf[3] = 7;
        assert_eq!(allocator.live_bytes(), 16);
        drop(buf);
        assert_eq!(allocator.live_bytes(), 0);
        assert_eq!(allocator.peak_bytes(), 16);
    }

    #[test]
    fn released_buffers_are_reused_and_rezeroed() {
        let allocator = HostAllocator::with_max_cached(1);
        let mut first = allocator.allocate(32);
        first.as_mut_slice().fill(0xAB);
        drop(first);
        assert_eq!(allocator.cached_buffers(), 1);

        let second = allocator.allocate(8);
        assert_eq!(allocator.reuse_count(), 1);
        assert_eq!(second.as_slice(), &[0u8; 8]);
        assert_eq!(allocator.allocation_count(), 2);
    }

    #[test]
    fn free_list_is_bounded() {
        let allocator = HostAllocator::with_max_cached(1);
        let a = allocator.allocate(4);
        let b = allocator.allocate(4);
        drop(a);
        drop(b);
        assert_eq!(allocator.cached_buffers(), 1);
    }
}
