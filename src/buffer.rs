//   Copyright (c) 2024-2026 Anton Kundenko <singaraiona@gmail.com>
//   All rights reserved.
//
//   Permission is hereby granted, free of charge, to any person obtaining a copy
//   of this software and associated documentation files (the "Software"), to deal
//   in the Software without restriction, including without limitation the rights
//   to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
//   copies of the Software, and to permit persons to whom the Software is
//   furnished to do so, subject to the following conditions:
//
//   The above copyright notice and this permission notice shall be included in all
//   copies or substantial portions of the Software.
//
//   THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
//   IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
//   FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
//   AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
//   LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
//   OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
//   SOFTWARE.

//! Pooled output buffers for reply-frame serialization.
//!
//! `FrameBuilder` writes a frame into a buffer leased from a `BufferPool`.
//! Growth leases a larger buffer, copies, and releases the superseded buffer
//! back to the pool at that moment. `finish()` transfers the final buffer to
//! the caller and clears the lease table; a non-empty lease table at that
//! point, or releasing the same lease twice, is a programmer error and
//! panics.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};

const MIN_BUFFER_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// BufferPool
// ---------------------------------------------------------------------------

/// A pool of reusable byte buffers shared by the frame builders of one
/// writer. Buffers returned to the pool keep their capacity.
pub struct BufferPool {
    free: Mutex<Vec<BytesMut>>,
    next_lease: AtomicU64,
}

impl BufferPool {
    pub fn new() -> Arc<BufferPool> {
        Arc::new(BufferPool {
            free: Mutex::new(Vec::new()),
            next_lease: AtomicU64::new(1),
        })
    }

    /// Lease a buffer with at least `min_capacity` bytes of capacity.
    fn acquire(&self, min_capacity: usize) -> (u64, BytesMut) {
        let lease = self.next_lease.fetch_add(1, Ordering::Relaxed);
        let want = min_capacity.max(MIN_BUFFER_CAPACITY);
        let mut free = self.free.lock().unwrap_or_else(|e| e.into_inner());
        let buf = match free.iter().position(|b| b.capacity() >= want) {
            Some(i) => free.swap_remove(i),
            None => BytesMut::with_capacity(want),
        };
        (lease, buf)
    }

    /// Return a buffer to the free list.
    fn release(&self, mut buf: BytesMut) {
        buf.clear();
        let mut free = self.free.lock().unwrap_or_else(|e| e.into_inner());
        free.push(buf);
    }

    /// Number of buffers currently sitting in the free list.
    pub fn free_buffers(&self) -> usize {
        self.free.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

// ---------------------------------------------------------------------------
// FrameBuilder
// ---------------------------------------------------------------------------

/// Builds one reply frame in a pooled buffer, growing on demand.
pub struct FrameBuilder {
    pool: Arc<BufferPool>,
    buf: Option<BytesMut>,
    current_lease: u64,
    // Outstanding leases held by this builder: lease id → capacity at lease
    // time. Exactly one entry while building; transiently two during growth.
    leases: HashMap<u64, usize>,
}

impl FrameBuilder {
    pub fn new(pool: Arc<BufferPool>) -> FrameBuilder {
        let (lease, buf) = pool.acquire(MIN_BUFFER_CAPACITY);
        let mut leases = HashMap::new();
        leases.insert(lease, buf.capacity());
        FrameBuilder {
            pool,
            buf: Some(buf),
            current_lease: lease,
            leases,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.as_ref().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append bytes, growing the underlying pooled buffer if needed.
    pub fn put_slice(&mut self, bytes: &[u8]) {
        let (len, capacity) = {
            let buf = self.buf.as_ref().expect("frame builder already finished");
            (buf.len(), buf.capacity())
        };
        if len + bytes.len() > capacity {
            self.grow(len + bytes.len());
        }
        self.buf
            .as_mut()
            .expect("frame builder already finished")
            .extend_from_slice(bytes);
    }

    /// Replace the current buffer with a larger one. The superseded buffer
    /// is released back to the pool before the new one is written into.
    fn grow(&mut self, needed: usize) {
        let old = self.buf.take().expect("frame builder already finished");
        let old_lease = self.current_lease;
        let (lease, mut fresh) = self.pool.acquire(needed.next_power_of_two());
        self.leases.insert(lease, fresh.capacity());
        fresh.extend_from_slice(&old);
        self.release_lease(old_lease, old);
        self.current_lease = lease;
        self.buf = Some(fresh);
    }

    fn release_lease(&mut self, lease: u64, buf: BytesMut) {
        if self.leases.remove(&lease).is_none() {
            panic!("buffer lease {lease} released twice");
        }
        self.pool.release(buf);
    }

    /// Extract the finished frame, transferring ownership of the remaining
    /// buffer to the caller. All internal leases must be settled.
    pub fn finish(mut self) -> Bytes {
        let buf = self.buf.take().expect("frame builder already finished");
        if self.leases.remove(&self.current_lease).is_none() {
            panic!("current buffer lease {} missing", self.current_lease);
        }
        if !self.leases.is_empty() {
            panic!("frame builder leaked {} buffer lease(s)", self.leases.len());
        }
        buf.freeze()
    }

    #[cfg(test)]
    fn outstanding_leases(&self) -> usize {
        self.leases.len()
    }
}

impl std::io::Write for FrameBuilder {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.put_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_frame_no_growth() {
        let pool = BufferPool::new();
        let mut fb = FrameBuilder::new(pool.clone());
        fb.put_slice(b"hello");
        assert_eq!(fb.outstanding_leases(), 1);
        let frame = fb.finish();
        assert_eq!(&frame[..], b"hello");
        // Nothing was released mid-build, the final buffer went to the caller.
        assert_eq!(pool.free_buffers(), 0);
    }

    #[test]
    fn growth_releases_superseded_buffer() {
        let pool = BufferPool::new();
        let mut fb = FrameBuilder::new(pool.clone());
        let payload = vec![0xabu8; MIN_BUFFER_CAPACITY * 4];
        fb.put_slice(&payload);
        // The original buffer must be back in the pool after growth.
        assert_eq!(pool.free_buffers(), 1);
        assert_eq!(fb.outstanding_leases(), 1);
        let frame = fb.finish();
        assert_eq!(frame.len(), payload.len());
    }

    #[test]
    fn released_buffers_are_reused() {
        let pool = BufferPool::new();
        let mut fb = FrameBuilder::new(pool.clone());
        fb.put_slice(&vec![1u8; MIN_BUFFER_CAPACITY * 2]);
        let _ = fb.finish();
        assert_eq!(pool.free_buffers(), 1);
        // A second builder with a large write picks up the released buffer.
        let mut fb2 = FrameBuilder::new(pool.clone());
        fb2.put_slice(&vec![2u8; MIN_BUFFER_CAPACITY + 1]);
        let _ = fb2.finish();
    }

    #[test]
    fn write_trait_feeds_serializers() {
        use std::io::Write;
        let pool = BufferPool::new();
        let mut fb = FrameBuilder::new(pool);
        write!(fb, "{}-{}", 12, "x").unwrap();
        assert_eq!(&fb.finish()[..], b"12-x");
    }

    #[test]
    #[should_panic(expected = "released twice")]
    fn double_release_panics() {
        let pool = BufferPool::new();
        let mut fb = FrameBuilder::new(pool.clone());
        let (lease, buf) = pool.acquire(16);
        fb.leases.insert(lease, buf.capacity());
        fb.release_lease(lease, buf);
        let (_, buf2) = pool.acquire(16);
        fb.release_lease(lease, buf2);
    }
}
