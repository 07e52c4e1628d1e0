//! Pooled byte segments for outbound message encoding.
//!
//! Payloads are serialized into [`Segment`]s taken from a shared
//! [`BufferPool`]. When the write pump has consumed a message, its segment
//! goes back to the pool and a later send reuses the allocation.
//!
//! # Design
//!
//! - The free list is an unbounded MPMC bag (`crossbeam_channel`); any task
//!   may allocate or free without locking, and reuse order is unspecified.
//! - `allocate` takes the first free segment with enough capacity. If it is
//!   much larger than needed, the tail is split off and returned to the pool.
//! - `free` never coalesces neighbours.
//! - `flush` drops every free segment so idle memory can be reclaimed.
//! - [`BufferPool::encode`] sizes segments from the largest payload seen
//!   since the last flush. A split segment shares its allocation with its
//!   neighbours, so growing it while encoding would copy into a fresh
//!   arena; the hint keeps encodes inside the capacity they were given.
//! - At most [`MAX_FREE_SEGMENTS`] segments wait in the pool; extras are
//!   dropped on `free`.

use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use crossbeam_channel::{Receiver, Sender};
use serde::Serialize;

use crate::codec::MsgPackCodec;
use crate::error::Result;

/// Default size of a freshly allocated segment (64 KB).
pub const DEFAULT_SEGMENT_SIZE: usize = 64 * 1024;

/// Remainders smaller than this stay attached to the allocated segment.
pub const MIN_SPLIT_SIZE: usize = 256;

/// Upper bound on segments kept in the free bag.
pub const MAX_FREE_SEGMENTS: usize = 4096;

/// A resizable byte region handed out by a [`BufferPool`].
#[derive(Debug, Default)]
pub struct Segment {
    buf: BytesMut,
}

impl Segment {
    /// Wrap an existing buffer (not pooled until freed).
    pub fn from_buf(buf: BytesMut) -> Self {
        Self { buf }
    }

    /// Mutable access for encoding into the segment.
    #[inline]
    pub fn buf_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }
}

impl Deref for Segment {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

/// Shared pool of free segments.
#[derive(Debug, Clone)]
pub struct BufferPool {
    free_tx: Sender<BytesMut>,
    free_rx: Receiver<BytesMut>,
    segment_size: usize,
    size_hint: Arc<AtomicUsize>,
}

impl BufferPool {
    /// Create a pool whose fresh segments are `segment_size` bytes.
    pub fn new(segment_size: usize) -> Self {
        let (free_tx, free_rx) = crossbeam_channel::unbounded();
        Self {
            free_tx,
            free_rx,
            segment_size: segment_size.max(MIN_SPLIT_SIZE),
            size_hint: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Default size of a fresh segment.
    pub fn segment_size(&self) -> usize {
        self.segment_size
    }

    /// Take a segment with at least `min_bytes` of capacity.
    ///
    /// Free segments that are too small are put back; if none fits, a new
    /// segment of `max(min_bytes, segment_size)` is allocated.
    pub fn allocate(&self, min_bytes: usize) -> Segment {
        let candidates = self.free_rx.len();
        for _ in 0..candidates {
            let Ok(buf) = self.free_rx.try_recv() else {
                break;
            };
            if buf.capacity() >= min_bytes {
                return self.split(buf, min_bytes);
            }
            self.put_back(buf);
        }

        let fresh = BytesMut::with_capacity(min_bytes.max(self.segment_size));
        self.split(fresh, min_bytes)
    }

    /// Serialize `value` into a segment sized by [`size_hint`](Self::size_hint).
    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Segment> {
        let mut segment = self.allocate(self.size_hint());
        match MsgPackCodec::encode_into(value, segment.buf_mut()) {
            Ok(len) => {
                self.record_size(len);
                Ok(segment)
            }
            Err(err) => {
                self.free(segment);
                Err(err)
            }
        }
    }

    /// Capacity to request for a payload of unknown size.
    ///
    /// The largest encoded size recorded since the last flush, rounded up
    /// to a power of two.
    pub fn size_hint(&self) -> usize {
        self.size_hint.load(Ordering::Relaxed)
    }

    /// Note an encoded payload of `len` bytes.
    pub fn record_size(&self, len: usize) {
        self.size_hint
            .fetch_max(len.next_power_of_two(), Ordering::Relaxed);
    }

    /// Return a segment to the pool.
    pub fn free(&self, segment: Segment) {
        let mut buf = segment.buf;
        buf.clear();
        if buf.capacity() > 0 {
            self.put_back(buf);
        }
    }

    /// Drop every free segment and forget the size hint.
    ///
    /// Returns the number of segments released.
    pub fn flush(&self) -> usize {
        self.size_hint.store(0, Ordering::Relaxed);
        let mut dropped = 0;
        while self.free_rx.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            tracing::trace!(dropped, "Flushed buffer pool");
        }
        dropped
    }

    /// Number of segments currently waiting in the pool.
    pub fn free_count(&self) -> usize {
        self.free_rx.len()
    }

    fn split(&self, mut buf: BytesMut, min_bytes: usize) -> Segment {
        let want = min_bytes.max(MIN_SPLIT_SIZE);
        if buf.capacity() >= want + MIN_SPLIT_SIZE {
            let rest = buf.split_off(want);
            self.put_back(rest);
        }
        Segment { buf }
    }

    fn put_back(&self, buf: BytesMut) {
        if self.free_rx.len() >= MAX_FREE_SEGMENTS {
            return;
        }
        // both ends live in self, so the channel cannot be disconnected
        let _ = self.free_tx.send(buf);
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_SEGMENT_SIZE)
    }
}
