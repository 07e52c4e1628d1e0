//! Outbound request queue with bucket aging.
//!
//! ```text
//!   enqueue ─► [bucket 0] [bucket 1] ... [bucket N-1] ─► take_frame
//!               newest                     oldest        (drained first)
//! ```
//!
//! `take_frame` walks the buckets from oldest to newest and selects the
//! longest run of chunks whose payloads fit in the frame budget. The first
//! chunk that does not fit, and every chunk after it, moves one bucket
//! toward the old end (the last bucket keeps its chunks). A chunk that was
//! skipped is therefore considered before anything enqueued after it on the
//! next pass.

use std::collections::VecDeque;

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::futures::Notified;
use tokio::sync::{oneshot, Notify};

use crate::error::{CloseReason, FramewireError, Result};
use crate::pool::{BufferPool, Segment};
use crate::transport::Fault;

/// Default number of aging buckets.
pub const DEFAULT_REQUEST_BUCKETS: usize = 4;

/// What an outbound chunk carries.
#[derive(Debug, Clone)]
pub enum ChunkKind {
    /// A locally originated request.
    Request,
    /// A reply to a request from the peer.
    Response,
    /// A faulted reply; writing it ends the session.
    Fault(Fault),
}

/// One encoded message waiting for the write pump.
///
/// Completes exactly once: either [`complete`](Self::complete) after the
/// bytes were written, or [`cancel`](Self::cancel). Both return the payload
/// segment to the pool.
#[derive(Debug)]
pub struct OutboundChunk {
    pub(crate) request_id: i64,
    pub(crate) kind: ChunkKind,
    pub(crate) data_type: &'static str,
    pub(crate) header: Bytes,
    pub(crate) payload: Segment,
    done: Option<oneshot::Sender<Result<()>>>,
}

impl OutboundChunk {
    /// Create a chunk and the receiver that resolves when it is consumed.
    pub fn new(
        request_id: i64,
        kind: ChunkKind,
        data_type: &'static str,
        header: Bytes,
        payload: Segment,
    ) -> (Self, oneshot::Receiver<Result<()>>) {
        let (tx, rx) = oneshot::channel();
        let chunk = Self {
            request_id,
            kind,
            data_type,
            header,
            payload,
            done: Some(tx),
        };
        (chunk, rx)
    }

    /// Payload bytes, the unit the frame budget is measured in.
    #[inline]
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Header record plus payload, as declared in the frame header.
    #[inline]
    pub fn wire_len(&self) -> usize {
        self.header.len() + self.payload.len()
    }

    #[inline]
    pub fn request_id(&self) -> i64 {
        self.request_id
    }

    /// Mark the chunk written and release its segment.
    pub fn complete(mut self, pool: &BufferPool) {
        self.finish(Ok(()), pool);
    }

    /// Fail the chunk and release its segment.
    pub fn cancel(mut self, err: FramewireError, pool: &BufferPool) {
        self.finish(Err(err), pool);
    }

    fn finish(&mut self, outcome: Result<()>, pool: &BufferPool) {
        if let Some(done) = self.done.take() {
            // the sender may have given up waiting; nothing left to notify
            let _ = done.send(outcome);
        }
        pool.free(std::mem::take(&mut self.payload));
    }
}

/// Bucketed queue of outbound chunks.
pub struct RequestQueue {
    buckets: Vec<Mutex<VecDeque<OutboundChunk>>>,
    notify: Notify,
    closed: AtomicBool,
}

impl RequestQueue {
    /// Create a queue with `buckets` aging levels (at least one).
    pub fn new(buckets: usize) -> Self {
        Self {
            buckets: (0..buckets.max(1))
                .map(|_| Mutex::new(VecDeque::new()))
                .collect(),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Add a chunk to the newest bucket and wake the write pump.
    ///
    /// Hands the chunk back if the queue was already cancelled.
    pub fn enqueue(&self, chunk: OutboundChunk) -> std::result::Result<(), OutboundChunk> {
        {
            let mut newest = self.buckets[0].lock();
            if self.closed.load(Ordering::SeqCst) {
                return Err(chunk);
            }
            newest.push_back(chunk);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Future that resolves after the next `enqueue`.
    ///
    /// Create it before calling [`take_frame`](Self::take_frame) so a chunk
    /// enqueued in between is not missed.
    pub fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }

    /// Total number of queued chunks.
    pub fn count(&self) -> usize {
        self.buckets.iter().map(|b| b.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Select the chunks for the next frame.
    ///
    /// Returns an empty vector if nothing is queued.
    ///
    /// # Errors
    ///
    /// Returns `FrameOverflow` if the chunk at the head of the queue alone
    /// exceeds `max_payload`. That chunk is failed with the same error.
    pub fn take_frame(&self, max_payload: usize, pool: &BufferPool) -> Result<Vec<OutboundChunk>> {
        let last = self.buckets.len() - 1;
        let mut selected: Vec<OutboundChunk> = Vec::new();
        let mut used = 0usize;
        let mut full = false;

        for level in (0..=last).rev() {
            let drained = std::mem::take(&mut *self.buckets[level].lock());
            if drained.is_empty() {
                continue;
            }

            let mut skipped = Vec::new();
            let mut chunks = drained.into_iter();
            while let Some(chunk) = chunks.next() {
                if full {
                    skipped.push(chunk);
                    continue;
                }

                let len = chunk.payload_len();
                if selected.is_empty() && len > max_payload {
                    // put back everything behind it before failing
                    let rest: Vec<_> = chunks.by_ref().collect();
                    self.requeue(level, level, rest);
                    let overflow = || FramewireError::FrameOverflow {
                        size: len,
                        max: max_payload,
                    };
                    chunk.cancel(overflow(), pool);
                    return Err(overflow());
                }

                if used + len <= max_payload {
                    used += len;
                    selected.push(chunk);
                } else {
                    full = true;
                    skipped.push(chunk);
                }
            }

            self.requeue(level, level + 1, skipped);
        }

        Ok(selected)
    }

    /// Move chunks drained from bucket `from` into bucket `min(to, last)`.
    ///
    /// Chunks aged into an older bucket go behind what is already there
    /// (those are older still). Chunks returned to their own bucket go in
    /// front, ahead of anything enqueued meanwhile.
    fn requeue(&self, from: usize, to: usize, chunks: Vec<OutboundChunk>) {
        if chunks.is_empty() {
            return;
        }
        let dest = to.min(self.buckets.len() - 1);
        let mut bucket = self.buckets[dest].lock();
        if dest == from {
            for chunk in chunks.into_iter().rev() {
                bucket.push_front(chunk);
            }
        } else {
            bucket.extend(chunks);
        }
    }

    /// Fail every queued chunk and refuse further enqueues.
    ///
    /// Loops until all buckets are observed empty. Returns the number of
    /// chunks cancelled.
    pub fn cancel_all(&self, reason: CloseReason, pool: &BufferPool) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        let mut cancelled = 0;
        loop {
            let mut found = false;
            for bucket in &self.buckets {
                let drained = std::mem::take(&mut *bucket.lock());
                for chunk in drained {
                    found = true;
                    cancelled += 1;
                    chunk.cancel(reason.to_error(), pool);
                }
            }
            if !found {
                break;
            }
        }
        self.notify.notify_waiters();
        cancelled
    }
}

impl Default for RequestQueue {
    fn default() -> Self {
        Self::new(DEFAULT_REQUEST_BUCKETS)
    }
}
