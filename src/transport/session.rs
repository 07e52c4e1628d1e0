//! Session state shared between the public handle, the pumps and results.

use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::OnceLock;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::config::TransportConfig;
use super::result::Fault;
use crate::buffers::{ChunkKind, OutboundChunk, PendingResponses, RequestQueue, ResponseBuffer};
use crate::error::{CloseReason, FramewireError, Result};
use crate::pool::{BufferPool, Segment};
use crate::protocol::{record_to_bytes, MessageHeader};

/// Which end of the connection a transport was built as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum SessionState {
    Created = 0,
    Opening = 1,
    Open = 2,
    Closed = 3,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Created,
            1 => SessionState::Opening,
            2 => SessionState::Open,
            _ => SessionState::Closed,
        }
    }
}

pub(crate) struct Shared {
    pub(crate) role: Role,
    pub(crate) config: TransportConfig,
    state: AtomicU8,
    /// Child of the caller's token; cancelled on teardown.
    pub(crate) token: CancellationToken,
    /// Cancelled once teardown has finished.
    closed: CancellationToken,
    close_reason: OnceLock<CloseReason>,
    fault: watch::Sender<Option<Fault>>,
    next_request_id: AtomicI64,
    pub(crate) pool: BufferPool,
    pub(crate) requests: RequestQueue,
    pub(crate) responses: ResponseBuffer,
    pub(crate) pending: PendingResponses,
    pub(crate) pumps: Mutex<Vec<JoinHandle<()>>>,
}

impl Shared {
    pub(crate) fn new(role: Role, config: TransportConfig, parent: &CancellationToken) -> Self {
        let (fault, _) = watch::channel(None);
        Self {
            role,
            state: AtomicU8::new(SessionState::Created as u8),
            token: parent.child_token(),
            closed: CancellationToken::new(),
            close_reason: OnceLock::new(),
            fault,
            next_request_id: AtomicI64::new(1),
            pool: BufferPool::new(config.buffer_pool_size),
            requests: RequestQueue::new(config.request_buckets),
            responses: ResponseBuffer::new(config.response_buffer_size),
            pending: PendingResponses::new(),
            pumps: Mutex::new(Vec::new()),
            config,
        }
    }

    pub(crate) fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Move from `from` to `to`; fails if the session is elsewhere.
    pub(crate) fn transition(&self, from: SessionState, to: SessionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn is_open(&self) -> bool {
        self.state() == SessionState::Open && !self.token.is_cancelled()
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        match self.state() {
            SessionState::Created | SessionState::Opening => Err(FramewireError::NotOpen),
            SessionState::Closed => Err(self.closed_error()),
            SessionState::Open if self.token.is_cancelled() => Err(self.closed_error()),
            SessionState::Open => Ok(()),
        }
    }

    pub(crate) fn next_request_id(&self) -> i64 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.get().copied()
    }

    /// Error for operations that find the session torn down.
    pub(crate) fn closed_error(&self) -> FramewireError {
        self.close_reason()
            .unwrap_or(CloseReason::Cancelled)
            .to_error()
    }

    /// Encode `payload` into a pooled segment and queue it for the write pump.
    pub(crate) fn enqueue_message<T: Serialize + ?Sized>(
        &self,
        request_id: i64,
        kind: ChunkKind,
        data_type: &'static str,
        payload: &T,
    ) -> Result<oneshot::Receiver<Result<()>>> {
        let segment = self.pool.encode(payload)?;
        self.enqueue_segment(request_id, kind, data_type, segment)
    }

    /// Queue an already encoded payload.
    pub(crate) fn enqueue_encoded(
        &self,
        request_id: i64,
        kind: ChunkKind,
        data_type: &'static str,
        encoded: &[u8],
    ) -> Result<oneshot::Receiver<Result<()>>> {
        let mut segment = self.pool.allocate(encoded.len());
        segment.buf_mut().extend_from_slice(encoded);
        self.enqueue_segment(request_id, kind, data_type, segment)
    }

    fn enqueue_segment(
        &self,
        request_id: i64,
        kind: ChunkKind,
        data_type: &'static str,
        segment: Segment,
    ) -> Result<oneshot::Receiver<Result<()>>> {
        let (chunk, done) = self.build_chunk(request_id, kind, data_type, segment)?;
        match self.requests.enqueue(chunk) {
            Ok(()) => Ok(done),
            Err(chunk) => {
                let err = self.closed_error();
                chunk.cancel(self.closed_error(), &self.pool);
                Err(err)
            }
        }
    }

    fn build_chunk(
        &self,
        request_id: i64,
        kind: ChunkKind,
        data_type: &'static str,
        segment: Segment,
    ) -> Result<(OutboundChunk, oneshot::Receiver<Result<()>>)> {
        let header = MessageHeader {
            request_id,
            faulted: matches!(kind, ChunkKind::Fault(_)),
            is_response: !matches!(kind, ChunkKind::Request),
            data_type: data_type.to_string(),
            data_size: segment.len() as u64,
        };
        let header: Bytes = match record_to_bytes(&header) {
            Ok(header) => header,
            Err(err) => {
                self.pool.free(segment);
                return Err(err);
            }
        };
        Ok(OutboundChunk::new(request_id, kind, data_type, header, segment))
    }

    /// Wait until the write pump has consumed a chunk.
    pub(crate) async fn await_written(&self, done: oneshot::Receiver<Result<()>>) -> Result<()> {
        tokio::select! {
            biased;
            outcome = done => outcome.unwrap_or(Err(FramewireError::ConnectionClosed)),
            _ = self.token.cancelled() => Err(self.closed_error()),
        }
    }

    /// Raise a fault: publish it, then tear the session down.
    ///
    /// Only the first fault of a session is published.
    pub(crate) fn raise_fault(&self, fault: Fault) {
        let published = self.fault.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(fault.clone());
            true
        });
        if published {
            tracing::warn!(role = ?self.role, "Session faulted: {}", fault);
        }
        self.shutdown(CloseReason::Faulted);
    }

    /// Resolve with the session's fault, or fail once it closes without one.
    pub(crate) async fn on_fault(&self) -> Result<Fault> {
        let mut rx = self.fault.subscribe();
        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(fault) = current {
                return Ok(fault);
            }
            if self.closed.is_cancelled() {
                return Err(FramewireError::Cancelled);
            }
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(FramewireError::Cancelled);
                    }
                }
                _ = self.closed.cancelled() => {}
            }
        }
    }

    /// Tear the session down once; later calls are no-ops.
    ///
    /// Every pending operation is failed with `reason`'s error.
    pub(crate) fn shutdown(&self, reason: CloseReason) {
        let reason = *self.close_reason.get_or_init(|| reason);
        let previous = self.state.swap(SessionState::Closed as u8, Ordering::SeqCst);
        if previous == SessionState::Closed as u8 {
            return;
        }
        let requests = self.requests.cancel_all(reason, &self.pool);
        let responses = self.responses.cancel_all(reason);
        let pending = self.pending.cancel_all(reason);
        self.token.cancel();
        let flushed = self.pool.flush();

        tracing::debug!(
            role = ?self.role,
            ?reason,
            requests,
            responses,
            pending,
            flushed,
            "Session closed"
        );
        self.closed.cancel();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub(crate) async fn wait_closed(&self) {
        self.closed.cancelled().await;
    }
}
