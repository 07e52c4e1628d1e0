//! Inbound requests waiting for a receiver, grouped by payload type.
//!
//! The read pump calls [`ResponseBuffer::enqueue`] for every inbound
//! request. Each message holds a reservation on the shared byte budget
//! until a caller takes it with [`ResponseBuffer::dequeue`] and drops the
//! [`QueuedResponse`]. When the budget is exhausted `enqueue` suspends the
//! read pump.

use std::collections::VecDeque;
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::backpressure::{BackpressureController, BackpressureGuard};
use crate::error::{CloseReason, FramewireError, Result};
use crate::protocol::InboundMessage;

/// An inbound request handed to a receiver.
///
/// Keeps its share of the response budget until dropped.
#[derive(Debug)]
pub struct QueuedResponse {
    pub message: InboundMessage,
    _reservation: BackpressureGuard,
}

#[derive(Default)]
struct TypeQueue {
    items: Mutex<VecDeque<Result<QueuedResponse>>>,
    notify: Notify,
}

impl TypeQueue {
    fn push(&self, item: Result<QueuedResponse>) {
        self.items.lock().push_back(item);
        self.notify.notify_one();
    }
}

/// Per-type inbound queues with a global byte budget.
pub struct ResponseBuffer {
    queues: DashMap<String, Arc<TypeQueue>>,
    budget: BackpressureController,
    closed: OnceLock<CloseReason>,
}

impl ResponseBuffer {
    /// Create a buffer that admits at most `buffer_size` unclaimed bytes.
    pub fn new(buffer_size: usize) -> Self {
        Self {
            queues: DashMap::new(),
            budget: BackpressureController::new(buffer_size),
            closed: OnceLock::new(),
        }
    }

    /// The shared byte budget.
    pub fn budget(&self) -> &BackpressureController {
        &self.budget
    }

    fn queue(&self, data_type: &str) -> Arc<TypeQueue> {
        if let Some(queue) = self.queues.get(data_type) {
            return queue.clone();
        }
        self.queues
            .entry(data_type.to_string())
            .or_default()
            .clone()
    }

    /// Number of messages waiting for `data_type`.
    pub fn len(&self, data_type: &str) -> usize {
        self.queues
            .get(data_type)
            .map_or(0, |queue| queue.items.lock().len())
    }

    /// Queue an inbound request for its type, waiting for budget if needed.
    ///
    /// A message larger than the whole budget is not an error for the
    /// caller: the receiver of that type gets `BufferTooSmall` instead.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` if `token` fires while waiting for budget.
    pub async fn enqueue(&self, message: InboundMessage, token: &CancellationToken) -> Result<()> {
        let queue = self.queue(message.data_type());

        let reservation = match self.budget.reserve(message.len(), token).await {
            Ok(reservation) => reservation,
            Err(err @ FramewireError::BufferTooSmall { .. }) => {
                tracing::warn!(
                    request_id = message.request_id(),
                    data_type = message.data_type(),
                    "Inbound message rejected: {}",
                    err
                );
                queue.push(Err(err));
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        queue.push(Ok(QueuedResponse {
            message,
            _reservation: reservation,
        }));
        Ok(())
    }

    /// Take the oldest message of `data_type`, waiting until one arrives.
    ///
    /// # Errors
    ///
    /// - `Cancelled` if `caller` fires
    /// - the close reason's error once the session is torn down
    /// - `BufferTooSmall` if the next message of this type was too large
    pub async fn dequeue(
        &self,
        data_type: &str,
        caller: &CancellationToken,
        session: &CancellationToken,
    ) -> Result<QueuedResponse> {
        let queue = self.queue(data_type);

        loop {
            let notified = queue.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(item) = queue.items.lock().pop_front() {
                return item;
            }
            if let Some(reason) = self.closed.get() {
                return Err(reason.to_error());
            }

            tokio::select! {
                biased;
                _ = &mut notified => {}
                _ = caller.cancelled() => return Err(FramewireError::Cancelled),
                _ = session.cancelled() => {
                    let reason = self.closed.get().copied().unwrap_or(CloseReason::Cancelled);
                    return Err(reason.to_error());
                }
            }
        }
    }

    /// Drop every queued message and wake all receivers.
    pub fn cancel_all(&self, reason: CloseReason) -> usize {
        let _ = self.closed.set(reason);
        let mut dropped = 0;
        for entry in self.queues.iter() {
            let queue = entry.value();
            let drained = std::mem::take(&mut *queue.items.lock());
            dropped += drained.len();
            queue.notify.notify_waiters();
        }
        dropped
    }
}
