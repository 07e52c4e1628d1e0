//! Request id to reply waiter.
//!
//! [`PendingResponses::create`] registers an entry and returns a
//! [`ResponseHandle`], the only way to receive that reply. A handle that is
//! dropped, or whose caller gives up, removes its entry right away and
//! leaves its id in a bounded list of abandoned requests. A reply that
//! arrives for one of those is discarded with a warning.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::{CloseReason, FramewireError, Result};
use crate::protocol::InboundMessage;

/// How many abandoned request ids are remembered for late replies.
pub const MAX_ABANDONED_REPLIES: usize = 1024;

type ReplySender = oneshot::Sender<Result<InboundMessage>>;

#[derive(Default)]
struct Table {
    entries: DashMap<i64, ReplySender>,
    abandoned: Mutex<VecDeque<i64>>,
}

impl Table {
    fn abandon(&self, request_id: i64) {
        if self.entries.remove(&request_id).is_none() {
            return;
        }
        let mut abandoned = self.abandoned.lock();
        if abandoned.len() >= MAX_ABANDONED_REPLIES {
            abandoned.pop_front();
        }
        abandoned.push_back(request_id);
    }

    fn forget_abandoned(&self, request_id: i64) -> bool {
        let mut abandoned = self.abandoned.lock();
        match abandoned.iter().position(|id| *id == request_id) {
            Some(index) => {
                abandoned.remove(index);
                true
            }
            None => false,
        }
    }
}

/// Outstanding locally originated requests.
#[derive(Default)]
pub struct PendingResponses {
    table: Arc<Table>,
}

impl PendingResponses {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for `request_id`.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateRequest` if an entry for the id is still outstanding.
    pub fn create(&self, request_id: i64) -> Result<ResponseHandle> {
        match self.table.entries.entry(request_id) {
            Entry::Occupied(_) => Err(FramewireError::DuplicateRequest(request_id)),
            Entry::Vacant(slot) => {
                let (tx, rx) = oneshot::channel();
                slot.insert(tx);
                self.table.forget_abandoned(request_id);
                Ok(ResponseHandle {
                    request_id,
                    rx: Some(rx),
                    table: Arc::downgrade(&self.table),
                })
            }
        }
    }

    /// Deliver a reply and remove the entry.
    ///
    /// # Errors
    ///
    /// Returns `UnknownRequest` if the id was never registered, was already
    /// answered, or was abandoned too long ago to be remembered.
    pub fn complete(&self, message: InboundMessage) -> Result<()> {
        let request_id = message.request_id();
        match self.table.entries.remove(&request_id) {
            Some((_, tx)) => {
                if tx.send(Ok(message)).is_err() {
                    tracing::warn!(request_id, "Reply discarded: response handle was dropped");
                }
                Ok(())
            }
            None if self.table.forget_abandoned(request_id) => {
                tracing::warn!(request_id, "Reply discarded: response handle was dropped");
                Ok(())
            }
            None => Err(FramewireError::UnknownRequest(request_id)),
        }
    }

    /// Drop an entry without delivering anything.
    pub fn remove(&self, request_id: i64) -> bool {
        self.table.entries.remove(&request_id).is_some()
    }

    pub fn contains(&self, request_id: i64) -> bool {
        self.table.entries.contains_key(&request_id)
    }

    /// Outstanding entries, not counting abandoned ones.
    pub fn len(&self) -> usize {
        self.table.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.entries.is_empty()
    }

    /// Number of abandoned ids still remembered.
    pub fn abandoned_count(&self) -> usize {
        self.table.abandoned.lock().len()
    }

    /// Fail every outstanding waiter with the close reason.
    pub fn cancel_all(&self, reason: CloseReason) -> usize {
        self.table.abandoned.lock().clear();
        let mut cancelled = 0;
        loop {
            let ids: Vec<i64> = self.table.entries.iter().map(|e| *e.key()).collect();
            if ids.is_empty() {
                break;
            }
            for id in ids {
                if let Some((_, tx)) = self.table.entries.remove(&id) {
                    cancelled += 1;
                    let _ = tx.send(Err(reason.to_error()));
                }
            }
        }
        cancelled
    }
}

/// Single-consumption handle for one reply.
///
/// Dropping it before the reply was received logs a warning and abandons
/// the request.
#[derive(Debug)]
pub struct ResponseHandle {
    request_id: i64,
    rx: Option<oneshot::Receiver<Result<InboundMessage>>>,
    table: Weak<Table>,
}

impl ResponseHandle {
    pub fn request_id(&self) -> i64 {
        self.request_id
    }

    /// Remove the entry without the abandoned-handle warning.
    ///
    /// For requests that never made it onto the wire.
    pub(crate) fn dismiss(mut self) {
        self.rx.take();
        if let Some(table) = self.table.upgrade() {
            table.entries.remove(&self.request_id);
        }
    }

    /// Wait for the reply.
    ///
    /// # Errors
    ///
    /// - `Cancelled` if `caller` fires first (the request is abandoned and
    ///   a late reply is discarded)
    /// - the session's close reason if it is torn down first
    pub async fn recv(mut self, caller: &CancellationToken) -> Result<InboundMessage> {
        let Some(rx) = self.rx.take() else {
            return Err(FramewireError::ConnectionClosed);
        };

        tokio::select! {
            biased;
            reply = rx => reply.unwrap_or(Err(FramewireError::ConnectionClosed)),
            _ = caller.cancelled() => {
                self.abandon();
                Err(FramewireError::Cancelled)
            }
        }
    }

    fn abandon(&self) {
        if let Some(table) = self.table.upgrade() {
            table.abandon(self.request_id);
        }
    }
}

impl Drop for ResponseHandle {
    fn drop(&mut self) {
        if self.rx.is_some() {
            tracing::warn!(
                request_id = self.request_id,
                "Response handle dropped without receiving the reply"
            );
            self.abandon();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageHeader;
    use bytes::Bytes;

    fn reply(request_id: i64) -> InboundMessage {
        InboundMessage::new(
            MessageHeader {
                request_id,
                is_response: true,
                data_type: "Reply".to_string(),
                data_size: 2,
                ..Default::default()
            },
            Bytes::from_static(b"ok"),
        )
    }

    #[tokio::test]
    async fn test_create_and_complete() {
        let pending = PendingResponses::new();
        let handle = pending.create(7).unwrap();
        assert!(pending.contains(7));

        pending.complete(reply(7)).unwrap();
        assert!(pending.is_empty());

        let message = handle.recv(&CancellationToken::new()).await.unwrap();
        assert_eq!(message.request_id(), 7);
        assert_eq!(&message.payload[..], b"ok");
    }

    #[test]
    fn test_duplicate_outstanding_id() {
        let pending = PendingResponses::new();
        let _first = pending.create(1).unwrap();

        assert!(matches!(
            pending.create(1),
            Err(FramewireError::DuplicateRequest(1))
        ));
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn test_id_reusable_after_completion() {
        let pending = PendingResponses::new();
        let _first = pending.create(1).unwrap();
        pending.complete(reply(1)).unwrap();

        assert!(pending.create(1).is_ok());
    }

    #[test]
    fn test_unknown_request() {
        let pending = PendingResponses::new();
        assert!(matches!(
            pending.complete(reply(99)),
            Err(FramewireError::UnknownRequest(99))
        ));
    }

    #[test]
    fn test_abandoned_handle_discards_reply() {
        let pending = PendingResponses::new();
        drop(pending.create(3).unwrap());

        assert!(pending.is_empty(), "dropping the handle removes the entry");
        assert_eq!(pending.abandoned_count(), 1);

        // a late reply is discarded, not a protocol error
        assert!(pending.complete(reply(3)).is_ok());
        assert_eq!(pending.abandoned_count(), 0);

        // but only once
        assert!(matches!(
            pending.complete(reply(3)),
            Err(FramewireError::UnknownRequest(3))
        ));
    }

    #[test]
    fn test_abandoned_ids_are_bounded() {
        let pending = PendingResponses::new();
        let total = MAX_ABANDONED_REPLIES as i64 + 10;
        for id in 0..total {
            drop(pending.create(id).unwrap());
        }

        assert!(pending.is_empty());
        assert_eq!(pending.abandoned_count(), MAX_ABANDONED_REPLIES);
        assert!(matches!(
            pending.complete(reply(0)),
            Err(FramewireError::UnknownRequest(0))
        ));
        assert!(pending.complete(reply(total - 1)).is_ok());
    }

    #[test]
    fn test_dismissed_handle_leaves_no_trace() {
        let pending = PendingResponses::new();
        pending.create(8).unwrap().dismiss();

        assert!(pending.is_empty());
        assert_eq!(pending.abandoned_count(), 0);
        assert!(matches!(
            pending.complete(reply(8)),
            Err(FramewireError::UnknownRequest(8))
        ));
    }

    #[tokio::test]
    async fn test_cancel_all_fails_waiters() {
        let pending = PendingResponses::new();
        let a = pending.create(1).unwrap();
        let b = pending.create(2).unwrap();

        assert_eq!(pending.cancel_all(CloseReason::Cancelled), 2);
        assert_eq!(pending.cancel_all(CloseReason::Cancelled), 0);

        let token = CancellationToken::new();
        assert!(matches!(a.recv(&token).await, Err(FramewireError::Cancelled)));
        assert!(matches!(b.recv(&token).await, Err(FramewireError::Cancelled)));
    }

    #[tokio::test]
    async fn test_recv_respects_caller_token() {
        let pending = PendingResponses::new();
        let handle = pending.create(4).unwrap();
        let token = CancellationToken::new();
        token.cancel();

        assert!(matches!(
            handle.recv(&token).await,
            Err(FramewireError::Cancelled)
        ));
        assert!(!pending.contains(4));
        assert!(pending.complete(reply(4)).is_ok());
    }
}
