//! Results handed to callers of the transport API.
//!
//! - [`MessageResult`]: metadata of one request or reply, plus the ability
//!   to answer a request that came from the peer
//! - [`TypedResult`]: a `MessageResult` with its decoded payload
//! - [`RequestResult`]: what `send_data` returns; owns the single handle
//!   through which the correlated reply is received
//! - [`Fault`] / [`FaultException`]: a typed rejection that ends the session

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::session::Shared;
use crate::buffers::{ChunkKind, ResponseHandle};
use crate::codec::MsgPackCodec;
use crate::error::{FramewireError, Result};
use crate::protocol::{InboundMessage, MessageType};

/// Which side raised a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOrigin {
    /// This side rejected a request from the peer.
    Local,
    /// The peer rejected one of our requests.
    Remote,
}

/// An application-level rejection of a request.
///
/// The payload stays encoded; decode it with [`Fault::decode`] into the
/// type the responder used.
#[derive(Debug, Clone)]
pub struct Fault {
    request_id: i64,
    data_type: String,
    payload: Bytes,
    origin: FaultOrigin,
}

impl Fault {
    pub(crate) fn new(request_id: i64, data_type: &str, payload: Bytes, origin: FaultOrigin) -> Self {
        Self {
            request_id,
            data_type: data_type.to_string(),
            payload,
            origin,
        }
    }

    pub(crate) fn from_message(message: &InboundMessage) -> Self {
        Self::new(
            message.request_id(),
            message.data_type(),
            message.payload.clone(),
            FaultOrigin::Remote,
        )
    }

    /// Id of the request that was rejected.
    pub fn request_id(&self) -> i64 {
        self.request_id
    }

    /// Type name of the fault payload.
    pub fn data_type(&self) -> &str {
        &self.data_type
    }

    /// Encoded fault payload.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn origin(&self) -> FaultOrigin {
        self.origin
    }

    /// Decode the fault payload.
    pub fn decode<F: DeserializeOwned>(&self) -> Result<F> {
        MsgPackCodec::decode(&self.payload)
    }

    /// Decode into a typed exception.
    pub fn into_exception<F: DeserializeOwned>(self) -> Result<FaultException<F>> {
        Ok(FaultException {
            fault: self.decode()?,
            request_id: self.request_id,
        })
    }
}

impl PartialEq for Fault {
    /// Two faults are equal when they describe the same rejection,
    /// regardless of which side observed it.
    fn eq(&self, other: &Self) -> bool {
        self.request_id == other.request_id
            && self.data_type == other.data_type
            && self.payload == other.payload
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} fault {} on request {}",
            self.origin, self.data_type, self.request_id
        )
    }
}

/// A typed fault value together with the request it rejected.
#[derive(Debug, Clone, PartialEq)]
pub struct FaultException<F> {
    pub fault: F,
    pub request_id: i64,
}

impl<F: fmt::Debug> fmt::Display for FaultException<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "request {} faulted: {:?}", self.request_id, self.fault)
    }
}

impl<F: fmt::Debug> std::error::Error for FaultException<F> {}

/// One request or reply seen by this side of the session.
///
/// Clones share one answer: a request from the peer can be answered once,
/// through any clone.
#[derive(Clone)]
pub struct MessageResult {
    request_id: i64,
    is_remote: bool,
    is_response: bool,
    answered: Arc<AtomicBool>,
    transport: Weak<Shared>,
}

impl MessageResult {
    pub(crate) fn new(request_id: i64, is_remote: bool, is_response: bool, transport: Weak<Shared>) -> Self {
        Self {
            request_id,
            is_remote,
            is_response,
            answered: Arc::new(AtomicBool::new(false)),
            transport,
        }
    }

    pub fn request_id(&self) -> i64 {
        self.request_id
    }

    /// Did this message originate from the peer?
    pub fn is_remote(&self) -> bool {
        self.is_remote
    }

    pub fn is_response(&self) -> bool {
        self.is_response
    }

    fn answerable(&self) -> Result<Arc<Shared>> {
        if !self.is_remote || self.is_response {
            return Err(FramewireError::Protocol(format!(
                "Request {} cannot be answered from this side",
                self.request_id
            )));
        }
        let shared = self
            .transport
            .upgrade()
            .ok_or(FramewireError::ConnectionClosed)?;
        if self.answered.swap(true, Ordering::AcqRel) {
            return Err(FramewireError::Protocol(format!(
                "Request {} was already answered",
                self.request_id
            )));
        }
        Ok(shared)
    }

    /// Has a reply or fault been sent for this request?
    pub fn is_answered(&self) -> bool {
        self.answered.load(Ordering::Acquire)
    }

    /// Send `payload` as the reply to this request.
    ///
    /// Resolves once the write pump has consumed the reply.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if this result is not a request from the
    /// peer or was already answered.
    pub async fn respond<T: MessageType + Serialize + ?Sized>(&self, payload: &T) -> Result<()> {
        let shared = self.answerable()?;
        let done = shared.enqueue_message(
            self.request_id,
            ChunkKind::Response,
            T::TYPE_NAME,
            payload,
        )?;
        shared.await_written(done).await
    }

    /// Reject this request with a typed fault instead of replying.
    ///
    /// The fault is written after everything queued before it, then both
    /// sides observe it through `on_fault()` and the session closes.
    /// Returns the fault as a [`FaultException`] so the caller can decide
    /// how to surface it locally.
    pub async fn fault<F: MessageType + Serialize>(&self, fault: F) -> Result<FaultException<F>> {
        let shared = self.answerable()?;
        let data_type = F::TYPE_NAME;
        let encoded = Bytes::from(MsgPackCodec::encode(&fault)?);
        let local = Fault::new(self.request_id, data_type, encoded.clone(), FaultOrigin::Local);

        let done = shared.enqueue_encoded(
            self.request_id,
            ChunkKind::Fault(local),
            data_type,
            &encoded,
        )?;
        shared.await_written(done).await?;

        Ok(FaultException {
            fault,
            request_id: self.request_id,
        })
    }
}

impl fmt::Debug for MessageResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageResult")
            .field("request_id", &self.request_id)
            .field("is_remote", &self.is_remote)
            .field("is_response", &self.is_response)
            .finish()
    }
}

/// A [`MessageResult`] with its decoded payload.
#[derive(Debug, Clone)]
pub struct TypedResult<T> {
    result: MessageResult,
    payload: T,
}

impl<T> TypedResult<T> {
    pub(crate) fn new(result: MessageResult, payload: T) -> Self {
        Self { result, payload }
    }

    pub fn payload(&self) -> &T {
        &self.payload
    }

    pub fn into_payload(self) -> T {
        self.payload
    }

    pub fn result(&self) -> &MessageResult {
        &self.result
    }

    pub fn into_parts(self) -> (MessageResult, T) {
        (self.result, self.payload)
    }
}

impl<T> Deref for TypedResult<T> {
    type Target = MessageResult;

    fn deref(&self) -> &MessageResult {
        &self.result
    }
}

/// A sent request and the handle for its reply.
#[derive(Debug)]
pub struct RequestResult {
    result: MessageResult,
    response: ResponseHandle,
}

impl RequestResult {
    pub(crate) fn new(result: MessageResult, response: ResponseHandle) -> Self {
        Self { result, response }
    }

    pub fn request_id(&self) -> i64 {
        self.result.request_id()
    }

    pub fn result(&self) -> &MessageResult {
        &self.result
    }

    /// Wait for the reply and decode it as `T`.
    ///
    /// # Errors
    ///
    /// - `Fault` if the peer rejected the request
    /// - `Cancelled` / `ConnectionClosed` if the session ended first
    pub async fn receive_data<T: DeserializeOwned>(self) -> Result<TypedResult<T>> {
        self.receive_data_with(&CancellationToken::new()).await
    }

    /// Like [`receive_data`](Self::receive_data), giving up when `token` fires.
    pub async fn receive_data_with<T: DeserializeOwned>(
        self,
        token: &CancellationToken,
    ) -> Result<TypedResult<T>> {
        let RequestResult { result, response } = self;
        let message = response.recv(token).await?;

        if message.is_faulted() {
            return Err(FramewireError::Fault(Fault::from_message(&message)));
        }

        let payload = MsgPackCodec::decode(&message.payload)?;
        let reply = MessageResult::new(message.request_id(), true, true, result.transport);
        Ok(TypedResult::new(reply, payload))
    }
}
