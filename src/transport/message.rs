//! Public session handle: [`MessageTransport`], [`MessageClient`], [`MessageServer`].

use std::fmt;
use std::ops::Deref;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use super::config::{TransportBuilder, TransportConfig};
use super::read_pump::read_pump;
use super::result::{Fault, MessageResult, RequestResult, TypedResult};
use super::session::{Role, SessionState, Shared};
use super::write_pump::write_pump;
use crate::buffers::ChunkKind;
use crate::codec::MsgPackCodec;
use crate::error::{CloseReason, FramewireError, Result};
use crate::protocol::MessageType;

type BoxedReader = Pin<Box<dyn AsyncRead + Send>>;
type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// One side of a message session over a byte stream.
///
/// Owns the stream exclusively. [`open`](Self::open) starts a read pump and
/// a write pump; every other operation talks to them through the shared
/// correlation tables. Dropping the transport cancels the session.
pub struct MessageTransport {
    shared: Arc<Shared>,
    halves: Mutex<Option<(BoxedReader, BoxedWriter)>>,
}

impl MessageTransport {
    /// Wrap `stream`. Nothing is read or written until `open()`.
    ///
    /// The session stops when `token` (or any parent of it) is cancelled.
    pub fn new<S>(role: Role, stream: S, token: CancellationToken, config: TransportConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            shared: Arc::new(Shared::new(role, config, &token)),
            halves: Mutex::new(Some((Box::pin(reader), Box::pin(writer)))),
        }
    }

    /// Start the read and write pumps.
    ///
    /// # Errors
    ///
    /// - `AlreadyOpened` unless the session is freshly created
    /// - `Cancelled` if the token already fired
    pub fn open(&self) -> Result<()> {
        if !self
            .shared
            .transition(SessionState::Created, SessionState::Opening)
        {
            return Err(FramewireError::AlreadyOpened);
        }

        let Some((reader, writer)) = self.halves.lock().take() else {
            return Err(FramewireError::AlreadyOpened);
        };

        if self.shared.token.is_cancelled() {
            self.shared.shutdown(CloseReason::Cancelled);
            return Err(FramewireError::Cancelled);
        }
        if !self
            .shared
            .transition(SessionState::Opening, SessionState::Open)
        {
            return Err(self.shared.closed_error());
        }

        let read = tokio::spawn(read_pump(self.shared.clone(), reader));
        let write = tokio::spawn(write_pump(self.shared.clone(), writer));
        self.shared.pumps.lock().extend([read, write]);

        tracing::debug!(role = ?self.shared.role, "Session opened");
        Ok(())
    }

    /// Open and not yet torn down.
    pub fn is_connection_open(&self) -> bool {
        self.shared.is_open()
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    pub fn config(&self) -> &TransportConfig {
        &self.shared.config
    }

    pub fn max_frame_size(&self) -> usize {
        self.shared.config.max_frame_size
    }

    pub fn min_delay(&self) -> Duration {
        self.shared.config.min_delay
    }

    pub fn buffer_pool_size(&self) -> usize {
        self.shared.config.buffer_pool_size
    }

    pub fn response_buffer_size(&self) -> usize {
        self.shared.config.response_buffer_size
    }

    /// Why the session closed, once it has.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.shared.close_reason()
    }

    /// Send `payload` as a new request.
    ///
    /// Resolves once the request is on the wire. The returned
    /// [`RequestResult`] is the only way to receive the reply.
    pub async fn send_data<T: MessageType + Serialize + ?Sized>(
        &self,
        payload: &T,
    ) -> Result<RequestResult> {
        let request_id = self.shared.next_request_id();
        self.send_request(request_id, payload).await
    }

    pub(crate) async fn send_request<T: MessageType + Serialize + ?Sized>(
        &self,
        request_id: i64,
        payload: &T,
    ) -> Result<RequestResult> {
        let shared = &self.shared;
        shared.ensure_open()?;

        let handle = match shared.pending.create(request_id) {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!("Protocol violation: {}", e);
                shared.shutdown(CloseReason::ProtocolViolation);
                return Err(e);
            }
        };

        let written = match shared.enqueue_message(
            request_id,
            ChunkKind::Request,
            T::TYPE_NAME,
            payload,
        ) {
            Ok(done) => shared.await_written(done).await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            handle.dismiss();
            return Err(e);
        }

        let result = MessageResult::new(request_id, false, false, Arc::downgrade(shared));
        Ok(RequestResult::new(result, handle))
    }

    /// Wait for the next request whose wire name is `T::TYPE_NAME`.
    pub async fn receive_data<T: MessageType + DeserializeOwned>(&self) -> Result<TypedResult<T>> {
        self.receive_data_with(&CancellationToken::new()).await
    }

    /// Like [`receive_data`](Self::receive_data), giving up when `token` fires.
    ///
    /// # Errors
    ///
    /// - `Cancelled` if `token` fires or the session was cancelled
    /// - `ConnectionClosed` if the stream failed
    /// - `BufferTooSmall` if the next request of this type exceeded the
    ///   response buffer
    pub async fn receive_data_with<T: MessageType + DeserializeOwned>(
        &self,
        token: &CancellationToken,
    ) -> Result<TypedResult<T>> {
        let shared = &self.shared;
        shared.ensure_open()?;

        let queued = shared
            .responses
            .dequeue(T::TYPE_NAME, token, &shared.token)
            .await?;
        let message = &queued.message;
        let payload = MsgPackCodec::decode(&message.payload)?;

        let result = MessageResult::new(message.request_id(), true, false, Arc::downgrade(shared));
        Ok(TypedResult::new(result, payload))
    }

    /// Resolve with the fault that ended the session.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` if the session closes without a fault.
    pub async fn on_fault(&self) -> Result<Fault> {
        self.shared.on_fault().await
    }

    /// Cancel the session. Pending operations fail with `Cancelled`.
    pub fn close(&self) {
        self.shared.shutdown(CloseReason::Cancelled);
    }

    /// Wait until the session is torn down and both pumps have exited.
    pub async fn wait_closed(&self) {
        self.shared.wait_closed().await;
        let pumps = std::mem::take(&mut *self.shared.pumps.lock());
        for pump in pumps {
            if let Err(e) = pump.await {
                tracing::error!("Pump task failed: {}", e);
            }
        }
    }
}

impl Drop for MessageTransport {
    fn drop(&mut self) {
        self.shared.shutdown(CloseReason::Cancelled);
    }
}

impl fmt::Debug for MessageTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageTransport")
            .field("role", &self.shared.role)
            .field("open", &self.shared.is_open())
            .field("close_reason", &self.shared.close_reason())
            .finish()
    }
}

/// The connecting side of a session.
#[derive(Debug)]
pub struct MessageClient(MessageTransport);

impl MessageClient {
    /// Client with the default configuration.
    pub fn new<S>(stream: S, token: CancellationToken) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::with_config(stream, token, TransportConfig::default())
    }

    pub fn with_config<S>(stream: S, token: CancellationToken, config: TransportConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self(MessageTransport::new(Role::Client, stream, token, config))
    }

    pub fn builder() -> TransportBuilder {
        TransportBuilder::new()
    }

    pub fn into_inner(self) -> MessageTransport {
        self.0
    }
}

impl Deref for MessageClient {
    type Target = MessageTransport;

    fn deref(&self) -> &MessageTransport {
        &self.0
    }
}

/// The accepting side of a session.
#[derive(Debug)]
pub struct MessageServer(MessageTransport);

impl MessageServer {
    /// Server with the default configuration.
    pub fn new<S>(stream: S, token: CancellationToken) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::with_config(stream, token, TransportConfig::default())
    }

    pub fn with_config<S>(stream: S, token: CancellationToken, config: TransportConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self(MessageTransport::new(Role::Server, stream, token, config))
    }

    pub fn builder() -> TransportBuilder {
        TransportBuilder::new()
    }

    pub fn into_inner(self) -> MessageTransport {
        self.0
    }
}

impl Deref for MessageServer {
    type Target = MessageTransport;

    fn deref(&self) -> &MessageTransport {
        &self.0
    }
}
