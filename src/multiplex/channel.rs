//! Logical byte streams carried by a [`MultiplexedStreamFactory`](super::MultiplexedStreamFactory).

use std::fmt;
use std::future::{poll_fn, Future};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{oneshot, Notify};

use super::factory::FactoryShared;
use crate::error::{CloseReason, FramewireError, Result};

#[derive(Default)]
struct ChannelInner {
    data: BytesMut,
    wakers: Vec<Waker>,
    /// Largest `read_exact` still waiting; the buffer may grow to this.
    wanted: usize,
    closed: Option<CloseReason>,
}

impl ChannelInner {
    fn register(&mut self, waker: &Waker) {
        if !self.wakers.iter().any(|w| w.will_wake(waker)) {
            self.wakers.push(waker.clone());
        }
    }
}

/// Inbound byte queue of one channel.
pub(crate) struct ChannelState {
    id: u32,
    inner: Mutex<ChannelInner>,
    /// Signalled whenever readers consume bytes or ask for more.
    space: Notify,
}

impl ChannelState {
    pub(crate) fn new(id: u32) -> Self {
        Self {
            id,
            inner: Mutex::new(ChannelInner::default()),
            space: Notify::new(),
        }
    }

    /// Wait until the queue holds fewer than `limit` bytes.
    ///
    /// A pending `read_exact` larger than `limit` raises the bound so it
    /// can complete. Returns at once after close.
    pub(crate) async fn wait_for_room(&self, limit: usize) {
        loop {
            let space = self.space.notified();
            tokio::pin!(space);
            space.as_mut().enable();
            {
                let inner = self.inner.lock();
                if inner.closed.is_some() || inner.data.len() < limit.max(inner.wanted) {
                    return;
                }
            }
            space.await;
        }
    }

    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    /// Append bytes from the wire and wake every blocked reader.
    pub(crate) fn append(&self, bytes: &[u8]) {
        let wakers = {
            let mut inner = self.inner.lock();
            if inner.closed.is_some() {
                return;
            }
            inner.data.extend_from_slice(bytes);
            std::mem::take(&mut inner.wakers)
        };
        wakers.into_iter().for_each(Waker::wake);
    }

    /// Stop accepting data. Buffered bytes stay readable.
    pub(crate) fn close(&self, reason: CloseReason) {
        let wakers = {
            let mut inner = self.inner.lock();
            if inner.closed.is_none() {
                inner.closed = Some(reason);
            }
            std::mem::take(&mut inner.wakers)
        };
        wakers.into_iter().for_each(Waker::wake);
        self.space.notify_waiters();
    }

    pub(crate) fn buffered(&self) -> usize {
        self.inner.lock().data.len()
    }

    /// Ready once `out.len()` bytes are buffered; fills `out` completely.
    fn poll_read_exact(&self, cx: &mut Context<'_>, out: &mut [u8]) -> Poll<Result<()>> {
        let mut inner = self.inner.lock();
        if inner.data.len() >= out.len() {
            inner.data.copy_to_slice(out);
            inner.wanted = 0;
            // other readers re-assert what they wait for
            let wakers = std::mem::take(&mut inner.wakers);
            drop(inner);
            wakers.into_iter().for_each(Waker::wake);
            self.space.notify_waiters();
            return Poll::Ready(Ok(()));
        }
        if let Some(reason) = inner.closed {
            return Poll::Ready(Err(reason.to_error()));
        }
        inner.register(cx.waker());
        if out.len() > inner.wanted {
            inner.wanted = out.len();
            drop(inner);
            self.space.notify_waiters();
        }
        Poll::Pending
    }

    /// Ready with whatever is buffered; no bytes after close means EOF.
    fn poll_read_some(&self, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<()> {
        let mut inner = self.inner.lock();
        if !inner.data.is_empty() {
            let n = inner.data.len().min(buf.remaining());
            buf.put_slice(&inner.data[..n]);
            inner.data.advance(n);
            drop(inner);
            self.space.notify_waiters();
            return Poll::Ready(());
        }
        if inner.closed.is_some() {
            return Poll::Ready(());
        }
        inner.register(cx.waker());
        Poll::Pending
    }
}

/// One logical byte stream.
///
/// Handles for the same channel id share one inbound queue: bytes read
/// through one handle are gone for every other handle.
///
/// Besides the fixed-size [`read_exact`](Self::read_exact) /
/// [`write_all`](Self::write_all) pair, the stream implements tokio's
/// `AsyncRead` and `AsyncWrite`, so a message transport can run over it.
/// Channels carry no end-of-stream marker; a reader sees EOF only when the
/// factory itself closes.
pub struct ChannelStream {
    state: Arc<ChannelState>,
    factory: Arc<FactoryShared>,
    pending_write: Option<(usize, oneshot::Receiver<Result<()>>)>,
}

impl ChannelStream {
    pub(crate) fn new(state: Arc<ChannelState>, factory: Arc<FactoryShared>) -> Self {
        Self {
            state,
            factory,
            pending_write: None,
        }
    }

    pub fn channel_id(&self) -> u32 {
        self.state.id()
    }

    /// Bytes received but not read yet.
    pub fn buffered(&self) -> usize {
        self.state.buffered()
    }

    /// Wait until `buf.len()` bytes have arrived on this channel, then
    /// fill `buf` with them.
    ///
    /// # Errors
    ///
    /// Fails with the factory's close reason if it closes first.
    pub async fn read_exact(&self, buf: &mut [u8]) -> Result<()> {
        poll_fn(|cx| self.state.poll_read_exact(cx, buf)).await
    }

    /// Send `buf` as one chunk and wait until the factory has written it.
    pub async fn write_all(&self, buf: &[u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let done = self
            .factory
            .submit(self.state.id(), Bytes::copy_from_slice(buf))?;
        done.await.unwrap_or(Err(FramewireError::ConnectionClosed))
    }

    fn poll_pending_write(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<usize>> {
        let Some((len, done)) = self.pending_write.as_mut() else {
            return Poll::Ready(Ok(0));
        };
        let len = *len;
        let outcome = match Pin::new(done).poll(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Ok(outcome)) => outcome,
            Poll::Ready(Err(_)) => Err(FramewireError::ConnectionClosed),
        };
        self.pending_write = None;
        Poll::Ready(outcome.map(|()| len).map_err(io::Error::from))
    }
}

impl Clone for ChannelStream {
    fn clone(&self) -> Self {
        Self::new(self.state.clone(), self.factory.clone())
    }
}

impl fmt::Debug for ChannelStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelStream")
            .field("channel_id", &self.state.id())
            .field("buffered", &self.state.buffered())
            .finish()
    }
}

impl AsyncRead for ChannelStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.state.poll_read_some(cx, buf).map(Ok)
    }
}

impl AsyncWrite for ChannelStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.pending_write.is_none() {
            if buf.is_empty() {
                return Poll::Ready(Ok(0));
            }
            let done = this
                .factory
                .submit(this.state.id(), Bytes::copy_from_slice(buf))?;
            this.pending_write = Some((buf.len(), done));
        }
        this.poll_pending_write(cx)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().poll_pending_write(cx).map_ok(|_| ())
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.poll_flush(cx)
    }
}
