//! Many logical byte streams over one physical stream.
//!
//! Wire format, repeated until the stream ends:
//!
//! ```text
//! [varint len][MultiplexedDataHeader { channelId, length }][length raw bytes]
//! ```
//!
//! One read pump demultiplexes inbound chunks into per-channel queues; one
//! write pump drains the shared outbound queue in submission order.

use std::collections::VecDeque;
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::channel::{ChannelState, ChannelStream};
use crate::error::{CloseReason, FramewireError, Result};
use crate::protocol::{read_record, record_to_bytes, MultiplexedDataHeader};
use crate::writer::write_parts;

/// Default chunk size for reading channel data (64 KB).
pub const DEFAULT_MUX_READ_BUFFER_SIZE: usize = 64 * 1024;

/// Default cap on unread bytes per channel (1 MB).
pub const DEFAULT_CHANNEL_BUFFER_SIZE: usize = 1024 * 1024;

/// Default number of channels a factory tracks.
pub const DEFAULT_MAX_CHANNELS: usize = 1024;

/// Upper bound for one encoded chunk header.
const MAX_CHUNK_HEADER_SIZE: usize = 64;

/// Multiplexing factory configuration.
#[derive(Debug, Clone)]
pub struct MultiplexConfig {
    /// Largest piece of channel data read from the stream at once.
    pub read_buffer_size: usize,
    /// Unread bytes a channel may hold before the read pump pauses.
    pub channel_buffer_size: usize,
    /// Channels beyond this count opened by the peer are a protocol violation.
    pub max_channels: usize,
}

impl Default for MultiplexConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: DEFAULT_MUX_READ_BUFFER_SIZE,
            channel_buffer_size: DEFAULT_CHANNEL_BUFFER_SIZE,
            max_channels: DEFAULT_MAX_CHANNELS,
        }
    }
}

const CREATED: u8 = 0;
const OPEN: u8 = 1;
const CLOSED: u8 = 2;

struct PendingWrite {
    header: Bytes,
    payload: Bytes,
    done: oneshot::Sender<Result<()>>,
}

pub(crate) struct FactoryShared {
    config: MultiplexConfig,
    state: AtomicU8,
    token: CancellationToken,
    closed: CancellationToken,
    close_reason: OnceLock<CloseReason>,
    channels: DashMap<u32, Arc<ChannelState>>,
    outbound: Mutex<VecDeque<PendingWrite>>,
    notify: Notify,
    pumps: Mutex<Vec<JoinHandle<()>>>,
}

impl FactoryShared {
    fn new(config: MultiplexConfig, parent: &CancellationToken) -> Self {
        Self {
            config,
            state: AtomicU8::new(CREATED),
            token: parent.child_token(),
            closed: CancellationToken::new(),
            close_reason: OnceLock::new(),
            channels: DashMap::new(),
            outbound: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            pumps: Mutex::new(Vec::new()),
        }
    }

    fn closed_error(&self) -> FramewireError {
        self.close_reason
            .get()
            .copied()
            .unwrap_or(CloseReason::Cancelled)
            .to_error()
    }

    /// Channel for inbound data, registering it if the peer opened it.
    fn inbound_channel(&self, id: u32) -> Result<Arc<ChannelState>> {
        if let Some(channel) = self.channels.get(&id) {
            return Ok(channel.value().clone());
        }
        if self.channels.len() >= self.config.max_channels {
            return Err(FramewireError::Protocol(format!(
                "Peer opened channel {} beyond the limit of {} channels",
                id, self.config.max_channels
            )));
        }
        tracing::debug!(channel_id = id, "Channel opened by peer");
        Ok(self.channel(id))
    }

    /// Existing channel, or a fresh one registered under `id`.
    fn channel(&self, id: u32) -> Arc<ChannelState> {
        let channel = self
            .channels
            .entry(id)
            .or_insert_with(|| Arc::new(ChannelState::new(id)))
            .clone();
        if let Some(reason) = self.close_reason.get() {
            channel.close(*reason);
        }
        channel
    }

    /// Queue one chunk for the write pump.
    pub(crate) fn submit(
        &self,
        channel_id: u32,
        payload: Bytes,
    ) -> Result<oneshot::Receiver<Result<()>>> {
        match self.state.load(Ordering::SeqCst) {
            CREATED => return Err(FramewireError::NotOpen),
            CLOSED => return Err(self.closed_error()),
            _ => {}
        }

        let length = u32::try_from(payload.len()).map_err(|_| {
            FramewireError::Protocol(format!(
                "Chunk of {} bytes exceeds the channel chunk limit",
                payload.len()
            ))
        })?;
        let header = record_to_bytes(&MultiplexedDataHeader { channel_id, length })?;

        let (done, rx) = oneshot::channel();
        {
            let mut outbound = self.outbound.lock();
            if self.token.is_cancelled() {
                return Err(self.closed_error());
            }
            outbound.push_back(PendingWrite {
                header,
                payload,
                done,
            });
        }
        self.notify.notify_one();
        Ok(rx)
    }

    fn shutdown(&self, reason: CloseReason) {
        let reason = *self.close_reason.get_or_init(|| reason);
        if self.state.swap(CLOSED, Ordering::SeqCst) == CLOSED {
            return;
        }
        self.token.cancel();

        let failed: Vec<PendingWrite> = self.outbound.lock().drain(..).collect();
        let writes = failed.len();
        for write in failed {
            let _ = write.done.send(Err(reason.to_error()));
        }
        for channel in self.channels.iter() {
            channel.value().close(reason);
        }

        tracing::debug!(?reason, writes, "Multiplexer closed");
        self.closed.cancel();
    }
}

type BoxedReader = Pin<Box<dyn AsyncRead + Send>>;
type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// Splits one byte stream into channels identified by a `u32` id.
///
/// # Example
///
/// ```ignore
/// let factory = MultiplexedStreamFactory::new(tcp_stream, token.clone());
/// factory.open()?;
///
/// let control = factory.create_channel(0);
/// let data = factory.create_channel(1);
/// data.write_all(b"hello").await?;
/// ```
pub struct MultiplexedStreamFactory {
    shared: Arc<FactoryShared>,
    halves: Mutex<Option<(BoxedReader, BoxedWriter)>>,
}

impl MultiplexedStreamFactory {
    pub fn new<S>(stream: S, token: CancellationToken) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::with_config(stream, token, MultiplexConfig::default())
    }

    pub fn with_config<S>(stream: S, token: CancellationToken, config: MultiplexConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            shared: Arc::new(FactoryShared::new(config, &token)),
            halves: Mutex::new(Some((Box::pin(reader), Box::pin(writer)))),
        }
    }

    /// Start the read and write pumps.
    pub fn open(&self) -> Result<()> {
        let shared = &self.shared;
        let Some((reader, writer)) = self.halves.lock().take() else {
            return Err(FramewireError::AlreadyOpened);
        };
        if shared.token.is_cancelled() {
            shared.shutdown(CloseReason::Cancelled);
            return Err(FramewireError::Cancelled);
        }
        if shared
            .state
            .compare_exchange(CREATED, OPEN, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(shared.closed_error());
        }

        let read = tokio::spawn(read_pump(shared.clone(), reader));
        let write = tokio::spawn(write_pump(shared.clone(), writer));
        shared.pumps.lock().extend([read, write]);
        Ok(())
    }

    /// Stream for `channel_id`, created on first use.
    ///
    /// Calling this again with the same id returns a handle to the same
    /// channel, including anything the peer already sent on it.
    pub fn create_channel(&self, channel_id: u32) -> ChannelStream {
        ChannelStream::new(self.shared.channel(channel_id), self.shared.clone())
    }

    /// Number of channels created locally or by inbound data.
    pub fn channel_count(&self) -> usize {
        self.shared.channels.len()
    }

    pub fn is_connection_open(&self) -> bool {
        self.shared.state.load(Ordering::SeqCst) == OPEN && !self.shared.token.is_cancelled()
    }

    pub fn read_buffer_size(&self) -> usize {
        self.shared.config.read_buffer_size
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.shared.close_reason.get().copied()
    }

    /// Close the factory and every channel.
    pub fn close(&self) {
        self.shared.shutdown(CloseReason::Cancelled);
    }

    /// Wait until the factory is closed and both pumps have exited.
    pub async fn wait_closed(&self) {
        self.shared.closed.cancelled().await;
        let pumps = std::mem::take(&mut *self.shared.pumps.lock());
        for pump in pumps {
            if let Err(e) = pump.await {
                tracing::error!("Multiplexer pump failed: {}", e);
            }
        }
    }
}

impl Drop for MultiplexedStreamFactory {
    fn drop(&mut self) {
        self.shared.shutdown(CloseReason::Cancelled);
    }
}

impl fmt::Debug for MultiplexedStreamFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiplexedStreamFactory")
            .field("open", &self.is_connection_open())
            .field("channels", &self.channel_count())
            .field("close_reason", &self.close_reason())
            .finish()
    }
}

async fn read_pump(shared: Arc<FactoryShared>, reader: BoxedReader) {
    let reason = match read_loop(&shared, reader).await {
        Ok(()) => CloseReason::ConnectionClosed,
        Err(e) => {
            if !e.is_cancelled() {
                tracing::error!("Multiplexer read error: {}", e);
            }
            CloseReason::from_error(&e)
        }
    };
    shared.shutdown(reason);
}

async fn read_loop<R>(shared: &FactoryShared, reader: R) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let capacity = shared.config.read_buffer_size.max(1);
    let mut reader = BufReader::with_capacity(capacity, reader);
    let mut chunk = vec![0u8; capacity];

    loop {
        let header = tokio::select! {
            biased;
            _ = shared.token.cancelled() => return Err(FramewireError::Cancelled),
            header = read_record::<MultiplexedDataHeader, _>(&mut reader, MAX_CHUNK_HEADER_SIZE) => header?,
        };
        let Some(header) = header else {
            tracing::debug!("Multiplexed stream closed by peer");
            return Ok(());
        };

        let channel = shared.inbound_channel(header.channel_id)?;
        let limit = shared.config.channel_buffer_size.max(1);
        let mut remaining = header.length as usize;
        while remaining > 0 {
            let want = remaining.min(chunk.len());
            tokio::select! {
                biased;
                _ = shared.token.cancelled() => return Err(FramewireError::Cancelled),
                _ = channel.wait_for_room(limit) => {}
            }
            tokio::select! {
                biased;
                _ = shared.token.cancelled() => return Err(FramewireError::Cancelled),
                read = reader.read_exact(&mut chunk[..want]) => { read?; }
            }
            channel.append(&chunk[..want]);
            remaining -= want;
        }

        tracing::trace!(
            channel_id = header.channel_id,
            length = header.length,
            "Channel data received"
        );
    }
}

async fn write_pump(shared: Arc<FactoryShared>, mut writer: BoxedWriter) {
    let reason = match write_loop(&shared, &mut writer).await {
        Ok(()) => CloseReason::Cancelled,
        Err(e) => {
            if !e.is_cancelled() {
                tracing::error!("Multiplexer write error: {}", e);
            }
            CloseReason::from_error(&e)
        }
    };
    shared.shutdown(reason);

    if let Err(e) = writer.shutdown().await {
        tracing::trace!("Write half shutdown failed: {}", e);
    }
}

async fn write_loop<W>(shared: &FactoryShared, writer: &mut W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let notified = shared.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let batch: Vec<PendingWrite> = shared.outbound.lock().drain(..).collect();
        if batch.is_empty() {
            tokio::select! {
                biased;
                _ = shared.token.cancelled() => return Err(FramewireError::Cancelled),
                _ = &mut notified => {}
            }
            continue;
        }

        let mut parts: Vec<&[u8]> = Vec::with_capacity(batch.len() * 2);
        for write in &batch {
            parts.push(&write.header[..]);
            parts.push(&write.payload[..]);
        }
        let written = tokio::select! {
            biased;
            _ = shared.token.cancelled() => Err(FramewireError::Cancelled),
            result = write_parts(writer, &parts) => result,
        };
        drop(parts);

        let outcome = written.as_ref().map_err(CloseReason::from_error);
        for write in batch {
            let _ = write
                .done
                .send(outcome.map(|_| ()).map_err(CloseReason::to_error));
        }
        written?;
    }
}
