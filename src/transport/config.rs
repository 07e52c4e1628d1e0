//! Transport configuration and builder.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use super::message::{MessageClient, MessageServer};
use crate::backpressure::DEFAULT_BUFFER_SIZE;
use crate::buffers::DEFAULT_REQUEST_BUCKETS;
use crate::pool::DEFAULT_SEGMENT_SIZE;
use crate::protocol::DEFAULT_MAX_FRAME_BYTES;

/// Default payload budget per outbound frame (64 KB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024;

/// Default size of the socket read buffer (64 KB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 64 * 1024;

/// Default interval between buffer pool flushes.
pub const DEFAULT_POOL_FLUSH_INTERVAL: Duration = Duration::from_secs(30);

/// Configuration for one message transport.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Payload bytes per outbound frame. Headers are not counted. A single
    /// message above this limit ends the session.
    pub max_frame_size: usize,
    /// Pause after each written frame. Zero disables pacing.
    pub min_delay: Duration,
    /// Size of freshly allocated encode segments.
    pub buffer_pool_size: usize,
    /// Byte budget for inbound requests no receiver has taken yet.
    pub response_buffer_size: usize,
    /// Aging depth of the outbound queue.
    pub request_buckets: usize,
    /// Size of each read from the byte stream.
    pub read_buffer_size: usize,
    /// Largest inbound frame accepted, headers included.
    pub max_frame_bytes: usize,
    /// How often idle pooled segments are dropped.
    pub pool_flush_interval: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            min_delay: Duration::ZERO,
            buffer_pool_size: DEFAULT_SEGMENT_SIZE,
            response_buffer_size: DEFAULT_BUFFER_SIZE,
            request_buckets: DEFAULT_REQUEST_BUCKETS,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            pool_flush_interval: DEFAULT_POOL_FLUSH_INTERVAL,
        }
    }
}

/// Builder for message clients and servers.
///
/// # Example
///
/// ```ignore
/// let client = TransportBuilder::new()
///     .max_frame_size(16 * 1024)
///     .min_delay(Duration::from_millis(1))
///     .client(stream, token.clone());
/// client.open()?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct TransportBuilder {
    config: TransportConfig,
}

impl TransportBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing configuration.
    pub fn with_config(config: TransportConfig) -> Self {
        Self { config }
    }

    /// Set the payload budget per frame.
    ///
    /// Default: 64 KB
    pub fn max_frame_size(mut self, bytes: usize) -> Self {
        self.config.max_frame_size = bytes;
        self
    }

    /// Set the pause between frames.
    ///
    /// Default: none
    pub fn min_delay(mut self, delay: Duration) -> Self {
        self.config.min_delay = delay;
        self
    }

    /// Set the size of fresh encode segments.
    ///
    /// Default: 64 KB
    pub fn buffer_pool_size(mut self, bytes: usize) -> Self {
        self.config.buffer_pool_size = bytes;
        self
    }

    /// Set the inbound byte budget.
    ///
    /// Default: 16 MB
    pub fn response_buffer_size(mut self, bytes: usize) -> Self {
        self.config.response_buffer_size = bytes;
        self
    }

    /// Set the number of aging buckets in the outbound queue.
    ///
    /// Default: 4
    pub fn request_buckets(mut self, buckets: usize) -> Self {
        self.config.request_buckets = buckets;
        self
    }

    /// Set the read buffer size.
    ///
    /// Default: 64 KB
    pub fn read_buffer_size(mut self, bytes: usize) -> Self {
        self.config.read_buffer_size = bytes;
        self
    }

    /// Set the largest accepted inbound frame.
    ///
    /// Default: 64 MB
    pub fn max_frame_bytes(mut self, bytes: usize) -> Self {
        self.config.max_frame_bytes = bytes;
        self
    }

    /// Set the pool flush interval.
    ///
    /// Default: 30 seconds
    pub fn pool_flush_interval(mut self, interval: Duration) -> Self {
        self.config.pool_flush_interval = interval;
        self
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Build a client over `stream`. Call `open()` to start it.
    pub fn client<S>(self, stream: S, token: CancellationToken) -> MessageClient
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        MessageClient::with_config(stream, token, self.config)
    }

    /// Build a server over `stream`. Call `open()` to start it.
    pub fn server<S>(self, stream: S, token: CancellationToken) -> MessageServer
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        MessageServer::with_config(stream, token, self.config)
    }
}
