//! Write pump: request queue to byte stream.
//!
//! Each iteration takes one frame's worth of chunks from the
//! [`RequestQueue`](crate::buffers::RequestQueue), writes the frame header
//! and every message with one vectored write, then completes the chunks.
//! A frame that carried a faulted reply ends the session once it is on the
//! wire.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

use super::result::Fault;
use super::session::Shared;
use crate::buffers::{ChunkKind, OutboundChunk};
use crate::error::{CloseReason, FramewireError, Result};
use crate::protocol::{record_to_bytes, type_registry, FrameHeader};
use crate::writer::write_parts;

pub(crate) async fn write_pump<W>(shared: Arc<Shared>, mut writer: W)
where
    W: AsyncWrite + Unpin,
{
    tracing::debug!(role = ?shared.role, "Write pump started");

    let reason = match write_loop(&shared, &mut writer).await {
        Ok(reason) => reason,
        Err(FramewireError::Cancelled) => CloseReason::Cancelled,
        Err(e) => {
            if !shared.is_closed() {
                tracing::error!("Write pump error: {}", e);
            }
            CloseReason::from_error(&e)
        }
    };
    shared.shutdown(reason);

    if let Err(e) = writer.shutdown().await {
        tracing::trace!("Write half shutdown failed: {}", e);
    }

    tracing::debug!(role = ?shared.role, "Write pump stopped");
}

/// Runs until cancelled, failed, or a fault was written.
async fn write_loop<W>(shared: &Shared, writer: &mut W) -> Result<CloseReason>
where
    W: AsyncWrite + Unpin,
{
    let config = &shared.config;
    let flush_interval = config.pool_flush_interval.max(Duration::from_millis(1));
    let mut next_flush = Instant::now() + flush_interval;

    loop {
        if Instant::now() >= next_flush {
            shared.pool.flush();
            next_flush = Instant::now() + flush_interval;
        }

        let notified = shared.requests.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let chunks = shared.requests.take_frame(config.max_frame_size, &shared.pool)?;
        if chunks.is_empty() {
            tokio::select! {
                biased;
                _ = shared.token.cancelled() => return Err(FramewireError::Cancelled),
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(next_flush) => {}
            }
            continue;
        }

        if let Some(fault) = write_frame(shared, writer, chunks).await? {
            shared.raise_fault(fault);
            return Ok(CloseReason::Faulted);
        }

        if !config.min_delay.is_zero() {
            tokio::select! {
                biased;
                _ = shared.token.cancelled() => return Err(FramewireError::Cancelled),
                _ = tokio::time::sleep(config.min_delay) => {}
            }
        }
    }
}

/// Write one frame. Returns the first fault it carried, if any.
async fn write_frame<W>(
    shared: &Shared,
    writer: &mut W,
    chunks: Vec<OutboundChunk>,
) -> Result<Option<Fault>>
where
    W: AsyncWrite + Unpin,
{
    let header = FrameHeader {
        message_sizes: chunks.iter().map(|c| c.wire_len() as u64).collect(),
        types: type_registry(chunks.iter().map(|c| c.data_type)),
    };

    let written = match record_to_bytes(&header) {
        Ok(frame_header) => {
            let mut parts: Vec<&[u8]> = Vec::with_capacity(1 + chunks.len() * 2);
            parts.push(&frame_header[..]);
            for chunk in &chunks {
                parts.push(&chunk.header[..]);
                parts.push(&chunk.payload[..]);
            }

            tokio::select! {
                biased;
                _ = shared.token.cancelled() => Err(FramewireError::Cancelled),
                result = write_parts(writer, &parts) => result,
            }
        }
        Err(e) => Err(e),
    };

    if let Err(e) = written {
        let reason = CloseReason::from_error(&e);
        for chunk in chunks {
            chunk.cancel(reason.to_error(), &shared.pool);
        }
        return Err(e);
    }

    tracing::trace!(messages = header.message_sizes.len(), "Frame written");

    let mut fault = None;
    for chunk in chunks {
        if let ChunkKind::Fault(f) = &chunk.kind {
            if fault.is_none() {
                fault = Some(f.clone());
            }
        }
        chunk.complete(&shared.pool);
    }
    Ok(fault)
}
