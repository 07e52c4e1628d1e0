//! Read pump: byte stream to correlation tables.
//!
//! Parses frames with [`FrameBuffer`] and routes every message:
//!
//! - replies complete the waiter registered under their request id; a reply
//!   nobody waits for is a protocol violation
//! - a faulted reply is delivered to its waiter, then ends the session
//! - requests from the peer go to the per-type inbound buffer, suspending
//!   the pump while the byte budget is exhausted

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt};

use super::result::Fault;
use super::session::Shared;
use crate::error::{CloseReason, FramewireError, Result};
use crate::protocol::{FrameBuffer, InboundMessage};

pub(crate) async fn read_pump<R>(shared: Arc<Shared>, mut reader: R)
where
    R: AsyncRead + Unpin,
{
    tracing::debug!(role = ?shared.role, "Read pump started");

    let reason = match read_loop(&shared, &mut reader).await {
        Ok(()) => CloseReason::ConnectionClosed,
        Err(FramewireError::Cancelled) => CloseReason::Cancelled,
        Err(e) => {
            if !shared.is_closed() {
                tracing::error!("Read pump error: {}", e);
            }
            CloseReason::from_error(&e)
        }
    };
    shared.shutdown(reason);

    tracing::debug!(role = ?shared.role, "Read pump stopped");
}

/// Returns `Ok(())` on end of stream.
async fn read_loop<R>(shared: &Shared, reader: &mut R) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut frames = FrameBuffer::with_max_frame_bytes(shared.config.max_frame_bytes);
    let mut buf = vec![0u8; shared.config.read_buffer_size.max(1)];

    loop {
        let n = tokio::select! {
            biased;
            _ = shared.token.cancelled() => return Err(FramewireError::Cancelled),
            read = reader.read(&mut buf) => read?,
        };

        if n == 0 {
            if !frames.is_empty() {
                tracing::warn!(
                    buffered = frames.len(),
                    "Connection closed in the middle of a frame"
                );
            } else {
                tracing::debug!("Connection closed by peer");
            }
            return Ok(());
        }

        for frame in frames.push(&buf[..n])? {
            tracing::trace!(messages = frame.messages.len(), "Frame received");
            for message in frame.messages {
                if shared.token.is_cancelled() {
                    return Err(FramewireError::Cancelled);
                }
                dispatch(shared, message).await?;
            }
        }
    }
}

async fn dispatch(shared: &Shared, message: InboundMessage) -> Result<()> {
    if message.is_response() {
        let fault = message.is_faulted().then(|| Fault::from_message(&message));
        shared.pending.complete(message)?;
        if let Some(fault) = fault {
            shared.raise_fault(fault);
        }
        return Ok(());
    }

    if message.is_faulted() {
        return Err(FramewireError::Protocol(format!(
            "Faulted message for request {} is not a response",
            message.request_id()
        )));
    }

    shared.responses.enqueue(message, &shared.token).await
}
