//! Frame buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` for zero-copy buffer management.
//! Implements a state machine for handling fragmented frames:
//! - `WaitingForHeader`: need a complete length-prefixed [`FrameHeader`]
//! - `WaitingForBody`: header parsed, need the sum of its message sizes
//!
//! Once a body is complete it is frozen and sliced into messages, so each
//! payload shares the frame's allocation.
//!
//! # Example
//!
//! ```ignore
//! use framewire::protocol::FrameBuffer;
//!
//! let mut buffer = FrameBuffer::new();
//!
//! for frame in buffer.push(&chunk_from_socket)? {
//!     for message in frame.messages {
//!         println!("request {} ({})", message.request_id(), message.data_type());
//!     }
//! }
//! ```

use bytes::{Bytes, BytesMut};

use super::frame::{InboundFrame, InboundMessage};
use super::wire_format::{decode_record, FrameHeader, MessageHeader};
use crate::error::{FramewireError, Result};

/// Default maximum size of one inbound frame (header + body), 64 MB.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// State machine for frame parsing.
#[derive(Debug)]
enum State {
    WaitingForHeader,
    WaitingForBody { header: FrameHeader, body_len: usize },
}

/// Buffer for accumulating incoming bytes and extracting complete frames.
pub struct FrameBuffer {
    buffer: BytesMut,
    state: State,
    max_frame_bytes: usize,
}

impl FrameBuffer {
    /// Create a new frame buffer with default settings.
    ///
    /// Default capacity: 64KB, max frame: 64MB.
    pub fn new() -> Self {
        Self::with_max_frame_bytes(DEFAULT_MAX_FRAME_BYTES)
    }

    /// Create a new frame buffer with a custom frame size limit.
    pub fn with_max_frame_bytes(max_frame_bytes: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            state: State::WaitingForHeader,
            max_frame_bytes,
        }
    }

    /// Push data into the buffer and extract all complete frames.
    ///
    /// Partial data is kept for the next push.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if a frame exceeds the size limit or its
    /// messages do not match the sizes declared in the frame header.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<InboundFrame>> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.try_extract_one()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    fn try_extract_one(&mut self) -> Result<Option<InboundFrame>> {
        if let State::WaitingForHeader = self.state {
            let Some((header, used)) =
                decode_record::<FrameHeader>(&self.buffer, self.max_frame_bytes)?
            else {
                return Ok(None);
            };

            let body_len = header
                .body_len()
                .and_then(|len| usize::try_from(len).ok())
                .filter(|len| len.saturating_add(used) <= self.max_frame_bytes)
                .ok_or_else(|| {
                    FramewireError::Protocol(format!(
                        "Frame of {} messages exceeds maximum {} bytes",
                        header.message_sizes.len(),
                        self.max_frame_bytes
                    ))
                })?;

            let _ = self.buffer.split_to(used);
            self.state = State::WaitingForBody { header, body_len };
        }

        let State::WaitingForBody { body_len, .. } = self.state else {
            return Ok(None);
        };
        if self.buffer.len() < body_len {
            return Ok(None);
        }

        let body = self.buffer.split_to(body_len).freeze();
        let State::WaitingForBody { header, .. } =
            std::mem::replace(&mut self.state, State::WaitingForHeader)
        else {
            return Ok(None);
        };

        let messages = split_messages(&header, body)?;
        Ok(Some(InboundFrame { header, messages }))
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Clear the buffer and reset state.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::WaitingForHeader;
    }

    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match &self.state {
            State::WaitingForHeader => "WaitingForHeader",
            State::WaitingForBody { .. } => "WaitingForBody",
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Slice a complete frame body into its messages.
fn split_messages(header: &FrameHeader, body: Bytes) -> Result<Vec<InboundMessage>> {
    let mut messages = Vec::with_capacity(header.message_sizes.len());
    let mut offset = 0usize;

    for &size in &header.message_sizes {
        // body_len() already bounded the sum, so each size fits in usize
        let size = size as usize;
        let record = body.slice(offset..offset + size);
        offset += size;

        let Some((msg_header, used)) = decode_record::<MessageHeader>(&record, size)? else {
            return Err(FramewireError::Protocol(format!(
                "Message header truncated: declared message size {}",
                size
            )));
        };

        let payload_len = (size - used) as u64;
        if payload_len != msg_header.data_size {
            return Err(FramewireError::Protocol(format!(
                "Message {} declares {} payload bytes but carries {}",
                msg_header.request_id, msg_header.data_size, payload_len
            )));
        }

        messages.push(InboundMessage::new(msg_header, record.slice(used..)));
    }

    Ok(messages)
}
