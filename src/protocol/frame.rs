//! Decoded frames and messages.
//!
//! An [`InboundFrame`] is what the frame parser produces for one physical
//! write. Message payloads are `bytes::Bytes` slices of the frame body, so
//! splitting a frame into messages never copies payload data.

use bytes::{Bytes, BytesMut};

use super::wire_format::{encode_record, FrameHeader, MessageHeader, TypeEntry};
use crate::error::Result;

/// One decoded message: header plus raw payload bytes.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub header: MessageHeader,
    pub payload: Bytes,
}

impl InboundMessage {
    pub fn new(header: MessageHeader, payload: Bytes) -> Self {
        Self { header, payload }
    }

    #[inline]
    pub fn request_id(&self) -> i64 {
        self.header.request_id
    }

    #[inline]
    pub fn is_response(&self) -> bool {
        self.header.is_response
    }

    #[inline]
    pub fn is_faulted(&self) -> bool {
        self.header.faulted
    }

    #[inline]
    pub fn data_type(&self) -> &str {
        &self.header.data_type
    }

    /// Payload length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// One decoded frame.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    pub header: FrameHeader,
    pub messages: Vec<InboundMessage>,
}

/// Collect the distinct data types of a frame in order of first appearance.
pub fn type_registry<'a, I>(data_types: I) -> Vec<TypeEntry>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut entries: Vec<TypeEntry> = Vec::new();
    for name in data_types {
        if !entries.iter().any(|e| e.type_name == name) {
            entries.push(TypeEntry {
                type_id: entries.len() as u32,
                type_name: name.to_string(),
            });
        }
    }
    entries
}

/// Build a complete frame in one contiguous buffer.
///
/// `data_size` of each header is overwritten with the real payload length.
/// The write pump streams frames with vectored writes instead; this is the
/// reference layout used by tooling and tests.
pub fn encode_frame(messages: &[(MessageHeader, Bytes)]) -> Result<BytesMut> {
    let mut records = Vec::with_capacity(messages.len());
    for (header, payload) in messages {
        let mut header = header.clone();
        header.data_size = payload.len() as u64;
        let mut record = BytesMut::new();
        encode_record(&header, &mut record)?;
        records.push(record);
    }

    let frame_header = FrameHeader {
        message_sizes: records
            .iter()
            .zip(messages)
            .map(|(record, (_, payload))| (record.len() + payload.len()) as u64)
            .collect(),
        types: type_registry(messages.iter().map(|(h, _)| h.data_type.as_str())),
    };

    let mut out = BytesMut::new();
    encode_record(&frame_header, &mut out)?;
    for (record, (_, payload)) in records.iter().zip(messages) {
        out.extend_from_slice(record);
        out.extend_from_slice(payload);
    }
    Ok(out)
}
