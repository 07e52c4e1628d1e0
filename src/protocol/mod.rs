//! Protocol module - wire records, framing, and frame types.
//!
//! This module implements the wire format shared by both peers:
//! - Varint length-prefixed MsgPack records
//! - Frame, message and multiplexed chunk headers
//! - Frame buffer for accumulating partial reads
//! - Stable wire names for payload types

mod frame;
mod frame_buffer;
mod message_type;
mod wire_format;

pub use frame::{encode_frame, type_registry, InboundFrame, InboundMessage};
pub use frame_buffer::{FrameBuffer, DEFAULT_MAX_FRAME_BYTES};
pub use message_type::MessageType;
pub use wire_format::{
    decode_record, decode_varint, encode_record, encode_varint, read_record, record_to_bytes,
    FrameHeader, MessageHeader, MultiplexedDataHeader, TypeEntry, DEFAULT_MAX_RECORD_SIZE,
    MAX_VARINT_LEN,
};
