//! Wire format encoding and decoding.
//!
//! Every record on the wire is a MsgPack map preceded by its length as an
//! unsigned LEB128 varint:
//!
//! ```text
//! ┌────────────────┬──────────────────────────┐
//! │ length (varint)│ MsgPack record (length B) │
//! │ 1-10 bytes     │                           │
//! └────────────────┴──────────────────────────┘
//! ```
//!
//! Three record types exist:
//!
//! - [`FrameHeader`]: starts one physical write of N concatenated messages
//! - [`MessageHeader`]: starts one message, followed by `data_size` payload bytes
//! - [`MultiplexedDataHeader`]: starts one chunk of channel data, followed by
//!   `length` raw bytes

use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::codec::MsgPackCodec;
use crate::error::{FramewireError, Result};

/// Maximum encoded length of a u64 varint.
pub const MAX_VARINT_LEN: usize = 10;

/// Default upper bound for a single header record (16 MB).
pub const DEFAULT_MAX_RECORD_SIZE: usize = 16 * 1024 * 1024;

/// Header of one physical frame.
///
/// `message_sizes[i]` is the total byte count (header record + payload)
/// of the i-th message that follows. `types` lists the distinct payload
/// type names carried by the frame; receivers may use it as a registry hint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameHeader {
    pub message_sizes: Vec<u64>,
    #[serde(default)]
    pub types: Vec<TypeEntry>,
}

impl FrameHeader {
    /// Sum of all declared message sizes.
    ///
    /// Returns `None` on overflow, which only a hostile peer can produce.
    pub fn body_len(&self) -> Option<u64> {
        self.message_sizes
            .iter()
            .try_fold(0u64, |acc, size| acc.checked_add(*size))
    }
}

/// One entry of the frame type registry hint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeEntry {
    pub type_id: u32,
    pub type_name: String,
}

/// Header preceding each message payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageHeader {
    /// Correlation id, shared by a request and its reply.
    pub request_id: i64,
    /// The payload is a fault value rather than a normal reply.
    pub faulted: bool,
    /// This message answers an earlier request from the receiving side.
    #[serde(default)]
    pub is_response: bool,
    /// Type name of the payload.
    #[serde(default)]
    pub data_type: String,
    /// Payload length in bytes.
    #[serde(default)]
    pub data_size: u64,
}

/// Header preceding each chunk of multiplexed channel data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultiplexedDataHeader {
    pub channel_id: u32,
    pub length: u32,
}

/// Append `value` as an unsigned LEB128 varint.
pub fn encode_varint(mut value: u64, buf: &mut BytesMut) {
    while value >= 0x80 {
        buf.put_u8((value as u8) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

/// Decode a varint from the start of `buf`.
///
/// Returns `Ok(None)` if `buf` ends before the varint does, or
/// `Ok(Some((value, consumed)))` on success.
pub fn decode_varint(buf: &[u8]) -> Result<Option<(u64, usize)>> {
    let mut value = 0u64;
    for (i, &byte) in buf.iter().take(MAX_VARINT_LEN).enumerate() {
        if i == MAX_VARINT_LEN - 1 && byte > 1 {
            return Err(varint_overflow());
        }
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    if buf.len() >= MAX_VARINT_LEN {
        return Err(varint_overflow());
    }
    Ok(None)
}

fn varint_overflow() -> FramewireError {
    FramewireError::Protocol("Length prefix exceeds 64 bits".to_string())
}

/// Append a length-prefixed record to `buf`.
///
/// Returns the total number of bytes appended (prefix included).
pub fn encode_record<T: Serialize>(value: &T, buf: &mut BytesMut) -> Result<usize> {
    let start = buf.len();
    let body = MsgPackCodec::encode(value)?;
    encode_varint(body.len() as u64, buf);
    buf.extend_from_slice(&body);
    Ok(buf.len() - start)
}

/// Encode a length-prefixed record into its own buffer.
pub fn record_to_bytes<T: Serialize>(value: &T) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    encode_record(value, &mut buf)?;
    Ok(buf.freeze())
}

/// Decode a length-prefixed record from the start of `buf`.
///
/// Returns `Ok(None)` if the record is not complete yet, otherwise the
/// record and the number of bytes it occupied.
///
/// # Errors
///
/// Returns a protocol error if the declared length exceeds `max_len`.
pub fn decode_record<T: DeserializeOwned>(buf: &[u8], max_len: usize) -> Result<Option<(T, usize)>> {
    let Some((len, prefix)) = decode_varint(buf)? else {
        return Ok(None);
    };
    let len = checked_record_len(len, max_len)?;

    let end = prefix + len;
    if buf.len() < end {
        return Ok(None);
    }

    let record = MsgPackCodec::decode(&buf[prefix..end])?;
    Ok(Some((record, end)))
}

/// Read one length-prefixed record from an async reader.
///
/// Returns `Ok(None)` on a clean EOF before the first byte of the record.
/// EOF anywhere inside the record is an I/O error.
pub async fn read_record<T, R>(reader: &mut R, max_len: usize) -> Result<Option<T>>
where
    T: DeserializeOwned,
    R: AsyncRead + Unpin,
{
    let Some(len) = read_varint(reader).await? else {
        return Ok(None);
    };
    let len = checked_record_len(len, max_len)?;

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(MsgPackCodec::decode(&body)?))
}

async fn read_varint<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<u64>> {
    let mut value = 0u64;
    for i in 0..MAX_VARINT_LEN {
        let byte = match reader.read_u8().await {
            Ok(byte) => byte,
            Err(e) if i == 0 && e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        if i == MAX_VARINT_LEN - 1 && byte > 1 {
            return Err(varint_overflow());
        }
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some(value));
        }
    }
    Err(varint_overflow())
}

fn checked_record_len(len: u64, max_len: usize) -> Result<usize> {
    match usize::try_from(len) {
        Ok(len) if len <= max_len => Ok(len),
        _ => Err(FramewireError::Protocol(format!(
            "Record size {} exceeds maximum {}",
            len, max_len
        ))),
    }
}
