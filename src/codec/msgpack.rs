//! MsgPack codec using `rmp-serde`.
//!
//! Structs are always written in map form (`to_vec_named` / `write_named`)
//! so that field names travel with the record. A peer built from a
//! different struct version can still decode the fields it knows.

use bytes::{BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

/// MessagePack codec for structured data.
pub struct MsgPackCodec;

impl MsgPackCodec {
    /// Encode a value to MsgPack bytes (struct-as-map).
    #[inline]
    pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    /// Encode a value directly onto the end of `buf`.
    ///
    /// Returns the number of bytes appended. Used to serialize payloads
    /// straight into pooled segments without an intermediate `Vec`.
    pub fn encode_into<T: Serialize + ?Sized>(value: &T, buf: &mut BytesMut) -> Result<usize> {
        let start = buf.len();
        let mut writer = BufMut::writer(&mut *buf);
        rmp_serde::encode::write_named(&mut writer, value)?;
        Ok(buf.len() - start)
    }

    /// Decode MsgPack bytes to a value.
    #[inline]
    pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}
