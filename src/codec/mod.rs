//! Codec module - the opaque serializer behind headers and payloads.
//!
//! Every record on the wire (frame headers, message headers, multiplexed
//! chunk headers and message payloads) goes through [`MsgPackCodec`].
//! The transport never looks inside a payload; it only needs a
//! schema-driven encode/decode pair and the encoded length.
//!
//! # Example
//!
//! ```
//! use framewire::codec::MsgPackCodec;
//!
//! let encoded = MsgPackCodec::encode(&"hello").unwrap();
//! let decoded: String = MsgPackCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, "hello");
//! ```

mod msgpack;

pub use msgpack::MsgPackCodec;
