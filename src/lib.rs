//! # framewire
//!
//! Bidirectional, typed request/response messaging over any async byte
//! stream, plus a multiplexer that carries many logical byte streams over
//! one connection.
//!
//! ## Architecture
//!
//! - **Message transport**: framed MsgPack messages with request id
//!   correlation, per-type inbound buffering under a byte budget, faults
//!   that end the session, and frame-size-limited outbound batching
//! - **Stream multiplexing**: channel-tagged chunks with a read pump and a
//!   write pump shared by every channel
//!
//! ## Example
//!
//! ```ignore
//! use framewire::{message_type, MessageClient, MessageServer};
//! use tokio_util::sync::CancellationToken;
//!
//! #[derive(serde::Serialize, serde::Deserialize)]
//! struct Ping { seq: u32 }
//!
//! #[derive(serde::Serialize, serde::Deserialize)]
//! struct Pong { seq: u32 }
//!
//! message_type!(Ping => "Ping", Pong => "Pong");
//!
//! let token = CancellationToken::new();
//! let (a, b) = tokio::io::duplex(64 * 1024);
//! let client = MessageClient::new(a, token.clone());
//! let server = MessageServer::new(b, token.clone());
//! client.open()?;
//! server.open()?;
//!
//! let request = client.send_data(&Ping { seq: 1 }).await?;
//! let ping = server.receive_data::<Ping>().await?;
//! ping.respond(&Pong { seq: ping.payload().seq }).await?;
//! let pong = request.receive_data::<Pong>().await?;
//! ```

pub mod backpressure;
pub mod buffers;
pub mod codec;
pub mod error;
pub mod multiplex;
pub mod pool;
pub mod protocol;
pub mod transport;

mod writer;

pub use error::{CloseReason, FramewireError, Result};
pub use protocol::MessageType;
pub use multiplex::{ChannelStream, MultiplexConfig, MultiplexedStreamFactory};
pub use transport::{
    Fault, FaultException, FaultOrigin, MessageClient, MessageResult, MessageServer,
    MessageTransport, RequestResult, Role, TransportBuilder, TransportConfig, TypedResult,
};
