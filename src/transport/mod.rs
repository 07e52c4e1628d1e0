//! Message transport over a byte stream.
//!
//! A session is one [`MessageTransport`] per side, usually through the
//! [`MessageClient`] / [`MessageServer`] wrappers:
//!
//! ```text
//!  send_data ──► RequestQueue ──► write pump ──► stream ──► read pump ─┬─► PendingResponses ──► RequestResult
//!  respond / fault ──┘                                                 └─► ResponseBuffer ──► receive_data
//! ```
//!
//! Any fatal condition (fault, protocol violation, stream failure or
//! cancellation) tears the whole session down and fails every pending
//! operation.

mod config;
mod message;
mod read_pump;
mod result;
mod session;
mod write_pump;

pub use config::{
    TransportBuilder, TransportConfig, DEFAULT_MAX_FRAME_SIZE, DEFAULT_POOL_FLUSH_INTERVAL,
    DEFAULT_READ_BUFFER_SIZE,
};
pub use message::{MessageClient, MessageServer, MessageTransport};
pub use result::{Fault, FaultException, FaultOrigin, MessageResult, RequestResult, TypedResult};
pub use session::Role;
