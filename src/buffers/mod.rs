//! Correlation tables shared between callers and the pumps.
//!
//! - [`RequestQueue`]: outbound chunks waiting for the write pump, with
//!   bucket aging so skipped chunks are not starved
//! - [`ResponseBuffer`]: inbound requests grouped by payload type, bounded
//!   by a global byte budget
//! - [`PendingResponses`]: request id to reply waiter, handed out as a
//!   single-consumption [`ResponseHandle`]
//!
//! All three are internally synchronized and expose `cancel_all`, which
//! the session calls exactly once during teardown (calling it again is
//! harmless).

mod pending;
mod request_queue;
mod response_buffer;

pub use pending::{PendingResponses, ResponseHandle};
pub use request_queue::{ChunkKind, OutboundChunk, RequestQueue, DEFAULT_REQUEST_BUCKETS};
pub use response_buffer::{QueuedResponse, ResponseBuffer};
