//! Stream multiplexing.

mod channel;
mod factory;

pub use channel::ChannelStream;
pub use factory::{
    MultiplexConfig, MultiplexedStreamFactory, DEFAULT_CHANNEL_BUFFER_SIZE, DEFAULT_MAX_CHANNELS,
    DEFAULT_MUX_READ_BUFFER_SIZE,
};
