//! Wire names for payload types.
//!
//! Every message header carries the name of its payload type, and the
//! receiving side routes requests by that name. Names are bound explicitly
//! through [`MessageType`] so that both peers agree on them regardless of
//! crate layout or compiler version.
//!
//! ```ignore
//! use framewire::message_type;
//!
//! #[derive(serde::Serialize, serde::Deserialize)]
//! struct Ping { seq: u32 }
//!
//! message_type!(Ping => "Ping");
//! ```

use std::rc::Rc;
use std::sync::Arc;

/// A payload type with a stable name on the wire.
pub trait MessageType {
    /// Name written into each message header. Must be identical on both
    /// peers and unique among the types a session exchanges.
    const TYPE_NAME: &'static str;
}

/// Implement [`MessageType`] for one or more types.
#[macro_export]
macro_rules! message_type {
    ($($ty:ty => $name:expr),+ $(,)?) => {
        $(
            impl $crate::MessageType for $ty {
                const TYPE_NAME: &'static str = $name;
            }
        )+
    };
}

message_type! {
    () => "unit",
    bool => "bool",
    char => "char",
    u8 => "u8",
    u16 => "u16",
    u32 => "u32",
    u64 => "u64",
    i8 => "i8",
    i16 => "i16",
    i32 => "i32",
    i64 => "i64",
    f32 => "f32",
    f64 => "f64",
    String => "string",
    str => "string",
}

// Wrappers serialize like their contents and share their name.

impl<T: MessageType + ?Sized> MessageType for &T {
    const TYPE_NAME: &'static str = T::TYPE_NAME;
}

impl<T: MessageType + ?Sized> MessageType for Box<T> {
    const TYPE_NAME: &'static str = T::TYPE_NAME;
}

impl<T: MessageType + ?Sized> MessageType for Arc<T> {
    const TYPE_NAME: &'static str = T::TYPE_NAME;
}

impl<T: MessageType + ?Sized> MessageType for Rc<T> {
    const TYPE_NAME: &'static str = T::TYPE_NAME;
}
