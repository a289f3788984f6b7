//! Cross-context message transports for tether.
//!
//! A [`channel::Channel`] picks one [`adapter::ChannelTransport`] variant by
//! probing the [`platform::Platform`] and exposes lazy publish/subscribe on
//! top of it.

pub mod adapter;
pub mod channel;
pub mod error;
pub mod native;
pub mod platform;
pub mod storage;
pub mod store;

pub use adapter::{ChannelTransport, MessageSink, TransportKind, TransportStats};
pub use channel::{Channel, ChannelOptions, ListenerId, MessageHandler};
pub use error::TransportError;
pub use platform::{ContextKind, Platform};
