//! Core tether primitives shared across crates.
//!
//! Includes the channel message envelope, injectable clocks, the
//! time-windowed dedup set, channel naming helpers, and base errors.

pub mod clock;
pub mod dedup;
pub mod error;
pub mod names;
pub mod types;

pub use clock::{Clock, ManualClock, MicroClock, SystemClock};
pub use dedup::DedupSet;
pub use error::CoreError;
pub use types::{ChannelMessage, MessageKind};
