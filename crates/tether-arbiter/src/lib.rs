//! Cross-context single-instance arbitration.
//!
//! Every instance announces itself on a shared channel; the deterministic
//! [`announcement::judge`] rule decides which one may activate the backend.

pub mod announcement;
pub mod arbiter;

pub use announcement::{judge, InstanceAnnouncement, InstanceState, Verdict};
pub use arbiter::{ArbiterOptions, Arbitration, InstanceArbiter};
