use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tether_core::ChannelMessage;

use crate::error::TransportError;

/// Callback the transport hands accepted messages to.
pub type MessageSink = Arc<dyn Fn(ChannelMessage) + Send + Sync>;

/// Concrete transport variants, in probing preference order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Platform broadcast primitive.
    Native,
    /// Append-only table polled by every subscriber.
    PersistentStore,
    /// Single storage slot plus change notification.
    StorageEvent,
}

impl TransportKind {
    pub const PREFERENCE: [TransportKind; 3] = [
        TransportKind::Native,
        TransportKind::PersistentStore,
        TransportKind::StorageEvent,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Native => "native",
            Self::PersistentStore => "store",
            Self::StorageEvent => "storage",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "native" => Ok(Self::Native),
            "store" | "idb" => Ok(Self::PersistentStore),
            "storage" | "localstorage" => Ok(Self::StorageEvent),
            other => Err(TransportError::UnknownTransport(other.to_string())),
        }
    }
}

/// Coarse per-transport counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub posted: u64,
    pub post_errors: u64,
    pub delivered: u64,
    pub dropped_own: u64,
    pub dropped_duplicate: u64,
    pub dropped_stale: u64,
    pub purged_rows: u64,
}

/// Lock-free counters shared between a transport and its delivery task.
#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    pub posted: AtomicU64,
    pub post_errors: AtomicU64,
    pub delivered: AtomicU64,
    pub dropped_own: AtomicU64,
    pub dropped_duplicate: AtomicU64,
    pub dropped_stale: AtomicU64,
    pub purged_rows: AtomicU64,
}

impl StatsCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TransportStats {
        TransportStats {
            posted: self.posted.load(Ordering::Relaxed),
            post_errors: self.post_errors.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped_own: self.dropped_own.load(Ordering::Relaxed),
            dropped_duplicate: self.dropped_duplicate.load(Ordering::Relaxed),
            dropped_stale: self.dropped_stale.load(Ordering::Relaxed),
            purged_rows: self.purged_rows.load(Ordering::Relaxed),
        }
    }
}

/// Capability contract shared by every transport variant.
///
/// Delivery happens on a transport-owned task; implementations must never
/// call the sink while holding a lock the sink could re-enter through `post`.
pub trait ChannelTransport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Publishes a message to every other subscriber of the channel.
    fn post_message(&self, message: &ChannelMessage) -> Result<(), TransportError>;

    /// Installs (`Some`) or removes (`None`) the delivery sink.
    ///
    /// Messages older than `since_time` must not reach the sink.
    fn on_message(&self, sink: Option<MessageSink>, since_time: u64);

    /// Stops delivery and releases platform resources.
    fn close(&self);

    /// Next strictly increasing micro-timestamp of this transport's clock.
    fn micro_seconds(&self) -> u64;

    fn stats(&self) -> TransportStats {
        TransportStats::default()
    }
}

#[cfg(test)]
mod tests {
    use super::{StatsCounters, TransportKind, TransportStats};
    use crate::error::TransportError;

    #[test]
    fn kind_parses_canonical_and_legacy_names() {
        assert_eq!("native".parse::<TransportKind>().ok(), Some(TransportKind::Native));
        assert_eq!(
            " IDB ".parse::<TransportKind>().ok(),
            Some(TransportKind::PersistentStore)
        );
        assert_eq!(
            "localstorage".parse::<TransportKind>().ok(),
            Some(TransportKind::StorageEvent)
        );
        let err = "smoke-signal"
            .parse::<TransportKind>()
            .expect_err("unknown kinds must be rejected");
        assert!(matches!(err, TransportError::UnknownTransport(name) if name == "smoke-signal"));
    }

    #[test]
    fn kind_display_round_trips() {
        for kind in TransportKind::PREFERENCE {
            assert_eq!(kind.to_string().parse::<TransportKind>().ok(), Some(kind));
        }
    }

    #[test]
    fn counters_snapshot_reflects_bumps() {
        let counters = StatsCounters::default();
        StatsCounters::bump(&counters.posted);
        StatsCounters::bump(&counters.posted);
        StatsCounters::bump(&counters.dropped_stale);
        assert_eq!(
            counters.snapshot(),
            TransportStats {
                posted: 2,
                dropped_stale: 1,
                ..TransportStats::default()
            }
        );
    }
}
