use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Millisecond wall-clock source.
///
/// Every time-dependent component receives one of these explicitly so tests
/// can drive time by hand.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Milliseconds since the Unix epoch (or any fixed origin).
    fn now_ms(&self) -> u64;
}

/// Clock backed by `SystemTime`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Hand-driven clock for tests and simulations.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(start_ms),
        }
    }

    pub fn set_ms(&self, now_ms: u64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.now_ms
            .fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

/// Per-transport micro-timestamp generator.
///
/// Values are `ms * 1000` when the millisecond changed, otherwise the previous
/// value plus one, so consecutive calls are strictly increasing even with a
/// coarse or repeating underlying clock.
#[derive(Debug, Clone)]
pub struct MicroClock {
    clock: Arc<dyn Clock>,
    last: Arc<Mutex<u64>>,
}

impl MicroClock {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            last: Arc::new(Mutex::new(0)),
        }
    }

    pub fn micro_seconds(&self) -> u64 {
        let candidate = self.clock.now_ms().saturating_mul(1_000);
        let mut last = self.last.lock().unwrap_or_else(|p| p.into_inner());
        let next = if candidate > *last {
            candidate
        } else {
            *last + 1
        };
        *last = next;
        next
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::{Clock, ManualClock, MicroClock, SystemClock};

    #[test]
    fn micro_clock_is_strictly_increasing_within_one_millisecond() {
        let clock = Arc::new(ManualClock::new(5));
        let micro = MicroClock::new(clock.clone());
        let a = micro.micro_seconds();
        let b = micro.micro_seconds();
        let c = micro.micro_seconds();
        assert_eq!(a, 5_000);
        assert_eq!(b, 5_001);
        assert_eq!(c, 5_002);

        clock.advance(Duration::from_millis(1));
        assert_eq!(micro.micro_seconds(), 6_000);
    }

    #[test]
    fn micro_clock_never_goes_backwards_when_wall_clock_does() {
        let clock = Arc::new(ManualClock::new(10));
        let micro = MicroClock::new(clock.clone());
        let before = micro.micro_seconds();
        clock.set_ms(3);
        assert!(micro.micro_seconds() > before);
    }

    #[test]
    fn system_clock_reports_after_epoch() {
        assert!(SystemClock.now_ms() > 1_600_000_000_000);
    }
}
