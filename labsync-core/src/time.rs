//! Injectable wall-clock source.
//!
//! Timestamps are milliseconds since the Unix epoch. Components never call
//! `SystemTime::now()` directly so tests can drive presence timeouts and
//! autosave deterministically.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use crate::Timestamp;

pub trait TimeSource: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Real wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now(&self) -> Timestamp {
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as Timestamp
    }
}

/// Manually advanced clock for tests.
#[derive(Debug, Default)]
pub struct ManualTimeSource {
    now: AtomicU64,
}

impl ManualTimeSource {
    pub fn new(start: Timestamp) -> Self {
        Self { now: AtomicU64::new(start) }
    }

    pub fn advance(&self, by: Duration) -> Timestamp {
        self.now.fetch_add(by.as_millis() as u64, Ordering::SeqCst) + by.as_millis() as u64
    }

    pub fn set(&self, to: Timestamp) {
        self.now.store(to, Ordering::SeqCst);
    }
}

impl TimeSource for ManualTimeSource {
    fn now(&self) -> Timestamp {
        self.now.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_advance() {
        let t = ManualTimeSource::new(1_000);
        assert_eq!(t.now(), 1_000);
        assert_eq!(t.advance(Duration::from_secs(2)), 3_000);
        t.set(10);
        assert_eq!(t.now(), 10);
    }

    #[test]
    fn test_system_time_is_after_2020() {
        assert!(SystemTimeSource.now() > 1_577_836_800_000);
    }
}
