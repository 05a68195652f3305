//! Time abstraction so retention and billing can be tested deterministically.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Source of wall-clock time.
pub trait TimeProvider: Send + Sync + std::fmt::Debug + 'static {
    fn utc_now(&self) -> DateTime<Utc>;
}

/// Production time provider backed by the system clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemTimeProvider;

impl TimeProvider for SystemTimeProvider {
    fn utc_now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for tests.
#[derive(Clone, Debug)]
pub struct VirtualTimeProvider {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl Default for VirtualTimeProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualTimeProvider {
    pub fn new() -> Self {
        Self::new_at(Utc::now())
    }

    pub fn new_at(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, duration: Duration) {
        let step = chrono::Duration::from_std(duration)
            .unwrap_or(chrono::Duration::MAX);
        let mut now = self.now.lock();
        *now = now.checked_add_signed(step).unwrap_or(*now);
    }
}

impl TimeProvider for VirtualTimeProvider {
    fn utc_now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn virtual_clock_only_moves_when_advanced() {
        let clock = VirtualTimeProvider::new();
        let start = clock.utc_now();
        assert_eq!(clock.utc_now(), start);

        clock.advance(Duration::from_secs(3_600));
        assert_eq!(clock.utc_now() - start, chrono::Duration::hours(1));
    }

    #[test]
    fn clones_share_the_same_timeline() {
        let clock = VirtualTimeProvider::new();
        let other = clock.clone();
        clock.advance(Duration::from_secs(30));
        assert_eq!(clock.utc_now(), other.utc_now());
    }
}
