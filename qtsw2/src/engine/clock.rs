use chrono::{DateTime, TimeDelta, Utc};
use std::sync::Arc;

/// Defines how the engine determines the current time.
///
/// Production uses [`LiveClock`]; tests drive a [`ManualClock`] deterministically.
pub trait EngineClock {
    fn time(&self) -> DateTime<Utc>;
}

/// Live `Clock` using `Utc::now()`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct LiveClock;

impl EngineClock for LiveClock {
    fn time(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Hand-stepped clock for deterministic tests and replay harnesses.
#[derive(Debug, Clone)]
pub struct ManualClock {
    inner: Arc<parking_lot::RwLock<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            inner: Arc::new(parking_lot::RwLock::new(start)),
        }
    }

    pub fn set(&self, instant: DateTime<Utc>) {
        *self.inner.write() = instant;
    }

    pub fn advance(&self, delta: TimeDelta) {
        let mut lock = self.inner.write();
        *lock += delta;
    }
}

impl EngineClock for ManualClock {
    fn time(&self) -> DateTime<Utc> {
        *self.inner.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_manual_clock_steps() {
        let start = Utc.with_ymd_and_hms(2025, 3, 7, 15, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        assert_eq!(clock.time(), start);

        clock.advance(TimeDelta::seconds(1));
        assert_eq!(clock.time(), start + TimeDelta::seconds(1));

        let shared = clock.clone();
        shared.set(start + TimeDelta::minutes(5));
        assert_eq!(clock.time(), start + TimeDelta::minutes(5));
    }
}
