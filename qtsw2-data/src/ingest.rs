use crate::{TimeWindow, bar::Bar, time::TradingZone};
use chrono::{DateTime, NaiveDateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

/// Reason a bar was refused admission. Checks run in declaration order and the first
/// failure wins.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize, Error)]
pub enum BarRejected {
    #[error("BEFORE_SESSION_START")]
    BeforeSessionStart,

    #[error("AFTER_SESSION_END")]
    AfterSessionEnd,

    /// Live bar younger than one minute, ie/ still in progress.
    #[error("BAR_PARTIAL_REJECTED")]
    Partial,

    #[error("BAR_OHLC_INSANE")]
    OhlcInsane,

    #[error("BAR_FROM_FUTURE")]
    Future,
}

/// Bar admission checks for one trading date's session window.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct AdmissionPolicy {
    pub session_window: TimeWindow,
}

/// Minimum age before a live bar is considered complete.
const MIN_LIVE_BAR_AGE: TimeDelta = TimeDelta::minutes(1);

impl AdmissionPolicy {
    pub fn new(session_window: TimeWindow) -> Self {
        Self { session_window }
    }

    pub fn admit(&self, bar: &Bar, now: DateTime<Utc>) -> Result<(), BarRejected> {
        if bar.open_time < self.session_window.start {
            return Err(BarRejected::BeforeSessionStart);
        }
        if bar.open_time >= self.session_window.end {
            return Err(BarRejected::AfterSessionEnd);
        }

        if !bar.source.is_historical() && now - bar.open_time < MIN_LIVE_BAR_AGE {
            return Err(BarRejected::Partial);
        }

        if !bar.is_sane() {
            return Err(BarRejected::OhlcInsane);
        }

        if bar.open_time > now {
            return Err(BarRejected::Future);
        }

        Ok(())
    }
}

/// How raw feed timestamps are interpreted once the one-shot detection has run.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub enum TimestampMode {
    Utc,
    Local,
}

/// Result of normalising one raw feed timestamp.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Normalized {
    pub open_time: DateTime<Utc>,
    /// Set when this observation performed the one-shot lock.
    pub locked: Option<TimestampMode>,
    /// Age of the bar under the locked interpretation when it falls outside the
    /// plausible band. The caller emits a rate-limited warning.
    pub suspect_age: Option<TimeDelta>,
}

/// Plausible age band for a just-delivered live bar.
const PLAUSIBLE_AGE_MIN: TimeDelta = TimeDelta::zero();
const PLAUSIBLE_AGE_MAX: TimeDelta = TimeDelta::minutes(60);

/// One-shot timestamp-interpretation lock.
///
/// The upstream feed may stamp bars in UTC or in zone-local wall time. The first bar
/// observed after engine start decides: if its UTC-interpreted age lies in
/// `[0, 60] min` the interpretation locks to UTC, otherwise to local. The lock is
/// permanent for the engine run.
#[derive(Debug, Clone)]
pub struct TimestampNormalizer {
    zone: TradingZone,
    mode: Option<TimestampMode>,
}

impl TimestampNormalizer {
    pub fn new(zone: TradingZone) -> Self {
        Self { zone, mode: None }
    }

    pub fn mode(&self) -> Option<TimestampMode> {
        self.mode
    }

    pub fn normalize(&mut self, raw: NaiveDateTime, now: DateTime<Utc>) -> Normalized {
        let locked = match self.mode {
            Some(_) => None,
            None => {
                let as_utc = raw.and_utc();
                let utc_age = now - as_utc;
                let mode = if (PLAUSIBLE_AGE_MIN..=PLAUSIBLE_AGE_MAX).contains(&utc_age) {
                    TimestampMode::Utc
                } else {
                    TimestampMode::Local
                };
                info!(?mode, "bar timestamp interpretation locked");
                self.mode = Some(mode);
                Some(mode)
            }
        };

        let open_time = match self.mode.expect("mode locked above") {
            TimestampMode::Utc => raw.and_utc(),
            TimestampMode::Local => self.zone.resolve_naive(raw),
        };

        let age = now - open_time;
        let suspect_age = (locked.is_none()
            && !(PLAUSIBLE_AGE_MIN..=PLAUSIBLE_AGE_MAX).contains(&age))
        .then_some(age);

        Normalized {
            open_time,
            locked,
            suspect_age,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bar::BarSource;
    use chrono::{NaiveDate, TimeZone};
    use chrono_tz::America::Chicago;
    use qtsw2_instrument::InstrumentName;
    use rust_decimal_macros::dec;

    fn window() -> TimeWindow {
        TimeWindow::new(
            Utc.with_ymd_and_hms(2025, 3, 6, 23, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2025, 3, 7, 22, 0, 0).unwrap(),
        )
    }

    fn bar(open_time: DateTime<Utc>, source: BarSource) -> Bar {
        Bar::new(
            InstrumentName::new("ES"),
            open_time,
            dec!(100),
            dec!(101),
            dec!(99),
            dec!(100.5),
            None,
            source,
        )
    }

    #[test]
    fn test_admission_order_and_reasons() {
        let policy = AdmissionPolicy::new(window());
        let now = Utc.with_ymd_and_hms(2025, 3, 7, 15, 0, 0).unwrap();

        struct TestCase {
            name: &'static str,
            bar: Bar,
            expected: Result<(), BarRejected>,
        }

        let insane = {
            let mut bar = bar(Utc.with_ymd_and_hms(2025, 3, 7, 14, 0, 0).unwrap(), BarSource::Live);
            bar.low = dec!(102);
            bar
        };

        let cases = vec![
            TestCase {
                name: "in-window live bar admitted",
                bar: bar(
                    Utc.with_ymd_and_hms(2025, 3, 7, 14, 58, 0).unwrap(),
                    BarSource::Live,
                ),
                expected: Ok(()),
            },
            TestCase {
                name: "before session start",
                bar: bar(
                    Utc.with_ymd_and_hms(2025, 3, 6, 22, 59, 0).unwrap(),
                    BarSource::Live,
                ),
                expected: Err(BarRejected::BeforeSessionStart),
            },
            TestCase {
                name: "at session end boundary rejected",
                bar: bar(
                    Utc.with_ymd_and_hms(2025, 3, 7, 22, 0, 0).unwrap(),
                    BarSource::Live,
                ),
                expected: Err(BarRejected::AfterSessionEnd),
            },
            TestCase {
                name: "live partial bar rejected",
                bar: bar(
                    Utc.with_ymd_and_hms(2025, 3, 7, 14, 59, 30).unwrap(),
                    BarSource::Live,
                ),
                expected: Err(BarRejected::Partial),
            },
            TestCase {
                name: "historical bar exempt from age check",
                bar: bar(
                    Utc.with_ymd_and_hms(2025, 3, 7, 14, 59, 30).unwrap(),
                    BarSource::BarsRequest,
                ),
                expected: Ok(()),
            },
            TestCase {
                name: "insane ohlc rejected",
                bar: insane,
                expected: Err(BarRejected::OhlcInsane),
            },
            TestCase {
                name: "future historical bar rejected",
                bar: bar(
                    Utc.with_ymd_and_hms(2025, 3, 7, 15, 5, 0).unwrap(),
                    BarSource::Csv,
                ),
                expected: Err(BarRejected::Future),
            },
        ];

        for (index, test) in cases.iter().enumerate() {
            assert_eq!(
                policy.admit(&test.bar, now),
                test.expected,
                "TC{} ({}) failed",
                index,
                test.name
            );
        }
    }

    #[test]
    fn test_timestamp_lock_utc_feed() {
        let mut normalizer = TimestampNormalizer::new(TradingZone(Chicago));
        let now = Utc.with_ymd_and_hms(2025, 3, 7, 15, 0, 0).unwrap();

        // Raw stamp two minutes old when read as UTC.
        let raw = NaiveDate::from_ymd_opt(2025, 3, 7)
            .unwrap()
            .and_hms_opt(14, 58, 0)
            .unwrap();

        let first = normalizer.normalize(raw, now);
        assert_eq!(first.locked, Some(TimestampMode::Utc));
        assert_eq!(first.open_time, raw.and_utc());
        assert_eq!(normalizer.mode(), Some(TimestampMode::Utc));
    }

    #[test]
    fn test_timestamp_lock_local_feed() {
        let mut normalizer = TimestampNormalizer::new(TradingZone(Chicago));
        let now = Utc.with_ymd_and_hms(2025, 3, 7, 15, 0, 0).unwrap();

        // 08:58 read as UTC would be six hours in the past, so interpretation locks
        // to local; 08:58 CST resolves to 14:58 UTC.
        let raw = NaiveDate::from_ymd_opt(2025, 3, 7)
            .unwrap()
            .and_hms_opt(8, 58, 0)
            .unwrap();

        let first = normalizer.normalize(raw, now);
        assert_eq!(first.locked, Some(TimestampMode::Local));
        assert_eq!(
            first.open_time,
            Utc.with_ymd_and_hms(2025, 3, 7, 14, 58, 0).unwrap()
        );
    }

    #[test]
    fn test_locked_mode_flags_suspect_ages() {
        let mut normalizer = TimestampNormalizer::new(TradingZone(Chicago));
        let now = Utc.with_ymd_and_hms(2025, 3, 7, 15, 0, 0).unwrap();

        let fresh = NaiveDate::from_ymd_opt(2025, 3, 7)
            .unwrap()
            .and_hms_opt(14, 58, 0)
            .unwrap();
        assert!(normalizer.normalize(fresh, now).suspect_age.is_none());

        // A stamp three hours stale under the locked UTC interpretation.
        let stale = NaiveDate::from_ymd_opt(2025, 3, 7)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap();
        let normalized = normalizer.normalize(stale, now);
        assert_eq!(normalized.locked, None);
        assert_eq!(normalized.suspect_age, Some(TimeDelta::hours(3)));
    }
}
