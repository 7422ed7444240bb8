use crate::TimeWindow;
use chrono::{
    DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, TimeZone, Utc, offset::LocalResult,
};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum TimeError {
    #[error("invalid wall-clock time (expected HH:MM): {0}")]
    InvalidWallTime(String),

    #[error("unknown timezone: {0}")]
    UnknownZone(String),
}

/// Wall-clock HH:MM in the trading zone, as written in the timetable and parity spec.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct WallTime {
    pub hour: u32,
    pub minute: u32,
}

impl WallTime {
    pub fn new(hour: u32, minute: u32) -> Option<Self> {
        (hour < 24 && minute < 60).then_some(Self { hour, minute })
    }

    fn as_naive(&self) -> NaiveTime {
        NaiveTime::from_hms_opt(self.hour, self.minute, 0)
            .unwrap_or(NaiveTime::MIN)
    }
}

impl FromStr for WallTime {
    type Err = TimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || TimeError::InvalidWallTime(s.to_string());

        let (hour, minute) = s.split_once(':').ok_or_else(invalid)?;
        let hour = hour.parse().map_err(|_| invalid())?;
        let minute = minute.parse().map_err(|_| invalid())?;

        Self::new(hour, minute).ok_or_else(invalid)
    }
}

impl std::fmt::Display for WallTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

impl Serialize for WallTime {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for WallTime {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// DST-aware trading zone, resolving wall-clock times against a trading date.
///
/// Resolution is deterministic across DST transitions: a nonexistent local time
/// (spring-forward gap) resolves to the first valid instant after the gap, and an
/// ambiguous local time (fall-back overlap) resolves to the later of the two instants.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct TradingZone(pub Tz);

impl TradingZone {
    pub fn parse(name: &str) -> Result<Self, TimeError> {
        name.parse::<Tz>()
            .map(Self)
            .map_err(|_| TimeError::UnknownZone(name.to_string()))
    }

    /// Resolve `wall` on `date` to a concrete UTC instant.
    pub fn resolve(&self, date: NaiveDate, wall: WallTime) -> DateTime<Utc> {
        self.resolve_naive(date.and_time(wall.as_naive()))
    }

    /// Resolve an arbitrary naive local datetime to UTC under the deterministic
    /// DST policy.
    pub fn resolve_naive(&self, local: NaiveDateTime) -> DateTime<Utc> {
        match self.0.from_local_datetime(&local) {
            LocalResult::Single(instant) => instant.with_timezone(&Utc),
            LocalResult::Ambiguous(_, later) => later.with_timezone(&Utc),
            LocalResult::None => {
                // Spring-forward gap: probe forward in one-minute steps until the zone
                // produces a valid instant, then take it.
                let mut probe = local;
                loop {
                    probe += TimeDelta::minutes(1);
                    match self.0.from_local_datetime(&probe) {
                        LocalResult::Single(instant) => break instant.with_timezone(&Utc),
                        LocalResult::Ambiguous(_, later) => break later.with_timezone(&Utc),
                        LocalResult::None => continue,
                    }
                }
            }
        }
    }

    /// Session window for bar acceptance on `trading_date`.
    ///
    /// `open` is interpreted on the previous calendar day when it is not earlier than
    /// `close` (the overnight futures session, eg/ 17:00 -> 16:00).
    pub fn session_window(&self, trading_date: NaiveDate, open: WallTime, close: WallTime) -> TimeWindow {
        let open_date = if open >= close {
            trading_date.pred_opt().unwrap_or(trading_date)
        } else {
            trading_date
        };

        TimeWindow::new(
            self.resolve(open_date, open),
            self.resolve(trading_date, close),
        )
    }
}
