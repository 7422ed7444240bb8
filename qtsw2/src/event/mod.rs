use crate::RunId;
use chrono::{DateTime, TimeDelta, Utc};
use fnv::FnvHashMap;
use qtsw2_instrument::InstrumentName;
use serde::{Deserialize, Serialize};
use std::hash::Hash;

/// Asynchronous JSONL event log writer with rotation and archival.
pub mod log;

/// Event severity, mirroring the log levels downstream tools filter on.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Debug,
    Info,
    Warn,
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        }
    }
}

/// The closed set of event types the engine may emit.
///
/// Severity and critical-escalation eligibility come from this registry, never from
/// string matching. An event type outside this enum cannot be emitted.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    // Engine lifecycle
    EngineStarted,
    EngineStopped,
    EngineTickStall,
    EngineTickRecovered,
    MidSessionRestart,

    // Timetable
    TimetableApplied,
    TimetableInvalid,
    TimetableReloadConflict,
    TradingDateLocked,

    // Bars
    BarRejected,
    BarDeduped,
    BarTimestampLocked,
    BarTimestampSuspect,

    // Stream lifecycle
    StreamStateChanged,
    RangeLocked,
    RangeComputeRetry,
    RangeComputeFailed,
    RangeInvalidated,
    BreakoutDetected,
    StreamCommitted,
    StandDownEntered,

    // Execution
    ExecutionGateBlocked,
    ExecutionGateInvariantViolation,
    EntrySubmitted,
    EntryAccepted,
    EntryRejected,
    EntrySubmitFailed,
    EntryFilled,
    ProtectivesPlaced,
    ProtectivesFailed,
    PositionFlattened,
    BreakEvenModified,
    OrdersCancelled,

    // Supervision
    ConnectionLostSustained,
    DataStall,
    DisconnectFailClosedEntered,
    RecoveryComplete,

    // Infrastructure
    LogSlow,
    LogQueueOverflow,
}

impl EventKind {
    pub fn severity(&self) -> Severity {
        match self {
            Self::BarDeduped => Severity::Debug,

            Self::EngineStarted
            | Self::EngineStopped
            | Self::EngineTickRecovered
            | Self::TimetableApplied
            | Self::TradingDateLocked
            | Self::BarTimestampLocked
            | Self::StreamStateChanged
            | Self::RangeLocked
            | Self::BreakoutDetected
            | Self::StreamCommitted
            | Self::EntrySubmitted
            | Self::EntryAccepted
            | Self::EntryFilled
            | Self::ProtectivesPlaced
            | Self::BreakEvenModified
            | Self::OrdersCancelled
            | Self::RecoveryComplete => Severity::Info,

            Self::MidSessionRestart
            | Self::TimetableReloadConflict
            | Self::BarRejected
            | Self::BarTimestampSuspect
            | Self::RangeComputeRetry
            | Self::RangeInvalidated
            | Self::ExecutionGateBlocked
            | Self::EntrySubmitFailed
            | Self::PositionFlattened
            | Self::DataStall
            | Self::LogSlow => Severity::Warn,

            Self::EngineTickStall
            | Self::TimetableInvalid
            | Self::RangeComputeFailed
            | Self::StandDownEntered
            | Self::ExecutionGateInvariantViolation
            | Self::EntryRejected
            | Self::ProtectivesFailed
            | Self::ConnectionLostSustained
            | Self::DisconnectFailClosedEntered
            | Self::LogQueueOverflow => Severity::Error,
        }
    }

    /// Whitelist of event types eligible for critical-notification escalation.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            Self::ExecutionGateInvariantViolation | Self::DisconnectFailClosedEntered
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EngineStarted => "ENGINE_STARTED",
            Self::EngineStopped => "ENGINE_STOPPED",
            Self::EngineTickStall => "ENGINE_TICK_STALL",
            Self::EngineTickRecovered => "ENGINE_TICK_RECOVERED",
            Self::MidSessionRestart => "MID_SESSION_RESTART",
            Self::TimetableApplied => "TIMETABLE_APPLIED",
            Self::TimetableInvalid => "TIMETABLE_INVALID",
            Self::TimetableReloadConflict => "TIMETABLE_RELOAD_CONFLICT",
            Self::TradingDateLocked => "TRADING_DATE_LOCKED",
            Self::BarRejected => "BAR_REJECTED",
            Self::BarDeduped => "BAR_DEDUPED",
            Self::BarTimestampLocked => "BAR_TIMESTAMP_LOCKED",
            Self::BarTimestampSuspect => "BAR_TIMESTAMP_SUSPECT",
            Self::StreamStateChanged => "STREAM_STATE_CHANGED",
            Self::RangeLocked => "RANGE_LOCKED",
            Self::RangeComputeRetry => "RANGE_COMPUTE_RETRY",
            Self::RangeComputeFailed => "RANGE_COMPUTE_FAILED",
            Self::RangeInvalidated => "RANGE_INVALIDATED",
            Self::BreakoutDetected => "BREAKOUT_DETECTED",
            Self::StreamCommitted => "STREAM_COMMITTED",
            Self::StandDownEntered => "STAND_DOWN_ENTERED",
            Self::ExecutionGateBlocked => "EXECUTION_GATE_BLOCKED",
            Self::ExecutionGateInvariantViolation => "EXECUTION_GATE_INVARIANT_VIOLATION",
            Self::EntrySubmitted => "ENTRY_SUBMITTED",
            Self::EntryAccepted => "ENTRY_ACCEPTED",
            Self::EntryRejected => "ENTRY_REJECTED",
            Self::EntrySubmitFailed => "ENTRY_SUBMIT_FAILED",
            Self::EntryFilled => "ENTRY_FILLED",
            Self::ProtectivesPlaced => "PROTECTIVES_PLACED",
            Self::ProtectivesFailed => "PROTECTIVES_FAILED",
            Self::PositionFlattened => "POSITION_FLATTENED",
            Self::BreakEvenModified => "BREAK_EVEN_MODIFIED",
            Self::OrdersCancelled => "ORDERS_CANCELLED",
            Self::ConnectionLostSustained => "CONNECTION_LOST_SUSTAINED",
            Self::DataStall => "DATA_STALL",
            Self::DisconnectFailClosedEntered => "DISCONNECT_FAIL_CLOSED_ENTERED",
            Self::RecoveryComplete => "RECOVERY_COMPLETE",
            Self::LogSlow => "LOG_SLOW",
            Self::LogQueueOverflow => "LOG_QUEUE_OVERFLOW",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One structured event, serialized as a single JSONL object.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct EventRecord {
    pub ts_utc: DateTime<Utc>,
    pub level: Severity,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instrument: Option<InstrumentName>,
    pub event: EventKind,
    pub run_id: RunId,
    pub data: serde_json::Value,
}

/// Keys whose values are replaced before an event record leaves the process.
const SENSITIVE_KEYS: [&str; 5] = ["account", "api_key", "token", "password", "secret"];

/// Recursively blank sensitive values in event `data`.
pub fn redact(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, entry) in map.iter_mut() {
                if SENSITIVE_KEYS.contains(&key.as_str()) {
                    *entry = serde_json::Value::String("***".into());
                } else {
                    redact(entry);
                }
            }
        }
        serde_json::Value::Array(entries) => {
            for entry in entries.iter_mut() {
                redact(entry);
            }
        }
        _ => {}
    }
}

/// Per-key emission limiter: at most one permit per `interval` per key.
#[derive(Debug)]
pub struct RateLimiter<Key> {
    interval: TimeDelta,
    last: FnvHashMap<Key, DateTime<Utc>>,
}

impl<Key> RateLimiter<Key>
where
    Key: Eq + Hash,
{
    pub fn new(interval: TimeDelta) -> Self {
        Self {
            interval,
            last: FnvHashMap::default(),
        }
    }

    /// One permit per minute per key.
    pub fn per_minute() -> Self {
        Self::new(TimeDelta::minutes(1))
    }

    pub fn allow(&mut self, key: Key, now: DateTime<Utc>) -> bool {
        match self.last.get(&key) {
            Some(last) if now - *last < self.interval => false,
            _ => {
                self.last.insert(key, now);
                true
            }
        }
    }
}
