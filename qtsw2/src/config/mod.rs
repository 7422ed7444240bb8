use chrono::NaiveDate;
use indexmap::IndexMap;
use qtsw2_data::time::{TimeError, TradingZone, WallTime};
use qtsw2_instrument::{InstrumentName, SessionId, StreamId, tick::{TickError, TickSize}};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use smol_str::SmolStr;
use std::path::Path;
use thiserror::Error;

/// Environment-variable driven path resolution.
pub mod paths;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("parse {path}: {detail}")]
    Parse { path: String, detail: String },

    #[error("timetable stream {stream}: {detail}")]
    StreamInvalid { stream: StreamId, detail: String },

    #[error("time: {0}")]
    Time(#[from] TimeError),

    #[error("tick: {0}")]
    Tick(#[from] TickError),
}

/// SHA-256 content hash of a loaded document, driving change-detection reloads.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Deserialize, Serialize, derive_more::Display)]
pub struct ContentHash(pub SmolStr);

impl ContentHash {
    pub fn of(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        Self(SmolStr::from(hex::encode(digest)))
    }
}

/// One stream directive from the timetable.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct StreamDirective {
    pub stream: StreamId,
    pub instrument: InstrumentName,
    pub session: SessionId,
    pub slot_time: WallTime,
    pub enabled: bool,
}

/// The time-indexed plan: one trading date in a named zone plus stream directives.
///
/// Immutable per load; the engine re-loads on content-hash change but never lets a
/// reload move the locked trading date.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct Timetable {
    pub trading_date: NaiveDate,
    pub timezone: String,
    pub streams: Vec<StreamDirective>,
}

impl Timetable {
    pub fn load(path: &Path) -> Result<(Self, ContentHash), ConfigError> {
        let bytes = std::fs::read(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let hash = ContentHash::of(&bytes);
        let timetable = serde_json::from_slice(&bytes).map_err(|err| ConfigError::Parse {
            path: path.display().to_string(),
            detail: err.to_string(),
        })?;
        Ok((timetable, hash))
    }

    pub fn zone(&self) -> Result<TradingZone, ConfigError> {
        Ok(TradingZone::parse(&self.timezone)?)
    }

    /// Validate every enabled directive against the parity spec: known session, known
    /// instrument with a usable tick size and target ladder, and a slot time the
    /// session actually ends at.
    pub fn validate(&self, parity: &ParitySpec) -> Result<(), ConfigError> {
        for directive in self.streams.iter().filter(|d| d.enabled) {
            let invalid = |detail: String| ConfigError::StreamInvalid {
                stream: directive.stream.clone(),
                detail,
            };

            let session = parity
                .sessions
                .get(directive.session.as_str())
                .ok_or_else(|| invalid(format!("unknown session {}", directive.session)))?;

            if !session.slot_end_times.contains(&directive.slot_time) {
                return Err(invalid(format!(
                    "slot_time {} not in session {} slot_end_times",
                    directive.slot_time, directive.session
                )));
            }

            let instrument = parity
                .instruments
                .get(directive.instrument.as_str())
                .ok_or_else(|| invalid(format!("unknown instrument {}", directive.instrument)))?;

            TickSize::new(instrument.tick_size)?;
            if instrument.targets.is_empty() {
                return Err(invalid(format!(
                    "instrument {} has an empty target ladder",
                    directive.instrument
                )));
            }
        }

        Ok(())
    }
}

/// Per-instrument parity parameters.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct InstrumentSpec {
    pub tick_size: Decimal,
    /// Target ladder in points; the first rung is the base target.
    pub targets: Vec<Decimal>,
}

impl InstrumentSpec {
    pub fn base_target(&self) -> Option<Decimal> {
        self.targets.first().copied()
    }
}

/// Per-session parity parameters.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct SessionSpec {
    pub range_start_time: WallTime,
    pub slot_end_times: Vec<WallTime>,
}

#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct EntryCutoff {
    pub market_close_time: WallTime,
}

/// The parity spec: instrument and session parameters plus the entry cutoff.
/// Unchangeable during a run.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct ParitySpec {
    pub instruments: IndexMap<SmolStr, InstrumentSpec>,
    pub sessions: IndexMap<SmolStr, SessionSpec>,
    pub entry_cutoff: EntryCutoff,
}

impl ParitySpec {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let bytes = std::fs::read(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_slice(&bytes).map_err(|err| ConfigError::Parse {
            path: path.display().to_string(),
            detail: err.to_string(),
        })
    }
}
