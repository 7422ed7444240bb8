#![forbid(unsafe_code)]
#![warn(
    unused,
    clippy::cognitive_complexity,
    unused_crate_dependencies,
    unused_extern_crates,
    clippy::unused_self,
    clippy::useless_let_if_seq,
    missing_debug_implementations,
    rust_2018_idioms,
    rust_2024_compatibility
)]
#![allow(clippy::type_complexity)]

//! # QTSW2-Instrument
//! Core QTSW2 instrument, session and tick-arithmetic data structures shared by the
//! data, execution and engine crates.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::borrow::Borrow;

/// Tick-size arithmetic for instrument price levels.
///
/// eg/ `TickSize`, `round_to_tick`.
pub mod tick;

/// QTSW2 `SmolStr` representation of a tradeable instrument symbol.
///
/// eg/ "ES", "NQ", "MES".
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Display)]
pub struct InstrumentName(pub SmolStr);

impl InstrumentName {
    pub fn new<S>(name: S) -> Self
    where
        S: Into<SmolStr>,
    {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl From<&str> for InstrumentName {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl Borrow<str> for InstrumentName {
    fn borrow(&self) -> &str {
        self.0.borrow()
    }
}

impl AsRef<str> for InstrumentName {
    fn as_ref(&self) -> &str {
        self.0.as_ref()
    }
}

/// Unique identifier for a timetable stream - one session of one instrument.
///
/// eg/ "ES1", "NQ2".
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Display)]
pub struct StreamId(pub SmolStr);

impl StreamId {
    pub fn new<S>(id: S) -> Self
    where
        S: Into<SmolStr>,
    {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl From<&str> for StreamId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Identifier for a parity-spec session definition.
///
/// eg/ "S1", "S2".
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Display)]
pub struct SessionId(pub SmolStr);

impl SessionId {
    pub fn new<S>(id: S) -> Self
    where
        S: Into<SmolStr>,
    {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Direction of a breakout trade.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
pub enum Direction {
    #[serde(alias = "long", alias = "LONG")]
    Long,
    #[serde(alias = "short", alias = "SHORT")]
    Short,
}

impl Direction {
    /// Opposite trade direction, used when flattening a position.
    pub fn inverse(self) -> Self {
        match self {
            Self::Long => Self::Short,
            Self::Short => Self::Long,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Direction::Long => "long",
                Direction::Short => "short",
            }
        )
    }
}
