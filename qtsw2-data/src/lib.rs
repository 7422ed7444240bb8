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

//! # QTSW2-Data
//! Bar ingestion for the QTSW2 breakout engine: the normalised [`Bar`](bar::Bar) model,
//! admission checks, timestamp-interpretation locking, a per-instrument ordered
//! [`BarBuffer`](buffer::BarBuffer) with source-precedence deduplication, and the
//! [`BarProvider`](provider::BarProvider) historical-fetch boundary.

use chrono::{DateTime, Utc};
use derive_more::Constructor;
use serde::{Deserialize, Serialize};

/// Normalised OHLCV `Bar` model and its upstream sources.
pub mod bar;

/// Per-instrument ordered bar store with source-precedence merge.
pub mod buffer;

/// Bar admission checks and the one-shot timestamp-interpretation lock.
pub mod ingest;

/// Historical bar fetch boundary and the CSV file provider.
pub mod provider;

/// DST-aware wall-clock resolution and the session-window model.
pub mod time;

/// Defines all possible errors in QTSW2-Data.
pub mod error;

/// A half-open UTC time window `[start, end)`.
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Constructor,
)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    /// True if `instant` lies inside `[start, end)`.
    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.start <= instant && instant < self.end
    }
}
