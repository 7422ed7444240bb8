use crate::{
    TimeWindow,
    bar::{Bar, OhlcMismatch},
};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Outcome of a [`BarBuffer::upsert`].
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Upserted {
    /// No bar was stored under the key.
    Inserted,
    /// A stored bar was overwritten by a strictly higher-precedence source. Any OHLC
    /// disagreements are reported so the caller can emit a dedup metric event.
    Replaced { mismatches: Vec<OhlcMismatch> },
    /// The incoming bar's source did not out-rank the stored bar.
    Ignored,
}

/// Per-instrument ordered bar store.
///
/// Bars are keyed by open time; the owner guarantees all inserted bars belong to a
/// single instrument. Precedence on key collision: `Live > BarsRequest > Csv`, with
/// equal-precedence collisions ignored (first write wins).
#[derive(Debug, Default, Clone)]
pub struct BarBuffer {
    bars: BTreeMap<DateTime<Utc>, Bar>,
}

impl BarBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn upsert(&mut self, bar: Bar) -> Upserted {
        match self.bars.get(&bar.open_time) {
            None => {
                self.bars.insert(bar.open_time, bar);
                Upserted::Inserted
            }
            Some(stored) if bar.source > stored.source => {
                let mismatches = stored.diff_ohlc(&bar);
                self.bars.insert(bar.open_time, bar);
                Upserted::Replaced { mismatches }
            }
            Some(_) => Upserted::Ignored,
        }
    }

    pub fn get(&self, open_time: DateTime<Utc>) -> Option<&Bar> {
        self.bars.get(&open_time)
    }

    /// Bars with open time inside the half-open `window`, in ascending open-time order.
    /// An inverted window yields nothing.
    pub fn bars_in(&self, window: TimeWindow) -> impl Iterator<Item = &Bar> {
        let end = window.end.max(window.start);
        self.bars.range(window.start..end).map(|(_, bar)| bar)
    }

    /// Bars with open time in the closed interval `[start, end]`, ascending. Used by the
    /// missed-breakout scan which is inclusive at both edges.
    pub fn bars_in_closed(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> impl Iterator<Item = &Bar> {
        let end = end.max(start);
        self.bars.range(start..=end).map(|(_, bar)| bar)
    }

    /// The most recent bar with open time strictly before `instant`.
    pub fn last_before(&self, instant: DateTime<Utc>) -> Option<&Bar> {
        self.bars.range(..instant).next_back().map(|(_, bar)| bar)
    }

    /// Open time of the newest stored bar.
    pub fn latest_open_time(&self) -> Option<DateTime<Utc>> {
        self.bars.keys().next_back().copied()
    }
}
