use chrono::{DateTime, TimeDelta, Utc};
use qtsw2_data::{TimeWindow, buffer::BarBuffer};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Minimum bars required in the pre-slot window before a range may lock.
pub const MIN_RANGE_BARS: usize = 3;

/// The locked price range of one stream.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct Range {
    pub high: Decimal,
    pub low: Decimal,
    /// Close of the last bar with open time strictly before the slot.
    pub freeze_close: Decimal,
    pub bar_count: usize,
}

impl Range {
    pub fn size(&self) -> Decimal {
        self.high - self.low
    }
}

/// Range computation failures.
///
/// Benign variants retry on every tick until market close; actionable variants demand
/// operator investigation and never commit the stream.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize, Error)]
pub enum RangeComputeError {
    #[error("NO_BARS_YET")]
    NoBarsYet,

    #[error("NO_BARS_IN_WINDOW")]
    NoBarsInWindow,

    #[error("INSUFFICIENT_BARS: {count} < {min}", min = MIN_RANGE_BARS)]
    InsufficientBars { count: usize },

    #[error("OUTSIDE_RANGE_WINDOW")]
    OutsideRangeWindow,

    #[error("BARS_FROM_WRONG_DATE")]
    BarsFromWrongDate,

    #[error("INVALID_RANGE_HIGH_LOW: high {high} < low {low}")]
    InvalidRangeHighLow { high: Decimal, low: Decimal },

    #[error("NO_FREEZE_CLOSE")]
    NoFreezeClose,
}

impl RangeComputeError {
    /// Stable code for event data and per-stream log throttling keys.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoBarsYet => "NO_BARS_YET",
            Self::NoBarsInWindow => "NO_BARS_IN_WINDOW",
            Self::InsufficientBars { .. } => "INSUFFICIENT_BARS",
            Self::OutsideRangeWindow => "OUTSIDE_RANGE_WINDOW",
            Self::BarsFromWrongDate => "BARS_FROM_WRONG_DATE",
            Self::InvalidRangeHighLow { .. } => "INVALID_RANGE_HIGH_LOW",
            Self::NoFreezeClose => "NO_FREEZE_CLOSE",
        }
    }

    pub fn is_benign(&self) -> bool {
        match self {
            Self::NoBarsYet
            | Self::NoBarsInWindow
            | Self::InsufficientBars { .. }
            | Self::OutsideRangeWindow
            | Self::BarsFromWrongDate => true,
            Self::InvalidRangeHighLow { .. } | Self::NoFreezeClose => false,
        }
    }
}

/// Compute the range over bars with open time in `[range_start, slot_time)`.
///
/// `session_window` distinguishes an empty pre-slot window (benign retry) from a
/// buffer holding only bars of the wrong session date.
pub fn compute_range(
    buffer: &BarBuffer,
    range_window: TimeWindow,
    session_window: TimeWindow,
) -> Result<Range, RangeComputeError> {
    if buffer.is_empty() {
        return Err(RangeComputeError::NoBarsYet);
    }

    let mut high: Option<Decimal> = None;
    let mut low: Option<Decimal> = None;
    let mut freeze_close: Option<Decimal> = None;
    let mut count = 0usize;

    for bar in buffer.bars_in(range_window) {
        count += 1;
        high = Some(high.map_or(bar.high, |h| h.max(bar.high)));
        low = Some(low.map_or(bar.low, |l| l.min(bar.low)));
        // Ascending iteration: the last in-window bar carries the freeze close.
        freeze_close = Some(bar.close);
    }

    if count == 0 {
        let any_in_session = buffer
            .bars_in(session_window)
            .next()
            .is_some();
        return Err(if any_in_session {
            RangeComputeError::NoBarsInWindow
        } else {
            RangeComputeError::BarsFromWrongDate
        });
    }

    if count < MIN_RANGE_BARS {
        return Err(RangeComputeError::InsufficientBars { count });
    }

    let (high, low) = (high.expect("count > 0"), low.expect("count > 0"));
    if high < low {
        return Err(RangeComputeError::InvalidRangeHighLow { high, low });
    }

    let freeze_close = freeze_close.ok_or(RangeComputeError::NoFreezeClose)?;

    Ok(Range {
        high,
        low,
        freeze_close,
        bar_count: count,
    })
}

/// Pre-slot gap-tolerance limits between consecutive accepted bar open times.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct GapLimits {
    pub max_single_gap: TimeDelta,
    pub max_total_gap: TimeDelta,
    pub max_gap_last_ten: TimeDelta,
}

impl Default for GapLimits {
    fn default() -> Self {
        Self {
            max_single_gap: TimeDelta::minutes(3),
            max_total_gap: TimeDelta::minutes(6),
            max_gap_last_ten: TimeDelta::minutes(2),
        }
    }
}

/// A gap-tolerance breach, carrying enough detail for the journal commit reason data.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum GapBreach {
    SingleGap {
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        gap: TimeDelta,
    },
    TotalGap {
        total: TimeDelta,
    },
    LastTenMinutes {
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        gap: TimeDelta,
    },
}

/// Nominal bar cadence; time between consecutive opens beyond this counts as missing.
const NOMINAL_BAR_SPACING: TimeDelta = TimeDelta::minutes(1);

/// Check the pre-slot window bars against the gap limits.
///
/// A "gap" is the open-time delta between consecutive accepted bars; the total is the
/// accumulated time missing beyond the nominal one-minute cadence. The last-ten-minutes
/// check applies the tighter limit to pairs whose later bar opens within ten minutes of
/// the slot.
pub fn check_gap_tolerance(
    buffer: &BarBuffer,
    range_window: TimeWindow,
    limits: &GapLimits,
) -> Option<GapBreach> {
    let last_ten_start = range_window.end - TimeDelta::minutes(10);
    let mut total_missing = TimeDelta::zero();
    let mut previous: Option<DateTime<Utc>> = None;

    for bar in buffer.bars_in(range_window) {
        if let Some(prev) = previous {
            let gap = bar.open_time - prev;

            if gap > limits.max_single_gap {
                return Some(GapBreach::SingleGap {
                    from: prev,
                    to: bar.open_time,
                    gap,
                });
            }

            if bar.open_time >= last_ten_start && gap > limits.max_gap_last_ten {
                return Some(GapBreach::LastTenMinutes {
                    from: prev,
                    to: bar.open_time,
                    gap,
                });
            }

            if gap > NOMINAL_BAR_SPACING {
                total_missing += gap - NOMINAL_BAR_SPACING;
                if total_missing > limits.max_total_gap {
                    return Some(GapBreach::TotalGap {
                        total: total_missing,
                    });
                }
            }
        }
        previous = Some(bar.open_time);
    }

    None
}
