use crate::stream::range::Range;
use qtsw2_data::bar::Bar;
use qtsw2_instrument::{Direction, tick::TickSize};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// The tick-rounded trigger prices one tick outside the locked range.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct BreakoutLevels {
    pub long: Decimal,
    pub short: Decimal,
}

pub fn breakout_levels(range: &Range, tick: TickSize) -> BreakoutLevels {
    BreakoutLevels {
        long: tick.above(range.high),
        short: tick.below(range.low),
    }
}

/// Immediate entry decision from the freeze close at range lock. Equality triggers.
pub fn immediate_direction(range: &Range, levels: &BreakoutLevels) -> Option<Direction> {
    if range.freeze_close >= levels.long {
        Some(Direction::Long)
    } else if range.freeze_close <= levels.short {
        Some(Direction::Short)
    } else {
        None
    }
}

/// Breakout decision for a single bar. Equality triggers; when one bar breaches both
/// sides the long side wins.
pub fn bar_breakout(bar: &Bar, levels: &BreakoutLevels) -> Option<Direction> {
    if bar.high >= levels.long {
        Some(Direction::Long)
    } else if bar.low <= levels.short {
        Some(Direction::Short)
    } else {
        None
    }
}

/// Scan bars in ascending open-time order for the first breakout. Earliest bar wins.
pub fn scan_first_breakout<'a, Bars>(bars: Bars, levels: &BreakoutLevels) -> Option<(Direction, &'a Bar)>
where
    Bars: IntoIterator<Item = &'a Bar>,
{
    bars.into_iter()
        .find_map(|bar| bar_breakout(bar, levels).map(|direction| (direction, bar)))
}

/// Every price level of a bracketed breakout entry, computed once at breakout.
///
/// Order prices (`entry`, `stop`, `target`, `be_stop`) are tick-aligned; `be_trigger`
/// is a detection threshold, not an order price, and stays unrounded.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct BracketLevels {
    pub entry: Decimal,
    pub stop: Decimal,
    pub target: Decimal,
    pub be_trigger: Decimal,
    pub be_stop: Decimal,
}

/// Fraction of the target distance at which the stop slides to break-even.
fn be_fraction() -> Decimal {
    Decimal::new(65, 2)
}

pub fn bracket_levels(
    direction: Direction,
    breakout_level: Decimal,
    tick: TickSize,
    target_pts: Decimal,
    range_size: Decimal,
) -> BracketLevels {
    let entry = tick.round(breakout_level);
    let stop_distance = range_size.min(Decimal::from(3) * target_pts);
    let be_offset = target_pts * be_fraction();

    match direction {
        Direction::Long => BracketLevels {
            entry,
            stop: tick.round(entry - stop_distance),
            target: tick.round(entry + target_pts),
            be_trigger: entry + be_offset,
            be_stop: tick.round(entry - tick.value()),
        },
        Direction::Short => BracketLevels {
            entry,
            stop: tick.round(entry + stop_distance),
            target: tick.round(entry - target_pts),
            be_trigger: entry - be_offset,
            be_stop: tick.round(entry + tick.value()),
        },
    }
}
