use chrono::{DateTime, TimeDelta, Utc};
use fnv::FnvHashMap;
use qtsw2_execution::intent::{Intent, IntentId};
use qtsw2_instrument::Direction;
use rust_decimal::Decimal;

/// Minimum spacing between break-even scans and between modify attempts per intent.
const THROTTLE: TimeDelta = TimeDelta::milliseconds(200);

/// Price probe per instrument, taken from the latest admitted bar's extremes.
///
/// Bar extremes are the engine's authoritative price source: the whole pipeline is
/// bar-driven and no tick-quote feed exists in scope.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PriceProbe {
    pub high: Decimal,
    pub low: Decimal,
    pub at: DateTime<Utc>,
}

/// Decides when a filled intent's stop slides to break-even.
///
/// The execution journal's `be_modified` flag is the exactly-once guard; this monitor
/// adds the trigger comparison, the only-tighten rule and the throttles.
#[derive(Debug, Default)]
pub struct BreakEvenMonitor {
    last_scan: Option<DateTime<Utc>>,
    last_attempt: FnvHashMap<IntentId, DateTime<Utc>>,
}

impl BreakEvenMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scan throttle: at most one pass per 200 ms.
    pub fn scan_due(&mut self, now: DateTime<Utc>) -> bool {
        match self.last_scan {
            Some(last) if now - last < THROTTLE => false,
            _ => {
                self.last_scan = Some(now);
                true
            }
        }
    }

    /// Whether `intent` should fire a break-even modify against `probe` now.
    ///
    /// The caller guarantees the intent is filled and not yet modified (the journal's
    /// working set); this adds trigger, only-tighten and per-intent throttle checks.
    pub fn should_fire(&mut self, intent: &Intent, probe: &PriceProbe, now: DateTime<Utc>) -> bool {
        if let Some(last) = self.last_attempt.get(&intent.id) {
            if now - *last < THROTTLE {
                return false;
            }
        }

        let triggered = match intent.direction {
            Direction::Long => probe.high >= intent.be_trigger_price,
            Direction::Short => probe.low <= intent.be_trigger_price,
        };
        if !triggered {
            return false;
        }

        // Only tighten: never move the stop away from the market.
        let tightens = match intent.direction {
            Direction::Long => intent.be_stop_price > intent.stop_price,
            Direction::Short => intent.be_stop_price < intent.stop_price,
        };
        if !tightens {
            return false;
        }

        self.last_attempt.insert(intent.id.clone(), now);
        true
    }
}
