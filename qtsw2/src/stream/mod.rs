use crate::{
    event::RateLimiter,
    stream::{
        breakout::{
            BreakoutLevels, bar_breakout, bracket_levels, breakout_levels, immediate_direction,
            scan_first_breakout,
        },
        range::{GapBreach, GapLimits, Range, RangeComputeError, check_gap_tolerance, compute_range},
    },
};
use chrono::{DateTime, NaiveDate, Utc};
use qtsw2_data::{
    TimeWindow,
    bar::{Bar, OhlcMismatch},
    buffer::{BarBuffer, Upserted},
    time::WallTime,
};
use qtsw2_execution::{
    intent::{Intent, IntentId},
    order::OcoGroupId,
};
use qtsw2_instrument::{Direction, InstrumentName, SessionId, StreamId, tick::TickSize};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Breakout trigger and protective-bracket price arithmetic.
pub mod breakout;

/// Pre-slot range reconstruction and gap-tolerance checks.
pub mod range;

/// Terminal journal marker reason for a stream on a trading date.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommitReason {
    EntryFilled,
    MarketCloseNoTrade,
    GapToleranceExceeded,
    EntryRejected,
    ProtectivesFailed,
    StandDown,
}

impl CommitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EntryFilled => "ENTRY_FILLED",
            Self::MarketCloseNoTrade => "MARKET_CLOSE_NO_TRADE",
            Self::GapToleranceExceeded => "GAP_TOLERANCE_EXCEEDED",
            Self::EntryRejected => "ENTRY_REJECTED",
            Self::ProtectivesFailed => "PROTECTIVES_FAILED",
            Self::StandDown => "STAND_DOWN",
        }
    }
}

impl std::fmt::Display for CommitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-stream lifecycle state.
///
/// Transitions advance strictly along the DAG:
/// `PreHydration -> Armed -> RangeBuilding -> RangeLocked -> Triggered -> Committed`,
/// with `RangeInvalidated` (commit-equivalent) and `StandDown` (operator required)
/// as additional terminals.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub enum StreamState {
    PreHydration,
    Armed,
    RangeBuilding,
    RangeLocked,
    Triggered,
    RangeInvalidated,
    Committed,
    StandDown,
}

impl StreamState {
    /// Committed or commit-equivalent: all further bars and ticks are ignored.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Committed | Self::RangeInvalidated)
    }
}

impl std::fmt::Display for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::PreHydration => "PreHydration",
            Self::Armed => "Armed",
            Self::RangeBuilding => "RangeBuilding",
            Self::RangeLocked => "RangeLocked",
            Self::Triggered => "Triggered",
            Self::RangeInvalidated => "RangeInvalidated",
            Self::Committed => "Committed",
            Self::StandDown => "StandDown",
        };
        f.write_str(s)
    }
}

/// Static per-stream parameters resolved from the timetable and parity spec.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub id: StreamId,
    pub instrument: InstrumentName,
    pub session: SessionId,
    pub trading_date: NaiveDate,
    pub slot_wall: WallTime,
    pub range_start: DateTime<Utc>,
    pub slot_time: DateTime<Utc>,
    pub market_close: DateTime<Utc>,
    pub session_window: TimeWindow,
    pub tick_size: TickSize,
    pub base_target: Decimal,
    pub gap_limits: GapLimits,
}

impl StreamConfig {
    pub fn range_window(&self) -> TimeWindow {
        TimeWindow::new(self.range_start, self.slot_time)
    }
}

/// Effects a [`Stream`] asks its owner to perform: journal writes, event emission and
/// gate submission all happen in the engine, keeping the machine free of I/O.
#[derive(Debug, Clone)]
pub enum StreamOutput {
    Transitioned {
        prev: StreamState,
        next: StreamState,
    },
    RangeLocked {
        range: Range,
        levels: BreakoutLevels,
    },
    /// Benign range-compute failure; already throttled to one per minute per stream.
    RangeRetry {
        error: RangeComputeError,
    },
    /// Actionable range-compute failure; emitted on every occurrence.
    RangeFailed {
        error: RangeComputeError,
    },
    GapInvalidated(GapBreach),
    BreakoutDetected {
        direction: Direction,
        bar_open_time: DateTime<Utc>,
    },
    /// Hand the constructed intent to the execution gate.
    IntentReady(Intent),
    DedupMismatch {
        bar_open_time: DateTime<Utc>,
        mismatches: Vec<OhlcMismatch>,
    },
    Committed(CommitReason),
}

/// One (stream_id, trading_date) trading lifecycle, driven by `tick` and `on_bar`.
#[derive(Debug)]
pub struct Stream {
    config: StreamConfig,
    state: StreamState,
    buffer: BarBuffer,
    range: Option<Range>,
    levels: Option<BreakoutLevels>,
    intent: Option<Intent>,
    commit_reason: Option<CommitReason>,
    retry_limiter: RateLimiter<&'static str>,
}

impl Stream {
    pub fn new(config: StreamConfig) -> Self {
        Self {
            config,
            state: StreamState::PreHydration,
            buffer: BarBuffer::new(),
            range: None,
            levels: None,
            intent: None,
            commit_reason: None,
            retry_limiter: RateLimiter::per_minute(),
        }
    }

    /// Restore a stream whose journal is already committed: short-circuit directly to
    /// the terminal state and ignore all further inputs.
    pub fn new_committed(config: StreamConfig, reason: Option<CommitReason>) -> Self {
        let mut stream = Self::new(config);
        stream.state = StreamState::Committed;
        stream.commit_reason = reason;
        stream
    }

    pub fn id(&self) -> &StreamId {
        &self.config.id
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn range(&self) -> Option<&Range> {
        self.range.as_ref()
    }

    pub fn intent(&self) -> Option<&Intent> {
        self.intent.as_ref()
    }

    pub fn commit_reason(&self) -> Option<CommitReason> {
        self.commit_reason
    }

    /// True while the gate's computed-state invariant holds for an entry submission.
    pub fn entry_allowed(&self) -> bool {
        self.state == StreamState::Triggered && self.intent.is_some()
    }

    /// Hydration finished (historical bars ingested). Leaves `PreHydration` for
    /// `Armed`, or straight to `RangeBuilding` on a late start past the slot.
    pub fn complete_hydration(&mut self, now: DateTime<Utc>) -> Vec<StreamOutput> {
        if self.state != StreamState::PreHydration {
            return Vec::new();
        }

        if now < self.config.slot_time {
            vec![self.transition(StreamState::Armed)]
        } else {
            let mut outputs = vec![self.transition(StreamState::RangeBuilding)];
            outputs.extend(self.try_lock(now));
            outputs
        }
    }

    /// Deliver an admitted bar. Buffered in every pre-terminal state; drives breakout
    /// detection once the range is locked.
    pub fn on_bar(&mut self, bar: &Bar, _now: DateTime<Utc>) -> Vec<StreamOutput> {
        if self.state.is_terminal()
            || matches!(self.state, StreamState::StandDown | StreamState::Triggered)
        {
            return Vec::new();
        }

        let mut outputs = Vec::new();
        match self.buffer.upsert(bar.clone()) {
            Upserted::Replaced { mismatches } if !mismatches.is_empty() => {
                outputs.push(StreamOutput::DedupMismatch {
                    bar_open_time: bar.open_time,
                    mismatches,
                });
            }
            _ => {}
        }

        if self.state == StreamState::RangeLocked && bar.open_time >= self.config.slot_time {
            if bar.open_time >= self.config.market_close {
                outputs.extend(self.commit(CommitReason::MarketCloseNoTrade, StreamState::Committed));
                return outputs;
            }

            let levels = self.levels.clone().expect("levels exist in RangeLocked");
            if let Some(direction) = bar_breakout(bar, &levels) {
                outputs.extend(self.trigger(direction, bar.open_time, &levels));
            }
        }

        outputs
    }

    /// 1 Hz tick. Drives slot-boundary transitions, range lock retries and the
    /// market-close cutoff.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Vec<StreamOutput> {
        match self.state {
            StreamState::Armed if now >= self.config.slot_time => {
                let mut outputs = vec![self.transition(StreamState::RangeBuilding)];
                outputs.extend(self.try_lock(now));
                outputs
            }
            StreamState::RangeBuilding => self.try_lock(now),
            StreamState::RangeLocked if now >= self.config.market_close => {
                self.commit(CommitReason::MarketCloseNoTrade, StreamState::Committed)
            }
            // An unfilled entry dies with the session; the commit cancels its order.
            StreamState::Triggered if now >= self.config.market_close => {
                self.commit(CommitReason::MarketCloseNoTrade, StreamState::Committed)
            }
            // Hydration never completed and the session is over.
            StreamState::PreHydration | StreamState::Armed
                if now >= self.config.market_close =>
            {
                self.commit(CommitReason::MarketCloseNoTrade, StreamState::Committed)
            }
            _ => Vec::new(),
        }
    }

    /// Entry submission protocol-rejected by the broker. Fatal for this date.
    pub fn on_entry_rejected(&mut self) -> Vec<StreamOutput> {
        if self.state != StreamState::Triggered {
            return Vec::new();
        }
        self.commit(CommitReason::EntryRejected, StreamState::Committed)
    }

    /// Entry filled; the trade now lives in the execution journal and break-even
    /// monitor.
    pub fn on_entry_filled(&mut self) -> Vec<StreamOutput> {
        if self.state != StreamState::Triggered {
            return Vec::new();
        }
        self.commit(CommitReason::EntryFilled, StreamState::Committed)
    }

    /// Protective placement failed after the fill; position was flattened.
    pub fn on_protectives_failed(&mut self) -> Vec<StreamOutput> {
        if self.state != StreamState::Triggered {
            return Vec::new();
        }
        self.commit(CommitReason::ProtectivesFailed, StreamState::Committed)
    }

    /// Operator intervention required: block new entries, leave protectives in place.
    pub fn stand_down(&mut self) -> Vec<StreamOutput> {
        if self.state.is_terminal() || self.state == StreamState::StandDown {
            return Vec::new();
        }
        vec![self.transition(StreamState::StandDown)]
    }

    fn try_lock(&mut self, now: DateTime<Utc>) -> Vec<StreamOutput> {
        if now >= self.config.market_close {
            return self.commit(CommitReason::MarketCloseNoTrade, StreamState::Committed);
        }
        if now < self.config.slot_time {
            // tick() guards this; a direct call before the slot is a benign retry.
            return self.range_retry(RangeComputeError::OutsideRangeWindow, now);
        }

        let range_window = self.config.range_window();
        let range = match compute_range(&self.buffer, range_window, self.config.session_window) {
            Ok(range) => range,
            Err(error) if error.is_benign() => return self.range_retry(error, now),
            Err(error) => return vec![StreamOutput::RangeFailed { error }],
        };

        if let Some(breach) =
            check_gap_tolerance(&self.buffer, range_window, &self.config.gap_limits)
        {
            let mut outputs = vec![StreamOutput::GapInvalidated(breach)];
            outputs.extend(
                self.commit(CommitReason::GapToleranceExceeded, StreamState::RangeInvalidated),
            );
            return outputs;
        }

        let levels = breakout_levels(&range, self.config.tick_size);
        self.range = Some(range.clone());
        self.levels = Some(levels.clone());

        let mut outputs = vec![
            self.transition(StreamState::RangeLocked),
            StreamOutput::RangeLocked {
                range: range.clone(),
                levels: levels.clone(),
            },
        ];

        // Immediate entry when the freeze close already sits at or beyond a trigger.
        if let Some(direction) = immediate_direction(&range, &levels) {
            outputs.extend(self.trigger(direction, self.config.slot_time, &levels));
            return outputs;
        }

        // Late start: scan `[slot_time, now]` for a breakout that already happened.
        let missed = {
            let bars = self
                .buffer
                .bars_in_closed(self.config.slot_time, now);
            scan_first_breakout(bars, &levels)
                .map(|(direction, bar)| (direction, bar.open_time))
        };
        if let Some((direction, bar_open_time)) = missed {
            if bar_open_time >= self.config.market_close {
                outputs.extend(
                    self.commit(CommitReason::MarketCloseNoTrade, StreamState::Committed),
                );
            } else {
                outputs.extend(self.trigger(direction, bar_open_time, &levels));
            }
        }

        outputs
    }

    fn range_retry(&mut self, error: RangeComputeError, now: DateTime<Utc>) -> Vec<StreamOutput> {
        if self.retry_limiter.allow(error.code(), now) {
            vec![StreamOutput::RangeRetry { error }]
        } else {
            Vec::new()
        }
    }

    fn trigger(
        &mut self,
        direction: Direction,
        bar_open_time: DateTime<Utc>,
        levels: &BreakoutLevels,
    ) -> Vec<StreamOutput> {
        let range = self.range.as_ref().expect("range locked before trigger");
        let breakout_level = match direction {
            Direction::Long => levels.long,
            Direction::Short => levels.short,
        };

        let bracket = bracket_levels(
            direction,
            breakout_level,
            self.config.tick_size,
            self.config.base_target,
            range.size(),
        );

        let intent = Intent::new(
            IntentId::new(self.config.trading_date, &self.config.id),
            self.config.id.clone(),
            self.config.trading_date,
            direction,
            breakout_level,
            bracket.entry,
            bracket.stop,
            bracket.target,
            bracket.be_trigger,
            bracket.be_stop,
            self.config.instrument.clone(),
            OcoGroupId::new(self.config.trading_date, &self.config.id, self.config.slot_wall),
        );
        self.intent = Some(intent.clone());

        vec![
            StreamOutput::BreakoutDetected {
                direction,
                bar_open_time,
            },
            self.transition(StreamState::Triggered),
            StreamOutput::IntentReady(intent),
        ]
    }

    fn transition(&mut self, next: StreamState) -> StreamOutput {
        let prev = self.state;
        self.state = next;
        StreamOutput::Transitioned { prev, next }
    }

    fn commit(&mut self, reason: CommitReason, terminal: StreamState) -> Vec<StreamOutput> {
        self.commit_reason = Some(reason);
        vec![
            self.transition(terminal),
            StreamOutput::Committed(reason),
        ]
    }
}
