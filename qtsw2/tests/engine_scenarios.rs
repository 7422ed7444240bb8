//! End-to-end engine scenarios driven deterministically through a manual clock, a
//! scripted mock broker and temp-dir journals.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeDelta, TimeZone, Utc};
use qtsw2::{
    config::ParitySpec,
    engine::{
        Engine, EngineConfig, EngineFeedEvent, RawLiveBar,
        clock::{EngineClock, ManualClock},
    },
    event::log::{self, EventLogConfig},
    health::NullNotificationSink,
    journal::execution::ExecutionJournal,
    stream::{CommitReason, StreamState},
    RunId,
};
use qtsw2_data::{TimeWindow, bar::{Bar, BarSource}, error::DataError, provider::BarProvider};
use qtsw2_execution::{
    BrokerEvent, ConnectionStatus,
    client::{ProtectivesOutcome, SubmitOutcome, mock::{AdapterCall, MockExecutionAdapter}},
    order::{ExecutionUpdate, OcoGroupId, OrderId, OrderStatus, OrderUpdate},
};
use qtsw2_instrument::{Direction, InstrumentName, StreamId};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use smol_str::SmolStr;
use std::io::Write;

fn at(hour: u32, minute: u32, second: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 7, hour, minute, second).unwrap()
}

fn naive(hour: u32, minute: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2025, 3, 7)
        .unwrap()
        .and_hms_opt(hour, minute, 0)
        .unwrap()
}

fn parity() -> ParitySpec {
    serde_json::from_value(serde_json::json!({
        "instruments": {
            "ES": { "tick_size": "0.25", "targets": ["4.00", "8.00"] }
        },
        "sessions": {
            "S1": { "range_start_time": "02:00", "slot_end_times": ["09:30", "10:30"] }
        },
        "entry_cutoff": { "market_close_time": "16:00" }
    }))
    .unwrap()
}

/// Provider serving a fixed set of historical bars, `BarsRequest`-style.
#[derive(Debug, Clone, Default)]
struct FixedBarProvider {
    bars: Vec<Bar>,
}

impl BarProvider for FixedBarProvider {
    async fn fetch(
        &self,
        instrument: &InstrumentName,
        window: TimeWindow,
    ) -> Result<Vec<Bar>, DataError> {
        Ok(self
            .bars
            .iter()
            .filter(|bar| bar.instrument == *instrument && window.contains(bar.open_time))
            .cloned()
            .collect())
    }
}

fn historical_bar(time: DateTime<Utc>, high: Decimal, low: Decimal, close: Decimal) -> Bar {
    Bar::new(
        InstrumentName::new("ES"),
        time,
        low,
        high,
        low,
        close,
        Some(dec!(1000)),
        BarSource::BarsRequest,
    )
}

struct Harness {
    engine: Engine<ManualClock, MockExecutionAdapter, FixedBarProvider, NullNotificationSink>,
    clock: ManualClock,
    adapter: MockExecutionAdapter,
    log_join: tokio::task::JoinHandle<()>,
    _root: tempfile::TempDir,
    log_dir: std::path::PathBuf,
}

fn write_timetable(root: &std::path::Path) -> std::path::PathBuf {
    let path = root.join("timetable.json");
    let mut file = std::fs::File::create(&path).unwrap();
    write!(
        file,
        r#"{{ "trading_date": "2025-03-07", "timezone": "America/Chicago",
             "streams": [ {{ "stream": "ES1", "instrument": "ES", "session": "S1",
                            "slot_time": "09:30", "enabled": true }} ] }}"#
    )
    .unwrap();
    path
}

fn harness(start: DateTime<Utc>, provider: FixedBarProvider) -> Harness {
    let root = tempfile::tempdir().unwrap();
    let timetable_path = write_timetable(root.path());
    let log_dir = root.path().join("logs");

    let (handle, log_join) = log::start(
        EventLogConfig::new(&log_dir),
        RunId::generate(start),
    )
    .unwrap();

    let config = EngineConfig::new(
        timetable_path,
        parity(),
        root.path().join("journal"),
        root.path().join("execution"),
    );

    let clock = ManualClock::new(start);
    let adapter = MockExecutionAdapter::new();
    let engine = Engine::try_new(
        config,
        clock.clone(),
        adapter.clone(),
        provider,
        NullNotificationSink,
        handle,
    )
    .unwrap();

    Harness {
        engine,
        clock,
        adapter,
        log_join,
        _root: root,
        log_dir,
    }
}

impl Harness {
    /// Feed one live bar, with the clock stepped 90 s past the bar stamp so the bar
    /// is complete but fresh.
    async fn live_bar(&mut self, stamp: NaiveDateTime, high: Decimal, low: Decimal, close: Decimal) {
        self.clock.set(stamp.and_utc() + TimeDelta::seconds(90));
        self.engine
            .on_feed_event(EngineFeedEvent::LiveBar(RawLiveBar {
                instrument: InstrumentName::new("ES"),
                stamp,
                open: low,
                high,
                low,
                close,
                volume: Some(dec!(1200)),
            }))
            .await
            .unwrap();
    }

    async fn tick_at(&mut self, instant: DateTime<Utc>) {
        self.clock.set(instant);
        self.engine.tick().await.unwrap();
    }

    async fn entry_fill(&mut self, fill_price: Decimal) {
        self.engine
            .on_feed_event(EngineFeedEvent::Broker(BrokerEvent::Execution(
                ExecutionUpdate::new(
                    OrderId::from("SIM-1"),
                    Some(SmolStr::from("QTSW2:2025-03-07_ES1:ENTRY")),
                    InstrumentName::new("ES"),
                    fill_price,
                    dec!(1),
                    self.clock.time(),
                ),
            )))
            .await
            .unwrap();
    }

    fn state(&self) -> StreamState {
        self.engine.stream_state(&StreamId::new("ES1")).unwrap()
    }

    fn journal_entry(&self) -> Option<qtsw2::journal::execution::ExecutionJournalEntry> {
        self.engine
            .execution_journal()
            .get(&qtsw2_execution::intent::IntentId::from("2025-03-07_ES1"))
    }
}

/// Chicago 2025-03-07 is CST: 09:30 local = 15:30 UTC, 16:00 local = 22:00 UTC.
async fn run_locked_range_long() -> Harness {
    let mut h = harness(at(15, 0, 0), FixedBarProvider::default());

    // Hydration (no historical bars) arms the stream.
    h.tick_at(at(15, 0, 0)).await;
    assert_eq!(h.state(), StreamState::Armed);

    h.live_bar(naive(15, 26), dec!(100.00), dec!(99.00), dec!(99.50)).await;
    h.live_bar(naive(15, 27), dec!(100.50), dec!(99.25), dec!(100.25)).await;
    h.live_bar(naive(15, 28), dec!(100.25), dec!(99.50), dec!(100.00)).await;
    h.live_bar(naive(15, 29), dec!(100.00), dec!(99.50), dec!(99.75)).await;

    h.tick_at(at(15, 30, 0)).await;
    assert_eq!(h.state(), StreamState::RangeLocked);

    // Post-slot bar breaches brk_long = 100.75.
    h.live_bar(naive(15, 31), dec!(100.80), dec!(100.00), dec!(100.60)).await;
    assert_eq!(h.state(), StreamState::Triggered);
    h
}

#[tokio::test]
async fn scenario_normal_locked_range_long() {
    let mut h = run_locked_range_long().await;

    // The gate accepted the entry and journalled it before the broker call.
    let entry = h.journal_entry().expect("journal entry persisted");
    assert!(entry.entry_order_id.is_some());
    let intent = &entry.intent;
    assert_eq!(intent.direction, Direction::Long);
    assert_eq!(intent.entry_price, dec!(100.75));
    assert_eq!(intent.stop_price, dec!(99.25));
    assert_eq!(intent.target_price, dec!(104.75));
    assert_eq!(intent.be_trigger_price, dec!(103.35));
    assert_eq!(intent.be_stop_price, dec!(100.50));

    // Broker reports the fill; protectives go out as an OCO pair.
    h.entry_fill(dec!(100.80)).await;
    assert_eq!(h.state(), StreamState::Committed);

    let entry = h.journal_entry().unwrap();
    assert!(entry.entry_filled);
    assert_eq!(entry.fill_price, Some(dec!(100.80)));
    assert!(entry.stop_order_id.is_some());
    assert!(entry.target_order_id.is_some());

    let calls = h.adapter.calls();
    assert!(matches!(calls[0], AdapterCall::SubmitEntry(_)));
    // The protectives go to the broker grouped one-cancels-other under the
    // stream's slot-keyed group id.
    let AdapterCall::SubmitProtectives(_, price, oco_group) = &calls[1] else {
        panic!("expected protectives submission, got {:?}", calls[1]);
    };
    assert_eq!(*price, dec!(100.80));
    assert_eq!(oco_group.as_str(), "QTSW2:OCO_ENTRY:2025-03-07:ES1:09:30");

    // The event log recorded the lifecycle; dropping the engine releases the last
    // log handle so the writer drains and exits.
    drop(h.engine);
    h.log_join.await.unwrap();
    let records = log::read_records(&h.log_dir.join("events-2025-03-07.jsonl")).unwrap();
    let kinds: Vec<String> = records.iter().map(|r| r.event.to_string()).collect();
    assert!(kinds.contains(&"RANGE_LOCKED".to_string()));
    assert!(kinds.contains(&"BREAKOUT_DETECTED".to_string()));
    assert!(kinds.contains(&"ENTRY_FILLED".to_string()));
    assert!(kinds.contains(&"STREAM_COMMITTED".to_string()));
}

#[tokio::test]
async fn scenario_missed_breakout_on_late_start() {
    // Engine starts 09:35 local with the slot already past; bars come from the
    // historical provider.
    let provider = FixedBarProvider {
        bars: vec![
            historical_bar(at(15, 26, 0), dec!(100.00), dec!(99.00), dec!(99.50)),
            historical_bar(at(15, 27, 0), dec!(100.50), dec!(99.25), dec!(100.25)),
            historical_bar(at(15, 28, 0), dec!(100.25), dec!(99.50), dec!(100.00)),
            historical_bar(at(15, 29, 0), dec!(100.00), dec!(99.50), dec!(99.75)),
        ],
    };
    let mut h = harness(at(15, 35, 0), provider);

    // Post-slot bars arrive live while the stream is still pre-hydration; they
    // buffer so the missed-breakout scan can find them.
    h.live_bar(naive(15, 30), dec!(100.40), dec!(100.00), dec!(100.20)).await;
    h.live_bar(naive(15, 31), dec!(100.80), dec!(100.00), dec!(100.60)).await;
    assert_eq!(h.state(), StreamState::PreHydration);

    // First tick hydrates the pre-slot window, locks retrospectively and the scan
    // catches the 09:31 breach in the same cycle.
    h.tick_at(at(15, 35, 0)).await;

    assert_eq!(h.state(), StreamState::Triggered);
    let entry = h.journal_entry().expect("intent journalled");
    assert_eq!(entry.intent.direction, Direction::Long);
    assert_eq!(entry.intent.entry_price, dec!(100.75));
}

#[tokio::test]
async fn scenario_missed_breakout_fully_historical() {
    // Every bar, including the breakout, is already history at start time.
    let provider = FixedBarProvider {
        bars: vec![
            historical_bar(at(15, 26, 0), dec!(100.00), dec!(99.00), dec!(99.50)),
            historical_bar(at(15, 27, 0), dec!(100.50), dec!(99.25), dec!(100.25)),
            historical_bar(at(15, 28, 0), dec!(100.25), dec!(99.50), dec!(100.00)),
            historical_bar(at(15, 29, 0), dec!(100.00), dec!(99.50), dec!(99.75)),
        ],
    };
    let mut h = harness(at(15, 35, 0), provider);

    h.tick_at(at(15, 35, 0)).await;
    // Range locked retrospectively from the hydrated bars; no breakout yet.
    assert_eq!(h.state(), StreamState::RangeLocked);

    // The missed-breakout bar arrives (late) from the live feed.
    h.live_bar(naive(15, 31), dec!(100.80), dec!(100.00), dec!(100.60)).await;
    assert_eq!(h.state(), StreamState::Triggered);
}

#[tokio::test]
async fn scenario_gap_invalidated_range() {
    let mut h = harness(at(15, 0, 0), FixedBarProvider::default());
    h.tick_at(at(15, 0, 0)).await;

    // Two accepted bars four minutes apart breach the single-gap limit.
    h.live_bar(naive(15, 20), dec!(100.00), dec!(99.00), dec!(99.50)).await;
    h.live_bar(naive(15, 24), dec!(100.50), dec!(99.25), dec!(100.25)).await;
    h.live_bar(naive(15, 25), dec!(100.25), dec!(99.50), dec!(99.75)).await;

    h.tick_at(at(15, 30, 0)).await;
    assert_eq!(h.state(), StreamState::RangeInvalidated);

    // A bar breaching the would-be range produces no intent and no submission.
    h.live_bar(naive(15, 31), dec!(105.00), dec!(104.00), dec!(104.50)).await;
    assert!(h.adapter.calls().is_empty());
    assert!(h.journal_entry().is_none());

    let stream = h.engine.stream(&StreamId::new("ES1")).unwrap();
    assert_eq!(stream.commit_reason(), Some(CommitReason::GapToleranceExceeded));
}

#[tokio::test]
async fn scenario_entry_filled_protectives_fail() {
    let mut h = run_locked_range_long().await;
    for _ in 0..3 {
        h.adapter.script_protectives(ProtectivesOutcome::Failed {
            reason: "route down".into(),
        });
    }

    h.entry_fill(dec!(100.80)).await;

    // Flatten was issued and the stream committed with the protective failure.
    assert!(h.adapter.calls().iter().any(|c| matches!(c, AdapterCall::Flatten(_))));
    assert_eq!(h.state(), StreamState::Committed);
    let stream = h.engine.stream(&StreamId::new("ES1")).unwrap();
    assert_eq!(stream.commit_reason(), Some(CommitReason::ProtectivesFailed));

    let entry = h.journal_entry().unwrap();
    assert_eq!(entry.commit_reason, Some(CommitReason::ProtectivesFailed));

    // No break-even activity for this intent, ever.
    h.live_bar(naive(15, 40), dec!(103.40), dec!(103.00), dec!(103.20)).await;
    h.tick_at(at(15, 42, 0)).await;
    assert!(!h.adapter.calls().iter().any(|c| matches!(c, AdapterCall::ModifyStop(_, _))));
}

#[tokio::test]
async fn scenario_break_even_trigger_fires_once() {
    let mut h = run_locked_range_long().await;
    h.entry_fill(dec!(100.80)).await;

    // Price advances past be_trigger = 103.35.
    h.live_bar(naive(15, 40), dec!(103.40), dec!(103.00), dec!(103.20)).await;
    h.tick_at(at(15, 42, 0)).await;

    let modifies: Vec<_> = h
        .adapter
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            AdapterCall::ModifyStop(intent, price) => Some((intent, price)),
            _ => None,
        })
        .collect();
    assert_eq!(modifies.len(), 1);
    assert_eq!(modifies[0].1, dec!(100.50));

    let entry = h.journal_entry().unwrap();
    assert!(entry.be_modified);
    assert_eq!(entry.be_stop_price, Some(dec!(100.50)));

    // Further price updates cause no further modifies.
    h.live_bar(naive(15, 45), dec!(103.80), dec!(103.20), dec!(103.60)).await;
    h.tick_at(at(15, 47, 0)).await;
    h.live_bar(naive(15, 50), dec!(104.20), dec!(103.60), dec!(104.00)).await;
    h.tick_at(at(15, 52, 0)).await;

    let modify_count = h
        .adapter
        .calls()
        .iter()
        .filter(|c| matches!(c, AdapterCall::ModifyStop(_, _)))
        .count();
    assert_eq!(modify_count, 1);
}

#[tokio::test]
async fn scenario_market_close_without_breakout() {
    let mut h = harness(at(15, 0, 0), FixedBarProvider::default());
    h.tick_at(at(15, 0, 0)).await;

    h.live_bar(naive(15, 26), dec!(100.00), dec!(99.00), dec!(99.50)).await;
    h.live_bar(naive(15, 27), dec!(100.50), dec!(99.25), dec!(100.25)).await;
    h.live_bar(naive(15, 28), dec!(100.25), dec!(99.50), dec!(100.00)).await;
    h.live_bar(naive(15, 29), dec!(100.00), dec!(99.50), dec!(99.75)).await;
    h.tick_at(at(15, 30, 0)).await;
    assert_eq!(h.state(), StreamState::RangeLocked);

    // 16:00 local: no trade this date.
    h.tick_at(at(22, 0, 0)).await;
    assert_eq!(h.state(), StreamState::Committed);
    let stream = h.engine.stream(&StreamId::new("ES1")).unwrap();
    assert_eq!(stream.commit_reason(), Some(CommitReason::MarketCloseNoTrade));
    assert!(h.adapter.calls().iter().all(|c| !matches!(c, AdapterCall::SubmitEntry(_))));
}

#[tokio::test]
async fn duplicate_fill_events_cause_no_duplicate_submissions() {
    let mut h = run_locked_range_long().await;

    h.entry_fill(dec!(100.80)).await;
    // The broker re-publishes the same fill, and an order update echoes it too.
    h.entry_fill(dec!(100.80)).await;
    h.engine
        .on_feed_event(EngineFeedEvent::Broker(BrokerEvent::Order(OrderUpdate::new(
            OrderId::from("SIM-1"),
            Some(SmolStr::from("QTSW2:2025-03-07_ES1:ENTRY")),
            InstrumentName::new("ES"),
            OrderStatus::Filled,
            h.clock.time(),
        ))))
        .await
        .unwrap();

    let protective_calls = h
        .adapter
        .calls()
        .iter()
        .filter(|c| matches!(c, AdapterCall::SubmitProtectives(..)))
        .count();
    assert_eq!(protective_calls, 1);

    let entry = h.journal_entry().unwrap();
    assert_eq!(entry.fill_price, Some(dec!(100.80)));
}

#[tokio::test]
async fn entry_rejection_commits_stream_and_cancels() {
    let mut h = harness(at(15, 0, 0), FixedBarProvider::default());
    h.adapter.script_entry(SubmitOutcome::Rejected {
        reason: "insufficient margin".into(),
    });
    h.tick_at(at(15, 0, 0)).await;

    h.live_bar(naive(15, 26), dec!(100.00), dec!(99.00), dec!(99.50)).await;
    h.live_bar(naive(15, 27), dec!(100.50), dec!(99.25), dec!(100.25)).await;
    h.live_bar(naive(15, 28), dec!(100.25), dec!(99.50), dec!(100.00)).await;
    h.live_bar(naive(15, 29), dec!(100.00), dec!(99.50), dec!(99.75)).await;
    h.tick_at(at(15, 30, 0)).await;
    h.live_bar(naive(15, 31), dec!(100.80), dec!(100.00), dec!(100.60)).await;

    assert_eq!(h.state(), StreamState::Committed);
    let stream = h.engine.stream(&StreamId::new("ES1")).unwrap();
    assert_eq!(stream.commit_reason(), Some(CommitReason::EntryRejected));
    // End-of-intent cancellation went out for the stream's tags.
    assert!(
        h.adapter
            .calls()
            .iter()
            .any(|c| matches!(c, AdapterCall::CancelIntentOrders(_)))
    );
}

#[tokio::test]
async fn restart_with_committed_journal_short_circuits() {
    let root = {
        let mut h = run_locked_range_long().await;
        h.entry_fill(dec!(100.80)).await;
        assert_eq!(h.state(), StreamState::Committed);
        // Tear down the first engine, keeping its journal directory.
        drop(h.engine);
        h._root
    };

    // Second engine over the same journals: the stream starts Committed and the
    // execution journal still knows the fill.
    let timetable_path = root.path().join("timetable.json");
    let (handle, _join) = log::start(
        EventLogConfig::new(root.path().join("logs2")),
        RunId::generate(at(15, 45, 0)),
    )
    .unwrap();
    let config = EngineConfig::new(
        timetable_path,
        parity(),
        root.path().join("journal"),
        root.path().join("execution"),
    );
    let engine = Engine::try_new(
        config,
        ManualClock::new(at(15, 45, 0)),
        MockExecutionAdapter::new(),
        FixedBarProvider::default(),
        NullNotificationSink,
        handle,
    )
    .unwrap();

    assert_eq!(
        engine.stream_state(&StreamId::new("ES1")),
        Some(StreamState::Committed)
    );
    let entry = engine
        .execution_journal()
        .get(&qtsw2_execution::intent::IntentId::from("2025-03-07_ES1"))
        .unwrap();
    assert!(entry.entry_filled);
    assert_eq!(entry.intent.be_trigger_price, dec!(103.35));
}

#[tokio::test]
async fn disconnect_enters_fail_closed_and_recovery_clears_it() {
    let mut h = harness(at(15, 0, 0), FixedBarProvider::default());
    h.tick_at(at(15, 0, 0)).await;

    h.engine
        .on_feed_event(EngineFeedEvent::Broker(BrokerEvent::Connection(
            ConnectionStatus::Disconnected,
        )))
        .await
        .unwrap();

    // Reconcile timeout (120 s) elapses: fail-closed.
    h.tick_at(at(15, 2, 30)).await;

    // A breakout while fail-closed is blocked at the gate.
    h.live_bar(naive(15, 26), dec!(100.00), dec!(99.00), dec!(99.50)).await;
    h.live_bar(naive(15, 27), dec!(100.50), dec!(99.25), dec!(100.25)).await;
    h.live_bar(naive(15, 28), dec!(100.25), dec!(99.50), dec!(100.00)).await;
    h.live_bar(naive(15, 29), dec!(100.00), dec!(99.50), dec!(99.75)).await;
    h.clock.set(at(15, 30, 0));
    h.engine.tick().await.unwrap();
    h.live_bar(naive(15, 31), dec!(100.80), dec!(100.00), dec!(100.60)).await;

    assert!(
        !h.adapter
            .calls()
            .iter()
            .any(|c| matches!(c, AdapterCall::SubmitEntry(_)))
    );

    // Reconnect: recovery snapshots the account and the gate re-opens after the next
    // broker event.
    h.clock.set(at(15, 32, 0));
    h.engine
        .on_feed_event(EngineFeedEvent::Broker(BrokerEvent::Connection(
            ConnectionStatus::Connected,
        )))
        .await
        .unwrap();
    assert!(
        h.adapter
            .calls()
            .iter()
            .any(|c| matches!(c, AdapterCall::SnapshotAccount))
    );
}

#[tokio::test]
async fn execution_journal_survives_for_recovery() {
    // Sanity check on the journal file layout the recovery path depends on.
    let dir = tempfile::tempdir().unwrap();
    let journal = ExecutionJournal::open(dir.path()).unwrap();
    let stream = StreamId::new("ES1");
    let trading_date = NaiveDate::from_ymd_opt(2025, 3, 7).unwrap();
    let intent = qtsw2_execution::intent::Intent::new(
        qtsw2_execution::intent::IntentId::new(trading_date, &stream),
        stream.clone(),
        trading_date,
        Direction::Long,
        dec!(100.75),
        dec!(100.75),
        dec!(99.25),
        dec!(104.75),
        dec!(103.35),
        dec!(100.50),
        InstrumentName::new("ES"),
        OcoGroupId::new(trading_date, &stream, "09:30"),
    );
    journal.ensure_entry(&intent, at(15, 31, 0)).unwrap();

    assert!(dir.path().join("2025-03-07_ES1_2025-03-07_ES1.json").exists());
}
