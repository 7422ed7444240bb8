use crate::{
    RunId,
    config::{ConfigError, ContentHash, ParitySpec, Timetable},
    engine::{
        bemonitor::{BreakEvenMonitor, PriceProbe},
        clock::EngineClock,
        gate::{EntryDisposition, ExecutionGate, FillOutcome, GateContext},
    },
    error::EngineError,
    event::{EventKind, RateLimiter, log::EventLogHandle},
    health::{CriticalEscalator, HealthMonitor, NotificationSink, monitoring_windows},
    journal::{JournalStore, StreamJournal, execution::ExecutionJournal},
    recovery::reconcile,
    stream::{CommitReason, Stream, StreamConfig, StreamOutput, StreamState},
};
use chrono::{DateTime, NaiveDateTime, TimeDelta, Utc};
use fnv::FnvHashMap;
use indexmap::IndexMap;
use parking_lot::Mutex;
use qtsw2_data::{
    TimeWindow,
    bar::{Bar, BarSource},
    ingest::{AdmissionPolicy, TimestampNormalizer},
    provider::BarProvider,
    time::{TradingZone, WallTime},
};
use qtsw2_execution::{
    BrokerEvent, ExecutionMode,
    client::ExecutionAdapter,
    intent::IntentId,
    order::{OrderRole, OrderStatus},
};
use qtsw2_instrument::{InstrumentName, StreamId};
use rust_decimal::Decimal;
use serde_json::json;
use std::{collections::VecDeque, path::PathBuf, sync::Arc, time::Duration};
use tracing::{error, info, warn};

/// Throttled break-even trigger checks per filled intent.
pub mod bemonitor;

/// Engine time source abstraction.
pub mod clock;

/// Order-submission authorization, idempotent journalling and fill correlation.
pub mod gate;

/// Raw live-feed bar before timestamp interpretation.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RawLiveBar {
    pub instrument: InstrumentName,
    /// Wall-clock stamp as delivered by the feed; UTC-vs-local is decided by the
    /// one-shot timestamp lock.
    pub stamp: NaiveDateTime,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Option<Decimal>,
}

/// Everything multiplexed onto the engine's bounded input channel.
#[derive(Debug, Clone)]
pub enum EngineFeedEvent {
    LiveBar(RawLiveBar),
    Broker(BrokerEvent),
}

/// Suggested bound for the engine feed channel.
pub const FEED_CHANNEL_DEPTH: usize = 1024;

/// Static engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub timetable_path: PathBuf,
    pub parity: ParitySpec,
    pub mode: ExecutionMode,
    pub live_armed: bool,
    pub journal_dir: PathBuf,
    pub execution_journal_dir: PathBuf,
    pub tick_interval: Duration,
    /// Session open wall time (previous calendar day for overnight sessions).
    pub session_open: WallTime,
    /// Broker disconnect older than this without reconciliation enters fail-closed.
    pub reconcile_timeout: TimeDelta,
    pub gap_limits: crate::stream::range::GapLimits,
    pub thresholds: crate::health::HealthThresholds,
}

impl EngineConfig {
    pub fn new(
        timetable_path: impl Into<PathBuf>,
        parity: ParitySpec,
        journal_dir: impl Into<PathBuf>,
        execution_journal_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            timetable_path: timetable_path.into(),
            parity,
            mode: ExecutionMode::Sim,
            live_armed: false,
            journal_dir: journal_dir.into(),
            execution_journal_dir: execution_journal_dir.into(),
            tick_interval: Duration::from_secs(1),
            session_open: WallTime::new(17, 0).expect("17:00 is valid"),
            reconcile_timeout: TimeDelta::seconds(120),
            gap_limits: crate::stream::range::GapLimits::default(),
            thresholds: crate::health::HealthThresholds::default(),
        }
    }
}

/// The breakout engine: owns every stream, fans out ticks and bars, and drives the
/// execution gate, break-even monitor, health monitor and recovery coordinator.
#[derive(Debug)]
pub struct Engine<Clock, Adapter, Provider, Sink> {
    config: EngineConfig,
    run_id: RunId,
    clock: Clock,
    adapter: Adapter,
    provider: Provider,
    zone: TradingZone,
    timetable: Timetable,
    applied_hash: ContentHash,
    seen_hash: ContentHash,
    trading_date: chrono::NaiveDate,
    session_window: TimeWindow,
    admission: AdmissionPolicy,
    normalizers: FnvHashMap<InstrumentName, TimestampNormalizer>,
    suspect_limiter: RateLimiter<InstrumentName>,
    timetable_limiter: RateLimiter<&'static str>,
    streams: IndexMap<StreamId, Stream>,
    probes: FnvHashMap<InstrumentName, PriceProbe>,
    gate: ExecutionGate<Adapter>,
    bemonitor: BreakEvenMonitor,
    health: Arc<Mutex<HealthMonitor>>,
    escalator: Arc<CriticalEscalator<Sink>>,
    journals: JournalStore,
    exec_journal: Arc<ExecutionJournal>,
    event_log: EventLogHandle,
    disconnect_since: Option<DateTime<Utc>>,
    stop_requested: bool,
    stopped: bool,
}

impl<Clock, Adapter, Provider, Sink> Engine<Clock, Adapter, Provider, Sink>
where
    Clock: EngineClock,
    Adapter: ExecutionAdapter,
    Provider: BarProvider,
    Sink: NotificationSink,
{
    pub fn try_new(
        config: EngineConfig,
        clock: Clock,
        adapter: Adapter,
        provider: Provider,
        sink: Sink,
        event_log: EventLogHandle,
    ) -> Result<Self, EngineError> {
        let now = clock.time();
        let run_id = event_log.run_id().clone();

        let (timetable, hash) = Timetable::load(&config.timetable_path)?;
        timetable.validate(&config.parity)?;
        let zone = timetable.zone()?;

        // The trading date locks here for the engine's lifetime.
        let trading_date = timetable.trading_date;
        let session_window = zone.session_window(
            trading_date,
            config.session_open,
            config.parity.entry_cutoff.market_close_time,
        );

        let journals = JournalStore::open(&config.journal_dir)?;
        let exec_journal = Arc::new(ExecutionJournal::open(&config.execution_journal_dir)?);
        let restored = exec_journal.load_date(trading_date)?;
        if restored > 0 {
            info!(restored, "execution journal entries restored");
        }

        let gate = ExecutionGate::new(
            adapter.clone(),
            Arc::clone(&exec_journal),
            config.mode,
            config.live_armed,
        );

        let health = Arc::new(Mutex::new(HealthMonitor::new(
            config.thresholds,
            monitoring_windows(&timetable, &config.parity, zone, config.thresholds.window_grace),
        )));
        let escalator = Arc::new(CriticalEscalator::new(sink, run_id.clone()));

        let mut engine = Self {
            config,
            run_id,
            clock,
            adapter,
            provider,
            zone,
            timetable: timetable.clone(),
            applied_hash: hash.clone(),
            seen_hash: hash.clone(),
            trading_date,
            session_window,
            admission: AdmissionPolicy::new(session_window),
            normalizers: FnvHashMap::default(),
            suspect_limiter: RateLimiter::per_minute(),
            timetable_limiter: RateLimiter::per_minute(),
            streams: IndexMap::new(),
            probes: FnvHashMap::default(),
            gate,
            bemonitor: BreakEvenMonitor::new(),
            health,
            escalator,
            journals,
            exec_journal,
            event_log,
            disconnect_since: None,
            stop_requested: false,
            stopped: false,
        };

        engine.emit(
            now,
            "engine",
            EventKind::EngineStarted,
            None,
            json!({ "mode": format!("{:?}", engine.config.mode) }),
        );
        engine.emit(
            now,
            "engine",
            EventKind::TradingDateLocked,
            None,
            json!({ "trading_date": trading_date.to_string() }),
        );
        engine.create_missing_streams(now)?;
        engine.emit(
            now,
            "engine",
            EventKind::TimetableApplied,
            None,
            json!({ "hash": hash.to_string(), "streams": engine.streams.len() }),
        );

        Ok(engine)
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn trading_date(&self) -> chrono::NaiveDate {
        self.trading_date
    }

    pub fn stream_state(&self, id: &StreamId) -> Option<StreamState> {
        self.streams.get(id).map(|stream| stream.state())
    }

    pub fn stream(&self, id: &StreamId) -> Option<&Stream> {
        self.streams.get(id)
    }

    pub fn execution_journal(&self) -> &ExecutionJournal {
        &self.exec_journal
    }

    /// Latched stop request; honored at the next loop iteration.
    pub fn request_stop(&mut self) {
        self.stop_requested = true;
    }

    fn emit(
        &self,
        now: DateTime<Utc>,
        source: &str,
        kind: EventKind,
        instrument: Option<InstrumentName>,
        data: serde_json::Value,
    ) {
        self.event_log.emit_at(now, source, kind, instrument, data);
    }

    /// Instantiate streams for enabled directives that do not exist yet. Streams are
    /// created at most once per engine lifetime per stream id.
    fn create_missing_streams(&mut self, now: DateTime<Utc>) -> Result<(), EngineError> {
        let directives: Vec<_> = self
            .timetable
            .streams
            .iter()
            .filter(|d| d.enabled && !self.streams.contains_key(&d.stream))
            .cloned()
            .collect();

        for directive in directives {
            let invalid = |detail: String| ConfigError::StreamInvalid {
                stream: directive.stream.clone(),
                detail,
            };

            let session = self
                .config
                .parity
                .sessions
                .get(directive.session.as_str())
                .ok_or_else(|| invalid("unknown session".into()))?
                .clone();
            let instrument_spec = self
                .config
                .parity
                .instruments
                .get(directive.instrument.as_str())
                .ok_or_else(|| invalid("unknown instrument".into()))?
                .clone();

            let tick_size = qtsw2_instrument::tick::TickSize::new(instrument_spec.tick_size)
                .map_err(ConfigError::from)?;
            let base_target = instrument_spec
                .base_target()
                .ok_or_else(|| invalid("empty target ladder".into()))?;

            let stream_config = StreamConfig {
                id: directive.stream.clone(),
                instrument: directive.instrument.clone(),
                session: directive.session.clone(),
                trading_date: self.trading_date,
                slot_wall: directive.slot_time,
                range_start: self.zone.resolve(self.trading_date, session.range_start_time),
                slot_time: self.zone.resolve(self.trading_date, directive.slot_time),
                market_close: self
                    .zone
                    .resolve(self.trading_date, self.config.parity.entry_cutoff.market_close_time),
                session_window: self.session_window,
                tick_size,
                base_target,
                gap_limits: self.config.gap_limits,
            };

            let persisted = self.journals.load(self.trading_date, &directive.stream)?;
            let stream = match persisted {
                Some(journal) if journal.committed => {
                    info!(stream = %directive.stream, "journal committed; short-circuiting");
                    Stream::new_committed(stream_config, journal.commit_reason)
                }
                Some(_) => {
                    if now >= stream_config.range_start {
                        self.emit(
                            now,
                            "engine",
                            EventKind::MidSessionRestart,
                            Some(directive.instrument.clone()),
                            json!({ "stream": directive.stream.to_string() }),
                        );
                    }
                    Stream::new(stream_config)
                }
                None => Stream::new(stream_config),
            };

            self.streams.insert(directive.stream.clone(), stream);
        }

        Ok(())
    }

    /// The 1 Hz engine tick: timetable reload, stream dispatch, break-even scan,
    /// health heartbeat, fail-closed watchdog.
    pub async fn tick(&mut self) -> Result<(), EngineError> {
        let now = self.clock.time();

        self.reload_timetable_if_changed(now)?;

        let ids: Vec<StreamId> = self.streams.keys().cloned().collect();
        for id in ids {
            let state = match self.streams.get(&id) {
                Some(stream) => stream.state(),
                None => continue,
            };

            if state == StreamState::PreHydration {
                self.hydrate_stream(&id, now).await?;
                continue;
            }

            let outputs = match self.streams.get_mut(&id) {
                Some(stream) => stream.tick(now),
                None => continue,
            };
            self.handle_outputs(&id, outputs, now).await?;
        }

        self.scan_break_even(now).await?;

        let recovered = self.health.lock().heartbeat(now);
        if let Some(alert) = recovered {
            self.emit(
                now,
                "health",
                alert.kind(),
                None,
                json!({ "detail": format!("{alert:?}") }),
            );
        }

        if let Some(since) = self.disconnect_since {
            if !self.gate.is_fail_closed() && now - since >= self.config.reconcile_timeout {
                self.gate.set_fail_closed(true);
                self.emit(
                    now,
                    "engine",
                    EventKind::DisconnectFailClosedEntered,
                    None,
                    json!({ "disconnected_for_secs": (now - since).num_seconds() }),
                );
                self.escalator.escalate(
                    EventKind::DisconnectFailClosedEntered,
                    "broker disconnected and unreconciled; submissions denied",
                    now,
                );
            }
        }

        Ok(())
    }

    /// Pull historical bars for the pre-slot window, then leave `PreHydration`.
    async fn hydrate_stream(&mut self, id: &StreamId, now: DateTime<Utc>) -> Result<(), EngineError> {
        let (instrument, window) = match self.streams.get(id) {
            Some(stream) => {
                let config = stream.config();
                (
                    config.instrument.clone(),
                    TimeWindow::new(config.range_start, config.slot_time.min(now)),
                )
            }
            None => return Ok(()),
        };

        match self.provider.fetch(&instrument, window).await {
            Ok(bars) => {
                for bar in bars {
                    self.ingest_bar(bar, now).await?;
                }
            }
            Err(err) => {
                warn!(stream = %id, %err, "historical hydration failed; relying on live bars");
            }
        }

        let outputs = self
            .streams
            .get_mut(id)
            .map(|stream| stream.complete_hydration(now))
            .unwrap_or_default();
        self.handle_outputs(id, outputs, now).await
    }

    fn reload_timetable_if_changed(&mut self, now: DateTime<Utc>) -> Result<(), EngineError> {
        let (timetable, hash) = match Timetable::load(&self.config.timetable_path) {
            Ok(loaded) => loaded,
            Err(err) => {
                if self.timetable_limiter.allow("load", now) {
                    self.emit(
                        now,
                        "engine",
                        EventKind::TimetableInvalid,
                        None,
                        json!({ "error": err.to_string() }),
                    );
                }
                return Ok(());
            }
        };

        if hash == self.seen_hash {
            return Ok(());
        }
        self.seen_hash = hash.clone();

        if let Err(err) = timetable.validate(&self.config.parity) {
            self.emit(
                now,
                "engine",
                EventKind::TimetableInvalid,
                None,
                json!({ "error": err.to_string() }),
            );
            return Ok(());
        }

        // The locked trading date never moves; a conflicting reload is ignored.
        if timetable.trading_date != self.trading_date {
            self.emit(
                now,
                "engine",
                EventKind::TimetableReloadConflict,
                None,
                json!({
                    "locked": self.trading_date.to_string(),
                    "incoming": timetable.trading_date.to_string(),
                }),
            );
            return Ok(());
        }

        self.timetable = timetable;
        self.applied_hash = hash.clone();
        self.create_missing_streams(now)?;
        {
            let windows = monitoring_windows(
                &self.timetable,
                &self.config.parity,
                self.zone,
                self.config.thresholds.window_grace,
            );
            *self.health.lock() = HealthMonitor::new(self.config.thresholds, windows);
        }
        self.emit(
            now,
            "engine",
            EventKind::TimetableApplied,
            None,
            json!({ "hash": hash.to_string(), "streams": self.streams.len() }),
        );

        Ok(())
    }

    /// One input from the multiplexed feed channel.
    pub async fn on_feed_event(&mut self, event: EngineFeedEvent) -> Result<(), EngineError> {
        match event {
            EngineFeedEvent::LiveBar(raw) => self.ingest_live_bar(raw).await,
            EngineFeedEvent::Broker(event) => self.on_broker_event(event).await,
        }
    }

    async fn ingest_live_bar(&mut self, raw: RawLiveBar) -> Result<(), EngineError> {
        let now = self.clock.time();

        let normalized = self
            .normalizers
            .entry(raw.instrument.clone())
            .or_insert_with(|| TimestampNormalizer::new(self.zone))
            .normalize(raw.stamp, now);

        if let Some(mode) = normalized.locked {
            self.emit(
                now,
                "data",
                EventKind::BarTimestampLocked,
                Some(raw.instrument.clone()),
                json!({ "mode": format!("{mode:?}") }),
            );
        }
        if let Some(age) = normalized.suspect_age {
            if self.suspect_limiter.allow(raw.instrument.clone(), now) {
                self.emit(
                    now,
                    "data",
                    EventKind::BarTimestampSuspect,
                    Some(raw.instrument.clone()),
                    json!({ "age_secs": age.num_seconds() }),
                );
            }
        }

        let bar = Bar::new(
            raw.instrument,
            normalized.open_time,
            raw.open,
            raw.high,
            raw.low,
            raw.close,
            raw.volume,
            BarSource::Live,
        );
        self.ingest_bar(bar, now).await
    }

    /// Admission checks, probe update, then fan-out to every matching stream.
    async fn ingest_bar(&mut self, bar: Bar, now: DateTime<Utc>) -> Result<(), EngineError> {
        if let Err(rejected) = self.admission.admit(&bar, now) {
            self.emit(
                now,
                "data",
                EventKind::BarRejected,
                Some(bar.instrument.clone()),
                json!({
                    "reason": rejected.to_string(),
                    "open_time": bar.open_time.to_rfc3339(),
                    "source": bar.source.as_str(),
                }),
            );
            return Ok(());
        }

        self.health
            .lock()
            .on_bar_seen(bar.instrument.clone(), bar.open_time);
        self.probes.insert(
            bar.instrument.clone(),
            PriceProbe {
                high: bar.high,
                low: bar.low,
                at: bar.open_time,
            },
        );

        let ids: Vec<StreamId> = self
            .streams
            .iter()
            .filter(|(_, stream)| stream.config().instrument == bar.instrument)
            .map(|(id, _)| id.clone())
            .collect();

        for id in ids {
            let outputs = self
                .streams
                .get_mut(&id)
                .map(|stream| stream.on_bar(&bar, now))
                .unwrap_or_default();
            self.handle_outputs(&id, outputs, now).await?;
        }

        Ok(())
    }

    async fn on_broker_event(&mut self, event: BrokerEvent) -> Result<(), EngineError> {
        let now = self.clock.time();

        match event {
            BrokerEvent::Connection(status) => {
                self.health.lock().on_connection(status, now);
                if status.is_connected() {
                    if self.disconnect_since.is_some() {
                        self.run_recovery(now).await?;
                    }
                } else {
                    self.gate.note_disconnect();
                    if self.disconnect_since.is_none() {
                        self.disconnect_since = Some(now);
                    }
                }
            }
            BrokerEvent::Order(update) => {
                self.gate.note_broker_event();
                let Some(tag) = update.robot_tag() else {
                    return Ok(());
                };
                match (tag.role, update.status) {
                    (OrderRole::Entry, OrderStatus::Filled) => {
                        self.entry_filled(&tag.intent, None, now).await?;
                    }
                    (OrderRole::Entry, OrderStatus::Rejected) => {
                        self.emit(
                            now,
                            "execution",
                            EventKind::EntryRejected,
                            Some(update.instrument.clone()),
                            json!({ "intent": tag.intent.to_string() }),
                        );
                        let stream_id = self
                            .exec_journal
                            .get(&tag.intent)
                            .map(|entry| entry.intent.stream.clone());
                        if let Some(stream_id) = stream_id {
                            let outputs = self
                                .streams
                                .get_mut(&stream_id)
                                .map(|stream| stream.on_entry_rejected())
                                .unwrap_or_default();
                            self.handle_outputs(&stream_id, outputs, now).await?;
                        }
                    }
                    _ => {}
                }
            }
            BrokerEvent::Execution(update) => {
                self.gate.note_broker_event();
                let Some(tag) = update.robot_tag() else {
                    return Ok(());
                };
                if tag.role == OrderRole::Entry {
                    self.entry_filled(&tag.intent, Some(update.fill_price), now)
                        .await?;
                }
            }
        }

        Ok(())
    }

    /// First completed entry fill for an intent: journal, protectives, stream commit.
    async fn entry_filled(
        &mut self,
        intent_id: &IntentId,
        fill_price: Option<Decimal>,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let Some(entry) = self.exec_journal.get(intent_id) else {
            warn!(intent = %intent_id, "fill event for unknown intent ignored");
            return Ok(());
        };
        let intent = entry.intent.clone();
        // An OrderUpdate(Filled) without a price falls back to the priced entry level;
        // a later ExecutionUpdate cannot override it (first fill wins).
        let fill_price = fill_price.or(entry.fill_price).unwrap_or(intent.entry_price);

        match self.gate.handle_entry_fill(&intent, fill_price, now).await? {
            FillOutcome::AlreadyHandled => Ok(()),
            FillOutcome::ProtectivesPlaced {
                stop_order_id,
                target_order_id,
            } => {
                self.emit(
                    now,
                    "execution",
                    EventKind::EntryFilled,
                    Some(intent.execution_instrument.clone()),
                    json!({ "intent": intent.id.to_string(), "fill_price": fill_price }),
                );
                self.emit(
                    now,
                    "execution",
                    EventKind::ProtectivesPlaced,
                    Some(intent.execution_instrument.clone()),
                    json!({
                        "intent": intent.id.to_string(),
                        "stop_order_id": stop_order_id.to_string(),
                        "target_order_id": target_order_id.to_string(),
                    }),
                );
                let outputs = self
                    .streams
                    .get_mut(&intent.stream)
                    .map(|stream| stream.on_entry_filled())
                    .unwrap_or_default();
                self.handle_outputs(&intent.stream.clone(), outputs, now).await
            }
            FillOutcome::ProtectivesFailedFlattened { reason } => {
                self.emit(
                    now,
                    "execution",
                    EventKind::EntryFilled,
                    Some(intent.execution_instrument.clone()),
                    json!({ "intent": intent.id.to_string(), "fill_price": fill_price }),
                );
                self.emit(
                    now,
                    "execution",
                    EventKind::ProtectivesFailed,
                    Some(intent.execution_instrument.clone()),
                    json!({ "intent": intent.id.to_string(), "reason": reason }),
                );
                self.emit(
                    now,
                    "execution",
                    EventKind::PositionFlattened,
                    Some(intent.execution_instrument.clone()),
                    json!({ "intent": intent.id.to_string() }),
                );
                self.exec_journal
                    .set_commit_reason(&intent.id, CommitReason::ProtectivesFailed, now)?;
                let outputs = self
                    .streams
                    .get_mut(&intent.stream)
                    .map(|stream| stream.on_protectives_failed())
                    .unwrap_or_default();
                self.handle_outputs(&intent.stream.clone(), outputs, now).await
            }
        }
    }

    async fn scan_break_even(&mut self, now: DateTime<Utc>) -> Result<(), EngineError> {
        if !self.bemonitor.scan_due(now) {
            return Ok(());
        }

        for entry in self.exec_journal.filled_pending_be() {
            let intent = entry.intent;
            let Some(probe) = self.probes.get(&intent.execution_instrument).copied() else {
                continue;
            };

            if self.bemonitor.should_fire(&intent, &probe, now)
                && self.gate.modify_to_break_even(&intent, now).await?
            {
                self.emit(
                    now,
                    "execution",
                    EventKind::BreakEvenModified,
                    Some(intent.execution_instrument.clone()),
                    json!({
                        "intent": intent.id.to_string(),
                        "new_stop_price": intent.be_stop_price,
                    }),
                );
            }
        }

        Ok(())
    }

    /// Apply stream outputs: event emission, journal persistence and gate dispatch.
    async fn handle_outputs(
        &mut self,
        id: &StreamId,
        outputs: Vec<StreamOutput>,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let mut queue: VecDeque<StreamOutput> = outputs.into();

        while let Some(output) = queue.pop_front() {
            match output {
                StreamOutput::Transitioned { prev, next } => {
                    self.emit(
                        now,
                        "stream",
                        EventKind::StreamStateChanged,
                        self.stream_instrument(id),
                        json!({
                            "stream": id.to_string(),
                            "from": prev.to_string(),
                            "to": next.to_string(),
                        }),
                    );
                    self.persist_stream_journal(id, now);
                }
                StreamOutput::RangeLocked { range, levels } => {
                    self.emit(
                        now,
                        "stream",
                        EventKind::RangeLocked,
                        self.stream_instrument(id),
                        json!({
                            "stream": id.to_string(),
                            "range_high": range.high,
                            "range_low": range.low,
                            "freeze_close": range.freeze_close,
                            "bar_count": range.bar_count,
                            "brk_long": levels.long,
                            "brk_short": levels.short,
                        }),
                    );
                }
                StreamOutput::RangeRetry { error } => {
                    self.emit(
                        now,
                        "stream",
                        EventKind::RangeComputeRetry,
                        self.stream_instrument(id),
                        json!({ "stream": id.to_string(), "reason": error.code() }),
                    );
                }
                StreamOutput::RangeFailed { error } => {
                    self.emit(
                        now,
                        "stream",
                        EventKind::RangeComputeFailed,
                        self.stream_instrument(id),
                        json!({ "stream": id.to_string(), "reason": error.code() }),
                    );
                }
                StreamOutput::GapInvalidated(breach) => {
                    self.emit(
                        now,
                        "stream",
                        EventKind::RangeInvalidated,
                        self.stream_instrument(id),
                        json!({ "stream": id.to_string(), "breach": format!("{breach:?}") }),
                    );
                }
                StreamOutput::BreakoutDetected {
                    direction,
                    bar_open_time,
                } => {
                    self.emit(
                        now,
                        "stream",
                        EventKind::BreakoutDetected,
                        self.stream_instrument(id),
                        json!({
                            "stream": id.to_string(),
                            "direction": direction.to_string(),
                            "bar_open_time": bar_open_time.to_rfc3339(),
                        }),
                    );
                }
                StreamOutput::DedupMismatch {
                    bar_open_time,
                    mismatches,
                } => {
                    self.emit(
                        now,
                        "data",
                        EventKind::BarDeduped,
                        self.stream_instrument(id),
                        json!({
                            "stream": id.to_string(),
                            "bar_open_time": bar_open_time.to_rfc3339(),
                            "mismatches": mismatches,
                        }),
                    );
                }
                StreamOutput::IntentReady(intent) => {
                    let (slot_time, market_close, entry_allowed) = match self.streams.get(id) {
                        Some(stream) => (
                            stream.config().slot_time,
                            stream.config().market_close,
                            stream.entry_allowed(),
                        ),
                        None => continue,
                    };
                    let ctx = GateContext {
                        now,
                        slot_time,
                        market_close,
                        entry_allowed,
                    };

                    self.emit(
                        now,
                        "execution",
                        EventKind::EntrySubmitted,
                        Some(intent.execution_instrument.clone()),
                        json!({
                            "intent": intent.id.to_string(),
                            "direction": intent.direction.to_string(),
                            "entry_price": intent.entry_price,
                            "stop_price": intent.stop_price,
                            "target_price": intent.target_price,
                        }),
                    );

                    match self.gate.submit_entry(&intent, &ctx).await? {
                        EntryDisposition::Accepted { order_id } => {
                            self.emit(
                                now,
                                "execution",
                                EventKind::EntryAccepted,
                                Some(intent.execution_instrument.clone()),
                                json!({
                                    "intent": intent.id.to_string(),
                                    "order_id": order_id.to_string(),
                                }),
                            );
                        }
                        EntryDisposition::Blocked(denial) if denial.is_invariant_violation() => {
                            self.emit(
                                now,
                                "execution",
                                EventKind::ExecutionGateInvariantViolation,
                                Some(intent.execution_instrument.clone()),
                                json!({
                                    "intent": intent.id.to_string(),
                                    "denial": denial.to_string(),
                                }),
                            );
                            self.escalator.escalate(
                                EventKind::ExecutionGateInvariantViolation,
                                &denial.to_string(),
                                now,
                            );
                        }
                        EntryDisposition::Blocked(denial) => {
                            self.emit(
                                now,
                                "execution",
                                EventKind::ExecutionGateBlocked,
                                Some(intent.execution_instrument.clone()),
                                json!({
                                    "intent": intent.id.to_string(),
                                    "denial": denial.to_string(),
                                }),
                            );
                        }
                        EntryDisposition::Rejected { reason } => {
                            self.emit(
                                now,
                                "execution",
                                EventKind::EntryRejected,
                                Some(intent.execution_instrument.clone()),
                                json!({ "intent": intent.id.to_string(), "reason": reason }),
                            );
                            if let Some(stream) = self.streams.get_mut(id) {
                                queue.extend(stream.on_entry_rejected());
                            }
                        }
                        EntryDisposition::TransportFailed { reason } => {
                            self.emit(
                                now,
                                "execution",
                                EventKind::EntrySubmitFailed,
                                Some(intent.execution_instrument.clone()),
                                json!({ "intent": intent.id.to_string(), "reason": reason }),
                            );
                        }
                    }
                }
                StreamOutput::Committed(reason) => {
                    self.emit(
                        now,
                        "stream",
                        EventKind::StreamCommitted,
                        self.stream_instrument(id),
                        json!({ "stream": id.to_string(), "reason": reason.as_str() }),
                    );
                    self.persist_stream_journal(id, now);

                    let intent_id = self
                        .streams
                        .get(id)
                        .and_then(|stream| stream.intent())
                        .map(|intent| intent.id.clone());
                    if let Some(intent_id) = intent_id {
                        self.exec_journal.set_commit_reason(&intent_id, reason, now)?;

                        // A filled entry keeps its protective orders working; every
                        // other commit tears the stream's orders down.
                        if reason != CommitReason::EntryFilled {
                            let cancelled = self.gate.cancel_intent_orders(&intent_id).await;
                            self.emit(
                                now,
                                "execution",
                                EventKind::OrdersCancelled,
                                self.stream_instrument(id),
                                json!({
                                    "intent": intent_id.to_string(),
                                    "cancelled": cancelled,
                                }),
                            );
                        }
                    }
                }
            }
        }

        Ok(())
    }

    fn stream_instrument(&self, id: &StreamId) -> Option<InstrumentName> {
        self.streams.get(id).map(|stream| stream.config().instrument.clone())
    }

    fn persist_stream_journal(&self, id: &StreamId, now: DateTime<Utc>) {
        let Some(stream) = self.streams.get(id) else {
            return;
        };
        let committed = stream.state().is_terminal();
        let journal = StreamJournal {
            committed,
            last_state: stream.state(),
            last_update_utc: now,
            commit_reason: stream.commit_reason(),
            timetable_hash_at_commit: committed.then(|| self.applied_hash.clone()),
        };

        // Retry once on IO error, then log and continue: the engine must not die on a
        // transient disk hiccup.
        let result = self
            .journals
            .persist(self.trading_date, id, &journal)
            .or_else(|_| self.journals.persist(self.trading_date, id, &journal));

        match result {
            Ok(outcome) if outcome.slow => {
                self.emit(
                    now,
                    "journal",
                    EventKind::LogSlow,
                    None,
                    json!({
                        "stream": id.to_string(),
                        "elapsed_ms": outcome.elapsed.as_millis() as u64,
                    }),
                );
            }
            Ok(_) => {}
            Err(err) => {
                error!(stream = %id, %err, "stream journal persist failed");
            }
        }
    }

    /// Operator stand-down of a single stream.
    pub async fn stand_down_stream(&mut self, id: &StreamId) -> Result<(), EngineError> {
        let now = self.clock.time();
        let outputs = self
            .streams
            .get_mut(id)
            .map(|stream| stream.stand_down())
            .unwrap_or_default();
        if !outputs.is_empty() {
            self.emit(
                now,
                "engine",
                EventKind::StandDownEntered,
                self.stream_instrument(id),
                json!({ "stream": id.to_string() }),
            );
        }
        self.handle_outputs(id, outputs, now).await
    }

    /// Global kill switch: cancel all robot orders, flatten all journalled intents,
    /// and stand the engine down.
    pub async fn kill_switch(&mut self) -> Result<(), EngineError> {
        let now = self.clock.time();
        let intents: Vec<IntentId> = self
            .exec_journal
            .entries()
            .into_iter()
            .filter(|entry| entry.entry_filled)
            .map(|entry| entry.intent.id)
            .collect();

        let cancelled = self.gate.kill_switch(&intents).await;
        self.gate.set_stand_down(true);
        self.emit(
            now,
            "engine",
            EventKind::OrdersCancelled,
            None,
            json!({ "cancelled": cancelled, "flattened": intents.len(), "kill_switch": true }),
        );

        Ok(())
    }

    /// Reconnect reconciliation; clears fail-closed on success.
    async fn run_recovery(&mut self, now: DateTime<Utc>) -> Result<(), EngineError> {
        match reconcile(&self.adapter, &self.exec_journal, now).await {
            Ok(report) => {
                for instrument in &report.unmatched_positions {
                    let ids: Vec<StreamId> = self
                        .streams
                        .iter()
                        .filter(|(_, stream)| stream.config().instrument == *instrument)
                        .map(|(id, _)| id.clone())
                        .collect();
                    for id in ids {
                        self.stand_down_stream(&id).await?;
                    }
                }

                self.emit(
                    now,
                    "recovery",
                    EventKind::RecoveryComplete,
                    None,
                    json!({
                        "orphans_cancelled": report.orphan_intents_cancelled.len(),
                        "matched_positions": report.matched_positions.len(),
                        "unmatched_positions": report.unmatched_positions.len(),
                        "protectives_resubmitted": report.protectives_resubmitted.len(),
                    }),
                );
                self.gate.set_fail_closed(false);
                self.disconnect_since = None;
            }
            Err(err) => {
                // Still disconnected as far as the gate is concerned; the fail-closed
                // timer keeps running.
                error!(%err, "recovery reconciliation failed");
            }
        }

        Ok(())
    }

    /// Idempotent engine stop: persist final journal snapshots and emit the stop
    /// event. The event log flushes when its last handle drops.
    pub async fn shutdown(&mut self) -> Result<(), EngineError> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;

        let now = self.clock.time();
        let ids: Vec<StreamId> = self.streams.keys().cloned().collect();
        for id in ids {
            self.persist_stream_journal(&id, now);
        }

        self.emit(now, "engine", EventKind::EngineStopped, None, json!({}));
        info!("engine stopped");
        Ok(())
    }
}

impl<Clock, Adapter, Provider, Sink> Engine<Clock, Adapter, Provider, Sink>
where
    Clock: EngineClock + Send + 'static,
    Adapter: ExecutionAdapter + 'static,
    Provider: BarProvider + Send + Sync + 'static,
    Sink: NotificationSink + 'static,
{
    /// Production loop: 1 Hz tick, multiplexed feed channel, SIGINT stop. The health
    /// watchdog runs orthogonally on its own timer.
    pub async fn run(
        mut self,
        mut feed_rx: tokio::sync::mpsc::Receiver<EngineFeedEvent>,
    ) -> Result<(), EngineError> {
        let watchdog = spawn_health_watchdog(
            Arc::clone(&self.health),
            Arc::clone(&self.escalator),
            self.event_log.clone(),
        );

        let mut interval = tokio::time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        while !self.stop_requested {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick().await?;
                }
                event = feed_rx.recv() => match event {
                    Some(event) => self.on_feed_event(event).await?,
                    None => self.request_stop(),
                },
                _ = tokio::signal::ctrl_c() => {
                    info!("SIGINT received; stopping engine");
                    self.request_stop();
                }
            }
        }

        // Drain in-flight broker events before the final snapshot.
        while let Ok(event) = feed_rx.try_recv() {
            self.on_feed_event(event).await?;
        }

        watchdog.abort();
        self.shutdown().await
    }
}

fn spawn_health_watchdog<Sink>(
    health: Arc<Mutex<HealthMonitor>>,
    escalator: Arc<CriticalEscalator<Sink>>,
    event_log: EventLogHandle,
) -> tokio::task::JoinHandle<()>
where
    Sink: NotificationSink + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            let now = Utc::now();
            let alerts = health.lock().check(now);
            for alert in alerts {
                let kind = alert.kind();
                event_log.emit_at(
                    now,
                    "health",
                    kind,
                    None,
                    json!({ "detail": format!("{alert:?}") }),
                );
                if kind == EventKind::EngineTickStall {
                    // Tick stall dispatches straight to the sink; the escalator
                    // whitelist covers only invariant and fail-closed events.
                    escalator.notify_direct(
                        kind.as_str(),
                        "engine tick stalled inside an active monitoring window",
                    );
                }
            }
        }
    })
}
