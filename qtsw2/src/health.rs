use crate::{
    RunId,
    config::{ParitySpec, Timetable},
    event::EventKind,
};
use chrono::{DateTime, TimeDelta, Utc};
use fnv::FnvHashMap;
use parking_lot::Mutex;
use qtsw2_data::{TimeWindow, time::TradingZone};
use qtsw2_execution::ConnectionStatus;
use qtsw2_instrument::InstrumentName;
use std::collections::HashSet;
use tracing::info;

/// Priority carried to the notification service.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum NotificationPriority {
    Normal,
    High,
}

/// Opaque critical-notification delivery boundary. The engine only enqueues;
/// delivery, retry and acknowledgement are the service's concern.
pub trait NotificationSink
where
    Self: Send + Sync,
{
    fn notify(&self, title: &str, message: &str, priority: NotificationPriority);
}

/// Sink that drops everything; used when no delivery service is wired.
#[derive(Debug, Default, Copy, Clone)]
pub struct NullNotificationSink;

impl NotificationSink for NullNotificationSink {
    fn notify(&self, title: &str, message: &str, _: NotificationPriority) {
        info!(title, message, "critical notification (no sink configured)");
    }
}

/// Gate in front of the notification sink: only whitelisted event kinds escalate, at
/// most once per `(kind, run_id)` and no more than once per five minutes per kind.
#[derive(Debug)]
pub struct CriticalEscalator<Sink> {
    sink: Sink,
    run_id: RunId,
    seen: Mutex<HashSet<(EventKind, RunId)>>,
    last_per_kind: Mutex<FnvHashMap<EventKind, DateTime<Utc>>>,
}

const ESCALATION_WINDOW: TimeDelta = TimeDelta::minutes(5);

impl<Sink> CriticalEscalator<Sink>
where
    Sink: NotificationSink,
{
    pub fn new(sink: Sink, run_id: RunId) -> Self {
        Self {
            sink,
            run_id,
            seen: Mutex::new(HashSet::new()),
            last_per_kind: Mutex::new(FnvHashMap::default()),
        }
    }

    /// Returns true when a notification was actually enqueued.
    pub fn escalate(&self, kind: EventKind, message: &str, now: DateTime<Utc>) -> bool {
        if !kind.is_critical() {
            return false;
        }

        {
            let mut seen = self.seen.lock();
            if !seen.insert((kind, self.run_id.clone())) {
                return false;
            }
        }

        {
            let mut last = self.last_per_kind.lock();
            match last.get(&kind) {
                Some(previous) if now - *previous < ESCALATION_WINDOW => return false,
                _ => {
                    last.insert(kind, now);
                }
            }
        }

        self.sink
            .notify(kind.as_str(), message, NotificationPriority::High);
        true
    }

    /// Bypass the whitelist for alerts that always dispatch (tick stall).
    pub fn notify_direct(&self, title: &str, message: &str) {
        self.sink.notify(title, message, NotificationPriority::High);
    }
}

/// Supervision thresholds.
#[derive(Debug, Copy, Clone)]
pub struct HealthThresholds {
    pub tick_stall: TimeDelta,
    pub connection_lost: TimeDelta,
    pub data_stall: TimeDelta,
    pub window_grace: TimeDelta,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            tick_stall: TimeDelta::seconds(120),
            connection_lost: TimeDelta::seconds(60),
            data_stall: TimeDelta::minutes(3),
            window_grace: TimeDelta::minutes(5),
        }
    }
}

/// Alert produced by a supervision check.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum HealthAlert {
    TickStall { silent_for: TimeDelta },
    TickRecovered { silent_for: TimeDelta },
    ConnectionLostSustained { status: ConnectionStatus, lost_for: TimeDelta },
    DataStall { instrument: InstrumentName, age: TimeDelta },
}

impl HealthAlert {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::TickStall { .. } => EventKind::EngineTickStall,
            Self::TickRecovered { .. } => EventKind::EngineTickRecovered,
            Self::ConnectionLostSustained { .. } => EventKind::ConnectionLostSustained,
            Self::DataStall { .. } => EventKind::DataStall,
        }
    }
}

/// Monitoring windows derived from the timetable: the union of
/// `[range_start - grace, slot_time + grace]` per enabled stream.
pub fn monitoring_windows(
    timetable: &Timetable,
    parity: &ParitySpec,
    zone: TradingZone,
    grace: TimeDelta,
) -> Vec<TimeWindow> {
    let mut windows: Vec<TimeWindow> = timetable
        .streams
        .iter()
        .filter(|directive| directive.enabled)
        .filter_map(|directive| {
            let session = parity.sessions.get(directive.session.as_str())?;
            let start = zone.resolve(timetable.trading_date, session.range_start_time) - grace;
            let end = zone.resolve(timetable.trading_date, directive.slot_time) + grace;
            Some(TimeWindow::new(start, end))
        })
        .collect();

    windows.sort_by_key(|window| window.start);
    windows
}

/// Liveness, stall and connection supervision. Runs orthogonally to the engine tick
/// (a watchdog task calls [`check`](HealthMonitor::check) on its own timer).
#[derive(Debug)]
pub struct HealthMonitor {
    thresholds: HealthThresholds,
    windows: Vec<TimeWindow>,
    last_tick: Option<DateTime<Utc>>,
    tick_stalled: bool,
    connection: ConnectionStatus,
    non_connected_since: Option<DateTime<Utc>>,
    connection_alerted: bool,
    last_bar: FnvHashMap<InstrumentName, DateTime<Utc>>,
    data_alerted: bool,
}

impl HealthMonitor {
    pub fn new(thresholds: HealthThresholds, windows: Vec<TimeWindow>) -> Self {
        Self {
            thresholds,
            windows,
            last_tick: None,
            tick_stalled: false,
            connection: ConnectionStatus::Connected,
            non_connected_since: None,
            connection_alerted: false,
            last_bar: FnvHashMap::default(),
            data_alerted: false,
        }
    }

    fn in_window(&self, now: DateTime<Utc>) -> bool {
        // Monitoring windows are closed at both ends (grace already applied).
        self.windows
            .iter()
            .any(|window| window.start <= now && now <= window.end)
    }

    /// Engine tick heartbeat. Returns a recovery alert when a stall just healed.
    pub fn heartbeat(&mut self, now: DateTime<Utc>) -> Option<HealthAlert> {
        let recovered = if self.tick_stalled {
            let silent_for = self
                .last_tick
                .map(|last| now - last)
                .unwrap_or_else(TimeDelta::zero);
            self.tick_stalled = false;
            Some(HealthAlert::TickRecovered { silent_for })
        } else {
            None
        };

        self.last_tick = Some(now);
        recovered
    }

    pub fn on_connection(&mut self, status: ConnectionStatus, now: DateTime<Utc>) {
        self.connection = status;
        if status.is_connected() {
            self.non_connected_since = None;
            self.connection_alerted = false;
        } else if self.non_connected_since.is_none() {
            self.non_connected_since = Some(now);
        }
    }

    pub fn connection(&self) -> ConnectionStatus {
        self.connection
    }

    pub fn on_bar_seen(&mut self, instrument: InstrumentName, open_time: DateTime<Utc>) {
        let entry = self.last_bar.entry(instrument).or_insert(open_time);
        if open_time > *entry {
            *entry = open_time;
        }
        self.data_alerted = false;
    }

    /// Watchdog pass. Only fires inside an active monitoring window.
    pub fn check(&mut self, now: DateTime<Utc>) -> Vec<HealthAlert> {
        if !self.in_window(now) {
            return Vec::new();
        }

        let mut alerts = Vec::new();

        if let Some(last_tick) = self.last_tick {
            let silent_for = now - last_tick;
            if silent_for >= self.thresholds.tick_stall && !self.tick_stalled {
                self.tick_stalled = true;
                alerts.push(HealthAlert::TickStall { silent_for });
            }
        }

        if let Some(since) = self.non_connected_since {
            let lost_for = now - since;
            if lost_for >= self.thresholds.connection_lost && !self.connection_alerted {
                self.connection_alerted = true;
                alerts.push(HealthAlert::ConnectionLostSustained {
                    status: self.connection,
                    lost_for,
                });
            }
        }

        // Worst bar age across instruments, log-only by default.
        if !self.data_alerted {
            let worst = self
                .last_bar
                .iter()
                .map(|(instrument, last)| (instrument.clone(), now - *last))
                .max_by_key(|(_, age)| *age);
            if let Some((instrument, age)) = worst {
                if age >= self.thresholds.data_stall {
                    self.data_alerted = true;
                    alerts.push(HealthAlert::DataStall { instrument, age });
                }
            }
        }

        alerts
    }
}
