use crate::{
    RunId,
    event::{EventKind, EventRecord, Severity, redact},
};
use chrono::{DateTime, NaiveDate, Utc};
use qtsw2_instrument::InstrumentName;
use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};
use tokio::sync::mpsc;
use tracing::{error, warn};

/// Event-log writer configuration.
#[derive(Debug, Clone)]
pub struct EventLogConfig {
    pub dir: PathBuf,
    pub queue_depth: usize,
    pub max_file_bytes: u64,
    pub retain_days: i64,
}

impl EventLogConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            queue_depth: 50_000,
            max_file_bytes: 64 * 1024 * 1024,
            retain_days: 30,
        }
    }
}

/// Cloneable emission handle over the bounded event-log queue.
///
/// DEBUG records are dropped (counted) on overflow; ERROR records that cannot be
/// enqueued are written synchronously to a sidecar file so they never vanish.
#[derive(Debug, Clone)]
pub struct EventLogHandle {
    tx: mpsc::Sender<EventRecord>,
    run_id: RunId,
    sidecar: PathBuf,
    dropped: Arc<AtomicU64>,
}

impl EventLogHandle {
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn emit(
        &self,
        source: &str,
        kind: EventKind,
        instrument: Option<InstrumentName>,
        data: serde_json::Value,
    ) {
        self.emit_at(Utc::now(), source, kind, instrument, data)
    }

    pub fn emit_at(
        &self,
        ts_utc: DateTime<Utc>,
        source: &str,
        kind: EventKind,
        instrument: Option<InstrumentName>,
        mut data: serde_json::Value,
    ) {
        redact(&mut data);
        let record = EventRecord {
            ts_utc,
            level: kind.severity(),
            source: source.to_string(),
            instrument,
            event: kind,
            run_id: self.run_id.clone(),
            data,
        };

        if let Err(err) = self.tx.try_send(record) {
            let record = match err {
                mpsc::error::TrySendError::Full(record) => record,
                mpsc::error::TrySendError::Closed(record) => record,
            };
            self.dropped.fetch_add(1, Ordering::Relaxed);
            if record.level >= Severity::Error {
                write_sidecar(&self.sidecar, &record);
            }
        }
    }
}

/// Start the event log: returns the emission handle and the drain-task join handle.
///
/// The writer exits once every handle clone is dropped and the queue is drained.
pub fn start(
    config: EventLogConfig,
    run_id: RunId,
) -> std::io::Result<(EventLogHandle, tokio::task::JoinHandle<()>)> {
    fs::create_dir_all(&config.dir)?;

    let (tx, rx) = mpsc::channel(config.queue_depth);
    let handle = EventLogHandle {
        tx,
        run_id,
        sidecar: config.dir.join("error-sidecar.jsonl"),
        dropped: Arc::new(AtomicU64::new(0)),
    };

    let writer = Writer {
        rx,
        dir: config.dir,
        max_file_bytes: config.max_file_bytes,
        retain_days: config.retain_days,
        open: None,
    };

    Ok((handle, tokio::spawn(writer.run())))
}

fn write_sidecar(path: &Path, record: &EventRecord) {
    let line = match serde_json::to_string(record) {
        Ok(line) => line,
        Err(err) => {
            error!(?err, "event record unserializable for sidecar");
            return;
        }
    };

    let result = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut file| writeln!(file, "{line}"));

    if let Err(err) = result {
        error!(?err, "sidecar write failed; ERROR event lost");
    }
}

#[derive(Debug)]
struct OpenFile {
    file: fs::File,
    date: NaiveDate,
    bytes: u64,
    rotation: u32,
}

#[derive(Debug)]
struct Writer {
    rx: mpsc::Receiver<EventRecord>,
    dir: PathBuf,
    max_file_bytes: u64,
    retain_days: i64,
    open: Option<OpenFile>,
}

impl Writer {
    async fn run(mut self) {
        while let Some(record) = self.rx.recv().await {
            if let Err(err) = self.write(&record) {
                error!(?err, event = %record.event, "event log write failed");
            }
        }

        if let Some(open) = self.open.as_mut() {
            let _ = open.file.flush();
        }
    }

    fn path_for(&self, date: NaiveDate, rotation: u32) -> PathBuf {
        match rotation {
            0 => self.dir.join(format!("events-{date}.jsonl")),
            n => self.dir.join(format!("events-{date}.{n}.jsonl")),
        }
    }

    fn write(&mut self, record: &EventRecord) -> std::io::Result<()> {
        let date = record.ts_utc.date_naive();

        let needs_reopen = match &self.open {
            None => true,
            Some(open) => open.date != date || open.bytes >= self.max_file_bytes,
        };

        if needs_reopen {
            let rotation = match &self.open {
                // Same date, size rollover: bump the rotation counter.
                Some(open) if open.date == date => open.rotation + 1,
                // Date change: archive old files before starting the new day.
                _ => {
                    self.archive_expired(date);
                    0
                }
            };

            let path = self.path_for(date, rotation);
            let file = fs::OpenOptions::new().create(true).append(true).open(&path)?;
            let bytes = file.metadata().map(|m| m.len()).unwrap_or(0);
            self.open = Some(OpenFile {
                file,
                date,
                bytes,
                rotation,
            });
        }

        let open = self.open.as_mut().expect("opened above");
        let line = serde_json::to_string(record)?;
        writeln!(open.file, "{line}")?;
        open.bytes += line.len() as u64 + 1;
        open.file.flush()
    }

    /// Move event files older than the retention horizon into `archive/`.
    fn archive_expired(&self, today: NaiveDate) {
        let archive_dir = self.dir.join("archive");
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return;
        };

        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(date) = parse_event_file_date(name) else {
                continue;
            };

            if (today - date).num_days() > self.retain_days {
                if fs::create_dir_all(&archive_dir).is_err() {
                    warn!("event log archive directory unavailable");
                    return;
                }
                if let Err(err) = fs::rename(entry.path(), archive_dir.join(name)) {
                    warn!(?err, file = name, "event log archival failed");
                }
            }
        }
    }
}

fn parse_event_file_date(name: &str) -> Option<NaiveDate> {
    let rest = name.strip_prefix("events-")?;
    let date = rest.get(..10)?;
    date.parse().ok()
}

/// Parse a JSONL event file back into records, for audit tooling and tests.
pub fn read_records(path: &Path) -> std::io::Result<Vec<EventRecord>> {
    let content = fs::read_to_string(path)?;
    content
        .lines()
        .map(|line| serde_json::from_str(line).map_err(std::io::Error::other))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[tokio::test]
    async fn test_event_log_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, join) = start(
            EventLogConfig::new(dir.path()),
            RunId::from("20250307T130000-abcd"),
        )
        .unwrap();

        let ts = Utc.with_ymd_and_hms(2025, 3, 7, 15, 0, 0).unwrap();
        handle.emit_at(
            ts,
            "engine",
            EventKind::RangeLocked,
            Some(InstrumentName::new("ES")),
            json!({ "range_high": "100.50", "range_low": "99.00" }),
        );
        handle.emit_at(
            ts,
            "gate",
            EventKind::ExecutionGateBlocked,
            None,
            json!({ "check": "slot_time", "account": "U123" }),
        );

        drop(handle);
        join.await.unwrap();

        let records = read_records(&dir.path().join("events-2025-03-07.jsonl")).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].event, EventKind::RangeLocked);
        assert_eq!(records[0].level, Severity::Info);
        assert_eq!(records[0].run_id.as_str(), "20250307T130000-abcd");
        // Sensitive keys are redacted before hitting the queue.
        assert_eq!(records[1].data["account"], "***");
    }

    #[tokio::test]
    async fn test_daily_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, join) = start(
            EventLogConfig::new(dir.path()),
            RunId::from("20250307T130000-abcd"),
        )
        .unwrap();

        let day1 = Utc.with_ymd_and_hms(2025, 3, 7, 23, 59, 0).unwrap();
        let day2 = Utc.with_ymd_and_hms(2025, 3, 8, 0, 1, 0).unwrap();
        handle.emit_at(day1, "engine", EventKind::EngineStarted, None, json!({}));
        handle.emit_at(day2, "engine", EventKind::EngineStopped, None, json!({}));

        drop(handle);
        join.await.unwrap();

        assert!(dir.path().join("events-2025-03-07.jsonl").exists());
        assert!(dir.path().join("events-2025-03-08.jsonl").exists());
    }
}
