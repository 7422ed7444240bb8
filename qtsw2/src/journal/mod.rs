use crate::{
    config::ContentHash,
    stream::{CommitReason, StreamState},
};
use chrono::{DateTime, NaiveDate, Utc};
use fnv::FnvHashMap;
use parking_lot::Mutex;
use qtsw2_instrument::StreamId;
use serde::{Deserialize, Serialize};
use smol_str::{SmolStr, format_smolstr};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};
use thiserror::Error;

/// Per-intent order-lifecycle journal.
pub mod execution;

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("journal io {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("journal serde {path}: {detail}")]
    Serde { path: String, detail: String },
}

/// Persisted per-(trading_date, stream) state for restart and idempotency.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct StreamJournal {
    pub committed: bool,
    pub last_state: StreamState,
    pub last_update_utc: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_reason: Option<CommitReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timetable_hash_at_commit: Option<ContentHash>,
}

/// Result of one journal write, for the slow-write metric.
#[derive(Debug, Copy, Clone)]
pub struct PersistOutcome {
    pub elapsed: Duration,
    pub slow: bool,
}

/// Journal writes beyond this budget emit a `LogSlow` metric event.
pub const WRITE_BUDGET: Duration = Duration::from_millis(25);

/// Atomic replace: write a sibling temp file, then rename over the target. Readers
/// concurrent with a write see either the old or the new content, never a mix.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), JournalError> {
    let io = |source: std::io::Error| JournalError::Io {
        path: path.display().to_string(),
        source,
    };

    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, bytes).map_err(io)?;
    std::fs::rename(&tmp, path).map_err(io)
}

/// Directory-backed store of [`StreamJournal`] records, keyed
/// `journal/{trading_date}_{stream}.json`, with a per-stream write guard.
#[derive(Debug)]
pub struct JournalStore {
    dir: PathBuf,
    locks: Mutex<FnvHashMap<SmolStr, Arc<Mutex<()>>>>,
}

impl JournalStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, JournalError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|source| JournalError::Io {
            path: dir.display().to_string(),
            source,
        })?;
        Ok(Self {
            dir,
            locks: Mutex::new(FnvHashMap::default()),
        })
    }

    fn path(&self, trading_date: NaiveDate, stream: &StreamId) -> PathBuf {
        self.dir.join(format!("{trading_date}_{stream}.json"))
    }

    fn lock_for(&self, trading_date: NaiveDate, stream: &StreamId) -> Arc<Mutex<()>> {
        let key = format_smolstr!("{trading_date}_{stream}");
        Arc::clone(self.locks.lock().entry(key).or_default())
    }

    pub fn load(
        &self,
        trading_date: NaiveDate,
        stream: &StreamId,
    ) -> Result<Option<StreamJournal>, JournalError> {
        let path = self.path(trading_date, stream);
        let guard = self.lock_for(trading_date, stream);
        let _held = guard.lock();

        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(JournalError::Io {
                    path: path.display().to_string(),
                    source,
                });
            }
        };

        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|err| JournalError::Serde {
                path: path.display().to_string(),
                detail: err.to_string(),
            })
    }

    pub fn persist(
        &self,
        trading_date: NaiveDate,
        stream: &StreamId,
        journal: &StreamJournal,
    ) -> Result<PersistOutcome, JournalError> {
        let path = self.path(trading_date, stream);
        let bytes = serde_json::to_vec_pretty(journal).map_err(|err| JournalError::Serde {
            path: path.display().to_string(),
            detail: err.to_string(),
        })?;

        let guard = self.lock_for(trading_date, stream);
        let _held = guard.lock();

        let started = Instant::now();
        write_atomic(&path, &bytes)?;
        let elapsed = started.elapsed();

        Ok(PersistOutcome {
            elapsed,
            slow: elapsed > WRITE_BUDGET,
        })
    }
}
