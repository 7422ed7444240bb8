use crate::{
    journal::{JournalError, write_atomic},
    stream::CommitReason,
};
use chrono::{DateTime, NaiveDate, Utc};
use fnv::FnvHashMap;
use parking_lot::Mutex;
use qtsw2_execution::{
    intent::{Intent, IntentId},
    order::{OrderId, OrderRole},
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Per-intent persisted order-lifecycle state. Source of truth for recovery and
/// submission idempotency.
///
/// The full [`Intent`] is embedded so a restarted engine recovers every price level
/// (protective resubmission, break-even monitoring) from disk alone.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct ExecutionJournalEntry {
    pub intent: Intent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry_order_id: Option<OrderId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_order_id: Option<OrderId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_order_id: Option<OrderId>,
    pub entry_filled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fill_price: Option<Decimal>,
    pub be_modified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub be_modified_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub be_stop_price: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_reason: Option<CommitReason>,
    pub last_update_utc: DateTime<Utc>,
}

impl ExecutionJournalEntry {
    fn new(intent: &Intent, now: DateTime<Utc>) -> Self {
        Self {
            intent: intent.clone(),
            entry_order_id: None,
            stop_order_id: None,
            target_order_id: None,
            entry_filled: false,
            fill_price: None,
            be_modified: false,
            be_modified_at: None,
            be_stop_price: None,
            commit_reason: None,
            last_update_utc: now,
        }
    }

    /// Whether a broker order id is already persisted for `role`. Drives the
    /// idempotency gate.
    pub fn has_order(&self, role: OrderRole) -> bool {
        match role {
            OrderRole::Entry => self.entry_order_id.is_some(),
            OrderRole::Stop => self.stop_order_id.is_some(),
            OrderRole::Target => self.target_order_id.is_some(),
        }
    }
}

/// Write-through store of [`ExecutionJournalEntry`] keyed by intent, persisted as
/// `execution/{trading_date}_{stream}_{intent_id}.json` with atomic replace.
///
/// A process-wide guard serializes mutation of the keyed map; every mutation lands on
/// disk before the call returns. `last_update_utc` is monotone per entry.
#[derive(Debug)]
pub struct ExecutionJournal {
    dir: PathBuf,
    entries: Mutex<FnvHashMap<IntentId, ExecutionJournalEntry>>,
}

impl ExecutionJournal {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, JournalError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|source| JournalError::Io {
            path: dir.display().to_string(),
            source,
        })?;
        Ok(Self {
            dir,
            entries: Mutex::new(FnvHashMap::default()),
        })
    }

    fn path(&self, entry: &ExecutionJournalEntry) -> PathBuf {
        self.dir.join(format!(
            "{}_{}_{}.json",
            entry.intent.trading_date, entry.intent.stream, entry.intent.id
        ))
    }

    /// Load every persisted entry for `trading_date` into the in-memory map. Returns
    /// how many were restored. Called once at engine start and on recovery.
    pub fn load_date(&self, trading_date: NaiveDate) -> Result<usize, JournalError> {
        let prefix = format!("{trading_date}_");
        let mut restored = 0usize;

        let read_dir = std::fs::read_dir(&self.dir).map_err(|source| JournalError::Io {
            path: self.dir.display().to_string(),
            source,
        })?;

        let mut entries = self.entries.lock();
        for dir_entry in read_dir.flatten() {
            let name = dir_entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with(&prefix) || !name.ends_with(".json") {
                continue;
            }

            let entry = read_entry(&dir_entry.path())?;
            entries.insert(entry.intent.id.clone(), entry);
            restored += 1;
        }

        Ok(restored)
    }

    pub fn get(&self, intent_id: &IntentId) -> Option<ExecutionJournalEntry> {
        self.entries.lock().get(intent_id).cloned()
    }

    pub fn entries(&self) -> Vec<ExecutionJournalEntry> {
        self.entries.lock().values().cloned().collect()
    }

    /// Entries with a filled entry order and no break-even modification yet: the
    /// break-even monitor's working set.
    pub fn filled_pending_be(&self) -> Vec<ExecutionJournalEntry> {
        self.entries
            .lock()
            .values()
            .filter(|entry| entry.entry_filled && !entry.be_modified)
            .cloned()
            .collect()
    }

    /// Create the entry for `intent` if absent, persisting it before any broker call.
    /// Returns false when the entry already existed.
    pub fn ensure_entry(&self, intent: &Intent, now: DateTime<Utc>) -> Result<bool, JournalError> {
        let mut entries = self.entries.lock();
        if entries.contains_key(&intent.id) {
            return Ok(false);
        }

        let entry = ExecutionJournalEntry::new(intent, now);
        write_atomic(&self.path(&entry), &to_bytes(&entry, &self.dir)?)?;
        entries.insert(intent.id.clone(), entry);
        Ok(true)
    }

    pub fn record_order(
        &self,
        intent_id: &IntentId,
        role: OrderRole,
        order_id: OrderId,
        now: DateTime<Utc>,
    ) -> Result<(), JournalError> {
        self.mutate(intent_id, now, |entry| {
            match role {
                OrderRole::Entry => entry.entry_order_id = Some(order_id),
                OrderRole::Stop => entry.stop_order_id = Some(order_id),
                OrderRole::Target => entry.target_order_id = Some(order_id),
            }
            true
        })
        .map(|_| ())
    }

    /// First-fill marker. Returns false (and mutates nothing) when the entry was
    /// already filled, making repeated broker fill events idempotent.
    pub fn mark_entry_filled(
        &self,
        intent_id: &IntentId,
        fill_price: Decimal,
        now: DateTime<Utc>,
    ) -> Result<bool, JournalError> {
        self.mutate(intent_id, now, |entry| {
            if entry.entry_filled {
                return false;
            }
            entry.entry_filled = true;
            entry.fill_price = Some(fill_price);
            true
        })
    }

    /// Exactly-once break-even marker. Returns false when already modified.
    pub fn mark_be_modified(
        &self,
        intent_id: &IntentId,
        be_stop_price: Decimal,
        now: DateTime<Utc>,
    ) -> Result<bool, JournalError> {
        self.mutate(intent_id, now, |entry| {
            if entry.be_modified {
                return false;
            }
            entry.be_modified = true;
            entry.be_modified_at = Some(now);
            entry.be_stop_price = Some(be_stop_price);
            true
        })
    }

    pub fn set_commit_reason(
        &self,
        intent_id: &IntentId,
        reason: CommitReason,
        now: DateTime<Utc>,
    ) -> Result<(), JournalError> {
        self.mutate(intent_id, now, |entry| {
            entry.commit_reason = Some(reason);
            true
        })
        .map(|_| ())
    }

    /// Apply `mutation` under the process-wide guard and persist when it reports a
    /// change. Unknown intents are ignored (restart races resolve via `load_date`).
    fn mutate(
        &self,
        intent_id: &IntentId,
        now: DateTime<Utc>,
        mutation: impl FnOnce(&mut ExecutionJournalEntry) -> bool,
    ) -> Result<bool, JournalError> {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(intent_id) else {
            return Ok(false);
        };

        if !mutation(entry) {
            return Ok(false);
        }

        // Monotone timestamps even against a stepping-back wall clock.
        entry.last_update_utc = now.max(entry.last_update_utc);
        let path = self.path(entry);
        write_atomic(&path, &to_bytes(entry, &self.dir)?)?;
        Ok(true)
    }
}

fn to_bytes(entry: &ExecutionJournalEntry, dir: &Path) -> Result<Vec<u8>, JournalError> {
    serde_json::to_vec_pretty(entry).map_err(|err| JournalError::Serde {
        path: dir.display().to_string(),
        detail: err.to_string(),
    })
}

fn read_entry(path: &Path) -> Result<ExecutionJournalEntry, JournalError> {
    let bytes = std::fs::read(path).map_err(|source| JournalError::Io {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_slice(&bytes).map_err(|err| JournalError::Serde {
        path: path.display().to_string(),
        detail: err.to_string(),
    })
}
