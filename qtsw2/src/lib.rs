#![forbid(unsafe_code)]
#![warn(
    unused,
    clippy::cognitive_complexity,
    unused_crate_dependencies,
    unused_extern_crates,
    clippy::unused_self,
    clippy::useless_let_if_seq,
    missing_debug_implementations,
    rust_2018_idioms,
    rust_2024_compatibility
)]
#![allow(clippy::type_complexity, clippy::too_many_arguments)]

//! # QTSW2
//! Deterministic, fail-closed breakout-trading execution engine driven by a
//! time-indexed plan ("timetable").
//!
//! For each configured stream (one session of one instrument) the engine:
//! * Reconstructs a price range from bars in a session-defined pre-slot window.
//! * Locks that range at the slot boundary.
//! * Watches for a breakout past the range under strict time and gap-tolerance rules.
//! * Submits a bracketed entry through an authorization gate with an idempotent
//!   execution journal.
//! * Slides the protective stop to break-even once price advances far enough.
//! * Persists per-stream and per-intent state so a restart never duplicates orders.
//!
//! At a high-level, it provides a few major components:
//! * `Engine` with injected `EngineClock`, `ExecutionAdapter`, `BarProvider`,
//!   `NotificationSink` dependencies.
//! * A per-stream `Stream` state machine driven by a 1 Hz tick and bar deliveries.
//! * An `ExecutionGate` enforcing stand-down, broker-sync, mode, slot-window,
//!   idempotency and state invariants before any broker call.
//! * A closed `EventKind` registry feeding a JSONL event log with rotation.
//! * A `HealthMonitor` and `RecoveryCoordinator` for stall detection and
//!   post-disconnect reconciliation.

use smol_str::SmolStr;

/// Breakout engine core: tick dispatch, timetable ingestion, stream fan-out,
/// execution gate and break-even monitor.
pub mod engine;

/// Defines all possible errors in QTSW2 core.
pub mod error;

/// Timetable and parity-spec configuration documents.
pub mod config;

/// Structured event registry and the JSONL event log.
pub mod event;

/// Liveness, stall, connection and critical-event supervision.
pub mod health;

/// Per-stream and per-intent persisted journals.
pub mod journal;

/// Provides default QTSW2 Tracing logging initialisers.
pub mod logging;

/// Post-disconnect reconciliation against the broker account snapshot.
pub mod recovery;

/// The per-stream trading lifecycle state machine.
pub mod stream;

/// Unique identifier of one engine run, embedded in every event record and used to
/// deduplicate critical notifications.
#[derive(
    Debug,
    Clone,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    serde::Deserialize,
    serde::Serialize,
    derive_more::Display,
)]
pub struct RunId(pub SmolStr);

impl RunId {
    /// Derive a fresh run id from the engine start instant plus a random suffix.
    pub fn generate(start: chrono::DateTime<chrono::Utc>) -> Self {
        use rand::Rng;
        let suffix: u32 = rand::rng().random_range(0x1000..=0xFFFF);
        Self(smol_str::format_smolstr!(
            "{}-{suffix:04x}",
            start.format("%Y%m%dT%H%M%S")
        ))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl From<&str> for RunId {
    fn from(value: &str) -> Self {
        Self(SmolStr::from(value))
    }
}
