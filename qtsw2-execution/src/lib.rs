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
#![allow(clippy::type_complexity)]

//! # QTSW2-Execution
//! The broker boundary of the QTSW2 breakout engine: the [`ExecutionAdapter`](client::ExecutionAdapter)
//! submit/modify/cancel/snapshot contract, robot order tags, the breakout [`Intent`](intent::Intent)
//! model, and broker push events.
//!
//! The broker API itself lives behind the adapter; this crate defines the contract, a
//! [`MockExecutionAdapter`](client::mock::MockExecutionAdapter) for tests and a
//! [`DryRunExecutionAdapter`](client::dryrun::DryRunExecutionAdapter) for rehearsal runs.

use derive_more::From;
use serde::{Deserialize, Serialize};

/// `ExecutionAdapter` contract and adapter implementations.
pub mod client;

/// Breakout trade decision: entry, protective and break-even levels.
pub mod intent;

/// Robot order identifiers, tags and broker push events.
pub mod order;

/// Defines all possible errors in QTSW2-Execution.
pub mod error;

/// Broker connection classification, as reported by the adapter's transport.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
    Error,
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

/// Push event published by the broker adapter onto the engine channel.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize, From)]
pub enum BrokerEvent {
    Order(order::OrderUpdate),
    Execution(order::ExecutionUpdate),
    Connection(ConnectionStatus),
}

/// Execution mode gating which adapters may submit.
///
/// `Live` stays disabled until the operator arms it; `Sim` and `DryRun` are always
/// permitted for their adapters.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
pub enum ExecutionMode {
    Live,
    Sim,
    DryRun,
}

impl ExecutionMode {
    pub fn is_permitted(&self, live_armed: bool) -> bool {
        match self {
            Self::Live => live_armed,
            Self::Sim | Self::DryRun => true,
        }
    }
}
