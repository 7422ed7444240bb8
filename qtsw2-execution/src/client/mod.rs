use crate::{
    error::ExecutionError,
    intent::{Intent, IntentId},
    order::{OcoGroupId, OrderId},
};
use derive_more::Constructor;
use qtsw2_instrument::InstrumentName;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::future::Future;

pub mod dryrun;
pub mod mock;

/// Broker response to a single order submission or modification.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub enum SubmitOutcome {
    Accepted { order_id: OrderId },
    /// Broker refused the request. Fatal for the intent.
    Rejected { reason: String },
    /// Transport-level failure; the request may not have reached the broker.
    Failed { reason: String },
}

impl SubmitOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }

    /// Only transport failures are retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// Broker response to an OCO protective pair submission.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub enum ProtectivesOutcome {
    Accepted {
        stop_order_id: OrderId,
        target_order_id: OrderId,
    },
    Rejected {
        reason: String,
    },
    Failed {
        reason: String,
    },
}

impl ProtectivesOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// An open position reported by the broker account snapshot.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize, Constructor)]
pub struct Position {
    pub instrument: InstrumentName,
    /// Signed contracts: positive long, negative short.
    pub quantity: Decimal,
    pub average_price: Decimal,
}

/// A working order reported by the broker account snapshot.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize, Constructor)]
pub struct WorkingOrder {
    pub order_id: OrderId,
    /// Raw echo tag; robot orders decode via [`OrderTag::decode`](crate::order::OrderTag::decode).
    pub tag: Option<SmolStr>,
    pub instrument: InstrumentName,
    pub price: Decimal,
}

/// Broker account state used by the recovery coordinator.
#[derive(Debug, Clone, Eq, PartialEq, Default, Deserialize, Serialize, Constructor)]
pub struct AccountSnapshot {
    pub positions: Vec<Position>,
    pub working_orders: Vec<WorkingOrder>,
}

/// Broker-facing submit/modify/cancel/snapshot contract.
///
/// Implementations correlate broker echoes back to intents via the order `tag`; the
/// engine never sees broker-native identifiers except the opaque [`OrderId`].
pub trait ExecutionAdapter
where
    Self: Clone + Send + Sync,
{
    /// Submit the entry order for `intent` at its breakout level.
    fn submit_entry(&self, intent: &Intent) -> impl Future<Output = SubmitOutcome> + Send;

    /// Submit the protective stop and target after the entry filled at `fill_price`,
    /// grouped one-cancels-other under `oco_group` at the broker.
    fn submit_protectives(
        &self,
        intent: &Intent,
        fill_price: Decimal,
        oco_group: &OcoGroupId,
    ) -> impl Future<Output = ProtectivesOutcome> + Send;

    /// Replace the working stop of `intent_id` with `new_stop_price`.
    fn modify_stop(
        &self,
        intent_id: &IntentId,
        new_stop_price: Decimal,
    ) -> impl Future<Output = SubmitOutcome> + Send;

    /// Close the position of `intent_id` at market, immediately.
    fn flatten(&self, intent_id: &IntentId) -> impl Future<Output = SubmitOutcome> + Send;

    /// Cancel all working orders bearing the given intent's robot tags. Returns the
    /// cancelled count.
    fn cancel_intent_orders(&self, intent_id: &IntentId) -> impl Future<Output = usize> + Send;

    /// Kill switch: cancel every robot-tagged order at the broker. Returns the
    /// cancelled count.
    fn cancel_robot_orders(&self) -> impl Future<Output = usize> + Send;

    fn snapshot_account(
        &self,
    ) -> impl Future<Output = Result<AccountSnapshot, ExecutionError>> + Send;
}
