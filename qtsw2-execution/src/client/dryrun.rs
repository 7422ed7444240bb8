use crate::{
    client::{AccountSnapshot, ExecutionAdapter, ProtectivesOutcome, SubmitOutcome},
    error::ExecutionError,
    intent::{Intent, IntentId},
    order::{OcoGroupId, OrderId},
};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use smol_str::format_smolstr;
use std::sync::Arc;
use tracing::info;

/// Rehearsal adapter: logs every would-be broker call and accepts it with a
/// generated `DRY-{n}` order id. Nothing reaches a broker.
#[derive(Debug, Clone, Default)]
pub struct DryRunExecutionAdapter {
    next_order_id: Arc<Mutex<u64>>,
}

impl DryRunExecutionAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    fn order_id(&self) -> OrderId {
        let mut next = self.next_order_id.lock();
        *next += 1;
        OrderId::new(format_smolstr!("DRY-{}", *next))
    }
}

impl ExecutionAdapter for DryRunExecutionAdapter {
    async fn submit_entry(&self, intent: &Intent) -> SubmitOutcome {
        let order_id = self.order_id();
        info!(
            intent = %intent.id,
            direction = %intent.direction,
            entry = %intent.entry_price,
            %order_id,
            "dry-run entry"
        );
        SubmitOutcome::Accepted { order_id }
    }

    async fn submit_protectives(
        &self,
        intent: &Intent,
        fill_price: Decimal,
        oco_group: &OcoGroupId,
    ) -> ProtectivesOutcome {
        let stop_order_id = self.order_id();
        let target_order_id = self.order_id();
        info!(
            intent = %intent.id,
            %fill_price,
            stop = %intent.stop_price,
            target = %intent.target_price,
            %oco_group,
            "dry-run protectives"
        );
        ProtectivesOutcome::Accepted {
            stop_order_id,
            target_order_id,
        }
    }

    async fn modify_stop(&self, intent_id: &IntentId, new_stop_price: Decimal) -> SubmitOutcome {
        info!(intent = %intent_id, %new_stop_price, "dry-run stop modify");
        SubmitOutcome::Accepted {
            order_id: self.order_id(),
        }
    }

    async fn flatten(&self, intent_id: &IntentId) -> SubmitOutcome {
        info!(intent = %intent_id, "dry-run flatten");
        SubmitOutcome::Accepted {
            order_id: self.order_id(),
        }
    }

    async fn cancel_intent_orders(&self, intent_id: &IntentId) -> usize {
        info!(intent = %intent_id, "dry-run cancel intent orders");
        0
    }

    async fn cancel_robot_orders(&self) -> usize {
        info!("dry-run cancel all robot orders");
        0
    }

    async fn snapshot_account(&self) -> Result<AccountSnapshot, ExecutionError> {
        Ok(AccountSnapshot::default())
    }
}
