use crate::{
    client::{AccountSnapshot, ExecutionAdapter, ProtectivesOutcome, SubmitOutcome},
    error::ExecutionError,
    intent::{Intent, IntentId},
    order::{OcoGroupId, OrderId},
};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use smol_str::format_smolstr;
use std::{collections::VecDeque, sync::Arc};

/// A call observed by the [`MockExecutionAdapter`], in arrival order.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum AdapterCall {
    SubmitEntry(IntentId),
    SubmitProtectives(IntentId, Decimal, OcoGroupId),
    ModifyStop(IntentId, Decimal),
    Flatten(IntentId),
    CancelIntentOrders(IntentId),
    CancelRobotOrders,
    SnapshotAccount,
}

#[derive(Debug, Default)]
struct Inner {
    calls: Vec<AdapterCall>,
    entry_outcomes: VecDeque<SubmitOutcome>,
    protectives_outcomes: VecDeque<ProtectivesOutcome>,
    modify_outcomes: VecDeque<SubmitOutcome>,
    flatten_outcomes: VecDeque<SubmitOutcome>,
    snapshot: Option<Result<AccountSnapshot, ExecutionError>>,
    cancelled_per_intent: usize,
    next_order_id: u64,
}

impl Inner {
    fn generated_order_id(&mut self) -> OrderId {
        self.next_order_id += 1;
        OrderId::new(format_smolstr!("SIM-{}", self.next_order_id))
    }
}

/// Scripted in-memory broker for engine and recovery tests.
///
/// Unscripted submissions are accepted with generated `SIM-{n}` order ids; scripted
/// outcomes are consumed front-to-back per method.
#[derive(Debug, Clone, Default)]
pub struct MockExecutionAdapter {
    inner: Arc<Mutex<Inner>>,
}

impl MockExecutionAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<AdapterCall> {
        self.inner.lock().calls.clone()
    }

    pub fn script_entry(&self, outcome: SubmitOutcome) {
        self.inner.lock().entry_outcomes.push_back(outcome);
    }

    pub fn script_protectives(&self, outcome: ProtectivesOutcome) {
        self.inner.lock().protectives_outcomes.push_back(outcome);
    }

    pub fn script_modify_stop(&self, outcome: SubmitOutcome) {
        self.inner.lock().modify_outcomes.push_back(outcome);
    }

    pub fn script_flatten(&self, outcome: SubmitOutcome) {
        self.inner.lock().flatten_outcomes.push_back(outcome);
    }

    pub fn script_snapshot(&self, snapshot: Result<AccountSnapshot, ExecutionError>) {
        self.inner.lock().snapshot = Some(snapshot);
    }

    pub fn set_cancelled_per_intent(&self, count: usize) {
        self.inner.lock().cancelled_per_intent = count;
    }
}

impl ExecutionAdapter for MockExecutionAdapter {
    async fn submit_entry(&self, intent: &Intent) -> SubmitOutcome {
        let mut inner = self.inner.lock();
        inner.calls.push(AdapterCall::SubmitEntry(intent.id.clone()));
        match inner.entry_outcomes.pop_front() {
            Some(outcome) => outcome,
            None => {
                let order_id = inner.generated_order_id();
                SubmitOutcome::Accepted { order_id }
            }
        }
    }

    async fn submit_protectives(
        &self,
        intent: &Intent,
        fill_price: Decimal,
        oco_group: &OcoGroupId,
    ) -> ProtectivesOutcome {
        let mut inner = self.inner.lock();
        inner.calls.push(AdapterCall::SubmitProtectives(
            intent.id.clone(),
            fill_price,
            oco_group.clone(),
        ));
        match inner.protectives_outcomes.pop_front() {
            Some(outcome) => outcome,
            None => {
                let stop_order_id = inner.generated_order_id();
                let target_order_id = inner.generated_order_id();
                ProtectivesOutcome::Accepted {
                    stop_order_id,
                    target_order_id,
                }
            }
        }
    }

    async fn modify_stop(&self, intent_id: &IntentId, new_stop_price: Decimal) -> SubmitOutcome {
        let mut inner = self.inner.lock();
        inner
            .calls
            .push(AdapterCall::ModifyStop(intent_id.clone(), new_stop_price));
        match inner.modify_outcomes.pop_front() {
            Some(outcome) => outcome,
            None => {
                let order_id = inner.generated_order_id();
                SubmitOutcome::Accepted { order_id }
            }
        }
    }

    async fn flatten(&self, intent_id: &IntentId) -> SubmitOutcome {
        let mut inner = self.inner.lock();
        inner.calls.push(AdapterCall::Flatten(intent_id.clone()));
        match inner.flatten_outcomes.pop_front() {
            Some(outcome) => outcome,
            None => {
                let order_id = inner.generated_order_id();
                SubmitOutcome::Accepted { order_id }
            }
        }
    }

    async fn cancel_intent_orders(&self, intent_id: &IntentId) -> usize {
        let mut inner = self.inner.lock();
        inner
            .calls
            .push(AdapterCall::CancelIntentOrders(intent_id.clone()));
        inner.cancelled_per_intent
    }

    async fn cancel_robot_orders(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.calls.push(AdapterCall::CancelRobotOrders);
        inner.cancelled_per_intent
    }

    async fn snapshot_account(&self) -> Result<AccountSnapshot, ExecutionError> {
        let mut inner = self.inner.lock();
        inner.calls.push(AdapterCall::SnapshotAccount);
        inner
            .snapshot
            .clone()
            .unwrap_or_else(|| Ok(AccountSnapshot::default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use qtsw2_instrument::{Direction, InstrumentName, StreamId};
    use rust_decimal_macros::dec;

    fn intent() -> Intent {
        let stream = StreamId::new("ES1");
        let trading_date = NaiveDate::from_ymd_opt(2025, 3, 7).unwrap();
        Intent::new(
            IntentId::new(trading_date, &stream),
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
        )
    }

    #[tokio::test]
    async fn test_unscripted_submissions_accept_with_generated_ids() {
        let adapter = MockExecutionAdapter::new();
        let intent = intent();

        let SubmitOutcome::Accepted { order_id } = adapter.submit_entry(&intent).await else {
            panic!("expected acceptance");
        };
        assert_eq!(order_id, OrderId::from("SIM-1"));

        let ProtectivesOutcome::Accepted {
            stop_order_id,
            target_order_id,
        } = adapter
            .submit_protectives(&intent, dec!(100.80), &intent.oco_group)
            .await
        else {
            panic!("expected acceptance");
        };
        assert_eq!(stop_order_id, OrderId::from("SIM-2"));
        assert_eq!(target_order_id, OrderId::from("SIM-3"));
    }

    #[tokio::test]
    async fn test_scripted_outcomes_consumed_in_order() {
        let adapter = MockExecutionAdapter::new();
        adapter.script_entry(SubmitOutcome::Failed {
            reason: "socket closed".into(),
        });
        adapter.script_entry(SubmitOutcome::Rejected {
            reason: "insufficient margin".into(),
        });

        let intent = intent();
        assert!(adapter.submit_entry(&intent).await.is_retryable());
        assert!(matches!(
            adapter.submit_entry(&intent).await,
            SubmitOutcome::Rejected { .. }
        ));

        assert_eq!(
            adapter.calls(),
            vec![
                AdapterCall::SubmitEntry(intent.id.clone()),
                AdapterCall::SubmitEntry(intent.id.clone()),
            ]
        );
    }
}
