use crate::journal::{JournalError, execution::ExecutionJournal};
use chrono::{DateTime, Utc};
use qtsw2_execution::{
    ExecutionMode,
    client::{ExecutionAdapter, ProtectivesOutcome, SubmitOutcome},
    intent::{Intent, IntentId},
    order::{OrderId, OrderRole},
};
use rust_decimal::Decimal;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{error, warn};

/// Transport retry bound for one submission.
const MAX_SUBMIT_ATTEMPTS: u32 = 3;

/// Maximum random backoff between transport retries.
const RETRY_JITTER: Duration = Duration::from_millis(200);

/// Per broker-call timeout; an elapsed call counts as a transport failure.
const CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Why the gate refused an operation, in check order.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum GateDenial {
    #[error("engine is in stand-down")]
    StandDown,

    #[error("engine is fail-closed pending recovery")]
    FailClosed,

    #[error("no broker event observed since last reconnection")]
    BrokerSyncPending,

    #[error("execution mode not permitted")]
    ModeNotPermitted,

    #[error("outside slot window")]
    OutsideSlotWindow,

    #[error("order already journalled for role {0}")]
    DuplicateOrder(OrderRole),

    /// The caller's computed state said execution was allowed but the gate's own
    /// check disagrees. Escalates to a critical notification.
    #[error("invariant violation: {0}")]
    InvariantViolation(&'static str),
}

impl GateDenial {
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, Self::InvariantViolation(_))
    }
}

/// Per-submission context computed by the engine from stream state.
#[derive(Debug, Copy, Clone)]
pub struct GateContext {
    pub now: DateTime<Utc>,
    pub slot_time: DateTime<Utc>,
    pub market_close: DateTime<Utc>,
    /// Stream-computed invariant: range locked, not committed, direction defined.
    pub entry_allowed: bool,
}

/// Final disposition of an entry submission attempt.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum EntryDisposition {
    Accepted { order_id: OrderId },
    Blocked(GateDenial),
    /// Broker protocol rejection; fatal for the intent and its stream.
    Rejected { reason: String },
    /// Transport attempts exhausted. The journal entry stays unconfirmed; fill
    /// correlation drives final resolution.
    TransportFailed { reason: String },
}

/// Outcome of handling an entry fill.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum FillOutcome {
    /// Protective stop and target accepted as an OCO pair.
    ProtectivesPlaced {
        stop_order_id: OrderId,
        target_order_id: OrderId,
    },
    /// Protective placement failed; the position was flattened at market.
    ProtectivesFailedFlattened { reason: String },
    /// A duplicate broker fill event; nothing changed.
    AlreadyHandled,
}

/// The single authorization point for every broker submission.
///
/// Every order passes the ordered checks of the gate; the journal entry (carrying the
/// generated order tags) is persisted before the adapter sees the request.
#[derive(Debug)]
pub struct ExecutionGate<Adapter> {
    adapter: Adapter,
    journal: Arc<ExecutionJournal>,
    mode: ExecutionMode,
    live_armed: bool,
    stand_down: bool,
    fail_closed: bool,
    broker_synced: bool,
}

impl<Adapter> ExecutionGate<Adapter>
where
    Adapter: ExecutionAdapter,
{
    pub fn new(
        adapter: Adapter,
        journal: Arc<ExecutionJournal>,
        mode: ExecutionMode,
        live_armed: bool,
    ) -> Self {
        Self {
            adapter,
            journal,
            mode,
            live_armed,
            stand_down: false,
            fail_closed: false,
            // Never disconnected yet: the sync gate starts open.
            broker_synced: true,
        }
    }

    pub fn set_stand_down(&mut self, stand_down: bool) {
        self.stand_down = stand_down;
    }

    pub fn set_fail_closed(&mut self, fail_closed: bool) {
        self.fail_closed = fail_closed;
    }

    pub fn is_fail_closed(&self) -> bool {
        self.fail_closed
    }

    /// Broker connection dropped: close the sync gate until an event is observed.
    pub fn note_disconnect(&mut self) {
        self.broker_synced = false;
    }

    /// Any order/execution update re-opens the sync gate.
    pub fn note_broker_event(&mut self) {
        self.broker_synced = true;
    }

    /// Ordered authorization checks for an entry submission.
    pub fn authorize_entry(&self, intent: &Intent, ctx: &GateContext) -> Result<(), GateDenial> {
        if self.stand_down {
            return Err(GateDenial::StandDown);
        }
        if self.fail_closed {
            return Err(GateDenial::FailClosed);
        }
        if !self.broker_synced {
            return Err(GateDenial::BrokerSyncPending);
        }
        if !self.mode.is_permitted(self.live_armed) {
            return Err(GateDenial::ModeNotPermitted);
        }
        if ctx.now < ctx.slot_time || ctx.now >= ctx.market_close {
            return Err(GateDenial::OutsideSlotWindow);
        }
        if let Some(entry) = self.journal.get(&intent.id) {
            if entry.has_order(OrderRole::Entry) {
                return Err(GateDenial::DuplicateOrder(OrderRole::Entry));
            }
        }
        if !ctx.entry_allowed {
            return Err(GateDenial::InvariantViolation(
                "stream state disallows entry at submission time",
            ));
        }

        Ok(())
    }

    /// Submit the entry order under the full gate protocol: authorize, persist the
    /// journal entry (tags included) before the broker call, then submit with bounded
    /// transport retries.
    pub async fn submit_entry(
        &self,
        intent: &Intent,
        ctx: &GateContext,
    ) -> Result<EntryDisposition, JournalError> {
        if let Err(denial) = self.authorize_entry(intent, ctx) {
            warn!(intent = %intent.id, %denial, "execution gate blocked entry");
            return Ok(EntryDisposition::Blocked(denial));
        }

        self.journal.ensure_entry(intent, ctx.now)?;

        let mut reason = String::new();
        for attempt in 1..=MAX_SUBMIT_ATTEMPTS {
            match call_with_timeout(self.adapter.submit_entry(intent)).await {
                SubmitOutcome::Accepted { order_id } => {
                    self.journal
                        .record_order(&intent.id, OrderRole::Entry, order_id.clone(), ctx.now)?;
                    return Ok(EntryDisposition::Accepted { order_id });
                }
                SubmitOutcome::Rejected { reason } => {
                    error!(intent = %intent.id, %reason, "entry protocol-rejected");
                    return Ok(EntryDisposition::Rejected { reason });
                }
                SubmitOutcome::Failed { reason: transport } => {
                    warn!(intent = %intent.id, attempt, %transport, "entry transport failure");
                    reason = transport;
                    if attempt < MAX_SUBMIT_ATTEMPTS {
                        jitter_sleep().await;
                    }
                }
            }
        }

        Ok(EntryDisposition::TransportFailed { reason })
    }

    /// First-fill handler: mark the journal, then place the OCO protectives. A
    /// protective failure flattens the position before this returns - the engine
    /// never leaves a naked fill.
    pub async fn handle_entry_fill(
        &self,
        intent: &Intent,
        fill_price: Decimal,
        now: DateTime<Utc>,
    ) -> Result<FillOutcome, JournalError> {
        if !self.journal.mark_entry_filled(&intent.id, fill_price, now)? {
            return Ok(FillOutcome::AlreadyHandled);
        }

        let mut reason = String::new();
        for attempt in 1..=MAX_SUBMIT_ATTEMPTS {
            match call_with_timeout(self.adapter.submit_protectives(
                intent,
                fill_price,
                &intent.oco_group,
            ))
            .await
            {
                ProtectivesOutcome::Accepted {
                    stop_order_id,
                    target_order_id,
                } => {
                    self.journal.record_order(
                        &intent.id,
                        OrderRole::Stop,
                        stop_order_id.clone(),
                        now,
                    )?;
                    self.journal.record_order(
                        &intent.id,
                        OrderRole::Target,
                        target_order_id.clone(),
                        now,
                    )?;
                    return Ok(FillOutcome::ProtectivesPlaced {
                        stop_order_id,
                        target_order_id,
                    });
                }
                ProtectivesOutcome::Rejected { reason: rejection } => {
                    reason = rejection;
                    break;
                }
                ProtectivesOutcome::Failed { reason: transport } => {
                    warn!(intent = %intent.id, attempt, %transport, "protectives transport failure");
                    reason = transport;
                    if attempt < MAX_SUBMIT_ATTEMPTS {
                        jitter_sleep().await;
                    }
                }
            }
        }

        error!(intent = %intent.id, %reason, "protectives failed; flattening position");
        let flatten = call_with_timeout(self.adapter.flatten(&intent.id)).await;
        if !flatten.is_accepted() {
            error!(intent = %intent.id, ?flatten, "flatten after protective failure not accepted");
        }

        Ok(FillOutcome::ProtectivesFailedFlattened { reason })
    }

    /// Slide the stop to break-even. The journal's `be_modified` flag makes this
    /// exactly-once per intent.
    pub async fn modify_to_break_even(
        &self,
        intent: &Intent,
        now: DateTime<Utc>,
    ) -> Result<bool, JournalError> {
        let Some(entry) = self.journal.get(&intent.id) else {
            return Ok(false);
        };
        if !entry.entry_filled || entry.be_modified {
            return Ok(false);
        }

        match call_with_timeout(self.adapter.modify_stop(&intent.id, intent.be_stop_price)).await
        {
            SubmitOutcome::Accepted { .. } => {
                self.journal
                    .mark_be_modified(&intent.id, intent.be_stop_price, now)?;
                Ok(true)
            }
            outcome => {
                warn!(intent = %intent.id, ?outcome, "break-even modify not accepted");
                Ok(false)
            }
        }
    }

    /// Cancel the working robot orders of one intent (end-of-session / stand-down).
    pub async fn cancel_intent_orders(&self, intent_id: &IntentId) -> usize {
        self.adapter.cancel_intent_orders(intent_id).await
    }

    /// Global kill switch: cancel every robot order and flatten the given intents.
    pub async fn kill_switch(&self, intents: &[IntentId]) -> usize {
        let cancelled = self.adapter.cancel_robot_orders().await;
        for intent_id in intents {
            let outcome = call_with_timeout(self.adapter.flatten(intent_id)).await;
            if !outcome.is_accepted() {
                error!(intent = %intent_id, ?outcome, "kill-switch flatten not accepted");
            }
        }
        cancelled
    }
}

/// Bound an adapter call by the per-call timeout; elapsed counts as transport failure.
async fn call_with_timeout<F>(fut: F) -> F::Output
where
    F: Future,
    F::Output: FromTimeout,
{
    match tokio::time::timeout(CALL_TIMEOUT, fut).await {
        Ok(output) => output,
        Err(_) => FromTimeout::from_timeout(),
    }
}

/// Conversion of an elapsed per-call timeout into the outcome's transport failure.
pub trait FromTimeout {
    fn from_timeout() -> Self;
}

impl FromTimeout for SubmitOutcome {
    fn from_timeout() -> Self {
        Self::Failed {
            reason: "broker call timeout".into(),
        }
    }
}

impl FromTimeout for ProtectivesOutcome {
    fn from_timeout() -> Self {
        Self::Failed {
            reason: "broker call timeout".into(),
        }
    }
}

async fn jitter_sleep() {
    use rand::Rng;
    let millis = rand::rng().random_range(0..RETRY_JITTER.as_millis() as u64);
    tokio::time::sleep(Duration::from_millis(millis)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use qtsw2_execution::client::mock::{AdapterCall, MockExecutionAdapter};
    use qtsw2_execution::order::OcoGroupId;
    use qtsw2_instrument::{Direction, InstrumentName, StreamId};
    use rust_decimal_macros::dec;

    fn intent() -> Intent {
        let stream = StreamId::new("ES1");
        let trading_date = chrono::NaiveDate::from_ymd_opt(2025, 3, 7).unwrap();
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

    fn ctx(entry_allowed: bool) -> GateContext {
        GateContext {
            now: Utc.with_ymd_and_hms(2025, 3, 7, 15, 31, 0).unwrap(),
            slot_time: Utc.with_ymd_and_hms(2025, 3, 7, 15, 30, 0).unwrap(),
            market_close: Utc.with_ymd_and_hms(2025, 3, 7, 22, 0, 0).unwrap(),
            entry_allowed,
        }
    }

    fn gate(
        adapter: MockExecutionAdapter,
        dir: &tempfile::TempDir,
    ) -> ExecutionGate<MockExecutionAdapter> {
        let journal = Arc::new(ExecutionJournal::open(dir.path()).unwrap());
        ExecutionGate::new(adapter, journal, ExecutionMode::Sim, false)
    }

    #[tokio::test]
    async fn test_check_order_and_denials() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = MockExecutionAdapter::new();
        let mut gate = gate(adapter, &dir);
        let intent = intent();

        gate.set_stand_down(true);
        assert_eq!(
            gate.authorize_entry(&intent, &ctx(true)),
            Err(GateDenial::StandDown)
        );
        gate.set_stand_down(false);

        gate.set_fail_closed(true);
        assert_eq!(
            gate.authorize_entry(&intent, &ctx(true)),
            Err(GateDenial::FailClosed)
        );
        gate.set_fail_closed(false);

        gate.note_disconnect();
        assert_eq!(
            gate.authorize_entry(&intent, &ctx(true)),
            Err(GateDenial::BrokerSyncPending)
        );
        gate.note_broker_event();

        let mut early = ctx(true);
        early.now = early.slot_time - chrono::TimeDelta::seconds(1);
        assert_eq!(
            gate.authorize_entry(&intent, &early),
            Err(GateDenial::OutsideSlotWindow)
        );

        let mut late = ctx(true);
        late.now = late.market_close;
        assert_eq!(
            gate.authorize_entry(&intent, &late),
            Err(GateDenial::OutsideSlotWindow)
        );

        assert_eq!(
            gate.authorize_entry(&intent, &ctx(false)),
            Err(GateDenial::InvariantViolation(
                "stream state disallows entry at submission time"
            ))
        );

        assert_eq!(gate.authorize_entry(&intent, &ctx(true)), Ok(()));
    }

    #[tokio::test]
    async fn test_live_mode_requires_arming() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Arc::new(ExecutionJournal::open(dir.path()).unwrap());
        let gate = ExecutionGate::new(
            MockExecutionAdapter::new(),
            journal,
            ExecutionMode::Live,
            false,
        );

        assert_eq!(
            gate.authorize_entry(&intent(), &ctx(true)),
            Err(GateDenial::ModeNotPermitted)
        );
    }

    #[tokio::test]
    async fn test_journal_written_before_adapter_call() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = MockExecutionAdapter::new();
        let gate = gate(adapter.clone(), &dir);
        let intent = intent();

        let disposition = gate.submit_entry(&intent, &ctx(true)).await.unwrap();
        assert!(matches!(disposition, EntryDisposition::Accepted { .. }));

        // The journal file carries the intent before the adapter returned.
        assert!(
            dir.path()
                .join("2025-03-07_ES1_2025-03-07_ES1.json")
                .exists()
        );
        assert_eq!(adapter.calls(), vec![AdapterCall::SubmitEntry(intent.id)]);
    }

    #[tokio::test]
    async fn test_resubmission_blocked_by_idempotency_gate() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = MockExecutionAdapter::new();
        let gate = gate(adapter.clone(), &dir);
        let intent = intent();

        gate.submit_entry(&intent, &ctx(true)).await.unwrap();
        let second = gate.submit_entry(&intent, &ctx(true)).await.unwrap();

        assert_eq!(
            second,
            EntryDisposition::Blocked(GateDenial::DuplicateOrder(OrderRole::Entry))
        );
        // Only one broker call ever happened.
        assert_eq!(adapter.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_transport_failures_retry_then_surface() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = MockExecutionAdapter::new();
        for _ in 0..3 {
            adapter.script_entry(SubmitOutcome::Failed {
                reason: "socket closed".into(),
            });
        }
        let gate = gate(adapter.clone(), &dir);

        let disposition = gate.submit_entry(&intent(), &ctx(true)).await.unwrap();
        assert_eq!(
            disposition,
            EntryDisposition::TransportFailed {
                reason: "socket closed".into()
            }
        );
        assert_eq!(adapter.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_protocol_rejection_is_fatal_no_retry() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = MockExecutionAdapter::new();
        adapter.script_entry(SubmitOutcome::Rejected {
            reason: "insufficient margin".into(),
        });
        let gate = gate(adapter.clone(), &dir);

        let disposition = gate.submit_entry(&intent(), &ctx(true)).await.unwrap();
        assert_eq!(
            disposition,
            EntryDisposition::Rejected {
                reason: "insufficient margin".into()
            }
        );
        assert_eq!(adapter.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_fill_places_protectives_once() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = MockExecutionAdapter::new();
        let gate = gate(adapter.clone(), &dir);
        let intent = intent();
        gate.submit_entry(&intent, &ctx(true)).await.unwrap();

        let now = ctx(true).now;
        let first = gate.handle_entry_fill(&intent, dec!(100.80), now).await.unwrap();
        assert!(matches!(first, FillOutcome::ProtectivesPlaced { .. }));

        // Duplicate fill event: no further submission.
        let second = gate.handle_entry_fill(&intent, dec!(100.80), now).await.unwrap();
        assert_eq!(second, FillOutcome::AlreadyHandled);

        let protective_calls = adapter
            .calls()
            .iter()
            .filter(|call| matches!(call, AdapterCall::SubmitProtectives(..)))
            .count();
        assert_eq!(protective_calls, 1);
    }

    #[tokio::test]
    async fn test_protectives_failure_flattens() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = MockExecutionAdapter::new();
        for _ in 0..3 {
            adapter.script_protectives(ProtectivesOutcome::Failed {
                reason: "route down".into(),
            });
        }
        let gate = gate(adapter.clone(), &dir);
        let intent = intent();
        gate.submit_entry(&intent, &ctx(true)).await.unwrap();

        let outcome = gate
            .handle_entry_fill(&intent, dec!(100.80), ctx(true).now)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            FillOutcome::ProtectivesFailedFlattened {
                reason: "route down".into()
            }
        );

        assert!(
            adapter
                .calls()
                .iter()
                .any(|call| matches!(call, AdapterCall::Flatten(_)))
        );
    }

    #[tokio::test]
    async fn test_break_even_modify_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = MockExecutionAdapter::new();
        let gate = gate(adapter.clone(), &dir);
        let intent = intent();
        gate.submit_entry(&intent, &ctx(true)).await.unwrap();
        gate.handle_entry_fill(&intent, dec!(100.80), ctx(true).now)
            .await
            .unwrap();

        assert!(
            gate.modify_to_break_even(&intent, ctx(true).now)
                .await
                .unwrap()
        );
        assert!(
            !gate
                .modify_to_break_even(&intent, ctx(true).now)
                .await
                .unwrap()
        );

        let modify_calls = adapter
            .calls()
            .iter()
            .filter(|call| matches!(call, AdapterCall::ModifyStop(_, _)))
            .count();
        assert_eq!(modify_calls, 1);
    }
}
