use crate::journal::{JournalError, execution::ExecutionJournal};
use chrono::{DateTime, Utc};
use qtsw2_execution::{
    client::{ExecutionAdapter, ProtectivesOutcome},
    error::ExecutionError,
    intent::IntentId,
    order::{OrderRole, OrderTag},
};
use qtsw2_instrument::InstrumentName;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("snapshot: {0}")]
    Snapshot(#[from] ExecutionError),

    #[error("journal: {0}")]
    Journal(#[from] JournalError),
}

/// What reconciliation found and did. The engine applies the stream-level
/// consequences (stand-down, sync-latch reset, event emission).
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct RecoveryReport {
    /// Robot-tagged working orders with no journalled intent; cancelled.
    pub orphan_intents_cancelled: Vec<IntentId>,
    /// Positions matched to a journalled intent.
    pub matched_positions: Vec<IntentId>,
    /// Positions no journalled intent accounts for; their streams must stand down.
    pub unmatched_positions: Vec<InstrumentName>,
    /// Matched positions whose protective orders were missing and resubmitted.
    pub protectives_resubmitted: Vec<IntentId>,
}

/// Post-disconnect reconciliation against the broker account snapshot.
///
/// Working orders are matched to intents via their `QTSW2:` tag; positions are matched
/// through the execution journal. Orphan robot orders are cancelled; unmatched
/// positions are reported so the engine can stand their streams down while leaving any
/// protective orders in place.
pub async fn reconcile<Adapter>(
    adapter: &Adapter,
    journal: &ExecutionJournal,
    now: DateTime<Utc>,
) -> Result<RecoveryReport, RecoveryError>
where
    Adapter: ExecutionAdapter,
{
    let snapshot = adapter.snapshot_account().await?;
    let mut report = RecoveryReport::default();

    // 1. Working orders: anything robot-tagged without a journal entry is an orphan.
    for order in &snapshot.working_orders {
        let Some(raw) = order.tag.as_deref() else {
            continue;
        };
        let intent_id = match OrderTag::decode(raw) {
            Ok(tag) => tag.intent,
            // Foreign orders are none of our business.
            Err(_) => continue,
        };

        if journal.get(&intent_id).is_none()
            && !report.orphan_intents_cancelled.contains(&intent_id)
        {
            let cancelled = adapter.cancel_intent_orders(&intent_id).await;
            warn!(intent = %intent_id, cancelled, "cancelled orphan robot orders");
            report.orphan_intents_cancelled.push(intent_id);
        }
    }

    // 2. Positions: match each to a filled journalled intent on the same instrument.
    let entries = journal.entries();
    for position in &snapshot.positions {
        let matched = entries.iter().find(|entry| {
            entry.entry_filled && entry.intent.execution_instrument == position.instrument
        });

        let Some(entry) = matched else {
            warn!(
                instrument = %position.instrument,
                quantity = %position.quantity,
                "position matches no journalled intent; stream must stand down"
            );
            report.unmatched_positions.push(position.instrument.clone());
            continue;
        };

        let intent = &entry.intent;
        report.matched_positions.push(intent.id.clone());

        // 3. Matched position missing protectives: resubmit the OCO pair.
        let has_working_stop = snapshot.working_orders.iter().any(|order| {
            order
                .tag
                .as_deref()
                .and_then(|raw| OrderTag::decode(raw).ok())
                .is_some_and(|tag| tag.intent == intent.id && tag.role == OrderRole::Stop)
        });

        if !has_working_stop {
            let fill_price = entry.fill_price.unwrap_or(intent.entry_price);
            match adapter
                .submit_protectives(intent, fill_price, &intent.oco_group)
                .await
            {
                ProtectivesOutcome::Accepted {
                    stop_order_id,
                    target_order_id,
                } => {
                    journal.record_order(&intent.id, OrderRole::Stop, stop_order_id, now)?;
                    journal.record_order(&intent.id, OrderRole::Target, target_order_id, now)?;
                    info!(intent = %intent.id, "resubmitted missing protectives");
                    report.protectives_resubmitted.push(intent.id.clone());
                }
                outcome => {
                    warn!(intent = %intent.id, ?outcome, "protective resubmission not accepted");
                }
            }
        }
    }

    Ok(report)
}
