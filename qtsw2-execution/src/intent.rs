use crate::order::OcoGroupId;
use chrono::NaiveDate;
use derive_more::{Constructor, Display};
use qtsw2_instrument::{Direction, InstrumentName, StreamId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use smol_str::{SmolStr, format_smolstr};

/// Stable identifier of an [`Intent`], unique per `(stream, trading_date)`.
///
/// Format: `{trading_date}_{stream}`, eg/ `2025-03-07_ES1`. Contains no `:` so it can
/// embed verbatim in an order tag.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Display)]
pub struct IntentId(pub SmolStr);

impl IntentId {
    pub fn new(trading_date: NaiveDate, stream: &StreamId) -> Self {
        Self(format_smolstr!("{trading_date}_{stream}"))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl From<&str> for IntentId {
    fn from(value: &str) -> Self {
        Self(SmolStr::from(value))
    }
}

/// A decision to trade a breakout on one stream, with every price level fixed at
/// construction. Persisted before any broker submission.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize, Constructor)]
pub struct Intent {
    pub id: IntentId,
    pub stream: StreamId,
    pub trading_date: NaiveDate,
    pub direction: Direction,
    /// The tick-rounded breakout trigger the entry is priced at, not the fill price.
    pub breakout_level: Decimal,
    pub entry_price: Decimal,
    pub stop_price: Decimal,
    pub target_price: Decimal,
    pub be_trigger_price: Decimal,
    pub be_stop_price: Decimal,
    pub execution_instrument: InstrumentName,
    /// Broker-side grouping of the protective stop and target, fixed at
    /// construction from the stream's slot time.
    pub oco_group: OcoGroupId,
}
