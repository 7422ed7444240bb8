use chrono::{DateTime, Utc};
use derive_more::Constructor;
use qtsw2_instrument::InstrumentName;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Upstream origin of a [`Bar`].
///
/// When two bars collide on `(instrument, open_time)` the higher-precedence source wins:
/// `Live > BarsRequest > Csv`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
pub enum BarSource {
    Csv,
    BarsRequest,
    Live,
}

impl BarSource {
    /// True for bulk-loaded sources whose bars are complete by construction, exempting
    /// them from the live partial-bar age check.
    pub fn is_historical(&self) -> bool {
        matches!(self, Self::BarsRequest | Self::Csv)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Live => "LIVE",
            Self::BarsRequest => "BARSREQUEST",
            Self::Csv => "CSV",
        }
    }
}

impl std::fmt::Display for BarSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalised OHLCV bar keyed by `(instrument, open_time)`.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize, Constructor)]
pub struct Bar {
    pub instrument: InstrumentName,
    pub open_time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Option<Decimal>,
    pub source: BarSource,
}

impl Bar {
    /// OHLC sanity: `low <= open,close <= high` and `low <= high`.
    pub fn is_sane(&self) -> bool {
        self.low <= self.high
            && self.low <= self.open
            && self.open <= self.high
            && self.low <= self.close
            && self.close <= self.high
    }

    /// Field-wise OHLC differences against `other`, used to record what a
    /// higher-precedence source overwrote.
    pub fn diff_ohlc(&self, other: &Bar) -> Vec<OhlcMismatch> {
        let fields = [
            ("open", self.open, other.open),
            ("high", self.high, other.high),
            ("low", self.low, other.low),
            ("close", self.close, other.close),
        ];

        fields
            .into_iter()
            .filter(|(_, stored, incoming)| stored != incoming)
            .map(|(field, stored, incoming)| OhlcMismatch {
                field,
                stored,
                incoming,
            })
            .collect()
    }
}

/// A single OHLC field disagreement between a stored bar and an incoming bar with
/// the same key.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct OhlcMismatch {
    pub field: &'static str,
    pub stored: Decimal,
    pub incoming: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn bar(open: Decimal, high: Decimal, low: Decimal, close: Decimal) -> Bar {
        Bar::new(
            InstrumentName::new("ES"),
            Utc.with_ymd_and_hms(2025, 3, 7, 14, 30, 0).unwrap(),
            open,
            high,
            low,
            close,
            Some(dec!(1200)),
            BarSource::Live,
        )
    }

    #[test]
    fn test_source_precedence_ordering() {
        assert!(BarSource::Live > BarSource::BarsRequest);
        assert!(BarSource::BarsRequest > BarSource::Csv);
    }

    #[test]
    fn test_bar_sanity() {
        assert!(bar(dec!(100), dec!(101), dec!(99), dec!(100.5)).is_sane());
        assert!(!bar(dec!(100), dec!(99), dec!(101), dec!(100)).is_sane());
        assert!(!bar(dec!(102), dec!(101), dec!(99), dec!(100)).is_sane());
        assert!(!bar(dec!(100), dec!(101), dec!(99), dec!(98)).is_sane());
    }

    #[test]
    fn test_diff_ohlc() {
        let stored = bar(dec!(100), dec!(101), dec!(99), dec!(100.5));
        let incoming = bar(dec!(100), dec!(101.25), dec!(99), dec!(100.75));

        let diffs = stored.diff_ohlc(&incoming);
        assert_eq!(diffs.len(), 2);
        assert_eq!(diffs[0].field, "high");
        assert_eq!(diffs[0].stored, dec!(101));
        assert_eq!(diffs[0].incoming, dec!(101.25));
        assert_eq!(diffs[1].field, "close");
    }
}
