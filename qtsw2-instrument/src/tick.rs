use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fixed-point tick size of an instrument.
///
/// All engine price levels are multiples of the instrument tick. Construction rejects
/// zero and negative sizes so downstream arithmetic never divides by zero.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
pub struct TickSize(Decimal);

#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum TickError {
    #[error("TickSize must be positive, got: {0}")]
    NonPositive(Decimal),
}

impl TickSize {
    pub fn new(size: Decimal) -> Result<Self, TickError> {
        if size <= Decimal::ZERO {
            return Err(TickError::NonPositive(size));
        }
        Ok(Self(size))
    }

    pub fn value(&self) -> Decimal {
        self.0
    }

    /// Round a price to the nearest tick multiple using banker's rounding.
    ///
    /// Arithmetic stays in fixed-point decimal throughout: the price is expressed in
    /// whole ticks, rounded half-to-even, then scaled back.
    pub fn round(&self, price: Decimal) -> Decimal {
        let ticks = (price / self.0)
            .round_dp_with_strategy(0, RoundingStrategy::MidpointNearestEven);
        (ticks * self.0).normalize()
    }

    /// One tick above `price`, tick-aligned.
    pub fn above(&self, price: Decimal) -> Decimal {
        self.round(price + self.0)
    }

    /// One tick below `price`, tick-aligned.
    pub fn below(&self, price: Decimal) -> Decimal {
        self.round(price - self.0)
    }
}

impl std::fmt::Display for TickSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
