use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Broker contract identifier (e.g. "CON.F.US.MNQ.Z25").
///
/// Gate locks, holdoff state, quote streams and watcher sets are all keyed by it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstrumentKey(String);

impl InstrumentKey {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstrumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstrumentKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for InstrumentKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// One trade print from the market hub
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tick {
    pub price: Decimal,
    pub timestamp: DateTime<Utc>,
}

impl Tick {
    pub fn new(price: Decimal, timestamp: DateTime<Utc>) -> Self {
        Self { price, timestamp }
    }

    pub fn now(price: Decimal) -> Self {
        Self::new(price, Utc::now())
    }
}

/// Snap a price to the nearest tick. Exact midpoints go to the even tick count.
pub fn round_to_tick(price: Decimal, tick_size: Decimal) -> Decimal {
    if tick_size <= Decimal::ZERO {
        return price;
    }
    let ticks = (price / tick_size).round_dp_with_strategy(0, RoundingStrategy::MidpointNearestEven);
    (ticks * tick_size).normalize()
}

/// Round a tick count half away from zero (7.5 -> 8, 7.25 -> 7).
pub fn round_ticks_half_up(ticks: Decimal) -> Decimal {
    ticks.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_round_to_tick() {
        let tick = dec!(0.25);
        assert_eq!(round_to_tick(dec!(21040.25), tick), dec!(21040.25));
        assert_eq!(round_to_tick(dec!(21000.10), tick), dec!(21000));
        assert_eq!(round_to_tick(dec!(21000.20), tick), dec!(21000.25));
        // 0.125 is an exact midpoint: 84000.5 ticks rounds to the even 84000
        assert_eq!(round_to_tick(dec!(21000.125), tick), dec!(21000));
        assert_eq!(round_to_tick(dec!(21000.375), tick), dec!(21000.50));
    }

    #[test]
    fn test_round_ticks_half_up() {
        assert_eq!(round_ticks_half_up(dec!(7.25)), dec!(7));
        assert_eq!(round_ticks_half_up(dec!(7.5)), dec!(8));
        assert_eq!(round_ticks_half_up(dec!(7.75)), dec!(8));
    }

    #[test]
    fn test_instrument_key_display() {
        let key = InstrumentKey::from("CON.F.US.MNQ.Z25");
        assert_eq!(key.to_string(), "CON.F.US.MNQ.Z25");
        assert_eq!(key.as_str(), "CON.F.US.MNQ.Z25");
    }
}
