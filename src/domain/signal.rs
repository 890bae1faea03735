use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{InstrumentKey, Side};
use crate::error::{Result, TrailgateError};

/// Directional entry intent routed through the signal gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntrySignal {
    pub instrument: InstrumentKey,
    pub side: Side,
    pub size: u32,
    pub entry_price: Decimal,
    /// Distance (points) from entry to trigger; also the trailing offset
    pub trigger_offset: Decimal,
    pub stop_loss: Option<Decimal>,
    /// Signal time in epoch milliseconds
    pub signal_ts_ms: Option<i64>,
    /// Correlation tag carried into every log line
    pub tag: String,
}

impl EntrySignal {
    /// Reject malformed entries before any order action.
    pub fn validate(&self) -> Result<()> {
        if self.size == 0 {
            return Err(TrailgateError::Validation("size must be > 0".into()));
        }
        if self.entry_price <= Decimal::ZERO {
            return Err(TrailgateError::Validation("entry price must be > 0".into()));
        }
        if self.trigger_offset <= Decimal::ZERO {
            return Err(TrailgateError::Validation(
                "trigger offset must be > 0".into(),
            ));
        }
        if let Some(stop) = self.stop_loss {
            let wrong_side = match self.side {
                Side::Buy => stop >= self.entry_price,
                Side::Sell => stop <= self.entry_price,
            };
            if stop <= Decimal::ZERO || wrong_side {
                return Err(TrailgateError::Validation(format!(
                    "stop loss {} is on the wrong side of a {} entry at {}",
                    stop, self.side, self.entry_price
                )));
            }
        }
        Ok(())
    }

    /// Favorable trigger level: entry + offset for buys, entry - offset for sells.
    pub fn trigger_price(&self) -> Decimal {
        match self.side {
            Side::Buy => self.entry_price + self.trigger_offset,
            Side::Sell => self.entry_price - self.trigger_offset,
        }
    }
}

/// Flatten intent for one instrument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseSignal {
    pub instrument: InstrumentKey,
    pub signal_ts_ms: Option<i64>,
    pub tag: String,
}

/// Build a correlation tag like `NQ1!_buy_20250101T153000`.
pub fn make_tag(ticker: &str, label: &str) -> String {
    format!("{}_{}_{}", ticker, label, Utc::now().format("%Y%m%dT%H%M%S"))
}
