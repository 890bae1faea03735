use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use super::InstrumentKey;

/// Order side (wire values 0 = buy, 1 = sell)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    pub fn wire(self) -> i64 {
        match self {
            Side::Buy => 0,
            Side::Sell => 1,
        }
    }

    pub fn from_wire(raw: i64) -> Option<Self> {
        match raw {
            0 => Some(Side::Buy),
            1 => Some(Side::Sell),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Side {
    type Err = &'static str;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "buy" | "long" => Ok(Side::Buy),
            "sell" | "short" => Ok(Side::Sell),
            _ => Err("invalid side; expected buy|sell"),
        }
    }
}

/// Broker order type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderKind {
    Limit,
    Market,
    Stop,
    TrailingStop,
}

impl OrderKind {
    pub fn wire(self) -> i64 {
        match self {
            OrderKind::Limit => 1,
            OrderKind::Market => 2,
            OrderKind::Stop => 4,
            OrderKind::TrailingStop => 5,
        }
    }

    pub fn from_wire(raw: i64) -> Option<Self> {
        match raw {
            1 => Some(OrderKind::Limit),
            2 => Some(OrderKind::Market),
            4 => Some(OrderKind::Stop),
            5 => Some(OrderKind::TrailingStop),
            _ => None,
        }
    }
}

impl fmt::Display for OrderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OrderKind::Limit => "LIMIT",
            OrderKind::Market => "MARKET",
            OrderKind::Stop => "STOP",
            OrderKind::TrailingStop => "TRAILING_STOP",
        };
        f.write_str(s)
    }
}

/// Broker order id
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(String);

impl OrderId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<i64> for OrderId {
    fn from(value: i64) -> Self {
        Self(value.to_string())
    }
}

impl From<&str> for OrderId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Order request (what we want the broker to do)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub instrument: InstrumentKey,
    pub side: Side,
    pub size: u32,
    pub kind: OrderKind,
    pub limit_price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub trail_price: Option<Decimal>,
}

impl OrderRequest {
    fn base(instrument: InstrumentKey, side: Side, size: u32, kind: OrderKind) -> Self {
        Self {
            instrument,
            side,
            size,
            kind,
            limit_price: None,
            stop_price: None,
            trail_price: None,
        }
    }

    pub fn limit(instrument: InstrumentKey, side: Side, size: u32, price: Decimal) -> Self {
        Self {
            limit_price: Some(price),
            ..Self::base(instrument, side, size, OrderKind::Limit)
        }
    }

    pub fn market(instrument: InstrumentKey, side: Side, size: u32) -> Self {
        Self::base(instrument, side, size, OrderKind::Market)
    }

    pub fn stop(instrument: InstrumentKey, side: Side, size: u32, stop_price: Decimal) -> Self {
        Self {
            stop_price: Some(stop_price),
            ..Self::base(instrument, side, size, OrderKind::Stop)
        }
    }

    pub fn trailing_stop(
        instrument: InstrumentKey,
        side: Side,
        size: u32,
        trail_price: Decimal,
    ) -> Self {
        Self {
            trail_price: Some(trail_price),
            ..Self::base(instrument, side, size, OrderKind::TrailingStop)
        }
    }

    /// Price the broker would echo back for this request, if any.
    pub fn reference_price(&self) -> Option<Decimal> {
        match self.kind {
            OrderKind::Limit => self.limit_price,
            OrderKind::Stop => self.stop_price,
            OrderKind::TrailingStop => self.trail_price,
            OrderKind::Market => None,
        }
    }
}

/// Order accepted by the broker
#[derive(Debug, Clone, PartialEq)]
pub struct PlacedOrder {
    pub order_id: OrderId,
    /// Broker payload, kept for logging
    pub raw: Value,
}

impl PlacedOrder {
    pub fn new(order_id: OrderId) -> Self {
        Self {
            order_id,
            raw: Value::Null,
        }
    }
}

/// Working order as reported by the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenOrder {
    pub order_id: OrderId,
    pub instrument: InstrumentKey,
    pub kind: Option<OrderKind>,
    pub side: Option<Side>,
    pub size: u32,
    pub limit_price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
}

impl OpenOrder {
    /// Price used when matching against a request of the same kind.
    pub fn reference_price(&self) -> Option<Decimal> {
        match self.kind {
            Some(OrderKind::Stop) | Some(OrderKind::TrailingStop) => {
                self.stop_price.or(self.limit_price)
            }
            _ => self.limit_price,
        }
    }
}

/// Net position per contract (positive long, negative short)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionSnapshot {
    pub instrument: InstrumentKey,
    pub net_quantity: i64,
}
