use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::domain::{
    InstrumentKey, OpenOrder, OrderId, OrderKind, OrderRequest, PlacedOrder, PositionSnapshot,
    Side,
};
use crate::error::Result;

/// Broker order/position capability used by the execution core.
///
/// Every call is independently retryable and may fail transiently; callers
/// decide whether a failure means "unknown outcome" or "give up".
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn place_order(&self, request: &OrderRequest) -> Result<PlacedOrder>;

    async fn cancel_order(&self, order_id: &OrderId) -> Result<()>;

    async fn search_open_orders(&self) -> Result<Vec<OpenOrder>>;

    async fn search_open_positions(&self) -> Result<Vec<PositionSnapshot>>;

    /// Flatten the instrument. "No position" is success.
    async fn close_position(&self, instrument: &InstrumentKey) -> Result<()>;

    async fn place_limit_order(
        &self,
        instrument: &InstrumentKey,
        side: Side,
        size: u32,
        price: Decimal,
    ) -> Result<PlacedOrder> {
        self.place_order(&OrderRequest::limit(instrument.clone(), side, size, price))
            .await
    }

    async fn place_market_order(
        &self,
        instrument: &InstrumentKey,
        side: Side,
        size: u32,
    ) -> Result<PlacedOrder> {
        self.place_order(&OrderRequest::market(instrument.clone(), side, size))
            .await
    }

    async fn place_stop_order(
        &self,
        instrument: &InstrumentKey,
        side: Side,
        size: u32,
        stop_price: Decimal,
    ) -> Result<PlacedOrder> {
        self.place_order(&OrderRequest::stop(instrument.clone(), side, size, stop_price))
            .await
    }

    async fn place_trailing_stop_order(
        &self,
        instrument: &InstrumentKey,
        side: Side,
        size: u32,
        trail_price: Decimal,
    ) -> Result<PlacedOrder> {
        self.place_order(&OrderRequest::trailing_stop(
            instrument.clone(),
            side,
            size,
            trail_price,
        ))
        .await
    }

    /// Net quantity for one instrument; 0 when no position is reported.
    async fn net_position(&self, instrument: &InstrumentKey) -> Result<i64> {
        let positions = self.search_open_positions().await?;
        Ok(positions
            .iter()
            .find(|p| &p.instrument == instrument)
            .map(|p| p.net_quantity)
            .unwrap_or(0))
    }

    /// Open orders for one instrument, optionally filtered by kind.
    async fn open_orders_for(
        &self,
        instrument: &InstrumentKey,
        kind: Option<OrderKind>,
    ) -> Result<Vec<OpenOrder>> {
        let orders = self.search_open_orders().await?;
        Ok(orders
            .into_iter()
            .filter(|o| &o.instrument == instrument)
            .filter(|o| kind.map_or(true, |k| o.kind == Some(k)))
            .collect())
    }
}

/// Symbol → contract id lookup
#[async_trait]
pub trait ContractLookup: Send + Sync {
    async fn search_contract(&self, symbol: &str) -> Result<InstrumentKey>;
}
