use rust_decimal::Decimal;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

use crate::domain::{OpenOrder, OrderRequest, PlacedOrder};
use crate::error::{Result, TrailgateError};
use crate::exchange::BrokerClient;

/// Resolves submissions whose outcome is unknown.
///
/// When the broker call times out the order may still have landed; instead of
/// resubmitting (and doubling the position) we look for a working order with
/// the same instrument, kind, side, size and a price within half a tick.
pub struct ReconciliationResolver {
    broker: Arc<dyn BrokerClient>,
    tick_size: Decimal,
}

impl ReconciliationResolver {
    pub fn new(broker: Arc<dyn BrokerClient>, tick_size: Decimal) -> Self {
        Self { broker, tick_size }
    }

    pub async fn submit(&self, request: &OrderRequest) -> Result<PlacedOrder> {
        match self.broker.place_order(request).await {
            Ok(placed) => Ok(placed),
            Err(e) if e.is_ambiguous_timeout() => {
                warn!(
                    "{} {} x{} on {} timed out; reconciling with broker",
                    request.kind, request.side, request.size, request.instrument
                );
                match self.find_match(request).await {
                    Some(order) => {
                        info!(
                            "Reconcile: matched live {} order {} after timeout",
                            request.kind, order.order_id
                        );
                        Ok(PlacedOrder {
                            raw: json!({ "orderId": order.order_id.as_str(), "reconciled": true }),
                            order_id: order.order_id,
                        })
                    }
                    None => Err(TrailgateError::SubmissionUnconfirmed(format!(
                        "{} {} x{} on {} @ {:?}: {}",
                        request.kind,
                        request.side,
                        request.size,
                        request.instrument,
                        request.reference_price(),
                        e
                    ))),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// First open order matching `request`; search failures count as no match.
    pub async fn find_match(&self, request: &OrderRequest) -> Option<OpenOrder> {
        let orders = match self.broker.search_open_orders().await {
            Ok(orders) => orders,
            Err(e) => {
                warn!("Reconcile: open order search failed: {}", e);
                return None;
            }
        };
        let tolerance = self.tick_size / Decimal::TWO;
        orders
            .into_iter()
            .find(|order| order_matches(order, request, tolerance))
    }
}

fn order_matches(order: &OpenOrder, request: &OrderRequest, tolerance: Decimal) -> bool {
    if order.instrument != request.instrument
        || order.kind != Some(request.kind)
        || order.side != Some(request.side)
        || order.size != request.size
    {
        return false;
    }
    match (request.reference_price(), order.reference_price()) {
        (Some(wanted), Some(live)) => (wanted - live).abs() <= tolerance,
        (None, _) => true,
        (Some(_), None) => false,
    }
}
