use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::CloseConfig;
use crate::domain::{InstrumentKey, OrderId, OrderKind};
use crate::error::Result;
use crate::exchange::BrokerClient;

#[derive(Debug, Clone)]
pub struct CloseTimings {
    pub flat_timeout: Duration,
    pub flat_poll: Duration,
    pub quarantine: Duration,
    pub quarantine_poll: Duration,
}

impl CloseTimings {
    pub fn from_config(cfg: &CloseConfig) -> Self {
        Self {
            flat_timeout: Duration::from_millis(cfg.flat_timeout_ms),
            flat_poll: Duration::from_millis(cfg.flat_poll_ms),
            quarantine: Duration::from_millis(cfg.quarantine_ms),
            quarantine_poll: Duration::from_millis(cfg.quarantine_poll_ms),
        }
    }
}

impl Default for CloseTimings {
    fn default() -> Self {
        Self::from_config(&CloseConfig::default())
    }
}

/// Result of flattening one instrument
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlattenResult {
    pub flat: bool,
    pub net_after: i64,
}

/// Order and position cleanup for the close path and for reversals.
#[derive(Clone)]
pub struct CloseCleanup {
    broker: Arc<dyn BrokerClient>,
    timings: CloseTimings,
}

impl CloseCleanup {
    pub fn new(broker: Arc<dyn BrokerClient>, timings: CloseTimings) -> Self {
        Self { broker, timings }
    }

    pub fn timings(&self) -> &CloseTimings {
        &self.timings
    }

    /// Cancel every open order for `instrument` (optionally one kind only).
    ///
    /// Individual cancel failures are logged and skipped; the returned ids
    /// are the ones the broker accepted.
    pub async fn cancel_open_orders(
        &self,
        instrument: &InstrumentKey,
        kind: Option<OrderKind>,
    ) -> Result<Vec<OrderId>> {
        let orders = self.broker.open_orders_for(instrument, kind).await?;
        let mut canceled = Vec::with_capacity(orders.len());
        for order in orders {
            match self.broker.cancel_order(&order.order_id).await {
                Ok(()) => canceled.push(order.order_id),
                Err(e) => warn!(
                    "Cancel of open order {} on {} failed: {}",
                    order.order_id, instrument, e
                ),
            }
        }
        let label = kind.map_or_else(|| "open".to_string(), |k| k.to_string());
        info!(
            "Canceled {} {} order(s) on {}: {:?}",
            canceled.len(),
            label,
            instrument,
            canceled
        );
        Ok(canceled)
    }

    pub async fn cancel_trailing_stops(&self, instrument: &InstrumentKey) -> Result<Vec<OrderId>> {
        self.cancel_open_orders(instrument, Some(OrderKind::TrailingStop))
            .await
    }

    pub async fn cancel_stop_orders(&self, instrument: &InstrumentKey) -> Result<Vec<OrderId>> {
        self.cancel_open_orders(instrument, Some(OrderKind::Stop))
            .await
    }

    /// Poll net position until flat or `timeout` elapses.
    pub async fn wait_until_flat(
        &self,
        instrument: &InstrumentKey,
        timeout: Duration,
        poll: Duration,
    ) -> FlattenResult {
        let deadline = Instant::now() + timeout;
        let mut last_net = 0;
        loop {
            match self.broker.net_position(instrument).await {
                Ok(0) => {
                    return FlattenResult {
                        flat: true,
                        net_after: 0,
                    }
                }
                Ok(net) => last_net = net,
                Err(e) => debug!("Net position read failed for {}: {}", instrument, e),
            }
            if Instant::now() + poll > deadline {
                break;
            }
            tokio::time::sleep(poll).await;
        }
        FlattenResult {
            flat: false,
            net_after: last_net,
        }
    }

    /// Close the position and verify; one more close attempt if still not flat.
    pub async fn flatten(&self, instrument: &InstrumentKey) -> FlattenResult {
        self.close_logged(instrument).await;
        let first = self
            .wait_until_flat(instrument, self.timings.flat_timeout, self.timings.flat_poll)
            .await;
        if first.flat {
            return first;
        }

        warn!(
            "{} not flat after close (net={}); retrying once",
            instrument, first.net_after
        );
        self.close_logged(instrument).await;
        let second = self
            .wait_until_flat(instrument, self.timings.flat_timeout, self.timings.flat_poll)
            .await;
        if !second.flat {
            error!(
                "{} still not flat after retry (net={})",
                instrument, second.net_after
            );
        }
        second
    }

    async fn close_logged(&self, instrument: &InstrumentKey) {
        if let Err(e) = self.broker.close_position(instrument).await {
            warn!("closeContract for {} failed: {}", instrument, e);
        }
    }

    /// Keep canceling stray orders on `instrument` for the quarantine window.
    ///
    /// Resolves to the number of orders canceled.
    pub fn spawn_quarantine(&self, instrument: InstrumentKey) -> JoinHandle<usize> {
        let cleanup = self.clone();
        tokio::spawn(async move { cleanup.quarantine(&instrument).await })
    }

    pub async fn quarantine(&self, instrument: &InstrumentKey) -> usize {
        let deadline = Instant::now() + self.timings.quarantine;
        let mut total = 0;
        while Instant::now() < deadline {
            match self.cancel_open_orders(instrument, None).await {
                Ok(ids) if !ids.is_empty() => {
                    info!(
                        "Quarantine canceled {} stray order(s) on {}",
                        ids.len(),
                        instrument
                    );
                    total += ids.len();
                }
                Ok(_) => {}
                Err(e) => debug!("Quarantine search failed for {}: {}", instrument, e),
            }
            tokio::time::sleep(self.timings.quarantine_poll).await;
        }
        total
    }
}
