//! In-memory broker and market hub shared by the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use trailgate::domain::{
    InstrumentKey, OpenOrder, OrderId, OrderKind, OrderRequest, PlacedOrder, PositionSnapshot,
    Side, Tick,
};
use trailgate::error::{Result, TrailgateError};
use trailgate::exchange::{BrokerClient, ContractLookup};
use trailgate::services::{HubConnection, HubEvent, MarketHub};

pub const MNQ: &str = "CON.F.US.MNQ.Z25";

pub fn mnq() -> InstrumentKey {
    InstrumentKey::from(MNQ)
}

#[derive(Debug, Clone, PartialEq)]
pub enum BrokerCall {
    Place(OrderId, OrderRequest),
    Cancel(OrderId),
    Close(InstrumentKey),
}

#[derive(Default)]
struct BrokerState {
    next_id: i64,
    calls: Vec<BrokerCall>,
    open: Vec<OpenOrder>,
    net: HashMap<InstrumentKey, i64>,
    /// Next placements land at the broker but the call reports a timeout
    timeouts_remaining: usize,
    /// Next placements time out and never reach the book
    lost_remaining: usize,
}

/// Broker that keeps working orders and net positions in memory.
///
/// Non-market orders rest until [`FakeBroker::fill`] or a cancel; market
/// orders fill immediately.
pub struct FakeBroker {
    state: Mutex<BrokerState>,
    place_delay: Mutex<Option<Duration>>,
    pub searches: AtomicUsize,
}

impl Default for FakeBroker {
    fn default() -> Self {
        Self {
            state: Mutex::new(BrokerState {
                next_id: 1000,
                ..Default::default()
            }),
            place_delay: Mutex::new(None),
            searches: AtomicUsize::new(0),
        }
    }
}

fn signed(side: Side, size: u32) -> i64 {
    match side {
        Side::Buy => size as i64,
        Side::Sell => -(size as i64),
    }
}

impl FakeBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_net(&self, instrument: &InstrumentKey, net: i64) {
        self.state.lock().unwrap().net.insert(instrument.clone(), net);
    }

    pub fn net(&self, instrument: &InstrumentKey) -> i64 {
        self.state
            .lock()
            .unwrap()
            .net
            .get(instrument)
            .copied()
            .unwrap_or(0)
    }

    /// Make the next `n` placements time out after the order was accepted.
    pub fn time_out_next_placements(&self, n: usize) {
        self.state.lock().unwrap().timeouts_remaining = n;
    }

    /// Make the next `n` placements time out without the order landing.
    pub fn lose_next_placements(&self, n: usize) {
        self.state.lock().unwrap().lost_remaining = n;
    }

    pub fn delay_placements(&self, delay: Duration) {
        *self.place_delay.lock().unwrap() = Some(delay);
    }

    /// Add a resting order the engine did not place.
    pub fn seed_open_order(&self, order: OpenOrder) {
        self.state.lock().unwrap().open.push(order);
    }

    /// Fill a resting order completely.
    pub fn fill(&self, order_id: &OrderId) {
        let mut state = self.state.lock().unwrap();
        let Some(pos) = state.open.iter().position(|o| &o.order_id == order_id) else {
            return;
        };
        let order = state.open.remove(pos);
        if let Some(side) = order.side {
            *state.net.entry(order.instrument.clone()).or_insert(0) += signed(side, order.size);
        }
    }

    pub fn calls(&self) -> Vec<BrokerCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    pub fn placements(&self) -> Vec<(OrderId, OrderRequest)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                BrokerCall::Place(id, req) => Some((id, req)),
                _ => None,
            })
            .collect()
    }

    pub fn placements_of(&self, kind: OrderKind) -> Vec<(OrderId, OrderRequest)> {
        self.placements()
            .into_iter()
            .filter(|(_, req)| req.kind == kind)
            .collect()
    }

    pub fn cancels(&self) -> Vec<OrderId> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                BrokerCall::Cancel(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    pub fn open_orders(&self) -> Vec<OpenOrder> {
        self.state.lock().unwrap().open.clone()
    }
}

#[async_trait]
impl BrokerClient for FakeBroker {
    async fn place_order(&self, request: &OrderRequest) -> Result<PlacedOrder> {
        let delay = *self.place_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().unwrap();
        if state.lost_remaining > 0 {
            state.lost_remaining -= 1;
            return Err(TrailgateError::SubmissionTimeout("place".into()));
        }
        state.next_id += 1;
        let id = OrderId::from(state.next_id);
        state.calls.push(BrokerCall::Place(id.clone(), request.clone()));

        if request.kind == OrderKind::Market {
            *state.net.entry(request.instrument.clone()).or_insert(0) +=
                signed(request.side, request.size);
        } else {
            state.open.push(OpenOrder {
                order_id: id.clone(),
                instrument: request.instrument.clone(),
                kind: Some(request.kind),
                side: Some(request.side),
                size: request.size,
                limit_price: request.limit_price,
                stop_price: request.stop_price.or(request.trail_price),
            });
        }

        if state.timeouts_remaining > 0 {
            state.timeouts_remaining -= 1;
            return Err(TrailgateError::SubmissionTimeout("place".into()));
        }
        Ok(PlacedOrder::new(id))
    }

    async fn cancel_order(&self, order_id: &OrderId) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(BrokerCall::Cancel(order_id.clone()));
        state.open.retain(|o| &o.order_id != order_id);
        Ok(())
    }

    async fn search_open_orders(&self) -> Result<Vec<OpenOrder>> {
        self.searches.fetch_add(1, Ordering::SeqCst);
        Ok(self.state.lock().unwrap().open.clone())
    }

    async fn search_open_positions(&self) -> Result<Vec<PositionSnapshot>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .net
            .iter()
            .filter(|(_, net)| **net != 0)
            .map(|(instrument, net)| PositionSnapshot {
                instrument: instrument.clone(),
                net_quantity: *net,
            })
            .collect())
    }

    async fn close_position(&self, instrument: &InstrumentKey) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(BrokerCall::Close(instrument.clone()));
        state.net.insert(instrument.clone(), 0);
        Ok(())
    }
}

#[async_trait]
impl ContractLookup for FakeBroker {
    async fn search_contract(&self, symbol: &str) -> Result<InstrumentKey> {
        let root = symbol.trim_end_matches(|c: char| c.is_ascii_digit());
        let (root, month) = root.split_at(root.len().saturating_sub(1));
        if root.is_empty() || !["H", "M", "U", "Z"].contains(&month) {
            return Err(TrailgateError::ContractResolution(symbol.to_string()));
        }
        Ok(InstrumentKey::new(format!("CON.F.US.{}.{}25", root, month)))
    }
}

/// Market hub whose connections are driven by the test.
#[derive(Default)]
pub struct FakeHub {
    pub connects: AtomicUsize,
    senders: Mutex<HashMap<InstrumentKey, mpsc::UnboundedSender<HubEvent>>>,
}

impl FakeHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish one trade on the instrument's current connection.
    pub fn trade(&self, instrument: &InstrumentKey, price: Decimal) -> bool {
        self.send(instrument, HubEvent::Trades(vec![Tick::now(price)]))
    }

    pub fn send(&self, instrument: &InstrumentKey, event: HubEvent) -> bool {
        self.senders
            .lock()
            .unwrap()
            .get(instrument)
            .map_or(false, |tx| tx.send(event).is_ok())
    }
}

#[async_trait]
impl MarketHub for FakeHub {
    async fn connect(&self, instrument: &InstrumentKey, _token: &str) -> Result<HubConnection> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.lock().unwrap().insert(instrument.clone(), tx);
        Ok(HubConnection::new(rx, None))
    }
}

/// Let spawned tasks drain their queues.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

pub fn settings(flip: trailgate::strategy::FlipPolicy) -> trailgate::services::OrchestratorSettings {
    use rust_decimal_macros::dec;
    use trailgate::config::WatcherConfig;
    use trailgate::domain::TradingSession;
    use trailgate::services::CloseTimings;
    use trailgate::strategy::WatcherTimings;

    trailgate::services::OrchestratorSettings {
        tick_size: dec!(0.25),
        session: TradingSession::always_open(),
        close_holdoff: Duration::from_millis(1500),
        watcher: WatcherTimings::from_config(&WatcherConfig::default(), dec!(0.25)),
        close: CloseTimings::default(),
        flip,
    }
}

pub fn orchestrator(
    broker: std::sync::Arc<FakeBroker>,
    hub: std::sync::Arc<FakeHub>,
    flip: trailgate::strategy::FlipPolicy,
) -> trailgate::services::Orchestrator {
    use std::sync::Arc;
    use trailgate::domain::TradingSession;
    use trailgate::services::{Orchestrator, QuoteStreams};

    let streams = Arc::new(QuoteStreams::new(hub, TradingSession::always_open(), "token"));
    Orchestrator::new(broker, streams, settings(flip))
}

/// Buy/sell entry on MNQ at 21000 with a 10 point trigger and a 10 point stop.
pub fn entry(side: Side, size: u32, ts_ms: Option<i64>) -> trailgate::domain::EntrySignal {
    use rust_decimal_macros::dec;
    let stop = match side {
        Side::Buy => dec!(20990),
        Side::Sell => dec!(21010),
    };
    trailgate::domain::EntrySignal {
        instrument: mnq(),
        side,
        size,
        entry_price: dec!(21000),
        trigger_offset: dec!(10),
        stop_loss: Some(stop),
        signal_ts_ms: ts_ms,
        tag: format!("MNQ_{}_it", side),
    }
}

pub fn close(ts_ms: Option<i64>) -> trailgate::domain::CloseSignal {
    trailgate::domain::CloseSignal {
        instrument: mnq(),
        signal_ts_ms: ts_ms,
        tag: "MNQ_close_it".into(),
    }
}
