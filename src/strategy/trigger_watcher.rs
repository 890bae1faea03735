//! Per-entry trigger watcher.
//!
//! A watcher follows one resting entry order. Once the entry fills it places
//! the static protective stop; when price reaches the trigger it swaps that
//! static stop for a trailing stop. A touch of the stop level first ends the
//! watcher without ever placing the trailer.
//!
//! Ticks arrive through a [`QuoteListener`] that only forwards them into the
//! watcher's own channel, so broker calls and the fill-confirmation wait never
//! run on the stream's delivery task.

use rust_decimal::Decimal;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::{CancelToken, FillPoller, PollOutcome, WatcherHandle, WatcherRegistry};
use crate::config::WatcherConfig;
use crate::domain::{round_to_tick, InstrumentKey, OrderId, Side, Tick};
use crate::error::Result;
use crate::exchange::BrokerClient;
use crate::services::{QuoteListener, QuoteStream};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherPhase {
    EntryPending,
    EntryFilledNoStop,
    EntryFilledStaticStop,
    TrailingArmed,
    Done,
    Cancelled,
}

impl WatcherPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WatcherPhase::Done | WatcherPhase::Cancelled)
    }
}

impl fmt::Display for WatcherPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WatcherPhase::EntryPending => "entry_pending",
            WatcherPhase::EntryFilledNoStop => "entry_filled_no_stop",
            WatcherPhase::EntryFilledStaticStop => "entry_filled_static_stop",
            WatcherPhase::TrailingArmed => "trailing_armed",
            WatcherPhase::Done => "done",
            WatcherPhase::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// What the watcher is protecting
#[derive(Debug, Clone)]
pub struct WatcherParams {
    pub instrument: InstrumentKey,
    /// Entry side; protective orders go the opposite way
    pub side: Side,
    pub size: u32,
    pub entry_order_id: OrderId,
    pub trigger_price: Decimal,
    pub stop_loss: Option<Decimal>,
    /// Trailing distance in points
    pub trail_offset: Decimal,
    /// Net position when the entry was placed
    pub baseline_net: i64,
    pub tag: String,
}

#[derive(Debug, Clone)]
pub struct WatcherTimings {
    pub poll_interval: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub confirm_window: Duration,
    pub confirm_poll: Duration,
    pub max_lifetime: Duration,
    pub tick_size: Decimal,
    pub trail_correction: Decimal,
}

impl WatcherTimings {
    pub fn from_config(cfg: &WatcherConfig, tick_size: Decimal) -> Self {
        Self {
            poll_interval: Duration::from_millis(cfg.poll_interval_ms),
            backoff_base: Duration::from_millis(cfg.backoff_base_ms),
            backoff_max: Duration::from_millis(cfg.backoff_max_ms),
            confirm_window: Duration::from_millis(cfg.confirm_window_ms),
            confirm_poll: Duration::from_millis(cfg.confirm_poll_ms),
            max_lifetime: Duration::from_secs(cfg.max_lifetime_secs),
            tick_size,
            trail_correction: tick_size * Decimal::from(cfg.trail_correction_ticks),
        }
    }
}

/// Final state handed back by the watcher task
#[derive(Debug, Clone, PartialEq)]
pub struct WatcherReport {
    pub tag: String,
    pub phase: WatcherPhase,
    pub static_stop_id: Option<OrderId>,
    pub trailing_stop_id: Option<OrderId>,
    pub trail_price: Option<Decimal>,
    pub ticks_seen: u64,
}

/// Trailing-stop reference: `price ∓ offset ± correction`, snapped to the tick.
pub fn trail_price(
    side: Side,
    price: Decimal,
    offset: Decimal,
    correction: Decimal,
    tick_size: Decimal,
) -> Decimal {
    let raw = match side {
        Side::Buy => price - offset + correction,
        Side::Sell => price + offset - correction,
    };
    round_to_tick(raw, tick_size)
}

/// Forwards stream ticks into a watcher's queue.
struct ChannelListener {
    tx: mpsc::UnboundedSender<Tick>,
}

impl QuoteListener for ChannelListener {
    fn on_tick(&self, tick: &Tick) -> Result<()> {
        // a closed queue means the watcher already finished; detach is pending
        let _ = self.tx.send(*tick);
        Ok(())
    }
}

pub struct TriggerWatcher {
    params: WatcherParams,
    timings: WatcherTimings,
    broker: Arc<dyn BrokerClient>,
    poller: FillPoller,
    cancel: CancelToken,
    phase: WatcherPhase,
    filled: bool,
    static_stop_id: Option<OrderId>,
    trailing_stop_id: Option<OrderId>,
    trail_price: Option<Decimal>,
    ticks_seen: u64,
}

impl TriggerWatcher {
    pub fn new(
        params: WatcherParams,
        timings: WatcherTimings,
        broker: Arc<dyn BrokerClient>,
        cancel: CancelToken,
    ) -> Self {
        let poller = FillPoller::new(
            Arc::clone(&broker),
            params.instrument.clone(),
            params.entry_order_id.clone(),
            timings.poll_interval,
            timings.backoff_base,
            timings.backoff_max,
        );
        Self {
            params,
            timings,
            broker,
            poller,
            cancel,
            phase: WatcherPhase::EntryPending,
            filled: false,
            static_stop_id: None,
            trailing_stop_id: None,
            trail_price: None,
            ticks_seen: 0,
        }
    }

    pub fn phase(&self) -> WatcherPhase {
        self.phase
    }

    pub fn tag(&self) -> &str {
        &self.params.tag
    }

    pub fn report(&self) -> WatcherReport {
        WatcherReport {
            tag: self.params.tag.clone(),
            phase: self.phase,
            static_stop_id: self.static_stop_id.clone(),
            trailing_stop_id: self.trailing_stop_id.clone(),
            trail_price: self.trail_price,
            ticks_seen: self.ticks_seen,
        }
    }

    /// Attach to `stream`, register under the instrument and run on its own task.
    pub async fn launch(
        self,
        stream: Arc<QuoteStream>,
        registry: Arc<WatcherRegistry>,
    ) -> (WatcherHandle, JoinHandle<WatcherReport>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let listener_id = stream.add_listener(Arc::new(ChannelListener { tx })).await;
        let handle = WatcherHandle {
            id: Uuid::new_v4(),
            tag: self.params.tag.clone(),
            cancel: self.cancel.clone(),
            stream,
            listener_id,
        };
        registry.register(&self.params.instrument, handle.clone());

        info!(
            "[{}] Trigger watcher started: side={} size={} entry={} trigger={} offset={} stop={:?}",
            self.params.tag,
            self.params.side,
            self.params.size,
            self.params.entry_order_id,
            self.params.trigger_price,
            self.params.trail_offset,
            self.params.stop_loss
        );

        let task_handle = handle.clone();
        let instrument = self.params.instrument.clone();
        let task = tokio::spawn(async move {
            let report = self.run(rx).await;
            task_handle.detach().await;
            registry.remove(&instrument, task_handle.id);
            report
        });
        (handle, task)
    }

    /// Consume ticks until a terminal phase, cancellation or the lifetime ceiling.
    pub async fn run(mut self, mut ticks: mpsc::UnboundedReceiver<Tick>) -> WatcherReport {
        let deadline = tokio::time::sleep(self.timings.max_lifetime);
        tokio::pin!(deadline);
        let cancel = self.cancel.clone();

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("[{}] Watcher cancelled in phase {}", self.params.tag, self.phase);
                    self.phase = WatcherPhase::Cancelled;
                }
                _ = &mut deadline => {
                    warn!(
                        "[{}] Watcher hit {:?} lifetime ceiling in phase {}; stopping",
                        self.params.tag, self.timings.max_lifetime, self.phase
                    );
                    self.phase = WatcherPhase::Cancelled;
                }
                next = ticks.recv() => match next {
                    Some(tick) => self.handle_tick(&tick).await,
                    None => {
                        warn!("[{}] Tick feed closed; stopping watcher", self.params.tag);
                        self.phase = WatcherPhase::Cancelled;
                    }
                },
            }
            if self.phase.is_terminal() {
                break;
            }
        }

        info!(
            "[{}] Watcher finished: phase={} static={:?} trailing={:?} trail={:?}",
            self.params.tag, self.phase, self.static_stop_id, self.trailing_stop_id, self.trail_price
        );
        self.report()
    }

    /// Apply one tick to the state machine.
    pub async fn handle_tick(&mut self, tick: &Tick) {
        if self.phase.is_terminal() {
            return;
        }
        if self.cancel.is_cancelled() {
            self.phase = WatcherPhase::Cancelled;
            return;
        }
        self.ticks_seen += 1;
        let price = tick.price;

        if self.phase == WatcherPhase::TrailingArmed {
            if self.stop_hit(price) {
                self.abort_on_stop(price).await;
                return;
            }
            self.place_trailing(price).await;
            return;
        }

        // 1) fill detection
        if !self.filled && self.poller.poll().await == PollOutcome::Filled {
            info!(
                "[{}] Entry {} left open orders; treating as filled",
                self.params.tag, self.params.entry_order_id
            );
            self.filled = true;
            self.phase = WatcherPhase::EntryFilledNoStop;
        }
        if self.filled {
            self.ensure_static_stop().await;
        }

        // 2) protective stop has priority over the trigger
        if self.stop_hit(price) {
            self.abort_on_stop(price).await;
            return;
        }

        // 3) trigger
        let hit = match self.params.side {
            Side::Buy => price >= self.params.trigger_price,
            Side::Sell => price <= self.params.trigger_price,
        };
        if !hit {
            return;
        }
        info!(
            "[{}] Trigger condition met: last={} trigger={}",
            self.params.tag, price, self.params.trigger_price
        );

        if !self.filled {
            let confirmed = self.confirm_fill().await;
            if self.cancel.is_cancelled() {
                self.phase = WatcherPhase::Cancelled;
                return;
            }
            if !confirmed {
                let entry = self.params.entry_order_id.clone();
                self.cancel_order_logged(&entry, "entry").await;
                warn!(
                    "[{}] Trigger hit but entry not filled after {:?}; canceled {}",
                    self.params.tag, self.timings.confirm_window, self.params.entry_order_id
                );
                self.phase = WatcherPhase::Cancelled;
                return;
            }
            self.filled = true;
            self.poller.mark_filled();
            self.ensure_static_stop().await;
        }

        self.phase = WatcherPhase::TrailingArmed;
        self.place_trailing(price).await;
    }

    fn stop_hit(&self, price: Decimal) -> bool {
        match (self.params.stop_loss, self.params.side) {
            (Some(stop), Side::Buy) => price <= stop,
            (Some(stop), Side::Sell) => price >= stop,
            (None, _) => false,
        }
    }

    async fn abort_on_stop(&mut self, price: Decimal) {
        info!(
            "[{}] Stop level {:?} touched (last={}); ending watcher",
            self.params.tag, self.params.stop_loss, price
        );
        if !self.filled && self.poller.entry_open() {
            let entry = self.params.entry_order_id.clone();
            self.cancel_order_logged(&entry, "still-open entry").await;
        }
        if let Some(trailing) = self.trailing_stop_id.clone() {
            self.cancel_order_logged(&trailing, "trailing stop").await;
        }
        self.phase = WatcherPhase::Cancelled;
    }

    async fn ensure_static_stop(&mut self) {
        let Some(stop) = self.params.stop_loss else {
            return;
        };
        if self.static_stop_id.is_some() {
            return;
        }
        match self
            .broker
            .place_stop_order(
                &self.params.instrument,
                self.params.side.opposite(),
                self.params.size,
                stop,
            )
            .await
        {
            Ok(placed) => {
                info!(
                    "[{}] Static stop placed @ {} (id={})",
                    self.params.tag, stop, placed.order_id
                );
                self.static_stop_id = Some(placed.order_id);
                if self.phase != WatcherPhase::TrailingArmed {
                    self.phase = WatcherPhase::EntryFilledStaticStop;
                }
            }
            Err(e) => error!(
                "[{}] Failed to place static stop @ {} in phase {}: {}; retrying next tick",
                self.params.tag, stop, self.phase, e
            ),
        }
    }

    /// Bounded wait for evidence that the entry filled.
    async fn confirm_fill(&mut self) -> bool {
        let deadline = Instant::now() + self.timings.confirm_window;
        while Instant::now() < deadline {
            let still_open = self.poller.entry_open_now().await;
            let net = match self.broker.net_position(&self.params.instrument).await {
                Ok(net) => net,
                Err(e) => {
                    warn!("[{}] Net position read failed: {}", self.params.tag, e);
                    self.params.baseline_net
                }
            };
            if !still_open || (net != self.params.baseline_net && net.abs() >= 1) {
                info!(
                    "[{}] Fill confirmed (open={}, net={}, baseline={})",
                    self.params.tag, still_open, net, self.params.baseline_net
                );
                return true;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.timings.confirm_poll) => {}
                _ = self.cancel.cancelled() => return false,
            }
        }
        false
    }

    async fn place_trailing(&mut self, price: Decimal) {
        let trail = trail_price(
            self.params.side,
            price,
            self.params.trail_offset,
            self.timings.trail_correction,
            self.timings.tick_size,
        );
        let placed = match self
            .broker
            .place_trailing_stop_order(
                &self.params.instrument,
                self.params.side.opposite(),
                self.params.size,
                trail,
            )
            .await
        {
            Ok(placed) => placed,
            Err(e) => {
                error!(
                    "[{}] Trailing stop @ {} failed on {}: {}; retrying next tick",
                    self.params.tag, trail, self.params.instrument, e
                );
                return;
            }
        };
        self.trailing_stop_id = Some(placed.order_id.clone());
        self.trail_price = Some(trail);

        if let Some(static_id) = self.static_stop_id.clone() {
            match self.broker.cancel_order(&static_id).await {
                Ok(()) => {
                    info!(
                        "[{}] Replaced static stop {} with trailing {} @ {}",
                        self.params.tag, static_id, placed.order_id, trail
                    );
                    self.static_stop_id = None;
                }
                Err(e) => error!(
                    "[{}] Failed to cancel static stop {} after trailing: {}",
                    self.params.tag, static_id, e
                ),
            }
        }

        info!(
            "[{}] Trigger HIT @ {} -> trailing stop @ {} (id={}, offset {} pts)",
            self.params.tag, price, trail, placed.order_id, self.params.trail_offset
        );
        self.phase = WatcherPhase::Done;
    }

    async fn cancel_order_logged(&self, order_id: &OrderId, what: &str) {
        match self.broker.cancel_order(order_id).await {
            Ok(()) => info!("[{}] Canceled {} {}", self.params.tag, what, order_id),
            Err(e) => error!("[{}] Failed to cancel {} {}: {}", self.params.tag, what, order_id, e),
        }
    }
}
