//! Signal handling entry points.
//!
//! The orchestrator owns the process-scoped registries: signal gate, quote
//! streams and active watchers. Every signal for an instrument runs to
//! completion while holding that instrument's gate guard.

use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::close_cleanup::{CloseCleanup, CloseTimings};
use super::quote_stream::{QuoteStream, QuoteStreams};
use super::reconciliation::ReconciliationResolver;
use crate::config::AppConfig;
use crate::coordination::{GateRejection, SignalGate};
use crate::domain::{
    round_to_tick, CloseSignal, EntrySignal, InstrumentKey, OrderId, OrderRequest, TradingSession,
};
use crate::error::Result;
use crate::exchange::BrokerClient;
use crate::strategy::{
    CancelToken, FlipPlan, FlipPolicy, TriggerWatcher, WatcherParams, WatcherRegistry,
    WatcherReport, WatcherTimings,
};

/// Tunables the orchestrator needs from [`AppConfig`]
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub tick_size: Decimal,
    pub session: TradingSession,
    pub close_holdoff: Duration,
    pub watcher: WatcherTimings,
    pub close: CloseTimings,
    pub flip: FlipPolicy,
}

impl OrchestratorSettings {
    pub fn from_config(cfg: &AppConfig) -> Result<Self> {
        let tick_size = cfg.market.tick_size;
        Ok(Self {
            tick_size,
            session: TradingSession::from_config(&cfg.session)?,
            close_holdoff: cfg.gate.close_holdoff(),
            watcher: WatcherTimings::from_config(&cfg.watcher, tick_size),
            close: CloseTimings::from_config(&cfg.close),
            flip: FlipPolicy::new(cfg.flip.reversal_size),
        })
    }
}

/// Accepted entry
#[derive(Debug)]
pub struct EntryPlacement {
    pub tag: String,
    pub instrument: InstrumentKey,
    pub entry_order_id: OrderId,
    pub entry_price: Decimal,
    pub trigger_price: Decimal,
    pub stop_loss: Option<Decimal>,
    pub plan: FlipPlan,
    /// Market leg of a reversal, when it was accepted
    pub market_order_id: Option<OrderId>,
    pub watcher: JoinHandle<WatcherReport>,
}

#[derive(Debug)]
pub enum EntryOutcome {
    Skipped(GateRejection),
    Placed(EntryPlacement),
}

/// Completed close
#[derive(Debug)]
pub struct CloseReport {
    pub tag: String,
    pub instrument: InstrumentKey,
    pub canceled_watchers: usize,
    pub canceled_orders: Vec<OrderId>,
    pub flat: bool,
    pub net_after: i64,
    /// Post-close sweep for straggling orders; resolves to how many it canceled
    pub quarantine: JoinHandle<usize>,
}

#[derive(Debug)]
pub enum CloseOutcome {
    Skipped(GateRejection),
    Closed(CloseReport),
}

pub struct Orchestrator {
    broker: Arc<dyn BrokerClient>,
    resolver: ReconciliationResolver,
    gate: SignalGate,
    streams: Arc<QuoteStreams>,
    watchers: Arc<WatcherRegistry>,
    cleanup: CloseCleanup,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(
        broker: Arc<dyn BrokerClient>,
        streams: Arc<QuoteStreams>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            resolver: ReconciliationResolver::new(Arc::clone(&broker), settings.tick_size),
            gate: SignalGate::new(settings.close_holdoff, settings.session),
            cleanup: CloseCleanup::new(Arc::clone(&broker), settings.close.clone()),
            watchers: Arc::new(WatcherRegistry::new()),
            broker,
            streams,
            settings,
        }
    }

    pub fn gate(&self) -> &SignalGate {
        &self.gate
    }

    pub fn watchers(&self) -> &Arc<WatcherRegistry> {
        &self.watchers
    }

    pub fn streams(&self) -> &Arc<QuoteStreams> {
        &self.streams
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Get or create the instrument's stream and make sure it is connected.
    pub async fn ensure_quote_stream(&self, instrument: &InstrumentKey) -> Result<Arc<QuoteStream>> {
        self.streams.ensure(instrument).await
    }

    pub async fn handle_entry_signal(&self, signal: EntrySignal) -> Result<EntryOutcome> {
        signal.validate()?;
        if let Err(rejection) = self.gate.check_session(Utc::now()) {
            info!("[{}] Entry skipped: {}", signal.tag, rejection);
            return Ok(EntryOutcome::Skipped(rejection));
        }

        let instrument = signal.instrument.clone();
        let guard = self.gate.acquire(&instrument).await;
        if let Err(rejection) = guard.check_entry(signal.signal_ts_ms) {
            info!("[{}] Entry skipped: {}", signal.tag, rejection);
            return Ok(EntryOutcome::Skipped(rejection));
        }

        let tick = self.settings.tick_size;
        let entry_price = round_to_tick(signal.entry_price, tick);
        let trigger_price = round_to_tick(signal.trigger_price(), tick);
        let stop_loss = signal.stop_loss.map(|s| round_to_tick(s, tick));

        let baseline_net = match self.broker.net_position(&instrument).await {
            Ok(net) => net,
            Err(e) => {
                warn!(
                    "[{}] Baseline net read failed on {}: {}; assuming flat",
                    signal.tag, instrument, e
                );
                0
            }
        };

        let plan = self
            .settings
            .flip
            .plan(signal.side, signal.size, baseline_net);
        let market_order_id = match plan {
            FlipPlan::Split { market_size, .. } => {
                self.reverse_prelude(&signal, market_size, baseline_net)
                    .await
            }
            FlipPlan::Reduced { size } => {
                info!(
                    "[{}] Reversal size {} with no opposing position (net={}); entering {}",
                    signal.tag, signal.size, baseline_net, size
                );
                None
            }
            FlipPlan::Normal { .. } => None,
        };

        let request = OrderRequest::limit(
            instrument.clone(),
            signal.side,
            plan.limit_size(),
            entry_price,
        );
        let placed = self.resolver.submit(&request).await.map_err(|e| {
            error!(
                "[{}] Entry {} x{} @ {} on {} failed: {}",
                signal.tag,
                signal.side,
                plan.limit_size(),
                entry_price,
                instrument,
                e
            );
            e
        })?;
        info!(
            "[{}] Limit entry placed: {} x{} @ {} (id={}) trigger={} stop={:?}",
            signal.tag,
            signal.side,
            plan.limit_size(),
            entry_price,
            placed.order_id,
            trigger_price,
            stop_loss
        );

        let stream = self.streams.get_or_create(&instrument).await;
        if !stream.is_connected() {
            if let Err(e) = stream.start().await {
                // the guard keeps retrying; the watcher is attached either way
                warn!(
                    "[{}] Quote stream for {} not started: {}",
                    signal.tag, instrument, e
                );
            }
        }

        let params = WatcherParams {
            instrument: instrument.clone(),
            side: signal.side,
            size: plan.limit_size(),
            entry_order_id: placed.order_id.clone(),
            trigger_price,
            stop_loss,
            trail_offset: signal.trigger_offset,
            baseline_net,
            tag: signal.tag.clone(),
        };
        let watcher = TriggerWatcher::new(
            params,
            self.settings.watcher.clone(),
            Arc::clone(&self.broker),
            CancelToken::new(),
        );
        let (_handle, task) = watcher.launch(stream, Arc::clone(&self.watchers)).await;
        drop(guard);

        Ok(EntryOutcome::Placed(EntryPlacement {
            tag: signal.tag,
            instrument,
            entry_order_id: placed.order_id,
            entry_price,
            trigger_price,
            stop_loss,
            plan,
            market_order_id,
            watcher: task,
        }))
    }

    /// Clear the way for a reversal and send its market leg.
    async fn reverse_prelude(
        &self,
        signal: &EntrySignal,
        market_size: u32,
        net: i64,
    ) -> Option<OrderId> {
        let instrument = &signal.instrument;
        info!(
            "[{}] Reversal: net={} -> market {} x{} then limit remainder",
            signal.tag, net, signal.side, market_size
        );

        self.watchers.cancel_all(instrument).await;
        if let Err(e) = self.cleanup.cancel_trailing_stops(instrument).await {
            warn!("[{}] Trailing stop cleanup failed: {}", signal.tag, e);
        }
        if let Err(e) = self.cleanup.cancel_stop_orders(instrument).await {
            warn!("[{}] Stop order cleanup failed: {}", signal.tag, e);
        }

        let request = OrderRequest::market(instrument.clone(), signal.side, market_size);
        match self.resolver.submit(&request).await {
            Ok(placed) => {
                info!(
                    "[{}] Market leg placed: {} x{} (id={})",
                    signal.tag, signal.side, market_size, placed.order_id
                );
                Some(placed.order_id)
            }
            Err(e) => {
                error!(
                    "[{}] Market leg {} x{} failed: {}; continuing with limit leg",
                    signal.tag, signal.side, market_size, e
                );
                None
            }
        }
    }

    pub async fn handle_close_signal(&self, signal: CloseSignal) -> Result<CloseOutcome> {
        if let Err(rejection) = self.gate.check_session(Utc::now()) {
            info!("[{}] Close skipped: {}", signal.tag, rejection);
            return Ok(CloseOutcome::Skipped(rejection));
        }

        let instrument = signal.instrument.clone();
        let mut guard = self.gate.acquire(&instrument).await;

        let canceled_watchers = self.watchers.cancel_all(&instrument).await;
        guard.record_close(signal.signal_ts_ms);

        let canceled_orders = match self.cleanup.cancel_open_orders(&instrument, None).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(
                    "[{}] Open order search failed before close on {}: {}",
                    signal.tag, instrument, e
                );
                Vec::new()
            }
        };

        let flat = self.cleanup.flatten(&instrument).await;
        let quarantine = self.cleanup.spawn_quarantine(instrument.clone());
        drop(guard);

        info!(
            "[{}] Close done on {}: flat={} net={} watchers={} orders={:?}",
            signal.tag, instrument, flat.flat, flat.net_after, canceled_watchers, canceled_orders
        );
        Ok(CloseOutcome::Closed(CloseReport {
            tag: signal.tag,
            instrument,
            canceled_watchers,
            canceled_orders,
            flat: flat.flat,
            net_after: flat.net_after,
            quarantine,
        }))
    }

    /// Cancel every watcher and stream; used on shutdown.
    pub async fn shutdown(&self) {
        for stream in self.streams.all() {
            let canceled = self.watchers.cancel_all(stream.instrument()).await;
            if canceled > 0 {
                info!("Shutdown: canceled {} watcher(s) on {}", canceled, stream.instrument());
            }
        }
        self.streams.stop_all().await;
    }
}
