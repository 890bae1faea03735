//! Live trade distribution.
//!
//! One [`QuoteStream`] owns the market-hub connection for a single instrument
//! and fans each trade out to its registered [`QuoteListener`]s. Listeners
//! survive `stop()`/`start()` cycles, so watchers keep receiving ticks after a
//! reconnect without re-attaching.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::domain::{InstrumentKey, Tick, TradingSession};
use crate::error::Result;

/// Event emitted by an open hub connection.
#[derive(Debug, Clone, PartialEq)]
pub enum HubEvent {
    /// One or more trade prints for the subscribed instrument
    Trades(Vec<Tick>),
    /// Server or transport closed the connection
    Closed(Option<String>),
    /// Transport error; the connection is unusable afterwards
    Error(String),
}

/// An open, subscribed hub connection.
pub struct HubConnection {
    events: mpsc::UnboundedReceiver<HubEvent>,
    close_tx: Option<oneshot::Sender<()>>,
}

impl HubConnection {
    pub fn new(
        events: mpsc::UnboundedReceiver<HubEvent>,
        close_tx: Option<oneshot::Sender<()>>,
    ) -> Self {
        Self { events, close_tx }
    }
}

/// Market-data transport.
///
/// `connect` resolves once the connection is open and subscribed to trades
/// for exactly `instrument`.
#[async_trait]
pub trait MarketHub: Send + Sync {
    async fn connect(&self, instrument: &InstrumentKey, token: &str) -> Result<HubConnection>;
}

/// Tick consumer attached to a stream.
///
/// Called from the stream's delivery task; implementations must not block.
pub trait QuoteListener: Send + Sync {
    fn on_tick(&self, tick: &Tick) -> Result<()>;
}

impl<F> QuoteListener for F
where
    F: Fn(&Tick) -> Result<()> + Send + Sync,
{
    fn on_tick(&self, tick: &Tick) -> Result<()> {
        self(tick)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl std::fmt::Display for ListenerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

struct ActiveConnection {
    generation: u64,
    close_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl ActiveConnection {
    fn shutdown(mut self) {
        if let Some(tx) = self.close_tx.take() {
            let _ = tx.send(());
        }
        self.task.abort();
    }
}

/// Single live trade subscription for one instrument
pub struct QuoteStream {
    instrument: InstrumentKey,
    hub: Arc<dyn MarketHub>,
    session: TradingSession,
    token: RwLock<String>,
    connection: Mutex<Option<ActiveConnection>>,
    generation: AtomicU64,
    connected: AtomicBool,
    last_tick: RwLock<Option<Instant>>,
    listeners: RwLock<Vec<(ListenerId, Arc<dyn QuoteListener>)>>,
    next_listener_id: AtomicU64,
}

impl QuoteStream {
    pub fn new(
        instrument: InstrumentKey,
        hub: Arc<dyn MarketHub>,
        session: TradingSession,
        token: impl Into<String>,
    ) -> Self {
        Self {
            instrument,
            hub,
            session,
            token: RwLock::new(token.into()),
            connection: Mutex::new(None),
            generation: AtomicU64::new(0),
            connected: AtomicBool::new(false),
            last_tick: RwLock::new(None),
            listeners: RwLock::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
        }
    }

    pub fn instrument(&self) -> &InstrumentKey {
        &self.instrument
    }

    /// Open and subscribe unless already connected.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut slot = self.connection.lock().await;
        if slot.is_some() && self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(stale) = slot.take() {
            debug!("Dropping stale hub handle for {}", self.instrument);
            stale.shutdown();
        }

        let token = self.token.read().await.clone();
        let conn = self.hub.connect(&self.instrument, &token).await?;

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.connected.store(true, Ordering::SeqCst);
        *self.last_tick.write().await = Some(Instant::now());

        let task = tokio::spawn(Self::pump(Arc::downgrade(self), generation, conn.events));
        *slot = Some(ActiveConnection {
            generation,
            close_tx: conn.close_tx,
            task,
        });

        info!("QuoteStream connected; subscribed {}", self.instrument);
        Ok(())
    }

    /// Close the connection; listeners stay attached.
    pub async fn stop(&self) {
        let mut slot = self.connection.lock().await;
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(active) = slot.take() {
            debug!(
                "Closing hub connection generation {} for {}",
                active.generation, self.instrument
            );
            active.shutdown();
        }
        self.connected.store(false, Ordering::SeqCst);
        info!("QuoteStream stopped for {}", self.instrument);
    }

    /// Credential for the next connect; an open connection is unaffected.
    pub async fn set_token(&self, token: &str) {
        let mut current = self.token.write().await;
        if current.as_str() != token {
            *current = token.to_string();
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Time since the last delivered tick (or since connect).
    pub async fn last_tick_age(&self) -> Option<Duration> {
        self.last_tick.read().await.map(|at| at.elapsed())
    }

    pub async fn add_listener(&self, listener: Arc<dyn QuoteListener>) -> ListenerId {
        let id = ListenerId(self.next_listener_id.fetch_add(1, Ordering::SeqCst));
        self.listeners.write().await.push((id, listener));
        id
    }

    pub async fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write().await;
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    pub async fn listener_count(&self) -> usize {
        self.listeners.read().await.len()
    }

    /// Hand one tick to every listener, in registration order.
    ///
    /// Ticks inside the no-trade window are dropped. Returns how many
    /// listeners accepted the tick.
    pub async fn deliver(&self, tick: Tick) -> usize {
        if self.session.is_paused(Utc::now()) {
            debug!("Tick for {} suppressed during no-trade window", self.instrument);
            return 0;
        }
        *self.last_tick.write().await = Some(Instant::now());

        let snapshot: Vec<(ListenerId, Arc<dyn QuoteListener>)> = self
            .listeners
            .read()
            .await
            .iter()
            .map(|(id, l)| (*id, Arc::clone(l)))
            .collect();

        let mut delivered = 0;
        for (id, listener) in snapshot {
            match catch_unwind(AssertUnwindSafe(|| listener.on_tick(&tick))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => warn!("{} on {} failed: {}", id, self.instrument, e),
                Err(_) => error!("{} on {} panicked; continuing", id, self.instrument),
            }
        }
        delivered
    }

    async fn pump(
        stream: Weak<Self>,
        generation: u64,
        mut events: mpsc::UnboundedReceiver<HubEvent>,
    ) {
        while let Some(event) = events.recv().await {
            let Some(stream) = stream.upgrade() else {
                return;
            };
            if stream.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            match event {
                HubEvent::Trades(ticks) => {
                    for tick in ticks {
                        stream.deliver(tick).await;
                    }
                }
                HubEvent::Closed(reason) => {
                    stream.connected.store(false, Ordering::SeqCst);
                    info!(
                        "QuoteStream disconnected for {} ({})",
                        stream.instrument,
                        reason.as_deref().unwrap_or("no reason")
                    );
                }
                HubEvent::Error(err) => {
                    stream.connected.store(false, Ordering::SeqCst);
                    error!("QuoteStream error for {}: {}", stream.instrument, err);
                }
            }
        }

        if let Some(stream) = stream.upgrade() {
            if stream.generation.load(Ordering::SeqCst) == generation {
                stream.connected.store(false, Ordering::SeqCst);
                info!("Hub event channel ended for {}", stream.instrument);
            }
        }
    }
}

/// Process-scoped registry: at most one stream per instrument.
pub struct QuoteStreams {
    hub: Arc<dyn MarketHub>,
    session: TradingSession,
    token: RwLock<String>,
    streams: DashMap<InstrumentKey, Arc<QuoteStream>>,
}

impl QuoteStreams {
    pub fn new(hub: Arc<dyn MarketHub>, session: TradingSession, token: impl Into<String>) -> Self {
        Self {
            hub,
            session,
            token: RwLock::new(token.into()),
            streams: DashMap::new(),
        }
    }

    /// Get or create the instrument's stream without connecting it.
    pub async fn get_or_create(&self, instrument: &InstrumentKey) -> Arc<QuoteStream> {
        let token = self.token.read().await.clone();
        self.streams
            .entry(instrument.clone())
            .or_insert_with(|| {
                Arc::new(QuoteStream::new(
                    instrument.clone(),
                    Arc::clone(&self.hub),
                    self.session,
                    token,
                ))
            })
            .clone()
    }

    /// Get or create the instrument's stream and start it if not connected.
    pub async fn ensure(&self, instrument: &InstrumentKey) -> Result<Arc<QuoteStream>> {
        let stream = self.get_or_create(instrument).await;
        if !stream.is_connected() {
            let token = self.token.read().await.clone();
            stream.set_token(&token).await;
            stream.start().await?;
        }
        Ok(stream)
    }

    pub fn get(&self, instrument: &InstrumentKey) -> Option<Arc<QuoteStream>> {
        self.streams.get(instrument).map(|s| Arc::clone(&s))
    }

    pub fn all(&self) -> Vec<Arc<QuoteStream>> {
        self.streams.iter().map(|s| Arc::clone(s.value())).collect()
    }

    pub async fn current_token(&self) -> String {
        self.token.read().await.clone()
    }

    /// Record a refreshed credential and push it into every stream.
    pub async fn set_token(&self, token: &str) {
        *self.token.write().await = token.to_string();
        for stream in self.all() {
            stream.set_token(token).await;
        }
    }

    pub async fn stop_all(&self) {
        for stream in self.all() {
            stream.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TrailgateError;
    use rust_decimal_macros::dec;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingHub {
        connects: AtomicUsize,
        senders: std::sync::Mutex<Vec<mpsc::UnboundedSender<HubEvent>>>,
    }

    #[async_trait]
    impl MarketHub for CountingHub {
        async fn connect(&self, _instrument: &InstrumentKey, _token: &str) -> Result<HubConnection> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = mpsc::unbounded_channel();
            self.senders.lock().unwrap().push(tx);
            Ok(HubConnection::new(rx, None))
        }
    }

    fn stream(hub: Arc<CountingHub>) -> Arc<QuoteStream> {
        Arc::new(QuoteStream::new(
            InstrumentKey::from("CON.F.US.MNQ.Z25"),
            hub,
            TradingSession::always_open(),
            "tok",
        ))
    }

    #[tokio::test]
    async fn test_start_is_idempotent_while_connected() {
        let hub = Arc::new(CountingHub::default());
        let s = stream(hub.clone());

        s.start().await.unwrap();
        s.start().await.unwrap();
        assert!(s.is_connected());
        assert_eq!(hub.connects.load(Ordering::SeqCst), 1);

        s.stop().await;
        assert!(!s.is_connected());
        s.start().await.unwrap();
        assert_eq!(hub.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_listener_failures_are_isolated() {
        let hub = Arc::new(CountingHub::default());
        let s = stream(hub);
        let seen = Arc::new(AtomicUsize::new(0));

        s.add_listener(Arc::new(|_: &Tick| -> Result<()> {
            Err(TrailgateError::Internal("boom".into()))
        }))
        .await;
        s.add_listener(Arc::new(|_: &Tick| -> Result<()> { panic!("listener bug") }))
            .await;
        let counter = seen.clone();
        s.add_listener(Arc::new(move |_: &Tick| -> Result<()> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }))
        .await;

        let delivered = s.deliver(Tick::now(dec!(21000))).await;
        assert_eq!(delivered, 1);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_remove_listener_and_preserve_on_stop() {
        let hub = Arc::new(CountingHub::default());
        let s = stream(hub);
        let id = s.add_listener(Arc::new(|_: &Tick| -> Result<()> { Ok(()) })).await;
        s.add_listener(Arc::new(|_: &Tick| -> Result<()> { Ok(()) })).await;

        s.start().await.unwrap();
        s.stop().await;
        assert_eq!(s.listener_count().await, 2);

        assert!(s.remove_listener(id).await);
        assert!(!s.remove_listener(id).await);
        assert_eq!(s.listener_count().await, 1);
    }

    #[tokio::test]
    async fn test_paused_session_suppresses_delivery() {
        let hub = Arc::new(CountingHub::default());
        let s = Arc::new(QuoteStream::new(
            InstrumentKey::from("X"),
            hub,
            TradingSession::new(chrono_tz::Tz::UTC, 0, 24),
            "tok",
        ));
        s.add_listener(Arc::new(|_: &Tick| -> Result<()> { Ok(()) })).await;
        assert_eq!(s.deliver(Tick::now(dec!(1))).await, 0);
        assert!(s.last_tick_age().await.is_none());
    }

    #[tokio::test]
    async fn test_hub_close_marks_disconnected() {
        let hub = Arc::new(CountingHub::default());
        let s = stream(hub.clone());
        s.start().await.unwrap();

        let tx = hub.senders.lock().unwrap()[0].clone();
        tx.send(HubEvent::Closed(Some("server".into()))).unwrap();
        for _ in 0..50 {
            if !s.is_connected() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(!s.is_connected());
    }
}
