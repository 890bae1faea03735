use dashmap::DashMap;
use futures::future::join_all;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use super::CancelToken;
use crate::domain::InstrumentKey;
use crate::services::{ListenerId, QuoteStream};

/// Non-owning reference to a running trigger watcher
#[derive(Clone)]
pub struct WatcherHandle {
    pub id: Uuid,
    pub tag: String,
    pub cancel: CancelToken,
    pub stream: Arc<QuoteStream>,
    pub listener_id: ListenerId,
}

impl WatcherHandle {
    /// Signal cancellation and stop tick delivery to the watcher.
    pub async fn detach(&self) {
        self.cancel.cancel();
        self.stream.remove_listener(self.listener_id).await;
    }
}

/// Active watchers per instrument, for bulk cancellation by the close path
#[derive(Default)]
pub struct WatcherRegistry {
    active: DashMap<InstrumentKey, Vec<WatcherHandle>>,
}

impl WatcherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, instrument: &InstrumentKey, handle: WatcherHandle) {
        self.active
            .entry(instrument.clone())
            .or_default()
            .push(handle);
    }

    /// Drop one watcher; false when it was already gone.
    pub fn remove(&self, instrument: &InstrumentKey, watcher_id: Uuid) -> bool {
        let mut removed = false;
        if let Some(mut handles) = self.active.get_mut(instrument) {
            let before = handles.len();
            handles.retain(|h| h.id != watcher_id);
            removed = handles.len() != before;
        }
        self.active
            .remove_if(instrument, |_, handles| handles.is_empty());
        removed
    }

    pub fn active_count(&self, instrument: &InstrumentKey) -> usize {
        self.active.get(instrument).map_or(0, |h| h.len())
    }

    pub fn total_active(&self) -> usize {
        self.active.iter().map(|e| e.value().len()).sum()
    }

    /// Cancel and detach every watcher under `instrument`.
    pub async fn cancel_all(&self, instrument: &InstrumentKey) -> usize {
        let handles = self
            .active
            .remove(instrument)
            .map(|(_, handles)| handles)
            .unwrap_or_default();

        join_all(handles.iter().map(|h| h.detach())).await;
        info!(
            "Canceled {} trailing watcher(s) for {}",
            handles.len(),
            instrument
        );
        handles.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Tick, TradingSession};
    use crate::error::Result;
    use crate::services::{HubConnection, MarketHub};
    use async_trait::async_trait;

    struct NoHub;

    #[async_trait]
    impl MarketHub for NoHub {
        async fn connect(&self, _instrument: &InstrumentKey, _token: &str) -> Result<HubConnection> {
            let (_tx, rx) = tokio::sync::mpsc::unbounded_channel();
            Ok(HubConnection::new(rx, None))
        }
    }

    async fn handle(stream: &Arc<QuoteStream>) -> WatcherHandle {
        let listener_id = stream
            .add_listener(Arc::new(|_: &Tick| -> Result<()> { Ok(()) }))
            .await;
        WatcherHandle {
            id: Uuid::new_v4(),
            tag: "t".into(),
            cancel: CancelToken::new(),
            stream: stream.clone(),
            listener_id,
        }
    }

    #[tokio::test]
    async fn test_cancel_all_detaches_and_clears() {
        let key = InstrumentKey::from("X");
        let stream = Arc::new(QuoteStream::new(
            key.clone(),
            Arc::new(NoHub),
            TradingSession::always_open(),
            "tok",
        ));
        let registry = WatcherRegistry::new();
        let a = handle(&stream).await;
        let b = handle(&stream).await;
        let token = a.cancel.clone();
        registry.register(&key, a);
        registry.register(&key, b);
        assert_eq!(registry.active_count(&key), 2);

        assert_eq!(registry.cancel_all(&key).await, 2);
        assert_eq!(registry.active_count(&key), 0);
        assert_eq!(stream.listener_count().await, 0);
        assert!(token.is_cancelled());
        assert_eq!(registry.cancel_all(&key).await, 0);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let key = InstrumentKey::from("X");
        let stream = Arc::new(QuoteStream::new(
            key.clone(),
            Arc::new(NoHub),
            TradingSession::always_open(),
            "tok",
        ));
        let registry = WatcherRegistry::new();
        let h = handle(&stream).await;
        let id = h.id;
        registry.register(&key, h);

        assert!(registry.remove(&key, id));
        assert!(!registry.remove(&key, id));
        assert_eq!(registry.total_active(), 0);
    }
}
