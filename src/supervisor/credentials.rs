//! Session token storage and periodic refresh.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{error, info};
use zeroize::Zeroizing;

use crate::error::Result;
use crate::services::QuoteStreams;

/// Something that can mint a fresh session token
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn login(&self) -> Result<String>;
}

/// Current bearer token, shared by the REST client and the market hub.
///
/// The token is zeroed in memory when replaced or dropped.
#[derive(Default)]
pub struct CredentialStore {
    token: RwLock<Zeroizing<String>>,
}

impl CredentialStore {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: RwLock::new(Zeroizing::new(token.into())),
        }
    }

    pub async fn token(&self) -> String {
        self.token.read().await.to_string()
    }

    pub async fn has_token(&self) -> bool {
        !self.token.read().await.is_empty()
    }

    pub async fn set_token(&self, token: impl Into<String>) {
        *self.token.write().await = Zeroizing::new(token.into());
    }
}

/// Background loop that re-authenticates every `interval`.
pub struct CredentialRefresher {
    store: Arc<CredentialStore>,
    auth: Arc<dyn Authenticator>,
    streams: Option<Arc<QuoteStreams>>,
    interval: Duration,
    running: Arc<AtomicBool>,
}

impl CredentialRefresher {
    pub fn new(
        store: Arc<CredentialStore>,
        auth: Arc<dyn Authenticator>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            auth,
            streams: None,
            interval,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Also push refreshed tokens into every quote stream.
    pub fn with_streams(mut self, streams: Arc<QuoteStreams>) -> Self {
        self.streams = Some(streams);
        self
    }

    /// One refresh; failures leave the current token in place.
    pub async fn refresh_once(&self) -> Result<()> {
        let token = self.auth.login().await?;
        self.store.set_token(token.as_str()).await;
        if let Some(streams) = &self.streams {
            streams.set_token(&token).await;
        }
        info!("Token refreshed");
        Ok(())
    }

    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);
        info!("Credential refresher started ({:?})", self.interval);

        tokio::spawn(async move {
            while self.running.load(Ordering::SeqCst) {
                tokio::time::sleep(self.interval).await;
                if !self.running.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(e) = self.refresh_once().await {
                    error!("Token refresh failed: {}", e);
                }
            }
            info!("Credential refresher stopped");
        })
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}
