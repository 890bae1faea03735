//! Quote stream supervision
//!
//! Keeps the market-data connections alive outside the daily pause and shut
//! during it. A connection that stays open but delivers no trades for the
//! stale window is treated as a silent subscription failure and cycled.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::credentials::CredentialStore;
use crate::config::GuardConfig;
use crate::domain::{InstrumentKey, TradingSession};
use crate::services::QuoteStreams;

/// What one cycle did to one stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardAction {
    /// Connected and fresh
    Healthy,
    /// Closed for the no-trade window
    Stopped,
    Started,
    StartFailed(String),
    /// Cycled after going quiet
    Restarted,
    RestartFailed(String),
}

impl std::fmt::Display for GuardAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GuardAction::Healthy => write!(f, "healthy"),
            GuardAction::Stopped => write!(f, "stopped"),
            GuardAction::Started => write!(f, "started"),
            GuardAction::StartFailed(e) => write!(f, "start failed: {}", e),
            GuardAction::Restarted => write!(f, "restarted"),
            GuardAction::RestartFailed(e) => write!(f, "restart failed: {}", e),
        }
    }
}

pub struct ConnectionGuard {
    streams: Arc<QuoteStreams>,
    credentials: Arc<CredentialStore>,
    session: TradingSession,
    active_instrument: InstrumentKey,
    check_interval: Duration,
    stale_after: Duration,
    running: Arc<AtomicBool>,
}

impl ConnectionGuard {
    pub fn new(
        streams: Arc<QuoteStreams>,
        credentials: Arc<CredentialStore>,
        session: TradingSession,
        active_instrument: InstrumentKey,
        config: &GuardConfig,
    ) -> Self {
        Self {
            streams,
            credentials,
            session,
            active_instrument,
            check_interval: Duration::from_secs(config.check_interval_secs),
            stale_after: Duration::from_secs(config.stale_after_secs),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// One supervision pass over every known stream.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> Vec<(InstrumentKey, GuardAction)> {
        let mut actions = Vec::new();

        if self.session.is_paused(now) {
            for stream in self.streams.all() {
                if stream.is_connected() {
                    info!("No-trade window: stopping quote stream for {}", stream.instrument());
                    stream.stop().await;
                    actions.push((stream.instrument().clone(), GuardAction::Stopped));
                }
            }
            return actions;
        }

        self.streams.get_or_create(&self.active_instrument).await;
        if self.credentials.has_token().await {
            let token = self.credentials.token().await;
            self.streams.set_token(&token).await;
        }

        for stream in self.streams.all() {
            let instrument = stream.instrument().clone();

            if !stream.is_connected() {
                let action = match stream.start().await {
                    Ok(()) => GuardAction::Started,
                    Err(e) => {
                        error!("Guard: start failed for {}: {}", instrument, e);
                        GuardAction::StartFailed(e.to_string())
                    }
                };
                actions.push((instrument, action));
                continue;
            }

            let age = stream.last_tick_age().await;
            if age.map_or(false, |age| age >= self.stale_after) {
                warn!(
                    "No ticks for {:?} on {}; forcing resubscribe",
                    age.unwrap_or_default(),
                    instrument
                );
                stream.stop().await;
                let action = match stream.start().await {
                    Ok(()) => GuardAction::Restarted,
                    Err(e) => {
                        error!("Guard: restart failed for {}: {}", instrument, e);
                        GuardAction::RestartFailed(e.to_string())
                    }
                };
                actions.push((instrument, action));
            } else {
                actions.push((instrument, GuardAction::Healthy));
            }
        }

        actions
    }

    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);
        info!(
            "Connection guard started (interval {:?}, stale after {:?})",
            self.check_interval, self.stale_after
        );

        tokio::spawn(async move {
            while self.running.load(Ordering::SeqCst) {
                for (instrument, action) in self.run_cycle(Utc::now()).await {
                    if action != GuardAction::Healthy {
                        debug!("Guard: {} -> {}", instrument, action);
                    }
                }
                tokio::time::sleep(self.check_interval).await;
            }
            info!("Connection guard stopped");
        })
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}
