//! Graceful shutdown
//!
//! Stops signal intake first, then the background supervisors, then cancels
//! live watchers and closes the market-data connections. Each step runs under
//! its own timeout so a stuck broker call cannot hold the process open.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// SIGTERM / SIGINT
    Graceful,
    /// SIGQUIT: halve the step timeouts
    Urgent,
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownSignal::Graceful => write!(f, "graceful"),
            ShutdownSignal::Urgent => write!(f, "urgent"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Time allowed for stopping the guard and credential refresher
    pub background_timeout_secs: u64,
    /// Time allowed for canceling watchers and closing streams
    pub drain_timeout_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            background_timeout_secs: 5,
            drain_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    Running,
    StoppingBackground,
    DrainingWatchers,
    Complete,
}

impl std::fmt::Display for ShutdownPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownPhase::Running => write!(f, "running"),
            ShutdownPhase::StoppingBackground => write!(f, "stopping_background"),
            ShutdownPhase::DrainingWatchers => write!(f, "draining_watchers"),
            ShutdownPhase::Complete => write!(f, "complete"),
        }
    }
}

pub struct GracefulShutdown {
    config: ShutdownConfig,
    requested: AtomicBool,
    urgent: AtomicBool,
    phase: Arc<watch::Sender<ShutdownPhase>>,
    phase_rx: watch::Receiver<ShutdownPhase>,
    signal_tx: broadcast::Sender<ShutdownSignal>,
}

impl GracefulShutdown {
    pub fn new(config: ShutdownConfig) -> Self {
        let (phase_tx, phase_rx) = watch::channel(ShutdownPhase::Running);
        let (signal_tx, _) = broadcast::channel(4);
        Self {
            config,
            requested: AtomicBool::new(false),
            urgent: AtomicBool::new(false),
            phase: Arc::new(phase_tx),
            phase_rx,
            signal_tx,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ShutdownConfig::default())
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    pub fn current_phase(&self) -> ShutdownPhase {
        *self.phase_rx.borrow()
    }

    pub fn request_shutdown(&self, signal: ShutdownSignal) {
        if signal == ShutdownSignal::Urgent {
            self.urgent.store(true, Ordering::SeqCst);
        }
        if self.requested.swap(true, Ordering::SeqCst) {
            warn!("Shutdown already requested, ignoring duplicate signal: {}", signal);
            return;
        }
        info!("Shutdown requested: {}", signal);
        let _ = self.signal_tx.send(signal);
    }

    pub fn token(&self) -> ShutdownToken {
        ShutdownToken {
            requested: self.is_shutdown_requested(),
            signal_rx: self.signal_tx.subscribe(),
        }
    }

    fn set_phase(&self, phase: ShutdownPhase) {
        info!("Shutdown phase: {}", phase);
        let _ = self.phase.send(phase);
    }

    fn step_timeout(&self, secs: u64) -> Duration {
        let full = Duration::from_secs(secs);
        if self.urgent.load(Ordering::SeqCst) {
            full / 2
        } else {
            full
        }
    }

    /// Run the shutdown sequence once intake has stopped.
    pub async fn execute<B, D>(&self, stop_background: B, drain_watchers: D)
    where
        B: Future<Output = ()>,
        D: Future<Output = ()>,
    {
        self.set_phase(ShutdownPhase::StoppingBackground);
        let limit = self.step_timeout(self.config.background_timeout_secs);
        if tokio::time::timeout(limit, stop_background).await.is_err() {
            error!("Background tasks did not stop within {:?}", limit);
        }

        self.set_phase(ShutdownPhase::DrainingWatchers);
        let limit = self.step_timeout(self.config.drain_timeout_secs);
        if tokio::time::timeout(limit, drain_watchers).await.is_err() {
            error!("Watcher drain did not finish within {:?}", limit);
        }

        self.set_phase(ShutdownPhase::Complete);
    }
}

/// Cloneable view used by tasks that only need to wait for shutdown
pub struct ShutdownToken {
    requested: bool,
    signal_rx: broadcast::Receiver<ShutdownSignal>,
}

impl ShutdownToken {
    pub async fn wait_for_shutdown(&mut self) -> ShutdownSignal {
        if self.requested {
            return ShutdownSignal::Graceful;
        }
        match self.signal_rx.recv().await {
            Ok(signal) => signal,
            Err(_) => ShutdownSignal::Graceful,
        }
    }
}

/// Forward OS signals into `shutdown`.
pub fn install_signal_handlers(shutdown: Arc<GracefulShutdown>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        for (kind, name, level) in [
            (SignalKind::terminate(), "SIGTERM", ShutdownSignal::Graceful),
            (SignalKind::interrupt(), "SIGINT", ShutdownSignal::Graceful),
            (SignalKind::quit(), "SIGQUIT", ShutdownSignal::Urgent),
        ] {
            let shutdown = Arc::clone(&shutdown);
            tokio::spawn(async move {
                let mut stream = match signal(kind) {
                    Ok(stream) => stream,
                    Err(e) => {
                        error!("Failed to install {} handler: {}", name, e);
                        return;
                    }
                };
                stream.recv().await;
                info!("Received {}", name);
                shutdown.request_shutdown(level);
            });
        }
    }

    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Received Ctrl+C");
                    shutdown.request_shutdown(ShutdownSignal::Graceful);
                }
                Err(e) => error!("Failed to install Ctrl+C handler: {}", e),
            }
        });
    }
}
