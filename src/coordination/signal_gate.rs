//! Per-instrument signal serialization.
//!
//! Every entry or close for an instrument runs while holding that instrument's
//! [`GateGuard`]. The close holdoff and last-close timestamp live inside the
//! lock, so a close always publishes its holdoff before the next signal for the
//! same instrument can look at it.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::info;

use crate::domain::{InstrumentKey, TradingSession};

/// Why a signal was dropped without touching the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateRejection {
    /// Entry timestamp is not newer than the last recorded close
    StaleVsClose { entry_ts_ms: i64, last_close_ts_ms: i64 },
    /// A close happened less than the holdoff ago
    InCloseHoldoff { remaining: Duration },
    /// Inside the daily pause
    NoTradeWindow,
}

impl GateRejection {
    pub fn reason(&self) -> &'static str {
        match self {
            GateRejection::StaleVsClose { .. } => "stale_vs_close_ts",
            GateRejection::InCloseHoldoff { .. } => "in_close_holdoff",
            GateRejection::NoTradeWindow => "no_trade_window",
        }
    }
}

impl fmt::Display for GateRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GateRejection::StaleVsClose {
                entry_ts_ms,
                last_close_ts_ms,
            } => write!(
                f,
                "entry ts {} <= last close ts {}",
                entry_ts_ms, last_close_ts_ms
            ),
            GateRejection::InCloseHoldoff { remaining } => {
                write!(f, "in close holdoff for another {:?}", remaining)
            }
            GateRejection::NoTradeWindow => write!(f, "inside the daily no-trade window"),
        }
    }
}

#[derive(Debug, Default)]
struct HoldoffState {
    holdoff_until: Option<Instant>,
    last_close_ts_ms: Option<i64>,
}

pub struct SignalGate {
    close_holdoff: Duration,
    session: TradingSession,
    locks: DashMap<InstrumentKey, Arc<Mutex<HoldoffState>>>,
}

impl SignalGate {
    pub fn new(close_holdoff: Duration, session: TradingSession) -> Self {
        Self {
            close_holdoff,
            session,
            locks: DashMap::new(),
        }
    }

    /// Wait for exclusive access to `instrument`.
    pub async fn acquire(&self, instrument: &InstrumentKey) -> GateGuard {
        let lock = self
            .locks
            .entry(instrument.clone())
            .or_insert_with(|| Arc::new(Mutex::new(HoldoffState::default())))
            .clone();
        GateGuard {
            instrument: instrument.clone(),
            close_holdoff: self.close_holdoff,
            state: lock.lock_owned().await,
        }
    }

    pub fn check_session(&self, now: DateTime<Utc>) -> Result<(), GateRejection> {
        if self.session.is_paused(now) {
            Err(GateRejection::NoTradeWindow)
        } else {
            Ok(())
        }
    }

    pub fn session(&self) -> &TradingSession {
        &self.session
    }
}

/// Exclusive hold on one instrument for the duration of a signal.
pub struct GateGuard {
    instrument: InstrumentKey,
    close_holdoff: Duration,
    state: OwnedMutexGuard<HoldoffState>,
}

impl GateGuard {
    pub fn instrument(&self) -> &InstrumentKey {
        &self.instrument
    }

    pub fn check_entry(&self, signal_ts_ms: Option<i64>) -> Result<(), GateRejection> {
        if let (Some(entry_ts_ms), Some(last_close_ts_ms)) =
            (signal_ts_ms, self.state.last_close_ts_ms)
        {
            if entry_ts_ms <= last_close_ts_ms {
                return Err(GateRejection::StaleVsClose {
                    entry_ts_ms,
                    last_close_ts_ms,
                });
            }
        }

        if let Some(until) = self.state.holdoff_until {
            let now = Instant::now();
            if now < until {
                return Err(GateRejection::InCloseHoldoff {
                    remaining: until - now,
                });
            }
        }
        Ok(())
    }

    pub fn record_close(&mut self, signal_ts_ms: Option<i64>) {
        let until = Instant::now() + self.close_holdoff;
        self.state.holdoff_until = Some(until);
        info!(
            "Close holdoff: {} for {:?}",
            self.instrument, self.close_holdoff
        );

        if let Some(ts) = signal_ts_ms {
            let latest = self.state.last_close_ts_ms.map_or(ts, |prev| prev.max(ts));
            self.state.last_close_ts_ms = Some(latest);
            info!("Recorded last close ts for {}: {}", self.instrument, latest);
        }
    }

    pub fn last_close_ts_ms(&self) -> Option<i64> {
        self.state.last_close_ts_ms
    }
}
