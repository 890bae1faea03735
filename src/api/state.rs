use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;

use crate::domain::ContractDirectory;
use crate::exchange::ContractLookup;
use crate::services::Orchestrator;

/// Shared state for the webhook handlers
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,

    /// Ticker -> contract id cache
    pub contracts: Arc<ContractDirectory>,

    pub lookup: Arc<dyn ContractLookup>,

    pub start_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        contracts: Arc<ContractDirectory>,
        lookup: Arc<dyn ContractLookup>,
    ) -> Self {
        Self {
            orchestrator,
            contracts,
            lookup,
            start_time: Utc::now(),
        }
    }

    pub fn tick_size(&self) -> Decimal {
        self.orchestrator.settings().tick_size
    }

    pub fn uptime_seconds(&self) -> i64 {
        (Utc::now() - self.start_time).num_seconds().max(0)
    }
}
