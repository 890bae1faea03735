//! Ticker → broker contract resolution.
//!
//! Continuous chart symbols (`NQ1!`, `NQMAIN`, bare roots) are first mapped to
//! the active quarterly contract, rolling early 11 days before the third Friday
//! of the expiry month. Resolved ids are cached per symbol for the process lifetime.

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc, Weekday};
use dashmap::DashMap;
use tracing::{info, warn};

use super::InstrumentKey;
use crate::error::{Result, TrailgateError};
use crate::exchange::ContractLookup;

const ROLL_DAYS_BEFORE_EXPIRY: i64 = 11;

fn month_code(month: u32) -> char {
    match month {
        3 => 'H',
        6 => 'M',
        9 => 'U',
        _ => 'Z',
    }
}

fn quarter_month(month: u32) -> u32 {
    ((month - 1) / 3 + 1) * 3
}

fn third_friday(year: i32, month: u32) -> Option<NaiveDate> {
    let first = NaiveDate::from_ymd_opt(year, month, 1)?;
    let offset = (7 + Weekday::Fri.num_days_from_monday() as i64
        - first.weekday().num_days_from_monday() as i64)
        % 7;
    Some(first + Duration::days(offset + 14))
}

/// Map a root (e.g. "NQ") to its active quarterly symbol (e.g. "NQZ5").
pub fn map_continuous_to_active_quarter(root: &str, now: DateTime<Utc>) -> String {
    let today = now.date_naive();
    let mut year = today.year();
    let mut month = quarter_month(today.month());

    let rolled = third_friday(year, month)
        .map(|expiry| today >= expiry - Duration::days(ROLL_DAYS_BEFORE_EXPIRY))
        .unwrap_or(false);
    if rolled {
        if month == 12 {
            month = 3;
            year += 1;
        } else {
            month += 3;
        }
    }

    format!("{}{}{}", root, month_code(month), year.rem_euclid(10))
}

/// Root symbol when `ticker` names a continuous contract.
pub fn continuous_root(ticker: &str) -> Option<String> {
    let symbol = ticker.trim().to_ascii_uppercase();
    if let Some(root) = symbol.strip_suffix("1!") {
        return (!root.is_empty()).then(|| root.to_string());
    }
    if let Some(root) = symbol.strip_suffix("MAIN") {
        return (!root.is_empty()).then(|| root.to_string());
    }
    let bare_root = (1..=3).contains(&symbol.len()) && symbol.chars().all(|c| c.is_ascii_alphabetic());
    bare_root.then_some(symbol)
}

/// Process-scoped contract id cache
pub struct ContractDirectory {
    default_symbol: String,
    cache: DashMap<String, InstrumentKey>,
}

impl ContractDirectory {
    pub fn new(default_symbol: impl Into<String>) -> Self {
        Self {
            default_symbol: default_symbol.into().to_ascii_uppercase(),
            cache: DashMap::new(),
        }
    }

    pub fn default_symbol(&self) -> &str {
        &self.default_symbol
    }

    /// Resolve an exact broker symbol, consulting the cache first.
    pub async fn contract_id(
        &self,
        symbol: &str,
        lookup: &dyn ContractLookup,
    ) -> Result<InstrumentKey> {
        let symbol = symbol.trim().to_ascii_uppercase();
        if let Some(hit) = self.cache.get(&symbol) {
            return Ok(hit.clone());
        }

        let key = lookup.search_contract(&symbol).await?;
        info!("Contract {} -> {}", symbol, key);
        self.cache.insert(symbol, key.clone());
        Ok(key)
    }

    /// Resolve a chart ticker, mapping continuous symbols and falling back to
    /// the default symbol when the broker does not know the ticker.
    pub async fn resolve_ticker(
        &self,
        ticker: &str,
        lookup: &dyn ContractLookup,
        now: DateTime<Utc>,
    ) -> Result<InstrumentKey> {
        let mut symbol = ticker.trim().to_ascii_uppercase();
        if symbol.is_empty() {
            return Err(TrailgateError::ContractResolution("empty ticker".into()));
        }
        if let Some(root) = continuous_root(&symbol) {
            let mapped = map_continuous_to_active_quarter(&root, now);
            info!("Mapped {} -> {} (active)", symbol, mapped);
            symbol = mapped;
        }

        match self.contract_id(&symbol, lookup).await {
            Ok(key) => Ok(key),
            Err(e) => {
                warn!(
                    "Could not resolve ticker '{}' ({}); falling back to {}",
                    symbol, e, self.default_symbol
                );
                self.contract_id(&self.default_symbol, lookup)
                    .await
                    .map_err(|e| {
                        TrailgateError::ContractResolution(format!(
                            "ticker '{}' and fallback '{}' both unresolved: {}",
                            symbol, self.default_symbol, e
                        ))
                    })
            }
        }
    }

    pub fn cached(&self) -> usize {
        self.cache.len()
    }
}
