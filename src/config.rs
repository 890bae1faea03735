use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub broker: BrokerConfig,
    #[serde(default)]
    pub market: MarketConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub gate: GateConfig,
    #[serde(default)]
    pub watcher: WatcherConfig,
    #[serde(default)]
    pub guard: GuardConfig,
    #[serde(default)]
    pub close: CloseConfig,
    #[serde(default)]
    pub flip: FlipConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// REST API base (e.g. "https://api.topstepx.com")
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// Market hub WebSocket endpoint
    #[serde(default = "default_hub_url")]
    pub hub_url: String,
    /// Login user name
    #[serde(default)]
    pub username: String,
    /// API key used for token login
    #[serde(default)]
    pub api_key: String,
    /// Account to trade; first active account when unset
    #[serde(default)]
    pub account_name: Option<String>,
    /// Connect timeout for REST calls in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Total request timeout for REST calls in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Retries for idempotent reads on connect errors / 5xx
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base backoff between retries in milliseconds
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

fn default_api_base() -> String {
    "https://api.topstepx.com".to_string()
}

fn default_hub_url() -> String {
    "wss://rtc.topstepx.com/hubs/market".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    400
}

impl BrokerConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MarketConfig {
    /// Contract symbol used for bootstrap and as lookup fallback (e.g. "MNQZ5")
    #[serde(default = "default_contract_symbol")]
    pub default_contract_symbol: String,
    /// Minimum price increment
    #[serde(default = "default_tick_size")]
    pub tick_size: Decimal,
}

fn default_contract_symbol() -> String {
    "MNQZ5".to_string()
}

fn default_tick_size() -> Decimal {
    dec!(0.25)
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            default_contract_symbol: default_contract_symbol(),
            tick_size: default_tick_size(),
        }
    }
}

/// Daily no-trade window
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// IANA zone of the trading venue
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// Local hour the pause starts (inclusive)
    #[serde(default = "default_pause_start_hour")]
    pub pause_start_hour: u32,
    /// Local hour the pause ends (exclusive)
    #[serde(default = "default_pause_end_hour")]
    pub pause_end_hour: u32,
}

fn default_timezone() -> String {
    "America/New_York".to_string()
}

fn default_pause_start_hour() -> u32 {
    16
}

fn default_pause_end_hour() -> u32 {
    18
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
            pause_start_hour: default_pause_start_hour(),
            pause_end_hour: default_pause_end_hour(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GateConfig {
    /// Entries are rejected for this long after a close
    #[serde(default = "default_close_holdoff_ms")]
    pub close_holdoff_ms: u64,
}

fn default_close_holdoff_ms() -> u64 {
    1_500
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            close_holdoff_ms: default_close_holdoff_ms(),
        }
    }
}

impl GateConfig {
    pub fn close_holdoff(&self) -> Duration {
        Duration::from_millis(self.close_holdoff_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WatcherConfig {
    /// Minimum spacing between open-order polls
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// First backoff after a rate-limit response
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Backoff ceiling
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Fill confirmation window after the trigger is touched
    #[serde(default = "default_confirm_window_ms")]
    pub confirm_window_ms: u64,
    /// Poll spacing inside the confirmation window
    #[serde(default = "default_confirm_poll_ms")]
    pub confirm_poll_ms: u64,
    /// Hard ceiling on watcher lifetime
    #[serde(default = "default_max_lifetime_secs")]
    pub max_lifetime_secs: u64,
    /// Rounding correction applied toward the position when pricing the trailing stop
    #[serde(default = "default_trail_correction_ticks")]
    pub trail_correction_ticks: u32,
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_backoff_base_ms() -> u64 {
    3_000
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

fn default_confirm_window_ms() -> u64 {
    2_000
}

fn default_confirm_poll_ms() -> u64 {
    100
}

fn default_max_lifetime_secs() -> u64 {
    8 * 60 * 60
}

fn default_trail_correction_ticks() -> u32 {
    1
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            confirm_window_ms: default_confirm_window_ms(),
            confirm_poll_ms: default_confirm_poll_ms(),
            max_lifetime_secs: default_max_lifetime_secs(),
            trail_correction_ticks: default_trail_correction_ticks(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GuardConfig {
    /// Interval between guard cycles
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
    /// Connected streams without ticks for this long are restarted
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
}

fn default_check_interval_secs() -> u64 {
    5
}

fn default_stale_after_secs() -> u64 {
    30
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval_secs(),
            stale_after_secs: default_stale_after_secs(),
        }
    }
}

/// Timings of the close path
#[derive(Debug, Clone, Deserialize)]
pub struct CloseConfig {
    #[serde(default = "default_flat_timeout_ms")]
    pub flat_timeout_ms: u64,
    #[serde(default = "default_flat_poll_ms")]
    pub flat_poll_ms: u64,
    #[serde(default = "default_quarantine_ms")]
    pub quarantine_ms: u64,
    #[serde(default = "default_quarantine_poll_ms")]
    pub quarantine_poll_ms: u64,
}

fn default_flat_timeout_ms() -> u64 {
    3_000
}

fn default_flat_poll_ms() -> u64 {
    200
}

fn default_quarantine_ms() -> u64 {
    2_500
}

fn default_quarantine_poll_ms() -> u64 {
    200
}

impl Default for CloseConfig {
    fn default() -> Self {
        Self {
            flat_timeout_ms: default_flat_timeout_ms(),
            flat_poll_ms: default_flat_poll_ms(),
            quarantine_ms: default_quarantine_ms(),
            quarantine_poll_ms: default_quarantine_poll_ms(),
        }
    }
}

/// Reversal handling; disabled when `reversal_size` is unset
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FlipConfig {
    #[serde(default)]
    pub reversal_size: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
}

fn default_refresh_interval_secs() -> u64 {
    2 * 60 * 60
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: default_refresh_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Environment-specific overrides (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("TRAILGATE_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // TRAILGATE__BROKER__API_KEY, TRAILGATE__GATE__CLOSE_HOLDOFF_MS, ...
            .add_source(
                Environment::with_prefix("TRAILGATE")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.broker.username.trim().is_empty() {
            errors.push("broker.username is not configured".to_string());
        }
        if self.broker.api_key.trim().is_empty() {
            errors.push("broker.api_key is not configured".to_string());
        }
        if self.market.tick_size <= Decimal::ZERO {
            errors.push("market.tick_size must be positive".to_string());
        }
        if self.session.pause_start_hour > 23 || self.session.pause_end_hour > 24 {
            errors.push("session pause hours must be within a day".to_string());
        }
        if self.session.timezone.parse::<chrono_tz::Tz>().is_err() {
            errors.push(format!("unknown session.timezone '{}'", self.session.timezone));
        }
        if self.watcher.confirm_poll_ms == 0 {
            errors.push("watcher.confirm_poll_ms must be positive".to_string());
        }
        if let Some(size) = self.flip.reversal_size {
            if size < 2 {
                errors.push("flip.reversal_size must be at least 2".to_string());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
