use thiserror::Error;

/// Main error type for the execution engine
#[derive(Error, Debug)]
pub enum TrailgateError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Network errors
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Broker error: {0}")]
    Broker(String),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Order submission errors
    #[error("Order submission timed out (outcome unknown): {0}")]
    SubmissionTimeout(String),

    #[error("Order submission unconfirmed: {0}")]
    SubmissionUnconfirmed(String),

    #[error("Order rejected: {0}")]
    OrderRejected(String),

    // Signal errors
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Contract lookup failed: {0}")]
    ContractResolution(String),

    // Market data errors
    #[error("Market data unavailable: {0}")]
    MarketDataUnavailable(String),

    // Authentication errors
    #[error("Authentication error: {0}")]
    Auth(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl TrailgateError {
    /// True for broker throttling responses (HTTP 429).
    pub fn is_rate_limited(&self) -> bool {
        match self {
            TrailgateError::RateLimited(_) => true,
            TrailgateError::Http(e) => e.status().map(|s| s.as_u16() == 429).unwrap_or(false),
            _ => false,
        }
    }

    /// True when a submission may or may not have reached the broker.
    pub fn is_ambiguous_timeout(&self) -> bool {
        match self {
            TrailgateError::SubmissionTimeout(_) => true,
            TrailgateError::Http(e) => e.is_timeout(),
            _ => false,
        }
    }
}

/// Result type alias for TrailgateError
pub type Result<T> = std::result::Result<T, TrailgateError>;
