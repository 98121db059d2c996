use thiserror::Error;

/// Main error type for the trading bot
#[derive(Error, Debug)]
pub enum ProphetError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    ConfigValidation(String),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    // Network errors
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Market data errors
    #[error("Market data unavailable: {0}")]
    MarketDataUnavailable(String),

    #[error("Invalid market data: {0}")]
    InvalidMarketData(String),

    #[error("Market not found: {0}")]
    MarketNotFound(String),

    // Order execution errors
    #[error("Order submission failed: {0}")]
    OrderSubmission(String),

    #[error("Order timeout: {0}")]
    OrderTimeout(String),

    #[error("Order rejected: {0}")]
    OrderRejected(String),

    #[error("Insufficient liquidity: {0}")]
    InsufficientLiquidity(String),

    // State machine errors
    #[error("Invalid state transition: from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    // Forecast errors
    #[error("Forecast budget exhausted: spent ${spent}, limit ${limit}")]
    ForecastBudgetExhausted {
        spent: rust_decimal::Decimal,
        limit: rust_decimal::Decimal,
    },

    #[error("Unparseable forecast response: {0}")]
    ForecastUnparseable(String),

    // Risk management errors
    #[error("Risk limit exceeded: {0}")]
    RiskLimitExceeded(String),

    #[error("Daily loss limit reached: {0}")]
    DailyLossLimit(String),

    // Partial execution (multi-leg)
    #[error("Partial group fill: {filled} of {requested} legs filled")]
    PartialGroupFill { filled: usize, requested: usize },

    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

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

impl ProphetError {
    /// Transient failures are retried at the gateway boundary and then
    /// surfaced to the calling stage as a skip-this-cycle signal.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProphetError::RateLimited(_) | ProphetError::Timeout(_) | ProphetError::Http(_)
        )
    }

    /// Fatal failures stop the affected stage entirely rather than being
    /// swallowed by the per-cycle error isolation.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProphetError::Database(_) | ProphetError::Migration(_) | ProphetError::Auth(_)
        )
    }
}

/// Result type alias for ProphetError
pub type Result<T> = std::result::Result<T, ProphetError>;

/// Specific error types for order execution
#[derive(Error, Debug, Clone)]
pub enum OrderError {
    #[error("Order not found: {order_id}")]
    NotFound { order_id: String },

    #[error("Order already in terminal state")]
    AlreadyTerminal,

    #[error("Fill exceeds requested quantity: requested {requested}, filled {filled}")]
    Overfill { requested: u64, filled: u64 },

    #[error("Partial fill: requested {requested}, filled {filled}")]
    PartialFill { requested: u64, filled: u64 },

    #[error("Timeout after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("Max retries exceeded: {attempts}")]
    MaxRetriesExceeded { attempts: u8 },
}

/// Specific error types for risk management
#[derive(Error, Debug, Clone)]
pub enum RiskError {
    #[error("Max exposure exceeded: limit ${limit}, requested ${requested}")]
    MaxExposureExceeded {
        limit: rust_decimal::Decimal,
        requested: rust_decimal::Decimal,
    },

    #[error("Bucket capital exhausted: bucket {bucket}, remaining ${remaining}")]
    BucketExhausted {
        bucket: String,
        remaining: rust_decimal::Decimal,
    },

    #[error("Cash reserve floor: available ${available}, floor ${floor}")]
    CashReserveFloor {
        available: rust_decimal::Decimal,
        floor: rust_decimal::Decimal,
    },

    #[error("Risk gate breached: {gate} at {value:.3} (limit {limit:.3})")]
    GateBreached {
        gate: &'static str,
        value: f64,
        limit: f64,
    },

    #[error("Daily loss limit: current ${current}, limit ${limit}")]
    DailyLossLimit {
        current: rust_decimal::Decimal,
        limit: rust_decimal::Decimal,
    },

    #[error("Trading halted: {reason}")]
    TradingHalted { reason: String },
}

impl From<OrderError> for ProphetError {
    fn from(err: OrderError) -> Self {
        ProphetError::OrderSubmission(err.to_string())
    }
}

impl From<RiskError> for ProphetError {
    fn from(err: RiskError) -> Self {
        ProphetError::RiskLimitExceeded(err.to_string())
    }
}
