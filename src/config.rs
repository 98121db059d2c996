use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::path::Path;

/// Main configuration structure
///
/// One validated struct, passed by reference into each stage at construction.
/// Stages never read ambient global state.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub exchange: ExchangeConfig,
    pub forecast: ForecastConfig,
    pub trading: TradingConfig,
    pub arbitrage: ArbitrageConfig,
    pub execution: ExecutionConfig,
    pub risk: RiskConfig,
    pub allocation: AllocationConfig,
    pub fees: FeesConfig,
    pub schedule: ScheduleConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    pub dry_run: DryRunConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeConfig {
    /// REST endpoint for the demo (paper) environment
    pub demo_base_url: String,
    /// REST endpoint for the live environment
    pub live_base_url: String,
    /// API key id (demo credentials)
    #[serde(default)]
    pub api_key_id: String,
    /// API secret (demo credentials)
    #[serde(default)]
    pub api_secret: String,
    /// API key id (live credentials)
    #[serde(default)]
    pub live_api_key_id: String,
    /// API secret (live credentials)
    #[serde(default)]
    pub live_api_secret: String,
    /// Aggregate request rate the exchange tolerates (requests/second)
    pub rate_limit_per_sec: f64,
    /// Per-request timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Bounded retry count for transient failures
    #[serde(default = "default_max_retries")]
    pub max_retries: u8,
    /// Page size for market listing
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_max_retries() -> u8 {
    3
}

fn default_page_size() -> u32 {
    100
}

impl ExchangeConfig {
    /// Select base URL for the live/demo credential-set switch
    pub fn base_url(&self, live: bool) -> &str {
        if live {
            &self.live_base_url
        } else {
            &self.demo_base_url
        }
    }

    /// Select credentials for the live/demo credential-set switch
    pub fn credentials(&self, live: bool) -> (String, String) {
        if live {
            (self.live_api_key_id.clone(), self.live_api_secret.clone())
        } else {
            (self.api_key_id.clone(), self.api_secret.clone())
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ForecastConfig {
    /// Chat-completions endpoint of the reasoning service
    pub base_url: String,
    /// Model identifier
    pub model: String,
    /// API key for the reasoning service
    #[serde(default)]
    pub api_key: String,
    /// Request timeout in seconds
    #[serde(default = "default_forecast_timeout_secs")]
    pub timeout_secs: u64,
    /// Sampling temperature
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Completion token cap
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_forecast_timeout_secs() -> u64 {
    30
}

fn default_temperature() -> f32 {
    0.2
}

fn default_max_tokens() -> u32 {
    2000
}

#[derive(Debug, Clone, Deserialize)]
pub struct TradingConfig {
    /// Minimum market volume for a candidate
    pub min_volume: Decimal,
    /// Maximum days to expiration for a candidate
    pub max_time_to_expiry_days: i64,
    /// Minimum forecast confidence to trade
    pub min_confidence: f64,
    /// Minimum edge (forecast probability vs implied price) to trade
    pub min_edge: f64,
    /// Hours before a market may be re-analyzed
    pub analysis_cooldown_hours: i64,
    /// Per-market daily analysis cap
    pub max_analyses_per_market_per_day: i64,
    /// Daily budget for forecast-service calls (USD)
    pub daily_forecast_budget: Decimal,
    /// Per-decision cost ceiling (USD)
    pub max_cost_per_decision: Decimal,
    /// Concurrent decision workers
    pub decision_workers: usize,
    /// Minimum delay between a worker's consecutive gateway calls (ms)
    pub worker_pacing_ms: u64,
}

impl TradingConfig {
    /// Aggregate request rate the decision pool can generate (requests/second)
    pub fn aggregate_request_rate(&self) -> f64 {
        if self.worker_pacing_ms == 0 {
            return f64::INFINITY;
        }
        self.decision_workers as f64 * (1000.0 / self.worker_pacing_ms as f64)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArbitrageConfig {
    /// Minimum net profit per unit after per-leg taker fees (USD)
    pub min_net_profit: Decimal,
    /// Hard cap on units per opportunity
    pub per_trade_cap: u64,
    /// Maximum tolerated movement between scan and re-verified price
    pub price_tolerance: Decimal,
    /// Minimum group size (mutually exclusive legs)
    #[serde(default = "default_min_group_size")]
    pub min_group_size: usize,
}

fn default_min_group_size() -> usize {
    2
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionConfig {
    /// Order fill timeout in milliseconds
    pub order_timeout_ms: u64,
    /// Polling interval for order status in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

fn default_poll_interval() -> u64 {
    500
}

#[derive(Debug, Clone, Deserialize)]
pub struct RiskConfig {
    /// Fraction of full Kelly applied to sizing (e.g. 0.25 = quarter Kelly)
    pub kelly_fraction: Decimal,
    /// Maximum fraction of total capital in a single position
    pub max_position_pct: Decimal,
    /// Cash reserve floor as a fraction of total capital
    pub cash_reserve_pct: Decimal,
    /// Maximum concurrent open positions
    pub max_open_positions: u32,
    /// Portfolio volatility gate
    pub max_volatility: f64,
    /// Category concentration gate (correlation proxy)
    pub max_category_concentration: f64,
    /// Drawdown-from-peak gate
    pub max_drawdown: f64,
    /// Daily realized loss limit (USD)
    pub daily_loss_limit: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AllocationConfig {
    /// Capital share for the directional (forecast-driven) bucket
    pub directional_pct: Decimal,
    /// Capital share for the arbitrage bucket
    pub arbitrage_pct: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeesConfig {
    /// Maker fee rate on notional
    pub maker_rate: Decimal,
    /// Taker fee rate on notional, applied per leg
    pub taker_rate: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleConfig {
    /// Trade cycle (ingestion + decision + execution) interval in seconds
    pub trade_interval_secs: u64,
    /// Tracker cycle interval in seconds (faster cadence)
    pub tracker_interval_secs: u64,
    /// Evaluation cycle interval in seconds (slow cadence)
    pub evaluation_interval_secs: u64,
    /// Supervisory timeout applied to a single cycle in seconds
    pub cycle_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum connections in pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct DryRunConfig {
    /// Enable dry run mode (paper exchange, no real orders)
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
    /// Optional directory for rolling file logs
    #[serde(default)]
    pub directory: Option<String>,
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
            .set_default("execution.poll_interval_ms", 500)?
            .set_default("database.max_connections", 5)?
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            .add_source(
                File::from(config_dir.join(
                    std::env::var("PROPHET_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (PROPHET_EXCHANGE__API_SECRET, etc.)
            .add_source(
                Environment::with_prefix("PROPHET")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.trading.min_confidence <= 0.0 || self.trading.min_confidence >= 1.0 {
            errors.push("trading.min_confidence must be between 0 and 1".to_string());
        }

        if self.trading.min_edge <= 0.0 || self.trading.min_edge >= 1.0 {
            errors.push("trading.min_edge must be between 0 and 1".to_string());
        }

        if self.trading.daily_forecast_budget <= Decimal::ZERO {
            errors.push("trading.daily_forecast_budget must be positive".to_string());
        }

        if self.trading.decision_workers == 0 {
            errors.push("trading.decision_workers must be at least 1".to_string());
        }

        // First-class invariant: the decision pool must not be able to exceed
        // the gateway's tolerated aggregate request rate.
        let aggregate = self.trading.aggregate_request_rate();
        if aggregate > self.exchange.rate_limit_per_sec {
            errors.push(format!(
                "decision pool rate {:.1} req/s exceeds exchange.rate_limit_per_sec {:.1} \
                 (decision_workers * 1000 / worker_pacing_ms must stay under the limit)",
                aggregate, self.exchange.rate_limit_per_sec
            ));
        }

        if self.risk.kelly_fraction <= Decimal::ZERO || self.risk.kelly_fraction > Decimal::ONE {
            errors.push("risk.kelly_fraction must be in (0, 1]".to_string());
        }

        if self.risk.max_position_pct <= Decimal::ZERO || self.risk.max_position_pct > Decimal::ONE
        {
            errors.push("risk.max_position_pct must be in (0, 1]".to_string());
        }

        if self.risk.cash_reserve_pct < Decimal::ZERO || self.risk.cash_reserve_pct >= Decimal::ONE
        {
            errors.push("risk.cash_reserve_pct must be in [0, 1)".to_string());
        }

        if self.risk.daily_loss_limit <= Decimal::ZERO {
            errors.push("risk.daily_loss_limit must be positive".to_string());
        }

        let alloc_sum = self.allocation.directional_pct + self.allocation.arbitrage_pct;
        if alloc_sum > Decimal::ONE {
            errors.push(format!(
                "allocation shares sum to {alloc_sum}; must not exceed 1"
            ));
        }

        if self.arbitrage.min_net_profit <= Decimal::ZERO {
            errors.push("arbitrage.min_net_profit must be positive".to_string());
        }

        if self.arbitrage.min_group_size < 2 {
            errors.push("arbitrage.min_group_size must be at least 2".to_string());
        }

        if self.fees.taker_rate < Decimal::ZERO || self.fees.taker_rate >= Decimal::ONE {
            errors.push("fees.taker_rate must be in [0, 1)".to_string());
        }

        if self.schedule.cycle_timeout_secs >= self.schedule.trade_interval_secs {
            errors.push(
                "schedule.cycle_timeout_secs should be less than trade_interval_secs".to_string(),
            );
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
