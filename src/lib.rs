pub mod adapters;
pub mod config;
pub mod domain;
pub mod error;
pub mod exchange;
pub mod forecast;
pub mod persistence;
pub mod services;
pub mod strategy;

pub use config::AppConfig;
pub use error::{ProphetError, Result};
pub use exchange::{ExchangeClient, PaperExchange, RateLimitedGateway};
pub use forecast::{ForecastClient, GrokForecaster};
pub use persistence::Store;
pub use services::{StartupSync, TradingRuntime};
pub use strategy::{
    ArbitrageScanner, CapitalAllocator, DecisionEngine, IngestionStage, OrderExecutor,
    PerformanceEvaluator, PositionTracker,
};
