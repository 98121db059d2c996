//! Forecast service gateway
//!
//! Converts a market description into a probability estimate plus rationale
//! and a cost figure, under a caller-supplied budget check. The reasoning
//! service's output may be near-JSON wrapped in prose; `repair` is the single
//! boundary that turns raw payloads into typed outcomes.

mod budget;
mod grok;
pub mod repair;

pub use budget::BudgetTracker;
pub use grok::GrokForecaster;
pub use repair::{ForecastOutcome, ParsedForecast};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::Market;
use crate::error::Result;

/// Market description handed to the reasoning service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketContext {
    pub market_id: String,
    pub title: String,
    pub category: String,
    pub yes_price: Decimal,
    pub no_price: Decimal,
    pub volume: Decimal,
    pub expiration: DateTime<Utc>,
}

impl MarketContext {
    pub fn from_market(market: &Market) -> Self {
        Self {
            market_id: market.id.clone(),
            title: market.title.clone(),
            category: market.category.clone(),
            yes_price: market.implied_price(crate::domain::Side::Yes),
            no_price: market.implied_price(crate::domain::Side::No),
            volume: market.volume,
            expiration: market.expiration,
        }
    }
}

/// One forecast-service reply: typed outcome, cost charged against the
/// budget, and the verbatim payload for the audit log.
#[derive(Debug, Clone)]
pub struct ForecastResponse {
    pub outcome: ForecastOutcome,
    pub cost: Decimal,
    pub raw_response: String,
}

/// Forecast capability consumed by the decision stage
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ForecastClient: Send + Sync {
    async fn analyze(&self, context: &MarketContext) -> Result<ForecastResponse>;
}
