//! Exchange gateway boundary
//!
//! The core consumes the exchange as a capability, not an implementation
//! detail: `ExchangeClient` is the contract, `RateLimitedGateway` owns
//! pacing/backoff, and `PaperExchange` is the in-process implementation used
//! in dry-run mode and tests.

mod gateway;
mod paper;

pub use gateway::RateLimitedGateway;
pub use paper::PaperExchange;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::{Fill, Market, Orderbook, OrderRequest, OrderStatus, Side};
use crate::error::Result;

/// Filter for paginated market listings
#[derive(Debug, Clone, Default)]
pub struct MarketFilter {
    /// Only tradable (open) markets when true
    pub open_only: bool,
    pub cursor: Option<String>,
    pub limit: u32,
}

/// One page of a market listing
#[derive(Debug, Clone)]
pub struct MarketPage {
    pub markets: Vec<Market>,
    /// Cursor for the next page, absent on the last page
    pub cursor: Option<String>,
}

/// Handle returned by order placement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderHandle {
    pub exchange_order_id: String,
    pub status: OrderStatus,
}

/// Raw position as reported by the exchange
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangePosition {
    pub market_id: String,
    pub side: Side,
    pub quantity: u64,
    pub avg_price: Option<Decimal>,
}

/// Exchange capability consumed by every stage.
///
/// Any call may fail with a rate-limit signal; the gateway wrapper owns
/// retry/backoff and the core treats remaining failures as skip-this-cycle.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    fn is_dry_run(&self) -> bool;

    async fn list_markets(&self, filter: &MarketFilter) -> Result<MarketPage>;

    async fn get_market(&self, market_id: &str) -> Result<Market>;

    async fn get_orderbook(&self, market_id: &str) -> Result<Orderbook>;

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderHandle>;

    async fn get_fills(&self, exchange_order_id: &str) -> Result<Vec<Fill>>;

    async fn get_positions(&self) -> Result<Vec<ExchangePosition>>;

    /// Available cash balance in dollars
    async fn get_balance(&self) -> Result<Decimal>;
}
