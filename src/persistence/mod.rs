//! Persistence contract
//!
//! CRUD boundary over market/position/order/trade-log/snapshot records.
//! Stages depend on this trait, never on the concrete store, so tests can
//! substitute a mock. Schema evolution is additive: new columns default such
//! that existing rows keep their prior behavior.

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::domain::{ExitPlan, Market, Order, OrderStatus, Position, TradeLog};
use crate::error::Result;
use crate::strategy::PerformanceSnapshot;

/// One entry of the forecast-analysis audit trail
#[derive(Debug, Clone)]
pub struct AnalysisRecord {
    pub market_id: String,
    /// Outcome tag: "trade", "skip", "unparseable", "cost_limited", "error"
    pub action: String,
    pub confidence: f64,
    pub cost: Decimal,
    pub detail: Option<String>,
    /// Verbatim forecast payload, kept for audit regardless of outcome
    pub raw_response: Option<String>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Store: Send + Sync {
    // Markets
    async fn upsert_markets(&self, markets: &[Market]) -> Result<()>;
    async fn get_market(&self, market_id: &str) -> Result<Option<Market>>;

    // Positions
    async fn add_position(&self, position: &Position) -> Result<i64>;
    async fn get_open_positions(&self, tracked_only: bool) -> Result<Vec<Position>>;
    async fn get_position(&self, id: i64) -> Result<Option<Position>>;
    async fn get_open_position_for_market(&self, market_id: &str) -> Result<Option<Position>>;
    async fn set_position_exit_plan(&self, id: i64, plan: &ExitPlan) -> Result<()>;
    async fn close_position(&self, id: i64, exit_price: Decimal) -> Result<()>;
    async fn count_positions(&self) -> Result<i64>;

    // Orders
    async fn insert_order(&self, order: &Order) -> Result<i64>;
    async fn update_order_status(
        &self,
        id: i64,
        status: OrderStatus,
        exchange_order_id: Option<String>,
        error: Option<String>,
    ) -> Result<()>;
    async fn update_order_fill(
        &self,
        id: i64,
        filled_quantity: u64,
        avg_fill_price: Decimal,
        status: OrderStatus,
    ) -> Result<()>;
    async fn get_orders_for_position(&self, position_id: i64) -> Result<Vec<Order>>;
    async fn link_order_to_position(&self, order_id: i64, position_id: i64) -> Result<()>;

    // Trade logs
    async fn add_trade_log(&self, log: &TradeLog) -> Result<i64>;
    async fn get_trade_logs(&self) -> Result<Vec<TradeLog>>;
    async fn trade_log_exists_for_position(&self, position_id: i64) -> Result<bool>;

    // Analysis audit trail
    async fn record_market_analysis(&self, record: &AnalysisRecord) -> Result<()>;
    async fn was_recently_analyzed(&self, market_id: &str, cooldown_hours: i64) -> Result<bool>;
    async fn analysis_count_today(&self, market_id: &str) -> Result<i64>;
    async fn daily_forecast_cost(&self) -> Result<Decimal>;
    async fn latest_confidence(&self, market_id: &str) -> Result<Option<f64>>;

    // Performance snapshots
    async fn insert_snapshot(&self, snapshot: &PerformanceSnapshot) -> Result<i64>;
}
