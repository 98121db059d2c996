use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Side;
use crate::error::OrderError;

/// Order action (buy opens or adds, sell closes or flattens)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderAction {
    Buy,
    Sell,
}

impl OrderAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderAction::Buy => "buy",
            OrderAction::Sell => "sell",
        }
    }
}

impl std::fmt::Display for OrderAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Order type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Limit,
    Market,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Limit => "limit",
            OrderType::Market => "market",
        }
    }
}

/// Order status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Created locally, not yet submitted
    Pending,
    /// Accepted by the exchange
    Placed,
    /// Some quantity filled
    PartiallyFilled,
    /// Fully filled
    Filled,
    /// Submission or processing failed
    Failed,
    /// Cancelled before completion
    Cancelled,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Failed | OrderStatus::Cancelled
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self,
            OrderStatus::Pending | OrderStatus::Placed | OrderStatus::PartiallyFilled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Placed => "placed",
            OrderStatus::PartiallyFilled => "partially_filled",
            OrderStatus::Filled => "filled",
            OrderStatus::Failed => "failed",
            OrderStatus::Cancelled => "cancelled",
        }
    }
}

impl TryFrom<&str> for OrderStatus {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(OrderStatus::Pending),
            "placed" => Ok(OrderStatus::Placed),
            "partially_filled" => Ok(OrderStatus::PartiallyFilled),
            "filled" => Ok(OrderStatus::Filled),
            "failed" => Ok(OrderStatus::Failed),
            "cancelled" => Ok(OrderStatus::Cancelled),
            _ => Err(format!("Unknown order status: {}", s)),
        }
    }
}

/// Order request (what we want the exchange to do)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub client_order_id: String,
    pub market_id: String,
    pub side: Side,
    pub action: OrderAction,
    pub order_type: OrderType,
    pub quantity: u64,
    pub price: Decimal,
}

impl OrderRequest {
    pub fn buy_limit(market_id: impl Into<String>, side: Side, quantity: u64, price: Decimal) -> Self {
        Self {
            client_order_id: Uuid::new_v4().to_string(),
            market_id: market_id.into(),
            side,
            action: OrderAction::Buy,
            order_type: OrderType::Limit,
            quantity,
            price,
        }
    }

    pub fn sell_limit(market_id: impl Into<String>, side: Side, quantity: u64, price: Decimal) -> Self {
        Self {
            client_order_id: Uuid::new_v4().to_string(),
            market_id: market_id.into(),
            side,
            action: OrderAction::Sell,
            order_type: OrderType::Limit,
            quantity,
            price,
        }
    }

    pub fn sell_market(market_id: impl Into<String>, side: Side, quantity: u64, price: Decimal) -> Self {
        Self {
            client_order_id: Uuid::new_v4().to_string(),
            market_id: market_id.into(),
            side,
            action: OrderAction::Sell,
            order_type: OrderType::Market,
            quantity,
            price,
        }
    }
}

/// One exchange instruction, owned by the execution stage until terminal,
/// immutable history afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: Option<i64>,
    pub position_id: Option<i64>,
    /// Shared opportunity id when this order is one leg of a group
    pub group_id: Option<String>,
    pub client_order_id: String,
    pub exchange_order_id: Option<String>,
    pub market_id: String,
    pub side: Side,
    pub action: OrderAction,
    pub order_type: OrderType,
    pub quantity: u64,
    pub price: Decimal,
    pub filled_quantity: u64,
    pub avg_fill_price: Option<Decimal>,
    pub status: OrderStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn from_request(request: &OrderRequest) -> Self {
        let now = Utc::now();
        Self {
            id: None,
            position_id: None,
            group_id: None,
            client_order_id: request.client_order_id.clone(),
            exchange_order_id: None,
            market_id: request.market_id.clone(),
            side: request.side,
            action: request.action,
            order_type: request.order_type,
            quantity: request.quantity,
            price: request.price,
            filled_quantity: 0,
            avg_fill_price: None,
            status: OrderStatus::Pending,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Notional value at the requested price
    pub fn value(&self) -> Decimal {
        self.price * Decimal::from(self.quantity)
    }

    /// Realized cost of what actually filled
    pub fn fill_value(&self) -> Decimal {
        match self.avg_fill_price {
            Some(price) => price * Decimal::from(self.filled_quantity),
            None => Decimal::ZERO,
        }
    }

    pub fn is_fully_filled(&self) -> bool {
        self.status == OrderStatus::Filled && self.filled_quantity >= self.quantity
    }

    /// Record a fill, enforcing that filled quantity never exceeds requested
    /// and that terminal orders stay immutable.
    pub fn record_fill(&mut self, quantity: u64, price: Decimal) -> Result<(), OrderError> {
        if self.status.is_terminal() {
            return Err(OrderError::AlreadyTerminal);
        }
        let total = self.filled_quantity + quantity;
        if total > self.quantity {
            return Err(OrderError::Overfill {
                requested: self.quantity,
                filled: total,
            });
        }

        // Volume-weighted average entry across fills
        let prev_notional = self
            .avg_fill_price
            .map(|p| p * Decimal::from(self.filled_quantity))
            .unwrap_or(Decimal::ZERO);
        let new_notional = prev_notional + price * Decimal::from(quantity);
        self.filled_quantity = total;
        self.avg_fill_price = Some(new_notional / Decimal::from(total));
        self.status = if self.filled_quantity == self.quantity {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn mark_placed(&mut self, exchange_order_id: impl Into<String>) {
        self.exchange_order_id = Some(exchange_order_id.into());
        self.status = OrderStatus::Placed;
        self.updated_at = Utc::now();
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>) {
        self.error = Some(reason.into());
        self.status = OrderStatus::Failed;
        self.updated_at = Utc::now();
    }
}

/// Fill event reported by the exchange
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub order_id: String,
    pub price: Decimal,
    pub quantity: u64,
    pub timestamp: DateTime<Utc>,
    pub fee: Decimal,
}
