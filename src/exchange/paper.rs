use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use super::{ExchangeClient, ExchangePosition, MarketFilter, MarketPage, OrderHandle};
use crate::domain::{Fill, Market, Orderbook, OrderAction, OrderRequest, OrderStatus, Side};
use crate::error::{ProphetError, Result};

/// In-process exchange used in dry-run mode and tests.
///
/// Orders fill immediately at the requested price against seeded order-book
/// depth. Failure injection lets tests exercise the partial-fill and
/// flatten-failure paths.
#[derive(Clone, Default)]
pub struct PaperExchange {
    state: Arc<RwLock<PaperState>>,
}

#[derive(Default)]
struct PaperState {
    markets: HashMap<String, Market>,
    books: HashMap<String, Orderbook>,
    balance: Decimal,
    positions: HashMap<(String, Side), u64>,
    fills: HashMap<String, Vec<Fill>>,
    /// Markets whose next buy order is rejected
    reject_orders: HashSet<String>,
    /// Markets whose next sell (flatten) order is rejected
    reject_sells: HashSet<String>,
    orders_placed: Vec<OrderRequest>,
}

impl PaperExchange {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed_market(&self, market: Market) {
        self.state
            .write()
            .await
            .markets
            .insert(market.id.clone(), market);
    }

    pub async fn seed_orderbook(&self, book: Orderbook) {
        self.state
            .write()
            .await
            .books
            .insert(book.market_id.clone(), book);
    }

    pub async fn set_balance(&self, balance: Decimal) {
        self.state.write().await.balance = balance;
    }

    pub async fn seed_position(&self, market_id: &str, side: Side, quantity: u64) {
        self.state
            .write()
            .await
            .positions
            .insert((market_id.to_string(), side), quantity);
    }

    /// Reject the next buy order in `market_id` (fails the leg)
    pub async fn reject_next_order(&self, market_id: &str) {
        self.state
            .write()
            .await
            .reject_orders
            .insert(market_id.to_string());
    }

    /// Reject the next sell order in `market_id` (fails the flatten)
    pub async fn reject_next_sell(&self, market_id: &str) {
        self.state
            .write()
            .await
            .reject_sells
            .insert(market_id.to_string());
    }

    /// Orders accepted so far, in placement sequence
    pub async fn placed_orders(&self) -> Vec<OrderRequest> {
        self.state.read().await.orders_placed.clone()
    }
}

#[async_trait]
impl ExchangeClient for PaperExchange {
    fn is_dry_run(&self) -> bool {
        true
    }

    async fn list_markets(&self, filter: &MarketFilter) -> Result<MarketPage> {
        let state = self.state.read().await;
        let mut markets: Vec<Market> = state
            .markets
            .values()
            .filter(|m| !filter.open_only || m.status.is_tradable())
            .cloned()
            .collect();
        markets.sort_by(|a, b| a.id.cmp(&b.id));
        // Single page; the paper book never holds enough markets to paginate
        Ok(MarketPage {
            markets,
            cursor: None,
        })
    }

    async fn get_market(&self, market_id: &str) -> Result<Market> {
        self.state
            .read()
            .await
            .markets
            .get(market_id)
            .cloned()
            .ok_or_else(|| ProphetError::MarketNotFound(market_id.to_string()))
    }

    async fn get_orderbook(&self, market_id: &str) -> Result<Orderbook> {
        let state = self.state.read().await;
        if let Some(book) = state.books.get(market_id) {
            return Ok(book.clone());
        }
        // Synthesize a deep book from the quote when none was seeded
        let market = state
            .markets
            .get(market_id)
            .ok_or_else(|| ProphetError::MarketNotFound(market_id.to_string()))?;
        Ok(Orderbook {
            market_id: market_id.to_string(),
            yes_asks: vec![crate::domain::DepthLevel {
                price: market.yes_ask,
                quantity: 10_000,
            }],
            yes_bids: vec![crate::domain::DepthLevel {
                price: market.yes_bid,
                quantity: 10_000,
            }],
            fetched_at: Utc::now(),
        })
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderHandle> {
        let mut state = self.state.write().await;

        let rejected = match request.action {
            OrderAction::Buy => state.reject_orders.remove(&request.market_id),
            OrderAction::Sell => state.reject_sells.remove(&request.market_id),
        };
        if rejected {
            return Err(ProphetError::OrderRejected(format!(
                "injected rejection for {}",
                request.market_id
            )));
        }

        state.orders_placed.push(request.clone());

        let exchange_order_id = Uuid::new_v4().to_string();
        let notional = request.price * Decimal::from(request.quantity);

        match request.action {
            OrderAction::Buy => {
                if notional > state.balance {
                    return Err(ProphetError::InsufficientLiquidity(format!(
                        "paper balance {} below notional {}",
                        state.balance, notional
                    )));
                }
                state.balance -= notional;
                *state
                    .positions
                    .entry((request.market_id.clone(), request.side))
                    .or_insert(0) += request.quantity;
            }
            OrderAction::Sell => {
                let held = state
                    .positions
                    .entry((request.market_id.clone(), request.side))
                    .or_insert(0);
                let sold = request.quantity.min(*held);
                *held -= sold;
                state.balance += request.price * Decimal::from(sold);
            }
        }

        state.fills.insert(
            exchange_order_id.clone(),
            vec![Fill {
                order_id: exchange_order_id.clone(),
                price: request.price,
                quantity: request.quantity,
                timestamp: Utc::now(),
                fee: Decimal::ZERO,
            }],
        );

        info!(
            market_id = %request.market_id,
            action = %request.action,
            quantity = request.quantity,
            price = %request.price,
            "paper order filled"
        );

        Ok(OrderHandle {
            exchange_order_id,
            status: OrderStatus::Filled,
        })
    }

    async fn get_fills(&self, exchange_order_id: &str) -> Result<Vec<Fill>> {
        Ok(self
            .state
            .read()
            .await
            .fills
            .get(exchange_order_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_positions(&self) -> Result<Vec<ExchangePosition>> {
        let state = self.state.read().await;
        Ok(state
            .positions
            .iter()
            .filter(|(_, qty)| **qty > 0)
            .map(|((market_id, side), qty)| ExchangePosition {
                market_id: market_id.clone(),
                side: *side,
                quantity: *qty,
                avg_price: None,
            })
            .collect())
    }

    async fn get_balance(&self) -> Result<Decimal> {
        Ok(self.state.read().await.balance)
    }
}
