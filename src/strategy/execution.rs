//! Execution stage (single leg)
//!
//! Turns a trade intent into an exchange order: current top-of-book, sizing
//! from the allocator, placement through the gateway, then fill polling.
//! What actually filled, not what was requested, is what gets recorded into
//! the resulting position.

use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use super::allocator::CapitalAllocator;
use crate::config::ExecutionConfig;
use crate::domain::{
    Order, OrderRequest, OrderStatus, Position, PositionStatus, Side, TradeIntent,
};
use crate::error::Result;
use crate::exchange::ExchangeClient;
use crate::persistence::Store;

/// Entry price may drift at most this much above the intent's target before
/// the trade is abandoned for the cycle.
const PRICE_DRIFT_TOLERANCE: Decimal = rust_decimal_macros::dec!(0.02);

pub struct OrderExecutor {
    exchange: Arc<dyn ExchangeClient>,
    store: Arc<dyn Store>,
    allocator: Arc<CapitalAllocator>,
    config: ExecutionConfig,
}

impl OrderExecutor {
    pub fn new(
        exchange: Arc<dyn ExchangeClient>,
        store: Arc<dyn Store>,
        allocator: Arc<CapitalAllocator>,
        config: ExecutionConfig,
    ) -> Self {
        Self {
            exchange,
            store,
            allocator,
            config,
        }
    }

    /// Execute a single-leg intent. `None` means the trade was skipped
    /// (sizing to zero, stale price, or placement failure).
    pub async fn execute(&self, intent: &TradeIntent) -> Result<Option<Order>> {
        let open = self.store.get_open_positions(false).await?;
        if open.len() >= self.allocator.max_open_positions() as usize {
            info!(
                market_id = %intent.market_id,
                open = open.len(),
                "open-position cap reached, skipping execution"
            );
            return Ok(None);
        }

        // Current top-of-book decides the entry price
        let book = self.exchange.get_orderbook(&intent.market_id).await?;
        let (price, depth) = match intent.side {
            Side::Yes => match book.best_ask() {
                Some(level) => (level.price, level.quantity),
                None => return Ok(None),
            },
            // The YES book's bid side is where NO contracts are offered
            Side::No => match book.best_bid() {
                Some(level) => (Decimal::ONE - level.price, level.quantity),
                None => return Ok(None),
            },
        };
        if price > intent.target_price + PRICE_DRIFT_TOLERANCE {
            info!(
                market_id = %intent.market_id,
                target = %intent.target_price,
                current = %price,
                "price drifted past target, skipping"
            );
            return Ok(None);
        }

        // Allocator sizing; the forecast probability is price + edge by
        // construction of the intent.
        use rust_decimal::prelude::ToPrimitive;
        let probability = price.to_f64().unwrap_or(0.5) + intent.edge;
        let Some(sizing) = self
            .allocator
            .size_and_commit(price, probability, intent.confidence, intent.strategy)
            .await?
        else {
            return Ok(None);
        };

        // Depth-aware cap: never request more than the book shows
        let quantity = sizing.quantity.min(depth);
        if quantity == 0 {
            self.allocator.release(intent.strategy, sizing.notional).await;
            return Ok(None);
        }
        if quantity < sizing.quantity {
            let unused = price * Decimal::from(sizing.quantity - quantity);
            self.allocator.release(intent.strategy, unused).await;
        }

        let request = OrderRequest::buy_limit(intent.market_id.clone(), intent.side, quantity, price);
        let mut order = Order::from_request(&request);
        let order_id = self.store.insert_order(&order).await?;
        order.id = Some(order_id);
        let committed = price * Decimal::from(quantity);

        let handle = match self.exchange.place_order(&request).await {
            Ok(handle) => handle,
            Err(err) => {
                warn!(
                    market_id = %intent.market_id,
                    stage = "execution",
                    error = %err,
                    "order placement failed"
                );
                order.mark_failed(err.to_string());
                self.store
                    .update_order_status(order_id, OrderStatus::Failed, None, Some(err.to_string()))
                    .await?;
                self.allocator.release(intent.strategy, committed).await;
                return Ok(None);
            }
        };
        order.mark_placed(handle.exchange_order_id.clone());
        self.store
            .update_order_status(
                order_id,
                OrderStatus::Placed,
                Some(handle.exchange_order_id.clone()),
                None,
            )
            .await?;

        let (filled, avg_price) = self
            .await_fills(&handle.exchange_order_id, quantity)
            .await?;

        if filled == 0 {
            self.store
                .update_order_status(order_id, OrderStatus::Cancelled, None, None)
                .await?;
            self.allocator.release(intent.strategy, committed).await;
            info!(market_id = %intent.market_id, "no fill before timeout, order abandoned");
            return Ok(None);
        }

        let fill_price = avg_price.unwrap_or(price);
        order.record_fill(filled, fill_price)?;
        self.store
            .update_order_fill(order_id, filled, fill_price, order.status)
            .await?;

        // Return the commitment the fill did not consume
        let cost = fill_price * Decimal::from(filled);
        if committed > cost {
            self.allocator.release(intent.strategy, committed - cost).await;
        }

        let position = Position {
            id: None,
            market_id: intent.market_id.clone(),
            side: intent.side,
            entry_price: fill_price,
            quantity: filled,
            opened_at: Utc::now(),
            strategy: intent.strategy,
            status: PositionStatus::Open,
            tracked: true,
            confidence: intent.confidence,
            rationale: intent.rationale.clone(),
            group_id: None,
            exit_plan: Some(intent.exit_plan),
            closed_at: None,
            exit_price: None,
        };
        let position_id = self.store.add_position(&position).await?;
        self.store
            .link_order_to_position(order_id, position_id)
            .await?;
        order.position_id = Some(position_id);

        info!(
            market_id = %intent.market_id,
            side = %intent.side,
            requested = quantity,
            filled,
            price = %fill_price,
            "position opened"
        );
        Ok(Some(order))
    }

    /// Place a market sell to close a position; returns the confirmed order.
    /// Used by the tracker for guaranteed exits.
    pub async fn execute_close(&self, position: &Position, price: Decimal) -> Result<Order> {
        let request = OrderRequest::sell_market(
            position.market_id.clone(),
            position.side,
            position.quantity,
            price,
        );
        let mut order = Order::from_request(&request);
        order.position_id = position.id;
        let order_id = self.store.insert_order(&order).await?;
        order.id = Some(order_id);

        let handle = match self.exchange.place_order(&request).await {
            Ok(handle) => handle,
            Err(err) => {
                order.mark_failed(err.to_string());
                self.store
                    .update_order_status(order_id, OrderStatus::Failed, None, Some(err.to_string()))
                    .await?;
                return Err(err);
            }
        };
        order.mark_placed(handle.exchange_order_id.clone());
        self.store
            .update_order_status(
                order_id,
                OrderStatus::Placed,
                Some(handle.exchange_order_id.clone()),
                None,
            )
            .await?;

        let (filled, avg_price) = self
            .await_fills(&handle.exchange_order_id, position.quantity)
            .await?;
        let fill_price = avg_price.unwrap_or(price);
        if filled > 0 {
            order.record_fill(filled, fill_price)?;
            self.store
                .update_order_fill(order_id, filled, fill_price, order.status)
                .await?;
        }
        Ok(order)
    }

    /// Poll fills until the order completes or the execution timeout lapses.
    /// Returns total filled quantity and its volume-weighted price.
    async fn await_fills(
        &self,
        exchange_order_id: &str,
        requested: u64,
    ) -> Result<(u64, Option<Decimal>)> {
        let deadline = Instant::now() + Duration::from_millis(self.config.order_timeout_ms);
        let poll = Duration::from_millis(self.config.poll_interval_ms);

        loop {
            let fills = match self.exchange.get_fills(exchange_order_id).await {
                Ok(fills) => fills,
                Err(err) => {
                    warn!(error = %err, "fill poll failed");
                    Vec::new()
                }
            };

            let filled: u64 = fills.iter().map(|f| f.quantity).sum();
            if filled >= requested {
                return Ok((filled.min(requested), vwap(&fills)));
            }
            if Instant::now() >= deadline {
                return Ok((filled, vwap(&fills)));
            }
            tokio::time::sleep(poll).await;
        }
    }
}

fn vwap(fills: &[crate::domain::Fill]) -> Option<Decimal> {
    let total: u64 = fills.iter().map(|f| f.quantity).sum();
    if total == 0 {
        return None;
    }
    let notional: Decimal = fills
        .iter()
        .map(|f| f.price * Decimal::from(f.quantity))
        .sum();
    Some(notional / Decimal::from(total))
}
