//! Position lifecycle tracker
//!
//! Evaluates every open position once per tracking cycle, tracked and
//! untracked alike. Exit triggers are checked in strict priority order;
//! closes go through a market order for a guaranteed exit, and only tracked
//! positions produce a trade log.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::allocator::CapitalAllocator;
use super::execution::OrderExecutor;
use super::exits::ExitPlanner;
use crate::domain::{
    ExitReason, Market, MarketStatus, Position, PositionLifecycle, Side, StrategyKind, TradeLog,
};
use crate::error::Result;
use crate::exchange::ExchangeClient;
use crate::persistence::Store;

pub struct PositionTracker {
    exchange: Arc<dyn ExchangeClient>,
    store: Arc<dyn Store>,
    allocator: Arc<CapitalAllocator>,
    executor: Arc<OrderExecutor>,
}

/// Cycle summary for logging
#[derive(Debug, Default, Clone, Copy)]
pub struct TrackerCycleStats {
    pub evaluated: usize,
    pub exited: usize,
    pub failed: usize,
}

impl PositionTracker {
    pub fn new(
        exchange: Arc<dyn ExchangeClient>,
        store: Arc<dyn Store>,
        allocator: Arc<CapitalAllocator>,
        executor: Arc<OrderExecutor>,
    ) -> Self {
        Self {
            exchange,
            store,
            allocator,
            executor,
        }
    }

    /// Evaluate all open positions once.
    pub async fn run_cycle(&self) -> Result<TrackerCycleStats> {
        let positions = self.store.get_open_positions(false).await?;
        let mut stats = TrackerCycleStats {
            evaluated: positions.len(),
            ..Default::default()
        };

        for position in positions {
            match self.process_position(position).await {
                Ok(true) => stats.exited += 1,
                Ok(false) => {}
                Err(err) => {
                    stats.failed += 1;
                    warn!(stage = "tracker", error = %err, "position evaluation failed");
                }
            }
        }

        if stats.exited > 0 || stats.failed > 0 {
            info!(
                evaluated = stats.evaluated,
                exited = stats.exited,
                failed = stats.failed,
                "tracking cycle complete"
            );
        }
        Ok(stats)
    }

    /// Returns true when the position was closed this cycle.
    async fn process_position(&self, mut position: Position) -> Result<bool> {
        let Some(position_id) = position.id else {
            return Ok(false);
        };

        let market = match self.exchange.get_market(&position.market_id).await {
            Ok(market) => market,
            Err(err) => {
                warn!(
                    market_id = %position.market_id,
                    stage = "tracker",
                    error = %err,
                    "market refresh failed, skipping position this cycle"
                );
                return Ok(false);
            }
        };

        // Positions that arrived without an exit plan get a conservative
        // default. Arbitrage legs are excluded: they are held to resolution
        // and must not be stopped out of the hedge.
        if position.exit_plan.is_none() && position.strategy != StrategyKind::Arbitrage {
            let plan = ExitPlanner::default_plan(position.entry_price);
            self.store.set_position_exit_plan(position_id, &plan).await?;
            position.exit_plan = Some(plan);
            debug!(market_id = %position.market_id, "default exit plan backfilled");
        }

        let latest_confidence = self.store.latest_confidence(&position.market_id).await?;
        let now = Utc::now();
        let Some((reason, target_price)) =
            evaluate_exit(&position, &market, latest_confidence, now)
        else {
            return Ok(false);
        };

        // open -> exiting
        let mut lifecycle = PositionLifecycle::Open;
        if !lifecycle.can_transition_to(PositionLifecycle::Exiting) {
            return Ok(false);
        }
        lifecycle = PositionLifecycle::Exiting;
        info!(
            market_id = %position.market_id,
            reason = %reason,
            target = %target_price,
            tracked = position.tracked,
            "exit triggered"
        );

        let exit_price = if reason == ExitReason::MarketResolved {
            // Settlement needs no order; the exchange pays out directly
            target_price
        } else {
            match self.executor.execute_close(&position, target_price).await {
                Ok(order) if order.filled_quantity > 0 => {
                    order.avg_fill_price.unwrap_or(target_price)
                }
                Ok(_) => {
                    // exiting -> open: no fill, retry next cycle
                    warn!(market_id = %position.market_id, "close order unfilled, will retry");
                    return Ok(false);
                }
                Err(err) => {
                    warn!(
                        market_id = %position.market_id,
                        stage = "tracker",
                        error = %err,
                        "close order failed, will retry"
                    );
                    return Ok(false);
                }
            }
        };

        // exiting -> closed
        if !lifecycle.can_transition_to(PositionLifecycle::Closed) {
            return Ok(false);
        }
        self.store.close_position(position_id, exit_price).await?;
        let pnl = (exit_price - position.entry_price) * Decimal::from(position.quantity);
        self.allocator
            .release(position.strategy, position.cost_basis())
            .await;
        self.allocator.record_realized_pnl(pnl).await;

        if position.tracked {
            let slippage = position.exit_plan.and_then(|plan| match reason {
                ExitReason::StopLoss => Some(exit_price - plan.stop_loss_price),
                ExitReason::TakeProfit => Some(exit_price - plan.take_profit_price),
                _ => None,
            });
            self.store
                .add_trade_log(&TradeLog {
                    id: None,
                    position_id,
                    market_id: position.market_id.clone(),
                    side: position.side,
                    entry_price: position.entry_price,
                    exit_price,
                    quantity: position.quantity,
                    pnl,
                    strategy: position.strategy,
                    exit_reason: reason.as_str().to_string(),
                    slippage,
                    entry_at: position.opened_at,
                    exit_at: Utc::now(),
                })
                .await?;
        }

        info!(
            market_id = %position.market_id,
            reason = %reason,
            pnl = %pnl,
            tracked = position.tracked,
            "position closed"
        );
        Ok(true)
    }
}

/// Decide whether a position should exit, and at what price.
///
/// Triggers are evaluated in priority order: resolution beats stop-loss
/// beats take-profit beats max-hold beats confidence drift.
pub fn evaluate_exit(
    position: &Position,
    market: &Market,
    latest_confidence: Option<f64>,
    now: DateTime<Utc>,
) -> Option<(ExitReason, Decimal)> {
    let current_price = {
        let bid = market.bid(position.side);
        if bid > Decimal::ZERO {
            bid
        } else {
            market.implied_price(position.side)
        }
    };

    // (a) Market resolved or closed: exit at settlement value
    if let Some(result) = market.result {
        return Some((
            ExitReason::MarketResolved,
            Market::settlement_value(position.side, result),
        ));
    }
    if matches!(market.status, MarketStatus::Closed | MarketStatus::Resolved) {
        return Some((ExitReason::MarketResolved, current_price));
    }
    // Price pinned at an extreme means resolution in all but status
    if market.is_price_pinned(position.side) {
        let settlement = if market.implied_price(position.side) >= Decimal::new(99, 2) {
            Decimal::ONE
        } else {
            Decimal::ZERO
        };
        return Some((ExitReason::MarketResolved, settlement));
    }

    let Some(plan) = position.exit_plan else {
        return None;
    };

    // (b) Stop-loss: holding either side is long that contract, so the stop
    // always sits below entry.
    if current_price <= plan.stop_loss_price {
        return Some((ExitReason::StopLoss, current_price));
    }

    // (c) Take-profit, but only when the exit would actually realize a
    // profit. A "target hit" at a loss means the market resolved against us
    // and the status just has not flipped yet.
    if current_price >= plan.take_profit_price && current_price > position.entry_price {
        return Some((ExitReason::TakeProfit, current_price));
    }

    // (d) Max hold duration
    if position.hold_duration_hours(now) >= plan.max_hold_hours {
        return Some((ExitReason::MaxHoldExceeded, current_price));
    }

    // (e) Confidence drift since entry
    if let Some(latest) = latest_confidence {
        if (position.confidence - latest).abs() >= plan.confidence_delta {
            return Some((ExitReason::ConfidenceDrift, current_price));
        }
    }

    None
}
