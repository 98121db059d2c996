//! Evaluation stage
//!
//! Periodic reconciliation of realized and unrealized performance into a
//! persisted snapshot. Read-only with respect to position and order state;
//! untracked positions are excluded here (and only here).

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::domain::TradeLog;
use crate::error::Result;
use crate::persistence::Store;

/// Per-strategy attribution line
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StrategyPerformance {
    pub trades: i64,
    pub realized_pnl: Decimal,
    pub win_rate: f64,
}

/// One persisted performance snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceSnapshot {
    pub taken_at: DateTime<Utc>,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub win_rate: f64,
    pub total_trades: i64,
    pub open_positions: i64,
    pub by_strategy: HashMap<String, StrategyPerformance>,
}

pub struct PerformanceEvaluator {
    store: Arc<dyn Store>,
}

impl PerformanceEvaluator {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Build and persist one snapshot.
    pub async fn run_cycle(&self) -> Result<PerformanceSnapshot> {
        let logs = self.store.get_trade_logs().await?;
        let open = self.store.get_open_positions(true).await?;

        let realized_pnl: Decimal = logs.iter().map(|l| l.pnl).sum();
        let total_trades = logs.len() as i64;
        let wins = logs.iter().filter(|l| l.is_win()).count();
        let win_rate = if total_trades > 0 {
            wins as f64 / total_trades as f64
        } else {
            0.0
        };

        // Mark open positions against the latest stored snapshot for each
        // market; a missing snapshot marks at entry (zero unrealized).
        let mut unrealized_pnl = Decimal::ZERO;
        for position in &open {
            let current = match self.store.get_market(&position.market_id).await? {
                Some(market) => {
                    let bid = market.bid(position.side);
                    if bid > Decimal::ZERO {
                        bid
                    } else {
                        market.implied_price(position.side)
                    }
                }
                None => {
                    debug!(market_id = %position.market_id, "no snapshot for mark-to-market");
                    position.entry_price
                }
            };
            unrealized_pnl += position.unrealized_pnl(current);
        }

        let snapshot = PerformanceSnapshot {
            taken_at: Utc::now(),
            realized_pnl,
            unrealized_pnl,
            win_rate,
            total_trades,
            open_positions: open.len() as i64,
            by_strategy: attribute_by_strategy(&logs),
        };
        self.store.insert_snapshot(&snapshot).await?;

        info!(
            realized = %snapshot.realized_pnl,
            unrealized = %snapshot.unrealized_pnl,
            win_rate = format!("{:.1}%", snapshot.win_rate * 100.0),
            trades = snapshot.total_trades,
            "performance snapshot persisted"
        );
        Ok(snapshot)
    }
}

fn attribute_by_strategy(logs: &[TradeLog]) -> HashMap<String, StrategyPerformance> {
    let mut by_strategy: HashMap<String, StrategyPerformance> = HashMap::new();
    for log in logs {
        let entry = by_strategy
            .entry(log.strategy.as_str().to_string())
            .or_default();
        entry.trades += 1;
        entry.realized_pnl += log.pnl;
    }
    for (name, perf) in by_strategy.iter_mut() {
        let wins = logs
            .iter()
            .filter(|l| l.strategy.as_str() == name && l.is_win())
            .count();
        perf.win_rate = if perf.trades > 0 {
            wins as f64 / perf.trades as f64
        } else {
            0.0
        };
    }
    by_strategy
}
