//! Capital allocator / risk engine
//!
//! The one component permitted to mutate aggregate capital counters. All
//! state lives behind a single mutex so two concurrent sizing decisions can
//! never jointly overcommit capital. Sizing combines a fractional-Kelly
//! estimate with hard caps; four risk gates suppress new position opening
//! (never existing-position closing) while breached.

use chrono::{NaiveDate, Utc};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::config::{AllocationConfig, RiskConfig};
use crate::domain::{RiskState, StrategyKind};
use crate::error::{Result, RiskError};

/// Process-wide capital counters, single-writer behind the allocator's mutex
#[derive(Debug, Clone, Default)]
pub struct CapitalState {
    /// Cash plus mark-to-market of all open positions, tracked and untracked
    pub total_capital: Decimal,
    pub cash: Decimal,
    pub committed: HashMap<StrategyKind, Decimal>,
    pub daily_forecast_spend: Decimal,
    pub daily_realized_loss: Decimal,
    pub peak_equity: Decimal,
    day: Option<NaiveDate>,
}

impl CapitalState {
    pub fn committed_total(&self) -> Decimal {
        self.committed.values().copied().sum()
    }
}

/// Portfolio-level inputs to the risk gates, computed from open exposure
#[derive(Debug, Clone, Copy, Default)]
pub struct PortfolioMetrics {
    /// Exposure-weighted `sqrt(p(1-p))` across open positions
    pub volatility: f64,
    /// Largest single-category share of open exposure (correlation proxy)
    pub category_concentration: f64,
}

/// One open exposure for metrics computation
#[derive(Debug, Clone)]
pub struct Exposure {
    pub current_price: Decimal,
    pub value: Decimal,
    pub category: String,
}

/// Exposure-weighted portfolio metrics
pub fn portfolio_metrics(exposures: &[Exposure]) -> PortfolioMetrics {
    let total: Decimal = exposures.iter().map(|e| e.value).sum();
    if total <= Decimal::ZERO {
        return PortfolioMetrics::default();
    }
    let total_f = total.to_f64().unwrap_or(1.0);

    let volatility = exposures
        .iter()
        .map(|e| {
            let p = e.current_price.to_f64().unwrap_or(0.5).clamp(0.01, 0.99);
            (p * (1.0 - p)).sqrt() * e.value.to_f64().unwrap_or(0.0)
        })
        .sum::<f64>()
        / total_f;

    let mut by_category: HashMap<&str, Decimal> = HashMap::new();
    for exposure in exposures {
        *by_category.entry(exposure.category.as_str()).or_default() += exposure.value;
    }
    let category_concentration = by_category
        .values()
        .map(|v| (*v / total).to_f64().unwrap_or(0.0))
        .fold(0.0_f64, f64::max);

    PortfolioMetrics {
        volatility,
        category_concentration,
    }
}

/// Approved sizing: quantity plus the notional committed for it
#[derive(Debug, Clone, Copy)]
pub struct Sizing {
    pub quantity: u64,
    pub notional: Decimal,
}

pub struct CapitalAllocator {
    risk: RiskConfig,
    allocation: AllocationConfig,
    state: Mutex<CapitalState>,
    risk_state: Mutex<RiskState>,
}

impl CapitalAllocator {
    pub fn new(risk: RiskConfig, allocation: AllocationConfig) -> Self {
        Self {
            risk,
            allocation,
            state: Mutex::new(CapitalState::default()),
            risk_state: Mutex::new(RiskState::Normal),
        }
    }

    /// Initialize counters at startup from exchange balance plus the value of
    /// existing positions, tracked and untracked alike.
    pub async fn initialize(&self, cash: Decimal, open_position_value: Decimal) {
        let mut state = self.state.lock().await;
        state.cash = cash;
        state.total_capital = cash + open_position_value;
        state.peak_equity = state.total_capital;
        ensure_daily_reset(&mut state);
        info!(
            total = %state.total_capital,
            cash = %cash,
            positions = %open_position_value,
            "capital state initialized"
        );
    }

    /// Refresh total capital from cash plus current mark-to-market.
    /// Exclusion from P&L reporting never implies exclusion from risk
    /// accounting, so the caller passes the value of every open position.
    pub async fn rebalance(&self, cash: Decimal, open_position_value: Decimal) {
        let mut state = self.state.lock().await;
        state.cash = cash;
        state.total_capital = cash + open_position_value;
        if state.total_capital > state.peak_equity {
            state.peak_equity = state.total_capital;
        }
        ensure_daily_reset(&mut state);
    }

    pub async fn snapshot(&self) -> CapitalState {
        self.state.lock().await.clone()
    }

    pub async fn risk_state(&self) -> RiskState {
        *self.risk_state.lock().await
    }

    fn bucket_share(&self, bucket: StrategyKind) -> Decimal {
        match bucket {
            StrategyKind::Directional => self.allocation.directional_pct,
            StrategyKind::Arbitrage => self.allocation.arbitrage_pct,
            StrategyKind::Legacy => Decimal::ZERO,
        }
    }

    /// Re-evaluate the hard risk gates. A breach suppresses new sizing; the
    /// gate clears on a later cycle once the metric is back under its limit.
    pub async fn update_gates(&self, metrics: PortfolioMetrics) {
        let state = self.state.lock().await;

        let drawdown = if state.peak_equity > Decimal::ZERO {
            ((state.peak_equity - state.total_capital) / state.peak_equity)
                .to_f64()
                .unwrap_or(0.0)
        } else {
            0.0
        };

        let mut breaches: Vec<RiskError> = Vec::new();
        if metrics.volatility > self.risk.max_volatility {
            breaches.push(RiskError::GateBreached {
                gate: "portfolio_volatility",
                value: metrics.volatility,
                limit: self.risk.max_volatility,
            });
        }
        if metrics.category_concentration > self.risk.max_category_concentration {
            breaches.push(RiskError::GateBreached {
                gate: "category_concentration",
                value: metrics.category_concentration,
                limit: self.risk.max_category_concentration,
            });
        }
        if drawdown > self.risk.max_drawdown {
            breaches.push(RiskError::GateBreached {
                gate: "drawdown",
                value: drawdown,
                limit: self.risk.max_drawdown,
            });
        }
        if state.daily_realized_loss >= self.risk.daily_loss_limit {
            breaches.push(RiskError::DailyLossLimit {
                current: state.daily_realized_loss,
                limit: self.risk.daily_loss_limit,
            });
        }
        drop(state);

        let mut risk_state = self.risk_state.lock().await;
        if breaches.is_empty() {
            if *risk_state == RiskState::Suppressed {
                info!("risk gates cleared, new sizing re-enabled");
            }
            *risk_state = RiskState::Normal;
        } else {
            for breach in &breaches {
                error!(gate = %breach, "risk gate breached, new sizing suppressed");
            }
            *risk_state = RiskState::Suppressed;
        }
    }

    /// Size an entry and commit its notional atomically.
    ///
    /// Returns `Ok(None)` when the caps size the trade down to nothing, and
    /// `Err` when a gate or limit actively blocks it.
    pub async fn size_and_commit(
        &self,
        price: Decimal,
        probability: f64,
        confidence: f64,
        bucket: StrategyKind,
    ) -> Result<Option<Sizing>> {
        if !self.risk_state().await.can_open_new() {
            return Err(RiskError::TradingHalted {
                reason: "risk gate breached".to_string(),
            }
            .into());
        }
        if price <= Decimal::ZERO || price >= Decimal::ONE {
            return Ok(None);
        }

        let mut state = self.state.lock().await;
        ensure_daily_reset(&mut state);

        // Fractional Kelly for a binary contract bought at `price` paying $1:
        // f* = (q - p) / (1 - p), scaled by the configured fraction and the
        // model's confidence.
        let p = price.to_f64().unwrap_or(1.0);
        let f_star = ((probability - p) / (1.0 - p)).max(0.0);
        let kelly = self.risk.kelly_fraction.to_f64().unwrap_or(0.0) * f_star * confidence;
        let mut stake = state.total_capital
            * Decimal::from_f64(kelly).unwrap_or(Decimal::ZERO);

        // Cap 1: maximum percentage of total capital per position
        stake = stake.min(state.total_capital * self.risk.max_position_pct);

        // Cap 2: remaining capital in the strategy bucket
        let budget = state.total_capital * self.bucket_share(bucket);
        let committed = state.committed.get(&bucket).copied().unwrap_or_default();
        let bucket_remaining = (budget - committed).max(Decimal::ZERO);
        stake = stake.min(bucket_remaining);

        // Cap 3: cash reserve floor
        let floor = state.total_capital * self.risk.cash_reserve_pct;
        let spendable = (state.cash - floor).max(Decimal::ZERO);
        if spendable <= Decimal::ZERO {
            return Err(RiskError::CashReserveFloor {
                available: state.cash,
                floor,
            }
            .into());
        }
        stake = stake.min(spendable);

        let quantity = (stake / price).floor().to_u64().unwrap_or(0);
        if quantity == 0 {
            return Ok(None);
        }
        let notional = price * Decimal::from(quantity);

        // Committed across buckets never exceeds total capital
        if state.committed_total() + notional > state.total_capital {
            return Err(RiskError::MaxExposureExceeded {
                limit: state.total_capital,
                requested: state.committed_total() + notional,
            }
            .into());
        }

        *state.committed.entry(bucket).or_default() += notional;
        state.cash -= notional;

        Ok(Some(Sizing { quantity, notional }))
    }

    /// Commit a caller-computed notional (arbitrage sizing is depth-driven,
    /// not Kelly-driven). Enforces the same caps and invariant.
    pub async fn commit(&self, bucket: StrategyKind, notional: Decimal) -> Result<()> {
        if !self.risk_state().await.can_open_new() {
            return Err(RiskError::TradingHalted {
                reason: "risk gate breached".to_string(),
            }
            .into());
        }

        let mut state = self.state.lock().await;
        ensure_daily_reset(&mut state);

        let budget = state.total_capital * self.bucket_share(bucket);
        let committed = state.committed.get(&bucket).copied().unwrap_or_default();
        if committed + notional > budget {
            return Err(RiskError::BucketExhausted {
                bucket: bucket.as_str().to_string(),
                remaining: (budget - committed).max(Decimal::ZERO),
            }
            .into());
        }
        if state.committed_total() + notional > state.total_capital {
            return Err(RiskError::MaxExposureExceeded {
                limit: state.total_capital,
                requested: state.committed_total() + notional,
            }
            .into());
        }

        *state.committed.entry(bucket).or_default() += notional;
        state.cash -= notional;
        Ok(())
    }

    /// Remaining capital in a bucket, net of the cash-reserve floor
    pub async fn bucket_remaining(&self, bucket: StrategyKind) -> Decimal {
        let state = self.state.lock().await;
        let budget = state.total_capital * self.bucket_share(bucket);
        let committed = state.committed.get(&bucket).copied().unwrap_or_default();
        let floor = state.total_capital * self.risk.cash_reserve_pct;
        let spendable = (state.cash - floor).max(Decimal::ZERO);
        (budget - committed).max(Decimal::ZERO).min(spendable)
    }

    /// Release commitment when an order fails or a position closes
    pub async fn release(&self, bucket: StrategyKind, notional: Decimal) {
        let mut state = self.state.lock().await;
        let committed = state.committed.entry(bucket).or_default();
        *committed = (*committed - notional).max(Decimal::ZERO);
        state.cash += notional;
    }

    /// Record realized P&L from a closed position; losses count against the
    /// daily loss gate.
    pub async fn record_realized_pnl(&self, pnl: Decimal) {
        let mut state = self.state.lock().await;
        ensure_daily_reset(&mut state);
        if pnl < Decimal::ZERO {
            state.daily_realized_loss += -pnl;
            if state.daily_realized_loss >= self.risk.daily_loss_limit {
                let loss = state.daily_realized_loss;
                drop(state);
                warn!(loss = %loss, "daily loss limit reached");
                *self.risk_state.lock().await = RiskState::Suppressed;
            }
        }
    }

    /// Track daily forecast spend alongside the capital counters
    pub async fn record_forecast_spend(&self, cost: Decimal) {
        let mut state = self.state.lock().await;
        ensure_daily_reset(&mut state);
        state.daily_forecast_spend += cost;
    }

    pub fn max_open_positions(&self) -> u32 {
        self.risk.max_open_positions
    }
}

/// Reset daily counters on date change
fn ensure_daily_reset(state: &mut CapitalState) {
    let today = Utc::now().date_naive();
    if state.day != Some(today) {
        state.day = Some(today);
        state.daily_forecast_spend = Decimal::ZERO;
        state.daily_realized_loss = Decimal::ZERO;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_config;
    use rust_decimal_macros::dec;

    fn allocator() -> CapitalAllocator {
        let config = test_config();
        CapitalAllocator::new(config.risk, config.allocation)
    }

    #[tokio::test]
    async fn test_committed_never_exceeds_total() {
        let alloc = allocator();
        alloc.initialize(dec!(1000), dec!(0)).await;

        // Invariant holds before sizing
        let state = alloc.snapshot().await;
        assert!(state.committed_total() <= state.total_capital);

        let sizing = alloc
            .size_and_commit(dec!(0.50), 0.65, 0.8, StrategyKind::Directional)
            .await
            .unwrap()
            .expect("should size a positive quantity");
        assert!(sizing.quantity > 0);

        // And after
        let state = alloc.snapshot().await;
        assert!(state.committed_total() <= state.total_capital);
        assert_eq!(state.committed_total(), sizing.notional);
    }

    #[tokio::test]
    async fn test_max_position_cap_applies() {
        let alloc = allocator();
        alloc.initialize(dec!(1000), dec!(0)).await;

        // Huge edge would Kelly-size far beyond 5% of capital
        let sizing = alloc
            .size_and_commit(dec!(0.10), 0.95, 1.0, StrategyKind::Directional)
            .await
            .unwrap()
            .unwrap();
        // 5% of $1000 = $50 at $0.10 = 500 contracts
        assert!(sizing.notional <= dec!(50));
        assert_eq!(sizing.quantity, 500);
    }

    #[tokio::test]
    async fn test_bucket_exhaustion_caps_sizing() {
        let alloc = allocator();
        alloc.initialize(dec!(100), dec!(0)).await;

        // Arbitrage bucket is 40% = $40
        alloc.commit(StrategyKind::Arbitrage, dec!(35)).await.unwrap();
        let err = alloc.commit(StrategyKind::Arbitrage, dec!(10)).await;
        assert!(err.is_err());

        // Within the remainder is still fine
        alloc.commit(StrategyKind::Arbitrage, dec!(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_cash_reserve_floor_blocks() {
        let alloc = allocator();
        // Total $1000 but only $100 cash: floor is 15% of total = $150
        alloc.initialize(dec!(100), dec!(900)).await;

        let result = alloc
            .size_and_commit(dec!(0.50), 0.70, 0.8, StrategyKind::Directional)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_gate_breach_suppresses_then_clears() {
        let alloc = allocator();
        alloc.initialize(dec!(1000), dec!(0)).await;

        alloc
            .update_gates(PortfolioMetrics {
                volatility: 0.95,
                category_concentration: 0.1,
            })
            .await;
        assert_eq!(alloc.risk_state().await, RiskState::Suppressed);
        assert!(alloc
            .size_and_commit(dec!(0.50), 0.65, 0.8, StrategyKind::Directional)
            .await
            .is_err());

        // Metric back under the limit on a later cycle
        alloc
            .update_gates(PortfolioMetrics {
                volatility: 0.2,
                category_concentration: 0.1,
            })
            .await;
        assert_eq!(alloc.risk_state().await, RiskState::Normal);
        assert!(alloc
            .size_and_commit(dec!(0.50), 0.65, 0.8, StrategyKind::Directional)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_daily_loss_gate() {
        let alloc = allocator();
        alloc.initialize(dec!(1000), dec!(0)).await;

        alloc.record_realized_pnl(dec!(-150)).await;
        assert_eq!(alloc.risk_state().await, RiskState::Suppressed);
    }

    #[tokio::test]
    async fn test_release_returns_capital() {
        let alloc = allocator();
        alloc.initialize(dec!(1000), dec!(0)).await;

        alloc.commit(StrategyKind::Arbitrage, dec!(40)).await.unwrap();
        alloc.release(StrategyKind::Arbitrage, dec!(40)).await;

        let state = alloc.snapshot().await;
        assert_eq!(state.committed_total(), dec!(0));
        assert_eq!(state.cash, dec!(1000));
    }

    #[tokio::test]
    async fn test_no_edge_sizes_to_nothing() {
        let alloc = allocator();
        alloc.initialize(dec!(1000), dec!(0)).await;

        // Forecast probability below the price: no Kelly stake
        let sizing = alloc
            .size_and_commit(dec!(0.60), 0.55, 0.8, StrategyKind::Directional)
            .await
            .unwrap();
        assert!(sizing.is_none());
    }

    #[test]
    fn test_portfolio_metrics_concentration() {
        let metrics = portfolio_metrics(&[
            Exposure {
                current_price: dec!(0.50),
                value: dec!(90),
                category: "politics".to_string(),
            },
            Exposure {
                current_price: dec!(0.50),
                value: dec!(10),
                category: "sports".to_string(),
            },
        ]);
        assert!((metrics.category_concentration - 0.9).abs() < 1e-9);
        // sqrt(0.25) = 0.5 at even odds
        assert!((metrics.volatility - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_empty_portfolio_metrics() {
        let metrics = portfolio_metrics(&[]);
        assert_eq!(metrics.volatility, 0.0);
        assert_eq!(metrics.category_concentration, 0.0);
    }
}
