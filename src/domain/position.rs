use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::Side;

/// Strategy bucket a position's capital is drawn from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Forecast-driven single-leg trades
    Directional,
    /// Multi-leg mutually-exclusive-group trades
    Arbitrage,
    /// Pre-existing positions imported by the startup sync
    Legacy,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::Directional => "directional",
            StrategyKind::Arbitrage => "arbitrage",
            StrategyKind::Legacy => "legacy",
        }
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for StrategyKind {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "directional" => Ok(StrategyKind::Directional),
            "arbitrage" => Ok(StrategyKind::Arbitrage),
            "legacy" => Ok(StrategyKind::Legacy),
            _ => Err(format!("Unknown strategy: {}", s)),
        }
    }
}

/// Position status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    Open,
    Closed,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Open => "open",
            PositionStatus::Closed => "closed",
        }
    }
}

impl TryFrom<&str> for PositionStatus {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "open" => Ok(PositionStatus::Open),
            "closed" => Ok(PositionStatus::Closed),
            _ => Err(format!("Unknown position status: {}", s)),
        }
    }
}

/// Exit-strategy descriptor embedded in each position
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ExitPlan {
    pub stop_loss_price: Decimal,
    pub take_profit_price: Decimal,
    pub max_hold_hours: i64,
    /// Exit when confidence has drifted by more than this since entry
    pub confidence_delta: f64,
}

/// A proposed trade emitted by the decision stage, not yet an order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeIntent {
    pub market_id: String,
    pub side: Side,
    pub target_price: Decimal,
    pub confidence: f64,
    /// Forecast probability minus the market-implied price
    pub edge: f64,
    pub rationale: String,
    pub strategy: StrategyKind,
    pub exit_plan: ExitPlan,
}

/// Open or closed holding in one market
///
/// Created by execution or the startup sync; status and close price are
/// mutated only by the tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: Option<i64>,
    pub market_id: String,
    pub side: Side,
    pub entry_price: Decimal,
    pub quantity: u64,
    pub opened_at: DateTime<Utc>,
    pub strategy: StrategyKind,
    pub status: PositionStatus,
    /// Participates in performance accounting when true; always participates
    /// in monitoring and capital accounting regardless of value.
    pub tracked: bool,
    pub confidence: f64,
    pub rationale: String,
    /// Shared opportunity id linking arbitrage legs
    pub group_id: Option<String>,
    pub exit_plan: Option<ExitPlan>,
    pub closed_at: Option<DateTime<Utc>>,
    pub exit_price: Option<Decimal>,
}

impl Position {
    /// Cost basis of the open quantity
    pub fn cost_basis(&self) -> Decimal {
        self.entry_price * Decimal::from(self.quantity)
    }

    /// Mark-to-market value at a current price
    pub fn market_value(&self, current_price: Decimal) -> Decimal {
        current_price * Decimal::from(self.quantity)
    }

    /// Unrealized P&L at a current price
    pub fn unrealized_pnl(&self, current_price: Decimal) -> Decimal {
        (current_price - self.entry_price) * Decimal::from(self.quantity)
    }

    pub fn hold_duration_hours(&self, now: DateTime<Utc>) -> i64 {
        (now - self.opened_at).num_hours()
    }
}

/// Closed-trade record, created only when a tracked position closes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeLog {
    pub id: Option<i64>,
    pub position_id: i64,
    pub market_id: String,
    pub side: Side,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub quantity: u64,
    pub pnl: Decimal,
    pub strategy: StrategyKind,
    pub exit_reason: String,
    /// Realized exit price minus the planned exit level, when a plan existed
    pub slippage: Option<Decimal>,
    pub entry_at: DateTime<Utc>,
    pub exit_at: DateTime<Utc>,
}

impl TradeLog {
    pub fn duration_hours(&self) -> i64 {
        (self.exit_at - self.entry_at).num_hours()
    }

    pub fn is_win(&self) -> bool {
        self.pnl > Decimal::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn test_position() -> Position {
        Position {
            id: Some(1),
            market_id: "MKT-TEST".to_string(),
            side: Side::Yes,
            entry_price: dec!(0.40),
            quantity: 100,
            opened_at: Utc::now() - chrono::Duration::hours(5),
            strategy: StrategyKind::Directional,
            status: PositionStatus::Open,
            tracked: true,
            confidence: 0.7,
            rationale: "test".to_string(),
            group_id: None,
            exit_plan: None,
            closed_at: None,
            exit_price: None,
        }
    }

    #[test]
    fn test_unrealized_pnl() {
        let position = test_position();
        assert_eq!(position.unrealized_pnl(dec!(0.55)), dec!(15));
        assert_eq!(position.unrealized_pnl(dec!(0.30)), dec!(-10));
    }

    #[test]
    fn test_cost_basis_and_value() {
        let position = test_position();
        assert_eq!(position.cost_basis(), dec!(40));
        assert_eq!(position.market_value(dec!(0.50)), dec!(50));
    }

    #[test]
    fn test_hold_duration() {
        let position = test_position();
        assert_eq!(position.hold_duration_hours(Utc::now()), 5);
    }
}
