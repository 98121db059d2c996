use serde::{Deserialize, Serialize};
use std::fmt;

/// Position lifecycle states evaluated by the tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PositionLifecycle {
    /// Position open, exit conditions evaluated every cycle
    Open,
    /// Exit triggered, closing order placed but not yet confirmed
    Exiting,
    /// Closing order confirmed, position finalized
    Closed,
}

impl PositionLifecycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionLifecycle::Open => "OPEN",
            PositionLifecycle::Exiting => "EXITING",
            PositionLifecycle::Closed => "CLOSED",
        }
    }

    /// Check if this state can transition to another state
    pub fn can_transition_to(&self, target: PositionLifecycle) -> bool {
        use PositionLifecycle::*;

        match (self, target) {
            (Open, Exiting) => true,
            (Exiting, Closed) => true,
            // Exit order failed; retry next cycle
            (Exiting, Open) => true,
            // Closed is terminal
            _ => false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PositionLifecycle::Closed)
    }
}

impl fmt::Display for PositionLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Why a position is being exited
///
/// Variants are ordered by priority: when several conditions hold at once,
/// the lowest `priority()` value wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    /// Market resolved or closed; exit at settlement value
    MarketResolved,
    StopLoss,
    TakeProfit,
    MaxHoldExceeded,
    ConfidenceDrift,
}

impl ExitReason {
    pub fn priority(&self) -> u8 {
        match self {
            ExitReason::MarketResolved => 0,
            ExitReason::StopLoss => 1,
            ExitReason::TakeProfit => 2,
            ExitReason::MaxHoldExceeded => 3,
            ExitReason::ConfidenceDrift => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::MarketResolved => "market_resolved",
            ExitReason::StopLoss => "stop_loss",
            ExitReason::TakeProfit => "take_profit",
            ExitReason::MaxHoldExceeded => "max_hold_exceeded",
            ExitReason::ConfidenceDrift => "confidence_drift",
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Risk engine state gating new position opening
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskState {
    /// Normal operation
    Normal,
    /// A hard gate is breached; new sizing suppressed until it clears
    Suppressed,
}

impl RiskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskState::Normal => "NORMAL",
            RiskState::Suppressed => "SUPPRESSED",
        }
    }

    /// Gate breaches never block existing-position closing
    pub fn can_open_new(&self) -> bool {
        matches!(self, RiskState::Normal)
    }
}

impl fmt::Display for RiskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_transitions() {
        use PositionLifecycle::*;

        assert!(Open.can_transition_to(Exiting));
        assert!(Exiting.can_transition_to(Closed));
        assert!(Exiting.can_transition_to(Open));

        // Closed is monotonic: no way back
        assert!(!Closed.can_transition_to(Open));
        assert!(!Closed.can_transition_to(Exiting));
        assert!(!Open.can_transition_to(Closed));
    }

    #[test]
    fn test_exit_reason_priority_order() {
        assert!(ExitReason::MarketResolved.priority() < ExitReason::StopLoss.priority());
        assert!(ExitReason::StopLoss.priority() < ExitReason::TakeProfit.priority());
        assert!(ExitReason::TakeProfit.priority() < ExitReason::MaxHoldExceeded.priority());
        assert!(ExitReason::MaxHoldExceeded.priority() < ExitReason::ConfidenceDrift.priority());
    }

    #[test]
    fn test_risk_state_gating() {
        assert!(RiskState::Normal.can_open_new());
        assert!(!RiskState::Suppressed.can_open_new());
    }
}
