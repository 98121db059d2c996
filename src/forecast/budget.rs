use rust_decimal::Decimal;

/// Daily forecast-spend guard.
///
/// The decision stage consults this before every reasoning call; spend is
/// accumulated in the analysis audit trail and read back each cycle, so the
/// budget survives restarts.
#[derive(Debug, Clone, Copy)]
pub struct BudgetTracker {
    daily_limit: Decimal,
    per_decision_limit: Decimal,
}

impl BudgetTracker {
    pub fn new(daily_limit: Decimal, per_decision_limit: Decimal) -> Self {
        Self {
            daily_limit,
            per_decision_limit,
        }
    }

    /// True when today's accumulated spend has used up the daily budget
    pub fn is_exhausted(&self, spent_today: Decimal) -> bool {
        spent_today >= self.daily_limit
    }

    pub fn remaining(&self, spent_today: Decimal) -> Decimal {
        (self.daily_limit - spent_today).max(Decimal::ZERO)
    }

    /// True when one decision's accumulated cost exceeds its own ceiling
    pub fn decision_over_limit(&self, decision_cost: Decimal) -> bool {
        decision_cost > self.per_decision_limit
    }

    pub fn daily_limit(&self) -> Decimal {
        self.daily_limit
    }
}
