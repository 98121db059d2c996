//! Injectable fee model
//!
//! Profit-threshold checks must reflect per-leg taker fees, not a single
//! blended fee on notional. The schedule is constructed from configuration
//! and passed into the scanner and executor; swapping in a tiered schedule
//! touches only this module.

use rust_decimal::Decimal;

use crate::config::FeesConfig;

/// Flat maker/taker fee schedule on notional
#[derive(Debug, Clone, Copy)]
pub struct FeeSchedule {
    pub maker_rate: Decimal,
    pub taker_rate: Decimal,
}

impl FeeSchedule {
    pub fn new(maker_rate: Decimal, taker_rate: Decimal) -> Self {
        Self {
            maker_rate,
            taker_rate,
        }
    }

    pub fn from_config(config: &FeesConfig) -> Self {
        Self::new(config.maker_rate, config.taker_rate)
    }

    /// Taker fee for one fill of `quantity` at `price`
    pub fn taker_fee(&self, price: Decimal, quantity: u64) -> Decimal {
        price * Decimal::from(quantity) * self.taker_rate
    }

    /// Per-unit taker fee summed across the legs of a group.
    ///
    /// Each leg is charged on its own price; this is what makes a
    /// near-threshold group correctly fail when a blended rate would pass it.
    pub fn group_taker_fee_per_unit(&self, leg_prices: &[Decimal]) -> Decimal {
        leg_prices
            .iter()
            .map(|price| *price * self.taker_rate)
            .sum()
    }
}
