//! Exit-plan computation
//!
//! Derives the stop-loss, take-profit, max-hold and confidence-drift levels
//! embedded in each new position. Stops tighten with confidence and widen
//! with volatility; hold time is bounded by half the remaining life of the
//! market.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::domain::{ExitPlan, Market, Side};

const MIN_STOP_LOSS_PCT: f64 = 0.05;
const DEFAULT_STOP_LOSS_PCT: f64 = 0.07;
const MAX_STOP_LOSS_PCT: f64 = 0.10;

const MIN_TAKE_PROFIT_PCT: f64 = 0.15;
const DEFAULT_TAKE_PROFIT_PCT: f64 = 0.20;
const MAX_TAKE_PROFIT_PCT: f64 = 0.30;

const MIN_HOLD_HOURS: i64 = 6;
const MAX_HOLD_HOURS: i64 = 72;

const DEFAULT_CONFIDENCE_DELTA: f64 = 0.15;

#[derive(Debug, Clone, Copy)]
pub struct ExitPlanner;

impl ExitPlanner {
    /// Compute exit levels for a new entry.
    ///
    /// Holding either side is a long position in that contract: the stop is
    /// always below entry and the take-profit above it.
    pub fn plan(
        entry_price: Decimal,
        confidence: f64,
        market_volatility: f64,
        time_to_expiry_days: f64,
    ) -> ExitPlan {
        let stop_pct = if confidence >= 0.8 {
            MIN_STOP_LOSS_PCT
        } else if confidence >= 0.6 {
            DEFAULT_STOP_LOSS_PCT
        } else {
            MAX_STOP_LOSS_PCT
        };
        // Wider stops in volatile markets so noise does not shake us out
        let volatility_adjustment = (1.0 + (market_volatility - 0.2)).clamp(1.0, 1.5);
        let stop_pct = stop_pct * volatility_adjustment;

        let take_pct = if confidence >= 0.8 {
            MAX_TAKE_PROFIT_PCT
        } else if confidence >= 0.6 {
            DEFAULT_TAKE_PROFIT_PCT
        } else {
            MIN_TAKE_PROFIT_PCT
        };

        let stop_loss_price = clamp_price(
            entry_price * Decimal::from_f64(1.0 - stop_pct).unwrap_or(dec!(0.93)),
        );
        let take_profit_price = clamp_price(
            entry_price * Decimal::from_f64(1.0 + take_pct).unwrap_or(dec!(1.20)),
        );

        // Hold at most half the market's remaining life, within fixed bounds
        let half_life_hours = (time_to_expiry_days * 24.0 * 0.5) as i64;
        let max_hold_hours = half_life_hours.clamp(MIN_HOLD_HOURS, MAX_HOLD_HOURS);

        ExitPlan {
            stop_loss_price,
            take_profit_price,
            max_hold_hours,
            confidence_delta: DEFAULT_CONFIDENCE_DELTA,
        }
    }

    /// Conservative plan for positions found without one (legacy imports)
    pub fn default_plan(entry_price: Decimal) -> ExitPlan {
        ExitPlan {
            stop_loss_price: clamp_price(entry_price * dec!(0.90)),
            take_profit_price: clamp_price(entry_price * dec!(1.20)),
            max_hold_hours: 48,
            confidence_delta: DEFAULT_CONFIDENCE_DELTA,
        }
    }

    /// Volatility estimate for a binary market: the intrinsic `sqrt(p(1-p))`
    /// term scaled down for liquid markets and up for long-dated ones.
    pub fn estimate_volatility(market: &Market, now: DateTime<Utc>) -> f64 {
        use rust_decimal::prelude::ToPrimitive;

        let price = market
            .implied_price(Side::Yes)
            .to_f64()
            .unwrap_or(0.5)
            .clamp(0.01, 0.99);
        let intrinsic = (price * (1.0 - price)).sqrt();

        let volume = market.volume.to_f64().unwrap_or(0.0);
        let volume_factor = (1000.0 / (volume + 100.0)).clamp(0.5, 2.0);

        let time_factor = (market.days_to_expiry(now) / 7.0).sqrt().clamp(0.5, 2.0);

        (intrinsic * volume_factor * time_factor).clamp(0.05, 0.50)
    }
}

fn clamp_price(price: Decimal) -> Decimal {
    price.round_dp(2).clamp(dec!(0.01), dec!(0.99))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::MarketStatus;

    #[test]
    fn test_high_confidence_tightens_stop() {
        let confident = ExitPlanner::plan(dec!(0.50), 0.85, 0.2, 10.0);
        let hesitant = ExitPlanner::plan(dec!(0.50), 0.55, 0.2, 10.0);
        assert!(confident.stop_loss_price > hesitant.stop_loss_price);
        assert!(confident.take_profit_price > hesitant.take_profit_price);
    }

    #[test]
    fn test_volatility_widens_stop() {
        let calm = ExitPlanner::plan(dec!(0.50), 0.7, 0.2, 10.0);
        let choppy = ExitPlanner::plan(dec!(0.50), 0.7, 0.5, 10.0);
        assert!(choppy.stop_loss_price < calm.stop_loss_price);
    }

    #[test]
    fn test_hold_bounded_by_market_life() {
        // 1 day to expiry: half-life is 12h
        let short = ExitPlanner::plan(dec!(0.50), 0.7, 0.2, 1.0);
        assert_eq!(short.max_hold_hours, 12);

        // 30 days to expiry: capped at 72h
        let long = ExitPlanner::plan(dec!(0.50), 0.7, 0.2, 30.0);
        assert_eq!(long.max_hold_hours, MAX_HOLD_HOURS);

        // Hours to expiry: floor at 6h
        let tiny = ExitPlanner::plan(dec!(0.50), 0.7, 0.2, 0.1);
        assert_eq!(tiny.max_hold_hours, MIN_HOLD_HOURS);
    }

    #[test]
    fn test_levels_stay_in_price_range() {
        let plan = ExitPlanner::plan(dec!(0.95), 0.85, 0.2, 10.0);
        assert!(plan.take_profit_price <= dec!(0.99));

        let plan = ExitPlanner::plan(dec!(0.03), 0.5, 0.5, 10.0);
        assert!(plan.stop_loss_price >= dec!(0.01));
    }

    #[test]
    fn test_volatility_peaks_at_even_odds() {
        let now = Utc::now();
        let mut market = crate::domain::Market {
            id: "MKT-A".to_string(),
            event_id: "EVT-A".to_string(),
            title: "t".to_string(),
            category: "c".to_string(),
            yes_bid: dec!(0.49),
            yes_ask: dec!(0.50),
            no_bid: dec!(0.49),
            no_ask: dec!(0.50),
            last_price: dec!(0.50),
            volume: dec!(1000),
            expiration: now + chrono::Duration::days(7),
            status: MarketStatus::Open,
            result: None,
            fetched_at: now,
        };
        let at_even = ExitPlanner::estimate_volatility(&market, now);

        market.yes_ask = dec!(0.90);
        let at_edge = ExitPlanner::estimate_volatility(&market, now);
        assert!(at_even > at_edge);
    }
}
