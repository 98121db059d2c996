//! Decision stage
//!
//! Runs the forecast pipeline for one market under cost controls and turns
//! the result into a trade intent when confidence and edge clear their
//! thresholds. Every analysis outcome lands in the audit trail with its cost
//! and the verbatim raw response.

use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal_macros::dec;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::allocator::CapitalAllocator;
use super::exits::ExitPlanner;
use crate::config::TradingConfig;
use crate::domain::{Market, Side, StrategyKind, TradeIntent};
use crate::error::Result;
use crate::forecast::{BudgetTracker, ForecastClient, ForecastOutcome, MarketContext};
use crate::persistence::{AnalysisRecord, Store};

pub struct DecisionEngine {
    forecast: Arc<dyn ForecastClient>,
    store: Arc<dyn Store>,
    allocator: Arc<CapitalAllocator>,
    config: TradingConfig,
    budget: BudgetTracker,
}

impl DecisionEngine {
    pub fn new(
        forecast: Arc<dyn ForecastClient>,
        store: Arc<dyn Store>,
        allocator: Arc<CapitalAllocator>,
        config: TradingConfig,
    ) -> Self {
        let budget = BudgetTracker::new(config.daily_forecast_budget, config.max_cost_per_decision);
        Self {
            forecast,
            store,
            allocator,
            config,
            budget,
        }
    }

    /// Evaluate one market; `None` means no trade this cycle.
    pub async fn evaluate(&self, market: &Market) -> Result<Option<TradeIntent>> {
        // Pre-flight checks run before any forecast spend.
        let spent_today = self.store.daily_forecast_cost().await?;
        if self.budget.is_exhausted(spent_today) {
            warn!(
                market_id = %market.id,
                spent = %spent_today,
                limit = %self.budget.daily_limit(),
                "daily forecast budget exhausted, skipping analysis"
            );
            return Ok(None);
        }

        if self
            .store
            .was_recently_analyzed(&market.id, self.config.analysis_cooldown_hours)
            .await?
        {
            debug!(market_id = %market.id, "analyzed within cooldown window, skipping");
            return Ok(None);
        }

        let analyses_today = self.store.analysis_count_today(&market.id).await?;
        if analyses_today >= self.config.max_analyses_per_market_per_day {
            debug!(
                market_id = %market.id,
                analyses_today,
                "per-market daily analysis cap reached, skipping"
            );
            return Ok(None);
        }

        if self
            .store
            .get_open_position_for_market(&market.id)
            .await?
            .is_some()
        {
            debug!(market_id = %market.id, "open position exists, skipping analysis");
            return Ok(None);
        }

        // Both quotes hugging 50c means no edge worth paying for
        let yes_price = market.implied_price(Side::Yes);
        let no_price = market.implied_price(Side::No);
        let closest_to_even = (yes_price - dec!(0.50))
            .abs()
            .min((no_price - dec!(0.50)).abs());
        if closest_to_even < dec!(0.05) {
            debug!(market_id = %market.id, "market too balanced, skipping analysis");
            return Ok(None);
        }

        let now = Utc::now();
        if market.hours_to_expiry(now) < 1.0 {
            debug!(market_id = %market.id, "expires within the hour, skipping analysis");
            return Ok(None);
        }

        // Forecast call. Gateway failures abstain rather than propagate.
        let context = MarketContext::from_market(market);
        let response = match self.forecast.analyze(&context).await {
            Ok(response) => response,
            Err(err) => {
                warn!(market_id = %market.id, stage = "decision", error = %err, "forecast call failed");
                self.store
                    .record_market_analysis(&AnalysisRecord {
                        market_id: market.id.clone(),
                        action: "error".to_string(),
                        confidence: 0.0,
                        cost: dec!(0),
                        detail: Some(err.to_string()),
                        raw_response: None,
                    })
                    .await?;
                return Ok(None);
            }
        };

        self.allocator.record_forecast_spend(response.cost).await;

        if self.budget.decision_over_limit(response.cost) {
            warn!(
                market_id = %market.id,
                cost = %response.cost,
                "analysis cost exceeded per-decision ceiling"
            );
            self.store
                .record_market_analysis(&AnalysisRecord {
                    market_id: market.id.clone(),
                    action: "cost_limited".to_string(),
                    confidence: 0.0,
                    cost: response.cost,
                    detail: None,
                    raw_response: Some(response.raw_response.clone()),
                })
                .await?;
            return Ok(None);
        }

        let parsed = match &response.outcome {
            ForecastOutcome::Parsed(parsed) => parsed.clone(),
            ForecastOutcome::Unparseable => {
                warn!(market_id = %market.id, "forecast response unparseable, abstaining");
                self.store
                    .record_market_analysis(&AnalysisRecord {
                        market_id: market.id.clone(),
                        action: "unparseable".to_string(),
                        confidence: 0.0,
                        cost: response.cost,
                        detail: None,
                        raw_response: Some(response.raw_response.clone()),
                    })
                    .await?;
                return Ok(None);
            }
        };

        // Pick the side where the forecast disagrees with the price
        let yes_edge = parsed.probability - yes_price.to_f64().unwrap_or(1.0);
        let no_edge = (1.0 - parsed.probability) - no_price.to_f64().unwrap_or(1.0);
        let (side, edge, price) = if yes_edge >= no_edge {
            (Side::Yes, yes_edge, yes_price)
        } else {
            (Side::No, no_edge, no_price)
        };

        let tradable =
            parsed.confidence >= self.config.min_confidence && edge >= self.config.min_edge;

        self.store
            .record_market_analysis(&AnalysisRecord {
                market_id: market.id.clone(),
                action: if tradable { "trade" } else { "skip" }.to_string(),
                confidence: parsed.confidence,
                cost: response.cost,
                detail: Some(format!("side={side} edge={edge:.3}")),
                raw_response: Some(response.raw_response.clone()),
            })
            .await?;

        if !tradable {
            debug!(
                market_id = %market.id,
                confidence = parsed.confidence,
                edge,
                "below confidence/edge thresholds"
            );
            return Ok(None);
        }

        let volatility = ExitPlanner::estimate_volatility(market, now);
        let exit_plan = ExitPlanner::plan(
            price,
            parsed.confidence,
            volatility,
            market.days_to_expiry(now),
        );

        info!(
            market_id = %market.id,
            side = %side,
            price = %price,
            confidence = parsed.confidence,
            edge,
            "trade intent emitted"
        );

        Ok(Some(TradeIntent {
            market_id: market.id.clone(),
            side,
            target_price: price,
            confidence: parsed.confidence,
            edge,
            rationale: parsed.rationale,
            strategy: StrategyKind::Directional,
            exit_plan,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_config;
    use crate::domain::MarketStatus;
    use crate::forecast::{ForecastResponse, MockForecastClient, ParsedForecast};
    use crate::persistence::MockStore;
    use rust_decimal::Decimal;

    fn market(yes_ask: Decimal, no_ask: Decimal) -> Market {
        Market {
            id: "MKT-TEST".to_string(),
            event_id: "EVT-TEST".to_string(),
            title: "Test market".to_string(),
            category: "politics".to_string(),
            yes_bid: yes_ask - dec!(0.02),
            yes_ask,
            no_bid: no_ask - dec!(0.02),
            no_ask,
            last_price: yes_ask,
            volume: dec!(5000),
            expiration: Utc::now() + chrono::Duration::days(7),
            status: MarketStatus::Open,
            result: None,
            fetched_at: Utc::now(),
        }
    }

    fn permissive_store() -> MockStore {
        let mut store = MockStore::new();
        store.expect_daily_forecast_cost().returning(|| Ok(dec!(0)));
        store.expect_was_recently_analyzed().returning(|_, _| Ok(false));
        store.expect_analysis_count_today().returning(|_| Ok(0));
        store
            .expect_get_open_position_for_market()
            .returning(|_| Ok(None));
        store
            .expect_record_market_analysis()
            .returning(|_| Ok(()));
        store
    }

    fn forecaster(probability: f64, confidence: f64) -> MockForecastClient {
        let mut forecast = MockForecastClient::new();
        forecast.expect_analyze().returning(move |_| {
            Ok(ForecastResponse {
                outcome: ForecastOutcome::Parsed(ParsedForecast {
                    probability,
                    confidence,
                    rationale: "test rationale".to_string(),
                }),
                cost: dec!(0.02),
                raw_response: "{}".to_string(),
            })
        });
        forecast
    }

    fn engine(forecast: MockForecastClient, store: MockStore) -> DecisionEngine {
        let config = test_config();
        let allocator = Arc::new(CapitalAllocator::new(config.risk, config.allocation));
        DecisionEngine::new(
            Arc::new(forecast),
            Arc::new(store),
            allocator,
            config.trading,
        )
    }

    #[tokio::test]
    async fn test_insufficient_edge_emits_no_intent() {
        // Forecast confidence 0.55, YES edge 6% against an 8% threshold
        let market = market(dec!(0.40), dec!(0.62));
        let engine = engine(forecaster(0.46, 0.55), permissive_store());

        let intent = engine.evaluate(&market).await.unwrap();
        assert!(intent.is_none());
    }

    #[tokio::test]
    async fn test_sufficient_edge_emits_intent() {
        // Forecast 0.55 vs YES at 0.40: 15% edge, confidence 0.75
        let market = market(dec!(0.40), dec!(0.62));
        let engine = engine(forecaster(0.55, 0.75), permissive_store());

        let intent = engine.evaluate(&market).await.unwrap().unwrap();
        assert_eq!(intent.side, Side::Yes);
        assert_eq!(intent.target_price, dec!(0.40));
        assert!(intent.edge > 0.14);
        assert_eq!(intent.strategy, StrategyKind::Directional);
        assert!(intent.exit_plan.stop_loss_price < dec!(0.40));
    }

    #[tokio::test]
    async fn test_no_side_picked_when_forecast_favors_no() {
        // Forecast 0.25 on a YES=0.40 market: NO at 0.62 has a 13% edge
        let market = market(dec!(0.40), dec!(0.62));
        let engine = engine(forecaster(0.25, 0.80), permissive_store());

        let intent = engine.evaluate(&market).await.unwrap().unwrap();
        assert_eq!(intent.side, Side::No);
        assert_eq!(intent.target_price, dec!(0.62));
    }

    #[tokio::test]
    async fn test_budget_exhaustion_skips_before_forecast() {
        let market = market(dec!(0.40), dec!(0.62));
        let mut store = MockStore::new();
        store.expect_daily_forecast_cost().returning(|| Ok(dec!(10)));

        // Forecast client must never be called
        let mut forecast = MockForecastClient::new();
        forecast.expect_analyze().never();

        let engine = engine(forecast, store);
        assert!(engine.evaluate(&market).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cooldown_skips_before_forecast() {
        let market = market(dec!(0.40), dec!(0.62));
        let mut store = MockStore::new();
        store.expect_daily_forecast_cost().returning(|| Ok(dec!(0)));
        store.expect_was_recently_analyzed().returning(|_, _| Ok(true));

        let mut forecast = MockForecastClient::new();
        forecast.expect_analyze().never();

        let engine = engine(forecast, store);
        assert!(engine.evaluate(&market).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_balanced_market_skipped_without_forecast() {
        // Both quotes within 5c of even money
        let market = market(dec!(0.52), dec!(0.52));
        let mut forecast = MockForecastClient::new();
        forecast.expect_analyze().never();

        let engine = engine(forecast, permissive_store());
        assert!(engine.evaluate(&market).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unparseable_forecast_abstains_and_audits() {
        let market = market(dec!(0.40), dec!(0.62));
        let mut store = MockStore::new();
        store.expect_daily_forecast_cost().returning(|| Ok(dec!(0)));
        store.expect_was_recently_analyzed().returning(|_, _| Ok(false));
        store.expect_analysis_count_today().returning(|_| Ok(0));
        store
            .expect_get_open_position_for_market()
            .returning(|_| Ok(None));
        store
            .expect_record_market_analysis()
            .withf(|record| {
                record.action == "unparseable"
                    && record.raw_response.as_deref() == Some("the market feels bullish")
            })
            .times(1)
            .returning(|_| Ok(()));

        let mut forecast = MockForecastClient::new();
        forecast.expect_analyze().returning(|_| {
            Ok(ForecastResponse {
                outcome: ForecastOutcome::Unparseable,
                cost: dec!(0.02),
                raw_response: "the market feels bullish".to_string(),
            })
        });

        let engine = engine(forecast, store);
        assert!(engine.evaluate(&market).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_existing_position_blocks_reanalysis() {
        let market = market(dec!(0.40), dec!(0.62));
        let mut store = MockStore::new();
        store.expect_daily_forecast_cost().returning(|| Ok(dec!(0)));
        store.expect_was_recently_analyzed().returning(|_, _| Ok(false));
        store.expect_analysis_count_today().returning(|_| Ok(0));
        store.expect_get_open_position_for_market().returning(|_| {
            Ok(Some(crate::domain::Position {
                id: Some(1),
                market_id: "MKT-TEST".to_string(),
                side: Side::Yes,
                entry_price: dec!(0.40),
                quantity: 10,
                opened_at: Utc::now(),
                strategy: StrategyKind::Directional,
                status: crate::domain::PositionStatus::Open,
                tracked: true,
                confidence: 0.7,
                rationale: String::new(),
                group_id: None,
                exit_plan: None,
                closed_at: None,
                exit_price: None,
            }))
        });

        let mut forecast = MockForecastClient::new();
        forecast.expect_analyze().never();

        let engine = engine(forecast, store);
        assert!(engine.evaluate(&market).await.unwrap().is_none());
    }
}
