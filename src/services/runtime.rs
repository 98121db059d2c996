//! Runtime orchestrator
//!
//! Spawns the fixed set of cyclic tasks: the trade cycle (ingestion,
//! arbitrage, decision, execution) on one cadence, the tracker on a faster
//! cadence, evaluation on a slow cadence. No two cycles of the same stage
//! ever overlap; a supervisory timeout forcibly ends an overrunning cycle.

use futures::stream::{self, StreamExt};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::domain::{Market, Position, TradeIntent};
use crate::error::{ProphetError, Result};
use crate::exchange::ExchangeClient;
use crate::forecast::ForecastClient;
use crate::persistence::Store;
use crate::strategy::{
    portfolio_metrics, ArbitrageScanner, CapitalAllocator, DecisionEngine, Exposure, FeeSchedule,
    IngestionStage, OrderExecutor, PerformanceEvaluator, PositionTracker,
};

use super::StartupSync;

pub struct TradingRuntime {
    config: AppConfig,
    exchange: Arc<dyn ExchangeClient>,
    store: Arc<dyn Store>,
    allocator: Arc<CapitalAllocator>,
    ingestion: Arc<IngestionStage>,
    decision: Arc<DecisionEngine>,
    executor: Arc<OrderExecutor>,
    arbitrage: Arc<ArbitrageScanner>,
    tracker: Arc<PositionTracker>,
    evaluator: Arc<PerformanceEvaluator>,
    sync: Arc<StartupSync>,
}

impl TradingRuntime {
    pub fn new(
        config: AppConfig,
        exchange: Arc<dyn ExchangeClient>,
        store: Arc<dyn Store>,
        forecast: Arc<dyn ForecastClient>,
    ) -> Self {
        let allocator = Arc::new(CapitalAllocator::new(
            config.risk.clone(),
            config.allocation.clone(),
        ));
        let fees = FeeSchedule::from_config(&config.fees);

        let ingestion = Arc::new(IngestionStage::new(
            exchange.clone(),
            store.clone(),
            config.trading.clone(),
            config.exchange.page_size,
        ));
        let decision = Arc::new(DecisionEngine::new(
            forecast,
            store.clone(),
            allocator.clone(),
            config.trading.clone(),
        ));
        let executor = Arc::new(OrderExecutor::new(
            exchange.clone(),
            store.clone(),
            allocator.clone(),
            config.execution.clone(),
        ));
        let arbitrage = Arc::new(ArbitrageScanner::new(
            exchange.clone(),
            store.clone(),
            allocator.clone(),
            fees,
            config.arbitrage.clone(),
        ));
        let tracker = Arc::new(PositionTracker::new(
            exchange.clone(),
            store.clone(),
            allocator.clone(),
            executor.clone(),
        ));
        let evaluator = Arc::new(PerformanceEvaluator::new(store.clone()));
        let sync = Arc::new(StartupSync::new(
            exchange.clone(),
            store.clone(),
            allocator.clone(),
        ));

        Self {
            config,
            exchange,
            store,
            allocator,
            ingestion,
            decision,
            executor,
            arbitrage,
            tracker,
            evaluator,
            sync,
        }
    }

    pub fn allocator(&self) -> Arc<CapitalAllocator> {
        self.allocator.clone()
    }

    /// Run the startup sync, then the three cyclic tasks until shutdown.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Result<()> {
        self.sync.run().await?;

        let trade = tokio::spawn(Self::cycle_loop(
            self.clone(),
            "trade",
            self.config.schedule.trade_interval_secs,
            shutdown.clone(),
            |runtime| Box::pin(async move { runtime.trade_cycle().await }),
        ));
        let track = tokio::spawn(Self::cycle_loop(
            self.clone(),
            "tracker",
            self.config.schedule.tracker_interval_secs,
            shutdown.clone(),
            |runtime| Box::pin(async move { runtime.tracker.run_cycle().await.map(|_| ()) }),
        ));
        let evaluate = tokio::spawn(Self::cycle_loop(
            self.clone(),
            "evaluation",
            self.config.schedule.evaluation_interval_secs,
            shutdown,
            |runtime| Box::pin(async move { runtime.evaluator.run_cycle().await.map(|_| ()) }),
        ));

        let (trade, track, evaluate) = tokio::join!(trade, track, evaluate);
        for result in [trade, track, evaluate] {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(err)) => return Err(err),
                Err(join_err) => return Err(ProphetError::Internal(join_err.to_string())),
            }
        }
        Ok(())
    }

    /// Generic cycle loop: tick, run one cycle under the supervisory
    /// timeout, isolate non-fatal errors, stop on shutdown or fatal error.
    async fn cycle_loop<F>(
        runtime: Arc<Self>,
        stage: &'static str,
        interval_secs: u64,
        mut shutdown: watch::Receiver<bool>,
        cycle: F,
    ) -> Result<()>
    where
        F: Fn(Arc<Self>) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send>>
            + Send
            + 'static,
    {
        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let timeout = Duration::from_secs(runtime.config.schedule.cycle_timeout_secs);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(stage, "shutdown requested, stopping loop");
                        return Ok(());
                    }
                }
            }
            if *shutdown.borrow() {
                info!(stage, "shutdown requested, stopping loop");
                return Ok(());
            }

            match tokio::time::timeout(timeout, cycle(runtime.clone())).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) if err.is_fatal() => {
                    error!(stage, error = %err, "fatal error, stopping stage");
                    return Err(err);
                }
                Ok(Err(err)) => {
                    warn!(stage, error = %err, "cycle failed, continuing to next");
                }
                Err(_) => {
                    warn!(stage, timeout_secs = timeout.as_secs(), "cycle overran supervisory timeout");
                }
            }
        }
    }

    /// One full trade cycle: refresh capital, scan arbitrage, evaluate
    /// candidates with the bounded worker pool, execute intents.
    pub async fn trade_cycle(self: Arc<Self>) -> Result<()> {
        self.refresh_capital().await?;

        let candidates = self.ingestion.fetch_candidates().await;
        if candidates.is_empty() {
            return Ok(());
        }

        // Arbitrage path first: risk-free opportunities are time-critical
        for opportunity in self.arbitrage.scan(&candidates) {
            match self.arbitrage.execute_group(&opportunity).await {
                Ok(execution) => info!(
                    group_id = %opportunity.group_id,
                    outcome = ?execution.outcome,
                    "arbitrage group processed"
                ),
                Err(err) => warn!(
                    group_id = %opportunity.group_id,
                    stage = "arbitrage",
                    error = %err,
                    "arbitrage execution failed"
                ),
            }
        }

        // Forecast-driven path: bounded worker pool, each worker paced so
        // the aggregate request rate stays under the gateway limit.
        let pacing = Duration::from_millis(self.config.trading.worker_pacing_ms);
        let intents: Vec<TradeIntent> = stream::iter(candidates)
            .map(|market: Market| {
                let decision = self.decision.clone();
                async move {
                    let result = decision.evaluate(&market).await;
                    tokio::time::sleep(pacing).await;
                    match result {
                        Ok(intent) => intent,
                        Err(err) => {
                            warn!(
                                market_id = %market.id,
                                stage = "decision",
                                error = %err,
                                "evaluation failed, skipping market"
                            );
                            None
                        }
                    }
                }
            })
            .buffer_unordered(self.config.trading.decision_workers)
            .filter_map(|intent| async move { intent })
            .collect()
            .await;

        for intent in intents {
            match self.executor.execute(&intent).await {
                Ok(Some(order)) => info!(
                    market_id = %intent.market_id,
                    filled = order.filled_quantity,
                    "intent executed"
                ),
                Ok(None) => {}
                Err(err) => warn!(
                    market_id = %intent.market_id,
                    stage = "execution",
                    error = %err,
                    "execution failed, skipping intent"
                ),
            }
        }
        Ok(())
    }

    /// Recompute total capital and re-evaluate the risk gates from current
    /// open exposure, tracked and untracked alike.
    async fn refresh_capital(&self) -> Result<()> {
        let cash = match self.exchange.get_balance().await {
            Ok(cash) => cash,
            Err(err) => {
                warn!(stage = "allocator", error = %err, "balance refresh failed, keeping last");
                return Ok(());
            }
        };

        let open = self.store.get_open_positions(false).await?;
        let mut position_value = Decimal::ZERO;
        let mut exposures = Vec::with_capacity(open.len());
        for position in &open {
            let (price, category) = self.mark_price(position).await;
            position_value += position.market_value(price);
            exposures.push(Exposure {
                current_price: price,
                value: position.market_value(price),
                category,
            });
        }

        self.allocator.rebalance(cash, position_value).await;
        self.allocator.update_gates(portfolio_metrics(&exposures)).await;
        Ok(())
    }

    /// Mark a position against the stored snapshot, falling back to entry
    async fn mark_price(&self, position: &Position) -> (Decimal, String) {
        match self.store.get_market(&position.market_id).await {
            Ok(Some(market)) => {
                let bid = market.bid(position.side);
                let price = if bid > Decimal::ZERO {
                    bid
                } else {
                    market.implied_price(position.side)
                };
                (price, market.category)
            }
            _ => (position.entry_price, String::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_config;
    use crate::domain::{MarketStatus, Side};
    use crate::exchange::PaperExchange;
    use crate::forecast::{ForecastOutcome, ForecastResponse, MockForecastClient, ParsedForecast};
    use crate::persistence::MockStore;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn market(id: &str, event_id: &str, yes_ask: Decimal, no_ask: Decimal) -> Market {
        Market {
            id: id.to_string(),
            event_id: event_id.to_string(),
            title: id.to_string(),
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
        store.expect_count_positions().returning(|| Ok(0));
        store.expect_upsert_markets().returning(|_| Ok(()));
        store.expect_get_open_positions().returning(|_| Ok(vec![]));
        store.expect_daily_forecast_cost().returning(|| Ok(dec!(0)));
        store
            .expect_was_recently_analyzed()
            .returning(|_, _| Ok(false));
        store.expect_analysis_count_today().returning(|_| Ok(0));
        store
            .expect_get_open_position_for_market()
            .returning(|_| Ok(None));
        store.expect_record_market_analysis().returning(|_| Ok(()));
        store.expect_insert_order().returning(|_| Ok(1));
        store
            .expect_update_order_status()
            .returning(|_, _, _, _| Ok(()));
        store
            .expect_update_order_fill()
            .returning(|_, _, _, _| Ok(()));
        store.expect_add_position().returning(|_| Ok(1));
        store
            .expect_link_order_to_position()
            .returning(|_, _| Ok(()));
        store.expect_get_market().returning(|_| Ok(None));
        store
    }

    #[tokio::test]
    async fn test_trade_cycle_end_to_end_paper() {
        let exchange = PaperExchange::new();
        // One directional candidate and one arbitrage pair
        exchange
            .seed_market(market("MKT-DIR", "EVT-DIR", dec!(0.40), dec!(0.62)))
            .await;
        exchange
            .seed_market(market("MKT-ARB-A", "EVT-ARB", dec!(0.40), dec!(0.62)))
            .await;
        exchange
            .seed_market(market("MKT-ARB-B", "EVT-ARB", dec!(0.55), dec!(0.47)))
            .await;
        exchange.set_balance(dec!(1000)).await;

        let mut forecast = MockForecastClient::new();
        forecast.expect_analyze().returning(|_| {
            Ok(ForecastResponse {
                outcome: ForecastOutcome::Parsed(ParsedForecast {
                    probability: 0.58,
                    confidence: 0.8,
                    rationale: "test".to_string(),
                }),
                cost: dec!(0.02),
                raw_response: "{}".to_string(),
            })
        });

        let runtime = Arc::new(TradingRuntime::new(
            test_config(),
            Arc::new(exchange.clone()),
            Arc::new(permissive_store()),
            Arc::new(forecast),
        ));
        runtime.allocator().initialize(dec!(1000), dec!(0)).await;

        runtime.clone().trade_cycle().await.unwrap();

        let orders = exchange.placed_orders().await;
        // Two arbitrage buy legs plus at least one directional buy
        let buys: Vec<_> = orders
            .iter()
            .filter(|o| o.action == crate::domain::OrderAction::Buy)
            .collect();
        assert!(buys.len() >= 3, "expected arb legs + directional order, got {}", buys.len());
        assert!(buys.iter().any(|o| o.market_id == "MKT-DIR"));
        assert!(buys.iter().any(|o| o.market_id == "MKT-ARB-A"));
        assert!(buys.iter().any(|o| o.market_id == "MKT-ARB-B"));
    }

    #[tokio::test]
    async fn test_shutdown_stops_loops() {
        let exchange = PaperExchange::new();
        exchange.set_balance(dec!(100)).await;

        let forecast = MockForecastClient::new();
        let mut config = test_config();
        config.schedule.trade_interval_secs = 3600;
        config.schedule.tracker_interval_secs = 3600;
        config.schedule.evaluation_interval_secs = 3600;

        let mut store = permissive_store();
        store.expect_get_trade_logs().returning(|| Ok(vec![]));
        store.expect_insert_snapshot().returning(|_| Ok(1));
        store.expect_latest_confidence().returning(|_| Ok(None));

        let runtime = Arc::new(TradingRuntime::new(
            config,
            Arc::new(exchange),
            Arc::new(store),
            Arc::new(forecast),
        ));

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(runtime.run(rx));

        tokio::time::sleep(Duration::from_millis(200)).await;
        tx.send(true).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("runtime should stop after shutdown signal")
            .unwrap();
        assert!(result.is_ok());
    }
}
