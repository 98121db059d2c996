//! Startup reconciliation
//!
//! One-time sync before the trading loops start. On first run (empty store)
//! pre-existing exchange positions are imported as untracked: they join
//! monitoring and capital accounting but never performance accounting. On
//! later runs, store positions absent from the exchange are closed so the
//! two views cannot drift apart silently.

use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use tracing::{info, warn};

use crate::domain::{Position, PositionStatus, StrategyKind};
use crate::error::Result;
use crate::exchange::ExchangeClient;
use crate::persistence::Store;
use crate::strategy::CapitalAllocator;

pub struct StartupSync {
    exchange: Arc<dyn ExchangeClient>,
    store: Arc<dyn Store>,
    allocator: Arc<CapitalAllocator>,
}

impl StartupSync {
    pub fn new(
        exchange: Arc<dyn ExchangeClient>,
        store: Arc<dyn Store>,
        allocator: Arc<CapitalAllocator>,
    ) -> Self {
        Self {
            exchange,
            store,
            allocator,
        }
    }

    pub async fn run(&self) -> Result<()> {
        let cash = self.exchange.get_balance().await?;
        let exchange_positions = self.exchange.get_positions().await?;
        let stored_count = self.store.count_positions().await?;

        if stored_count == 0 {
            info!(
                existing = exchange_positions.len(),
                "first run: importing pre-existing exchange positions as untracked"
            );
            for raw in &exchange_positions {
                let price = match self.exchange.get_market(&raw.market_id).await {
                    Ok(market) => market.implied_price(raw.side),
                    Err(_) => raw.avg_price.unwrap_or(dec!(0.50)),
                };
                let position = Position {
                    id: None,
                    market_id: raw.market_id.clone(),
                    side: raw.side,
                    entry_price: price,
                    quantity: raw.quantity,
                    opened_at: Utc::now(),
                    strategy: StrategyKind::Legacy,
                    status: PositionStatus::Open,
                    // Included in balance and monitoring, excluded from P&L
                    tracked: false,
                    confidence: 0.5,
                    rationale: "pre-existing position imported at startup".to_string(),
                    group_id: None,
                    exit_plan: None,
                    closed_at: None,
                    exit_price: None,
                };
                self.store.add_position(&position).await?;
                info!(
                    market_id = %raw.market_id,
                    side = %raw.side,
                    quantity = raw.quantity,
                    "untracked position imported"
                );
            }
        } else {
            // Drift repair: the exchange is the source of truth for what is
            // actually held.
            let open = self.store.get_open_positions(false).await?;
            for position in open {
                let held = exchange_positions
                    .iter()
                    .any(|p| p.market_id == position.market_id && p.side == position.side);
                if !held {
                    if let Some(id) = position.id {
                        warn!(
                            market_id = %position.market_id,
                            side = %position.side,
                            "stored position absent from exchange, closing"
                        );
                        self.store.close_position(id, position.entry_price).await?;
                    }
                }
            }
        }

        // Seed the capital counters: cash plus every open position's value,
        // tracked and untracked alike.
        let mut position_value = Decimal::ZERO;
        for raw in &exchange_positions {
            let price = match self.exchange.get_market(&raw.market_id).await {
                Ok(market) => market.implied_price(raw.side),
                Err(_) => raw.avg_price.unwrap_or(dec!(0.50)),
            };
            position_value += price * Decimal::from(raw.quantity);
        }
        self.allocator.initialize(cash, position_value).await;

        info!(cash = %cash, positions = %position_value, "startup sync complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_config;
    use crate::domain::{Market, MarketStatus, Side};
    use crate::exchange::PaperExchange;
    use crate::persistence::MockStore;

    fn market(id: &str, yes_ask: Decimal) -> Market {
        Market {
            id: id.to_string(),
            event_id: format!("EVT-{id}"),
            title: id.to_string(),
            category: "politics".to_string(),
            yes_bid: yes_ask - dec!(0.02),
            yes_ask,
            no_bid: Decimal::ONE - yes_ask - dec!(0.02),
            no_ask: Decimal::ONE - yes_ask,
            last_price: yes_ask,
            volume: dec!(1000),
            expiration: Utc::now() + chrono::Duration::days(7),
            status: MarketStatus::Open,
            result: None,
            fetched_at: Utc::now(),
        }
    }

    fn allocator() -> Arc<CapitalAllocator> {
        let config = test_config();
        Arc::new(CapitalAllocator::new(config.risk, config.allocation))
    }

    #[tokio::test]
    async fn test_first_run_imports_untracked() {
        let exchange = PaperExchange::new();
        exchange.seed_market(market("MKT-A", dec!(0.40))).await;
        exchange.seed_position("MKT-A", Side::Yes, 50).await;
        exchange.set_balance(dec!(200)).await;

        let mut store = MockStore::new();
        store.expect_count_positions().returning(|| Ok(0));
        store
            .expect_add_position()
            .withf(|p| {
                !p.tracked && p.strategy == StrategyKind::Legacy && p.quantity == 50
            })
            .times(1)
            .returning(|_| Ok(1));

        let allocator = allocator();
        let sync = StartupSync::new(Arc::new(exchange), Arc::new(store), allocator.clone());
        sync.run().await.unwrap();

        // Capital includes the untracked position's value: 200 + 50 * 0.40
        let state = allocator.snapshot().await;
        assert_eq!(state.total_capital, dec!(220));
        assert_eq!(state.cash, dec!(200));
    }

    #[tokio::test]
    async fn test_later_run_closes_drifted_positions() {
        let exchange = PaperExchange::new();
        exchange.set_balance(dec!(100)).await;
        // Exchange holds nothing

        let mut store = MockStore::new();
        store.expect_count_positions().returning(|| Ok(3));
        store.expect_get_open_positions().returning(|_| {
            Ok(vec![Position {
                id: Some(5),
                market_id: "MKT-GONE".to_string(),
                side: Side::Yes,
                entry_price: dec!(0.40),
                quantity: 10,
                opened_at: Utc::now(),
                strategy: StrategyKind::Directional,
                status: PositionStatus::Open,
                tracked: true,
                confidence: 0.7,
                rationale: String::new(),
                group_id: None,
                exit_plan: None,
                closed_at: None,
                exit_price: None,
            }])
        });
        store
            .expect_close_position()
            .withf(|id, _| *id == 5)
            .times(1)
            .returning(|_, _| Ok(()));

        let sync = StartupSync::new(Arc::new(exchange), Arc::new(store), allocator());
        sync.run().await.unwrap();
    }
}
