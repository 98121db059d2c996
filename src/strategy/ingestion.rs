//! Ingestion stage
//!
//! Pulls paginated market listings, filters down to tradable candidates and
//! refreshes stored snapshots. A gateway failure yields an empty batch for
//! the cycle instead of propagating.

use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::TradingConfig;
use crate::domain::Market;
use crate::error::Result;
use crate::exchange::{ExchangeClient, MarketFilter};
use crate::persistence::Store;

/// Hard cap on listing pages per cycle, so a runaway cursor cannot stall the
/// trade cadence.
const MAX_PAGES: usize = 50;

pub struct IngestionStage {
    exchange: Arc<dyn ExchangeClient>,
    store: Arc<dyn Store>,
    config: TradingConfig,
    page_size: u32,
}

impl IngestionStage {
    pub fn new(
        exchange: Arc<dyn ExchangeClient>,
        store: Arc<dyn Store>,
        config: TradingConfig,
        page_size: u32,
    ) -> Self {
        Self {
            exchange,
            store,
            config,
            page_size,
        }
    }

    /// Produce this cycle's finite candidate sequence.
    ///
    /// Every fetched snapshot is persisted; only markets passing the volume,
    /// expiry, status and price-sanity filters are returned.
    pub async fn fetch_candidates(&self) -> Vec<Market> {
        match self.fetch_inner().await {
            Ok(candidates) => candidates,
            Err(err) => {
                warn!(error = %err, stage = "ingestion", "market pull failed, empty cycle");
                Vec::new()
            }
        }
    }

    async fn fetch_inner(&self) -> Result<Vec<Market>> {
        let mut all: Vec<Market> = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_PAGES {
            let page = self
                .exchange
                .list_markets(&MarketFilter {
                    open_only: true,
                    cursor: cursor.clone(),
                    limit: self.page_size,
                })
                .await?;

            all.extend(page.markets);
            cursor = page.cursor;
            if cursor.is_none() {
                break;
            }
        }

        self.store.upsert_markets(&all).await?;

        let now = Utc::now();
        let horizon = now + Duration::days(self.config.max_time_to_expiry_days);
        let before = all.len();
        let candidates: Vec<Market> = all
            .into_iter()
            .filter(|m| m.status.is_tradable())
            .filter(|m| m.volume >= self.config.min_volume)
            .filter(|m| m.expiration > now && m.expiration <= horizon)
            .filter(|m| {
                let sane = m.prices_sane();
                if !sane {
                    debug!(market_id = %m.id, sum = %m.price_sum(), "quote sum outside sanity band");
                }
                sane
            })
            .collect();

        info!(
            fetched = before,
            candidates = candidates.len(),
            "ingestion cycle complete"
        );
        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_config;
    use crate::domain::MarketStatus;
    use crate::exchange::{MarketPage, MockExchangeClient};
    use crate::persistence::MockStore;
    use rust_decimal_macros::dec;

    fn market(id: &str, volume: rust_decimal::Decimal, days_out: i64) -> Market {
        Market {
            id: id.to_string(),
            event_id: format!("EVT-{id}"),
            title: id.to_string(),
            category: "politics".to_string(),
            yes_bid: dec!(0.38),
            yes_ask: dec!(0.40),
            no_bid: dec!(0.58),
            no_ask: dec!(0.60),
            last_price: dec!(0.40),
            volume,
            expiration: Utc::now() + Duration::days(days_out),
            status: MarketStatus::Open,
            result: None,
            fetched_at: Utc::now(),
        }
    }

    fn stage(exchange: MockExchangeClient, store: MockStore) -> IngestionStage {
        IngestionStage::new(
            Arc::new(exchange),
            Arc::new(store),
            test_config().trading,
            100,
        )
    }

    #[tokio::test]
    async fn test_filters_applied() {
        let mut exchange = MockExchangeClient::new();
        exchange.expect_list_markets().returning(|_| {
            let mut stale = market("MKT-EXPIRED", dec!(5000), 60);
            stale.status = MarketStatus::Open;
            let mut closed = market("MKT-CLOSED", dec!(5000), 5);
            closed.status = MarketStatus::Closed;
            let mut skewed = market("MKT-SKEWED", dec!(5000), 5);
            skewed.no_ask = dec!(0.75);

            Ok(MarketPage {
                markets: vec![
                    market("MKT-GOOD", dec!(5000), 5),
                    market("MKT-THIN", dec!(10), 5),
                    stale,
                    closed,
                    skewed,
                ],
                cursor: None,
            })
        });

        let mut store = MockStore::new();
        store.expect_upsert_markets().returning(|_| Ok(()));

        let candidates = stage(exchange, store).fetch_candidates().await;
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].id, "MKT-GOOD");
    }

    #[tokio::test]
    async fn test_pagination_follows_cursor() {
        let mut exchange = MockExchangeClient::new();
        exchange
            .expect_list_markets()
            .times(2)
            .returning(|filter| {
                if filter.cursor.is_none() {
                    Ok(MarketPage {
                        markets: vec![market("MKT-1", dec!(5000), 5)],
                        cursor: Some("next".to_string()),
                    })
                } else {
                    Ok(MarketPage {
                        markets: vec![market("MKT-2", dec!(5000), 5)],
                        cursor: None,
                    })
                }
            });

        let mut store = MockStore::new();
        store.expect_upsert_markets().returning(|_| Ok(()));

        let candidates = stage(exchange, store).fetch_candidates().await;
        assert_eq!(candidates.len(), 2);
    }

    #[tokio::test]
    async fn test_gateway_failure_yields_empty_cycle() {
        let mut exchange = MockExchangeClient::new();
        exchange.expect_list_markets().returning(|_| {
            Err(crate::error::ProphetError::RateLimited("429".to_string()))
        });

        let store = MockStore::new();
        let candidates = stage(exchange, store).fetch_candidates().await;
        assert!(candidates.is_empty());
    }
}
