//! Multi-leg arbitrage
//!
//! A candidate is a set of mutually exclusive markets (one event id) whose
//! YES asks sum to less than one dollar net of per-leg taker fees. Execution
//! re-verifies prices immediately before placement, sizes against book depth
//! as well as capital, places every leg concurrently, and recovers from
//! partial fills by flattening whatever filled.

use chrono::Utc;
use futures::future::join_all;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::allocator::CapitalAllocator;
use super::fees::FeeSchedule;
use crate::config::ArbitrageConfig;
use crate::domain::{
    Market, Order, OrderRequest, OrderStatus, Position, PositionStatus, Side, StrategyKind,
};
use crate::error::Result;
use crate::exchange::ExchangeClient;
use crate::persistence::Store;

/// One leg of an arbitrage candidate
#[derive(Debug, Clone)]
pub struct ArbLeg {
    pub market_id: String,
    /// YES ask at scan time, per unit
    pub ask: Decimal,
}

/// A priced arbitrage candidate
#[derive(Debug, Clone)]
pub struct ArbOpportunity {
    /// Event id shared by the mutually exclusive legs
    pub group_id: String,
    pub legs: Vec<ArbLeg>,
    /// Sum of leg asks per unit
    pub total_cost: Decimal,
    /// `1 - total_cost` per unit
    pub gross_profit: Decimal,
    /// Gross minus per-leg taker fees, per unit
    pub net_profit: Decimal,
}

/// How a group execution ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupOutcome {
    /// Re-verified prices no longer cleared the threshold; nothing placed
    AbortedStale,
    /// Sizing came out to zero units; nothing placed
    AbortedUnsized,
    /// Every leg placed, none filled; nothing recorded
    NoLegsFilled,
    /// Every leg filled; one position per leg recorded
    AllLegsFilled,
    /// Some legs filled and all of them were flattened cleanly
    PartialFlattened,
    /// Some legs filled and flattening failed; operator intervention needed
    PartialEscalated,
}

/// Result of `execute_group`
#[derive(Debug, Clone)]
pub struct GroupExecution {
    pub outcome: GroupOutcome,
    pub orders_placed: usize,
    pub legs_filled: usize,
    pub flatten_orders: usize,
    /// Manual-intervention alerts raised (0 or 1)
    pub escalations: usize,
    pub total_cost: Decimal,
}

impl GroupExecution {
    fn aborted(outcome: GroupOutcome) -> Self {
        Self {
            outcome,
            orders_placed: 0,
            legs_filled: 0,
            flatten_orders: 0,
            escalations: 0,
            total_cost: Decimal::ZERO,
        }
    }
}

struct LegFill {
    market_id: String,
    filled: u64,
    price: Decimal,
}

/// Outcome of a flatten pass over the filled legs of a partial group
struct FlattenResult {
    placed: usize,
    failures: usize,
    /// Proceeds from successfully flattened legs
    recovered: Decimal,
    /// Cost basis of legs still holding exposure after a failed flatten
    stuck_cost: Decimal,
}

pub struct ArbitrageScanner {
    exchange: Arc<dyn ExchangeClient>,
    store: Arc<dyn Store>,
    allocator: Arc<CapitalAllocator>,
    fees: FeeSchedule,
    config: ArbitrageConfig,
}

impl ArbitrageScanner {
    pub fn new(
        exchange: Arc<dyn ExchangeClient>,
        store: Arc<dyn Store>,
        allocator: Arc<CapitalAllocator>,
        fees: FeeSchedule,
        config: ArbitrageConfig,
    ) -> Self {
        Self {
            exchange,
            store,
            allocator,
            fees,
            config,
        }
    }

    /// Scan this cycle's markets for groups whose asks sum under a dollar
    /// net of per-leg taker fees.
    pub fn scan(&self, markets: &[Market]) -> Vec<ArbOpportunity> {
        let mut groups: HashMap<&str, Vec<&Market>> = HashMap::new();
        for market in markets {
            groups.entry(market.event_id.as_str()).or_default().push(market);
        }

        let mut opportunities = Vec::new();
        for (event_id, group) in groups {
            if group.len() < self.config.min_group_size {
                continue;
            }
            if group.iter().any(|m| m.yes_ask <= Decimal::ZERO) {
                // An un-quoted leg makes the group untradable
                continue;
            }

            let legs: Vec<ArbLeg> = group
                .iter()
                .map(|m| ArbLeg {
                    market_id: m.id.clone(),
                    ask: m.yes_ask,
                })
                .collect();
            let total_cost: Decimal = legs.iter().map(|l| l.ask).sum();
            if total_cost >= Decimal::ONE {
                continue;
            }

            let gross_profit = Decimal::ONE - total_cost;
            let prices: Vec<Decimal> = legs.iter().map(|l| l.ask).collect();
            let net_profit = gross_profit - self.fees.group_taker_fee_per_unit(&prices);

            if net_profit >= self.config.min_net_profit {
                info!(
                    group_id = event_id,
                    legs = legs.len(),
                    cost = %total_cost,
                    net = %net_profit,
                    "arbitrage opportunity found"
                );
                opportunities.push(ArbOpportunity {
                    group_id: event_id.to_string(),
                    legs,
                    total_cost,
                    gross_profit,
                    net_profit,
                });
            } else {
                debug!(
                    group_id = event_id,
                    gross = %gross_profit,
                    net = %net_profit,
                    "group under net-profit threshold"
                );
            }
        }
        opportunities
    }

    /// Execute every leg of an opportunity together.
    pub async fn execute_group(&self, opportunity: &ArbOpportunity) -> Result<GroupExecution> {
        // Time-of-check/time-of-use guard: re-fetch prices and abort with
        // zero orders if the refreshed sum no longer clears the threshold.
        let Some(fresh_legs) = self.reverify_prices(opportunity).await? else {
            warn!(group_id = %opportunity.group_id, "stale opportunity rejected");
            return Ok(GroupExecution::aborted(GroupOutcome::AbortedStale));
        };

        // Size against available order-book depth, not posted volume
        let mut depth_limit = u64::MAX;
        for leg in &fresh_legs {
            let book = self.exchange.get_orderbook(&leg.market_id).await?;
            let available = book.ask_depth_at(leg.ask + self.config.price_tolerance);
            depth_limit = depth_limit.min(available);
        }

        let total_cost: Decimal = fresh_legs.iter().map(|l| l.ask).sum();
        let capital = self.allocator.bucket_remaining(StrategyKind::Arbitrage).await;
        let units_by_capital = if total_cost > Decimal::ZERO {
            (capital / total_cost).floor().to_u64().unwrap_or(0)
        } else {
            0
        };

        let quantity = depth_limit
            .min(units_by_capital)
            .min(self.config.per_trade_cap);
        if quantity == 0 {
            debug!(
                group_id = %opportunity.group_id,
                depth_limit,
                units_by_capital,
                "arbitrage sized to zero"
            );
            return Ok(GroupExecution::aborted(GroupOutcome::AbortedUnsized));
        }

        let committed = total_cost * Decimal::from(quantity);
        self.allocator
            .commit(StrategyKind::Arbitrage, committed)
            .await?;

        let group_id = format!("{}-{}", opportunity.group_id, Uuid::new_v4());
        info!(
            group_id = %group_id,
            legs = fresh_legs.len(),
            quantity,
            cost = %committed,
            "placing arbitrage group"
        );

        // All legs submitted concurrently; a failed leg must not cancel
        // sibling in-flight placements, so results are reconciled after
        // every attempt completes.
        let attempts = join_all(
            fresh_legs
                .iter()
                .map(|leg| self.place_leg(leg, quantity, &group_id)),
        )
        .await;

        let fills: Vec<LegFill> = attempts.into_iter().flatten().collect();
        let legs_filled = fills.len();
        let actual_cost: Decimal = fills
            .iter()
            .map(|f| f.price * Decimal::from(f.filled))
            .sum();

        if legs_filled == fresh_legs.len() {
            // Success: one position per leg, tagged with the shared id
            for fill in &fills {
                let position = Position {
                    id: None,
                    market_id: fill.market_id.clone(),
                    side: Side::Yes,
                    entry_price: fill.price,
                    quantity: fill.filled,
                    opened_at: Utc::now(),
                    strategy: StrategyKind::Arbitrage,
                    status: PositionStatus::Open,
                    tracked: true,
                    confidence: 1.0,
                    rationale: format!("mutually exclusive group {}", opportunity.group_id),
                    group_id: Some(group_id.clone()),
                    exit_plan: None,
                    closed_at: None,
                    exit_price: None,
                };
                self.store.add_position(&position).await?;
            }
            if committed > actual_cost {
                self.allocator
                    .release(StrategyKind::Arbitrage, committed - actual_cost)
                    .await;
            }
            info!(
                group_id = %group_id,
                locked_profit = %(Decimal::from(quantity) - actual_cost),
                "arbitrage group fully filled"
            );
            return Ok(GroupExecution {
                outcome: GroupOutcome::AllLegsFilled,
                orders_placed: fresh_legs.len(),
                legs_filled,
                flatten_orders: 0,
                escalations: 0,
                total_cost: actual_cost,
            });
        }

        if legs_filled == 0 {
            // Clean failure: nothing recorded
            self.allocator.release(StrategyKind::Arbitrage, committed).await;
            return Ok(GroupExecution {
                outcome: GroupOutcome::NoLegsFilled,
                orders_placed: fresh_legs.len(),
                legs_filled: 0,
                flatten_orders: 0,
                escalations: 0,
                total_cost: Decimal::ZERO,
            });
        }

        // Partial fill: a risk state. Flatten every filled leg immediately.
        warn!(
            group_id = %group_id,
            filled = legs_filled,
            requested = fresh_legs.len(),
            "partial arbitrage fill, flattening filled legs"
        );
        // Capital behind legs that would not flatten stays committed; the
        // rest is returned. The realized flatten loss feeds the daily loss
        // gate, and cash is re-marked from the exchange balance next
        // rebalance.
        let flatten = self.flatten_filled_legs(&fills, &group_id).await;
        self.allocator
            .release(StrategyKind::Arbitrage, committed - flatten.stuck_cost)
            .await;
        let flatten_loss = (actual_cost - flatten.stuck_cost) - flatten.recovered;
        if flatten_loss > Decimal::ZERO {
            self.allocator.record_realized_pnl(-flatten_loss).await;
        }

        if flatten.failures == 0 {
            return Ok(GroupExecution {
                outcome: GroupOutcome::PartialFlattened,
                orders_placed: fresh_legs.len(),
                legs_filled,
                flatten_orders: flatten.placed,
                escalations: 0,
                total_cost: actual_cost,
            });
        }

        // Flattening itself failed: exactly one operator escalation, never
        // silent directional exposure.
        error!(
            group_id = %group_id,
            failed_legs = flatten.failures,
            alert = "manual_intervention",
            "flatten failed, directional exposure remains open"
        );
        Ok(GroupExecution {
            outcome: GroupOutcome::PartialEscalated,
            orders_placed: fresh_legs.len(),
            legs_filled,
            flatten_orders: flatten.placed,
            escalations: 1,
            total_cost: actual_cost,
        })
    }

    /// Re-fetch leg prices. Returns refreshed legs while the opportunity
    /// still clears the net-profit threshold, `None` otherwise.
    async fn reverify_prices(&self, opportunity: &ArbOpportunity) -> Result<Option<Vec<ArbLeg>>> {
        let mut fresh_legs = Vec::with_capacity(opportunity.legs.len());
        for leg in &opportunity.legs {
            let fresh = self.exchange.get_market(&leg.market_id).await?;
            let ask = fresh.yes_ask;
            if ask <= Decimal::ZERO {
                return Ok(None);
            }
            if (ask - leg.ask).abs() > self.config.price_tolerance {
                debug!(
                    market_id = %leg.market_id,
                    scanned = %leg.ask,
                    fresh = %ask,
                    "leg price moved beyond tolerance"
                );
            }
            fresh_legs.push(ArbLeg {
                market_id: leg.market_id.clone(),
                ask,
            });
        }

        let total: Decimal = fresh_legs.iter().map(|l| l.ask).sum();
        if total >= Decimal::ONE {
            return Ok(None);
        }
        let prices: Vec<Decimal> = fresh_legs.iter().map(|l| l.ask).collect();
        let net = (Decimal::ONE - total) - self.fees.group_taker_fee_per_unit(&prices);
        if net < self.config.min_net_profit {
            return Ok(None);
        }
        Ok(Some(fresh_legs))
    }

    /// Place and confirm one buy leg. `None` means the leg did not fill.
    async fn place_leg(&self, leg: &ArbLeg, quantity: u64, group_id: &str) -> Option<LegFill> {
        let request =
            OrderRequest::buy_limit(leg.market_id.clone(), Side::Yes, quantity, leg.ask);
        let mut order = Order::from_request(&request);
        order.group_id = Some(group_id.to_string());

        let order_id = match self.store.insert_order(&order).await {
            Ok(id) => id,
            Err(err) => {
                warn!(market_id = %leg.market_id, error = %err, "leg order insert failed");
                return None;
            }
        };

        let handle = match self.exchange.place_order(&request).await {
            Ok(handle) => handle,
            Err(err) => {
                warn!(market_id = %leg.market_id, error = %err, "leg placement failed");
                let _ = self
                    .store
                    .update_order_status(order_id, OrderStatus::Failed, None, Some(err.to_string()))
                    .await;
                return None;
            }
        };

        let fills = self
            .exchange
            .get_fills(&handle.exchange_order_id)
            .await
            .unwrap_or_default();
        let filled: u64 = fills.iter().map(|f| f.quantity).sum::<u64>().min(quantity);
        if filled == 0 {
            let _ = self
                .store
                .update_order_status(
                    order_id,
                    OrderStatus::Cancelled,
                    Some(handle.exchange_order_id),
                    None,
                )
                .await;
            return None;
        }

        let price = fills
            .iter()
            .map(|f| f.price * Decimal::from(f.quantity))
            .sum::<Decimal>()
            / Decimal::from(filled);
        let status = if filled >= quantity {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };
        let _ = self
            .store
            .update_order_fill(order_id, filled, price, status)
            .await;

        Some(LegFill {
            market_id: leg.market_id.clone(),
            filled,
            price,
        })
    }

    /// Place at most one offsetting order per filled leg.
    async fn flatten_filled_legs(&self, fills: &[LegFill], group_id: &str) -> FlattenResult {
        let mut placed = 0usize;
        let mut failures = 0usize;
        let mut recovered = Decimal::ZERO;
        let mut stuck_cost = Decimal::ZERO;

        for fill in fills {
            let bid = match self.exchange.get_market(&fill.market_id).await {
                Ok(market) if market.yes_bid > Decimal::ZERO => market.yes_bid,
                _ => dec!(0.01),
            };

            let request = OrderRequest::sell_market(
                fill.market_id.clone(),
                Side::Yes,
                fill.filled,
                bid,
            );
            let mut order = Order::from_request(&request);
            order.group_id = Some(group_id.to_string());
            let order_id = self.store.insert_order(&order).await.ok();

            match self.exchange.place_order(&request).await {
                Ok(handle) => {
                    placed += 1;
                    recovered += bid * Decimal::from(fill.filled);
                    if let Some(id) = order_id {
                        let _ = self
                            .store
                            .update_order_fill(id, fill.filled, bid, OrderStatus::Filled)
                            .await;
                        let _ = self
                            .store
                            .update_order_status(
                                id,
                                OrderStatus::Filled,
                                Some(handle.exchange_order_id),
                                None,
                            )
                            .await;
                    }
                    info!(market_id = %fill.market_id, quantity = fill.filled, "leg flattened");
                }
                Err(err) => {
                    failures += 1;
                    stuck_cost += fill.price * Decimal::from(fill.filled);
                    if let Some(id) = order_id {
                        let _ = self
                            .store
                            .update_order_status(
                                id,
                                OrderStatus::Failed,
                                None,
                                Some(err.to_string()),
                            )
                            .await;
                    }
                    warn!(market_id = %fill.market_id, error = %err, "flatten order failed");
                }
            }
        }

        FlattenResult {
            placed,
            failures,
            recovered,
            stuck_cost,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_config;
    use crate::domain::{DepthLevel, MarketStatus, Orderbook};
    use crate::exchange::PaperExchange;
    use crate::persistence::MockStore;

    fn market(id: &str, event_id: &str, yes_ask: Decimal) -> Market {
        Market {
            id: id.to_string(),
            event_id: event_id.to_string(),
            title: id.to_string(),
            category: "politics".to_string(),
            yes_bid: (yes_ask - dec!(0.02)).max(dec!(0.01)),
            yes_ask,
            no_bid: Decimal::ONE - yes_ask - dec!(0.01),
            no_ask: Decimal::ONE - yes_ask + dec!(0.01),
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
        store.expect_insert_order().returning(|_| Ok(1));
        store
            .expect_update_order_status()
            .returning(|_, _, _, _| Ok(()));
        store
            .expect_update_order_fill()
            .returning(|_, _, _, _| Ok(()));
        store.expect_add_position().returning(|_| Ok(1));
        store
    }

    async fn scanner_with(
        exchange: PaperExchange,
        store: MockStore,
        cash: Decimal,
    ) -> (ArbitrageScanner, Arc<CapitalAllocator>) {
        let config = test_config();
        let allocator = Arc::new(CapitalAllocator::new(config.risk, config.allocation));
        allocator.initialize(cash, dec!(0)).await;
        let scanner = ArbitrageScanner::new(
            Arc::new(exchange),
            Arc::new(store),
            allocator.clone(),
            FeeSchedule::new(dec!(0), dec!(0.01)),
            config.arbitrage,
        );
        (scanner, allocator)
    }

    fn scan_only() -> ArbitrageScanner {
        let config = test_config();
        let allocator = Arc::new(CapitalAllocator::new(config.risk, config.allocation));
        ArbitrageScanner::new(
            Arc::new(PaperExchange::new()),
            Arc::new(MockStore::new()),
            allocator,
            FeeSchedule::new(dec!(0), dec!(0.01)),
            config.arbitrage,
        )
    }

    #[test]
    fn test_scan_rejects_overpriced_pair() {
        // Quotes summing to $1.05: no arbitrage
        let scanner = scan_only();
        let markets = vec![
            market("MKT-A", "EVT-1", dec!(0.40)),
            market("MKT-B", "EVT-1", dec!(0.65)),
        ];
        assert!(scanner.scan(&markets).is_empty());
    }

    #[test]
    fn test_scan_finds_discounted_group() {
        // Asks sum to $0.95; 1% per-leg taker fees leave ~4c net
        let scanner = scan_only();
        let markets = vec![
            market("MKT-A", "EVT-1", dec!(0.40)),
            market("MKT-B", "EVT-1", dec!(0.55)),
        ];
        let opportunities = scanner.scan(&markets);
        assert_eq!(opportunities.len(), 1);
        let opp = &opportunities[0];
        assert_eq!(opp.total_cost, dec!(0.95));
        assert_eq!(opp.gross_profit, dec!(0.05));
        assert_eq!(opp.net_profit, dec!(0.05) - dec!(0.0095));
        assert!(opp.net_profit >= dec!(0.02));
    }

    #[test]
    fn test_scan_fee_pushes_thin_group_under_threshold() {
        // Gross 2.5c but fees cost ~1c: net under the 2c threshold
        let scanner = scan_only();
        let markets = vec![
            market("MKT-A", "EVT-1", dec!(0.475)),
            market("MKT-B", "EVT-1", dec!(0.50)),
        ];
        assert!(scanner.scan(&markets).is_empty());
    }

    #[test]
    fn test_scan_ignores_single_market_groups() {
        let scanner = scan_only();
        let markets = vec![market("MKT-A", "EVT-1", dec!(0.40))];
        assert!(scanner.scan(&markets).is_empty());
    }

    #[tokio::test]
    async fn test_refreshed_price_abort_places_zero_orders() {
        let exchange = PaperExchange::new();
        exchange.seed_market(market("MKT-A", "EVT-1", dec!(0.40))).await;
        exchange.seed_market(market("MKT-B", "EVT-1", dec!(0.55))).await;
        exchange.set_balance(dec!(1000)).await;

        let (scanner, allocator) =
            scanner_with(exchange.clone(), permissive_store(), dec!(1000)).await;
        let opportunity = scanner.scan(&[
            market("MKT-A", "EVT-1", dec!(0.40)),
            market("MKT-B", "EVT-1", dec!(0.55)),
        ])[0]
            .clone();

        // Price moves before execution; the refreshed sum no longer clears
        exchange.seed_market(market("MKT-B", "EVT-1", dec!(0.62))).await;

        let execution = scanner.execute_group(&opportunity).await.unwrap();
        assert_eq!(execution.outcome, GroupOutcome::AbortedStale);
        assert_eq!(execution.orders_placed, 0);
        assert!(exchange.placed_orders().await.is_empty());
        assert_eq!(allocator.snapshot().await.committed_total(), dec!(0));
    }

    #[tokio::test]
    async fn test_full_fill_creates_position_per_leg() {
        let exchange = PaperExchange::new();
        exchange.seed_market(market("MKT-A", "EVT-1", dec!(0.40))).await;
        exchange.seed_market(market("MKT-B", "EVT-1", dec!(0.55))).await;
        exchange.set_balance(dec!(1000)).await;

        let mut store = MockStore::new();
        store.expect_insert_order().returning(|_| Ok(1));
        store
            .expect_update_order_status()
            .returning(|_, _, _, _| Ok(()));
        store
            .expect_update_order_fill()
            .returning(|_, _, _, _| Ok(()));
        store
            .expect_add_position()
            .withf(|p| {
                p.strategy == StrategyKind::Arbitrage && p.group_id.is_some() && p.tracked
            })
            .times(2)
            .returning(|_| Ok(1));

        let (scanner, _) = scanner_with(exchange.clone(), store, dec!(1000)).await;
        let opportunity = scanner.scan(&[
            market("MKT-A", "EVT-1", dec!(0.40)),
            market("MKT-B", "EVT-1", dec!(0.55)),
        ])[0]
            .clone();

        let execution = scanner.execute_group(&opportunity).await.unwrap();
        assert_eq!(execution.outcome, GroupOutcome::AllLegsFilled);
        assert_eq!(execution.legs_filled, 2);
        assert_eq!(execution.escalations, 0);
    }

    #[tokio::test]
    async fn test_sizing_takes_minimum_of_depth_capital_and_cap() {
        let exchange = PaperExchange::new();
        exchange.seed_market(market("MKT-A", "EVT-1", dec!(0.40))).await;
        exchange.seed_market(market("MKT-B", "EVT-1", dec!(0.55))).await;
        // Thin book on one leg: only 30 units at the ask
        exchange
            .seed_orderbook(Orderbook {
                market_id: "MKT-B".to_string(),
                yes_asks: vec![DepthLevel {
                    price: dec!(0.55),
                    quantity: 30,
                }],
                yes_bids: vec![DepthLevel {
                    price: dec!(0.53),
                    quantity: 30,
                }],
                fetched_at: Utc::now(),
            })
            .await;
        exchange.set_balance(dec!(1000)).await;

        let (scanner, _) = scanner_with(exchange.clone(), permissive_store(), dec!(1000)).await;
        let opportunity = scanner.scan(&[
            market("MKT-A", "EVT-1", dec!(0.40)),
            market("MKT-B", "EVT-1", dec!(0.55)),
        ])[0]
            .clone();

        let execution = scanner.execute_group(&opportunity).await.unwrap();
        assert_eq!(execution.outcome, GroupOutcome::AllLegsFilled);

        // Depth (30) < capital units (400 bucket / 0.95) and < cap (100)
        let orders = exchange.placed_orders().await;
        assert_eq!(orders.len(), 2);
        assert!(orders.iter().all(|o| o.quantity == 30));
    }

    #[tokio::test]
    async fn test_partial_fill_flattens_each_filled_leg_once() {
        let exchange = PaperExchange::new();
        exchange.seed_market(market("MKT-A", "EVT-1", dec!(0.30))).await;
        exchange.seed_market(market("MKT-B", "EVT-1", dec!(0.35))).await;
        exchange.seed_market(market("MKT-C", "EVT-1", dec!(0.28))).await;
        exchange.set_balance(dec!(1000)).await;
        // Leg B fails; A and C fill
        exchange.reject_next_order("MKT-B").await;

        let (scanner, _) = scanner_with(exchange.clone(), permissive_store(), dec!(1000)).await;
        let opportunity = scanner.scan(&[
            market("MKT-A", "EVT-1", dec!(0.30)),
            market("MKT-B", "EVT-1", dec!(0.35)),
            market("MKT-C", "EVT-1", dec!(0.28)),
        ])[0]
            .clone();

        let execution = scanner.execute_group(&opportunity).await.unwrap();
        assert_eq!(execution.outcome, GroupOutcome::PartialFlattened);
        assert_eq!(execution.legs_filled, 2);
        // At most one flatten order per filled leg
        assert_eq!(execution.flatten_orders, 2);
        assert_eq!(execution.escalations, 0);

        let sells: Vec<_> = exchange
            .placed_orders()
            .await
            .into_iter()
            .filter(|o| o.action == crate::domain::OrderAction::Sell)
            .collect();
        assert_eq!(sells.len(), 2);
        let mut sold: Vec<String> = sells.iter().map(|o| o.market_id.clone()).collect();
        sold.sort();
        assert_eq!(sold, vec!["MKT-A".to_string(), "MKT-C".to_string()]);
    }

    #[tokio::test]
    async fn test_flatten_failure_raises_exactly_one_escalation() {
        let exchange = PaperExchange::new();
        exchange.seed_market(market("MKT-A", "EVT-1", dec!(0.30))).await;
        exchange.seed_market(market("MKT-B", "EVT-1", dec!(0.35))).await;
        exchange.seed_market(market("MKT-C", "EVT-1", dec!(0.28))).await;
        exchange.set_balance(dec!(1000)).await;
        exchange.reject_next_order("MKT-B").await;
        // Both flatten attempts fail
        exchange.reject_next_sell("MKT-A").await;
        exchange.reject_next_sell("MKT-C").await;

        let (scanner, _) = scanner_with(exchange.clone(), permissive_store(), dec!(1000)).await;
        let opportunity = scanner.scan(&[
            market("MKT-A", "EVT-1", dec!(0.30)),
            market("MKT-B", "EVT-1", dec!(0.35)),
            market("MKT-C", "EVT-1", dec!(0.28)),
        ])[0]
            .clone();

        let execution = scanner.execute_group(&opportunity).await.unwrap();
        assert_eq!(execution.outcome, GroupOutcome::PartialEscalated);
        assert_eq!(execution.escalations, 1);
    }
}
