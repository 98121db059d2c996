use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use tracing::{debug, info};

use crate::domain::{
    ExitPlan, Market, MarketStatus, Order, OrderAction, OrderStatus, OrderType, Position,
    PositionStatus, Side, StrategyKind, TradeLog,
};
use crate::error::{OrderError, ProphetError, Result};
use crate::persistence::AnalysisRecord;
use crate::strategy::PerformanceSnapshot;

/// PostgreSQL storage adapter
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a new PostgreSQL store
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        info!("Connected to PostgreSQL");
        Ok(Self { pool })
    }

    /// Create a store from an existing connection pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    // ==================== Markets ====================

    /// Upsert a batch of market snapshots
    pub async fn upsert_markets(&self, markets: &[Market]) -> Result<()> {
        for market in markets {
            sqlx::query(
                r#"
                INSERT INTO markets
                    (id, event_id, title, category, yes_bid, yes_ask, no_bid, no_ask,
                     last_price, volume, expiration, status, result, fetched_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
                ON CONFLICT (id) DO UPDATE SET
                    yes_bid = EXCLUDED.yes_bid,
                    yes_ask = EXCLUDED.yes_ask,
                    no_bid = EXCLUDED.no_bid,
                    no_ask = EXCLUDED.no_ask,
                    last_price = EXCLUDED.last_price,
                    volume = EXCLUDED.volume,
                    status = EXCLUDED.status,
                    result = EXCLUDED.result,
                    fetched_at = EXCLUDED.fetched_at
                "#,
            )
            .bind(&market.id)
            .bind(&market.event_id)
            .bind(&market.title)
            .bind(&market.category)
            .bind(market.yes_bid)
            .bind(market.yes_ask)
            .bind(market.no_bid)
            .bind(market.no_ask)
            .bind(market.last_price)
            .bind(market.volume)
            .bind(market.expiration)
            .bind(market.status.as_str())
            .bind(market.result.map(|s| s.as_str()))
            .bind(market.fetched_at)
            .execute(&self.pool)
            .await?;
        }
        debug!(count = markets.len(), "market snapshots upserted");
        Ok(())
    }

    pub async fn get_market(&self, market_id: &str) -> Result<Option<Market>> {
        let row = sqlx::query(
            r#"
            SELECT id, event_id, title, category, yes_bid, yes_ask, no_bid, no_ask,
                   last_price, volume, expiration, status, result, fetched_at
            FROM markets WHERE id = $1
            "#,
        )
        .bind(market_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_market).transpose()
    }

    // ==================== Positions ====================

    pub async fn add_position(&self, position: &Position) -> Result<i64> {
        let row = sqlx::query(
            r#"
            INSERT INTO positions
                (market_id, side, entry_price, quantity, opened_at, strategy, status,
                 tracked, confidence, rationale, group_id, stop_loss_price,
                 take_profit_price, max_hold_hours, confidence_delta)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            RETURNING id
            "#,
        )
        .bind(&position.market_id)
        .bind(position.side.as_str())
        .bind(position.entry_price)
        .bind(position.quantity as i64)
        .bind(position.opened_at)
        .bind(position.strategy.as_str())
        .bind(position.status.as_str())
        .bind(position.tracked)
        .bind(position.confidence)
        .bind(&position.rationale)
        .bind(&position.group_id)
        .bind(position.exit_plan.map(|p| p.stop_loss_price))
        .bind(position.exit_plan.map(|p| p.take_profit_price))
        .bind(position.exit_plan.map(|p| p.max_hold_hours))
        .bind(position.exit_plan.map(|p| p.confidence_delta))
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get("id"))
    }

    /// Open positions, optionally restricted to tracked ones
    pub async fn get_open_positions(&self, tracked_only: bool) -> Result<Vec<Position>> {
        let rows = sqlx::query(
            r#"
            SELECT id, market_id, side, entry_price, quantity, opened_at, strategy,
                   status, tracked, confidence, rationale, group_id, stop_loss_price,
                   take_profit_price, max_hold_hours, confidence_delta, closed_at, exit_price
            FROM positions
            WHERE status = 'open' AND (NOT $1 OR tracked)
            ORDER BY opened_at
            "#,
        )
        .bind(tracked_only)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_position).collect()
    }

    pub async fn get_position(&self, id: i64) -> Result<Option<Position>> {
        let row = sqlx::query(
            r#"
            SELECT id, market_id, side, entry_price, quantity, opened_at, strategy,
                   status, tracked, confidence, rationale, group_id, stop_loss_price,
                   take_profit_price, max_hold_hours, confidence_delta, closed_at, exit_price
            FROM positions WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_position).transpose()
    }

    pub async fn get_open_position_for_market(&self, market_id: &str) -> Result<Option<Position>> {
        let row = sqlx::query(
            r#"
            SELECT id, market_id, side, entry_price, quantity, opened_at, strategy,
                   status, tracked, confidence, rationale, group_id, stop_loss_price,
                   take_profit_price, max_hold_hours, confidence_delta, closed_at, exit_price
            FROM positions WHERE market_id = $1 AND status = 'open'
            LIMIT 1
            "#,
        )
        .bind(market_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_position).transpose()
    }

    /// Backfill an exit plan onto a position that lacks one
    pub async fn set_position_exit_plan(&self, id: i64, plan: &ExitPlan) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE positions
            SET stop_loss_price = $2, take_profit_price = $3,
                max_hold_hours = $4, confidence_delta = $5
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(plan.stop_loss_price)
        .bind(plan.take_profit_price)
        .bind(plan.max_hold_hours)
        .bind(plan.confidence_delta)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Close a position. The open -> closed transition is monotonic: a row
    /// already closed is left untouched.
    pub async fn close_position(&self, id: i64, exit_price: Decimal) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE positions
            SET status = 'closed', exit_price = $2, closed_at = NOW()
            WHERE id = $1 AND status = 'open'
            "#,
        )
        .bind(id)
        .bind(exit_price)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ProphetError::InvalidStateTransition {
                from: "closed".to_string(),
                to: "closed".to_string(),
            });
        }
        Ok(())
    }

    pub async fn count_positions(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM positions")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }

    // ==================== Orders ====================

    pub async fn insert_order(&self, order: &Order) -> Result<i64> {
        let row = sqlx::query(
            r#"
            INSERT INTO orders
                (position_id, group_id, client_order_id, exchange_order_id, market_id,
                 side, action, order_type, quantity, price, filled_quantity,
                 avg_fill_price, status, error, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            RETURNING id
            "#,
        )
        .bind(order.position_id)
        .bind(&order.group_id)
        .bind(&order.client_order_id)
        .bind(&order.exchange_order_id)
        .bind(&order.market_id)
        .bind(order.side.as_str())
        .bind(order.action.as_str())
        .bind(order.order_type.as_str())
        .bind(order.quantity as i64)
        .bind(order.price)
        .bind(order.filled_quantity as i64)
        .bind(order.avg_fill_price)
        .bind(order.status.as_str())
        .bind(&order.error)
        .bind(order.created_at)
        .bind(order.updated_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get("id"))
    }

    pub async fn update_order_status(
        &self,
        id: i64,
        status: OrderStatus,
        exchange_order_id: Option<String>,
        error: Option<String>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE orders
            SET status = $2,
                exchange_order_id = COALESCE($3, exchange_order_id),
                error = COALESCE($4, error),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(exchange_order_id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record fill progress; the filled quantity may never exceed requested.
    pub async fn update_order_fill(
        &self,
        id: i64,
        filled_quantity: u64,
        avg_fill_price: Decimal,
        status: OrderStatus,
    ) -> Result<()> {
        let row = sqlx::query("SELECT quantity FROM orders WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| {
                ProphetError::from(OrderError::NotFound {
                    order_id: id.to_string(),
                })
            })?;
        let requested: i64 = row.get("quantity");
        if filled_quantity as i64 > requested {
            return Err(OrderError::Overfill {
                requested: requested as u64,
                filled: filled_quantity,
            }
            .into());
        }

        sqlx::query(
            r#"
            UPDATE orders
            SET filled_quantity = $2, avg_fill_price = $3, status = $4, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(filled_quantity as i64)
        .bind(avg_fill_price)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn link_order_to_position(&self, order_id: i64, position_id: i64) -> Result<()> {
        sqlx::query("UPDATE orders SET position_id = $2, updated_at = NOW() WHERE id = $1")
            .bind(order_id)
            .bind(position_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_orders_for_position(&self, position_id: i64) -> Result<Vec<Order>> {
        let rows = sqlx::query(
            r#"
            SELECT id, position_id, group_id, client_order_id, exchange_order_id,
                   market_id, side, action, order_type, quantity, price,
                   filled_quantity, avg_fill_price, status, error, created_at, updated_at
            FROM orders WHERE position_id = $1
            ORDER BY created_at
            "#,
        )
        .bind(position_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_order).collect()
    }

    // ==================== Trade logs ====================

    pub async fn add_trade_log(&self, log: &TradeLog) -> Result<i64> {
        let row = sqlx::query(
            r#"
            INSERT INTO trade_logs
                (position_id, market_id, side, entry_price, exit_price, quantity,
                 pnl, strategy, exit_reason, slippage, entry_at, exit_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING id
            "#,
        )
        .bind(log.position_id)
        .bind(&log.market_id)
        .bind(log.side.as_str())
        .bind(log.entry_price)
        .bind(log.exit_price)
        .bind(log.quantity as i64)
        .bind(log.pnl)
        .bind(log.strategy.as_str())
        .bind(&log.exit_reason)
        .bind(log.slippage)
        .bind(log.entry_at)
        .bind(log.exit_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get("id"))
    }

    pub async fn get_trade_logs(&self) -> Result<Vec<TradeLog>> {
        let rows = sqlx::query(
            r#"
            SELECT id, position_id, market_id, side, entry_price, exit_price,
                   quantity, pnl, strategy, exit_reason, slippage, entry_at, exit_at
            FROM trade_logs ORDER BY exit_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_trade_log).collect()
    }

    pub async fn trade_log_exists_for_position(&self, position_id: i64) -> Result<bool> {
        let row =
            sqlx::query("SELECT EXISTS(SELECT 1 FROM trade_logs WHERE position_id = $1) AS found")
                .bind(position_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(row.get("found"))
    }

    // ==================== Analysis audit trail ====================

    /// Record one forecast analysis outcome, including the verbatim raw
    /// response when one was received.
    pub async fn record_market_analysis(&self, record: &AnalysisRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO market_analyses (market_id, action, confidence, cost, detail, raw_response)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(&record.market_id)
        .bind(&record.action)
        .bind(record.confidence)
        .bind(record.cost)
        .bind(&record.detail)
        .bind(&record.raw_response)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn was_recently_analyzed(&self, market_id: &str, cooldown_hours: i64) -> Result<bool> {
        let since = Utc::now() - Duration::hours(cooldown_hours);
        let row = sqlx::query(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM market_analyses WHERE market_id = $1 AND analyzed_at > $2
            ) AS found
            "#,
        )
        .bind(market_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("found"))
    }

    pub async fn analysis_count_today(&self, market_id: &str) -> Result<i64> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS n FROM market_analyses
            WHERE market_id = $1 AND analyzed_at::date = NOW()::date
            "#,
        )
        .bind(market_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("n"))
    }

    /// Forecast spend accumulated today, charged against the daily budget
    pub async fn daily_forecast_cost(&self) -> Result<Decimal> {
        let row = sqlx::query(
            r#"
            SELECT COALESCE(SUM(cost), 0) AS total FROM market_analyses
            WHERE analyzed_at::date = NOW()::date
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("total"))
    }

    /// Most recent recorded confidence for a market, used by the
    /// confidence-drift exit check.
    pub async fn latest_confidence(&self, market_id: &str) -> Result<Option<f64>> {
        let row = sqlx::query(
            r#"
            SELECT confidence FROM market_analyses
            WHERE market_id = $1 AND action <> 'error'
            ORDER BY analyzed_at DESC LIMIT 1
            "#,
        )
        .bind(market_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get("confidence")))
    }

    // ==================== Performance snapshots ====================

    pub async fn insert_snapshot(&self, snapshot: &PerformanceSnapshot) -> Result<i64> {
        let row = sqlx::query(
            r#"
            INSERT INTO performance_snapshots
                (taken_at, realized_pnl, unrealized_pnl, win_rate, total_trades,
                 open_positions, by_strategy)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id
            "#,
        )
        .bind(snapshot.taken_at)
        .bind(snapshot.realized_pnl)
        .bind(snapshot.unrealized_pnl)
        .bind(snapshot.win_rate)
        .bind(snapshot.total_trades)
        .bind(snapshot.open_positions)
        .bind(serde_json::to_value(&snapshot.by_strategy)?)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get("id"))
    }
}

#[async_trait::async_trait]
impl crate::persistence::Store for PostgresStore {
    async fn upsert_markets(&self, markets: &[Market]) -> Result<()> {
        self.upsert_markets(markets).await
    }

    async fn get_market(&self, market_id: &str) -> Result<Option<Market>> {
        self.get_market(market_id).await
    }

    async fn add_position(&self, position: &Position) -> Result<i64> {
        self.add_position(position).await
    }

    async fn get_open_positions(&self, tracked_only: bool) -> Result<Vec<Position>> {
        self.get_open_positions(tracked_only).await
    }

    async fn get_position(&self, id: i64) -> Result<Option<Position>> {
        self.get_position(id).await
    }

    async fn get_open_position_for_market(&self, market_id: &str) -> Result<Option<Position>> {
        self.get_open_position_for_market(market_id).await
    }

    async fn set_position_exit_plan(&self, id: i64, plan: &ExitPlan) -> Result<()> {
        self.set_position_exit_plan(id, plan).await
    }

    async fn close_position(&self, id: i64, exit_price: Decimal) -> Result<()> {
        self.close_position(id, exit_price).await
    }

    async fn count_positions(&self) -> Result<i64> {
        self.count_positions().await
    }

    async fn insert_order(&self, order: &Order) -> Result<i64> {
        self.insert_order(order).await
    }

    async fn update_order_status(
        &self,
        id: i64,
        status: OrderStatus,
        exchange_order_id: Option<String>,
        error: Option<String>,
    ) -> Result<()> {
        self.update_order_status(id, status, exchange_order_id, error)
            .await
    }

    async fn update_order_fill(
        &self,
        id: i64,
        filled_quantity: u64,
        avg_fill_price: Decimal,
        status: OrderStatus,
    ) -> Result<()> {
        self.update_order_fill(id, filled_quantity, avg_fill_price, status)
            .await
    }

    async fn get_orders_for_position(&self, position_id: i64) -> Result<Vec<Order>> {
        self.get_orders_for_position(position_id).await
    }

    async fn link_order_to_position(&self, order_id: i64, position_id: i64) -> Result<()> {
        self.link_order_to_position(order_id, position_id).await
    }

    async fn add_trade_log(&self, log: &TradeLog) -> Result<i64> {
        self.add_trade_log(log).await
    }

    async fn get_trade_logs(&self) -> Result<Vec<TradeLog>> {
        self.get_trade_logs().await
    }

    async fn trade_log_exists_for_position(&self, position_id: i64) -> Result<bool> {
        self.trade_log_exists_for_position(position_id).await
    }

    async fn record_market_analysis(&self, record: &AnalysisRecord) -> Result<()> {
        self.record_market_analysis(record).await
    }

    async fn was_recently_analyzed(&self, market_id: &str, cooldown_hours: i64) -> Result<bool> {
        self.was_recently_analyzed(market_id, cooldown_hours).await
    }

    async fn analysis_count_today(&self, market_id: &str) -> Result<i64> {
        self.analysis_count_today(market_id).await
    }

    async fn daily_forecast_cost(&self) -> Result<Decimal> {
        self.daily_forecast_cost().await
    }

    async fn latest_confidence(&self, market_id: &str) -> Result<Option<f64>> {
        self.latest_confidence(market_id).await
    }

    async fn insert_snapshot(&self, snapshot: &PerformanceSnapshot) -> Result<i64> {
        self.insert_snapshot(snapshot).await
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn parse<T>(raw: &str, what: &str) -> Result<T>
where
    T: for<'a> TryFrom<&'a str, Error = String>,
{
    T::try_from(raw).map_err(|e| ProphetError::InvalidState(format!("{what}: {e}")))
}

fn row_to_market(row: sqlx::postgres::PgRow) -> Result<Market> {
    Ok(Market {
        id: row.get("id"),
        event_id: row.get("event_id"),
        title: row.get("title"),
        category: row.get("category"),
        yes_bid: row.get("yes_bid"),
        yes_ask: row.get("yes_ask"),
        no_bid: row.get("no_bid"),
        no_ask: row.get("no_ask"),
        last_price: row.get("last_price"),
        volume: row.get("volume"),
        expiration: row.get("expiration"),
        status: parse::<MarketStatus>(row.get::<&str, _>("status"), "market status")?,
        result: row
            .get::<Option<String>, _>("result")
            .map(|s| parse::<Side>(&s, "market result"))
            .transpose()?,
        fetched_at: row.get("fetched_at"),
    })
}

fn row_to_position(row: sqlx::postgres::PgRow) -> Result<Position> {
    let exit_plan = match (
        row.get::<Option<Decimal>, _>("stop_loss_price"),
        row.get::<Option<Decimal>, _>("take_profit_price"),
        row.get::<Option<i64>, _>("max_hold_hours"),
        row.get::<Option<f64>, _>("confidence_delta"),
    ) {
        (Some(stop), Some(take), Some(hold), Some(delta)) => Some(ExitPlan {
            stop_loss_price: stop,
            take_profit_price: take,
            max_hold_hours: hold,
            confidence_delta: delta,
        }),
        _ => None,
    };

    Ok(Position {
        id: Some(row.get("id")),
        market_id: row.get("market_id"),
        side: parse::<Side>(row.get::<&str, _>("side"), "position side")?,
        entry_price: row.get("entry_price"),
        quantity: row.get::<i64, _>("quantity") as u64,
        opened_at: row.get("opened_at"),
        strategy: parse::<StrategyKind>(row.get::<&str, _>("strategy"), "position strategy")?,
        status: parse::<PositionStatus>(row.get::<&str, _>("status"), "position status")?,
        tracked: row.get("tracked"),
        confidence: row.get("confidence"),
        rationale: row.get("rationale"),
        group_id: row.get("group_id"),
        exit_plan,
        closed_at: row.get("closed_at"),
        exit_price: row.get("exit_price"),
    })
}

fn row_to_order(row: sqlx::postgres::PgRow) -> Result<Order> {
    let action = match row.get::<&str, _>("action") {
        "buy" => OrderAction::Buy,
        "sell" => OrderAction::Sell,
        other => {
            return Err(ProphetError::InvalidState(format!(
                "order action: {other}"
            )))
        }
    };
    let order_type = match row.get::<&str, _>("order_type") {
        "limit" => OrderType::Limit,
        "market" => OrderType::Market,
        other => return Err(ProphetError::InvalidState(format!("order type: {other}"))),
    };

    Ok(Order {
        id: Some(row.get("id")),
        position_id: row.get("position_id"),
        group_id: row.get("group_id"),
        client_order_id: row.get("client_order_id"),
        exchange_order_id: row.get("exchange_order_id"),
        market_id: row.get("market_id"),
        side: parse::<Side>(row.get::<&str, _>("side"), "order side")?,
        action,
        order_type,
        quantity: row.get::<i64, _>("quantity") as u64,
        price: row.get("price"),
        filled_quantity: row.get::<i64, _>("filled_quantity") as u64,
        avg_fill_price: row.get("avg_fill_price"),
        status: parse::<OrderStatus>(row.get::<&str, _>("status"), "order status")?,
        error: row.get("error"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn row_to_trade_log(row: sqlx::postgres::PgRow) -> Result<TradeLog> {
    Ok(TradeLog {
        id: Some(row.get("id")),
        position_id: row.get("position_id"),
        market_id: row.get("market_id"),
        side: parse::<Side>(row.get::<&str, _>("side"), "trade side")?,
        entry_price: row.get("entry_price"),
        exit_price: row.get("exit_price"),
        quantity: row.get::<i64, _>("quantity") as u64,
        pnl: row.get("pnl"),
        strategy: parse::<StrategyKind>(row.get::<&str, _>("strategy"), "trade strategy")?,
        exit_reason: row.get("exit_reason"),
        slippage: row.get("slippage"),
        entry_at: row.get("entry_at"),
        exit_at: row.get("exit_at"),
    })
}
