use async_trait::async_trait;
use rand::Rng;
use rust_decimal::Decimal;
use std::future::Future;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{ExchangeClient, ExchangePosition, MarketFilter, MarketPage, OrderHandle};
use crate::domain::{Fill, Market, Orderbook, OrderRequest};
use crate::error::{ProphetError, Result};

/// Rate-limited exchange gateway.
///
/// Wraps any `ExchangeClient` with request pacing, per-call timeouts and
/// bounded retry with exponential backoff + jitter for transient failures.
/// Non-transient errors pass through on the first attempt.
pub struct RateLimitedGateway<C> {
    inner: C,
    /// Minimum interval between any two requests
    min_interval: Duration,
    call_timeout: Duration,
    max_retries: u8,
    last_call: Mutex<Instant>,
}

impl<C: ExchangeClient> RateLimitedGateway<C> {
    pub fn new(inner: C, rate_limit_per_sec: f64, call_timeout_ms: u64, max_retries: u8) -> Self {
        let min_interval = if rate_limit_per_sec > 0.0 {
            Duration::from_secs_f64(1.0 / rate_limit_per_sec)
        } else {
            Duration::ZERO
        };
        Self {
            inner,
            min_interval,
            call_timeout: Duration::from_millis(call_timeout_ms),
            max_retries,
            last_call: Mutex::new(
                Instant::now()
                    .checked_sub(Duration::from_secs(60))
                    .unwrap_or_else(Instant::now),
            ),
        }
    }

    /// Sleep until the pacing interval since the previous call has elapsed
    async fn pace(&self) {
        let mut last = self.last_call.lock().await;
        let elapsed = last.elapsed();
        if elapsed < self.min_interval {
            tokio::time::sleep(self.min_interval - elapsed).await;
        }
        *last = Instant::now();
    }

    async fn with_retry<T, F, Fut>(&self, op_name: &str, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt: u8 = 0;
        loop {
            self.pace().await;

            let result = match tokio::time::timeout(self.call_timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(ProphetError::Timeout(format!(
                    "{} exceeded {}ms",
                    op_name,
                    self.call_timeout.as_millis()
                ))),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.max_retries => {
                    attempt += 1;
                    let backoff = backoff_delay(attempt);
                    warn!(
                        op = op_name,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "transient gateway failure, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(err) => {
                    debug!(op = op_name, error = %err, "gateway call failed");
                    return Err(err);
                }
            }
        }
    }
}

/// Exponential backoff with up to 25% random jitter
fn backoff_delay(attempt: u8) -> Duration {
    let base_ms = 250u64.saturating_mul(1 << attempt.min(6));
    let jitter = rand::thread_rng().gen_range(0..=base_ms / 4);
    Duration::from_millis(base_ms + jitter)
}

#[async_trait]
impl<C: ExchangeClient> ExchangeClient for RateLimitedGateway<C> {
    fn is_dry_run(&self) -> bool {
        self.inner.is_dry_run()
    }

    async fn list_markets(&self, filter: &MarketFilter) -> Result<MarketPage> {
        self.with_retry("list_markets", || self.inner.list_markets(filter))
            .await
    }

    async fn get_market(&self, market_id: &str) -> Result<Market> {
        self.with_retry("get_market", || self.inner.get_market(market_id))
            .await
    }

    async fn get_orderbook(&self, market_id: &str) -> Result<Orderbook> {
        self.with_retry("get_orderbook", || self.inner.get_orderbook(market_id))
            .await
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderHandle> {
        // Order placement is not blindly retried: a timed-out submission may
        // have reached the exchange, so the caller reconciles via fills.
        self.pace().await;
        match tokio::time::timeout(self.call_timeout, self.inner.place_order(request)).await {
            Ok(result) => result,
            Err(_) => Err(ProphetError::OrderTimeout(format!(
                "place_order for {} exceeded {}ms",
                request.market_id,
                self.call_timeout.as_millis()
            ))),
        }
    }

    async fn get_fills(&self, exchange_order_id: &str) -> Result<Vec<Fill>> {
        self.with_retry("get_fills", || self.inner.get_fills(exchange_order_id))
            .await
    }

    async fn get_positions(&self) -> Result<Vec<ExchangePosition>> {
        self.with_retry("get_positions", || self.inner.get_positions())
            .await
    }

    async fn get_balance(&self) -> Result<Decimal> {
        self.with_retry("get_balance", || self.inner.get_balance())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::MockExchangeClient;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let mut mock = MockExchangeClient::new();
        mock.expect_get_balance().times(3).returning(move || {
            let n = calls_clone.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(ProphetError::RateLimited("429".to_string()))
            } else {
                Ok(dec!(100))
            }
        });

        let gateway = RateLimitedGateway::new(mock, 1000.0, 1000, 3);
        let balance = gateway.get_balance().await.unwrap();
        assert_eq!(balance, dec!(100));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let mut mock = MockExchangeClient::new();
        // max_retries = 2 means at most 3 attempts
        mock.expect_get_balance()
            .times(3)
            .returning(|| Err(ProphetError::RateLimited("429".to_string())));

        let gateway = RateLimitedGateway::new(mock, 1000.0, 1000, 2);
        let result = gateway.get_balance().await;
        assert!(matches!(result, Err(ProphetError::RateLimited(_))));
    }

    #[tokio::test]
    async fn test_non_transient_error_not_retried() {
        let mut mock = MockExchangeClient::new();
        mock.expect_get_balance()
            .times(1)
            .returning(|| Err(ProphetError::Auth("bad key".to_string())));

        let gateway = RateLimitedGateway::new(mock, 1000.0, 1000, 3);
        let result = gateway.get_balance().await;
        assert!(matches!(result, Err(ProphetError::Auth(_))));
    }

    #[test]
    fn test_backoff_grows() {
        let first = backoff_delay(1);
        let third = backoff_delay(3);
        assert!(third > first);
    }
}
