//! Kalshi-style REST exchange client
//!
//! Thin boundary over the exchange's trade API: request signing, cents to
//! `Decimal` dollars conversion, and response-shape mapping all live here.
//! Everything above this module speaks the `ExchangeClient` contract only.

use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::Duration;
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::config::ExchangeConfig;
use crate::domain::{
    DepthLevel, Fill, Market, MarketStatus, Orderbook, OrderAction, OrderRequest, OrderStatus,
    Side,
};
use crate::error::{ProphetError, Result};
use crate::exchange::{ExchangeClient, ExchangePosition, MarketFilter, MarketPage, OrderHandle};

const API_PREFIX: &str = "/trade-api/v2";

/// Exchange API credentials, wiped from memory on drop
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ApiCredentials {
    pub key_id: String,
    pub secret: String,
}

/// REST client for a Kalshi-style exchange
pub struct KalshiClient {
    http: Client,
    base_url: String,
    credentials: ApiCredentials,
    page_size: u32,
}

impl KalshiClient {
    pub fn new(config: &ExchangeConfig, live: bool) -> Result<Self> {
        let (key_id, secret) = config.credentials(live);
        if key_id.is_empty() || secret.is_empty() {
            return Err(ProphetError::Auth(format!(
                "missing {} exchange credentials",
                if live { "live" } else { "demo" }
            )));
        }

        let http = Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(ProphetError::Http)?;

        Ok(Self {
            http,
            base_url: config.base_url(live).trim_end_matches('/').to_string(),
            credentials: ApiCredentials { key_id, secret },
            page_size: config.page_size,
        })
    }

    /// Signature over `timestamp + METHOD + path`, as the exchange expects
    fn sign(&self, timestamp_ms: i64, method: &str, path: &str) -> String {
        let message = format!("{}{}{}", timestamp_ms, method.to_uppercase(), path);
        let mut mac = Hmac::<Sha256>::new_from_slice(self.credentials.secret.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(message.as_bytes());
        base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
    }

    async fn request<T: for<'de> Deserialize<'de>>(
        &self,
        method: reqwest::Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<serde_json::Value>,
    ) -> Result<T> {
        let timestamp_ms = Utc::now().timestamp_millis();
        let signature = self.sign(timestamp_ms, method.as_str(), path);
        let url = format!("{}{}", self.base_url, path);

        let mut request = self
            .http
            .request(method, &url)
            .query(query)
            .header("KALSHI-ACCESS-KEY", &self.credentials.key_id)
            .header("KALSHI-ACCESS-TIMESTAMP", timestamp_ms.to_string())
            .header("KALSHI-ACCESS-SIGNATURE", signature);
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await?;
        let status = response.status();

        match status {
            StatusCode::TOO_MANY_REQUESTS => {
                Err(ProphetError::RateLimited(format!("429 from {}", path)))
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(ProphetError::Auth(format!(
                "{} from {}",
                status.as_u16(),
                path
            ))),
            s if s.is_success() => {
                let parsed = response.json::<T>().await?;
                debug!(path, "exchange request ok");
                Ok(parsed)
            }
            s => {
                let text = response.text().await.unwrap_or_default();
                Err(ProphetError::MarketDataUnavailable(format!(
                    "{} from {}: {}",
                    s.as_u16(),
                    path,
                    text
                )))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Wire types (cents-denominated, mapped to Decimal dollars at this boundary)
// ---------------------------------------------------------------------------

fn cents(value: i64) -> Decimal {
    Decimal::from(value) / Decimal::from(100)
}

fn to_cents(value: Decimal) -> i64 {
    use rust_decimal::prelude::ToPrimitive;
    (value * Decimal::from(100)).round().to_i64().unwrap_or(0)
}

#[derive(Debug, Deserialize)]
struct MarketsResponse {
    markets: Vec<WireMarket>,
    cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MarketResponse {
    market: WireMarket,
}

#[derive(Debug, Deserialize)]
struct WireMarket {
    ticker: String,
    event_ticker: String,
    title: String,
    #[serde(default)]
    category: String,
    #[serde(default)]
    yes_bid: i64,
    #[serde(default)]
    yes_ask: i64,
    #[serde(default)]
    no_bid: i64,
    #[serde(default)]
    no_ask: i64,
    #[serde(default)]
    last_price: i64,
    #[serde(default)]
    volume: i64,
    expiration_time: DateTime<Utc>,
    status: String,
    #[serde(default)]
    result: Option<String>,
}

impl WireMarket {
    fn into_market(self) -> Result<Market> {
        let status = MarketStatus::try_from(self.status.as_str())
            .map_err(ProphetError::InvalidMarketData)?;
        let result = match self.result.as_deref() {
            Some("") | None => None,
            Some(raw) => Some(Side::try_from(raw).map_err(ProphetError::InvalidMarketData)?),
        };
        Ok(Market {
            id: self.ticker,
            event_id: self.event_ticker,
            title: self.title,
            category: self.category,
            yes_bid: cents(self.yes_bid),
            yes_ask: cents(self.yes_ask),
            no_bid: cents(self.no_bid),
            no_ask: cents(self.no_ask),
            last_price: cents(self.last_price),
            volume: Decimal::from(self.volume),
            expiration: self.expiration_time,
            status,
            result,
            fetched_at: Utc::now(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct OrderbookResponse {
    orderbook: WireOrderbook,
}

/// The book lists resting YES and NO bids; a NO bid at `p` is a YES offer at
/// `1 - p`, which is how the ask side below is derived.
#[derive(Debug, Deserialize)]
struct WireOrderbook {
    #[serde(default)]
    yes: Vec<(i64, u64)>,
    #[serde(default)]
    no: Vec<(i64, u64)>,
}

#[derive(Debug, Serialize)]
struct WireOrderBody<'a> {
    ticker: &'a str,
    client_order_id: &'a str,
    side: &'a str,
    action: &'a str,
    count: u64,
    #[serde(rename = "type")]
    order_type: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    yes_price: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    no_price: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    order: WireOrder,
}

#[derive(Debug, Deserialize)]
struct WireOrder {
    order_id: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct FillsResponse {
    fills: Vec<WireFill>,
}

#[derive(Debug, Deserialize)]
struct WireFill {
    order_id: String,
    #[serde(default)]
    yes_price: i64,
    #[serde(default)]
    no_price: i64,
    count: u64,
    side: String,
    created_time: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct PositionsResponse {
    market_positions: Vec<WirePosition>,
}

#[derive(Debug, Deserialize)]
struct WirePosition {
    ticker: String,
    /// Signed: positive = YES contracts, negative = NO contracts
    position: i64,
    #[serde(default)]
    market_exposure: i64,
}

#[derive(Debug, Deserialize)]
struct BalanceResponse {
    /// Cents
    balance: i64,
}

#[async_trait]
impl ExchangeClient for KalshiClient {
    fn is_dry_run(&self) -> bool {
        false
    }

    async fn list_markets(&self, filter: &MarketFilter) -> Result<MarketPage> {
        let mut query: Vec<(&str, String)> = vec![(
            "limit",
            filter
                .limit
                .min(self.page_size)
                .max(1)
                .to_string(),
        )];
        if filter.open_only {
            query.push(("status", "open".to_string()));
        }
        if let Some(cursor) = &filter.cursor {
            query.push(("cursor", cursor.clone()));
        }

        let response: MarketsResponse = self
            .request(
                reqwest::Method::GET,
                &format!("{}/markets", API_PREFIX),
                &query,
                None,
            )
            .await?;

        let markets = response
            .markets
            .into_iter()
            .filter_map(|wire| wire.into_market().ok())
            .collect();
        let cursor = response.cursor.filter(|c| !c.is_empty());
        Ok(MarketPage { markets, cursor })
    }

    async fn get_market(&self, market_id: &str) -> Result<Market> {
        let response: MarketResponse = self
            .request(
                reqwest::Method::GET,
                &format!("{}/markets/{}", API_PREFIX, market_id),
                &[],
                None,
            )
            .await?;
        response.market.into_market()
    }

    async fn get_orderbook(&self, market_id: &str) -> Result<Orderbook> {
        let response: OrderbookResponse = self
            .request(
                reqwest::Method::GET,
                &format!("{}/markets/{}/orderbook", API_PREFIX, market_id),
                &[("depth", "10".to_string())],
                None,
            )
            .await?;

        let mut yes_bids: Vec<DepthLevel> = response
            .orderbook
            .yes
            .into_iter()
            .map(|(price, quantity)| DepthLevel {
                price: cents(price),
                quantity,
            })
            .collect();
        yes_bids.sort_by(|a, b| b.price.cmp(&a.price));

        let mut yes_asks: Vec<DepthLevel> = response
            .orderbook
            .no
            .into_iter()
            .map(|(price, quantity)| DepthLevel {
                price: Decimal::ONE - cents(price),
                quantity,
            })
            .collect();
        yes_asks.sort_by(|a, b| a.price.cmp(&b.price));

        Ok(Orderbook {
            market_id: market_id.to_string(),
            yes_asks,
            yes_bids,
            fetched_at: Utc::now(),
        })
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderHandle> {
        let price_cents = to_cents(request.price);
        let body = WireOrderBody {
            ticker: &request.market_id,
            client_order_id: &request.client_order_id,
            side: match request.side {
                Side::Yes => "yes",
                Side::No => "no",
            },
            action: match request.action {
                OrderAction::Buy => "buy",
                OrderAction::Sell => "sell",
            },
            count: request.quantity,
            order_type: request.order_type.as_str(),
            yes_price: matches!(request.side, Side::Yes).then_some(price_cents),
            no_price: matches!(request.side, Side::No).then_some(price_cents),
        };

        let response: OrderResponse = self
            .request(
                reqwest::Method::POST,
                &format!("{}/portfolio/orders", API_PREFIX),
                &[],
                Some(serde_json::to_value(&body)?),
            )
            .await?;

        let status = match response.order.status.as_str() {
            "executed" | "filled" => OrderStatus::Filled,
            "canceled" | "cancelled" => OrderStatus::Cancelled,
            _ => OrderStatus::Placed,
        };

        Ok(OrderHandle {
            exchange_order_id: response.order.order_id,
            status,
        })
    }

    async fn get_fills(&self, exchange_order_id: &str) -> Result<Vec<Fill>> {
        let response: FillsResponse = self
            .request(
                reqwest::Method::GET,
                &format!("{}/portfolio/fills", API_PREFIX),
                &[("order_id", exchange_order_id.to_string())],
                None,
            )
            .await?;

        Ok(response
            .fills
            .into_iter()
            .map(|fill| {
                let price = if fill.side == "yes" {
                    cents(fill.yes_price)
                } else {
                    cents(fill.no_price)
                };
                Fill {
                    order_id: fill.order_id,
                    price,
                    quantity: fill.count,
                    timestamp: fill.created_time,
                    fee: Decimal::ZERO,
                }
            })
            .collect())
    }

    async fn get_positions(&self) -> Result<Vec<ExchangePosition>> {
        let response: PositionsResponse = self
            .request(
                reqwest::Method::GET,
                &format!("{}/portfolio/positions", API_PREFIX),
                &[],
                None,
            )
            .await?;

        Ok(response
            .market_positions
            .into_iter()
            .filter(|p| p.position != 0)
            .map(|p| {
                let quantity = p.position.unsigned_abs();
                let side = if p.position > 0 { Side::Yes } else { Side::No };
                let avg_price = (p.market_exposure > 0 && quantity > 0)
                    .then(|| cents(p.market_exposure) / Decimal::from(quantity));
                ExchangePosition {
                    market_id: p.ticker,
                    side,
                    quantity,
                    avg_price,
                }
            })
            .collect())
    }

    async fn get_balance(&self) -> Result<Decimal> {
        let response: BalanceResponse = self
            .request(
                reqwest::Method::GET,
                &format!("{}/portfolio/balance", API_PREFIX),
                &[],
                None,
            )
            .await?;
        Ok(cents(response.balance))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_cents_conversion_round_trips() {
        assert_eq!(cents(45), dec!(0.45));
        assert_eq!(to_cents(dec!(0.45)), 45);
        assert_eq!(to_cents(cents(99)), 99);
    }

    #[test]
    fn test_wire_market_maps_status_and_result() {
        let wire = WireMarket {
            ticker: "MKT-A".to_string(),
            event_ticker: "EVT-A".to_string(),
            title: "Test".to_string(),
            category: "politics".to_string(),
            yes_bid: 38,
            yes_ask: 40,
            no_bid: 58,
            no_ask: 60,
            last_price: 39,
            volume: 1200,
            expiration_time: Utc::now(),
            status: "resolved".to_string(),
            result: Some("yes".to_string()),
        };

        let market = wire.into_market().unwrap();
        assert_eq!(market.status, MarketStatus::Resolved);
        assert_eq!(market.result, Some(Side::Yes));
        assert_eq!(market.yes_ask, dec!(0.40));
    }

    #[test]
    fn test_wire_market_rejects_unknown_status() {
        let wire = WireMarket {
            ticker: "MKT-A".to_string(),
            event_ticker: "EVT-A".to_string(),
            title: "Test".to_string(),
            category: String::new(),
            yes_bid: 0,
            yes_ask: 0,
            no_bid: 0,
            no_ask: 0,
            last_price: 0,
            volume: 0,
            expiration_time: Utc::now(),
            status: "bogus".to_string(),
            result: None,
        };
        assert!(wire.into_market().is_err());
    }

    #[test]
    fn test_signature_is_deterministic() {
        let config = ExchangeConfig {
            demo_base_url: "https://demo-api.example.com".to_string(),
            live_base_url: "https://api.example.com".to_string(),
            api_key_id: "key".to_string(),
            api_secret: "secret".to_string(),
            live_api_key_id: String::new(),
            live_api_secret: String::new(),
            rate_limit_per_sec: 10.0,
            request_timeout_ms: 1000,
            max_retries: 3,
            page_size: 100,
        };
        let client = KalshiClient::new(&config, false).unwrap();
        let a = client.sign(1_700_000_000_000, "GET", "/trade-api/v2/markets");
        let b = client.sign(1_700_000_000_000, "GET", "/trade-api/v2/markets");
        let c = client.sign(1_700_000_000_001, "GET", "/trade-api/v2/markets");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_missing_credentials_rejected() {
        let config = ExchangeConfig {
            demo_base_url: "https://demo-api.example.com".to_string(),
            live_base_url: "https://api.example.com".to_string(),
            api_key_id: String::new(),
            api_secret: String::new(),
            live_api_key_id: String::new(),
            live_api_secret: String::new(),
            rate_limit_per_sec: 10.0,
            request_timeout_ms: 1000,
            max_retries: 3,
            page_size: 100,
        };
        assert!(KalshiClient::new(&config, false).is_err());
    }
}
