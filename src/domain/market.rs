use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Side of a binary-outcome market (YES or NO)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Yes,
    No,
}

impl Side {
    /// Get the opposite side
    pub fn opposite(&self) -> Self {
        match self {
            Side::Yes => Side::No,
            Side::No => Side::Yes,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Yes => "YES",
            Side::No => "NO",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for Side {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.to_uppercase().as_str() {
            "YES" => Ok(Side::Yes),
            "NO" => Ok(Side::No),
            _ => Err(format!("Unknown side: {}", s)),
        }
    }
}

/// Market status as reported by the exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketStatus {
    Open,
    Closed,
    Resolved,
}

impl MarketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketStatus::Open => "open",
            MarketStatus::Closed => "closed",
            MarketStatus::Resolved => "resolved",
        }
    }

    pub fn is_tradable(&self) -> bool {
        matches!(self, MarketStatus::Open)
    }
}

impl TryFrom<&str> for MarketStatus {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "open" | "active" => Ok(MarketStatus::Open),
            "closed" => Ok(MarketStatus::Closed),
            "resolved" | "settled" | "finalized" => Ok(MarketStatus::Resolved),
            _ => Err(format!("Unknown market status: {}", s)),
        }
    }
}

/// Immutable-per-snapshot market record
///
/// Refreshed each ingestion cycle; superseded, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Market {
    pub id: String,
    /// Grouping key: markets sharing an event id are mutually exclusive
    pub event_id: String,
    pub title: String,
    pub category: String,
    pub yes_bid: Decimal,
    pub yes_ask: Decimal,
    pub no_bid: Decimal,
    pub no_ask: Decimal,
    pub last_price: Decimal,
    pub volume: Decimal,
    pub expiration: DateTime<Utc>,
    pub status: MarketStatus,
    /// Settled outcome, present once resolved
    pub result: Option<Side>,
    pub fetched_at: DateTime<Utc>,
}

impl Market {
    /// Price implied by current quotes for a side (ask, falling back to last)
    pub fn implied_price(&self, side: Side) -> Decimal {
        let ask = match side {
            Side::Yes => self.yes_ask,
            Side::No => self.no_ask,
        };
        if ask > Decimal::ZERO {
            ask
        } else {
            match side {
                Side::Yes => self.last_price,
                Side::No => Decimal::ONE - self.last_price,
            }
        }
    }

    /// Best bid for a side (what a position could currently be sold at)
    pub fn bid(&self, side: Side) -> Decimal {
        match side {
            Side::Yes => self.yes_bid,
            Side::No => self.no_bid,
        }
    }

    /// Sum of the two implied prices, used as a data-quality check
    pub fn price_sum(&self) -> Decimal {
        self.implied_price(Side::Yes) + self.implied_price(Side::No)
    }

    /// Quotes summing far from $1.00 indicate a data-quality problem
    pub fn prices_sane(&self) -> bool {
        let sum = self.price_sum();
        sum >= dec!(0.95) && sum <= dec!(1.05)
    }

    pub fn hours_to_expiry(&self, now: DateTime<Utc>) -> f64 {
        (self.expiration - now).num_seconds().max(0) as f64 / 3600.0
    }

    pub fn days_to_expiry(&self, now: DateTime<Utc>) -> f64 {
        self.hours_to_expiry(now) / 24.0
    }

    /// A price pinned at an extreme means the market has effectively resolved
    /// even if the exchange has not flipped its status yet.
    pub fn is_price_pinned(&self, side: Side) -> bool {
        let price = self.implied_price(side);
        price <= dec!(0.01) || price >= dec!(0.99)
    }

    /// Settlement value of one contract on `side` given the resolved outcome
    pub fn settlement_value(side: Side, result: Side) -> Decimal {
        if side == result {
            Decimal::ONE
        } else {
            Decimal::ZERO
        }
    }
}

/// One price level of an order book
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DepthLevel {
    pub price: Decimal,
    pub quantity: u64,
}

/// Order book depth for one market
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Orderbook {
    pub market_id: String,
    /// Resting YES offers, best (lowest) first
    pub yes_asks: Vec<DepthLevel>,
    /// Resting YES bids, best (highest) first
    pub yes_bids: Vec<DepthLevel>,
    pub fetched_at: DateTime<Utc>,
}

impl Orderbook {
    pub fn best_ask(&self) -> Option<DepthLevel> {
        self.yes_asks.first().copied()
    }

    pub fn best_bid(&self) -> Option<DepthLevel> {
        self.yes_bids.first().copied()
    }

    /// Quantity available at or below `limit` on the ask side
    pub fn ask_depth_at(&self, limit: Decimal) -> u64 {
        self.yes_asks
            .iter()
            .filter(|l| l.price <= limit)
            .map(|l| l.quantity)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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
            volume: dec!(1000),
            expiration: Utc::now() + chrono::Duration::days(7),
            status: MarketStatus::Open,
            result: None,
            fetched_at: Utc::now(),
        }
    }

    #[test]
    fn test_side_opposite() {
        assert_eq!(Side::Yes.opposite(), Side::No);
        assert_eq!(Side::No.opposite(), Side::Yes);
    }

    #[test]
    fn test_implied_price_falls_back_to_last() {
        let mut m = market(dec!(0.40), dec!(0.62));
        m.yes_ask = Decimal::ZERO;
        m.last_price = dec!(0.38);
        assert_eq!(m.implied_price(Side::Yes), dec!(0.38));
        assert_eq!(m.implied_price(Side::No), dec!(0.62));
    }

    #[test]
    fn test_price_sanity_band() {
        assert!(market(dec!(0.40), dec!(0.62)).prices_sane());
        assert!(!market(dec!(0.40), dec!(0.70)).prices_sane());
        assert!(!market(dec!(0.30), dec!(0.60)).prices_sane());
    }

    #[test]
    fn test_price_pinned_detects_resolution() {
        let m = market(dec!(0.99), dec!(0.02));
        assert!(m.is_price_pinned(Side::Yes));

        let m = market(dec!(0.40), dec!(0.62));
        assert!(!m.is_price_pinned(Side::Yes));
    }

    #[test]
    fn test_settlement_value() {
        assert_eq!(Market::settlement_value(Side::Yes, Side::Yes), Decimal::ONE);
        assert_eq!(Market::settlement_value(Side::No, Side::Yes), Decimal::ZERO);
    }

    #[test]
    fn test_orderbook_depth_at_limit() {
        let book = Orderbook {
            market_id: "MKT-TEST".to_string(),
            yes_asks: vec![
                DepthLevel {
                    price: dec!(0.40),
                    quantity: 50,
                },
                DepthLevel {
                    price: dec!(0.42),
                    quantity: 80,
                },
                DepthLevel {
                    price: dec!(0.45),
                    quantity: 200,
                },
            ],
            yes_bids: vec![DepthLevel {
                price: dec!(0.38),
                quantity: 60,
            }],
            fetched_at: Utc::now(),
        };

        assert_eq!(book.ask_depth_at(dec!(0.42)), 130);
        assert_eq!(book.ask_depth_at(dec!(0.39)), 0);
        assert_eq!(book.best_ask().unwrap().price, dec!(0.40));
    }
}
