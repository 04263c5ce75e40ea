//! Shared types for the scriptbot runtime.
//!
//! Stored records (traders, users, algorithms, exchange bindings), the
//! market data shapes handed to scripts, and the supervisor's error type.
//! Market data structs serialise with the field names scripts see
//! (`Price`, `DealAmount`, `Bids`...).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// Stored records
// ---------------------------------------------------------------------------

/// A configured strategy run targeting one user's exchange bindings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Trader {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    /// `None` until the owner selects a script.
    pub algorithm_id: Option<i64>,
    /// 0 = idle, 1 = running. Only the supervisor changes this.
    #[serde(default)]
    pub status: i64,
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
}

impl Trader {
    pub fn new(id: i64, user_id: i64, name: &str, algorithm_id: Option<i64>) -> Self {
        Self {
            id,
            user_id,
            name: name.to_string(),
            algorithm_id,
            status: 0,
            last_run_at: None,
        }
    }
}

impl fmt::Display for Trader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "trader #{} '{}' (user {})", self.id, self.name, self.user_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub id: i64,
    pub username: String,
}

/// Stored script source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Algorithm {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub script: String,
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Order direction as scripts spell it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Buy => "BUY",
            TradeSide::Sell => "SELL",
        }
    }
}

impl fmt::Display for TradeSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Case-insensitive: `"buy"`, `"BUY"`.
impl std::str::FromStr for TradeSide {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "BUY" => Ok(TradeSide::Buy),
            "SELL" => Ok(TradeSide::Sell),
            _ => Err(anyhow::anyhow!("unrecognized trade type: {s}")),
        }
    }
}

/// Candlestick period identifiers, bound into scripts as `M`, `M5`...
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Period {
    M,
    M5,
    M15,
    M30,
    H,
    D,
    W,
}

impl Period {
    pub const ALL: &'static [Period] = &[
        Period::M,
        Period::M5,
        Period::M15,
        Period::M30,
        Period::H,
        Period::D,
        Period::W,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Period::M => "M",
            Period::M5 => "M5",
            Period::M15 => "M15",
            Period::M30 => "M30",
            Period::H => "H",
            Period::D => "D",
            Period::W => "W",
        }
    }

    pub fn seconds(&self) -> i64 {
        match self {
            Period::M => 60,
            Period::M5 => 300,
            Period::M15 => 900,
            Period::M30 => 1_800,
            Period::H => 3_600,
            Period::D => 86_400,
            Period::W => 604_800,
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Period {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Period::ALL
            .iter()
            .copied()
            .find(|p| p.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| anyhow::anyhow!("unrecognized period: {s}"))
    }
}

// ---------------------------------------------------------------------------
// Market data
// ---------------------------------------------------------------------------

/// Balances keyed by asset, plus `Frozen<ASSET>` for amounts locked in
/// open orders.
pub type Account = BTreeMap<String, f64>;

/// Missing fields default, so scripts can hand back partial objects.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "PascalCase", default)]
pub struct Order {
    #[serde(rename = "ID")]
    pub id: String,
    pub price: f64,
    pub amount: f64,
    pub deal_amount: f64,
    pub fee: f64,
    pub trade_type: String,
    pub stock_type: String,
}

impl Order {
    /// Quantity still open.
    pub fn remaining(&self) -> f64 {
        (self.amount - self.deal_amount).max(0.0)
    }
}

impl fmt::Display for Order {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} @ {} (filled {})",
            self.trade_type, self.amount, self.stock_type, self.price, self.deal_amount
        )
    }
}

/// One candlestick.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "PascalCase")]
pub struct Record {
    /// Unix seconds at the candle open.
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// One depth level.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "PascalCase")]
pub struct OrderBook {
    pub price: f64,
    pub amount: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "PascalCase")]
pub struct Ticker {
    pub bids: Vec<OrderBook>,
    /// Best bid, `Bids[0].Price`.
    pub buy: f64,
    /// `(Buy + Sell) / 2`
    pub mid: f64,
    /// Best ask, `Asks[0].Price`.
    pub sell: f64,
    pub asks: Vec<OrderBook>,
}

impl Ticker {
    /// Build a ticker from depth, best level first on each side.
    pub fn from_depth(bids: Vec<OrderBook>, asks: Vec<OrderBook>) -> anyhow::Result<Self> {
        let (Some(best_bid), Some(best_ask)) = (bids.first(), asks.first()) else {
            anyhow::bail!("can not get enough Bids or Asks");
        };
        let (buy, sell) = (best_bid.price, best_ask.price);
        Ok(Self {
            bids,
            buy,
            mid: (buy + sell) / 2.0,
            sell,
            asks,
        })
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Configuration errors reported synchronously by the supervisor. Anything
/// that goes wrong after a unit is spawned goes to the trader log instead.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("trader not found: {0}")]
    TraderNotFound(i64),

    #[error("failed to load trader {id}: {source}")]
    LoadTrader {
        id: i64,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to load user {id}: {source}")]
    LoadUser {
        id: i64,
        #[source]
        source: anyhow::Error,
    },

    #[error("trader {0} has no algorithm selected")]
    NoAlgorithm(i64),

    #[error("failed to load algorithm {id}: {source}")]
    LoadAlgorithm {
        id: i64,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to load exchanges of trader {id}: {source}")]
    LoadExchanges {
        id: i64,
        #[source]
        source: anyhow::Error,
    },

    #[error("trader {0} has no usable exchange")]
    NoExchange(i64),

    #[error("trader {0} is already running")]
    AlreadyRunning(i64),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trade_side_from_str() {
        assert_eq!("buy".parse::<TradeSide>().unwrap(), TradeSide::Buy);
        assert_eq!("SELL".parse::<TradeSide>().unwrap(), TradeSide::Sell);
        assert!("long".parse::<TradeSide>().is_err());
    }

    #[test]
    fn test_period_from_str() {
        assert_eq!("m15".parse::<Period>().unwrap(), Period::M15);
        assert_eq!("D".parse::<Period>().unwrap(), Period::D);
        assert!("Y".parse::<Period>().is_err());
        assert_eq!(Period::H.seconds(), 3_600);
    }

    #[test]
    fn test_order_script_field_names() {
        let order = Order {
            id: "7".into(),
            price: 10.0,
            amount: 2.0,
            deal_amount: 0.5,
            trade_type: "BUY".into(),
            stock_type: "BTC/USDT".into(),
            ..Order::default()
        };
        let json = serde_json::to_value(&order).unwrap();
        assert_eq!(json["ID"], "7");
        assert_eq!(json["DealAmount"], 0.5);
        assert_eq!(json["StockType"], "BTC/USDT");
        assert_eq!(order.remaining(), 1.5);
    }

    #[test]
    fn test_ticker_from_depth() {
        let ticker = Ticker::from_depth(
            vec![OrderBook { price: 99.0, amount: 1.0 }],
            vec![OrderBook { price: 101.0, amount: 2.0 }],
        )
        .unwrap();
        assert_eq!(ticker.mid, 100.0);
        assert_eq!(ticker.buy, 99.0);
        assert!(Ticker::from_depth(vec![], vec![]).is_err());
    }

    #[test]
    fn test_supervisor_error_display() {
        assert_eq!(SupervisorError::TraderNotFound(9).to_string(), "trader not found: 9");
        assert_eq!(
            SupervisorError::NoAlgorithm(3).to_string(),
            "trader 3 has no algorithm selected"
        );
    }
}
