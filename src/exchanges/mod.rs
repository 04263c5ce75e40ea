//! Exchange integrations.
//!
//! Defines the [`Exchange`] capability trait every venue implements and
//! the [`ExchangeRegistry`] that builds adapters from stored bindings:
//! - paper: in-memory venue with decimal balances, used locally and in tests
//! - binance: spot REST adapter with HMAC-SHA256 request signing
//!
//! Adapters return `anyhow::Result`; the script binding layer turns a
//! failure into the `false` sentinel scripts expect and logs it.

pub mod binance;
pub mod limiter;
pub mod paper;

use anyhow::Result;
use async_trait::async_trait;
use secrecy::SecretString;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::config::AppConfig;
use crate::types::{Account, Order, Period, Record, Ticker, TradeSide};
pub use limiter::RateLimiter;

/// Uniform capability surface of a trading venue.
#[async_trait]
pub trait Exchange: Send + Sync {
    /// Venue type, e.g. `"binance"`.
    fn exchange_type(&self) -> &str;

    /// User-chosen name of this binding.
    fn name(&self) -> &str;

    /// Throttle consulted by `SetLimit` / `AutoSleep`.
    fn limiter(&self) -> &RateLimiter;

    /// Smallest tradable amount for `pair`, 0 when unknown.
    fn min_amount(&self, pair: &str) -> f64;

    async fn get_account(&self) -> Result<Account>;

    /// Place an order and return its id. `price <= 0` places a market order.
    async fn trade(&self, side: TradeSide, pair: &str, price: f64, amount: f64) -> Result<String>;

    async fn get_order(&self, pair: &str, id: &str) -> Result<Order>;

    /// Open orders.
    async fn get_orders(&self, pair: &str) -> Result<Vec<Order>>;

    /// Recently filled orders.
    async fn get_trades(&self, pair: &str) -> Result<Vec<Order>>;

    /// Returns whether the venue accepted the cancellation.
    async fn cancel_order(&self, order: &Order) -> Result<bool>;

    async fn get_ticker(&self, pair: &str, depth: usize) -> Result<Ticker>;

    async fn get_records(&self, pair: &str, period: Period, size: usize) -> Result<Vec<Record>>;
}

// ---------------------------------------------------------------------------
// Bindings and construction
// ---------------------------------------------------------------------------

/// One stored exchange binding of a trader. Used once to build an
/// adapter; the runtime keeps the adapter, not the credentials.
pub struct ExchangeOption {
    pub trader_id: i64,
    pub exchange_type: String,
    pub name: String,
    pub access_key: String,
    pub secret_key: SecretString,
}

impl fmt::Debug for ExchangeOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExchangeOption")
            .field("trader_id", &self.trader_id)
            .field("exchange_type", &self.exchange_type)
            .field("name", &self.name)
            .field("secret_key", &"[REDACTED]")
            .finish()
    }
}

pub type ExchangeMaker = Arc<dyn Fn(ExchangeOption) -> Result<Arc<dyn Exchange>> + Send + Sync>;

/// Maps a venue type string to its adapter constructor.
#[derive(Clone, Default)]
pub struct ExchangeRegistry {
    makers: HashMap<String, ExchangeMaker>,
}

impl ExchangeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `paper` and `binance` adapters.
    pub fn with_defaults(cfg: &AppConfig) -> Self {
        let mut registry = Self::new();

        let paper_cfg = cfg.paper.clone();
        registry.register(paper::EXCHANGE_TYPE, move |opt| {
            Ok(Arc::new(paper::PaperExchange::new(&opt.name, &paper_cfg)) as Arc<dyn Exchange>)
        });

        let binance_cfg = cfg.binance.clone();
        registry.register(binance::EXCHANGE_TYPE, move |opt| {
            Ok(Arc::new(binance::BinanceExchange::new(opt, &binance_cfg)?) as Arc<dyn Exchange>)
        });

        registry
    }

    pub fn register<F>(&mut self, exchange_type: &str, maker: F)
    where
        F: Fn(ExchangeOption) -> Result<Arc<dyn Exchange>> + Send + Sync + 'static,
    {
        self.makers.insert(exchange_type.to_string(), Arc::new(maker));
    }

    pub fn contains(&self, exchange_type: &str) -> bool {
        self.makers.contains_key(exchange_type)
    }

    /// `None` when no adapter is registered for the binding's type.
    pub fn make(&self, opt: ExchangeOption) -> Option<Result<Arc<dyn Exchange>>> {
        let maker = self.makers.get(&opt.exchange_type)?;
        Some(maker(opt))
    }

    pub fn types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.makers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

/// `BTC/USDT` → (`BTC`, `USDT`).
pub fn split_pair(pair: &str) -> Result<(String, String)> {
    let upper = pair.to_uppercase();
    match upper.split_once('/') {
        Some((base, quote)) if !base.is_empty() && !quote.is_empty() => {
            Ok((base.to_string(), quote.to_string()))
        }
        _ => anyhow::bail!("unrecognized stockType: {pair}"),
    }
}
