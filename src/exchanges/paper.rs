//! Paper trading venue.
//!
//! Keeps balances, open orders and fills in memory with `Decimal`
//! arithmetic. The book is synthetic: the best bid and ask sit
//! `spread` below and above a mid price that tests (or a price feed) move
//! with [`PaperExchange::set_price`]. Orders that cross the book fill
//! immediately at the touch; others rest with their funds frozen until
//! the price reaches them or they are cancelled.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

use super::{split_pair, Exchange, RateLimiter};
use crate::config::PaperConfig;
use crate::types::{Account, Order, OrderBook, Period, Record, Ticker, TradeSide};

pub const EXCHANGE_TYPE: &str = "paper";

// ---------------------------------------------------------------------------
// Book state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OrderStatus {
    Open,
    Filled,
    Cancelled,
}

#[derive(Debug, Clone)]
struct PaperOrder {
    id: u64,
    side: TradeSide,
    pair: String,
    base: String,
    quote: String,
    /// Limit price; the fill price for market orders.
    price: Decimal,
    amount: Decimal,
    filled: Decimal,
    fee: Decimal,
    status: OrderStatus,
}

impl PaperOrder {
    fn to_order(&self) -> Order {
        Order {
            id: self.id.to_string(),
            price: to_f64(self.price),
            amount: to_f64(self.amount),
            deal_amount: to_f64(self.filled),
            fee: to_f64(self.fee),
            trade_type: self.side.as_str().to_string(),
            stock_type: self.pair.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct Book {
    free: HashMap<String, Decimal>,
    frozen: HashMap<String, Decimal>,
    prices: HashMap<String, Decimal>,
    orders: Vec<PaperOrder>,
    next_id: u64,
}

impl Book {
    fn free_mut(&mut self, asset: &str) -> &mut Decimal {
        self.free.entry(asset.to_string()).or_default()
    }

    fn frozen_mut(&mut self, asset: &str) -> &mut Decimal {
        self.frozen.entry(asset.to_string()).or_default()
    }
}

pub struct PaperExchange {
    name: String,
    limiter: RateLimiter,
    fee_rate: Decimal,
    min_amount: Decimal,
    spread: Decimal,
    book: Mutex<Book>,
}

impl PaperExchange {
    pub fn new(name: &str, cfg: &PaperConfig) -> Self {
        let book = Book {
            free: cfg
                .balances
                .iter()
                .map(|(asset, amount)| (asset.to_uppercase(), *amount))
                .collect(),
            prices: cfg
                .prices
                .iter()
                .map(|(pair, price)| (pair.to_uppercase(), *price))
                .collect(),
            next_id: 1,
            ..Book::default()
        };
        Self {
            name: name.to_string(),
            limiter: RateLimiter::default(),
            fee_rate: cfg.fee_rate,
            min_amount: cfg.min_amount,
            spread: cfg.spread,
            book: Mutex::new(book),
        }
    }

    fn book(&self) -> MutexGuard<'_, Book> {
        self.book.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn touch(&self, mid: Decimal) -> (Decimal, Decimal) {
        (mid * (Decimal::ONE - self.spread), mid * (Decimal::ONE + self.spread))
    }

    /// Move the mid price of `pair` and fill resting orders the new book
    /// crosses, at their limit price.
    pub fn set_price(&self, pair: &str, mid: Decimal) {
        let pair = pair.to_uppercase();
        let (bid, ask) = self.touch(mid);
        let mut book = self.book();
        book.prices.insert(pair.clone(), mid);

        let mut orders = std::mem::take(&mut book.orders);
        for order in orders.iter_mut().filter(|o| o.pair == pair && o.status == OrderStatus::Open) {
            let crosses = match order.side {
                TradeSide::Buy => order.price >= ask,
                TradeSide::Sell => order.price <= bid,
            };
            if crosses {
                let price = order.price;
                self.fill(&mut book, order, price, true);
                debug!(id = order.id, pair = %pair, "paper order filled");
            }
        }
        book.orders = orders;
    }

    /// Settle `order` in full at `price`. `from_frozen` releases the
    /// reservation taken when the order started resting.
    fn fill(&self, book: &mut Book, order: &mut PaperOrder, price: Decimal, from_frozen: bool) {
        let notional = price * order.amount;
        let fee = notional * self.fee_rate;
        match order.side {
            TradeSide::Buy => {
                if from_frozen {
                    let reserved = self.buy_reservation(order.price, order.amount);
                    *book.frozen_mut(&order.quote) -= reserved;
                    *book.free_mut(&order.quote) += reserved - notional - fee;
                } else {
                    *book.free_mut(&order.quote) -= notional + fee;
                }
                *book.free_mut(&order.base) += order.amount;
            }
            TradeSide::Sell => {
                if from_frozen {
                    *book.frozen_mut(&order.base) -= order.amount;
                } else {
                    *book.free_mut(&order.base) -= order.amount;
                }
                *book.free_mut(&order.quote) += notional - fee;
            }
        }
        order.filled = order.amount;
        order.fee = fee;
        order.status = OrderStatus::Filled;
    }

    fn buy_reservation(&self, price: Decimal, amount: Decimal) -> Decimal {
        price * amount * (Decimal::ONE + self.fee_rate)
    }

    fn mid(&self, book: &Book, pair: &str) -> Result<Decimal> {
        book.prices
            .get(pair)
            .copied()
            .ok_or_else(|| anyhow!("unrecognized stockType: {pair}"))
    }
}

fn to_decimal(value: f64, what: &str) -> Result<Decimal> {
    Decimal::from_f64(value).with_context(|| format!("invalid {what}: {value}"))
}

fn to_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}

// ---------------------------------------------------------------------------
// Exchange implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl Exchange for PaperExchange {
    fn exchange_type(&self) -> &str {
        EXCHANGE_TYPE
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    fn min_amount(&self, _pair: &str) -> f64 {
        to_f64(self.min_amount)
    }

    async fn get_account(&self) -> Result<Account> {
        self.limiter.record_call();
        let book = self.book();
        let mut account = Account::new();
        for asset in book.free.keys().chain(book.frozen.keys()) {
            let free = book.free.get(asset).copied().unwrap_or_default();
            let frozen = book.frozen.get(asset).copied().unwrap_or_default();
            account.insert(asset.clone(), to_f64(free));
            account.insert(format!("Frozen{asset}"), to_f64(frozen));
        }
        Ok(account)
    }

    async fn trade(&self, side: TradeSide, pair: &str, price: f64, amount: f64) -> Result<String> {
        self.limiter.record_call();
        let (base, quote) = split_pair(pair)?;
        let pair = format!("{base}/{quote}");
        let amount = to_decimal(amount, "amount")?;
        if amount < self.min_amount {
            anyhow::bail!("amount {amount} is below the minimum {}", self.min_amount);
        }

        let mut book = self.book();
        let (bid, ask) = self.touch(self.mid(&book, &pair)?);
        let limit = if price > 0.0 { Some(to_decimal(price, "price")?) } else { None };
        let touch = match side {
            TradeSide::Buy => ask,
            TradeSide::Sell => bid,
        };
        let crosses = match (side, limit) {
            (_, None) => true,
            (TradeSide::Buy, Some(limit)) => limit >= ask,
            (TradeSide::Sell, Some(limit)) => limit <= bid,
        };

        let free_quote = book.free.get(&quote).copied().unwrap_or_default();
        let free_base = book.free.get(&base).copied().unwrap_or_default();
        match side {
            TradeSide::Buy => {
                let needed = if crosses {
                    touch * amount * (Decimal::ONE + self.fee_rate)
                } else {
                    self.buy_reservation(limit.unwrap_or(touch), amount)
                };
                if needed > free_quote {
                    anyhow::bail!("insufficient {quote}: need {needed}, have {free_quote}");
                }
            }
            TradeSide::Sell => {
                if amount > free_base {
                    anyhow::bail!("insufficient {base}: need {amount}, have {free_base}");
                }
            }
        }

        let id = book.next_id;
        book.next_id += 1;
        let mut order = PaperOrder {
            id,
            side,
            pair,
            base,
            quote,
            price: limit.unwrap_or(touch),
            amount,
            filled: Decimal::ZERO,
            fee: Decimal::ZERO,
            status: OrderStatus::Open,
        };

        if crosses {
            self.fill(&mut book, &mut order, touch, false);
        } else {
            match side {
                TradeSide::Buy => {
                    let reserved = self.buy_reservation(order.price, amount);
                    *book.free_mut(&order.quote) -= reserved;
                    *book.frozen_mut(&order.quote) += reserved;
                }
                TradeSide::Sell => {
                    *book.free_mut(&order.base) -= amount;
                    *book.frozen_mut(&order.base) += amount;
                }
            }
        }
        book.orders.push(order);
        Ok(id.to_string())
    }

    async fn get_order(&self, pair: &str, id: &str) -> Result<Order> {
        self.limiter.record_call();
        let pair = pair.to_uppercase();
        self.book()
            .orders
            .iter()
            .find(|o| o.pair == pair && o.id.to_string() == id)
            .map(PaperOrder::to_order)
            .ok_or_else(|| anyhow!("order {id} not found"))
    }

    async fn get_orders(&self, pair: &str) -> Result<Vec<Order>> {
        self.limiter.record_call();
        let pair = pair.to_uppercase();
        Ok(self
            .book()
            .orders
            .iter()
            .filter(|o| o.pair == pair && o.status == OrderStatus::Open)
            .map(PaperOrder::to_order)
            .collect())
    }

    async fn get_trades(&self, pair: &str) -> Result<Vec<Order>> {
        self.limiter.record_call();
        let pair = pair.to_uppercase();
        Ok(self
            .book()
            .orders
            .iter()
            .filter(|o| o.pair == pair && o.status == OrderStatus::Filled)
            .map(PaperOrder::to_order)
            .collect())
    }

    async fn cancel_order(&self, order: &Order) -> Result<bool> {
        self.limiter.record_call();
        let mut book = self.book();
        let position = book
            .orders
            .iter()
            .position(|o| o.id.to_string() == order.id && o.status == OrderStatus::Open)
            .ok_or_else(|| anyhow!("order {} is not open", order.id))?;

        let open = book.orders[position].clone();
        match open.side {
            TradeSide::Buy => {
                let reserved = self.buy_reservation(open.price, open.amount);
                *book.frozen_mut(&open.quote) -= reserved;
                *book.free_mut(&open.quote) += reserved;
            }
            TradeSide::Sell => {
                *book.frozen_mut(&open.base) -= open.amount;
                *book.free_mut(&open.base) += open.amount;
            }
        }
        book.orders[position].status = OrderStatus::Cancelled;
        Ok(true)
    }

    async fn get_ticker(&self, pair: &str, depth: usize) -> Result<Ticker> {
        self.limiter.record_call();
        let pair = pair.to_uppercase();
        let mid = self.mid(&self.book(), &pair)?;
        let levels = depth.max(1);
        let level = |i: usize, sign: Decimal| OrderBook {
            price: to_f64(mid * (Decimal::ONE + sign * self.spread * Decimal::from(i + 1))),
            amount: 1.0,
        };
        let bids = (0..levels).map(|i| level(i, Decimal::NEGATIVE_ONE)).collect();
        let asks = (0..levels).map(|i| level(i, Decimal::ONE)).collect();
        Ticker::from_depth(bids, asks)
    }

    async fn get_records(&self, pair: &str, period: Period, size: usize) -> Result<Vec<Record>> {
        self.limiter.record_call();
        let pair = pair.to_uppercase();
        let close = to_f64(self.mid(&self.book(), &pair)?);
        let step = period.seconds();
        let now = Utc::now().timestamp();
        let last_open = now - now % step;
        Ok((0..size as i64)
            .rev()
            .map(|back| Record {
                time: last_open - back * step,
                open: close,
                high: close,
                low: close,
                close,
                volume: 0.0,
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn exchange() -> PaperExchange {
        PaperExchange::new("paper-main", &PaperConfig::default())
    }

    fn assert_close(actual: f64, expected: f64) {
        assert!((actual - expected).abs() < 1e-9, "{actual} != {expected}");
    }

    #[tokio::test]
    async fn test_initial_account() {
        let account = exchange().get_account().await.unwrap();
        assert_eq!(account["USDT"], 10000.0);
        assert_eq!(account["BTC"], 1.0);
        assert_eq!(account["FrozenUSDT"], 0.0);
    }

    #[tokio::test]
    async fn test_market_buy_fills_at_ask_with_fee() {
        let ex = exchange();
        let id = ex.trade(TradeSide::Buy, "btc/usdt", -1.0, 0.1).await.unwrap();
        let account = ex.get_account().await.unwrap();
        // ask = 30000 * 1.0005 = 30015; cost 3001.5 + fee 3.0015
        assert_close(account["USDT"], 6995.4985);
        assert_close(account["BTC"], 1.1);

        let order = ex.get_order("BTC/USDT", &id).await.unwrap();
        assert_eq!(order.deal_amount, 0.1);
        assert_eq!(order.trade_type, "BUY");
        assert_eq!(ex.get_trades("BTC/USDT").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_resting_buy_freezes_and_cancel_releases() {
        let ex = exchange();
        let id = ex.trade(TradeSide::Buy, "BTC/USDT", 29000.0, 0.1).await.unwrap();
        let account = ex.get_account().await.unwrap();
        assert_close(account["FrozenUSDT"], 2902.9);
        assert_close(account["USDT"], 7097.1);

        let open = ex.get_orders("BTC/USDT").await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, id);

        assert!(ex.cancel_order(&open[0]).await.unwrap());
        let account = ex.get_account().await.unwrap();
        assert_close(account["USDT"], 10000.0);
        assert_close(account["FrozenUSDT"], 0.0);
        assert!(ex.get_orders("BTC/USDT").await.unwrap().is_empty());
        assert!(ex.cancel_order(&open[0]).await.is_err());
    }

    #[tokio::test]
    async fn test_resting_sell_fills_when_price_moves() {
        let ex = exchange();
        ex.trade(TradeSide::Sell, "BTC/USDT", 31000.0, 0.5).await.unwrap();
        assert_close(ex.get_account().await.unwrap()["FrozenBTC"], 0.5);

        ex.set_price("BTC/USDT", dec!(32000));
        let account = ex.get_account().await.unwrap();
        assert_close(account["BTC"], 0.5);
        assert_close(account["FrozenBTC"], 0.0);
        // 15500 notional - 15.5 fee
        assert_close(account["USDT"], 25484.5);
        assert!(ex.get_orders("BTC/USDT").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_trade_rejections() {
        let ex = exchange();
        assert!(ex.trade(TradeSide::Buy, "BTC/USDT", -1.0, 5.0).await.is_err());
        assert!(ex.trade(TradeSide::Sell, "BTC/USDT", -1.0, 2.0).await.is_err());
        assert!(ex.trade(TradeSide::Buy, "BTC/USDT", -1.0, 0.0001).await.is_err());
        let err = ex.trade(TradeSide::Buy, "DOGE/USDT", 1.0, 1.0).await.unwrap_err();
        assert!(err.to_string().contains("unrecognized stockType"));
    }

    #[tokio::test]
    async fn test_ticker_and_records() {
        let ex = exchange();
        let ticker = ex.get_ticker("BTC/USDT", 5).await.unwrap();
        assert_close(ticker.buy, 29985.0);
        assert_close(ticker.sell, 30015.0);
        assert_close(ticker.mid, 30000.0);
        assert_eq!(ticker.bids.len(), 5);
        assert!(ticker.bids[1].price < ticker.bids[0].price);

        let records = ex.get_records("BTC/USDT", Period::M5, 3).await.unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[2].time - records[1].time, 300);
        assert_eq!(records[0].close, 30000.0);
    }

    #[tokio::test]
    async fn test_calls_are_counted() {
        let ex = exchange();
        ex.get_account().await.unwrap();
        ex.get_ticker("BTC/USDT", 1).await.unwrap();
        assert_eq!(ex.limiter().calls(), 2);
    }
}
