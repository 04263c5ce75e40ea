//! Mock exchange for integration testing.
//!
//! A deterministic `Exchange` with a fixed book, in-memory balances and
//! orders, and a switch that makes every operation fail.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use scriptbot::exchanges::{Exchange, RateLimiter};
use scriptbot::types::{Account, Order, OrderBook, Period, Record, Ticker, TradeSide};

pub const MOCK_TYPE: &str = "mock";

pub struct MockExchange {
    name: String,
    limiter: RateLimiter,
    balances: Mutex<Account>,
    orders: Mutex<Vec<Order>>,
    /// If set, all operations will return this error.
    force_error: Mutex<Option<String>>,
    calls: AtomicUsize,
}

impl MockExchange {
    pub fn new(name: &str) -> Self {
        let mut balances = Account::new();
        balances.insert("USDT".into(), 1000.0);
        balances.insert("BTC".into(), 2.0);
        Self {
            name: name.to_string(),
            limiter: RateLimiter::default(),
            balances: Mutex::new(balances),
            orders: Mutex::new(Vec::new()),
            force_error: Mutex::new(None),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn fail_with(&self, message: &str) {
        *self.force_error.lock().unwrap() = Some(message.to_string());
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn orders(&self) -> Vec<Order> {
        self.orders.lock().unwrap().clone()
    }

    fn enter(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.limiter.record_call();
        match self.force_error.lock().unwrap().as_ref() {
            Some(message) => Err(anyhow!("{message}")),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Exchange for MockExchange {
    fn exchange_type(&self) -> &str {
        MOCK_TYPE
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    fn min_amount(&self, _pair: &str) -> f64 {
        0.01
    }

    async fn get_account(&self) -> Result<Account> {
        self.enter()?;
        Ok(self.balances.lock().unwrap().clone())
    }

    async fn trade(&self, side: TradeSide, pair: &str, price: f64, amount: f64) -> Result<String> {
        self.enter()?;
        let mut orders = self.orders.lock().unwrap();
        let id = format!("{}", orders.len() + 1);
        orders.push(Order {
            id: id.clone(),
            price,
            amount,
            deal_amount: 0.0,
            fee: 0.0,
            trade_type: side.as_str().to_string(),
            stock_type: pair.to_string(),
        });
        Ok(id)
    }

    async fn get_order(&self, _pair: &str, id: &str) -> Result<Order> {
        self.enter()?;
        self.orders
            .lock()
            .unwrap()
            .iter()
            .find(|o| o.id == id)
            .cloned()
            .ok_or_else(|| anyhow!("order {id} not found"))
    }

    async fn get_orders(&self, pair: &str) -> Result<Vec<Order>> {
        self.enter()?;
        Ok(self
            .orders
            .lock()
            .unwrap()
            .iter()
            .filter(|o| o.stock_type == pair)
            .cloned()
            .collect())
    }

    async fn get_trades(&self, _pair: &str) -> Result<Vec<Order>> {
        self.enter()?;
        Ok(Vec::new())
    }

    async fn cancel_order(&self, order: &Order) -> Result<bool> {
        self.enter()?;
        let mut orders = self.orders.lock().unwrap();
        let before = orders.len();
        orders.retain(|o| o.id != order.id);
        Ok(orders.len() < before)
    }

    async fn get_ticker(&self, _pair: &str, _depth: usize) -> Result<Ticker> {
        self.enter()?;
        Ticker::from_depth(
            vec![OrderBook { price: 99.0, amount: 1.0 }],
            vec![OrderBook { price: 101.0, amount: 1.0 }],
        )
    }

    async fn get_records(&self, _pair: &str, period: Period, size: usize) -> Result<Vec<Record>> {
        self.enter()?;
        Ok((0..size as i64)
            .map(|i| Record {
                time: i * period.seconds(),
                open: 100.0,
                high: 101.0,
                low: 99.0,
                close: 100.0,
                volume: 1.0,
            })
            .collect())
    }
}
