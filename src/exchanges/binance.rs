//! Binance spot integration.
//!
//! API docs: https://binance-docs.github.io/apidocs/spot/en/
//! Auth: `X-MBX-APIKEY` header plus an HMAC-SHA256 `signature` over the
//! query string for account and order endpoints.
//! Pairs are written `BTC/USDT` by scripts and `BTCUSDT` on the wire.

use anyhow::{Context, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::{Client, Method};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use sha2::Sha256;
use std::time::Duration;
use tracing::debug;

use super::{split_pair, Exchange, ExchangeOption, RateLimiter};
use crate::config::BinanceConfig;
use crate::types::{Account, Order, OrderBook, Period, Record, Ticker, TradeSide};

pub const EXCHANGE_TYPE: &str = "binance";

type HmacSha256 = Hmac<Sha256>;

// ---------------------------------------------------------------------------
// API response types (Binance JSON → Rust)
// ---------------------------------------------------------------------------

/// Binance sends decimals as JSON strings.
fn de_f64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Num {
        Str(String),
        Num(f64),
    }
    match Num::deserialize(deserializer)? {
        Num::Num(n) => Ok(n),
        Num::Str(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

#[derive(Debug, Deserialize)]
struct ApiError {
    code: i64,
    msg: String,
}

#[derive(Debug, Deserialize)]
struct AccountResponse {
    balances: Vec<Balance>,
}

#[derive(Debug, Deserialize)]
struct Balance {
    asset: String,
    #[serde(deserialize_with = "de_f64")]
    free: f64,
    #[serde(deserialize_with = "de_f64")]
    locked: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NewOrderResponse {
    order_id: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResponse {
    order_id: u64,
    #[serde(deserialize_with = "de_f64")]
    price: f64,
    #[serde(deserialize_with = "de_f64")]
    orig_qty: f64,
    #[serde(deserialize_with = "de_f64")]
    executed_qty: f64,
    side: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TradeResponse {
    order_id: u64,
    #[serde(deserialize_with = "de_f64")]
    price: f64,
    #[serde(deserialize_with = "de_f64")]
    qty: f64,
    #[serde(deserialize_with = "de_f64")]
    commission: f64,
    is_buyer: bool,
}

#[derive(Debug, Deserialize)]
struct DepthResponse {
    bids: Vec<(String, String)>,
    asks: Vec<(String, String)>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CancelResponse {
    status: String,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct BinanceExchange {
    http: Client,
    name: String,
    base_url: String,
    access_key: String,
    secret_key: SecretString,
    recv_window_ms: u64,
    min_amount: f64,
    limiter: RateLimiter,
}

impl BinanceExchange {
    pub fn new(opt: ExchangeOption, cfg: &BinanceConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .user_agent(concat!("scriptbot/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client for Binance")?;

        Ok(Self {
            http,
            name: opt.name,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            access_key: opt.access_key,
            secret_key: opt.secret_key,
            recv_window_ms: cfg.recv_window_ms,
            min_amount: cfg.min_amount,
            limiter: RateLimiter::default(),
        })
    }

    /// `BTC/USDT` → `BTCUSDT`.
    fn symbol(pair: &str) -> Result<String> {
        let (base, quote) = split_pair(pair)?;
        Ok(format!("{base}{quote}"))
    }

    fn interval(period: Period) -> &'static str {
        match period {
            Period::M => "1m",
            Period::M5 => "5m",
            Period::M15 => "15m",
            Period::M30 => "30m",
            Period::H => "1h",
            Period::D => "1d",
            Period::W => "1w",
        }
    }

    /// Hex HMAC-SHA256 of `message` with the secret key.
    fn sign(&self, message: &str) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(self.secret_key.expose_secret().as_bytes())
            .context("invalid HMAC key")?;
        mac.update(message.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn query(params: &[(&str, String)]) -> String {
        params
            .iter()
            .map(|(k, v)| format!("{k}={}", urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&")
    }

    async fn public<T: DeserializeOwned>(&self, path: &str, params: &[(&str, String)]) -> Result<T> {
        let url = format!("{}{path}?{}", self.base_url, Self::query(params));
        self.send(self.http.get(&url)).await
    }

    async fn signed<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T> {
        let mut params = params.to_vec();
        params.push(("recvWindow", self.recv_window_ms.to_string()));
        params.push(("timestamp", chrono::Utc::now().timestamp_millis().to_string()));
        let query = Self::query(&params);
        let signature = self.sign(&query)?;
        let url = format!("{}{path}?{query}&signature={signature}", self.base_url);
        let request = self
            .http
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.access_key);
        self.send(request).await
    }

    async fn send<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> Result<T> {
        self.limiter.record_call();
        let resp = request.send().await.context("Binance API request failed")?;
        let status = resp.status();
        let body = resp.text().await.context("Failed to read Binance response")?;
        debug!(status = %status, len = body.len(), "Binance response");

        if !status.is_success() {
            if let Ok(err) = serde_json::from_str::<ApiError>(&body) {
                anyhow::bail!("Binance API error {}: {}", err.code, err.msg);
            }
            anyhow::bail!("Binance API error {status}: {body}");
        }
        serde_json::from_str(&body).context("Failed to parse Binance response")
    }

    fn to_order(resp: OrderResponse, pair: &str) -> Order {
        Order {
            id: resp.order_id.to_string(),
            price: resp.price,
            amount: resp.orig_qty,
            deal_amount: resp.executed_qty,
            fee: 0.0,
            trade_type: resp.side,
            stock_type: pair.to_uppercase(),
        }
    }
}

fn parse_levels(levels: Vec<(String, String)>) -> Result<Vec<OrderBook>> {
    levels
        .into_iter()
        .map(|(price, amount)| {
            Ok(OrderBook {
                price: price.parse().context("bad depth price")?,
                amount: amount.parse().context("bad depth amount")?,
            })
        })
        .collect()
}

/// Kline rows are heterogeneous arrays:
/// `[openTime, "open", "high", "low", "close", "volume", ...]`.
fn parse_kline(row: &[serde_json::Value]) -> Result<Record> {
    let num = |i: usize| -> Result<f64> {
        row.get(i)
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
            .with_context(|| format!("bad kline field {i}"))
    };
    let open_ms = row
        .first()
        .and_then(|v| v.as_i64())
        .context("bad kline open time")?;
    Ok(Record {
        time: open_ms / 1000,
        open: num(1)?,
        high: num(2)?,
        low: num(3)?,
        close: num(4)?,
        volume: num(5)?,
    })
}

// ---------------------------------------------------------------------------
// Exchange implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl Exchange for BinanceExchange {
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
        self.min_amount
    }

    async fn get_account(&self) -> Result<Account> {
        let resp: AccountResponse = self.signed(Method::GET, "/api/v3/account", &[]).await?;
        let mut account = Account::new();
        for balance in resp.balances {
            let asset = balance.asset.to_uppercase();
            account.insert(format!("Frozen{asset}"), balance.locked);
            account.insert(asset, balance.free);
        }
        Ok(account)
    }

    async fn trade(&self, side: TradeSide, pair: &str, price: f64, amount: f64) -> Result<String> {
        let mut params = vec![
            ("symbol", Self::symbol(pair)?),
            ("side", side.as_str().to_string()),
            ("quantity", amount.to_string()),
        ];
        if price > 0.0 {
            params.push(("type", "LIMIT".to_string()));
            params.push(("timeInForce", "GTC".to_string()));
            params.push(("price", price.to_string()));
        } else {
            params.push(("type", "MARKET".to_string()));
        }
        let resp: NewOrderResponse = self.signed(Method::POST, "/api/v3/order", &params).await?;
        Ok(resp.order_id.to_string())
    }

    async fn get_order(&self, pair: &str, id: &str) -> Result<Order> {
        let params = [("symbol", Self::symbol(pair)?), ("orderId", id.to_string())];
        let resp: OrderResponse = self.signed(Method::GET, "/api/v3/order", &params).await?;
        Ok(Self::to_order(resp, pair))
    }

    async fn get_orders(&self, pair: &str) -> Result<Vec<Order>> {
        let params = [("symbol", Self::symbol(pair)?)];
        let resp: Vec<OrderResponse> = self.signed(Method::GET, "/api/v3/openOrders", &params).await?;
        Ok(resp.into_iter().map(|o| Self::to_order(o, pair)).collect())
    }

    async fn get_trades(&self, pair: &str) -> Result<Vec<Order>> {
        let params = [("symbol", Self::symbol(pair)?)];
        let resp: Vec<TradeResponse> = self.signed(Method::GET, "/api/v3/myTrades", &params).await?;
        Ok(resp
            .into_iter()
            .map(|t| Order {
                id: t.order_id.to_string(),
                price: t.price,
                amount: t.qty,
                deal_amount: t.qty,
                fee: t.commission,
                trade_type: if t.is_buyer { TradeSide::Buy } else { TradeSide::Sell }
                    .as_str()
                    .to_string(),
                stock_type: pair.to_uppercase(),
            })
            .collect())
    }

    async fn cancel_order(&self, order: &Order) -> Result<bool> {
        let params = [("symbol", Self::symbol(&order.stock_type)?), ("orderId", order.id.clone())];
        let resp: CancelResponse = self.signed(Method::DELETE, "/api/v3/order", &params).await?;
        Ok(resp.status == "CANCELED")
    }

    async fn get_ticker(&self, pair: &str, depth: usize) -> Result<Ticker> {
        let params = [("symbol", Self::symbol(pair)?), ("limit", depth.clamp(5, 100).to_string())];
        let resp: DepthResponse = self.public("/api/v3/depth", &params).await?;
        Ticker::from_depth(parse_levels(resp.bids)?, parse_levels(resp.asks)?)
    }

    async fn get_records(&self, pair: &str, period: Period, size: usize) -> Result<Vec<Record>> {
        let params = [
            ("symbol", Self::symbol(pair)?),
            ("interval", Self::interval(period).to_string()),
            ("limit", size.clamp(1, 1000).to_string()),
        ];
        let rows: Vec<Vec<serde_json::Value>> = self.public("/api/v3/klines", &params).await?;
        rows.iter().map(|row| parse_kline(row)).collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn client(secret: &str) -> BinanceExchange {
        let opt = ExchangeOption {
            trader_id: 1,
            exchange_type: EXCHANGE_TYPE.to_string(),
            name: "spot".to_string(),
            access_key: "key".to_string(),
            secret_key: SecretString::new(secret.to_string()),
        };
        BinanceExchange::new(opt, &BinanceConfig::default()).unwrap()
    }

    #[test]
    fn test_sign_known_vector() {
        // Example from the Binance signed-endpoint documentation.
        let ex = client("NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j");
        let query = "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1&recvWindow=5000&timestamp=1499827319559";
        assert_eq!(
            ex.sign(query).unwrap(),
            "c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71"
        );
    }

    #[test]
    fn test_symbol_and_interval() {
        assert_eq!(BinanceExchange::symbol("eth/usdt").unwrap(), "ETHUSDT");
        assert!(BinanceExchange::symbol("ETHUSDT").is_err());
        assert_eq!(BinanceExchange::interval(Period::M15), "15m");
        assert_eq!(BinanceExchange::interval(Period::W), "1w");
    }

    #[test]
    fn test_parse_account_balances() {
        let body = r#"{"balances":[{"asset":"btc","free":"0.5","locked":"0.1"}]}"#;
        let resp: AccountResponse = serde_json::from_str(body).unwrap();
        assert_eq!(resp.balances[0].free, 0.5);
        assert_eq!(resp.balances[0].locked, 0.1);
        assert_eq!(resp.balances[0].asset, "btc");
    }

    #[test]
    fn test_parse_order() {
        let body = r#"{"symbol":"BTCUSDT","orderId":28,"price":"30000.00","origQty":"0.01",
            "executedQty":"0.005","status":"PARTIALLY_FILLED","side":"BUY"}"#;
        let resp: OrderResponse = serde_json::from_str(body).unwrap();
        let order = BinanceExchange::to_order(resp, "btc/usdt");
        assert_eq!(order.id, "28");
        assert_eq!(order.deal_amount, 0.005);
        assert_eq!(order.stock_type, "BTC/USDT");
        assert_eq!(order.trade_type, "BUY");
    }

    #[test]
    fn test_parse_depth_and_kline() {
        let depth: DepthResponse =
            serde_json::from_str(r#"{"lastUpdateId":1,"bids":[["99.5","2"]],"asks":[["100.5","1"]]}"#)
                .unwrap();
        let ticker = Ticker::from_depth(parse_levels(depth.bids).unwrap(), parse_levels(depth.asks).unwrap())
            .unwrap();
        assert_eq!(ticker.mid, 100.0);

        let row: Vec<serde_json::Value> = serde_json::from_str(
            r#"[1499040000000,"0.01634790","0.80000000","0.01575800","0.01577100","148976.11427815",1499644799999]"#,
        )
        .unwrap();
        let record = parse_kline(&row).unwrap();
        assert_eq!(record.time, 1_499_040_000);
        assert_eq!(record.high, 0.8);
    }

    #[test]
    fn test_api_error_shape() {
        let err: ApiError = serde_json::from_str(r#"{"code":-2010,"msg":"insufficient balance"}"#).unwrap();
        assert_eq!(err.code, -2010);
        assert_eq!(err.msg, "insufficient balance");
    }
}
