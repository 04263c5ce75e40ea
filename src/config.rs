//! Configuration loading from TOML.
//!
//! Reads `config.toml` (or the file named by `SCRIPTBOT_CONFIG`) into
//! strongly-typed structs. Exchange credentials live in storage, never in
//! this file.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;

/// Environment variable overriding the config file path.
pub const CONFIG_ENV: &str = "SCRIPTBOT_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub paper: PaperConfig,
    #[serde(default)]
    pub binance: BinanceConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    /// Trader ids started at boot.
    #[serde(default)]
    pub autostart: Vec<i64>,
    /// How long shutdown waits for running scripts after stopping them.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    /// `tracing` filter used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            autostart: Vec::new(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            log_filter: default_log_filter(),
        }
    }
}

fn default_shutdown_grace_secs() -> u64 {
    5
}

fn default_log_filter() -> String {
    "scriptbot=info".to_string()
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    /// e.g. `sqlite://scriptbot.db`; required for the sqlite backend.
    #[serde(default)]
    pub database_url: Option<String>,
    /// JSON file of users, traders, algorithms and exchange bindings
    /// imported at startup.
    #[serde(default)]
    pub seed_path: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ControlConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9876,
        }
    }
}

/// In-memory venue used for local runs.
#[derive(Debug, Deserialize, Clone)]
pub struct PaperConfig {
    /// Starting free balances by asset.
    pub balances: HashMap<String, Decimal>,
    /// Starting mid prices by pair (`BTC/USDT`).
    pub prices: HashMap<String, Decimal>,
    /// Taker fee as a fraction of notional, charged in the quote asset.
    pub fee_rate: Decimal,
    pub min_amount: Decimal,
    /// Half-spread of the synthetic book as a fraction of mid.
    pub spread: Decimal,
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            balances: HashMap::from([("USDT".to_string(), dec!(10000)), ("BTC".to_string(), dec!(1))]),
            prices: HashMap::from([("BTC/USDT".to_string(), dec!(30000))]),
            fee_rate: dec!(0.001),
            min_amount: dec!(0.001),
            spread: dec!(0.0005),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BinanceConfig {
    pub base_url: String,
    pub recv_window_ms: u64,
    pub timeout_secs: u64,
    pub min_amount: f64,
}

impl Default for BinanceConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.binance.com".to_string(),
            recv_window_ms: 5000,
            timeout_secs: 30,
            min_amount: 0.001,
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        Self::parse(&contents).with_context(|| format!("Failed to parse config file: {path}"))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents)?;
        if config.storage.backend == StorageBackend::Sqlite && config.storage.database_url.is_none() {
            anyhow::bail!("storage.database_url is required for the sqlite backend");
        }
        Ok(config)
    }

    /// Path from `SCRIPTBOT_CONFIG`, falling back to `config.toml`.
    pub fn path_from_env() -> String {
        std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string())
    }
}
