//! Persistence layer.
//!
//! The supervisor reads traders, their owners, algorithms and exchange
//! bindings through the [`Store`] trait. Two backends:
//! - [`MemoryStore`]: maps behind a tokio `RwLock`, filled from a seed file
//! - [`SqliteStore`]: `sqlx` SQLite pool that also persists trader logs
//!
//! Both import the same JSON [`Seed`] so a fresh install can be populated
//! without a separate admin tool.

pub mod memory;
pub mod sqlite;

use anyhow::{Context, Result};
use async_trait::async_trait;
use secrecy::SecretString;
use serde::Deserialize;

use crate::exchanges::ExchangeOption;
use crate::types::{Algorithm, Trader, User};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Read access the runtime needs from storage.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Store: Send + Sync {
    async fn load_trader(&self, id: i64) -> Result<Trader>;

    async fn load_user(&self, id: i64) -> Result<User>;

    async fn load_algorithm(&self, id: i64) -> Result<Algorithm>;

    /// Exchange bindings of a trader, in binding order.
    async fn exchange_bindings(&self, trader_id: i64) -> Result<Vec<ExchangeOption>>;
}

// ---------------------------------------------------------------------------
// Seed data
// ---------------------------------------------------------------------------

/// Stored exchange binding. Converted into an [`ExchangeOption`] (with the
/// secret wrapped) whenever the runtime asks for it.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ExchangeRecord {
    pub trader_id: i64,
    #[serde(rename = "type")]
    pub exchange_type: String,
    pub name: String,
    #[serde(default)]
    pub access_key: String,
    #[serde(default)]
    pub secret_key: String,
}

impl ExchangeRecord {
    pub fn to_option(&self) -> ExchangeOption {
        ExchangeOption {
            trader_id: self.trader_id,
            exchange_type: self.exchange_type.clone(),
            name: self.name.clone(),
            access_key: self.access_key.clone(),
            secret_key: SecretString::new(self.secret_key.clone()),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Seed {
    #[serde(default)]
    pub users: Vec<User>,
    #[serde(default)]
    pub algorithms: Vec<Algorithm>,
    #[serde(default)]
    pub traders: Vec<Trader>,
    #[serde(default)]
    pub exchanges: Vec<ExchangeRecord>,
}

impl Seed {
    /// Read a seed file. Algorithms may give `script_path` instead of an
    /// inline `script`; relative paths resolve against the seed's directory.
    pub fn load(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read seed file: {path}"))?;
        let raw: RawSeed = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse seed file: {path}"))?;

        let base = std::path::Path::new(path)
            .parent()
            .map(std::path::Path::to_path_buf)
            .unwrap_or_default();

        let mut algorithms = Vec::with_capacity(raw.algorithms.len());
        for algo in raw.algorithms {
            let script = match (algo.script, algo.script_path) {
                (Some(script), _) => script,
                (None, Some(rel)) => {
                    let full = base.join(&rel);
                    std::fs::read_to_string(&full)
                        .with_context(|| format!("Failed to read script {}", full.display()))?
                }
                (None, None) => anyhow::bail!("algorithm {} has neither script nor script_path", algo.id),
            };
            algorithms.push(Algorithm {
                id: algo.id,
                user_id: algo.user_id,
                name: algo.name,
                script,
            });
        }

        Ok(Self {
            users: raw.users,
            algorithms,
            traders: raw.traders,
            exchanges: raw.exchanges,
        })
    }
}

#[derive(Deserialize)]
struct RawSeed {
    #[serde(default)]
    users: Vec<User>,
    #[serde(default)]
    algorithms: Vec<RawAlgorithm>,
    #[serde(default)]
    traders: Vec<Trader>,
    #[serde(default)]
    exchanges: Vec<ExchangeRecord>,
}

#[derive(Deserialize)]
struct RawAlgorithm {
    id: i64,
    user_id: i64,
    name: String,
    #[serde(default)]
    script: Option<String>,
    #[serde(default)]
    script_path: Option<String>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    fn temp_dir() -> std::path::PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!("scriptbot_seed_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_seed_load_with_script_path() {
        let dir = temp_dir();
        std::fs::write(dir.join("grid.js"), "function main() { Log('hi') }").unwrap();
        std::fs::write(
            dir.join("seed.json"),
            r#"{
                "users": [{"id": 1, "username": "demo"}],
                "algorithms": [{"id": 2, "user_id": 1, "name": "grid", "script_path": "grid.js"}],
                "traders": [{"id": 3, "user_id": 1, "name": "t", "algorithm_id": 2, "status": 0, "last_run_at": null}],
                "exchanges": [{"trader_id": 3, "type": "paper", "name": "main"}]
            }"#,
        )
        .unwrap();

        let seed = Seed::load(dir.join("seed.json").to_str().unwrap()).unwrap();
        assert_eq!(seed.algorithms[0].script, "function main() { Log('hi') }");
        assert_eq!(seed.traders[0].algorithm_id, Some(2));
        assert_eq!(seed.exchanges[0].exchange_type, "paper");
        assert_eq!(seed.exchanges[0].access_key, "");

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_seed_algorithm_needs_source() {
        let dir = temp_dir();
        let path = dir.join("seed.json");
        std::fs::write(&path, r#"{"algorithms": [{"id": 9, "user_id": 1, "name": "x"}]}"#).unwrap();
        let err = Seed::load(path.to_str().unwrap()).unwrap_err();
        assert!(err.to_string().contains("algorithm 9"));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_record_to_option_wraps_secret() {
        let record = ExchangeRecord {
            trader_id: 1,
            exchange_type: "binance".into(),
            name: "spot".into(),
            access_key: "ak".into(),
            secret_key: "sk".into(),
        };
        let opt = record.to_option();
        assert_eq!(opt.secret_key.expose_secret(), "sk");
        assert_eq!(opt.access_key, "ak");
    }
}
