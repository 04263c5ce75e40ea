//! In-memory store, the default backend when no database is configured.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::{ExchangeRecord, Seed, Store};
use crate::exchanges::ExchangeOption;
use crate::types::{Algorithm, Trader, User};

#[derive(Default)]
struct Tables {
    users: HashMap<i64, User>,
    algorithms: HashMap<i64, Algorithm>,
    traders: HashMap<i64, Trader>,
    exchanges: Vec<ExchangeRecord>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_seed(seed: Seed) -> Self {
        let mut store = Self::new();
        {
            let tables = store.tables.get_mut();
            tables.users.extend(seed.users.into_iter().map(|u| (u.id, u)));
            tables.algorithms.extend(seed.algorithms.into_iter().map(|a| (a.id, a)));
            tables.traders.extend(seed.traders.into_iter().map(|t| (t.id, t)));
            tables.exchanges = seed.exchanges;
        }
        store
    }

    pub async fn insert_user(&self, user: User) {
        self.tables.write().await.users.insert(user.id, user);
    }

    pub async fn insert_algorithm(&self, algorithm: Algorithm) {
        self.tables.write().await.algorithms.insert(algorithm.id, algorithm);
    }

    pub async fn insert_trader(&self, trader: Trader) {
        self.tables.write().await.traders.insert(trader.id, trader);
    }

    pub async fn insert_exchange(&self, record: ExchangeRecord) {
        self.tables.write().await.exchanges.push(record);
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn load_trader(&self, id: i64) -> Result<Trader> {
        self.tables
            .read()
            .await
            .traders
            .get(&id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no trader with id {id}"))
    }

    async fn load_user(&self, id: i64) -> Result<User> {
        self.tables
            .read()
            .await
            .users
            .get(&id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no user with id {id}"))
    }

    async fn load_algorithm(&self, id: i64) -> Result<Algorithm> {
        self.tables
            .read()
            .await
            .algorithms
            .get(&id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no algorithm with id {id}"))
    }

    async fn exchange_bindings(&self, trader_id: i64) -> Result<Vec<ExchangeOption>> {
        Ok(self
            .tables
            .read()
            .await
            .exchanges
            .iter()
            .filter(|r| r.trader_id == trader_id)
            .map(ExchangeRecord::to_option)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(trader_id: i64, name: &str) -> ExchangeRecord {
        ExchangeRecord {
            trader_id,
            exchange_type: "paper".into(),
            name: name.into(),
            access_key: String::new(),
            secret_key: String::new(),
        }
    }

    #[tokio::test]
    async fn test_load_records() {
        let store = MemoryStore::from_seed(Seed {
            users: vec![User { id: 1, username: "demo".into() }],
            traders: vec![Trader::new(5, 1, "grid", None)],
            ..Seed::default()
        });

        assert_eq!(store.load_user(1).await.unwrap().username, "demo");
        assert_eq!(store.load_trader(5).await.unwrap().name, "grid");
        assert!(store.load_trader(6).await.is_err());
        assert!(store.load_algorithm(1).await.is_err());

        store
            .insert_algorithm(Algorithm {
                id: 1,
                user_id: 1,
                name: "a".into(),
                script: "function main() {}".into(),
            })
            .await;
        assert_eq!(store.load_algorithm(1).await.unwrap().name, "a");
    }

    #[tokio::test]
    async fn test_bindings_keep_order_and_filter_by_trader() {
        let store = MemoryStore::new();
        store.insert_exchange(record(1, "first")).await;
        store.insert_exchange(record(2, "other")).await;
        store.insert_exchange(record(1, "second")).await;

        let names: Vec<String> = store
            .exchange_bindings(1)
            .await
            .unwrap()
            .into_iter()
            .map(|o| o.name)
            .collect();
        assert_eq!(names, vec!["first", "second"]);
        assert!(store.exchange_bindings(3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_from_seed_fills_every_table() {
        let store = MemoryStore::from_seed(Seed {
            algorithms: vec![Algorithm {
                id: 4,
                user_id: 1,
                name: "grid".into(),
                script: "function main() {}".into(),
            }],
            exchanges: vec![record(9, "seeded")],
            ..Seed::default()
        });

        assert_eq!(store.load_algorithm(4).await.unwrap().name, "grid");
        let bindings = store.exchange_bindings(9).await.unwrap();
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].name, "seeded");
    }
}
