//! SQLite backend (`sqlx`).
//!
//! Tables are created on connect. Timestamps are stored as RFC 3339 text.
//! The store doubles as the trader [`LogSink`]: entries are inserted on a
//! background task so script threads never wait on the database.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::str::FromStr;
use tokio::runtime::Handle;
use tracing::{info, warn};

use super::{ExchangeRecord, Seed, Store};
use crate::exchanges::ExchangeOption;
use crate::logger::{LogEntry, LogKind, LogSink};
use crate::types::{Algorithm, Trader, User};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY,
        username TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS algorithms (
        id INTEGER PRIMARY KEY,
        user_id INTEGER NOT NULL,
        name TEXT NOT NULL,
        script TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS traders (
        id INTEGER PRIMARY KEY,
        user_id INTEGER NOT NULL,
        name TEXT NOT NULL,
        algorithm_id INTEGER,
        status INTEGER NOT NULL DEFAULT 0,
        last_run_at TEXT
    )",
    "CREATE TABLE IF NOT EXISTS exchanges (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        trader_id INTEGER NOT NULL,
        type TEXT NOT NULL,
        name TEXT NOT NULL,
        access_key TEXT NOT NULL DEFAULT '',
        secret_key TEXT NOT NULL DEFAULT ''
    )",
    "CREATE TABLE IF NOT EXISTS logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        trader_id INTEGER NOT NULL,
        exchange_type TEXT NOT NULL,
        kind TEXT NOT NULL,
        pair TEXT NOT NULL,
        price REAL NOT NULL,
        amount REAL NOT NULL,
        message TEXT NOT NULL,
        time TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_logs_trader ON logs (trader_id, id)",
];

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    handle: Handle,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `url` and ensure the schema.
    /// Must be called from within a tokio runtime.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .with_context(|| format!("Invalid database url: {url}"))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to open database: {url}"))?;

        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&pool)
                .await
                .context("Failed to create schema")?;
        }

        info!(url, "SQLite store ready");
        Ok(Self {
            pool,
            handle: Handle::current(),
        })
    }

    /// Upsert every record of `seed`. A trader's bindings are replaced
    /// wholesale when the seed lists any for it.
    pub async fn import(&self, seed: &Seed) -> Result<()> {
        let mut tx = self.pool.begin().await.context("Failed to start seed import")?;

        for user in &seed.users {
            sqlx::query("INSERT OR REPLACE INTO users (id, username) VALUES (?, ?)")
                .bind(user.id)
                .bind(&user.username)
                .execute(&mut *tx)
                .await?;
        }
        for algo in &seed.algorithms {
            sqlx::query("INSERT OR REPLACE INTO algorithms (id, user_id, name, script) VALUES (?, ?, ?, ?)")
                .bind(algo.id)
                .bind(algo.user_id)
                .bind(&algo.name)
                .bind(&algo.script)
                .execute(&mut *tx)
                .await?;
        }
        for trader in &seed.traders {
            sqlx::query(
                "INSERT OR REPLACE INTO traders (id, user_id, name, algorithm_id, status, last_run_at)
                 VALUES (?, ?, ?, ?, 0, ?)",
            )
            .bind(trader.id)
            .bind(trader.user_id)
            .bind(&trader.name)
            .bind(trader.algorithm_id)
            .bind(trader.last_run_at.map(|t| t.to_rfc3339()))
            .execute(&mut *tx)
            .await?;
        }

        let mut replaced: Vec<i64> = seed.exchanges.iter().map(|e| e.trader_id).collect();
        replaced.sort_unstable();
        replaced.dedup();
        for trader_id in replaced {
            sqlx::query("DELETE FROM exchanges WHERE trader_id = ?")
                .bind(trader_id)
                .execute(&mut *tx)
                .await?;
        }
        for record in &seed.exchanges {
            sqlx::query(
                "INSERT INTO exchanges (trader_id, type, name, access_key, secret_key) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(record.trader_id)
            .bind(&record.exchange_type)
            .bind(&record.name)
            .bind(&record.access_key)
            .bind(&record.secret_key)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await.context("Failed to commit seed import")?;
        info!(
            users = seed.users.len(),
            algorithms = seed.algorithms.len(),
            traders = seed.traders.len(),
            exchanges = seed.exchanges.len(),
            "Seed imported"
        );
        Ok(())
    }

    pub async fn insert_log(&self, entry: &LogEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO logs (trader_id, exchange_type, kind, pair, price, amount, message, time)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(entry.trader_id)
        .bind(&entry.exchange_type)
        .bind(entry.kind.as_str())
        .bind(&entry.pair)
        .bind(entry.price)
        .bind(entry.amount)
        .bind(&entry.message)
        .bind(entry.time.to_rfc3339())
        .execute(&self.pool)
        .await
        .context("Failed to insert log entry")?;
        Ok(())
    }

    /// Newest `limit` log entries of a trader, oldest first.
    pub async fn recent_logs(&self, trader_id: i64, limit: i64) -> Result<Vec<LogEntry>> {
        let rows = sqlx::query(
            "SELECT trader_id, exchange_type, kind, pair, price, amount, message, time
             FROM logs WHERE trader_id = ? ORDER BY id DESC LIMIT ?",
        )
        .bind(trader_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to query logs")?;

        let mut entries = rows.iter().map(log_from_row).collect::<Result<Vec<_>>>()?;
        entries.reverse();
        Ok(entries)
    }
}

fn parse_time(text: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(text)
        .with_context(|| format!("bad timestamp: {text}"))?
        .with_timezone(&Utc))
}

fn log_from_row(row: &SqliteRow) -> Result<LogEntry> {
    let kind: String = row.try_get("kind")?;
    let time: String = row.try_get("time")?;
    Ok(LogEntry {
        trader_id: row.try_get("trader_id")?,
        exchange_type: row.try_get("exchange_type")?,
        kind: LogKind::from_str(&kind)?,
        pair: row.try_get("pair")?,
        price: row.try_get("price")?,
        amount: row.try_get("amount")?,
        message: row.try_get("message")?,
        time: parse_time(&time)?,
    })
}

#[async_trait]
impl Store for SqliteStore {
    async fn load_trader(&self, id: i64) -> Result<Trader> {
        let row = sqlx::query(
            "SELECT id, user_id, name, algorithm_id, status, last_run_at FROM traders WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .with_context(|| format!("no trader with id {id}"))?;

        let last_run_at: Option<String> = row.try_get("last_run_at")?;
        Ok(Trader {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            name: row.try_get("name")?,
            algorithm_id: row.try_get("algorithm_id")?,
            status: row.try_get("status")?,
            last_run_at: last_run_at.as_deref().map(parse_time).transpose()?,
        })
    }

    async fn load_user(&self, id: i64) -> Result<User> {
        let row = sqlx::query("SELECT id, username FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .with_context(|| format!("no user with id {id}"))?;
        Ok(User {
            id: row.try_get("id")?,
            username: row.try_get("username")?,
        })
    }

    async fn load_algorithm(&self, id: i64) -> Result<Algorithm> {
        let row = sqlx::query("SELECT id, user_id, name, script FROM algorithms WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .with_context(|| format!("no algorithm with id {id}"))?;
        Ok(Algorithm {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            name: row.try_get("name")?,
            script: row.try_get("script")?,
        })
    }

    async fn exchange_bindings(&self, trader_id: i64) -> Result<Vec<ExchangeOption>> {
        let rows = sqlx::query(
            "SELECT trader_id, type, name, access_key, secret_key FROM exchanges
             WHERE trader_id = ? ORDER BY id",
        )
        .bind(trader_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<ExchangeOption> {
                let record = ExchangeRecord {
                    trader_id: row.try_get("trader_id")?,
                    exchange_type: row.try_get("type")?,
                    name: row.try_get("name")?,
                    access_key: row.try_get("access_key")?,
                    secret_key: row.try_get("secret_key")?,
                };
                Ok(record.to_option())
            })
            .collect()
    }
}

impl LogSink for SqliteStore {
    fn write(&self, entry: &LogEntry) {
        let store = self.clone();
        let entry = entry.clone();
        self.handle.spawn(async move {
            if let Err(e) = store.insert_log(&entry).await {
                warn!(trader_id = entry.trader_id, error = %e, "Dropped trader log entry");
            }
        });
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
