//! Trader log stream.
//!
//! Every script-visible log line (`Log`, `LogProfit`, exchange order
//! events, runtime errors) goes through a [`TraderLogger`]. Each entry is
//! emitted as a `tracing` event and, when a sink is attached, handed to
//! it for persistence.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

/// Severity / event tag of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogKind {
    Error,
    Info,
    Profit,
    Buy,
    Sell,
    Long,
    Short,
    LongClose,
    ShortClose,
    Cancel,
}

impl LogKind {
    pub const ALL: &'static [LogKind] = &[
        LogKind::Error,
        LogKind::Info,
        LogKind::Profit,
        LogKind::Buy,
        LogKind::Sell,
        LogKind::Long,
        LogKind::Short,
        LogKind::LongClose,
        LogKind::ShortClose,
        LogKind::Cancel,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LogKind::Error => "ERROR",
            LogKind::Info => "INFO",
            LogKind::Profit => "PROFIT",
            LogKind::Buy => "BUY",
            LogKind::Sell => "SELL",
            LogKind::Long => "LONG",
            LogKind::Short => "SHORT",
            LogKind::LongClose => "LONG_CLOSE",
            LogKind::ShortClose => "SHORT_CLOSE",
            LogKind::Cancel => "CANCEL",
        }
    }
}

impl fmt::Display for LogKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LogKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LogKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("unknown log kind: {s}"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEntry {
    pub trader_id: i64,
    /// `"global"` for runtime/script lines, the venue type otherwise.
    pub exchange_type: String,
    pub kind: LogKind,
    pub pair: String,
    pub price: f64,
    pub amount: f64,
    pub message: String,
    pub time: DateTime<Utc>,
}

/// Destination for trader log entries.
pub trait LogSink: Send + Sync {
    fn write(&self, entry: &LogEntry);
}

/// Keeps entries in memory; used by tests and as the default sink when no
/// database is configured.
#[derive(Default)]
pub struct MemoryLogSink {
    entries: Mutex<Vec<LogEntry>>,
}

impl MemoryLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn messages(&self, kind: LogKind) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter(|e| e.kind == kind)
            .map(|e| e.message)
            .collect()
    }
}

impl LogSink for MemoryLogSink {
    fn write(&self, entry: &LogEntry) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(entry.clone());
        }
    }
}

/// Per-trader logger. Cheap to clone; exchanges get their own copy tagged
/// with their venue type.
#[derive(Clone)]
pub struct TraderLogger {
    trader_id: i64,
    exchange_type: String,
    sink: Option<Arc<dyn LogSink>>,
}

impl TraderLogger {
    pub fn new(trader_id: i64, exchange_type: &str, sink: Option<Arc<dyn LogSink>>) -> Self {
        Self {
            trader_id,
            exchange_type: exchange_type.to_string(),
            sink,
        }
    }

    /// A logger for the same trader and sink, tagged with another venue.
    pub fn for_exchange(&self, exchange_type: &str) -> Self {
        Self {
            exchange_type: exchange_type.to_string(),
            ..self.clone()
        }
    }

    pub fn trader_id(&self) -> i64 {
        self.trader_id
    }

    /// Write one entry. `messages` are joined with single spaces.
    pub fn log<S: AsRef<str>>(&self, kind: LogKind, pair: &str, price: f64, amount: f64, messages: &[S]) {
        let message = messages
            .iter()
            .map(|m| m.as_ref())
            .collect::<Vec<_>>()
            .join(" ");

        match kind {
            LogKind::Error => error!(
                trader_id = self.trader_id,
                exchange = %self.exchange_type,
                kind = %kind,
                "{message}"
            ),
            LogKind::Cancel => warn!(
                trader_id = self.trader_id,
                exchange = %self.exchange_type,
                kind = %kind,
                pair,
                price,
                amount,
                "{message}"
            ),
            _ => info!(
                trader_id = self.trader_id,
                exchange = %self.exchange_type,
                kind = %kind,
                pair,
                price,
                amount,
                "{message}"
            ),
        }

        if let Some(sink) = &self.sink {
            sink.write(&LogEntry {
                trader_id: self.trader_id,
                exchange_type: self.exchange_type.clone(),
                kind,
                pair: pair.to_string(),
                price,
                amount,
                message,
                time: Utc::now(),
            });
        }
    }

    pub fn info(&self, message: impl AsRef<str>) {
        self.log(LogKind::Info, "", 0.0, 0.0, &[message.as_ref()]);
    }

    pub fn error(&self, message: impl AsRef<str>) {
        self.log(LogKind::Error, "", 0.0, 0.0, &[message.as_ref()]);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_kind_names() {
        assert_eq!(LogKind::LongClose.as_str(), "LONG_CLOSE");
        assert_eq!("PROFIT".parse::<LogKind>().unwrap(), LogKind::Profit);
        assert!("profit".parse::<LogKind>().is_err());
        let json = serde_json::to_string(&LogKind::ShortClose).unwrap();
        assert_eq!(json, "\"SHORT_CLOSE\"");
    }

    #[test]
    fn test_entries_reach_sink() {
        let sink = Arc::new(MemoryLogSink::new());
        let logger = TraderLogger::new(7, "global", Some(sink.clone()));
        logger.log(LogKind::Buy, "BTC/USDT", 100.0, 0.5, &["first", "order"]);
        logger.for_exchange("paper").error("boom");

        let entries = sink.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].message, "first order");
        assert_eq!(entries[0].pair, "BTC/USDT");
        assert_eq!(entries[1].kind, LogKind::Error);
        assert_eq!(entries[1].exchange_type, "paper");
        assert_eq!(entries[1].trader_id, 7);
        assert_eq!(sink.messages(LogKind::Error), vec!["boom".to_string()]);
    }

    #[test]
    fn test_no_sink_is_fine() {
        TraderLogger::new(1, "global", None).info("only tracing");
    }
}
