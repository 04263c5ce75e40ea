//! Lifecycle supervisor: which trader runs which unit.
//!
//! Keeps a process-wide registry of unit slots keyed by trader id. A slot
//! is registered before its unit is spawned and never removed; once the
//! unit finishes the slot reports status 0 and only serves `stop` as a
//! no-op. Configuration problems are returned to the caller; anything
//! after the spawn goes to the trader log.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use super::context::ExecutionContext;
use super::host::HostBindings;
use super::unit::{self, UnitSlot};
use crate::exchanges::{Exchange, ExchangeOption, ExchangeRegistry};
use crate::logger::{LogSink, TraderLogger};
use crate::storage::Store;
use crate::types::{SupervisorError, Trader};

pub struct Supervisor {
    store: Arc<dyn Store>,
    exchanges: ExchangeRegistry,
    sink: Option<Arc<dyn LogSink>>,
    registry: Mutex<HashMap<i64, Arc<UnitSlot>>>,
}

impl Supervisor {
    pub fn new(store: Arc<dyn Store>, exchanges: ExchangeRegistry, sink: Option<Arc<dyn LogSink>>) -> Self {
        Self {
            store,
            exchanges,
            sink,
            registry: Mutex::new(HashMap::new()),
        }
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<i64, Arc<UnitSlot>>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 0 when idle or unknown, otherwise the unit's status.
    pub fn status(&self, id: i64) -> i64 {
        self.registry().get(&id).map(|slot| slot.status()).unwrap_or(0)
    }

    /// Stop a running trader, start an idle one.
    pub async fn switch(&self, id: i64) -> Result<(), SupervisorError> {
        if self.status(id) > 0 {
            self.stop(id)
        } else {
            self.run(id).await
        }
    }

    /// Load everything the trader needs and spawn its unit. Returns as
    /// soon as the unit is on the blocking pool.
    pub async fn run(&self, id: i64) -> Result<(), SupervisorError> {
        if self.status(id) > 0 {
            return Err(SupervisorError::AlreadyRunning(id));
        }

        let trader = self
            .store
            .load_trader(id)
            .await
            .map_err(|source| SupervisorError::LoadTrader { id, source })?;
        self.store
            .load_user(trader.user_id)
            .await
            .map_err(|source| SupervisorError::LoadUser {
                id: trader.user_id,
                source,
            })?;
        let algorithm_id = trader
            .algorithm_id
            .filter(|a| *a > 0)
            .ok_or(SupervisorError::NoAlgorithm(id))?;
        let algorithm = self
            .store
            .load_algorithm(algorithm_id)
            .await
            .map_err(|source| SupervisorError::LoadAlgorithm {
                id: algorithm_id,
                source,
            })?;
        let options = self
            .store
            .exchange_bindings(id)
            .await
            .map_err(|source| SupervisorError::LoadExchanges { id, source })?;

        let exchanges = self.build_exchanges(id, options);
        if exchanges.is_empty() {
            return Err(SupervisorError::NoExchange(id));
        }

        let handle = Handle::current();
        let logger = TraderLogger::new(id, "global", self.sink.clone());
        let bindings = Arc::new(HostBindings::new(id, logger, exchanges, handle.clone()));
        let (ctx, stop) = ExecutionContext::new(bindings);
        let slot = Arc::new(UnitSlot::new(stop));

        {
            let mut registry = self.registry();
            if registry.get(&id).is_some_and(|s| s.is_active()) {
                return Err(SupervisorError::AlreadyRunning(id));
            }
            registry.insert(id, Arc::clone(&slot));
        }

        info!(trader_id = id, trader = %trader.name, algorithm = %algorithm.name, "Trader started");
        let script = algorithm.script;
        handle.spawn_blocking(move || unit::run_unit(ctx, &script, &slot));
        Ok(())
    }

    fn build_exchanges(&self, id: i64, options: Vec<ExchangeOption>) -> Vec<Arc<dyn Exchange>> {
        let mut exchanges = Vec::with_capacity(options.len());
        for opt in options {
            let exchange_type = opt.exchange_type.clone();
            let name = opt.name.clone();
            match self.exchanges.make(opt) {
                Some(Ok(exchange)) => exchanges.push(exchange),
                Some(Err(e)) => {
                    warn!(trader_id = id, exchange = %exchange_type, name = %name, error = %e, "Failed to build exchange, skipping")
                }
                None => {
                    warn!(trader_id = id, exchange = %exchange_type, name = %name, "Unknown exchange type, skipping")
                }
            }
        }
        exchanges
    }

    /// Ask a trader's unit to stop at its next checkpoint. Never blocks;
    /// a second request while one is pending is dropped.
    pub fn stop(&self, id: i64) -> Result<(), SupervisorError> {
        let registry = self.registry();
        let slot = registry.get(&id).ok_or(SupervisorError::TraderNotFound(id))?;
        if slot.request_stop() {
            info!(trader_id = id, "Stop requested");
        } else {
            debug!(trader_id = id, "Stop already pending or unit finished");
        }
        Ok(())
    }

    /// Request a stop of every running trader. Returns how many were asked.
    pub fn stop_all(&self) -> usize {
        let registry = self.registry();
        let mut asked = 0;
        for (id, slot) in registry.iter().filter(|(_, s)| s.is_active()) {
            slot.request_stop();
            debug!(trader_id = id, "Stop requested on shutdown");
            asked += 1;
        }
        asked
    }

    /// Ids of traders whose unit is still running.
    pub fn running(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .registry()
            .iter()
            .filter(|(_, s)| s.is_active())
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Wait until no unit is running. `false` on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.running().is_empty() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Stored trader with the live status and last start time overlaid.
    pub async fn describe(&self, id: i64) -> Result<Trader, SupervisorError> {
        let mut trader = self
            .store
            .load_trader(id)
            .await
            .map_err(|source| SupervisorError::LoadTrader { id, source })?;
        let slot = self.registry().get(&id).cloned();
        trader.status = slot.as_ref().map(|s| s.status()).unwrap_or(0);
        if let Some(at) = slot.and_then(|s| s.last_run_at()) {
            trader.last_run_at = Some(at);
        }
        Ok(trader)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::logger::{LogKind, MemoryLogSink};
    use crate::storage::MockStore;
    use crate::types::{Algorithm, User};
    use secrecy::SecretString;

    fn binding(exchange_type: &str) -> ExchangeOption {
        ExchangeOption {
            trader_id: 1,
            exchange_type: exchange_type.to_string(),
            name: "main".to_string(),
            access_key: String::new(),
            secret_key: SecretString::new(String::new()),
        }
    }

    /// A store whose trader 1 runs `script` on the given exchange type.
    fn store(algorithm_id: Option<i64>, exchange_type: &'static str, script: &'static str) -> MockStore {
        let mut store = MockStore::new();
        store
            .expect_load_trader()
            .returning(move |id| Ok(Trader::new(id, 7, "grid", algorithm_id)));
        store
            .expect_load_user()
            .returning(|id| Ok(User { id, username: "demo".into() }));
        store.expect_load_algorithm().returning(move |id| {
            Ok(Algorithm {
                id,
                user_id: 7,
                name: "algo".into(),
                script: script.into(),
            })
        });
        store
            .expect_exchange_bindings()
            .returning(move |_| Ok(vec![binding(exchange_type)]));
        store
    }

    fn supervisor(store: MockStore) -> (Supervisor, Arc<MemoryLogSink>) {
        let sink = Arc::new(MemoryLogSink::new());
        let registry = ExchangeRegistry::with_defaults(&AppConfig::default());
        let supervisor = Supervisor::new(Arc::new(store), registry, Some(sink.clone()));
        (supervisor, sink)
    }

    const LOOP: &str = "function main() { while (true) { Sleep(5) } }";

    #[tokio::test]
    async fn test_stop_unknown_trader() {
        let (sup, _) = supervisor(MockStore::new());
        let err = sup.stop(42).unwrap_err();
        assert_eq!(err.to_string(), "trader not found: 42");
        assert_eq!(sup.status(42), 0);
    }

    #[tokio::test]
    async fn test_run_reports_load_failure() {
        let mut store = MockStore::new();
        store
            .expect_load_trader()
            .returning(|_| Err(anyhow::anyhow!("no trader with id 3")));
        let (sup, _) = supervisor(store);
        let err = sup.run(3).await.unwrap_err();
        assert!(matches!(err, SupervisorError::LoadTrader { id: 3, .. }));
    }

    #[tokio::test]
    async fn test_run_requires_algorithm() {
        let (sup, _) = supervisor(store(None, "paper", LOOP));
        let err = sup.run(1).await.unwrap_err();
        assert!(matches!(err, SupervisorError::NoAlgorithm(1)));
        assert_eq!(sup.status(1), 0);
    }

    #[tokio::test]
    async fn test_run_requires_known_exchange() {
        let (sup, _) = supervisor(store(Some(2), "huobi", LOOP));
        let err = sup.run(1).await.unwrap_err();
        assert!(matches!(err, SupervisorError::NoExchange(1)));
        assert!(sup.running().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_switch_toggles_status() {
        let (sup, sink) = supervisor(store(Some(2), "paper", LOOP));

        sup.switch(1).await.unwrap();
        assert_eq!(sup.status(1), 1);
        assert!(matches!(sup.run(1).await, Err(SupervisorError::AlreadyRunning(1))));
        assert_eq!(sup.describe(1).await.unwrap().status, 1);

        sup.switch(1).await.unwrap();
        assert!(sup.wait_idle(Duration::from_secs(5)).await);
        assert_eq!(sup.status(1), 0);
        assert!(sink.messages(LogKind::Error).is_empty());

        // Finished slot stays registered: stop is a no-op, not an error.
        sup.stop(1).unwrap();

        // And the trader can be started again.
        sup.switch(1).await.unwrap();
        assert_eq!(sup.status(1), 1);
        assert_eq!(sup.stop_all(), 1);
        assert!(sup.wait_idle(Duration::from_secs(5)).await);
    }
}
