//! End-to-end tests: supervisor, units, host bindings and task groups
//! running real scripts against in-memory storage and exchanges.

mod mock_exchange;

use std::sync::Arc;
use std::time::Duration;

use mock_exchange::{MockExchange, MOCK_TYPE};
use scriptbot::config::AppConfig;
use scriptbot::exchanges::{Exchange, ExchangeRegistry};
use scriptbot::logger::{LogKind, LogSink, MemoryLogSink};
use scriptbot::runtime::Supervisor;
use scriptbot::storage::{ExchangeRecord, MemoryStore};
use scriptbot::types::{Algorithm, SupervisorError, Trader, User};

const TRADER: i64 = 1;

struct Harness {
    supervisor: Supervisor,
    sink: Arc<MemoryLogSink>,
    mocks: Vec<Arc<MockExchange>>,
}

impl Harness {
    /// Trader 1 running `script`, bound to one exchange per entry of
    /// `bindings` (`"mock"` entries get a fresh [`MockExchange`]).
    async fn new(script: &str, bindings: &[&str]) -> Self {
        let store = MemoryStore::new();
        store.insert_user(User { id: 7, username: "demo".into() }).await;
        store
            .insert_algorithm(Algorithm {
                id: 3,
                user_id: 7,
                name: "under test".into(),
                script: script.into(),
            })
            .await;
        store.insert_trader(Trader::new(TRADER, 7, "trader", Some(3))).await;

        let mut registry = ExchangeRegistry::with_defaults(&AppConfig::default());
        let mut mocks = Vec::new();
        for (i, exchange_type) in bindings.iter().enumerate() {
            let name = format!("{exchange_type}-{i}");
            store
                .insert_exchange(ExchangeRecord {
                    trader_id: TRADER,
                    exchange_type: exchange_type.to_string(),
                    name: name.clone(),
                    access_key: String::new(),
                    secret_key: String::new(),
                })
                .await;
            if *exchange_type == MOCK_TYPE {
                mocks.push(Arc::new(MockExchange::new(&name)));
            }
        }

        // Each binding of type "mock" receives the next prepared instance.
        let queue = Arc::new(std::sync::Mutex::new(mocks.clone().into_iter()));
        registry.register(MOCK_TYPE, move |_| {
            let next = queue.lock().unwrap().next();
            next.map(|m| m as Arc<dyn Exchange>)
                .ok_or_else(|| anyhow::anyhow!("no mock exchange left"))
        });

        let sink = Arc::new(MemoryLogSink::new());
        let supervisor = Supervisor::new(
            Arc::new(store),
            registry,
            Some(sink.clone() as Arc<dyn LogSink>),
        );
        Self { supervisor, sink, mocks }
    }

    async fn run_to_end(&self) {
        self.supervisor.run(TRADER).await.unwrap();
        assert!(self.supervisor.wait_idle(Duration::from_secs(5)).await, "unit did not finish");
    }

    fn info(&self) -> Vec<String> {
        self.sink.messages(LogKind::Info)
    }

    fn errors(&self) -> Vec<String> {
        self.sink.messages(LogKind::Error)
    }
}

async fn wait_for<F: Fn() -> bool>(what: &str, check: F) {
    for _ in 0..250 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

const LOOP: &str = r#"
    function main() { while (true) { Sleep(5) } }
    function exit() { Log("bye") }
"#;

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn test_switch_alternates_status() {
    let h = Harness::new(LOOP, &["paper"]).await;
    assert_eq!(h.supervisor.status(TRADER), 0);

    h.supervisor.switch(TRADER).await.unwrap();
    assert!(h.supervisor.status(TRADER) > 0);

    h.supervisor.switch(TRADER).await.unwrap();
    assert!(h.supervisor.wait_idle(Duration::from_secs(5)).await);
    assert_eq!(h.supervisor.status(TRADER), 0);

    h.supervisor.switch(TRADER).await.unwrap();
    assert!(h.supervisor.status(TRADER) > 0);
    h.supervisor.stop_all();
    assert!(h.supervisor.wait_idle(Duration::from_secs(5)).await);

    // exit ran once per run
    assert_eq!(h.info(), vec!["bye", "bye"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stop_unknown_trader() {
    let h = Harness::new(LOOP, &["paper"]).await;
    let err = h.supervisor.stop(99).unwrap_err();
    assert!(matches!(err, SupervisorError::TraderNotFound(99)));
    assert_eq!(err.to_string(), "trader not found: 99");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_configuration_errors_are_synchronous() {
    let h = Harness::new(LOOP, &["huobi"]).await;
    assert!(matches!(
        h.supervisor.run(TRADER).await,
        Err(SupervisorError::NoExchange(TRADER))
    ));
    assert!(matches!(
        h.supervisor.run(5).await,
        Err(SupervisorError::LoadTrader { id: 5, .. })
    ));
    assert_eq!(h.supervisor.status(TRADER), 0);
    // Nothing was spawned, so nothing was logged.
    assert!(h.sink.entries().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unknown_binding_is_skipped() {
    let h = Harness::new(
        r#"function main() { Log(Es.length, E.GetType()) }"#,
        &["huobi", "paper"],
    )
    .await;
    h.run_to_end().await;
    assert_eq!(h.info(), vec!["1 paper"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_double_stop_does_not_block() {
    let h = Harness::new(LOOP, &["paper"]).await;
    h.supervisor.run(TRADER).await.unwrap();
    h.supervisor.stop(TRADER).unwrap();
    h.supervisor.stop(TRADER).unwrap();
    assert!(h.supervisor.wait_idle(Duration::from_secs(5)).await);
    h.supervisor.stop(TRADER).unwrap();
    assert_eq!(h.info(), vec!["bye"]);
    assert!(h.errors().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stop_waits_for_native_sleep() {
    let h = Harness::new(
        r#"
        function main() {
            Log("sleeping")
            Sleep(600)
            Log("woke")
        }
        "#,
        &["paper"],
    )
    .await;
    h.supervisor.run(TRADER).await.unwrap();
    wait_for("script to reach Sleep", || h.info() == vec!["sleeping"]).await;

    h.supervisor.stop(TRADER).unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    // Still parked in the native call.
    assert_eq!(h.supervisor.status(TRADER), 1);

    assert!(h.supervisor.wait_idle(Duration::from_secs(5)).await);
    assert_eq!(h.info(), vec!["sleeping"]);
    assert!(h.errors().is_empty());
}

#[test]
fn test_shutdown_abandons_units_parked_in_native_calls() {
    let rt = scriptbot::runtime::build_runtime().unwrap();
    rt.block_on(async {
        let h = Harness::new(
            r#"function main() { Log("parked"); Sleep(3000) }"#,
            &["paper"],
        )
        .await;
        h.supervisor.run(TRADER).await.unwrap();
        wait_for("script to reach Sleep", || h.info() == vec!["parked"]).await;

        h.supervisor.stop_all();
        assert!(!h.supervisor.wait_idle(Duration::from_millis(200)).await);
        assert_eq!(h.supervisor.running(), vec![TRADER]);
    });

    let started = std::time::Instant::now();
    rt.shutdown_timeout(Duration::from_millis(100));
    assert!(started.elapsed() < Duration::from_secs(1), "shutdown waited for the unit");
}

// ---------------------------------------------------------------------------
// Unit behaviour
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn test_missing_main_is_logged() {
    let h = Harness::new(r#"Log("top level only")"#, &["paper"]).await;
    h.run_to_end().await;
    assert_eq!(h.info(), vec!["top level only"]);
    assert_eq!(h.errors(), vec!["Can not get the main function"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_parse_error_is_logged() {
    let h = Harness::new("function main() { Log('x' }", &["paper"]).await;
    h.run_to_end().await;
    let errors = h.errors();
    assert!(errors[0].starts_with("SyntaxError"), "{errors:?}");
    assert_eq!(h.supervisor.status(TRADER), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_deeply_nested_script_is_a_parse_error() {
    let script = format!(
        "var x = {}1{}\nfunction main() {{ Log('unreachable') }}",
        "(".repeat(5000),
        ")".repeat(5000)
    );
    let h = Harness::new(&script, &["paper"]).await;
    h.run_to_end().await;

    let errors = h.errors();
    assert!(errors[0].starts_with("SyntaxError: nesting too deep"), "{errors:?}");
    assert_eq!(errors[1], "Can not get the main function");
    assert!(h.info().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_exec_tasks_results_in_order() {
    let h = Harness::new(
        r#"
        function f(a, b) { Sleep(30); return a * 10 + b }
        function h() { throw "task failed" }
        function main() {
            AddTask("g", "f", 0, 0)
            AddTask("g", "h")
            BindTaskParam("g", "f", 4, 2)
            Log(ExecTasks("g"))
            Log(ExecTasks("g").length)
        }
        "#,
        &["paper"],
    )
    .await;
    h.run_to_end().await;
    assert_eq!(h.info(), vec!["[42,false]", "0"]);
    assert_eq!(h.errors(), vec!["ExecTasks(), group not exist"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_tasks_run_in_parallel_on_forks() {
    let h = Harness::new(
        r#"
        var counter = 0
        function slow(n) { counter = counter + n; Sleep(300); return counter }
        function main() {
            AddTask("g", "slow", 1)
            AddTask("g", "slow", 2)
            AddTask("g", "slow", 3)
            Log(ExecTasks("g"), counter)
        }
        "#,
        &["paper"],
    )
    .await;
    let started = std::time::Instant::now();
    h.run_to_end().await;
    // Forks never see each other's (or the parent's) writes.
    assert_eq!(h.info(), vec!["[1,2,3] 0"]);
    assert!(started.elapsed() < Duration::from_millis(850), "tasks ran serially");
}

// ---------------------------------------------------------------------------
// Exchange bindings
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn test_exchange_calls_reach_adapters_in_binding_order() {
    let h = Harness::new(
        r#"
        function main() {
            Log(Es[0].GetName(), Es[1].GetName(), Exchange.GetName())
            var id = Es[1].Trade("sell", "btc/usdt", 101, 0.5, "take", "profit")
            var order = Es[1].GetOrder("BTC/USDT", id)
            Log(order.TradeType, order.Amount)
            Log(Es[1].CancelOrder(order))
            Log(E.GetTicker("BTC/USDT").Mid, E.GetRecords("BTC/USDT", H, 2).length)
        }
        "#,
        &["mock", "mock"],
    )
    .await;
    h.run_to_end().await;

    assert_eq!(
        h.info(),
        vec!["mock-0 mock-1 mock-0", "SELL 0.5", "true", "100 2"]
    );
    let sells: Vec<_> = h.sink.entries().into_iter().filter(|e| e.kind == LogKind::Sell).collect();
    assert_eq!(sells.len(), 1);
    assert_eq!(sells[0].message, "take profit");
    assert_eq!(sells[0].pair, "BTC/USDT");
    assert_eq!(sells[0].exchange_type, MOCK_TYPE);
    assert_eq!(h.sink.messages(LogKind::Cancel).len(), 1);
    assert!(h.mocks[1].orders().is_empty());
    assert_eq!(h.mocks[0].calls(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_exchange_failures_become_false() {
    let h = Harness::new(
        r#"
        function main() {
            Log(E.GetAccount(), E.Trade("buy", "BTC/USDT", 1, 1))
        }
        "#,
        &["mock"],
    )
    .await;
    h.mocks[0].fail_with("exchange down");
    h.run_to_end().await;

    assert_eq!(h.info(), vec!["false false"]);
    assert_eq!(
        h.errors(),
        vec!["GetAccount() error, exchange down", "Trade() error, exchange down"]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_sleep_without_interval_uses_rate_limit() {
    let h = Harness::new(
        r#"
        function main() {
            Log(E.SetLimit(10))
            E.GetAccount(); E.GetAccount(); E.GetAccount()
            Sleep()
            Log("done")
        }
        "#,
        &["mock"],
    )
    .await;
    let started = std::time::Instant::now();
    h.run_to_end().await;
    assert_eq!(h.info(), vec!["10", "done"]);
    // Three calls at 10/s owe close to 300ms.
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert_eq!(h.mocks[0].limiter().calls(), 0);
}
