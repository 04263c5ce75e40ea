//! Host bindings: the capability surface a trader script sees.
//!
//! Natives are bound as `Value::Native` with a [`Primitive`] id. Host
//! objects are bound as `Value::Handle`: [`GLOBAL`] for `G`/`Global` and
//! `HostRef(i + 1)` for exchange `i`. Exchange failures never fault the
//! script; they are logged as `ERROR` and returned as `false`.

use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::info;

use super::context::ExecutionContext;
use super::tasks::TaskScheduler;
use crate::exchanges::Exchange;
use crate::logger::{LogKind, TraderLogger};
use crate::script::{Fault, Host, HostRef, Interpreter, Value};
use crate::types::{Order, Period, TradeSide};

/// Handle of the `G` / `Global` object.
pub const GLOBAL: HostRef = HostRef(0);

const DEFAULT_TICKER_DEPTH: usize = 10;
const DEFAULT_RECORD_SIZE: usize = 100;

/// Global functions injected into every context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Primitive {
    Log,
    LogProfit,
    Console,
    Sleep,
    AddTask,
    BindTaskParam,
    ExecTasks,
}

impl Primitive {
    pub const ALL: &'static [Primitive] = &[
        Primitive::Log,
        Primitive::LogProfit,
        Primitive::Console,
        Primitive::Sleep,
        Primitive::AddTask,
        Primitive::BindTaskParam,
        Primitive::ExecTasks,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Primitive::Log => "Log",
            Primitive::LogProfit => "LogProfit",
            Primitive::Console => "Console",
            Primitive::Sleep => "Sleep",
            Primitive::AddTask => "AddTask",
            Primitive::BindTaskParam => "BindTaskParam",
            Primitive::ExecTasks => "ExecTasks",
        }
    }

    pub fn host_ref(self) -> HostRef {
        HostRef(self as u32)
    }

    fn from_ref(target: HostRef) -> Option<Self> {
        Self::ALL.get(target.0 as usize).copied()
    }

    fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|p| p.name() == name)
    }
}

/// Everything a context (and each of its forks) shares: the trader's
/// logger, its live exchange adapters, and the runtime used to drive
/// their async calls from the script thread.
pub struct HostBindings {
    pub trader_id: i64,
    pub logger: TraderLogger,
    pub exchanges: Vec<Arc<dyn Exchange>>,
    exchange_loggers: Vec<TraderLogger>,
    handle: Handle,
}

impl HostBindings {
    pub fn new(trader_id: i64, logger: TraderLogger, exchanges: Vec<Arc<dyn Exchange>>, handle: Handle) -> Self {
        let exchange_loggers = exchanges
            .iter()
            .map(|ex| logger.for_exchange(ex.exchange_type()))
            .collect();
        Self {
            trader_id,
            logger,
            exchanges,
            exchange_loggers,
            handle,
        }
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.handle.block_on(future)
    }
}

/// Bind primitives, host objects and constants into `interp`.
pub fn inject(interp: &mut Interpreter, bindings: &HostBindings) {
    for period in Period::ALL {
        interp.set_global(period.as_str(), Value::from(period.as_str()));
    }
    for kind in LogKind::ALL {
        interp.set_global(kind.as_str(), Value::from(kind.as_str()));
    }
    for primitive in Primitive::ALL {
        interp.set_global(primitive.name(), Value::Native(primitive.host_ref()));
    }

    interp.set_global("Global", Value::Handle(GLOBAL));
    interp.set_global("G", Value::Handle(GLOBAL));

    let handles: Vec<Value> = (0..bindings.exchanges.len())
        .map(|i| Value::Handle(HostRef(i as u32 + 1)))
        .collect();
    if let Some(first) = handles.first() {
        interp.set_global("Exchange", first.clone());
        interp.set_global("E", first.clone());
    }
    interp.set_global("Exchanges", Value::Array(handles.clone()));
    interp.set_global("Es", Value::Array(handles));
}

// ---------------------------------------------------------------------------
// Argument helpers
// ---------------------------------------------------------------------------

fn text(value: &Value) -> String {
    match value {
        Value::Str(s) => s.clone(),
        other => other.to_string(),
    }
}

fn str_arg(args: &[Value], i: usize) -> String {
    match args.get(i) {
        None | Some(Value::Undefined) => String::new(),
        Some(value) => text(value),
    }
}

fn num_arg(args: &[Value], i: usize) -> f64 {
    args.get(i).map(Value::to_number).unwrap_or(0.0)
}

/// Positive integer argument, or `default`.
fn size_arg(args: &[Value], i: usize, default: usize) -> usize {
    let n = num_arg(args, i);
    if n.is_finite() && n >= 1.0 {
        n as usize
    } else {
        default
    }
}

fn messages(args: &[Value]) -> Vec<String> {
    args.iter().map(text).collect()
}

fn to_value<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).map(Value::from).unwrap_or(Value::Null)
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Per-call view of a context handed to the interpreter as its [`Host`].
pub(crate) struct HostCall<'a> {
    pub bindings: &'a Arc<HostBindings>,
    pub tasks: &'a mut TaskScheduler,
}

impl HostCall<'_> {
    fn primitive(&mut self, interp: &Interpreter, primitive: Primitive, args: Vec<Value>) -> Value {
        let logger = &self.bindings.logger;
        match primitive {
            Primitive::Log => {
                logger.log(LogKind::Info, "", 0.0, 0.0, &messages(&args));
                Value::Undefined
            }
            Primitive::LogProfit => {
                let profit = num_arg(&args, 0);
                let rest = args.get(1..).map(messages).unwrap_or_default();
                logger.log(LogKind::Profit, "", 0.0, profit, &rest);
                Value::Undefined
            }
            Primitive::Console => {
                info!(trader_id = self.bindings.trader_id, "{}", messages(&args).join(" "));
                Value::Undefined
            }
            Primitive::Sleep => {
                let millis = num_arg(&args, 0);
                if millis.is_finite() && millis > 0.0 {
                    match Duration::try_from_secs_f64(millis / 1000.0) {
                        Ok(interval) => std::thread::sleep(interval),
                        Err(_) => return fail(logger, "Sleep", format!("interval out of range: {millis:e}")),
                    }
                } else {
                    for ex in &self.bindings.exchanges {
                        self.bindings.block_on(ex.limiter().auto_sleep());
                    }
                }
                Value::Undefined
            }
            Primitive::AddTask => {
                let group = str_arg(&args, 0);
                let entry = str_arg(&args, 1);
                let rest = args.into_iter().skip(2).collect();
                let bindings = Arc::clone(self.bindings);
                match self
                    .tasks
                    .add_task(&group, &entry, rest, || ExecutionContext::fork_from(interp, bindings))
                {
                    Ok(()) => Value::Bool(true),
                    Err(e) => {
                        logger.error(format!("AddTask(), {e}"));
                        Value::Bool(false)
                    }
                }
            }
            Primitive::BindTaskParam => {
                let group = str_arg(&args, 0);
                let entry = str_arg(&args, 1);
                let rest = args.into_iter().skip(2).collect();
                match self.tasks.bind_task_param(&group, &entry, rest) {
                    Ok(()) => Value::Bool(true),
                    Err(e) => {
                        logger.error(format!("BindTaskParam(), {e}"));
                        Value::Bool(false)
                    }
                }
            }
            Primitive::ExecTasks => {
                let group = str_arg(&args, 0);
                match self.tasks.exec_tasks(&group, self.bindings.handle()) {
                    Ok(results) => Value::Array(results),
                    Err(e) => {
                        logger.error(format!("ExecTasks(), {e}"));
                        Value::Array(Vec::new())
                    }
                }
            }
        }
    }

    fn exchange_method(&self, index: usize, method: &str, args: Vec<Value>) -> Result<Value, Fault> {
        let (Some(ex), Some(logger)) = (
            self.bindings.exchanges.get(index),
            self.bindings.exchange_loggers.get(index),
        ) else {
            return Err(Fault::error(format!("unknown host object #{}", index + 1)));
        };
        let b = self.bindings.as_ref();

        let value = match method {
            "Log" => {
                logger.log(LogKind::Info, "", 0.0, 0.0, &messages(&args));
                Value::Undefined
            }
            "GetType" => Value::from(ex.exchange_type()),
            "GetName" => Value::from(ex.name()),
            "SetLimit" => Value::Number(ex.limiter().set_limit(num_arg(&args, 0))),
            "AutoSleep" => {
                b.block_on(ex.limiter().auto_sleep());
                Value::Undefined
            }
            "GetMinAmount" => Value::Number(ex.min_amount(&str_arg(&args, 0).to_uppercase())),
            "GetAccount" => match b.block_on(ex.get_account()) {
                Ok(account) => to_value(&account),
                Err(e) => fail(logger, "GetAccount", e),
            },
            "Trade" => {
                let side = match str_arg(&args, 0).parse::<TradeSide>() {
                    Ok(side) => side,
                    Err(e) => return Ok(fail(logger, "Trade", e)),
                };
                let pair = str_arg(&args, 1).to_uppercase();
                let price = num_arg(&args, 2);
                let amount = num_arg(&args, 3);
                match b.block_on(ex.trade(side, &pair, price, amount)) {
                    Ok(id) => {
                        let kind = match side {
                            TradeSide::Buy => LogKind::Buy,
                            TradeSide::Sell => LogKind::Sell,
                        };
                        let notes = args.get(4..).map(messages).unwrap_or_default();
                        logger.log(kind, &pair, price, amount, &notes);
                        Value::Str(id)
                    }
                    Err(e) => fail(logger, "Trade", e),
                }
            }
            "GetOrder" => {
                let pair = str_arg(&args, 0).to_uppercase();
                match b.block_on(ex.get_order(&pair, &str_arg(&args, 1))) {
                    Ok(order) => to_value(&order),
                    Err(e) => fail(logger, "GetOrder", e),
                }
            }
            "GetOrders" => match b.block_on(ex.get_orders(&str_arg(&args, 0).to_uppercase())) {
                Ok(orders) => to_value(&orders),
                Err(e) => fail(logger, "GetOrders", e),
            },
            "GetTrades" => match b.block_on(ex.get_trades(&str_arg(&args, 0).to_uppercase())) {
                Ok(trades) => to_value(&trades),
                Err(e) => fail(logger, "GetTrades", e),
            },
            "CancelOrder" => {
                let order = match args.first().map(|v| serde_json::from_value::<Order>(v.to_json())) {
                    Some(Ok(order)) if !order.id.is_empty() => order,
                    _ => return Ok(fail(logger, "CancelOrder", "invalid order")),
                };
                match b.block_on(ex.cancel_order(&order)) {
                    Ok(true) => {
                        logger.log(
                            LogKind::Cancel,
                            &order.stock_type,
                            order.price,
                            order.remaining(),
                            &[order.to_string()],
                        );
                        Value::Bool(true)
                    }
                    Ok(false) => Value::Bool(false),
                    Err(e) => fail(logger, "CancelOrder", e),
                }
            }
            "GetTicker" => {
                let pair = str_arg(&args, 0).to_uppercase();
                let depth = size_arg(&args, 1, DEFAULT_TICKER_DEPTH);
                match b.block_on(ex.get_ticker(&pair, depth)) {
                    Ok(ticker) => to_value(&ticker),
                    Err(e) => fail(logger, "GetTicker", e),
                }
            }
            "GetRecords" => {
                let pair = str_arg(&args, 0).to_uppercase();
                let period = match args.get(1) {
                    None | Some(Value::Undefined) => Period::M,
                    Some(value) => match text(value).parse::<Period>() {
                        Ok(period) => period,
                        Err(e) => return Ok(fail(logger, "GetRecords", e)),
                    },
                };
                let size = size_arg(&args, 2, DEFAULT_RECORD_SIZE);
                match b.block_on(ex.get_records(&pair, period, size)) {
                    Ok(records) => to_value(&records),
                    Err(e) => fail(logger, "GetRecords", e),
                }
            }
            other => {
                return Err(Fault::error(format!("Exchange.{other} is not a function")));
            }
        };
        Ok(value)
    }
}

/// Log `Op() error, ...` and produce the `false` sentinel.
fn fail(logger: &TraderLogger, op: &str, err: impl std::fmt::Display) -> Value {
    logger.error(format!("{op}() error, {err:#}"));
    Value::Bool(false)
}

impl Host for HostCall<'_> {
    fn call_native(&mut self, interp: &Interpreter, target: HostRef, args: Vec<Value>) -> Result<Value, Fault> {
        let primitive = Primitive::from_ref(target)
            .ok_or_else(|| Fault::error(format!("unknown host function #{}", target.0)))?;
        Ok(self.primitive(interp, primitive, args))
    }

    fn call_method(
        &mut self,
        interp: &Interpreter,
        target: HostRef,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, Fault> {
        if target == GLOBAL {
            return match Primitive::from_name(method) {
                Some(primitive) => Ok(self.primitive(interp, primitive, args)),
                None => Err(Fault::error(format!("Global.{method} is not a function"))),
            };
        }
        self.exchange_method(target.0 as usize - 1, method, args)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
