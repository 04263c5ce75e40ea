//! Script execution unit: one single-shot run of a trader's script.

use chrono::{DateTime, Utc};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info};

use super::context::ExecutionContext;
use crate::logger::TraderLogger;
use crate::script::{parse, Fault, InterruptHandle};

/// Registry entry of one unit. Starts out running; the unit marks it idle
/// as the very last step of cleanup, after which it stays inert.
#[derive(Debug)]
pub struct UnitSlot {
    status: AtomicI64,
    last_run_at: Mutex<Option<DateTime<Utc>>>,
    stop: InterruptHandle,
}

impl UnitSlot {
    pub fn new(stop: InterruptHandle) -> Self {
        Self {
            status: AtomicI64::new(1),
            last_run_at: Mutex::new(Some(Utc::now())),
            stop,
        }
    }

    pub fn status(&self) -> i64 {
        self.status.load(Ordering::SeqCst)
    }

    pub fn is_active(&self) -> bool {
        self.status() > 0
    }

    pub fn last_run_at(&self) -> Option<DateTime<Utc>> {
        *self.last_run_at.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a stop request. `false` if one is already pending or the
    /// unit has finished.
    pub fn request_stop(&self) -> bool {
        self.stop.request()
    }

    fn mark_started(&self) {
        *self.last_run_at.lock().unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());
        self.status.store(1, Ordering::SeqCst);
    }

    fn mark_finished(&self) {
        self.status.store(0, Ordering::SeqCst);
    }
}

/// Run `source` on `ctx` to completion. Blocks the calling thread; meant
/// for the blocking pool. Every failure ends up in the trader log.
pub fn run_unit(mut ctx: ExecutionContext, source: &str, slot: &UnitSlot) {
    slot.mark_started();
    let logger = ctx.bindings().logger.clone();
    let trader_id = logger.trader_id();
    debug!(trader_id, "Unit started");

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| execute(&mut ctx, source, &logger)));
    report(&logger, outcome);

    ctx.clear_interrupt();
    let exit = panic::catch_unwind(AssertUnwindSafe(|| ctx.call_global("exit", Vec::new()).map(|_| ())));
    report(&logger, exit);

    slot.mark_finished();
    info!(trader_id, "Trader stopped");
}

/// Script body, then `main`. A cancellation skips the rest.
fn execute(ctx: &mut ExecutionContext, source: &str, logger: &TraderLogger) -> Result<(), Fault> {
    match parse(source) {
        Ok(program) => match ctx.run(&program) {
            Ok(()) => {}
            Err(fault) if fault.is_cancelled() => return Err(fault),
            Err(fault) => logger.error(fault.to_string()),
        },
        Err(e) => logger.error(e.to_string()),
    }

    if ctx.call_global("main", Vec::new())?.is_none() {
        logger.error("Can not get the main function");
    }
    Ok(())
}

fn report(logger: &TraderLogger, outcome: std::thread::Result<Result<(), Fault>>) {
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(fault)) if fault.is_cancelled() => {
            debug!(trader_id = logger.trader_id(), "Unit cancelled");
        }
        Ok(Err(fault)) => logger.error(fault.to_string()),
        Err(payload) => logger.error(panic_message(payload.as_ref())),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panic: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panic: {s}")
    } else {
        "panic: unknown payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::{LogKind, MemoryLogSink};
    use crate::runtime::host::HostBindings;
    use std::sync::Arc;

    fn run(source: &str) -> (Arc<MemoryLogSink>, UnitSlot) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let sink = Arc::new(MemoryLogSink::new());
        let logger = TraderLogger::new(2, "global", Some(sink.clone()));
        let bindings = Arc::new(HostBindings::new(2, logger, Vec::new(), rt.handle().clone()));
        let (ctx, stop) = ExecutionContext::new(bindings);
        let slot = UnitSlot::new(stop);
        run_unit(ctx, source, &slot);
        (sink, slot)
    }

    #[test]
    fn test_main_and_exit_run_once() {
        let (sink, slot) = run(
            r#"
            Log("body")
            function main() { Log("main") }
            function exit() { Log("exit") }
            "#,
        );
        assert_eq!(sink.messages(LogKind::Info), vec!["body", "main", "exit"]);
        assert!(sink.messages(LogKind::Error).is_empty());
        assert_eq!(slot.status(), 0);
        assert!(slot.last_run_at().is_some());
    }

    #[test]
    fn test_missing_main_is_reported() {
        let (sink, slot) = run("var x = 1");
        assert_eq!(sink.messages(LogKind::Error), vec!["Can not get the main function"]);
        assert_eq!(slot.status(), 0);
    }

    #[test]
    fn test_parse_error_still_runs_cleanup() {
        let (sink, _) = run("function main( { ");
        let errors = sink.messages(LogKind::Error);
        assert_eq!(errors.len(), 2);
        assert!(errors[0].starts_with("SyntaxError"));
        assert_eq!(errors[1], "Can not get the main function");
    }

    #[test]
    fn test_errors_in_main_and_exit_are_logged() {
        let (sink, _) = run(
            r#"
            function main() { throw "boom" }
            function exit() { undefinedThing() }
            "#,
        );
        let errors = sink.messages(LogKind::Error);
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0], "Uncaught boom");
    }

    #[test]
    fn test_cancelled_before_start_skips_main_but_runs_exit() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let sink = Arc::new(MemoryLogSink::new());
        let logger = TraderLogger::new(2, "global", Some(sink.clone()));
        let bindings = Arc::new(HostBindings::new(2, logger, Vec::new(), rt.handle().clone()));
        let (ctx, stop) = ExecutionContext::new(bindings);
        let slot = UnitSlot::new(stop);
        assert!(slot.request_stop());
        // Slot holds one request only.
        assert!(!slot.request_stop());

        run_unit(
            ctx,
            r#"
            Log("body")
            function main() { Log("main") }
            function exit() { Log("exit") }
            "#,
            &slot,
        );
        assert_eq!(sink.messages(LogKind::Info), vec!["exit"]);
        assert!(sink.messages(LogKind::Error).is_empty());
        assert_eq!(slot.status(), 0);
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("bad state");
        assert_eq!(panic_message(payload.as_ref()), "panic: bad state");
        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "panic: owned");
    }
}
