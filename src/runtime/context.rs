//! Execution context: one interpreter, its host bindings and its task groups.

use std::sync::Arc;

use super::host::{self, HostBindings, HostCall};
use super::tasks::TaskScheduler;
use crate::script::{Fault, Interpreter, InterruptHandle, Program, Value};

pub struct ExecutionContext {
    interp: Interpreter,
    bindings: Arc<HostBindings>,
    tasks: TaskScheduler,
}

impl ExecutionContext {
    /// A fresh interpreter with every host primitive injected, plus the
    /// handle that interrupts it.
    pub fn new(bindings: Arc<HostBindings>) -> (Self, InterruptHandle) {
        let (mut interp, stop) = Interpreter::new();
        host::inject(&mut interp, &bindings);
        let ctx = Self {
            interp,
            bindings,
            tasks: TaskScheduler::new(),
        };
        (ctx, stop)
    }

    /// Independent copy of `interp`'s globals sharing `bindings`, with an
    /// empty task registry. Its interrupt handle is dropped, so nothing
    /// can stop it.
    pub(crate) fn fork_from(interp: &Interpreter, bindings: Arc<HostBindings>) -> Self {
        let (interp, _) = interp.fork();
        Self {
            interp,
            bindings,
            tasks: TaskScheduler::new(),
        }
    }

    pub fn fork(&self) -> Self {
        Self::fork_from(&self.interp, Arc::clone(&self.bindings))
    }

    pub fn bindings(&self) -> &Arc<HostBindings> {
        &self.bindings
    }

    pub fn tasks(&self) -> &TaskScheduler {
        &self.tasks
    }

    pub fn global(&self, name: &str) -> Option<&Value> {
        self.interp.global(name)
    }

    pub fn run(&mut self, program: &Program) -> Result<(), Fault> {
        let mut host = HostCall {
            bindings: &self.bindings,
            tasks: &mut self.tasks,
        };
        self.interp.run(program, &mut host)
    }

    /// Call the global function `name`. `Ok(None)` when it is missing or
    /// not callable.
    pub fn call_global(&mut self, name: &str, args: Vec<Value>) -> Result<Option<Value>, Fault> {
        let callee = match self.interp.global(name) {
            Some(value) if value.is_callable() => value.clone(),
            _ => return Ok(None),
        };
        let mut host = HostCall {
            bindings: &self.bindings,
            tasks: &mut self.tasks,
        };
        self.interp.call(&callee, args, &mut host).map(Some)
    }

    /// Drop a stop request that arrived too late to matter.
    pub fn clear_interrupt(&mut self) {
        let _ = self.interp.checkpoint();
    }
}
