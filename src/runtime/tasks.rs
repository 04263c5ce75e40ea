//! Task groups: named batches of script calls run in parallel.
//!
//! `AddTask` snapshots the calling context into a fork and records which
//! global function to call on it; `ExecTasks` runs every task of a group
//! on the blocking pool and joins them. Results keep insertion order.

use futures::future::join_all;
use std::collections::HashMap;
use tokio::runtime::Handle;
use tracing::debug;

use super::context::ExecutionContext;
use crate::script::{is_identifier, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("tasks are running")]
    Running,
    #[error("Invalid group name")]
    InvalidGroup,
    #[error("Invalid function name")]
    InvalidFunction,
    #[error("group not exist")]
    GroupNotFound,
    #[error("function not exist")]
    FunctionNotFound,
}

/// A deferred call of `entry` on a private fork.
pub struct Task {
    context: ExecutionContext,
    entry: String,
    args: Vec<Value>,
}

impl Task {
    /// `false` unless `entry` resolves to a function that returns a
    /// non-null value without faulting.
    fn run(self) -> Value {
        let Task {
            mut context,
            entry,
            args,
        } = self;
        match context.call_global(&entry, args) {
            Ok(Some(value)) if !value.is_nullish() => value,
            Ok(Some(_)) => Value::Bool(false),
            Ok(None) => {
                context.bindings().logger.error("Can not get the task function");
                Value::Bool(false)
            }
            Err(fault) => {
                debug!(entry = %entry, fault = %fault, "Task faulted");
                Value::Bool(false)
            }
        }
    }
}

#[derive(Default)]
pub struct TaskScheduler {
    running: bool,
    groups: HashMap<String, Vec<Task>>,
}

impl TaskScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Append a task to `group`, creating the group on first use. `fork`
    /// is only invoked once the request is known to be valid.
    pub fn add_task<F>(&mut self, group: &str, entry: &str, args: Vec<Value>, fork: F) -> Result<(), TaskError>
    where
        F: FnOnce() -> ExecutionContext,
    {
        if self.running {
            return Err(TaskError::Running);
        }
        if !is_identifier(group) {
            return Err(TaskError::InvalidGroup);
        }
        if !is_identifier(entry) {
            return Err(TaskError::InvalidFunction);
        }
        self.groups.entry(group.to_string()).or_default().push(Task {
            context: fork(),
            entry: entry.to_string(),
            args,
        });
        Ok(())
    }

    /// Replace the arguments of the first task in `group` calling `entry`.
    pub fn bind_task_param(&mut self, group: &str, entry: &str, args: Vec<Value>) -> Result<(), TaskError> {
        if self.running {
            return Err(TaskError::Running);
        }
        if !is_identifier(group) {
            return Err(TaskError::InvalidGroup);
        }
        if !is_identifier(entry) {
            return Err(TaskError::InvalidFunction);
        }
        let tasks = self.groups.get_mut(group).ok_or(TaskError::GroupNotFound)?;
        let task = tasks
            .iter_mut()
            .find(|t| t.entry == entry)
            .ok_or(TaskError::FunctionNotFound)?;
        task.args = args;
        Ok(())
    }

    /// Entry names of `group` in insertion order.
    pub fn entry_names(&self, group: &str) -> Vec<String> {
        self.groups
            .get(group)
            .map(|tasks| tasks.iter().map(|t| t.entry.clone()).collect())
            .unwrap_or_default()
    }

    /// Run and consume every task of `group`, one blocking worker each,
    /// and wait for all of them.
    ///
    /// Must be called from outside an async context (a script thread).
    pub fn exec_tasks(&mut self, group: &str, handle: &Handle) -> Result<Vec<Value>, TaskError> {
        if !is_identifier(group) {
            return Err(TaskError::InvalidGroup);
        }
        if !self.groups.contains_key(group) {
            return Err(TaskError::GroupNotFound);
        }
        if self.running {
            return Err(TaskError::Running);
        }
        let tasks = self.groups.remove(group).unwrap_or_default();

        self.running = true;
        let workers: Vec<_> = tasks
            .into_iter()
            .map(|task| handle.spawn_blocking(move || task.run()))
            .collect();
        let results = handle
            .block_on(join_all(workers))
            .into_iter()
            .map(|joined| joined.unwrap_or(Value::Bool(false)))
            .collect();
        self.running = false;

        Ok(results)
    }
}
