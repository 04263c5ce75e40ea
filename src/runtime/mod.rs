//! Script runtime.
//!
//! - `supervisor`: per-trader start/stop/status registry
//! - `unit`: one single-shot script run on the blocking pool
//! - `context`: interpreter plus injected host bindings
//! - `host`: the primitives and exchange objects scripts call
//! - `tasks`: `AddTask` / `BindTaskParam` / `ExecTasks` groups

pub mod context;
pub mod host;
pub mod supervisor;
pub mod tasks;
pub mod unit;

pub use context::ExecutionContext;
pub use host::HostBindings;
pub use supervisor::Supervisor;
pub use tasks::{TaskError, TaskScheduler};
pub use unit::UnitSlot;

use anyhow::{Context, Result};
use tokio::runtime::Runtime;

use crate::script::THREAD_STACK_SIZE;

/// Multi-threaded runtime whose blocking pool can host script units.
///
/// Units parked in a native call cannot be cancelled, so the owner should
/// drop it with [`Runtime::shutdown_timeout`] rather than a plain drop,
/// which waits for every blocking task.
pub fn build_runtime() -> Result<Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("scriptbot")
        .thread_stack_size(THREAD_STACK_SIZE)
        .build()
        .context("Failed to build tokio runtime")
}
