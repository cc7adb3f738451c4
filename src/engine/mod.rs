//! Execution engine seam. The worker hands an engine the compiled handle and
//! a set of per-job hooks; the engine binds inputs and emits outputs through
//! them and never sees the chat transport.

pub mod process;

pub use process::{ProcessExecutor, ProcessExecutorConfig};

use crate::queue::{ExecutionError, NodeCache};
use crate::registry::{ExecutableHandle, PortSpec};
use crate::value::{BoundValue, OutputValue};

/// Per-job callbacks the engine invokes while running a workflow.
pub trait PortHooks {
    /// Resolves one input port. `None` means an optional port with no value.
    fn bind(&mut self, port: &PortSpec) -> Result<Option<BoundValue>, ExecutionError>;

    fn emit(&mut self, output: OutputValue) -> Result<(), ExecutionError>;

    fn report_progress(&mut self, current: u32, total: u32);

    fn node_cache(&self) -> Option<&NodeCache>;
}

pub trait WorkflowExecutor: Send + Sync {
    fn execute(
        &self,
        handle: &ExecutableHandle,
        ports: &[PortSpec],
        hooks: &mut dyn PortHooks,
    ) -> Result<(), ExecutionError>;
}
