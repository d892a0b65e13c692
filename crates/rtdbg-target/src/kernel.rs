//! Kernel primitives used by the agent.

use crate::{KernelError, TaskId, TaskInfo};

/// Body of a task created through [`Kernel::spawn`].
pub type TaskEntry = Box<dyn FnOnce() + Send + 'static>;

/// Task management primitives of the real-time kernel.
pub trait Kernel: Send + Sync {
    /// Process id reported to the debugger.
    fn pid(&self) -> u32;

    /// Number of processors.
    fn processors(&self) -> usize;

    /// Walk the task table.
    fn tasks(&self) -> Vec<TaskInfo>;

    /// Look up one task.
    fn task(&self, id: TaskId) -> Option<TaskInfo> {
        self.tasks().into_iter().find(|task| task.id == id)
    }

    /// Tasks the agent must never stop (idle, timer and similar).
    fn system_tasks(&self) -> Vec<TaskId>;

    /// Task executing on the calling context, if any.
    fn current_task(&self) -> Option<TaskId>;

    /// Suspend a task. [`KernelError::AlreadySuspended`] is not fatal to the
    /// caller.
    fn suspend(&self, id: TaskId) -> Result<(), KernelError>;

    fn resume(&self, id: TaskId) -> Result<(), KernelError>;

    /// Create and start a task.
    fn spawn(&self, name: &str, priority: u32, entry: TaskEntry) -> Result<TaskId, KernelError>;

    /// Remove a task from the task table.
    fn delete(&self, id: TaskId) -> Result<(), KernelError>;

    /// Pin a task to one processor.
    fn set_affinity(&self, id: TaskId, cpu: usize) -> Result<(), KernelError>;

    /// Request a system reset.
    fn reset(&self);
}
