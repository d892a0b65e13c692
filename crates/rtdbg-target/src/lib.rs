//! Interfaces between the debug agent and the system it runs in.
//!
//! The agent core never touches hardware or kernel internals directly. It
//! drives three collaborators:
//!
//! - [`Target`]: the CPU architecture backend (registers, breakpoints,
//!   exception classification, guarded memory access).
//! - [`Kernel`]: the task primitives of the real-time kernel.
//! - [`Remote`]: a byte-stream transport to the debugger.

mod frame;
mod kernel;
mod registers;
mod remote;
mod target;
mod task;

pub use frame::{ExceptionFrame, ExceptionOutcome};
pub use gdbstub::common::Signal;
pub use kernel::{Kernel, TaskEntry};
pub use registers::{RegisterInfo, RegisterTable};
pub use remote::Remote;
pub use target::{Capabilities, Target, Watchpoint};
pub use task::{TaskId, TaskInfo, TaskState};

use thiserror::Error;

/// Errors reported by a target backend.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TargetError {
    #[error("memory fault at {address:#x}")]
    MemoryFault { address: u64 },

    #[error("register {0} out of range")]
    InvalidRegister(usize),

    #[error("register data too short: need {expected} bytes, got {actual}")]
    RegisterSize { expected: usize, actual: usize },

    #[error("processor {0} not available")]
    InvalidProcessor(usize),

    #[error("task {0} not found")]
    TaskNotFound(TaskId),

    #[error("{0} not supported")]
    Unsupported(&'static str),
}

/// Errors reported by kernel primitives.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KernelError {
    #[error("task {0} not found")]
    NotFound(TaskId),

    #[error("task {0} already suspended")]
    AlreadySuspended(TaskId),

    #[error("task {0} not suspended")]
    NotSuspended(TaskId),

    #[error("processor {0} not available")]
    InvalidProcessor(usize),

    #[error("failed to create task {name}: {reason}")]
    Spawn { name: String, reason: String },
}
