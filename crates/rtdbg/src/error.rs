//! Agent error type.

use thiserror::Error;

use rtdbg_proto::ProtoError;
use rtdbg_target::{KernelError, TargetError, TaskId};

/// Debug agent errors.
#[derive(Debug, Error)]
pub enum Error {
    #[error("debugger already active")]
    AlreadyActive,

    #[error("debugger not running")]
    NotRunning,

    #[error("remote not found: {0}")]
    RemoteNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("remote disconnected")]
    Disconnected,

    #[error("protocol error: {0}")]
    Proto(#[from] ProtoError),

    #[error("target error: {0}")]
    Target(#[from] TargetError),

    #[error("kernel error: {0}")]
    Kernel(#[from] KernelError),

    #[error("out of memory growing {0}")]
    NoMemory(&'static str),

    #[error("invalid breakpoint size: expected {expected}, got {actual}")]
    BreakpointSize { expected: usize, actual: u64 },

    #[error("no task snapshot")]
    NoSnapshot,

    #[error("thread {0} not found")]
    ThreadNotFound(TaskId),

    #[error("no thread selected")]
    NoThreadSelected,

    #[error("no current task")]
    NoCurrentTask,

    #[error("processor {cpu}: {source}")]
    Processor {
        cpu: usize,
        #[source]
        source: Box<Error>,
    },

    #[error("malformed packet: {0}")]
    Malformed(&'static str),
}

impl Error {
    /// Transport failures end the session; everything else is reported to
    /// the debugger and the session continues.
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Disconnected)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
