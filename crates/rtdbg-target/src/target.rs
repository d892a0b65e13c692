//! Architecture backend interface.

use gdbstub::common::Signal;

use crate::{ExceptionFrame, RegisterTable, TargetError, TaskId};

/// Features the backend advertises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    /// Software breakpoints.
    pub swbreak: bool,
    /// Hardware breakpoints.
    pub hwbreak: bool,
    /// Hardware watchpoints.
    pub hwwatch: bool,
}

/// Hardware breakpoint and watchpoint kinds (`Z1`..`Z4`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Watchpoint {
    Break,
    Write,
    Read,
    Access,
}

impl Watchpoint {
    /// Map a `Z`/`z` type digit. `0` is a software breakpoint and not a
    /// watchpoint.
    pub const fn from_type(kind: u8) -> Option<Self> {
        match kind {
            1 => Some(Self::Break),
            2 => Some(Self::Write),
            3 => Some(Self::Read),
            4 => Some(Self::Access),
            _ => None,
        }
    }
}

/// CPU architecture backend.
///
/// Implementations use interior mutability; every method may be called from
/// the server task, the events task or a trap path.
pub trait Target: Send + Sync {
    /// Architecture name for logging.
    fn name(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    /// Layout of the register blob.
    fn register_table(&self) -> &RegisterTable;

    /// Breakpoint instruction bytes. Its length is the only accepted `Z0`
    /// kind.
    fn breakpoint(&self) -> &[u8];

    /// Hook the debug exception vectors on `cpu`.
    fn enable(&self, cpu: usize) -> Result<(), TargetError>;

    /// Unhook the debug exception vectors on `cpu`.
    fn disable(&self, cpu: usize) -> Result<(), TargetError>;

    /// Read the registers of `task` into `out`.
    ///
    /// When `frame` is given the task is parked in an exception and the
    /// registers come from the frame; otherwise they come from the task's
    /// saved context. Returns the signal the task is stopped with.
    fn read_registers(
        &self,
        task: TaskId,
        frame: Option<&ExceptionFrame>,
        out: &mut [u8],
    ) -> Result<Signal, TargetError>;

    /// Write `regs` back to the frame or the saved context.
    fn write_registers(
        &self,
        task: TaskId,
        frame: Option<&mut ExceptionFrame>,
        regs: &[u8],
    ) -> Result<(), TargetError>;

    /// Program counter from a register blob.
    fn program_counter(&self, regs: &[u8]) -> Result<u64, TargetError>;

    /// Stack pointer from a register blob.
    fn stack_pointer(&self, regs: &[u8]) -> Result<u64, TargetError>;

    /// Signal for an exception frame.
    fn classify_exception(&self, frame: &ExceptionFrame) -> Signal;

    /// Arm a single step for the task's next resume.
    fn prepare_single_step(
        &self,
        task: TaskId,
        frame: Option<&mut ExceptionFrame>,
    ) -> Result<(), TargetError>;

    /// Make modified instruction memory visible to all processors.
    fn cache_sync(&self, address: u64, length: usize) -> Result<(), TargetError>;

    /// Read memory, faulting accesses are reported as errors.
    fn read_memory(&self, address: u64, buf: &mut [u8]) -> Result<(), TargetError>;

    /// Write memory, faulting accesses are reported as errors.
    fn write_memory(&self, address: u64, data: &[u8]) -> Result<(), TargetError>;

    /// Load hardware breakpoints into the debug unit.
    fn hwbreak_insert(&self) -> Result<(), TargetError> {
        Ok(())
    }

    /// Clear hardware breakpoints from the debug unit.
    fn hwbreak_remove(&self) -> Result<(), TargetError> {
        Ok(())
    }

    /// Track or untrack a hardware breakpoint or watchpoint.
    fn hwbreak_control(
        &self,
        _kind: Watchpoint,
        _insert: bool,
        _address: u64,
        _length: u64,
    ) -> Result<(), TargetError> {
        Err(TargetError::Unsupported("hardware breakpoints"))
    }
}
