//! Exception frames handed to the agent from trap context.

/// Machine state captured when a task takes an exception.
///
/// `registers` uses the layout of the backend's [`RegisterTable`]. The agent
/// may rewrite it while the task is parked; the trap path restores the
/// machine state from it on return.
///
/// [`RegisterTable`]: crate::RegisterTable
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExceptionFrame {
    /// Processor the exception was taken on.
    pub cpu: usize,
    /// Architecture exception vector (cause code).
    pub vector: u32,
    /// Faulting address, if the architecture reports one.
    pub fault_address: u64,
    pub registers: Vec<u8>,
    /// Single step armed for the next resume.
    pub single_step: bool,
    pub interrupts_disabled: bool,
}

/// What the trap path does after the agent has seen an exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionOutcome {
    /// Handled; resume the task from the (possibly rewritten) frame.
    Consumed,
    /// Handled by arming a single step; resume without reporting.
    Step,
    /// Not for the agent; pass to the default fault handler.
    Cascade,
}
