//! Host simulator for the rtdbg agent.
//!
//! Provides everything the agent needs from its environment without real
//! hardware: a multi-core [`Machine`] whose tasks are host threads, a
//! [`SimKernel`] over it, an [`Rv32Target`] backend and an in-memory
//! [`PipeRemote`] transport with a scripted client.

mod kernel;
mod machine;
mod pipe;
pub mod program;
mod target;

pub use kernel::SimKernel;
pub use machine::{
    FIRST_TASK, Machine, MachineConfig, REGISTER_BYTES, TrapHandler, VECTOR_BREAKPOINT,
    VECTOR_FETCH_FAULT, VECTOR_ILLEGAL,
};
pub use pipe::{CLIENT_TIMEOUT, PipeClient, PipeRemote, Reply};
pub use target::{BREAKPOINT, Rv32Target};

use std::sync::Arc;

/// A machine with its kernel and target backend.
pub struct Sim {
    pub machine: Arc<Machine>,
    pub kernel: Arc<SimKernel>,
    pub target: Arc<Rv32Target>,
}

impl Sim {
    pub fn new(config: MachineConfig) -> Self {
        let machine = Machine::new(config);
        Self {
            kernel: Arc::new(SimKernel::new(Arc::clone(&machine))),
            target: Arc::new(Rv32Target::new(Arc::clone(&machine))),
            machine,
        }
    }
}

impl Drop for Sim {
    fn drop(&mut self) {
        self.machine.halt();
    }
}
