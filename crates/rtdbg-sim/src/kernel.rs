//! Kernel primitives backed by the simulated machine.

use std::sync::Arc;

use rtdbg_target::{Kernel, KernelError, TaskEntry, TaskId, TaskInfo};

use crate::Machine;

pub struct SimKernel {
    machine: Arc<Machine>,
}

impl SimKernel {
    pub const fn new(machine: Arc<Machine>) -> Self {
        Self { machine }
    }
}

impl Kernel for SimKernel {
    fn pid(&self) -> u32 {
        self.machine.pid()
    }

    fn processors(&self) -> usize {
        self.machine.cpus()
    }

    fn tasks(&self) -> Vec<TaskInfo> {
        self.machine.task_infos()
    }

    fn system_tasks(&self) -> Vec<TaskId> {
        self.machine.system_tasks()
    }

    fn current_task(&self) -> Option<TaskId> {
        Machine::current_task()
    }

    fn suspend(&self, id: TaskId) -> Result<(), KernelError> {
        self.machine.suspend(id)
    }

    fn resume(&self, id: TaskId) -> Result<(), KernelError> {
        self.machine.resume(id)
    }

    fn spawn(&self, name: &str, priority: u32, entry: TaskEntry) -> Result<TaskId, KernelError> {
        self.machine.spawn_service(name, priority, entry)
    }

    fn delete(&self, id: TaskId) -> Result<(), KernelError> {
        self.machine.delete(id)
    }

    fn set_affinity(&self, id: TaskId, cpu: usize) -> Result<(), KernelError> {
        self.machine.set_affinity(id, cpu)
    }

    fn reset(&self) {
        self.machine.request_reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MachineConfig;

    #[test]
    fn test_affinity_bounds() {
        let machine = Machine::new(MachineConfig {
            cpus: 2,
            ..MachineConfig::default()
        });
        let kernel = SimKernel::new(Arc::clone(&machine));
        let idle = kernel.system_tasks()[0];
        assert_eq!(kernel.set_affinity(idle, 1), Ok(()));
        assert_eq!(
            kernel.set_affinity(idle, 2),
            Err(KernelError::InvalidProcessor(2))
        );
        assert_eq!(kernel.processors(), 2);
    }

    #[test]
    fn test_resume_requires_suspend() {
        let machine = Machine::new(MachineConfig::default());
        let kernel = SimKernel::new(machine);
        let idle = kernel.system_tasks()[0];
        assert_eq!(kernel.resume(idle), Err(KernelError::NotSuspended(idle)));
        kernel.suspend(idle).unwrap();
        assert!(kernel.task(idle).is_some());
        kernel.resume(idle).unwrap();
    }
}
