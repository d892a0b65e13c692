//! Run an action once on every processor.

use std::sync::{Arc, Barrier};

use parking_lot::Mutex;
use tracing::{debug, warn};

use rtdbg_target::{Kernel, KernelError};

use crate::config::HELPER_TASK;
use crate::threads::AgentTasks;
use crate::{Error, Result};

/// Call `action(cpu)` for each processor, on that processor.
///
/// A helper task pins itself to each processor in turn and runs the action
/// there. The helper is listed in `agents` while it runs, so snapshots leave
/// it alone. The caller blocks until the helper is done. The first failure
/// stops the walk and is returned.
pub fn run_across_processors<F>(
    kernel: &Arc<dyn Kernel>,
    agents: &AgentTasks,
    priority: u32,
    action: F,
) -> Result<()>
where
    F: Fn(usize) -> Result<()> + Send + 'static,
{
    let processors = kernel.processors();
    let barrier = Arc::new(Barrier::new(2));
    let outcome = Arc::new(Mutex::new(Ok(())));

    let entry = {
        let kernel = Arc::clone(kernel);
        let barrier = Arc::clone(&barrier);
        let outcome = Arc::clone(&outcome);
        Box::new(move || {
            let result = kernel
                .current_task()
                .ok_or(Error::NoCurrentTask)
                .and_then(|id| {
                    (0..processors).try_for_each(|cpu| {
                        kernel
                            .set_affinity(id, cpu)
                            .map_err(Error::from)
                            .and_then(|()| action(cpu))
                            .map_err(|err| Error::Processor {
                                cpu,
                                source: Box::new(err),
                            })
                    })
                });
            *outcome.lock() = result;
            barrier.wait();
        })
    };

    let id = agents.spawn(&**kernel, HELPER_TASK, priority, entry)?;
    barrier.wait();

    match kernel.delete(id) {
        Ok(()) | Err(KernelError::NotFound(_)) => {}
        Err(err) => warn!(task = %id, %err, "helper task not deleted"),
    }
    agents.remove(id);

    let result = std::mem::replace(&mut *outcome.lock(), Ok(()));
    debug!(processors, ok = result.is_ok(), "ran across processors");
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtdbg_sim::{Machine, MachineConfig, SimKernel};

    fn kernel(cpus: usize) -> Arc<dyn Kernel> {
        let machine = Machine::new(MachineConfig {
            cpus,
            ..MachineConfig::default()
        });
        Arc::new(SimKernel::new(machine))
    }

    #[test]
    fn test_visits_every_processor_on_that_processor() {
        let kernel = kernel(3);
        let agents = Arc::new(AgentTasks::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let record = Arc::clone(&seen);
        let current = Arc::clone(&kernel);
        let listed = Arc::clone(&agents);
        run_across_processors(&kernel, &agents, 1, move |cpu| {
            let id = current.current_task().ok_or(Error::NoCurrentTask)?;
            let info = current.task(id).ok_or(Error::ThreadNotFound(id))?;
            record.lock().push((cpu, info.name, listed.contains(id)));
            Ok(())
        })
        .unwrap();
        let seen = seen.lock();
        assert_eq!(
            seen.iter().map(|(cpu, ..)| *cpu).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert!(seen.iter().all(|(_, name, _)| name == HELPER_TASK));
        // Listed as an agent task while it ran, and no longer.
        assert!(seen.iter().all(|(.., listed)| *listed));
        assert!(agents.ids().is_empty());
    }

    #[test]
    fn test_failure_stops_the_walk() {
        let kernel = kernel(4);
        let count = Arc::new(Mutex::new(0));
        let counted = Arc::clone(&count);
        let err = run_across_processors(&kernel, &AgentTasks::new(), 1, move |cpu| {
            *counted.lock() += 1;
            if cpu == 1 {
                return Err(Error::Malformed("boom"));
            }
            Ok(())
        })
        .unwrap_err();
        assert!(matches!(err, Error::Processor { cpu: 1, .. }));
        assert_eq!(*count.lock(), 2);
        // The helper is gone.
        assert!(kernel.tasks().iter().all(|task| task.name != HELPER_TASK));
    }
}
