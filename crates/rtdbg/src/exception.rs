//! Exception handoff between faulting tasks and the events task.
//!
//! A task that traps into the agent parks on a [`Rendezvous`] node linked on
//! the session, wakes the events task and blocks until the resume engine
//! releases it. The frame lives in the node while the task is parked, so the
//! debugger can rewrite registers before the task continues.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, trace, warn};

use rtdbg_target::{ExceptionFrame, ExceptionOutcome, TaskId};

use crate::server::Server;

#[derive(Debug)]
struct Parked {
    frame: ExceptionFrame,
    released: bool,
}

/// A task parked in an exception.
#[derive(Debug)]
pub struct Rendezvous {
    task: TaskId,
    parked: Mutex<Parked>,
    wake: Condvar,
}

impl Rendezvous {
    pub fn new(task: TaskId, frame: ExceptionFrame) -> Self {
        Self {
            task,
            parked: Mutex::new(Parked {
                frame,
                released: false,
            }),
            wake: Condvar::new(),
        }
    }

    pub const fn task(&self) -> TaskId {
        self.task
    }

    /// Access the parked frame.
    pub fn with_frame<R>(&self, f: impl FnOnce(&mut ExceptionFrame) -> R) -> R {
        f(&mut self.parked.lock().frame)
    }

    /// Let the parked task continue.
    pub fn release(&self) {
        let mut parked = self.parked.lock();
        parked.released = true;
        self.wake.notify_all();
    }

    pub fn is_released(&self) -> bool {
        self.parked.lock().released
    }

    /// Block until released and hand the frame back.
    pub fn wait(&self) -> ExceptionFrame {
        let mut parked = self.parked.lock();
        while !parked.released {
            self.wake.wait(&mut parked);
        }
        std::mem::take(&mut parked.frame)
    }
}

/// Trap entry point.
///
/// Install this as the kernel's debug exception hook. Without a running
/// session the exception is cascaded to the default fault handler.
pub fn handle(frame: &mut ExceptionFrame) -> ExceptionOutcome {
    match crate::server() {
        Ok(server) => server.exception(frame),
        Err(_) => ExceptionOutcome::Cascade,
    }
}

impl Server {
    /// Hand an exception taken by the current task to the debugger.
    pub fn exception(&self, frame: &mut ExceptionFrame) -> ExceptionOutcome {
        let Some(task) = self.kernel.current_task() else {
            warn!(vector = frame.vector, "exception outside a task");
            return ExceptionOutcome::Cascade;
        };

        // Checked before taking the session lock, which a faulting agent
        // task may be holding.
        if self.agents.contains(task) {
            error!(
                task = %task,
                vector = frame.vector,
                pc = ?self.target.program_counter(&frame.registers).ok(),
                "exception in the debug agent"
            );
            self.crash();
            return ExceptionOutcome::Cascade;
        }

        let mut session = self.state.lock();
        if !session.events.running {
            warn!(task = %task, vector = frame.vector, "exception with no events task");
            return ExceptionOutcome::Cascade;
        }

        if self.kernel.system_tasks().contains(&task) {
            debug!(task = %task, vector = frame.vector, "exception in a system task");
            return ExceptionOutcome::Cascade;
        }

        if let Some(stepper) = session.threads.stepper(task) {
            match self.target.program_counter(&frame.registers) {
                Ok(pc) if stepper.contains(pc) => {
                    trace!(task = %task, pc = format_args!("{pc:#x}"), "range step");
                    return match self.target.prepare_single_step(task, Some(frame)) {
                        Ok(()) => ExceptionOutcome::Step,
                        Err(err) => {
                            warn!(task = %task, %err, "range step failed");
                            ExceptionOutcome::Cascade
                        }
                    };
                }
                Ok(_) => {}
                Err(err) => warn!(task = %task, %err, "range step pc unreadable"),
            }
            session.threads.remove_stepper(task);
        }

        let node = Arc::new(Rendezvous::new(task, std::mem::take(frame)));
        session.exceptions.push(Arc::clone(&node));
        session.events.pending = true;
        self.events.notify_all();
        debug!(task = %task, "task parked");
        drop(session);

        *frame = node.wait();
        debug!(task = %task, "task released");
        ExceptionOutcome::Consumed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    use rtdbg_sim::{MachineConfig, PipeRemote, Sim};
    use rtdbg_target::{Kernel, Remote, Target};

    use crate::StartOptions;

    #[test]
    fn test_release_hands_back_rewritten_frame() {
        let frame = ExceptionFrame {
            vector: 3,
            registers: vec![0; 8],
            ..ExceptionFrame::default()
        };
        let node = Arc::new(Rendezvous::new(TaskId(7), frame));
        let parked = Arc::clone(&node);
        let waiter = thread::spawn(move || parked.wait());

        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());
        node.with_frame(|frame| frame.registers[0] = 0xaa);
        node.release();

        let frame = waiter.join().unwrap();
        assert_eq!(frame.registers[0], 0xaa);
        assert_eq!(frame.vector, 3);
        assert!(node.is_released());
    }

    #[test]
    fn test_agent_fault_under_session_lock_cascades() {
        let sim = Sim::new(MachineConfig::default());
        let remote: Arc<dyn Remote> = PipeRemote::new();
        let target: Arc<dyn Target> = sim.target.clone();
        let kernel: Arc<dyn Kernel> = sim.kernel.clone();
        let server = Arc::new(Server::new(StartOptions::default(), remote, target, kernel));

        let (tx, rx) = mpsc::channel();
        let faulting = Arc::clone(&server);
        let id = server
            .agents()
            .spawn(
                &*sim.kernel,
                "TAGT",
                1,
                Box::new(move || {
                    let session = faulting.session();
                    let mut frame = ExceptionFrame::default();
                    let outcome = faulting.exception(&mut frame);
                    drop(session);
                    tx.send(outcome).unwrap();
                }),
            )
            .unwrap();

        let outcome = rx.recv_timeout(Duration::from_secs(3)).unwrap();
        assert_eq!(outcome, ExceptionOutcome::Cascade);
        assert!(server.agents().contains(id));
    }

    #[test]
    fn test_handle_without_session_cascades() {
        let mut frame = ExceptionFrame::default();
        // No test in this crate starts the global session.
        assert_eq!(handle(&mut frame), ExceptionOutcome::Cascade);
    }
}
