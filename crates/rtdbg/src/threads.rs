//! Task registry and the system suspend/resume engine.
//!
//! A snapshot is the set of tasks the debugger sees while the system is
//! stopped. Taking one suspends every task that is not excluded and not
//! already parked in an exception; releasing it resumes the tasks the
//! debugger asked to run.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use rtdbg_target::{Kernel, KernelError, Signal, Target, TaskEntry, TaskId, TaskInfo};

use crate::block::Block;
use crate::breakpoints::Breakpoints;
use crate::exception::Rendezvous;
use crate::{Error, Result};

/// Per-thread state flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flags(u16);

impl Flags {
    /// Parked in an exception.
    pub const EXCEPTION: Self = Self(1 << 0);
    pub const REGS_VALID: Self = Self(1 << 1);
    /// Registers were written by the debugger.
    pub const REGS_DIRTY: Self = Self(1 << 2);
    pub const CONTINUE: Self = Self(1 << 3);
    pub const STEP: Self = Self(1 << 4);
    /// Range stepping.
    pub const STEPPING: Self = Self(1 << 5);
    pub const INTS_DISABLED: Self = Self(1 << 6);

    /// Any request to run the thread again.
    pub const RESUME: Self = Self(Self::CONTINUE.0 | Self::STEP.0 | Self::STEPPING.0);

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub const fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

/// How a snapshot thread came to be suspended in the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Suspension {
    /// Not suspended by the agent.
    None,
    /// Suspended by this snapshot.
    Fresh,
    /// Left suspended by an earlier snapshot.
    Carried,
}

/// One task of the snapshot.
#[derive(Debug)]
pub struct Thread {
    pub id: TaskId,
    pub info: TaskInfo,
    pub flags: Flags,
    pub suspension: Suspension,
    /// Rendezvous node while the task is parked in an exception.
    pub exception: Option<Arc<Rendezvous>>,
    pub registers: Block<u8>,
    pub signal: Signal,
}

impl Thread {
    fn new(info: TaskInfo, register_size: usize) -> Result<Self> {
        let mut registers = Block::new("registers");
        registers.resize(register_size, 0)?;
        Ok(Self {
            id: info.id,
            info,
            flags: Flags::default(),
            suspension: Suspension::None,
            exception: None,
            registers,
            signal: Signal(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    fn read_registers(&mut self, target: &dyn Target) -> Result<()> {
        let signal = match &self.exception {
            Some(node) => node.with_frame(|frame| {
                if frame.interrupts_disabled {
                    self.flags.insert(Flags::INTS_DISABLED);
                }
                target.read_registers(self.id, Some(frame), &mut self.registers)
            }),
            None => target.read_registers(self.id, None, &mut self.registers),
        }?;
        self.signal = signal;
        self.flags.insert(Flags::REGS_VALID);
        Ok(())
    }
}

/// A task stepping inside `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stepper {
    pub id: TaskId,
    pub start: u64,
    pub end: u64,
}

impl Stepper {
    pub const fn contains(&self, pc: u64) -> bool {
        pc >= self.start && pc < self.end
    }
}

/// Thread selected by `Hg`/`Hc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selector {
    /// `0`: the first thread.
    Any,
    /// `-1`.
    All,
    Index(usize),
    /// The last selection named an unknown thread.
    Invalid,
}

/// The agent's own tasks.
///
/// Never part of a snapshot. The list has its own lock so a trap path can
/// look a task up while the session lock is held elsewhere.
#[derive(Debug, Default)]
pub struct AgentTasks {
    ids: Mutex<Vec<TaskId>>,
}

impl AgentTasks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ids(&self) -> Vec<TaskId> {
        self.ids.lock().clone()
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.ids.lock().contains(&id)
    }

    pub fn add(&self, id: TaskId) {
        let mut ids = self.ids.lock();
        if !ids.contains(&id) {
            ids.push(id);
        }
    }

    pub fn remove(&self, id: TaskId) {
        self.ids.lock().retain(|task| *task != id);
    }

    /// Spawn an agent task. It is listed before anyone else can look it up.
    pub fn spawn(
        &self,
        kernel: &dyn Kernel,
        name: &str,
        priority: u32,
        entry: TaskEntry,
    ) -> std::result::Result<TaskId, KernelError> {
        let mut ids = self.ids.lock();
        let id = kernel.spawn(name, priority, entry)?;
        ids.push(id);
        Ok(id)
    }
}

/// What the engine needs from its surroundings.
#[derive(Clone, Copy)]
pub struct Env<'a> {
    pub target: &'a dyn Target,
    pub kernel: &'a dyn Kernel,
}

/// The task registry.
#[derive(Debug)]
pub struct Threads {
    current: Block<Thread>,
    excludes: Block<TaskId>,
    stopped: Block<TaskId>,
    steppers: Block<Stepper>,
    held: Block<TaskId>,
    /// Cursor for `qsThreadInfo` and `vStopped`.
    pub next: usize,
    pub selector_gen: Selector,
    pub selector_cont: Selector,
    signal: Signal,
    valid: bool,
}

impl Default for Threads {
    fn default() -> Self {
        Self::new()
    }
}

impl Threads {
    pub const fn new() -> Self {
        Self {
            current: Block::new("threads"),
            excludes: Block::new("excludes"),
            stopped: Block::new("stopped"),
            steppers: Block::new("steppers"),
            held: Block::new("held"),
            next: 0,
            selector_gen: Selector::Any,
            selector_cont: Selector::Any,
            signal: Signal(0),
            valid: false,
        }
    }

    /// True between a suspend and the next resume.
    pub const fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn current(&self) -> &[Thread] {
        &self.current
    }

    pub fn stopped(&self) -> &[TaskId] {
        &self.stopped
    }

    /// Stop signal of the snapshot.
    pub const fn signal(&self) -> Signal {
        self.signal
    }

    pub fn is_excluded(&self, id: TaskId) -> bool {
        self.excludes.contains(&id)
    }

    pub fn find_index(&self, tid: u64) -> Option<usize> {
        self.current.iter().position(|t| u64::from(t.id.0) == tid)
    }

    /// Resolve a selector to a snapshot index.
    pub fn selected(&self, selector: Selector) -> Result<usize> {
        if !self.valid {
            return Err(Error::NoSnapshot);
        }
        match selector {
            Selector::Any if !self.current.is_empty() => Ok(0),
            Selector::Index(index) if index < self.current.len() => Ok(index),
            _ => Err(Error::NoThreadSelected),
        }
    }

    pub fn thread_mut(&mut self, index: usize) -> Result<&mut Thread> {
        if !self.valid {
            return Err(Error::NoSnapshot);
        }
        self.current.get_mut(index).ok_or(Error::NoThreadSelected)
    }

    pub fn stepper(&self, id: TaskId) -> Option<Stepper> {
        self.steppers.iter().find(|s| s.id == id).copied()
    }

    pub fn remove_stepper(&mut self, id: TaskId) {
        self.steppers.retain(|s| s.id != id);
    }

    // ========================================================================
    // Suspend
    // ========================================================================

    /// Stop the system and take a snapshot.
    ///
    /// Does nothing if a snapshot is already valid. On failure no snapshot
    /// is kept and the tasks suspended so far are resumed.
    pub fn system_suspend(
        &mut self,
        env: Env<'_>,
        breakpoints: &mut Breakpoints,
        exceptions: &[Arc<Rendezvous>],
        agent: &AgentTasks,
    ) -> Result<()> {
        if self.valid {
            return Ok(());
        }
        breakpoints.remove_all(env.target)?;
        env.target.hwbreak_remove()?;

        if let Err(err) = self.snapshot(env, exceptions, agent) {
            warn!(%err, "system suspend failed");
            self.unwind(env);
            if let Err(err) = breakpoints.insert_all(env.target) {
                warn!(%err, "breakpoint reinstall failed");
            }
            if let Err(err) = env.target.hwbreak_insert() {
                warn!(%err, "hardware breakpoint reinstall failed");
            }
            return Err(err);
        }

        self.valid = true;
        self.next = 0;
        let first = self
            .stopped
            .first()
            .and_then(|id| self.current.iter().position(|t| t.id == *id))
            .map_or(Selector::Any, Selector::Index);
        self.selector_gen = first;
        self.selector_cont = first;
        debug!(
            threads = self.current.len(),
            stopped = self.stopped.len(),
            "system suspended"
        );
        Ok(())
    }

    fn snapshot(
        &mut self,
        env: Env<'_>,
        exceptions: &[Arc<Rendezvous>],
        agent: &AgentTasks,
    ) -> Result<()> {
        self.clear_snapshot();
        let held = self.held.take();

        let agent_ids = agent.ids();
        let system = env.kernel.system_tasks();
        self.excludes.reserve(agent_ids.len() + system.len())?;
        for &id in agent_ids.iter().chain(&system) {
            self.excludes.push(id)?;
        }

        let register_size = env.target.register_table().size();
        let tasks = env.kernel.tasks();
        self.current.reserve(tasks.len())?;
        for info in tasks {
            if self.is_excluded(info.id) {
                continue;
            }
            // Agent helpers come and go while the snapshot is taken.
            if agent.contains(info.id) {
                self.excludes.push(info.id)?;
                continue;
            }
            let id = info.id;
            let mut thread = Thread::new(info, register_size)?;
            if let Some(node) = exceptions.iter().find(|node| node.task() == id) {
                thread.flags.insert(Flags::EXCEPTION);
                thread.exception = Some(Arc::clone(node));
                self.stopped.push(id)?;
            } else {
                thread.suspension = match env.kernel.suspend(id) {
                    Ok(()) => Suspension::Fresh,
                    Err(KernelError::AlreadySuspended(_)) if held.contains(&id) => {
                        Suspension::Carried
                    }
                    Err(KernelError::AlreadySuspended(_)) => Suspension::None,
                    Err(err) => return Err(err.into()),
                };
            }
            self.current.push(thread)?;
        }

        for thread in self.current.iter_mut() {
            thread.read_registers(env.target)?;
        }

        if let Some(id) = self.stopped.first() {
            self.signal = self
                .current
                .iter()
                .find(|t| t.id == *id)
                .map_or(Signal::SIGTRAP, |t| t.signal);
        } else if let Some(first) = self.current.first_mut() {
            first.signal = Signal::SIGINT;
            self.signal = Signal::SIGINT;
            let id = first.id;
            self.stopped.push(id)?;
        }
        Ok(())
    }

    /// Undo a partial snapshot.
    fn unwind(&mut self, env: Env<'_>) {
        for thread in self.current.take() {
            match thread.suspension {
                Suspension::Fresh => {
                    if let Err(err) = env.kernel.resume(thread.id) {
                        warn!(task = %thread.id, %err, "resume after failed suspend");
                    }
                }
                Suspension::Carried => {
                    if self.held.push(thread.id).is_err() {
                        warn!(task = %thread.id, "lost track of held task");
                    }
                }
                Suspension::None => {}
            }
        }
        self.clear_snapshot();
    }

    fn clear_snapshot(&mut self) {
        self.current.clear();
        self.excludes.clear();
        self.stopped.clear();
        self.next = 0;
        self.selector_gen = Selector::Any;
        self.selector_cont = Selector::Any;
        self.signal = Signal(0);
        self.valid = false;
    }

    /// Add tasks that parked after the snapshot was taken.
    ///
    /// Returns how many were added to the stopped set.
    pub fn merge_parked(&mut self, env: Env<'_>, exceptions: &[Arc<Rendezvous>]) -> Result<usize> {
        if !self.valid {
            return Err(Error::NoSnapshot);
        }
        let mut merged = 0;
        for node in exceptions {
            let id = node.task();
            if self.is_excluded(id) {
                continue;
            }
            let index = match self.current.iter().position(|t| t.id == id) {
                Some(index) if self.current[index].exception.is_some() => continue,
                Some(index) => index,
                None => {
                    let Some(info) = env.kernel.task(id) else {
                        continue;
                    };
                    let thread = Thread::new(info, env.target.register_table().size())?;
                    self.current.push(thread)?;
                    self.current.len() - 1
                }
            };
            let thread = &mut self.current[index];
            thread.flags.insert(Flags::EXCEPTION);
            thread.exception = Some(Arc::clone(node));
            thread.read_registers(env.target)?;
            if self.stopped.is_empty() {
                self.signal = thread.signal;
            }
            self.stopped.push(id)?;
            merged += 1;
        }
        Ok(merged)
    }

    // ========================================================================
    // Resume requests
    // ========================================================================

    pub fn continue_all(&mut self) -> Result<()> {
        if !self.valid {
            return Err(Error::NoSnapshot);
        }
        for thread in self.current.iter_mut() {
            thread.flags.insert(Flags::CONTINUE);
        }
        Ok(())
    }

    pub fn continue_thread(&mut self, index: usize) -> Result<()> {
        self.thread_mut(index)?.flags.insert(Flags::CONTINUE);
        Ok(())
    }

    pub fn step(&mut self, index: usize) -> Result<()> {
        self.thread_mut(index)?.flags.insert(Flags::STEP);
        Ok(())
    }

    /// Step while the pc stays inside `[start, end)`.
    pub fn stepping(&mut self, index: usize, start: u64, end: u64) -> Result<()> {
        let thread = self.thread_mut(index)?;
        thread.flags.insert(Flags::STEPPING);
        let id = thread.id;
        let stepper = Stepper { id, start, end };
        match self.steppers.iter_mut().find(|s| s.id == id) {
            Some(existing) => *existing = stepper,
            None => self.steppers.push(stepper)?,
        }
        Ok(())
    }

    // ========================================================================
    // Resume
    // ========================================================================

    /// Let the system run again.
    ///
    /// Threads with a resume request (every thread when detaching) get their
    /// dirty registers written back and are released. The others stay
    /// stopped until a later snapshot resumes them. The snapshot is dropped.
    pub fn system_resume(
        &mut self,
        env: Env<'_>,
        breakpoints: &mut Breakpoints,
        exceptions: &mut Vec<Arc<Rendezvous>>,
        detaching: bool,
    ) -> Result<()> {
        let mut result = Ok(());
        if self.valid {
            if !detaching {
                breakpoints.insert_all(env.target)?;
                env.target.hwbreak_insert()?;
            }
            for thread in self.current.iter_mut() {
                let outcome = if !detaching && !thread.flags.intersects(Flags::RESUME) {
                    if thread.suspension == Suspension::None {
                        continue;
                    }
                    self.held.push(thread.id)
                } else {
                    Self::resume_thread(env, thread, exceptions)
                };
                if let Err(err) = outcome {
                    warn!(task = %thread.id, %err, "resume failed");
                    if result.is_ok() {
                        result = Err(err);
                    }
                }
            }
        }
        if detaching {
            self.steppers.clear();
            for node in exceptions.drain(..) {
                node.release();
            }
            for id in self.held.take() {
                if let Err(err) = env.kernel.resume(id) {
                    debug!(task = %id, %err, "held task not resumed");
                }
            }
        }
        if self.valid {
            debug!(detaching, "system resumed");
        }
        self.clear_snapshot();
        result
    }

    fn resume_thread(
        env: Env<'_>,
        thread: &mut Thread,
        exceptions: &mut Vec<Arc<Rendezvous>>,
    ) -> Result<()> {
        let dirty = thread.flags.contains(Flags::REGS_DIRTY);
        let step = thread.flags.intersects(Flags::STEP.union(Flags::STEPPING));
        match thread.exception.take() {
            Some(node) => {
                node.with_frame(|frame| -> Result<()> {
                    if dirty {
                        env.target
                            .write_registers(thread.id, Some(&mut *frame), &thread.registers)?;
                    }
                    if step {
                        env.target.prepare_single_step(thread.id, Some(frame))?;
                    }
                    Ok(())
                })?;
                exceptions.retain(|n| !Arc::ptr_eq(n, &node));
                node.release();
            }
            None => {
                if dirty {
                    env.target
                        .write_registers(thread.id, None, &thread.registers)?;
                }
                if step {
                    env.target.prepare_single_step(thread.id, None)?;
                }
            }
        }
        if thread.suspension != Suspension::None {
            match env.kernel.resume(thread.id) {
                Ok(()) | Err(KernelError::NotSuspended(_)) => {}
                Err(err) => return Err(err.into()),
            }
        }
        thread.flags.remove(Flags::RESUME.union(Flags::REGS_DIRTY));
        Ok(())
    }
}
