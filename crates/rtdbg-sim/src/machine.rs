//! Simulated multi-core machine.
//!
//! Every task is a host thread. Program tasks interpret RV32 code from the
//! shared memory one instruction at a time and honour suspension between
//! instructions; service tasks run a Rust closure. Exceptions are delivered
//! to the installed trap handler on the faulting task's own thread, the way
//! a real kernel runs its fatal-error extension in task context.

use std::cell::Cell;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use gdbstub::arch::Registers;
use gdbstub_arch::riscv::reg::RiscvCoreRegs;
use parking_lot::{Condvar, Mutex, RwLock};
use rtdbg_target::{
    ExceptionFrame, ExceptionOutcome, KernelError, TargetError, TaskEntry, TaskId, TaskInfo,
    TaskState,
};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, warn};

use crate::program::{Insn, decode};

/// Callback the machine raises exceptions into.
pub type TrapHandler = Arc<dyn Fn(&mut ExceptionFrame) -> ExceptionOutcome + Send + Sync>;

/// Instruction fetch fault.
pub const VECTOR_FETCH_FAULT: u32 = 1;
/// Illegal instruction.
pub const VECTOR_ILLEGAL: u32 = 2;
/// Breakpoint, also used for completed single steps.
pub const VECTOR_BREAKPOINT: u32 = 3;

/// Size of the RV32 register blob (x0..x31 then pc).
pub const REGISTER_BYTES: usize = 33 * 4;

/// Id of the first task created.
pub const FIRST_TASK: u32 = 0x0a01_0001;

const IDLE_PRIORITY: u32 = 255;
const SUSPEND_POLL: Duration = Duration::from_millis(50);

thread_local! {
    static CURRENT: Cell<Option<TaskId>> = const { Cell::new(None) };
}

/// Machine parameters.
#[derive(Debug, Clone)]
pub struct MachineConfig {
    pub pid: u32,
    pub cpus: usize,
    pub memory_base: u64,
    pub memory_size: usize,
    /// Host delay between two instructions of a program task.
    pub step_delay: Duration,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            pid: 1,
            cpus: 1,
            memory_base: 0x1000,
            memory_size: 0x1_0000,
            step_delay: Duration::from_micros(200),
        }
    }
}

#[derive(Debug)]
struct SimTask {
    info: TaskInfo,
    regs: RiscvCoreRegs<u32>,
    suspended: bool,
    step: bool,
    cpu: usize,
    system: bool,
    instret: u64,
}

impl SimTask {
    fn new(id: TaskId, name: &str, priority: u32, cpu: usize) -> Self {
        let mut info = TaskInfo::new(id, name);
        info.current_priority = priority;
        info.real_priority = priority;
        Self {
            info,
            regs: RiscvCoreRegs::default(),
            suspended: false,
            step: false,
            cpu,
            system: false,
            instret: 0,
        }
    }
}

/// A trap raised by the interpreter.
#[derive(Debug, Clone, Copy)]
struct Trap {
    vector: u32,
    address: u64,
}

/// The simulated system.
pub struct Machine {
    config: MachineConfig,
    next_id: AtomicU32,
    tasks: Mutex<FxHashMap<TaskId, SimTask>>,
    changed: Condvar,
    memory: Mutex<Vec<u8>>,
    enabled: Mutex<FxHashSet<usize>>,
    cache_syncs: AtomicUsize,
    /// Writes left before memory writes fault.
    write_budget: Mutex<Option<usize>>,
    sync_faults: AtomicBool,
    reset: AtomicBool,
    halted: AtomicBool,
    trap: RwLock<Option<TrapHandler>>,
}

impl Machine {
    /// Create a machine with one idle task per processor.
    pub fn new(config: MachineConfig) -> Arc<Self> {
        let machine = Arc::new(Self {
            memory: Mutex::new(vec![0; config.memory_size]),
            next_id: AtomicU32::new(FIRST_TASK),
            tasks: Mutex::new(FxHashMap::default()),
            changed: Condvar::new(),
            enabled: Mutex::new(FxHashSet::default()),
            cache_syncs: AtomicUsize::new(0),
            write_budget: Mutex::new(None),
            sync_faults: AtomicBool::new(false),
            reset: AtomicBool::new(false),
            halted: AtomicBool::new(false),
            trap: RwLock::new(None),
            config,
        });
        {
            let mut tasks = machine.tasks.lock();
            for cpu in 0..machine.config.cpus {
                let id = machine.alloc_id();
                let mut task = SimTask::new(id, "IDLE", IDLE_PRIORITY, cpu);
                task.system = true;
                tasks.insert(id, task);
            }
        }
        machine
    }

    pub const fn pid(&self) -> u32 {
        self.config.pid
    }

    pub const fn cpus(&self) -> usize {
        self.config.cpus
    }

    fn alloc_id(&self) -> TaskId {
        TaskId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    // ========================================================================
    // Tasks
    // ========================================================================

    /// Start a task interpreting code at `entry`.
    pub fn spawn_program(
        self: &Arc<Self>,
        name: &str,
        priority: u32,
        entry: u32,
        cpu: usize,
    ) -> Result<TaskId, KernelError> {
        if cpu >= self.config.cpus {
            return Err(KernelError::InvalidProcessor(cpu));
        }
        let id = self.alloc_id();
        let mut task = SimTask::new(id, name, priority, cpu);
        task.regs.pc = entry;
        task.info.stack_size = 0x1000;
        let index = u64::from(id.0 - FIRST_TASK);
        task.info.stack_area = self.config.memory_base + (index + 1) * 0x1000;
        self.tasks.lock().insert(id, task);

        let machine = Arc::clone(self);
        self.start_thread(id, name, move || machine.run_program(id))?;
        debug!(task = %id, task_name = name, entry = format_args!("{entry:#x}"), "program started");
        Ok(id)
    }

    /// Start a task running `entry`. The task leaves the table when `entry`
    /// returns.
    pub(crate) fn spawn_service(
        self: &Arc<Self>,
        name: &str,
        priority: u32,
        entry: TaskEntry,
    ) -> Result<TaskId, KernelError> {
        let id = self.alloc_id();
        self.tasks
            .lock()
            .insert(id, SimTask::new(id, name, priority, 0));

        let machine = Arc::clone(self);
        self.start_thread(id, name, move || {
            entry();
            machine.tasks.lock().remove(&id);
            machine.changed.notify_all();
        })?;
        Ok(id)
    }

    fn start_thread(
        &self,
        id: TaskId,
        name: &str,
        body: impl FnOnce() + Send + 'static,
    ) -> Result<(), KernelError> {
        thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                CURRENT.with(|current| current.set(Some(id)));
                body();
            })
            .map(drop)
            .map_err(|err| {
                self.tasks.lock().remove(&id);
                KernelError::Spawn {
                    name: name.to_string(),
                    reason: err.to_string(),
                }
            })
    }

    /// Task table snapshot ordered by id.
    pub fn task_infos(&self) -> Vec<TaskInfo> {
        let tasks = self.tasks.lock();
        let mut infos: Vec<TaskInfo> = tasks
            .values()
            .map(|task| {
                let mut info = task.info.clone();
                if task.suspended {
                    info.state = TaskState::Suspended;
                }
                info
            })
            .collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    /// Count `id` among the kernel's own tasks.
    pub fn mark_system(&self, id: TaskId) -> Result<(), KernelError> {
        let mut tasks = self.tasks.lock();
        let task = tasks.get_mut(&id).ok_or(KernelError::NotFound(id))?;
        task.system = true;
        Ok(())
    }

    pub fn system_tasks(&self) -> Vec<TaskId> {
        let tasks = self.tasks.lock();
        let mut ids: Vec<TaskId> = tasks
            .values()
            .filter(|task| task.system)
            .map(|task| task.info.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Task running on the calling thread.
    pub fn current_task() -> Option<TaskId> {
        CURRENT.with(Cell::get)
    }

    /// Processor the calling task is pinned to.
    pub fn current_cpu(&self) -> Option<usize> {
        let id = Self::current_task()?;
        self.tasks.lock().get(&id).map(|task| task.cpu)
    }

    pub fn suspend(&self, id: TaskId) -> Result<(), KernelError> {
        let mut tasks = self.tasks.lock();
        let task = tasks.get_mut(&id).ok_or(KernelError::NotFound(id))?;
        if task.suspended {
            return Err(KernelError::AlreadySuspended(id));
        }
        task.suspended = true;
        Ok(())
    }

    pub fn resume(&self, id: TaskId) -> Result<(), KernelError> {
        let mut tasks = self.tasks.lock();
        let task = tasks.get_mut(&id).ok_or(KernelError::NotFound(id))?;
        if !task.suspended {
            return Err(KernelError::NotSuspended(id));
        }
        task.suspended = false;
        drop(tasks);
        self.changed.notify_all();
        Ok(())
    }

    pub fn delete(&self, id: TaskId) -> Result<(), KernelError> {
        self.tasks
            .lock()
            .remove(&id)
            .map(drop)
            .ok_or(KernelError::NotFound(id))?;
        self.changed.notify_all();
        Ok(())
    }

    pub fn set_affinity(&self, id: TaskId, cpu: usize) -> Result<(), KernelError> {
        if cpu >= self.config.cpus {
            return Err(KernelError::InvalidProcessor(cpu));
        }
        let mut tasks = self.tasks.lock();
        let task = tasks.get_mut(&id).ok_or(KernelError::NotFound(id))?;
        task.cpu = cpu;
        Ok(())
    }

    pub fn is_suspended(&self, id: TaskId) -> bool {
        self.tasks.lock().get(&id).is_some_and(|task| task.suspended)
    }

    /// Instructions retired by a program task.
    pub fn instret(&self, id: TaskId) -> Option<u64> {
        self.tasks.lock().get(&id).map(|task| task.instret)
    }

    /// One general register of a task's saved context.
    pub fn register(&self, id: TaskId, reg: usize) -> Option<u32> {
        let tasks = self.tasks.lock();
        let task = tasks.get(&id)?;
        if reg == 32 {
            Some(task.regs.pc)
        } else {
            task.regs.x.get(reg).copied()
        }
    }

    pub(crate) fn registers(&self, id: TaskId) -> Option<Vec<u8>> {
        self.tasks
            .lock()
            .get(&id)
            .map(|task| encode_registers(&task.regs))
    }

    pub(crate) fn set_registers(&self, id: TaskId, blob: &[u8]) -> Result<(), TargetError> {
        let regs = decode_registers(blob)?;
        let mut tasks = self.tasks.lock();
        let task = tasks.get_mut(&id).ok_or(TargetError::TaskNotFound(id))?;
        task.regs = regs;
        Ok(())
    }

    pub(crate) fn arm_step(&self, id: TaskId) -> Result<(), TargetError> {
        let mut tasks = self.tasks.lock();
        let task = tasks.get_mut(&id).ok_or(TargetError::TaskNotFound(id))?;
        task.step = true;
        Ok(())
    }

    // ========================================================================
    // Memory
    // ========================================================================

    fn range(&self, address: u64, len: usize) -> Option<std::ops::Range<usize>> {
        let offset = usize::try_from(address.checked_sub(self.config.memory_base)?).ok()?;
        let end = offset.checked_add(len)?;
        (end <= self.config.memory_size).then_some(offset..end)
    }

    pub fn read_memory(&self, address: u64, buf: &mut [u8]) -> Result<(), TargetError> {
        let range = self
            .range(address, buf.len())
            .ok_or(TargetError::MemoryFault { address })?;
        buf.copy_from_slice(&self.memory.lock()[range]);
        Ok(())
    }

    pub fn write_memory(&self, address: u64, data: &[u8]) -> Result<(), TargetError> {
        let range = self
            .range(address, data.len())
            .ok_or(TargetError::MemoryFault { address })?;
        if let Some(budget) = self.write_budget.lock().as_mut() {
            if *budget == 0 {
                return Err(TargetError::MemoryFault { address });
            }
            *budget -= 1;
        }
        self.memory.lock()[range].copy_from_slice(data);
        Ok(())
    }

    /// Let `writes` more memory writes succeed and fault the ones after.
    /// `None` lifts the limit.
    pub fn limit_writes(&self, writes: Option<usize>) {
        *self.write_budget.lock() = writes;
    }

    /// Load an image, for example from [`crate::program`].
    pub fn load(&self, address: u64, image: &[u8]) -> Result<(), TargetError> {
        self.write_memory(address, image)
    }

    // ========================================================================
    // Debug unit and system control
    // ========================================================================

    pub(crate) fn enable_cpu(&self, cpu: usize) {
        self.enabled.lock().insert(cpu);
    }

    pub(crate) fn disable_cpu(&self, cpu: usize) {
        self.enabled.lock().remove(&cpu);
    }

    /// Processors with debug exceptions hooked, sorted.
    pub fn enabled_cpus(&self) -> Vec<usize> {
        let mut cpus: Vec<usize> = self.enabled.lock().iter().copied().collect();
        cpus.sort_unstable();
        cpus
    }

    pub(crate) fn note_cache_sync(&self, address: u64) -> Result<(), TargetError> {
        if self.sync_faults.load(Ordering::Relaxed) {
            return Err(TargetError::MemoryFault { address });
        }
        self.cache_syncs.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Make cache syncs fail.
    pub fn fail_cache_sync(&self, fail: bool) {
        self.sync_faults.store(fail, Ordering::Relaxed);
    }

    pub fn cache_syncs(&self) -> usize {
        self.cache_syncs.load(Ordering::Relaxed)
    }

    pub(crate) fn request_reset(&self) {
        warn!("system reset requested");
        self.reset.store(true, Ordering::SeqCst);
        self.changed.notify_all();
    }

    pub fn reset_requested(&self) -> bool {
        self.reset.load(Ordering::SeqCst)
    }

    pub fn set_trap_handler(&self, handler: TrapHandler) {
        *self.trap.write() = Some(handler);
    }

    /// Stop all program tasks.
    pub fn halt(&self) {
        self.halted.store(true, Ordering::SeqCst);
        self.changed.notify_all();
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    // ========================================================================
    // Interpreter
    // ========================================================================

    fn run_program(&self, id: TaskId) {
        loop {
            let trap = {
                let mut tasks = self.tasks.lock();
                loop {
                    if self.is_halted() {
                        return;
                    }
                    match tasks.get(&id) {
                        None => return,
                        Some(task) if task.info.state == TaskState::Dormant => return,
                        Some(task) if !task.suspended => break,
                        Some(_) => {
                            self.changed.wait_for(&mut tasks, SUSPEND_POLL);
                        }
                    }
                }
                let Some(task) = tasks.get_mut(&id) else {
                    return;
                };
                self.execute(task)
            };
            if let Some(trap) = trap {
                if !self.take_trap(id, trap) {
                    return;
                }
            }
            thread::sleep(self.config.step_delay);
        }
    }

    fn execute(&self, task: &mut SimTask) -> Option<Trap> {
        let pc = task.regs.pc;
        let mut word = [0u8; 4];
        if self.read_memory(u64::from(pc), &mut word).is_err() {
            return Some(Trap {
                vector: VECTOR_FETCH_FAULT,
                address: u64::from(pc),
            });
        }
        match decode(u32::from_le_bytes(word)) {
            Insn::Ebreak => {
                return Some(Trap {
                    vector: VECTOR_BREAKPOINT,
                    address: u64::from(pc),
                });
            }
            Insn::Illegal(_) => {
                return Some(Trap {
                    vector: VECTOR_ILLEGAL,
                    address: u64::from(pc),
                });
            }
            Insn::Addi { rd, rs1, imm } => {
                #[allow(clippy::cast_sign_loss)]
                let value = task.regs.x[rs1].wrapping_add(imm as u32);
                if rd != 0 {
                    task.regs.x[rd] = value;
                }
                task.regs.pc = pc.wrapping_add(4);
            }
            Insn::Jal { rd, offset } => {
                if rd != 0 {
                    task.regs.x[rd] = pc.wrapping_add(4);
                }
                task.regs.pc = pc.wrapping_add_signed(offset);
            }
        }
        task.instret += 1;
        if std::mem::take(&mut task.step) {
            return Some(Trap {
                vector: VECTOR_BREAKPOINT,
                address: u64::from(task.regs.pc),
            });
        }
        None
    }

    /// Deliver a trap. Returns false if the task was terminated.
    fn take_trap(&self, id: TaskId, trap: Trap) -> bool {
        let mut frame = {
            let tasks = self.tasks.lock();
            let Some(task) = tasks.get(&id) else {
                return false;
            };
            ExceptionFrame {
                cpu: task.cpu,
                vector: trap.vector,
                fault_address: trap.address,
                registers: encode_registers(&task.regs),
                single_step: false,
                interrupts_disabled: false,
            }
        };

        let handler = self.trap.read().clone();
        let outcome = handler.map_or(ExceptionOutcome::Cascade, |handler| handler(&mut frame));

        let mut tasks = self.tasks.lock();
        let Some(task) = tasks.get_mut(&id) else {
            return false;
        };
        match outcome {
            ExceptionOutcome::Consumed | ExceptionOutcome::Step => {
                match decode_registers(&frame.registers) {
                    Ok(regs) => task.regs = regs,
                    Err(err) => warn!(task = %id, %err, "exception frame rejected"),
                }
                task.step = frame.single_step;
                true
            }
            ExceptionOutcome::Cascade => {
                warn!(
                    task = %id,
                    vector = trap.vector,
                    address = format_args!("{:#x}", trap.address),
                    "unhandled exception, task terminated"
                );
                task.info.state = TaskState::Dormant;
                false
            }
        }
    }
}

pub(crate) fn encode_registers(regs: &RiscvCoreRegs<u32>) -> Vec<u8> {
    let mut out = Vec::with_capacity(REGISTER_BYTES);
    regs.gdb_serialize(|byte| out.push(byte.unwrap_or(0)));
    out
}

pub(crate) fn decode_registers(blob: &[u8]) -> Result<RiscvCoreRegs<u32>, TargetError> {
    if blob.len() < REGISTER_BYTES {
        return Err(TargetError::RegisterSize {
            expected: REGISTER_BYTES,
            actual: blob.len(),
        });
    }
    let mut regs = RiscvCoreRegs::default();
    regs.gdb_deserialize(&blob[..REGISTER_BYTES])
        .map_err(|()| TargetError::RegisterSize {
            expected: REGISTER_BYTES,
            actual: blob.len(),
        })?;
    Ok(regs)
}
