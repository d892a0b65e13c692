//! RV32 target backend for the simulated machine.

use std::sync::Arc;

use rtdbg_target::{
    Capabilities, ExceptionFrame, RegisterTable, Signal, Target, TargetError, TaskId,
};
use tracing::trace;

use crate::Machine;
use crate::machine::{REGISTER_BYTES, VECTOR_BREAKPOINT, VECTOR_FETCH_FAULT, VECTOR_ILLEGAL};

/// `ebreak`, little endian.
pub const BREAKPOINT: [u8; 4] = [0x73, 0x00, 0x10, 0x00];

const PC_OFFSET: usize = 32 * 4;
const SP_OFFSET: usize = 2 * 4;

const REGISTER_NAMES: [&str; 33] = [
    "zero", "ra", "sp", "gp", "tp", "t0", "t1", "t2", "s0", "s1", "a0", "a1", "a2", "a3", "a4",
    "a5", "a6", "a7", "s2", "s3", "s4", "s5", "s6", "s7", "s8", "s9", "s10", "s11", "t3", "t4",
    "t5", "t6", "pc",
];

pub struct Rv32Target {
    machine: Arc<Machine>,
    table: RegisterTable,
}

impl Rv32Target {
    pub fn new(machine: Arc<Machine>) -> Self {
        let layout: Vec<(&'static str, usize)> =
            REGISTER_NAMES.iter().map(|&name| (name, 4)).collect();
        Self {
            machine,
            table: RegisterTable::packed(&layout),
        }
    }

    fn check_processor(&self, cpu: usize) -> Result<(), TargetError> {
        // Vector hooks are per processor, so the caller must be pinned to it.
        if cpu >= self.machine.cpus() || self.machine.current_cpu() != Some(cpu) {
            return Err(TargetError::InvalidProcessor(cpu));
        }
        Ok(())
    }
}

fn word(regs: &[u8], offset: usize) -> Result<u64, TargetError> {
    regs.get(offset..offset + 4)
        .and_then(|bytes| bytes.try_into().ok())
        .map(|bytes| u64::from(u32::from_le_bytes(bytes)))
        .ok_or(TargetError::RegisterSize {
            expected: REGISTER_BYTES,
            actual: regs.len(),
        })
}

impl Target for Rv32Target {
    fn name(&self) -> &str {
        "rv32"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            swbreak: true,
            hwbreak: false,
            hwwatch: false,
        }
    }

    fn register_table(&self) -> &RegisterTable {
        &self.table
    }

    fn breakpoint(&self) -> &[u8] {
        &BREAKPOINT
    }

    fn enable(&self, cpu: usize) -> Result<(), TargetError> {
        self.check_processor(cpu)?;
        self.machine.enable_cpu(cpu);
        Ok(())
    }

    fn disable(&self, cpu: usize) -> Result<(), TargetError> {
        self.check_processor(cpu)?;
        self.machine.disable_cpu(cpu);
        Ok(())
    }

    fn read_registers(
        &self,
        task: TaskId,
        frame: Option<&ExceptionFrame>,
        out: &mut [u8],
    ) -> Result<Signal, TargetError> {
        if out.len() < REGISTER_BYTES {
            return Err(TargetError::RegisterSize {
                expected: REGISTER_BYTES,
                actual: out.len(),
            });
        }
        let (blob, signal) = match frame {
            Some(frame) => (frame.registers.clone(), self.classify_exception(frame)),
            None => (
                self.machine
                    .registers(task)
                    .ok_or(TargetError::TaskNotFound(task))?,
                Signal(0),
            ),
        };
        let regs = blob
            .get(..REGISTER_BYTES)
            .ok_or(TargetError::RegisterSize {
                expected: REGISTER_BYTES,
                actual: blob.len(),
            })?;
        out[..REGISTER_BYTES].copy_from_slice(regs);
        Ok(signal)
    }

    fn write_registers(
        &self,
        task: TaskId,
        frame: Option<&mut ExceptionFrame>,
        regs: &[u8],
    ) -> Result<(), TargetError> {
        if regs.len() < REGISTER_BYTES {
            return Err(TargetError::RegisterSize {
                expected: REGISTER_BYTES,
                actual: regs.len(),
            });
        }
        match frame {
            Some(frame) => {
                frame.registers = regs[..REGISTER_BYTES].to_vec();
                Ok(())
            }
            None => self.machine.set_registers(task, regs),
        }
    }

    fn program_counter(&self, regs: &[u8]) -> Result<u64, TargetError> {
        word(regs, PC_OFFSET)
    }

    fn stack_pointer(&self, regs: &[u8]) -> Result<u64, TargetError> {
        word(regs, SP_OFFSET)
    }

    fn classify_exception(&self, frame: &ExceptionFrame) -> Signal {
        match frame.vector {
            VECTOR_BREAKPOINT => Signal::SIGTRAP,
            VECTOR_ILLEGAL => Signal::SIGILL,
            VECTOR_FETCH_FAULT | 5 | 7 | 12 | 13 | 15 => Signal::SIGSEGV,
            4 | 6 => Signal::SIGBUS,
            _ => Signal::SIGHUP,
        }
    }

    fn prepare_single_step(
        &self,
        task: TaskId,
        frame: Option<&mut ExceptionFrame>,
    ) -> Result<(), TargetError> {
        trace!(task = %task, "single step armed");
        match frame {
            Some(frame) => {
                frame.single_step = true;
                Ok(())
            }
            None => self.machine.arm_step(task),
        }
    }

    fn cache_sync(&self, address: u64, length: usize) -> Result<(), TargetError> {
        trace!(address = format_args!("{address:#x}"), length, "cache sync");
        self.machine.note_cache_sync(address)
    }

    fn read_memory(&self, address: u64, buf: &mut [u8]) -> Result<(), TargetError> {
        self.machine.read_memory(address, buf)
    }

    fn write_memory(&self, address: u64, data: &[u8]) -> Result<(), TargetError> {
        self.machine.write_memory(address, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MachineConfig;

    #[test]
    fn test_register_table() {
        let target = Rv32Target::new(Machine::new(MachineConfig::default()));
        let table = target.register_table();
        assert_eq!(table.count(), 33);
        assert_eq!(table.size(), REGISTER_BYTES);
        assert_eq!(table.range(32), Some(128..132));
        assert_eq!(table.get(2).map(|r| r.name), Some("sp"));
    }

    #[test]
    fn test_pc_and_sp() {
        let target = Rv32Target::new(Machine::new(MachineConfig::default()));
        let mut regs = vec![0u8; REGISTER_BYTES];
        regs[8..12].copy_from_slice(&0x8000u32.to_le_bytes());
        regs[128..132].copy_from_slice(&0x1004u32.to_le_bytes());
        assert_eq!(target.program_counter(&regs), Ok(0x1004));
        assert_eq!(target.stack_pointer(&regs), Ok(0x8000));
        assert!(matches!(
            target.program_counter(&[]),
            Err(TargetError::RegisterSize { actual: 0, .. })
        ));
    }

    #[test]
    fn test_classify() {
        let target = Rv32Target::new(Machine::new(MachineConfig::default()));
        let mut frame = ExceptionFrame {
            vector: VECTOR_BREAKPOINT,
            ..ExceptionFrame::default()
        };
        assert_eq!(target.classify_exception(&frame), Signal::SIGTRAP);
        frame.vector = VECTOR_ILLEGAL;
        assert_eq!(target.classify_exception(&frame), Signal::SIGILL);
        frame.vector = 5;
        assert_eq!(target.classify_exception(&frame), Signal::SIGSEGV);
        frame.vector = 6;
        assert_eq!(target.classify_exception(&frame), Signal::SIGBUS);
    }

    #[test]
    fn test_frame_registers_round_trip() {
        let target = Rv32Target::new(Machine::new(MachineConfig::default()));
        let mut frame = ExceptionFrame {
            vector: VECTOR_BREAKPOINT,
            registers: vec![0; REGISTER_BYTES],
            ..ExceptionFrame::default()
        };
        let mut regs = vec![0u8; REGISTER_BYTES];
        regs[40..44].copy_from_slice(&7u32.to_le_bytes());
        target
            .write_registers(TaskId(1), Some(&mut frame), &regs)
            .unwrap();

        let mut out = vec![0u8; REGISTER_BYTES];
        let signal = target
            .read_registers(TaskId(1), Some(&frame), &mut out)
            .unwrap();
        assert_eq!(signal, Signal::SIGTRAP);
        assert_eq!(out, regs);
    }

    #[test]
    fn test_enable_requires_pinning() {
        let target = Rv32Target::new(Machine::new(MachineConfig::default()));
        // The test thread is not a task of the machine.
        assert_eq!(target.enable(0), Err(TargetError::InvalidProcessor(0)));
    }
}
