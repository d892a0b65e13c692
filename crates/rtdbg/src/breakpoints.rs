//! Software breakpoints.
//!
//! Each tracked address keeps a shadow of the code bytes the breakpoint
//! opcode replaces. Breakpoints are written into memory only while the
//! system runs and removed again for every snapshot, so the debugger always
//! reads original code.

use tracing::debug;

use rtdbg_target::Target;

use crate::block::Block;
use crate::{Error, Result};

/// Longest breakpoint opcode supported.
pub const MAX_OPCODE: usize = 16;

/// A tracked software breakpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwBreak {
    pub address: u64,
    shadow: [u8; MAX_OPCODE],
    len: usize,
}

impl SwBreak {
    /// Original code bytes.
    pub fn shadow(&self) -> &[u8] {
        &self.shadow[..self.len]
    }
}

/// The software breakpoint table.
#[derive(Debug)]
pub struct Breakpoints {
    table: Block<SwBreak>,
    installed: bool,
}

impl Default for Breakpoints {
    fn default() -> Self {
        Self::new()
    }
}

impl Breakpoints {
    pub const fn new() -> Self {
        Self {
            table: Block::new("breakpoints"),
            installed: false,
        }
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// True while the opcodes are written into memory.
    pub const fn is_installed(&self) -> bool {
        self.installed
    }

    pub fn get(&self, address: u64) -> Option<&SwBreak> {
        self.table.iter().find(|bp| bp.address == address)
    }

    /// Insert or remove the breakpoint at `address`. `kind` must equal the
    /// target's opcode length.
    pub fn control(
        &mut self,
        target: &dyn Target,
        insert: bool,
        address: u64,
        kind: u64,
    ) -> Result<()> {
        let opcode = target.breakpoint();
        if opcode.len() > MAX_OPCODE || kind != opcode.len() as u64 {
            return Err(Error::BreakpointSize {
                expected: opcode.len(),
                actual: kind,
            });
        }

        let index = self.table.iter().position(|bp| bp.address == address);
        if insert {
            if index.is_some() {
                return Ok(());
            }
            let mut bp = SwBreak {
                address,
                shadow: [0; MAX_OPCODE],
                len: opcode.len(),
            };
            target.read_memory(address, &mut bp.shadow[..bp.len])?;
            self.table.push(bp)?;
            if self.installed {
                target.write_memory(address, opcode)?;
                target.cache_sync(address, opcode.len())?;
            }
            debug!(address = format_args!("{address:#x}"), "breakpoint inserted");
        } else if let Some(index) = index {
            if self.installed {
                let bp = &self.table[index];
                target.write_memory(address, bp.shadow())?;
                target.cache_sync(address, bp.len)?;
            }
            self.table.remove(index);
            debug!(address = format_args!("{address:#x}"), "breakpoint removed");
        }
        Ok(())
    }

    /// Write the opcode at every tracked address.
    pub fn insert_all(&mut self, target: &dyn Target) -> Result<()> {
        if self.installed {
            return Ok(());
        }
        // Marked first so a partial install is undone by `remove_all`.
        self.installed = true;
        let opcode = target.breakpoint();
        for bp in self.table.iter() {
            target.write_memory(bp.address, opcode)?;
            target.cache_sync(bp.address, opcode.len())?;
        }
        Ok(())
    }

    /// Restore the shadow at every tracked address.
    ///
    /// Stays installed until every shadow is back, so a failed removal can
    /// be retried.
    pub fn remove_all(&mut self, target: &dyn Target) -> Result<()> {
        if !self.installed {
            return Ok(());
        }
        for bp in self.table.iter() {
            target.write_memory(bp.address, bp.shadow())?;
            target.cache_sync(bp.address, bp.len)?;
        }
        self.installed = false;
        Ok(())
    }

    /// Forget every breakpoint. Memory is not touched.
    pub fn clear(&mut self) {
        self.table.clear();
        self.installed = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtdbg_sim::{BREAKPOINT, MachineConfig, Sim};
    use rtdbg_target::TargetError;

    const CODE: [u8; 8] = [0x13, 0x05, 0x15, 0x00, 0x6f, 0xf0, 0xdf, 0xff];

    fn sim() -> Sim {
        let sim = Sim::new(MachineConfig::default());
        sim.machine.load(0x1000, &CODE).unwrap();
        sim
    }

    fn read(sim: &Sim, address: u64) -> [u8; 4] {
        let mut buf = [0u8; 4];
        sim.machine.read_memory(address, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_wrong_kind_rejected() {
        let sim = sim();
        let mut bps = Breakpoints::new();
        let err = bps.control(&*sim.target, true, 0x1000, 2).unwrap_err();
        assert!(matches!(
            err,
            Error::BreakpointSize {
                expected: 4,
                actual: 2
            }
        ));
        assert!(bps.is_empty());
    }

    #[test]
    fn test_duplicate_insert_collapses() {
        let sim = sim();
        let mut bps = Breakpoints::new();
        bps.control(&*sim.target, true, 0x1000, 4).unwrap();
        bps.control(&*sim.target, true, 0x1000, 4).unwrap();
        assert_eq!(bps.len(), 1);
        assert_eq!(bps.get(0x1000).map(SwBreak::shadow), Some(&CODE[..4]));
    }

    #[test]
    fn test_install_and_restore() {
        let sim = sim();
        let mut bps = Breakpoints::new();
        bps.control(&*sim.target, true, 0x1000, 4).unwrap();
        bps.control(&*sim.target, true, 0x1004, 4).unwrap();
        // Not written while removed.
        assert_eq!(read(&sim, 0x1000), CODE[..4]);

        bps.insert_all(&*sim.target).unwrap();
        bps.insert_all(&*sim.target).unwrap();
        assert_eq!(read(&sim, 0x1000), BREAKPOINT);
        assert_eq!(read(&sim, 0x1004), BREAKPOINT);
        assert_eq!(sim.machine.cache_syncs(), 2);

        bps.remove_all(&*sim.target).unwrap();
        bps.remove_all(&*sim.target).unwrap();
        assert_eq!(read(&sim, 0x1000), CODE[..4]);
        assert_eq!(read(&sim, 0x1004), CODE[4..]);
    }

    #[test]
    fn test_remove_while_installed_restores() {
        let sim = sim();
        let mut bps = Breakpoints::new();
        bps.control(&*sim.target, true, 0x1000, 4).unwrap();
        bps.insert_all(&*sim.target).unwrap();
        bps.control(&*sim.target, false, 0x1000, 4).unwrap();
        assert!(bps.is_empty());
        assert_eq!(read(&sim, 0x1000), CODE[..4]);

        // Removing an untracked address is not an error.
        bps.control(&*sim.target, false, 0x2000, 4).unwrap();
    }

    #[test]
    fn test_insert_while_installed_writes_opcode() {
        let sim = sim();
        let mut bps = Breakpoints::new();
        bps.insert_all(&*sim.target).unwrap();
        bps.control(&*sim.target, true, 0x1004, 4).unwrap();
        assert_eq!(read(&sim, 0x1004), BREAKPOINT);
        assert_eq!(bps.get(0x1004).map(SwBreak::shadow), Some(&CODE[4..]));
    }

    #[test]
    fn test_failed_restore_keeps_breakpoint() {
        let sim = sim();
        let mut bps = Breakpoints::new();
        bps.control(&*sim.target, true, 0x1000, 4).unwrap();
        bps.insert_all(&*sim.target).unwrap();

        sim.machine.limit_writes(Some(0));
        assert!(bps.control(&*sim.target, false, 0x1000, 4).is_err());
        assert_eq!(bps.get(0x1000).map(SwBreak::shadow), Some(&CODE[..4]));
        assert_eq!(read(&sim, 0x1000), BREAKPOINT);

        sim.machine.limit_writes(None);
        bps.control(&*sim.target, false, 0x1000, 4).unwrap();
        assert!(bps.is_empty());
        assert_eq!(read(&sim, 0x1000), CODE[..4]);
    }

    #[test]
    fn test_partial_remove_all_can_retry() {
        let sim = sim();
        let mut bps = Breakpoints::new();
        bps.control(&*sim.target, true, 0x1000, 4).unwrap();
        bps.control(&*sim.target, true, 0x1004, 4).unwrap();
        bps.insert_all(&*sim.target).unwrap();

        // The second restore faults.
        sim.machine.limit_writes(Some(1));
        assert!(bps.remove_all(&*sim.target).is_err());
        assert!(bps.is_installed());
        assert_eq!(read(&sim, 0x1000), CODE[..4]);
        assert_eq!(read(&sim, 0x1004), BREAKPOINT);

        sim.machine.limit_writes(None);
        bps.remove_all(&*sim.target).unwrap();
        assert!(!bps.is_installed());
        assert_eq!(read(&sim, 0x1004), CODE[4..]);
    }

    #[test]
    fn test_cache_sync_failure_reported() {
        let sim = sim();
        let mut bps = Breakpoints::new();
        bps.control(&*sim.target, true, 0x1000, 4).unwrap();
        sim.machine.fail_cache_sync(true);
        let err = bps.insert_all(&*sim.target).unwrap_err();
        assert!(matches!(err, Error::Target(TargetError::MemoryFault { address: 0x1000 })));

        sim.machine.fail_cache_sync(false);
        bps.remove_all(&*sim.target).unwrap();
        assert_eq!(read(&sim, 0x1000), CODE[..4]);
    }

    #[test]
    fn test_insert_faulting_address() {
        let sim = sim();
        let mut bps = Breakpoints::new();
        let err = bps.control(&*sim.target, true, 0x10, 4).unwrap_err();
        assert!(matches!(err, Error::Target(_)));
        assert!(bps.is_empty());
    }
}
