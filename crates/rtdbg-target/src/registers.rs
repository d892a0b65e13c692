//! Register blob layout.

/// One register in the blob exchanged with the debugger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterInfo {
    pub name: &'static str,
    pub offset: usize,
    pub width: usize,
}

/// Layout of the register blob in target byte order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RegisterTable {
    registers: Vec<RegisterInfo>,
    size: usize,
}

impl RegisterTable {
    /// Build a table from `(name, width)` pairs laid out back to back.
    pub fn packed(registers: &[(&'static str, usize)]) -> Self {
        let mut offset = 0;
        let registers = registers
            .iter()
            .map(|&(name, width)| {
                let info = RegisterInfo {
                    name,
                    offset,
                    width,
                };
                offset += width;
                info
            })
            .collect();
        Self {
            registers,
            size: offset,
        }
    }

    pub fn count(&self) -> usize {
        self.registers.len()
    }

    /// Total blob size in bytes.
    pub const fn size(&self) -> usize {
        self.size
    }

    pub fn get(&self, reg: usize) -> Option<&RegisterInfo> {
        self.registers.get(reg)
    }

    /// Byte range of `reg` within the blob.
    pub fn range(&self, reg: usize) -> Option<std::ops::Range<usize>> {
        self.get(reg).map(|info| info.offset..info.offset + info.width)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packed_layout() {
        let table = RegisterTable::packed(&[("a", 4), ("b", 8), ("c", 2)]);
        assert_eq!(table.count(), 3);
        assert_eq!(table.size(), 14);
        assert_eq!(table.range(1), Some(4..12));
        assert_eq!(table.range(3), None);
    }
}
