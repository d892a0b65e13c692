//! The RV32 instruction subset the simulator executes.
//!
//! Programs are built from `addi`, `jal` and `ebreak`, which is enough for
//! counting loops with breakpoints in them.

/// `ebreak`.
pub const EBREAK: u32 = 0x0010_0073;

/// `addi x0, x0, 0`.
pub const NOP: u32 = addi(0, 0, 0);

/// Argument register `a0`.
pub const A0: u32 = 10;

/// Encode `addi rd, rs1, imm`.
#[allow(clippy::cast_sign_loss)]
pub const fn addi(rd: u32, rs1: u32, imm: i32) -> u32 {
    (((imm as u32) & 0xfff) << 20) | ((rs1 & 0x1f) << 15) | ((rd & 0x1f) << 7) | 0x13
}

/// Encode `jal rd, offset`.
#[allow(clippy::cast_sign_loss)]
pub const fn jal(rd: u32, offset: i32) -> u32 {
    let imm = offset as u32;
    (((imm >> 20) & 1) << 31)
        | (((imm >> 1) & 0x3ff) << 21)
        | (((imm >> 11) & 1) << 20)
        | (((imm >> 12) & 0xff) << 12)
        | ((rd & 0x1f) << 7)
        | 0x6f
}

/// A decoded instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insn {
    Addi { rd: usize, rs1: usize, imm: i32 },
    Jal { rd: usize, offset: i32 },
    Ebreak,
    Illegal(u32),
}

#[allow(clippy::cast_possible_wrap)]
pub const fn decode(word: u32) -> Insn {
    let rd = ((word >> 7) & 0x1f) as usize;
    match word & 0x7f {
        _ if word == EBREAK => Insn::Ebreak,
        0x13 if (word >> 12) & 0x7 == 0 => Insn::Addi {
            rd,
            rs1: ((word >> 15) & 0x1f) as usize,
            imm: (word as i32) >> 20,
        },
        0x6f => {
            let imm = (((word >> 31) & 1) << 20)
                | (((word >> 21) & 0x3ff) << 1)
                | (((word >> 20) & 1) << 11)
                | (((word >> 12) & 0xff) << 12);
            Insn::Jal {
                rd,
                offset: ((imm << 11) as i32) >> 11,
            }
        }
        _ => Insn::Illegal(word),
    }
}

/// Little-endian image of `words`.
pub fn assemble(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|word| word.to_le_bytes()).collect()
}

/// `a0 += 1` forever.
pub fn counter() -> Vec<u8> {
    assemble(&[addi(A0, A0, 1), jal(0, -4)])
}

/// `a0 += 1`, then `ebreak`, then loop back to the start.
pub fn counter_with_break() -> Vec<u8> {
    assemble(&[addi(A0, A0, 1), EBREAK, jal(0, -8)])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_addi() {
        assert_eq!(
            decode(addi(A0, A0, -3)),
            Insn::Addi {
                rd: 10,
                rs1: 10,
                imm: -3
            }
        );
        assert_eq!(NOP, 0x13);
    }

    #[test]
    fn test_decode_jal() {
        assert_eq!(decode(jal(0, -4)), Insn::Jal { rd: 0, offset: -4 });
        assert_eq!(decode(jal(1, 0x800)), Insn::Jal { rd: 1, offset: 0x800 });
    }

    #[test]
    fn test_decode_ebreak() {
        assert_eq!(decode(EBREAK), Insn::Ebreak);
        assert_eq!(decode(0), Insn::Illegal(0));
    }

    #[test]
    fn test_assemble() {
        assert_eq!(assemble(&[EBREAK]), [0x73, 0x00, 0x10, 0x00]);
        assert_eq!(counter().len(), 8);
    }
}
