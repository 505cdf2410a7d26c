//! W16 instruction encoding
//!
//! Every instruction is one 16-bit word, most significant bit first, with
//! the opcode in the top nibble. `jmp`, `call` and `ldl` carry a second
//! word holding an absolute value; when that value is an address it is
//! marked for relocation.

use super::{Mach, Reg};
use crate::compiler::prim::LabelId;
use crate::error::{Error, Result};
use std::collections::HashMap;

// =============================================================================
// OPCODE TABLE
// =============================================================================

/// Mnemonic, opcode nibble and sub-code, sorted by mnemonic.
///
/// The sub-code is the `fff` field of ALU and unary forms, the `p` bit of
/// `ldi`/`lea`, the `z` bit of `bz`/`bnz`, the condition of `bcc` and the
/// `c` bit of `jmp`/`call`.
pub const MNEMONICS: &[(&str, u16, u16)] = &[
    ("add", 0, 0),
    ("addi", 2, 0),
    ("and", 0, 2),
    ("beq", 7, 0),
    ("bge", 7, 3),
    ("bgeu", 7, 5),
    ("blt", 7, 2),
    ("bltu", 7, 4),
    ("bne", 7, 1),
    ("bnz", 6, 0),
    ("br", 8, 0),
    ("bz", 6, 1),
    ("call", 9, 1),
    ("callr", 1, 6),
    ("jmp", 9, 0),
    ("jr", 1, 5),
    ("ld", 4, 0),
    ("ldi", 3, 0),
    ("ldl", 10, 0),
    ("lea", 3, 1),
    ("mov", 1, 0),
    ("neg", 1, 1),
    ("not", 1, 2),
    ("or", 0, 3),
    ("ret", 1, 7),
    ("sar", 0, 7),
    ("shl", 0, 5),
    ("shr", 0, 6),
    ("st", 5, 0),
    ("sub", 0, 1),
    ("sxb", 1, 3),
    ("xor", 0, 4),
    ("zxb", 1, 4),
];

/// Opcode nibble and sub-code of a mnemonic
pub fn lookup(mnemonic: &str) -> Option<(u16, u16)> {
    MNEMONICS
        .binary_search_by(|(name, _, _)| name.cmp(&mnemonic))
        .ok()
        .map(|i| (MNEMONICS[i].1, MNEMONICS[i].2))
}

/// Whether `v` fits a signed field of `bits` bits
pub fn fits(v: i32, bits: u32) -> bool {
    let half = 1i32 << (bits - 1);
    (-half..half).contains(&v)
}

/// Short-form field width of a relaxable instruction
pub fn short_bits(m: &Mach) -> Option<u32> {
    match m {
        Mach::Branch { .. } => Some(5),
        Mach::BranchZ { .. } | Mach::Lea { .. } => Some(8),
        Mach::Jump { .. } => Some(12),
        _ => None,
    }
}

/// One encoded word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Word {
    /// Contents; for relocated words the offset from the symbol or psect
    pub value: u16,
    /// Resolved at link time
    pub relocated: bool,
}

impl Word {
    fn plain(value: u16) -> Self {
        Word { value, relocated: false }
    }

    fn reloc(value: i32) -> Self {
        Word {
            value: value as u16,
            relocated: true,
        }
    }
}

fn op(mnemonic: &str) -> Result<(u16, u16)> {
    lookup(mnemonic).ok_or_else(|| Error::internal(format!("unknown mnemonic '{}'", mnemonic)))
}

fn r(reg: Reg) -> u16 {
    reg.number()
}

fn field(v: i32, bits: u32) -> Result<u16> {
    if !fits(v, bits) {
        return Err(Error::internal(format!("value {} does not fit {} bits", v, bits)));
    }
    Ok((v as u16) & ((1u16 << bits) - 1))
}

/// Encodes an instruction placed at `at`
///
/// `labels` maps local labels to addresses in the same address space as
/// `at`; long forms hold those addresses as relocated words.
pub fn encode(m: &Mach, at: u32, labels: &HashMap<LabelId, u32>) -> Result<Vec<Word>> {
    let target = |l: &LabelId| -> Result<i32> {
        labels
            .get(l)
            .map(|a| *a as i32)
            .ok_or_else(|| Error::internal(format!("undefined label {}", l)))
    };
    let rel = |l: &LabelId, size: u32| -> Result<i32> { Ok(target(l)? - (at + size) as i32) };

    Ok(match m {
        Mach::Label { .. } => Vec::new(),
        Mach::Alu { op: a, rd, ra, rb } => {
            let (o, f) = op(a.mnemonic())?;
            vec![Word::plain(o << 12 | r(*rd) << 9 | r(*ra) << 6 | r(*rb) << 3 | f)]
        }
        Mach::Unary { op: u, rd, ra } => {
            let (o, f) = op(u.mnemonic())?;
            vec![Word::plain(o << 12 | r(*rd) << 9 | r(*ra) << 6 | f)]
        }
        Mach::CallReg { ra } | Mach::JumpReg { ra, .. } => {
            let name = if matches!(m, Mach::CallReg { .. }) { "callr" } else { "jr" };
            let (o, f) = op(name)?;
            vec![Word::plain(o << 12 | r(*ra) << 6 | f)]
        }
        Mach::Ret { .. } => {
            let (o, f) = op("ret")?;
            vec![Word::plain(o << 12 | f)]
        }
        Mach::Addi { rd, ra, imm } => {
            let v = imm
                .value()
                .ok_or_else(|| Error::internal("unresolved stack displacement"))?;
            let (o, _) = op("addi")?;
            vec![Word::plain(o << 12 | r(*rd) << 9 | r(*ra) << 6 | field(v, 6)?)]
        }
        Mach::Ld { rd, base, disp } | Mach::St { rs: rd, base, disp } => {
            let v = disp
                .value()
                .ok_or_else(|| Error::internal("unresolved stack displacement"))?;
            let (o, _) = op(if matches!(m, Mach::Ld { .. }) { "ld" } else { "st" })?;
            vec![Word::plain(o << 12 | r(*rd) << 9 | r(*base) << 6 | field(v, 6)?)]
        }
        Mach::Ldi { rd, value } => {
            if fits(*value, 8) {
                let (o, p) = op("ldi")?;
                vec![Word::plain(o << 12 | r(*rd) << 9 | p << 8 | field(*value, 8)?)]
            } else {
                let (o, _) = op("ldl")?;
                vec![Word::plain(o << 12 | r(*rd) << 9), Word::plain(*value as u16)]
            }
        }
        Mach::Ldl { rd, offset, .. } => {
            let (o, _) = op("ldl")?;
            vec![Word::plain(o << 12 | r(*rd) << 9), Word::reloc(*offset)]
        }
        Mach::Lea { rd, label, short } => {
            if *short {
                let (o, p) = op("lea")?;
                vec![Word::plain(o << 12 | r(*rd) << 9 | p << 8 | field(rel(label, 1)?, 8)?)]
            } else {
                let (o, _) = op("ldl")?;
                vec![Word::plain(o << 12 | r(*rd) << 9), Word::reloc(target(label)?)]
            }
        }
        Mach::Branch {
            cond,
            ra,
            rb,
            target: t,
            short,
        } => {
            if r(*ra) > 3 || r(*rb) > 3 {
                return Err(Error::internal("compare-and-branch operand above r3"));
            }
            let bcc = |c: super::BranchCond, off: i32| -> Result<Word> {
                let (o, ccc) = op(c.mnemonic())?;
                Ok(Word::plain(o << 12 | ccc << 9 | r(*ra) << 7 | r(*rb) << 5 | field(off, 5)?))
            };
            if *short {
                vec![bcc(*cond, rel(t, 1)?)?]
            } else {
                let mut w = vec![bcc(cond.negate(), 2)?];
                w.extend(jump_words("jmp", target(t)?)?);
                w
            }
        }
        Mach::BranchZ {
            nonzero,
            ra,
            target: t,
            short,
        } => {
            let bz = |nz: bool, off: i32| -> Result<Word> {
                let (o, z) = op(if nz { "bnz" } else { "bz" })?;
                Ok(Word::plain(o << 12 | r(*ra) << 9 | z << 8 | field(off, 8)?))
            };
            if *short {
                vec![bz(*nonzero, rel(t, 1)?)?]
            } else {
                let mut w = vec![bz(!*nonzero, 2)?];
                w.extend(jump_words("jmp", target(t)?)?);
                w
            }
        }
        Mach::Jump { target: t, short } => {
            if *short {
                let (o, _) = op("br")?;
                vec![Word::plain(o << 12 | field(rel(t, 1)?, 12)?)]
            } else {
                jump_words("jmp", target(t)?)?
            }
        }
        Mach::JumpSym { .. } => jump_words("jmp", 0)?,
        Mach::Call { .. } => jump_words("call", 0)?,
    })
}

fn jump_words(name: &str, address: i32) -> Result<Vec<Word>> {
    let (o, c) = op(name)?;
    Ok(vec![Word::plain(o << 12 | c << 11), Word::reloc(address)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::mach::{AluOp, BranchCond, Disp};

    #[test]
    fn test_mnemonic_table_sorted() {
        assert!(MNEMONICS.windows(2).all(|w| w[0].0 < w[1].0));
        assert_eq!(lookup("sar"), Some((0, 7)));
        assert_eq!(lookup("halt"), None);
    }

    #[test]
    fn test_field_layouts() {
        let none = HashMap::new();
        let add = Mach::Alu {
            op: AluOp::Sub,
            rd: Reg::R1,
            ra: Reg::R2,
            rb: Reg::R3,
        };
        assert_eq!(encode(&add, 0, &none).unwrap(), vec![Word::plain(0b0000_001_010_011_001)]);
        let addi = Mach::Addi {
            rd: Reg::Sp,
            ra: Reg::Sp,
            imm: Disp::Num(-1),
        };
        assert_eq!(encode(&addi, 0, &none).unwrap(), vec![Word::plain(0x2000 | 7 << 9 | 7 << 6 | 0x3f)]);
        let ret = encode(&Mach::Ret { wide: false }, 0, &none).unwrap();
        assert_eq!(ret, vec![Word::plain(0x1007)]);
    }

    #[test]
    fn test_branch_offsets_relative_to_next_word() {
        let mut labels = HashMap::new();
        labels.insert(LabelId(1), 10);
        let b = Mach::Branch {
            cond: BranchCond::Ne,
            ra: Reg::R0,
            rb: Reg::R1,
            target: LabelId(1),
            short: true,
        };
        let w = encode(&b, 4, &labels).unwrap();
        assert_eq!(w[0].value & 0x1f, 5);
        assert_eq!(w[0].value >> 9 & 7, 1);
    }

    #[test]
    fn test_long_branch_is_inverted_skip_over_jmp() {
        let mut labels = HashMap::new();
        labels.insert(LabelId(1), 500);
        let b = Mach::BranchZ {
            nonzero: false,
            ra: Reg::R0,
            target: LabelId(1),
            short: false,
        };
        let w = encode(&b, 0, &labels).unwrap();
        assert_eq!(w.len(), 3);
        // bnz r0,+2
        assert_eq!(w[0], Word::plain(0x6000 | 2));
        assert_eq!(w[1], Word::plain(0x9000));
        assert_eq!(w[2], Word::reloc(500));
    }

    #[test]
    fn test_short_range_rejected_when_out_of_range() {
        let mut labels = HashMap::new();
        labels.insert(LabelId(1), 200);
        let j = Mach::Lea {
            rd: Reg::R0,
            label: LabelId(1),
            short: true,
        };
        assert!(encode(&j, 0, &labels).is_err());
    }
}
