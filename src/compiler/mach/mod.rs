//! # Mach: W16 machine instructions
//!
//! Prims are selected one at a time into [`Mach`] instructions over the
//! eight W16 registers. Stack accesses stay symbolic ([`Disp::Slot`],
//! [`Disp::Param`], [`Disp::Frame`]) until the frame is laid out; after
//! that every displacement is a number relative to the current `sp`.
//!
//! Pipeline per function:
//!
//! ```text
//! select -> frame -> (regstate -> liveness)* -> relax -> encode
//! ```

pub mod encode;
pub mod frame;
pub mod liveness;
pub mod regstate;
pub mod relax;
pub mod select;

use super::list::List;
use super::prim::{LabelId, Slot, SlotId};
use crate::error::{Result, SourceLoc};
use std::fmt;
use tracing::debug;

/// Bound on register-state/liveness alternations
const MAX_ROUNDS: usize = 16;

/// Alternates the register-state walk and dead instruction removal until
/// neither changes anything
pub fn optimize(func: &mut MachFunc) -> Result<()> {
    let before = func.code.len();
    for round in 1..=MAX_ROUNDS {
        let rewritten = regstate::run(func);
        func.code.verify()?;
        let removed = liveness::run(func);
        func.code.verify()?;
        if !rewritten && !removed {
            debug!(function = %func.label, before, after = func.code.len(), round, "machine code optimized");
            return Ok(());
        }
    }
    debug!(function = %func.label, "machine optimization stopped at round limit");
    Ok(())
}

// =============================================================================
// REGISTERS
// =============================================================================

/// W16 register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Reg {
    /// First argument/result register
    R0,
    /// Second result word
    R1,
    /// Scratch
    R2,
    /// Scratch (last register usable by `bcc`)
    R3,
    /// Indirect call target
    R4,
    /// Destination address scratch
    R5,
    /// Expansion scratch for out-of-range immediates
    R6,
    /// Stack pointer
    Sp,
}

impl Reg {
    /// Every general register, `sp` excluded
    pub const GENERAL: [Reg; 7] = [Reg::R0, Reg::R1, Reg::R2, Reg::R3, Reg::R4, Reg::R5, Reg::R6];

    /// Register number in instruction fields
    pub fn number(self) -> u16 {
        self as u16
    }

    /// Assembly name
    pub fn name(self) -> &'static str {
        match self {
            Reg::R0 => "r0",
            Reg::R1 => "r1",
            Reg::R2 => "r2",
            Reg::R3 => "r3",
            Reg::R4 => "r4",
            Reg::R5 => "r5",
            Reg::R6 => "r6",
            Reg::Sp => "sp",
        }
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Small register set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RegSet(u8);

impl RegSet {
    /// No registers
    pub const EMPTY: RegSet = RegSet(0);
    /// Registers a call may clobber
    pub const CALLER_SAVED: RegSet = RegSet(0x7f);

    /// Set of the given registers
    pub fn of(regs: &[Reg]) -> RegSet {
        regs.iter().fold(RegSet::EMPTY, |s, r| s.with(*r))
    }

    /// Adds a register
    pub fn with(self, r: Reg) -> RegSet {
        RegSet(self.0 | (1 << r.number()))
    }

    /// Membership
    pub fn contains(self, r: Reg) -> bool {
        self.0 & (1 << r.number()) != 0
    }

    /// Union
    pub fn union(self, other: RegSet) -> RegSet {
        RegSet(self.0 | other.0)
    }

    /// Difference
    pub fn minus(self, other: RegSet) -> RegSet {
        RegSet(self.0 & !other.0)
    }

    /// Whether the sets share a register
    pub fn intersects(self, other: RegSet) -> bool {
        self.0 & other.0 != 0
    }

    /// Empty set
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

// =============================================================================
// OPERANDS
// =============================================================================

/// Displacement of a load, store or `addi`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disp {
    /// Resolved value
    Num(i32),
    /// Word of a frame slot
    Slot(SlotId, i32),
    /// Incoming parameter word
    Param(i32),
    /// Frame size times the factor (prologue `-1`, epilogue `1`)
    Frame(i32),
}

impl Disp {
    /// The displacement `words` further
    pub fn plus(self, words: i32) -> Disp {
        match self {
            Disp::Num(v) => Disp::Num(v + words),
            Disp::Slot(s, o) => Disp::Slot(s, o + words),
            Disp::Param(o) => Disp::Param(o + words),
            Disp::Frame(k) => Disp::Frame(k),
        }
    }

    /// Numeric value once resolved
    pub fn value(self) -> Option<i32> {
        match self {
            Disp::Num(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for Disp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Disp::Num(v) => write!(f, "{}", v),
            Disp::Slot(s, 0) => write!(f, "{}", s),
            Disp::Slot(s, o) => write!(f, "{}{:+}", s, o),
            Disp::Param(o) => write!(f, "param{:+}", o),
            Disp::Frame(k) => write!(f, "frame*{}", k),
        }
    }
}

/// Register-register ALU operations (`fff` field)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum AluOp {
    Add,
    Sub,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Sar,
}

impl AluOp {
    /// Mnemonic
    pub fn mnemonic(self) -> &'static str {
        match self {
            AluOp::Add => "add",
            AluOp::Sub => "sub",
            AluOp::And => "and",
            AluOp::Or => "or",
            AluOp::Xor => "xor",
            AluOp::Shl => "shl",
            AluOp::Shr => "shr",
            AluOp::Sar => "sar",
        }
    }

    /// Evaluates the operation on 16-bit values
    pub fn eval(self, a: i32, b: i32) -> i32 {
        let (a16, b16) = (a as u16, b as u16);
        let r = match self {
            AluOp::Add => a16.wrapping_add(b16),
            AluOp::Sub => a16.wrapping_sub(b16),
            AluOp::And => a16 & b16,
            AluOp::Or => a16 | b16,
            AluOp::Xor => a16 ^ b16,
            AluOp::Shl => a16.checked_shl(b16 as u32 & 0xf).unwrap_or(0),
            AluOp::Shr => a16 >> (b16 & 0xf),
            AluOp::Sar => ((a16 as i16) >> (b16 & 0xf)) as u16,
        };
        r as i16 as i32
    }
}

/// Value-computing unary operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum UnOp {
    Mov,
    Neg,
    Not,
    Sxb,
    Zxb,
}

impl UnOp {
    /// Mnemonic
    pub fn mnemonic(self) -> &'static str {
        match self {
            UnOp::Mov => "mov",
            UnOp::Neg => "neg",
            UnOp::Not => "not",
            UnOp::Sxb => "sxb",
            UnOp::Zxb => "zxb",
        }
    }

    /// Evaluates the operation on a 16-bit value
    pub fn eval(self, a: i32) -> i32 {
        let a16 = a as u16;
        let r = match self {
            UnOp::Mov => a16,
            UnOp::Neg => a16.wrapping_neg(),
            UnOp::Not => !a16,
            UnOp::Sxb => a16 as u8 as i8 as i16 as u16,
            UnOp::Zxb => a16 & 0xff,
        };
        r as i16 as i32
    }
}

/// Compare-and-branch conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum BranchCond {
    Eq,
    Ne,
    Lt,
    Ge,
    Ltu,
    Geu,
}

impl BranchCond {
    /// Mnemonic
    pub fn mnemonic(self) -> &'static str {
        match self {
            BranchCond::Eq => "beq",
            BranchCond::Ne => "bne",
            BranchCond::Lt => "blt",
            BranchCond::Ge => "bge",
            BranchCond::Ltu => "bltu",
            BranchCond::Geu => "bgeu",
        }
    }

    /// The condition that holds exactly when this one does not
    pub fn negate(self) -> BranchCond {
        match self {
            BranchCond::Eq => BranchCond::Ne,
            BranchCond::Ne => BranchCond::Eq,
            BranchCond::Lt => BranchCond::Ge,
            BranchCond::Ge => BranchCond::Lt,
            BranchCond::Ltu => BranchCond::Geu,
            BranchCond::Geu => BranchCond::Ltu,
        }
    }
}

// =============================================================================
// INSTRUCTIONS
// =============================================================================

/// One machine instruction or local label
#[derive(Debug, Clone, PartialEq)]
pub enum Mach {
    /// Local label; `live_in` registers carry values in (exception handlers)
    Label {
        /// Label
        label: LabelId,
        /// Registers defined on entry
        live_in: RegSet,
    },
    /// `op rd, ra, rb`
    Alu {
        /// Operation
        op: AluOp,
        /// Destination
        rd: Reg,
        /// Left source
        ra: Reg,
        /// Right source
        rb: Reg,
    },
    /// `op rd, ra`
    Unary {
        /// Operation
        op: UnOp,
        /// Destination
        rd: Reg,
        /// Source
        ra: Reg,
    },
    /// `addi rd, ra, #imm`
    Addi {
        /// Destination
        rd: Reg,
        /// Source
        ra: Reg,
        /// Immediate
        imm: Disp,
    },
    /// Load a constant: `ldi` when it fits eight bits, `ldl` otherwise
    Ldi {
        /// Destination
        rd: Reg,
        /// Value, kept as a sign-extended 16-bit quantity
        value: i32,
    },
    /// `ldl rd, #symbol+offset`
    Ldl {
        /// Destination
        rd: Reg,
        /// Symbol
        symbol: String,
        /// Word offset
        offset: i32,
    },
    /// Address of a local label: `lea` when short, `ldl` when long
    Lea {
        /// Destination
        rd: Reg,
        /// Label
        label: LabelId,
        /// Short encoding selected
        short: bool,
    },
    /// `ld rd, disp(base)`
    Ld {
        /// Destination
        rd: Reg,
        /// Base register
        base: Reg,
        /// Displacement
        disp: Disp,
    },
    /// `st rs, disp(base)`
    St {
        /// Stored register
        rs: Reg,
        /// Base register
        base: Reg,
        /// Displacement
        disp: Disp,
    },
    /// `bcc ra, rb, target`
    Branch {
        /// Condition
        cond: BranchCond,
        /// Left register (r0-r3)
        ra: Reg,
        /// Right register (r0-r3)
        rb: Reg,
        /// Target
        target: LabelId,
        /// Short encoding selected
        short: bool,
    },
    /// `bz`/`bnz ra, target`
    BranchZ {
        /// Branch when nonzero
        nonzero: bool,
        /// Tested register
        ra: Reg,
        /// Target
        target: LabelId,
        /// Short encoding selected
        short: bool,
    },
    /// `br`/`jmp` to a local label
    Jump {
        /// Target
        target: LabelId,
        /// Short encoding selected
        short: bool,
    },
    /// `jmp symbol`
    JumpSym {
        /// Target symbol
        symbol: String,
    },
    /// `call symbol`
    Call {
        /// Target symbol
        symbol: String,
    },
    /// `callr ra`
    CallReg {
        /// Target address
        ra: Reg,
    },
    /// `jr ra`; `targets` lists the local labels it may reach
    JumpReg {
        /// Target address
        ra: Reg,
        /// Known local destinations
        targets: Vec<LabelId>,
    },
    /// `ret`; `wide` when r1 carries the high word of the result
    Ret {
        /// Result occupies r0 and r1
        wide: bool,
    },
}

impl Mach {
    /// Registers read
    pub fn reads(&self) -> RegSet {
        match self {
            Mach::Label { .. } | Mach::Ldi { .. } | Mach::Ldl { .. } | Mach::Lea { .. } | Mach::Jump { .. } => {
                RegSet::EMPTY
            }
            Mach::Alu { ra, rb, .. } | Mach::Branch { ra, rb, .. } => RegSet::of(&[*ra, *rb]),
            Mach::Unary { ra, .. } | Mach::Addi { ra, .. } | Mach::BranchZ { ra, .. } => RegSet::of(&[*ra]),
            Mach::Ld { base, .. } => RegSet::of(&[*base]),
            Mach::St { rs, base, .. } => RegSet::of(&[*rs, *base]),
            Mach::JumpSym { .. } => RegSet::CALLER_SAVED,
            Mach::Call { .. } => RegSet::of(&[Reg::R0, Reg::R1, Reg::R2]),
            Mach::CallReg { ra } => RegSet::of(&[*ra, Reg::R0, Reg::R1, Reg::R2]),
            Mach::JumpReg { ra, .. } => RegSet::of(&[*ra, Reg::R0]),
            Mach::Ret { wide: true } => RegSet::of(&[Reg::R0, Reg::R1]),
            Mach::Ret { wide: false } => RegSet::of(&[Reg::R0]),
        }
    }

    /// Registers written
    pub fn writes(&self) -> RegSet {
        match self {
            Mach::Label { live_in, .. } => *live_in,
            Mach::Alu { rd, .. }
            | Mach::Unary { rd, .. }
            | Mach::Addi { rd, .. }
            | Mach::Ldi { rd, .. }
            | Mach::Ldl { rd, .. }
            | Mach::Lea { rd, .. }
            | Mach::Ld { rd, .. } => RegSet::of(&[*rd]),
            Mach::Call { .. } | Mach::CallReg { .. } => RegSet::CALLER_SAVED,
            _ => RegSet::EMPTY,
        }
    }

    /// Whether removing the instruction when its result is dead keeps
    /// behavior
    pub fn is_removable(&self) -> bool {
        match self {
            Mach::Alu { rd, .. }
            | Mach::Unary { rd, .. }
            | Mach::Addi { rd, .. }
            | Mach::Ldi { rd, .. }
            | Mach::Ldl { rd, .. }
            | Mach::Lea { rd, .. }
            | Mach::Ld { rd, .. } => *rd != Reg::Sp,
            _ => false,
        }
    }

    /// Whether control can continue with the next instruction
    pub fn falls_through(&self) -> bool {
        !matches!(
            self,
            Mach::Jump { .. } | Mach::JumpSym { .. } | Mach::JumpReg { .. } | Mach::Ret { .. }
        )
    }

    /// Local labels control may transfer to
    pub fn successors(&self) -> Vec<LabelId> {
        match self {
            Mach::Branch { target, .. } | Mach::BranchZ { target, .. } | Mach::Jump { target, .. } => {
                vec![*target]
            }
            Mach::JumpReg { targets, .. } => targets.clone(),
            _ => Vec::new(),
        }
    }

    /// Every local label referenced, label addresses included
    pub fn label_refs(&self) -> Vec<LabelId> {
        match self {
            Mach::Lea { label, .. } => vec![*label],
            other => other.successors(),
        }
    }

    /// Label whose distance decides the encoding, for relaxable forms
    pub fn relax_target(&self) -> Option<LabelId> {
        match self {
            Mach::Branch { target, .. } | Mach::BranchZ { target, .. } | Mach::Jump { target, .. } => {
                Some(*target)
            }
            Mach::Lea { label, .. } => Some(*label),
            _ => None,
        }
    }

    /// Whether the short encoding was selected
    pub fn is_short(&self) -> bool {
        match self {
            Mach::Branch { short, .. }
            | Mach::BranchZ { short, .. }
            | Mach::Jump { short, .. }
            | Mach::Lea { short, .. } => *short,
            _ => true,
        }
    }

    /// Selects the short encoding
    pub fn set_short(&mut self) {
        if let Mach::Branch { short, .. }
        | Mach::BranchZ { short, .. }
        | Mach::Jump { short, .. }
        | Mach::Lea { short, .. } = self
        {
            *short = true;
        }
    }

    /// Size in words under the current encoding choice
    pub fn size(&self) -> u32 {
        match self {
            Mach::Label { .. } => 0,
            Mach::Ldi { value, .. } => {
                if encode::fits(*value, 8) {
                    1
                } else {
                    2
                }
            }
            Mach::Ldl { .. } | Mach::JumpSym { .. } | Mach::Call { .. } => 2,
            Mach::Lea { short, .. } | Mach::Jump { short, .. } => {
                if *short {
                    1
                } else {
                    2
                }
            }
            Mach::Branch { short, .. } | Mach::BranchZ { short, .. } => {
                if *short {
                    1
                } else {
                    3
                }
            }
            _ => 1,
        }
    }

    /// Change of the stack depth: words pushed below `sp`
    pub fn sp_effect(&self, frame: u32) -> i32 {
        match self {
            Mach::Addi {
                rd: Reg::Sp,
                ra: Reg::Sp,
                imm,
            } => match imm {
                Disp::Num(v) => -v,
                Disp::Frame(k) => -k * frame as i32,
                _ => 0,
            },
            _ => 0,
        }
    }
}

fn label_text(l: LabelId) -> String {
    l.to_string()
}

impl fmt::Display for Mach {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mach::Label { label, .. } => write!(f, "{}:", label),
            Mach::Alu { op, rd, ra, rb } => write!(f, "\t{}\t{},{},{}", op.mnemonic(), rd, ra, rb),
            Mach::Unary { op, rd, ra } => write!(f, "\t{}\t{},{}", op.mnemonic(), rd, ra),
            Mach::Addi { rd, ra, imm } => write!(f, "\taddi\t{},{},#{}", rd, ra, imm),
            Mach::Ldi { rd, value } => {
                let m = if encode::fits(*value, 8) { "ldi" } else { "ldl" };
                write!(f, "\t{}\t{},#{}", m, rd, value)
            }
            Mach::Ldl { rd, symbol, offset } => {
                if *offset == 0 {
                    write!(f, "\tldl\t{},#{}", rd, symbol)
                } else {
                    write!(f, "\tldl\t{},#{}{:+}", rd, symbol, offset)
                }
            }
            Mach::Lea { rd, label, short } => {
                if *short {
                    write!(f, "\tlea\t{},{}", rd, label_text(*label))
                } else {
                    write!(f, "\tldl\t{},#{}", rd, label_text(*label))
                }
            }
            Mach::Ld { rd, base, disp } => write!(f, "\tld\t{},{}({})", rd, disp, base),
            Mach::St { rs, base, disp } => write!(f, "\tst\t{},{}({})", rs, disp, base),
            Mach::Branch {
                cond,
                ra,
                rb,
                target,
                short,
            } => {
                if *short {
                    write!(f, "\t{}\t{},{},{}", cond.mnemonic(), ra, rb, target)
                } else {
                    write!(
                        f,
                        "\t{}\t{},{},.+3\n\tjmp\t{}",
                        cond.negate().mnemonic(),
                        ra,
                        rb,
                        target
                    )
                }
            }
            Mach::BranchZ {
                nonzero,
                ra,
                target,
                short,
            } => {
                let (m, inv) = if *nonzero { ("bnz", "bz") } else { ("bz", "bnz") };
                if *short {
                    write!(f, "\t{}\t{},{}", m, ra, target)
                } else {
                    write!(f, "\t{}\t{},.+3\n\tjmp\t{}", inv, ra, target)
                }
            }
            Mach::Jump { target, short } => {
                let m = if *short { "br" } else { "jmp" };
                write!(f, "\t{}\t{}", m, target)
            }
            Mach::JumpSym { symbol } => write!(f, "\tjmp\t{}", symbol),
            Mach::Call { symbol } => write!(f, "\tcall\t{}", symbol),
            Mach::CallReg { ra } => write!(f, "\tcallr\t{}", ra),
            Mach::JumpReg { ra, .. } => write!(f, "\tjr\t{}", ra),
            Mach::Ret { .. } => write!(f, "\tret"),
        }
    }
}

/// A function in machine form
#[derive(Debug, Clone)]
pub struct MachFunc {
    /// Assembly label
    pub label: String,
    /// Emit `.global`
    pub exported: bool,
    /// Instructions
    pub code: List<Mach>,
    /// Frame slots, shared with the Prim form
    pub slots: Vec<Slot>,
    /// Frame size in words, known after layout
    pub frame: u32,
    /// Definition site
    pub loc: SourceLoc,
}

impl MachFunc {
    /// Creates an empty function
    pub fn new(label: impl Into<String>, exported: bool, slots: Vec<Slot>, loc: SourceLoc) -> Self {
        MachFunc {
            label: label.into(),
            exported,
            code: List::new(),
            slots,
            frame: 0,
            loc,
        }
    }

    /// Adds a compiler temporary slot
    pub fn new_slot(&mut self, words: u32) -> SlotId {
        let id = SlotId(self.slots.len() as u32);
        self.slots.push(Slot {
            words: words.max(1),
            temp: true,
        });
        id
    }

    /// Instruction words under the current encoding choices
    pub fn size(&self) -> u32 {
        self.code.iter().map(|(_, m)| m.size()).sum()
    }
}

impl fmt::Display for MachFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}:", self.label)?;
        for (_, m) in self.code.iter() {
            writeln!(f, "{}", m)?;
        }
        Ok(())
    }
}
