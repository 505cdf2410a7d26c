//! Instruction selection
//!
//! Every Prim is selected on its own: operands are loaded into `r0`-`r3`,
//! the operation runs, and the result is stored back to memory. Indirect
//! call targets go through `r4`, destination addresses through `r5`; `r6`
//! is left to frame layout for out-of-range displacements.
//!
//! Long, float and double arithmetic and all multiplication and division
//! go through the runtime helpers.

use super::{AluOp, BranchCond, Disp, Mach, MachFunc, Reg, RegSet, UnOp as MUnOp};
use crate::compiler::prim::{Base, CallTarget, Cond, LabelId, Operand, Place, Prim, PrimFunc, Repr, UnOp};
use crate::error::{Error, Result, SourceLoc};
use crate::parser::BinaryOp;
use tracing::debug;

/// Global holding the innermost exception record
pub const TRYMARK: &str = "__trymark";

/// Largest block copied inline
const INLINE_BLOCK_WORDS: u32 = 4;

/// Selects machine instructions for a lowered function
pub fn select(func: &PrimFunc) -> Result<MachFunc> {
    let _span = tracing::debug_span!("select", function = %func.label).entered();
    let mut sel = Selector {
        out: MachFunc::new(func.label.clone(), func.exported, func.slots.clone(), func.loc.clone()),
        loc: None,
    };
    for (id, prim) in func.prims.iter() {
        sel.loc = func.prims.loc(id).cloned();
        sel.prim(prim)?;
    }
    debug!(prims = func.prims.len(), instructions = sel.out.code.len(), "selected");
    Ok(sel.out)
}

struct Selector {
    out: MachFunc,
    loc: Option<SourceLoc>,
}

/// Word `i` of a constant operand
fn imm_word(op: &Operand, repr: Repr, i: u32) -> Option<i32> {
    let bits: u64 = match (op, repr) {
        (Operand::Imm(v), _) => *v as u64,
        (Operand::Float(f), Repr::Float) => (*f as f32).to_bits() as u64,
        (Operand::Float(f), _) => f.to_bits(),
        _ => return None,
    };
    let shift = 16 * i;
    let w = if shift >= 64 { 0 } else { (bits >> shift) & 0xffff };
    Some(w as u16 as i16 as i32)
}

fn helper_op(op: BinaryOp) -> Result<&'static str> {
    Ok(match op {
        BinaryOp::Add => "add",
        BinaryOp::Sub => "sub",
        BinaryOp::Mul => "mul",
        BinaryOp::Div => "div",
        BinaryOp::Mod => "mod",
        BinaryOp::And => "and",
        BinaryOp::Or => "or",
        BinaryOp::Xor => "xor",
        BinaryOp::Shl => "shl",
        BinaryOp::Shr => "shr",
        other => {
            return Err(Error::internal(format!(
                "comparison '{}' reached arithmetic selection",
                other.as_str()
            )))
        }
    })
}

/// Branch condition and operand order for `lhs cond rhs`
fn branch_cond(cond: Cond, signed: bool) -> (BranchCond, bool) {
    let (lt, ge) = if signed {
        (BranchCond::Lt, BranchCond::Ge)
    } else {
        (BranchCond::Ltu, BranchCond::Geu)
    };
    match cond {
        Cond::Eq => (BranchCond::Eq, false),
        Cond::Ne => (BranchCond::Ne, false),
        Cond::Lt => (lt, false),
        Cond::Ge => (ge, false),
        Cond::Gt => (lt, true),
        Cond::Le => (ge, true),
    }
}

impl Selector {
    fn emit(&mut self, m: Mach) {
        self.out.code.push_back(m, self.loc.clone());
    }

    fn ldi(&mut self, rd: Reg, value: i32) {
        self.emit(Mach::Ldi { rd, value });
    }

    fn call(&mut self, symbol: impl Into<String>) {
        self.emit(Mach::Call { symbol: symbol.into() });
    }

    // =========================================================================
    // OPERAND ACCESS
    // =========================================================================

    /// Base register and displacement of a place; `scratch` holds the base
    /// when it must be computed
    fn place_access(&mut self, place: &Place, scratch: Reg) -> Result<(Reg, Disp)> {
        Ok(match place {
            Place::Slot(s, o) => (Reg::Sp, Disp::Slot(*s, *o)),
            Place::Param(o) => (Reg::Sp, Disp::Param(*o)),
            Place::Arg(i) => (Reg::Sp, Disp::Num(*i as i32)),
            Place::Global(label, o) => {
                self.emit(Mach::Ldl {
                    rd: scratch,
                    symbol: label.clone(),
                    offset: *o,
                });
                (scratch, Disp::Num(0))
            }
            Place::Indirect(addr, o) => {
                self.load_word(addr, Repr::Word { signed: false }, 0, scratch)?;
                (scratch, Disp::Num(*o))
            }
        })
    }

    /// Loads word `i` of an operand into `reg`, touching no other register
    fn load_word(&mut self, op: &Operand, repr: Repr, i: u32, reg: Reg) -> Result<()> {
        if let Some(v) = imm_word(op, repr, i) {
            self.ldi(reg, v);
            return Ok(());
        }
        match op {
            Operand::Addr(base, off) => {
                if i != 0 {
                    return Err(Error::internal("multi-word address operand"));
                }
                self.address_of_base(base, *off, reg);
            }
            Operand::Load(place) => {
                let (base, disp) = self.place_access(place, reg)?;
                self.emit(Mach::Ld {
                    rd: reg,
                    base,
                    disp: disp.plus(i as i32),
                });
            }
            Operand::Imm(_) | Operand::Float(_) => {}
        }
        Ok(())
    }

    fn address_of_base(&mut self, base: &Base, off: i32, reg: Reg) {
        match base {
            Base::Slot(s) => self.emit(Mach::Addi {
                rd: reg,
                ra: Reg::Sp,
                imm: Disp::Slot(*s, off),
            }),
            Base::Param => self.emit(Mach::Addi {
                rd: reg,
                ra: Reg::Sp,
                imm: Disp::Param(off),
            }),
            Base::Global(label) => self.emit(Mach::Ldl {
                rd: reg,
                symbol: label.clone(),
                offset: off,
            }),
        }
    }

    /// Loads the address of a place into `reg`
    fn address_of_place(&mut self, place: &Place, reg: Reg) -> Result<()> {
        match place {
            Place::Slot(s, o) => self.address_of_base(&Base::Slot(*s), *o, reg),
            Place::Param(o) => self.address_of_base(&Base::Param, *o, reg),
            Place::Global(l, o) => self.address_of_base(&Base::Global(l.clone()), *o, reg),
            Place::Arg(i) => self.emit(Mach::Addi {
                rd: reg,
                ra: Reg::Sp,
                imm: Disp::Num(*i as i32),
            }),
            Place::Indirect(addr, o) => {
                self.load_word(addr, Repr::Word { signed: false }, 0, reg)?;
                if *o != 0 {
                    self.emit(Mach::Addi {
                        rd: reg,
                        ra: reg,
                        imm: Disp::Num(*o),
                    });
                }
            }
        }
        Ok(())
    }

    /// Loads the address of an operand's value, spilling constants to a
    /// fresh frame slot
    fn operand_address(&mut self, op: &Operand, repr: Repr, reg: Reg) -> Result<()> {
        match op {
            Operand::Load(place) => self.address_of_place(place, reg),
            Operand::Imm(_) | Operand::Float(_) => {
                let words = repr.words();
                let slot = self.out.new_slot(words);
                for i in 0..words {
                    self.load_word(op, repr, i, reg)?;
                    self.emit(Mach::St {
                        rs: reg,
                        base: Reg::Sp,
                        disp: Disp::Slot(slot, i as i32),
                    });
                }
                self.address_of_base(&Base::Slot(slot), 0, reg);
                Ok(())
            }
            Operand::Addr(..) => {
                let slot = self.out.new_slot(1);
                self.load_word(op, repr, 0, reg)?;
                self.emit(Mach::St {
                    rs: reg,
                    base: Reg::Sp,
                    disp: Disp::Slot(slot, 0),
                });
                self.address_of_base(&Base::Slot(slot), 0, reg);
                Ok(())
            }
        }
    }

    /// Stores `rs` into word `i` of a place
    fn store_word(&mut self, place: &Place, rs: Reg, i: u32) -> Result<()> {
        let (base, disp) = self.place_access(place, Reg::R5)?;
        self.emit(Mach::St {
            rs,
            base,
            disp: disp.plus(i as i32),
        });
        Ok(())
    }

    /// Re-normalizes a byte value held in `reg`
    fn normalize(&mut self, repr: Repr, reg: Reg) {
        if let Repr::Byte { signed } = repr {
            let op = if signed { MUnOp::Sxb } else { MUnOp::Zxb };
            self.emit(Mach::Unary { op, rd: reg, ra: reg });
        }
    }

    // =========================================================================
    // PRIMS
    // =========================================================================

    fn prim(&mut self, prim: &Prim) -> Result<()> {
        match prim {
            Prim::Entry => self.emit(Mach::Addi {
                rd: Reg::Sp,
                ra: Reg::Sp,
                imm: Disp::Frame(-1),
            }),
            Prim::Label(l) => self.label(*l, RegSet::EMPTY),
            Prim::Jump(l) => self.emit(Mach::Jump {
                target: *l,
                short: false,
            }),
            Prim::Compare {
                cond,
                repr,
                lhs,
                rhs,
                target,
            } => self.compare(*cond, *repr, lhs, rhs, *target)?,
            Prim::Test {
                nonzero,
                repr,
                value,
                target,
            } => self.test(*nonzero, *repr, value, *target)?,
            Prim::CallStart(n) => {
                if *n > 0 {
                    self.emit(Mach::Addi {
                        rd: Reg::Sp,
                        ra: Reg::Sp,
                        imm: Disp::Num(-(*n as i32)),
                    });
                }
            }
            Prim::Call {
                target,
                words,
                result,
            } => self.call_prim(target, *words, result.as_ref())?,
            Prim::Cast { dst, to, src, from } => self.cast(dst, *to, src, *from)?,
            Prim::Unary { op, repr, dst, src } => self.unary(*op, *repr, dst, src)?,
            Prim::Binary {
                op,
                repr,
                dst,
                lhs,
                rhs,
            } => self.binary(*op, *repr, dst, lhs, rhs)?,
            Prim::Assign { repr, dst, src } => self.assign(*repr, dst, src)?,
            Prim::Return(value) => {
                let wide = matches!(value, Some((_, repr)) if repr.words() == 2);
                if let Some((op, repr)) = value {
                    match repr.words() {
                        1 => self.load_word(op, *repr, 0, Reg::R0)?,
                        2 => {
                            self.load_word(op, *repr, 0, Reg::R0)?;
                            self.load_word(op, *repr, 1, Reg::R1)?;
                        }
                        n => return Err(Error::internal(format!("{}-word value returned in registers", n))),
                    }
                }
                self.emit(Mach::Addi {
                    rd: Reg::Sp,
                    ra: Reg::Sp,
                    imm: Disp::Frame(1),
                });
                self.emit(Mach::Ret { wide });
            }
            Prim::Throw(value) => self.throw(value)?,
            Prim::TryBegin { record, handler } => {
                self.emit(Mach::Ldl {
                    rd: Reg::R1,
                    symbol: TRYMARK.into(),
                    offset: 0,
                });
                self.emit(Mach::Ld {
                    rd: Reg::R0,
                    base: Reg::R1,
                    disp: Disp::Num(0),
                });
                self.emit(Mach::Addi {
                    rd: Reg::R2,
                    ra: Reg::Sp,
                    imm: Disp::Slot(*record, 0),
                });
                self.emit(Mach::St {
                    rs: Reg::R0,
                    base: Reg::R2,
                    disp: Disp::Num(0),
                });
                self.emit(Mach::Lea {
                    rd: Reg::R3,
                    label: *handler,
                    short: false,
                });
                self.emit(Mach::St {
                    rs: Reg::R3,
                    base: Reg::R2,
                    disp: Disp::Num(1),
                });
                self.emit(Mach::St {
                    rs: Reg::Sp,
                    base: Reg::R2,
                    disp: Disp::Num(2),
                });
                self.emit(Mach::St {
                    rs: Reg::R2,
                    base: Reg::R1,
                    disp: Disp::Num(0),
                });
            }
            Prim::TryEnd { record } => {
                self.emit(Mach::Ld {
                    rd: Reg::R0,
                    base: Reg::Sp,
                    disp: Disp::Slot(*record, 0),
                });
                self.emit(Mach::Ldl {
                    rd: Reg::R1,
                    symbol: TRYMARK.into(),
                    offset: 0,
                });
                self.emit(Mach::St {
                    rs: Reg::R0,
                    base: Reg::R1,
                    disp: Disp::Num(0),
                });
            }
            Prim::FinallyEntry { label, .. } => self.label(*label, RegSet::EMPTY),
            Prim::FinallyCall { entry, link, resume } => {
                self.emit(Mach::Lea {
                    rd: Reg::R0,
                    label: *resume,
                    short: false,
                });
                self.emit(Mach::St {
                    rs: Reg::R0,
                    base: Reg::Sp,
                    disp: Disp::Slot(*link, 0),
                });
                self.emit(Mach::Jump {
                    target: *entry,
                    short: false,
                });
            }
            Prim::FinallyReturn { link, resumes } => {
                self.emit(Mach::Ld {
                    rd: Reg::R0,
                    base: Reg::Sp,
                    disp: Disp::Slot(*link, 0),
                });
                self.emit(Mach::JumpReg {
                    ra: Reg::R0,
                    targets: resumes.clone(),
                });
            }
            Prim::CatchEntry { label, dst } => {
                self.label(*label, RegSet::of(&[Reg::R0]));
                if let Some(dst) = dst {
                    self.store_word(dst, Reg::R0, 0)?;
                }
            }
        }
        Ok(())
    }

    fn label(&mut self, label: LabelId, live_in: RegSet) {
        self.emit(Mach::Label { label, live_in });
    }

    fn compare(&mut self, cond: Cond, repr: Repr, lhs: &Operand, rhs: &Operand, target: LabelId) -> Result<()> {
        let signed = repr.is_signed();
        if repr.is_word() {
            self.load_word(lhs, repr, 0, Reg::R0)?;
            self.load_word(rhs, repr, 0, Reg::R1)?;
        } else if let Repr::Block(_) = repr {
            return Err(Error::internal("block comparison"));
        } else {
            self.operand_address(lhs, repr, Reg::R0)?;
            self.operand_address(rhs, repr, Reg::R1)?;
            self.call(format!("__cmp_{}", repr.helper_suffix()));
            self.ldi(Reg::R1, 0);
        }
        let (bc, swapped) = branch_cond(cond, signed || !repr.is_word());
        let (ra, rb) = if swapped { (Reg::R1, Reg::R0) } else { (Reg::R0, Reg::R1) };
        self.emit(Mach::Branch {
            cond: bc,
            ra,
            rb,
            target,
            short: false,
        });
        Ok(())
    }

    fn test(&mut self, nonzero: bool, repr: Repr, value: &Operand, target: LabelId) -> Result<()> {
        let words = repr.words();
        self.load_word(value, repr, 0, Reg::R0)?;
        for i in 1..words {
            self.load_word(value, repr, i, Reg::R1)?;
            if repr.is_float() && i == words - 1 {
                self.ldi(Reg::R2, 0x7fff);
                self.emit(Mach::Alu {
                    op: AluOp::And,
                    rd: Reg::R1,
                    ra: Reg::R1,
                    rb: Reg::R2,
                });
            }
            self.emit(Mach::Alu {
                op: AluOp::Or,
                rd: Reg::R0,
                ra: Reg::R0,
                rb: Reg::R1,
            });
        }
        self.emit(Mach::BranchZ {
            nonzero,
            ra: Reg::R0,
            target,
            short: false,
        });
        Ok(())
    }

    fn call_prim(&mut self, target: &CallTarget, words: u32, result: Option<&(Place, Repr)>) -> Result<()> {
        match target {
            CallTarget::Direct(symbol) => self.call(symbol.clone()),
            CallTarget::Indirect(op) => {
                self.load_word(op, Repr::Word { signed: false }, 0, Reg::R4)?;
                self.emit(Mach::CallReg { ra: Reg::R4 });
            }
        }
        if words > 0 {
            self.emit(Mach::Addi {
                rd: Reg::Sp,
                ra: Reg::Sp,
                imm: Disp::Num(words as i32),
            });
        }
        if let Some((dst, repr)) = result {
            match repr.words() {
                1 => self.store_word(dst, Reg::R0, 0)?,
                2 => {
                    self.store_word(dst, Reg::R0, 0)?;
                    self.store_word(dst, Reg::R1, 1)?;
                }
                n => return Err(Error::internal(format!("{}-word call result in registers", n))),
            }
        }
        Ok(())
    }

    fn cast(&mut self, dst: &Place, to: Repr, src: &Operand, from: Repr) -> Result<()> {
        if to.is_float() || from.is_float() {
            self.address_of_place(dst, Reg::R0)?;
            self.operand_address(src, from, Reg::R1)?;
            self.call(format!("__cvt_{}_{}", from.helper_suffix(), to.helper_suffix()));
            if let Repr::Byte { .. } = to {
                let (base, disp) = self.place_access(dst, Reg::R5)?;
                self.emit(Mach::Ld { rd: Reg::R0, base, disp });
                self.normalize(to, Reg::R0);
                self.store_word(dst, Reg::R0, 0)?;
            }
            return Ok(());
        }
        match (from.words(), to.words()) {
            (1, 1) => {
                self.load_word(src, from, 0, Reg::R0)?;
                self.normalize(to, Reg::R0);
                self.store_word(dst, Reg::R0, 0)
            }
            (1, 2) => {
                self.load_word(src, from, 0, Reg::R0)?;
                if from.is_signed() {
                    self.ldi(Reg::R1, 15);
                    self.emit(Mach::Alu {
                        op: AluOp::Sar,
                        rd: Reg::R1,
                        ra: Reg::R0,
                        rb: Reg::R1,
                    });
                } else {
                    self.ldi(Reg::R1, 0);
                }
                self.store_word(dst, Reg::R0, 0)?;
                self.store_word(dst, Reg::R1, 1)
            }
            (2, 1) => {
                self.load_word(src, from, 0, Reg::R0)?;
                self.normalize(to, Reg::R0);
                self.store_word(dst, Reg::R0, 0)
            }
            _ => self.assign(to, dst, src),
        }
    }

    fn unary(&mut self, op: UnOp, repr: Repr, dst: &Place, src: &Operand) -> Result<()> {
        if repr.is_word() {
            self.load_word(src, repr, 0, Reg::R0)?;
            let mop = match op {
                UnOp::Neg => MUnOp::Neg,
                UnOp::Not => MUnOp::Not,
            };
            self.emit(Mach::Unary {
                op: mop,
                rd: Reg::R0,
                ra: Reg::R0,
            });
            self.normalize(repr, Reg::R0);
            return self.store_word(dst, Reg::R0, 0);
        }
        self.address_of_place(dst, Reg::R0)?;
        self.operand_address(src, repr, Reg::R1)?;
        let name = match op {
            UnOp::Neg => "neg",
            UnOp::Not => "not",
        };
        self.call(format!("__{}_{}", name, repr.helper_suffix()));
        Ok(())
    }

    fn binary(&mut self, op: BinaryOp, repr: Repr, dst: &Place, lhs: &Operand, rhs: &Operand) -> Result<()> {
        if !repr.is_word() {
            let rhs_repr = match op {
                BinaryOp::Shl | BinaryOp::Shr => Repr::Word { signed: true },
                _ => repr,
            };
            self.address_of_place(dst, Reg::R0)?;
            self.operand_address(lhs, repr, Reg::R1)?;
            self.operand_address(rhs, rhs_repr, Reg::R2)?;
            self.call(format!("__{}_{}", helper_op(op)?, repr.helper_suffix()));
            return Ok(());
        }
        let signed = repr.is_signed();
        self.load_word(lhs, repr, 0, Reg::R0)?;
        self.load_word(rhs, repr, 0, Reg::R1)?;
        let alu = match op {
            BinaryOp::Add => Some(AluOp::Add),
            BinaryOp::Sub => Some(AluOp::Sub),
            BinaryOp::And => Some(AluOp::And),
            BinaryOp::Or => Some(AluOp::Or),
            BinaryOp::Xor => Some(AluOp::Xor),
            BinaryOp::Shl => Some(AluOp::Shl),
            BinaryOp::Shr if signed => Some(AluOp::Sar),
            BinaryOp::Shr => Some(AluOp::Shr),
            _ => None,
        };
        match alu {
            Some(a) => self.emit(Mach::Alu {
                op: a,
                rd: Reg::R0,
                ra: Reg::R0,
                rb: Reg::R1,
            }),
            None => {
                let helper = match (op, signed) {
                    (BinaryOp::Mul, _) => "__mul",
                    (BinaryOp::Div, true) => "__div",
                    (BinaryOp::Div, false) => "__divu",
                    (BinaryOp::Mod, true) => "__mod",
                    (BinaryOp::Mod, false) => "__modu",
                    (other, _) => {
                        return Err(Error::internal(format!(
                            "comparison '{}' reached arithmetic selection",
                            other.as_str()
                        )))
                    }
                };
                self.call(helper);
            }
        }
        self.normalize(repr, Reg::R0);
        self.store_word(dst, Reg::R0, 0)
    }

    fn assign(&mut self, repr: Repr, dst: &Place, src: &Operand) -> Result<()> {
        let n = match repr {
            Repr::Block(n) => n,
            _ => {
                for i in 0..repr.words() {
                    self.load_word(src, repr, i, Reg::R0)?;
                    self.store_word(dst, Reg::R0, i)?;
                }
                return Ok(());
            }
        };
        let clear = matches!(src, Operand::Imm(0));
        if n <= INLINE_BLOCK_WORDS {
            if clear {
                self.ldi(Reg::R0, 0);
            } else {
                self.load_word(src, Repr::Word { signed: false }, 0, Reg::R1)?;
            }
            for i in 0..n {
                if !clear {
                    self.emit(Mach::Ld {
                        rd: Reg::R0,
                        base: Reg::R1,
                        disp: Disp::Num(i as i32),
                    });
                }
                self.store_word(dst, Reg::R0, i)?;
            }
            return Ok(());
        }
        self.address_of_place(dst, Reg::R0)?;
        if clear {
            self.ldi(Reg::R1, n as i32);
            self.call("__blkclr");
        } else {
            self.load_word(src, Repr::Word { signed: false }, 0, Reg::R1)?;
            self.ldi(Reg::R2, n as i32);
            self.call("__blkcpy");
        }
        Ok(())
    }

    /// Unlinks the innermost record, restores its stack pointer and jumps
    /// to its handler with the value in `r0`
    fn throw(&mut self, value: &Operand) -> Result<()> {
        self.load_word(value, Repr::Word { signed: true }, 0, Reg::R0)?;
        let mark = |rd| Mach::Ldl {
            rd,
            symbol: TRYMARK.into(),
            offset: 0,
        };
        self.emit(mark(Reg::R1));
        self.emit(Mach::Ld {
            rd: Reg::R1,
            base: Reg::R1,
            disp: Disp::Num(0),
        });
        self.emit(Mach::Ld {
            rd: Reg::R2,
            base: Reg::R1,
            disp: Disp::Num(0),
        });
        self.emit(mark(Reg::R3));
        self.emit(Mach::St {
            rs: Reg::R2,
            base: Reg::R3,
            disp: Disp::Num(0),
        });
        self.emit(Mach::Ld {
            rd: Reg::Sp,
            base: Reg::R1,
            disp: Disp::Num(2),
        });
        self.emit(Mach::Ld {
            rd: Reg::R1,
            base: Reg::R1,
            disp: Disp::Num(1),
        });
        self.emit(Mach::JumpReg {
            ra: Reg::R1,
            targets: Vec::new(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::prim::SlotId;

    fn func(prims: Vec<Prim>, slots: u32) -> PrimFunc {
        let mut f = PrimFunc::new("f", true, SourceLoc::builtin());
        for _ in 0..slots {
            f.new_slot(1, false);
        }
        for p in prims {
            f.prims.push_back(p, None);
        }
        f
    }

    fn code(f: &MachFunc) -> Vec<Mach> {
        f.code.iter().map(|(_, m)| m.clone()).collect()
    }

    #[test]
    fn test_entry_and_return_adjust_frame() {
        let f = func(vec![Prim::Entry, Prim::Return(Some((Operand::Imm(7), Repr::Word { signed: true })))], 0);
        let m = code(&select(&f).unwrap());
        assert_eq!(
            m,
            vec![
                Mach::Addi {
                    rd: Reg::Sp,
                    ra: Reg::Sp,
                    imm: Disp::Frame(-1)
                },
                Mach::Ldi { rd: Reg::R0, value: 7 },
                Mach::Addi {
                    rd: Reg::Sp,
                    ra: Reg::Sp,
                    imm: Disp::Frame(1)
                },
                Mach::Ret { wide: false },
            ]
        );
    }

    #[test]
    fn test_greater_than_swaps_operands() {
        let f = func(
            vec![Prim::Compare {
                cond: Cond::Gt,
                repr: Repr::Word { signed: false },
                lhs: Operand::load(Place::Slot(SlotId(0), 0)),
                rhs: Operand::Imm(3),
                target: LabelId(1),
            }],
            1,
        );
        let m = code(&select(&f).unwrap());
        assert!(matches!(
            m.last(),
            Some(Mach::Branch {
                cond: BranchCond::Ltu,
                ra: Reg::R1,
                rb: Reg::R0,
                ..
            })
        ));
    }

    #[test]
    fn test_long_multiply_uses_helper_with_addresses() {
        let s = |i| Place::Slot(SlotId(i), 0);
        let f = func(
            vec![Prim::Binary {
                op: BinaryOp::Mul,
                repr: Repr::Long { signed: true },
                dst: s(0),
                lhs: Operand::load(s(1)),
                rhs: Operand::Imm(10),
            }],
            2,
        );
        let out = select(&f).unwrap();
        let m = code(&out);
        assert!(m.contains(&Mach::Call {
            symbol: "__mul_l".into()
        }));
        // The constant was spilled to a fresh two-word slot.
        assert_eq!(out.slots.len(), 3);
        assert_eq!(out.slots[2].words, 2);
    }

    #[test]
    fn test_word_division_signedness() {
        let s = |i| Place::Slot(SlotId(i), 0);
        let div = |signed| Prim::Binary {
            op: BinaryOp::Div,
            repr: Repr::Word { signed },
            dst: s(0),
            lhs: Operand::load(s(0)),
            rhs: Operand::Imm(3),
        };
        let f = func(vec![div(true), div(false)], 1);
        let calls: Vec<String> = code(&select(&f).unwrap())
            .into_iter()
            .filter_map(|m| match m {
                Mach::Call { symbol } => Some(symbol),
                _ => None,
            })
            .collect();
        assert_eq!(calls, vec!["__div".to_string(), "__divu".to_string()]);
    }

    #[test]
    fn test_catch_entry_defines_r0() {
        let f = func(
            vec![Prim::CatchEntry {
                label: LabelId(4),
                dst: Some(Place::Slot(SlotId(0), 0)),
            }],
            1,
        );
        let m = code(&select(&f).unwrap());
        assert_eq!(
            m[0],
            Mach::Label {
                label: LabelId(4),
                live_in: RegSet::of(&[Reg::R0])
            }
        );
        assert!(matches!(m[1], Mach::St { rs: Reg::R0, base: Reg::Sp, .. }));
    }

    #[test]
    fn test_large_block_copy_calls_helper() {
        let f = func(
            vec![Prim::Assign {
                repr: Repr::Block(8),
                dst: Place::Global("g".into(), 0),
                src: Operand::Addr(Base::Slot(SlotId(0)), 0),
            }],
            1,
        );
        let m = code(&select(&f).unwrap());
        assert_eq!(m.last(), Some(&Mach::Call { symbol: "__blkcpy".into() }));
    }
}
