//! Abstract register state
//!
//! A forward walk keeps, for each general register, what is known about its
//! contents and rewrites instructions that the knowledge makes cheaper:
//!
//! - ALU and unary operations on constants become `ldi`
//! - a constant right operand of `add`/`sub` is fused into `addi`
//! - `ldi` of a value the register already holds is dropped
//! - loads and stores through a register known to be `sp + k` use `sp`
//! - sign and zero extensions of already extended bytes are dropped
//!
//! Knowledge is discarded at every label, after every instruction that does
//! not fall through, and for the caller-saved registers at calls. A label's
//! live-in registers hold values from elsewhere (a thrown value at a
//! handler), so they are unknown here too; only liveness reads them.

use super::encode::fits;
use super::{AluOp, Disp, Mach, MachFunc, Reg, UnOp};

/// Width of the `addi`, `ld` and `st` immediate fields
const DISP_BITS: u32 = 6;

/// What is known about a register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Value {
    /// Nothing
    Unknown,
    /// A 16-bit constant, sign-extended
    Const(i32),
    /// The stack pointer plus a word offset
    SpPlus(i32),
    /// A sign-extended byte
    SextByte,
    /// A zero-extended byte
    ZextByte,
}

/// Per-register knowledge; `sp` is never tracked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegState([Value; 7]);

impl Default for RegState {
    fn default() -> Self {
        RegState([Value::Unknown; 7])
    }
}

impl RegState {
    /// Knowledge about `r`
    pub fn get(&self, r: Reg) -> Value {
        match r {
            Reg::Sp => Value::SpPlus(0),
            r => self.0[r.number() as usize],
        }
    }

    fn set(&mut self, r: Reg, v: Value) {
        match r {
            Reg::Sp => self.sp_unknown(),
            r => self.0[r.number() as usize] = v,
        }
    }

    fn constant(&self, r: Reg) -> Option<i32> {
        match self.get(r) {
            Value::Const(c) => Some(c),
            _ => None,
        }
    }

    /// `sp` moved by `delta` words
    fn sp_moved(&mut self, delta: i32) {
        for v in self.0.iter_mut() {
            if let Value::SpPlus(k) = v {
                *k -= delta;
            }
        }
    }

    /// `sp` changed by an unknown amount
    fn sp_unknown(&mut self) {
        for v in self.0.iter_mut() {
            if let Value::SpPlus(_) = v {
                *v = Value::Unknown;
            }
        }
    }

    /// Applies an instruction's effect
    pub fn step(&mut self, m: &Mach) {
        match m {
            Mach::Label { .. } => *self = RegState::default(),
            Mach::Alu { op, rd, ra, rb } => {
                let v = match (self.get(*ra), self.get(*rb)) {
                    (Value::Const(a), Value::Const(b)) => Value::Const(op.eval(a, b)),
                    (Value::SpPlus(k), Value::Const(c)) if *op == AluOp::Add => Value::SpPlus(k + c),
                    (Value::SpPlus(k), Value::Const(c)) if *op == AluOp::Sub => Value::SpPlus(k - c),
                    _ => Value::Unknown,
                };
                if *rd == Reg::Sp {
                    match (op, *ra, self.constant(*rb)) {
                        (AluOp::Add, Reg::Sp, Some(c)) => self.sp_moved(c),
                        _ => self.sp_unknown(),
                    }
                } else {
                    self.set(*rd, v);
                }
            }
            Mach::Unary { op, rd, ra } => {
                let v = match (op, self.get(*ra)) {
                    (_, Value::Const(c)) => Value::Const(op.eval(c)),
                    (UnOp::Mov, v) => v,
                    (UnOp::Sxb, _) => Value::SextByte,
                    (UnOp::Zxb, _) => Value::ZextByte,
                    _ => Value::Unknown,
                };
                self.set(*rd, v);
            }
            Mach::Addi { rd, ra, imm } => {
                let imm = imm.value();
                if *rd == Reg::Sp {
                    match (*ra, imm) {
                        (Reg::Sp, Some(v)) => self.sp_moved(v),
                        _ => self.sp_unknown(),
                    }
                    return;
                }
                let v = match (self.get(*ra), imm) {
                    (Value::Const(c), Some(i)) => Value::Const(AluOp::Add.eval(c, i)),
                    (Value::SpPlus(k), Some(i)) => Value::SpPlus(k + i),
                    _ => Value::Unknown,
                };
                self.set(*rd, v);
            }
            Mach::Ldi { rd, value } => self.set(*rd, Value::Const(UnOp::Mov.eval(*value))),
            Mach::Ldl { rd, .. } | Mach::Lea { rd, .. } | Mach::Ld { rd, .. } => self.set(*rd, Value::Unknown),
            Mach::Call { .. } | Mach::CallReg { .. } => *self = RegState::default(),
            Mach::Jump { .. } | Mach::JumpSym { .. } | Mach::JumpReg { .. } | Mach::Ret { .. } => {
                *self = RegState::default()
            }
            Mach::St { .. } | Mach::Branch { .. } | Mach::BranchZ { .. } => {}
        }
    }

    /// The cheaper equivalent of `m` in this state, if any; `Some(None)`
    /// means the instruction can be dropped
    pub fn rewrite(&self, m: &Mach) -> Option<Option<Mach>> {
        match m {
            Mach::Alu { op, rd, ra, rb } if *rd != Reg::Sp => {
                if let (Some(a), Some(b)) = (self.constant(*ra), self.constant(*rb)) {
                    return Some(Some(Mach::Ldi {
                        rd: *rd,
                        value: op.eval(a, b),
                    }));
                }
                let c = self.constant(*rb)?;
                let imm = match op {
                    AluOp::Add => c,
                    AluOp::Sub => -c,
                    _ => return None,
                };
                fits(imm, DISP_BITS).then(|| {
                    Some(Mach::Addi {
                        rd: *rd,
                        ra: *ra,
                        imm: Disp::Num(imm),
                    })
                })
            }
            Mach::Unary { op, rd, ra } if *rd != Reg::Sp => match (op, self.get(*ra)) {
                (_, Value::Const(c)) => Some(Some(Mach::Ldi {
                    rd: *rd,
                    value: op.eval(c),
                })),
                (UnOp::Sxb, Value::SextByte) | (UnOp::Zxb, Value::ZextByte) => {
                    if rd == ra {
                        Some(None)
                    } else {
                        Some(Some(Mach::Unary {
                            op: UnOp::Mov,
                            rd: *rd,
                            ra: *ra,
                        }))
                    }
                }
                _ => None,
            },
            Mach::Addi {
                rd,
                ra,
                imm: Disp::Num(i),
            } if *rd != Reg::Sp => {
                let c = self.constant(*ra)?;
                Some(Some(Mach::Ldi {
                    rd: *rd,
                    value: AluOp::Add.eval(c, *i),
                }))
            }
            Mach::Ldi { rd, value } => {
                (self.constant(*rd) == Some(UnOp::Mov.eval(*value))).then_some(None)
            }
            Mach::Ld {
                rd,
                base,
                disp: Disp::Num(d),
            } => self.sp_relative(*base, *d).map(|disp| {
                Some(Mach::Ld {
                    rd: *rd,
                    base: Reg::Sp,
                    disp,
                })
            }),
            Mach::St {
                rs,
                base,
                disp: Disp::Num(d),
            } => self.sp_relative(*base, *d).map(|disp| {
                Some(Mach::St {
                    rs: *rs,
                    base: Reg::Sp,
                    disp,
                })
            }),
            _ => None,
        }
    }

    fn sp_relative(&self, base: Reg, d: i32) -> Option<Disp> {
        if base == Reg::Sp {
            return None;
        }
        match self.get(base) {
            Value::SpPlus(k) if fits(k + d, DISP_BITS) => Some(Disp::Num(k + d)),
            _ => None,
        }
    }
}

/// One forward walk; returns whether anything changed
pub fn run(func: &mut MachFunc) -> bool {
    let mut state = RegState::default();
    let mut changed = false;
    for id in func.code.ids() {
        let current = func.code.get(id).clone();
        let m = match state.rewrite(&current) {
            Some(None) => {
                func.code.remove(id);
                changed = true;
                continue;
            }
            Some(Some(m)) => {
                func.code.replace(id, m.clone());
                changed = true;
                m
            }
            None => current,
        };
        state.step(&m);
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::mach::RegSet;
    use crate::error::SourceLoc;

    fn run_on(code: Vec<Mach>) -> Vec<Mach> {
        let mut f = MachFunc::new("f", false, Vec::new(), SourceLoc::builtin());
        for m in code {
            f.code.push_back(m, None);
        }
        run(&mut f);
        f.code.iter().map(|(_, m)| m.clone()).collect()
    }

    #[test]
    fn test_constant_alu_folds_to_ldi() {
        let out = run_on(vec![
            Mach::Ldi { rd: Reg::R0, value: 0x7fff },
            Mach::Ldi { rd: Reg::R1, value: 1 },
            Mach::Alu {
                op: AluOp::Add,
                rd: Reg::R0,
                ra: Reg::R0,
                rb: Reg::R1,
            },
        ]);
        assert_eq!(out[2], Mach::Ldi { rd: Reg::R0, value: -32768 });
    }

    #[test]
    fn test_small_constant_fuses_into_addi() {
        let out = run_on(vec![
            Mach::Ld {
                rd: Reg::R0,
                base: Reg::Sp,
                disp: Disp::Num(0),
            },
            Mach::Ldi { rd: Reg::R1, value: 3 },
            Mach::Alu {
                op: AluOp::Sub,
                rd: Reg::R0,
                ra: Reg::R0,
                rb: Reg::R1,
            },
        ]);
        assert_eq!(
            out[2],
            Mach::Addi {
                rd: Reg::R0,
                ra: Reg::R0,
                imm: Disp::Num(-3)
            }
        );
    }

    #[test]
    fn test_repeated_ldi_dropped_until_label() {
        let out = run_on(vec![
            Mach::Ldi { rd: Reg::R1, value: 0 },
            Mach::Ldi { rd: Reg::R1, value: 0 },
            Mach::Label {
                label: crate::compiler::prim::LabelId(1),
                live_in: Default::default(),
            },
            Mach::Ldi { rd: Reg::R1, value: 0 },
        ]);
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn test_handler_live_in_is_not_assumed() {
        let handler = Mach::Label {
            label: crate::compiler::prim::LabelId(2),
            live_in: RegSet::of(&[Reg::R0]),
        };
        let code = vec![
            Mach::Ldi { rd: Reg::R0, value: 4 },
            handler,
            Mach::Ldi { rd: Reg::R0, value: 4 },
        ];
        assert_eq!(run_on(code.clone()), code);
    }

    #[test]
    fn test_access_through_sp_copy_becomes_sp_relative() {
        let out = run_on(vec![
            Mach::Addi {
                rd: Reg::R2,
                ra: Reg::Sp,
                imm: Disp::Num(4),
            },
            Mach::Addi {
                rd: Reg::Sp,
                ra: Reg::Sp,
                imm: Disp::Num(-2),
            },
            Mach::St {
                rs: Reg::R0,
                base: Reg::R2,
                disp: Disp::Num(1),
            },
        ]);
        assert_eq!(
            out[2],
            Mach::St {
                rs: Reg::R0,
                base: Reg::Sp,
                disp: Disp::Num(7)
            }
        );
    }

    #[test]
    fn test_redundant_extension_removed() {
        let out = run_on(vec![
            Mach::Unary {
                op: UnOp::Sxb,
                rd: Reg::R0,
                ra: Reg::R0,
            },
            Mach::Unary {
                op: UnOp::Sxb,
                rd: Reg::R0,
                ra: Reg::R0,
            },
        ]);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_call_forgets_constants() {
        let out = run_on(vec![
            Mach::Ldi { rd: Reg::R2, value: 5 },
            Mach::Call { symbol: "g".into() },
            Mach::Ldi { rd: Reg::R2, value: 5 },
        ]);
        assert_eq!(out.len(), 3);
    }
}
