//! Conditional branches

use super::Lowerer;
use crate::compiler::prim::{Cond, LabelId, Prim};
use crate::error::Result;
use crate::parser::{Expr, ExprKind, UnaryOp};

impl Lowerer<'_> {
    /// Branches to `target` when the truth of `e` equals `sense`, otherwise
    /// falls through
    pub(super) fn ifgoto(&mut self, e: &Expr, sense: bool, target: LabelId) -> Result<()> {
        match &e.kind {
            ExprKind::Int(v) => {
                if (*v != 0) == sense {
                    self.jump(target);
                }
                Ok(())
            }
            ExprKind::Float(v) => {
                if (*v != 0.0) == sense {
                    self.jump(target);
                }
                Ok(())
            }
            ExprKind::Symbol(_) => {
                if sense {
                    self.jump(target);
                }
                Ok(())
            }
            ExprKind::Unary(UnaryOp::LogNot, x) => self.ifgoto(x, !sense, target),
            ExprKind::Logical { and, lhs, rhs } => {
                if *and == sense {
                    let skip = self.new_label();
                    self.ifgoto(lhs, !sense, skip)?;
                    self.ifgoto(rhs, sense, target)?;
                    self.label(skip);
                } else {
                    self.ifgoto(lhs, sense, target)?;
                    self.ifgoto(rhs, sense, target)?;
                }
                Ok(())
            }
            ExprKind::Comma(a, b) => {
                self.effect(a)?;
                self.ifgoto(b, sense, target)
            }
            ExprKind::Binary(op, l, r) if op.is_comparison() => {
                let mut cond = match Cond::from_op(*op) {
                    Some(c) => c,
                    None => return Ok(()),
                };
                if !sense {
                    cond = cond.negate();
                }
                let repr = self.repr(l.ty);
                let lhs = self.value(l)?;
                let rhs = self.value(r)?;
                self.compare(cond, repr, lhs, rhs, target);
                Ok(())
            }
            _ => {
                let repr = self.repr(e.ty);
                let value = self.value(e)?;
                self.emit(Prim::Test {
                    nonzero: sense,
                    repr,
                    value,
                    target,
                });
                Ok(())
            }
        }
    }
}
