//! Expression lowering

use super::Lowerer;
use crate::compiler::prim::{Base, CallTarget, Cond, LabelId, Operand, Place, Prim, Repr, UnOp};
use crate::error::{Error, Result};
use crate::parser::fold::wrap_bits;
use crate::parser::{BinaryOp, Callee, Expr, ExprKind, StmtKind, UnaryOp};
use crate::types::TypeId;

impl Lowerer<'_> {
    /// Value of an expression; struct values are represented by their
    /// address
    pub(super) fn value(&mut self, e: &Expr) -> Result<Operand> {
        let repr = self.repr(e.ty);
        match &e.kind {
            ExprKind::Int(v) => Ok(Operand::Imm(*v)),
            ExprKind::Float(v) => Ok(Operand::Float(*v)),
            ExprKind::Symbol(label) => Ok(Operand::Addr(Base::Global(label.clone()), 0)),
            ExprKind::Var(_) | ExprKind::Deref(_) | ExprKind::Member { .. } => {
                let place = self.place(e)?;
                if let Repr::Block(_) = repr {
                    return self.address_of(place);
                }
                Ok(Operand::load(place))
            }
            ExprKind::Unary(UnaryOp::LogNot, _) => self.bool_value(e),
            ExprKind::Unary(op, x) => {
                let src = self.value(x)?;
                let op = match op {
                    UnaryOp::Neg => UnOp::Neg,
                    _ => UnOp::Not,
                };
                let t = self.temp(repr);
                self.emit(Prim::Unary {
                    op,
                    repr,
                    dst: Place::Slot(t, 0),
                    src,
                });
                Ok(Operand::load(Place::Slot(t, 0)))
            }
            ExprKind::AddrOf(x) => {
                let place = self.place(x)?;
                self.address_of(place)
            }
            ExprKind::IncDec {
                pre,
                inc,
                operand,
                step,
            } => self.inc_dec(*pre, *inc, operand, *step),
            ExprKind::Binary(op, _, _) if op.is_comparison() => self.bool_value(e),
            ExprKind::Binary(op, l, r) => {
                let lhs = self.value(l)?;
                let rhs = self.value(r)?;
                let t = self.temp(repr);
                self.emit(Prim::Binary {
                    op: *op,
                    repr,
                    dst: Place::Slot(t, 0),
                    lhs,
                    rhs,
                });
                Ok(Operand::load(Place::Slot(t, 0)))
            }
            ExprKind::Logical { .. } => self.bool_value(e),
            ExprKind::Assign(l, r) => {
                let dst = self.place(l)?;
                let dst = self.stable(dst);
                let src = self.value(r)?;
                self.emit(Prim::Assign {
                    repr,
                    dst: dst.clone(),
                    src,
                });
                self.result_of(dst, repr)
            }
            ExprKind::CompoundAssign { op, lhs, rhs, op_ty } => {
                self.compound_assign(*op, lhs, rhs, *op_ty)
            }
            ExprKind::Call { .. } => match self.call(e)? {
                Some(v) => Ok(v),
                None => Ok(Operand::Imm(0)),
            },
            ExprKind::Cast(x) => self.cast(x, e.ty),
            ExprKind::BaseAdjust {
                operand,
                offset,
                null_check,
            } => self.base_adjust(operand, *offset, *null_check),
            ExprKind::Ternary(c, a, b) => self.ternary(e, c, a, b),
            ExprKind::Comma(a, b) => {
                self.effect(a)?;
                self.value(b)
            }
            ExprKind::StmtExpr(body) => self.statement_expression(body),
        }
    }

    /// Storage designated by an lvalue or struct-valued expression
    pub(super) fn place(&mut self, e: &Expr) -> Result<Place> {
        match &e.kind {
            ExprKind::Var(d) => self.var_place(*d),
            ExprKind::Symbol(label) => Ok(Place::Global(label.clone(), 0)),
            ExprKind::Deref(p) => {
                let addr = self.value(p)?;
                Ok(Self::indirect(addr, 0))
            }
            ExprKind::Member { base, offset } => {
                let base = self.place(base)?;
                Ok(base.offset(*offset as i32))
            }
            ExprKind::Call { .. } if matches!(self.repr(e.ty), Repr::Block(_)) => {
                let addr = self.call(e)?.ok_or_else(|| Error::internal("struct call without result"))?;
                Ok(Self::indirect(addr, 0))
            }
            _ => {
                let repr = self.repr(e.ty);
                let v = self.value(e)?;
                if let Repr::Block(_) = repr {
                    return Ok(Self::indirect(v, 0));
                }
                let t = self.temp(repr);
                self.emit(Prim::Assign {
                    repr,
                    dst: Place::Slot(t, 0),
                    src: v,
                });
                Ok(Place::Slot(t, 0))
            }
        }
    }

    /// Evaluates an expression for its side effects
    pub(super) fn effect(&mut self, e: &Expr) -> Result<()> {
        match &e.kind {
            ExprKind::Int(_) | ExprKind::Float(_) | ExprKind::Symbol(_) | ExprKind::Var(_) => Ok(()),
            ExprKind::IncDec {
                inc,
                operand,
                step,
                ..
            } => self.inc_dec(true, *inc, operand, *step).map(|_| ()),
            ExprKind::Call { .. } => self.call(e).map(|_| ()),
            ExprKind::Cast(x) => self.effect(x),
            ExprKind::Comma(a, b) => {
                self.effect(a)?;
                self.effect(b)
            }
            ExprKind::Logical { and, lhs, rhs } => {
                let skip = self.new_label();
                self.ifgoto(lhs, !*and, skip)?;
                self.effect(rhs)?;
                self.label(skip);
                Ok(())
            }
            ExprKind::Ternary(c, a, b) => {
                let other = self.new_label();
                let end = self.new_label();
                self.ifgoto(c, false, other)?;
                self.effect(a)?;
                self.jump(end);
                self.label(other);
                self.effect(b)?;
                self.label(end);
                Ok(())
            }
            ExprKind::Assign(..) | ExprKind::CompoundAssign { .. } => self.value(e).map(|_| ()),
            _ => self.value(e).map(|_| ()),
        }
    }

    /// Stores the value of `e` into `dst`
    pub(super) fn assign_into(&mut self, dst: Place, e: &Expr) -> Result<()> {
        let repr = self.repr(e.ty);
        let src = self.value(e)?;
        self.emit(Prim::Assign { repr, dst, src });
        Ok(())
    }

    fn indirect(addr: Operand, off: i32) -> Place {
        match addr {
            Operand::Addr(Base::Slot(s), o) => Place::Slot(s, o + off),
            Operand::Addr(Base::Param, o) => Place::Param(o + off),
            Operand::Addr(Base::Global(l), o) => Place::Global(l, o + off),
            other => Place::Indirect(Box::new(other), off),
        }
    }

    /// Address of a place as an operand
    pub(super) fn address_of(&mut self, place: Place) -> Result<Operand> {
        if let Some(a) = place.address() {
            return Ok(a);
        }
        match place {
            Place::Indirect(op, off) => {
                let t = self.temp(Repr::Word { signed: false });
                self.emit(Prim::Binary {
                    op: BinaryOp::Add,
                    repr: Repr::Word { signed: false },
                    dst: Place::Slot(t, 0),
                    lhs: *op,
                    rhs: Operand::Imm(off as i64),
                });
                Ok(Operand::load(Place::Slot(t, 0)))
            }
            _ => Err(Error::internal("address of an outgoing argument")),
        }
    }

    /// Value of an assignment expression: the stored object
    fn result_of(&mut self, dst: Place, repr: Repr) -> Result<Operand> {
        if let Repr::Block(_) = repr {
            return self.address_of(dst);
        }
        Ok(Operand::load(dst))
    }

    /// Pins the address of an indirect place in a temporary so that it is
    /// computed once
    fn stable(&mut self, place: Place) -> Place {
        match place {
            Place::Indirect(op, off) if matches!(op.as_ref(), Operand::Load(_)) => {
                let t = self.temp(Repr::Word { signed: false });
                self.emit(Prim::Assign {
                    repr: Repr::Word { signed: false },
                    dst: Place::Slot(t, 0),
                    src: *op,
                });
                Place::Indirect(Box::new(Operand::load(Place::Slot(t, 0))), off)
            }
            other => other,
        }
    }

    /// `0` or `1` for a truth-valued expression
    fn bool_value(&mut self, e: &Expr) -> Result<Operand> {
        let t = self.temp(Repr::Word { signed: true });
        let end = self.new_label();
        self.emit(Prim::Assign {
            repr: Repr::Word { signed: true },
            dst: Place::Slot(t, 0),
            src: Operand::Imm(1),
        });
        self.ifgoto(e, true, end)?;
        self.emit(Prim::Assign {
            repr: Repr::Word { signed: true },
            dst: Place::Slot(t, 0),
            src: Operand::Imm(0),
        });
        self.label(end);
        Ok(Operand::load(Place::Slot(t, 0)))
    }

    fn step_operand(repr: Repr, step: i64) -> Operand {
        if repr.is_float() {
            Operand::Float(step as f64)
        } else {
            Operand::Imm(step)
        }
    }

    fn inc_dec(&mut self, pre: bool, inc: bool, operand: &Expr, step: i64) -> Result<Operand> {
        let repr = self.repr(operand.ty);
        let place = self.place(operand)?;
        let place = self.stable(place);
        let op = if inc { BinaryOp::Add } else { BinaryOp::Sub };
        let rhs = Self::step_operand(repr, step);
        if pre {
            self.emit(Prim::Binary {
                op,
                repr,
                dst: place.clone(),
                lhs: Operand::load(place.clone()),
                rhs,
            });
            return Ok(Operand::load(place));
        }
        let old = self.temp(repr);
        self.emit(Prim::Assign {
            repr,
            dst: Place::Slot(old, 0),
            src: Operand::load(place.clone()),
        });
        self.emit(Prim::Binary {
            op,
            repr,
            dst: place,
            lhs: Operand::load(Place::Slot(old, 0)),
            rhs,
        });
        Ok(Operand::load(Place::Slot(old, 0)))
    }

    fn compound_assign(&mut self, op: BinaryOp, lhs: &Expr, rhs: &Expr, op_ty: TypeId) -> Result<Operand> {
        let lrepr = self.repr(lhs.ty);
        let orepr = self.repr(op_ty);
        let place = self.place(lhs)?;
        let place = self.stable(place);
        let rv = self.value(rhs)?;
        let current = Operand::load(place.clone());
        if lrepr == orepr {
            self.emit(Prim::Binary {
                op,
                repr: lrepr,
                dst: place.clone(),
                lhs: current,
                rhs: rv,
            });
            return Ok(Operand::load(place));
        }
        let widened = self.convert(current, lrepr, orepr);
        let t = self.temp(orepr);
        self.emit(Prim::Binary {
            op,
            repr: orepr,
            dst: Place::Slot(t, 0),
            lhs: widened,
            rhs: rv,
        });
        self.emit(Prim::Cast {
            dst: place.clone(),
            to: lrepr,
            src: Operand::load(Place::Slot(t, 0)),
            from: orepr,
        });
        Ok(Operand::load(place))
    }

    // ========================================================================
    // Conversions
    // ========================================================================

    fn cast(&mut self, x: &Expr, to_ty: TypeId) -> Result<Operand> {
        if self.sess.types.is_void(to_ty) {
            self.effect(x)?;
            return Ok(Operand::Imm(0));
        }
        let from = self.repr(x.ty);
        let to = self.repr(to_ty);
        let v = self.value(x)?;
        Ok(self.convert(v, from, to))
    }

    /// Converts a value between representations, emitting a `Cast` only when
    /// the bits change
    pub(super) fn convert(&mut self, v: Operand, from: Repr, to: Repr) -> Operand {
        use Repr::*;
        if let Some(c) = Self::fold_convert(&v, from, to) {
            return c;
        }
        let noop = match (from, to) {
            (a, b) if a == b => true,
            (Word { .. }, Word { .. }) | (Long { .. }, Long { .. }) | (Block(_), Block(_)) => true,
            (Byte { .. }, Word { .. }) => true,
            _ => false,
        };
        if noop {
            return v;
        }
        if let (Long { .. }, Word { .. }, Operand::Load(_)) = (from, to, &v) {
            return v;
        }
        let t = self.temp(to);
        self.emit(Prim::Cast {
            dst: Place::Slot(t, 0),
            to,
            src: v,
            from,
        });
        Operand::load(Place::Slot(t, 0))
    }

    fn fold_convert(v: &Operand, from: Repr, to: Repr) -> Option<Operand> {
        let int_bits = |r: Repr| match r {
            Repr::Byte { signed } => Some((8, signed)),
            Repr::Word { signed } => Some((16, signed)),
            Repr::Long { signed } => Some((32, signed)),
            _ => None,
        };
        match (v, int_bits(to)) {
            (Operand::Imm(i), Some((bits, signed))) => Some(Operand::Imm(wrap_bits(*i, bits, signed))),
            (Operand::Imm(i), None) if to.is_float() => {
                let value = if from.is_signed() { *i as f64 } else { *i as u64 as f64 };
                Some(Operand::Float(value))
            }
            (Operand::Float(f), Some((bits, signed))) => Some(Operand::Imm(wrap_bits(*f as i64, bits, signed))),
            (Operand::Float(f), None) if to.is_float() => {
                let value = if to == Repr::Float { *f as f32 as f64 } else { *f };
                Some(Operand::Float(value))
            }
            _ => None,
        }
    }

    fn base_adjust(&mut self, operand: &Expr, offset: i32, null_check: bool) -> Result<Operand> {
        let v = self.value(operand)?;
        if offset == 0 {
            return Ok(v);
        }
        let word = Repr::Word { signed: false };
        if let Operand::Addr(base, off) = v {
            return Ok(Operand::Addr(base, off + offset));
        }
        let t = self.temp(word);
        let dst = Place::Slot(t, 0);
        if !null_check {
            self.emit(Prim::Binary {
                op: BinaryOp::Add,
                repr: word,
                dst,
                lhs: v,
                rhs: Operand::Imm(offset as i64),
            });
            return Ok(Operand::load(Place::Slot(t, 0)));
        }
        let skip = self.new_label();
        self.emit(Prim::Assign {
            repr: word,
            dst: dst.clone(),
            src: v,
        });
        self.emit(Prim::Test {
            nonzero: false,
            repr: word,
            value: Operand::load(dst.clone()),
            target: skip,
        });
        self.emit(Prim::Binary {
            op: BinaryOp::Add,
            repr: word,
            dst: dst.clone(),
            lhs: Operand::load(dst.clone()),
            rhs: Operand::Imm(offset as i64),
        });
        self.label(skip);
        Ok(Operand::load(dst))
    }

    fn ternary(&mut self, e: &Expr, c: &Expr, a: &Expr, b: &Expr) -> Result<Operand> {
        if self.sess.types.is_void(e.ty) {
            self.effect(e)?;
            return Ok(Operand::Imm(0));
        }
        let repr = self.repr(e.ty);
        let t = self.temp(repr);
        let other = self.new_label();
        let end = self.new_label();
        self.ifgoto(c, false, other)?;
        self.assign_into(Place::Slot(t, 0), a)?;
        self.jump(end);
        self.label(other);
        self.assign_into(Place::Slot(t, 0), b)?;
        self.label(end);
        self.result_of(Place::Slot(t, 0), repr)
    }

    /// `({ ... })`: statements, then the value of the final expression
    fn statement_expression(&mut self, body: &crate::parser::Stmt) -> Result<Operand> {
        let items = match &body.kind {
            StmtKind::Block(items) => items.as_slice(),
            _ => std::slice::from_ref(body),
        };
        let (last, init) = match items.split_last() {
            Some(split) => split,
            None => return Ok(Operand::Imm(0)),
        };
        for s in init {
            self.stmt(s)?;
        }
        match &last.kind {
            StmtKind::Expr(e) => {
                self.loc = last.loc.clone();
                let v = self.value(e)?;
                if let Operand::Load(_) = v {
                    let repr = self.repr(e.ty);
                    if !matches!(repr, Repr::Block(_)) {
                        let t = self.temp(repr);
                        self.emit(Prim::Assign {
                            repr,
                            dst: Place::Slot(t, 0),
                            src: v,
                        });
                        return Ok(Operand::load(Place::Slot(t, 0)));
                    }
                }
                Ok(v)
            }
            _ => {
                self.stmt(last)?;
                Ok(Operand::Imm(0))
            }
        }
    }

    // ========================================================================
    // Calls
    // ========================================================================

    /// Lowers a call; returns the result value, or its address for values
    /// returned through memory
    pub(super) fn call(&mut self, e: &Expr) -> Result<Option<Operand>> {
        let (callee, args) = match &e.kind {
            ExprKind::Call { callee, args } => (callee, args),
            _ => return Err(Error::internal("call lowering of a non-call")),
        };
        let mut values = Vec::with_capacity(args.len() + 1);
        for a in args {
            let repr = self.repr(a.ty);
            values.push((self.value(a)?, repr));
        }
        let target = match callee {
            Callee::Direct(label) => CallTarget::Direct(label.clone()),
            Callee::Indirect(f) => CallTarget::Indirect(self.value(f)?),
            Callee::Virtual { receiver, slot } => {
                let word = Repr::Word { signed: false };
                let r = self.value(receiver)?;
                let t = self.temp(word);
                self.emit(Prim::Assign {
                    repr: word,
                    dst: Place::Slot(t, 0),
                    src: r,
                });
                let this = Operand::load(Place::Slot(t, 0));
                values.insert(0, (this.clone(), word));
                let vtable = Operand::load(Place::Indirect(Box::new(this), 0));
                CallTarget::Indirect(Operand::load(Place::Indirect(Box::new(vtable), *slot as i32)))
            }
        };

        let void = self.sess.types.is_void(e.ty);
        let hidden = !void && self.sess.types.returns_in_memory(e.ty);
        let repr = self.repr(e.ty);
        let result_slot = hidden.then(|| self.temp(repr));
        let words = hidden as u32 + values.iter().map(|(_, r)| r.words()).sum::<u32>();

        self.emit(Prim::CallStart(words));
        let mut at = 0u32;
        if let Some(slot) = result_slot {
            self.emit(Prim::Assign {
                repr: Repr::Word { signed: false },
                dst: Place::Arg(0),
                src: Operand::Addr(Base::Slot(slot), 0),
            });
            at = 1;
        }
        for (v, r) in values {
            self.emit(Prim::Assign {
                repr: r,
                dst: Place::Arg(at),
                src: v,
            });
            at += r.words();
        }

        let result = if void || hidden {
            None
        } else {
            Some((Place::Slot(self.temp(repr), 0), repr))
        };
        let value = result.as_ref().map(|(p, _)| Operand::load(p.clone()));
        self.emit(Prim::Call {
            target,
            words,
            result,
        });
        Ok(match result_slot {
            Some(slot) if matches!(repr, Repr::Block(_)) => Some(Operand::Addr(Base::Slot(slot), 0)),
            Some(slot) => Some(Operand::load(Place::Slot(slot, 0))),
            None => value,
        })
    }

    /// Comparison of two values for a conditional branch
    pub(super) fn compare(&mut self, cond: Cond, repr: Repr, lhs: Operand, rhs: Operand, target: LabelId) {
        let zero = |op: &Operand| matches!(op, Operand::Imm(0)) || matches!(op, Operand::Float(f) if *f == 0.0);
        let (cond, lhs, rhs) = if zero(&lhs) && !zero(&rhs) {
            (cond.swap(), rhs, lhs)
        } else {
            (cond, lhs, rhs)
        };
        if !zero(&rhs) {
            self.emit(Prim::Compare {
                cond,
                repr,
                lhs,
                rhs,
                target,
            });
            return;
        }
        let unsigned = !repr.is_signed();
        let test = |nonzero| Prim::Test {
            nonzero,
            repr,
            value: lhs.clone(),
            target,
        };
        let prim = match (cond, unsigned) {
            (Cond::Eq, _) | (Cond::Le, true) => test(false),
            (Cond::Ne, _) | (Cond::Gt, true) => test(true),
            (Cond::Lt, true) => return,
            (Cond::Ge, true) => Prim::Jump(target),
            _ => Prim::Compare {
                cond,
                repr,
                lhs: lhs.clone(),
                rhs,
                target,
            },
        };
        self.emit(prim);
    }
}
