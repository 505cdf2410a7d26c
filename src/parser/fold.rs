//! Compile-time evaluation of typed expressions
//!
//! Integer results wrap to the width of the node's type: 8 and 16 bits for
//! `char`/`int` and pointers, 32 bits for `long`. Signed division truncates
//! toward zero and the remainder takes the sign of the dividend.

use super::ast::{BinaryOp, Expr, ExprKind, UnaryOp};
use super::decl::{DeclKind, VarLocation};
use super::scope::Symbols;
use crate::types::{Type, TypeId, TypeTable};

/// A folded constant
#[derive(Debug, Clone, PartialEq)]
pub enum Const {
    /// Integer value, already wrapped to its type
    Int(i64),
    /// Floating value
    Float(f64),
    /// Address of a label plus a word offset
    Addr(String, i64),
}

impl Const {
    /// Truth value, when known at compile time
    pub fn truth(&self) -> Option<bool> {
        match self {
            Const::Int(v) => Some(*v != 0),
            Const::Float(v) => Some(*v != 0.0),
            Const::Addr(..) => Some(true),
        }
    }

    /// Integer payload
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Const::Int(v) => Some(*v),
            _ => None,
        }
    }
}

/// Wraps an integer to the width and signedness of `ty`
pub fn wrap(types: &TypeTable, ty: TypeId, value: i64) -> i64 {
    match types.int_info(ty) {
        Some((bits, signed)) => wrap_bits(value, bits as u32, signed),
        None => value,
    }
}

/// Wraps to `bits` bits, sign-extending when `signed`
pub fn wrap_bits(value: i64, bits: u32, signed: bool) -> i64 {
    let mask = (1i64 << bits) - 1;
    let v = value & mask;
    if signed && v & (1i64 << (bits - 1)) != 0 {
        v - (1i64 << bits)
    } else {
        v
    }
}

/// Evaluates `expr`, or `None` when it is not a constant
pub fn fold(expr: &Expr, types: &TypeTable, symbols: &Symbols) -> Option<Const> {
    Folder { types, symbols }.eval(expr)
}

struct Folder<'a> {
    types: &'a TypeTable,
    symbols: &'a Symbols,
}

impl Folder<'_> {
    fn eval(&self, e: &Expr) -> Option<Const> {
        match &e.kind {
            ExprKind::Int(v) => Some(Const::Int(wrap(self.types, e.ty, *v))),
            ExprKind::Float(v) => Some(Const::Float(self.round(e.ty, *v))),
            ExprKind::Symbol(label) => Some(Const::Addr(label.clone(), 0)),
            ExprKind::AddrOf(inner) => self.address(inner),
            ExprKind::Unary(op, operand) => {
                let v = self.eval(operand)?;
                self.unary(*op, e.ty, v)
            }
            ExprKind::Binary(op, lhs, rhs) => {
                let l = self.eval(lhs)?;
                let r = self.eval(rhs)?;
                self.binary(*op, lhs.ty, e.ty, l, r)
            }
            ExprKind::Logical { and, lhs, rhs } => {
                let l = self.eval(lhs)?.truth()?;
                if l != *and {
                    return Some(Const::Int(l as i64));
                }
                let r = self.eval(rhs)?.truth()?;
                Some(Const::Int(r as i64))
            }
            ExprKind::Cast(inner) => {
                let v = self.eval(inner)?;
                self.convert(v, inner.ty, e.ty)
            }
            ExprKind::BaseAdjust {
                operand, offset, ..
            } => match self.eval(operand)? {
                Const::Int(0) => Some(Const::Int(0)),
                Const::Addr(l, o) => Some(Const::Addr(l, o + *offset as i64)),
                _ => None,
            },
            ExprKind::Ternary(c, a, b) => {
                if self.eval(c)?.truth()? {
                    self.eval(a)
                } else {
                    self.eval(b)
                }
            }
            _ => None,
        }
    }

    fn round(&self, ty: TypeId, v: f64) -> f64 {
        if matches!(self.types.kind(ty), Type::Float { bits: 32 }) {
            v as f32 as f64
        } else {
            v
        }
    }

    /// Address of a global object, possibly through members and derefs
    fn address(&self, e: &Expr) -> Option<Const> {
        match &e.kind {
            ExprKind::Var(id) => match &self.symbols.decl(*id).kind {
                DeclKind::Variable {
                    location: VarLocation::Global(label),
                    ..
                } => Some(Const::Addr(label.clone(), 0)),
                DeclKind::StringConst { label, .. } | DeclKind::AsmLabel { label, .. } => {
                    Some(Const::Addr(label.clone(), 0))
                }
                _ => None,
            },
            ExprKind::Member { base, offset } => match self.address(base)? {
                Const::Addr(l, o) => Some(Const::Addr(l, o + *offset as i64)),
                Const::Int(v) => Some(Const::Int(v + *offset as i64)),
                _ => None,
            },
            ExprKind::Deref(inner) => self.eval(inner),
            _ => None,
        }
    }

    fn unary(&self, op: UnaryOp, ty: TypeId, v: Const) -> Option<Const> {
        match (op, v) {
            (UnaryOp::LogNot, v) => Some(Const::Int(!v.truth()? as i64)),
            (UnaryOp::Neg, Const::Int(v)) => Some(Const::Int(wrap(self.types, ty, v.wrapping_neg()))),
            (UnaryOp::Neg, Const::Float(v)) => Some(Const::Float(-v)),
            (UnaryOp::BitNot, Const::Int(v)) => Some(Const::Int(wrap(self.types, ty, !v))),
            _ => None,
        }
    }

    fn binary(
        &self,
        op: BinaryOp,
        operand_ty: TypeId,
        ty: TypeId,
        l: Const,
        r: Const,
    ) -> Option<Const> {
        match (l, r) {
            (Const::Int(a), Const::Int(b)) => self.int_binary(op, operand_ty, ty, a, b),
            (Const::Float(a), Const::Float(b)) => {
                let v = match op {
                    BinaryOp::Add => a + b,
                    BinaryOp::Sub => a - b,
                    BinaryOp::Mul => a * b,
                    BinaryOp::Div => a / b,
                    BinaryOp::Eq => return Some(Const::Int((a == b) as i64)),
                    BinaryOp::Ne => return Some(Const::Int((a != b) as i64)),
                    BinaryOp::Lt => return Some(Const::Int((a < b) as i64)),
                    BinaryOp::Le => return Some(Const::Int((a <= b) as i64)),
                    BinaryOp::Gt => return Some(Const::Int((a > b) as i64)),
                    BinaryOp::Ge => return Some(Const::Int((a >= b) as i64)),
                    _ => return None,
                };
                Some(Const::Float(self.round(ty, v)))
            }
            (Const::Addr(label, off), Const::Int(n)) => match op {
                BinaryOp::Add => Some(Const::Addr(label, off + n)),
                BinaryOp::Sub => Some(Const::Addr(label, off - n)),
                _ => None,
            },
            (Const::Int(n), Const::Addr(label, off)) if op == BinaryOp::Add => {
                Some(Const::Addr(label, off + n))
            }
            (Const::Addr(la, oa), Const::Addr(lb, ob)) if la == lb => match op {
                BinaryOp::Sub => Some(Const::Int(wrap(self.types, ty, oa - ob))),
                BinaryOp::Eq => Some(Const::Int((oa == ob) as i64)),
                BinaryOp::Ne => Some(Const::Int((oa != ob) as i64)),
                _ => None,
            },
            _ => None,
        }
    }

    fn int_binary(
        &self,
        op: BinaryOp,
        operand_ty: TypeId,
        ty: TypeId,
        a: i64,
        b: i64,
    ) -> Option<Const> {
        let unsigned = self.types.is_unsigned(operand_ty);
        let bits = self
            .types
            .int_info(operand_ty)
            .map(|(b, _)| b as u32)
            .unwrap_or(16);
        // Operands are stored wrapped to their own signedness; compare and
        // divide in the operand type's domain.
        let norm = |v: i64| wrap_bits(v, bits, !unsigned);
        let (a, b) = (norm(a), norm(b));
        let v = match op {
            BinaryOp::Add => a.wrapping_add(b),
            BinaryOp::Sub => a.wrapping_sub(b),
            BinaryOp::Mul => a.wrapping_mul(b),
            BinaryOp::Div => {
                if b == 0 {
                    return None;
                }
                a / b
            }
            BinaryOp::Mod => {
                if b == 0 {
                    return None;
                }
                a % b
            }
            BinaryOp::And => a & b,
            BinaryOp::Or => a | b,
            BinaryOp::Xor => a ^ b,
            BinaryOp::Shl => {
                if !(0..64).contains(&b) {
                    0
                } else {
                    a << b
                }
            }
            BinaryOp::Shr => {
                if !(0..64).contains(&b) {
                    if a < 0 {
                        -1
                    } else {
                        0
                    }
                } else {
                    a >> b
                }
            }
            BinaryOp::Eq => return Some(Const::Int((a == b) as i64)),
            BinaryOp::Ne => return Some(Const::Int((a != b) as i64)),
            BinaryOp::Lt => return Some(Const::Int((a < b) as i64)),
            BinaryOp::Le => return Some(Const::Int((a <= b) as i64)),
            BinaryOp::Gt => return Some(Const::Int((a > b) as i64)),
            BinaryOp::Ge => return Some(Const::Int((a >= b) as i64)),
        };
        Some(Const::Int(wrap(self.types, ty, v)))
    }

    fn convert(&self, v: Const, from: TypeId, to: TypeId) -> Option<Const> {
        let t = self.types;
        if t.is_void(to) {
            return None;
        }
        match v {
            Const::Int(n) if t.is_float(to) => {
                let n = if t.is_unsigned(from) {
                    let bits = t.int_info(from).map(|(b, _)| b as u32).unwrap_or(16);
                    wrap_bits(n, bits, false)
                } else {
                    n
                };
                Some(Const::Float(self.round(to, n as f64)))
            }
            Const::Int(n) => Some(Const::Int(wrap(t, to, n))),
            Const::Float(f) if t.is_float(to) => Some(Const::Float(self.round(to, f))),
            Const::Float(f) if t.is_integer(to) => Some(Const::Int(wrap(t, to, f.trunc() as i64))),
            Const::Float(_) => None,
            Const::Addr(l, o) if t.is_pointer(to) || t.size_of(to) == Some(1) => {
                Some(Const::Addr(l, o))
            }
            Const::Addr(..) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SourceLoc;
    use proptest::prelude::*;

    fn int(v: i64, ty: TypeId) -> Expr {
        Expr::new(ExprKind::Int(v), ty, SourceLoc::builtin())
    }

    fn bin(op: BinaryOp, a: Expr, b: Expr, ty: TypeId) -> Expr {
        Expr::new(
            ExprKind::Binary(op, Box::new(a), Box::new(b)),
            ty,
            SourceLoc::builtin(),
        )
    }

    fn eval(e: &Expr) -> Option<Const> {
        let types = TypeTable::new();
        let symbols = Symbols::new();
        fold(e, &types, &symbols)
    }

    #[test]
    fn test_precedence_tree_folds() {
        let e = bin(
            BinaryOp::Add,
            int(1, TypeId::INT),
            bin(BinaryOp::Mul, int(2, TypeId::INT), int(3, TypeId::INT), TypeId::INT),
            TypeId::INT,
        );
        assert_eq!(eval(&e), Some(Const::Int(7)));
    }

    #[test]
    fn test_int_wraps_at_16_bits() {
        let e = bin(BinaryOp::Add, int(32767, TypeId::INT), int(1, TypeId::INT), TypeId::INT);
        assert_eq!(eval(&e), Some(Const::Int(-32768)));
        let e = bin(BinaryOp::Sub, int(0, TypeId::UINT), int(1, TypeId::UINT), TypeId::UINT);
        assert_eq!(eval(&e), Some(Const::Int(65535)));
    }

    #[test]
    fn test_long_wraps_at_32_bits() {
        let e = bin(
            BinaryOp::Mul,
            int(65536, TypeId::LONG),
            int(32768, TypeId::LONG),
            TypeId::LONG,
        );
        assert_eq!(eval(&e), Some(Const::Int(i32::MIN as i64)));
    }

    #[test]
    fn test_unsigned_comparison() {
        let e = bin(BinaryOp::Lt, int(65535, TypeId::UINT), int(1, TypeId::UINT), TypeId::INT);
        assert_eq!(eval(&e), Some(Const::Int(0)));
        let e = bin(BinaryOp::Lt, int(-1, TypeId::INT), int(1, TypeId::INT), TypeId::INT);
        assert_eq!(eval(&e), Some(Const::Int(1)));
    }

    #[test]
    fn test_division_by_zero_is_not_constant() {
        let e = bin(BinaryOp::Div, int(1, TypeId::INT), int(0, TypeId::INT), TypeId::INT);
        assert_eq!(eval(&e), None);
    }

    #[test]
    fn test_address_arithmetic() {
        let sym = Expr::new(
            ExprKind::Symbol("L3".into()),
            TypeId::CHAR_PTR,
            SourceLoc::builtin(),
        );
        let e = bin(BinaryOp::Add, sym, int(4, TypeId::INT), TypeId::CHAR_PTR);
        assert_eq!(eval(&e), Some(Const::Addr("L3".into(), 4)));
    }

    #[test]
    fn test_cast_int_to_char_and_float() {
        let c = Expr::new(
            ExprKind::Cast(Box::new(int(300, TypeId::INT))),
            TypeId::CHAR,
            SourceLoc::builtin(),
        );
        assert_eq!(eval(&c), Some(Const::Int(44)));
        let f = Expr::new(
            ExprKind::Cast(Box::new(int(-3, TypeId::INT))),
            TypeId::DOUBLE,
            SourceLoc::builtin(),
        );
        assert_eq!(eval(&f), Some(Const::Float(-3.0)));
    }

    proptest! {
        #[test]
        fn prop_signed_division_identity(a in -32768i64..=32767, b in -32768i64..=32767) {
            prop_assume!(b != 0);
            let q = eval(&bin(BinaryOp::Div, int(a, TypeId::INT), int(b, TypeId::INT), TypeId::INT));
            let r = eval(&bin(BinaryOp::Mod, int(a, TypeId::INT), int(b, TypeId::INT), TypeId::INT));
            let (q, r) = (q.unwrap().as_int().unwrap(), r.unwrap().as_int().unwrap());
            prop_assert_eq!(wrap_bits(q * b + r, 16, true), a);
            prop_assert!(r == 0 || (r < 0) == (a < 0));
        }

        #[test]
        fn prop_add_matches_i16_wrapping(a in any::<i16>(), b in any::<i16>()) {
            let e = bin(BinaryOp::Add, int(a as i64, TypeId::INT), int(b as i64, TypeId::INT), TypeId::INT);
            prop_assert_eq!(eval(&e), Some(Const::Int(a.wrapping_add(b) as i64)));
        }

        #[test]
        fn prop_long_mul_matches_i32_wrapping(a in any::<i32>(), b in any::<i32>()) {
            let e = bin(BinaryOp::Mul, int(a as i64, TypeId::LONG), int(b as i64, TypeId::LONG), TypeId::LONG);
            prop_assert_eq!(eval(&e), Some(Const::Int(a.wrapping_mul(b) as i64)));
        }
    }
}
