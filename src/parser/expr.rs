//! Expression parsing and typing
//!
//! Expressions are parsed with an explicit operand stack and operator stack.
//! Prefix operators are pushed before their operand is read; postfix
//! operators, calls, subscripts and member access bind to the operand
//! immediately. A binary operator first reduces every stacked operator of
//! higher precedence (or equal precedence, for left-associative operators).
//!
//! A `?` sits on the operator stack as a barrier until its `:` arrives; a
//! `:` with no pending `?` ends the expression, which is how `case 1:` and
//! labels stop.

use super::ast::{BinaryOp, Callee, Expr, ExprKind, Stmt, StmtKind, UnaryOp};
use super::decl::DeclKind;
use super::fold::{fold, Const};
use super::scope::ScopeKind;
use super::Parser;
use crate::compiler::data::DataItem;
use crate::error::{Error, Result, SourceLoc};
use crate::lexer::{Keyword, Punct, TokenKind};
use crate::types::{ConstHint, Conversion, MemberRef, StructId, Type, TypeId};

#[derive(Debug, Clone, Copy, PartialEq)]
enum Prefix {
    Neg,
    Plus,
    Not,
    BitNot,
    AddrOf,
    Deref,
    PreInc,
    PreDec,
    Sizeof,
    Alignof,
    Cast(TypeId),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Op {
    Prefix(Prefix),
    Binary(BinaryOp),
    Logical { and: bool },
    Assign(Option<BinaryOp>),
    /// Pending `?`; only its `:` removes it
    Question,
    Ternary,
    Comma,
}

#[derive(Debug, Clone)]
struct Pending {
    op: Op,
    prec: u8,
    loc: SourceLoc,
}

const PREFIX_PREC: u8 = 15;

/// Binary operator for a token: operator, precedence, right-associative
fn binary_op(p: Punct) -> Option<(Op, u8, bool)> {
    use BinaryOp as B;
    let entry = match p {
        Punct::Star => (Op::Binary(B::Mul), 13, false),
        Punct::Slash => (Op::Binary(B::Div), 13, false),
        Punct::Percent => (Op::Binary(B::Mod), 13, false),
        Punct::Plus => (Op::Binary(B::Add), 12, false),
        Punct::Minus => (Op::Binary(B::Sub), 12, false),
        Punct::Shl => (Op::Binary(B::Shl), 11, false),
        Punct::Shr => (Op::Binary(B::Shr), 11, false),
        Punct::Lt => (Op::Binary(B::Lt), 10, false),
        Punct::LtEq => (Op::Binary(B::Le), 10, false),
        Punct::Gt => (Op::Binary(B::Gt), 10, false),
        Punct::GtEq => (Op::Binary(B::Ge), 10, false),
        Punct::EqEq => (Op::Binary(B::Eq), 9, false),
        Punct::NotEq => (Op::Binary(B::Ne), 9, false),
        Punct::Amp => (Op::Binary(B::And), 8, false),
        Punct::Caret => (Op::Binary(B::Xor), 7, false),
        Punct::Pipe => (Op::Binary(B::Or), 6, false),
        Punct::AndAnd => (Op::Logical { and: true }, 5, false),
        Punct::OrOr => (Op::Logical { and: false }, 4, false),
        Punct::Question => (Op::Question, 3, true),
        Punct::Assign => (Op::Assign(None), 2, true),
        Punct::PlusAssign => (Op::Assign(Some(B::Add)), 2, true),
        Punct::MinusAssign => (Op::Assign(Some(B::Sub)), 2, true),
        Punct::StarAssign => (Op::Assign(Some(B::Mul)), 2, true),
        Punct::SlashAssign => (Op::Assign(Some(B::Div)), 2, true),
        Punct::PercentAssign => (Op::Assign(Some(B::Mod)), 2, true),
        Punct::AmpAssign => (Op::Assign(Some(B::And)), 2, true),
        Punct::PipeAssign => (Op::Assign(Some(B::Or)), 2, true),
        Punct::CaretAssign => (Op::Assign(Some(B::Xor)), 2, true),
        Punct::ShlAssign => (Op::Assign(Some(B::Shl)), 2, true),
        Punct::ShrAssign => (Op::Assign(Some(B::Shr)), 2, true),
        Punct::Comma => (Op::Comma, 1, false),
        _ => return None,
    };
    Some(entry)
}

enum Resolved {
    Decl(super::decl::DeclId),
    Member(StructId, MemberRef),
}

impl Parser<'_> {
    /// Full expression, including the comma operator
    pub(super) fn expression(&mut self) -> Result<Expr> {
        self.expr_stack(true)
    }

    /// Expression without a top-level comma (arguments, initializers)
    pub(super) fn assignment_expr(&mut self) -> Result<Expr> {
        self.expr_stack(false)
    }

    fn expr_stack(&mut self, allow_comma: bool) -> Result<Expr> {
        let mut operands: Vec<Expr> = Vec::new();
        let mut ops: Vec<Pending> = Vec::new();
        loop {
            let operand = self.operand(&mut ops)?;
            operands.push(operand);

            let tok = self.peek().clone();
            let pending_q = ops.iter().any(|p| p.op == Op::Question);
            let punct = match tok.kind {
                TokenKind::Punct(p) => p,
                _ => break,
            };
            if punct == Punct::Colon {
                if !pending_q {
                    break;
                }
                self.next();
                while let Some(top) = ops.last() {
                    if top.op == Op::Question {
                        break;
                    }
                    self.reduce(&mut operands, &mut ops)?;
                }
                ops.pop();
                ops.push(Pending {
                    op: Op::Ternary,
                    prec: 3,
                    loc: tok.loc,
                });
                continue;
            }
            let (op, prec, right) = match binary_op(punct) {
                Some(entry) => entry,
                None => break,
            };
            if op == Op::Comma && !allow_comma && !pending_q {
                break;
            }
            self.next();
            while let Some(top) = ops.last() {
                if top.op == Op::Question {
                    break;
                }
                if top.prec > prec || (top.prec == prec && !right) {
                    self.reduce(&mut operands, &mut ops)?;
                } else {
                    break;
                }
            }
            ops.push(Pending {
                op,
                prec,
                loc: tok.loc,
            });
        }
        while let Some(top) = ops.last() {
            if top.op == Op::Question {
                return Err(Error::syntax(&top.loc, "expected ':' in conditional expression"));
            }
            self.reduce(&mut operands, &mut ops)?;
        }
        match (operands.pop(), operands.is_empty()) {
            (Some(e), true) => Ok(e),
            _ => Err(Error::internal("unbalanced expression stacks")),
        }
    }

    /// Pushes prefix operators, then reads one postfix expression
    fn operand(&mut self, ops: &mut Vec<Pending>) -> Result<Expr> {
        loop {
            let tok = self.peek().clone();
            let prefix = match &tok.kind {
                TokenKind::Punct(Punct::Minus) => Prefix::Neg,
                TokenKind::Punct(Punct::Plus) => Prefix::Plus,
                TokenKind::Punct(Punct::Bang) => Prefix::Not,
                TokenKind::Punct(Punct::Tilde) => Prefix::BitNot,
                TokenKind::Punct(Punct::Amp) => Prefix::AddrOf,
                TokenKind::Punct(Punct::Star) => Prefix::Deref,
                TokenKind::Punct(Punct::PlusPlus) => Prefix::PreInc,
                TokenKind::Punct(Punct::MinusMinus) => Prefix::PreDec,
                TokenKind::Keyword(k @ (Keyword::Sizeof | Keyword::Alignof | Keyword::UAlignof)) => {
                    let is_size = *k == Keyword::Sizeof;
                    self.next();
                    if self.peek_punct(Punct::LParen) && self.type_starts_at(1) {
                        self.next();
                        let ty = self.type_name()?;
                        self.expect(Punct::RParen)?;
                        return self.size_constant(ty, is_size, &tok.loc);
                    }
                    ops.push(Pending {
                        op: Op::Prefix(if is_size { Prefix::Sizeof } else { Prefix::Alignof }),
                        prec: PREFIX_PREC,
                        loc: tok.loc,
                    });
                    continue;
                }
                TokenKind::Punct(Punct::LParen) if self.type_starts_at(1) => {
                    self.next();
                    let ty = self.type_name()?;
                    self.expect(Punct::RParen)?;
                    ops.push(Pending {
                        op: Op::Prefix(Prefix::Cast(ty)),
                        prec: PREFIX_PREC,
                        loc: tok.loc,
                    });
                    continue;
                }
                _ => break,
            };
            self.next();
            ops.push(Pending {
                op: Op::Prefix(prefix),
                prec: PREFIX_PREC,
                loc: tok.loc,
            });
        }
        self.postfix_expr()
    }

    /// Whether the token `n` ahead starts a type name
    fn type_starts_at(&mut self, n: usize) -> bool {
        let tok = self.tokens.peek_nth(n);
        match &tok.kind {
            TokenKind::Keyword(k) => matches!(
                k,
                Keyword::Const
                    | Keyword::Volatile
                    | Keyword::Void
                    | Keyword::Char
                    | Keyword::Short
                    | Keyword::Int
                    | Keyword::Long
                    | Keyword::Float
                    | Keyword::Double
                    | Keyword::Signed
                    | Keyword::Unsigned
                    | Keyword::Struct
                    | Keyword::Union
                    | Keyword::Enum
            ),
            TokenKind::Ident(name) => self.is_typedef_name(name),
            _ => false,
        }
    }

    fn size_constant(&mut self, ty: TypeId, is_size: bool, loc: &SourceLoc) -> Result<Expr> {
        let types = &self.sess.types;
        let size = match types.size_of(ty) {
            Some(s) => s,
            None => {
                return Err(Error::semantic(
                    loc,
                    format!("invalid application of sizeof to '{}'", types.display(ty)),
                ))
            }
        };
        let value = if is_size { size } else { types.align_of(ty).unwrap_or(1) };
        Ok(Expr::new(ExprKind::Int(value as i64), TypeId::UINT, loc.clone()))
    }

    fn reduce(&mut self, operands: &mut Vec<Expr>, ops: &mut Vec<Pending>) -> Result<()> {
        let p = ops
            .pop()
            .ok_or_else(|| Error::internal("operator stack underflow"))?;
        let mut pop = || {
            operands
                .pop()
                .ok_or_else(|| Error::internal("operand stack underflow"))
        };
        let result = match p.op {
            Op::Prefix(pre) => {
                let e = pop()?;
                self.prefix(pre, e, &p.loc)?
            }
            Op::Binary(op) => {
                let rhs = pop()?;
                let lhs = pop()?;
                self.binary(op, lhs, rhs, &p.loc)?
            }
            Op::Logical { and } => {
                let rhs = pop()?;
                let lhs = pop()?;
                let lhs = self.condition(lhs)?;
                let rhs = self.condition(rhs)?;
                self.fold_node(Expr::new(
                    ExprKind::Logical {
                        and,
                        lhs: Box::new(lhs),
                        rhs: Box::new(rhs),
                    },
                    TypeId::INT,
                    p.loc,
                ))
            }
            Op::Assign(op) => {
                let rhs = pop()?;
                let lhs = pop()?;
                self.assign(op, lhs, rhs, &p.loc)?
            }
            Op::Ternary => {
                let b = pop()?;
                let a = pop()?;
                let c = pop()?;
                self.ternary(c, a, b, &p.loc)?
            }
            Op::Comma => {
                let rhs = pop()?;
                let lhs = pop()?;
                let rhs = self.decay(rhs);
                let ty = rhs.ty;
                Expr::new(ExprKind::Comma(Box::new(lhs), Box::new(rhs)), ty, p.loc)
            }
            Op::Question => return Err(Error::internal("reducing a pending '?'")),
        };
        operands.push(result);
        Ok(())
    }

    // ========================================================================
    // Postfix and primary expressions
    // ========================================================================

    fn postfix_expr(&mut self) -> Result<Expr> {
        let mut e = self.primary()?;
        loop {
            let tok = self.peek().clone();
            match tok.kind {
                TokenKind::Punct(Punct::LBracket) => {
                    self.next();
                    let idx = self.expression()?;
                    self.expect(Punct::RBracket)?;
                    let sum = self.binary(BinaryOp::Add, e, idx, &tok.loc)?;
                    e = self.prefix(Prefix::Deref, sum, &tok.loc)?;
                }
                TokenKind::Punct(Punct::LParen) => {
                    self.next();
                    e = self.call(e, &tok.loc)?;
                }
                TokenKind::Punct(Punct::Dot) => {
                    self.next();
                    let (name, nloc) = self.tokens.expect_ident()?;
                    e = self.member(e, &name, &nloc)?;
                }
                TokenKind::Punct(Punct::Arrow) => {
                    self.next();
                    let (name, nloc) = self.tokens.expect_ident()?;
                    let base = self.prefix(Prefix::Deref, e, &tok.loc)?;
                    e = self.member(base, &name, &nloc)?;
                }
                TokenKind::Punct(p @ (Punct::PlusPlus | Punct::MinusMinus)) => {
                    self.next();
                    e = self.inc_dec(e, false, p == Punct::PlusPlus, &tok.loc)?;
                }
                _ => return Ok(e),
            }
        }
    }

    fn primary(&mut self) -> Result<Expr> {
        let tok = self.next();
        let loc = tok.loc.clone();
        match tok.kind {
            TokenKind::Int {
                value,
                unsigned,
                long,
            } => {
                let v = value as i64;
                let ty = match (unsigned, long) {
                    (false, false) if v <= i16::MAX as i64 => TypeId::INT,
                    (_, false) if v <= u16::MAX as i64 => TypeId::UINT,
                    (false, _) if v <= i32::MAX as i64 => TypeId::LONG,
                    (_, _) if v <= u32::MAX as i64 => TypeId::ULONG,
                    _ => return Err(Error::semantic(&loc, "integer constant is too large")),
                };
                Ok(Expr::new(ExprKind::Int(v), ty, loc))
            }
            TokenKind::Float { value, single } => {
                let ty = if single { TypeId::FLOAT } else { TypeId::DOUBLE };
                let value = if single { value as f32 as f64 } else { value };
                Ok(Expr::new(ExprKind::Float(value), ty, loc))
            }
            TokenKind::Char(c) => Ok(Expr::int(c, loc)),
            TokenKind::Str(bytes) => {
                let label = self.data_label();
                let mut item = DataItem::string(label.clone(), &bytes);
                item.loc = Some(loc.clone());
                let ty = self.sess.types.array_of(TypeId::CHAR, Some(item.size));
                self.unit.data.push(item);
                Ok(Expr::new(ExprKind::Symbol(label), ty, loc))
            }
            TokenKind::Ident(name) => self.identifier(&name, &loc),
            TokenKind::Punct(Punct::LParen) => {
                if self.peek_punct(Punct::LBrace) {
                    return self.statement_expression(&loc);
                }
                let e = self.nested(|p| p.expression())?;
                self.expect(Punct::RParen)?;
                Ok(e)
            }
            other => {
                let err = Error::syntax(&loc, format!("expected expression before '{}'", other));
                self.tokens.push_back(crate::lexer::Token::new(other, loc));
                Err(err)
            }
        }
    }

    fn statement_expression(&mut self, loc: &SourceLoc) -> Result<Expr> {
        self.func_mut(loc)?;
        let body = self.compound_statement()?;
        self.expect(Punct::RParen)?;
        let ty = match &body.kind {
            StmtKind::Block(items) => match items.last() {
                Some(Stmt {
                    kind: StmtKind::Expr(e),
                    ..
                }) => e.ty,
                _ => TypeId::VOID,
            },
            _ => TypeId::VOID,
        };
        let ty = self.sess.types.decay(ty);
        Ok(Expr::new(ExprKind::StmtExpr(Box::new(body)), ty, loc.clone()))
    }

    fn resolve(&self, name: &str, loc: &SourceLoc) -> Result<Resolved> {
        let symbols = &self.sess.symbols;
        for s in symbols.chain(self.scope) {
            if let ScopeKind::Member(sid) = symbols.scope(s).kind {
                if let Some(m) = self.sess.types.find_member(sid, name) {
                    return Ok(Resolved::Member(sid, m));
                }
            }
            if let Some(d) = symbols.lookup_local(s, name) {
                return Ok(Resolved::Decl(d));
            }
        }
        Err(Error::semantic(loc, format!("undefined symbol '{}'", name)))
    }

    fn identifier(&mut self, name: &str, loc: &SourceLoc) -> Result<Expr> {
        match self.resolve(name, loc)? {
            Resolved::Decl(id) => {
                let decl = self.sess.symbols.decl(id).clone();
                match decl.kind {
                    DeclKind::Variable { ty, .. }
                    | DeclKind::StringConst { ty, .. }
                    | DeclKind::AsmLabel { ty, .. } => Ok(Expr::new(ExprKind::Var(id), ty, loc.clone())),
                    DeclKind::Function {
                        ty,
                        label,
                        member_of: None,
                        ..
                    } => Ok(Expr::new(ExprKind::Symbol(label), ty, loc.clone())),
                    DeclKind::Function { .. } => Err(Error::semantic(
                        loc,
                        format!("member function '{}' used without an object", name),
                    )),
                    DeclKind::EnumConst { value } => Ok(Expr::int(value, loc.clone())),
                    DeclKind::NumericConst { ty, value } => {
                        let ty = self.sess.types.unqualified(ty);
                        Ok(match value {
                            Const::Float(f) => Expr::new(ExprKind::Float(f), ty, loc.clone()),
                            Const::Int(v) => Expr::new(ExprKind::Int(v), ty, loc.clone()),
                            Const::Addr(l, _) => Expr::new(ExprKind::Symbol(l), ty, loc.clone()),
                        })
                    }
                    DeclKind::Typedef { .. } => Err(Error::syntax(
                        loc,
                        format!("unexpected type name '{}'", name),
                    )),
                }
            }
            Resolved::Member(sid, m) => {
                let this = self.this_for(sid, name, loc)?;
                match m {
                    MemberRef::Field { .. } => {
                        let obj = self.prefix(Prefix::Deref, this, loc)?;
                        self.member(obj, name, loc)
                    }
                    MemberRef::Method { .. } => {
                        self.expect(Punct::LParen)?;
                        self.method_call(this, sid, name, false, loc)
                    }
                }
            }
        }
    }

    /// `this` of the enclosing member function, which must belong to `sid`
    fn this_for(&self, sid: StructId, name: &str, loc: &SourceLoc) -> Result<Expr> {
        match self.func.as_ref().and_then(|f| f.this) {
            Some((decl, this_sid)) if this_sid == sid => {
                let ty = self.sess.symbols.decl(decl).ty().unwrap_or(TypeId::VOID_PTR);
                Ok(Expr::new(ExprKind::Var(decl), ty, loc.clone()))
            }
            _ => Err(Error::semantic(
                loc,
                format!("member '{}' used without an object", name),
            )),
        }
    }

    // ========================================================================
    // Members and calls
    // ========================================================================

    fn member(&mut self, base: Expr, name: &str, loc: &SourceLoc) -> Result<Expr> {
        let sid = match self.sess.types.as_struct(base.ty) {
            Some(s) => s,
            None => {
                return Err(Error::semantic(
                    loc,
                    format!(
                        "request for member '{}' in something not a struct ('{}')",
                        name,
                        self.sess.types.display(base.ty)
                    ),
                ))
            }
        };
        if !self.sess.types.struct_def(sid).complete {
            return Err(Error::semantic(loc, "member access into incomplete type"));
        }
        match self.sess.types.find_member(sid, name) {
            Some(MemberRef::Field { ty, offset }) => {
                let is_const = self.sess.types.is_const(base.ty);
                let ty = self.sess.types.qualified(ty, is_const, false);
                Ok(Expr::new(
                    ExprKind::Member {
                        base: Box::new(base),
                        offset,
                    },
                    ty,
                    loc.clone(),
                ))
            }
            Some(MemberRef::Method { .. }) => {
                self.expect(Punct::LParen)?;
                let object = matches!(base.kind, ExprKind::Var(_) | ExprKind::Member { .. });
                if !base.is_lvalue() {
                    return Err(Error::semantic(loc, "member function called on an rvalue"));
                }
                let this = self.address_of(base, loc)?;
                self.method_call(this, sid, name, object, loc)
            }
            None => Err(Error::semantic(
                loc,
                format!(
                    "no member named '{}' in '{}'",
                    name,
                    self.sess.types.display(base.ty)
                ),
            )),
        }
    }

    /// Calls a member function; `(` has been consumed
    fn method_call(
        &mut self,
        this: Expr,
        sid: StructId,
        name: &str,
        object: bool,
        loc: &SourceLoc,
    ) -> Result<Expr> {
        let args = self.arguments()?;
        let (owner_offset, method) = match self.sess.types.find_member(sid, name) {
            Some(MemberRef::Method {
                owner_offset,
                method,
                ..
            }) => (owner_offset, method),
            _ => return Err(Error::semantic(loc, format!("no member function '{}'", name))),
        };

        if method.is_virtual {
            let vs = self
                .sess
                .types
                .find_vslot(sid, name)
                .ok_or_else(|| Error::internal(format!("virtual '{}' has no slot", name)))?;
            let args = self.check_args(vs.entry.fn_ty, args, loc)?;
            let ret = self.return_type(vs.entry.fn_ty);
            if object {
                if vs.entry.is_pure() {
                    return Err(Error::semantic(
                        loc,
                        format!("call to pure virtual function '{}'", name),
                    ));
                }
                let this = self.adjust_pointer(this, vs.entry.impl_offset as i32, loc);
                let mut all = vec![this];
                all.extend(args);
                return Ok(Expr::new(
                    ExprKind::Call {
                        callee: Callee::Direct(vs.entry.label.clone()),
                        args: all,
                    },
                    ret,
                    loc.clone(),
                ));
            }
            let receiver = self.adjust_pointer(this, vs.vptr_offset as i32, loc);
            return Ok(Expr::new(
                ExprKind::Call {
                    callee: Callee::Virtual {
                        receiver: Box::new(receiver),
                        slot: vs.slot as u32,
                    },
                    args,
                },
                ret,
                loc.clone(),
            ));
        }

        let args = self.check_args(method.fn_ty, args, loc)?;
        let ret = self.return_type(method.fn_ty);
        let this = self.adjust_pointer(this, owner_offset as i32, loc);
        let mut all = vec![this];
        all.extend(args);
        Ok(Expr::new(
            ExprKind::Call {
                callee: Callee::Direct(method.label),
                args: all,
            },
            ret,
            loc.clone(),
        ))
    }

    /// Pointer moved by a word offset; offset zero leaves it alone
    fn adjust_pointer(&mut self, ptr: Expr, offset: i32, loc: &SourceLoc) -> Expr {
        if offset == 0 {
            return ptr;
        }
        let ty = ptr.ty;
        Expr::new(
            ExprKind::BaseAdjust {
                operand: Box::new(ptr),
                offset,
                null_check: false,
            },
            ty,
            loc.clone(),
        )
    }

    fn return_type(&self, fn_ty: TypeId) -> TypeId {
        match self.sess.types.kind(fn_ty) {
            Type::Function { ret, .. } => *ret,
            _ => TypeId::VOID,
        }
    }

    fn arguments(&mut self) -> Result<Vec<Expr>> {
        let mut args = Vec::new();
        if self.eat(Punct::RParen) {
            return Ok(args);
        }
        loop {
            args.push(self.assignment_expr()?);
            if self.eat(Punct::Comma) {
                continue;
            }
            self.expect(Punct::RParen)?;
            return Ok(args);
        }
    }

    fn call(&mut self, callee: Expr, loc: &SourceLoc) -> Result<Expr> {
        let args = self.arguments()?;
        let (callee, fn_ty) = match callee.kind {
            ExprKind::Symbol(label) if self.sess.types.is_function(callee.ty) => {
                (Callee::Direct(label), callee.ty)
            }
            _ => {
                let f = self.decay(callee);
                match self.sess.types.pointee(f.ty) {
                    Some(fty) if self.sess.types.is_function(fty) => (Callee::Indirect(Box::new(f)), fty),
                    _ => {
                        return Err(Error::semantic(
                            loc,
                            format!("called object of type '{}' is not a function", self.sess.types.display(f.ty)),
                        ))
                    }
                }
            }
        };
        let fn_ty = self.sess.types.unqualified(fn_ty);
        let args = self.check_args(fn_ty, args, loc)?;
        let ret = self.return_type(fn_ty);
        Ok(Expr::new(ExprKind::Call { callee, args }, ret, loc.clone()))
    }

    fn check_args(&mut self, fn_ty: TypeId, args: Vec<Expr>, loc: &SourceLoc) -> Result<Vec<Expr>> {
        let (params, varargs) = match self.sess.types.kind(fn_ty) {
            Type::Function {
                params, varargs, ..
            } => (params.clone(), *varargs),
            _ => return Err(Error::internal("call through a non-function type")),
        };
        if args.len() < params.len() || (!varargs && args.len() > params.len()) {
            return Err(Error::semantic(
                loc,
                format!(
                    "wrong number of arguments: expected {}, got {}",
                    params.len(),
                    args.len()
                ),
            ));
        }
        let mut out = Vec::with_capacity(args.len());
        for (i, a) in args.into_iter().enumerate() {
            let converted = match params.get(i) {
                Some(p) => self.convert(a, *p)?,
                None => {
                    let a = self.decay(a);
                    let to = match self.sess.types.kind(a.ty) {
                        Type::Float { .. } => TypeId::DOUBLE,
                        Type::Int { .. } => self.sess.types.promote(a.ty),
                        _ => self.sess.types.unqualified(a.ty),
                    };
                    self.numeric_cast(a, to)
                }
            };
            if let Some(sid) = self.sess.types.as_struct(converted.ty) {
                self.mark_struct_used(sid);
            }
            out.push(converted);
        }
        Ok(out)
    }

    // ========================================================================
    // Operators
    // ========================================================================

    fn prefix(&mut self, op: Prefix, e: Expr, loc: &SourceLoc) -> Result<Expr> {
        let loc = loc.clone();
        match op {
            Prefix::Neg | Prefix::Plus | Prefix::BitNot => {
                let e = self.decay(e);
                let ok = if op == Prefix::BitNot {
                    self.sess.types.is_integer(e.ty)
                } else {
                    self.sess.types.is_arith(e.ty)
                };
                if !ok {
                    return Err(Error::semantic(
                        &loc,
                        format!("invalid operand type '{}' to unary operator", self.sess.types.display(e.ty)),
                    ));
                }
                let ty = self.sess.types.promote(e.ty);
                let e = self.numeric_cast(e, ty);
                if op == Prefix::Plus {
                    return Ok(e);
                }
                let uop = if op == Prefix::Neg { UnaryOp::Neg } else { UnaryOp::BitNot };
                Ok(self.fold_node(Expr::new(ExprKind::Unary(uop, Box::new(e)), ty, loc)))
            }
            Prefix::Not => {
                let e = self.condition(e)?;
                Ok(self.fold_node(Expr::new(
                    ExprKind::Unary(UnaryOp::LogNot, Box::new(e)),
                    TypeId::INT,
                    loc,
                )))
            }
            Prefix::AddrOf => self.address_of(e, &loc),
            Prefix::Deref => {
                let e = self.decay(e);
                let pointee = match self.sess.types.pointee(e.ty) {
                    Some(p) => p,
                    None => {
                        return Err(Error::semantic(
                            &loc,
                            format!("cannot dereference '{}'", self.sess.types.display(e.ty)),
                        ))
                    }
                };
                if self.sess.types.is_void(pointee) {
                    return Err(Error::semantic(&loc, "dereferencing 'void*'"));
                }
                Ok(Expr::new(ExprKind::Deref(Box::new(e)), pointee, loc))
            }
            Prefix::PreInc | Prefix::PreDec => self.inc_dec(e, true, op == Prefix::PreInc, &loc),
            Prefix::Sizeof | Prefix::Alignof => {
                if self.sess.types.is_function(e.ty) {
                    return Err(Error::semantic(&loc, "invalid application of sizeof to a function"));
                }
                self.size_constant(e.ty, op == Prefix::Sizeof, &loc)
            }
            Prefix::Cast(ty) => self.cast(e, ty, &loc),
        }
    }

    fn address_of(&mut self, e: Expr, loc: &SourceLoc) -> Result<Expr> {
        if let ExprKind::Symbol(_) = e.kind {
            if self.sess.types.is_function(e.ty) || self.sess.types.is_array(e.ty) {
                let ty = self.sess.types.pointer_to(e.ty);
                return Ok(Expr { ty, ..e });
            }
        }
        if !e.is_lvalue() {
            return Err(Error::semantic(loc, "cannot take the address of an rvalue"));
        }
        let ty = self.sess.types.pointer_to(e.ty);
        Ok(Expr::new(ExprKind::AddrOf(Box::new(e)), ty, loc.clone()))
    }

    /// Arrays become element pointers, functions become function pointers
    pub(super) fn decay(&mut self, e: Expr) -> Expr {
        let types = &mut self.sess.types;
        if let Some(elem) = types.element(e.ty) {
            let ty = types.pointer_to(elem);
            return match e.kind {
                ExprKind::Symbol(_) => Expr { ty, ..e },
                _ => {
                    let loc = e.loc.clone();
                    Expr::new(ExprKind::AddrOf(Box::new(e)), ty, loc)
                }
            };
        }
        if types.is_function(e.ty) {
            let ty = types.pointer_to(types.unqualified(e.ty));
            return Expr { ty, ..e };
        }
        e
    }

    /// Operand of a truth test
    pub(super) fn condition(&mut self, e: Expr) -> Result<Expr> {
        let e = self.decay(e);
        if !self.sess.types.is_scalar(e.ty) {
            return Err(Error::semantic(
                &e.loc,
                format!("used '{}' where a scalar is required", self.sess.types.display(e.ty)),
            ));
        }
        Ok(e)
    }

    /// Conversion inserted by the compiler, never checked
    fn numeric_cast(&mut self, e: Expr, to: TypeId) -> Expr {
        let to = self.sess.types.unqualified(to);
        if self.sess.types.unqualified(e.ty) == to {
            return e;
        }
        let loc = e.loc.clone();
        self.fold_node(Expr::new(ExprKind::Cast(Box::new(e)), to, loc))
    }

    /// Replaces a constant subtree with its value
    fn fold_node(&self, e: Expr) -> Expr {
        let types = &self.sess.types;
        match fold(&e, types, &self.sess.symbols) {
            Some(Const::Int(v)) if types.is_integer(e.ty) || types.is_pointer(e.ty) => {
                Expr::new(ExprKind::Int(v), e.ty, e.loc)
            }
            Some(Const::Float(v)) if types.is_float(e.ty) => Expr::new(ExprKind::Float(v), e.ty, e.loc),
            _ => e,
        }
    }

    fn binary(&mut self, op: BinaryOp, lhs: Expr, rhs: Expr, loc: &SourceLoc) -> Result<Expr> {
        let lhs = self.decay(lhs);
        let rhs = self.decay(rhs);
        let (lp, rp) = (
            self.sess.types.is_pointer(lhs.ty),
            self.sess.types.is_pointer(rhs.ty),
        );
        if op.is_comparison() {
            return self.comparison(op, lhs, rhs, loc);
        }
        match (op, lp, rp) {
            (BinaryOp::Add, true, false) => return self.pointer_offset(BinaryOp::Add, lhs, rhs, loc),
            (BinaryOp::Add, false, true) => return self.pointer_offset(BinaryOp::Add, rhs, lhs, loc),
            (BinaryOp::Sub, true, false) => return self.pointer_offset(BinaryOp::Sub, lhs, rhs, loc),
            (BinaryOp::Sub, true, true) => return self.pointer_difference(lhs, rhs, loc),
            _ => {}
        }

        let integer_only = matches!(
            op,
            BinaryOp::Mod | BinaryOp::And | BinaryOp::Or | BinaryOp::Xor | BinaryOp::Shl | BinaryOp::Shr
        );
        let t = &self.sess.types;
        let ok = if integer_only {
            t.is_integer(lhs.ty) && t.is_integer(rhs.ty)
        } else {
            t.is_arith(lhs.ty) && t.is_arith(rhs.ty)
        };
        if !ok {
            return Err(Error::semantic(
                loc,
                format!(
                    "invalid operands to binary '{}' ('{}' and '{}')",
                    op.as_str(),
                    t.display(lhs.ty),
                    t.display(rhs.ty)
                ),
            ));
        }
        let (lt, rt) = if matches!(op, BinaryOp::Shl | BinaryOp::Shr) {
            (t.promote(lhs.ty), TypeId::INT)
        } else {
            let c = t.common_type(lhs.ty, rhs.ty);
            (c, c)
        };
        let lhs = self.numeric_cast(lhs, lt);
        let rhs = self.numeric_cast(rhs, rt);
        Ok(self.fold_node(Expr::new(
            ExprKind::Binary(op, Box::new(lhs), Box::new(rhs)),
            lt,
            loc.clone(),
        )))
    }

    fn pointee_size(&self, ptr_ty: TypeId, loc: &SourceLoc) -> Result<u32> {
        let t = &self.sess.types;
        t.pointee(ptr_ty)
            .and_then(|p| t.size_of(p))
            .ok_or_else(|| {
                Error::semantic(
                    loc,
                    format!("arithmetic on a pointer to an incomplete type '{}'", t.display(ptr_ty)),
                )
            })
    }

    /// Index scaled by the pointee size, as an `int`
    fn scaled_index(&mut self, idx: Expr, size: u32, loc: &SourceLoc) -> Result<Expr> {
        if !self.sess.types.is_integer(idx.ty) {
            return Err(Error::semantic(loc, "pointer offset must be an integer"));
        }
        let idx = self.numeric_cast(idx, TypeId::INT);
        if size == 1 {
            return Ok(idx);
        }
        let n = Expr::new(ExprKind::Int(size as i64), TypeId::INT, loc.clone());
        Ok(self.fold_node(Expr::new(
            ExprKind::Binary(BinaryOp::Mul, Box::new(idx), Box::new(n)),
            TypeId::INT,
            loc.clone(),
        )))
    }

    fn pointer_offset(&mut self, op: BinaryOp, ptr: Expr, idx: Expr, loc: &SourceLoc) -> Result<Expr> {
        let size = self.pointee_size(ptr.ty, loc)?;
        let scaled = self.scaled_index(idx, size, loc)?;
        let ty = self.sess.types.unqualified(ptr.ty);
        Ok(self.fold_node(Expr::new(
            ExprKind::Binary(op, Box::new(ptr), Box::new(scaled)),
            ty,
            loc.clone(),
        )))
    }

    fn pointer_difference(&mut self, lhs: Expr, rhs: Expr, loc: &SourceLoc) -> Result<Expr> {
        let t = &self.sess.types;
        let (lp, rp) = (t.pointee(lhs.ty), t.pointee(rhs.ty));
        let same = match (lp, rp) {
            (Some(a), Some(b)) => t.unqualified(a) == t.unqualified(b),
            _ => false,
        };
        if !same {
            return Err(Error::semantic(
                loc,
                format!(
                    "subtraction of incompatible pointers '{}' and '{}'",
                    t.display(lhs.ty),
                    t.display(rhs.ty)
                ),
            ));
        }
        let size = self.pointee_size(lhs.ty, loc)?;
        let l = self.numeric_cast(lhs, TypeId::INT);
        let r = self.numeric_cast(rhs, TypeId::INT);
        let diff = self.fold_node(Expr::new(
            ExprKind::Binary(BinaryOp::Sub, Box::new(l), Box::new(r)),
            TypeId::INT,
            loc.clone(),
        ));
        if size == 1 {
            return Ok(diff);
        }
        let n = Expr::new(ExprKind::Int(size as i64), TypeId::INT, loc.clone());
        Ok(self.fold_node(Expr::new(
            ExprKind::Binary(BinaryOp::Div, Box::new(diff), Box::new(n)),
            TypeId::INT,
            loc.clone(),
        )))
    }

    fn comparison(&mut self, op: BinaryOp, lhs: Expr, rhs: Expr, loc: &SourceLoc) -> Result<Expr> {
        let t = &self.sess.types;
        let (lp, rp) = (t.is_pointer(lhs.ty), t.is_pointer(rhs.ty));
        let (lhs, rhs) = if t.is_arith(lhs.ty) && t.is_arith(rhs.ty) {
            let c = t.common_type(lhs.ty, rhs.ty);
            (self.numeric_cast(lhs, c), self.numeric_cast(rhs, c))
        } else if lp && rp {
            let ok = !matches!(
                t.assign_conversion(rhs.ty, lhs.ty, None),
                Conversion::Invalid(_)
            ) || !matches!(
                t.assign_conversion(lhs.ty, rhs.ty, None),
                Conversion::Invalid(_)
            );
            if !ok {
                return Err(Error::semantic(
                    loc,
                    format!(
                        "comparison of incompatible pointer types '{}' and '{}'",
                        t.display(lhs.ty),
                        t.display(rhs.ty)
                    ),
                ));
            }
            let lt = t.unqualified(lhs.ty);
            (lhs, self.numeric_cast(rhs, lt))
        } else if lp && self.is_null_constant(&rhs) {
            let lt = self.sess.types.unqualified(lhs.ty);
            (lhs, self.numeric_cast(rhs, lt))
        } else if rp && self.is_null_constant(&lhs) {
            let rt = self.sess.types.unqualified(rhs.ty);
            (self.numeric_cast(lhs, rt), rhs)
        } else {
            let t = &self.sess.types;
            return Err(Error::semantic(
                loc,
                format!(
                    "invalid operands to binary '{}' ('{}' and '{}')",
                    op.as_str(),
                    t.display(lhs.ty),
                    t.display(rhs.ty)
                ),
            ));
        };
        Ok(self.fold_node(Expr::new(
            ExprKind::Binary(op, Box::new(lhs), Box::new(rhs)),
            TypeId::INT,
            loc.clone(),
        )))
    }

    fn is_null_constant(&self, e: &Expr) -> bool {
        self.sess.types.is_integer(e.ty) && matches!(e.kind, ExprKind::Int(0))
    }

    fn check_modifiable(&self, e: &Expr, loc: &SourceLoc) -> Result<()> {
        let t = &self.sess.types;
        if !e.is_lvalue() {
            return Err(Error::semantic(loc, "assignment to a non-lvalue"));
        }
        if t.is_const(e.ty) {
            return Err(Error::semantic(loc, "assignment to a const object"));
        }
        if t.is_array(e.ty) || t.is_function(e.ty) {
            return Err(Error::semantic(
                loc,
                format!("cannot assign to '{}'", t.display(e.ty)),
            ));
        }
        if let ExprKind::Var(d) = e.kind {
            if matches!(self.sess.symbols.decl(d).kind, DeclKind::StringConst { .. }) {
                return Err(Error::semantic(loc, "assignment to a const object"));
            }
        }
        Ok(())
    }

    fn assign(&mut self, op: Option<BinaryOp>, lhs: Expr, rhs: Expr, loc: &SourceLoc) -> Result<Expr> {
        self.check_modifiable(&lhs, loc)?;
        let ty = self.sess.types.unqualified(lhs.ty);
        let op = match op {
            None => {
                let rhs = self.convert(rhs, ty)?;
                return Ok(Expr::new(
                    ExprKind::Assign(Box::new(lhs), Box::new(rhs)),
                    ty,
                    loc.clone(),
                ));
            }
            Some(op) => op,
        };
        let rhs = self.decay(rhs);
        let t = &self.sess.types;
        let (rhs, op_ty) = if t.is_pointer(ty) && matches!(op, BinaryOp::Add | BinaryOp::Sub) {
            let size = self.pointee_size(ty, loc)?;
            (self.scaled_index(rhs, size, loc)?, ty)
        } else {
            let integer_only = matches!(
                op,
                BinaryOp::Mod | BinaryOp::And | BinaryOp::Or | BinaryOp::Xor | BinaryOp::Shl | BinaryOp::Shr
            );
            let ok = if integer_only {
                t.is_integer(ty) && t.is_integer(rhs.ty)
            } else {
                t.is_arith(ty) && t.is_arith(rhs.ty)
            };
            if !ok {
                return Err(Error::semantic(
                    loc,
                    format!(
                        "invalid operands to '{}=' ('{}' and '{}')",
                        op.as_str(),
                        t.display(ty),
                        t.display(rhs.ty)
                    ),
                ));
            }
            if matches!(op, BinaryOp::Shl | BinaryOp::Shr) {
                let op_ty = t.promote(ty);
                (self.numeric_cast(rhs, TypeId::INT), op_ty)
            } else {
                let op_ty = t.common_type(ty, rhs.ty);
                (self.numeric_cast(rhs, op_ty), op_ty)
            }
        };
        Ok(Expr::new(
            ExprKind::CompoundAssign {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                op_ty,
            },
            ty,
            loc.clone(),
        ))
    }

    fn inc_dec(&mut self, e: Expr, pre: bool, inc: bool, loc: &SourceLoc) -> Result<Expr> {
        self.check_modifiable(&e, loc)?;
        let ty = self.sess.types.unqualified(e.ty);
        let step = if self.sess.types.is_pointer(ty) {
            self.pointee_size(ty, loc)? as i64
        } else if self.sess.types.is_arith(ty) {
            1
        } else {
            return Err(Error::semantic(
                loc,
                format!("cannot increment '{}'", self.sess.types.display(ty)),
            ));
        };
        Ok(Expr::new(
            ExprKind::IncDec {
                pre,
                inc,
                operand: Box::new(e),
                step,
            },
            ty,
            loc.clone(),
        ))
    }

    fn ternary(&mut self, c: Expr, a: Expr, b: Expr, loc: &SourceLoc) -> Result<Expr> {
        let c = self.condition(c)?;
        let a = self.decay(a);
        let b = self.decay(b);
        let t = &self.sess.types;
        let (a, b, ty) = if t.is_arith(a.ty) && t.is_arith(b.ty) {
            let ty = t.common_type(a.ty, b.ty);
            (self.numeric_cast(a, ty), self.numeric_cast(b, ty), ty)
        } else if t.unqualified(a.ty) == t.unqualified(b.ty) {
            let ty = t.unqualified(a.ty);
            (a, b, ty)
        } else if t.is_pointer(a.ty) && self.is_null_constant(&b) {
            let ty = self.sess.types.unqualified(a.ty);
            let b = self.numeric_cast(b, ty);
            (a, b, ty)
        } else if t.is_pointer(b.ty) && self.is_null_constant(&a) {
            let ty = self.sess.types.unqualified(b.ty);
            let a = self.numeric_cast(a, ty);
            (a, b, ty)
        } else if t.is_pointer(a.ty) && t.is_pointer(b.ty) {
            let target = if t.pointee(a.ty).map(|p| t.is_void(p)).unwrap_or(false) {
                a.ty
            } else {
                b.ty
            };
            let a = self.convert(a, target)?;
            let b = self.convert(b, target)?;
            (a, b, self.sess.types.unqualified(target))
        } else {
            return Err(Error::semantic(
                loc,
                format!(
                    "type mismatch in conditional expression ('{}' and '{}')",
                    t.display(a.ty),
                    t.display(b.ty)
                ),
            ));
        };
        if let Some(truth) = fold(&c, &self.sess.types, &self.sess.symbols).and_then(|v| v.truth()) {
            return Ok(if truth { a } else { b });
        }
        Ok(Expr::new(
            ExprKind::Ternary(Box::new(c), Box::new(a), Box::new(b)),
            ty,
            loc.clone(),
        ))
    }

    // ========================================================================
    // Conversions
    // ========================================================================

    /// Implicit conversion for assignment, initialization, arguments and
    /// return values
    pub(super) fn convert(&mut self, e: Expr, to: TypeId) -> Result<Expr> {
        let e = self.decay(e);
        let to_u = self.sess.types.unqualified(to);
        let hint = match fold(&e, &self.sess.types, &self.sess.symbols) {
            Some(Const::Int(v)) if self.sess.types.is_integer(e.ty) => Some(ConstHint::Int(v)),
            Some(Const::Float(v)) => Some(ConstHint::Float(v)),
            _ => None,
        };
        match self.sess.types.assign_conversion(e.ty, to, hint) {
            Conversion::Identity => Ok(e),
            Conversion::Numeric | Conversion::Reinterpret => Ok(self.numeric_cast(e, to_u)),
            Conversion::BaseAdjust(offset) => {
                let loc = e.loc.clone();
                Ok(Expr::new(
                    ExprKind::BaseAdjust {
                        operand: Box::new(e),
                        offset,
                        null_check: true,
                    },
                    to_u,
                    loc,
                ))
            }
            Conversion::Invalid(msg) => Err(Error::semantic(&e.loc, msg)),
        }
    }

    fn cast(&mut self, e: Expr, to: TypeId, loc: &SourceLoc) -> Result<Expr> {
        let e = self.decay(e);
        let to_u = self.sess.types.unqualified(to);
        if self.sess.types.as_struct(to_u).is_some() && self.sess.types.unqualified(e.ty) != to_u {
            return Err(Error::semantic(loc, "cast to a struct type"));
        }
        match self.sess.types.cast_conversion(e.ty, to) {
            Conversion::Identity => Ok(e),
            Conversion::Numeric | Conversion::Reinterpret => {
                Ok(self.fold_node(Expr::new(ExprKind::Cast(Box::new(e)), to_u, loc.clone())))
            }
            Conversion::BaseAdjust(offset) => Ok(Expr::new(
                ExprKind::BaseAdjust {
                    operand: Box::new(e),
                    offset,
                    null_check: true,
                },
                to_u,
                loc.clone(),
            )),
            Conversion::Invalid(msg) => Err(Error::semantic(loc, msg)),
        }
    }

    /// Value of an integer constant expression
    pub(super) fn const_int(&mut self, e: &Expr) -> Result<i64> {
        if !self.sess.types.is_integer(e.ty) {
            return Err(Error::semantic(&e.loc, "expected an integer constant expression"));
        }
        match fold(e, &self.sess.types, &self.sess.symbols) {
            Some(Const::Int(v)) => Ok(v),
            _ => Err(Error::semantic(&e.loc, "expected an integer constant expression")),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::parser::ast::{ExprKind, StmtKind};
    use crate::parser::tests::parse_src;

    fn return_expr(src: &str) -> ExprKind {
        let (sess, unit) = parse_src(src);
        assert!(!sess.has_errors(), "{:?}", sess.diags.errors());
        let body = &unit.functions.last().unwrap().body;
        match &body.kind {
            StmtKind::Block(items) => match &items.last().unwrap().kind {
                StmtKind::Return(Some(e)) => e.kind.clone(),
                other => panic!("not a return: {:?}", other),
            },
            other => panic!("not a block: {:?}", other),
        }
    }

    #[test]
    fn test_constant_precedence() {
        assert_eq!(return_expr("int f(void) { return 1 + 2 * 3; }"), ExprKind::Int(7));
        assert_eq!(return_expr("int f(void) { return (1 + 2) * 3; }"), ExprKind::Int(9));
        assert_eq!(return_expr("int f(void) { return 10 - 4 - 3; }"), ExprKind::Int(3));
        assert_eq!(return_expr("int f(void) { return 1 << 2 + 1; }"), ExprKind::Int(8));
    }

    #[test]
    fn test_ternary_right_associative() {
        assert_eq!(
            return_expr("int f(void) { return 0 ? 1 : 0 ? 2 : 3; }"),
            ExprKind::Int(3)
        );
        assert_eq!(
            return_expr("int f(void) { return 1 ? 0 ? 5 : 6 : 7; }"),
            ExprKind::Int(6)
        );
    }

    #[test]
    fn test_sizeof_forms() {
        assert_eq!(return_expr("int f(void) { return sizeof(long); }"), ExprKind::Int(2));
        assert_eq!(
            return_expr("double d; int f(void) { return sizeof d + 1; }"),
            ExprKind::Int(5)
        );
        assert_eq!(
            return_expr("struct S { int a; long b; }; int f(void) { return sizeof(struct S); }"),
            ExprKind::Int(3)
        );
        assert_eq!(return_expr("int f(void) { return sizeof \"abc\"; }"), ExprKind::Int(4));
    }

    #[test]
    fn test_pointer_difference_folds() {
        // (p + n) - p == n for a global array
        assert_eq!(
            return_expr("long a[10]; int f(void) { return (a + 3) - a; }"),
            ExprKind::Int(3)
        );
    }

    #[test]
    fn test_pointer_offset_is_scaled() {
        let e = return_expr("long *f(long *p, int n) { return p + n; }");
        match e {
            ExprKind::Binary(_, _, rhs) => match rhs.kind {
                ExprKind::Binary(crate::parser::BinaryOp::Mul, _, n) => {
                    assert_eq!(n.kind, ExprKind::Int(2))
                }
                other => panic!("unscaled offset: {:?}", other),
            },
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_derived_pointer_converts_to_base() {
        let src = "struct A { int a; }; struct B { int b; }; struct C : A, B { int c; };\n\
                   struct B *f(struct C *p) { return p; }";
        match return_expr(src) {
            ExprKind::BaseAdjust {
                offset, null_check, ..
            } => {
                assert_eq!(offset, 1);
                assert!(null_check);
            }
            other => panic!("expected adjustment, got {:?}", other),
        }
    }

    #[test]
    fn test_base_to_derived_needs_cast() {
        let src = "struct A { int a; }; struct C : A { int c; };\n\
                   struct C *f(struct A *p) { return p; }";
        let (sess, _) = parse_src(src);
        assert!(sess.has_errors());
    }
}
