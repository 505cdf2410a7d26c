//! Statements and blocks

use super::ast::{Callee, Catch, Expr, ExprKind, Stmt, StmtKind, TryInfo};
use super::decl::{Decl, DeclId, DeclKind, Storage, VarLocation};
use super::scope::{ScopeKind, TryId};
use super::{Parser, SwitchCtx};
use crate::error::{Error, Result, SourceLoc};
use crate::lexer::{Keyword, Punct, TokenKind};
use crate::types::{StructId, TypeId};

/// A local whose struct must be terminated when its block exits
struct Guarded {
    decl: DeclId,
    sid: StructId,
    loc: SourceLoc,
}

impl Parser<'_> {
    fn stmt(&self, kind: StmtKind, loc: SourceLoc) -> Stmt {
        Stmt {
            kind,
            scope: self.scope,
            loc,
        }
    }

    /// `{ ... }` with its own block scope
    pub(super) fn compound_statement(&mut self) -> Result<Stmt> {
        let open = self.expect(Punct::LBrace)?;
        let outer = self.scope;
        self.enter_scope(ScopeKind::Block);
        let items = self.block_items();
        self.scope = outer;
        Ok(self.stmt(StmtKind::Block(items?), open.loc))
    }

    /// Block items up to and including the closing brace
    fn block_items(&mut self) -> Result<Vec<Stmt>> {
        let mut items = Vec::new();
        loop {
            if self.eat(Punct::RBrace) {
                return Ok(items);
            }
            if self.tokens.at_end() {
                return self.unexpected("'}'");
            }
            if self.starts_declaration() {
                let (stmts, guarded) = self.local_declaration()?;
                items.extend(stmts);
                if !guarded.is_empty() {
                    items.push(self.guarded_rest(guarded)?);
                    return Ok(items);
                }
                continue;
            }
            items.push(self.statement()?);
        }
    }

    /// The rest of a block after locals that need terminating. Each local
    /// gets an implicit try whose finally calls its term function.
    fn guarded_rest(&mut self, guarded: Vec<Guarded>) -> Result<Stmt> {
        let outer = self.scope;
        let mut frames = Vec::new();
        for g in guarded {
            let parent = self.scope;
            let id = self.new_try(true, &g.loc)?;
            let scope = self.enter_scope(ScopeKind::Try(id));
            frames.push((id, parent, scope, g));
        }
        let rest = self.block_items();
        self.scope = outer;
        let rest = rest?;

        let mut body: Option<Stmt> = None;
        for (id, parent, scope, g) in frames.into_iter().rev() {
            let inner = match body.take() {
                Some(s) => vec![s],
                None => rest.clone(),
            };
            let block = Stmt {
                kind: StmtKind::Block(inner),
                scope,
                loc: g.loc.clone(),
            };
            let term = self.term_call(g.decl, g.sid, &g.loc);
            let fin = Stmt {
                kind: StmtKind::Expr(term),
                scope: parent,
                loc: g.loc.clone(),
            };
            body = Some(Stmt {
                kind: StmtKind::Try {
                    id,
                    body: Box::new(block),
                    catch: None,
                    finally: Some(Box::new(fin)),
                },
                scope: parent,
                loc: g.loc,
            });
        }
        body.ok_or_else(|| Error::internal("guarded block without locals"))
    }

    fn term_call(&mut self, decl: DeclId, sid: StructId, loc: &SourceLoc) -> Expr {
        let label = self.sess.types.struct_def(sid).term_label();
        let sty = self.sess.types.struct_type(sid);
        let pty = self.sess.types.pointer_to(sty);
        let var = Expr::new(ExprKind::Var(decl), sty, loc.clone());
        let this = Expr::new(ExprKind::AddrOf(Box::new(var)), pty, loc.clone());
        Expr::new(
            ExprKind::Call {
                callee: Callee::Direct(label),
                args: vec![this],
            },
            TypeId::VOID,
            loc.clone(),
        )
    }

    fn new_try(&mut self, has_finally: bool, loc: &SourceLoc) -> Result<TryId> {
        let f = self.func_mut(loc)?;
        let id = TryId(f.tries.len() as u32);
        f.tries.push(TryInfo { has_finally });
        Ok(id)
    }

    /// Local declaration statement; returns the definitions and the locals
    /// that need terminating
    fn local_declaration(&mut self) -> Result<(Vec<Stmt>, Vec<Guarded>)> {
        let spec = self.specifiers()?;
        if spec.is_virtual {
            return Err(Error::syntax(&spec.loc, "'virtual' outside of a struct"));
        }
        let mut stmts = Vec::new();
        let mut guarded = Vec::new();
        if self.eat(Punct::Semi) {
            return Ok((stmts, guarded));
        }
        loop {
            let d = self.declarator()?;
            let (ty, params) = self.apply_declarator(spec.ty, &d)?;
            let asm = self.asm_label_opt()?;
            if let Some((decl, stmt)) = self.declare_object(&spec, &d, ty, params, asm, true)? {
                let dty = self.sess.symbols.decl(decl).ty().unwrap_or(ty);
                if let Some(sid) = self.sess.types.as_struct(dty) {
                    if self.sess.types.struct_def(sid).needs_term {
                        guarded.push(Guarded {
                            decl,
                            sid,
                            loc: stmt.loc.clone(),
                        });
                    }
                }
                stmts.push(stmt);
            }
            if self.eat(Punct::Comma) {
                continue;
            }
            self.expect(Punct::Semi)?;
            return Ok((stmts, guarded));
        }
    }

    fn asm_label_opt(&mut self) -> Result<Option<String>> {
        if self.peek_keyword(Keyword::Asm) {
            let loc = self.loc();
            return Err(Error::syntax(&loc, "__asm label on a local variable"));
        }
        Ok(None)
    }

    // ========================================================================
    // Statements
    // ========================================================================

    pub(super) fn statement(&mut self) -> Result<Stmt> {
        self.nested(Self::plain_statement)
    }

    fn plain_statement(&mut self) -> Result<Stmt> {
        let tok = self.peek().clone();
        let loc = tok.loc.clone();
        match &tok.kind {
            TokenKind::Punct(Punct::LBrace) => self.compound_statement(),
            TokenKind::Punct(Punct::Semi) => {
                self.next();
                Ok(self.stmt(StmtKind::Empty, loc))
            }
            TokenKind::Keyword(k) => match k {
                Keyword::If => self.if_statement(),
                Keyword::While => self.while_statement(),
                Keyword::Do => self.do_statement(),
                Keyword::For => self.for_statement(),
                Keyword::Switch => self.switch_statement(),
                Keyword::Case => self.case_label(),
                Keyword::Default => self.default_label(),
                Keyword::Break => {
                    self.next();
                    self.expect(Punct::Semi)?;
                    let f = self.func_mut(&loc)?;
                    if f.breakables.is_empty() {
                        return Err(Error::semantic(&loc, "break statement not within loop or switch"));
                    }
                    Ok(self.stmt(StmtKind::Break, loc))
                }
                Keyword::Continue => {
                    self.next();
                    self.expect(Punct::Semi)?;
                    let f = self.func_mut(&loc)?;
                    if !f.breakables.iter().any(|is_loop| *is_loop) {
                        return Err(Error::semantic(&loc, "continue statement not within a loop"));
                    }
                    Ok(self.stmt(StmtKind::Continue, loc))
                }
                Keyword::Goto => {
                    self.next();
                    let (name, _) = self.tokens.expect_ident()?;
                    self.expect(Punct::Semi)?;
                    let scope = self.scope;
                    self.func_mut(&loc)?.gotos.push((name.clone(), scope, loc.clone()));
                    Ok(self.stmt(StmtKind::Goto(name), loc))
                }
                Keyword::Return => self.return_statement(),
                Keyword::Try => self.try_statement(),
                Keyword::Throw => self.throw_statement(),
                Keyword::Catch | Keyword::Finally => {
                    Err(Error::syntax(&loc, format!("'{}' without a preceding try", tok.kind)))
                }
                Keyword::Else => Err(Error::syntax(&loc, "'else' without a previous 'if'")),
                _ => self.expression_statement(),
            },
            TokenKind::Ident(name) if self.tokens.peek_nth(1).is_punct(Punct::Colon) => {
                let name = name.clone();
                self.next();
                self.next();
                let scope = self.scope;
                let f = self.func_mut(&loc)?;
                if let Some((_, prior)) = f.labels.get(&name) {
                    return Err(Error::redefinition(&loc, &name, prior));
                }
                f.labels.insert(name.clone(), (scope, loc.clone()));
                let inner = if self.peek_punct(Punct::RBrace) {
                    self.stmt(StmtKind::Empty, loc.clone())
                } else {
                    self.statement()?
                };
                Ok(self.stmt(StmtKind::Label(name, Box::new(inner)), loc))
            }
            _ => self.expression_statement(),
        }
    }

    fn expression_statement(&mut self) -> Result<Stmt> {
        let loc = self.loc();
        let e = self.expression()?;
        self.expect(Punct::Semi)?;
        Ok(self.stmt(StmtKind::Expr(e), loc))
    }

    fn paren_condition(&mut self) -> Result<Expr> {
        self.expect(Punct::LParen)?;
        let e = self.expression()?;
        self.expect(Punct::RParen)?;
        self.condition(e)
    }

    fn if_statement(&mut self) -> Result<Stmt> {
        let loc = self.next().loc;
        let cond = self.paren_condition()?;
        let then = Box::new(self.statement()?);
        let otherwise = if self.tokens.eat_keyword(Keyword::Else) {
            Some(Box::new(self.statement()?))
        } else {
            None
        };
        Ok(self.stmt(
            StmtKind::If {
                cond,
                then,
                otherwise,
            },
            loc,
        ))
    }

    /// Body of a loop or switch; `is_loop` decides whether `continue` may
    /// target it
    fn breakable_body(&mut self, is_loop: bool, loc: &SourceLoc) -> Result<Stmt> {
        self.func_mut(loc)?.breakables.push(is_loop);
        let body = self.statement();
        self.func_mut(loc)?.breakables.pop();
        body
    }

    fn while_statement(&mut self) -> Result<Stmt> {
        let loc = self.next().loc;
        let cond = self.paren_condition()?;
        let body = Box::new(self.breakable_body(true, &loc)?);
        Ok(self.stmt(StmtKind::While { cond, body }, loc))
    }

    fn do_statement(&mut self) -> Result<Stmt> {
        let loc = self.next().loc;
        let body = Box::new(self.breakable_body(true, &loc)?);
        if !self.tokens.eat_keyword(Keyword::While) {
            return self.unexpected("'while'");
        }
        let cond = self.paren_condition()?;
        self.expect(Punct::Semi)?;
        Ok(self.stmt(StmtKind::DoWhile { body, cond }, loc))
    }

    fn for_statement(&mut self) -> Result<Stmt> {
        let loc = self.next().loc;
        self.expect(Punct::LParen)?;
        let outer = self.scope;
        self.enter_scope(ScopeKind::Block);
        let result = self.for_clauses(loc);
        self.scope = outer;
        Ok(Stmt {
            scope: outer,
            ..result?
        })
    }

    /// Clauses and body of a `for`, parsed in its own scope
    fn for_clauses(&mut self, loc: SourceLoc) -> Result<Stmt> {
        let init = if self.eat(Punct::Semi) {
            None
        } else if self.starts_declaration() {
            let (stmts, guarded) = self.local_declaration()?;
            if !guarded.is_empty() {
                return Err(Error::semantic(
                    &loc,
                    "a for-loop variable that needs terminating is not supported",
                ));
            }
            Some(Box::new(self.stmt(StmtKind::Block(stmts), loc.clone())))
        } else {
            let s = self.expression_statement()?;
            Some(Box::new(s))
        };
        let cond = if self.peek_punct(Punct::Semi) {
            None
        } else {
            let e = self.expression()?;
            Some(self.condition(e)?)
        };
        self.expect(Punct::Semi)?;
        let step = if self.peek_punct(Punct::RParen) {
            None
        } else {
            Some(self.expression()?)
        };
        self.expect(Punct::RParen)?;
        let body = Box::new(self.breakable_body(true, &loc)?);
        Ok(self.stmt(
            StmtKind::For {
                init,
                cond,
                step,
                body,
            },
            loc,
        ))
    }

    fn switch_statement(&mut self) -> Result<Stmt> {
        let loc = self.next().loc;
        self.expect(Punct::LParen)?;
        let e = self.expression()?;
        self.expect(Punct::RParen)?;
        let e = self.decay(e);
        if !self.sess.types.is_integer(e.ty) {
            return Err(Error::semantic(&loc, "switch quantity is not an integer"));
        }
        let value_ty = self.sess.types.promote(e.ty);
        let value = self.convert(e, value_ty)?;
        let scope = self.scope;
        self.func_mut(&loc)?.switches.push(SwitchCtx {
            value_ty,
            scope,
            cases: Vec::new(),
            default: None,
        });
        let body = self.breakable_body(false, &loc);
        let ctx = self
            .func_mut(&loc)?
            .switches
            .pop()
            .ok_or_else(|| Error::internal("switch context lost"))?;
        Ok(self.stmt(
            StmtKind::Switch {
                value,
                body: Box::new(body?),
                cases: ctx.cases,
                default: ctx.default,
            },
            loc,
        ))
    }

    /// Checks that a case label sits in the switch's try context and hands
    /// out its marker index
    fn case_marker(&mut self, loc: &SourceLoc) -> Result<usize> {
        let scope = self.scope;
        let switch_scope = match self.func_mut(loc)?.switches.last() {
            Some(s) => s.scope,
            None => return Err(Error::semantic(loc, "case label not within a switch statement")),
        };
        if !self.sess.symbols.crossed_tries(scope, switch_scope).is_empty() {
            return Err(Error::semantic(loc, "case label inside a try block of its switch"));
        }
        let f = self.func_mut(loc)?;
        let idx = f.cases;
        f.cases += 1;
        Ok(idx)
    }

    fn labeled_tail(&mut self, idx: usize, loc: SourceLoc) -> Result<Stmt> {
        self.expect(Punct::Colon)?;
        let marker = self.stmt(StmtKind::Case(idx), loc.clone());
        let inner = if self.peek_punct(Punct::RBrace) {
            self.stmt(StmtKind::Empty, loc.clone())
        } else {
            self.statement()?
        };
        Ok(self.stmt(StmtKind::Block(vec![marker, inner]), loc))
    }

    fn case_label(&mut self) -> Result<Stmt> {
        let loc = self.next().loc;
        let e = self.assignment_expr()?;
        let value_ty = match self.func_mut(&loc)?.switches.last() {
            Some(s) => s.value_ty,
            None => return Err(Error::semantic(&loc, "case label not within a switch statement")),
        };
        let v = self.const_int(&e)?;
        let v = super::fold::wrap(&self.sess.types, value_ty, v);
        let idx = self.case_marker(&loc)?;
        let f = self.func_mut(&loc)?;
        let ctx = f
            .switches
            .last_mut()
            .ok_or_else(|| Error::internal("switch context lost"))?;
        if ctx.cases.iter().any(|(cv, _)| *cv == v) {
            return Err(Error::semantic(&loc, format!("duplicate case value {}", v)));
        }
        ctx.cases.push((v, idx));
        self.labeled_tail(idx, loc)
    }

    fn default_label(&mut self) -> Result<Stmt> {
        let loc = self.next().loc;
        let idx = self.case_marker(&loc)?;
        let ctx = self
            .func_mut(&loc)?
            .switches
            .last_mut()
            .ok_or_else(|| Error::internal("switch context lost"))?;
        if ctx.default.is_some() {
            return Err(Error::semantic(&loc, "multiple default labels in one switch"));
        }
        ctx.default = Some(idx);
        self.labeled_tail(idx, loc)
    }

    fn return_statement(&mut self) -> Result<Stmt> {
        let loc = self.next().loc;
        let ret = self.func_mut(&loc)?.ret;
        let is_void = self.sess.types.is_void(ret);
        if self.eat(Punct::Semi) {
            if !is_void {
                return Err(Error::semantic(&loc, "return with no value in a function returning non-void"));
            }
            return Ok(self.stmt(StmtKind::Return(None), loc));
        }
        let e = self.expression()?;
        self.expect(Punct::Semi)?;
        if is_void {
            if !self.sess.types.is_void(e.ty) {
                return Err(Error::semantic(&loc, "return with a value in a function returning void"));
            }
            return Ok(self.stmt(StmtKind::Return(Some(e)), loc));
        }
        let e = self.convert(e, ret)?;
        Ok(self.stmt(StmtKind::Return(Some(e)), loc))
    }

    fn try_statement(&mut self) -> Result<Stmt> {
        let loc = self.next().loc;
        let id = self.new_try(false, &loc)?;
        let outer = self.scope;

        self.enter_scope(ScopeKind::Try(id));
        let body = self.compound_statement();
        self.scope = outer;
        let body = body?;

        let catch = if self.tokens.eat_keyword(Keyword::Catch) {
            self.enter_scope(ScopeKind::Catch(id));
            let clause = self.catch_clause(&loc);
            self.scope = outer;
            Some(clause?)
        } else {
            None
        };
        if self.peek_keyword(Keyword::Catch) {
            return Err(Error::semantic(&self.loc(), "only one catch clause is supported"));
        }
        let finally = if self.tokens.eat_keyword(Keyword::Finally) {
            Some(Box::new(self.compound_statement()?))
        } else {
            None
        };
        if catch.is_none() && finally.is_none() {
            return Err(Error::syntax(&loc, "try without catch or finally"));
        }
        if let Some(info) = self.func_mut(&loc)?.tries.get_mut(id.0 as usize) {
            info.has_finally = finally.is_some();
        }
        Ok(self.stmt(
            StmtKind::Try {
                id,
                body: Box::new(body),
                catch,
                finally,
            },
            loc,
        ))
    }

    /// `catch (T name) { ... }`, `catch (T)`, `catch (...)` or a bare
    /// `catch { ... }`; runs in the catch scope
    fn catch_clause(&mut self, loc: &SourceLoc) -> Result<Catch> {
        let mut binding: Option<(String, TypeId, SourceLoc)> = None;
        if self.eat(Punct::LParen) {
            if !self.eat(Punct::Ellipsis) {
                let ty = self.type_name_prefix()?;
                let name = match &self.peek().kind {
                    TokenKind::Ident(_) => Some(self.tokens.expect_ident()?),
                    _ => None,
                };
                let size = self.sess.types.size_of(ty);
                if size != Some(1) || !self.sess.types.is_scalar(ty) {
                    return Err(Error::semantic(
                        loc,
                        format!("caught type '{}' must be a one-word scalar", self.sess.types.display(ty)),
                    ));
                }
                if let Some((n, nloc)) = name {
                    binding = Some((n, ty, nloc));
                }
            }
            self.expect(Punct::RParen)?;
        }

        let scope = self.scope;
        let var = match binding {
            Some((name, ty, nloc)) => self.sess.symbols.declare(Decl {
                name,
                kind: DeclKind::Variable {
                    ty,
                    storage: Storage::None,
                    location: VarLocation::Local,
                },
                scope,
                loc: nloc,
            }),
            None => self.sess.symbols.declare_hidden(Decl {
                name: "__exc".into(),
                kind: DeclKind::Variable {
                    ty: TypeId::INT,
                    storage: Storage::None,
                    location: VarLocation::Local,
                },
                scope,
                loc: loc.clone(),
            }),
        };

        self.func_mut(loc)?.catches.push(var);
        let body = self.compound_statement();
        self.func_mut(loc)?.catches.pop();
        Ok(Catch {
            var,
            body: Box::new(body?),
        })
    }

    /// Specifiers plus abstract pointer declarators, leaving a following
    /// identifier unread
    fn type_name_prefix(&mut self) -> Result<TypeId> {
        let spec = self.specifiers()?;
        let mut ty = spec.ty;
        while self.eat(Punct::Star) {
            ty = self.sess.types.pointer_to(ty);
            while self.tokens.eat_keyword(Keyword::Const) || self.tokens.eat_keyword(Keyword::Volatile) {}
        }
        Ok(ty)
    }

    fn throw_statement(&mut self) -> Result<Stmt> {
        let loc = self.next().loc;
        if self.eat(Punct::Semi) {
            let var = match self.func_mut(&loc)?.catches.last() {
                Some(v) => *v,
                None => return Err(Error::semantic(&loc, "'throw;' outside of a catch block")),
            };
            let ty = self.sess.symbols.decl(var).ty().unwrap_or(TypeId::INT);
            let e = Expr::new(ExprKind::Var(var), ty, loc.clone());
            return Ok(self.stmt(StmtKind::Throw(e), loc));
        }
        let e = self.expression()?;
        self.expect(Punct::Semi)?;
        let e = self.decay(e);
        let ty = if self.sess.types.is_integer(e.ty) {
            self.sess.types.promote(e.ty)
        } else {
            self.sess.types.unqualified(e.ty)
        };
        if self.sess.types.size_of(ty) != Some(1) || !self.sess.types.is_scalar(ty) {
            return Err(Error::semantic(
                &loc,
                format!("thrown value of type '{}' must be a one-word scalar", self.sess.types.display(e.ty)),
            ));
        }
        let e = self.convert(e, ty)?;
        Ok(self.stmt(StmtKind::Throw(e), loc))
    }
}

#[cfg(test)]
mod tests {
    use crate::parser::ast::StmtKind;
    use crate::parser::tests::parse_src;

    fn body(src: &str) -> Vec<StmtKind> {
        let (sess, unit) = parse_src(src);
        assert!(!sess.has_errors(), "{:?}", sess.diags.errors());
        match &unit.functions.last().unwrap().body.kind {
            StmtKind::Block(items) => items.iter().map(|s| s.kind.clone()).collect(),
            other => panic!("not a block: {:?}", other),
        }
    }

    #[test]
    fn test_term_local_wraps_rest_of_block() {
        let src = "struct R { int h; void __dtor() { h = 0; } };\n\
                   void f(void) { int a; struct R r; a = 1; a = 2; }";
        let items = body(src);
        assert_eq!(items.len(), 3);
        match &items[2] {
            StmtKind::Try {
                catch: None,
                finally: Some(_),
                body,
                ..
            } => match &body.kind {
                StmtKind::Block(rest) => assert_eq!(rest.len(), 2),
                other => panic!("unexpected {:?}", other),
            },
            other => panic!("expected implicit try, got {:?}", other),
        }
    }

    #[test]
    fn test_switch_collects_cases() {
        let items = body("int f(int x) { switch (x) { case 1: return 1; case 'a': return 2; default: break; } return 0; }");
        match &items[0] {
            StmtKind::Switch { cases, default, .. } => {
                assert_eq!(cases.len(), 2);
                assert_eq!(cases[1].0, 97);
                assert_eq!(*default, Some(2));
            }
            other => panic!("expected switch, got {:?}", other),
        }
    }

    #[test]
    fn test_case_in_try_rejected() {
        let (sess, _) = parse_src("void f(int x) { switch (x) { case 1: try { case 2: ; } finally { } } }");
        assert!(sess.has_errors());
    }

    #[test]
    fn test_rethrow_needs_catch() {
        let (sess, _) = parse_src("void f(void) { throw; }");
        assert!(sess.has_errors());
        let (sess, _) = parse_src("void f(void) { try { throw 3; } catch (int e) { throw; } }");
        assert!(!sess.has_errors(), "{:?}", sess.diags.errors());
    }

    #[test]
    fn test_throw_wide_value_rejected() {
        let (sess, _) = parse_src("void f(long v) { throw v; }");
        assert!(sess.has_errors());
    }

    #[test]
    fn test_return_value_checks() {
        let (sess, _) = parse_src("int f(void) { return; }");
        assert!(sess.has_errors());
        let (sess, _) = parse_src("void f(void) { return 1; }");
        assert!(sess.has_errors());
    }

    #[test]
    fn test_continue_inside_switch_needs_loop() {
        let (sess, _) = parse_src("void f(int x) { switch (x) { case 0: continue; } }");
        assert!(sess.has_errors());
        let (sess, _) = parse_src("void f(int x) { while (x) { switch (x) { case 0: continue; } } }");
        assert!(!sess.has_errors(), "{:?}", sess.diags.errors());
    }
}
