//! Statement lowering

use super::{Breakable, Lowerer, TryCtx};
use crate::compiler::prim::{Cond, LabelId, Operand, Place, Prim, Repr};
use crate::error::{Error, Result};
use crate::parser::{Catch, Expr, LocalInit, Stmt, StmtKind, TryId};

impl Lowerer<'_> {
    /// Lowers one statement
    pub(super) fn stmt(&mut self, s: &Stmt) -> Result<()> {
        self.loc = s.loc.clone();
        match &s.kind {
            StmtKind::Block(items) => {
                for item in items {
                    self.stmt(item)?;
                }
            }
            StmtKind::Expr(e) => self.effect(e)?,
            StmtKind::If {
                cond,
                then,
                otherwise,
            } => {
                let other = self.new_label();
                self.ifgoto(cond, false, other)?;
                self.stmt(then)?;
                match otherwise {
                    Some(o) => {
                        let end = self.new_label();
                        self.jump(end);
                        self.label(other);
                        self.stmt(o)?;
                        self.label(end);
                    }
                    None => self.label(other),
                }
            }
            StmtKind::While { cond, body } => {
                let top = self.new_label();
                let exit = self.new_label();
                self.label(top);
                self.ifgoto(cond, false, exit)?;
                self.loop_body(body, exit, top, s)?;
                self.jump(top);
                self.label(exit);
            }
            StmtKind::DoWhile { body, cond } => {
                let top = self.new_label();
                let cont = self.new_label();
                let exit = self.new_label();
                self.label(top);
                self.loop_body(body, exit, cont, s)?;
                self.label(cont);
                self.loc = s.loc.clone();
                self.ifgoto(cond, true, top)?;
                self.label(exit);
            }
            StmtKind::For {
                init,
                cond,
                step,
                body,
            } => {
                if let Some(init) = init {
                    self.stmt(init)?;
                }
                let top = self.new_label();
                let cont = self.new_label();
                let exit = self.new_label();
                self.loc = s.loc.clone();
                self.label(top);
                if let Some(c) = cond {
                    self.ifgoto(c, false, exit)?;
                }
                self.loop_body(body, exit, cont, s)?;
                self.label(cont);
                self.loc = s.loc.clone();
                if let Some(step) = step {
                    self.effect(step)?;
                }
                self.jump(top);
                self.label(exit);
            }
            StmtKind::Switch {
                value,
                body,
                cases,
                default,
            } => self.switch(s, value, body, cases, *default)?,
            StmtKind::Case(idx) => {
                let l = *self
                    .cases
                    .get(*idx)
                    .ok_or_else(|| Error::internal("case marker out of range"))?;
                self.label(l);
            }
            StmtKind::Break => {
                let b = self
                    .breakables
                    .last()
                    .copied()
                    .ok_or_else(|| Error::internal("break outside of a loop"))?;
                self.jump_to(s.scope, b.brk, b.scope);
            }
            StmtKind::Continue => {
                let b = self
                    .breakables
                    .iter()
                    .rev()
                    .find(|b| b.cont.is_some())
                    .copied()
                    .ok_or_else(|| Error::internal("continue outside of a loop"))?;
                if let Some(cont) = b.cont {
                    self.jump_to(s.scope, cont, b.scope);
                }
            }
            StmtKind::Goto(name) => {
                let (l, scope) = *self
                    .labels
                    .get(name)
                    .ok_or_else(|| Error::internal(format!("goto unknown label '{}'", name)))?;
                self.jump_to(s.scope, l, scope);
            }
            StmtKind::Label(name, inner) => {
                if let Some(&(l, _)) = self.labels.get(name) {
                    self.label(l);
                }
                self.stmt(inner)?;
            }
            StmtKind::Return(value) => self.return_stmt(s, value.as_ref())?,
            StmtKind::Local { decl, init } => {
                let slot = self.local_slot(*decl);
                self.local_init(Place::Slot(slot, 0), init)?;
            }
            StmtKind::Try {
                id,
                body,
                catch,
                finally,
            } => self.try_stmt(s, *id, body, catch.as_ref(), finally.as_deref())?,
            StmtKind::Throw(e) => {
                let v = self.value(e)?;
                self.emit(Prim::Throw(v));
            }
            StmtKind::Empty => {}
        }
        Ok(())
    }

    fn loop_body(&mut self, body: &Stmt, exit: LabelId, cont: LabelId, s: &Stmt) -> Result<()> {
        self.breakables.push(Breakable {
            brk: exit,
            cont: Some(cont),
            scope: s.scope,
        });
        let r = self.stmt(body);
        self.breakables.pop();
        r
    }

    fn switch(
        &mut self,
        s: &Stmt,
        value: &Expr,
        body: &Stmt,
        cases: &[(i64, usize)],
        default: Option<usize>,
    ) -> Result<()> {
        let repr = self.repr(value.ty);
        let mut v = self.value(value)?;
        if !matches!(v, Operand::Imm(_)) && cases.len() > 1 {
            let t = self.temp(repr);
            self.emit(Prim::Assign {
                repr,
                dst: Place::Slot(t, 0),
                src: v,
            });
            v = Operand::load(Place::Slot(t, 0));
        }
        let exit = self.new_label();
        for &(cv, idx) in cases {
            let target = *self
                .cases
                .get(idx)
                .ok_or_else(|| Error::internal("case marker out of range"))?;
            self.compare(Cond::Eq, repr, v.clone(), Operand::Imm(cv), target);
        }
        let fallback = match default.and_then(|d| self.cases.get(d).copied()) {
            Some(l) => l,
            None => exit,
        };
        self.jump(fallback);
        self.breakables.push(Breakable {
            brk: exit,
            cont: None,
            scope: s.scope,
        });
        let r = self.stmt(body);
        self.breakables.pop();
        r?;
        self.label(exit);
        Ok(())
    }

    fn return_stmt(&mut self, s: &Stmt, value: Option<&Expr>) -> Result<()> {
        let e = match value {
            None => {
                self.return_value(None, s.scope);
                return Ok(());
            }
            Some(e) => e,
        };
        if self.info.hidden_ret {
            let dst = Place::Indirect(Box::new(Operand::load(Place::Param(0))), 0);
            self.assign_into(dst, e)?;
            self.return_value(None, s.scope);
        } else if self.info.ret.is_none() {
            self.effect(e)?;
            self.return_value(None, s.scope);
        } else {
            let v = self.value(e)?;
            self.return_value(Some(v), s.scope);
        }
        Ok(())
    }

    /// Initializes a local variable
    pub(super) fn local_init(&mut self, place: Place, init: &LocalInit) -> Result<()> {
        match init {
            LocalInit::None => {}
            LocalInit::Expr(e) => self.assign_into(place, e)?,
            LocalInit::Construct(sid) => {
                let label = self.sess.types.struct_def(*sid).init_label();
                let addr = self.address_of(place)?;
                self.call_with_pointer(&label, addr);
            }
            LocalInit::Aggregate {
                vptrs,
                constructs,
                items,
            } => {
                let words = match &place {
                    Place::Slot(s, _) => self.func.slots[s.0 as usize].words,
                    _ => return Err(Error::internal("aggregate initializer outside a stack slot")),
                };
                self.emit(Prim::Assign {
                    repr: Repr::Block(words),
                    dst: place.clone(),
                    src: Operand::Imm(0),
                });
                for (off, sid) in constructs {
                    let label = self.sess.types.struct_def(*sid).init_label();
                    let addr = self.address_of(place.offset(*off as i32))?;
                    self.call_with_pointer(&label, addr);
                }
                for (off, label) in vptrs {
                    self.store_vptr(place.offset(*off as i32), label);
                }
                for (off, e) in items {
                    self.assign_into(place.offset(*off as i32), e)?;
                }
            }
        }
        Ok(())
    }

    /// try/catch/finally
    ///
    /// ```text
    ///     TryBegin rec, H
    ///     body; TryEnd rec; FinallyCall F; Jump AFTER
    /// H:  CatchEntry var; [TryBegin rec, R]
    ///     catch body; [TryEnd rec; FinallyCall F]; Jump AFTER
    /// R:  CatchEntry tmp; FinallyCall F; Throw tmp
    /// F:  FinallyEntry; finally body; FinallyReturn
    /// AFTER:
    /// ```
    fn try_stmt(
        &mut self,
        s: &Stmt,
        id: TryId,
        body: &Stmt,
        catch: Option<&Catch>,
        finally: Option<&Stmt>,
    ) -> Result<()> {
        let record = self.func.new_slot(3, false);
        let link = finally.map(|_| self.func.new_slot(1, false));
        let entry = finally.map(|_| self.sess.new_label());
        let rethrow = finally.map(|_| self.sess.new_label());
        let after = self.new_label();
        let handler = match (catch, rethrow) {
            (Some(_), _) => self.new_label(),
            (None, Some(r)) => r,
            (None, None) => return Err(Error::internal("try without catch or finally")),
        };
        self.tries.insert(
            id,
            TryCtx {
                record,
                link,
                finally: entry,
                resumes: Vec::new(),
                finally_return: None,
                parent: s.scope,
            },
        );

        self.emit(Prim::TryBegin { record, handler });
        self.stmt(body)?;
        if self.reachable {
            self.emit(Prim::TryEnd { record });
            self.finally_call(id);
            self.jump(after);
        }

        if let Some(c) = catch {
            self.loc = c.body.loc.clone();
            let dst = self.var_place(c.var)?;
            self.emit(Prim::CatchEntry {
                label: handler,
                dst: Some(dst),
            });
            if let Some(r) = rethrow {
                self.emit(Prim::TryBegin { record, handler: r });
            }
            self.stmt(&c.body)?;
            if self.reachable {
                if rethrow.is_some() {
                    self.emit(Prim::TryEnd { record });
                    self.finally_call(id);
                }
                self.jump(after);
            }
        }

        if let (Some(r), Some(f), Some(entry), Some(link)) = (rethrow, finally, entry, link) {
            self.loc = f.loc.clone();
            let exc = self.func.new_slot(1, false);
            self.emit(Prim::CatchEntry {
                label: r,
                dst: Some(Place::Slot(exc, 0)),
            });
            self.finally_call(id);
            self.emit(Prim::Throw(Operand::load(Place::Slot(exc, 0))));

            self.emit(Prim::FinallyEntry { label: entry, link });
            self.stmt(f)?;
            let node = self.emit(Prim::FinallyReturn {
                link,
                resumes: Vec::new(),
            });
            if let Some(ctx) = self.tries.get_mut(&id) {
                ctx.finally_return = Some(node);
            }
        }
        self.label(after);
        Ok(())
    }
}
