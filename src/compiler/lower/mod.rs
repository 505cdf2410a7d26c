//! Lowering of typed syntax trees to Prims
//!
//! A [`Lowerer`] walks one function body and appends Prims to the flow
//! tail. Code that cannot be reached is still lowered: it starts with a
//! fresh label so that later `case`/`goto` targets stay addressable, and
//! the optimizer deletes whatever stays unreferenced.
//!
//! Jumps that leave a try (or a catch protected by a finally) go through
//! per-target wrapper blocks owned by that try: pop the frame record, run
//! the finally subroutine, then continue towards the real target, which may
//! be the wrapper of the next enclosing try. Wrappers and the shared return
//! block are emitted after the body.

mod cond;
mod expr;
mod stmt;
pub mod support;

use super::list::NodeId;
use super::prim::{CallTarget, LabelId, Operand, Place, Prim, PrimFunc, Repr, SlotId};
use super::session::Session;
use crate::error::{Error, Result, SourceLoc};
use crate::parser::{
    DeclId, DeclKind, FunctionDef, ScopeId, ScopeKind, Stmt, StmtKind, TryId, TryInfo, VarLocation,
};
use crate::types::TypeId;
use std::collections::HashMap;

/// Per-function facts the lowerer needs besides the body
#[derive(Debug, Clone)]
pub struct FuncInfo {
    /// Representation of a value returned in registers
    pub ret: Option<Repr>,
    /// Result written through the hidden pointer at parameter offset 0
    pub hidden_ret: bool,
    /// Scope holding the parameters
    pub param_scope: ScopeId,
    /// Try statements by id
    pub tries: Vec<TryInfo>,
    /// Number of case markers
    pub cases: usize,
}

/// An enclosing loop or switch
#[derive(Debug, Clone, Copy)]
struct Breakable {
    brk: LabelId,
    cont: Option<LabelId>,
    scope: ScopeId,
}

/// Lowering state of one try statement
#[derive(Debug, Clone)]
struct TryCtx {
    record: SlotId,
    link: Option<SlotId>,
    finally: Option<LabelId>,
    resumes: Vec<LabelId>,
    finally_return: Option<NodeId>,
    parent: ScopeId,
}

/// A pending exit path through a try
#[derive(Debug, Clone, Copy)]
struct Wrapper {
    label: LabelId,
    try_id: TryId,
    target: LabelId,
    target_scope: ScopeId,
}

/// Lowers one function to Prims
pub struct Lowerer<'s> {
    sess: &'s mut Session,
    func: PrimFunc,
    info: FuncInfo,
    reachable: bool,
    loc: SourceLoc,
    locals: HashMap<DeclId, SlotId>,
    breakables: Vec<Breakable>,
    labels: HashMap<String, (LabelId, ScopeId)>,
    cases: Vec<LabelId>,
    tries: HashMap<TryId, TryCtx>,
    wrappers: Vec<Wrapper>,
    wrapper_index: HashMap<(TryId, LabelId), LabelId>,
    ret_label: Option<LabelId>,
    ret_slot: Option<SlotId>,
}

/// Lowers a parsed function definition
pub fn lower_function(sess: &mut Session, def: &FunctionDef) -> Result<PrimFunc> {
    let _span = tracing::debug_span!("lower", function = %def.label).entered();
    let ret = if sess.types.is_void(def.ret) || def.hidden_ret {
        None
    } else {
        Some(Repr::of(&sess.types, def.ret))
    };
    let info = FuncInfo {
        ret,
        hidden_ret: def.hidden_ret,
        param_scope: def.param_scope,
        tries: def.tries.clone(),
        cases: def.cases,
    };
    let mut l = Lowerer::new(sess, &def.label, def.exported, def.loc.clone(), info);
    l.collect_labels(&def.body);
    l.stmt(&def.body)?;
    l.finish()
}

impl<'s> Lowerer<'s> {
    /// Starts a function and emits its entry
    pub fn new(
        sess: &'s mut Session,
        label: &str,
        exported: bool,
        loc: SourceLoc,
        info: FuncInfo,
    ) -> Self {
        let cases = (0..info.cases).map(|_| sess.new_label()).collect();
        let mut l = Lowerer {
            sess,
            func: PrimFunc::new(label, exported, loc.clone()),
            info,
            reachable: true,
            loc,
            locals: HashMap::new(),
            breakables: Vec::new(),
            labels: HashMap::new(),
            cases,
            tries: HashMap::new(),
            wrappers: Vec::new(),
            wrapper_index: HashMap::new(),
            ret_label: None,
            ret_slot: None,
        };
        l.emit(Prim::Entry);
        l
    }

    /// Closes the function: final return, try wrappers, shared return block
    pub fn finish(mut self) -> Result<PrimFunc> {
        if self.reachable {
            self.emit(Prim::Return(None));
        }
        while let Some(w) = self.wrappers.pop() {
            self.emit_wrapper(w)?;
        }
        if let Some(label) = self.ret_label {
            self.emit(Prim::Label(label));
            let value = match (self.ret_slot, self.info.ret) {
                (Some(slot), Some(repr)) => Some((Operand::load(Place::Slot(slot, 0)), repr)),
                _ => None,
            };
            self.emit(Prim::Return(value));
        }
        for ctx in self.tries.values() {
            if let Some(node) = ctx.finally_return {
                if let Prim::FinallyReturn { resumes, .. } = self.func.prims.get_mut(node) {
                    *resumes = ctx.resumes.clone();
                }
            }
        }
        self.func.prims.verify()?;
        tracing::debug!(
            prims = self.func.prims.len(),
            slots = self.func.slots.len(),
            "lowered function"
        );
        Ok(self.func)
    }

    // ========================================================================
    // Emission
    // ========================================================================

    /// Appends a node; unreachable non-label nodes get a fresh label first
    fn emit(&mut self, prim: Prim) -> NodeId {
        let defines = prim.defined_label().is_some();
        if !self.reachable && !defines {
            let l = self.sess.new_label();
            self.func.prims.push_back(Prim::Label(l), Some(self.loc.clone()));
        }
        self.reachable = defines || prim.falls_through();
        self.func.prims.push_back(prim, Some(self.loc.clone()))
    }

    fn new_label(&mut self) -> LabelId {
        self.sess.new_label()
    }

    fn label(&mut self, l: LabelId) {
        self.emit(Prim::Label(l));
    }

    fn jump(&mut self, l: LabelId) {
        if self.reachable {
            self.emit(Prim::Jump(l));
        }
    }

    /// Fresh temporary slot
    fn temp(&mut self, repr: Repr) -> SlotId {
        self.func.new_slot(repr.words(), true)
    }

    fn repr(&self, ty: TypeId) -> Repr {
        Repr::of(&self.sess.types, ty)
    }

    // ========================================================================
    // Variables
    // ========================================================================

    /// Stack slot of a local, allocated on first use
    fn local_slot(&mut self, decl: DeclId) -> SlotId {
        if let Some(&s) = self.locals.get(&decl) {
            return s;
        }
        let words = self
            .sess
            .symbols
            .decl(decl)
            .ty()
            .and_then(|t| self.sess.types.size_of(t))
            .unwrap_or(1);
        let slot = self.func.new_slot(words, false);
        self.locals.insert(decl, slot);
        slot
    }

    /// Storage of a named object
    fn var_place(&mut self, decl: DeclId) -> Result<Place> {
        let d = self.sess.symbols.decl(decl);
        match &d.kind {
            DeclKind::Variable { location, .. } => Ok(match location {
                VarLocation::Global(label) => Place::Global(label.clone(), 0),
                VarLocation::Param(off) => Place::Param(*off as i32),
                VarLocation::Local => Place::Slot(self.local_slot(decl), 0),
            }),
            DeclKind::StringConst { label, .. } | DeclKind::AsmLabel { label, .. } => {
                Ok(Place::Global(label.clone(), 0))
            }
            _ => Err(Error::internal(format!("'{}' has no storage", d.name))),
        }
    }

    // ========================================================================
    // Jumps across try statements
    // ========================================================================

    /// Tries whose cleanup runs when leaving `from` for `to`, innermost first
    fn crossing(&self, from: ScopeId, to: ScopeId) -> Vec<TryId> {
        self.sess
            .symbols
            .crossed_tries(from, to)
            .into_iter()
            .filter_map(|kind| match kind {
                ScopeKind::Try(id) => Some(id),
                ScopeKind::Catch(id) => self
                    .info
                    .tries
                    .get(id.0 as usize)
                    .filter(|t| t.has_finally)
                    .map(|_| id),
                _ => None,
            })
            .collect()
    }

    /// Jumps from `from` to `target` in `target_scope`, through the wrappers
    /// of every try left on the way
    fn jump_to(&mut self, from: ScopeId, target: LabelId, target_scope: ScopeId) {
        let through = match self.crossing(from, target_scope).first() {
            None => target,
            Some(&try_id) => self.wrapper(try_id, target, target_scope),
        };
        self.jump(through);
    }

    fn wrapper(&mut self, try_id: TryId, target: LabelId, target_scope: ScopeId) -> LabelId {
        if let Some(&l) = self.wrapper_index.get(&(try_id, target)) {
            return l;
        }
        let label = self.new_label();
        self.wrapper_index.insert((try_id, target), label);
        self.wrappers.push(Wrapper {
            label,
            try_id,
            target,
            target_scope,
        });
        label
    }

    fn emit_wrapper(&mut self, w: Wrapper) -> Result<()> {
        let ctx = self
            .tries
            .get(&w.try_id)
            .cloned()
            .ok_or_else(|| Error::internal("jump out of an unknown try"))?;
        self.label(w.label);
        self.emit(Prim::TryEnd { record: ctx.record });
        self.finally_call(w.try_id);
        self.jump_to(ctx.parent, w.target, w.target_scope);
        Ok(())
    }

    /// Runs the finally subroutine of a try, if it has one
    fn finally_call(&mut self, try_id: TryId) {
        let (entry, link) = match self.tries.get(&try_id) {
            Some(TryCtx {
                finally: Some(entry),
                link: Some(link),
                ..
            }) => (*entry, *link),
            _ => return,
        };
        let resume = self.new_label();
        self.emit(Prim::FinallyCall {
            entry,
            link,
            resume,
        });
        self.label(resume);
        if let Some(ctx) = self.tries.get_mut(&try_id) {
            ctx.resumes.push(resume);
        }
    }

    /// Returns from the function, crossing tries through the shared return
    /// block
    fn return_value(&mut self, value: Option<Operand>, scope: ScopeId) {
        let repr = self.info.ret;
        if self.crossing(scope, self.info.param_scope).is_empty() {
            let v = value.zip(repr);
            self.emit(Prim::Return(v));
            return;
        }
        if let (Some(v), Some(repr)) = (value, repr) {
            let slot = match self.ret_slot {
                Some(s) => s,
                None => {
                    let s = self.func.new_slot(repr.words(), false);
                    self.ret_slot = Some(s);
                    s
                }
            };
            self.emit(Prim::Assign {
                repr,
                dst: Place::Slot(slot, 0),
                src: v,
            });
        }
        let label = match self.ret_label {
            Some(l) => l,
            None => {
                let l = self.new_label();
                self.ret_label = Some(l);
                l
            }
        };
        let param_scope = self.info.param_scope;
        self.jump_to(scope, label, param_scope);
    }

    /// Allocates labels for every `name:` statement of the body
    fn collect_labels(&mut self, s: &Stmt) {
        match &s.kind {
            StmtKind::Label(name, inner) => {
                let l = self.new_label();
                self.labels.insert(name.clone(), (l, s.scope));
                self.collect_labels(inner);
            }
            StmtKind::Block(items) => items.iter().for_each(|i| self.collect_labels(i)),
            StmtKind::If {
                then, otherwise, ..
            } => {
                self.collect_labels(then);
                if let Some(o) = otherwise {
                    self.collect_labels(o);
                }
            }
            StmtKind::While { body, .. }
            | StmtKind::DoWhile { body, .. }
            | StmtKind::Switch { body, .. } => self.collect_labels(body),
            StmtKind::For { init, body, .. } => {
                if let Some(i) = init {
                    self.collect_labels(i);
                }
                self.collect_labels(body);
            }
            StmtKind::Try {
                body,
                catch,
                finally,
                ..
            } => {
                self.collect_labels(body);
                if let Some(c) = catch {
                    self.collect_labels(&c.body);
                }
                if let Some(f) = finally {
                    self.collect_labels(f);
                }
            }
            _ => {}
        }
    }

    // ========================================================================
    // Struct support
    // ========================================================================

    /// Calls `label` with one pointer argument
    pub(crate) fn call_with_pointer(&mut self, label: &str, arg: Operand) {
        self.emit(Prim::CallStart(1));
        self.emit(Prim::Assign {
            repr: Repr::Word { signed: false },
            dst: Place::Arg(0),
            src: arg,
        });
        self.emit(Prim::Call {
            target: CallTarget::Direct(label.to_string()),
            words: 1,
            result: None,
        });
    }

    /// Stores the address of `label` into a vtable pointer
    pub(crate) fn store_vptr(&mut self, dst: Place, label: &str) {
        self.emit(Prim::Assign {
            repr: Repr::Word { signed: false },
            dst,
            src: Operand::Addr(super::prim::Base::Global(label.to_string()), 0),
        });
    }

    /// Address of the object `this` points at, offset by `words`
    pub(crate) fn this_member(words: u32) -> Place {
        Place::Indirect(Box::new(Operand::load(Place::Param(0))), words as i32)
    }
}

#[cfg(test)]
mod tests;
