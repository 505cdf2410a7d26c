//! Synthesized struct init and term functions
//!
//! `S__init(this)` initializes bases in order, stores every vtable pointer,
//! runs field initializers and nested inits in declaration order, then calls
//! the user `__ctor`. `S__term(this)` runs `__dtor` first and then tears
//! down fields and bases in reverse order.

use super::{FuncInfo, Lowerer};
use crate::compiler::prim::{Operand, Place, PrimFunc};
use crate::compiler::session::Session;
use crate::error::Result;
use crate::parser::ScopeId;
use crate::types::StructId;

const CTOR: &str = "__ctor";
const DTOR: &str = "__dtor";

fn support_info() -> FuncInfo {
    FuncInfo {
        ret: None,
        hidden_ret: false,
        param_scope: ScopeId::GLOBAL,
        tries: Vec::new(),
        cases: 0,
    }
}

fn this() -> Operand {
    Operand::load(Place::Param(0))
}

/// Lowers the init function of a struct
pub fn lower_init(sess: &mut Session, sid: StructId) -> Result<PrimFunc> {
    let def = sess.types.struct_def(sid).clone();
    let _span = tracing::debug_span!("lower_init", name = %def.name).entered();
    let mut l = Lowerer::new(sess, &def.init_label(), false, def.loc.clone(), support_info());

    for b in &def.bases {
        let base = l.sess.types.struct_def(b.sid);
        if base.needs_init {
            let label = base.init_label();
            let addr = l.address_of(Lowerer::this_member(b.offset))?;
            l.call_with_pointer(&label, addr);
        }
    }
    for vt in &def.vtables {
        l.store_vptr(Lowerer::this_member(vt.vptr_offset), &vt.label);
    }
    let fields = if def.is_union { &def.fields[..def.fields.len().min(1)] } else { &def.fields[..] };
    for f in fields {
        l.loc = f.loc.clone();
        let dst = Lowerer::this_member(f.offset);
        if let Some(init) = &f.init {
            l.assign_into(dst, init)?;
            continue;
        }
        if let Some(fsid) = l.sess.types.as_struct(f.ty) {
            let nested = l.sess.types.struct_def(fsid);
            if nested.needs_init {
                let label = nested.init_label();
                let addr = l.address_of(dst)?;
                l.call_with_pointer(&label, addr);
            }
        }
    }
    if let Some(ctor) = def.methods.iter().find(|m| m.name == CTOR) {
        l.loc = def.loc.clone();
        l.call_with_pointer(&ctor.label, this());
    }
    l.finish()
}

/// Lowers the term function of a struct
pub fn lower_term(sess: &mut Session, sid: StructId) -> Result<PrimFunc> {
    let def = sess.types.struct_def(sid).clone();
    let _span = tracing::debug_span!("lower_term", name = %def.name).entered();
    let mut l = Lowerer::new(sess, &def.term_label(), false, def.loc.clone(), support_info());

    if let Some(dtor) = def.methods.iter().find(|m| m.name == DTOR) {
        l.call_with_pointer(&dtor.label, this());
    }
    if !def.is_union {
        for f in def.fields.iter().rev() {
            let Some(fsid) = l.sess.types.as_struct(f.ty) else {
                continue;
            };
            let nested = l.sess.types.struct_def(fsid);
            if nested.needs_term {
                let label = nested.term_label();
                l.loc = f.loc.clone();
                let addr = l.address_of(Lowerer::this_member(f.offset))?;
                l.call_with_pointer(&label, addr);
            }
        }
    }
    for b in def.bases.iter().rev() {
        let base = l.sess.types.struct_def(b.sid);
        if base.needs_term {
            let label = base.term_label();
            let addr = l.address_of(Lowerer::this_member(b.offset))?;
            l.call_with_pointer(&label, addr);
        }
    }
    l.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::prim::{CallTarget, Prim};
    use crate::lexer::Scanner;
    use crate::parser::Parser;

    fn session(src: &str) -> Session {
        let mut sess = Session::new("t.c");
        let (tokens, errors) = Scanner::new(src, "t.c").scan_tokens();
        assert!(errors.is_empty(), "{:?}", errors);
        Parser::new(&mut sess, tokens).parse();
        assert!(!sess.has_errors());
        sess
    }

    fn struct_named(sess: &Session, name: &str) -> StructId {
        sess.types
            .structs()
            .find(|(_, d)| d.name == name)
            .map(|(sid, _)| sid)
            .unwrap()
    }

    fn calls(f: &PrimFunc) -> Vec<String> {
        f.prims
            .iter()
            .filter_map(|(_, p)| match p {
                Prim::Call {
                    target: CallTarget::Direct(l),
                    ..
                } => Some(l.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_init_order_bases_fields_ctor() {
        let src = "struct B { int b; void __ctor() { b = 1; } };\n\
                   struct M { int m; void __ctor() { m = 2; } };\n\
                   struct D : B { struct M m; int x = 5; void __ctor() { x = 3; } };";
        let mut sess = session(src);
        let d = struct_named(&sess, "D");
        let f = lower_init(&mut sess, d).unwrap();
        assert_eq!(calls(&f), vec!["B__init", "M__init", "D____ctor"]);
        let stores_x = f.prims.iter().any(|(_, p)| {
            matches!(p, Prim::Assign { src: Operand::Imm(5), dst: Place::Indirect(..), .. })
        });
        assert!(stores_x, "{}", f);
    }

    #[test]
    fn test_init_stores_every_vptr() {
        let src = "struct A { virtual int f(void); int a; };\n\
                   struct B { virtual int g(void); int b; };\n\
                   struct C : A, B { int f(void); int g(void); };";
        let mut sess = session(src);
        let c = struct_named(&sess, "C");
        let f = lower_init(&mut sess, c).unwrap();
        let vptr_stores = f
            .prims
            .iter()
            .filter(|(_, p)| matches!(p, Prim::Assign { src: Operand::Addr(..), .. }))
            .count();
        assert_eq!(vptr_stores, sess.types.struct_def(c).vtables.len());
        assert_eq!(vptr_stores, 2);
    }

    #[test]
    fn test_term_runs_dtor_then_members_reversed() {
        let src = "struct R { int h; void __dtor() { h = 0; } };\n\
                   struct S : R { struct R a; struct R b; void __dtor() { } };";
        let mut sess = session(src);
        let s = struct_named(&sess, "S");
        let f = lower_term(&mut sess, s).unwrap();
        assert_eq!(calls(&f), vec!["S____dtor", "R__term", "R__term", "R__term"]);
    }
}
