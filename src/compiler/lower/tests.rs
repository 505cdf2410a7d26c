use super::*;
use crate::compiler::prim::{CallTarget, Cond};
use crate::lexer::Scanner;
use crate::parser::Parser;

fn lower_src(src: &str) -> Vec<PrimFunc> {
    let mut sess = Session::new("t.c");
    let (tokens, errors) = Scanner::new(src, "t.c").scan_tokens();
    assert!(errors.is_empty(), "{:?}", errors);
    let unit = Parser::new(&mut sess, tokens).parse();
    let msgs: Vec<String> = sess.diags.errors().iter().map(|e| e.to_string()).collect();
    assert!(msgs.is_empty(), "{:?}", msgs);
    unit.functions
        .iter()
        .map(|f| lower_function(&mut sess, f).unwrap())
        .collect()
}

fn prims(f: &PrimFunc) -> Vec<Prim> {
    f.prims.iter().map(|(_, p)| p.clone()).collect()
}

/// Jumps and branches whose target is defined at or before them
fn back_edges(f: &PrimFunc) -> usize {
    let mut seen = Vec::new();
    let mut count = 0;
    for p in prims(f) {
        if let Some(l) = p.defined_label() {
            seen.push(l);
        }
        count += p.successors().iter().filter(|t| seen.contains(t)).count();
    }
    count
}

#[test]
fn test_for_loop_has_one_back_edge() {
    let funcs = lower_src("int f(int n) { int s = 0; int i; for (i = 0; i < n; i++) s += i; return s; }");
    let f = &funcs[0];
    assert_eq!(back_edges(f), 1, "{}", f);
    let exits = prims(f).iter().filter(|p| p.is_branch()).count();
    assert_eq!(exits, 1, "{}", f);
}

#[test]
fn test_do_while_branches_back() {
    let funcs = lower_src("int f(int n) { do n--; while (n > 3); return n; }");
    assert_eq!(back_edges(&funcs[0]), 1);
}

#[test]
fn test_entry_first_and_list_consistent() {
    let funcs = lower_src("void f(void) { }");
    let f = &funcs[0];
    assert_eq!(prims(f)[0], Prim::Entry);
    assert!(matches!(prims(f).last(), Some(Prim::Return(None))));
    f.prims.verify().unwrap();
}

#[test]
fn test_unsigned_below_zero_is_never_taken() {
    let funcs = lower_src("unsigned u; int f(void) { if (u < 0) return 1; return 2; }");
    let f = &funcs[0];
    assert!(!prims(f).iter().any(|p| p.is_branch()), "{}", f);
}

#[test]
fn test_compare_with_zero_is_a_test() {
    let funcs = lower_src("int f(int a) { if (a != 0) return 1; return 0; }");
    let f = &funcs[0];
    assert!(prims(f).iter().any(|p| matches!(p, Prim::Test { .. })), "{}", f);
    assert!(!prims(f).iter().any(|p| matches!(p, Prim::Compare { .. })));
}

#[test]
fn test_finally_runs_on_every_exit() {
    let src = "void g(void); void h(void);\n\
               void f(int x) { try { if (x) return; g(); } finally { h(); } }";
    let funcs = lower_src(src);
    let f = funcs.iter().find(|f| f.label == "f").unwrap();
    let ps = prims(f);
    let calls = ps.iter().filter(|p| matches!(p, Prim::FinallyCall { .. })).count();
    // Fallthrough, the return wrapper and the rethrow handler.
    assert_eq!(calls, 3, "{}", f);
    let entries = ps.iter().filter(|p| matches!(p, Prim::FinallyEntry { .. })).count();
    assert_eq!(entries, 1);
    let resumes = ps
        .iter()
        .find_map(|p| match p {
            Prim::FinallyReturn { resumes, .. } => Some(resumes.len()),
            _ => None,
        })
        .unwrap();
    assert_eq!(resumes, calls);
    assert!(ps.iter().any(|p| matches!(p, Prim::Throw(_))));
}

#[test]
fn test_catch_stores_value() {
    let src = "int f(void) { int r; try { throw 5; } catch (int e) { r = e; } return r; }";
    let funcs = lower_src(src);
    let ps = prims(&funcs[0]);
    assert!(ps.iter().any(|p| matches!(p, Prim::TryBegin { .. })));
    assert!(ps.iter().any(|p| matches!(p, Prim::CatchEntry { dst: Some(_), .. })));
    assert!(!ps.iter().any(|p| matches!(p, Prim::FinallyCall { .. })));
}

#[test]
fn test_virtual_call_is_indirect() {
    let src = "struct A { virtual int f(void); int x; };\n\
               int call(struct A *a) { return a->f(); }";
    let funcs = lower_src(src);
    let f = funcs.iter().find(|f| f.label == "call").unwrap();
    let indirect = prims(f).iter().any(|p| {
        matches!(
            p,
            Prim::Call {
                target: CallTarget::Indirect(_),
                ..
            }
        )
    });
    assert!(indirect, "{}", f);
}

#[test]
fn test_struct_result_uses_hidden_pointer() {
    let src = "struct P { int a; int b; };\n\
               struct P make(int v) { struct P p; p.a = v; p.b = v; return p; }\n\
               int use(void) { struct P q; q = make(3); return q.b; }";
    let funcs = lower_src(src);
    let make = funcs.iter().find(|f| f.label == "make").unwrap();
    let stores_through_param = prims(make).iter().any(|p| {
        matches!(p, Prim::Assign { repr: Repr::Block(2), dst: Place::Indirect(..), .. })
    });
    assert!(stores_through_param, "{}", make);
    let user = funcs.iter().find(|f| f.label == "use").unwrap();
    assert!(prims(user).iter().any(|p| matches!(p, Prim::CallStart(2))), "{}", user);
}

#[test]
fn test_switch_compares_each_case() {
    let src = "int f(int x) { switch (x) { case 1: return 10; case 2: return 20; default: return 0; } }";
    let funcs = lower_src(src);
    let compares = prims(&funcs[0])
        .iter()
        .filter(|p| matches!(p, Prim::Compare { cond: Cond::Eq, .. }))
        .count();
    assert_eq!(compares, 2);
}
