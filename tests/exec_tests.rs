//! End-to-end tests: compile, assemble into the simulator, run `main`

mod common;

use common::{assemble, run_main, run_main_with, Machine};
use wcc::compiler::CompileOptions;

#[test]
fn test_integer_arithmetic() {
    let src = "int main(void) { int a = 7; int b = 3; return a * b + a / b - a % b; }";
    assert_eq!(run_main(src), 22);
}

#[test]
fn test_signed_division_truncates_toward_zero() {
    let src = "int main(void) { int a = -7; int b = 2; return (a / b) * 100 + a % b; }";
    assert_eq!(run_main(src), -301);
}

#[test]
fn test_for_loop_sum() {
    let src = "int main(void) { int s = 0; int i; for (i = 1; i <= 10; i++) s += i; return s; }";
    assert_eq!(run_main(src), 55);
}

#[test]
fn test_while_and_do_while() {
    let src = "int main(void) {\n\
                 int n = 0; int k = 5;\n\
                 while (k > 0) { n = n + k; k--; }\n\
                 do { n = n * 2; } while (n < 100);\n\
                 return n;\n\
               }";
    assert_eq!(run_main(src), 120);
}

#[test]
fn test_recursion() {
    let src = "int fib(int n) { if (n < 2) return n; return fib(n - 1) + fib(n - 2); }\n\
               int main(void) { return fib(10); }";
    assert_eq!(run_main(src), 55);
}

#[test]
fn test_arguments_arrive_in_order() {
    let src = "int f(int a, int b, int c) { return a * 100 + b * 10 + c; }\n\
               int main(void) { return f(1, 2, 3); }";
    assert_eq!(run_main(src), 123);
}

#[test]
fn test_arrays_and_pointer_arithmetic() {
    let src = "int a[5];\n\
               int main(void) {\n\
                 int i; int *p = a;\n\
                 for (i = 0; i < 5; i++) a[i] = i * i;\n\
                 return *(p + 3) + (p + 4 - p);\n\
               }";
    assert_eq!(run_main(src), 13);
}

#[test]
fn test_logical_operators_short_circuit() {
    let src = "int hits;\n\
               int touch(int v) { hits = hits + 1; return v; }\n\
               int main(void) {\n\
                 int r = 0;\n\
                 if (touch(0) && touch(1)) r = 1;\n\
                 if (touch(1) || touch(1)) r = r + 2;\n\
                 return r * 10 + hits;\n\
               }";
    assert_eq!(run_main(src), 22);
}

#[test]
fn test_switch_dispatch() {
    let src = "int f(int x) { switch (x) { case 1: return 10; case 2: return 20; default: return 0; } }\n\
               int main(void) { return f(1) + f(2) + f(9); }";
    assert_eq!(run_main(src), 30);
}

#[test]
fn test_struct_returned_through_hidden_pointer() {
    let src = "struct P { int a; int b; };\n\
               struct P make(int v) { struct P p; p.a = v; p.b = v * 2; return p; }\n\
               int main(void) { struct P q; q = make(4); return q.a + q.b; }";
    assert_eq!(run_main(src), 12);
}

#[test]
fn test_global_initializers_and_strings() {
    let src = "int tbl[3] = {4, 5, 6};\n\
               int main(void) { char *s = \"abc\"; return s[1] + tbl[2]; }";
    assert_eq!(run_main(src), 104);
}

#[test]
fn test_char_values_are_sign_extended() {
    let src = "int main(void) { char c = (char)200; unsigned char u = (unsigned char)200; return c + u; }";
    assert_eq!(run_main(src), 144);
}

#[test]
fn test_long_arithmetic_through_helpers() {
    let src = "long mul(long a, long b) { return a * b; }\n\
               int main(void) { long x = 100000; long y = mul(x, 3) - 250000; return (int)(y / 1000); }";
    assert_eq!(run_main(src), 50);
}

#[test]
fn test_virtual_dispatch_through_second_base_uses_thunk() {
    let src = "struct A { virtual int f(void); int a; };\n\
               struct B { virtual int g(void); int b; };\n\
               struct C : A, B { int f(void) { return 10; } int g(void) { return 30 + b; } };\n\
               int A::f(void) { return 1; }\n\
               int B::g(void) { return 2; }\n\
               int callf(struct A *a) { return a->f(); }\n\
               int callg(struct B *b) { return b->g(); }\n\
               int main(void) { struct C c; c.b = 5; return callf(&c) + callg(&c); }";
    let asm = assemble(src, CompileOptions::default());
    assert!(asm.contains("__thunk_"), "{}", asm);
    assert_eq!(run_main(src), 45);
}

#[test]
fn test_base_method_without_override() {
    let src = "struct A { virtual int f(void); int a; };\n\
               struct D : A { int d; };\n\
               int A::f(void) { return a + 1; }\n\
               int main(void) { struct D x; struct A *p = &x; x.a = 41; return p->f(); }";
    assert_eq!(run_main(src), 42);
}

#[test]
fn test_ctor_and_dtor_run_in_order() {
    let src = "int trace;\n\
               struct R { int v; void __ctor() { trace = trace * 10 + 1; } void __dtor() { trace = trace * 10 + 2; } };\n\
               void scope(void) { struct R r; trace = trace * 10 + 3; }\n\
               int main(void) { scope(); return trace; }";
    assert_eq!(run_main(src), 132);
}

#[test]
fn test_throw_caught_in_caller() {
    let src = "int thrower(int x) { if (x) throw 7; return 1; }\n\
               int f(int x) { int r = 0; try { r = thrower(x); } catch (int e) { r = e; } return r; }\n\
               int main(void) { return f(1) * 10 + f(0); }";
    assert_eq!(run_main(src), 71);
}

#[test]
fn test_finally_runs_once_on_every_exit() {
    let src = "int count;\n\
               void bump(void) { count = count + 1; }\n\
               int g(int x) { try { if (x) return 5; count = count + 100; } finally { bump(); } return 6; }\n\
               int main(void) { int b = g(1); int c = g(0); return count * 100 + b * 10 + c; }";
    // g(1): finally once, count 1; g(0): +100 then finally, count 102
    assert_eq!(run_main(src), 10256);
}

#[test]
fn test_unoptimized_code_computes_the_same() {
    let src = "int fib(int n) { if (n < 2) return n; return fib(n - 1) + fib(n - 2); }\n\
               int main(void) { int i; int s = 0; for (i = 0; i < 8; i++) s += fib(i); return s; }";
    let o0 = CompileOptions {
        opt_level: 0,
        ..CompileOptions::default()
    };
    assert_eq!(run_main_with(src, o0), 33);
    assert_eq!(run_main(src), 33);
}

#[test]
fn test_optimized_code_runs_fewer_steps() {
    let src = "int main(void) { int s = 0; int i; for (i = 0; i < 20; i++) s = s + i * 2; return s; }";
    let steps = |level| {
        let asm = assemble(
            src,
            CompileOptions {
                opt_level: level,
                ..CompileOptions::default()
            },
        );
        let mut m = Machine::load(&asm).unwrap();
        assert_eq!(m.call("main", &[]).unwrap(), 380);
        m.steps
    };
    assert!(steps(1) < steps(0));
}

#[test]
fn test_called_with_arguments_from_harness() {
    let asm = assemble("int sub3(int a, int b, int c) { return a - b - c; }", CompileOptions::default());
    let mut m = Machine::load(&asm).unwrap();
    assert_eq!(m.call("sub3", &[100, 30, 5]).unwrap(), 65);
}

#[test]
fn test_assignment_target_evaluated_before_value() {
    let src = "int arr[3]; int i;\n\
               int f(void) { i = 2; return 5; }\n\
               int main(void) { i = 0; arr[i] = f(); return arr[0] * 10 + arr[2]; }";
    assert_eq!(run_main(src), 50);
    let o0 = CompileOptions {
        opt_level: 0,
        ..CompileOptions::default()
    };
    assert_eq!(run_main_with(src, o0), 50);
}

#[test]
fn test_assignment_through_pointer_changed_by_value() {
    let src = "int a; int b; int *p;\n\
               int f(void) { p = &b; return 9; }\n\
               int main(void) { p = &a; *p = f(); return a * 10 + b; }";
    assert_eq!(run_main(src), 90);
}
