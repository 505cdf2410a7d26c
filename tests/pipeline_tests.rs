//! Whole-pipeline tests on the emitted assembly text

mod common;

use common::assemble;
use wcc::compiler::{CompileOptions, Compiler};
use wcc::Error;

fn compile(src: &str) -> String {
    assemble(src, CompileOptions::default())
}

fn diagnostics(src: &str) -> Vec<String> {
    let opts = CompileOptions {
        file: "t.c".into(),
        ..CompileOptions::default()
    };
    match Compiler::new(opts).compile(src) {
        Err(Error::Failed(errors)) => errors.iter().map(|e| e.render()).collect(),
        Err(other) => panic!("unexpected error {:?}", other),
        Ok(_) => panic!("expected diagnostics"),
    }
}

#[test]
fn test_constant_array_size_folds() {
    let asm = compile("int a[1 + 2 * 3];");
    assert!(asm.contains("\t.psect\tbss,pflg=2,p2al=0\n"), "{}", asm);
    assert!(asm.contains("\t.global\ta\na:\n\t.blkw\t7\n"), "{}", asm);
}

#[test]
fn test_static_data_is_local() {
    let asm = compile("static int hidden = 3; int shown = 4;");
    assert!(!asm.contains(".global\thidden"));
    assert!(asm.contains(".global\tshown"));
    assert!(asm.contains("\t.psect\tdata,pflg=0,p2al=0\n"));
    assert!(asm.contains("\t.word\t3\n"));
}

#[test]
fn test_source_lines_echoed_before_code() {
    let src = "int f(int a)\n{\n  return a + 1;\n}\n";
    let asm = compile(src);
    let echo = asm.find("; t.c:3:   return a + 1;").expect("echo of line 3");
    let ret = asm.rfind("\tret").unwrap();
    assert!(echo < ret);
    assert_eq!(asm.matches("; t.c:3:").count(), 1);
}

#[test]
fn test_string_literal_lands_in_const() {
    let asm = compile("char *greet(void) { return \"hi\"; }");
    let konst = asm.find("\t.psect\tconst,pflg=1,p2al=0").expect("const psect");
    let tail = &asm[konst..];
    assert!(tail.contains("\t.word\t104\n\t.word\t105\n\t.word\t0\n"), "{}", tail);
}

#[test]
fn test_helpers_are_called_not_defined() {
    let asm = compile("int f(int a, int b) { return a * b + a / b; }");
    assert!(asm.contains("\tcall\t__mul"));
    assert!(asm.contains("\tcall\t__div"));
    assert!(!asm.contains("__mul:"));
}

#[test]
fn test_override_at_nonzero_vptr_offset_gets_exactly_one_thunk() {
    let src = "struct A { virtual int f(void); int a; };\n\
               struct P { int pad; };\n\
               struct B : P, A { int b; };\n\
               struct C : B { int f(void) { return 3; } };\n\
               int A::f(void) { return 1; }\n\
               struct B b;\n\
               struct C c;";
    let asm = compile(src);
    let thunk_defs: Vec<&str> = asm
        .lines()
        .filter(|l| l.starts_with("__thunk_") && l.ends_with(':'))
        .collect();
    assert_eq!(thunk_defs, vec!["__thunk_m1_C__f:"], "{}", asm);
    assert!(asm.contains("\t.word\t__thunk_m1_C__f\n"), "{}", asm);
    // B keeps the base implementation, no adjustment needed
    assert!(asm.contains("\t.word\tA__f\n"), "{}", asm);
}

#[test]
fn test_override_at_zero_vptr_offset_needs_no_thunk() {
    let src = "struct A { virtual int f(void); int a; };\n\
               struct M : A { int m; };\n\
               struct D : M { int f(void) { return 3; } };\n\
               int A::f(void) { return 1; }\n\
               struct D d;";
    let asm = compile(src);
    assert!(!asm.contains("__thunk_"), "{}", asm);
    assert!(asm.contains("\t.word\tD__f\n"), "{}", asm);
}

#[test]
fn test_vtables_and_support_code_are_not_exported() {
    let src = "struct A { virtual int f(void); int a; };\n\
               int A::f(void) { return a; }\n\
               struct A g;";
    let asm = compile(src);
    assert!(asm.contains("A__init:"));
    assert!(!asm.contains(".global\tA__init"));
    assert!(asm.contains("__vtbl_A:"));
    assert!(!asm.contains(".global\t__vtbl_A"));
}

#[test]
fn test_diagnostics_carry_file_line_column() {
    let errs = diagnostics("int f(void) {\n  return y;\n}\n");
    assert_eq!(errs.len(), 1);
    assert!(errs[0].starts_with("t.c:2."), "{}", errs[0]);
    assert!(errs[0].contains("'y'"));
}

#[test]
fn test_each_bad_declaration_reported_once() {
    let errs = diagnostics("int f( { x; }\nint g(void) { return 1; }\nint h = ;\n");
    assert_eq!(errs.len(), 2, "{:?}", errs);
}

#[test]
fn test_redefinition_notes_prior_location() {
    let errs = diagnostics("int x = 1;\nint x = 2;\n");
    let lines: Vec<&str> = errs[0].lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].starts_with("t.c:2."));
    assert!(lines[1].starts_with("t.c:1."));
}

#[test]
fn test_line_directive_reanchors_diagnostics() {
    let errs = diagnostics("#line 40 \"orig.c\"\nint f(void) { return nope; }\n");
    assert!(errs[0].starts_with("orig.c:40."), "{}", errs[0]);
}

#[test]
fn test_listing_marks_relocated_words() {
    let opts = CompileOptions {
        listing: true,
        file: "t.c".into(),
        ..CompileOptions::default()
    };
    let out = Compiler::new(opts)
        .compile("int g; int f(void) { return g; }")
        .unwrap();
    let listing = out.listing.unwrap();
    assert!(listing.contains('\''), "{}", listing);
    assert!(listing.contains("f:"));
}
