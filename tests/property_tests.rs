//! Property-based tests for arithmetic, the IR optimizer and relaxation
//!
//! These tests use proptest to check that:
//! 1. Compiled 16-bit arithmetic matches wraparound semantics, folded or not
//! 2. Pointer arithmetic scales and unscales by the element size
//! 3. The IR optimizer reaches a fixed point in one call
//! 4. Branch relaxation only shrinks code and ends with every form in range

mod common;

use common::run_main;
use proptest::prelude::*;
use wcc::compiler::lower::lower_function;
use wcc::compiler::mach::relax::{check, relax};
use wcc::compiler::mach::{BranchCond, Disp, Mach, MachFunc, Reg, RegSet};
use wcc::compiler::prim::LabelId;
use wcc::compiler::{Optimizer, Session};
use wcc::{Parser, Scanner, SourceLoc};

// =============================================================================
// STRATEGY GENERATORS
// =============================================================================

fn operand() -> impl Strategy<Value = i32> {
    -32767i32..=32767
}

fn operator() -> impl Strategy<Value = &'static str> {
    prop_oneof![
        Just("+"),
        Just("-"),
        Just("*"),
        Just("/"),
        Just("%"),
        Just("&"),
        Just("|"),
        Just("^"),
    ]
}

fn statement() -> impl Strategy<Value = String> {
    prop_oneof![
        (1i32..100).prop_map(|k| format!("x = x + {};", k)),
        (1i32..100).prop_map(|k| format!("if (x > {}) x = x - {}; else x = x * 2;", k, k)),
        (1i32..50).prop_map(|k| format!("while (x > {}) x = x - 3;", k)),
        (1i32..50).prop_map(|k| format!("for (i = 0; i < {}; i++) {{ if (i == 3) continue; x += i; }}", k)),
        Just("if (x && i) x = 0;".to_string()),
        Just("switch (x) { case 1: x = 2; break; case 2: x = 3; default: x = 4; }".to_string()),
    ]
}

/// Instruction stream for relaxation: filler runs and branches to labels
#[derive(Debug, Clone)]
enum Item {
    Filler(usize),
    Branch(u32),
    Test(u32),
    Jump(u32),
    Label(u32),
}

fn item() -> impl Strategy<Value = Item> {
    prop_oneof![
        (1usize..200).prop_map(Item::Filler),
        (0u32..6).prop_map(Item::Branch),
        (0u32..6).prop_map(Item::Test),
        (0u32..6).prop_map(Item::Jump),
        (0u32..6).prop_map(Item::Label),
    ]
}

// =============================================================================
// HELPERS
// =============================================================================

fn wrap(a: i32, op: &str, b: i32) -> i16 {
    let (a, b) = (a as i16, b as i16);
    match op {
        "+" => a.wrapping_add(b),
        "-" => a.wrapping_sub(b),
        "*" => a.wrapping_mul(b),
        "/" => a.wrapping_div(b),
        "%" => a.wrapping_rem(b),
        "&" => a & b,
        "|" => a | b,
        _ => a ^ b,
    }
}

fn lit(v: i32) -> String {
    if v < 0 {
        format!("(-{})", -v)
    } else {
        v.to_string()
    }
}

fn machine_func(items: &[Item]) -> MachFunc {
    let mut f = MachFunc::new("f", false, Vec::new(), SourceLoc::builtin());
    let filler = Mach::Addi {
        rd: Reg::R0,
        ra: Reg::R0,
        imm: Disp::Num(1),
    };
    for it in items {
        match it {
            Item::Filler(n) => {
                for _ in 0..*n {
                    f.code.push_back(filler.clone(), None);
                }
            }
            Item::Branch(l) => {
                f.code.push_back(
                    Mach::Branch {
                        cond: BranchCond::Lt,
                        ra: Reg::R0,
                        rb: Reg::R1,
                        target: LabelId(*l),
                        short: false,
                    },
                    None,
                );
            }
            Item::Test(l) => {
                f.code.push_back(
                    Mach::BranchZ {
                        nonzero: true,
                        ra: Reg::R2,
                        target: LabelId(*l),
                        short: false,
                    },
                    None,
                );
            }
            Item::Jump(l) => {
                f.code.push_back(
                    Mach::Jump {
                        target: LabelId(*l),
                        short: false,
                    },
                    None,
                );
            }
            Item::Label(_) => {}
        }
    }
    // Each label is defined once; the ones the stream never placed go last.
    let mut placed = Vec::new();
    let ids = f.code.ids();
    for (n, it) in items.iter().enumerate() {
        if let Item::Label(l) = it {
            if !placed.contains(l) {
                placed.push(*l);
                let at = ids.get(n.min(ids.len().saturating_sub(1))).copied();
                let label = Mach::Label {
                    label: LabelId(*l),
                    live_in: RegSet::EMPTY,
                };
                match at {
                    Some(id) => {
                        f.code.insert_before(id, label, None);
                    }
                    None => {
                        f.code.push_back(label, None);
                    }
                }
            }
        }
    }
    for l in 0..6 {
        if !placed.contains(&l) {
            f.code.push_back(
                Mach::Label {
                    label: LabelId(l),
                    live_in: RegSet::EMPTY,
                },
                None,
            );
        }
    }
    f
}

// =============================================================================
// PROPERTIES
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_runtime_arithmetic_wraps_to_16_bits(a in operand(), op in operator(), b in operand()) {
        prop_assume!(!(op == "/" || op == "%") || b != 0);
        let src = format!(
            "int main(void) {{ int a = {}; int b = {}; return a {} b; }}",
            lit(a), lit(b), op
        );
        prop_assert_eq!(run_main(&src), wrap(a, op, b));
    }

    #[test]
    fn prop_folded_arithmetic_matches_runtime(a in operand(), op in operator(), b in operand()) {
        prop_assume!(!(op == "/" || op == "%") || b != 0);
        let src = format!("int main(void) {{ return {} {} {}; }}", lit(a), op, lit(b));
        prop_assert_eq!(run_main(&src), wrap(a, op, b));
    }

    #[test]
    fn prop_division_identity(a in operand(), b in operand()) {
        prop_assume!(b != 0);
        let src = format!(
            "int main(void) {{ int a = {}; int b = {}; return (a / b) * b + a % b - a; }}",
            lit(a), lit(b)
        );
        prop_assert_eq!(run_main(&src), 0);
    }

    #[test]
    fn prop_pointer_difference_recovers_offset(n in 0i32..40) {
        let src = format!(
            "struct S {{ int a; long b; }};\n\
             struct S arr[40];\n\
             int main(void) {{ struct S *p = arr; struct S *q = p + {}; \
             return (q - p) * 100 + ((int)q - (int)p); }}",
            n
        );
        prop_assert_eq!(run_main(&src) as i32, n * 100 + n * 3);
    }

    #[test]
    fn prop_ir_optimizer_is_idempotent(body in prop::collection::vec(statement(), 1..8)) {
        let src = format!("int f(int x) {{ int i = 0; {} return x; }}", body.join(" "));
        let mut sess = Session::new("t.c");
        let (tokens, errors) = Scanner::new(&src, "t.c").scan_tokens();
        prop_assert!(errors.is_empty());
        let unit = Parser::new(&mut sess, tokens).parse();
        prop_assert!(!sess.has_errors(), "{:?}", sess.diags.errors());
        let mut f = lower_function(&mut sess, &unit.functions[0]).unwrap();
        let mut opt = Optimizer::new(1);
        opt.optimize(&mut f);
        let once = f.to_string();
        opt.optimize(&mut f);
        prop_assert_eq!(once, f.to_string());
    }

    #[test]
    fn prop_relaxation_shrinks_and_stays_in_range(items in prop::collection::vec(item(), 1..40)) {
        let mut f = machine_func(&items);
        let before = f.size();
        relax(&mut f).unwrap();
        prop_assert!(f.size() <= before);
        check(&f).unwrap();
        let after = f.size();
        relax(&mut f).unwrap();
        prop_assert_eq!(f.size(), after);
    }
}
