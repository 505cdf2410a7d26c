//! Register liveness and dead instruction removal

use super::{Mach, MachFunc, RegSet};
use crate::compiler::list::NodeId;
use crate::compiler::prim::LabelId;
use std::collections::HashMap;

/// Registers live after each instruction, by position in `ids`
fn live_out(func: &MachFunc, ids: &[NodeId]) -> Vec<RegSet> {
    let labels: HashMap<LabelId, usize> = ids
        .iter()
        .enumerate()
        .filter_map(|(i, id)| match func.code.get(*id) {
            Mach::Label { label, .. } => Some((*label, i)),
            _ => None,
        })
        .collect();
    let n = ids.len();
    let mut live_in = vec![RegSet::EMPTY; n];
    let mut live_out = vec![RegSet::EMPTY; n];
    let mut changed = true;
    while changed {
        changed = false;
        for i in (0..n).rev() {
            let m = func.code.get(ids[i]);
            let mut out = RegSet::EMPTY;
            if m.falls_through() && i + 1 < n {
                out = out.union(live_in[i + 1]);
            }
            for l in m.successors() {
                if let Some(&t) = labels.get(&l) {
                    out = out.union(live_in[t]);
                }
            }
            let inn = m.reads().union(out.minus(m.writes()));
            if out != live_out[i] || inn != live_in[i] {
                live_out[i] = out;
                live_in[i] = inn;
                changed = true;
            }
        }
    }
    live_out
}

/// Removes instructions without side effects whose result is never read;
/// returns whether anything was removed
pub fn run(func: &mut MachFunc) -> bool {
    let mut removed_any = false;
    loop {
        let ids = func.code.ids();
        let out = live_out(func, &ids);
        let mut removed = false;
        for (i, id) in ids.iter().enumerate() {
            let m = func.code.get(*id);
            if m.is_removable() && !m.writes().intersects(out[i]) {
                func.code.remove(*id);
                removed = true;
            }
        }
        if !removed {
            return removed_any;
        }
        removed_any = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::mach::{Disp, Reg};
    use crate::error::SourceLoc;

    fn run_on(code: Vec<Mach>) -> Vec<Mach> {
        let mut f = MachFunc::new("f", false, Vec::new(), SourceLoc::builtin());
        for m in code {
            f.code.push_back(m, None);
        }
        run(&mut f);
        f.code.iter().map(|(_, m)| m.clone()).collect()
    }

    #[test]
    fn test_dead_chain_removed() {
        let out = run_on(vec![
            Mach::Ldi { rd: Reg::R1, value: 4 },
            Mach::Addi {
                rd: Reg::R2,
                ra: Reg::R1,
                imm: Disp::Num(1),
            },
            Mach::Ldi { rd: Reg::R0, value: 0 },
            Mach::Ret { wide: false },
        ]);
        assert_eq!(out, vec![Mach::Ldi { rd: Reg::R0, value: 0 }, Mach::Ret { wide: false }]);
    }

    #[test]
    fn test_wide_return_keeps_high_word() {
        let code = vec![
            Mach::Ldi { rd: Reg::R1, value: 4 },
            Mach::Ldi { rd: Reg::R0, value: 0 },
            Mach::Ret { wide: true },
        ];
        assert_eq!(run_on(code.clone()), code);
    }

    #[test]
    fn test_stores_and_stack_adjustments_stay() {
        let code = vec![
            Mach::Addi {
                rd: Reg::Sp,
                ra: Reg::Sp,
                imm: Disp::Num(-1),
            },
            Mach::Ldi { rd: Reg::R3, value: 9 },
            Mach::St {
                rs: Reg::R3,
                base: Reg::Sp,
                disp: Disp::Num(0),
            },
            Mach::Ret { wide: false },
        ];
        assert_eq!(run_on(code.clone()), code);
    }

    #[test]
    fn test_value_live_around_loop() {
        let l = LabelId(1);
        let code = vec![
            Mach::Ldi { rd: Reg::R2, value: 1 },
            Mach::Label {
                label: l,
                live_in: RegSet::EMPTY,
            },
            Mach::BranchZ {
                nonzero: true,
                ra: Reg::R2,
                target: l,
                short: false,
            },
            Mach::Ret { wide: false },
        ];
        assert_eq!(run_on(code.clone()), code);
    }
}
