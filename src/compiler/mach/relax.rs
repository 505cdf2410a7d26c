//! Branch relaxation
//!
//! Branches, jumps and label-address loads are selected in their long form.
//! Each round computes addresses from the current sizes and marks short
//! every instruction whose target is already within its short range.
//! Marking only shrinks code, so every distance can only shrink and a
//! short instruction never has to go back to long.

use super::encode::{fits, short_bits};
use super::{Mach, MachFunc};
use crate::compiler::list::NodeId;
use crate::compiler::prim::LabelId;
use crate::error::{Error, Result};
use std::collections::HashMap;
use tracing::debug;

/// Address of each instruction and each label, counted from `base`
pub fn addresses(func: &MachFunc, base: u32) -> (HashMap<NodeId, u32>, HashMap<LabelId, u32>) {
    let mut nodes = HashMap::new();
    let mut labels = HashMap::new();
    let mut at = base;
    for (id, m) in func.code.iter() {
        nodes.insert(id, at);
        if let Mach::Label { label, .. } = m {
            labels.insert(*label, at);
        }
        at += m.size();
    }
    (nodes, labels)
}

/// Offset from the word after a short form at `at` to `target`
fn short_offset(at: u32, target: u32) -> i32 {
    target as i32 - (at as i32 + 1)
}

/// Selects the short form wherever it reaches, then verifies every short
/// form is in range
pub fn relax(func: &mut MachFunc) -> Result<()> {
    let _span = tracing::debug_span!("relax", function = %func.label).entered();
    let mut rounds = 0;
    loop {
        rounds += 1;
        let (nodes, labels) = addresses(func, 0);
        let mut changed = false;
        for id in func.code.ids() {
            let m = func.code.get(id);
            if m.is_short() {
                continue;
            }
            let (Some(bits), Some(target)) = (short_bits(m), m.relax_target()) else {
                continue;
            };
            let at = nodes[&id];
            let Some(&dest) = labels.get(&target) else {
                return Err(Error::internal(format!("{}: undefined label {}", func.label, target)));
            };
            if fits(short_offset(at, dest), bits) {
                func.code.get_mut(id).set_short();
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
    check(func)?;
    debug!(rounds, size = func.size(), "relaxed");
    Ok(())
}

/// Verifies that every short form reaches its target
pub fn check(func: &MachFunc) -> Result<()> {
    let (nodes, labels) = addresses(func, 0);
    for (id, m) in func.code.iter() {
        if !m.is_short() {
            continue;
        }
        if let (Some(bits), Some(target)) = (short_bits(m), m.relax_target()) {
            let dest = labels
                .get(&target)
                .ok_or_else(|| Error::internal(format!("{}: undefined label {}", func.label, target)))?;
            if !fits(short_offset(nodes[&id], *dest), bits) {
                return Err(Error::internal(format!(
                    "{}: short form of '{}' cannot reach {}",
                    func.label,
                    m.to_string().trim(),
                    target
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::mach::{Disp, Reg, RegSet};
    use crate::error::SourceLoc;

    fn filler(n: usize) -> Vec<Mach> {
        (0..n)
            .map(|_| Mach::Addi {
                rd: Reg::R0,
                ra: Reg::R0,
                imm: Disp::Num(1),
            })
            .collect()
    }

    fn func(code: Vec<Mach>) -> MachFunc {
        let mut f = MachFunc::new("f", false, Vec::new(), SourceLoc::builtin());
        for m in code {
            f.code.push_back(m, None);
        }
        f
    }

    fn label(n: u32) -> Mach {
        Mach::Label {
            label: LabelId(n),
            live_in: RegSet::EMPTY,
        }
    }

    #[test]
    fn test_near_branch_becomes_short() {
        let mut code = vec![Mach::BranchZ {
            nonzero: true,
            ra: Reg::R0,
            target: LabelId(1),
            short: false,
        }];
        code.extend(filler(10));
        code.push(label(1));
        let mut f = func(code);
        relax(&mut f).unwrap();
        assert_eq!(f.size(), 11);
    }

    #[test]
    fn test_far_compare_branch_stays_long() {
        let mut code = vec![Mach::Branch {
            cond: crate::compiler::mach::BranchCond::Eq,
            ra: Reg::R0,
            rb: Reg::R1,
            target: LabelId(1),
            short: false,
        }];
        code.extend(filler(40));
        code.push(label(1));
        let mut f = func(code);
        relax(&mut f).unwrap();
        assert_eq!(f.size(), 43);
    }

    #[test]
    fn test_shrinking_one_branch_lets_another_reach() {
        // The outer bcc reaches only once the inner one has shrunk.
        let mut code = vec![
            Mach::Branch {
                cond: crate::compiler::mach::BranchCond::Ne,
                ra: Reg::R0,
                rb: Reg::R1,
                target: LabelId(1),
                short: false,
            },
            Mach::Jump {
                target: LabelId(2),
                short: false,
            },
        ];
        code.extend(filler(12));
        code.push(label(1));
        code.push(label(2));
        let mut f = func(code);
        relax(&mut f).unwrap();
        assert!(f.code.iter().all(|(_, m)| m.is_short()));
        check(&f).unwrap();
    }

    #[test]
    fn test_check_rejects_stale_short_form() {
        let mut code = vec![Mach::Jump {
            target: LabelId(1),
            short: true,
        }];
        code.extend(filler(3000));
        code.push(label(1));
        assert!(matches!(check(&func(code)), Err(Error::Internal(_))));
    }
}
