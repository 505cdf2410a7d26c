//! Frame layout and stack reference resolution
//!
//! Slots that are actually referenced get consecutive offsets from the
//! frame base in slot order; the frame size `F` is their total. The depth
//! of the stack pointer below the statement level is then propagated over
//! the flow graph, and every symbolic displacement becomes a number:
//!
//! ```text
//! slot s + o   ->  offset(s) + o + depth
//! param o      ->  F + 1 + o + depth
//! frame * k    ->  k * F
//! ```
//!
//! Displacements that no longer fit their field are rebuilt through `r6`.

use super::encode::fits;
use super::{AluOp, Disp, Mach, MachFunc, Reg};
use crate::compiler::list::NodeId;
use crate::compiler::prim::LabelId;
use crate::error::{Error, Result};
use std::collections::HashMap;
use tracing::debug;

/// Width of the `addi`, `ld` and `st` immediate fields
const DISP_BITS: u32 = 6;

/// Lays out the frame and resolves every displacement
pub fn layout(func: &mut MachFunc) -> Result<()> {
    let _span = tracing::debug_span!("frame", function = %func.label).entered();
    let offsets = slot_offsets(func);
    let depths = depths(func)?;
    let frame = func.frame as i32;

    for id in func.code.ids() {
        let depth = depths.get(&id).copied().unwrap_or(0);
        let resolve = |d: Disp| -> Result<Disp> {
            Ok(match d {
                Disp::Num(v) => Disp::Num(v),
                Disp::Slot(s, o) => {
                    let base = offsets
                        .get(s.0 as usize)
                        .copied()
                        .flatten()
                        .ok_or_else(|| Error::internal(format!("slot {} has no frame offset", s)))?;
                    Disp::Num(base + o + depth)
                }
                Disp::Param(o) => Disp::Num(frame + 1 + o + depth),
                Disp::Frame(k) => Disp::Num(k * frame),
            })
        };
        match func.code.get_mut(id) {
            Mach::Addi { imm, .. } => *imm = resolve(*imm)?,
            Mach::Ld { disp, .. } | Mach::St { disp, .. } => *disp = resolve(*disp)?,
            _ => {}
        }
    }

    for id in func.code.ids() {
        expand(func, id);
    }
    debug!(frame = func.frame, "frame laid out");
    Ok(())
}

/// Assigns offsets to referenced slots; sets the frame size
fn slot_offsets(func: &mut MachFunc) -> Vec<Option<i32>> {
    let mut used = vec![false; func.slots.len()];
    for (_, m) in func.code.iter() {
        if let Mach::Addi { imm: Disp::Slot(s, _), .. }
        | Mach::Ld {
            disp: Disp::Slot(s, _), ..
        }
        | Mach::St {
            disp: Disp::Slot(s, _), ..
        } = m
        {
            if let Some(u) = used.get_mut(s.0 as usize) {
                *u = true;
            }
        }
    }
    let mut next = 0i32;
    let offsets = func
        .slots
        .iter()
        .zip(&used)
        .map(|(slot, &u)| {
            u.then(|| {
                let off = next;
                next += slot.words as i32;
                off
            })
        })
        .collect();
    func.frame = next as u32;
    offsets
}

/// Stack depth before each reachable instruction
///
/// The function starts `F` words above the statement level; every label
/// reached along several paths must see the same depth.
pub fn depths(func: &MachFunc) -> Result<HashMap<NodeId, i32>> {
    let labels: HashMap<LabelId, NodeId> = func
        .code
        .iter()
        .filter_map(|(id, m)| match m {
            Mach::Label { label, .. } => Some((*label, id)),
            _ => None,
        })
        .collect();
    let mut depth: HashMap<NodeId, i32> = HashMap::new();
    let mut work: Vec<(NodeId, i32)> = func.code.head().map(|h| (h, -(func.frame as i32))).into_iter().collect();

    while let Some((id, d)) = work.pop() {
        match depth.get(&id) {
            Some(&seen) if seen == d => continue,
            Some(&seen) => {
                return Err(Error::internal(format!(
                    "{}: stack depth {} and {} meet at one instruction",
                    func.label, seen, d
                )))
            }
            None => {}
        }
        depth.insert(id, d);
        let m = func.code.get(id);
        let after = d + m.sp_effect(func.frame);
        for l in m.label_refs() {
            let target = labels
                .get(&l)
                .copied()
                .ok_or_else(|| Error::internal(format!("{}: undefined label {}", func.label, l)))?;
            let at = if matches!(m, Mach::Lea { .. }) { d } else { after };
            work.push((target, at));
        }
        if m.falls_through() {
            if let Some(next) = func.code.next(id) {
                work.push((next, after));
            }
        }
    }
    Ok(depth)
}

/// Rebuilds an out-of-range displacement through `r6`
fn expand(func: &mut MachFunc, id: NodeId) {
    match func.code.get(id).clone() {
        Mach::Addi {
            rd: Reg::Sp,
            ra: Reg::Sp,
            imm: Disp::Num(0),
        } => {
            func.code.remove(id);
        }
        Mach::Addi {
            rd,
            ra,
            imm: Disp::Num(v),
        } if !fits(v, DISP_BITS) => {
            func.code.insert_before(id, Mach::Ldi { rd: Reg::R6, value: v }, None);
            func.code.replace(
                id,
                Mach::Alu {
                    op: AluOp::Add,
                    rd,
                    ra,
                    rb: Reg::R6,
                },
            );
        }
        Mach::Ld {
            rd,
            base,
            disp: Disp::Num(v),
        } if !fits(v, DISP_BITS) => {
            offset_base(func, id, base, v);
            func.code.replace(
                id,
                Mach::Ld {
                    rd,
                    base: Reg::R6,
                    disp: Disp::Num(0),
                },
            );
        }
        Mach::St {
            rs,
            base,
            disp: Disp::Num(v),
        } if !fits(v, DISP_BITS) => {
            offset_base(func, id, base, v);
            func.code.replace(
                id,
                Mach::St {
                    rs,
                    base: Reg::R6,
                    disp: Disp::Num(0),
                },
            );
        }
        _ => {}
    }
}

fn offset_base(func: &mut MachFunc, id: NodeId, base: Reg, v: i32) {
    func.code.insert_before(id, Mach::Ldi { rd: Reg::R6, value: v }, None);
    func.code.insert_before(
        id,
        Mach::Alu {
            op: AluOp::Add,
            rd: Reg::R6,
            ra: base,
            rb: Reg::R6,
        },
        None,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::prim::{Slot, SlotId};
    use crate::error::SourceLoc;

    fn mach(code: Vec<Mach>, slots: &[u32]) -> MachFunc {
        let slots = slots.iter().map(|&words| Slot { words, temp: false }).collect();
        let mut f = MachFunc::new("f", false, slots, SourceLoc::builtin());
        for m in code {
            f.code.push_back(m, None);
        }
        f
    }

    fn sp_adjust(imm: Disp) -> Mach {
        Mach::Addi {
            rd: Reg::Sp,
            ra: Reg::Sp,
            imm,
        }
    }

    #[test]
    fn test_unreferenced_slots_take_no_space() {
        let mut f = mach(
            vec![
                sp_adjust(Disp::Frame(-1)),
                Mach::Ld {
                    rd: Reg::R0,
                    base: Reg::Sp,
                    disp: Disp::Slot(SlotId(2), 0),
                },
            ],
            &[4, 1, 2],
        );
        layout(&mut f).unwrap();
        assert_eq!(f.frame, 2);
        let code: Vec<Mach> = f.code.iter().map(|(_, m)| m.clone()).collect();
        assert_eq!(code[0], sp_adjust(Disp::Num(-2)));
        assert_eq!(
            code[1],
            Mach::Ld {
                rd: Reg::R0,
                base: Reg::Sp,
                disp: Disp::Num(0)
            }
        );
    }

    #[test]
    fn test_outgoing_arguments_shift_slot_offsets() {
        let mut f = mach(
            vec![
                sp_adjust(Disp::Frame(-1)),
                sp_adjust(Disp::Num(-2)),
                Mach::Ld {
                    rd: Reg::R0,
                    base: Reg::Sp,
                    disp: Disp::Slot(SlotId(0), 0),
                },
                Mach::Ld {
                    rd: Reg::R1,
                    base: Reg::Sp,
                    disp: Disp::Param(0),
                },
            ],
            &[1],
        );
        layout(&mut f).unwrap();
        let code: Vec<Mach> = f.code.iter().map(|(_, m)| m.clone()).collect();
        assert!(matches!(code[2], Mach::Ld { disp: Disp::Num(2), .. }));
        // frame 1, return address at 1, first parameter at 2, plus depth 2
        assert!(matches!(code[3], Mach::Ld { disp: Disp::Num(4), .. }));
    }

    #[test]
    fn test_large_displacement_goes_through_r6() {
        let mut f = mach(
            vec![
                sp_adjust(Disp::Frame(-1)),
                Mach::Ld {
                    rd: Reg::R1,
                    base: Reg::Sp,
                    disp: Disp::Slot(SlotId(0), 0),
                },
                Mach::St {
                    rs: Reg::R0,
                    base: Reg::Sp,
                    disp: Disp::Slot(SlotId(1), 0),
                },
            ],
            &[40, 1],
        );
        layout(&mut f).unwrap();
        assert_eq!(f.frame, 41);
        let code: Vec<Mach> = f.code.iter().map(|(_, m)| m.clone()).collect();
        assert_eq!(code[0], Mach::Ldi { rd: Reg::R6, value: -41 });
        assert!(matches!(code[1], Mach::Alu { op: AluOp::Add, rd: Reg::Sp, .. }));
        assert!(matches!(code[2], Mach::Ld { disp: Disp::Num(0), .. }));
        assert_eq!(code[3], Mach::Ldi { rd: Reg::R6, value: 40 });
        assert!(matches!(code[5], Mach::St { base: Reg::R6, disp: Disp::Num(0), .. }));
    }

    #[test]
    fn test_inconsistent_depth_is_internal_error() {
        let mut f = mach(
            vec![
                Mach::BranchZ {
                    nonzero: true,
                    ra: Reg::R0,
                    target: LabelId(1),
                    short: false,
                },
                sp_adjust(Disp::Num(-1)),
                Mach::Label {
                    label: LabelId(1),
                    live_in: Default::default(),
                },
                Mach::Ret { wide: false },
            ],
            &[],
        );
        assert!(matches!(layout(&mut f), Err(Error::Internal(_))));
    }
}
