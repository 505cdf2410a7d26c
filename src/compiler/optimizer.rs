//! # Prim optimizer
//!
//! Peephole rewrites over one function's flow list, repeated until none
//! applies:
//! - merge adjacent labels
//! - delete unreferenced labels
//! - delete computations into temporaries nobody reads
//! - forward a single-use temporary into the assignment that consumes it
//! - turn `branch L1; jump L2; L1:` into `inverted-branch L2; L1:`
//! - delete unreachable nodes after a non-fallthrough node
//! - delete a jump to the label that immediately follows it

use super::list::NodeId;
use super::prim::{LabelId, Operand, Place, Prim, PrimFunc, SlotId};
use std::collections::HashMap;

/// Optimizer with configurable optimization level
pub struct Optimizer {
    level: u8,
}

impl Optimizer {
    /// Create a new optimizer with the specified optimization level; level
    /// 0 leaves the code untouched
    pub fn new(level: u8) -> Self {
        Self { level }
    }

    /// Run every pass until the function stops changing
    pub fn optimize(&mut self, func: &mut PrimFunc) {
        if self.level == 0 {
            return;
        }
        let _span = tracing::debug_span!("optimize", function = %func.label).entered();
        let before = func.prims.len();
        let mut rounds = 0;
        loop {
            rounds += 1;
            let mut changed = false;
            changed |= self.merge_labels(func);
            changed |= self.remove_unused_labels(func);
            changed |= self.remove_dead_temps(func);
            changed |= self.forward_temps(func);
            changed |= self.invert_branches(func);
            changed |= self.remove_unreachable(func);
            changed |= self.remove_jumps_to_next(func);
            if !changed {
                break;
            }
        }
        tracing::debug!(before, after = func.prims.len(), rounds, "optimized function");
    }

    /// Adjacent plain labels collapse into the first
    fn merge_labels(&self, func: &mut PrimFunc) -> bool {
        let mut renames: HashMap<LabelId, LabelId> = HashMap::new();
        for id in func.prims.ids() {
            if !func.prims.contains(id) {
                continue;
            }
            let first = match func.prims.get(id) {
                Prim::Label(l) => *l,
                _ => continue,
            };
            while let Some(next) = func.prims.next(id) {
                match func.prims.get(next) {
                    Prim::Label(second) => {
                        renames.insert(*second, first);
                        func.prims.remove(next);
                    }
                    _ => break,
                }
            }
        }
        if renames.is_empty() {
            return false;
        }
        let resolve = |mut l: LabelId| {
            while let Some(&to) = renames.get(&l) {
                l = to;
            }
            l
        };
        for id in func.prims.ids() {
            for target in func.prims.get_mut(id).targets_mut() {
                *target = resolve(*target);
            }
        }
        // A finally reached from two merged resume points lists one label twice.
        for id in func.prims.ids() {
            if let Prim::FinallyReturn { resumes, .. } = func.prims.get_mut(id) {
                let mut seen = Vec::with_capacity(resumes.len());
                resumes.retain(|l| {
                    let fresh = !seen.contains(l);
                    seen.push(*l);
                    fresh
                });
            }
        }
        true
    }

    fn label_uses(func: &PrimFunc) -> HashMap<LabelId, usize> {
        let mut uses = HashMap::new();
        for (_, p) in func.prims.iter() {
            for t in p.targets() {
                *uses.entry(t).or_insert(0) += 1;
            }
        }
        uses
    }

    fn remove_unused_labels(&self, func: &mut PrimFunc) -> bool {
        let uses = Self::label_uses(func);
        let mut changed = false;
        for id in func.prims.ids() {
            let unused = match func.prims.get(id).defined_label() {
                Some(l) => !uses.contains_key(&l),
                None => false,
            };
            if unused {
                func.prims.remove(id);
                changed = true;
            }
        }
        changed
    }

    /// Reads of every slot, address-taking included
    fn slot_reads(func: &PrimFunc) -> HashMap<SlotId, usize> {
        let mut reads = HashMap::new();
        for (_, p) in func.prims.iter() {
            for s in p.read_slots() {
                *reads.entry(s).or_insert(0) += 1;
            }
        }
        reads
    }

    fn dead_temp(func: &PrimFunc, reads: &HashMap<SlotId, usize>, place: &Place) -> bool {
        match place {
            Place::Slot(s, _) => func.is_temp(*s) && !reads.contains_key(s),
            _ => false,
        }
    }

    fn remove_dead_temps(&self, func: &mut PrimFunc) -> bool {
        let reads = Self::slot_reads(func);
        let mut changed = false;
        for id in func.prims.ids() {
            let dead = match func.prims.get(id).dst() {
                Some(dst) => Self::dead_temp(func, &reads, dst),
                None => false,
            };
            if !dead {
                continue;
            }
            match func.prims.get_mut(id) {
                Prim::Call { result, .. } => *result = None,
                p if p.is_pure() => {
                    func.prims.remove(id);
                }
                _ => continue,
            }
            changed = true;
        }
        changed
    }

    /// `t = op ...; D = t` becomes `D = op ...` when `t` has no other use
    fn forward_temps(&self, func: &mut PrimFunc) -> bool {
        let mut changed = false;
        let mut reads = Self::slot_reads(func);
        let mut defs: HashMap<SlotId, usize> = HashMap::new();
        for (_, p) in func.prims.iter() {
            if let Some(s) = p.dst().and_then(Place::slot) {
                *defs.entry(s).or_insert(0) += 1;
            }
        }
        for id in func.prims.ids() {
            if !func.prims.contains(id) {
                continue;
            }
            let producer = func.prims.get(id);
            if !(producer.is_pure() || matches!(producer, Prim::Call { .. })) {
                continue;
            }
            let (temp, repr) = match (producer.dst(), producer.dst_repr()) {
                (Some(Place::Slot(t, 0)), Some(r)) if func.is_temp(*t) => (*t, r),
                _ => continue,
            };
            if defs.get(&temp) != Some(&1) || reads.get(&temp) != Some(&1) {
                continue;
            }
            let next = match func.prims.next(id) {
                Some(n) => n,
                None => continue,
            };
            let dst = match func.prims.get(next) {
                Prim::Assign {
                    repr: r,
                    dst,
                    src: Operand::Load(src),
                } if *r == repr && **src == Place::Slot(temp, 0) => dst.clone(),
                _ => continue,
            };
            if let Some(place) = func.prims.get_mut(id).dst_mut() {
                *place = dst;
            }
            func.prims.remove(next);
            reads.remove(&temp);
            changed = true;
        }
        changed
    }

    fn defines(func: &PrimFunc, id: Option<NodeId>, label: LabelId) -> bool {
        id.map(|n| func.prims.get(n).defined_label() == Some(label))
            .unwrap_or(false)
    }

    fn invert_branches(&self, func: &mut PrimFunc) -> bool {
        let mut changed = false;
        for id in func.prims.ids() {
            if !func.prims.contains(id) || !func.prims.get(id).is_branch() {
                continue;
            }
            let over = func.prims.get(id).targets()[0];
            let jump = match func.prims.next(id) {
                Some(j) => j,
                None => continue,
            };
            let far = match func.prims.get(jump) {
                Prim::Jump(l) => *l,
                _ => continue,
            };
            if !Self::defines(func, func.prims.next(jump), over) {
                continue;
            }
            let branch = func.prims.get_mut(id);
            branch.invert();
            for t in branch.targets_mut() {
                *t = far;
            }
            func.prims.remove(jump);
            changed = true;
        }
        changed
    }

    fn remove_unreachable(&self, func: &mut PrimFunc) -> bool {
        let mut changed = false;
        let mut cur = func.prims.head();
        while let Some(id) = cur {
            cur = func.prims.next(id);
            if func.prims.get(id).falls_through() {
                continue;
            }
            while let Some(n) = cur {
                if func.prims.get(n).defined_label().is_some() {
                    break;
                }
                cur = func.prims.remove(n);
                changed = true;
            }
        }
        changed
    }

    fn remove_jumps_to_next(&self, func: &mut PrimFunc) -> bool {
        let mut changed = false;
        for id in func.prims.ids() {
            let target = match func.prims.get(id) {
                Prim::Jump(l) => *l,
                _ => continue,
            };
            if Self::defines(func, func.prims.next(id), target) {
                func.prims.remove(id);
                changed = true;
            }
        }
        changed
    }
}
