//! Per-unit support code for structs
//!
//! Every struct the unit uses gets its init and term functions (when it
//! needs them), its vtables in the const psect and one adjustor thunk per
//! distinct `(adjust, implementation)` pair its vtables reference. None of
//! it is exported: each translation unit carries its own copy.

use super::data::{DataItem, DataWord, Section};
use super::lower::support::{lower_init, lower_term};
use super::mach::encode::fits;
use super::mach::{AluOp, Disp, Mach, MachFunc, Reg};
use super::prim::PrimFunc;
use super::session::Session;
use crate::error::Result;
use crate::types::{thunk_label, Type, TypeId, TypeTable};
use std::collections::BTreeSet;
use tracing::debug;

/// Support code generated for one unit
#[derive(Debug, Default)]
pub struct Support {
    /// Init and term functions, to be compiled like user functions
    pub functions: Vec<PrimFunc>,
    /// Adjustor thunks, already in final machine form
    pub thunks: Vec<MachFunc>,
    /// Vtables
    pub data: Vec<DataItem>,
}

/// Generates support code for every used struct
pub fn generate(sess: &mut Session) -> Result<Support> {
    let _span = tracing::debug_span!("support").entered();
    let used: Vec<_> = sess
        .types
        .structs()
        .filter(|(_, d)| d.used && d.complete)
        .map(|(sid, _)| sid)
        .collect();

    let mut out = Support::default();
    let mut thunks = BTreeSet::new();
    for sid in used {
        let def = sess.types.struct_def(sid).clone();
        if def.needs_init {
            out.functions.push(lower_init(sess, sid)?);
        }
        if def.needs_term {
            out.functions.push(lower_term(sess, sid)?);
        }
        for vt in &def.vtables {
            let words = (0..vt.slots.len())
                .map(|i| DataWord::Symbol(vt.entry_label(i), 0))
                .collect();
            let mut item = DataItem::init(vt.label.clone(), Section::Const, words, false);
            item.loc = Some(def.loc.clone());
            out.data.push(item);
            for (i, slot) in vt.slots.iter().enumerate() {
                let adjust = vt.adjust(i);
                if adjust != 0 && !slot.is_pure() {
                    let this_at = this_offset(&sess.types, slot.fn_ty);
                    thunks.insert((adjust, slot.label.clone(), this_at));
                }
            }
        }
    }
    out.thunks = thunks
        .into_iter()
        .map(|(adjust, target, this_at)| thunk(adjust, &target, this_at))
        .collect();
    debug!(
        functions = out.functions.len(),
        thunks = out.thunks.len(),
        vtables = out.data.len(),
        "support code"
    );
    Ok(out)
}

/// Stack offset of `this` on entry: the return address is at `0(sp)` and a
/// hidden result pointer, when present, comes before `this`
fn this_offset(types: &TypeTable, fn_ty: TypeId) -> i32 {
    match types.kind(fn_ty) {
        Type::Function { ret, .. } if types.returns_in_memory(*ret) => 2,
        _ => 1,
    }
}

/// Adds `adjust` to the incoming `this` and tail-jumps to `target`
pub fn thunk(adjust: i32, target: &str, this_at: i32) -> MachFunc {
    let label = thunk_label(adjust, target);
    let mut f = MachFunc::new(label, false, Vec::new(), crate::error::SourceLoc::builtin());
    let at = Disp::Num(this_at);
    f.code.push_back(
        Mach::Ld {
            rd: Reg::R0,
            base: Reg::Sp,
            disp: at,
        },
        None,
    );
    if fits(adjust, 6) {
        f.code.push_back(
            Mach::Addi {
                rd: Reg::R0,
                ra: Reg::R0,
                imm: Disp::Num(adjust),
            },
            None,
        );
    } else {
        f.code.push_back(Mach::Ldi { rd: Reg::R1, value: adjust }, None);
        f.code.push_back(
            Mach::Alu {
                op: AluOp::Add,
                rd: Reg::R0,
                ra: Reg::R0,
                rb: Reg::R1,
            },
            None,
        );
    }
    f.code.push_back(
        Mach::St {
            rs: Reg::R0,
            base: Reg::Sp,
            disp: at,
        },
        None,
    );
    f.code.push_back(
        Mach::JumpSym {
            symbol: target.to_string(),
        },
        None,
    );
    f
}
