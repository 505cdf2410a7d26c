//! Struct layout, vtable construction and member lookup

use super::{Base, Field, Method, StructId, TypeId, TypeTable, MAX_OBJECT_WORDS};
use crate::parser::DeclId;
use std::collections::HashSet;

/// Runtime trap installed in pure virtual slots
pub const PURE_VIRTUAL: &str = "__pure_virtual";

/// One vtable entry
#[derive(Debug, Clone, PartialEq)]
pub struct VSlot {
    /// Virtual function name
    pub name: String,
    /// Implementation; `None` for a pure slot
    pub decl: Option<DeclId>,
    /// Label of the implementation or the pure-virtual trap
    pub label: String,
    /// Offset, inside the struct owning the table, of the subobject the
    /// implementation expects as `this`
    pub impl_offset: u32,
    /// Function type without `this`
    pub fn_ty: TypeId,
}

impl VSlot {
    /// Whether the slot has no implementation
    pub fn is_pure(&self) -> bool {
        self.decl.is_none()
    }
}

/// A vtable of a struct
#[derive(Debug, Clone, PartialEq)]
pub struct Vtable {
    /// Data label
    pub label: String,
    /// Offset of the vtable pointer that points at this table
    pub vptr_offset: u32,
    /// Entries in slot order
    pub slots: Vec<VSlot>,
}

impl Vtable {
    /// `this` correction an entry applies: receivers arrive pointing at the
    /// vptr, implementations expect their own subobject
    pub fn adjust(&self, slot: usize) -> i32 {
        self.slots[slot].impl_offset as i32 - self.vptr_offset as i32
    }

    /// Label stored in the table for `slot`: the implementation itself or
    /// a thunk when `this` needs correcting
    pub fn entry_label(&self, slot: usize) -> String {
        let s = &self.slots[slot];
        let adj = self.adjust(slot);
        if s.is_pure() || adj == 0 {
            s.label.clone()
        } else {
            thunk_label(adj, &s.label)
        }
    }
}

/// Label of the adjustor thunk for an implementation
pub fn thunk_label(adjust: i32, target: &str) -> String {
    if adjust < 0 {
        format!("__thunk_m{}_{}", -adjust, target)
    } else {
        format!("__thunk_{}_{}", adjust, target)
    }
}

/// Result of a member lookup through the base chain
#[derive(Debug, Clone, PartialEq)]
pub enum MemberRef {
    /// Data member at an offset from the searched struct
    Field {
        /// Field type
        ty: TypeId,
        /// Offset from the start of the searched struct
        offset: u32,
    },
    /// Member function
    Method {
        /// Declaring struct
        owner: StructId,
        /// Offset of the declaring struct's subobject
        owner_offset: u32,
        /// The function
        method: Method,
    },
}

/// Where a virtual function lives in a struct's vtables
#[derive(Debug, Clone, PartialEq)]
pub struct VslotRef {
    /// Index into `StructDef::vtables`
    pub table: usize,
    /// Offset of the vptr for that table
    pub vptr_offset: u32,
    /// Slot index
    pub slot: usize,
    /// The slot itself
    pub entry: VSlot,
}

impl TypeTable {
    /// Offset of the `base` subobject inside `derived`, searching bases in
    /// order and depth first
    pub fn base_offset(&self, derived: StructId, base: StructId) -> Option<u32> {
        if derived == base {
            return Some(0);
        }
        self.struct_def(derived)
            .bases
            .iter()
            .find_map(|b| self.base_offset(b.sid, base).map(|off| off + b.offset))
    }

    /// Finds a field or method by name, own members first, then bases in order
    pub fn find_member(&self, sid: StructId, name: &str) -> Option<MemberRef> {
        let def = self.struct_def(sid);
        if let Some(f) = def.fields.iter().find(|f| f.name == name) {
            return Some(MemberRef::Field {
                ty: f.ty,
                offset: f.offset,
            });
        }
        if let Some(m) = def.methods.iter().find(|m| m.name == name) {
            return Some(MemberRef::Method {
                owner: sid,
                owner_offset: 0,
                method: m.clone(),
            });
        }
        def.bases.iter().find_map(|b| {
            self.find_member(b.sid, name).map(|m| match m {
                MemberRef::Field { ty, offset } => MemberRef::Field {
                    ty,
                    offset: offset + b.offset,
                },
                MemberRef::Method {
                    owner,
                    owner_offset,
                    method,
                } => MemberRef::Method {
                    owner,
                    owner_offset: owner_offset + b.offset,
                    method,
                },
            })
        })
    }

    /// Finds a virtual function slot, primary table first
    pub fn find_vslot(&self, sid: StructId, name: &str) -> Option<VslotRef> {
        let def = self.struct_def(sid);
        def.vtables.iter().enumerate().find_map(|(t, table)| {
            table
                .slots
                .iter()
                .position(|s| s.name == name)
                .map(|slot| VslotRef {
                    table: t,
                    vptr_offset: table.vptr_offset,
                    slot,
                    entry: table.slots[slot].clone(),
                })
        })
    }

    /// Lays out a struct whose bases, fields and methods have been parsed.
    ///
    /// Bases come first in order, then the struct's own vptr when it needs
    /// one and no base provides it, then the fields. Union members all sit
    /// at offset zero.
    pub fn layout_struct(
        &mut self,
        sid: StructId,
        bases: Vec<StructId>,
        mut fields: Vec<Field>,
        mut methods: Vec<Method>,
    ) -> std::result::Result<(), String> {
        let is_union = self.struct_def(sid).is_union;
        let name = self.struct_def(sid).name.clone();
        if is_union && !bases.is_empty() {
            return Err(format!("union '{}' cannot have base types", name));
        }

        let mut seen = HashSet::new();
        for n in fields
            .iter()
            .map(|f| &f.name)
            .chain(methods.iter().map(|m| &m.name))
        {
            if !seen.insert(n.clone()) {
                return Err(format!("duplicate member '{}'", n));
            }
        }

        let mut offset = 0u32;
        let mut placed = Vec::with_capacity(bases.len());
        for b in &bases {
            let def = self.struct_def(*b);
            if !def.complete {
                return Err(format!("base '{}' is an incomplete type", def.name));
            }
            if *b == sid || self.base_offset(*b, sid).is_some() {
                return Err(format!("'{}' cannot derive from itself", name));
            }
            placed.push(Base { sid: *b, offset });
            offset += def.size;
        }

        // Overrides: a method named like any inherited virtual.
        let inherited: HashSet<String> = placed
            .iter()
            .flat_map(|b| self.struct_def(b.sid).vtables.iter())
            .flat_map(|t| t.slots.iter().map(|s| s.name.clone()))
            .collect();
        for m in methods.iter_mut() {
            if inherited.contains(&m.name) {
                m.is_virtual = true;
            }
        }
        let own_virtuals = methods.iter().any(|m| m.is_virtual);

        let primary_base = placed
            .iter()
            .position(|b| self.struct_def(b.sid).vptr.is_some());
        let vptr = match primary_base {
            Some(i) => {
                let b = placed[i];
                self.struct_def(b.sid).vptr.map(|v| v + b.offset)
            }
            None if own_virtuals => {
                let v = offset;
                offset += 1;
                Some(v)
            }
            None => None,
        };

        let mut size = offset;
        for f in fields.iter_mut() {
            let fsize = self
                .size_of(f.ty)
                .ok_or_else(|| format!("field '{}' has incomplete type", f.name))?;
            if is_union {
                f.offset = 0;
                size = size.max(fsize);
            } else {
                f.offset = size;
                size += fsize;
            }
            if size > MAX_OBJECT_WORDS {
                return Err(format!("'{}' is too large ({} words)", name, size));
            }
        }

        let vtables = match vptr {
            Some(vptr) => self.build_vtables(&name, vptr, &placed, primary_base, &methods),
            None => Vec::new(),
        };

        let needs_init = vptr.is_some()
            || fields.iter().any(|f| f.init.is_some())
            || methods.iter().any(|m| m.name == "__ctor")
            || placed.iter().any(|b| self.struct_def(b.sid).needs_init)
            || fields.iter().any(|f| self.member_needs(f.ty, true));
        let needs_term = methods.iter().any(|m| m.name == "__dtor")
            || placed.iter().any(|b| self.struct_def(b.sid).needs_term)
            || fields.iter().any(|f| self.member_needs(f.ty, false));

        tracing::debug!(
            name = %name,
            size,
            vptr = ?vptr,
            tables = vtables.len(),
            "laid out struct"
        );

        let def = self.struct_def_mut(sid);
        def.bases = placed;
        def.fields = fields;
        def.methods = methods;
        def.size = size;
        def.vptr = vptr;
        def.vtables = vtables;
        def.needs_init = needs_init;
        def.needs_term = needs_term;
        def.complete = true;
        Ok(())
    }

    fn member_needs(&self, ty: TypeId, init: bool) -> bool {
        match self.as_struct(ty) {
            Some(s) => {
                let d = self.struct_def(s);
                if init {
                    d.needs_init
                } else {
                    d.needs_term
                }
            }
            None => false,
        }
    }

    fn build_vtables(
        &self,
        name: &str,
        vptr: u32,
        bases: &[Base],
        primary_base: Option<usize>,
        methods: &[Method],
    ) -> Vec<Vtable> {
        let rebase = |slots: &[VSlot], by: u32| -> Vec<VSlot> {
            slots
                .iter()
                .map(|s| VSlot {
                    impl_offset: s.impl_offset + by,
                    ..s.clone()
                })
                .collect()
        };

        let mut primary = Vtable {
            label: format!("__vtbl_{}", name),
            vptr_offset: vptr,
            slots: Vec::new(),
        };
        let mut secondary = Vec::new();

        if let Some(i) = primary_base {
            let b = bases[i];
            if let Some(t) = self.struct_def(b.sid).vtables.first() {
                primary.slots = rebase(&t.slots, b.offset);
            }
        }
        for (i, b) in bases.iter().enumerate() {
            let bdef = self.struct_def(b.sid);
            for (t, table) in bdef.vtables.iter().enumerate() {
                if Some(i) == primary_base && t == 0 {
                    continue;
                }
                if t == 0 {
                    for s in &table.slots {
                        if !primary.slots.iter().any(|p| p.name == s.name) {
                            primary.slots.push(VSlot {
                                impl_offset: s.impl_offset + b.offset,
                                ..s.clone()
                            });
                        }
                    }
                }
                let vptr_offset = table.vptr_offset + b.offset;
                secondary.push(Vtable {
                    label: format!("__vtbl_{}_{}", name, vptr_offset),
                    vptr_offset,
                    slots: rebase(&table.slots, b.offset),
                });
            }
        }

        for m in methods.iter().filter(|m| m.is_virtual) {
            if !primary.slots.iter().any(|s| s.name == m.name) {
                primary.slots.push(VSlot {
                    name: m.name.clone(),
                    decl: None,
                    label: PURE_VIRTUAL.to_string(),
                    impl_offset: 0,
                    fn_ty: m.fn_ty,
                });
            }
        }

        let mut tables = vec![primary];
        tables.extend(secondary);
        for table in tables.iter_mut() {
            for slot in table.slots.iter_mut() {
                if let Some(m) = methods.iter().find(|m| m.name == slot.name) {
                    if m.is_pure {
                        slot.decl = None;
                        slot.label = PURE_VIRTUAL.to_string();
                    } else {
                        slot.decl = Some(m.decl);
                        slot.label = m.label.clone();
                    }
                    slot.impl_offset = 0;
                    slot.fn_ty = m.fn_ty;
                }
            }
        }
        tables
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SourceLoc;

    fn field(name: &str, ty: TypeId) -> Field {
        Field {
            name: name.into(),
            ty,
            offset: 0,
            init: None,
            loc: SourceLoc::builtin(),
        }
    }

    fn method(owner: &str, name: &str, decl: u32, is_virtual: bool, fn_ty: TypeId) -> Method {
        Method {
            name: name.into(),
            decl: DeclId(decl),
            label: format!("{}__{}", owner, name),
            fn_ty,
            is_virtual,
            is_pure: false,
        }
    }

    fn define(
        t: &mut TypeTable,
        name: &str,
        bases: Vec<StructId>,
        fields: Vec<Field>,
        methods: Vec<Method>,
    ) -> StructId {
        let (sid, _) = t.new_struct(name, false, SourceLoc::builtin());
        t.layout_struct(sid, bases, fields, methods).unwrap();
        sid
    }

    fn thunks(t: &TypeTable, sid: StructId) -> Vec<String> {
        t.struct_def(sid)
            .vtables
            .iter()
            .flat_map(|v| (0..v.slots.len()).map(move |i| v.entry_label(i)))
            .filter(|l| l.starts_with("__thunk_"))
            .collect()
    }

    #[test]
    fn test_fields_follow_bases() {
        let mut t = TypeTable::new();
        let a = define(&mut t, "A", vec![], vec![field("x", TypeId::LONG)], vec![]);
        let b = define(
            &mut t,
            "B",
            vec![a],
            vec![field("y", TypeId::INT), field("z", TypeId::DOUBLE)],
            vec![],
        );
        let d = t.struct_def(b);
        assert_eq!(d.size, 7);
        assert_eq!(d.fields[0].offset, 2);
        assert_eq!(d.fields[1].offset, 3);
        assert_eq!(
            t.find_member(b, "x"),
            Some(MemberRef::Field {
                ty: TypeId::LONG,
                offset: 0
            })
        );
        assert!(!d.needs_init);
    }

    #[test]
    fn test_union_members_overlap() {
        let mut t = TypeTable::new();
        let (u, _) = t.new_struct("U", true, SourceLoc::builtin());
        t.layout_struct(
            u,
            vec![],
            vec![field("i", TypeId::INT), field("d", TypeId::DOUBLE)],
            vec![],
        )
        .unwrap();
        let d = t.struct_def(u);
        assert_eq!(d.size, 4);
        assert!(d.fields.iter().all(|f| f.offset == 0));
    }

    #[test]
    fn test_vptr_allocated_after_bases() {
        let mut t = TypeTable::new();
        let f = t.function(TypeId::INT, vec![], false);
        let p = define(&mut t, "P", vec![], vec![field("pad", TypeId::INT)], vec![]);
        let a = define(
            &mut t,
            "A",
            vec![p],
            vec![field("v", TypeId::INT)],
            vec![method("A", "f", 1, true, f)],
        );
        let d = t.struct_def(a);
        assert_eq!(d.vptr, Some(1));
        assert_eq!(d.fields[0].offset, 2);
        assert!(d.needs_init);
    }

    #[test]
    fn test_override_through_offset_base_needs_one_thunk() {
        let mut t = TypeTable::new();
        let f = t.function(TypeId::INT, vec![], false);
        let a = define(&mut t, "A", vec![], vec![], vec![method("A", "f", 1, true, f)]);
        let p = define(&mut t, "P", vec![], vec![field("pad", TypeId::INT)], vec![]);
        let b = define(&mut t, "B", vec![p, a], vec![], vec![]);
        let c = define(&mut t, "C", vec![b], vec![], vec![method("C", "f", 2, false, f)]);

        assert_eq!(t.struct_def(b).vptr, Some(1));
        assert!(thunks(&t, a).is_empty());
        assert!(thunks(&t, b).is_empty());
        assert_eq!(thunks(&t, c), vec!["__thunk_m1_C__f".to_string()]);
        let slot = t.find_vslot(c, "f").unwrap();
        assert_eq!(slot.entry.label, "C__f");
        assert_eq!(t.find_vslot(b, "f").unwrap().entry.label, "A__f");
    }

    #[test]
    fn test_override_at_zero_offset_needs_no_thunk() {
        let mut t = TypeTable::new();
        let f = t.function(TypeId::INT, vec![], false);
        let a = define(&mut t, "A", vec![], vec![], vec![method("A", "f", 1, true, f)]);
        let b = define(&mut t, "B", vec![a], vec![], vec![]);
        let c = define(&mut t, "C", vec![b], vec![], vec![method("C", "f", 2, false, f)]);
        assert!(thunks(&t, c).is_empty());
        assert_eq!(t.find_vslot(c, "f").unwrap().entry.label, "C__f");
    }

    #[test]
    fn test_second_base_gets_secondary_vtable() {
        let mut t = TypeTable::new();
        let f = t.function(TypeId::INT, vec![], false);
        let a = define(&mut t, "A", vec![], vec![], vec![method("A", "f", 1, true, f)]);
        let b = define(&mut t, "B", vec![], vec![], vec![method("B", "g", 2, true, f)]);
        let d = define(&mut t, "D", vec![a, b], vec![], vec![method("D", "g", 3, false, f)]);
        let def = t.struct_def(d);
        assert_eq!(def.vtables.len(), 2);
        let names: Vec<&str> = def.vtables[0].slots.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["f", "g"]);
        assert_eq!(def.vtables[1].vptr_offset, 1);
        assert_eq!(def.vtables[1].label, "__vtbl_D_1");
        // D::g expects `this` at offset 0; the secondary table is reached at 1.
        assert_eq!(def.vtables[1].entry_label(0), "__thunk_m1_D__g");
        assert_eq!(def.vtables[0].entry_label(1), "D__g");
    }

    #[test]
    fn test_pure_slot_uses_trap() {
        let mut t = TypeTable::new();
        let f = t.function(TypeId::VOID, vec![], false);
        let mut m = method("A", "f", 1, true, f);
        m.is_pure = true;
        let a = define(&mut t, "A", vec![], vec![], vec![m]);
        let slot = t.find_vslot(a, "f").unwrap();
        assert!(slot.entry.is_pure());
        assert_eq!(slot.entry.label, PURE_VIRTUAL);
    }

    #[test]
    fn test_method_found_through_second_base() {
        let mut t = TypeTable::new();
        let f = t.function(TypeId::INT, vec![], false);
        let a = define(&mut t, "A", vec![], vec![field("a", TypeId::LONG)], vec![]);
        let g = method("B", "g", 2, false, f);
        let b = define(&mut t, "B", vec![], vec![field("b", TypeId::INT)], vec![g.clone()]);
        let c = define(&mut t, "C", vec![a, b], vec![], vec![]);
        assert_eq!(
            t.find_member(c, "g"),
            Some(MemberRef::Method {
                owner: b,
                owner_offset: 2,
                method: g,
            })
        );
    }

    #[test]
    fn test_base_offset_search() {
        let mut t = TypeTable::new();
        let a = define(&mut t, "A", vec![], vec![field("a", TypeId::LONG)], vec![]);
        let b = define(&mut t, "B", vec![], vec![field("b", TypeId::INT)], vec![]);
        let c = define(&mut t, "C", vec![a, b], vec![], vec![]);
        assert_eq!(t.base_offset(c, b), Some(2));
        assert_eq!(t.base_offset(c, a), Some(0));
        assert_eq!(t.base_offset(a, c), None);
    }

    #[test]
    fn test_duplicate_member_rejected() {
        let mut t = TypeTable::new();
        let (s, _) = t.new_struct("S", false, SourceLoc::builtin());
        let err = t
            .layout_struct(
                s,
                vec![],
                vec![field("x", TypeId::INT), field("x", TypeId::INT)],
                vec![],
            )
            .unwrap_err();
        assert!(err.contains("duplicate member"));
    }
}
