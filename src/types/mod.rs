//! # Type model
//!
//! Types are interned in a [`TypeTable`]: structurally identical types share
//! one [`TypeId`], so id equality is type equality. Struct and union identity
//! is nominal; the body of each lives in a [`StructDef`].
//!
//! Sizes are counted in 16-bit words. `char`, `short`, `int` and pointers
//! take one word, `long` and `float` two, `double` four.

mod compat;
mod layout;

pub use compat::{ConstHint, Conversion, Rank};
pub use layout::{thunk_label, MemberRef, VSlot, VslotRef, Vtable, PURE_VIRTUAL};

use crate::error::SourceLoc;
use crate::parser::ast::Expr;
use crate::parser::{DeclId, ScopeId};
use std::collections::HashMap;

/// Largest object the 64K-word address space can hold
pub const MAX_OBJECT_WORDS: u32 = 0xffff;

/// Handle to an interned type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(pub u32);

impl TypeId {
    /// `void`
    pub const VOID: TypeId = TypeId(0);
    /// `char` (signed, 8 bits)
    pub const CHAR: TypeId = TypeId(1);
    /// `unsigned char`
    pub const UCHAR: TypeId = TypeId(2);
    /// `int` and `short`
    pub const INT: TypeId = TypeId(3);
    /// `unsigned int`
    pub const UINT: TypeId = TypeId(4);
    /// `long`
    pub const LONG: TypeId = TypeId(5);
    /// `unsigned long`
    pub const ULONG: TypeId = TypeId(6);
    /// `float`
    pub const FLOAT: TypeId = TypeId(7);
    /// `double`
    pub const DOUBLE: TypeId = TypeId(8);
    /// `void*`
    pub const VOID_PTR: TypeId = TypeId(9);
    /// `char*`
    pub const CHAR_PTR: TypeId = TypeId(10);
}

/// Handle to a struct or union body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StructId(pub u32);

/// Structural type signature
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    /// `void`
    Void,
    /// Integer of 8, 16 or 32 bits
    Int {
        /// Width in bits
        bits: u8,
        /// Signedness
        signed: bool,
    },
    /// Floating point of 32 or 64 bits
    Float {
        /// Width in bits
        bits: u8,
    },
    /// Pointer to the base type
    Pointer(TypeId),
    /// Array with an optional element count
    Array(TypeId, Option<u32>),
    /// Function signature
    Function {
        /// Return type
        ret: TypeId,
        /// Parameter types, after array and function decay
        params: Vec<TypeId>,
        /// Accepts extra arguments
        varargs: bool,
    },
    /// Struct or union, by identity
    Struct(StructId),
    /// `const`/`volatile` wrapper; never nests
    Qualified {
        /// Unqualified base type
        base: TypeId,
        /// `const`
        is_const: bool,
        /// `volatile`
        is_volatile: bool,
    },
}

/// A struct field
#[derive(Debug, Clone)]
pub struct Field {
    /// Member name
    pub name: String,
    /// Member type
    pub ty: TypeId,
    /// Word offset inside the struct
    pub offset: u32,
    /// Default initializer run by the synthesized init
    pub init: Option<Expr>,
    /// Declaration site
    pub loc: SourceLoc,
}

/// A member function
#[derive(Debug, Clone, PartialEq)]
pub struct Method {
    /// Member name
    pub name: String,
    /// Function declaration
    pub decl: DeclId,
    /// Assembly label of the implementation (`Struct__name`)
    pub label: String,
    /// Function type, without the implicit `this`
    pub fn_ty: TypeId,
    /// Declared `virtual` or overriding a base virtual
    pub is_virtual: bool,
    /// Declared `= 0`
    pub is_pure: bool,
}

/// A direct base of a struct
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Base {
    /// Base struct
    pub sid: StructId,
    /// Word offset of the base subobject
    pub offset: u32,
}

/// Body of a struct or union
#[derive(Debug, Clone)]
pub struct StructDef {
    /// Tag name
    pub name: String,
    /// `union` rather than `struct`
    pub is_union: bool,
    /// Body has been parsed
    pub complete: bool,
    /// Where the tag was introduced
    pub loc: SourceLoc,
    /// Ordered direct bases
    pub bases: Vec<Base>,
    /// Fields in declaration order
    pub fields: Vec<Field>,
    /// Member functions, in declaration order
    pub methods: Vec<Method>,
    /// Size in words
    pub size: u32,
    /// Offset of the primary vtable pointer
    pub vptr: Option<u32>,
    /// Primary vtable followed by secondary vtables
    pub vtables: Vec<Vtable>,
    /// Synthesized init function is required
    pub needs_init: bool,
    /// Synthesized term function is required
    pub needs_term: bool,
    /// Member scope (method names)
    pub scope: Option<ScopeId>,
    /// Support code (init/term/vtables) must be emitted for this unit
    pub used: bool,
}

impl StructDef {
    fn new(name: &str, is_union: bool, loc: SourceLoc) -> Self {
        StructDef {
            name: name.to_string(),
            is_union,
            complete: false,
            loc,
            bases: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
            size: 0,
            vptr: None,
            vtables: Vec::new(),
            needs_init: false,
            needs_term: false,
            scope: None,
            used: false,
        }
    }

    /// Label of the synthesized init function
    pub fn init_label(&self) -> String {
        format!("{}__init", self.name)
    }

    /// Label of the synthesized term function
    pub fn term_label(&self) -> String {
        format!("{}__term", self.name)
    }

    /// The primary vtable, if the struct has one
    pub fn primary_vtable(&self) -> Option<&Vtable> {
        self.vtables.first()
    }
}

/// Canonicalizing type table
#[derive(Debug, Clone)]
pub struct TypeTable {
    types: Vec<Type>,
    index: HashMap<Type, TypeId>,
    structs: Vec<StructDef>,
}

impl Default for TypeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeTable {
    /// Creates a table with the builtin types pre-interned at their fixed ids
    pub fn new() -> Self {
        let mut table = TypeTable {
            types: Vec::new(),
            index: HashMap::new(),
            structs: Vec::new(),
        };
        let builtins = [
            Type::Void,
            Type::Int {
                bits: 8,
                signed: true,
            },
            Type::Int {
                bits: 8,
                signed: false,
            },
            Type::Int {
                bits: 16,
                signed: true,
            },
            Type::Int {
                bits: 16,
                signed: false,
            },
            Type::Int {
                bits: 32,
                signed: true,
            },
            Type::Int {
                bits: 32,
                signed: false,
            },
            Type::Float { bits: 32 },
            Type::Float { bits: 64 },
            Type::Pointer(TypeId::VOID),
            Type::Pointer(TypeId::CHAR),
        ];
        for ty in builtins {
            table.intern(ty);
        }
        table
    }

    /// Returns the canonical id for a type signature
    pub fn intern(&mut self, ty: Type) -> TypeId {
        if let Some(&id) = self.index.get(&ty) {
            return id;
        }
        let id = TypeId(self.types.len() as u32);
        self.types.push(ty.clone());
        self.index.insert(ty, id);
        id
    }

    /// Looks up a type signature
    pub fn get(&self, id: TypeId) -> &Type {
        &self.types[id.0 as usize]
    }

    /// Number of interned types
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// Whether the table is empty (never, once built)
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// `T*`
    pub fn pointer_to(&mut self, base: TypeId) -> TypeId {
        self.intern(Type::Pointer(base))
    }

    /// `T[n]`
    pub fn array_of(&mut self, elem: TypeId, len: Option<u32>) -> TypeId {
        self.intern(Type::Array(elem, len))
    }

    /// Function type
    pub fn function(&mut self, ret: TypeId, params: Vec<TypeId>, varargs: bool) -> TypeId {
        self.intern(Type::Function {
            ret,
            params,
            varargs,
        })
    }

    /// Adds qualifiers; qualifying a qualified type merges the flags
    pub fn qualified(&mut self, ty: TypeId, is_const: bool, is_volatile: bool) -> TypeId {
        if !is_const && !is_volatile {
            return ty;
        }
        let (base, c, v) = match self.get(ty) {
            Type::Qualified {
                base,
                is_const: c,
                is_volatile: v,
            } => (*base, *c, *v),
            _ => (ty, false, false),
        };
        self.intern(Type::Qualified {
            base,
            is_const: is_const || c,
            is_volatile: is_volatile || v,
        })
    }

    /// Strips qualifiers
    pub fn unqualified(&self, ty: TypeId) -> TypeId {
        match self.get(ty) {
            Type::Qualified { base, .. } => *base,
            _ => ty,
        }
    }

    /// Whether the outermost level is `const`
    pub fn is_const(&self, ty: TypeId) -> bool {
        matches!(self.get(ty), Type::Qualified { is_const: true, .. })
    }

    /// Signature of the unqualified type
    pub fn kind(&self, ty: TypeId) -> &Type {
        self.get(self.unqualified(ty))
    }

    /// Registers a new, incomplete struct or union
    pub fn new_struct(&mut self, name: &str, is_union: bool, loc: SourceLoc) -> (StructId, TypeId) {
        let sid = StructId(self.structs.len() as u32);
        self.structs.push(StructDef::new(name, is_union, loc));
        let ty = self.intern(Type::Struct(sid));
        (sid, ty)
    }

    /// Struct body
    pub fn struct_def(&self, sid: StructId) -> &StructDef {
        &self.structs[sid.0 as usize]
    }

    /// Mutable struct body
    pub fn struct_def_mut(&mut self, sid: StructId) -> &mut StructDef {
        &mut self.structs[sid.0 as usize]
    }

    /// All struct bodies in creation order
    pub fn structs(&self) -> impl Iterator<Item = (StructId, &StructDef)> {
        self.structs
            .iter()
            .enumerate()
            .map(|(i, s)| (StructId(i as u32), s))
    }

    /// Type id of a struct
    pub fn struct_type(&mut self, sid: StructId) -> TypeId {
        self.intern(Type::Struct(sid))
    }

    /// The struct behind a (possibly qualified) struct type
    pub fn as_struct(&self, ty: TypeId) -> Option<StructId> {
        match self.kind(ty) {
            Type::Struct(sid) => Some(*sid),
            _ => None,
        }
    }

    /// Size in words; `None` for void, functions and incomplete types
    pub fn size_of(&self, ty: TypeId) -> Option<u32> {
        match self.kind(ty) {
            Type::Void | Type::Function { .. } => None,
            Type::Int { bits, .. } => Some(if *bits == 32 { 2 } else { 1 }),
            Type::Float { bits } => Some(if *bits == 64 { 4 } else { 2 }),
            Type::Pointer(_) => Some(1),
            Type::Array(elem, len) => {
                let n = (*len)?;
                self.size_of(*elem)?.checked_mul(n)
            }
            Type::Struct(sid) => {
                let def = self.struct_def(*sid);
                def.complete.then_some(def.size)
            }
            Type::Qualified { .. } => None,
        }
    }

    /// Alignment in words; everything is word aligned
    pub fn align_of(&self, ty: TypeId) -> Option<u32> {
        self.size_of(ty).map(|_| 1)
    }

    /// Integer type (any width)
    pub fn is_integer(&self, ty: TypeId) -> bool {
        matches!(self.kind(ty), Type::Int { .. })
    }

    /// Floating type
    pub fn is_float(&self, ty: TypeId) -> bool {
        matches!(self.kind(ty), Type::Float { .. })
    }

    /// Integer or floating type
    pub fn is_arith(&self, ty: TypeId) -> bool {
        self.is_integer(ty) || self.is_float(ty)
    }

    /// Pointer type
    pub fn is_pointer(&self, ty: TypeId) -> bool {
        matches!(self.kind(ty), Type::Pointer(_))
    }

    /// Arithmetic or pointer type
    pub fn is_scalar(&self, ty: TypeId) -> bool {
        self.is_arith(ty) || self.is_pointer(ty)
    }

    /// Array type
    pub fn is_array(&self, ty: TypeId) -> bool {
        matches!(self.kind(ty), Type::Array(..))
    }

    /// Function type
    pub fn is_function(&self, ty: TypeId) -> bool {
        matches!(self.kind(ty), Type::Function { .. })
    }

    /// Void type
    pub fn is_void(&self, ty: TypeId) -> bool {
        matches!(self.kind(ty), Type::Void)
    }

    /// Unsigned integer or pointer
    pub fn is_unsigned(&self, ty: TypeId) -> bool {
        match self.kind(ty) {
            Type::Int { signed, .. } => !signed,
            Type::Pointer(_) => true,
            _ => false,
        }
    }

    /// Target of a pointer type
    pub fn pointee(&self, ty: TypeId) -> Option<TypeId> {
        match self.kind(ty) {
            Type::Pointer(base) => Some(*base),
            _ => None,
        }
    }

    /// Element of an array type
    pub fn element(&self, ty: TypeId) -> Option<TypeId> {
        match self.kind(ty) {
            Type::Array(elem, _) => Some(*elem),
            _ => None,
        }
    }

    /// Arrays decay to element pointers, functions to function pointers
    pub fn decay(&mut self, ty: TypeId) -> TypeId {
        match self.kind(ty).clone() {
            Type::Array(elem, _) => self.pointer_to(elem),
            Type::Function { .. } => {
                let f = self.unqualified(ty);
                self.pointer_to(f)
            }
            _ => ty,
        }
    }

    /// Whether a function of this return type returns through a hidden pointer
    pub fn returns_in_memory(&self, ret: TypeId) -> bool {
        matches!(self.kind(ret), Type::Struct(_) | Type::Float { bits: 64 })
    }

    /// Type name as written in diagnostics
    pub fn display(&self, ty: TypeId) -> String {
        match self.get(ty) {
            Type::Void => "void".into(),
            Type::Int { bits, signed } => {
                let base = match bits {
                    8 => "char",
                    16 => "int",
                    _ => "long",
                };
                if *signed {
                    base.into()
                } else {
                    format!("unsigned {}", base)
                }
            }
            Type::Float { bits } => if *bits == 32 { "float" } else { "double" }.into(),
            Type::Pointer(base) => match self.get(*base) {
                Type::Function { .. } => format!("{} (*)", self.display(*base)),
                _ => format!("{}*", self.display(*base)),
            },
            Type::Array(elem, len) => match len {
                Some(n) => format!("{}[{}]", self.display(*elem), n),
                None => format!("{}[]", self.display(*elem)),
            },
            Type::Function {
                ret,
                params,
                varargs,
            } => {
                let mut parts: Vec<String> = params.iter().map(|p| self.display(*p)).collect();
                if *varargs {
                    parts.push("...".into());
                }
                format!("{}({})", self.display(*ret), parts.join(", "))
            }
            Type::Struct(sid) => {
                let def = self.struct_def(*sid);
                let kw = if def.is_union { "union" } else { "struct" };
                format!("{} {}", kw, def.name)
            }
            Type::Qualified {
                base,
                is_const,
                is_volatile,
            } => {
                let mut s = self.display(*base);
                if *is_const {
                    s.push_str(" const");
                }
                if *is_volatile {
                    s.push_str(" volatile");
                }
                s
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_ids_are_fixed() {
        let mut t = TypeTable::new();
        assert_eq!(
            t.intern(Type::Int {
                bits: 16,
                signed: true
            }),
            TypeId::INT
        );
        assert_eq!(t.pointer_to(TypeId::VOID), TypeId::VOID_PTR);
        assert_eq!(t.pointer_to(TypeId::CHAR), TypeId::CHAR_PTR);
    }

    #[test]
    fn test_interning_is_structural() {
        let mut t = TypeTable::new();
        let p1 = t.pointer_to(TypeId::LONG);
        let p2 = t.pointer_to(TypeId::LONG);
        assert_eq!(p1, p2);
        let f1 = t.function(TypeId::INT, vec![p1], false);
        let f2 = t.function(TypeId::INT, vec![p2], false);
        assert_eq!(f1, f2);
        assert_ne!(f1, t.function(TypeId::INT, vec![p1], true));
    }

    #[test]
    fn test_struct_identity_is_nominal() {
        let mut t = TypeTable::new();
        let (_, a) = t.new_struct("S", false, SourceLoc::builtin());
        let (_, b) = t.new_struct("S", false, SourceLoc::builtin());
        assert_ne!(a, b);
    }

    #[test]
    fn test_sizes_in_words() {
        let mut t = TypeTable::new();
        assert_eq!(t.size_of(TypeId::CHAR), Some(1));
        assert_eq!(t.size_of(TypeId::INT), Some(1));
        assert_eq!(t.size_of(TypeId::LONG), Some(2));
        assert_eq!(t.size_of(TypeId::FLOAT), Some(2));
        assert_eq!(t.size_of(TypeId::DOUBLE), Some(4));
        let arr = t.array_of(TypeId::LONG, Some(3));
        assert_eq!(t.size_of(arr), Some(6));
        let open = t.array_of(TypeId::INT, None);
        assert_eq!(t.size_of(open), None);
        let c = t.qualified(TypeId::DOUBLE, true, false);
        assert_eq!(t.size_of(c), Some(4));
    }

    #[test]
    fn test_qualifiers_merge() {
        let mut t = TypeTable::new();
        let c = t.qualified(TypeId::INT, true, false);
        let cv = t.qualified(c, false, true);
        assert_eq!(t.unqualified(cv), TypeId::INT);
        assert!(t.is_const(cv));
        assert_eq!(t.display(cv), "int const volatile");
    }

    #[test]
    fn test_decay() {
        let mut t = TypeTable::new();
        let arr = t.array_of(TypeId::CHAR, Some(4));
        assert_eq!(t.decay(arr), TypeId::CHAR_PTR);
        let f = t.function(TypeId::VOID, vec![], false);
        let fp = t.decay(f);
        assert_eq!(t.pointee(fp), Some(f));
    }
}
