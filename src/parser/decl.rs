//! Declaration model

use super::fold::Const;
use super::scope::ScopeId;
use crate::error::SourceLoc;
use crate::types::{StructId, TypeId};

/// Handle to a declaration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeclId(pub u32);

/// Storage class keywords
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Storage {
    /// No keyword
    #[default]
    None,
    /// `static`
    Static,
    /// `extern`
    Extern,
    /// `auto`
    Auto,
    /// `register`
    Register,
    /// `typedef`
    Typedef,
}

/// Where a variable lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VarLocation {
    /// Global data at a label
    Global(String),
    /// Stack slot of the enclosing function
    Local,
    /// Incoming argument, word offset into the argument area
    Param(u32),
}

/// Declaration variants
#[derive(Debug, Clone, PartialEq)]
pub enum DeclKind {
    /// Object
    Variable {
        /// Declared type
        ty: TypeId,
        /// Storage class
        storage: Storage,
        /// Location
        location: VarLocation,
    },
    /// Function
    Function {
        /// Function type, without `this`
        ty: TypeId,
        /// Storage class
        storage: Storage,
        /// Assembly label
        label: String,
        /// A body has been seen
        defined: bool,
        /// Struct the function is a member of
        member_of: Option<StructId>,
        /// Parameter names, when known
        params: Vec<String>,
    },
    /// Enumerator
    EnumConst {
        /// Value
        value: i64,
    },
    /// `static const` scalar with a constant initializer
    NumericConst {
        /// Declared type
        ty: TypeId,
        /// Value
        value: Const,
    },
    /// `static const char NAME[] = "..."`
    StringConst {
        /// Array type
        ty: TypeId,
        /// Data label
        label: String,
    },
    /// Name bound to an assembly label with `__asm("label")`
    AsmLabel {
        /// Object type
        ty: TypeId,
        /// Label
        label: String,
    },
    /// `typedef`
    Typedef {
        /// Aliased type
        ty: TypeId,
    },
}

/// A declaration owned by exactly one scope
#[derive(Debug, Clone, PartialEq)]
pub struct Decl {
    /// Declared name
    pub name: String,
    /// Variant
    pub kind: DeclKind,
    /// Owning scope
    pub scope: ScopeId,
    /// Declaration site
    pub loc: SourceLoc,
}

impl Decl {
    /// Type of the declared entity, if it has one
    pub fn ty(&self) -> Option<TypeId> {
        match &self.kind {
            DeclKind::Variable { ty, .. }
            | DeclKind::Function { ty, .. }
            | DeclKind::NumericConst { ty, .. }
            | DeclKind::StringConst { ty, .. }
            | DeclKind::AsmLabel { ty, .. }
            | DeclKind::Typedef { ty } => Some(*ty),
            DeclKind::EnumConst { .. } => Some(TypeId::INT),
        }
    }

    /// Whether the name denotes a type
    pub fn is_typedef(&self) -> bool {
        matches!(self.kind, DeclKind::Typedef { .. })
    }
}
