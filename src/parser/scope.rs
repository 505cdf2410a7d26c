//! Scope chain
//!
//! Scopes form an arena tree rooted at the global scope. Each scope has an
//! ordinary namespace and a tag namespace for struct/union/enum tags.

use super::decl::{Decl, DeclId};
use crate::error::SourceLoc;
use crate::types::{StructId, TypeId};
use std::collections::HashMap;

/// Handle to a scope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeId(pub u32);

impl ScopeId {
    /// The translation unit scope
    pub const GLOBAL: ScopeId = ScopeId(0);
}

/// Handle to a try statement within its function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TryId(pub u32);

/// Kinds of scope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    /// Translation unit
    Global,
    /// Compound statement
    Block,
    /// Struct body; unqualified names resolve through `this`
    Member(StructId),
    /// Function parameters
    Parameter,
    /// Body of a try statement
    Try(TryId),
    /// Body of a catch clause
    Catch(TryId),
}

/// A tag entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    /// `struct`/`union` tag
    Struct(StructId),
    /// `enum` tag (enums have type `int`)
    Enum(TypeId),
}

/// One scope
#[derive(Debug, Clone)]
pub struct Scope {
    /// Kind
    pub kind: ScopeKind,
    /// Enclosing scope
    pub parent: Option<ScopeId>,
    names: HashMap<String, DeclId>,
    tags: HashMap<String, (Tag, SourceLoc)>,
}

/// Arena of scopes and declarations
#[derive(Debug, Clone)]
pub struct Symbols {
    scopes: Vec<Scope>,
    decls: Vec<Decl>,
}

impl Default for Symbols {
    fn default() -> Self {
        Self::new()
    }
}

impl Symbols {
    /// Creates the table with the global scope
    pub fn new() -> Self {
        Symbols {
            scopes: vec![Scope {
                kind: ScopeKind::Global,
                parent: None,
                names: HashMap::new(),
                tags: HashMap::new(),
            }],
            decls: Vec::new(),
        }
    }

    /// Opens a child scope
    pub fn push_scope(&mut self, kind: ScopeKind, parent: ScopeId) -> ScopeId {
        let id = ScopeId(self.scopes.len() as u32);
        self.scopes.push(Scope {
            kind,
            parent: Some(parent),
            names: HashMap::new(),
            tags: HashMap::new(),
        });
        id
    }

    /// Scope by id
    pub fn scope(&self, id: ScopeId) -> &Scope {
        &self.scopes[id.0 as usize]
    }

    /// Declaration by id
    pub fn decl(&self, id: DeclId) -> &Decl {
        &self.decls[id.0 as usize]
    }

    /// Mutable declaration by id
    pub fn decl_mut(&mut self, id: DeclId) -> &mut Decl {
        &mut self.decls[id.0 as usize]
    }

    /// Adds a declaration to its scope, replacing any same-named entry in
    /// that scope (callers check redefinition first)
    pub fn declare(&mut self, decl: Decl) -> DeclId {
        let id = DeclId(self.decls.len() as u32);
        let scope = decl.scope;
        let name = decl.name.clone();
        self.decls.push(decl);
        if !name.is_empty() {
            self.scopes[scope.0 as usize].names.insert(name, id);
        }
        id
    }

    /// Adds a declaration that no name lookup will find
    pub fn declare_hidden(&mut self, decl: Decl) -> DeclId {
        let id = DeclId(self.decls.len() as u32);
        self.decls.push(decl);
        id
    }

    /// Name defined directly in `scope`
    pub fn lookup_local(&self, scope: ScopeId, name: &str) -> Option<DeclId> {
        self.scope(scope).names.get(name).copied()
    }

    /// Walks outward from `scope`; returns the scope where the name was found
    pub fn lookup(&self, scope: ScopeId, name: &str) -> Option<(ScopeId, DeclId)> {
        self.chain(scope)
            .find_map(|s| self.lookup_local(s, name).map(|d| (s, d)))
    }

    /// Defines a tag in `scope`
    pub fn declare_tag(&mut self, scope: ScopeId, name: &str, tag: Tag, loc: SourceLoc) {
        self.scopes[scope.0 as usize]
            .tags
            .insert(name.to_string(), (tag, loc));
    }

    /// Tag defined directly in `scope`
    pub fn lookup_tag_local(&self, scope: ScopeId, name: &str) -> Option<(Tag, SourceLoc)> {
        self.scope(scope).tags.get(name).cloned()
    }

    /// Walks outward looking for a tag
    pub fn lookup_tag(&self, scope: ScopeId, name: &str) -> Option<Tag> {
        self.chain(scope)
            .find_map(|s| self.lookup_tag_local(s, name).map(|(t, _)| t))
    }

    /// `scope` followed by its ancestors
    pub fn chain(&self, scope: ScopeId) -> impl Iterator<Item = ScopeId> + '_ {
        std::iter::successors(Some(scope), move |s| self.scope(*s).parent)
    }

    /// Whether `ancestor` is `scope` or encloses it
    pub fn encloses(&self, ancestor: ScopeId, scope: ScopeId) -> bool {
        self.chain(scope).any(|s| s == ancestor)
    }

    /// Try/catch scopes between `from` (inclusive) and the nearest scope
    /// enclosing `to`, innermost first
    pub fn crossed_tries(&self, from: ScopeId, to: ScopeId) -> Vec<ScopeKind> {
        let mut crossed = Vec::new();
        for s in self.chain(from) {
            if self.encloses(s, to) {
                break;
            }
            let kind = self.scope(s).kind;
            if matches!(kind, ScopeKind::Try(_) | ScopeKind::Catch(_)) {
                crossed.push(kind);
            }
        }
        crossed
    }

    /// Number of declarations
    pub fn decl_count(&self) -> usize {
        self.decls.len()
    }
}
