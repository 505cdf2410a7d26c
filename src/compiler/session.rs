//! State shared by every phase of one compilation

use super::prim::LabelId;
use crate::error::{Diagnostics, Error};
use crate::parser::Symbols;
use crate::types::TypeTable;
use std::sync::Arc;

/// Compilation session for one translation unit
///
/// Owns the type table, the scope arena with every declaration, the
/// diagnostics and the unit-wide label counter. It is threaded through
/// parsing, lowering and code generation.
#[derive(Debug)]
pub struct Session {
    /// Source file name
    pub file: Arc<str>,
    /// Canonical types and struct bodies
    pub types: TypeTable,
    /// Scopes and declarations
    pub symbols: Symbols,
    /// Recorded errors
    pub diags: Diagnostics,
    next_label: u32,
}

impl Session {
    /// Creates an empty session
    pub fn new(file: &str) -> Self {
        Session {
            file: Arc::from(file),
            types: TypeTable::new(),
            symbols: Symbols::new(),
            diags: Diagnostics::new(),
            next_label: 1,
        }
    }

    /// Allocates a unit-wide local label
    pub fn new_label(&mut self) -> LabelId {
        let id = LabelId(self.next_label);
        self.next_label += 1;
        id
    }

    /// Records a diagnostic
    pub fn report(&mut self, error: Error) {
        self.diags.report(error);
    }

    /// Whether any diagnostic was recorded
    pub fn has_errors(&self) -> bool {
        self.diags.has_errors()
    }
}
