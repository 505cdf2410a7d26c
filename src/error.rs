//! Error types for the wcc compiler

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// A position in a source file, as reported in diagnostics.
///
/// `line` and `col` are logical: a `#line` directive re-anchors them to the
/// upstream file the preprocessor read. `phys_line` always counts lines of the
/// text actually handed to the scanner and is what the assembly commentary
/// echoes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct SourceLoc {
    /// File name (logical)
    pub file: Arc<str>,
    /// Line number (1-indexed, logical)
    pub line: u32,
    /// Column number (1-indexed)
    pub col: u32,
    /// Line number in the scanned text (1-indexed)
    pub phys_line: u32,
}

impl SourceLoc {
    /// Creates a location whose logical and physical lines agree
    pub fn new(file: impl Into<Arc<str>>, line: u32, col: u32) -> Self {
        Self {
            file: file.into(),
            line,
            col,
            phys_line: line,
        }
    }

    /// Location used for compiler-synthesized code
    pub fn builtin() -> Self {
        Self::new("<builtin>", 0, 0)
    }
}

impl fmt::Display for SourceLoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}.{}", self.file, self.line, self.col)
    }
}

/// wcc compiler errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Lexical error
    ///
    /// **Triggered by:** unterminated string/char literal or comment, or a character
    /// that starts no token
    /// **Example:** `int x = 1 @ 2;`
    #[error("{loc}: {message}")]
    Lexical {
        /// Where the offending character sits
        loc: SourceLoc,
        /// Error description
        message: String,
    },

    /// Syntax error encountered during parsing
    ///
    /// **Triggered by:** a token that cannot continue the current construct
    /// **Example:** `int f( { }`
    #[error("{loc}: {message}")]
    Syntax {
        /// Location of the unexpected token
        loc: SourceLoc,
        /// Error description
        message: String,
    },

    /// Semantic error
    ///
    /// **Triggered by:** undefined symbols, incompatible types, bad casts,
    /// redefinitions, misplaced `break`, jumps into a try block and so on
    /// **Example:** `int *p; char *q = p;`
    #[error("{loc}: {message}")]
    Semantic {
        /// Location of the offending construct
        loc: SourceLoc,
        /// Error description
        message: String,
        /// Secondary location (e.g. the prior definition)
        note: Option<(SourceLoc, String)>,
    },

    /// Offset or displacement that cannot be encoded, found during code generation
    #[error("{loc}: {message}")]
    Codegen {
        /// Source line that produced the instruction
        loc: SourceLoc,
        /// Error description
        message: String,
    },

    /// Internal invariant violation (malformed instruction list, failed relaxation check)
    #[error("internal compiler error: {0}")]
    Internal(String),

    /// Compilation finished with recorded diagnostics
    #[error("compilation failed with {} error(s)", .0.len())]
    Failed(Vec<Error>),

    /// I/O failure while writing output
    #[error("I/O error: {0}")]
    Io(String),
}

impl Error {
    /// Create a syntax error at a location
    pub fn syntax(loc: &SourceLoc, msg: impl Into<String>) -> Self {
        Error::Syntax {
            loc: loc.clone(),
            message: msg.into(),
        }
    }

    /// Create a semantic error at a location
    pub fn semantic(loc: &SourceLoc, msg: impl Into<String>) -> Self {
        Error::Semantic {
            loc: loc.clone(),
            message: msg.into(),
            note: None,
        }
    }

    /// Create a semantic error that also points at a previous definition
    pub fn redefinition(loc: &SourceLoc, name: &str, prior: &SourceLoc) -> Self {
        Error::Semantic {
            loc: loc.clone(),
            message: format!("redefinition of '{}'", name),
            note: Some((prior.clone(), format!("previous definition of '{}'", name))),
        }
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    /// Whether this error stops compilation outright instead of being collected
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Internal(_) | Error::Io(_))
    }

    /// Location the diagnostic points at, if any
    pub fn loc(&self) -> Option<&SourceLoc> {
        match self {
            Error::Lexical { loc, .. }
            | Error::Syntax { loc, .. }
            | Error::Semantic { loc, .. }
            | Error::Codegen { loc, .. } => Some(loc),
            _ => None,
        }
    }

    /// Render the diagnostic the way it is printed on stderr, one line per
    /// location (`file:line.column: message`)
    pub fn render(&self) -> String {
        match self {
            Error::Semantic {
                note: Some((prior, text)),
                ..
            } => format!("{}\n{}: {}", self, prior, text),
            Error::Failed(errors) => errors
                .iter()
                .map(Error::render)
                .collect::<Vec<_>>()
                .join("\n"),
            _ => self.to_string(),
        }
    }
}

/// Accumulated diagnostics for one compilation
///
/// Parsing records an error here and carries on with the next top-level
/// declaration; code is only emitted while this stays empty.
#[derive(Debug, Default, Clone)]
pub struct Diagnostics {
    errors: Vec<Error>,
}

impl Diagnostics {
    /// Create an empty collection
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a diagnostic
    pub fn report(&mut self, error: Error) {
        tracing::debug!(error = %error, "diagnostic recorded");
        self.errors.push(error);
    }

    /// Whether any diagnostic was recorded
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Number of recorded diagnostics
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// Whether nothing was recorded
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Recorded diagnostics in report order
    pub fn errors(&self) -> &[Error] {
        &self.errors
    }

    /// Consume the collection
    pub fn into_errors(self) -> Vec<Error> {
        self.errors
    }
}

/// Result type for wcc operations
pub type Result<T> = std::result::Result<T, Error>;
