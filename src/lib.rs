//! # wcc - a C-like language compiler for the W16 machine
//!
//! `wcc` translates one preprocessed source file written in a small C-like
//! language into assembly text for W16, a 16-bit word-addressed register
//! machine. The language has structs and unions, pointers and arrays, enums,
//! typedefs, ordered struct inheritance with virtual functions, and
//! `try`/`catch`/`finally`.
//!
//! ## Quick Start
//!
//! ```rust
//! use wcc::compiler::{CompileOptions, Compiler};
//!
//! # fn main() -> wcc::Result<()> {
//! let compiler = Compiler::new(CompileOptions::default());
//! let out = compiler.compile("int main(void) { return 6 * 7; }")?;
//! assert!(out.assembly.contains("main:"));
//! # Ok(())
//! # }
//! ```
//!
//! ## Pipeline
//!
//! - [`lexer`]: tokens with file, line and column; `#line` re-anchoring
//! - [`parser`]: scope-aware recursive descent with type checking and
//!   constant folding; struct layout, vtables and exception structure
//! - [`compiler::lower`]: typed statements and expressions to Prim IR
//! - [`compiler::optimizer`]: Prim peephole passes
//! - [`compiler::mach`]: instruction selection, frame layout, register-state
//!   optimizer, branch relaxation and encoding
//! - [`compiler::emit`]: assembly text and listing
//!
//! ## Error Handling
//!
//! Lexical, syntax and semantic errors are collected with their source
//! location and compilation carries on with the next declaration. If any
//! was recorded, [`compiler::Compiler::compile`] returns [`Error::Failed`]
//! with all of them and nothing is emitted:
//!
//! ```rust
//! use wcc::compiler::{CompileOptions, Compiler};
//! use wcc::Error;
//!
//! let compiler = Compiler::new(CompileOptions::default());
//! match compiler.compile("int f(void) { return missing; }") {
//!     Err(Error::Failed(errors)) => assert_eq!(errors.len(), 1),
//!     _ => panic!("expected a diagnostic"),
//! }
//! ```

#![allow(clippy::too_many_arguments)]
#![allow(clippy::collapsible_match)]

/// Version of the compiler
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod compiler;
pub mod error;
pub mod lexer;
pub mod parser;
pub mod types;

// Re-export main types
pub use compiler::{CompileOptions, CompileResult, Compiler};
pub use error::{Diagnostics, Error, Result, SourceLoc};
pub use lexer::{Scanner, Token, TokenKind, TokenStream};
pub use parser::Parser;
pub use types::{Type, TypeId, TypeTable};
