//! # wcc compiler pipeline
//!
//! Compiles one translation unit to W16 assembly text.
//!
//! ## Architecture
//!
//! ```text
//! source → tokens → parse (typed AST) → lower (Prim) → optimize
//!        → select (Mach) → frame layout → register-state optimize
//!        → relax → emit (.s, listing)
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use wcc::compiler::{Compiler, CompileOptions};
//!
//! let compiler = Compiler::new(CompileOptions::default());
//! let out = compiler.compile("int main(void) { return 0; }")?;
//! std::fs::write("main.s", out.assembly)?;
//! ```

pub mod data;
pub mod debug;
pub mod emit;
pub mod list;
pub mod lower;
pub mod mach;
pub mod optimizer;
pub mod prim;
pub mod session;
pub mod support;

pub use debug::{dump_ir, dump_tokens};
pub use emit::Emitter;
pub use optimizer::Optimizer;
pub use session::Session;

use crate::error::{Error, Result};
use crate::lexer::Scanner;
use crate::parser::Parser;
use mach::MachFunc;
use prim::PrimFunc;
use tracing::debug;

/// Largest frame whose displacements fit a 16-bit immediate
const MAX_FRAME: u32 = 0x7fff;

/// Compilation options
#[derive(Debug, Clone)]
pub struct CompileOptions {
    /// Optimization level; 0 disables both the Prim and the machine optimizer
    pub opt_level: u8,
    /// Produce a listing next to the assembly
    pub listing: bool,
    /// Keep the optimized Prim listing of every function
    pub dump_ir: bool,
    /// Source file name used in diagnostics and source echo
    pub file: String,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            opt_level: 1,
            listing: false,
            dump_ir: false,
            file: "<stdin>".to_string(),
        }
    }
}

/// Compilation result
#[derive(Debug)]
pub struct CompileResult {
    /// Assembly text
    pub assembly: String,
    /// Listing, when requested
    pub listing: Option<String>,
    /// Prim dump, when requested
    pub ir_dump: Option<String>,
    /// Number of functions emitted, support code included
    pub function_count: usize,
    /// Code words in the text psect
    pub code_words: u32,
}

/// wcc compiler
pub struct Compiler {
    options: CompileOptions,
}

impl Compiler {
    /// Create a new compiler with options
    pub fn new(options: CompileOptions) -> Self {
        Self { options }
    }

    /// Options in effect
    pub fn options(&self) -> &CompileOptions {
        &self.options
    }

    /// Scans `source` and renders the tokens as JSON lines
    pub fn tokens(&self, source: &str) -> Result<String> {
        let (tokens, errors) = Scanner::new(source, &self.options.file).scan_tokens();
        if !errors.is_empty() {
            return Err(Error::Failed(errors));
        }
        dump_tokens(&tokens)
    }

    /// Compiles `source` to assembly
    ///
    /// Every user-facing diagnostic is collected; if any was recorded the
    /// result is `Error::Failed` with all of them and nothing is emitted.
    pub fn compile(&self, source: &str) -> Result<CompileResult> {
        let _span = tracing::debug_span!("compile", file = %self.options.file).entered();
        let mut sess = Session::new(&self.options.file);

        // Phase 1: Scan
        let (tokens, lex_errors) = Scanner::new(source, &self.options.file).scan_tokens();
        debug!(tokens = tokens.len(), errors = lex_errors.len(), "scanned");
        for e in lex_errors {
            sess.report(e);
        }

        // Phase 2: Parse
        let unit = Parser::new(&mut sess, tokens).parse();
        debug!(functions = unit.functions.len(), data = unit.data.len(), "parsed");

        // Phase 3: Lower
        let mut funcs = Vec::with_capacity(unit.functions.len());
        for def in &unit.functions {
            match lower::lower_function(&mut sess, def) {
                Ok(f) => funcs.push(f),
                Err(e) => Self::record(&mut sess, e)?,
            }
        }
        if sess.has_errors() {
            return Err(Self::failed(&mut sess));
        }

        // Phase 4: Struct support code
        let support = support::generate(&mut sess)?;
        funcs.extend(support.functions);

        // Phase 5: Optimize Prims
        let mut optimizer = Optimizer::new(self.options.opt_level);
        for f in funcs.iter_mut() {
            optimizer.optimize(f);
            f.prims.verify()?;
        }
        let ir_dump = self.options.dump_ir.then(|| dump_ir(&funcs));

        // Phase 6: Machine code
        let mut machine = Vec::with_capacity(funcs.len() + support.thunks.len());
        for f in &funcs {
            match self.machine(f) {
                Ok(m) => machine.push(m),
                Err(e) => Self::record(&mut sess, e)?,
            }
        }
        for mut t in support.thunks {
            mach::relax::relax(&mut t)?;
            t.code.verify()?;
            machine.push(t);
        }
        if sess.has_errors() {
            return Err(Self::failed(&mut sess));
        }

        // Phase 7: Emit
        let mut emitter = Emitter::new(source, self.options.listing);
        for m in &machine {
            emitter.function(m)?;
        }
        let mut data = unit.data;
        data.extend(support.data);
        data.sort_by_key(|d| d.section);
        for item in &data {
            emitter.data(item);
        }
        let (assembly, listing) = emitter.finish();

        let code_words = machine.iter().map(MachFunc::size).sum();
        debug!(functions = machine.len(), code_words, data = data.len(), "emitted");
        Ok(CompileResult {
            assembly,
            listing,
            ir_dump,
            function_count: machine.len(),
            code_words,
        })
    }

    /// Selects, lays out, optimizes and relaxes one function
    fn machine(&self, f: &PrimFunc) -> Result<MachFunc> {
        let mut m = mach::select::select(f)?;
        m.code.verify()?;
        mach::frame::layout(&mut m)?;
        m.code.verify()?;
        if m.frame > MAX_FRAME {
            return Err(Error::Codegen {
                loc: f.loc.clone(),
                message: format!("stack frame of '{}' is {} words, too large", f.label, m.frame),
            });
        }
        if self.options.opt_level > 0 {
            mach::optimize(&mut m)?;
        }
        mach::relax::relax(&mut m)?;
        m.code.verify()?;
        Ok(m)
    }

    /// Records a user-facing error; internal ones abort
    fn record(sess: &mut Session, e: Error) -> Result<()> {
        if e.is_fatal() {
            return Err(e);
        }
        sess.report(e);
        Ok(())
    }

    fn failed(sess: &mut Session) -> Error {
        Error::Failed(std::mem::take(&mut sess.diags).into_errors())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile(src: &str, opts: CompileOptions) -> Result<CompileResult> {
        Compiler::new(CompileOptions {
            file: "t.c".to_string(),
            ..opts
        })
        .compile(src)
    }

    #[test]
    fn test_compiler_creation() {
        let compiler = Compiler::new(CompileOptions::default());
        assert_eq!(compiler.options().opt_level, 1);
    }

    #[test]
    fn test_main_is_global_in_text() {
        let out = compile("int main(void) { return 0; }", CompileOptions::default()).unwrap();
        assert!(out.assembly.contains("\t.psect\ttext,pflg=5,p2al=0"));
        assert!(out.assembly.contains("\t.global\tmain\nmain:\n"));
        assert!(out.assembly.contains("ret"));
        assert!(out.listing.is_none());
        assert!(out.ir_dump.is_none());
    }

    #[test]
    fn test_errors_are_collected_and_nothing_emitted() {
        let src = "int f(void) { return y; }\nint g(void) { return z; }";
        match compile(src, CompileOptions::default()) {
            Err(Error::Failed(errors)) => {
                assert_eq!(errors.len(), 2);
                assert!(errors[0].to_string().starts_with("t.c:1."));
                assert!(errors[1].to_string().starts_with("t.c:2."));
            }
            other => panic!("expected collected diagnostics, got {:?}", other.map(|r| r.assembly)),
        }
    }

    #[test]
    fn test_listing_and_ir_dump_on_request() {
        let opts = CompileOptions {
            listing: true,
            dump_ir: true,
            ..CompileOptions::default()
        };
        let out = compile("int g; int f(int a) { g = a; return a + 1; }", opts).unwrap();
        assert!(out.listing.unwrap().contains("f:"));
        assert!(out.ir_dump.unwrap().contains("f (global)"));
        assert!(out.assembly.contains("\t.psect\tbss,pflg=2,p2al=0"));
    }

    #[test]
    fn test_o0_code_is_not_smaller() {
        let src = "int f(int a, int b) { int t = a * 2; t = t + b; return t - 1; }";
        let o0 = compile(src, CompileOptions { opt_level: 0, ..CompileOptions::default() }).unwrap();
        let o1 = compile(src, CompileOptions::default()).unwrap();
        assert!(o1.code_words <= o0.code_words);
    }

    #[test]
    fn test_every_pass_leaves_lists_linked() {
        let src = "int k;\n\
                   int g(int x) {\n\
                     int r = 0; int i;\n\
                     for (i = 0; i < x; i++) { if (i == 2) continue; r += i; }\n\
                     try { if (r > 3) throw r; } catch (int e) { r = e; } finally { k = 0; }\n\
                     return r;\n\
                   }";
        let mut sess = Session::new("t.c");
        let (tokens, errors) = Scanner::new(src, "t.c").scan_tokens();
        assert!(errors.is_empty());
        let unit = Parser::new(&mut sess, tokens).parse();
        assert!(!sess.has_errors());
        let mut f = lower::lower_function(&mut sess, &unit.functions[0]).unwrap();
        f.prims.verify().unwrap();
        Optimizer::new(1).optimize(&mut f);
        f.prims.verify().unwrap();

        let mut m = mach::select::select(&f).unwrap();
        m.code.verify().unwrap();
        mach::frame::layout(&mut m).unwrap();
        m.code.verify().unwrap();
        let before = m.code.len();
        mach::optimize(&mut m).unwrap();
        m.code.verify().unwrap();
        assert!(m.code.len() <= before);
        mach::relax::relax(&mut m).unwrap();
        m.code.verify().unwrap();
    }

    #[test]
    fn test_token_dump_reports_lexical_errors() {
        let c = Compiler::new(CompileOptions::default());
        assert!(c.tokens("int x;").unwrap().lines().count() >= 3);
        assert!(matches!(c.tokens("int x = 1 @ 2;"), Err(Error::Failed(_))));
    }
}
