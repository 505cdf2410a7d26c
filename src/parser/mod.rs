//! Scope-aware recursive-descent parser
//!
//! The parser type-checks as it goes: every expression it returns carries
//! its type, implicit conversions are explicit `Cast`/`BaseAdjust` nodes,
//! and constant subexpressions are already folded. Declarations land in the
//! session's scope arena; function bodies and static data land in a
//! [`Unit`].
//!
//! Errors abandon the current top-level declaration. The parser records the
//! diagnostic, skips to the end of that declaration and continues.

pub mod ast;
pub mod decl;
mod declarations;
mod expr;
pub mod fold;
mod initializer;
pub mod scope;
mod stmt;

pub use ast::{
    BinaryOp, Callee, Catch, Expr, ExprKind, FunctionDef, LocalInit, Stmt, StmtKind, TryInfo,
    UnaryOp, Unit,
};
pub use decl::{Decl, DeclId, DeclKind, Storage, VarLocation};
pub use fold::{fold, Const};
pub use scope::{ScopeId, ScopeKind, Symbols, Tag, TryId};

use crate::compiler::Session;
use crate::error::{Error, Result, SourceLoc};
use crate::lexer::{Keyword, Punct, Token, TokenKind, TokenStream};
use crate::types::{StructId, TypeId};
use std::collections::HashMap;

/// Deepest nesting of parenthesized expressions and statements
const MAX_NESTING: u32 = 64;

/// A parsed parameter
#[derive(Debug, Clone)]
pub(crate) struct ParamInfo {
    pub name: Option<String>,
    pub ty: TypeId,
    pub loc: SourceLoc,
}

/// An enclosing `switch`
#[derive(Debug)]
pub(crate) struct SwitchCtx {
    pub value_ty: TypeId,
    pub scope: ScopeId,
    pub cases: Vec<(i64, usize)>,
    pub default: Option<usize>,
}

/// Per-function parsing state
#[derive(Debug)]
pub(crate) struct FuncState {
    pub ret: TypeId,
    pub this: Option<(DeclId, StructId)>,
    pub tries: Vec<TryInfo>,
    pub cases: usize,
    /// `true` for loops, `false` for switches
    pub breakables: Vec<bool>,
    pub switches: Vec<SwitchCtx>,
    pub labels: HashMap<String, (ScopeId, SourceLoc)>,
    pub gotos: Vec<(String, ScopeId, SourceLoc)>,
    pub catches: Vec<DeclId>,
}

impl FuncState {
    fn new(ret: TypeId, this: Option<(DeclId, StructId)>) -> Self {
        FuncState {
            ret,
            this,
            tries: Vec::new(),
            cases: 0,
            breakables: Vec::new(),
            switches: Vec::new(),
            labels: HashMap::new(),
            gotos: Vec::new(),
            catches: Vec::new(),
        }
    }
}

/// Inline member function body, parsed once its struct is complete
#[derive(Debug)]
struct Deferred {
    decl: DeclId,
    sid: StructId,
    params: Vec<ParamInfo>,
    body: Vec<Token>,
    open: Token,
}

/// Parser for one translation unit
pub struct Parser<'s> {
    sess: &'s mut Session,
    tokens: TokenStream,
    unit: Unit,
    scope: ScopeId,
    func: Option<FuncState>,
    anon: u32,
    depth: u32,
}

impl<'s> Parser<'s> {
    /// Creates a parser over scanned tokens
    pub fn new(sess: &'s mut Session, tokens: Vec<Token>) -> Self {
        Parser {
            sess,
            tokens: TokenStream::new(tokens),
            unit: Unit::default(),
            scope: ScopeId::GLOBAL,
            func: None,
            anon: 0,
            depth: 0,
        }
    }

    /// Parses every top-level declaration; errors go to the session
    pub fn parse(mut self) -> Unit {
        let _span = tracing::debug_span!("parse", file = %self.sess.file).entered();
        while !self.tokens.at_end() {
            let start = self.tokens.position();
            if let Err(e) = self.external_declaration() {
                let fatal = e.is_fatal();
                self.sess.report(e);
                if fatal {
                    break;
                }
                self.func = None;
                self.scope = ScopeId::GLOBAL;
                self.tokens.resync(start);
            }
        }
        tracing::debug!(
            functions = self.unit.functions.len(),
            data = self.unit.data.len(),
            "parsed unit"
        );
        self.unit
    }

    // ========================================================================
    // Token helpers
    // ========================================================================

    fn peek(&self) -> &Token {
        self.tokens.peek()
    }

    fn peek_punct(&self, p: Punct) -> bool {
        self.tokens.peek().is_punct(p)
    }

    fn peek_keyword(&self, k: Keyword) -> bool {
        self.tokens.peek().is_keyword(k)
    }

    fn next(&mut self) -> Token {
        self.tokens.next_token()
    }

    fn eat(&mut self, p: Punct) -> bool {
        self.tokens.eat(p)
    }

    fn expect(&mut self, p: Punct) -> Result<Token> {
        self.tokens.expect(p)
    }

    fn loc(&self) -> SourceLoc {
        self.tokens.peek().loc.clone()
    }

    /// Runs `parse` one nesting level deeper
    fn nested<T>(&mut self, parse: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        if self.depth >= MAX_NESTING {
            return Err(Error::syntax(&self.loc(), "nesting too deep"));
        }
        self.depth += 1;
        let r = parse(self);
        self.depth -= 1;
        r
    }

    fn unexpected<T>(&mut self, what: &str) -> Result<T> {
        let tok = self.peek().clone();
        Err(Error::syntax(
            &tok.loc,
            format!("expected {} before '{}'", what, tok.kind),
        ))
    }

    // ========================================================================
    // Scope and function state
    // ========================================================================

    fn enter_scope(&mut self, kind: ScopeKind) -> ScopeId {
        let id = self.sess.symbols.push_scope(kind, self.scope);
        self.scope = id;
        id
    }

    fn func_mut(&mut self, loc: &SourceLoc) -> Result<&mut FuncState> {
        self.func
            .as_mut()
            .ok_or_else(|| Error::syntax(loc, "statement outside of a function"))
    }

    /// Whether the next tokens start a declaration
    fn starts_declaration(&mut self) -> bool {
        match &self.peek().kind {
            TokenKind::Keyword(k) => matches!(
                k,
                Keyword::Typedef
                    | Keyword::Static
                    | Keyword::Extern
                    | Keyword::Auto
                    | Keyword::Register
                    | Keyword::Const
                    | Keyword::Volatile
                    | Keyword::Void
                    | Keyword::Char
                    | Keyword::Short
                    | Keyword::Int
                    | Keyword::Long
                    | Keyword::Float
                    | Keyword::Double
                    | Keyword::Signed
                    | Keyword::Unsigned
                    | Keyword::Struct
                    | Keyword::Union
                    | Keyword::Enum
                    | Keyword::Virtual
            ),
            TokenKind::Ident(name) => {
                let name = name.clone();
                self.is_typedef_name(&name) && !self.tokens.peek_nth(1).is_punct(Punct::Colon)
            }
            _ => false,
        }
    }

    fn is_typedef_name(&self, name: &str) -> bool {
        self.sess
            .symbols
            .lookup(self.scope, name)
            .map(|(_, d)| self.sess.symbols.decl(d).is_typedef())
            .unwrap_or(false)
    }

    /// Allocates a fresh data label
    fn data_label(&mut self) -> String {
        self.sess.new_label().to_string()
    }
}
