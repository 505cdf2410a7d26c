use crate::error::SourceLoc;
use serde::Serialize;
use std::fmt;

/// A single token from the source text
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Token {
    /// The type of token and its literal payload
    pub kind: TokenKind,
    /// Where the token starts
    pub loc: SourceLoc,
}

impl Token {
    /// Creates a new token
    pub fn new(kind: TokenKind, loc: SourceLoc) -> Self {
        Token { kind, loc }
    }

    /// Whether this token is the given punctuator
    pub fn is_punct(&self, p: Punct) -> bool {
        self.kind == TokenKind::Punct(p)
    }

    /// Whether this token is the given keyword
    pub fn is_keyword(&self, k: Keyword) -> bool {
        self.kind == TokenKind::Keyword(k)
    }

    /// Identifier text, if this is an identifier
    pub fn ident(&self) -> Option<&str> {
        match &self.kind {
            TokenKind::Ident(name) => Some(name),
            _ => None,
        }
    }
}

/// All token kinds of the source language
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum TokenKind {
    /// Integer literal with its suffixes
    Int {
        /// Literal value
        value: u64,
        /// `u` suffix present
        unsigned: bool,
        /// `l` suffix present
        long: bool,
    },
    /// Floating-point literal (`single` when suffixed with `f`)
    Float {
        /// Literal value
        value: f64,
        /// `f` suffix present
        single: bool,
    },
    /// Character literal; its value has type `int`
    Char(i64),
    /// String literal bytes, escapes already decoded
    Str(Vec<u8>),
    /// Identifier
    Ident(String),
    /// Reserved word
    Keyword(Keyword),
    /// Operator or delimiter
    Punct(Punct),
    /// End of input
    Eof,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TokenKind::Int { value, .. } => write!(f, "{}", value),
            TokenKind::Float { value, .. } => write!(f, "{}", value),
            TokenKind::Char(c) => write!(f, "character constant {}", c),
            TokenKind::Str(bytes) => write!(f, "\"{}\"", String::from_utf8_lossy(bytes)),
            TokenKind::Ident(id) => write!(f, "{}", id),
            TokenKind::Keyword(k) => write!(f, "{}", k.as_str()),
            TokenKind::Punct(p) => write!(f, "{}", p.as_str()),
            TokenKind::Eof => write!(f, "end of file"),
        }
    }
}

macro_rules! keywords {
    ($($text:literal => $variant:ident),* $(,)?) => {
        /// Reserved words
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
        pub enum Keyword {
            $(
                #[allow(missing_docs)]
                $variant,
            )*
        }

        /// Keyword spellings, sorted for binary search
        pub const KEYWORDS: &[(&str, Keyword)] = &[
            $(($text, Keyword::$variant),)*
        ];
    };
}

keywords! {
    "__alignof" => UAlignof,
    "__asm" => Asm,
    "alignof" => Alignof,
    "auto" => Auto,
    "break" => Break,
    "case" => Case,
    "catch" => Catch,
    "char" => Char,
    "const" => Const,
    "continue" => Continue,
    "default" => Default,
    "do" => Do,
    "double" => Double,
    "else" => Else,
    "enum" => Enum,
    "extern" => Extern,
    "finally" => Finally,
    "float" => Float,
    "for" => For,
    "goto" => Goto,
    "if" => If,
    "int" => Int,
    "long" => Long,
    "register" => Register,
    "return" => Return,
    "short" => Short,
    "signed" => Signed,
    "sizeof" => Sizeof,
    "static" => Static,
    "struct" => Struct,
    "switch" => Switch,
    "throw" => Throw,
    "try" => Try,
    "typedef" => Typedef,
    "union" => Union,
    "unsigned" => Unsigned,
    "virtual" => Virtual,
    "void" => Void,
    "volatile" => Volatile,
    "while" => While,
}

impl Keyword {
    /// Look up a reserved word
    pub fn lookup(word: &str) -> Option<Keyword> {
        KEYWORDS
            .binary_search_by(|(text, _)| (*text).cmp(word))
            .ok()
            .map(|i| KEYWORDS[i].1)
    }

    /// Source spelling
    pub fn as_str(self) -> &'static str {
        KEYWORDS
            .iter()
            .find(|(_, k)| *k == self)
            .map(|(text, _)| *text)
            .unwrap_or("?")
    }
}

/// Operators and delimiters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[allow(missing_docs)]
pub enum Punct {
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Semi,
    Comma,
    Dot,
    Arrow,
    Question,
    Colon,
    ColonColon,
    Ellipsis,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Amp,
    Pipe,
    Caret,
    Tilde,
    Bang,
    Assign,
    PlusAssign,
    MinusAssign,
    StarAssign,
    SlashAssign,
    PercentAssign,
    AmpAssign,
    PipeAssign,
    CaretAssign,
    ShlAssign,
    ShrAssign,
    EqEq,
    NotEq,
    Lt,
    Gt,
    LtEq,
    GtEq,
    Shl,
    Shr,
    AndAnd,
    OrOr,
    PlusPlus,
    MinusMinus,
}

impl Punct {
    /// Source spelling
    pub fn as_str(self) -> &'static str {
        use Punct::*;
        match self {
            LParen => "(",
            RParen => ")",
            LBracket => "[",
            RBracket => "]",
            LBrace => "{",
            RBrace => "}",
            Semi => ";",
            Comma => ",",
            Dot => ".",
            Arrow => "->",
            Question => "?",
            Colon => ":",
            ColonColon => "::",
            Ellipsis => "...",
            Plus => "+",
            Minus => "-",
            Star => "*",
            Slash => "/",
            Percent => "%",
            Amp => "&",
            Pipe => "|",
            Caret => "^",
            Tilde => "~",
            Bang => "!",
            Assign => "=",
            PlusAssign => "+=",
            MinusAssign => "-=",
            StarAssign => "*=",
            SlashAssign => "/=",
            PercentAssign => "%=",
            AmpAssign => "&=",
            PipeAssign => "|=",
            CaretAssign => "^=",
            ShlAssign => "<<=",
            ShrAssign => ">>=",
            EqEq => "==",
            NotEq => "!=",
            Lt => "<",
            Gt => ">",
            LtEq => "<=",
            GtEq => ">=",
            Shl => "<<",
            Shr => ">>",
            AndAnd => "&&",
            OrOr => "||",
            PlusPlus => "++",
            MinusMinus => "--",
        }
    }
}
