//! Lexical analysis
//!
//! Converts preprocessed source text into tokens and offers the parser a
//! pushback-capable stream over them.

mod scanner;
mod stream;
mod token;

pub use scanner::Scanner;
pub use stream::TokenStream;
pub use token::{Keyword, Punct, Token, TokenKind, KEYWORDS};
