use super::token::{Keyword, Punct, Token, TokenKind};
use crate::error::{Error, Result, SourceLoc};

/// Pushback-capable token sequence consumed by the parser
///
/// Any number of tokens may be pushed back; they are returned again in
/// last-in first-out order before the underlying sequence continues.
#[derive(Debug, Clone)]
pub struct TokenStream {
    tokens: Vec<Token>,
    pos: usize,
    pushback: Vec<Token>,
}

impl TokenStream {
    /// Wraps a scanned token vector. A trailing `Eof` is added if missing.
    pub fn new(mut tokens: Vec<Token>) -> Self {
        let needs_eof = !matches!(tokens.last(), Some(t) if t.kind == TokenKind::Eof);
        if needs_eof {
            let loc = tokens
                .last()
                .map(|t| t.loc.clone())
                .unwrap_or_else(SourceLoc::builtin);
            tokens.push(Token::new(TokenKind::Eof, loc));
        }
        TokenStream {
            tokens,
            pos: 0,
            pushback: Vec::new(),
        }
    }

    /// Takes the next token. At the end, `Eof` is returned repeatedly.
    pub fn next_token(&mut self) -> Token {
        if let Some(tok) = self.pushback.pop() {
            return tok;
        }
        let tok = self.tokens[self.pos.min(self.tokens.len() - 1)].clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        tok
    }

    /// Returns a token to the stream
    pub fn push_back(&mut self, tok: Token) {
        self.pushback.push(tok);
    }

    /// Looks at the next token without consuming it
    pub fn peek(&self) -> &Token {
        match self.pushback.last() {
            Some(tok) => tok,
            None => &self.tokens[self.pos.min(self.tokens.len() - 1)],
        }
    }

    /// Looks `n` tokens ahead (0 is the next token)
    pub fn peek_nth(&mut self, n: usize) -> Token {
        let mut taken = Vec::with_capacity(n + 1);
        for _ in 0..=n {
            taken.push(self.next_token());
        }
        let tok = taken[n].clone();
        while let Some(t) = taken.pop() {
            self.push_back(t);
        }
        tok
    }

    /// Whether the next token is `Eof`
    pub fn at_end(&self) -> bool {
        self.peek().kind == TokenKind::Eof
    }

    /// Consumes the next token if it is the punctuator `p`
    pub fn eat(&mut self, p: Punct) -> bool {
        if self.peek().is_punct(p) {
            self.next_token();
            true
        } else {
            false
        }
    }

    /// Consumes the next token if it is the keyword `k`
    pub fn eat_keyword(&mut self, k: Keyword) -> bool {
        if self.peek().is_keyword(k) {
            self.next_token();
            true
        } else {
            false
        }
    }

    /// Consumes the punctuator `p` or fails with a syntax error
    pub fn expect(&mut self, p: Punct) -> Result<Token> {
        let tok = self.next_token();
        if tok.is_punct(p) {
            Ok(tok)
        } else {
            let err = Error::syntax(
                &tok.loc,
                format!("expected '{}' before '{}'", p.as_str(), tok.kind),
            );
            self.push_back(tok);
            Err(err)
        }
    }

    /// Consumes an identifier or fails with a syntax error
    pub fn expect_ident(&mut self) -> Result<(String, SourceLoc)> {
        let tok = self.next_token();
        match tok.kind {
            TokenKind::Ident(name) => Ok((name, tok.loc)),
            ref other => {
                let err = Error::syntax(&tok.loc, format!("expected identifier before '{}'", other));
                self.push_back(tok);
                Err(err)
            }
        }
    }

    /// Collects the tokens of a balanced `{ ... }` group, the opening brace
    /// already consumed; the closing brace is consumed but not returned
    pub fn take_braced(&mut self) -> Result<Vec<Token>> {
        let mut depth = 1usize;
        let mut body = Vec::new();
        loop {
            let tok = self.next_token();
            match &tok.kind {
                TokenKind::Eof => return Err(Error::syntax(&tok.loc, "unexpected end of file in body")),
                TokenKind::Punct(Punct::LBrace) => depth += 1,
                TokenKind::Punct(Punct::RBrace) => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(body);
                    }
                }
                _ => {}
            }
            body.push(tok);
        }
    }

    /// Position marker for [`TokenStream::resync`]
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Skips to the end of the top-level declaration that started at
    /// `start`: past the `;` or closing `}` that brings the brace depth back
    /// to zero
    pub fn resync(&mut self, start: usize) {
        let mut depth: i64 = 0;
        for tok in &self.tokens[start.min(self.pos)..self.pos] {
            match tok.kind {
                TokenKind::Punct(Punct::LBrace) => depth += 1,
                TokenKind::Punct(Punct::RBrace) => depth -= 1,
                _ => {}
            }
        }
        for tok in &self.pushback {
            match tok.kind {
                TokenKind::Punct(Punct::LBrace) => depth -= 1,
                TokenKind::Punct(Punct::RBrace) => depth += 1,
                _ => {}
            }
        }
        let mut depth = depth.max(0);
        loop {
            let tok = self.next_token();
            match tok.kind {
                TokenKind::Eof => return,
                TokenKind::Punct(Punct::LBrace) => depth += 1,
                TokenKind::Punct(Punct::RBrace) => {
                    if depth <= 1 {
                        // A following `;` belongs to the abandoned declaration.
                        self.eat(Punct::Semi);
                        return;
                    }
                    depth -= 1;
                }
                TokenKind::Punct(Punct::Semi) if depth == 0 => return,
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::Scanner;

    fn stream(src: &str) -> TokenStream {
        let (tokens, _) = Scanner::new(src, "t.c").scan_tokens();
        TokenStream::new(tokens)
    }

    #[test]
    fn test_pushback_is_lifo() {
        let mut ts = stream("a b c");
        let a = ts.next_token();
        let b = ts.next_token();
        ts.push_back(b);
        ts.push_back(a);
        assert_eq!(ts.next_token().ident(), Some("a"));
        assert_eq!(ts.next_token().ident(), Some("b"));
        assert_eq!(ts.next_token().ident(), Some("c"));
        assert!(ts.at_end());
        assert!(ts.at_end());
    }

    #[test]
    fn test_peek_nth_leaves_stream_unchanged() {
        let mut ts = stream("x ( int )");
        assert!(ts.peek_nth(2).is_keyword(Keyword::Int));
        assert_eq!(ts.next_token().ident(), Some("x"));
    }

    #[test]
    fn test_resync_skips_nested_body() {
        let mut ts = stream("int f() { if (x) { y; } } int z;");
        ts.resync(0);
        assert!(ts.peek().is_keyword(Keyword::Int));
        let mut ts = stream("garbage here ; next");
        ts.resync(0);
        assert_eq!(ts.next_token().ident(), Some("next"));
    }

    #[test]
    fn test_resync_from_inside_body() {
        let mut ts = stream("int f() { { x = ; } y; } int z;");
        let start = ts.position();
        while !ts.peek().is_punct(Punct::Semi) {
            ts.next_token();
        }
        ts.resync(start);
        assert!(ts.peek().is_keyword(Keyword::Int));
        assert_eq!(ts.peek_nth(1).ident(), Some("z"));
    }

    #[test]
    fn test_take_braced() {
        let mut ts = stream("{ a { b } c } d");
        ts.expect(Punct::LBrace).unwrap();
        let body = ts.take_braced().unwrap();
        assert_eq!(body.len(), 5);
        assert_eq!(ts.next_token().ident(), Some("d"));
    }
}
