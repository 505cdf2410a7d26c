use super::token::{Keyword, Punct, Token, TokenKind};
use crate::error::{Error, SourceLoc};
use lazy_static::lazy_static;
use regex::Regex;
use std::sync::Arc;

lazy_static! {
    /// `#line 12 "file.c"` or the preprocessor's short form `# 12 "file.c"`
    static ref LINE_DIRECTIVE: Regex =
        Regex::new(r#"^#\s*(?:line\s+)?(\d+)(?:\s+"([^"]*)")?\s*$"#).expect("valid directive regex");
}

/// Scanner for C-like source text
///
/// Produces the whole token vector up front. Lexical errors are recorded and
/// scanning resumes at the next character.
pub struct Scanner {
    /// Source code as character vector
    source: Vec<char>,
    /// Accumulated tokens
    tokens: Vec<Token>,
    /// Recorded lexical errors
    errors: Vec<Error>,
    /// Start position of current token
    start: usize,
    /// Current position in source
    current: usize,
    /// Physical line of `current` (1-indexed)
    line: u32,
    /// Column of `current` (1-indexed)
    column: u32,
    /// Logical line minus physical line, set by `#line`
    line_delta: i64,
    /// Logical file name
    file: Arc<str>,
    /// Location of the token being scanned
    token_loc: SourceLoc,
}

impl Scanner {
    /// Creates a new scanner over `source`, attributing tokens to `file`
    pub fn new(source: &str, file: &str) -> Self {
        let file: Arc<str> = Arc::from(file);
        Scanner {
            source: source.chars().collect(),
            tokens: Vec::new(),
            errors: Vec::new(),
            start: 0,
            current: 0,
            line: 1,
            column: 1,
            line_delta: 0,
            token_loc: SourceLoc::new(file.clone(), 1, 1),
            file,
        }
    }

    /// Scans all tokens; the vector always ends with `Eof`
    pub fn scan_tokens(mut self) -> (Vec<Token>, Vec<Error>) {
        while !self.is_at_end() {
            self.start = self.current;
            self.token_loc = self.loc_here();
            self.scan_token();
        }
        let eof = Token::new(TokenKind::Eof, self.loc_here());
        self.tokens.push(eof);
        tracing::debug!(
            tokens = self.tokens.len(),
            errors = self.errors.len(),
            "scanned"
        );
        (self.tokens, self.errors)
    }

    fn loc_here(&self) -> SourceLoc {
        let logical = (self.line as i64 + self.line_delta).max(1) as u32;
        SourceLoc {
            file: self.file.clone(),
            line: logical,
            col: self.column,
            phys_line: self.line,
        }
    }

    fn error(&mut self, message: impl Into<String>) {
        self.errors.push(Error::Lexical {
            loc: self.token_loc.clone(),
            message: message.into(),
        });
    }

    fn scan_token(&mut self) {
        let at_line_start = self.column == 1;
        let c = self.advance();

        match c {
            ' ' | '\r' | '\t' | '\n' | '\x0c' => {}

            '#' if at_line_start => self.directive(),

            '(' => self.add_punct(Punct::LParen),
            ')' => self.add_punct(Punct::RParen),
            '[' => self.add_punct(Punct::LBracket),
            ']' => self.add_punct(Punct::RBracket),
            '{' => self.add_punct(Punct::LBrace),
            '}' => self.add_punct(Punct::RBrace),
            ';' => self.add_punct(Punct::Semi),
            ',' => self.add_punct(Punct::Comma),
            '?' => self.add_punct(Punct::Question),
            '~' => self.add_punct(Punct::Tilde),
            ':' => {
                let p = if self.match_char(':') {
                    Punct::ColonColon
                } else {
                    Punct::Colon
                };
                self.add_punct(p);
            }
            '.' => {
                if self.peek().is_ascii_digit() {
                    self.scan_number();
                } else if self.peek() == '.' && self.peek_next() == '.' {
                    self.advance();
                    self.advance();
                    self.add_punct(Punct::Ellipsis);
                } else {
                    self.add_punct(Punct::Dot);
                }
            }
            '+' => {
                let p = if self.match_char('+') {
                    Punct::PlusPlus
                } else if self.match_char('=') {
                    Punct::PlusAssign
                } else {
                    Punct::Plus
                };
                self.add_punct(p);
            }
            '-' => {
                let p = if self.match_char('-') {
                    Punct::MinusMinus
                } else if self.match_char('=') {
                    Punct::MinusAssign
                } else if self.match_char('>') {
                    Punct::Arrow
                } else {
                    Punct::Minus
                };
                self.add_punct(p);
            }
            '*' => self.with_assign(Punct::Star, Punct::StarAssign),
            '%' => self.with_assign(Punct::Percent, Punct::PercentAssign),
            '^' => self.with_assign(Punct::Caret, Punct::CaretAssign),
            '=' => self.with_assign(Punct::Assign, Punct::EqEq),
            '!' => self.with_assign(Punct::Bang, Punct::NotEq),
            '/' => {
                if self.match_char('/') {
                    while self.peek() != '\n' && !self.is_at_end() {
                        self.advance();
                    }
                } else if self.match_char('*') {
                    self.block_comment();
                } else {
                    self.with_assign(Punct::Slash, Punct::SlashAssign);
                }
            }
            '&' => {
                if self.match_char('&') {
                    self.add_punct(Punct::AndAnd);
                } else {
                    self.with_assign(Punct::Amp, Punct::AmpAssign);
                }
            }
            '|' => {
                if self.match_char('|') {
                    self.add_punct(Punct::OrOr);
                } else {
                    self.with_assign(Punct::Pipe, Punct::PipeAssign);
                }
            }
            '<' => {
                if self.match_char('<') {
                    self.with_assign(Punct::Shl, Punct::ShlAssign);
                } else {
                    self.with_assign(Punct::Lt, Punct::LtEq);
                }
            }
            '>' => {
                if self.match_char('>') {
                    self.with_assign(Punct::Shr, Punct::ShrAssign);
                } else {
                    self.with_assign(Punct::Gt, Punct::GtEq);
                }
            }

            '"' => self.scan_string(),
            '\'' => self.scan_char(),

            c if c.is_ascii_digit() => self.scan_number(),
            c if c.is_ascii_alphabetic() || c == '_' => self.scan_identifier_or_keyword(),

            other => self.error(format!("unexpected character '{}'", other.escape_default())),
        }
    }

    fn with_assign(&mut self, plain: Punct, with_eq: Punct) {
        let p = if self.match_char('=') { with_eq } else { plain };
        self.add_punct(p);
    }

    fn directive(&mut self) {
        let mut text = String::from("#");
        while self.peek() != '\n' && !self.is_at_end() {
            text.push(self.advance());
        }
        let Some(caps) = LINE_DIRECTIVE.captures(text.trim_end()) else {
            tracing::trace!(directive = %text, "ignoring directive");
            return;
        };
        let Ok(number) = caps[1].parse::<i64>() else {
            return;
        };
        // The directive names the logical number of the next physical line.
        self.line_delta = number - (self.line as i64 + 1);
        if let Some(name) = caps.get(2) {
            self.file = Arc::from(name.as_str());
        }
    }

    fn block_comment(&mut self) {
        loop {
            if self.is_at_end() {
                self.error("unterminated comment");
                return;
            }
            if self.peek() == '*' && self.peek_next() == '/' {
                self.advance();
                self.advance();
                return;
            }
            self.advance();
        }
    }

    fn scan_escape(&mut self) -> Option<u8> {
        let c = self.advance();
        let value = match c {
            'n' => b'\n',
            't' => b'\t',
            'r' => b'\r',
            'a' => 7,
            'b' => 8,
            'f' => 12,
            'v' => 11,
            '\\' => b'\\',
            '\'' => b'\'',
            '"' => b'"',
            '?' => b'?',
            'x' => {
                let mut value: u32 = 0;
                let mut digits = 0;
                while self.peek().is_ascii_hexdigit() {
                    let d = self.advance().to_digit(16).unwrap_or(0);
                    value = value.saturating_mul(16).saturating_add(d);
                    digits += 1;
                }
                if digits == 0 {
                    self.error("\\x used with no following hex digits");
                    return None;
                }
                if value > 0xff {
                    self.error("hex escape sequence out of range");
                    return None;
                }
                value as u8
            }
            '0'..='7' => {
                let mut value = c.to_digit(8).unwrap_or(0);
                for _ in 0..2 {
                    if let Some(d) = self.peek().to_digit(8) {
                        self.advance();
                        value = value * 8 + d;
                    } else {
                        break;
                    }
                }
                (value & 0xff) as u8
            }
            other => {
                self.error(format!("unknown escape sequence '\\{}'", other));
                return None;
            }
        };
        Some(value)
    }

    fn scan_string(&mut self) {
        let mut bytes = Vec::new();
        loop {
            if self.is_at_end() || self.peek() == '\n' {
                self.error("unterminated string literal");
                return;
            }
            match self.advance() {
                '"' => break,
                '\\' => {
                    if let Some(b) = self.scan_escape() {
                        bytes.push(b);
                    }
                }
                c => {
                    let mut buf = [0u8; 4];
                    bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
                }
            }
        }

        // Adjacent literals concatenate.
        if let Some(Token {
            kind: TokenKind::Str(prev),
            ..
        }) = self.tokens.last_mut()
        {
            prev.extend(bytes);
            return;
        }
        self.add_token(TokenKind::Str(bytes));
    }

    fn scan_char(&mut self) {
        if self.is_at_end() || self.peek() == '\n' || self.peek() == '\'' {
            self.error("unterminated character constant");
            return;
        }
        let value = match self.advance() {
            '\\' => self.scan_escape().unwrap_or(0) as i8 as i64,
            c => c as i64,
        };
        if !self.match_char('\'') {
            self.error("unterminated character constant");
            return;
        }
        self.add_token(TokenKind::Char(value));
    }

    fn scan_number(&mut self) {
        let first = self.source[self.start];
        let mut is_float = first == '.';
        let mut radix = 10;

        if first == '0' && matches!(self.peek(), 'x' | 'X') {
            self.advance();
            radix = 16;
            while self.peek().is_ascii_hexdigit() {
                self.advance();
            }
        } else {
            while self.peek().is_ascii_digit() {
                self.advance();
            }
            if !is_float && self.peek() == '.' {
                is_float = true;
                self.advance();
            }
            while self.peek().is_ascii_digit() {
                self.advance();
            }
            if matches!(self.peek(), 'e' | 'E')
                && (self.peek_next().is_ascii_digit()
                    || (matches!(self.peek_next(), '+' | '-')
                        && self
                            .source
                            .get(self.current + 2)
                            .is_some_and(|c| c.is_ascii_digit())))
            {
                is_float = true;
                self.advance();
                if matches!(self.peek(), '+' | '-') {
                    self.advance();
                }
                while self.peek().is_ascii_digit() {
                    self.advance();
                }
            }
            if !is_float && first == '0' && self.current - self.start > 1 {
                radix = 8;
            }
        }

        let text: String = self.source[self.start..self.current].iter().collect();

        if is_float {
            let single = matches!(self.peek(), 'f' | 'F');
            if single || matches!(self.peek(), 'l' | 'L') {
                self.advance();
            }
            match text.parse::<f64>() {
                Ok(value) => self.add_token(TokenKind::Float { value, single }),
                Err(_) => self.error(format!("invalid floating constant '{}'", text)),
            }
            return;
        }

        let mut unsigned = false;
        let mut long = false;
        loop {
            match self.peek() {
                'u' | 'U' if !unsigned => unsigned = true,
                'l' | 'L' if !long => long = true,
                _ => break,
            }
            self.advance();
        }

        let digits = match radix {
            16 => &text[2..],
            8 => &text[1..],
            _ => &text[..],
        };
        match u64::from_str_radix(digits, radix) {
            Ok(value) => self.add_token(TokenKind::Int {
                value,
                unsigned,
                long,
            }),
            Err(_) => self.error(format!("invalid integer constant '{}'", text)),
        }
    }

    fn scan_identifier_or_keyword(&mut self) {
        while self.peek().is_ascii_alphanumeric() || self.peek() == '_' {
            self.advance();
        }
        let text: String = self.source[self.start..self.current].iter().collect();
        let kind = match Keyword::lookup(&text) {
            Some(kw) => TokenKind::Keyword(kw),
            None => TokenKind::Ident(text),
        };
        self.add_token(kind);
    }

    fn is_at_end(&self) -> bool {
        self.current >= self.source.len()
    }

    fn advance(&mut self) -> char {
        let c = self.source.get(self.current).copied().unwrap_or('\0');
        self.current += 1;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        c
    }

    fn peek(&self) -> char {
        self.source.get(self.current).copied().unwrap_or('\0')
    }

    fn peek_next(&self) -> char {
        self.source.get(self.current + 1).copied().unwrap_or('\0')
    }

    fn match_char(&mut self, expected: char) -> bool {
        if self.peek() != expected || self.is_at_end() {
            return false;
        }
        self.advance();
        true
    }

    fn add_punct(&mut self, p: Punct) {
        self.add_token(TokenKind::Punct(p));
    }

    fn add_token(&mut self, kind: TokenKind) {
        self.tokens.push(Token::new(kind, self.token_loc.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        let (tokens, errors) = Scanner::new(source, "t.c").scan_tokens();
        assert!(errors.is_empty(), "unexpected errors: {:?}", errors);
        tokens.into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_operators_longest_match() {
        let k = kinds("a <<= b >> c -> d ... ::");
        assert_eq!(k[1], TokenKind::Punct(Punct::ShlAssign));
        assert_eq!(k[3], TokenKind::Punct(Punct::Shr));
        assert_eq!(k[5], TokenKind::Punct(Punct::Arrow));
        assert_eq!(k[7], TokenKind::Punct(Punct::Ellipsis));
        assert_eq!(k[8], TokenKind::Punct(Punct::ColonColon));
    }

    #[test]
    fn test_integer_literals() {
        let k = kinds("10 010 0x1F 7u 9L 3ul");
        let values: Vec<(u64, bool, bool)> = k
            .iter()
            .filter_map(|k| match k {
                TokenKind::Int {
                    value,
                    unsigned,
                    long,
                } => Some((*value, *unsigned, *long)),
                _ => None,
            })
            .collect();
        assert_eq!(
            values,
            vec![
                (10, false, false),
                (8, false, false),
                (31, false, false),
                (7, true, false),
                (9, false, true),
                (3, true, true)
            ]
        );
    }

    #[test]
    fn test_float_literals() {
        let k = kinds("1.5 2e3 .25f");
        assert_eq!(
            k[0],
            TokenKind::Float {
                value: 1.5,
                single: false
            }
        );
        assert_eq!(
            k[1],
            TokenKind::Float {
                value: 2000.0,
                single: false
            }
        );
        assert_eq!(
            k[2],
            TokenKind::Float {
                value: 0.25,
                single: true
            }
        );
    }

    #[test]
    fn test_string_escapes_and_concatenation() {
        let k = kinds(r#""a\n" "\x41\101""#);
        assert_eq!(k[0], TokenKind::Str(b"a\nAA".to_vec()));
        assert_eq!(k[1], TokenKind::Eof);
    }

    #[test]
    fn test_char_literal() {
        let k = kinds(r"'a' '\0' '\n'");
        assert_eq!(k[0], TokenKind::Char(97));
        assert_eq!(k[1], TokenKind::Char(0));
        assert_eq!(k[2], TokenKind::Char(10));
    }

    #[test]
    fn test_comments_skipped() {
        let k = kinds("a /* b \n c */ d // e\n f");
        assert_eq!(k.len(), 4);
    }

    #[test]
    fn test_line_directive_reanchors() {
        let (tokens, errors) =
            Scanner::new("int a;\n#line 40 \"orig.c\"\nint b;\n# 7\nc", "pp.i").scan_tokens();
        assert!(errors.is_empty());
        let b = tokens.iter().find(|t| t.ident() == Some("b")).unwrap();
        assert_eq!(&*b.loc.file, "orig.c");
        assert_eq!(b.loc.line, 40);
        assert_eq!(b.loc.phys_line, 3);
        let c = tokens.iter().find(|t| t.ident() == Some("c")).unwrap();
        assert_eq!(c.loc.line, 7);
        assert_eq!(&*c.loc.file, "orig.c");
    }

    #[test]
    fn test_other_directives_ignored() {
        let k = kinds("#pragma once\nx");
        assert_eq!(k[0], TokenKind::Ident("x".into()));
    }

    #[test]
    fn test_errors_recorded_and_scanning_continues() {
        let (tokens, errors) = Scanner::new("a @ b \"open\nc", "t.c").scan_tokens();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].loc().unwrap().col, 3);
        let idents: Vec<&str> = tokens.iter().filter_map(|t| t.ident()).collect();
        assert_eq!(idents, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_long_hex_escape_is_diagnosed() {
        let (tokens, errors) = Scanner::new("\"\\x123456789A\" '\\x1ff' x", "t.c").scan_tokens();
        assert_eq!(errors.len(), 2, "{:?}", errors);
        assert!(errors[0].to_string().contains("hex escape sequence out of range"));
        assert!(tokens.iter().any(|t| t.ident() == Some("x")));
    }

    #[test]
    fn test_unterminated_comment() {
        let (_, errors) = Scanner::new("a /* never closed", "t.c").scan_tokens();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].to_string().contains("unterminated comment"));
    }
}
