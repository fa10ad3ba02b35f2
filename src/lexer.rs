// File: src/lexer.rs
//
// On-demand scanner for Moss source text.
// Hands out one token per call; the compiler pulls tokens as it parses, so
// no token buffer is ever materialized. Lexemes borrow from the source.

use ahash::AHashMap;
use once_cell::sync::Lazy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    // Single-character tokens
    LeftParen,
    RightParen,
    LeftBrace,
    RightBrace,
    Comma,
    Dot,
    Minus,
    Plus,
    Semicolon,
    Slash,
    Star,
    // One- or two-character tokens
    Bang,
    BangEqual,
    Equal,
    EqualEqual,
    Greater,
    GreaterEqual,
    Less,
    LessEqual,
    // Literals
    Identifier,
    Str,
    Number,
    // Keywords
    And,
    Class,
    Else,
    False,
    For,
    Fun,
    If,
    Nil,
    Or,
    Print,
    Return,
    Super,
    This,
    True,
    Var,
    While,
    /// Scanner-level error; the message rides in the lexeme.
    Error,
    Eof,
}

static KEYWORDS: Lazy<AHashMap<&'static str, TokenKind>> = Lazy::new(|| {
    let mut map = AHashMap::new();
    map.insert("and", TokenKind::And);
    map.insert("class", TokenKind::Class);
    map.insert("else", TokenKind::Else);
    map.insert("false", TokenKind::False);
    map.insert("for", TokenKind::For);
    map.insert("fun", TokenKind::Fun);
    map.insert("if", TokenKind::If);
    map.insert("nil", TokenKind::Nil);
    map.insert("or", TokenKind::Or);
    map.insert("print", TokenKind::Print);
    map.insert("return", TokenKind::Return);
    map.insert("super", TokenKind::Super);
    map.insert("this", TokenKind::This);
    map.insert("true", TokenKind::True);
    map.insert("var", TokenKind::Var);
    map.insert("while", TokenKind::While);
    map
});

#[derive(Debug, Clone, Copy)]
pub struct Token<'src> {
    pub kind: TokenKind,
    pub lexeme: &'src str,
    pub line: u32,
}

pub struct Scanner<'src> {
    source: &'src str,
    start: usize,
    current: usize,
    line: u32,
}

impl<'src> Scanner<'src> {
    pub fn new(source: &'src str) -> Self {
        Self { source, start: 0, current: 0, line: 1 }
    }

    /// Scans and returns the next token. Returns an `Eof` token forever once
    /// the source is exhausted.
    pub fn scan_token(&mut self) -> Token<'src> {
        self.skip_whitespace();
        self.start = self.current;

        if self.is_at_end() {
            return self.make_token(TokenKind::Eof);
        }

        let c = self.advance();
        match c {
            b'(' => self.make_token(TokenKind::LeftParen),
            b')' => self.make_token(TokenKind::RightParen),
            b'{' => self.make_token(TokenKind::LeftBrace),
            b'}' => self.make_token(TokenKind::RightBrace),
            b',' => self.make_token(TokenKind::Comma),
            b'.' => self.make_token(TokenKind::Dot),
            b'-' => self.make_token(TokenKind::Minus),
            b'+' => self.make_token(TokenKind::Plus),
            b';' => self.make_token(TokenKind::Semicolon),
            b'/' => self.make_token(TokenKind::Slash),
            b'*' => self.make_token(TokenKind::Star),
            b'!' => {
                let kind = if self.matches(b'=') { TokenKind::BangEqual } else { TokenKind::Bang };
                self.make_token(kind)
            }
            b'=' => {
                let kind = if self.matches(b'=') { TokenKind::EqualEqual } else { TokenKind::Equal };
                self.make_token(kind)
            }
            b'<' => {
                let kind = if self.matches(b'=') { TokenKind::LessEqual } else { TokenKind::Less };
                self.make_token(kind)
            }
            b'>' => {
                let kind =
                    if self.matches(b'=') { TokenKind::GreaterEqual } else { TokenKind::Greater };
                self.make_token(kind)
            }
            b'"' => self.string(),
            b'0'..=b'9' => self.number(),
            c if is_alpha(c) => self.identifier(),
            _ => self.error_token("Unexpected character."),
        }
    }

    fn skip_whitespace(&mut self) {
        loop {
            match self.peek() {
                Some(b' ') | Some(b'\r') | Some(b'\t') => {
                    self.current += 1;
                }
                Some(b'\n') => {
                    self.line += 1;
                    self.current += 1;
                }
                Some(b'/') if self.peek_next() == Some(b'/') => {
                    while let Some(c) = self.peek() {
                        if c == b'\n' {
                            break;
                        }
                        self.current += 1;
                    }
                }
                _ => return,
            }
        }
    }

    fn string(&mut self) -> Token<'src> {
        while let Some(c) = self.peek() {
            if c == b'"' {
                break;
            }
            if c == b'\n' {
                self.line += 1;
            }
            self.current += 1;
        }
        if self.is_at_end() {
            return self.error_token("Unterminated string.");
        }
        self.current += 1; // closing quote
        self.make_token(TokenKind::Str)
    }

    fn number(&mut self) -> Token<'src> {
        while matches!(self.peek(), Some(b'0'..=b'9')) {
            self.current += 1;
        }
        if self.peek() == Some(b'.') && matches!(self.peek_next(), Some(b'0'..=b'9')) {
            self.current += 1;
            while matches!(self.peek(), Some(b'0'..=b'9')) {
                self.current += 1;
            }
        }
        self.make_token(TokenKind::Number)
    }

    fn identifier(&mut self) -> Token<'src> {
        while let Some(c) = self.peek() {
            if !is_alpha(c) && !c.is_ascii_digit() {
                break;
            }
            self.current += 1;
        }
        let lexeme = &self.source[self.start..self.current];
        let kind = KEYWORDS.get(lexeme).copied().unwrap_or(TokenKind::Identifier);
        self.make_token(kind)
    }

    fn is_at_end(&self) -> bool {
        self.current >= self.source.len()
    }

    fn advance(&mut self) -> u8 {
        let c = self.source.as_bytes()[self.current];
        self.current += 1;
        c
    }

    fn peek(&self) -> Option<u8> {
        self.source.as_bytes().get(self.current).copied()
    }

    fn peek_next(&self) -> Option<u8> {
        self.source.as_bytes().get(self.current + 1).copied()
    }

    fn matches(&mut self, expected: u8) -> bool {
        if self.peek() == Some(expected) {
            self.current += 1;
            true
        } else {
            false
        }
    }

    fn make_token(&self, kind: TokenKind) -> Token<'src> {
        Token { kind, lexeme: &self.source[self.start..self.current], line: self.line }
    }

    fn error_token(&self, message: &'static str) -> Token<'src> {
        Token { kind: TokenKind::Error, lexeme: message, line: self.line }
    }
}

fn is_alpha(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_'
}
