//! Lexer for calcql expressions.

use crate::token::{Token, TokenKind};
use calcql_core::Span;

/// A lexer for expression source code.
pub struct Lexer<'a> {
    source: &'a str,
    bytes: &'a [u8],
    pos: u32,
}

impl<'a> Lexer<'a> {
    /// Creates a new lexer.
    pub fn new(source: &'a str) -> Self {
        Self {
            source,
            bytes: source.as_bytes(),
            pos: 0,
        }
    }

    /// Returns the current position.
    #[inline]
    pub fn pos(&self) -> u32 {
        self.pos
    }

    /// Peeks at the current byte without consuming.
    #[inline]
    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos as usize).copied()
    }

    /// Peeks at the byte at offset from current position.
    #[inline]
    fn peek_at(&self, offset: u32) -> Option<u8> {
        self.bytes.get((self.pos + offset) as usize).copied()
    }

    /// Advances by one byte.
    #[inline]
    fn advance(&mut self) {
        self.pos += 1;
    }

    /// Consumes one byte and yields `kind`.
    #[inline]
    fn single(&mut self, kind: TokenKind) -> TokenKind {
        self.advance();
        kind
    }

    /// Consumes one byte, then a second one if it is `next`.
    #[inline]
    fn pair(&mut self, next: u8, paired: TokenKind, alone: TokenKind) -> TokenKind {
        self.advance();
        if self.peek() == Some(next) {
            self.advance();
            paired
        } else {
            alone
        }
    }

    /// Scans the next token.
    pub fn next_token(&mut self) -> Token {
        self.skip_whitespace();

        let start = self.pos;

        let Some(c) = self.peek() else {
            return Token::new(TokenKind::Eof, Span::empty(start));
        };

        let kind = match c {
            b'(' => self.single(TokenKind::LParen),
            b')' => self.single(TokenKind::RParen),
            b'[' => self.single(TokenKind::LBracket),
            b']' => self.single(TokenKind::RBracket),
            b',' => self.single(TokenKind::Comma),
            b'.' => self.single(TokenKind::Dot),
            b'?' => self.single(TokenKind::Question),
            b':' => self.single(TokenKind::Colon),
            b'+' => self.single(TokenKind::Plus),
            b'-' => self.single(TokenKind::Minus),
            b'*' => self.single(TokenKind::Star),
            b'/' => self.single(TokenKind::Slash),
            b'%' => self.single(TokenKind::Percent),
            b'!' => self.pair(b'=', TokenKind::BangEq, TokenKind::Bang),
            b'<' => self.pair(b'=', TokenKind::LtEq, TokenKind::Lt),
            b'>' => self.pair(b'=', TokenKind::GtEq, TokenKind::Gt),
            b'=' => self.pair(b'=', TokenKind::EqEq, TokenKind::Error),
            b'&' => self.pair(b'&', TokenKind::AmpAmp, TokenKind::Error),
            b'|' => self.pair(b'|', TokenKind::PipePipe, TokenKind::Error),

            // String literals
            b'"' | b'\'' => self.scan_string(c),

            // Numbers
            b'0'..=b'9' => self.scan_number(),

            // Identifiers and keywords
            b'a'..=b'z' | b'A'..=b'Z' | b'_' => self.scan_identifier(),

            _ => self.single(TokenKind::Error),
        };

        Token::new(kind, Span::new(start, self.pos))
    }

    /// Skips whitespace.
    fn skip_whitespace(&mut self) {
        while let Some(b' ' | b'\t' | b'\r' | b'\n') = self.peek() {
            self.advance();
        }
    }

    /// Scans an identifier or keyword.
    fn scan_identifier(&mut self) -> TokenKind {
        let start = self.pos;
        self.advance();

        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == b'_' {
                self.advance();
            } else {
                break;
            }
        }

        let text = self.span_text(Span::new(start, self.pos));
        TokenKind::from_keyword(text).unwrap_or(TokenKind::Ident)
    }

    /// Scans a number literal. Signs are handled by the parser.
    fn scan_number(&mut self) -> TokenKind {
        let mut is_float = false;

        self.eat_digits();

        // Fractional part
        if self.peek() == Some(b'.') && self.peek_at(1).is_some_and(|c| c.is_ascii_digit()) {
            is_float = true;
            self.advance();
            self.eat_digits();
        }

        // Exponent part
        if let Some(b'e' | b'E') = self.peek() {
            is_float = true;
            self.advance();
            if let Some(b'+' | b'-') = self.peek() {
                self.advance();
            }
            self.eat_digits();
        }

        if is_float {
            TokenKind::FloatLiteral
        } else {
            TokenKind::IntLiteral
        }
    }

    fn eat_digits(&mut self) {
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.advance();
        }
    }

    /// Scans a string literal delimited by `quote`.
    fn scan_string(&mut self, quote: u8) -> TokenKind {
        self.advance(); // Opening quote

        loop {
            let rest = &self.bytes[self.pos as usize..];
            let Some(offset) = memchr::memchr3(quote, b'\\', b'\n', rest) else {
                self.pos = self.bytes.len() as u32;
                return TokenKind::Error;
            };
            self.pos += offset as u32;

            match rest[offset] {
                b'\\' => {
                    self.advance();
                    if self.peek().is_none() {
                        return TokenKind::Error;
                    }
                    self.advance(); // Escaped char
                }
                b'\n' => return TokenKind::Error,
                _ => {
                    self.advance();
                    return TokenKind::StringLiteral;
                }
            }
        }
    }

    /// Gets the text at the given span.
    pub fn span_text(&self, span: Span) -> &'a str {
        span.slice(self.source)
    }
}

/// Tokenizes the entire source.
pub fn tokenize(source: &str) -> Vec<Token> {
    let mut lexer = Lexer::new(source);
    let mut tokens = Vec::new();

    loop {
        let token = lexer.next_token();
        let is_eof = token.is_eof();
        tokens.push(token);
        if is_eof {
            break;
        }
    }

    tokens
}
