//! The lexer implementation.

use crate::token::{Token, TokenKind};
use dsc_util::{DFloat, DInt, DType, Handler};
use thiserror::Error;

/// An error found while scanning one token.
///
/// The stream-level entry point converts these into diagnostics so that a
/// single run can surface several of them.
#[derive(Debug, Error, PartialEq)]
pub enum LexError {
    #[error("Unterminated string literal")]
    UnterminatedString,
    #[error("Invalid number literal, too many '.' symbols")]
    TooManyDecimalPoints,
    #[error("Invalid number literal, sign with no magnitude")]
    SignWithoutMagnitude,
    #[error("Unexpected character '{0}'")]
    UnexpectedCharacter(char),
}

/// Lexer for the Decision language.
///
/// Walks the source text once, producing tokens with line numbers. Errors are
/// pushed onto the diagnostics handler and scanning continues with the next
/// character, so a run reports as many lexical errors as possible.
pub struct Lexer<'a> {
    source: &'a str,
    bytes: &'a [u8],
    pos: usize,
    line: usize,
    file: &'a str,
    handler: &'a Handler,
}

/// Scan a whole source text into a token stream.
///
/// The stream always ends with an end-of-statement token, so parsers can rely
/// on every statement being terminated.
pub fn lex(source: &str, file: &str, handler: &Handler) -> Vec<Token> {
    Lexer::new(source, file, handler).run()
}

fn is_name_start(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_'
}

fn is_name_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_'
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a str, file: &'a str, handler: &'a Handler) -> Self {
        Lexer {
            source,
            bytes: source.as_bytes(),
            pos: 0,
            line: 1,
            file,
            handler,
        }
    }

    fn run(mut self) -> Vec<Token> {
        let mut tokens = Vec::new();
        let mut in_comment = false;

        while self.pos < self.bytes.len() {
            let c = self.bytes[self.pos];

            // Newlines always count, even inside comments.
            if c == b'\n' {
                tokens.push(Token::new(TokenKind::EosNewline, self.line));
                self.line += 1;
                self.pos += 1;
                continue;
            }

            if in_comment {
                if c == b'>' {
                    in_comment = false;
                }
                self.pos += 1;
                continue;
            }

            let line = self.line;
            let kind = match c {
                b' ' | b'\t' | b'\r' => {
                    self.pos += 1;
                    continue;
                }
                b'<' => {
                    in_comment = true;
                    self.pos += 1;
                    continue;
                }
                b'~' => self.single(TokenKind::Output),
                b'#' => self.single(TokenKind::Line),
                b',' => self.single(TokenKind::Comma),
                b'|' => self.single(TokenKind::Or),
                b';' => self.single(TokenKind::EosSemicolon),
                b'(' => self.single(TokenKind::LBracket),
                b')' => self.single(TokenKind::RBracket),
                b'[' => self.single(TokenKind::LProperty),
                b']' => self.single(TokenKind::RProperty),
                b'{' => self.single(TokenKind::LArray),
                b'}' => self.single(TokenKind::RArray),
                b'0'..=b'9' | b'+' | b'-' | b'.' => self.lex_number(),
                b'"' | b'\'' => self.lex_string(),
                c if is_name_start(c) => Ok(self.lex_name()),
                c => {
                    self.pos += 1;
                    Err(LexError::UnexpectedCharacter(c as char))
                }
            };

            match kind {
                Ok(kind) => tokens.push(Token::new(kind, line)),
                Err(err) => self.handler.error(self.file, line, err.to_string()),
            }
        }

        // Scanning must terminate cleanly even if the source does not end
        // with a newline.
        if !matches!(
            tokens.last(),
            Some(Token {
                kind: TokenKind::EosNewline,
                ..
            })
        ) {
            tokens.push(Token::new(TokenKind::EosNewline, self.line));
        }

        tokens
    }

    fn single(&mut self, kind: TokenKind) -> Result<TokenKind, LexError> {
        self.pos += 1;
        Ok(kind)
    }

    fn peek(&self, offset: usize) -> u8 {
        *self.bytes.get(self.pos + offset).unwrap_or(&0)
    }

    /// Scan an integer or float literal.
    ///
    /// Recognised forms: decimal with an optional sign, `0x` hexadecimal,
    /// leading-zero octal, and floats with a single decimal point.
    fn lex_number(&mut self) -> Result<TokenKind, LexError> {
        let c = self.bytes[self.pos];

        if c == b'0' && self.peek(1) != b'.' {
            if (self.peek(1) == b'x' || self.peek(1) == b'X')
                && self.peek(2).is_ascii_hexdigit()
            {
                // Hexadecimal.
                self.pos += 2;
                let start = self.pos;
                while self.peek(0).is_ascii_hexdigit() {
                    self.pos += 1;
                }
                let value = DInt::from_str_radix(&self.source[start..self.pos], 16)
                    .unwrap_or(DInt::MAX);
                return Ok(TokenKind::IntegerLiteral(value));
            }

            // Leading-zero octal; a lone `0` falls out as the value 0.
            let start = self.pos;
            self.pos += 1;
            while (b'0'..=b'7').contains(&self.peek(0)) {
                self.pos += 1;
            }
            let value =
                DInt::from_str_radix(&self.source[start..self.pos], 8).unwrap_or(DInt::MAX);
            return Ok(TokenKind::IntegerLiteral(value));
        }

        // Decimal integer or float, with an optional sign.
        let start = self.pos;
        if c == b'+' || c == b'-' {
            self.pos += 1;
        }

        let mut dots = 0usize;
        let mut digits = 0usize;
        loop {
            let c = self.peek(0);
            if c.is_ascii_digit() {
                digits += 1;
            } else if c == b'.' {
                dots += 1;
            } else {
                break;
            }
            self.pos += 1;
        }

        if digits == 0 {
            return Err(LexError::SignWithoutMagnitude);
        }
        if dots > 1 {
            return Err(LexError::TooManyDecimalPoints);
        }

        let text = &self.source[start..self.pos];
        if dots == 1 {
            let value: DFloat = text.parse().unwrap_or(0.0);
            Ok(TokenKind::FloatLiteral(value))
        } else {
            let value: DInt = text.parse().unwrap_or(DInt::MAX);
            Ok(TokenKind::IntegerLiteral(value))
        }
    }

    /// Scan a string literal in single or double quotes, processing escapes.
    fn lex_string(&mut self) -> Result<TokenKind, LexError> {
        let quote = self.bytes[self.pos];
        self.pos += 1;

        let mut content = String::new();
        loop {
            if self.pos >= self.bytes.len() {
                return Err(LexError::UnterminatedString);
            }

            let c = self.bytes[self.pos];
            if c == quote {
                self.pos += 1;
                break;
            }

            if c == b'\\' {
                self.pos += 1;
                let escaped = match self.peek(0) {
                    b'\\' => '\\',
                    b'\'' => '\'',
                    b'"' => '"',
                    b'n' => '\n',
                    b'r' => '\r',
                    b't' => '\t',
                    b'b' => '\u{0008}',
                    b'f' => '\u{000C}',
                    b'v' => '\u{000B}',
                    b'0' => '\0',
                    other => other as char,
                };
                content.push(escaped);
                self.pos += 1;
                continue;
            }

            if c == b'\n' {
                self.line += 1;
            }

            // Strings may contain arbitrary UTF-8; copy whole code points.
            let ch = self.source[self.pos..].chars().next().unwrap_or('\0');
            content.push(ch);
            self.pos += ch.len_utf8();
        }

        Ok(TokenKind::StringLiteral(content))
    }

    /// Scan a name, which may turn out to be a keyword or boolean literal.
    fn lex_name(&mut self) -> TokenKind {
        let start = self.pos;
        while is_name_char(self.peek(0)) {
            self.pos += 1;
        }

        match &self.source[start..self.pos] {
            "Execution" => TokenKind::TypeKeyword(DType::Execution),
            "Integer" => TokenKind::TypeKeyword(DType::Int),
            "Float" => TokenKind::TypeKeyword(DType::Float),
            "String" => TokenKind::TypeKeyword(DType::String),
            "Boolean" => TokenKind::TypeKeyword(DType::Bool),
            "true" => TokenKind::BooleanLiteral(true),
            "false" => TokenKind::BooleanLiteral(false),
            name => TokenKind::Name(name.to_string()),
        }
    }
}
