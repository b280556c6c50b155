//! Token definitions.

use dsc_util::{DFloat, DInt, DType};
use std::fmt;

/// The kind of a lexical token, with any attached literal data.
#[derive(Clone, Debug, PartialEq)]
pub enum TokenKind {
    /// `~`, introduces a node statement's output list.
    Output,
    /// `#`, starts a line identifier.
    Line,
    Comma,
    /// `|`.
    Or,
    /// A newline: end of statement.
    EosNewline,
    /// `;`: end of statement.
    EosSemicolon,
    /// `(`.
    LBracket,
    /// `)`.
    RBracket,
    /// `[`, opens a property statement.
    LProperty,
    /// `]`, closes a property statement.
    RProperty,
    /// `{`.
    LArray,
    /// `}`.
    RArray,
    /// A data type keyword: `Execution`, `Integer`, `Float`, `String` or
    /// `Boolean`.
    TypeKeyword(DType),
    IntegerLiteral(DInt),
    FloatLiteral(DFloat),
    StringLiteral(String),
    BooleanLiteral(bool),
    Name(String),
}

impl TokenKind {
    /// Is this token one of the end-of-statement tokens?
    pub fn is_eos(&self) -> bool {
        matches!(self, TokenKind::EosNewline | TokenKind::EosSemicolon)
    }

    /// Is this token a literal?
    pub fn is_literal(&self) -> bool {
        matches!(
            self,
            TokenKind::IntegerLiteral(_)
                | TokenKind::FloatLiteral(_)
                | TokenKind::StringLiteral(_)
                | TokenKind::BooleanLiteral(_)
        )
    }

    /// A short human-readable description for error messages.
    pub fn describe(&self) -> &'static str {
        match self {
            TokenKind::Output => "'~'",
            TokenKind::Line => "'#'",
            TokenKind::Comma => "','",
            TokenKind::Or => "'|'",
            TokenKind::EosNewline => "end of line",
            TokenKind::EosSemicolon => "';'",
            TokenKind::LBracket => "'('",
            TokenKind::RBracket => "')'",
            TokenKind::LProperty => "'['",
            TokenKind::RProperty => "']'",
            TokenKind::LArray => "'{'",
            TokenKind::RArray => "'}'",
            TokenKind::TypeKeyword(_) => "data type keyword",
            TokenKind::IntegerLiteral(_) => "integer literal",
            TokenKind::FloatLiteral(_) => "float literal",
            TokenKind::StringLiteral(_) => "string literal",
            TokenKind::BooleanLiteral(_) => "boolean literal",
            TokenKind::Name(_) => "name",
        }
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.describe())
    }
}

/// A token with the 1-based line number it started on.
#[derive(Clone, Debug, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: usize,
}

impl Token {
    pub fn new(kind: TokenKind, line: usize) -> Self {
        Token { kind, line }
    }
}
