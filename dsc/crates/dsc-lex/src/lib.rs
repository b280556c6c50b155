//! dsc-lex - Lexer for the Decision language.
//!
//! The lexer transforms source text into a finite stream of tokens with
//! attached literal data and source line numbers. Comments are bracketed by
//! `<` and `>` and discarded while preserving line counts; newlines are
//! end-of-statement tokens and are emitted even inside comments.

mod lexer;
mod token;

pub use lexer::{lex, LexError, Lexer};
pub use token::{Token, TokenKind};
