//! The parser implementation.

use crate::ast::{NodeArg, NodeStmt, PropertyArg, PropertyStmt, Stmt, SyntaxTree};
use dsc_lex::{Token, TokenKind};
use dsc_util::{DInt, DValue, Handler};

/// The outcome of a parse: a tree and a success flag.
///
/// The tree is only meaningful when `success` is true; on failure it holds
/// whatever statements parsed cleanly before and after the bad ones.
#[derive(Debug)]
pub struct ParseResult {
    pub tree: SyntaxTree,
    pub success: bool,
}

/// Parse a token stream into a syntax tree.
pub fn parse(tokens: &[Token], file: &str, handler: &Handler) -> ParseResult {
    Parser {
        tokens,
        pos: 0,
        file,
        handler,
        success: true,
    }
    .run()
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    file: &'a str,
    handler: &'a Handler,
    success: bool,
}

impl<'a> Parser<'a> {
    fn run(mut self) -> ParseResult {
        let mut tree = SyntaxTree::default();

        while self.pos < self.tokens.len() {
            if self.current_is_eos() {
                self.pos += 1;
                continue;
            }

            match self.statement() {
                Some(stmt) => tree.stmts.push(stmt),
                None => self.recover(),
            }
        }

        ParseResult {
            tree,
            success: self.success,
        }
    }

    fn current(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn current_line(&self) -> usize {
        self.current()
            .map(|t| t.line)
            .unwrap_or_else(|| self.tokens.last().map(|t| t.line).unwrap_or(1))
    }

    fn current_is_eos(&self) -> bool {
        matches!(self.current(), Some(t) if t.kind.is_eos())
    }

    fn advance(&mut self) -> Option<&'a Token> {
        let token = self.tokens.get(self.pos);
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    /// Consume the current token if it matches.
    fn eat(&mut self, kind: &TokenKind) -> bool {
        if matches!(self.current(), Some(t) if &t.kind == kind) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn error(&mut self, message: impl Into<String>) {
        self.handler.error(self.file, self.current_line(), message);
        self.success = false;
    }

    /// Skip past the current statement so the next one can be tried.
    fn recover(&mut self) {
        while let Some(token) = self.current() {
            let at_eos = token.kind.is_eos();
            self.pos += 1;
            if at_eos {
                break;
            }
        }
    }

    /// One or more newline / semicolon tokens.
    fn eos(&mut self) -> bool {
        if !self.current_is_eos() {
            // End of input counts; every stream ends with a newline token,
            // so this only trips on trailing garbage.
            if self.current().is_some() {
                self.error(format!(
                    "Expected end of statement, got {}",
                    self.current().unwrap().kind
                ));
                return false;
            }
            return true;
        }
        while self.current_is_eos() {
            self.pos += 1;
        }
        true
    }

    fn statement(&mut self) -> Option<Stmt> {
        match self.current().map(|t| t.kind.clone()) {
            Some(TokenKind::LProperty) => self.property_statement().map(Stmt::Property),
            Some(TokenKind::Name(_)) => self.node_statement().map(Stmt::Node),
            Some(kind) => {
                self.error(format!(
                    "Expected a property or node statement, got {}",
                    kind
                ));
                None
            }
            None => None,
        }
    }

    /// `[ Name ( propertyArgs? ) ] eos`
    fn property_statement(&mut self) -> Option<PropertyStmt> {
        let line = self.current_line();
        self.advance(); // [

        let name = match self.advance() {
            Some(Token {
                kind: TokenKind::Name(name),
                ..
            }) => name.clone(),
            _ => {
                self.error("Expected a property name after '['");
                return None;
            }
        };

        let mut args = Vec::new();
        if self.eat(&TokenKind::LBracket) {
            if !self.eat(&TokenKind::RBracket) {
                loop {
                    args.push(self.property_argument()?);
                    if self.eat(&TokenKind::Comma) {
                        continue;
                    }
                    break;
                }
                if !self.eat(&TokenKind::RBracket) {
                    self.error("Expected ')' to close the property's arguments");
                    return None;
                }
            }
        }

        if !self.eat(&TokenKind::RProperty) {
            self.error("Expected ']' to close the property statement");
            return None;
        }

        if !self.eos() {
            return None;
        }

        Some(PropertyStmt { name, args, line })
    }

    /// `Name ( args? ) ( ~ lineList )? eos`
    fn node_statement(&mut self) -> Option<NodeStmt> {
        let line = self.current_line();

        let name = match self.advance() {
            Some(Token {
                kind: TokenKind::Name(name),
                ..
            }) => name.clone(),
            _ => unreachable!("statement() checked the name token"),
        };

        let mut args = Vec::new();
        if self.eat(&TokenKind::LBracket) {
            if !self.eat(&TokenKind::RBracket) {
                loop {
                    args.push(self.argument()?);
                    if self.eat(&TokenKind::Comma) {
                        continue;
                    }
                    break;
                }
                if !self.eat(&TokenKind::RBracket) {
                    self.error("Expected ')' to close the node's arguments");
                    return None;
                }
            }
        }

        let mut outputs = Vec::new();
        if self.eat(&TokenKind::Output) {
            loop {
                outputs.push(self.line_identifier()?);
                if self.eat(&TokenKind::Comma) {
                    continue;
                }
                break;
            }
        }

        if !self.eos() {
            return None;
        }

        Some(NodeStmt {
            name,
            args,
            outputs,
            line,
        })
    }

    /// `<Name> | <literal> | <lineIdentifier>`
    fn argument(&mut self) -> Option<NodeArg> {
        match self.current().map(|t| t.kind.clone()) {
            Some(TokenKind::Name(name)) => {
                self.pos += 1;
                Some(NodeArg::Name(name))
            }
            Some(TokenKind::Line) => self.line_identifier().map(NodeArg::Line),
            Some(kind) if kind.is_literal() => {
                self.pos += 1;
                Some(NodeArg::Literal(literal_value(&kind)))
            }
            _ => {
                self.error("Invalid argument: not a name, literal or line identifier");
                None
            }
        }
    }

    /// `<Name> | <literal> | <dataType>`
    fn property_argument(&mut self) -> Option<PropertyArg> {
        match self.current().map(|t| t.kind.clone()) {
            Some(TokenKind::Name(name)) => {
                self.pos += 1;
                Some(PropertyArg::Name(name))
            }
            Some(TokenKind::TypeKeyword(typ)) => {
                self.pos += 1;
                Some(PropertyArg::DataType(typ))
            }
            Some(kind) if kind.is_literal() => {
                self.pos += 1;
                Some(PropertyArg::Literal(literal_value(&kind)))
            }
            _ => {
                self.error("Invalid property argument: not a name, literal or data type");
                None
            }
        }
    }

    /// `# <integer>`
    fn line_identifier(&mut self) -> Option<DInt> {
        if !self.eat(&TokenKind::Line) {
            self.error("Expected a line identifier to start with the line symbol (#)");
            return None;
        }
        match self.advance() {
            Some(Token {
                kind: TokenKind::IntegerLiteral(id),
                ..
            }) => Some(*id),
            _ => {
                self.error("Expected an integer after the line symbol (#)");
                None
            }
        }
    }
}

fn literal_value(kind: &TokenKind) -> DValue {
    match kind {
        TokenKind::IntegerLiteral(i) => DValue::Int(*i),
        TokenKind::FloatLiteral(f) => DValue::Float(*f),
        TokenKind::StringLiteral(s) => DValue::Str(s.clone()),
        TokenKind::BooleanLiteral(b) => DValue::Bool(*b),
        _ => unreachable!("checked by is_literal"),
    }
}
