// Parser: recursive descent parser for PhySL
//
// Consumes the Vec<Token> from the Lexer and produces Ast values, one method
// per grammar production:
//
//   snippet  := expr* EOF
//   expr     := operand (binop operand)*          kept flat, see ast.rs
//   operand  := ('-' | '!') operand | primary
//   primary  := literal
//             | ident
//             | ident '(' items ')'                function call
//             | '[' items ']'                      array literal
//             | '(' ')'                            empty list
//             | '(' expr ')'                       grouping
//             | '(' expr ',' items ')'             list literal
//   items    := (expr (',' expr)* ','?)?
//
// ERROR RECOVERY: none. The first error aborts the parse.
//
// The same grammar is used for pattern text. In pattern mode identifiers
// spelled `_<digits>` / `__<digits>` become placeholders; in ordinary
// source they are plain names.

use crate::ast::*;
use crate::error::{ParseError, ParseErrorKind};
use crate::lexer::Lexer;
use crate::token::{Span, Token, TokenKind};

type Result<T> = std::result::Result<T, ParseError>;

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    positions: PositionTable,
    pattern_mode: bool,
}

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            pos: 0,
            positions: PositionTable::new(),
            pattern_mode: false,
        }
    }

    /// Parser that turns `_k` / `__k` identifiers into placeholders.
    pub fn for_pattern(tokens: Vec<Token>) -> Self {
        Self {
            pattern_mode: true,
            ..Self::new(tokens)
        }
    }

    /// Parse every expression up to end of input.
    pub fn parse_snippet(&mut self) -> Result<Vec<Ast>> {
        let mut exprs = Vec::new();
        while !self.at_eof() {
            exprs.push(self.parse_expr()?);
        }
        Ok(exprs)
    }

    /// Parse exactly one expression followed by end of input.
    pub fn parse_single(&mut self) -> Result<Ast> {
        if self.at_eof() {
            return Err(ParseError::new(
                ParseErrorKind::UnexpectedEof,
                self.current_span(),
            ));
        }
        let expr = self.parse_expr()?;
        if !self.at_eof() {
            return Err(self.error_unexpected("end of input"));
        }
        Ok(expr)
    }

    /// Hand over the position table filled while parsing.
    pub fn into_positions(self) -> PositionTable {
        self.positions
    }

    // Expressions

    fn parse_expr(&mut self) -> Result<Ast> {
        let first = self.parse_operand()?;
        let mut rest = Vec::new();
        while let Some(op) = self.peek_binop() {
            self.advance();
            let operand = self.parse_operand()?;
            rest.push(Operation { op, operand });
        }
        if rest.is_empty() {
            Ok(first)
        } else {
            Ok(Ast::Expression {
                first: Box::new(first),
                rest,
            })
        }
    }

    fn peek_binop(&self) -> Option<BinOp> {
        let op = match self.peek_kind() {
            TokenKind::PipePipe => BinOp::Or,
            TokenKind::AmpAmp => BinOp::And,
            TokenKind::EqEq => BinOp::Eq,
            TokenKind::BangEq => BinOp::Ne,
            TokenKind::Lt => BinOp::Lt,
            TokenKind::LtEq => BinOp::Le,
            TokenKind::Gt => BinOp::Gt,
            TokenKind::GtEq => BinOp::Ge,
            TokenKind::Plus => BinOp::Add,
            TokenKind::Minus => BinOp::Sub,
            TokenKind::Star => BinOp::Mul,
            TokenKind::Slash => BinOp::Div,
            TokenKind::Percent => BinOp::Mod,
            _ => return None,
        };
        Some(op)
    }

    fn parse_operand(&mut self) -> Result<Ast> {
        let op = match self.peek_kind() {
            TokenKind::Minus => UnaryOp::Neg,
            TokenKind::Bang => UnaryOp::Not,
            _ => return self.parse_primary(),
        };
        self.advance();
        let operand = self.parse_operand()?;
        Ok(Ast::Unary {
            op,
            operand: Box::new(operand),
        })
    }

    fn parse_primary(&mut self) -> Result<Ast> {
        let span = self.current_span();
        match self.peek_kind() {
            TokenKind::IntLit(n) => {
                self.advance();
                Ok(Ast::Int(n))
            }
            TokenKind::FloatLit(x) => {
                self.advance();
                Ok(Ast::Float(x))
            }
            TokenKind::StringLit(s) => {
                self.advance();
                Ok(Ast::Str(s))
            }
            TokenKind::True => {
                self.advance();
                Ok(Ast::Bool(true))
            }
            TokenKind::False => {
                self.advance();
                Ok(Ast::Bool(false))
            }
            TokenKind::Nil => {
                self.advance();
                Ok(Ast::Nil)
            }
            TokenKind::LBracket => {
                self.advance();
                let items = self.parse_items(&TokenKind::RBracket)?;
                self.expect(TokenKind::RBracket)?;
                Ok(Ast::Array(items))
            }
            TokenKind::LParen => self.parse_paren(),
            TokenKind::Ident(name) => {
                self.advance();
                let id = self.positions.push(span);
                if self.check(&TokenKind::LParen) {
                    self.advance();
                    let args = self.parse_items(&TokenKind::RParen)?;
                    self.expect(TokenKind::RParen)?;
                    return Ok(Ast::Call {
                        name: Identifier::with_id(name, id),
                        args,
                    });
                }
                if self.pattern_mode {
                    if let Some(p) = Placeholder::from_name(&name) {
                        return Ok(Ast::Placeholder(p));
                    }
                }
                Ok(Ast::Identifier(Identifier::with_id(name, id)))
            }
            TokenKind::Eof => Err(ParseError::new(ParseErrorKind::UnexpectedEof, span)),
            _ => Err(self.error_unexpected("an expression")),
        }
    }

    /// `()`, `(expr)` or `(expr, ...)`.
    fn parse_paren(&mut self) -> Result<Ast> {
        self.expect(TokenKind::LParen)?;
        if self.check(&TokenKind::RParen) {
            self.advance();
            return Ok(Ast::List(Vec::new()));
        }
        let first = self.parse_expr()?;
        if self.check(&TokenKind::RParen) {
            self.advance();
            return Ok(first);
        }
        self.expect(TokenKind::Comma)?;
        let mut items = vec![first];
        items.extend(self.parse_items(&TokenKind::RParen)?);
        self.expect(TokenKind::RParen)?;
        Ok(Ast::List(items))
    }

    /// Comma-separated expressions up to (not including) `close`. A
    /// trailing comma is allowed.
    fn parse_items(&mut self, close: &TokenKind) -> Result<Vec<Ast>> {
        let mut items = Vec::new();
        while !self.check(close) {
            items.push(self.parse_expr()?);
            if self.check(&TokenKind::Comma) {
                self.advance();
            } else if !self.check(close) {
                return Err(self.error_unexpected(&format!("',' or {close}")));
            }
        }
        Ok(items)
    }

    // Token stream helpers

    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_kind(&self) -> TokenKind {
        self.peek().kind.clone()
    }

    fn current_span(&self) -> Span {
        self.peek().span
    }

    fn at_eof(&self) -> bool {
        matches!(self.peek().kind, TokenKind::Eof)
    }

    fn check(&self, kind: &TokenKind) -> bool {
        std::mem::discriminant(&self.peek().kind) == std::mem::discriminant(kind)
    }

    fn advance(&mut self) -> Token {
        let tok = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        tok
    }

    fn expect(&mut self, kind: TokenKind) -> Result<Token> {
        if self.check(&kind) {
            Ok(self.advance())
        } else {
            Err(self.error_unexpected(&kind.to_string()))
        }
    }

    fn error_unexpected(&self, expected: &str) -> ParseError {
        if self.at_eof() {
            return ParseError::new(ParseErrorKind::UnexpectedEof, self.current_span());
        }
        ParseError::new(
            ParseErrorKind::UnexpectedToken {
                expected: expected.to_string(),
                got: self.peek_kind().to_string(),
            },
            self.current_span(),
        )
    }
}

// Public convenience functions

fn tokenize(source: &str) -> Result<Vec<Token>> {
    Lexer::new(source)
        .tokenize()
        .map_err(|e| e.with_source(source))
}

/// Parse source text holding exactly one expression.
pub fn parse(source: &str) -> Result<Ast> {
    let mut parser = Parser::new(tokenize(source)?);
    parser.parse_single().map_err(|e| e.with_source(source))
}

/// Parse source text holding any number of top-level expressions.
pub fn parse_snippet(source: &str) -> Result<Vec<Ast>> {
    parse_with_positions(source).map(|(exprs, _)| exprs)
}

/// Parse a snippet and return the identifier position table with it.
pub fn parse_with_positions(source: &str) -> Result<(Vec<Ast>, PositionTable)> {
    let mut parser = Parser::new(tokenize(source)?);
    let exprs = parser.parse_snippet().map_err(|e| e.with_source(source))?;
    Ok((exprs, parser.into_positions()))
}

/// Parse pattern or template text: one expression, placeholders enabled.
pub fn parse_pattern(source: &str) -> Result<Ast> {
    let mut parser = Parser::for_pattern(tokenize(source)?);
    parser.parse_single().map_err(|e| e.with_source(source))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_expression_chain() {
        let ast = parse("a + b * c").unwrap();
        match ast {
            Ast::Expression { first, rest } => {
                assert_eq!(*first, Ast::ident("a"));
                assert_eq!(rest.len(), 2);
                assert_eq!(rest[0].op, BinOp::Add);
                assert_eq!(rest[1].op, BinOp::Mul);
                assert_eq!(rest[1].operand, Ast::ident("c"));
            }
            other => panic!("expected flat expression, got {other:?}"),
        }
    }

    #[test]
    fn grouping_is_not_a_list() {
        assert_eq!(parse("(x)").unwrap(), Ast::ident("x"));
        assert_eq!(parse("(x,)").unwrap(), Ast::List(vec![Ast::ident("x")]));
        assert_eq!(parse("()").unwrap(), Ast::List(vec![]));
    }

    #[test]
    fn unary_binds_to_operand_only() {
        let ast = parse("-a + b").unwrap();
        match ast {
            Ast::Expression { first, .. } => {
                assert!(matches!(*first, Ast::Unary { op: UnaryOp::Neg, .. }));
            }
            other => panic!("expected expression, got {other:?}"),
        }
    }

    #[test]
    fn placeholders_only_in_pattern_mode() {
        assert_eq!(parse("_1").unwrap(), Ast::ident("_1"));
        assert_eq!(parse_pattern("_1").unwrap(), Ast::placeholder(1));
        assert_eq!(
            parse_pattern("block(__1)").unwrap(),
            Ast::call(
                "block",
                vec![Ast::Placeholder(Placeholder {
                    index: 1,
                    variadic: true
                })]
            )
        );
    }

    #[test]
    fn positions_recorded_for_identifiers() {
        let (exprs, positions) = parse_with_positions("f(x,\n  y)").unwrap();
        assert_eq!(positions.len(), 3);
        let Ast::Call { name, args } = &exprs[0] else {
            panic!("expected call");
        };
        let span = positions.lookup(name.id).unwrap();
        assert_eq!((span.line, span.col), (1, 1));
        let y = args[1].as_identifier().unwrap();
        let span = positions.lookup(y.id).unwrap();
        assert_eq!((span.line, span.col), (2, 3));
    }

    #[test]
    fn snippet_with_several_expressions() {
        let exprs = parse_snippet("define(x, 1)\nx + 1").unwrap();
        assert_eq!(exprs.len(), 2);
    }

    #[test]
    fn single_rejects_trailing_tokens() {
        let err = parse("a b").unwrap_err();
        assert!(matches!(err.kind, ParseErrorKind::UnexpectedToken { .. }));
        assert_eq!(err.column(), Some(3));
    }

    #[test]
    fn missing_close_paren_reports_eof() {
        let err = parse("f(a, b").unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::UnexpectedEof);
    }

    #[test]
    fn error_carries_source_line() {
        let err = parse("f(a,\n  ) + )").unwrap_err();
        assert_eq!(err.line(), Some(2));
        assert_eq!(err.source_line.as_deref(), Some("  ) + )"));
    }
}
