//! Precedence-climbing parser for calcql expressions.

use crate::ast::{BinaryOp, Expr, ExprKind, Literal, UnaryOp};
use crate::error::CompileError;
use crate::lexer::Lexer;
use crate::token::{Token, TokenKind};
use calcql_core::Span;

/// Parser for expression sources.
pub struct Parser<'a> {
    lexer: Lexer<'a>,
    source: &'a str,
    current: Token,
}

/// Parses an expression source into an AST.
pub fn parse(source: &str) -> Result<Expr, CompileError> {
    let mut parser = Parser::new(source);
    let expr = parser.parse_expression()?;
    if !parser.at_kind(TokenKind::Eof) {
        return Err(parser.error(format!(
            "unexpected `{}` after end of expression",
            parser.current_text()
        )));
    }
    Ok(expr)
}

impl<'a> Parser<'a> {
    /// Creates a new parser.
    pub fn new(source: &'a str) -> Self {
        let mut lexer = Lexer::new(source);
        let current = lexer.next_token();
        Self {
            lexer,
            source,
            current,
        }
    }

    /// Returns the current token kind.
    #[inline]
    fn at(&self) -> TokenKind {
        self.current.kind
    }

    /// Returns true if at the given kind.
    #[inline]
    fn at_kind(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    /// Advances to the next token, returning the consumed one.
    fn advance(&mut self) -> Token {
        std::mem::replace(&mut self.current, self.lexer.next_token())
    }

    /// Expects a specific token kind.
    fn expect(&mut self, kind: TokenKind) -> Result<Token, CompileError> {
        if self.at_kind(kind) {
            Ok(self.advance())
        } else {
            Err(self.error(format!("expected `{}`, found {}", kind, self.describe_current())))
        }
    }

    /// Gets the text of the current token.
    fn current_text(&self) -> &'a str {
        self.lexer.span_text(self.current.span)
    }

    fn describe_current(&self) -> String {
        if self.at_kind(TokenKind::Eof) {
            "end of expression".to_string()
        } else {
            format!("`{}`", self.current_text())
        }
    }

    /// Builds an error at the current token.
    fn error(&self, message: impl Into<String>) -> CompileError {
        CompileError::new(message, self.source, self.current.span)
    }

    /// Parses a full expression, including the conditional operator.
    pub fn parse_expression(&mut self) -> Result<Expr, CompileError> {
        let condition = self.parse_binary(0)?;
        if !self.at_kind(TokenKind::Question) {
            return Ok(condition);
        }
        self.advance();
        let then = self.parse_expression()?;
        self.expect(TokenKind::Colon)?;
        let otherwise = self.parse_expression()?;
        let span = condition.span.merge(otherwise.span);
        Ok(Expr::new(
            ExprKind::Conditional {
                condition: Box::new(condition),
                then: Box::new(then),
                otherwise: Box::new(otherwise),
            },
            span,
        ))
    }

    /// Parses infix operators binding tighter than `min_precedence`.
    fn parse_binary(&mut self, min_precedence: u8) -> Result<Expr, CompileError> {
        let mut lhs = self.parse_unary()?;

        while let Some(op) = binary_op(self.at()) {
            if op.precedence() <= min_precedence {
                break;
            }
            self.advance();
            let rhs = self.parse_binary(op.precedence())?;
            let span = lhs.span.merge(rhs.span);
            lhs = Expr::new(
                ExprKind::Binary {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                span,
            );
        }

        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, CompileError> {
        let op = match self.at() {
            TokenKind::Bang => UnaryOp::Not,
            TokenKind::Minus => UnaryOp::Neg,
            _ => return self.parse_postfix(),
        };
        let start = self.advance().span;
        let operand = self.parse_unary()?;
        let span = start.merge(operand.span);
        Ok(Expr::new(
            ExprKind::Unary {
                op,
                operand: Box::new(operand),
            },
            span,
        ))
    }

    fn parse_postfix(&mut self) -> Result<Expr, CompileError> {
        let mut expr = self.parse_primary()?;

        loop {
            match self.at() {
                TokenKind::Dot => {
                    self.advance();
                    let property = self.expect(TokenKind::Ident)?;
                    let span = expr.span.merge(property.span);
                    expr = Expr::new(
                        ExprKind::Member {
                            object: Box::new(expr),
                            property: self.lexer.span_text(property.span).to_string(),
                        },
                        span,
                    );
                }
                TokenKind::LBracket => {
                    self.advance();
                    let index = self.parse_expression()?;
                    let close = self.expect(TokenKind::RBracket)?;
                    let span = expr.span.merge(close.span);
                    expr = Expr::new(
                        ExprKind::Index {
                            object: Box::new(expr),
                            index: Box::new(index),
                        },
                        span,
                    );
                }
                _ => return Ok(expr),
            }
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, CompileError> {
        let token = self.current;
        let text = self.current_text();

        let kind = match token.kind {
            TokenKind::Null => ExprKind::Literal(Literal::Null),
            TokenKind::True => ExprKind::Literal(Literal::Bool(true)),
            TokenKind::False => ExprKind::Literal(Literal::Bool(false)),
            TokenKind::IntLiteral => match text.parse::<i64>() {
                Ok(value) => ExprKind::Literal(Literal::Int(value)),
                Err(_) => return Err(self.error("integer literal out of range")),
            },
            TokenKind::FloatLiteral => match text.parse::<f64>() {
                Ok(value) => ExprKind::Literal(Literal::Float(value)),
                Err(_) => return Err(self.error("invalid float literal")),
            },
            TokenKind::StringLiteral => ExprKind::Literal(Literal::String(unescape(text))),
            TokenKind::Ident => {
                self.advance();
                if self.at_kind(TokenKind::LParen) {
                    return self.parse_call(text, token.span);
                }
                return Ok(Expr::new(ExprKind::Variable(text.to_string()), token.span));
            }
            TokenKind::LParen => {
                self.advance();
                let inner = self.parse_expression()?;
                self.expect(TokenKind::RParen)?;
                return Ok(inner);
            }
            TokenKind::LBracket => {
                self.advance();
                let items = self.parse_list_items(TokenKind::RBracket)?;
                let close = self.expect(TokenKind::RBracket)?;
                return Ok(Expr::new(ExprKind::List(items), token.span.merge(close.span)));
            }
            TokenKind::Error => {
                return Err(self.error(format!("unrecognized input `{text}`")));
            }
            _ => {
                return Err(self.error(format!(
                    "expected an expression, found {}",
                    self.describe_current()
                )));
            }
        };

        self.advance();
        Ok(Expr::new(kind, token.span))
    }

    fn parse_call(&mut self, function: &str, start: Span) -> Result<Expr, CompileError> {
        self.expect(TokenKind::LParen)?;
        let args = self.parse_list_items(TokenKind::RParen)?;
        let close = self.expect(TokenKind::RParen)?;
        Ok(Expr::new(
            ExprKind::Call {
                function: function.to_string(),
                args,
            },
            start.merge(close.span),
        ))
    }

    /// Parses comma separated expressions up to (not including) `close`.
    fn parse_list_items(&mut self, close: TokenKind) -> Result<Vec<Expr>, CompileError> {
        let mut items = Vec::new();
        while !self.at_kind(close) {
            items.push(self.parse_expression()?);
            if !self.at_kind(TokenKind::Comma) {
                break;
            }
            self.advance();
        }
        Ok(items)
    }
}

fn binary_op(kind: TokenKind) -> Option<BinaryOp> {
    Some(match kind {
        TokenKind::Star => BinaryOp::Mul,
        TokenKind::Slash => BinaryOp::Div,
        TokenKind::Percent => BinaryOp::Rem,
        TokenKind::Plus => BinaryOp::Add,
        TokenKind::Minus => BinaryOp::Sub,
        TokenKind::Lt => BinaryOp::Lt,
        TokenKind::LtEq => BinaryOp::LtEq,
        TokenKind::Gt => BinaryOp::Gt,
        TokenKind::GtEq => BinaryOp::GtEq,
        TokenKind::EqEq => BinaryOp::Eq,
        TokenKind::BangEq => BinaryOp::NotEq,
        TokenKind::AmpAmp => BinaryOp::And,
        TokenKind::PipePipe => BinaryOp::Or,
        _ => return None,
    })
}

/// Strips the quotes of a string literal and resolves escapes.
fn unescape(literal: &str) -> String {
    let inner = &literal[1..literal.len() - 1];
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binary(expr: &Expr) -> (BinaryOp, &Expr, &Expr) {
        match &expr.kind {
            ExprKind::Binary { op, lhs, rhs } => (*op, lhs, rhs),
            other => panic!("expected binary, got {other:?}"),
        }
    }

    #[test]
    fn test_precedence() {
        let expr = parse("a + b * 2").unwrap();
        let (op, _, rhs) = binary(&expr);
        assert_eq!(op, BinaryOp::Add);
        assert_eq!(binary(rhs).0, BinaryOp::Mul);
    }

    #[test]
    fn test_left_associativity() {
        let expr = parse("10 - 4 - 3").unwrap();
        let (op, lhs, _) = binary(&expr);
        assert_eq!(op, BinaryOp::Sub);
        assert_eq!(binary(lhs).0, BinaryOp::Sub);
    }

    #[test]
    fn test_member_index_and_call() {
        let expr = parse("size(user.items[0].tags)").unwrap();
        let ExprKind::Call { function, args } = &expr.kind else {
            panic!("expected call");
        };
        assert_eq!(function, "size");
        assert!(matches!(args[0].kind, ExprKind::Member { .. }));
        assert_eq!(expr.free_variables().into_iter().collect::<Vec<_>>(), vec!["user"]);
    }

    #[test]
    fn test_conditional_and_strings() {
        let expr = parse(r#"ok ? 'yes' : "n\"o""#).unwrap();
        let ExprKind::Conditional { otherwise, .. } = &expr.kind else {
            panic!("expected conditional");
        };
        assert_eq!(
            otherwise.kind,
            ExprKind::Literal(Literal::String("n\"o".to_string()))
        );
    }

    #[test]
    fn test_free_variables() {
        let expr = parse("[ele.id, itemIds[0], max(a, 3)]").unwrap();
        let names: Vec<_> = expr.free_variables().into_iter().collect();
        assert_eq!(names, vec!["a", "ele", "itemIds"]);
    }

    #[test]
    fn test_errors_carry_span() {
        let err = parse("a + ").unwrap_err();
        assert!(err.message.contains("expected an expression"));
        assert_eq!(err.span(), Span::empty(4));

        let err = parse("a b").unwrap_err();
        assert!(err.message.contains("after end of expression"));
        assert_eq!(err.span(), Span::new(2, 3));

        assert!(parse("(a").is_err());
        assert!(parse("a = b").is_err());
    }
}
