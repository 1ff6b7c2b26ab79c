//! Recursive-descent parser.
//!
//! Precedence, loosest first:
//!
//! ```text
//! conditional   test ? a : b
//! or            ||
//! and           &&
//! equality      === !== == !=
//! comparison    < > <= >=
//! additive      + -
//! multiplicative * / %
//! unary         ! - +
//! postfix       .name  [expr]  (args)
//! primary       literal | identifier | slot | ( expr ) | [ a, b ]
//! ```

use crate::ast::{BinaryOp, Expr, LogicalOp, UnaryOp};
use crate::error::{EvalError, Result};
use crate::lexer::{Token, TokenKind, tokenize};
use crate::value::Value;

/// Maximum nesting depth accepted by the parser.
const MAX_DEPTH: usize = 64;

/// Tokenize and parse a complete expression.
pub fn parse_expression(source: &str) -> Result<Expr> {
    let tokens = tokenize(source)?;
    Parser::new(tokens).parse()
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            pos: 0,
            depth: 0,
        }
    }

    fn parse(mut self) -> Result<Expr> {
        if self.check(&TokenKind::Eof) {
            return Err(EvalError::syntax(0, "empty expression"));
        }
        let expr = self.conditional()?;
        if !self.check(&TokenKind::Eof) {
            let tok = self.peek();
            return Err(EvalError::syntax(
                tok.pos,
                format!("unexpected token {:?}", tok.kind),
            ));
        }
        Ok(expr)
    }

    // -- Token helpers -------------------------------------------------------

    fn peek(&self) -> &Token {
        // The token stream always ends with Eof, and `advance` never moves
        // past it.
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn check(&self, kind: &TokenKind) -> bool {
        &self.peek().kind == kind
    }

    fn advance(&mut self) -> Token {
        let tok = self.peek().clone();
        if tok.kind != TokenKind::Eof {
            self.pos += 1;
        }
        tok
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: &TokenKind, what: &str) -> Result<()> {
        if self.eat(kind) {
            Ok(())
        } else {
            let tok = self.peek();
            Err(EvalError::syntax(
                tok.pos,
                format!("expected {what}, found {:?}", tok.kind),
            ))
        }
    }

    fn enter(&mut self) -> Result<()> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(EvalError::syntax(self.peek().pos, "expression nested too deeply"));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    // -- Grammar -------------------------------------------------------------

    fn conditional(&mut self) -> Result<Expr> {
        self.enter()?;
        let test = self.or()?;
        let expr = if self.eat(&TokenKind::Question) {
            let consequent = self.conditional()?;
            self.expect(&TokenKind::Colon, "`:` in conditional")?;
            let alternate = self.conditional()?;
            Expr::Conditional {
                test: Box::new(test),
                consequent: Box::new(consequent),
                alternate: Box::new(alternate),
            }
        } else {
            test
        };
        self.leave();
        Ok(expr)
    }

    fn or(&mut self) -> Result<Expr> {
        let mut left = self.and()?;
        while self.eat(&TokenKind::OrOr) {
            let right = self.and()?;
            left = Expr::Logical {
                op: LogicalOp::Or,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr> {
        let mut left = self.equality()?;
        while self.eat(&TokenKind::AndAnd) {
            let right = self.equality()?;
            left = Expr::Logical {
                op: LogicalOp::And,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn equality(&mut self) -> Result<Expr> {
        let mut left = self.comparison()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::EqEqEq => BinaryOp::StrictEq,
                TokenKind::NotEqEq => BinaryOp::StrictNotEq,
                TokenKind::EqEq => BinaryOp::LooseEq,
                TokenKind::NotEq => BinaryOp::LooseNotEq,
                _ => break,
            };
            self.advance();
            let right = self.comparison()?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn comparison(&mut self) -> Result<Expr> {
        let mut left = self.additive()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Lt => BinaryOp::Lt,
                TokenKind::Gt => BinaryOp::Gt,
                TokenKind::LtEq => BinaryOp::LtEq,
                TokenKind::GtEq => BinaryOp::GtEq,
                _ => break,
            };
            self.advance();
            let right = self.additive()?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn additive(&mut self) -> Result<Expr> {
        let mut left = self.multiplicative()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Plus => BinaryOp::Add,
                TokenKind::Minus => BinaryOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.multiplicative()?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn multiplicative(&mut self) -> Result<Expr> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Star => BinaryOp::Mul,
                TokenKind::Slash => BinaryOp::Div,
                TokenKind::Percent => BinaryOp::Rem,
                _ => break,
            };
            self.advance();
            let right = self.unary()?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr> {
        let op = match self.peek().kind {
            TokenKind::Bang => UnaryOp::Not,
            TokenKind::Minus => UnaryOp::Neg,
            TokenKind::Plus => UnaryOp::Plus,
            _ => return self.postfix(),
        };
        self.advance();
        self.enter()?;
        let operand = self.unary()?;
        self.leave();
        Ok(Expr::Unary {
            op,
            operand: Box::new(operand),
        })
    }

    fn postfix(&mut self) -> Result<Expr> {
        let mut expr = self.primary()?;
        loop {
            if self.eat(&TokenKind::Dot) {
                let tok = self.advance();
                let property = match tok.kind {
                    TokenKind::Ident(name) => name,
                    // Keywords are valid property names (`obj.null` etc.).
                    TokenKind::True => "true".into(),
                    TokenKind::False => "false".into(),
                    TokenKind::Null => "null".into(),
                    TokenKind::Undefined => "undefined".into(),
                    other => {
                        return Err(EvalError::syntax(
                            tok.pos,
                            format!("expected property name after `.`, found {other:?}"),
                        ));
                    }
                };
                expr = Expr::Member {
                    object: Box::new(expr),
                    property,
                };
            } else if self.eat(&TokenKind::LBracket) {
                let index = self.conditional()?;
                self.expect(&TokenKind::RBracket, "`]`")?;
                expr = Expr::Index {
                    object: Box::new(expr),
                    index: Box::new(index),
                };
            } else if self.eat(&TokenKind::LParen) {
                let args = self.arguments(&TokenKind::RParen)?;
                expr = Expr::Call {
                    callee: Box::new(expr),
                    args,
                };
            } else {
                return Ok(expr);
            }
        }
    }

    fn arguments(&mut self, close: &TokenKind) -> Result<Vec<Expr>> {
        let mut args = Vec::new();
        if self.eat(close) {
            return Ok(args);
        }
        loop {
            args.push(self.conditional()?);
            if self.eat(close) {
                return Ok(args);
            }
            self.expect(&TokenKind::Comma, "`,`")?;
        }
    }

    fn primary(&mut self) -> Result<Expr> {
        let tok = self.advance();
        let expr = match tok.kind {
            TokenKind::Number(n) => Expr::Literal(Value::Number(n)),
            TokenKind::Str(s) => Expr::Literal(Value::String(s)),
            TokenKind::True => Expr::Literal(Value::Bool(true)),
            TokenKind::False => Expr::Literal(Value::Bool(false)),
            TokenKind::Null => Expr::Literal(Value::Null),
            TokenKind::Undefined => Expr::Literal(Value::Undefined),
            TokenKind::Slot(i) => Expr::Slot(i),
            TokenKind::Ident(name) => Expr::Ident(name),
            TokenKind::LParen => {
                let inner = self.conditional()?;
                self.expect(&TokenKind::RParen, "`)`")?;
                inner
            }
            TokenKind::LBracket => {
                self.enter()?;
                let items = self.arguments(&TokenKind::RBracket)?;
                self.leave();
                Expr::Array(items)
            }
            TokenKind::Eof => {
                return Err(EvalError::syntax(tok.pos, "unexpected end of expression"));
            }
            other => {
                return Err(EvalError::syntax(tok.pos, format!("unexpected token {other:?}")));
            }
        };
        Ok(expr)
    }
}

fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
    Expr::Binary {
        op,
        left: Box::new(left),
        right: Box::new(right),
    }
}
