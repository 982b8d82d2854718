use super::lexer::{Token, TokenKind};
use crate::config::ProtocolConfig;
use crate::error::{LiveObjError, Result};
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    /// Index into the method's parameter list.
    Param(usize),
    This,
    Member {
        base: Box<Expr>,
        name: String,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
        offset: usize,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
        offset: usize,
    },
    Conditional {
        cond: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
}

pub struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    params: &'a [String],
    /// Nodes open on the current path; bounds both parser and evaluator recursion.
    depth: usize,
}

impl<'a> Parser<'a> {
    pub fn new(tokens: Vec<Token>, params: &'a [String]) -> Self {
        Self {
            tokens,
            pos: 0,
            params,
            depth: 0,
        }
    }

    /// Parse a whole expression; trailing tokens are an error.
    pub fn parse(mut self) -> Result<Expr> {
        let expr = self.parse_expr()?;
        if self.current().kind != TokenKind::EoI {
            return Err(self.unexpected("end of expression"));
        }
        Ok(expr)
    }

    fn current(&self) -> &Token {
        // tokenize always appends EoI, so the last token is a safe fallback
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) -> Token {
        let tok = self.current().clone();
        if tok.kind != TokenKind::EoI {
            self.pos += 1;
        }
        tok
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if &self.current().kind == kind {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> Result<Token> {
        if self.current().kind == kind {
            Ok(self.advance())
        } else {
            Err(self.unexpected(what))
        }
    }

    fn unexpected(&self, expected: &str) -> LiveObjError {
        let tok = self.current();
        LiveObjError::Expression {
            message: format!("expected {}, found {:?}", expected, tok.kind),
            offset: tok.start(),
        }
    }

    fn enter(&mut self) -> Result<()> {
        if self.depth >= ProtocolConfig::MAX_EXPRESSION_DEPTH {
            return Err(LiveObjError::Expression {
                message: format!(
                    "expression nested deeper than {} levels",
                    ProtocolConfig::MAX_EXPRESSION_DEPTH
                ),
                offset: self.current().start(),
            });
        }
        self.depth += 1;
        Ok(())
    }

    /// Run `parse` one level deeper, restoring the depth whether it failed or not.
    fn nested(&mut self, parse: impl FnOnce(&mut Self) -> Result<Expr>) -> Result<Expr> {
        let base = self.depth;
        let out = self.enter().and_then(|()| parse(self));
        self.depth = base;
        out
    }

    fn parse_expr(&mut self) -> Result<Expr> {
        let cond = self.parse_or()?;
        if !self.eat(&TokenKind::Interrogation) {
            return Ok(cond);
        }
        let then = self.nested(Self::parse_expr)?;
        self.expect(TokenKind::Colon, "':'")?;
        let otherwise = self.nested(Self::parse_expr)?;
        Ok(Expr::Conditional {
            cond: Box::new(cond),
            then: Box::new(then),
            otherwise: Box::new(otherwise),
        })
    }

    /// One left-associative precedence level. Every link of the chain
    /// nests the tree one level deeper.
    fn parse_level(
        &mut self,
        next: fn(&mut Self) -> Result<Expr>,
        ops: &[(TokenKind, BinaryOp)],
    ) -> Result<Expr> {
        let base = self.depth;
        let out = self.parse_chain(next, ops);
        self.depth = base;
        out
    }

    fn parse_chain(
        &mut self,
        next: fn(&mut Self) -> Result<Expr>,
        ops: &[(TokenKind, BinaryOp)],
    ) -> Result<Expr> {
        let mut lhs = next(self)?;
        'outer: loop {
            for (kind, op) in ops {
                if &self.current().kind == kind {
                    self.enter()?;
                    let offset = self.advance().start();
                    let rhs = next(self)?;
                    lhs = Expr::Binary {
                        op: *op,
                        lhs: Box::new(lhs),
                        rhs: Box::new(rhs),
                        offset,
                    };
                    continue 'outer;
                }
            }
            return Ok(lhs);
        }
    }

    fn parse_or(&mut self) -> Result<Expr> {
        self.parse_level(Self::parse_and, &[(TokenKind::OpOr, BinaryOp::Or)])
    }

    fn parse_and(&mut self) -> Result<Expr> {
        self.parse_level(Self::parse_equality, &[(TokenKind::OpAnd, BinaryOp::And)])
    }

    fn parse_equality(&mut self) -> Result<Expr> {
        self.parse_level(
            Self::parse_comparison,
            &[
                (TokenKind::EqEq, BinaryOp::Eq),
                (TokenKind::NEq, BinaryOp::NotEq),
            ],
        )
    }

    fn parse_comparison(&mut self) -> Result<Expr> {
        self.parse_level(
            Self::parse_additive,
            &[
                (TokenKind::LAngle, BinaryOp::Lt),
                (TokenKind::LtEq, BinaryOp::LtEq),
                (TokenKind::RAngle, BinaryOp::Gt),
                (TokenKind::GtEq, BinaryOp::GtEq),
            ],
        )
    }

    fn parse_additive(&mut self) -> Result<Expr> {
        self.parse_level(
            Self::parse_factor,
            &[
                (TokenKind::Plus, BinaryOp::Add),
                (TokenKind::Minus, BinaryOp::Sub),
            ],
        )
    }

    fn parse_factor(&mut self) -> Result<Expr> {
        self.parse_level(
            Self::parse_unary,
            &[
                (TokenKind::Star, BinaryOp::Mul),
                (TokenKind::Slash, BinaryOp::Div),
                (TokenKind::Percent, BinaryOp::Rem),
            ],
        )
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        let op = match self.current().kind {
            TokenKind::Bang => UnaryOp::Not,
            TokenKind::Minus => UnaryOp::Neg,
            _ => return self.parse_postfix(),
        };
        let offset = self.advance().start();
        let operand = self.nested(Self::parse_unary)?;
        Ok(Expr::Unary {
            op,
            operand: Box::new(operand),
            offset,
        })
    }

    fn parse_postfix(&mut self) -> Result<Expr> {
        let base = self.depth;
        let out = self.parse_members();
        self.depth = base;
        out
    }

    fn parse_members(&mut self) -> Result<Expr> {
        let mut expr = self.parse_primary()?;
        while self.eat(&TokenKind::Dot) {
            self.enter()?;
            let name = match &self.current().kind {
                TokenKind::Identifier(name) => name.clone(),
                _ => return Err(self.unexpected("a property name")),
            };
            self.advance();
            expr = Expr::Member {
                base: Box::new(expr),
                name,
            };
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        let tok = self.advance();
        match tok.kind {
            TokenKind::Number(n) => Ok(Expr::Literal(Value::from_f64(n))),
            TokenKind::StringLiteral(s) => Ok(Expr::Literal(Value::String(s))),
            TokenKind::Bool(b) => Ok(Expr::Literal(Value::Bool(b))),
            TokenKind::KwNull => Ok(Expr::Literal(Value::Null)),
            TokenKind::KwThis => Ok(Expr::This),
            TokenKind::Identifier(name) => match self.params.iter().position(|p| *p == name) {
                Some(index) => Ok(Expr::Param(index)),
                None => Err(LiveObjError::Expression {
                    message: format!("unknown identifier {}", name),
                    offset: tok.span.start,
                }),
            },
            TokenKind::LParen => {
                let inner = self.nested(Self::parse_expr)?;
                self.expect(TokenKind::RParen, "')'")?;
                Ok(inner)
            }
            TokenKind::EoI => Err(LiveObjError::Expression {
                message: "unexpected end of expression".to_string(),
                offset: tok.span.start,
            }),
            other => Err(LiveObjError::Expression {
                message: format!("unexpected token {:?}", other),
                offset: tok.span.start,
            }),
        }
    }
}
