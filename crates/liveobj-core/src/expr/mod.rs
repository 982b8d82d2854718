//! Client-executable methods.
//!
//! A type can carry methods that the receiving side evaluates on its local
//! proxy without a round trip. They are written in a small expression
//! language: literals, parameters, `this.prop` and member access,
//! arithmetic, comparison, `&& || !`, and the `?:` conditional. `+`
//! concatenates when either side is a string.

mod lexer;
mod parser;

use crate::error::{LiveObjError, Result};
use crate::value::{Properties, Value};
use parser::{BinaryOp, Expr, Parser, UnaryOp};

/// A parsed client method.
#[derive(Debug, Clone)]
pub struct ClientMethod {
    args: Vec<String>,
    body: String,
    expr: Expr,
}

impl ClientMethod {
    pub fn parse(args: Vec<String>, body: &str) -> Result<Self> {
        let expr = Parser::new(lexer::tokenize(body)?, &args).parse()?;
        Ok(Self {
            args,
            body: body.to_string(),
            expr,
        })
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    /// Evaluate against a receiver snapshot. Missing arguments are `null`.
    pub fn eval(&self, this: &Properties, args: &[Value]) -> Result<Value> {
        Evaluator { this, args }.eval(&self.expr)
    }
}

struct Evaluator<'a> {
    this: &'a Properties,
    args: &'a [Value],
}

impl Evaluator<'_> {
    fn eval(&self, expr: &Expr) -> Result<Value> {
        match expr {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Param(i) => Ok(self.args.get(*i).cloned().unwrap_or_default()),
            Expr::This => Ok(Value::Map(self.this.clone())),
            Expr::Member { base, name } => match base.as_ref() {
                Expr::This => Ok(self.this.get(name).cloned().unwrap_or_default()),
                other => Ok(member(&self.eval(other)?, name)),
            },
            Expr::Unary {
                op,
                operand,
                offset,
            } => {
                let v = self.eval(operand)?;
                match op {
                    UnaryOp::Not => Ok(Value::Bool(!v.is_truthy())),
                    UnaryOp::Neg => v
                        .as_f64()
                        .map(|n| Value::from_f64(-n))
                        .ok_or_else(|| type_error("cannot negate", &v, *offset)),
                }
            }
            Expr::Binary {
                op: BinaryOp::And,
                lhs,
                rhs,
                ..
            } => {
                let l = self.eval(lhs)?;
                if l.is_truthy() {
                    self.eval(rhs)
                } else {
                    Ok(l)
                }
            }
            Expr::Binary {
                op: BinaryOp::Or,
                lhs,
                rhs,
                ..
            } => {
                let l = self.eval(lhs)?;
                if l.is_truthy() {
                    Ok(l)
                } else {
                    self.eval(rhs)
                }
            }
            Expr::Binary {
                op,
                lhs,
                rhs,
                offset,
            } => {
                let l = self.eval(lhs)?;
                let r = self.eval(rhs)?;
                binary(*op, &l, &r, *offset)
            }
            Expr::Conditional {
                cond,
                then,
                otherwise,
            } => {
                if self.eval(cond)?.is_truthy() {
                    self.eval(then)
                } else {
                    self.eval(otherwise)
                }
            }
        }
    }
}

fn member(value: &Value, name: &str) -> Value {
    match value {
        Value::Map(m) => m.get(name).cloned().unwrap_or_default(),
        Value::Object(o) => o.get(name).unwrap_or_default(),
        Value::Array(items) if name == "length" => Value::from(items.len() as u64),
        Value::String(s) if name == "length" => Value::from(s.chars().count() as u64),
        _ => Value::Null,
    }
}

fn binary(op: BinaryOp, l: &Value, r: &Value, offset: usize) -> Result<Value> {
    match op {
        BinaryOp::Add => {
            if matches!(l, Value::String(_)) || matches!(r, Value::String(_)) {
                return Ok(Value::String(format!("{}{}", l, r)));
            }
            arithmetic(l, r, offset, |a, b| Ok(a + b))
        }
        BinaryOp::Sub => arithmetic(l, r, offset, |a, b| Ok(a - b)),
        BinaryOp::Mul => arithmetic(l, r, offset, |a, b| Ok(a * b)),
        BinaryOp::Div => arithmetic(l, r, offset, |a, b| {
            if b == 0.0 {
                Err("division by zero")
            } else {
                Ok(a / b)
            }
        }),
        BinaryOp::Rem => arithmetic(l, r, offset, |a, b| {
            if b == 0.0 {
                Err("division by zero")
            } else {
                Ok(a % b)
            }
        }),
        BinaryOp::Eq => Ok(Value::Bool(l == r)),
        BinaryOp::NotEq => Ok(Value::Bool(l != r)),
        BinaryOp::Lt | BinaryOp::LtEq | BinaryOp::Gt | BinaryOp::GtEq => {
            let ordering = match (l, r) {
                (Value::String(a), Value::String(b)) => a.partial_cmp(b),
                _ => match (l.as_f64(), r.as_f64()) {
                    (Some(a), Some(b)) => a.partial_cmp(&b),
                    _ => None,
                },
            }
            .ok_or_else(|| type_error("cannot compare", l, offset))?;
            Ok(Value::Bool(match op {
                BinaryOp::Lt => ordering.is_lt(),
                BinaryOp::LtEq => ordering.is_le(),
                BinaryOp::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            }))
        }
        BinaryOp::And | BinaryOp::Or => Ok(Value::Null),
    }
}

fn arithmetic(
    l: &Value,
    r: &Value,
    offset: usize,
    f: impl Fn(f64, f64) -> std::result::Result<f64, &'static str>,
) -> Result<Value> {
    match (l.as_f64(), r.as_f64()) {
        (Some(a), Some(b)) => f(a, b)
            .map(Value::from_f64)
            .map_err(|message| LiveObjError::Expression {
                message: message.to_string(),
                offset,
            }),
        (None, _) => Err(type_error("expected a number", l, offset)),
        (_, None) => Err(type_error("expected a number", r, offset)),
    }
}

fn type_error(what: &str, value: &Value, offset: usize) -> LiveObjError {
    LiveObjError::Expression {
        message: format!("{}: {}", what, value),
        offset,
    }
}
