//! Plan-time boolean condition evaluation.
//!
//! A deliberately tiny expression interpreter: comparisons over strings,
//! numbers, and booleans joined by `AND`/`OR`/`NOT` with parentheses. There
//! are no function calls, no attribute access, no indexing, and no side
//! effects. Operands are literals or variable references resolved against
//! the [`VariableManager`].

use crate::errors::{Result, SqlFlowError};
use crate::vars::{VarValue, VariableManager};

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Str(String),
    Num(f64),
    LParen,
    RParen,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CmpOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

#[derive(Debug)]
enum Expr {
    Lit(VarValue),
    Var(String),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Cmp(CmpOp, Box<Expr>, Box<Expr>),
}

/// Evaluate a condition string against resolved variables.
pub fn evaluate(expr: &str, vars: &VariableManager) -> Result<bool> {
    let tokens = tokenize(expr)?;
    let mut parser = CondParser { tokens, pos: 0 };
    let tree = parser.parse_or()?;
    if parser.pos != parser.tokens.len() {
        return Err(SqlFlowError::Evaluation(format!(
            "unexpected trailing input in condition '{expr}'"
        )));
    }
    match eval(&tree, vars)? {
        VarValue::Bool(b) => Ok(b),
        other => Err(SqlFlowError::Evaluation(format!(
            "condition '{expr}' evaluated to non-boolean {other:?}"
        ))),
    }
}

fn tokenize(expr: &str) -> Result<Vec<Tok>> {
    let mut tokens = Vec::new();
    let mut chars = expr.char_indices().peekable();
    while let Some(&(i, c)) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Tok::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Tok::RParen);
            }
            '=' => {
                chars.next();
                match chars.peek() {
                    Some((_, '=')) => {
                        chars.next();
                        tokens.push(Tok::Eq);
                    }
                    _ => {
                        return Err(SqlFlowError::Evaluation(
                            "single '=' is not a comparison; use '=='".to_string(),
                        ))
                    }
                }
            }
            '!' => {
                chars.next();
                match chars.peek() {
                    Some((_, '=')) => {
                        chars.next();
                        tokens.push(Tok::NotEq);
                    }
                    _ => {
                        return Err(SqlFlowError::Evaluation(
                            "expected '=' after '!'".to_string(),
                        ))
                    }
                }
            }
            '<' => {
                chars.next();
                if matches!(chars.peek(), Some((_, '='))) {
                    chars.next();
                    tokens.push(Tok::LtEq);
                } else {
                    tokens.push(Tok::Lt);
                }
            }
            '>' => {
                chars.next();
                if matches!(chars.peek(), Some((_, '='))) {
                    chars.next();
                    tokens.push(Tok::GtEq);
                } else {
                    tokens.push(Tok::Gt);
                }
            }
            '\'' | '"' => {
                let quote = c;
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        None => {
                            return Err(SqlFlowError::Evaluation(format!(
                                "unterminated string literal in condition '{expr}'"
                            )))
                        }
                        Some((_, ch)) if ch == quote => break,
                        Some((_, '\\')) => {
                            if let Some((_, esc)) = chars.next() {
                                s.push(match esc {
                                    'n' => '\n',
                                    't' => '\t',
                                    other => other,
                                });
                            }
                        }
                        Some((_, ch)) => s.push(ch),
                    }
                }
                tokens.push(Tok::Str(s));
            }
            c if c.is_ascii_digit()
                || (c == '-' && !matches!(tokens.last(), Some(Tok::Num(_) | Tok::Str(_) | Tok::Ident(_) | Tok::RParen))) =>
            {
                let start = i;
                chars.next();
                while matches!(chars.peek(), Some((_, d)) if d.is_ascii_digit() || *d == '.') {
                    chars.next();
                }
                let end = chars.peek().map(|&(j, _)| j).unwrap_or(expr.len());
                let text = &expr[start..end];
                let num: f64 = text.parse().map_err(|_| {
                    SqlFlowError::Evaluation(format!("invalid numeric literal '{text}'"))
                })?;
                tokens.push(Tok::Num(num));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                chars.next();
                while matches!(chars.peek(), Some((_, d)) if d.is_ascii_alphanumeric() || *d == '_')
                {
                    chars.next();
                }
                let end = chars.peek().map(|&(j, _)| j).unwrap_or(expr.len());
                tokens.push(Tok::Ident(expr[start..end].to_string()));
            }
            other => {
                return Err(SqlFlowError::Evaluation(format!(
                    "unexpected character '{other}' in condition"
                )))
            }
        }
    }
    Ok(tokens)
}

struct CondParser {
    tokens: Vec<Tok>,
    pos: usize,
}

impl CondParser {
    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.pos)
    }

    fn keyword(&self, kw: &str) -> bool {
        matches!(self.peek(), Some(Tok::Ident(s)) if s.eq_ignore_ascii_case(kw))
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_and()?;
        while self.keyword("OR") {
            self.pos += 1;
            let rhs = self.parse_and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_not()?;
        while self.keyword("AND") {
            self.pos += 1;
            let rhs = self.parse_not()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_not(&mut self) -> Result<Expr> {
        if self.keyword("NOT") {
            self.pos += 1;
            return Ok(Expr::Not(Box::new(self.parse_not()?)));
        }
        self.parse_cmp()
    }

    fn parse_cmp(&mut self) -> Result<Expr> {
        let lhs = self.parse_primary()?;
        let op = match self.peek() {
            Some(Tok::Eq) => CmpOp::Eq,
            Some(Tok::NotEq) => CmpOp::NotEq,
            Some(Tok::Lt) => CmpOp::Lt,
            Some(Tok::LtEq) => CmpOp::LtEq,
            Some(Tok::Gt) => CmpOp::Gt,
            Some(Tok::GtEq) => CmpOp::GtEq,
            _ => return Ok(lhs),
        };
        self.pos += 1;
        let rhs = self.parse_primary()?;
        Ok(Expr::Cmp(op, Box::new(lhs), Box::new(rhs)))
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        match self.peek().cloned() {
            Some(Tok::LParen) => {
                self.pos += 1;
                let inner = self.parse_or()?;
                match self.peek() {
                    Some(Tok::RParen) => {
                        self.pos += 1;
                        Ok(inner)
                    }
                    _ => Err(SqlFlowError::Evaluation(
                        "missing ')' in condition".to_string(),
                    )),
                }
            }
            Some(Tok::Str(s)) => {
                self.pos += 1;
                Ok(Expr::Lit(VarValue::Str(s)))
            }
            Some(Tok::Num(n)) => {
                self.pos += 1;
                Ok(Expr::Lit(VarValue::Num(n)))
            }
            Some(Tok::Ident(name)) => {
                self.pos += 1;
                if name.eq_ignore_ascii_case("true") {
                    Ok(Expr::Lit(VarValue::Bool(true)))
                } else if name.eq_ignore_ascii_case("false") {
                    Ok(Expr::Lit(VarValue::Bool(false)))
                } else {
                    Ok(Expr::Var(name))
                }
            }
            other => Err(SqlFlowError::Evaluation(format!(
                "expected a value in condition, found {other:?}"
            ))),
        }
    }
}

fn eval(expr: &Expr, vars: &VariableManager) -> Result<VarValue> {
    match expr {
        Expr::Lit(v) => Ok(v.clone()),
        Expr::Var(name) => vars.get(name).cloned().ok_or_else(|| {
            SqlFlowError::Evaluation(format!("unknown variable '{name}' in condition"))
        }),
        Expr::Not(inner) => match eval(inner, vars)? {
            VarValue::Bool(b) => Ok(VarValue::Bool(!b)),
            other => Err(SqlFlowError::Evaluation(format!(
                "NOT applied to non-boolean {other:?}"
            ))),
        },
        Expr::And(lhs, rhs) => {
            // Short-circuit: the right side is not evaluated when the left decides.
            match eval(lhs, vars)? {
                VarValue::Bool(false) => Ok(VarValue::Bool(false)),
                VarValue::Bool(true) => match eval(rhs, vars)? {
                    VarValue::Bool(b) => Ok(VarValue::Bool(b)),
                    other => Err(SqlFlowError::Evaluation(format!(
                        "AND applied to non-boolean {other:?}"
                    ))),
                },
                other => Err(SqlFlowError::Evaluation(format!(
                    "AND applied to non-boolean {other:?}"
                ))),
            }
        }
        Expr::Or(lhs, rhs) => match eval(lhs, vars)? {
            VarValue::Bool(true) => Ok(VarValue::Bool(true)),
            VarValue::Bool(false) => match eval(rhs, vars)? {
                VarValue::Bool(b) => Ok(VarValue::Bool(b)),
                other => Err(SqlFlowError::Evaluation(format!(
                    "OR applied to non-boolean {other:?}"
                ))),
            },
            other => Err(SqlFlowError::Evaluation(format!(
                "OR applied to non-boolean {other:?}"
            ))),
        },
        Expr::Cmp(op, lhs, rhs) => {
            let lhs = eval(lhs, vars)?;
            let rhs = eval(rhs, vars)?;
            compare(*op, &lhs, &rhs)
        }
    }
}

fn compare(op: CmpOp, lhs: &VarValue, rhs: &VarValue) -> Result<VarValue> {
    use std::cmp::Ordering;
    let ordering = match (lhs, rhs) {
        (VarValue::Str(a), VarValue::Str(b)) => a.cmp(b),
        (VarValue::Num(a), VarValue::Num(b)) => a.partial_cmp(b).ok_or_else(|| {
            SqlFlowError::Evaluation("NaN is not comparable in conditions".to_string())
        })?,
        (VarValue::Bool(a), VarValue::Bool(b)) => match op {
            CmpOp::Eq => return Ok(VarValue::Bool(a == b)),
            CmpOp::NotEq => return Ok(VarValue::Bool(a != b)),
            _ => {
                return Err(SqlFlowError::Evaluation(
                    "booleans only support == and !=".to_string(),
                ))
            }
        },
        (a, b) => {
            return Err(SqlFlowError::Evaluation(format!(
                "cannot compare {} with {}",
                type_name(a),
                type_name(b)
            )))
        }
    };
    let result = match op {
        CmpOp::Eq => ordering == Ordering::Equal,
        CmpOp::NotEq => ordering != Ordering::Equal,
        CmpOp::Lt => ordering == Ordering::Less,
        CmpOp::LtEq => ordering != Ordering::Greater,
        CmpOp::Gt => ordering == Ordering::Greater,
        CmpOp::GtEq => ordering != Ordering::Less,
    };
    Ok(VarValue::Bool(result))
}

fn type_name(v: &VarValue) -> &'static str {
    match v {
        VarValue::Str(_) => "string",
        VarValue::Num(_) => "number",
        VarValue::Bool(_) => "boolean",
    }
}
