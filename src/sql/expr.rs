//   Copyright (c) 2024-2026 Anton Kundenko <singaraiona@gmail.com>
//   All rights reserved.
//
//   Permission is hereby granted, free of charge, to any person obtaining a copy
//   of this software and associated documentation files (the "Software"), to deal
//   in the Software without restriction, including without limitation the rights
//   to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
//   copies of the Software, and to permit persons to whom the Software is
//   furnished to do so, subject to the following conditions:
//
//   The above copyright notice and this permission notice shall be included in all
//   copies or substantial portions of the Software.
//
//   THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
//   IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
//   FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
//   AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
//   LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
//   OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
//   SOFTWARE.

// Scalar expression compiler: translates sqlparser AST expressions into
// compiled expressions evaluable against a row and positional parameters.

use std::collections::HashMap;

use sqlparser::ast::{
    BinaryOperator, Expr, Function, FunctionArg, FunctionArgExpr, FunctionArguments,
    UnaryOperator, Value,
};

use crate::model::SqlValue;
use crate::sql::plan::EvaluationContext;
use crate::sql::PlannerError;

// ---------------------------------------------------------------------------
// Compiled expressions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarFunc {
    Lower,
    Upper,
    Abs,
    Coalesce,
    CurrentTimestamp,
}

/// An opaque, immutable, evaluable function of a row and the statement
/// parameters.
#[derive(Debug, Clone)]
pub enum CompiledExpr {
    Constant(SqlValue),
    /// Positional statement parameter (0-based).
    Parameter(usize),
    /// Input row field by position.
    Field(usize),
    Binary {
        op: BinOp,
        left: Box<CompiledExpr>,
        right: Box<CompiledExpr>,
    },
    Unary {
        op: UnOp,
        expr: Box<CompiledExpr>,
    },
    IsNull {
        expr: Box<CompiledExpr>,
        negated: bool,
    },
    InList {
        expr: Box<CompiledExpr>,
        list: Vec<CompiledExpr>,
        negated: bool,
    },
    Like {
        expr: Box<CompiledExpr>,
        pattern: Box<CompiledExpr>,
        negated: bool,
    },
    Case {
        operand: Option<Box<CompiledExpr>>,
        branches: Vec<(CompiledExpr, CompiledExpr)>,
        otherwise: Option<Box<CompiledExpr>>,
    },
    Function {
        func: ScalarFunc,
        args: Vec<CompiledExpr>,
    },
}

/// Errors raised while evaluating a compiled expression.
#[derive(Debug)]
pub enum EvalError {
    TypeMismatch(String),
    MissingParameter(usize),
    MissingField(usize),
    DivisionByZero,
}

impl std::fmt::Display for EvalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EvalError::TypeMismatch(msg) => write!(f, "type mismatch: {msg}"),
            EvalError::MissingParameter(i) => write!(f, "missing statement parameter #{}", i + 1),
            EvalError::MissingField(i) => write!(f, "row has no field #{i}"),
            EvalError::DivisionByZero => f.write_str("division by zero"),
        }
    }
}

impl std::error::Error for EvalError {}

impl CompiledExpr {
    /// Evaluate against one input row and the statement parameters.
    pub fn evaluate(
        &self,
        row: &[SqlValue],
        ctx: &EvaluationContext,
    ) -> Result<SqlValue, EvalError> {
        match self {
            CompiledExpr::Constant(v) => Ok(v.clone()),
            CompiledExpr::Parameter(i) => ctx
                .params
                .get(*i)
                .cloned()
                .ok_or(EvalError::MissingParameter(*i)),
            CompiledExpr::Field(i) => row.get(*i).cloned().ok_or(EvalError::MissingField(*i)),
            CompiledExpr::Binary { op, left, right } => {
                let l = left.evaluate(row, ctx)?;
                // AND/OR short-circuit on a decided boolean left operand.
                match (op, &l) {
                    (BinOp::And, SqlValue::Boolean(false)) => {
                        return Ok(SqlValue::Boolean(false))
                    }
                    (BinOp::Or, SqlValue::Boolean(true)) => return Ok(SqlValue::Boolean(true)),
                    _ => {}
                }
                let r = right.evaluate(row, ctx)?;
                eval_binary(*op, l, r)
            }
            CompiledExpr::Unary { op, expr } => {
                let v = expr.evaluate(row, ctx)?;
                match op {
                    UnOp::Not => match v {
                        SqlValue::Null => Ok(SqlValue::Null),
                        SqlValue::Boolean(b) => Ok(SqlValue::Boolean(!b)),
                        other => Err(EvalError::TypeMismatch(format!("NOT {other}"))),
                    },
                    UnOp::Neg => match v {
                        SqlValue::Null => Ok(SqlValue::Null),
                        SqlValue::Integer(i) => Ok(SqlValue::Integer(-i)),
                        SqlValue::Long(i) => Ok(SqlValue::Long(-i)),
                        SqlValue::Double(d) => Ok(SqlValue::Double(-d)),
                        other => Err(EvalError::TypeMismatch(format!("-{other}"))),
                    },
                }
            }
            CompiledExpr::IsNull { expr, negated } => {
                let v = expr.evaluate(row, ctx)?;
                Ok(SqlValue::Boolean(v.is_null() != *negated))
            }
            CompiledExpr::InList {
                expr,
                list,
                negated,
            } => {
                let v = expr.evaluate(row, ctx)?;
                if v.is_null() {
                    return Ok(SqlValue::Null);
                }
                let mut found = false;
                for item in list {
                    let candidate = item.evaluate(row, ctx)?;
                    if values_equal(&v, &candidate) {
                        found = true;
                        break;
                    }
                }
                Ok(SqlValue::Boolean(found != *negated))
            }
            CompiledExpr::Like {
                expr,
                pattern,
                negated,
            } => {
                let v = expr.evaluate(row, ctx)?;
                let p = pattern.evaluate(row, ctx)?;
                match (v, p) {
                    (SqlValue::Null, _) | (_, SqlValue::Null) => Ok(SqlValue::Null),
                    (SqlValue::String(s), SqlValue::String(pat)) => {
                        Ok(SqlValue::Boolean(like_match(&s, &pat) != *negated))
                    }
                    (a, b) => Err(EvalError::TypeMismatch(format!("{a} LIKE {b}"))),
                }
            }
            CompiledExpr::Case {
                operand,
                branches,
                otherwise,
            } => {
                let base = match operand {
                    Some(op) => Some(op.evaluate(row, ctx)?),
                    None => None,
                };
                for (cond, result) in branches {
                    let c = cond.evaluate(row, ctx)?;
                    let hit = match &base {
                        Some(b) => values_equal(b, &c),
                        None => c.is_true(),
                    };
                    if hit {
                        return result.evaluate(row, ctx);
                    }
                }
                match otherwise {
                    Some(e) => e.evaluate(row, ctx),
                    None => Ok(SqlValue::Null),
                }
            }
            CompiledExpr::Function { func, args } => eval_function(*func, args, row, ctx),
        }
    }
}

fn eval_binary(op: BinOp, l: SqlValue, r: SqlValue) -> Result<SqlValue, EvalError> {
    use BinOp::*;
    match op {
        And | Or => {
            let lb = bool_or_null(&l)?;
            let rb = bool_or_null(&r)?;
            Ok(match (op, lb, rb) {
                (And, Some(a), Some(b)) => SqlValue::Boolean(a && b),
                (And, Some(false), _) | (And, _, Some(false)) => SqlValue::Boolean(false),
                (Or, Some(a), Some(b)) => SqlValue::Boolean(a || b),
                (Or, Some(true), _) | (Or, _, Some(true)) => SqlValue::Boolean(true),
                _ => SqlValue::Null,
            })
        }
        Eq | NotEq | Lt | LtEq | Gt | GtEq => {
            if l.is_null() || r.is_null() {
                return Ok(SqlValue::Null);
            }
            let ord = compare_for_eval(&l, &r)?;
            let b = match op {
                Eq => ord == std::cmp::Ordering::Equal,
                NotEq => ord != std::cmp::Ordering::Equal,
                Lt => ord == std::cmp::Ordering::Less,
                LtEq => ord != std::cmp::Ordering::Greater,
                Gt => ord == std::cmp::Ordering::Greater,
                GtEq => ord != std::cmp::Ordering::Less,
                _ => unreachable!(),
            };
            Ok(SqlValue::Boolean(b))
        }
        Add | Sub | Mul | Div | Mod => {
            if l.is_null() || r.is_null() {
                return Ok(SqlValue::Null);
            }
            numeric_binary(op, &l, &r)
        }
    }
}

fn bool_or_null(v: &SqlValue) -> Result<Option<bool>, EvalError> {
    match v {
        SqlValue::Null => Ok(None),
        SqlValue::Boolean(b) => Ok(Some(*b)),
        other => Err(EvalError::TypeMismatch(format!(
            "expected boolean, got {other}"
        ))),
    }
}

fn compare_for_eval(l: &SqlValue, r: &SqlValue) -> Result<std::cmp::Ordering, EvalError> {
    use SqlValue::*;
    match (l, r) {
        (String(a), String(b)) => Ok(a.cmp(b)),
        (Boolean(a), Boolean(b)) => Ok(a.cmp(b)),
        (Bytes(a), Bytes(b)) => Ok(a.cmp(b)),
        (a, b) => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x
                .partial_cmp(&y)
                .ok_or_else(|| EvalError::TypeMismatch("NaN comparison".into())),
            _ => Err(EvalError::TypeMismatch(format!("{a} <=> {b}"))),
        },
    }
}

fn values_equal(l: &SqlValue, r: &SqlValue) -> bool {
    matches!(compare_for_eval(l, r), Ok(std::cmp::Ordering::Equal))
}

fn numeric_binary(op: BinOp, l: &SqlValue, r: &SqlValue) -> Result<SqlValue, EvalError> {
    use BinOp::*;
    let integral = l.as_i64().is_some() && r.as_i64().is_some();
    if integral {
        let (a, b) = (l.as_i64().unwrap(), r.as_i64().unwrap());
        let v = match op {
            Add => a.wrapping_add(b),
            Sub => a.wrapping_sub(b),
            Mul => a.wrapping_mul(b),
            Div => {
                if b == 0 {
                    return Err(EvalError::DivisionByZero);
                }
                a / b
            }
            Mod => {
                if b == 0 {
                    return Err(EvalError::DivisionByZero);
                }
                a % b
            }
            _ => unreachable!(),
        };
        return Ok(SqlValue::Long(v));
    }
    match (l.as_f64(), r.as_f64()) {
        (Some(a), Some(b)) => {
            let v = match op {
                Add => a + b,
                Sub => a - b,
                Mul => a * b,
                Div => {
                    if b == 0.0 {
                        return Err(EvalError::DivisionByZero);
                    }
                    a / b
                }
                Mod => a % b,
                _ => unreachable!(),
            };
            Ok(SqlValue::Double(v))
        }
        _ => Err(EvalError::TypeMismatch(format!("{l} {op:?} {r}"))),
    }
}

fn eval_function(
    func: ScalarFunc,
    args: &[CompiledExpr],
    row: &[SqlValue],
    ctx: &EvaluationContext,
) -> Result<SqlValue, EvalError> {
    match func {
        ScalarFunc::CurrentTimestamp => {
            let millis = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_millis() as i64)
                .unwrap_or(0);
            Ok(SqlValue::Timestamp(millis))
        }
        ScalarFunc::Coalesce => {
            for arg in args {
                let v = arg.evaluate(row, ctx)?;
                if !v.is_null() {
                    return Ok(v);
                }
            }
            Ok(SqlValue::Null)
        }
        ScalarFunc::Lower | ScalarFunc::Upper => {
            let v = args[0].evaluate(row, ctx)?;
            match v {
                SqlValue::Null => Ok(SqlValue::Null),
                SqlValue::String(s) => Ok(SqlValue::String(if func == ScalarFunc::Lower {
                    s.to_lowercase()
                } else {
                    s.to_uppercase()
                })),
                other => Err(EvalError::TypeMismatch(format!("lower/upper on {other}"))),
            }
        }
        ScalarFunc::Abs => {
            let v = args[0].evaluate(row, ctx)?;
            match v {
                SqlValue::Null => Ok(SqlValue::Null),
                SqlValue::Integer(i) => Ok(SqlValue::Integer(i.abs())),
                SqlValue::Long(i) => Ok(SqlValue::Long(i.abs())),
                SqlValue::Double(d) => Ok(SqlValue::Double(d.abs())),
                other => Err(EvalError::TypeMismatch(format!("abs on {other}"))),
            }
        }
    }
}

/// SQL LIKE matcher: `%` matches any run, `_` matches one character.
fn like_match(s: &str, pattern: &str) -> bool {
    fn rec(s: &[char], p: &[char]) -> bool {
        match p.first() {
            None => s.is_empty(),
            Some('%') => (0..=s.len()).any(|i| rec(&s[i..], &p[1..])),
            Some('_') => !s.is_empty() && rec(&s[1..], &p[1..]),
            Some(c) => s.first() == Some(c) && rec(&s[1..], &p[1..]),
        }
    }
    let sc: Vec<char> = s.chars().collect();
    let pc: Vec<char> = pattern.chars().collect();
    rec(&sc, &pc)
}

// ---------------------------------------------------------------------------
// Compiler
// ---------------------------------------------------------------------------

/// Compiles sqlparser expressions against a field schema, assigning
/// positional indices to `?` placeholders in encounter order.
pub struct ExprCompiler<'a> {
    schema: &'a HashMap<String, usize>,
    next_param: usize,
}

impl<'a> ExprCompiler<'a> {
    pub fn new(schema: &'a HashMap<String, usize>) -> ExprCompiler<'a> {
        ExprCompiler {
            schema,
            next_param: 0,
        }
    }

    /// Continue positional-parameter numbering from `start`. Used when a
    /// statement compiles expressions in several phases (projection, WHERE,
    /// LIMIT) that share one parameter sequence.
    pub fn with_start(schema: &'a HashMap<String, usize>, start: usize) -> ExprCompiler<'a> {
        ExprCompiler {
            schema,
            next_param: start,
        }
    }

    /// Number of positional parameters assigned so far (including `start`).
    pub fn params_used(&self) -> usize {
        self.next_param
    }

    /// Recursively compile a scalar expression.
    pub fn compile(&mut self, expr: &Expr) -> Result<CompiledExpr, PlannerError> {
        match expr {
            Expr::Identifier(ident) => self.field(&ident.value),
            Expr::CompoundIdentifier(parts) => match parts.last() {
                Some(ident) => self.field(&ident.value),
                None => Err(PlannerError::Statement("empty compound identifier".into())),
            },

            Expr::Value(value) => self.compile_value(value),

            Expr::BinaryOp { left, op, right } => {
                let l = self.compile(left)?;
                let r = self.compile(right)?;
                let op = match op {
                    BinaryOperator::Plus => BinOp::Add,
                    BinaryOperator::Minus => BinOp::Sub,
                    BinaryOperator::Multiply => BinOp::Mul,
                    BinaryOperator::Divide => BinOp::Div,
                    BinaryOperator::Modulo => BinOp::Mod,
                    BinaryOperator::Eq => BinOp::Eq,
                    BinaryOperator::NotEq => BinOp::NotEq,
                    BinaryOperator::Lt => BinOp::Lt,
                    BinaryOperator::LtEq => BinOp::LtEq,
                    BinaryOperator::Gt => BinOp::Gt,
                    BinaryOperator::GtEq => BinOp::GtEq,
                    BinaryOperator::And => BinOp::And,
                    BinaryOperator::Or => BinOp::Or,
                    other => {
                        return Err(PlannerError::Statement(format!(
                            "unsupported operator: {other}"
                        )))
                    }
                };
                Ok(CompiledExpr::Binary {
                    op,
                    left: Box::new(l),
                    right: Box::new(r),
                })
            }

            Expr::UnaryOp { op, expr: inner } => {
                let e = self.compile(inner)?;
                let op = match op {
                    UnaryOperator::Not => UnOp::Not,
                    UnaryOperator::Minus => UnOp::Neg,
                    UnaryOperator::Plus => return Ok(e),
                    other => {
                        return Err(PlannerError::Statement(format!(
                            "unsupported unary operator: {other}"
                        )))
                    }
                };
                Ok(CompiledExpr::Unary {
                    op,
                    expr: Box::new(e),
                })
            }

            Expr::Nested(inner) => self.compile(inner),

            Expr::IsNull(inner) => Ok(CompiledExpr::IsNull {
                expr: Box::new(self.compile(inner)?),
                negated: false,
            }),
            Expr::IsNotNull(inner) => Ok(CompiledExpr::IsNull {
                expr: Box::new(self.compile(inner)?),
                negated: true,
            }),

            // BETWEEN: x BETWEEN a AND b  →  x >= a AND x <= b
            Expr::Between {
                expr: inner,
                negated,
                low,
                high,
            } => {
                let x = self.compile(inner)?;
                let lo = self.compile(low)?;
                let hi = self.compile(high)?;
                let ge = CompiledExpr::Binary {
                    op: BinOp::GtEq,
                    left: Box::new(x.clone()),
                    right: Box::new(lo),
                };
                let le = CompiledExpr::Binary {
                    op: BinOp::LtEq,
                    left: Box::new(x),
                    right: Box::new(hi),
                };
                let both = CompiledExpr::Binary {
                    op: BinOp::And,
                    left: Box::new(ge),
                    right: Box::new(le),
                };
                if *negated {
                    Ok(CompiledExpr::Unary {
                        op: UnOp::Not,
                        expr: Box::new(both),
                    })
                } else {
                    Ok(both)
                }
            }

            Expr::InList {
                expr: inner,
                list,
                negated,
            } => {
                let e = self.compile(inner)?;
                let compiled: Result<Vec<_>, _> = list.iter().map(|i| self.compile(i)).collect();
                Ok(CompiledExpr::InList {
                    expr: Box::new(e),
                    list: compiled?,
                    negated: *negated,
                })
            }

            Expr::Like {
                negated,
                expr: inner,
                pattern,
                ..
            } => Ok(CompiledExpr::Like {
                expr: Box::new(self.compile(inner)?),
                pattern: Box::new(self.compile(pattern)?),
                negated: *negated,
            }),

            Expr::Case {
                operand,
                conditions,
                results,
                else_result,
            } => {
                let operand = match operand {
                    Some(op) => Some(Box::new(self.compile(op)?)),
                    None => None,
                };
                let mut branches = Vec::with_capacity(conditions.len());
                for (cond, result) in conditions.iter().zip(results.iter()) {
                    branches.push((self.compile(cond)?, self.compile(result)?));
                }
                let otherwise = match else_result {
                    Some(e) => Some(Box::new(self.compile(e)?)),
                    None => None,
                };
                Ok(CompiledExpr::Case {
                    operand,
                    branches,
                    otherwise,
                })
            }

            Expr::Function(func) => self.compile_function(func),

            other => Err(PlannerError::Statement(format!(
                "unsupported expression: {other}"
            ))),
        }
    }

    fn field(&self, name: &str) -> Result<CompiledExpr, PlannerError> {
        let lower = name.to_lowercase();
        match self.schema.get(&lower) {
            Some(i) => Ok(CompiledExpr::Field(*i)),
            None => Err(PlannerError::Statement(format!(
                "column '{lower}' not found"
            ))),
        }
    }

    fn compile_value(&mut self, value: &Value) -> Result<CompiledExpr, PlannerError> {
        match value {
            Value::Number(n, _) => {
                if let Ok(i) = n.parse::<i64>() {
                    Ok(CompiledExpr::Constant(SqlValue::Long(i)))
                } else {
                    let f = n.parse::<f64>().map_err(|_| {
                        PlannerError::Statement(format!("invalid number literal: {n}"))
                    })?;
                    Ok(CompiledExpr::Constant(SqlValue::Double(f)))
                }
            }
            Value::SingleQuotedString(s) | Value::DoubleQuotedString(s) => {
                Ok(CompiledExpr::Constant(SqlValue::String(s.clone())))
            }
            Value::Boolean(b) => Ok(CompiledExpr::Constant(SqlValue::Boolean(*b))),
            Value::Null => Ok(CompiledExpr::Constant(SqlValue::Null)),
            Value::Placeholder(p) => {
                let index = if p == "?" {
                    let i = self.next_param;
                    self.next_param += 1;
                    i
                } else {
                    // "?3" / "$3" style: explicit 1-based position
                    p[1..].parse::<usize>().ok().and_then(|n| n.checked_sub(1)).ok_or_else(
                        || PlannerError::Statement(format!("invalid placeholder: {p}")),
                    )?
                };
                Ok(CompiledExpr::Parameter(index))
            }
            other => Err(PlannerError::Statement(format!(
                "unsupported value: {other}"
            ))),
        }
    }

    fn compile_function(&mut self, func: &Function) -> Result<CompiledExpr, PlannerError> {
        let name = func
            .name
            .0
            .iter()
            .map(|i| i.value.to_lowercase())
            .collect::<Vec<_>>()
            .join(".");
        let scalar = match name.as_str() {
            "lower" => ScalarFunc::Lower,
            "upper" => ScalarFunc::Upper,
            "abs" => ScalarFunc::Abs,
            "coalesce" => ScalarFunc::Coalesce,
            "current_timestamp" | "now" => ScalarFunc::CurrentTimestamp,
            other => {
                return Err(PlannerError::Statement(format!(
                    "unsupported function '{other}' in scalar context"
                )))
            }
        };
        let args = function_arg_exprs(func)?;
        if scalar != ScalarFunc::CurrentTimestamp && args.is_empty() {
            return Err(PlannerError::Statement(format!(
                "function '{name}' requires arguments"
            )));
        }
        let compiled: Result<Vec<_>, _> = args.iter().map(|a| self.compile(a)).collect();
        Ok(CompiledExpr::Function {
            func: scalar,
            args: compiled?,
        })
    }
}

/// Extract plain expression arguments from a function call. Wildcards and
/// named arguments are rejected here; `COUNT(*)` is handled by the
/// aggregation planner before scalar compilation.
pub fn function_arg_exprs(func: &Function) -> Result<Vec<Expr>, PlannerError> {
    match &func.args {
        FunctionArguments::None => Ok(Vec::new()),
        FunctionArguments::List(list) => {
            let mut out = Vec::with_capacity(list.args.len());
            for arg in &list.args {
                match arg {
                    FunctionArg::Unnamed(FunctionArgExpr::Expr(e)) => out.push(e.clone()),
                    other => {
                        return Err(PlannerError::Statement(format!(
                            "unsupported function argument: {other}"
                        )))
                    }
                }
            }
            Ok(out)
        }
        FunctionArguments::Subquery(_) => Err(PlannerError::Statement(
            "subquery function arguments are not supported".into(),
        )),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
