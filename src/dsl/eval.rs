//! Expression evaluation over the dynamic value model.

use super::functions;
use super::parser::{BinaryOp, Expr, UnaryOp};
use super::value::{Value, VariableMap};
use crate::error::EvalError;

/// Evaluates a parsed expression against the given scope.
pub fn evaluate(expr: &Expr, vars: &VariableMap) -> Result<Value, EvalError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Ident(name) => vars
            .get(name)
            .cloned()
            .ok_or_else(|| EvalError::UnknownIdentifier(name.clone())),
        Expr::Unary { op, expr } => {
            let value = evaluate(expr, vars)?;
            match op {
                UnaryOp::Not => Ok(Value::Bool(!value.truthy())),
                UnaryOp::Neg => match value {
                    Value::Int(i) => Ok(Value::Int(-i)),
                    Value::Float(f) => Ok(Value::Float(-f)),
                    other => Err(EvalError::Type(format!("cannot negate {:?}", other))),
                },
            }
        }
        Expr::Binary { op, lhs, rhs } => eval_binary(op, lhs, rhs, vars),
        Expr::Call { name, args } => {
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                values.push(evaluate(arg, vars)?);
            }
            functions::call(name, &values)
        }
        Expr::Index { target, index } => {
            let target = evaluate(target, vars)?;
            let index = evaluate(index, vars)?;
            eval_index(&target, &index)
        }
        Expr::Ternary {
            cond,
            then,
            otherwise,
        } => {
            if evaluate(cond, vars)?.truthy() {
                evaluate(then, vars)
            } else {
                evaluate(otherwise, vars)
            }
        }
    }
}

/// Parses and evaluates `input` in one step.
pub fn evaluate_str(input: &str, vars: &VariableMap) -> Result<Value, EvalError> {
    let expr = Expr::parse(input)?;
    evaluate(&expr, vars)
}

fn eval_binary(
    op: &BinaryOp,
    lhs: &Expr,
    rhs: &Expr,
    vars: &VariableMap,
) -> Result<Value, EvalError> {
    // && and || short-circuit on the left operand.
    match op {
        BinaryOp::And => {
            let left = evaluate(lhs, vars)?;
            if !left.truthy() {
                return Ok(Value::Bool(false));
            }
            let right = evaluate(rhs, vars)?;
            return Ok(Value::Bool(right.truthy()));
        }
        BinaryOp::Or => {
            let left = evaluate(lhs, vars)?;
            if left.truthy() {
                return Ok(Value::Bool(true));
            }
            let right = evaluate(rhs, vars)?;
            return Ok(Value::Bool(right.truthy()));
        }
        _ => {}
    }

    let left = evaluate(lhs, vars)?;
    let right = evaluate(rhs, vars)?;

    match op {
        BinaryOp::Add => add(&left, &right),
        BinaryOp::Sub => arithmetic(&left, &right, "-", |a, b| a.checked_sub(b), |a, b| a - b),
        BinaryOp::Mul => arithmetic(&left, &right, "*", |a, b| a.checked_mul(b), |a, b| a * b),
        BinaryOp::Div => divide(&left, &right),
        BinaryOp::Rem => remainder(&left, &right),
        BinaryOp::Eq => Ok(Value::Bool(loose_eq(&left, &right))),
        BinaryOp::Ne => Ok(Value::Bool(!loose_eq(&left, &right))),
        BinaryOp::Lt => compare(&left, &right).map(|o| Value::Bool(o == std::cmp::Ordering::Less)),
        BinaryOp::Le => compare(&left, &right).map(|o| Value::Bool(o != std::cmp::Ordering::Greater)),
        BinaryOp::Gt => compare(&left, &right).map(|o| Value::Bool(o == std::cmp::Ordering::Greater)),
        BinaryOp::Ge => compare(&left, &right).map(|o| Value::Bool(o != std::cmp::Ordering::Less)),
        BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
    }
}

/// `+` concatenates when either side is a string, otherwise adds numerically.
fn add(left: &Value, right: &Value) -> Result<Value, EvalError> {
    if matches!(left, Value::String(_)) || matches!(right, Value::String(_)) {
        return Ok(Value::String(format!("{}{}", left, right)));
    }
    arithmetic(left, right, "+", |a, b| a.checked_add(b), |a, b| a + b)
}

fn arithmetic(
    left: &Value,
    right: &Value,
    op: &str,
    int_op: impl Fn(i64, i64) -> Option<i64>,
    float_op: impl Fn(f64, f64) -> f64,
) -> Result<Value, EvalError> {
    match (left, right) {
        (Value::Int(a), Value::Int(b)) => int_op(*a, *b)
            .map(Value::Int)
            .ok_or_else(|| EvalError::Type(format!("integer overflow in '{}'", op))),
        _ => {
            let (a, b) = both_floats(left, right, op)?;
            Ok(Value::Float(float_op(a, b)))
        }
    }
}

fn divide(left: &Value, right: &Value) -> Result<Value, EvalError> {
    match (left, right) {
        (Value::Int(a), Value::Int(b)) => {
            if *b == 0 {
                Err(EvalError::DivisionByZero)
            } else {
                Ok(Value::Int(a / b))
            }
        }
        _ => {
            let (a, b) = both_floats(left, right, "/")?;
            if b == 0.0 {
                Err(EvalError::DivisionByZero)
            } else {
                Ok(Value::Float(a / b))
            }
        }
    }
}

fn remainder(left: &Value, right: &Value) -> Result<Value, EvalError> {
    match (left.as_int(), right.as_int()) {
        (Some(_), Some(0)) => Err(EvalError::DivisionByZero),
        (Some(a), Some(b)) => Ok(Value::Int(a % b)),
        _ => Err(EvalError::Type("'%' requires integer operands".to_string())),
    }
}

fn both_floats(left: &Value, right: &Value, op: &str) -> Result<(f64, f64), EvalError> {
    match (left.as_float(), right.as_float()) {
        (Some(a), Some(b)) => Ok((a, b)),
        _ => Err(EvalError::Type(format!(
            "'{}' requires numeric operands, got {:?} and {:?}",
            op, left, right
        ))),
    }
}

/// Equality with numeric coercion: when both sides are numeric (including
/// numeric strings), values compare as numbers.
fn loose_eq(left: &Value, right: &Value) -> bool {
    if left.is_numeric() || right.is_numeric() {
        if let (Some(a), Some(b)) = (left.as_float(), right.as_float()) {
            return a == b;
        }
    }
    match (left, right) {
        (Value::String(a), Value::String(b)) => a == b,
        (Value::Bytes(a), Value::Bytes(b)) => a == b,
        (Value::String(a), Value::Bytes(b)) | (Value::Bytes(b), Value::String(a)) => {
            a.as_bytes() == b.as_slice()
        }
        _ => left == right,
    }
}

fn compare(left: &Value, right: &Value) -> Result<std::cmp::Ordering, EvalError> {
    if let (Some(a), Some(b)) = (left.as_float(), right.as_float()) {
        return a
            .partial_cmp(&b)
            .ok_or_else(|| EvalError::Type("cannot order NaN".to_string()));
    }
    match (left, right) {
        (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
        _ => Err(EvalError::Type(format!(
            "cannot order {:?} and {:?}",
            left, right
        ))),
    }
}

fn eval_index(target: &Value, index: &Value) -> Result<Value, EvalError> {
    match target {
        Value::List(items) => {
            let i = index
                .as_int()
                .ok_or_else(|| EvalError::Type("list index must be an integer".to_string()))?;
            if i < 0 || i as usize >= items.len() {
                return Ok(Value::Null);
            }
            Ok(items[i as usize].clone())
        }
        Value::Map(map) => {
            let key = index.to_string();
            Ok(map.get(&key).cloned().unwrap_or(Value::Null))
        }
        Value::String(s) => {
            let i = index
                .as_int()
                .ok_or_else(|| EvalError::Type("string index must be an integer".to_string()))?;
            Ok(s.chars()
                .nth(i.max(0) as usize)
                .map(|c| Value::String(c.to_string()))
                .unwrap_or(Value::Null))
        }
        other => Err(EvalError::Type(format!("cannot index into {:?}", other))),
    }
}
