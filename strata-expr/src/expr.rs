use std::cmp::Ordering;

use arrow::datatypes::DataType;
use strata_result::{Error, Result};

use crate::value::{Value, compare_values};

/// Binary operators supported in bound expressions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
}

/// A bound scalar expression evaluated row-wise.
///
/// Column references are positions into the row the expression is evaluated
/// against; the binder decides what that row layout is (full physical layout
/// for CHECK and generated columns, a projection for type casts).
#[derive(Clone, Debug)]
pub enum ScalarExpr {
    Column(usize),
    Literal(Value),
    Binary {
        op: BinaryOp,
        left: Box<ScalarExpr>,
        right: Box<ScalarExpr>,
    },
    IsNull(Box<ScalarExpr>),
    IsNotNull(Box<ScalarExpr>),
    Cast {
        expr: Box<ScalarExpr>,
        to: DataType,
    },
}

impl ScalarExpr {
    pub fn column(idx: usize) -> ScalarExpr {
        ScalarExpr::Column(idx)
    }

    pub fn literal(value: impl Into<Value>) -> ScalarExpr {
        ScalarExpr::Literal(value.into())
    }

    pub fn binary(op: BinaryOp, left: ScalarExpr, right: ScalarExpr) -> ScalarExpr {
        ScalarExpr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn cast(expr: ScalarExpr, to: DataType) -> ScalarExpr {
        ScalarExpr::Cast {
            expr: Box::new(expr),
            to,
        }
    }

    /// Evaluate against one row of values.
    pub fn eval(&self, row: &[Value]) -> Result<Value> {
        match self {
            ScalarExpr::Column(idx) => row.get(*idx).cloned().ok_or_else(|| {
                Error::Internal(format!(
                    "expression references column {idx} but the row has {} values",
                    row.len()
                ))
            }),
            ScalarExpr::Literal(value) => Ok(value.clone()),
            ScalarExpr::Binary { op, left, right } => {
                let left = left.eval(row)?;
                let right = right.eval(row)?;
                eval_binary(*op, left, right)
            }
            ScalarExpr::IsNull(inner) => Ok(Value::Bool(inner.eval(row)?.is_null())),
            ScalarExpr::IsNotNull(inner) => Ok(Value::Bool(!inner.eval(row)?.is_null())),
            ScalarExpr::Cast { expr, to } => cast_value(expr.eval(row)?, to),
        }
    }

    /// Collect every column position the expression references.
    pub fn referenced_columns(&self, out: &mut Vec<usize>) {
        match self {
            ScalarExpr::Column(idx) => {
                if !out.contains(idx) {
                    out.push(*idx);
                }
            }
            ScalarExpr::Literal(_) => {}
            ScalarExpr::Binary { left, right, .. } => {
                left.referenced_columns(out);
                right.referenced_columns(out);
            }
            ScalarExpr::IsNull(inner) | ScalarExpr::IsNotNull(inner) => {
                inner.referenced_columns(out)
            }
            ScalarExpr::Cast { expr, .. } => expr.referenced_columns(out),
        }
    }

    /// Rewrite every column reference through `remap`.
    pub fn remap_columns(&mut self, remap: &impl Fn(usize) -> usize) {
        match self {
            ScalarExpr::Column(idx) => *idx = remap(*idx),
            ScalarExpr::Literal(_) => {}
            ScalarExpr::Binary { left, right, .. } => {
                left.remap_columns(remap);
                right.remap_columns(remap);
            }
            ScalarExpr::IsNull(inner) | ScalarExpr::IsNotNull(inner) => inner.remap_columns(remap),
            ScalarExpr::Cast { expr, .. } => expr.remap_columns(remap),
        }
    }
}

fn eval_binary(op: BinaryOp, left: Value, right: Value) -> Result<Value> {
    match op {
        BinaryOp::Add => apply_numeric_op(left, right, i64::checked_add, |l, r| l + r),
        BinaryOp::Subtract => apply_numeric_op(left, right, i64::checked_sub, |l, r| l - r),
        BinaryOp::Multiply => apply_numeric_op(left, right, i64::checked_mul, |l, r| l * r),
        BinaryOp::Divide => divide(left, right),
        BinaryOp::Eq => compare(left, right, |ord| ord == Ordering::Equal),
        BinaryOp::NotEq => compare(left, right, |ord| ord != Ordering::Equal),
        BinaryOp::Lt => compare(left, right, |ord| ord == Ordering::Less),
        BinaryOp::LtEq => compare(left, right, |ord| ord != Ordering::Greater),
        BinaryOp::Gt => compare(left, right, |ord| ord == Ordering::Greater),
        BinaryOp::GtEq => compare(left, right, |ord| ord != Ordering::Less),
        BinaryOp::And => logic(left, right, |l, r| l && r, false),
        BinaryOp::Or => logic(left, right, |l, r| l || r, true),
    }
}

fn apply_numeric_op(
    left: Value,
    right: Value,
    int_op: fn(i64, i64) -> Option<i64>,
    float_op: fn(f64, f64) -> f64,
) -> Result<Value> {
    match (left, right) {
        (Value::Null, _) | (_, Value::Null) => Ok(Value::Null),
        (Value::Int(l), Value::Int(r)) => int_op(l, r)
            .map(Value::Int)
            .ok_or_else(|| Error::InvalidArgumentError("integer overflow in expression".into())),
        (Value::Float(l), Value::Float(r)) => Ok(Value::Float(float_op(l, r))),
        (Value::Int(l), Value::Float(r)) => Ok(Value::Float(float_op(l as f64, r))),
        (Value::Float(l), Value::Int(r)) => Ok(Value::Float(float_op(l, r as f64))),
        (l, r) => Err(Error::InvalidArgumentError(format!(
            "arithmetic requires numeric values, found {l:?} and {r:?}"
        ))),
    }
}

fn divide(left: Value, right: Value) -> Result<Value> {
    match (left, right) {
        (Value::Null, _) | (_, Value::Null) => Ok(Value::Null),
        (Value::Int(l), Value::Int(r)) => {
            if r == 0 {
                Err(Error::InvalidArgumentError("division by zero".into()))
            } else {
                Ok(Value::Int(l / r))
            }
        }
        (Value::Float(l), Value::Float(r)) => div_float(l, r),
        (Value::Int(l), Value::Float(r)) => div_float(l as f64, r),
        (Value::Float(l), Value::Int(r)) => div_float(l, r as f64),
        (l, r) => Err(Error::InvalidArgumentError(format!(
            "division requires numeric values, found {l:?} and {r:?}"
        ))),
    }
}

fn div_float(l: f64, r: f64) -> Result<Value> {
    if r == 0.0 {
        Err(Error::InvalidArgumentError("division by zero".into()))
    } else {
        Ok(Value::Float(l / r))
    }
}

fn compare(left: Value, right: Value, pred: fn(Ordering) -> bool) -> Result<Value> {
    if left.is_null() || right.is_null() {
        return Ok(Value::Null);
    }
    match compare_values(&left, &right) {
        Some(ord) => Ok(Value::Bool(pred(ord))),
        None => Err(Error::InvalidArgumentError(format!(
            "cannot compare {left:?} with {right:?}"
        ))),
    }
}

// SQL three-valued logic: NULL short-circuits only against the dominating
// operand (FALSE for AND, TRUE for OR).
fn logic(left: Value, right: Value, op: fn(bool, bool) -> bool, dominator: bool) -> Result<Value> {
    let l = truth_operand(&left)?;
    let r = truth_operand(&right)?;
    match (l, r) {
        (Some(l), Some(r)) => Ok(Value::Bool(op(l, r))),
        (Some(v), None) | (None, Some(v)) if v == dominator => Ok(Value::Bool(dominator)),
        _ => Ok(Value::Null),
    }
}

fn truth_operand(value: &Value) -> Result<Option<bool>> {
    match value {
        Value::Null => Ok(None),
        other => other.truth().map(Some).ok_or_else(|| {
            Error::InvalidArgumentError(format!("{other:?} is not a boolean operand"))
        }),
    }
}

fn cast_value(value: Value, to: &DataType) -> Result<Value> {
    if value.is_null() {
        return Ok(Value::Null);
    }
    let cast_err = |value: &Value| {
        Error::InvalidArgumentError(format!("cannot cast {value} to {to:?}"))
    };
    match to {
        DataType::Int64 => match &value {
            Value::Int(v) => Ok(Value::Int(*v)),
            Value::Float(v) => Ok(Value::Int(*v as i64)),
            Value::Bool(b) => Ok(Value::Int(i64::from(*b))),
            Value::Str(s) => s
                .trim()
                .parse::<i64>()
                .map(Value::Int)
                .map_err(|_| cast_err(&value)),
            Value::Null => unreachable!(),
        },
        DataType::Float64 => match &value {
            Value::Int(v) => Ok(Value::Float(*v as f64)),
            Value::Float(v) => Ok(Value::Float(*v)),
            Value::Str(s) => s
                .trim()
                .parse::<f64>()
                .map(Value::Float)
                .map_err(|_| cast_err(&value)),
            _ => Err(cast_err(&value)),
        },
        DataType::Utf8 => Ok(Value::Str(value.to_string())),
        DataType::Boolean => match &value {
            Value::Bool(b) => Ok(Value::Bool(*b)),
            Value::Int(v) => Ok(Value::Bool(*v != 0)),
            _ => Err(cast_err(&value)),
        },
        other => Err(Error::NotImplemented(format!(
            "cast to {other:?} is not supported"
        ))),
    }
}
