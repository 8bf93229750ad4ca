use std::cmp::Ordering;
use std::fmt;

use arrow::datatypes::DataType;

/// Dynamically typed scalar used for row-wise processing.
///
/// The palette matches the logical types the engine stores: 64-bit integers,
/// 64-bit floats, UTF-8 strings and booleans, plus SQL NULL.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
}

impl Value {
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// The Arrow data type this value maps to, or `None` for NULL.
    pub fn data_type(&self) -> Option<DataType> {
        match self {
            Value::Null => None,
            Value::Int(_) => Some(DataType::Int64),
            Value::Float(_) => Some(DataType::Float64),
            Value::Str(_) => Some(DataType::Utf8),
            Value::Bool(_) => Some(DataType::Boolean),
        }
    }

    /// Interpret the value as a truth value: integers are true when nonzero,
    /// NULL is indeterminate.
    pub fn truth(&self) -> Option<bool> {
        match self {
            Value::Null => None,
            Value::Int(v) => Some(*v != 0),
            Value::Float(v) => Some(*v != 0.0),
            Value::Bool(b) => Some(*b),
            Value::Str(_) => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Str(s) => write!(f, "{s}"),
            Value::Bool(b) => write!(f, "{b}"),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl<T> From<Option<T>> for Value
where
    T: Into<Value>,
{
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}

/// Compare two non-null values, coercing across the numeric types.
///
/// Returns `None` when either side is NULL or the types are incomparable.
pub fn compare_values(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Int(l), Value::Int(r)) => Some(l.cmp(r)),
        (Value::Float(l), Value::Float(r)) => l.partial_cmp(r),
        (Value::Int(l), Value::Float(r)) => (*l as f64).partial_cmp(r),
        (Value::Float(l), Value::Int(r)) => l.partial_cmp(&(*r as f64)),
        (Value::Str(l), Value::Str(r)) => Some(l.cmp(r)),
        (Value::Bool(l), Value::Bool(r)) => Some(l.cmp(r)),
        _ => None,
    }
}

/// Canonical representation of values participating in index probes.
///
/// Floats are canonicalized to their bit pattern so the key is hashable;
/// NULLs never produce a key (a key containing NULL matches nothing).
#[derive(Hash, Eq, PartialEq, Debug, Clone)]
pub enum IndexKey {
    Int(i64),
    Float(u64),
    Str(String),
    Bool(bool),
    Composite(Vec<IndexKey>),
}

impl IndexKey {
    /// Build a key component for a single value. `None` for NULL.
    pub fn from_value(value: &Value) -> Option<IndexKey> {
        match value {
            Value::Null => None,
            Value::Int(v) => Some(IndexKey::Int(*v)),
            Value::Float(v) => Some(IndexKey::Float(v.to_bits())),
            Value::Str(s) => Some(IndexKey::Str(s.clone())),
            Value::Bool(b) => Some(IndexKey::Bool(*b)),
        }
    }

    /// Build a composite key from column values. `None` if any component is
    /// NULL: such rows never participate in uniqueness or FK matching.
    pub fn composite(values: &[Value]) -> Option<IndexKey> {
        if values.is_empty() {
            return None;
        }
        let mut components = Vec::with_capacity(values.len());
        for value in values {
            components.push(IndexKey::from_value(value)?);
        }
        Some(IndexKey::Composite(components))
    }
}
