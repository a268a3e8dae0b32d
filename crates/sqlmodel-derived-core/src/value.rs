//! Dynamic SQL values.

use crate::error::{Error, TypeError};
use crate::types::SqlType;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// A dynamically-typed SQL value.
///
/// Column values on live objects, statement parameters and result rows all
/// use this representation. Integer columns are normalised to `BigInt` when
/// coerced to their declared [`SqlType`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// NULL value
    Null,

    /// Boolean value
    Bool(bool),

    /// 32-bit signed integer
    Int(i32),

    /// 64-bit signed integer
    BigInt(i64),

    /// 64-bit floating point
    Double(f64),

    /// Arbitrary precision decimal (stored as string)
    Decimal(String),

    /// Text string
    Text(String),

    /// Binary data
    Bytes(Vec<u8>),

    /// JSON value
    Json(serde_json::Value),

    /// SQL DEFAULT keyword
    Default,
}

impl Value {
    /// Check if this value is NULL.
    pub const fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Get the type name of this value.
    pub const fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "NULL",
            Value::Bool(_) => "BOOLEAN",
            Value::Int(_) => "INTEGER",
            Value::BigInt(_) => "BIGINT",
            Value::Double(_) => "DOUBLE",
            Value::Decimal(_) => "DECIMAL",
            Value::Text(_) => "TEXT",
            Value::Bytes(_) => "BLOB",
            Value::Json(_) => "JSON",
            Value::Default => "DEFAULT",
        }
    }

    /// Try to convert this value to a bool.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            Value::Int(v) => Some(*v != 0),
            Value::BigInt(v) => Some(*v != 0),
            _ => None,
        }
    }

    /// Try to convert this value to an i64.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(i64::from(*v)),
            Value::BigInt(v) => Some(*v),
            Value::Bool(v) => Some(i64::from(*v)),
            _ => None,
        }
    }

    /// Try to convert this value to an f64.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Double(v) => Some(*v),
            Value::Int(v) => Some(f64::from(*v)),
            Value::BigInt(v) => Some(*v as f64),
            Value::Decimal(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Try to get this value as a string reference.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) | Value::Decimal(s) => Some(s),
            _ => None,
        }
    }

    /// Try to get this value as a byte slice.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            Value::Text(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    fn is_integral(&self) -> bool {
        matches!(self, Value::Int(_) | Value::BigInt(_))
    }

    fn is_number(&self) -> bool {
        matches!(
            self,
            Value::Int(_) | Value::BigInt(_) | Value::Double(_) | Value::Decimal(_)
        )
    }

    /// SQL comparison. `None` when either side is NULL or the types are not comparable.
    pub fn sql_cmp(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Null | Value::Default, _) | (_, Value::Null | Value::Default) => None,
            (a, b) if a.is_integral() && b.is_integral() => Some(a.as_i64()?.cmp(&b.as_i64()?)),
            (a, b) if a.is_number() && b.is_number() => a.as_f64()?.partial_cmp(&b.as_f64()?),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
            (Value::Bytes(a), Value::Bytes(b)) => Some(a.cmp(b)),
            (Value::Json(a), Value::Json(b)) if a == b => Some(Ordering::Equal),
            _ => None,
        }
    }

    /// SQL equality with three-valued logic: `None` means UNKNOWN.
    pub fn sql_eq(&self, other: &Value) -> Option<bool> {
        if self.is_null() || other.is_null() {
            return None;
        }
        Some(self.sql_cmp(other) == Some(Ordering::Equal))
    }

    /// NULL-safe equality (`IS NOT DISTINCT FROM`).
    pub fn not_distinct(&self, other: &Value) -> bool {
        match (self.is_null(), other.is_null()) {
            (true, true) => true,
            (false, false) => self.sql_eq(other) == Some(true),
            _ => false,
        }
    }

    /// Total ordering used for ORDER BY: NULL first, then by value, then by type.
    pub fn sort_cmp(&self, other: &Value) -> Ordering {
        match (self.is_null(), other.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            (false, false) => self
                .sql_cmp(other)
                .unwrap_or_else(|| self.type_rank().cmp(&other.type_rank())),
        }
    }

    const fn type_rank(&self) -> u8 {
        match self {
            Value::Null | Value::Default => 0,
            Value::Bool(_) => 1,
            Value::Int(_) | Value::BigInt(_) | Value::Double(_) | Value::Decimal(_) => 2,
            Value::Text(_) => 3,
            Value::Bytes(_) => 4,
            Value::Json(_) => 5,
        }
    }

    fn arithmetic(
        &self,
        other: &Value,
        op: &'static str,
        int_op: fn(i64, i64) -> Option<i64>,
        float_op: fn(f64, f64) -> f64,
    ) -> crate::Result<Value> {
        if self.is_null() || other.is_null() {
            return Ok(Value::Null);
        }
        if self.is_integral() && other.is_integral() {
            let (a, b) = (self.as_i64().unwrap_or(0), other.as_i64().unwrap_or(0));
            return int_op(a, b).map(Value::BigInt).ok_or_else(|| {
                Error::Type(TypeError {
                    expected: "integer result in range",
                    actual: format!("{a} {op} {b}"),
                    column: None,
                })
            });
        }
        match (self.as_f64(), other.as_f64()) {
            (Some(a), Some(b)) if self.is_number() && other.is_number() => {
                Ok(Value::Double(float_op(a, b)))
            }
            _ => Err(Error::Type(TypeError {
                expected: "numeric operands",
                actual: format!("{} {op} {}", self.type_name(), other.type_name()),
                column: None,
            })),
        }
    }

    /// Numeric addition with NULL propagation.
    pub fn checked_add(&self, other: &Value) -> crate::Result<Value> {
        self.arithmetic(other, "+", i64::checked_add, |a, b| a + b)
    }

    /// Numeric subtraction with NULL propagation.
    pub fn checked_sub(&self, other: &Value) -> crate::Result<Value> {
        self.arithmetic(other, "-", i64::checked_sub, |a, b| a - b)
    }

    /// Numeric multiplication with NULL propagation.
    pub fn checked_mul(&self, other: &Value) -> crate::Result<Value> {
        self.arithmetic(other, "*", i64::checked_mul, |a, b| a * b)
    }

    /// Numeric division with NULL propagation; division by zero yields NULL.
    pub fn checked_div(&self, other: &Value) -> crate::Result<Value> {
        if other.as_f64() == Some(0.0) {
            return Ok(Value::Null);
        }
        self.arithmetic(other, "/", i64::checked_div, |a, b| a / b)
    }

    /// Convert this value to the storage representation of `sql_type`.
    ///
    /// NULL and DEFAULT pass through unchanged.
    pub fn coerce(&self, sql_type: &SqlType) -> crate::Result<Value> {
        if matches!(self, Value::Null | Value::Default) {
            return Ok(self.clone());
        }
        let mismatch = |expected: &'static str| {
            Error::Type(TypeError {
                expected,
                actual: self.type_name().to_string(),
                column: None,
            })
        };
        match sql_type {
            SqlType::Integer | SqlType::BigInt | SqlType::Timestamp => match self {
                Value::Int(_) | Value::BigInt(_) | Value::Bool(_) => {
                    Ok(Value::BigInt(self.as_i64().unwrap_or(0)))
                }
                Value::Double(f) if f.fract() == 0.0 => Ok(Value::BigInt(*f as i64)),
                Value::Text(s) | Value::Decimal(s) => s
                    .trim()
                    .parse::<i64>()
                    .map(Value::BigInt)
                    .map_err(|_| mismatch("integer")),
                _ => Err(mismatch("integer")),
            },
            SqlType::Real | SqlType::Double | SqlType::Decimal { .. } => match self {
                Value::Text(s) => s
                    .trim()
                    .parse::<f64>()
                    .map(Value::Double)
                    .map_err(|_| mismatch("number")),
                other => other
                    .as_f64()
                    .map(Value::Double)
                    .ok_or_else(|| mismatch("number")),
            },
            SqlType::Boolean => match self {
                Value::Text(s) if s.eq_ignore_ascii_case("true") => Ok(Value::Bool(true)),
                Value::Text(s) if s.eq_ignore_ascii_case("false") => Ok(Value::Bool(false)),
                other => other
                    .as_bool()
                    .map(Value::Bool)
                    .ok_or_else(|| mismatch("boolean")),
            },
            SqlType::VarChar(_) | SqlType::Text => match self {
                Value::Text(_) => Ok(self.clone()),
                Value::Decimal(s) => Ok(Value::Text(s.clone())),
                _ => Err(mismatch("text")),
            },
            SqlType::Blob => self
                .as_bytes()
                .map(|b| Value::Bytes(b.to_vec()))
                .ok_or_else(|| mismatch("bytes")),
            SqlType::Json => match self {
                Value::Json(_) => Ok(self.clone()),
                Value::Text(s) => serde_json::from_str(s).map(Value::Json).map_err(Error::from),
                other => serde_json::to_value(other)
                    .map(Value::Json)
                    .map_err(Error::from),
            },
            SqlType::Custom(_) => Ok(self.clone()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::BigInt(i) => write!(f, "{i}"),
            Value::Double(d) => write!(f, "{d}"),
            Value::Decimal(s) => write!(f, "{s}"),
            Value::Text(s) => write!(f, "'{}'", s.replace('\'', "''")),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Value::Json(j) => write!(f, "{j}"),
            Value::Default => write!(f, "DEFAULT"),
        }
    }
}

/// Hash a list of values, treating `Int` and `BigInt` of equal magnitude alike.
pub fn hash_values(values: &[Value]) -> u64 {
    use std::collections::hash_map::DefaultHasher;
    let mut hasher = DefaultHasher::new();
    for v in values {
        match v {
            Value::Null => 0u8.hash(&mut hasher),
            Value::Bool(b) => {
                1u8.hash(&mut hasher);
                b.hash(&mut hasher);
            }
            Value::Int(_) | Value::BigInt(_) => {
                2u8.hash(&mut hasher);
                v.as_i64().hash(&mut hasher);
            }
            Value::Double(d) => {
                3u8.hash(&mut hasher);
                d.to_bits().hash(&mut hasher);
            }
            Value::Decimal(s) => {
                4u8.hash(&mut hasher);
                s.hash(&mut hasher);
            }
            Value::Text(s) => {
                5u8.hash(&mut hasher);
                s.hash(&mut hasher);
            }
            Value::Bytes(b) => {
                6u8.hash(&mut hasher);
                b.hash(&mut hasher);
            }
            Value::Json(j) => {
                7u8.hash(&mut hasher);
                j.to_string().hash(&mut hasher);
            }
            Value::Default => 8u8.hash(&mut hasher),
        }
    }
    hasher.finish()
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::BigInt(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Json(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}

impl TryFrom<Value> for i64 {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        value.as_i64().ok_or_else(|| {
            Error::Type(TypeError {
                expected: "i64",
                actual: value.type_name().to_string(),
                column: None,
            })
        })
    }
}

impl TryFrom<Value> for f64 {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        value.as_f64().ok_or_else(|| {
            Error::Type(TypeError {
                expected: "f64",
                actual: value.type_name().to_string(),
                column: None,
            })
        })
    }
}

impl TryFrom<Value> for bool {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        value.as_bool().ok_or_else(|| {
            Error::Type(TypeError {
                expected: "bool",
                actual: value.type_name().to_string(),
                column: None,
            })
        })
    }
}

impl TryFrom<Value> for String {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Text(s) | Value::Decimal(s) => Ok(s),
            other => Err(Error::Type(TypeError {
                expected: "string",
                actual: other.type_name().to_string(),
                column: None,
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comparison_is_three_valued() {
        assert_eq!(Value::Int(1).sql_eq(&Value::BigInt(1)), Some(true));
        assert_eq!(Value::Null.sql_eq(&Value::BigInt(1)), None);
        assert_eq!(
            Value::BigInt(2).sql_cmp(&Value::Double(2.5)),
            Some(Ordering::Less)
        );
        assert_eq!(Value::Text("a".into()).sql_cmp(&Value::BigInt(1)), None);
    }

    #[test]
    fn not_distinct_treats_nulls_as_equal() {
        assert!(Value::Null.not_distinct(&Value::Null));
        assert!(!Value::Null.not_distinct(&Value::BigInt(0)));
        assert!(Value::BigInt(0).not_distinct(&Value::Int(0)));
    }

    #[test]
    fn sort_puts_nulls_first() {
        let mut values = vec![Value::BigInt(3), Value::Null, Value::BigInt(1)];
        values.sort_by(Value::sort_cmp);
        assert_eq!(values, vec![Value::Null, Value::BigInt(1), Value::BigInt(3)]);
    }

    #[test]
    fn arithmetic_widens_and_propagates_null() {
        assert_eq!(
            Value::Int(10).checked_add(&Value::BigInt(15)).unwrap(),
            Value::BigInt(25)
        );
        assert_eq!(
            Value::BigInt(1).checked_add(&Value::Double(0.5)).unwrap(),
            Value::Double(1.5)
        );
        assert_eq!(
            Value::Null.checked_add(&Value::BigInt(1)).unwrap(),
            Value::Null
        );
        assert_eq!(
            Value::BigInt(1).checked_div(&Value::BigInt(0)).unwrap(),
            Value::Null
        );
        assert!(Value::BigInt(i64::MAX).checked_add(&Value::BigInt(1)).is_err());
        assert!(Value::Text("a".into()).checked_add(&Value::BigInt(1)).is_err());
    }

    #[test]
    fn coercion_follows_column_type() {
        assert_eq!(
            Value::Int(7).coerce(&SqlType::BigInt).unwrap(),
            Value::BigInt(7)
        );
        assert_eq!(
            Value::Text("42".into()).coerce(&SqlType::Integer).unwrap(),
            Value::BigInt(42)
        );
        assert_eq!(
            Value::BigInt(2).coerce(&SqlType::Double).unwrap(),
            Value::Double(2.0)
        );
        assert_eq!(Value::Null.coerce(&SqlType::Text).unwrap(), Value::Null);
        assert!(Value::BigInt(1).coerce(&SqlType::Text).is_err());
        assert!(Value::Text("x".into()).coerce(&SqlType::Integer).is_err());
    }

    #[test]
    fn hash_normalises_integer_width() {
        assert_eq!(
            hash_values(&[Value::Int(42)]),
            hash_values(&[Value::BigInt(42)])
        );
        assert_ne!(
            hash_values(&[Value::BigInt(42)]),
            hash_values(&[Value::Text("42".into())])
        );
    }

    #[test]
    fn try_from_conversions() {
        assert_eq!(i64::try_from(Value::BigInt(5)).unwrap(), 5);
        assert_eq!(String::try_from(Value::Text("x".into())).unwrap(), "x");
        assert!(bool::try_from(Value::Text("x".into())).is_err());
    }
}
