//! Argument and result values crossing the dispatch boundary.
//!
//! [`Value`] is the owned, COM-free stand-in for a `VARIANT`.  It serializes
//! untagged so that the JSON worker and the C ABI exchange plain JSON
//! (`null`, `true`, `42`, `"text"`, `[...]`, `{"handle": 7}`).

use serde::{Deserialize, Serialize};

use crate::errors::DispatchError;

/// A dynamically typed argument or result.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Empty,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Array(Vec<Value>),
    /// Opaque reference to another dispatch object owned by the caller.
    Object { handle: u64 },
}

impl Value {
    pub fn is_empty(&self) -> bool {
        matches!(self, Value::Empty)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Empty => "empty",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Array(_) => "array",
            Value::Object { .. } => "object",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(i64::from(v))
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
        Value::Str(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::Array(v)
    }
}

// ---------------------------------------------------------------------------
// Declared types and coercion
// ---------------------------------------------------------------------------

/// Declared type of a parameter or result in a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VarType {
    /// No coercion (`VT_VARIANT`).
    #[default]
    Any,
    /// Result is discarded (`VT_VOID`).
    Void,
    Bool,
    Int,
    Float,
    String,
    Object,
}

impl VarType {
    /// Coerce `value` to this type, following the usual `VariantChangeType`
    /// conversions between numbers, booleans and their string forms.
    pub fn coerce(self, value: Value, context: &str) -> Result<Value, DispatchError> {
        let mismatch = |value: &Value| DispatchError::TypeMismatch {
            context: format!("{context} ({})", value.type_name()),
            expected: format!("{self:?}").to_lowercase(),
        };

        match (self, value) {
            (VarType::Any, v) => Ok(v),
            (VarType::Void, _) => Ok(Value::Empty),
            (_, Value::Empty) => Ok(Value::Empty),

            (VarType::Bool, Value::Bool(b)) => Ok(Value::Bool(b)),
            (VarType::Bool, Value::Int(i)) => Ok(Value::Bool(i != 0)),
            (VarType::Bool, Value::Str(s)) => match s.to_ascii_lowercase().as_str() {
                "true" | "1" => Ok(Value::Bool(true)),
                "false" | "0" => Ok(Value::Bool(false)),
                _ => Err(mismatch(&Value::Str(s))),
            },

            (VarType::Int, Value::Int(i)) => Ok(Value::Int(i)),
            (VarType::Int, Value::Bool(b)) => Ok(Value::Int(if b { -1 } else { 0 })),
            (VarType::Int, Value::Float(f)) => Ok(Value::Int(f.round() as i64)),
            (VarType::Int, Value::Str(s)) => match s.trim().parse::<i64>() {
                Ok(i) => Ok(Value::Int(i)),
                Err(_) => Err(mismatch(&Value::Str(s))),
            },

            (VarType::Float, Value::Float(f)) => Ok(Value::Float(f)),
            (VarType::Float, Value::Int(i)) => Ok(Value::Float(i as f64)),
            (VarType::Float, Value::Str(s)) => match s.trim().parse::<f64>() {
                Ok(f) => Ok(Value::Float(f)),
                Err(_) => Err(mismatch(&Value::Str(s))),
            },

            (VarType::String, Value::Str(s)) => Ok(Value::Str(s)),
            (VarType::String, Value::Int(i)) => Ok(Value::Str(i.to_string())),
            (VarType::String, Value::Float(f)) => Ok(Value::Str(f.to_string())),
            (VarType::String, Value::Bool(b)) => {
                Ok(Value::Str(if b { "True" } else { "False" }.to_owned()))
            }

            (VarType::Object, v @ Value::Object { .. }) => Ok(v),

            (_, v) => Err(mismatch(&v)),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
