//! Argument values bound to data-driven tests
//!
//! Every value handed to a test body, a class constructor or an injected
//! property is an [`ArgValue`]. Its [`ArgValue::format_argument`] rendering is
//! the one used both for test ids and for display names, so the two can never
//! drift apart.

use serde::{Deserialize, Serialize};

/// A single argument value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgValue {
    /// Null / absent value
    Null,
    /// Boolean value
    Bool(bool),
    /// Integer value
    Int(i64),
    /// Float value
    Float(f64),
    /// String value
    Str(String),
    /// Single character
    Char(char),
    /// List of values
    List(Vec<ArgValue>),
}

impl ArgValue {
    /// Format the value for ids and display names.
    ///
    /// `null` for null, strings in double quotes, chars in single quotes,
    /// lower-case booleans, everything else in its natural form.
    pub fn format_argument(&self) -> String {
        match self {
            ArgValue::Null => "null".to_string(),
            ArgValue::Bool(v) => v.to_string(),
            ArgValue::Int(v) => v.to_string(),
            ArgValue::Float(v) => v.to_string(),
            ArgValue::Char(c) => format!("'{}'", c),
            ArgValue::Str(s) => format!("\"{}\"", s),
            ArgValue::List(values) => format!("[{}]", format_arguments(values)),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, ArgValue::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ArgValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ArgValue::Float(v) => Some(*v),
            ArgValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ArgValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ArgValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

/// Comma-join a row of arguments with [`ArgValue::format_argument`]
pub fn format_arguments(values: &[ArgValue]) -> String {
    values
        .iter()
        .map(ArgValue::format_argument)
        .collect::<Vec<_>>()
        .join(", ")
}

impl std::fmt::Display for ArgValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.format_argument())
    }
}

macro_rules! impl_from_int {
    ($($t:ty),*) => {
        $(
            impl From<$t> for ArgValue {
                fn from(v: $t) -> Self {
                    ArgValue::Int(v as i64)
                }
            }
        )*
    };
}

impl_from_int!(i8, i16, i32, i64, u8, u16, u32);

impl From<f32> for ArgValue {
    fn from(v: f32) -> Self {
        ArgValue::Float(v as f64)
    }
}

impl From<f64> for ArgValue {
    fn from(v: f64) -> Self {
        ArgValue::Float(v)
    }
}

impl From<bool> for ArgValue {
    fn from(v: bool) -> Self {
        ArgValue::Bool(v)
    }
}

impl From<char> for ArgValue {
    fn from(v: char) -> Self {
        ArgValue::Char(v)
    }
}

impl From<&str> for ArgValue {
    fn from(v: &str) -> Self {
        ArgValue::Str(v.to_string())
    }
}

impl From<String> for ArgValue {
    fn from(v: String) -> Self {
        ArgValue::Str(v)
    }
}

impl<T: Into<ArgValue>> From<Option<T>> for ArgValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(ArgValue::Null)
    }
}

impl<T: Into<ArgValue>> From<Vec<T>> for ArgValue {
    fn from(v: Vec<T>) -> Self {
        ArgValue::List(v.into_iter().map(Into::into).collect())
    }
}

impl From<serde_json::Value> for ArgValue {
    fn from(v: serde_json::Value) -> Self {
        use serde_json::Value;
        match v {
            Value::Null => ArgValue::Null,
            Value::Bool(b) => ArgValue::Bool(b),
            Value::Number(n) => n
                .as_i64()
                .map(ArgValue::Int)
                .or_else(|| n.as_f64().map(ArgValue::Float))
                .unwrap_or(ArgValue::Null),
            Value::String(s) => ArgValue::Str(s),
            Value::Array(items) => ArgValue::List(items.into_iter().map(Into::into).collect()),
            // Objects have no argument form of their own; keep their JSON text.
            other @ Value::Object(_) => ArgValue::Str(other.to_string()),
        }
    }
}

/// Build a row of [`ArgValue`]s: `args![1, "a", true]`
#[macro_export]
macro_rules! args {
    () => { ::std::vec::Vec::<$crate::ArgValue>::new() };
    ($($value:expr),+ $(,)?) => {
        vec![$($crate::ArgValue::from($value)),+]
    };
}
