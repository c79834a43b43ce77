//! Values carried by unit outputs and events.
//!
//! `Value` is what a block or formula outputs, what events carry and what
//! persistent state snapshots contain. `Output` wraps it with the
//! "no value yet" state a unit starts in.

use serde::{Deserialize, Serialize};

/// Possible values of a unit output or an event.
///
/// # Examples
///
/// ```
/// use kyrocircuit::Value;
///
/// let bool_val = Value::Bool(true);
/// let int_val = Value::Int(3);
/// let string_val = Value::String("hello".to_string());
///
/// assert!(bool_val.is_bool());
/// assert!(int_val.is_int());
/// assert!(string_val.is_string());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<Value>),
    Structured(serde_json::Value),
    #[default]
    Null,
}

#[allow(missing_docs)]
impl Value {
    pub const fn is_bool(&self) -> bool {
        matches!(self, Self::Bool(_))
    }

    pub const fn is_int(&self) -> bool {
        matches!(self, Self::Int(_))
    }

    pub const fn is_float(&self) -> bool {
        matches!(self, Self::Float(_))
    }

    pub const fn is_string(&self) -> bool {
        matches!(self, Self::String(_))
    }

    pub const fn is_list(&self) -> bool {
        matches!(self, Self::List(_))
    }

    pub const fn is_structured(&self) -> bool {
        matches!(self, Self::Structured(_))
    }

    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            #[allow(clippy::cast_precision_loss)]
            Self::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_string(&self) -> Option<&str> {
        match self {
            Self::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(v) => Some(v),
            _ => None,
        }
    }

    pub const fn as_structured(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Structured(v) => Some(v),
            _ => None,
        }
    }

    /// Returns a human-readable type name.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::List(_) => "list",
            Self::Structured(_) => "structured",
            Self::Null => "null",
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::String(v) => write!(f, "{v:?}"),
            Self::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Self::Structured(v) => write!(f, "{v}"),
            Self::Null => write!(f, "null"),
        }
    }
}

// Convenient From implementations
impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Self::List(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Self::Structured(v)
    }
}

/// Output of a block or formula.
///
/// Every unit starts `Undefined`. The only way to change an output is
/// `set_output(Value)`, so once a unit holds a value it can never go back.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Output {
    /// No value yet.
    #[default]
    Undefined,
    /// A legal value.
    Defined(Value),
}

impl Output {
    /// Returns true if a value is present.
    #[must_use]
    pub const fn is_defined(&self) -> bool {
        matches!(self, Self::Defined(_))
    }

    /// Returns the value, if any.
    #[must_use]
    pub const fn value(&self) -> Option<&Value> {
        match self {
            Self::Defined(v) => Some(v),
            Self::Undefined => None,
        }
    }

    /// Converts into the value, if any.
    #[must_use]
    pub fn into_value(self) -> Option<Value> {
        match self {
            Self::Defined(v) => Some(v),
            Self::Undefined => None,
        }
    }

    pub(crate) fn holds(&self, value: &Value) -> bool {
        matches!(self, Self::Defined(v) if v == value)
    }
}

impl std::fmt::Display for Output {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Defined(v) => write!(f, "{v}"),
            Self::Undefined => write!(f, "<UNDEF>"),
        }
    }
}
