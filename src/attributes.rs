use std::collections::HashMap;

use derive_more::From;
use serde::{Deserialize, Serialize};

/// Attributes supplied by the caller alongside the key being evaluated.
pub type Attributes = HashMap<String, AttributeValue>;

/// Value of a single caller-supplied attribute.
///
/// Numbers are stored as `f64`. Numeric matchers only accept values without a fractional part, so
/// `101.3` never matches a `NUMBER` matcher while `101.0` does.
#[derive(Debug, Serialize, Deserialize, PartialEq, From, Clone)]
#[serde(untagged)]
pub enum AttributeValue {
    Boolean(bool),
    Number(f64),
    String(String),
    List(Vec<String>),
    Null,
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<i32> for AttributeValue {
    fn from(value: i32) -> Self {
        Self::Number(f64::from(value))
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        Self::Number(value as f64)
    }
}

impl From<Vec<&str>> for AttributeValue {
    fn from(value: Vec<&str>) -> Self {
        Self::List(value.into_iter().map(str::to_owned).collect())
    }
}

impl AttributeValue {
    /// Integral value of a number. Returns `None` for non-numbers and numbers with a fractional
    /// part.
    pub(crate) fn as_integer(&self) -> Option<i64> {
        match self {
            AttributeValue::Number(n) if n.is_finite() && n.fract() == 0.0 => Some(*n as i64),
            _ => None,
        }
    }

    pub(crate) fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub(crate) fn as_list(&self) -> Option<&[String]> {
        match self {
            AttributeValue::List(list) => Some(list),
            _ => None,
        }
    }
}
