//! Core value type shared by the registry, the hook pipeline and the transports.
//!
//! Every parameter read or written through an [`Instrument`](crate::instrument::Instrument)
//! is a [`ParameterValue`]. The absence marker is `Option::None`; there is no null
//! variant.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Dynamically typed value of an instrument parameter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    /// Boolean value, rendered on the wire as `True`/`False`
    Bool(bool),
    /// 64-bit signed integer
    Int(i64),
    /// 64-bit floating point number
    Float(f64),
    /// UTF-8 string, sent to the wire verbatim
    String(String),
    /// Array of integers (e.g. a block of registers)
    IntArray(Vec<i64>),
    /// Nested array of values
    Array(Vec<ParameterValue>),
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterValue::Bool(true) => write!(f, "True"),
            ParameterValue::Bool(false) => write!(f, "False"),
            ParameterValue::Int(i) => write!(f, "{}", i),
            // Whole floats keep their fraction: `5.0`, not `5`.
            ParameterValue::Float(fl) if fl.is_finite() && fl.fract() == 0.0 => {
                write!(f, "{:.1}", fl)
            }
            ParameterValue::Float(fl) => write!(f, "{}", fl),
            ParameterValue::String(s) => write!(f, "{}", s),
            ParameterValue::IntArray(_) | ParameterValue::Array(_) => {
                let json = serde_json::to_string(self).map_err(|_| fmt::Error)?;
                write!(f, "{}", json)
            }
        }
    }
}

impl ParameterValue {
    /// Wraps a token received as text (remote data channel, transport reply).
    ///
    /// Text stays text; conversion to numbers is the job of post-hooks.
    pub fn parse_wire(text: &str) -> Self {
        ParameterValue::String(text.to_string())
    }

    /// Borrow the value as a string slice, if it is one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParameterValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Extract value as f64
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParameterValue::Float(f) => Some(*f),
            ParameterValue::Int(i) => Some(*i as f64),
            ParameterValue::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Extract value as i64
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ParameterValue::Int(i) => Some(*i),
            ParameterValue::Float(f) => Some(*f as i64),
            ParameterValue::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Extract value as bool, accepting the `True`/`False` wire spelling.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParameterValue::Bool(b) => Some(*b),
            ParameterValue::String(s) => match s.trim() {
                "True" | "true" | "1" => Some(true),
                "False" | "false" | "0" => Some(false),
                _ => None,
            },
            ParameterValue::Int(i) => Some(*i != 0),
            _ => None,
        }
    }

    /// True if the rendered value contains whitespace.
    pub fn contains_whitespace(&self) -> bool {
        match self {
            ParameterValue::String(s) => s.chars().any(char::is_whitespace),
            _ => false,
        }
    }
}

impl From<bool> for ParameterValue {
    fn from(value: bool) -> Self {
        ParameterValue::Bool(value)
    }
}

impl From<i64> for ParameterValue {
    fn from(value: i64) -> Self {
        ParameterValue::Int(value)
    }
}

impl From<i32> for ParameterValue {
    fn from(value: i32) -> Self {
        ParameterValue::Int(value.into())
    }
}

impl From<f64> for ParameterValue {
    fn from(value: f64) -> Self {
        ParameterValue::Float(value)
    }
}

impl From<&str> for ParameterValue {
    fn from(value: &str) -> Self {
        ParameterValue::String(value.to_string())
    }
}

impl From<String> for ParameterValue {
    fn from(value: String) -> Self {
        ParameterValue::String(value)
    }
}

impl From<Vec<i64>> for ParameterValue {
    fn from(value: Vec<i64>) -> Self {
        ParameterValue::IntArray(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_rendering() {
        assert_eq!(ParameterValue::from(true).to_string(), "True");
        assert_eq!(ParameterValue::from(false).to_string(), "False");
        assert_eq!(ParameterValue::from(5).to_string(), "5");
        assert_eq!(ParameterValue::from(2.5).to_string(), "2.5");
        assert_eq!(ParameterValue::from(5.0).to_string(), "5.0");
        assert_eq!(ParameterValue::from(-0.0).to_string(), "-0.0");
        assert_eq!(ParameterValue::from("ON").to_string(), "ON");
        assert_eq!(ParameterValue::from(vec![1, 2, 3]).to_string(), "[1,2,3]");
    }

    #[test]
    fn test_numeric_extraction_from_text() {
        let v = ParameterValue::parse_wire(" 4.25 ");
        assert_eq!(v.as_f64(), Some(4.25));
        assert_eq!(ParameterValue::from("12").as_i64(), Some(12));
        assert_eq!(ParameterValue::from("volts").as_f64(), None);
    }

    #[test]
    fn test_bool_extraction() {
        assert_eq!(ParameterValue::from("True").as_bool(), Some(true));
        assert_eq!(ParameterValue::from("False").as_bool(), Some(false));
        assert_eq!(ParameterValue::from("maybe").as_bool(), None);
    }

    #[test]
    fn test_untagged_deserialization() {
        let v: ParameterValue = serde_json::from_str("42").unwrap();
        assert_eq!(v, ParameterValue::Int(42));
        let v: ParameterValue = serde_json::from_str("1.5").unwrap();
        assert_eq!(v, ParameterValue::Float(1.5));
        let v: ParameterValue = serde_json::from_str("\"OFF\"").unwrap();
        assert_eq!(v, ParameterValue::String("OFF".into()));
        let v: ParameterValue = serde_json::from_str("[1,2]").unwrap();
        assert_eq!(v, ParameterValue::IntArray(vec![1, 2]));
    }

    #[test]
    fn test_whitespace_detection() {
        assert!(ParameterValue::from("1 2").contains_whitespace());
        assert!(!ParameterValue::from("12").contains_whitespace());
        assert!(!ParameterValue::from(12).contains_whitespace());
    }
}
