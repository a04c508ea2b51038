//! Typed parameter values for commands.
//!
//! Commands declare their parameters by registering a default value. The type of that
//! default fixes the type every later value must have; rules and constraints (see
//! [`crate::rules`]) then decide whether a value is acceptable.
//!
//! Values are deserialized untagged, so the natural TOML spelling works everywhere a
//! parameter is read from a file:
//!
//! ```toml
//! [parameters.board]
//! "configure.clockSource" = "external"
//! "configure.latency" = 42
//! "align.channels" = [0, 1, 2, 3]
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Named parameter values, ordered by name.
pub type ParameterSet = BTreeMap<String, ParameterValue>;

/// Type tag of a [`ParameterValue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParameterType {
    /// Boolean flag
    Bool,
    /// Signed integer
    Int,
    /// Floating-point number
    Float,
    /// UTF-8 string
    String,
    /// List of integers
    IntList,
    /// List of floats
    FloatList,
    /// List of strings
    StringList,
}

impl ParameterType {
    /// True for scalar numeric types.
    pub fn is_number(self) -> bool {
        matches!(self, ParameterType::Int | ParameterType::Float)
    }

    /// True for numeric list types.
    pub fn is_number_list(self) -> bool {
        matches!(self, ParameterType::IntList | ParameterType::FloatList)
    }

    /// True for any list type.
    pub fn is_list(self) -> bool {
        self.is_number_list() || self == ParameterType::StringList
    }
}

impl fmt::Display for ParameterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ParameterType::Bool => "bool",
            ParameterType::Int => "int",
            ParameterType::Float => "float",
            ParameterType::String => "string",
            ParameterType::IntList => "vector<int>",
            ParameterType::FloatList => "vector<float>",
            ParameterType::StringList => "vector<string>",
        };
        f.write_str(name)
    }
}

/// A single parameter (or result) value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    /// Boolean flag
    Bool(bool),
    /// Signed integer
    Int(i64),
    /// Floating-point number
    Float(f64),
    /// UTF-8 string
    String(String),
    /// List of integers
    IntList(Vec<i64>),
    /// List of floats
    FloatList(Vec<f64>),
    /// List of strings
    StringList(Vec<String>),
}

impl ParameterValue {
    /// Type tag of this value.
    pub fn parameter_type(&self) -> ParameterType {
        match self {
            ParameterValue::Bool(_) => ParameterType::Bool,
            ParameterValue::Int(_) => ParameterType::Int,
            ParameterValue::Float(_) => ParameterType::Float,
            ParameterValue::String(_) => ParameterType::String,
            ParameterValue::IntList(_) => ParameterType::IntList,
            ParameterValue::FloatList(_) => ParameterType::FloatList,
            ParameterValue::StringList(_) => ParameterType::StringList,
        }
    }

    /// Numeric view of a scalar number.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParameterValue::Int(v) => Some(*v as f64),
            ParameterValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Numeric view of a number list.
    pub fn as_f64_list(&self) -> Option<Vec<f64>> {
        match self {
            ParameterValue::IntList(v) => Some(v.iter().map(|x| *x as f64).collect()),
            ParameterValue::FloatList(v) => Some(v.clone()),
            _ => None,
        }
    }

    /// String view.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParameterValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Integer view.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ParameterValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Boolean view.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParameterValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Number of elements for list values, `None` for scalars.
    pub fn len(&self) -> Option<usize> {
        match self {
            ParameterValue::IntList(v) => Some(v.len()),
            ParameterValue::FloatList(v) => Some(v.len()),
            ParameterValue::StringList(v) => Some(v.len()),
            _ => None,
        }
    }

    /// True for empty lists.
    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn list<T: fmt::Display>(f: &mut fmt::Formatter<'_>, items: &[T]) -> fmt::Result {
            f.write_str("[")?;
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{}", item)?;
            }
            f.write_str("]")
        }

        match self {
            ParameterValue::Bool(v) => write!(f, "{}", v),
            ParameterValue::Int(v) => write!(f, "{}", v),
            ParameterValue::Float(v) => write!(f, "{}", v),
            ParameterValue::String(v) => write!(f, "\"{}\"", v),
            ParameterValue::IntList(v) => list(f, v),
            ParameterValue::FloatList(v) => list(f, v),
            ParameterValue::StringList(v) => list(f, v),
        }
    }
}

impl From<bool> for ParameterValue {
    fn from(v: bool) -> Self {
        ParameterValue::Bool(v)
    }
}

impl From<i64> for ParameterValue {
    fn from(v: i64) -> Self {
        ParameterValue::Int(v)
    }
}

impl From<i32> for ParameterValue {
    fn from(v: i32) -> Self {
        ParameterValue::Int(i64::from(v))
    }
}

impl From<u32> for ParameterValue {
    fn from(v: u32) -> Self {
        ParameterValue::Int(i64::from(v))
    }
}

impl From<f64> for ParameterValue {
    fn from(v: f64) -> Self {
        ParameterValue::Float(v)
    }
}

impl From<&str> for ParameterValue {
    fn from(v: &str) -> Self {
        ParameterValue::String(v.to_string())
    }
}

impl From<String> for ParameterValue {
    fn from(v: String) -> Self {
        ParameterValue::String(v)
    }
}

impl From<Vec<i64>> for ParameterValue {
    fn from(v: Vec<i64>) -> Self {
        ParameterValue::IntList(v)
    }
}

impl From<Vec<f64>> for ParameterValue {
    fn from(v: Vec<f64>) -> Self {
        ParameterValue::FloatList(v)
    }
}

impl From<Vec<String>> for ParameterValue {
    fn from(v: Vec<String>) -> Self {
        ParameterValue::StringList(v)
    }
}

/// Build a [`ParameterSet`] from `(name, value)` pairs.
///
/// ```
/// use rust_swatch::parameter::{parameter_set, ParameterValue};
///
/// let params = parameter_set([("latency", ParameterValue::from(4)), ("mode", "fast".into())]);
/// assert_eq!(params.len(), 2);
/// ```
pub fn parameter_set<I, K>(items: I) -> ParameterSet
where
    I: IntoIterator<Item = (K, ParameterValue)>,
    K: Into<String>,
{
    items.into_iter().map(|(k, v)| (k.into(), v)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_types() {
        assert_eq!(ParameterValue::from(3).parameter_type(), ParameterType::Int);
        assert_eq!(ParameterValue::from(3.5).parameter_type(), ParameterType::Float);
        assert_eq!(ParameterValue::from("x").parameter_type(), ParameterType::String);
        assert_eq!(
            ParameterValue::from(vec![1.0, 2.0]).parameter_type(),
            ParameterType::FloatList
        );
        assert!(ParameterType::IntList.is_number_list());
        assert!(ParameterType::StringList.is_list());
        assert!(!ParameterType::Bool.is_number());
    }

    #[test]
    fn test_numeric_views() {
        assert_eq!(ParameterValue::Int(4).as_f64(), Some(4.0));
        assert_eq!(ParameterValue::from("4").as_f64(), None);
        assert_eq!(
            ParameterValue::IntList(vec![1, 2]).as_f64_list(),
            Some(vec![1.0, 2.0])
        );
        assert_eq!(ParameterValue::StringList(vec![]).len(), Some(0));
        assert!(ParameterValue::StringList(vec![]).is_empty());
        assert!(!ParameterValue::Int(0).is_empty());
    }

    #[test]
    fn test_display() {
        assert_eq!(ParameterValue::from("abc").to_string(), "\"abc\"");
        assert_eq!(ParameterValue::IntList(vec![1, 2, 3]).to_string(), "[1, 2, 3]");
        assert_eq!(ParameterType::FloatList.to_string(), "vector<float>");
    }

    #[test]
    fn test_deserialize_from_toml() {
        #[derive(Deserialize)]
        struct Doc {
            values: ParameterSet,
        }

        let doc: Doc = toml::from_str(
            r#"
            [values]
            flag = true
            latency = 42
            threshold = 0.5
            source = "external"
            channels = [0, 1, 2]
            names = ["a", "b"]
            "#,
        )
        .unwrap();

        assert_eq!(doc.values["flag"], ParameterValue::Bool(true));
        assert_eq!(doc.values["latency"], ParameterValue::Int(42));
        assert_eq!(doc.values["threshold"], ParameterValue::Float(0.5));
        assert_eq!(doc.values["source"], ParameterValue::from("external"));
        assert_eq!(doc.values["channels"], ParameterValue::IntList(vec![0, 1, 2]));
        assert_eq!(
            doc.values["names"],
            ParameterValue::StringList(vec!["a".to_string(), "b".to_string()])
        );
    }
}
