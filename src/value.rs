//! Dynamic document values and the versioned document record.

use std::collections::BTreeMap;
use std::fmt::{self, Display};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// Rough in-memory estimate for arrays, objects and whole documents.
const COMPOSITE_SIZE_ESTIMATE: usize = 64;

/// A document body: field names mapped to dynamic values.
pub type Body = BTreeMap<String, Value>;

/// A dynamic field value.
///
/// This is the full set of shapes a document body can hold. Cross-kind
/// equality (e.g. `Int(30)` against `Float(30.0)`) goes through
/// [`crate::query::values_equal`], never through `PartialEq` directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// Null value.
    Null,
    /// Boolean value.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Double-precision float.
    Float(f64),
    /// UTF-8 string.
    String(String),
    /// Ordered list of values.
    Array(Vec<Value>),
    /// Nested mapping with string keys.
    Object(BTreeMap<String, Value>),
}

impl Value {
    /// Widens any numeric value to f64, or None for non-numeric kinds.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(n) => Some(*n as f64),
            Value::Float(n) => Some(*n),
            _ => None,
        }
    }

    /// Approximate in-memory footprint: string length for strings, a word
    /// for scalars, a flat estimate for composites.
    pub fn estimated_size(&self) -> usize {
        match self {
            Value::String(s) => s.len(),
            Value::Null | Value::Int(_) | Value::Float(_) => 8,
            Value::Bool(_) => 1,
            Value::Array(_) | Value::Object(_) => COMPOSITE_SIZE_ESTIMATE,
        }
    }
}

impl Display for Value {
    /// The stringified form used as secondary index bucket keys.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(n) => write!(f, "{n}"),
            Value::Float(n) => write!(f, "{n}"),
            Value::String(s) => write!(f, "{s}"),
            Value::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Value::Object(fields) => {
                write!(f, "{{")?;
                for (i, (key, value)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{key}: {value}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

/// A versioned record stored in a collection.
///
/// Timestamps and the version counter are managed by the engine: the first
/// put of a key creates version 1, every later put bumps the version and
/// preserves `created_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Caller-assigned identifier, unique within its collection.
    pub id: String,
    /// The document fields.
    pub body: Body,
    /// Set on first put, preserved by updates.
    pub created_at: SystemTime,
    /// Refreshed on every put.
    pub updated_at: SystemTime,
    /// Strictly monotonic per key, starting at 1.
    pub version: i64,
}

impl Document {
    /// Creates a version-1 document stamped with the current time.
    pub fn new(id: impl Into<String>, body: Body) -> Self {
        let now = SystemTime::now();
        Self {
            id: id.into(),
            body,
            created_at: now,
            updated_at: now,
            version: 1,
        }
    }

    /// Approximate footprint used for memtable accounting. Documents count
    /// as composites regardless of body size.
    pub fn estimated_size(&self) -> usize {
        COMPOSITE_SIZE_ESTIMATE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stringified_values() {
        assert_eq!(Value::Null.to_string(), "null");
        assert_eq!(Value::Bool(true).to_string(), "true");
        assert_eq!(Value::Int(42).to_string(), "42");
        assert_eq!(Value::Float(30.0).to_string(), "30");
        assert_eq!(Value::Float(31.5).to_string(), "31.5");
        assert_eq!(Value::String("alice".into()).to_string(), "alice");
        assert_eq!(
            Value::Array(vec![Value::Int(1), Value::String("two".into())]).to_string(),
            "[1, two]"
        );
    }

    #[test]
    fn test_numeric_widening() {
        assert_eq!(Value::Int(30).as_f64(), Some(30.0));
        assert_eq!(Value::Float(30.5).as_f64(), Some(30.5));
        assert_eq!(Value::String("30".into()).as_f64(), None);
        assert_eq!(Value::Bool(true).as_f64(), None);
    }

    #[test]
    fn test_estimated_sizes() {
        assert_eq!(Value::String("hello".into()).estimated_size(), 5);
        assert_eq!(Value::Int(7).estimated_size(), 8);
        assert_eq!(Value::Bool(false).estimated_size(), 1);
        assert_eq!(Value::Object(BTreeMap::new()).estimated_size(), 64);
    }

    #[test]
    fn test_new_document_is_version_one() {
        let doc = Document::new("u1", Body::new());
        assert_eq!(doc.version, 1);
        assert_eq!(doc.created_at, doc.updated_at);
    }
}
