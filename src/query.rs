//! Equality filtering and aggregation over document bodies.

use serde::{Deserialize, Serialize};

use crate::value::{Body, Document, Value};

/// Returns true when every filter field matches the document body.
///
/// Filter keys are dot-notation paths into nested objects; values compare
/// with [`values_equal`]. An empty filter matches everything.
pub fn matches_filter(body: &Body, filter: &Body) -> bool {
    filter.iter().all(|(path, expected)| {
        lookup_path(body, path).is_some_and(|actual| values_equal(actual, expected))
    })
}

/// Resolves a dot-notation field path against nested objects. A missing
/// intermediate level short-circuits to None.
pub fn lookup_path<'a>(body: &'a Body, path: &str) -> Option<&'a Value> {
    let mut current = body;
    let mut parts = path.split('.').peekable();
    while let Some(part) = parts.next() {
        if parts.peek().is_none() {
            return current.get(part);
        }
        match current.get(part) {
            Some(Value::Object(next)) => current = next,
            _ => return None,
        }
    }
    None
}

/// Type-tolerant equality: direct match first, then numeric widening to
/// f64, then byte-wise string and boolean comparisons. Everything else is
/// unequal.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return x == y;
    }
    match (a, b) {
        (Value::String(x), Value::String(y)) => x.as_bytes() == y.as_bytes(),
        (Value::Bool(x), Value::Bool(y)) => x == y,
        _ => false,
    }
}

/// The fold applied by an [`AggregateOp`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggregateKind {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

/// One aggregation over a (possibly nested) field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateOp {
    pub kind: AggregateKind,
    pub field: String,
}

impl AggregateOp {
    pub fn new(kind: AggregateKind, field: impl Into<String>) -> Self {
        Self {
            kind,
            field: field.into(),
        }
    }
}

/// Folds the requested aggregates over a document set, keyed by field.
///
/// Sum and avg consider numeric values only; min and max yield Null when no
/// document carries a numeric value for the field.
pub fn aggregate(docs: &[Document], ops: &[AggregateOp]) -> Body {
    let mut result = Body::new();
    for op in ops {
        let value = match op.kind {
            AggregateKind::Count => Value::Int(docs.len() as i64),
            AggregateKind::Sum => Value::Float(sum(docs, &op.field)),
            AggregateKind::Avg => {
                if docs.is_empty() {
                    Value::Float(0.0)
                } else {
                    Value::Float(sum(docs, &op.field) / docs.len() as f64)
                }
            }
            AggregateKind::Min => extremum(docs, &op.field, |candidate, best| candidate < best),
            AggregateKind::Max => extremum(docs, &op.field, |candidate, best| candidate > best),
        };
        result.insert(op.field.clone(), value);
    }
    result
}

fn sum(docs: &[Document], field: &str) -> f64 {
    docs.iter()
        .filter_map(|doc| lookup_path(&doc.body, field).and_then(Value::as_f64))
        .sum()
}

fn extremum(docs: &[Document], field: &str, better: impl Fn(f64, f64) -> bool) -> Value {
    let mut best: Option<(f64, &Value)> = None;
    for doc in docs {
        if let Some(value) = lookup_path(&doc.body, field) {
            if let Some(n) = value.as_f64() {
                match best {
                    Some((current, _)) if !better(n, current) => {}
                    _ => best = Some((n, value)),
                }
            }
        }
    }
    best.map_or(Value::Null, |(_, value)| value.clone())
}
