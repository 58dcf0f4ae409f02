//! Inverted value-to-id maps backing secondary lookups.

use std::collections::HashMap;
use std::sync::RwLock;

/// A secondary index for one (collection, field) pair: stringified field
/// values mapped to the ids of the documents carrying them. Buckets keep
/// insertion order and never hold duplicates.
pub struct Index {
    field: String,
    entries: RwLock<HashMap<String, Vec<String>>>,
}

impl Index {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// The document field this index covers.
    pub fn field(&self) -> &str {
        &self.field
    }

    /// Adds a document id under the stringified value.
    pub fn put(&self, value: impl Into<String>, doc_id: impl Into<String>) {
        let doc_id = doc_id.into();
        let mut entries = self.entries.write().unwrap();
        let bucket = entries.entry(value.into()).or_default();
        if !bucket.iter().any(|id| id == &doc_id) {
            bucket.push(doc_id);
        }
    }

    /// Returns a copy of the ids stored under the value, in insertion order.
    pub fn get(&self, value: &str) -> Vec<String> {
        self.entries
            .read()
            .unwrap()
            .get(value)
            .cloned()
            .unwrap_or_default()
    }

    /// Removes the id from every bucket, dropping buckets that empty out.
    pub fn delete(&self, doc_id: &str) {
        let mut entries = self.entries.write().unwrap();
        for bucket in entries.values_mut() {
            bucket.retain(|id| id != doc_id);
        }
        entries.retain(|_, bucket| !bucket.is_empty());
    }

    /// Number of distinct values with at least one live id.
    pub fn size(&self) -> usize {
        self.entries.read().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_and_get() {
        let index = Index::new("email");
        index.put("a@example.com", "u1");
        index.put("b@example.com", "u2");

        assert_eq!(index.get("a@example.com"), vec!["u1"]);
        assert_eq!(index.get("b@example.com"), vec!["u2"]);
        assert!(index.get("c@example.com").is_empty());
        assert_eq!(index.size(), 2);
        assert_eq!(index.field(), "email");
    }

    #[test]
    fn test_bucket_keeps_insertion_order_without_duplicates() {
        let index = Index::new("email");
        index.put("shared@example.com", "u1");
        index.put("shared@example.com", "u2");
        index.put("shared@example.com", "u1");

        assert_eq!(index.get("shared@example.com"), vec!["u1", "u2"]);
        assert_eq!(index.size(), 1);
    }

    #[test]
    fn test_delete_sweeps_all_buckets() {
        let index = Index::new("tag");
        index.put("red", "u1");
        index.put("blue", "u1");
        index.put("blue", "u2");

        index.delete("u1");

        assert!(index.get("red").is_empty());
        assert_eq!(index.get("blue"), vec!["u2"]);
        // Emptied buckets are dropped entirely.
        assert_eq!(index.size(), 1);
    }

    #[test]
    fn test_get_returns_defensive_copy() {
        let index = Index::new("email");
        index.put("a@example.com", "u1");

        let mut copy = index.get("a@example.com");
        copy.push("intruder".to_string());

        assert_eq!(index.get("a@example.com"), vec!["u1"]);
    }
}
