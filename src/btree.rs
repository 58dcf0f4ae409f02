//! On-disk ordered map holding flushed documents.
//!
//! An order-256 B-tree kept fully in memory and serialized as a single
//! image into the backing file on close. Descent is top-down with the
//! parent on the call stack; nodes carry no back references. Durability for
//! data that has not reached the image yet comes from the WAL, not from
//! this layer.
//!
//! Deletion swaps an internal entry with its in-order predecessor and never
//! rebalances; underfull nodes persist until the next flush rebuilds the
//! affected range.

use std::fs::File;
use std::io::{BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::value::Document;

/// Maximum number of children per node; nodes split beyond ORDER - 1 keys.
const ORDER: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Node {
    is_leaf: bool,
    keys: Vec<String>,
    values: Vec<Document>,
    children: Vec<Node>,
}

impl Node {
    fn leaf() -> Self {
        Self {
            is_leaf: true,
            keys: Vec::new(),
            values: Vec::new(),
            children: Vec::new(),
        }
    }

    fn is_overfull(&self) -> bool {
        self.keys.len() > ORDER - 1
    }

    fn insert(&mut self, key: String, value: Document) {
        match self.keys.binary_search(&key) {
            // Duplicate keys overwrite wherever they live.
            Ok(pos) => self.values[pos] = value,
            Err(pos) => {
                if self.is_leaf {
                    self.keys.insert(pos, key);
                    self.values.insert(pos, value);
                } else {
                    self.children[pos].insert(key, value);
                    if self.children[pos].is_overfull() {
                        self.split_child(pos);
                    }
                }
            }
        }
    }

    /// Splits `children[idx]` around its middle entry, which rises into
    /// this node. Keys past the middle become the new right sibling.
    fn split_child(&mut self, idx: usize) {
        let child = &mut self.children[idx];
        let mid = child.keys.len() / 2;

        let rising_key = child.keys.remove(mid);
        let rising_value = child.values.remove(mid);
        let right = Node {
            is_leaf: child.is_leaf,
            keys: child.keys.split_off(mid),
            values: child.values.split_off(mid),
            children: if child.is_leaf {
                Vec::new()
            } else {
                child.children.split_off(mid + 1)
            },
        };

        self.keys.insert(idx, rising_key);
        self.values.insert(idx, rising_value);
        self.children.insert(idx + 1, right);
    }

    fn search(&self, key: &str) -> Option<&Document> {
        match self.keys.binary_search_by(|k| k.as_str().cmp(key)) {
            Ok(pos) => Some(&self.values[pos]),
            Err(_) if self.is_leaf => None,
            Err(pos) => self.children[pos].search(key),
        }
    }

    fn remove(&mut self, key: &str) -> bool {
        match self.keys.binary_search_by(|k| k.as_str().cmp(key)) {
            Ok(pos) if self.is_leaf => {
                self.keys.remove(pos);
                self.values.remove(pos);
                true
            }
            Ok(pos) => {
                self.remove_from_internal(pos);
                true
            }
            Err(_) if self.is_leaf => false,
            Err(pos) => self.children[pos].remove(key),
        }
    }

    /// Replaces the entry at `pos` with its in-order predecessor, taken
    /// from the rightmost leaf of the left subtree.
    fn remove_from_internal(&mut self, pos: usize) {
        match self.children[pos].take_rightmost() {
            Some((pred_key, pred_value)) => {
                self.keys[pos] = pred_key;
                self.values[pos] = pred_value;
            }
            // The left subtree ran dry; drop the entry and its empty child.
            None => {
                self.keys.remove(pos);
                self.values.remove(pos);
                self.children.remove(pos);
            }
        }
    }

    fn take_rightmost(&mut self) -> Option<(String, Document)> {
        if self.is_leaf {
            match (self.keys.pop(), self.values.pop()) {
                (Some(key), Some(value)) => Some((key, value)),
                _ => None,
            }
        } else {
            self.children.last_mut()?.take_rightmost()
        }
    }

    /// Collects every entry whose key starts with `prefix`, in key order.
    /// Entries that rose into internal nodes during splits are collected
    /// too; only subtrees wholly before the prefix are skipped.
    fn collect_prefix(&self, prefix: &str, out: &mut Vec<(String, Document)>) {
        if self.is_leaf {
            for (key, value) in self.keys.iter().zip(&self.values) {
                if key.starts_with(prefix) {
                    out.push((key.clone(), value.clone()));
                }
            }
            return;
        }
        for i in 0..self.keys.len() {
            if self.keys[i].as_str() >= prefix {
                self.children[i].collect_prefix(prefix, out);
            }
            if self.keys[i].starts_with(prefix) {
                out.push((self.keys[i].clone(), self.values[i].clone()));
            }
        }
        if let Some(last) = self.children.last() {
            last.collect_prefix(prefix, out);
        }
    }

    #[cfg(test)]
    fn depth(&self) -> usize {
        if self.is_leaf {
            1
        } else {
            1 + self.children.iter().map(Node::depth).max().unwrap_or(0)
        }
    }
}

struct Inner {
    root: Node,
    file: File,
}

/// The on-disk B-tree.
pub struct BTree {
    inner: RwLock<Inner>,
}

impl BTree {
    /// Opens the tree, decoding the previous image when one exists. A
    /// corrupt image refuses to open.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::options()
            .create(true)
            .read(true)
            .write(true)
            .open(path)?;
        let root = if file.metadata()?.len() == 0 {
            Node::leaf()
        } else {
            bincode::deserialize_from(BufReader::new(file.try_clone()?))
                .map_err(|e| Error::InvalidData(format!("failed to decode tree image: {e}")))?
        };
        Ok(Self {
            inner: RwLock::new(Inner { root, file }),
        })
    }

    /// Inserts or overwrites an entry, growing a new root when the old one
    /// overfills.
    pub fn put(&self, key: impl Into<String>, value: Document) {
        let mut inner = self.inner.write().unwrap();
        inner.root.insert(key.into(), value);
        if inner.root.is_overfull() {
            let old_root = std::mem::replace(
                &mut inner.root,
                Node {
                    is_leaf: false,
                    keys: Vec::new(),
                    values: Vec::new(),
                    children: Vec::new(),
                },
            );
            inner.root.children.push(old_root);
            inner.root.split_child(0);
        }
    }

    pub fn get(&self, key: &str) -> Option<Document> {
        self.inner.read().unwrap().root.search(key).cloned()
    }

    /// Removes an entry. Returns whether the key was present.
    pub fn delete(&self, key: &str) -> bool {
        self.inner.write().unwrap().root.remove(key)
    }

    /// Returns every entry whose key starts with `prefix`, in key order.
    pub fn range(&self, prefix: &str) -> Vec<(String, Document)> {
        let inner = self.inner.read().unwrap();
        let mut out = Vec::new();
        inner.root.collect_prefix(prefix, &mut out);
        out
    }

    /// Serializes the whole tree into the backing file, replacing the
    /// previous image, and syncs it. The file handle is released on drop.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.write()?;
        let Inner { root, file } = &mut *inner;
        file.seek(SeekFrom::Start(0))?;
        file.set_len(0)?;
        let mut writer = BufWriter::new(&mut *file);
        bincode::serialize_into(&mut writer, root)?;
        writer.flush()?;
        drop(writer);
        file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{Body, Value};
    use tempfile::TempDir;

    fn doc(id: &str) -> Document {
        let mut body = Body::new();
        body.insert("name".to_string(), Value::String(id.to_string()));
        Document::new(id, body)
    }

    fn create_temp_tree(temp_dir: &TempDir) -> BTree {
        BTree::open(temp_dir.path().join("data.db")).expect("Failed to open tree")
    }

    #[test]
    fn test_put_and_get() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let tree = create_temp_tree(&temp_dir);

        tree.put("users:u1", doc("u1"));
        tree.put("users:u2", doc("u2"));

        assert_eq!(tree.get("users:u1").unwrap().id, "u1");
        assert_eq!(tree.get("users:u2").unwrap().id, "u2");
        assert!(tree.get("users:u3").is_none());
    }

    #[test]
    fn test_overwrite() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let tree = create_temp_tree(&temp_dir);

        tree.put("users:u1", doc("before"));
        tree.put("users:u1", doc("after"));

        assert_eq!(tree.get("users:u1").unwrap().id, "after");
        assert_eq!(tree.range("").len(), 1);
    }

    #[test]
    fn test_split_keeps_everything_reachable() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let tree = create_temp_tree(&temp_dir);

        // Enough entries to force root splits.
        for i in 0..1000 {
            tree.put(format!("users:{i:05}"), doc(&format!("{i}")));
        }

        assert!(tree.inner.read().unwrap().root.depth() > 1);
        for i in 0..1000 {
            let key = format!("users:{i:05}");
            assert_eq!(tree.get(&key).expect("missing key").id, format!("{i}"));
        }
    }

    #[test]
    fn test_range_prefix_in_order() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let tree = create_temp_tree(&temp_dir);

        for i in 0..400 {
            tree.put(format!("users:{i:05}"), doc(&format!("{i}")));
        }
        for i in 0..50 {
            tree.put(format!("orders:{i:05}"), doc(&format!("o{i}")));
        }

        let entries = tree.range("users:");
        assert_eq!(entries.len(), 400);
        let keys: Vec<_> = entries.iter().map(|(k, _)| k.clone()).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
        assert!(keys.iter().all(|k| k.starts_with("users:")));
    }

    #[test]
    fn test_delete_from_leaf_and_internal() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let tree = create_temp_tree(&temp_dir);

        for i in 0..600 {
            tree.put(format!("k{i:05}"), doc(&format!("{i}")));
        }

        // Internal entries exist after splits; delete a slice that is bound
        // to cover some of them.
        for i in 200..400 {
            assert!(tree.delete(&format!("k{i:05}")), "k{i:05} should delete");
        }
        assert!(!tree.delete("k00250"));

        for i in 0..600 {
            let key = format!("k{i:05}");
            if (200..400).contains(&i) {
                assert!(tree.get(&key).is_none(), "{key} should be gone");
            } else {
                assert!(tree.get(&key).is_some(), "{key} should remain");
            }
        }
        assert_eq!(tree.range("k").len(), 400);
    }

    #[test]
    fn test_image_roundtrip() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let path = temp_dir.path().join("data.db");

        {
            let tree = BTree::open(&path).expect("Failed to open tree");
            for i in 0..500 {
                tree.put(format!("users:{i:05}"), doc(&format!("{i}")));
            }
            tree.close().expect("Failed to close");
        }

        let tree = BTree::open(&path).expect("Failed to reopen tree");
        assert_eq!(tree.range("users:").len(), 500);
        assert_eq!(tree.get("users:00042").unwrap().id, "42");
        assert!(tree.get("users:99999").is_none());
    }

    #[test]
    fn test_corrupt_image_refuses_to_open() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let path = temp_dir.path().join("data.db");
        std::fs::write(&path, b"\xff\xff\xff\xff\xff\xff\xff\xff").expect("Failed to write");

        assert!(matches!(BTree::open(&path), Err(Error::InvalidData(_))));
    }

    #[test]
    fn test_close_truncates_previous_image() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let path = temp_dir.path().join("data.db");

        {
            let tree = BTree::open(&path).expect("Failed to open tree");
            for i in 0..300 {
                tree.put(format!("users:{i:05}"), doc(&format!("{i}")));
            }
            tree.close().expect("Failed to close");
        }
        {
            let tree = BTree::open(&path).expect("Failed to reopen tree");
            for i in 0..300 {
                assert!(tree.delete(&format!("users:{i:05}")));
            }
            tree.close().expect("Failed to close");
        }

        let tree = BTree::open(&path).expect("Failed to reopen tree");
        assert!(tree.range("").is_empty());
    }
}
