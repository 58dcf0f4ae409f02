//! In-memory ordered map buffering recent writes.
//!
//! Implemented as a probabilistic skip list over a slab of nodes: each entry
//! is linked into a random number of levels (promotion probability 0.5, at
//! most [`MAX_HEIGHT`]), so lookups and ordered scans descend from the
//! highest occupied level in expected O(log n). Byte accounting is
//! approximate and only drives the engine's flush threshold.
//!
//! Readers share the structure concurrently; writers are exclusive. A range
//! scan holds the read lock for its whole duration, so visitors must not
//! re-enter the memtable.

use std::sync::RwLock;
use std::time::SystemTime;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::value::Document;

/// Maximum number of levels an entry can be linked into.
const MAX_HEIGHT: usize = 32;

/// Chance of promoting an entry one level higher.
const PROMOTE_PROBABILITY: f64 = 0.5;

/// Slab sentinel for "no node".
const NIL: usize = usize::MAX;

/// Slab sentinel for the list head.
const HEAD: usize = usize::MAX - 1;

struct Node {
    key: String,
    doc: Document,
    expires_at: Option<SystemTime>,
    /// Forward pointer per level, level 0 first.
    forward: Vec<usize>,
}

struct Inner {
    /// Node slab; freed slots are recycled through `free`.
    nodes: Vec<Option<Node>>,
    free: Vec<usize>,
    /// Head forward pointers, one per level.
    head: [usize; MAX_HEIGHT],
    /// Highest level currently in use.
    level: usize,
    size: usize,
    count: usize,
    rng: StdRng,
}

impl Inner {
    fn node(&self, idx: usize) -> &Node {
        self.nodes[idx].as_ref().expect("dangling skip list index")
    }

    fn node_mut(&mut self, idx: usize) -> &mut Node {
        self.nodes[idx].as_mut().expect("dangling skip list index")
    }

    fn next(&self, at: usize, level: usize) -> usize {
        if at == HEAD {
            self.head[level]
        } else {
            self.node(at).forward[level]
        }
    }

    fn set_next(&mut self, at: usize, level: usize, to: usize) {
        if at == HEAD {
            self.head[level] = to;
        } else {
            self.node_mut(at).forward[level] = to;
        }
    }

    /// Walks down from the top level collecting the rightmost node strictly
    /// before `key` on every level, plus the level-0 candidate at or after it.
    fn find_predecessors(&self, key: &str) -> ([usize; MAX_HEIGHT], usize) {
        let mut update = [HEAD; MAX_HEIGHT];
        let mut at = HEAD;
        for level in (0..=self.level).rev() {
            loop {
                let next = self.next(at, level);
                if next != NIL && self.node(next).key.as_str() < key {
                    at = next;
                } else {
                    break;
                }
            }
            update[level] = at;
        }
        (update, self.next(update[0], 0))
    }

    fn random_height(&mut self) -> usize {
        let mut height = 0;
        while height < MAX_HEIGHT - 1 && self.rng.gen_bool(PROMOTE_PROBABILITY) {
            height += 1;
        }
        height
    }

    fn alloc(&mut self, node: Node) -> usize {
        match self.free.pop() {
            Some(idx) => {
                self.nodes[idx] = Some(node);
                idx
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        }
    }

    fn release(&mut self, idx: usize) -> Node {
        let node = self.nodes[idx].take().expect("dangling skip list index");
        self.free.push(idx);
        node
    }
}

fn expired(expires_at: Option<SystemTime>, now: SystemTime) -> bool {
    expires_at.is_some_and(|at| at <= now)
}

/// The in-memory ordered map: string keys to documents, with optional
/// per-entry expiry.
pub struct Memtable {
    inner: RwLock<Inner>,
}

impl Memtable {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                nodes: Vec::new(),
                free: Vec::new(),
                head: [NIL; MAX_HEIGHT],
                level: 0,
                size: 0,
                count: 0,
                rng: StdRng::from_entropy(),
            }),
        }
    }

    /// Inserts or replaces the document under `key`.
    pub fn put(&self, key: impl Into<String>, doc: Document) {
        self.put_with_expiry(key, doc, None)
    }

    /// Inserts or replaces, with an expiry after which lookups treat the
    /// entry as absent. Replacing an entry leaves the size accounting for
    /// the value portion unchanged.
    pub fn put_with_expiry(
        &self,
        key: impl Into<String>,
        doc: Document,
        expires_at: Option<SystemTime>,
    ) {
        let key = key.into();
        let mut inner = self.inner.write().unwrap();
        let (update, at) = inner.find_predecessors(&key);

        // Replace in place for an existing key.
        if at != NIL && inner.node(at).key == key {
            let node = inner.node_mut(at);
            node.doc = doc;
            node.expires_at = expires_at;
            return;
        }

        let height = inner.random_height();
        if height > inner.level {
            // Predecessors above the old top level are the head.
            inner.level = height;
        }

        let entry_size = key.len() + doc.estimated_size();
        let idx = inner.alloc(Node {
            key,
            doc,
            expires_at,
            forward: vec![NIL; height + 1],
        });
        for level in 0..=height {
            let next = inner.next(update[level], level);
            inner.node_mut(idx).forward[level] = next;
            inner.set_next(update[level], level, idx);
        }

        inner.count += 1;
        inner.size += entry_size;
    }

    /// Returns the live document for a key; expired entries read as absent
    /// without being removed.
    pub fn get(&self, key: &str) -> Option<Document> {
        let inner = self.inner.read().unwrap();
        let (_, at) = inner.find_predecessors(key);
        if at == NIL || inner.node(at).key != key {
            return None;
        }
        let node = inner.node(at);
        if expired(node.expires_at, SystemTime::now()) {
            return None;
        }
        Some(node.doc.clone())
    }

    /// Unlinks a key from every level it appears on, lowering the list
    /// level when the topmost level empties. Returns whether a node was
    /// removed.
    pub fn delete(&self, key: &str) -> bool {
        let mut inner = self.inner.write().unwrap();
        let (update, at) = inner.find_predecessors(key);
        if at == NIL || inner.node(at).key != key {
            return false;
        }

        for level in 0..=inner.level {
            if inner.next(update[level], level) != at {
                break;
            }
            let next = inner.node(at).forward[level];
            inner.set_next(update[level], level, next);
        }
        while inner.level > 0 && inner.head[inner.level] == NIL {
            inner.level -= 1;
        }

        let node = inner.release(at);
        inner.count -= 1;
        inner.size = inner
            .size
            .saturating_sub(node.key.len() + node.doc.estimated_size());
        true
    }

    /// Visits every live entry whose key starts with `prefix`, in ascending
    /// key order, stopping early when the visitor returns false. The read
    /// lock is held for the whole walk.
    pub fn range<F>(&self, prefix: &str, mut visit: F)
    where
        F: FnMut(&str, &Document) -> bool,
    {
        let inner = self.inner.read().unwrap();
        let now = SystemTime::now();
        let mut at = inner.head[0];
        while at != NIL {
            let node = inner.node(at);
            if node.key.starts_with(prefix)
                && !expired(node.expires_at, now)
                && !visit(&node.key, &node.doc)
            {
                break;
            }
            at = node.forward[0];
        }
    }

    /// Approximate byte size of all live entries.
    pub fn size(&self) -> usize {
        self.inner.read().unwrap().size
    }

    /// Exact number of entries.
    pub fn count(&self) -> usize {
        self.inner.read().unwrap().count
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }
}

impl Default for Memtable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{Body, Value};
    use std::time::Duration;

    fn doc(id: &str) -> Document {
        let mut body = Body::new();
        body.insert("name".to_string(), Value::String(id.to_string()));
        Document::new(id, body)
    }

    fn collect(memtable: &Memtable, prefix: &str) -> Vec<String> {
        let mut keys = Vec::new();
        memtable.range(prefix, |key, _| {
            keys.push(key.to_string());
            true
        });
        keys
    }

    #[test]
    fn test_put_and_get() {
        let memtable = Memtable::new();
        memtable.put("users:u1", doc("u1"));
        memtable.put("users:u2", doc("u2"));

        assert_eq!(memtable.get("users:u1").unwrap().id, "u1");
        assert_eq!(memtable.get("users:u2").unwrap().id, "u2");
        assert!(memtable.get("users:u3").is_none());
        assert_eq!(memtable.count(), 2);
    }

    #[test]
    fn test_replace_keeps_accounting() {
        let memtable = Memtable::new();
        memtable.put("users:u1", doc("u1"));
        let size_before = memtable.size();

        memtable.put("users:u1", doc("u1-updated"));
        assert_eq!(memtable.count(), 1);
        assert_eq!(memtable.size(), size_before);
        assert_eq!(memtable.get("users:u1").unwrap().id, "u1-updated");
    }

    #[test]
    fn test_delete() {
        let memtable = Memtable::new();
        memtable.put("users:u1", doc("u1"));
        memtable.put("users:u2", doc("u2"));

        assert!(memtable.delete("users:u1"));
        assert!(!memtable.delete("users:u1"));
        assert!(memtable.get("users:u1").is_none());
        assert_eq!(memtable.get("users:u2").unwrap().id, "u2");
        assert_eq!(memtable.count(), 1);

        assert!(memtable.delete("users:u2"));
        assert!(memtable.is_empty());
        assert_eq!(memtable.size(), 0);
    }

    #[test]
    fn test_keys_iterate_in_sorted_order() {
        let memtable = Memtable::new();
        // Insert in reverse so ordering has to come from the structure.
        for i in (0..500).rev() {
            let key = format!("users:{i:04}");
            memtable.put(key, doc(&format!("{i}")));
        }

        let keys = collect(&memtable, "");
        assert_eq!(keys.len(), 500);
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn test_range_prefix_and_early_stop() {
        let memtable = Memtable::new();
        memtable.put("orders:o1", doc("o1"));
        memtable.put("users:u1", doc("u1"));
        memtable.put("users:u2", doc("u2"));
        memtable.put("users:u3", doc("u3"));

        assert_eq!(
            collect(&memtable, "users:"),
            vec!["users:u1", "users:u2", "users:u3"]
        );

        let mut visited = Vec::new();
        memtable.range("users:", |key, _| {
            visited.push(key.to_string());
            visited.len() < 2
        });
        assert_eq!(visited, vec!["users:u1", "users:u2"]);
    }

    #[test]
    fn test_expired_entries_read_as_absent() {
        let memtable = Memtable::new();
        let past = SystemTime::now() - Duration::from_secs(1);
        let future = SystemTime::now() + Duration::from_secs(3600);

        memtable.put_with_expiry("users:gone", doc("gone"), Some(past));
        memtable.put_with_expiry("users:here", doc("here"), Some(future));

        assert!(memtable.get("users:gone").is_none());
        assert_eq!(memtable.get("users:here").unwrap().id, "here");
        assert_eq!(collect(&memtable, "users:"), vec!["users:here"]);
        // Expired entries are skipped, not removed.
        assert_eq!(memtable.count(), 2);
    }

    #[test]
    fn test_delete_after_growth_keeps_structure() {
        let memtable = Memtable::new();
        for i in 0..200 {
            memtable.put(format!("k{i:03}"), doc(&format!("{i}")));
        }
        for i in (0..200).step_by(2) {
            assert!(memtable.delete(&format!("k{i:03}")));
        }

        assert_eq!(memtable.count(), 100);
        let keys = collect(&memtable, "");
        assert_eq!(keys.len(), 100);
        for key in keys {
            let n: usize = key[1..].parse().unwrap();
            assert_eq!(n % 2, 1);
        }
    }
}
