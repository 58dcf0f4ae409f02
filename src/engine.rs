//! The storage engine coordinator.
//!
//! Composes the WAL, the skip-list memtable, the on-disk B-tree and the
//! secondary indexes behind the public document API, and owns durability
//! ordering: a mutation is appended and synced to the WAL before it touches
//! the memtable, and the caller only sees success after the sync.
//!
//! ## Write path
//! WAL append (fsync) -> memtable insert -> index update -> background
//! flush into the tree once the memtable crosses its byte threshold.
//!
//! ## Read path
//! Memtable probe first, tree probe on miss. Collection scans merge both
//! sources, deduplicating by key with the memtable winning.
//!
//! One engine-level readers-writer lock serializes mutations against the
//! whole composition; reads share it. Every component keeps its own
//! internal lock and is independently safe.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use serde::Serialize;

use crate::btree::BTree;
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::flock::DirLock;
use crate::index::Index;
use crate::memtable::Memtable;
use crate::query::{self, AggregateOp};
use crate::scheduler::Scheduler;
use crate::tasks::CompactionTask;
use crate::value::{Body, Document};
use crate::wal::{Wal, WalKind, WalRecord};

const WAL_FILE: &str = "wal.log";
const TREE_FILE: &str = "data.db";

fn engine_key(collection: &str, id: &str) -> String {
    format!("{collection}:{id}")
}

fn index_name(collection: &str, field: &str) -> String {
    format!("{collection}.{field}")
}

fn check_name(what: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::InvalidArgument(format!("{what} must not be empty")));
    }
    Ok(())
}

/// The mutable composition guarded by the engine-level lock.
struct Core {
    wal: Wal,
    memtable: Memtable,
    btree: BTree,
    indexes: HashMap<String, Index>,
}

/// State shared with background tasks.
pub(crate) struct Shared {
    core: RwLock<Core>,
    flush_pending: AtomicBool,
    compacting: AtomicBool,
}

impl Shared {
    /// Swaps in a fresh memtable and migrates the old contents into the
    /// tree, under the exclusive engine lock.
    pub(crate) fn flush(&self) -> Result<()> {
        let mut core = self.core.write()?;
        Self::flush_core(&mut core)
    }

    fn flush_core(core: &mut Core) -> Result<()> {
        if core.memtable.is_empty() {
            return Ok(());
        }
        let old = mem::replace(&mut core.memtable, Memtable::new());
        let mut entries = Vec::with_capacity(old.count());
        old.range("", |key, doc| {
            entries.push((key.to_string(), doc.clone()));
            true
        });
        let moved = entries.len();
        for (key, doc) in entries {
            core.btree.put(key, doc);
        }
        tracing::info!(entries = moved, "flushed memtable into tree");
        Ok(())
    }

    /// Placeholder merge pass; maintains only the in-progress flag.
    pub(crate) fn compact(&self) {
        if self.compacting.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!("compaction tick");
        self.compacting.store(false, Ordering::SeqCst);
    }
}

/// Point-in-time engine metrics.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    /// Approximate memtable byte size.
    pub memtable_size: usize,
    /// Number of memtable entries.
    pub memtable_count: usize,
    /// Registered secondary indexes.
    pub index_count: usize,
    /// Whether a compaction pass is running.
    pub compacting: bool,
}

/// The document-store engine.
pub struct Engine {
    config: EngineConfig,
    shared: Arc<Shared>,
    scheduler: Scheduler,
    _lock: DirLock,
}

impl Engine {
    /// Opens the engine on a data directory: takes the directory lock,
    /// opens the WAL and the tree image, replays the WAL into a fresh
    /// memtable and starts the background compaction task. Replay or image
    /// corruption refuses to open. Must be called within a tokio runtime.
    pub fn open(config: EngineConfig) -> Result<Self> {
        fs::create_dir_all(&config.data_dir)?;
        let lock = DirLock::acquire(&config.data_dir)?;

        let wal = Wal::open(config.data_dir.join(WAL_FILE))?;
        let btree = BTree::open(config.data_dir.join(TREE_FILE))?;
        let core = Core {
            wal,
            memtable: Memtable::new(),
            btree,
            indexes: HashMap::new(),
        };
        Self::recover(&core)?;

        let shared = Arc::new(Shared {
            core: RwLock::new(core),
            flush_pending: AtomicBool::new(false),
            compacting: AtomicBool::new(false),
        });

        let scheduler = Scheduler::new();
        scheduler.register(Arc::new(CompactionTask::new(
            shared.clone(),
            config.compaction_interval,
        )));

        Ok(Self {
            config,
            shared,
            scheduler,
            _lock: lock,
        })
    }

    /// Replays the WAL in order. Puts reinsert into the memtable without
    /// re-appending; deletes are applied to the memtable and to the tree
    /// image so flushed keys cannot resurface.
    fn recover(core: &Core) -> Result<()> {
        let records = core.wal.replay()?;
        let replayed = records.len();
        for record in records {
            match record.kind {
                WalKind::Put => {
                    if let Some(doc) = record.value {
                        core.memtable.put(record.key, doc);
                    }
                }
                WalKind::Delete => {
                    core.memtable.delete(&record.key);
                    core.btree.delete(&record.key);
                }
                WalKind::TxnMarker => {}
            }
        }
        if replayed > 0 {
            tracing::info!(records = replayed, "recovered write-ahead log");
        }
        Ok(())
    }

    /// Stores a document under (collection, id), assigning version 1 or
    /// bumping the prior version while preserving its creation time. The
    /// record is durable in the WAL before any in-memory state changes.
    pub fn put(&self, collection: &str, id: &str, body: Body) -> Result<()> {
        check_name("collection", collection)?;
        check_name("id", id)?;

        let key = engine_key(collection, id);
        let memtable_size = {
            let core = self.shared.core.write()?;

            let mut doc = Document::new(id, body);
            // Lineage survives a flush: consult the merged view, not just
            // the memtable.
            let mut replacing = false;
            if let Some(prior) = core.memtable.get(&key).or_else(|| core.btree.get(&key)) {
                doc.created_at = prior.created_at;
                doc.version = prior.version + 1;
                replacing = true;
            }

            core.wal.append(&WalRecord::put(key.clone(), doc.clone()))?;
            core.memtable.put(key, doc.clone());
            if replacing {
                // Field values may have changed; stale buckets must not
                // keep pointing at this document.
                remove_from_indexes(&core.indexes, collection, id);
            }
            update_indexes(&core.indexes, collection, &doc);

            core.memtable.size()
        };

        if memtable_size >= self.config.memtable_size {
            self.request_flush();
        }
        Ok(())
    }

    /// Fetches a document, memtable first, tree on miss.
    pub fn get(&self, collection: &str, id: &str) -> Result<Document> {
        check_name("collection", collection)?;
        check_name("id", id)?;

        let key = engine_key(collection, id);
        let core = self.shared.core.read()?;
        if let Some(doc) = core.memtable.get(&key) {
            return Ok(doc);
        }
        core.btree
            .get(&key)
            .ok_or_else(|| Error::NotFound(format!("document not found: {key}")))
    }

    /// Removes a document and its index entries. Removing an absent key is
    /// not an error.
    pub fn delete(&self, collection: &str, id: &str) -> Result<()> {
        check_name("collection", collection)?;
        check_name("id", id)?;

        let key = engine_key(collection, id);
        let core = self.shared.core.write()?;

        core.wal.append(&WalRecord::delete(key.clone()))?;
        core.memtable.delete(&key);
        // Drop the key from the tree image as well so a pre-delete flush
        // cannot resurface it.
        core.btree.delete(&key);
        remove_from_indexes(&core.indexes, collection, id);
        Ok(())
    }

    /// Returns every live document in the collection whose body matches the
    /// equality filter. Keys present in both sources resolve to the
    /// memtable version.
    pub fn query(&self, collection: &str, filter: &Body) -> Result<Vec<Document>> {
        check_name("collection", collection)?;

        let prefix = format!("{collection}:");
        let core = self.shared.core.read()?;

        let mut results = Vec::new();
        let mut seen = HashSet::new();
        core.memtable.range(&prefix, |key, doc| {
            seen.insert(key.to_string());
            if query::matches_filter(&doc.body, filter) {
                results.push(doc.clone());
            }
            true
        });
        for (key, doc) in core.btree.range(&prefix) {
            if !seen.contains(&key) && query::matches_filter(&doc.body, filter) {
                results.push(doc);
            }
        }
        Ok(results)
    }

    /// Runs the filter, then folds the aggregation ops over the matches.
    pub fn aggregate(
        &self,
        collection: &str,
        filter: &Body,
        ops: &[AggregateOp],
    ) -> Result<Body> {
        let docs = self.query(collection, filter)?;
        Ok(query::aggregate(&docs, ops))
    }

    /// Registers a secondary index on (collection, field) and backfills it
    /// from the current merged view.
    pub fn create_index(&self, collection: &str, field: &str) -> Result<()> {
        check_name("collection", collection)?;
        check_name("field", field)?;

        let name = index_name(collection, field);
        let mut core = self.shared.core.write()?;
        if core.indexes.contains_key(&name) {
            return Err(Error::AlreadyExists(format!("index {name}")));
        }

        let index = Index::new(field);
        let prefix = format!("{collection}:");
        let mut seen = HashSet::new();
        core.memtable.range(&prefix, |key, doc| {
            seen.insert(key.to_string());
            if let Some(value) = doc.body.get(field) {
                index.put(value.to_string(), doc.id.clone());
            }
            true
        });
        for (key, doc) in core.btree.range(&prefix) {
            // The memtable version is authoritative; a stale flushed value
            // must not reach the new index.
            if seen.contains(&key) {
                continue;
            }
            if let Some(value) = doc.body.get(field) {
                index.put(value.to_string(), doc.id.clone());
            }
        }

        core.indexes.insert(name, index);
        Ok(())
    }

    /// Returns the ids indexed under a stringified value, in insertion
    /// order. Fails with not-found when the index does not exist.
    pub fn lookup_index(
        &self,
        collection: &str,
        field: &str,
        value: &str,
    ) -> Result<Vec<String>> {
        check_name("collection", collection)?;
        check_name("field", field)?;

        let name = index_name(collection, field);
        let core = self.shared.core.read()?;
        match core.indexes.get(&name) {
            Some(index) => Ok(index.get(value)),
            None => Err(Error::NotFound(format!("index {name}"))),
        }
    }

    /// Point-in-time metrics.
    pub fn stats(&self) -> Result<EngineStats> {
        let core = self.shared.core.read()?;
        Ok(EngineStats {
            memtable_size: core.memtable.size(),
            memtable_count: core.memtable.count(),
            index_count: core.indexes.len(),
            compacting: self.shared.compacting.load(Ordering::SeqCst),
        })
    }

    /// Moves the memtable contents into the tree immediately.
    pub fn flush(&self) -> Result<()> {
        self.shared.flush()
    }

    /// Flushes the memtable, persists the tree image, then truncates the
    /// WAL — every record it covered is now in the durable image — and
    /// stops the background tasks.
    pub fn close(&self) -> Result<()> {
        self.scheduler.stop();

        let mut core = self.shared.core.write()?;
        Shared::flush_core(&mut core)?;
        core.btree.close()?;
        core.wal.truncate()?;
        core.wal.close()?;
        Ok(())
    }

    fn request_flush(&self) {
        // One background flush at a time; the flag re-arms on completion,
        // so a failed flush retries on the next threshold crossing.
        if self.shared.flush_pending.swap(true, Ordering::SeqCst) {
            return;
        }
        let shared = self.shared.clone();
        self.scheduler.spawn(async move {
            let result = shared.flush();
            shared.flush_pending.store(false, Ordering::SeqCst);
            result
        });
    }
}

fn update_indexes(indexes: &HashMap<String, Index>, collection: &str, doc: &Document) {
    let prefix = format!("{collection}.");
    for (name, index) in indexes {
        if name.starts_with(&prefix) {
            if let Some(value) = doc.body.get(index.field()) {
                index.put(value.to_string(), doc.id.clone());
            }
        }
    }
}

fn remove_from_indexes(indexes: &HashMap<String, Index>, collection: &str, id: &str) {
    let prefix = format!("{collection}.");
    for (name, index) in indexes {
        if name.starts_with(&prefix) {
            index.delete(id);
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.scheduler.stop();
    }
}
