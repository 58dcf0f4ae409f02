//! # emberdb
//!
//! An embeddable document-store engine: JSON-shaped records grouped into
//! named collections, with primary-key lookup, collection scans, equality
//! filters, secondary indexes and durable crash-recoverable writes.
//!
//! ```text
//!             put/get/delete/query
//!                     │
//!             ┌───────▼────────┐
//!             │     Engine     │  one RwLock, durability ordering
//!             └───┬───────┬────┘
//!                 │       │
//!          ┌──────▼──┐ ┌──▼────────┐
//!          │   WAL   │ │  Memtable │  append+fsync, then insert
//!          └─────────┘ └──┬────────┘
//!                         │ flush (background)
//!                     ┌───▼─────┐
//!                     │  B-tree │  single-image persistence
//!                     └─────────┘
//! ```
//!
//! Reads probe the memtable first and the tree on miss; collection scans
//! merge both with the memtable winning. On startup the WAL is replayed to
//! rebuild the memtable, so a crash loses nothing that was acknowledged.

pub mod btree;
pub mod config;
pub mod engine;
pub mod error;
pub mod flock;
pub mod index;
pub mod memtable;
pub mod query;
pub mod scheduler;
mod tasks;
pub mod value;
pub mod wal;

pub use config::EngineConfig;
pub use engine::{Engine, EngineStats};
pub use error::{Error, Result};
pub use value::{Body, Document, Value};

/// Current version of emberdb
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
