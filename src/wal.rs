//! Append-only durable record stream for crash recovery.
//!
//! Every mutation is framed as `len: u32 be | payload | crc32: u32 be`,
//! where the payload is the bincode encoding of a [`WalRecord`]. The frame
//! is self-delimiting: replay decodes sequentially from the start and stops
//! cleanly at end-of-file, a truncated tail, a checksum mismatch or an
//! undecodable payload, returning everything accumulated before it. A
//! partially written tail entry therefore recovers as "missing", never as
//! a fatal error.
//!
//! Appends are serialized by an internal mutex and synced to the device
//! before returning.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::value::Document;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Upper bound on a single record payload; larger frames are treated as a
/// corrupt tail.
const MAX_RECORD_SIZE: u32 = 64 * 1024 * 1024;

/// The kind of mutation a record captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalKind {
    Put,
    Delete,
    TxnMarker,
}

/// A single durable mutation record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalRecord {
    pub kind: WalKind,
    pub key: String,
    /// Present for puts only.
    pub value: Option<Document>,
    pub timestamp: SystemTime,
    pub txn_id: Option<String>,
}

impl WalRecord {
    pub fn put(key: impl Into<String>, doc: Document) -> Self {
        Self {
            kind: WalKind::Put,
            key: key.into(),
            value: Some(doc),
            timestamp: SystemTime::now(),
            txn_id: None,
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self {
            kind: WalKind::Delete,
            key: key.into(),
            value: None,
            timestamp: SystemTime::now(),
            txn_id: None,
        }
    }
}

struct WalFile {
    file: File,
    writer: BufWriter<File>,
}

/// The append-only write-ahead log.
pub struct Wal {
    inner: Mutex<WalFile>,
    path: PathBuf,
}

impl Wal {
    /// Opens (or creates) the log in append mode.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::options().create(true).append(true).open(&path)?;
        let writer = BufWriter::new(file.try_clone()?);
        Ok(Self {
            inner: Mutex::new(WalFile { file, writer }),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one record, returning only after it is flushed and synced to
    /// persistent storage.
    pub fn append(&self, record: &WalRecord) -> Result<()> {
        let payload = bincode::serialize(record)?;
        let mut inner = self.inner.lock()?;
        inner.writer.write_u32::<BigEndian>(payload.len() as u32)?;
        inner.writer.write_all(&payload)?;
        inner.writer.write_u32::<BigEndian>(CRC32.checksum(&payload))?;
        inner.writer.flush()?;
        inner.file.sync_all()?;
        Ok(())
    }

    /// Decodes records from the start of the file, stopping at the first
    /// unreadable tail.
    pub fn replay(&self) -> Result<Vec<WalRecord>> {
        let mut reader = BufReader::new(File::open(&self.path)?);
        let mut records = Vec::new();
        loop {
            let len = match reader.read_u32::<BigEndian>() {
                Ok(len) => len,
                // A clean end: the file stops at a frame boundary.
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            };
            if len == 0 || len > MAX_RECORD_SIZE {
                tracing::warn!(frame_len = len, "discarding corrupt log tail");
                break;
            }
            let mut payload = vec![0u8; len as usize];
            if reader.read_exact(&mut payload).is_err() {
                tracing::warn!("discarding truncated log tail");
                break;
            }
            let stored_crc = match reader.read_u32::<BigEndian>() {
                Ok(crc) => crc,
                Err(_) => {
                    tracing::warn!("discarding truncated log tail");
                    break;
                }
            };
            if stored_crc != CRC32.checksum(&payload) {
                tracing::warn!("checksum mismatch, discarding log tail");
                break;
            }
            match bincode::deserialize(&payload) {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::warn!(error = %e, "undecodable record, discarding log tail");
                    break;
                }
            }
        }
        Ok(records)
    }

    /// Discards every record. Called once all entries the log covers are in
    /// the durable tree image.
    pub fn truncate(&self) -> Result<()> {
        let mut inner = self.inner.lock()?;
        inner.writer.flush()?;
        inner.file.set_len(0)?;
        inner.file.sync_all()?;
        Ok(())
    }

    /// Flushes and syncs the log. The file handle is released on drop.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock()?;
        inner.writer.flush()?;
        inner.file.sync_all()?;
        Ok(())
    }
}
