use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the storage engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory holding the WAL, the tree image and the lock file
    pub data_dir: PathBuf,

    /// Memtable byte size that triggers a background flush (default: 64MB)
    pub memtable_size: usize,

    /// How often the compaction task ticks (default: 1h)
    pub compaction_interval: Duration,

    /// Hint for future batched WAL syncing; every append is synced in this
    /// core (default: 1s)
    pub wal_sync_interval: Duration,

    /// Reserved, no behavior in this core (default: false)
    pub enable_compression: bool,

    /// Process-level open file hint for operators (default: 1000)
    pub max_open_files: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./emberdb"),
            memtable_size: 64 * 1024 * 1024, // 64MB
            compaction_interval: Duration::from_secs(3600),
            wal_sync_interval: Duration::from_secs(1),
            enable_compression: false,
            max_open_files: 1000,
        }
    }
}

impl EngineConfig {
    /// Create a new config with the given data directory
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Set the memtable flush threshold in bytes
    pub fn memtable_size(mut self, size: usize) -> Self {
        self.memtable_size = size;
        self
    }

    /// Set the compaction tick interval
    pub fn compaction_interval(mut self, interval: Duration) -> Self {
        self.compaction_interval = interval;
        self
    }

    /// Set the WAL sync interval hint
    pub fn wal_sync_interval(mut self, interval: Duration) -> Self {
        self.wal_sync_interval = interval;
        self
    }

    /// Enable the reserved compression flag
    pub fn enable_compression(mut self, enabled: bool) -> Self {
        self.enable_compression = enabled;
        self
    }

    /// Set the open file hint
    pub fn max_open_files(mut self, max: usize) -> Self {
        self.max_open_files = max;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.data_dir, PathBuf::from("./emberdb"));
        assert_eq!(config.memtable_size, 64 * 1024 * 1024);
        assert_eq!(config.compaction_interval, Duration::from_secs(3600));
        assert!(!config.enable_compression);
        assert_eq!(config.max_open_files, 1000);
    }

    #[test]
    fn test_config_builder() {
        let config = EngineConfig::new("/tmp/test")
            .memtable_size(1024)
            .compaction_interval(Duration::from_secs(5))
            .enable_compression(true)
            .max_open_files(64);

        assert_eq!(config.data_dir, PathBuf::from("/tmp/test"));
        assert_eq!(config.memtable_size, 1024);
        assert_eq!(config.compaction_interval, Duration::from_secs(5));
        assert!(config.enable_compression);
        assert_eq!(config.max_open_files, 64);
    }
}
