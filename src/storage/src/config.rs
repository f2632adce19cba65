use std::path::Path;

const DEFAULT_DATA_DIR: &str = "./data";

/// Storage configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// WAL location; `None` keeps the store in memory only
    pub wal_path: Option<String>,
    /// Rewrite the WAL on open once it holds more entries than this (0 = never)
    pub compaction_threshold: usize,
    /// fsync after every WAL append instead of only flushing
    pub sync_writes: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            wal_path: None,
            compaction_threshold: 10_000,
            sync_writes: false,
        }
    }
}

impl StorageConfig {
    /// Create config with WAL enabled at the given path
    pub fn with_wal<P: AsRef<Path>>(path: P) -> Self {
        StorageConfig {
            wal_path: Some(path.as_ref().to_string_lossy().to_string()),
            ..Default::default()
        }
    }

    /// Create config for in-memory only storage
    pub fn in_memory() -> Self {
        StorageConfig {
            wal_path: None,
            compaction_threshold: 0,
            ..Default::default()
        }
    }

    pub fn with_compaction_threshold(mut self, threshold: usize) -> Self {
        self.compaction_threshold = threshold;
        self
    }

    pub fn with_sync_writes(mut self, sync: bool) -> Self {
        self.sync_writes = sync;
        self
    }

    pub fn is_persistent(&self) -> bool {
        self.wal_path.is_some()
    }

    /// Create config from environment variables.
    ///
    /// Each node keeps its own WAL at `$REWIND_DATA_DIR/<node_id>.wal`.
    pub fn from_env(node_id: &str) -> Self {
        let persist = std::env::var("REWIND_PERSIST")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(true);

        let mut config = if persist {
            let data_dir = std::env::var("REWIND_DATA_DIR").unwrap_or_else(|_| DEFAULT_DATA_DIR.to_string());
            Self::with_wal(format!("{}/{}.wal", data_dir, node_id))
        } else {
            Self::in_memory()
        };

        if let Ok(threshold) = std::env::var("REWIND_WAL_COMPACTION_THRESHOLD") {
            match threshold.parse() {
                Ok(n) => config.compaction_threshold = n,
                Err(e) => log::warn!("Invalid REWIND_WAL_COMPACTION_THRESHOLD '{}': {}", threshold, e),
            }
        }

        if let Ok(sync) = std::env::var("REWIND_WAL_FSYNC") {
            config.sync_writes = sync == "1" || sync.to_lowercase() == "true";
        }

        config
    }
}
