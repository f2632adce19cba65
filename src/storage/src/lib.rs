// Core modules
pub mod types;
pub mod error;
pub mod config;
pub mod version_log;
pub mod store;

// Support modules
pub mod wal;

// Re-export main types for convenience
pub use types::{
    current_timestamp_ms, MutationEvent, MutationKind, Record, RecordId, RecordInput,
    ReplicatedRecord, Snapshot, SnapshotOp,
};
pub use error::{Result, StoreError};
pub use config::StorageConfig;
pub use version_log::{CursorError, VersionLog};
pub use store::{MutationSink, RecordStore};
pub use wal::{Wal, WalEntry};
