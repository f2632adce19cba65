use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};

/// Record identifier, allocated by the store starting at 1.
pub type RecordId = u64;

/// Kind of write that produced a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotOp {
    Create,
    Update,
    Delete,
    Restore,
}

impl SnapshotOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotOp::Create => "create",
            SnapshotOp::Update => "update",
            SnapshotOp::Delete => "delete",
            SnapshotOp::Restore => "restore",
        }
    }

    /// Single byte code used by the WAL and the cluster protocol
    pub fn code(&self) -> u8 {
        match self {
            SnapshotOp::Create => 1,
            SnapshotOp::Update => 2,
            SnapshotOp::Delete => 3,
            SnapshotOp::Restore => 4,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(SnapshotOp::Create),
            2 => Some(SnapshotOp::Update),
            3 => Some(SnapshotOp::Delete),
            4 => Some(SnapshotOp::Restore),
            _ => None,
        }
    }
}

impl std::fmt::Display for SnapshotOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable state of a record at one version-log position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub name: String,
    pub age: u32,
    pub is_deleted: bool,
    /// Unix ms
    pub timestamp: u64,
    pub op: SnapshotOp,
}

impl Snapshot {
    pub fn new(name: String, age: u32, is_deleted: bool, op: SnapshotOp) -> Self {
        Snapshot {
            name,
            age,
            is_deleted,
            timestamp: current_timestamp_ms(),
            op,
        }
    }
}

/// Externally visible state of a record: its id plus the active snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub name: String,
    pub age: u32,
    pub is_deleted: bool,
}

impl Record {
    pub fn from_snapshot(id: RecordId, snapshot: &Snapshot) -> Self {
        Record {
            id,
            name: snapshot.name.clone(),
            age: snapshot.age,
            is_deleted: snapshot.is_deleted,
        }
    }
}

/// Create/update payload as it arrives from a client.
///
/// `age` is deserialized as a signed integer so that negative values reach
/// `validate` and are rejected there instead of failing with a serde message.
/// Strings and floats are still rejected by deserialization.
#[derive(Debug, Clone, Deserialize)]
pub struct RecordInput {
    pub name: String,
    pub age: i64,
}

impl RecordInput {
    pub fn new(name: impl Into<String>, age: i64) -> Self {
        RecordInput {
            name: name.into(),
            age,
        }
    }

    /// Check the payload and return the normalized `(name, age)` pair.
    pub fn validate(&self) -> Result<(String, u32)> {
        let name = validate_name(&self.name)?;
        let age = u32::try_from(self.age).map_err(|_| {
            StoreError::InvalidInput(format!("age must be a non-negative integer, got {}", self.age))
        })?;
        Ok((name, age))
    }
}

pub(crate) fn validate_name(name: &str) -> Result<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(StoreError::InvalidInput("name must not be empty".to_string()));
    }
    Ok(trimmed.to_string())
}

/// Operation that produced a mutation event.
///
/// Unlike `SnapshotOp` this includes cursor moves, which do not create a
/// snapshot of their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationKind {
    Create,
    Update,
    Delete,
    Restore,
    Undo,
    Redo,
}

impl MutationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationKind::Create => "create",
            MutationKind::Update => "update",
            MutationKind::Delete => "delete",
            MutationKind::Restore => "restore",
            MutationKind::Undo => "undo",
            MutationKind::Redo => "redo",
        }
    }
}

impl std::fmt::Display for MutationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A record's resulting state after a committed mutation, as shipped to replicas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicatedRecord {
    pub record_id: RecordId,
    /// Per-record mutation counter on the primary
    pub revision: u64,
    pub snapshot: Snapshot,
}

/// Emitted by the store for every successful mutation.
#[derive(Debug, Clone)]
pub struct MutationEvent {
    pub record_id: RecordId,
    pub revision: u64,
    pub snapshot: Snapshot,
    pub kind: MutationKind,
}

impl MutationEvent {
    pub fn replicated(&self) -> ReplicatedRecord {
        ReplicatedRecord {
            record_id: self.record_id,
            revision: self.revision,
            snapshot: self.snapshot.clone(),
        }
    }
}

/// Get current timestamp in milliseconds
pub fn current_timestamp_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_validation() {
        assert_eq!(
            RecordInput::new("  Alice ", 30).validate().unwrap(),
            ("Alice".to_string(), 30)
        );
        assert!(matches!(
            RecordInput::new("   ", 30).validate(),
            Err(StoreError::InvalidInput(_))
        ));
        assert!(matches!(
            RecordInput::new("Bob", -1).validate(),
            Err(StoreError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_snapshot_op_codes() {
        for op in [SnapshotOp::Create, SnapshotOp::Update, SnapshotOp::Delete, SnapshotOp::Restore] {
            assert_eq!(SnapshotOp::from_code(op.code()), Some(op));
        }
        assert_eq!(SnapshotOp::from_code(0), None);
    }
}
