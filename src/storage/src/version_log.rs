//! Per-record version history with an undo/redo cursor.

use thiserror::Error;

use crate::types::Snapshot;

/// Cursor already at one end of the log.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorError {
    #[error("already at the oldest version")]
    NoHistory,
    #[error("already at the newest version")]
    NoFuture,
}

/// Ordered snapshots plus the index of the active one.
///
/// Invariant: `position < snapshots.len()`; the log is never empty.
#[derive(Debug, Clone)]
pub struct VersionLog {
    snapshots: Vec<Snapshot>,
    position: usize,
}

impl VersionLog {
    pub fn new(seed: Snapshot) -> Self {
        VersionLog {
            snapshots: vec![seed],
            position: 0,
        }
    }

    /// Drop everything after the cursor, push `snapshot`, move to it.
    pub fn append(&mut self, snapshot: Snapshot) {
        self.snapshots.truncate(self.position + 1);
        self.snapshots.push(snapshot);
        self.position = self.snapshots.len() - 1;
    }

    pub fn undo(&mut self) -> Result<&Snapshot, CursorError> {
        if !self.can_undo() {
            return Err(CursorError::NoHistory);
        }
        self.position -= 1;
        Ok(self.current())
    }

    pub fn redo(&mut self) -> Result<&Snapshot, CursorError> {
        if !self.can_redo() {
            return Err(CursorError::NoFuture);
        }
        self.position += 1;
        Ok(self.current())
    }

    pub fn current(&self) -> &Snapshot {
        &self.snapshots[self.position]
    }

    pub fn history(&self) -> &[Snapshot] {
        &self.snapshots
    }

    pub fn position(&self) -> usize {
        self.position
    }

    /// Never zero: a log always holds its seed snapshot.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn can_undo(&self) -> bool {
        self.position > 0
    }

    pub fn can_redo(&self) -> bool {
        self.position + 1 < self.snapshots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SnapshotOp;

    fn snap(name: &str, age: u32, op: SnapshotOp) -> Snapshot {
        Snapshot::new(name.to_string(), age, op == SnapshotOp::Delete, op)
    }

    #[test]
    fn test_new_log_holds_only_the_seed() {
        let log = VersionLog::new(snap("Alice", 30, SnapshotOp::Create));
        assert_eq!(log.len(), 1);
        assert_eq!(log.position(), 0);
        assert!(!log.can_undo());
        assert!(!log.can_redo());
        assert_eq!(log.current().name, "Alice");
    }

    #[test]
    fn test_append_moves_cursor_to_tail() {
        let mut log = VersionLog::new(snap("a", 1, SnapshotOp::Create));
        log.append(snap("a", 2, SnapshotOp::Update));
        log.append(snap("a", 3, SnapshotOp::Update));

        assert_eq!(log.len(), 3);
        assert_eq!(log.position(), 2);
        assert_eq!(log.current().age, 3);
        assert!(!log.can_redo());
    }

    #[test]
    fn test_undo_keeps_length_and_decrements_position() {
        let mut log = VersionLog::new(snap("a", 1, SnapshotOp::Create));
        log.append(snap("a", 2, SnapshotOp::Update));

        let before = log.len();
        assert_eq!(log.undo().unwrap().age, 1);
        assert_eq!(log.len(), before);
        assert_eq!(log.position(), 0);

        assert_eq!(log.undo(), Err(CursorError::NoHistory));
        assert_eq!(log.position(), 0);
        assert_eq!(log.current().age, 1);
    }

    #[test]
    fn test_redo_at_tail_fails() {
        let mut log = VersionLog::new(snap("a", 1, SnapshotOp::Create));
        assert_eq!(log.redo(), Err(CursorError::NoFuture));

        log.append(snap("a", 2, SnapshotOp::Update));
        log.undo().unwrap();
        assert_eq!(log.redo().unwrap().age, 2);
        assert_eq!(log.redo(), Err(CursorError::NoFuture));
    }

    #[test]
    fn test_write_after_undo_truncates_branch() {
        let mut log = VersionLog::new(snap("s0", 0, SnapshotOp::Create));
        log.append(snap("s1", 1, SnapshotOp::Update));
        log.append(snap("s2", 2, SnapshotOp::Update));

        log.undo().unwrap();
        log.append(snap("s2'", 22, SnapshotOp::Update));

        let names: Vec<&str> = log.history().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["s0", "s1", "s2'"]);
        assert_eq!(log.redo(), Err(CursorError::NoFuture));
    }

    #[test]
    fn test_write_after_multiple_undos() {
        let mut log = VersionLog::new(snap("s0", 0, SnapshotOp::Create));
        for i in 1..5 {
            log.append(snap("s", i, SnapshotOp::Update));
        }
        log.undo().unwrap();
        log.undo().unwrap();
        log.undo().unwrap();
        log.append(snap("new", 99, SnapshotOp::Update));

        assert_eq!(log.len(), 3);
        assert_eq!(log.position(), 2);
        assert_eq!(log.history()[1].age, 1);
    }
}
