use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use tokio::sync::RwLock;
use log::{info, warn};

use crate::config::StorageConfig;
use crate::error::{Result, StoreError};
use crate::types::{
    validate_name, MutationEvent, MutationKind, Record, RecordId, ReplicatedRecord, Snapshot,
    SnapshotOp,
};
use crate::version_log::{CursorError, VersionLog};
use crate::wal::{Wal, WalEntry};

/// Receives every mutation the store commits.
///
/// Called while the mutated record is still locked, so events for one record
/// arrive in commit order. Implementations must not block.
pub trait MutationSink: Send + Sync {
    fn publish(&self, event: MutationEvent);
}

/// A record's version log plus its mutation counter.
struct RecordEntry {
    log: VersionLog,
    revision: u64,
}

impl RecordEntry {
    fn new(seed: Snapshot, revision: u64) -> Self {
        RecordEntry {
            log: VersionLog::new(seed),
            revision,
        }
    }

    fn record(&self, id: RecordId) -> Record {
        Record::from_snapshot(id, self.log.current())
    }
}

type SharedEntry = Arc<RwLock<RecordEntry>>;

/// Versioned record store for one node.
///
/// The table lock is only held long enough to look up or insert an entry;
/// each record has its own lock, so writers on one record are serialized
/// while different records proceed concurrently.
#[derive(Clone)]
pub struct RecordStore {
    records: Arc<RwLock<BTreeMap<RecordId, SharedEntry>>>,
    next_id: Arc<AtomicU64>,
    wal: Arc<Mutex<Wal>>,
    sink: Arc<OnceLock<Arc<dyn MutationSink>>>,
}

impl RecordStore {
    /// Create a new in-memory store (no persistence).
    pub fn new() -> Self {
        RecordStore {
            records: Arc::new(RwLock::new(BTreeMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            wal: Arc::new(Mutex::new(Wal::disabled())),
            sink: Arc::new(OnceLock::new()),
        }
    }

    /// Open a store, replaying its WAL if persistence is configured.
    pub fn open(config: StorageConfig) -> std::io::Result<Self> {
        let Some(path) = config.wal_path.as_deref() else {
            info!("Record store running in memory-only mode (no persistence)");
            return Ok(Self::new());
        };

        let mut wal = Wal::new(path)?.with_sync_writes(config.sync_writes);
        let entries = wal.read_entries()?;

        let mut records: BTreeMap<RecordId, RecordEntry> = BTreeMap::new();
        for entry in &entries {
            replay(&mut records, entry);
        }
        info!("Replayed {} WAL entries into {} records", entries.len(), records.len());

        if config.compaction_threshold > 0 && entries.len() > config.compaction_threshold {
            wal.compact(records.iter().map(|(id, e)| (*id, e.revision, &e.log)))?;
        }

        let next_id = records.keys().next_back().map(|id| id + 1).unwrap_or(1);
        let records = records
            .into_iter()
            .map(|(id, entry)| (id, Arc::new(RwLock::new(entry))))
            .collect();

        Ok(RecordStore {
            records: Arc::new(RwLock::new(records)),
            next_id: Arc::new(AtomicU64::new(next_id)),
            wal: Arc::new(Mutex::new(wal)),
            sink: Arc::new(OnceLock::new()),
        })
    }

    /// Attach the mutation sink. Only the first call takes effect.
    pub fn attach_sink(&self, sink: Arc<dyn MutationSink>) -> bool {
        self.sink.set(sink).is_ok()
    }

    pub fn is_persistent(&self) -> bool {
        self.wal.lock().map(|w| w.is_enabled()).unwrap_or(false)
    }

    pub async fn create(&self, name: &str, age: u32) -> Result<Record> {
        let name = validate_name(name)?;
        let snapshot = Snapshot::new(name, age, false, SnapshotOp::Create);

        let mut records = self.records.write().await;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        self.log(&WalEntry::Append {
            record_id: id,
            revision: 1,
            snapshot: snapshot.clone(),
        })?;

        let entry = RecordEntry::new(snapshot.clone(), 1);
        let record = entry.record(id);
        records.insert(id, Arc::new(RwLock::new(entry)));

        self.publish(MutationEvent {
            record_id: id,
            revision: 1,
            snapshot,
            kind: MutationKind::Create,
        });

        info!("OK CREATE {} {:?} {}", id, record.name, record.age);
        Ok(record)
    }

    /// Replace name and age. Clears the deleted flag if set.
    pub async fn update(&self, id: RecordId, name: &str, age: u32) -> Result<Record> {
        let name = validate_name(name)?;
        let shared = self.entry(id).await?;
        let mut entry = shared.write().await;

        let snapshot = Snapshot::new(name, age, false, SnapshotOp::Update);
        self.commit_append(id, &mut entry, snapshot, MutationKind::Update)
    }

    /// Soft delete: the record stays listed with `is_deleted = true`.
    pub async fn delete(&self, id: RecordId) -> Result<Record> {
        let shared = self.entry(id).await?;
        let mut entry = shared.write().await;

        let current = entry.log.current();
        let snapshot = Snapshot::new(current.name.clone(), current.age, true, SnapshotOp::Delete);
        self.commit_append(id, &mut entry, snapshot, MutationKind::Delete)
    }

    /// Undo a soft delete by writing a new live snapshot with the current values.
    pub async fn restore(&self, id: RecordId) -> Result<Record> {
        let shared = self.entry(id).await?;
        let mut entry = shared.write().await;

        let current = entry.log.current();
        let snapshot = Snapshot::new(current.name.clone(), current.age, false, SnapshotOp::Restore);
        self.commit_append(id, &mut entry, snapshot, MutationKind::Restore)
    }

    pub async fn undo(&self, id: RecordId) -> Result<(Record, Vec<Snapshot>)> {
        self.move_cursor(id, MutationKind::Undo).await
    }

    pub async fn redo(&self, id: RecordId) -> Result<(Record, Vec<Snapshot>)> {
        self.move_cursor(id, MutationKind::Redo).await
    }

    pub async fn get(&self, id: RecordId) -> Result<Record> {
        let shared = self.entry(id).await?;
        let entry = shared.read().await;
        Ok(entry.record(id))
    }

    pub async fn history(&self, id: RecordId) -> Result<Vec<Snapshot>> {
        let shared = self.entry(id).await?;
        let entry = shared.read().await;
        Ok(entry.log.history().to_vec())
    }

    /// Current state of every record ordered by id, soft-deleted ones included.
    pub async fn list(&self) -> Vec<Record> {
        let mut out = Vec::new();
        for (id, shared) in self.entries().await {
            out.push(shared.read().await.record(id));
        }
        out
    }

    /// Current snapshot and revision of every record, for bulk resync.
    pub async fn export(&self) -> Vec<ReplicatedRecord> {
        let mut out = Vec::new();
        for (id, shared) in self.entries().await {
            let entry = shared.read().await;
            out.push(ReplicatedRecord {
                record_id: id,
                revision: entry.revision,
                snapshot: entry.log.current().clone(),
            });
        }
        out
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Adopt a snapshot committed on the primary.
    ///
    /// A delivery this store already reflects (same or newer revision with an
    /// identical current snapshot) is a no-op, so duplicates are harmless.
    /// Fails with `Diverged` when this store holds the same or a newer
    /// revision with a different snapshot. Returns whether anything changed.
    pub async fn apply_replicated(&self, replicated: &ReplicatedRecord) -> Result<bool> {
        self.adopt(replicated, false).await
    }

    /// Adopt the primary's current state of a record unconditionally, unless
    /// the current snapshot is already identical.
    ///
    /// Used by bulk resync, where the primary is authoritative even if this
    /// store somehow holds a higher revision.
    pub async fn resync(&self, replicated: &ReplicatedRecord) -> Result<bool> {
        self.adopt(replicated, true).await
    }

    /// Make this store hold exactly the primary's records.
    ///
    /// Every given record is adopted as by `resync`, then records the primary
    /// does not hold are dropped. Returns how many records changed or were dropped.
    pub async fn replace_all(&self, records: &[ReplicatedRecord]) -> Result<usize> {
        let mut changed = 0;
        for record in records {
            if self.resync(record).await? {
                changed += 1;
            }
        }

        let keep: BTreeSet<RecordId> = records.iter().map(|r| r.record_id).collect();
        let mut table = self.records.write().await;
        let stale: Vec<RecordId> = table.keys().filter(|id| !keep.contains(id)).copied().collect();
        for id in stale {
            self.log(&WalEntry::Remove { record_id: id })?;
            table.remove(&id);
            warn!("Dropped record {} missing from the primary", id);
            changed += 1;
        }
        Ok(changed)
    }

    async fn adopt(&self, replicated: &ReplicatedRecord, force: bool) -> Result<bool> {
        let id = replicated.record_id;
        let existing = self.records.read().await.get(&id).cloned();

        let shared = match existing {
            Some(shared) => shared,
            None => {
                let mut records = self.records.write().await;
                match records.get(&id) {
                    Some(shared) => shared.clone(),
                    None => {
                        self.log(&WalEntry::Append {
                            record_id: id,
                            revision: replicated.revision,
                            snapshot: replicated.snapshot.clone(),
                        })?;
                        records.insert(
                            id,
                            Arc::new(RwLock::new(RecordEntry::new(
                                replicated.snapshot.clone(),
                                replicated.revision,
                            ))),
                        );
                        self.next_id.fetch_max(id + 1, Ordering::SeqCst);
                        return Ok(true);
                    }
                }
            }
        };

        let mut entry = shared.write().await;
        let same_state = entry.log.current() == &replicated.snapshot;

        if force {
            if same_state {
                if entry.revision != replicated.revision {
                    self.log(&WalEntry::Revision {
                        record_id: id,
                        revision: replicated.revision,
                    })?;
                    entry.revision = replicated.revision;
                }
                return Ok(false);
            }
        } else if entry.revision >= replicated.revision {
            if same_state {
                return Ok(false);
            }
            return Err(StoreError::Diverged {
                id,
                local: entry.revision,
                incoming: replicated.revision,
            });
        }

        self.log(&WalEntry::Append {
            record_id: id,
            revision: replicated.revision,
            snapshot: replicated.snapshot.clone(),
        })?;
        entry.log.append(replicated.snapshot.clone());
        entry.revision = replicated.revision;
        Ok(true)
    }

    async fn move_cursor(&self, id: RecordId, kind: MutationKind) -> Result<(Record, Vec<Snapshot>)> {
        let shared = self.entry(id).await?;
        let mut entry = shared.write().await;

        let revision = entry.revision + 1;
        let wal_entry = match kind {
            MutationKind::Undo if entry.log.can_undo() => WalEntry::Undo { record_id: id, revision },
            MutationKind::Undo => return Err(StoreError::NoHistory(id)),
            _ if entry.log.can_redo() => WalEntry::Redo { record_id: id, revision },
            _ => return Err(StoreError::NoFuture(id)),
        };
        self.log(&wal_entry)?;

        let moved = match kind {
            MutationKind::Undo => entry.log.undo(),
            _ => entry.log.redo(),
        };
        let snapshot = moved.map_err(|e| cursor_error(id, e))?.clone();
        entry.revision = revision;

        self.publish(MutationEvent {
            record_id: id,
            revision,
            snapshot,
            kind,
        });

        info!("OK {} {} -> position {}", kind.as_str().to_uppercase(), id, entry.log.position());
        Ok((entry.record(id), entry.log.history().to_vec()))
    }

    fn commit_append(
        &self,
        id: RecordId,
        entry: &mut RecordEntry,
        snapshot: Snapshot,
        kind: MutationKind,
    ) -> Result<Record> {
        let revision = entry.revision + 1;
        self.log(&WalEntry::Append {
            record_id: id,
            revision,
            snapshot: snapshot.clone(),
        })?;

        entry.log.append(snapshot.clone());
        entry.revision = revision;

        self.publish(MutationEvent {
            record_id: id,
            revision,
            snapshot,
            kind,
        });

        info!("OK {} {}", kind.as_str().to_uppercase(), id);
        Ok(entry.record(id))
    }

    async fn entry(&self, id: RecordId) -> Result<SharedEntry> {
        self.records
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    /// Clone the table's entry handles so the table lock is released before
    /// any record lock is taken.
    async fn entries(&self) -> Vec<(RecordId, SharedEntry)> {
        self.records
            .read()
            .await
            .iter()
            .map(|(id, shared)| (*id, shared.clone()))
            .collect()
    }

    fn log(&self, entry: &WalEntry) -> Result<()> {
        let mut wal = self.wal.lock().map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::Other, "WAL lock poisoned")
        })?;
        wal.append(entry)?;
        Ok(())
    }

    fn publish(&self, event: MutationEvent) {
        if let Some(sink) = self.sink.get() {
            sink.publish(event);
        }
    }
}

impl Default for RecordStore {
    fn default() -> Self {
        Self::new()
    }
}

fn cursor_error(id: RecordId, err: CursorError) -> StoreError {
    match err {
        CursorError::NoHistory => StoreError::NoHistory(id),
        CursorError::NoFuture => StoreError::NoFuture(id),
    }
}

fn replay(records: &mut BTreeMap<RecordId, RecordEntry>, entry: &WalEntry) {
    match entry {
        WalEntry::Append { record_id, revision, snapshot } => match records.get_mut(record_id) {
            Some(existing) => {
                existing.log.append(snapshot.clone());
                existing.revision = *revision;
            }
            None => {
                records.insert(*record_id, RecordEntry::new(snapshot.clone(), *revision));
            }
        },
        WalEntry::Undo { record_id, revision } | WalEntry::Redo { record_id, revision } => {
            let Some(existing) = records.get_mut(record_id) else {
                warn!("WAL cursor move for unknown record {}, skipping", record_id);
                return;
            };
            let moved = if matches!(entry, WalEntry::Undo { .. }) {
                existing.log.undo().map(|_| ())
            } else {
                existing.log.redo().map(|_| ())
            };
            match moved {
                Ok(()) => existing.revision = *revision,
                Err(e) => warn!("WAL cursor move for record {} failed: {}, skipping", record_id, e),
            }
        }
        WalEntry::Revision { record_id, revision } => match records.get_mut(record_id) {
            Some(existing) => existing.revision = *revision,
            None => warn!("WAL revision for unknown record {}, skipping", record_id),
        },
        WalEntry::Remove { record_id } => {
            if records.remove(record_id).is_none() {
                warn!("WAL remove for unknown record {}, skipping", record_id);
            }
        }
    }
}
