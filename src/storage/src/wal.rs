use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use log::info;

use crate::types::{RecordId, Snapshot, SnapshotOp};
use crate::version_log::VersionLog;

/// Binary WAL format constants
const WAL_MAGIC: &[u8; 4] = b"RWAL";
const WAL_VERSION: u8 = 1;

/// Operation types
const OP_APPEND: u8 = 1;
const OP_UNDO: u8 = 2;
const OP_REDO: u8 = 3;
const OP_REVISION: u8 = 4;
const OP_REMOVE: u8 = 5;

/// Header size: magic(4) + version(1) + op(1) + record_id(8) + revision(8) + payload_len(4) = 26 bytes
const HEADER_SIZE: usize = 26;
/// Append payload prefix: timestamp(8) + age(4) + is_deleted(1) + snapshot_op(1), followed by the name
const SNAPSHOT_PREFIX_SIZE: usize = 14;
/// CRC32 size
const CRC_SIZE: usize = 4;

/// WAL entry representing a single version-log operation.
///
/// `revision` is the record's revision after the operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalEntry {
    /// Create, update, delete, restore, or an adopted replica snapshot
    Append {
        record_id: RecordId,
        revision: u64,
        snapshot: Snapshot,
    },
    Undo {
        record_id: RecordId,
        revision: u64,
    },
    Redo {
        record_id: RecordId,
        revision: u64,
    },
    /// Revision adopted from the primary without a state change
    Revision {
        record_id: RecordId,
        revision: u64,
    },
    /// Record dropped by a full sync because the primary does not hold it
    Remove { record_id: RecordId },
}

impl WalEntry {
    /// Encode entry to binary format
    pub fn encode(&self) -> Vec<u8> {
        let (op, record_id, revision, payload) = match self {
            WalEntry::Append { record_id, revision, snapshot } => {
                let name_bytes = snapshot.name.as_bytes();
                let mut payload = Vec::with_capacity(SNAPSHOT_PREFIX_SIZE + name_bytes.len());
                payload.extend_from_slice(&snapshot.timestamp.to_le_bytes());
                payload.extend_from_slice(&snapshot.age.to_le_bytes());
                payload.push(snapshot.is_deleted as u8);
                payload.push(snapshot.op.code());
                payload.extend_from_slice(name_bytes);
                (OP_APPEND, *record_id, *revision, payload)
            }
            WalEntry::Undo { record_id, revision } => (OP_UNDO, *record_id, *revision, Vec::new()),
            WalEntry::Redo { record_id, revision } => (OP_REDO, *record_id, *revision, Vec::new()),
            WalEntry::Revision { record_id, revision } => (OP_REVISION, *record_id, *revision, Vec::new()),
            WalEntry::Remove { record_id } => (OP_REMOVE, *record_id, 0, Vec::new()),
        };

        let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
        buf.extend_from_slice(WAL_MAGIC);
        buf.push(WAL_VERSION);
        buf.push(op);
        buf.extend_from_slice(&record_id.to_le_bytes());
        buf.extend_from_slice(&revision.to_le_bytes());
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&payload);

        // Calculate CRC32 of the entry (excluding the CRC itself)
        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());

        buf
    }

    /// Decode entry from binary format
    fn decode(data: &[u8]) -> io::Result<(Self, usize)> {
        if data.len() < HEADER_SIZE + CRC_SIZE {
            return Err(invalid("Entry too short"));
        }

        if &data[0..4] != WAL_MAGIC {
            return Err(invalid("Invalid magic"));
        }

        let version = data[4];
        if version != WAL_VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Unsupported WAL version: {}", version),
            ));
        }

        let op = data[5];
        let record_id = u64::from_le_bytes(read_array(data, 6)?);
        let revision = u64::from_le_bytes(read_array(data, 14)?);
        let payload_len = u32::from_le_bytes(read_array(data, 22)?) as usize;

        let total_len = HEADER_SIZE + payload_len + CRC_SIZE;
        if data.len() < total_len {
            return Err(invalid("Entry truncated"));
        }

        let stored_crc = u32::from_le_bytes(read_array(data, total_len - CRC_SIZE)?);
        let calculated_crc = crc32fast::hash(&data[..total_len - CRC_SIZE]);
        if stored_crc != calculated_crc {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("CRC mismatch: stored={}, calculated={}", stored_crc, calculated_crc),
            ));
        }

        let payload = &data[HEADER_SIZE..HEADER_SIZE + payload_len];

        let entry = match op {
            OP_APPEND => WalEntry::Append {
                record_id,
                revision,
                snapshot: decode_snapshot(payload)?,
            },
            OP_UNDO => WalEntry::Undo { record_id, revision },
            OP_REDO => WalEntry::Redo { record_id, revision },
            OP_REVISION => WalEntry::Revision { record_id, revision },
            OP_REMOVE => WalEntry::Remove { record_id },
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("Unknown operation: {}", op),
                ));
            }
        };

        Ok((entry, total_len))
    }
}

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

fn read_array<const N: usize>(data: &[u8], offset: usize) -> io::Result<[u8; N]> {
    data.get(offset..offset + N)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| invalid("Entry truncated"))
}

fn decode_snapshot(payload: &[u8]) -> io::Result<Snapshot> {
    if payload.len() < SNAPSHOT_PREFIX_SIZE {
        return Err(invalid("Snapshot payload too short"));
    }
    let timestamp = u64::from_le_bytes(read_array(payload, 0)?);
    let age = u32::from_le_bytes(read_array(payload, 8)?);
    let is_deleted = payload[12] != 0;
    let op = SnapshotOp::from_code(payload[13])
        .ok_or_else(|| invalid("Unknown snapshot op"))?;
    let name = String::from_utf8(payload[SNAPSHOT_PREFIX_SIZE..].to_vec())
        .map_err(|_| invalid("Snapshot name is not UTF-8"))?;

    Ok(Snapshot {
        name,
        age,
        is_deleted,
        timestamp,
        op,
    })
}

/// Write-Ahead Log for durability (binary format)
pub struct Wal {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    enabled: bool,
    sync_writes: bool,
}

impl Wal {
    /// Create a new WAL at the given path
    pub fn new<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;

        info!("WAL initialized at {:?} (binary format v{})", path, WAL_VERSION);

        Ok(Wal {
            path,
            writer: Some(BufWriter::new(file)),
            enabled: true,
            sync_writes: false,
        })
    }

    /// Create a disabled WAL (in-memory only mode)
    pub fn disabled() -> Self {
        Wal {
            path: PathBuf::new(),
            writer: None,
            enabled: false,
            sync_writes: false,
        }
    }

    /// fsync after every append
    pub fn with_sync_writes(mut self, sync: bool) -> Self {
        self.sync_writes = sync;
        self
    }

    /// Check if WAL is enabled
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Append an entry to the WAL file
    pub fn append(&mut self, entry: &WalEntry) -> io::Result<()> {
        if !self.enabled {
            return Ok(());
        }
        if let Some(ref mut writer) = self.writer {
            writer.write_all(&entry.encode())?;
            writer.flush()?;
            if self.sync_writes {
                writer.get_ref().sync_data()?;
            }
        }
        Ok(())
    }

    /// Read all entries from the WAL file
    pub fn read_entries(&self) -> io::Result<Vec<WalEntry>> {
        if !self.enabled || !self.path.exists() {
            return Ok(Vec::new());
        }

        let mut file = File::open(&self.path)?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;

        let mut entries = Vec::new();
        let mut offset = 0;

        while offset < data.len() {
            match WalEntry::decode(&data[offset..]) {
                Ok((entry, consumed)) => {
                    entries.push(entry);
                    offset += consumed;
                }
                Err(e) => {
                    info!("Skipping corrupted WAL entry at offset {}: {}", offset, e);
                    // Try to find next valid entry by scanning for magic
                    offset += 1;
                    while offset + 4 <= data.len() {
                        if &data[offset..offset + 4] == WAL_MAGIC {
                            break;
                        }
                        offset += 1;
                    }
                    if offset + 4 > data.len() {
                        break;
                    }
                }
            }
        }

        Ok(entries)
    }

    /// Rewrite the WAL so it holds exactly the given version logs.
    ///
    /// Each log is written as one append per snapshot followed by enough
    /// undos to put the cursor back where it was. Returns the entry count.
    pub fn compact<'a, I>(&mut self, records: I) -> io::Result<usize>
    where
        I: IntoIterator<Item = (RecordId, u64, &'a VersionLog)>,
    {
        if !self.enabled {
            return Ok(0);
        }

        self.writer = None;

        let backup_path = self.path.with_extension("wal.bak");
        if self.path.exists() {
            std::fs::rename(&self.path, &backup_path)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        let mut writer = BufWriter::new(file);
        let mut written = 0;

        for (record_id, revision, log) in records {
            for snapshot in log.history() {
                let entry = WalEntry::Append {
                    record_id,
                    revision,
                    snapshot: snapshot.clone(),
                };
                writer.write_all(&entry.encode())?;
                written += 1;
            }
            for _ in log.position() + 1..log.len() {
                writer.write_all(&WalEntry::Undo { record_id, revision }.encode())?;
                written += 1;
            }
        }
        writer.flush()?;
        writer.get_ref().sync_data()?;

        if backup_path.exists() {
            std::fs::remove_file(&backup_path)?;
        }

        let file = OpenOptions::new()
            .append(true)
            .open(&self.path)?;
        self.writer = Some(BufWriter::new(file));

        info!("WAL compacted to {} entries", written);
        Ok(written)
    }

    /// Get the WAL file path
    pub fn path(&self) -> &Path {
        &self.path
    }
}
