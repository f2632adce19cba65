//! Cluster wire protocol.
//!
//! Every frame is `op:u8 | len:u32 BE | payload`. Responses use the same
//! framing; a NACK payload is a UTF-8 reason.

use storage::{ReplicatedRecord, Snapshot, SnapshotOp};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frames above this size are rejected before allocation
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Fixed part of an encoded record: id, revision, timestamp, age, deleted, op, name length
const RECORD_HEADER_LEN: usize = 8 + 8 + 8 + 4 + 1 + 1 + 4;

pub async fn write_frame<W>(writer: &mut W, op: u8, payload: &[u8]) -> tokio::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_u8(op).await?;
    writer.write_u32(payload.len() as u32).await?;
    writer.write_all(payload).await?;
    writer.flush().await
}

/// Reads one frame. `Ok(None)` means the peer closed the connection cleanly.
pub async fn read_frame<R>(reader: &mut R) -> tokio::io::Result<Option<(u8, Vec<u8>)>>
where
    R: AsyncRead + Unpin,
{
    let op = match reader.read_u8().await {
        Ok(op) => op,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => return Ok(None),
        Err(e) => return Err(e),
    };

    let len = reader.read_u32().await? as usize;
    if len > MAX_FRAME_SIZE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit", len),
        ));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some((op, payload)))
}

pub fn serialize_record(data: &mut Vec<u8>, record: &ReplicatedRecord) {
    let snapshot = &record.snapshot;
    data.extend_from_slice(&record.record_id.to_be_bytes());
    data.extend_from_slice(&record.revision.to_be_bytes());
    data.extend_from_slice(&snapshot.timestamp.to_be_bytes());
    data.extend_from_slice(&snapshot.age.to_be_bytes());
    data.push(snapshot.is_deleted as u8);
    data.push(snapshot.op.code());

    let name_bytes = snapshot.name.as_bytes();
    data.extend_from_slice(&(name_bytes.len() as u32).to_be_bytes());
    data.extend_from_slice(name_bytes);
}

pub fn deserialize_record(data: &[u8], offset: &mut usize) -> Option<ReplicatedRecord> {
    let header = data.get(*offset..*offset + RECORD_HEADER_LEN)?;
    let record_id = u64::from_be_bytes(header[0..8].try_into().ok()?);
    let revision = u64::from_be_bytes(header[8..16].try_into().ok()?);
    let timestamp = u64::from_be_bytes(header[16..24].try_into().ok()?);
    let age = u32::from_be_bytes(header[24..28].try_into().ok()?);
    let is_deleted = match header[28] {
        0 => false,
        1 => true,
        _ => return None,
    };
    let op = SnapshotOp::from_code(header[29])?;
    let name_len = u32::from_be_bytes(header[30..34].try_into().ok()?) as usize;
    *offset += RECORD_HEADER_LEN;

    let name = std::str::from_utf8(data.get(*offset..*offset + name_len)?)
        .ok()?
        .to_string();
    *offset += name_len;

    Some(ReplicatedRecord {
        record_id,
        revision,
        snapshot: Snapshot {
            name,
            age,
            is_deleted,
            timestamp,
            op,
        },
    })
}

/// Single record payload for `CLUSTER_OP_REPLICATE`
pub fn serialize_replicate(record: &ReplicatedRecord) -> Vec<u8> {
    let mut data = Vec::with_capacity(RECORD_HEADER_LEN + record.snapshot.name.len());
    serialize_record(&mut data, record);
    data
}

pub fn deserialize_replicate(data: &[u8]) -> Option<ReplicatedRecord> {
    let mut offset = 0;
    let record = deserialize_record(data, &mut offset)?;
    if offset != data.len() {
        return None;
    }
    Some(record)
}

/// Batch payload for `CLUSTER_OP_SYNC_DATA`: `count:u32 BE` followed by records
pub fn serialize_sync(records: &[ReplicatedRecord]) -> Vec<u8> {
    let mut data = Vec::new();
    data.extend_from_slice(&(records.len() as u32).to_be_bytes());
    for record in records {
        serialize_record(&mut data, record);
    }
    data
}

pub fn deserialize_sync(data: &[u8]) -> Option<Vec<ReplicatedRecord>> {
    let count = u32::from_be_bytes(data.get(0..4)?.try_into().ok()?) as usize;
    let mut offset = 4;
    // Each record needs at least a header; bound the allocation by what the payload can hold.
    let mut records = Vec::with_capacity(count.min(data.len() / RECORD_HEADER_LEN));
    for _ in 0..count {
        records.push(deserialize_record(data, &mut offset)?);
    }
    if offset != data.len() {
        return None;
    }
    Some(records)
}
