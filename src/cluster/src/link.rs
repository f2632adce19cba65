use std::sync::Arc;

use async_trait::async_trait;
use storage::{RecordStore, ReplicatedRecord, StoreError};
use tokio::net::TcpStream;

use crate::error::ReplicationError;
use crate::health::NodeHealthController;
use crate::protocol::{read_frame, serialize_replicate, serialize_sync, write_frame};
use crate::types::{
    CLUSTER_OP_NACK, CLUSTER_OP_REPLICATE, CLUSTER_OP_REPLICATE_ACK, CLUSTER_OP_SYNC_COMPLETE,
    CLUSTER_OP_SYNC_DATA,
};

/// Delivery channel from the primary to one replica.
///
/// Timeouts and retries are the caller's job; a link makes exactly one attempt.
#[async_trait]
pub trait ReplicaLink: Send + Sync {
    fn node_id(&self) -> &str;

    /// Apply one committed snapshot on the replica.
    async fn apply(&self, record: &ReplicatedRecord) -> Result<(), ReplicationError>;

    /// Make the replica hold exactly the given records, dropping any others.
    /// Returns how many records changed or were dropped.
    async fn resync(&self, records: &[ReplicatedRecord]) -> Result<usize, ReplicationError>;
}

/// Link to a store in the same process.
///
/// Like the cluster listener, the receiving side holds its own liveness
/// guard while it writes, so a disconnect waits only for a write in progress.
pub struct LocalLink {
    node_id: String,
    store: RecordStore,
    health: Arc<NodeHealthController>,
}

impl LocalLink {
    pub fn new(node_id: impl Into<String>, store: RecordStore, health: Arc<NodeHealthController>) -> Self {
        LocalLink {
            node_id: node_id.into(),
            store,
            health,
        }
    }

    fn rejected(&self, err: StoreError) -> ReplicationError {
        ReplicationError::Rejected {
            node: self.node_id.clone(),
            reason: err.to_string(),
        }
    }
}

#[async_trait]
impl ReplicaLink for LocalLink {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    async fn apply(&self, record: &ReplicatedRecord) -> Result<(), ReplicationError> {
        let _alive = self.health.acquire(&self.node_id).await?;
        self.store
            .apply_replicated(record)
            .await
            .map(|_| ())
            .map_err(|e| self.rejected(e))
    }

    async fn resync(&self, records: &[ReplicatedRecord]) -> Result<usize, ReplicationError> {
        let _alive = self.health.acquire(&self.node_id).await?;
        self.store.replace_all(records).await.map_err(|e| self.rejected(e))
    }
}

/// Link to a replica's cluster listener over TCP.
///
/// One connection per call.
pub struct TcpLink {
    node_id: String,
    addr: String,
}

impl TcpLink {
    pub fn new(node_id: impl Into<String>, addr: impl Into<String>) -> Self {
        TcpLink {
            node_id: node_id.into(),
            addr: addr.into(),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn exchange(&self, op: u8, payload: &[u8]) -> Result<(u8, Vec<u8>), ReplicationError> {
        let io_error = |e: std::io::Error| ReplicationError::Unreachable {
            node: self.node_id.clone(),
            reason: e.to_string(),
        };

        let stream = TcpStream::connect(&self.addr).await.map_err(io_error)?;
        let (mut reader, mut writer) = stream.into_split();

        write_frame(&mut writer, op, payload).await.map_err(io_error)?;

        match read_frame(&mut reader).await.map_err(io_error)? {
            Some((CLUSTER_OP_NACK, reason)) => Err(ReplicationError::Rejected {
                node: self.node_id.clone(),
                reason: String::from_utf8_lossy(&reason).to_string(),
            }),
            Some(frame) => Ok(frame),
            None => Err(ReplicationError::Unreachable {
                node: self.node_id.clone(),
                reason: "connection closed before reply".to_string(),
            }),
        }
    }
}

#[async_trait]
impl ReplicaLink for TcpLink {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    async fn apply(&self, record: &ReplicatedRecord) -> Result<(), ReplicationError> {
        let data = serialize_replicate(record);
        match self.exchange(CLUSTER_OP_REPLICATE, &data).await? {
            (CLUSTER_OP_REPLICATE_ACK, _) => Ok(()),
            (op, _) => Err(ReplicationError::Protocol(format!(
                "unexpected reply 0x{:02x} to replicate from {}",
                op, self.node_id
            ))),
        }
    }

    async fn resync(&self, records: &[ReplicatedRecord]) -> Result<usize, ReplicationError> {
        let data = serialize_sync(records);
        match self.exchange(CLUSTER_OP_SYNC_DATA, &data).await? {
            (CLUSTER_OP_SYNC_COMPLETE, payload) => {
                let changed = payload
                    .get(0..4)
                    .and_then(|b| b.try_into().ok())
                    .map(u32::from_be_bytes)
                    .ok_or_else(|| ReplicationError::Protocol("short sync reply".to_string()))?;
                Ok(changed as usize)
            }
            (op, _) => Err(ReplicationError::Protocol(format!(
                "unexpected reply 0x{:02x} to sync from {}",
                op, self.node_id
            ))),
        }
    }
}
