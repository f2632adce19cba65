use std::sync::Arc;

use log::{debug, error, info, warn};
use storage::RecordStore;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

use crate::coordinator::ReplicationCoordinator;
use crate::health::NodeHealthController;
use crate::protocol::{deserialize_replicate, deserialize_sync, read_frame, write_frame};
use crate::types::{
    CLUSTER_OP_NACK, CLUSTER_OP_REPLICATE, CLUSTER_OP_REPLICATE_ACK, CLUSTER_OP_SYNC_COMPLETE,
    CLUSTER_OP_SYNC_DATA,
};

/// Accepts replication frames from the primary and applies them locally
pub struct ClusterListener {
    node_id: String,
    store: RecordStore,
    health: Arc<NodeHealthController>,
    coordinator: Arc<ReplicationCoordinator>,
}

impl ClusterListener {
    pub fn new(
        node_id: impl Into<String>,
        store: RecordStore,
        health: Arc<NodeHealthController>,
        coordinator: Arc<ReplicationCoordinator>,
    ) -> Arc<Self> {
        Arc::new(ClusterListener {
            node_id: node_id.into(),
            store,
            health,
            coordinator,
        })
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener, mut shutdown: broadcast::Receiver<()>) {
        if let Ok(addr) = listener.local_addr() {
            info!("Cluster listener for {} on {}", self.node_id, addr);
        }

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            debug!("Cluster connection from {}", addr);
                            let this = self.clone();
                            tokio::spawn(async move {
                                if let Err(e) = this.handle_connection(stream).await {
                                    debug!("Cluster connection from {} closed: {}", addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Cluster accept error: {}", e);
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("Cluster listener shutting down");
                    break;
                }
            }
        }
    }

    async fn handle_connection(&self, stream: TcpStream) -> tokio::io::Result<()> {
        let (mut reader, mut writer) = stream.into_split();

        while let Some((op, payload)) = read_frame(&mut reader).await? {
            let (reply_op, reply) = match op {
                CLUSTER_OP_REPLICATE => self.handle_replicate(&payload).await,
                CLUSTER_OP_SYNC_DATA => self.handle_sync(&payload).await,
                other => {
                    warn!("Unknown cluster op 0x{:02x}", other);
                    nack(format!("unknown op 0x{:02x}", other))
                }
            };
            write_frame(&mut writer, reply_op, &reply).await?;
        }
        Ok(())
    }

    /// A node that believes it is the primary never adopts another node's state
    fn refusal(&self) -> Option<String> {
        if self.health.is_primary(&self.node_id) {
            return Some(format!("{} is the primary", self.node_id));
        }
        None
    }

    async fn handle_replicate(&self, payload: &[u8]) -> (u8, Vec<u8>) {
        if let Some(reason) = self.refusal() {
            return nack(reason);
        }
        let Some(record) = deserialize_replicate(payload) else {
            return nack("malformed replicate payload".to_string());
        };
        let Ok(_alive) = self.health.acquire(&self.node_id).await else {
            return nack(format!("{} is down", self.node_id));
        };

        match self.store.apply_replicated(&record).await {
            Ok(changed) => {
                debug!(
                    "Applied replicated record {} rev {} (changed: {})",
                    record.record_id, record.revision, changed
                );
                (CLUSTER_OP_REPLICATE_ACK, Vec::new())
            }
            Err(e) if e.is_fatal() => {
                error!("Failed to apply replicated record {}: {}", record.record_id, e);
                nack(e.to_string())
            }
            Err(e) => {
                warn!("Refused replicated record {}: {}", record.record_id, e);
                nack(e.to_string())
            }
        }
    }

    async fn handle_sync(&self, payload: &[u8]) -> (u8, Vec<u8>) {
        if let Some(reason) = self.refusal() {
            return nack(reason);
        }
        let Some(records) = deserialize_sync(payload) else {
            return nack("malformed sync payload".to_string());
        };
        let Ok(_alive) = self.health.acquire(&self.node_id).await else {
            return nack(format!("{} is down", self.node_id));
        };

        let changed = match self.store.replace_all(&records).await {
            Ok(changed) => changed as u32,
            Err(e) => {
                error!("Full sync failed: {}", e);
                return nack(e.to_string());
            }
        };

        self.coordinator.mark_synced(&self.node_id);
        info!(
            "Full sync received: {} record(s), {} changed or dropped",
            records.len(),
            changed
        );
        (CLUSTER_OP_SYNC_COMPLETE, changed.to_be_bytes().to_vec())
    }
}

fn nack(reason: String) -> (u8, Vec<u8>) {
    (CLUSTER_OP_NACK, reason.into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::ReplicationSettings;
    use crate::error::ReplicationError;
    use crate::link::{ReplicaLink, TcpLink};
    use storage::ReplicatedRecord;

    async fn replica() -> (Arc<NodeHealthController>, RecordStore, String, broadcast::Sender<()>) {
        let members = vec![
            ("node_A".to_string(), "127.0.0.1:0".to_string()),
            ("node_B".to_string(), "127.0.0.1:0".to_string()),
        ];
        let health = Arc::new(NodeHealthController::new("node_A", members).unwrap());
        let store = RecordStore::new();
        let coordinator = ReplicationCoordinator::start(
            "node_B",
            store.clone(),
            health.clone(),
            Vec::new(),
            ReplicationSettings::default(),
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let server = ClusterListener::new("node_B", store.clone(), health.clone(), coordinator);
        tokio::spawn(server.serve(listener, shutdown_rx));

        (health, store, addr, shutdown_tx)
    }

    #[tokio::test]
    async fn test_tcp_replicate_and_sync() {
        let (_health, replica_store, addr, _shutdown) = replica().await;
        let primary = RecordStore::new();
        let link = TcpLink::new("node_B", addr);

        let alice = primary.create("Alice", 30).await.unwrap();
        let exported = primary.export().await;
        link.apply(&exported[0]).await.unwrap();
        assert_eq!(replica_store.get(alice.id).await.unwrap().name, "Alice");

        primary.update(alice.id, "Alice", 31).await.unwrap();
        primary.create("Bob", 40).await.unwrap();
        let exported: Vec<ReplicatedRecord> = primary.export().await;
        assert_eq!(link.resync(&exported).await.unwrap(), 2);
        assert_eq!(replica_store.export().await, exported);

        // A second full sync changes nothing.
        assert_eq!(link.resync(&exported).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_tcp_sync_drops_records_primary_lacks() {
        let (_health, replica_store, addr, _shutdown) = replica().await;
        replica_store.create("Orphan", 70).await.unwrap();
        replica_store.create("Orphan", 71).await.unwrap();

        let primary = RecordStore::new();
        primary.create("Alice", 30).await.unwrap();
        let link = TcpLink::new("node_B", addr);

        assert_eq!(link.resync(&primary.export().await).await.unwrap(), 2);
        assert_eq!(replica_store.list().await, primary.list().await);
    }

    #[tokio::test]
    async fn test_tcp_rejects_when_down() {
        let (health, _store, addr, _shutdown) = replica().await;
        let primary = RecordStore::new();
        primary.create("Alice", 30).await.unwrap();
        let exported = primary.export().await;

        health.disconnect("node_B").await.unwrap();
        let link = TcpLink::new("node_B", addr);
        let err = link.apply(&exported[0]).await.unwrap_err();
        assert!(matches!(err, ReplicationError::Rejected { .. }));
    }

    #[tokio::test]
    async fn test_tcp_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let link = TcpLink::new("node_B", addr);
        let err = link.resync(&[]).await.unwrap_err();
        assert!(matches!(err, ReplicationError::Unreachable { .. }));
    }
}
