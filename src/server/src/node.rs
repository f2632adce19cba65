use std::collections::BTreeMap;
use std::sync::Arc;

use cluster::{
    LivenessGuard, NodeHealthController, NodeInfo, ReplicationCoordinator, Role, SyncStatus,
};
use log::{info, warn};
use serde::Serialize;
use storage::{Record, RecordId, RecordInput, RecordStore, Snapshot};

use crate::error::NodeError;

/// Response body for the list endpoint
#[derive(Debug, Clone, Serialize)]
pub struct Listing {
    pub data: Vec<Record>,
    pub role: Role,
    pub source: String,
}

/// A record together with its full history, returned by undo and redo
#[derive(Debug, Clone, Serialize)]
pub struct RecordWithHistory {
    pub record: Record,
    pub history: Vec<Snapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WhoAmI {
    pub node_id: String,
    pub role: Role,
    pub primary: String,
    pub alive: bool,
    pub records: usize,
    pub persistent: bool,
    pub cluster: Vec<NodeInfo>,
}

/// One cluster member: its store plus its view of the cluster.
///
/// Writes are accepted only while this node is the declared primary and
/// alive. Reads are always served from the local store, even when this node
/// is disconnected, so a down primary returns possibly stale data.
#[derive(Clone)]
pub struct Node {
    id: String,
    store: RecordStore,
    health: Arc<NodeHealthController>,
    coordinator: Arc<ReplicationCoordinator>,
}

impl Node {
    pub fn new(
        id: impl Into<String>,
        store: RecordStore,
        health: Arc<NodeHealthController>,
        coordinator: Arc<ReplicationCoordinator>,
    ) -> Self {
        Node {
            id: id.into(),
            store,
            health,
            coordinator,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    pub fn primary(&self) -> String {
        self.health.primary()
    }

    pub fn role(&self) -> Role {
        if self.health.is_primary(&self.id) {
            Role::Primary
        } else {
            Role::Replica
        }
    }

    /// Held for the duration of a write so a disconnect of this node cannot
    /// return while the write is still committing.
    async fn write_guard(&self) -> Result<LivenessGuard, NodeError> {
        let primary = self.health.primary();
        if primary != self.id {
            return Err(NodeError::NotPrimary {
                node: self.id.clone(),
                primary,
            });
        }
        self.health
            .acquire(&self.id)
            .await
            .map_err(|_| NodeError::PrimaryUnavailable(self.id.clone()))
    }

    pub async fn list(&self) -> Listing {
        Listing {
            data: self.store.list().await,
            role: self.role(),
            source: self.id.clone(),
        }
    }

    pub async fn get(&self, id: RecordId) -> Result<Record, NodeError> {
        Ok(self.store.get(id).await?)
    }

    pub async fn history(&self, id: RecordId) -> Result<Vec<Snapshot>, NodeError> {
        Ok(self.store.history(id).await?)
    }

    pub async fn create(&self, input: &RecordInput) -> Result<Record, NodeError> {
        let _guard = self.write_guard().await?;
        let (name, age) = input.validate()?;
        Ok(self.store.create(&name, age).await?)
    }

    pub async fn update(&self, id: RecordId, input: &RecordInput) -> Result<Record, NodeError> {
        let _guard = self.write_guard().await?;
        let (name, age) = input.validate()?;
        Ok(self.store.update(id, &name, age).await?)
    }

    pub async fn delete(&self, id: RecordId) -> Result<Record, NodeError> {
        let _guard = self.write_guard().await?;
        Ok(self.store.delete(id).await?)
    }

    pub async fn restore(&self, id: RecordId) -> Result<Record, NodeError> {
        let _guard = self.write_guard().await?;
        Ok(self.store.restore(id).await?)
    }

    pub async fn undo(&self, id: RecordId) -> Result<RecordWithHistory, NodeError> {
        let _guard = self.write_guard().await?;
        let (record, history) = self.store.undo(id).await?;
        Ok(RecordWithHistory { record, history })
    }

    pub async fn redo(&self, id: RecordId) -> Result<RecordWithHistory, NodeError> {
        let _guard = self.write_guard().await?;
        let (record, history) = self.store.redo(id).await?;
        Ok(RecordWithHistory { record, history })
    }

    pub fn replication_status(&self) -> BTreeMap<String, SyncStatus> {
        self.coordinator.status()
    }

    pub async fn run_replication(&self, nodes: &[String]) -> Result<BTreeMap<String, SyncStatus>, NodeError> {
        Ok(self.coordinator.run_full(nodes).await?)
    }

    /// Marks a node down; the current primary when `node` is `None`.
    pub async fn disconnect(&self, node: Option<&str>) -> Result<String, NodeError> {
        let target = match node {
            Some(node) => {
                self.health.disconnect(node).await?;
                node.to_string()
            }
            None => self.health.disconnect_primary().await?,
        };
        warn!("Simulated failure of {} (requested on {})", target, self.id);
        Ok(target)
    }

    /// Marks a node alive again; the current primary when `node` is `None`.
    pub async fn reconnect(&self, node: Option<&str>) -> Result<String, NodeError> {
        let target = match node {
            Some(node) => {
                self.health.reconnect(node).await?;
                node.to_string()
            }
            None => self.health.restore_primary().await?,
        };
        info!("{} reconnected (requested on {})", target, self.id);
        Ok(target)
    }

    /// Optionally moves the primary pointer to `node`, then marks the
    /// primary alive.
    pub async fn restore_primary(&self, node: Option<&str>) -> Result<String, NodeError> {
        if let Some(node) = node {
            self.health.set_primary(node)?;
        }
        Ok(self.health.restore_primary().await?)
    }

    pub async fn whoami(&self) -> WhoAmI {
        WhoAmI {
            node_id: self.id.clone(),
            role: self.role(),
            primary: self.health.primary(),
            alive: self.health.is_alive(&self.id).await.unwrap_or(false),
            records: self.store.len().await,
            persistent: self.store.is_persistent(),
            cluster: self.health.nodes().await,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use cluster::{LocalLink, ReplicaLink, ReplicationSettings};
    use std::future::Future;
    use std::time::Duration;
    use storage::StoreError;

    pub(crate) fn local_cluster(ids: &[&str], primary: &str) -> Vec<Node> {
        let members = ids.iter().map(|id| (id.to_string(), format!("local:{}", id)));
        let health = Arc::new(NodeHealthController::new(primary, members).unwrap());
        let stores: Vec<RecordStore> = ids.iter().map(|_| RecordStore::new()).collect();
        let settings = ReplicationSettings {
            timeout: Duration::from_millis(500),
            sync_timeout: Duration::from_millis(1000),
            retries: 1,
            backoff: Duration::from_millis(10),
            queue_capacity: 64,
        };

        ids.iter()
            .enumerate()
            .map(|(i, id)| {
                let links: Vec<Arc<dyn ReplicaLink>> = ids
                    .iter()
                    .enumerate()
                    .filter(|(j, _)| *j != i)
                    .map(|(j, other)| {
                        Arc::new(LocalLink::new(*other, stores[j].clone(), health.clone()))
                            as Arc<dyn ReplicaLink>
                    })
                    .collect();
                let coordinator = ReplicationCoordinator::start(
                    *id,
                    stores[i].clone(),
                    health.clone(),
                    links,
                    settings.clone(),
                );
                stores[i].attach_sink(coordinator.clone());
                Node::new(*id, stores[i].clone(), health.clone(), coordinator)
            })
            .collect()
    }

    pub(crate) async fn eventually<F, Fut>(mut check: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    fn settled(node: &Node) -> bool {
        node.replication_status()
            .values()
            .all(|status| *status != SyncStatus::Pending)
    }

    #[tokio::test]
    async fn test_replicas_reject_writes() {
        let nodes = local_cluster(&["node_A", "node_B"], "node_A");
        let err = nodes[1].create(&RecordInput::new("Alice", 30)).await.unwrap_err();
        assert!(matches!(err, NodeError::NotPrimary { .. }));
        assert_eq!(nodes[1].role(), Role::Replica);
    }

    #[tokio::test]
    async fn test_down_primary_rejects_writes_and_serves_stale_reads() {
        let nodes = local_cluster(&["node_A", "node_B"], "node_A");
        let alice = nodes[0].create(&RecordInput::new("Alice", 30)).await.unwrap();

        assert_eq!(nodes[0].disconnect(None).await.unwrap(), "node_A");
        let err = nodes[0]
            .update(alice.id, &RecordInput::new("Alice", 31))
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::PrimaryUnavailable(_)));
        assert_eq!(err.kind(), "primary_unavailable");

        assert_eq!(nodes[0].get(alice.id).await.unwrap().age, 30);
        assert_eq!(nodes[0].list().await.data.len(), 1);

        nodes[0].reconnect(None).await.unwrap();
        assert_eq!(
            nodes[0]
                .update(alice.id, &RecordInput::new("Alice", 31))
                .await
                .unwrap()
                .age,
            31
        );
    }

    #[tokio::test]
    async fn test_invalid_input_is_rejected() {
        let nodes = local_cluster(&["node_A"], "node_A");
        let err = nodes[0].create(&RecordInput::new("   ", 30)).await.unwrap_err();
        assert!(matches!(err, NodeError::Store(StoreError::InvalidInput(_))));
        assert!(nodes[0].list().await.data.is_empty());
    }

    #[tokio::test]
    async fn test_undo_redo_return_history() {
        let nodes = local_cluster(&["node_A"], "node_A");
        let node = &nodes[0];
        let alice = node.create(&RecordInput::new("Alice", 30)).await.unwrap();
        node.update(alice.id, &RecordInput::new("Alice", 31)).await.unwrap();

        let undone = node.undo(alice.id).await.unwrap();
        assert_eq!(undone.record.age, 30);
        assert_eq!(undone.history.len(), 2);

        let redone = node.redo(alice.id).await.unwrap();
        assert_eq!(redone.record.age, 31);

        let err = node.redo(alice.id).await.unwrap_err();
        assert_eq!(err.kind(), "no_future");
    }

    #[tokio::test]
    async fn test_failover_and_convergence() {
        let nodes = local_cluster(&["node_A", "node_B", "node_C"], "node_A");
        let alice = nodes[0].create(&RecordInput::new("Alice", 30)).await.unwrap();
        assert!(eventually(|| async { settled(&nodes[0]) }).await);

        nodes[0].disconnect(None).await.unwrap();
        nodes[1].restore_primary(Some("node_B")).await.unwrap();
        assert_eq!(nodes[1].role(), Role::Primary);
        assert_eq!(nodes[0].role(), Role::Replica);

        // node_A is still down after the pointer moved.
        let whoami = nodes[1].whoami().await;
        assert_eq!(whoami.primary, "node_B");
        assert!(!whoami.cluster[0].alive);

        nodes[1]
            .update(alice.id, &RecordInput::new("Alice", 33))
            .await
            .unwrap();
        assert!(eventually(|| async { settled(&nodes[1]) }).await);
        assert_eq!(nodes[1].replication_status()["node_A"], SyncStatus::Error);
        assert_eq!(nodes[2].get(alice.id).await.unwrap().age, 33);

        nodes[1].reconnect(Some("node_A")).await.unwrap();
        let results = nodes[1].run_replication(&[]).await.unwrap();
        assert!(results.values().all(|status| *status == SyncStatus::Synced));

        let expected = nodes[1].store().export().await;
        assert_eq!(nodes[0].store().export().await, expected);
        assert_eq!(nodes[2].store().export().await, expected);
    }

    #[tokio::test]
    async fn test_failover_converges_when_replicas_hold_other_writes() {
        let nodes = local_cluster(&["node_A", "node_B", "node_C"], "node_A");
        let alice = nodes[0].create(&RecordInput::new("Alice", 30)).await.unwrap();
        assert!(eventually(|| async { settled(&nodes[0]) }).await);

        // node_B misses both writes; node_C sees them.
        nodes[0].disconnect(Some("node_B")).await.unwrap();
        nodes[0].update(alice.id, &RecordInput::new("Alice", 31)).await.unwrap();
        let bob = nodes[0].create(&RecordInput::new("Bob", 40)).await.unwrap();
        assert!(
            eventually(|| async { nodes[0].replication_status()["node_C"] == SyncStatus::Synced }).await
        );

        nodes[0].restore_primary(Some("node_B")).await.unwrap();
        nodes[1]
            .update(alice.id, &RecordInput::new("Alice", 40))
            .await
            .unwrap();

        // Same revision, different state: not reported as synced.
        assert!(eventually(|| async { settled(&nodes[1]) }).await);
        assert_eq!(nodes[1].replication_status()["node_A"], SyncStatus::Error);
        assert_eq!(nodes[1].replication_status()["node_C"], SyncStatus::Error);

        let results = nodes[1].run_replication(&[]).await.unwrap();
        assert!(results.values().all(|status| *status == SyncStatus::Synced));

        let expected = nodes[1].list().await.data;
        for node in [&nodes[0], &nodes[2]] {
            assert_eq!(node.list().await.data, expected);
            assert!(node.get(bob.id).await.is_err());
        }
        assert_eq!(nodes[0].get(alice.id).await.unwrap().age, 40);
    }

    #[tokio::test]
    async fn test_run_replication_on_replica() {
        let nodes = local_cluster(&["node_A", "node_B"], "node_A");
        let err = nodes[1].run_replication(&[]).await.unwrap_err();
        assert_eq!(err.kind(), "not_primary");
    }

    #[tokio::test]
    async fn test_disconnect_unknown_node() {
        let nodes = local_cluster(&["node_A"], "node_A");
        let err = nodes[0].disconnect(Some("node_Z")).await.unwrap_err();
        assert_eq!(err.kind(), "unknown_node");
    }
}
