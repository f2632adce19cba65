use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};

use log::{info, warn};
use tokio::sync::{OwnedRwLockReadGuard, RwLock};

use crate::config::ClusterConfig;
use crate::error::{ConfigError, HealthError};
use crate::types::{NodeInfo, Role};

struct NodeSlot {
    address: String,
    alive: Arc<RwLock<bool>>,
    /// Bumped by every disconnect, under the write lock.
    epoch: AtomicU64,
}

/// Proof that a node was alive when the guard was taken.
///
/// While any guard for a node is held, `disconnect` on that node waits.
/// Once `disconnect` returns, no guard for the node is outstanding.
pub struct LivenessGuard {
    node_id: String,
    _alive: OwnedRwLockReadGuard<bool>,
}

impl LivenessGuard {
    pub fn node_id(&self) -> &str {
        &self.node_id
    }
}

/// Cluster membership, the declared primary, and per-node liveness flags.
///
/// Membership is fixed at bootstrap. Liveness changes only through explicit
/// disconnect/reconnect calls.
pub struct NodeHealthController {
    nodes: BTreeMap<String, NodeSlot>,
    primary: StdRwLock<String>,
}

impl NodeHealthController {
    pub fn new<I>(primary: &str, members: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut nodes = BTreeMap::new();
        for (id, address) in members {
            if nodes.contains_key(&id) {
                return Err(ConfigError::DuplicateNode(id));
            }
            nodes.insert(
                id,
                NodeSlot {
                    address,
                    alive: Arc::new(RwLock::new(true)),
                    epoch: AtomicU64::new(0),
                },
            );
        }
        if !nodes.contains_key(primary) {
            return Err(ConfigError::UnknownPrimary(primary.to_string()));
        }
        Ok(NodeHealthController {
            nodes,
            primary: StdRwLock::new(primary.to_string()),
        })
    }

    pub fn from_config(config: &ClusterConfig) -> Result<Self, ConfigError> {
        Self::new(&config.primary, config.members())
    }

    pub fn primary(&self) -> String {
        self.primary
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn is_primary(&self, node_id: &str) -> bool {
        *self
            .primary
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            == node_id
    }

    /// Moves the primary pointer. Liveness of either node is untouched.
    pub fn set_primary(&self, node_id: &str) -> Result<(), HealthError> {
        self.slot(node_id)?;
        let mut primary = self
            .primary
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if *primary != node_id {
            info!("Primary changed: {} -> {}", primary, node_id);
            *primary = node_id.to_string();
        }
        Ok(())
    }

    pub fn role_of(&self, node_id: &str) -> Result<Role, HealthError> {
        self.slot(node_id)?;
        if self.is_primary(node_id) {
            Ok(Role::Primary)
        } else {
            Ok(Role::Replica)
        }
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.contains_key(node_id)
    }

    pub fn node_ids(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }

    pub fn address_of(&self, node_id: &str) -> Result<&str, HealthError> {
        Ok(self.slot(node_id)?.address.as_str())
    }

    pub async fn is_alive(&self, node_id: &str) -> Result<bool, HealthError> {
        let slot = self.slot(node_id)?;
        let alive = *slot.alive.read().await;
        Ok(alive)
    }

    /// Takes a liveness guard, failing with `NodeDown` if the node is disconnected.
    pub async fn acquire(&self, node_id: &str) -> Result<LivenessGuard, HealthError> {
        let slot = self.slot(node_id)?;
        let alive = slot.alive.clone().read_owned().await;
        if !*alive {
            return Err(HealthError::NodeDown(node_id.to_string()));
        }
        Ok(LivenessGuard {
            node_id: node_id.to_string(),
            _alive: alive,
        })
    }

    /// Disconnect epoch of a live node.
    ///
    /// For long operations such as network delivery that must not hold a
    /// guard: read the epoch before, then check `alive_since` after.
    pub async fn epoch(&self, node_id: &str) -> Result<u64, HealthError> {
        let slot = self.slot(node_id)?;
        let alive = slot.alive.read().await;
        if !*alive {
            return Err(HealthError::NodeDown(node_id.to_string()));
        }
        Ok(slot.epoch.load(Ordering::SeqCst))
    }

    /// Whether the node is alive and has not been disconnected since `epoch`
    pub async fn alive_since(&self, node_id: &str, epoch: u64) -> bool {
        let Ok(slot) = self.slot(node_id) else {
            return false;
        };
        let alive = slot.alive.read().await;
        *alive && slot.epoch.load(Ordering::SeqCst) == epoch
    }

    /// Marks a node down. Waits for outstanding guards on that node to drop.
    ///
    /// Returns whether the flag changed.
    pub async fn disconnect(&self, node_id: &str) -> Result<bool, HealthError> {
        let slot = self.slot(node_id)?;
        let mut alive = slot.alive.write().await;
        let changed = *alive;
        *alive = false;
        if changed {
            slot.epoch.fetch_add(1, Ordering::SeqCst);
            warn!("Node {} disconnected", node_id);
        }
        Ok(changed)
    }

    pub async fn reconnect(&self, node_id: &str) -> Result<bool, HealthError> {
        let slot = self.slot(node_id)?;
        let mut alive = slot.alive.write().await;
        let changed = !*alive;
        *alive = true;
        if changed {
            info!("Node {} reconnected", node_id);
        }
        Ok(changed)
    }

    /// Disconnects whichever node is currently the primary and returns its id.
    pub async fn disconnect_primary(&self) -> Result<String, HealthError> {
        let primary = self.primary();
        self.disconnect(&primary).await?;
        Ok(primary)
    }

    pub async fn restore_primary(&self) -> Result<String, HealthError> {
        let primary = self.primary();
        self.reconnect(&primary).await?;
        Ok(primary)
    }

    pub async fn nodes(&self) -> Vec<NodeInfo> {
        let primary = self.primary();
        let mut infos = Vec::with_capacity(self.nodes.len());
        for (id, slot) in &self.nodes {
            infos.push(NodeInfo {
                node_id: id.clone(),
                role: if *id == primary { Role::Primary } else { Role::Replica },
                address: slot.address.clone(),
                alive: *slot.alive.read().await,
            });
        }
        infos
    }

    fn slot(&self, node_id: &str) -> Result<&NodeSlot, HealthError> {
        self.nodes
            .get(node_id)
            .ok_or_else(|| HealthError::UnknownNode(node_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn controller() -> Arc<NodeHealthController> {
        let members = ["node_A", "node_B", "node_C"]
            .iter()
            .enumerate()
            .map(|(i, id)| (id.to_string(), format!("127.0.0.1:{}", 5100 + i)));
        Arc::new(NodeHealthController::new("node_A", members).unwrap())
    }

    #[test]
    fn test_rejects_unknown_primary() {
        let members = vec![("node_A".to_string(), "127.0.0.1:5100".to_string())];
        assert!(NodeHealthController::new("node_B", members).is_err());
    }

    #[tokio::test]
    async fn test_roles_follow_primary_pointer() {
        let health = controller();
        assert_eq!(health.role_of("node_A").unwrap(), Role::Primary);
        assert_eq!(health.role_of("node_B").unwrap(), Role::Replica);

        health.set_primary("node_B").unwrap();
        assert_eq!(health.role_of("node_A").unwrap(), Role::Replica);
        assert_eq!(health.role_of("node_B").unwrap(), Role::Primary);

        assert_eq!(
            health.set_primary("node_Z"),
            Err(HealthError::UnknownNode("node_Z".to_string()))
        );
        assert_eq!(health.primary(), "node_B");
    }

    #[tokio::test]
    async fn test_disconnect_and_restore_primary() {
        let health = controller();
        assert_eq!(health.disconnect_primary().await.unwrap(), "node_A");
        assert!(!health.is_alive("node_A").await.unwrap());
        assert!(health.is_alive("node_B").await.unwrap());
        assert!(matches!(
            health.acquire("node_A").await,
            Err(HealthError::NodeDown(_))
        ));

        // Repeating a disconnect is a no-op.
        assert!(!health.disconnect("node_A").await.unwrap());

        health.restore_primary().await.unwrap();
        assert!(health.acquire("node_A").await.is_ok());
    }

    #[tokio::test]
    async fn test_disconnect_waits_for_guards() {
        let health = controller();
        let guard = health.acquire("node_A").await.unwrap();

        let disconnecting = {
            let health = health.clone();
            tokio::spawn(async move { health.disconnect("node_A").await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!disconnecting.is_finished());

        drop(guard);
        assert!(disconnecting.await.unwrap().unwrap());
        assert!(!health.is_alive("node_A").await.unwrap());
    }

    #[tokio::test]
    async fn test_epoch_detects_disconnect_in_between() {
        let health = controller();
        let epoch = health.epoch("node_B").await.unwrap();
        assert!(health.alive_since("node_B", epoch).await);

        health.disconnect("node_B").await.unwrap();
        assert!(matches!(health.epoch("node_B").await, Err(HealthError::NodeDown(_))));
        health.reconnect("node_B").await.unwrap();

        // Alive again, but the earlier epoch no longer counts.
        assert!(!health.alive_since("node_B", epoch).await);
        let current = health.epoch("node_B").await.unwrap();
        assert!(health.alive_since("node_B", current).await);
        assert!(!health.alive_since("node_Z", current).await);
    }

    #[tokio::test]
    async fn test_nodes_snapshot() {
        let health = controller();
        health.disconnect("node_C").await.unwrap();
        let nodes = health.nodes().await;
        assert_eq!(nodes.len(), 3);
        assert_eq!(nodes[0].role, Role::Primary);
        assert!(!nodes[2].alive);
        assert_eq!(nodes[2].address, "127.0.0.1:5102");
    }
}
