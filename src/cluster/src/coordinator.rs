use std::collections::BTreeMap;
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;

use log::{debug, error, info, warn};
use rand::Rng;
use storage::{MutationEvent, MutationSink, RecordStore, ReplicatedRecord};
use tokio::sync::{mpsc, oneshot};

use crate::config::ClusterConfig;
use crate::error::ReplicationError;
use crate::health::NodeHealthController;
use crate::link::ReplicaLink;
use crate::types::SyncStatus;

/// Delivery tuning shared by every replica worker
#[derive(Debug, Clone)]
pub struct ReplicationSettings {
    pub timeout: Duration,
    pub sync_timeout: Duration,
    pub retries: u32,
    pub backoff: Duration,
    pub queue_capacity: usize,
}

impl Default for ReplicationSettings {
    fn default() -> Self {
        ReplicationSettings {
            timeout: Duration::from_millis(3000),
            sync_timeout: Duration::from_millis(10_000),
            retries: 3,
            backoff: Duration::from_millis(100),
            queue_capacity: 1024,
        }
    }
}

impl From<&ClusterConfig> for ReplicationSettings {
    fn from(config: &ClusterConfig) -> Self {
        ReplicationSettings {
            timeout: config.replication_timeout,
            sync_timeout: config.sync_timeout,
            retries: config.replication_retries,
            backoff: config.retry_backoff,
            queue_capacity: config.queue_capacity.max(1),
        }
    }
}

enum Job {
    Apply(ReplicatedRecord),
    /// Bulk resync. Exported by the worker itself so it is ordered with the
    /// incremental events already queued for the replica.
    Resync(oneshot::Sender<SyncStatus>),
}

enum Payload<'a> {
    One(&'a ReplicatedRecord),
    All(&'a [ReplicatedRecord]),
}

struct SyncState {
    status: SyncStatus,
    /// Set when an event was lost; cleared only by a successful resync.
    dirty: bool,
    in_flight: usize,
}

/// Per-node replication status.
///
/// A node that missed an event stays `error` until a bulk resync succeeds,
/// even if later events reach it.
struct Tracker {
    states: StdRwLock<BTreeMap<String, SyncState>>,
}

impl Tracker {
    fn new(nodes: Vec<String>) -> Self {
        let states = nodes
            .into_iter()
            .map(|node| {
                (
                    node,
                    SyncState {
                        status: SyncStatus::Synced,
                        dirty: false,
                        in_flight: 0,
                    },
                )
            })
            .collect();
        Tracker {
            states: StdRwLock::new(states),
        }
    }

    fn update<R>(&self, node: &str, f: impl FnOnce(&mut SyncState) -> R) -> Option<R> {
        let mut states = self
            .states
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        states.get_mut(node).map(f)
    }

    fn enqueued(&self, node: &str) {
        self.update(node, |state| {
            state.in_flight += 1;
            if !state.dirty {
                state.status = SyncStatus::Pending;
            }
        });
    }

    fn dropped(&self, node: &str) {
        self.update(node, |state| {
            state.in_flight = state.in_flight.saturating_sub(1);
            state.dirty = true;
            state.status = SyncStatus::Error;
        });
    }

    fn applied(&self, node: &str, ok: bool) {
        self.update(node, |state| {
            state.in_flight = state.in_flight.saturating_sub(1);
            if !ok {
                state.dirty = true;
                state.status = SyncStatus::Error;
            } else if !state.dirty && state.in_flight == 0 {
                state.status = SyncStatus::Synced;
            }
        });
    }

    fn resync_started(&self, node: &str) {
        self.update(node, |state| state.status = SyncStatus::Pending);
    }

    fn resynced(&self, node: &str, ok: bool) -> SyncStatus {
        self.update(node, |state| {
            if ok {
                state.dirty = false;
                state.status = if state.in_flight == 0 {
                    SyncStatus::Synced
                } else {
                    SyncStatus::Pending
                };
            } else {
                state.dirty = true;
                state.status = SyncStatus::Error;
            }
            state.status
        })
        .unwrap_or(SyncStatus::Error)
    }

    fn mark_synced(&self, node: &str) -> bool {
        self.update(node, |state| {
            state.dirty = false;
            state.status = SyncStatus::Synced;
        })
        .is_some()
    }

    fn snapshot(&self) -> BTreeMap<String, SyncStatus> {
        self.states
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|(node, state)| (node.clone(), state.status))
            .collect()
    }
}

#[derive(Clone)]
struct Delivery {
    source: String,
    health: Arc<NodeHealthController>,
    settings: ReplicationSettings,
}

impl Delivery {
    async fn deliver(&self, link: &dyn ReplicaLink, payload: Payload<'_>) -> Result<usize, ReplicationError> {
        let mut attempt = 0;
        loop {
            match self.attempt(link, &payload).await {
                Ok(changed) => return Ok(changed),
                Err(e) if attempt < self.settings.retries && is_retryable(&e) => {
                    let delay = self.backoff(attempt);
                    debug!(
                        "Replication to {} failed ({}), retry {} in {:?}",
                        link.node_id(),
                        e,
                        attempt + 1,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One attempt. Liveness of both ends is read before the link call and
    /// checked again after it; a disconnect in between fails the attempt.
    /// No guard is held across the call, so a disconnect never waits on I/O.
    async fn attempt(&self, link: &dyn ReplicaLink, payload: &Payload<'_>) -> Result<usize, ReplicationError> {
        let target = link.node_id();
        let source_epoch = self
            .health
            .epoch(&self.source)
            .await
            .map_err(|_| ReplicationError::PrimaryUnavailable(self.source.clone()))?;
        let target_epoch = self.health.epoch(target).await?;

        let (limit, result) = match payload {
            Payload::One(record) => {
                let limit = self.settings.timeout;
                (limit, tokio::time::timeout(limit, link.apply(record)).await.map(|r| r.map(|_| 1)))
            }
            Payload::All(records) => {
                let limit = self.settings.sync_timeout;
                (limit, tokio::time::timeout(limit, link.resync(records)).await)
            }
        };

        if !self.health.alive_since(&self.source, source_epoch).await {
            return Err(ReplicationError::PrimaryUnavailable(self.source.clone()));
        }
        if !self.health.alive_since(target, target_epoch).await {
            return Err(ReplicationError::NodeDown(target.to_string()));
        }

        result.map_err(|_| ReplicationError::Timeout {
            node: target.to_string(),
            timeout: limit,
        })?
    }

    /// Exponential backoff with up to 50% jitter
    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.settings.backoff.as_millis() as u64;
        let delay = base.saturating_mul(1u64 << attempt.min(16));
        let jitter = if delay > 1 {
            rand::thread_rng().gen_range(0..=delay / 2)
        } else {
            0
        };
        Duration::from_millis(delay + jitter)
    }
}

fn is_retryable(error: &ReplicationError) -> bool {
    matches!(
        error,
        ReplicationError::Timeout { .. }
            | ReplicationError::Unreachable { .. }
            | ReplicationError::Rejected { .. }
            | ReplicationError::Protocol(_)
    )
}

/// Fans committed mutations out to replicas and tracks their status.
///
/// Each replica has a bounded queue drained by one worker task, so events
/// for a replica are applied in commit order. Commits never wait on
/// propagation; a full queue marks the replica `error` instead.
pub struct ReplicationCoordinator {
    node_id: String,
    health: Arc<NodeHealthController>,
    queues: BTreeMap<String, mpsc::Sender<Job>>,
    tracker: Arc<Tracker>,
}

impl ReplicationCoordinator {
    /// Spawns one worker per link. Must be called inside a tokio runtime.
    pub fn start(
        node_id: impl Into<String>,
        store: RecordStore,
        health: Arc<NodeHealthController>,
        links: Vec<Arc<dyn ReplicaLink>>,
        settings: ReplicationSettings,
    ) -> Arc<Self> {
        let node_id = node_id.into();
        let tracker = Arc::new(Tracker::new(health.node_ids()));
        let delivery = Delivery {
            source: node_id.clone(),
            health: health.clone(),
            settings: settings.clone(),
        };

        let mut queues = BTreeMap::new();
        for link in links {
            let target = link.node_id().to_string();
            if target == node_id || !health.contains(&target) || queues.contains_key(&target) {
                warn!("Ignoring replica link to {}", target);
                continue;
            }

            let (tx, rx) = mpsc::channel(settings.queue_capacity.max(1));
            queues.insert(target, tx);
            tokio::spawn(run_worker(
                link,
                rx,
                store.clone(),
                tracker.clone(),
                delivery.clone(),
            ));
        }

        info!(
            "Replication coordinator for {} started with {} replica link(s)",
            node_id,
            queues.len()
        );

        Arc::new(ReplicationCoordinator {
            node_id,
            health,
            queues,
            tracker,
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn replicas(&self) -> Vec<String> {
        self.queues.keys().cloned().collect()
    }

    /// Status of every cluster member as seen from this node
    pub fn status(&self) -> BTreeMap<String, SyncStatus> {
        self.tracker.snapshot()
    }

    /// Records that this node received a full resync from the primary
    pub fn mark_synced(&self, node_id: &str) -> bool {
        self.tracker.mark_synced(node_id)
    }

    /// Bulk resync of the given replicas (all of them when `nodes` is empty).
    ///
    /// Replicas sync concurrently; the call returns once each has settled.
    /// The primary itself is skipped and unknown nodes report `error`.
    pub async fn run_full(&self, nodes: &[String]) -> Result<BTreeMap<String, SyncStatus>, ReplicationError> {
        let primary = self.health.primary();
        if primary != self.node_id {
            return Err(ReplicationError::NotPrimary {
                node: self.node_id.clone(),
                primary,
            });
        }

        let targets: Vec<String> = if nodes.is_empty() {
            self.replicas()
        } else {
            nodes.to_vec()
        };

        info!("Full replication requested for {:?}", targets);

        let mut results = BTreeMap::new();
        let mut waiting = Vec::new();
        for target in targets {
            if target == self.node_id {
                debug!("Skipping primary {} in full replication", target);
                continue;
            }
            let Some(queue) = self.queues.get(&target) else {
                warn!("Full replication requested for unknown node {}", target);
                results.insert(target, SyncStatus::Error);
                continue;
            };

            self.tracker.resync_started(&target);
            let (tx, rx) = oneshot::channel();
            if queue.send(Job::Resync(tx)).await.is_err() {
                error!("Replication worker for {} has stopped", target);
                let status = self.tracker.resynced(&target, false);
                results.insert(target, status);
                continue;
            }
            waiting.push((target, rx));
        }

        for (target, rx) in waiting {
            let status = rx.await.unwrap_or(SyncStatus::Error);
            results.insert(target, status);
        }
        Ok(results)
    }
}

impl MutationSink for ReplicationCoordinator {
    fn publish(&self, event: MutationEvent) {
        let record = event.replicated();
        for (target, queue) in &self.queues {
            self.tracker.enqueued(target);
            match queue.try_send(Job::Apply(record.clone())) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        "Replication queue for {} is full, dropping {} of record {}",
                        target, event.kind, event.record_id
                    );
                    self.tracker.dropped(target);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    error!("Replication worker for {} has stopped", target);
                    self.tracker.dropped(target);
                }
            }
        }
    }
}

async fn run_worker(
    link: Arc<dyn ReplicaLink>,
    mut rx: mpsc::Receiver<Job>,
    store: RecordStore,
    tracker: Arc<Tracker>,
    delivery: Delivery,
) {
    let target = link.node_id().to_string();
    while let Some(job) = rx.recv().await {
        match job {
            Job::Apply(record) => {
                let outcome = delivery.deliver(link.as_ref(), Payload::One(&record)).await;
                if let Err(e) = &outcome {
                    warn!(
                        "Replication of record {} rev {} to {} failed: {}",
                        record.record_id, record.revision, target, e
                    );
                }
                tracker.applied(&target, outcome.is_ok());
            }
            Job::Resync(reply) => {
                let records = store.export().await;
                let outcome = delivery.deliver(link.as_ref(), Payload::All(&records)).await;
                match &outcome {
                    Ok(changed) => info!(
                        "Full sync to {}: {} record(s), {} changed",
                        target,
                        records.len(),
                        changed
                    ),
                    Err(e) => warn!("Full sync to {} failed: {}", target, e),
                }
                let status = tracker.resynced(&target, outcome.is_ok());
                let _ = reply.send(status);
            }
        }
    }
    debug!("Replication worker for {} stopped", target);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::LocalLink;
    use async_trait::async_trait;
    use std::future::Future;

    const NODES: [&str; 3] = ["node_A", "node_B", "node_C"];

    struct TestCluster {
        health: Arc<NodeHealthController>,
        stores: BTreeMap<String, RecordStore>,
        coordinators: BTreeMap<String, Arc<ReplicationCoordinator>>,
    }

    impl TestCluster {
        fn store(&self, node: &str) -> &RecordStore {
            &self.stores[node]
        }

        fn coordinator(&self, node: &str) -> &Arc<ReplicationCoordinator> {
            &self.coordinators[node]
        }
    }

    fn fast_settings() -> ReplicationSettings {
        ReplicationSettings {
            timeout: Duration::from_millis(500),
            sync_timeout: Duration::from_millis(1000),
            retries: 1,
            backoff: Duration::from_millis(10),
            queue_capacity: 64,
        }
    }

    fn cluster() -> TestCluster {
        let members = NODES
            .iter()
            .map(|id| (id.to_string(), format!("local:{}", id)));
        let health = Arc::new(NodeHealthController::new("node_A", members).unwrap());
        let stores: BTreeMap<String, RecordStore> =
            NODES.iter().map(|id| (id.to_string(), RecordStore::new())).collect();

        let mut coordinators = BTreeMap::new();
        for id in NODES {
            let links: Vec<Arc<dyn ReplicaLink>> = NODES
                .iter()
                .filter(|other| **other != id)
                .map(|other| {
                    Arc::new(LocalLink::new(*other, stores[*other].clone(), health.clone()))
                        as Arc<dyn ReplicaLink>
                })
                .collect();
            let coordinator = ReplicationCoordinator::start(
                id,
                stores[id].clone(),
                health.clone(),
                links,
                fast_settings(),
            );
            stores[id].attach_sink(coordinator.clone());
            coordinators.insert(id.to_string(), coordinator);
        }

        TestCluster {
            health,
            stores,
            coordinators,
        }
    }

    async fn eventually<F, Fut>(mut check: F) -> bool
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

    fn all_synced(coordinator: &ReplicationCoordinator) -> bool {
        coordinator
            .status()
            .values()
            .all(|status| *status == SyncStatus::Synced)
    }

    #[tokio::test]
    async fn test_writes_propagate_to_replicas() {
        let cluster = cluster();
        let primary = cluster.store("node_A");
        let alice = primary.create("Alice", 30).await.unwrap();
        primary.update(alice.id, "Alice", 31).await.unwrap();

        let coordinator = cluster.coordinator("node_A");
        assert!(eventually(|| async { all_synced(coordinator) }).await);

        for node in ["node_B", "node_C"] {
            let replica = cluster.store(node);
            assert_eq!(replica.get(alice.id).await.unwrap().age, 31);
            assert_eq!(replica.history(alice.id).await.unwrap().len(), 2);
        }
    }

    #[tokio::test]
    async fn test_events_apply_in_commit_order() {
        let cluster = cluster();
        let primary = cluster.store("node_A");
        let record = primary.create("Counter", 0).await.unwrap();
        for age in 1..=30 {
            primary.update(record.id, "Counter", age).await.unwrap();
        }
        primary.undo(record.id).await.unwrap();
        primary.delete(record.id).await.unwrap();

        let coordinator = cluster.coordinator("node_A");
        assert!(eventually(|| async { all_synced(coordinator) }).await);

        let expected = primary.export().await;
        assert_eq!(cluster.store("node_B").export().await, expected);
        assert_eq!(cluster.store("node_C").export().await, expected);
    }

    #[tokio::test]
    async fn test_disconnected_replica_reports_error_until_full_sync() {
        let cluster = cluster();
        let primary = cluster.store("node_A");
        let coordinator = cluster.coordinator("node_A");

        cluster.health.disconnect("node_B").await.unwrap();
        let bob = primary.create("Bob", 40).await.unwrap();

        assert!(
            eventually(|| async {
                let status = coordinator.status();
                status["node_B"] == SyncStatus::Error && status["node_C"] == SyncStatus::Synced
            })
            .await
        );
        assert!(cluster.store("node_B").get(bob.id).await.is_err());
        assert!(cluster.store("node_C").get(bob.id).await.is_ok());

        // Reconnecting alone does not clear the error.
        cluster.health.reconnect("node_B").await.unwrap();
        primary.update(bob.id, "Bob", 41).await.unwrap();
        assert!(eventually(|| async { coordinator.status()["node_C"] == SyncStatus::Synced }).await);
        assert_eq!(coordinator.status()["node_B"], SyncStatus::Error);

        let results = coordinator.run_full(&[]).await.unwrap();
        assert_eq!(results["node_B"], SyncStatus::Synced);
        assert_eq!(results["node_C"], SyncStatus::Synced);
        assert_eq!(cluster.store("node_B").export().await, primary.export().await);
        assert!(all_synced(coordinator));
    }

    #[tokio::test]
    async fn test_run_full_with_primary_down() {
        let cluster = cluster();
        cluster.store("node_A").create("Alice", 30).await.unwrap();
        let coordinator = cluster.coordinator("node_A");
        assert!(eventually(|| async { all_synced(coordinator) }).await);

        cluster.health.disconnect_primary().await.unwrap();
        let results = coordinator.run_full(&[]).await.unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.values().all(|status| *status == SyncStatus::Error));
    }

    #[tokio::test]
    async fn test_run_full_target_selection() {
        let cluster = cluster();
        let coordinator = cluster.coordinator("node_A");

        let results = coordinator
            .run_full(&["node_A".to_string(), "node_C".to_string(), "node_Z".to_string()])
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results["node_C"], SyncStatus::Synced);
        assert_eq!(results["node_Z"], SyncStatus::Error);

        let err = cluster.coordinator("node_B").run_full(&[]).await.unwrap_err();
        assert!(matches!(err, ReplicationError::NotPrimary { .. }));
    }

    #[tokio::test]
    async fn test_failover_to_new_primary() {
        let cluster = cluster();
        let alice = cluster.store("node_A").create("Alice", 30).await.unwrap();
        assert!(eventually(|| async { all_synced(cluster.coordinator("node_A")) }).await);

        cluster.health.disconnect_primary().await.unwrap();
        cluster.health.set_primary("node_B").unwrap();

        let new_primary = cluster.store("node_B");
        new_primary.update(alice.id, "Alice", 32).await.unwrap();
        let carol = new_primary.create("Carol", 25).await.unwrap();

        let coordinator = cluster.coordinator("node_B");
        assert!(
            eventually(|| async {
                let status = coordinator.status();
                status["node_A"] == SyncStatus::Error && status["node_C"] == SyncStatus::Synced
            })
            .await
        );
        assert_eq!(cluster.store("node_C").get(carol.id).await.unwrap().name, "Carol");
        assert_eq!(cluster.store("node_A").get(alice.id).await.unwrap().age, 30);

        cluster.health.reconnect("node_A").await.unwrap();
        let results = coordinator.run_full(&[]).await.unwrap();
        assert_eq!(results["node_A"], SyncStatus::Synced);
        assert_eq!(cluster.store("node_A").export().await, new_primary.export().await);
    }

    #[tokio::test]
    async fn test_full_sync_after_failover_drops_records_new_primary_lacks() {
        let cluster = cluster();
        cluster.health.disconnect("node_B").await.unwrap();
        cluster.store("node_A").create("Alice", 30).await.unwrap();
        assert!(
            eventually(|| async {
                let status = cluster.coordinator("node_A").status();
                status["node_B"] == SyncStatus::Error && status["node_C"] == SyncStatus::Synced
            })
            .await
        );

        cluster.health.reconnect("node_B").await.unwrap();
        cluster.health.set_primary("node_B").unwrap();

        let coordinator = cluster.coordinator("node_B");
        let results = coordinator.run_full(&[]).await.unwrap();
        assert_eq!(results["node_A"], SyncStatus::Synced);
        assert_eq!(results["node_C"], SyncStatus::Synced);

        let expected = cluster.store("node_B").list().await;
        assert!(expected.is_empty());
        assert_eq!(cluster.store("node_A").list().await, expected);
        assert_eq!(cluster.store("node_C").list().await, expected);
    }

    #[tokio::test]
    async fn test_replica_ahead_of_new_primary_reports_error() {
        let cluster = cluster();
        let old_primary = cluster.store("node_A");
        let alice = old_primary.create("Alice", 30).await.unwrap();
        assert!(eventually(|| async { all_synced(cluster.coordinator("node_A")) }).await);

        cluster.health.disconnect("node_B").await.unwrap();
        old_primary.update(alice.id, "Alice", 31).await.unwrap();
        old_primary.update(alice.id, "Alice", 32).await.unwrap();
        assert!(
            eventually(|| async { cluster.coordinator("node_A").status()["node_C"] == SyncStatus::Synced }).await
        );

        cluster.health.reconnect("node_B").await.unwrap();
        cluster.health.set_primary("node_B").unwrap();
        let new_primary = cluster.store("node_B");
        new_primary.update(alice.id, "Alice", 50).await.unwrap();

        // node_A and node_C hold revision 3; the new primary's update is revision 2.
        let coordinator = cluster.coordinator("node_B");
        assert!(
            eventually(|| async {
                let status = coordinator.status();
                status["node_A"] == SyncStatus::Error && status["node_C"] == SyncStatus::Error
            })
            .await
        );
        assert_eq!(old_primary.get(alice.id).await.unwrap().age, 32);

        let results = coordinator.run_full(&[]).await.unwrap();
        assert!(results.values().all(|status| *status == SyncStatus::Synced));
        for node in ["node_A", "node_C"] {
            assert_eq!(cluster.store(node).list().await, new_primary.list().await);
        }
        assert!(all_synced(coordinator));
    }

    /// Link that blocks every apply until released
    struct GatedLink {
        node_id: String,
        store: RecordStore,
        gate: Arc<tokio::sync::Semaphore>,
    }

    #[async_trait]
    impl ReplicaLink for GatedLink {
        fn node_id(&self) -> &str {
            &self.node_id
        }

        async fn apply(&self, record: &ReplicatedRecord) -> Result<(), ReplicationError> {
            let _permit = self.gate.acquire().await.map_err(|e| ReplicationError::Protocol(e.to_string()))?;
            self.store.apply_replicated(record).await.map(|_| ()).map_err(|e| {
                ReplicationError::Rejected {
                    node: self.node_id.clone(),
                    reason: e.to_string(),
                }
            })
        }

        async fn resync(&self, records: &[ReplicatedRecord]) -> Result<usize, ReplicationError> {
            self.store
                .replace_all(records)
                .await
                .map_err(|e| ReplicationError::Protocol(e.to_string()))
        }
    }

    #[tokio::test]
    async fn test_full_queue_drops_and_full_sync_repairs() {
        let members = ["node_A", "node_B"]
            .iter()
            .map(|id| (id.to_string(), format!("local:{}", id)));
        let health = Arc::new(NodeHealthController::new("node_A", members).unwrap());
        let primary = RecordStore::new();
        let replica = RecordStore::new();
        let gate = Arc::new(tokio::sync::Semaphore::new(0));

        let link: Arc<dyn ReplicaLink> = Arc::new(GatedLink {
            node_id: "node_B".to_string(),
            store: replica.clone(),
            gate: gate.clone(),
        });
        let settings = ReplicationSettings {
            queue_capacity: 1,
            timeout: Duration::from_secs(5),
            ..fast_settings()
        };
        let coordinator =
            ReplicationCoordinator::start("node_A", primary.clone(), health, vec![link], settings);
        primary.attach_sink(coordinator.clone());

        let record = primary.create("Dave", 20).await.unwrap();
        for age in 21..=25 {
            primary.update(record.id, "Dave", age).await.unwrap();
        }
        assert_eq!(coordinator.status()["node_B"], SyncStatus::Error);

        gate.add_permits(1000);
        let results = coordinator.run_full(&[]).await.unwrap();
        assert_eq!(results["node_B"], SyncStatus::Synced);
        assert_eq!(replica.get(record.id).await.unwrap().age, 25);
        assert_eq!(coordinator.status()["node_B"], SyncStatus::Synced);
    }

    #[tokio::test]
    async fn test_disconnect_does_not_wait_for_delivery() {
        let members = ["node_A", "node_B"]
            .iter()
            .map(|id| (id.to_string(), format!("local:{}", id)));
        let health = Arc::new(NodeHealthController::new("node_A", members).unwrap());
        let primary = RecordStore::new();
        let replica = RecordStore::new();
        let gate = Arc::new(tokio::sync::Semaphore::new(0));

        let link: Arc<dyn ReplicaLink> = Arc::new(GatedLink {
            node_id: "node_B".to_string(),
            store: replica.clone(),
            gate: gate.clone(),
        });
        let settings = ReplicationSettings {
            timeout: Duration::from_secs(3),
            retries: 0,
            ..fast_settings()
        };
        let coordinator =
            ReplicationCoordinator::start("node_A", primary.clone(), health.clone(), vec![link], settings);
        primary.attach_sink(coordinator.clone());

        primary.create("Erin", 28).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let disconnected = tokio::time::timeout(Duration::from_millis(500), health.disconnect_primary()).await;
        assert_eq!(disconnected.unwrap().unwrap(), "node_A");
        assert!(!health.is_alive("node_A").await.unwrap());

        // The delivery lands after the disconnect, so it does not count as synced.
        gate.add_permits(1);
        assert!(eventually(|| async { coordinator.status()["node_B"] == SyncStatus::Error }).await);
    }

    #[tokio::test]
    async fn test_mark_synced() {
        let cluster = cluster();
        let coordinator = cluster.coordinator("node_B");
        assert!(coordinator.mark_synced("node_B"));
        assert!(!coordinator.mark_synced("node_Z"));
    }
}
