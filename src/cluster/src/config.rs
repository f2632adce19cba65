use std::time::Duration;

use crate::error::ConfigError;
use crate::types::PeerSpec;

/// Built-in three node topology used when `REWIND_PEERS` is unset.
pub const DEFAULT_TOPOLOGY: [(&str, u16, u16); 3] = [
    ("node_A", 5000, 5100),
    ("node_B", 5001, 5101),
    ("node_C", 5002, 5102),
];

pub const DEFAULT_PRIMARY: &str = "node_A";

/// Cluster configuration
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub node_id: String,
    pub cluster_host: String,
    pub cluster_port: u16,
    pub peers: Vec<PeerSpec>,
    pub primary: String,
    pub replication_timeout: Duration,
    pub sync_timeout: Duration,
    pub replication_retries: u32,
    pub retry_backoff: Duration,
    /// Per-replica bound on queued propagations (default: 1024)
    pub queue_capacity: usize,
}

impl ClusterConfig {
    pub fn new(node_id: impl Into<String>, cluster_port: u16, peers: Vec<PeerSpec>) -> Self {
        ClusterConfig {
            node_id: node_id.into(),
            cluster_host: "127.0.0.1".to_string(),
            cluster_port,
            peers,
            primary: DEFAULT_PRIMARY.to_string(),
            replication_timeout: Duration::from_millis(3000),
            sync_timeout: Duration::from_millis(10_000),
            replication_retries: 3,
            retry_backoff: Duration::from_millis(100),
            queue_capacity: 1024,
        }
    }

    pub fn with_primary(mut self, primary: impl Into<String>) -> Self {
        self.primary = primary.into();
        self
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let node_id = std::env::var("REWIND_NODE_ID").unwrap_or_else(|_| DEFAULT_PRIMARY.to_string());

        let default_port = DEFAULT_TOPOLOGY
            .iter()
            .find(|(id, _, _)| *id == node_id)
            .map(|(_, _, cluster)| *cluster)
            .unwrap_or(5100);
        let cluster_port = match std::env::var("REWIND_CLUSTER_PORT") {
            Ok(value) => value.parse().map_err(|e: std::num::ParseIntError| ConfigError::InvalidPort {
                var: "REWIND_CLUSTER_PORT".to_string(),
                value: value.clone(),
                reason: e.to_string(),
            })?,
            Err(_) => default_port,
        };

        let peers_str = std::env::var("REWIND_PEERS").unwrap_or_default();
        let peers = if peers_str.trim().is_empty() {
            DEFAULT_TOPOLOGY
                .iter()
                .filter(|(id, _, _)| *id != node_id)
                .map(|(id, _, cluster)| PeerSpec::new(*id, "127.0.0.1", *cluster))
                .collect()
        } else {
            peers_str
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(PeerSpec::parse)
                .collect::<Result<Vec<_>, _>>()?
        };

        let mut config = ClusterConfig::new(node_id, cluster_port, peers);

        if let Ok(host) = std::env::var("REWIND_CLUSTER_HOST") {
            config.cluster_host = host;
        }
        if let Ok(primary) = std::env::var("REWIND_PRIMARY") {
            config.primary = primary;
        }

        config.replication_timeout = env_millis("REWIND_REPLICATION_TIMEOUT_MS")
            .unwrap_or(config.replication_timeout);
        config.sync_timeout = env_millis("REWIND_SYNC_TIMEOUT_MS").unwrap_or(config.sync_timeout);
        config.retry_backoff = env_millis("REWIND_RETRY_BACKOFF_MS").unwrap_or(config.retry_backoff);

        config.replication_retries = std::env::var("REWIND_REPLICATION_RETRIES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(config.replication_retries);

        config.queue_capacity = std::env::var("REWIND_QUEUE_CAPACITY")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|capacity: &usize| *capacity > 0)
            .unwrap_or(config.queue_capacity);

        config.validate()?;
        Ok(config)
    }

    /// Every node id in the cluster, self included
    pub fn members(&self) -> Vec<(String, String)> {
        let mut members = vec![(self.node_id.clone(), self.cluster_addr())];
        members.extend(self.peers.iter().map(|p| (p.id.clone(), p.cluster_addr())));
        members
    }

    pub fn cluster_addr(&self) -> String {
        format!("{}:{}", self.cluster_host, self.cluster_port)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for (id, _) in self.members() {
            if !seen.insert(id.clone()) {
                return Err(ConfigError::DuplicateNode(id));
            }
        }
        if !seen.contains(&self.primary) {
            return Err(ConfigError::UnknownPrimary(self.primary.clone()));
        }
        Ok(())
    }
}

fn env_millis(var: &str) -> Option<Duration> {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_millis)
}
