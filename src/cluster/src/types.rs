use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Operation codes for cluster protocol
pub const CLUSTER_OP_REPLICATE: u8 = 3;
pub const CLUSTER_OP_REPLICATE_ACK: u8 = 4;
pub const CLUSTER_OP_SYNC_DATA: u8 = 8;
pub const CLUSTER_OP_SYNC_COMPLETE: u8 = 9;
pub const CLUSTER_OP_NACK: u8 = 13;

/// Node role, derived from the declared primary pointer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Primary,
    Replica,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Primary => write!(f, "Primary"),
            Role::Replica => write!(f, "Replica"),
        }
    }
}

/// Replication state of one node as seen by the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Synced,
    Pending,
    Error,
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncStatus::Synced => write!(f, "synced"),
            SyncStatus::Pending => write!(f, "pending"),
            SyncStatus::Error => write!(f, "error"),
        }
    }
}

/// Point-in-time view of a cluster member
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeInfo {
    pub node_id: String,
    pub role: Role,
    pub address: String,
    pub alive: bool,
}

/// Peer address as configured: `node_id:host:cluster_port`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSpec {
    pub id: String,
    pub host: String,
    pub cluster_port: u16,
}

impl PeerSpec {
    pub fn new(id: impl Into<String>, host: impl Into<String>, cluster_port: u16) -> Self {
        PeerSpec {
            id: id.into(),
            host: host.into(),
            cluster_port,
        }
    }

    pub fn parse(spec: &str) -> Result<Self, ConfigError> {
        let parts: Vec<&str> = spec.trim().split(':').collect();
        if parts.len() != 3 || parts[0].is_empty() || parts[1].is_empty() {
            return Err(ConfigError::InvalidPeer(spec.to_string()));
        }
        let cluster_port = parts[2]
            .parse()
            .map_err(|_| ConfigError::InvalidPeer(spec.to_string()))?;
        Ok(PeerSpec::new(parts[0], parts[1], cluster_port))
    }

    pub fn cluster_addr(&self) -> String {
        format!("{}:{}", self.host, self.cluster_port)
    }
}
