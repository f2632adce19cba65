use std::time::Duration;
use thiserror::Error;

/// Errors from the node health controller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HealthError {
    #[error("unknown node {0}")]
    UnknownNode(String),

    #[error("node {0} is down")]
    NodeDown(String),
}

/// A propagation to one replica failed.
///
/// Recorded in the replication status; never returned to the client that
/// issued the write.
#[derive(Error, Debug, Clone)]
pub enum ReplicationError {
    #[error("node {0} is down")]
    NodeDown(String),

    #[error("primary {0} is unavailable")]
    PrimaryUnavailable(String),

    #[error("unknown node {0}")]
    UnknownNode(String),

    #[error("node {node} is not the primary (primary is {primary})")]
    NotPrimary { node: String, primary: String },

    #[error("replication to {node} timed out after {timeout:?}")]
    Timeout { node: String, timeout: Duration },

    #[error("replica {node} unreachable: {reason}")]
    Unreachable { node: String, reason: String },

    #[error("replica {node} rejected replication: {reason}")]
    Rejected { node: String, reason: String },

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<HealthError> for ReplicationError {
    fn from(err: HealthError) -> Self {
        match err {
            HealthError::NodeDown(node) => ReplicationError::NodeDown(node),
            HealthError::UnknownNode(node) => ReplicationError::UnknownNode(node),
        }
    }
}

/// Invalid cluster configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid port {value:?} in {var}: {reason}")]
    InvalidPort { var: String, value: String, reason: String },

    #[error("invalid peer spec {0:?} (expected node_id:host:port)")]
    InvalidPeer(String),

    #[error("primary {0} is not a cluster member")]
    UnknownPrimary(String),

    #[error("duplicate node id {0}")]
    DuplicateNode(String),
}
