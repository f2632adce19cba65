use cluster::{ConfigError, HealthError, ReplicationError};
use storage::StoreError;
use thiserror::Error;

/// Error type for server startup and configuration
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Invalid port: {0}")]
    InvalidPort(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cluster config error: {0}")]
    Config(#[from] ConfigError),
}

/// Failure of one node operation, as reported to clients
#[derive(Error, Debug)]
pub enum NodeError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("primary {0} is unavailable")]
    PrimaryUnavailable(String),

    #[error("{node} is not the primary (primary is {primary})")]
    NotPrimary { node: String, primary: String },

    #[error(transparent)]
    Health(#[from] HealthError),

    #[error(transparent)]
    Replication(#[from] ReplicationError),
}

impl NodeError {
    /// Storage failures leave the node in an unknown state
    pub fn is_fatal(&self) -> bool {
        matches!(self, NodeError::Store(e) if e.is_fatal())
    }

    /// Stable machine-readable kind for response bodies
    pub fn kind(&self) -> &'static str {
        match self {
            NodeError::Store(StoreError::InvalidInput(_)) => "invalid_input",
            NodeError::Store(StoreError::NotFound(_)) => "not_found",
            NodeError::Store(StoreError::NoHistory(_)) => "no_history",
            NodeError::Store(StoreError::NoFuture(_)) => "no_future",
            NodeError::Store(StoreError::Diverged { .. }) => "diverged",
            NodeError::Store(StoreError::Storage(_)) => "storage",
            NodeError::PrimaryUnavailable(_) => "primary_unavailable",
            NodeError::NotPrimary { .. } | NodeError::Replication(ReplicationError::NotPrimary { .. }) => {
                "not_primary"
            }
            NodeError::Health(HealthError::UnknownNode(_)) => "unknown_node",
            NodeError::Health(HealthError::NodeDown(_)) => "node_down",
            NodeError::Replication(_) => "replication",
        }
    }
}
