pub mod config;
pub mod error;
pub mod types;
pub mod health;
pub mod protocol;
pub mod link;
pub mod coordinator;
pub mod listener;

// Re-exports for convenience
pub use config::{ClusterConfig, DEFAULT_TOPOLOGY};
pub use error::{ConfigError, HealthError, ReplicationError};
pub use types::*;
pub use health::{LivenessGuard, NodeHealthController};
pub use link::{LocalLink, ReplicaLink, TcpLink};
pub use coordinator::{ReplicationCoordinator, ReplicationSettings};
pub use listener::ClusterListener;
