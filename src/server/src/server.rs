use std::env;
use std::sync::Arc;

use cluster::{
    ClusterConfig, ClusterListener, NodeHealthController, ReplicaLink, ReplicationCoordinator,
    ReplicationSettings, TcpLink, DEFAULT_TOPOLOGY,
};
use log::{info, warn};
use storage::{RecordStore, StorageConfig};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use crate::error::ServerError;
use crate::http::{Api, HttpServer};
use crate::metrics::Metrics;
use crate::node::Node;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_HTTP_PORT: u16 = 5000;

pub struct Server {
    cluster: ClusterConfig,
    storage: StorageConfig,
    host: String,
    http_port: u16,
}

impl Server {
    pub fn new() -> Result<Self, ServerError> {
        let cluster = ClusterConfig::from_env()?;

        let host = env::var("REWIND_HOST").unwrap_or_else(|_| DEFAULT_HOST.to_string());
        let http_port = match env::var("REWIND_HTTP_PORT") {
            Ok(port_str) => port_str
                .parse::<u16>()
                .map_err(|e| ServerError::InvalidPort(format!("{}: {}", port_str, e)))?,
            Err(_) => DEFAULT_TOPOLOGY
                .iter()
                .find(|(id, _, _)| *id == cluster.node_id)
                .map(|(_, http, _)| *http)
                .unwrap_or(DEFAULT_HTTP_PORT),
        };

        let storage = StorageConfig::from_env(&cluster.node_id);
        match &storage.wal_path {
            Some(path) => info!("Persistence enabled, WAL path: {}", path),
            None => info!("Running in memory-only mode (no persistence)"),
        }

        Ok(Server {
            cluster,
            storage,
            host,
            http_port,
        })
    }

    pub fn with_config(cluster: ClusterConfig, storage: StorageConfig, host: impl Into<String>, http_port: u16) -> Self {
        Server {
            cluster,
            storage,
            host: host.into(),
            http_port,
        }
    }

    pub async fn run(&self) -> Result<(), ServerError> {
        let cluster_addr = format!("{}:{}", self.host, self.cluster.cluster_port);
        let cluster_listener = TcpListener::bind(&cluster_addr).await?;
        let http_addr = format!("{}:{}", self.host, self.http_port);
        let http_listener = TcpListener::bind(&http_addr).await?;

        // Shutdown broadcast channel
        let (shutdown_tx, _) = broadcast::channel::<()>(1);

        // Spawn signal handler
        let shutdown_tx_clone = shutdown_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                info!("Failed to listen for shutdown signal: {}", e);
                return;
            }
            info!("Received shutdown signal, stopping server...");
            let _ = shutdown_tx_clone.send(());
        });

        self.serve(http_listener, cluster_listener, shutdown_tx).await
    }

    /// Runs the node on already bound listeners until `shutdown` fires
    pub async fn serve(
        &self,
        http_listener: TcpListener,
        cluster_listener: TcpListener,
        shutdown: broadcast::Sender<()>,
    ) -> Result<(), ServerError> {
        let node_id = self.cluster.node_id.clone();
        let store = RecordStore::open(self.storage.clone())?;
        let health = Arc::new(NodeHealthController::from_config(&self.cluster)?);

        let links: Vec<Arc<dyn ReplicaLink>> = self
            .cluster
            .peers
            .iter()
            .map(|peer| Arc::new(TcpLink::new(peer.id.clone(), peer.cluster_addr())) as Arc<dyn ReplicaLink>)
            .collect();
        let coordinator = ReplicationCoordinator::start(
            node_id.clone(),
            store.clone(),
            health.clone(),
            links,
            ReplicationSettings::from(&self.cluster),
        );
        if !store.attach_sink(coordinator.clone()) {
            warn!("Record store already had a mutation sink attached");
        }

        let node = Node::new(node_id.clone(), store.clone(), health.clone(), coordinator.clone());

        let listener = ClusterListener::new(node_id.clone(), store, health.clone(), coordinator);
        tokio::spawn(listener.serve(cluster_listener, shutdown.subscribe()));

        info!(
            "REWIND node {} is running on {} (HTTP) / {} (cluster), role {}, primary {}",
            node_id,
            http_listener.local_addr()?,
            self.cluster.cluster_addr(),
            node.role(),
            health.primary()
        );

        let api = Api::new(node, Arc::new(Metrics::new()), shutdown.clone());
        HttpServer::new(api).serve(http_listener, shutdown.subscribe()).await;

        info!("REWIND node {} stopped", node_id);
        Ok(())
    }
}
