use std::fmt::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use cluster::SyncStatus;

use crate::node::Node;

/// Server metrics
#[derive(Clone)]
pub struct Metrics {
    pub total_requests: Arc<AtomicUsize>,
    pub total_reads: Arc<AtomicUsize>,
    pub total_creates: Arc<AtomicUsize>,
    pub total_updates: Arc<AtomicUsize>,
    pub total_deletes: Arc<AtomicUsize>,
    pub total_restores: Arc<AtomicUsize>,
    pub total_undos: Arc<AtomicUsize>,
    pub total_redos: Arc<AtomicUsize>,
    pub total_rejected_writes: Arc<AtomicUsize>,
    pub total_full_syncs: Arc<AtomicUsize>,
    pub start_time: std::time::Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Metrics {
            total_requests: Arc::new(AtomicUsize::new(0)),
            total_reads: Arc::new(AtomicUsize::new(0)),
            total_creates: Arc::new(AtomicUsize::new(0)),
            total_updates: Arc::new(AtomicUsize::new(0)),
            total_deletes: Arc::new(AtomicUsize::new(0)),
            total_restores: Arc::new(AtomicUsize::new(0)),
            total_undos: Arc::new(AtomicUsize::new(0)),
            total_redos: Arc::new(AtomicUsize::new(0)),
            total_rejected_writes: Arc::new(AtomicUsize::new(0)),
            total_full_syncs: Arc::new(AtomicUsize::new(0)),
            start_time: std::time::Instant::now(),
        }
    }

    pub fn incr(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Generate Prometheus-format metrics
    pub async fn to_prometheus(&self, node: &Node) -> String {
        let uptime_secs = self.start_time.elapsed().as_secs();
        let records = node.store().len().await;
        let status = node.replication_status();

        let mut output = String::new();

        output.push_str("# HELP rewind_http_requests_total Total number of HTTP requests\n");
        output.push_str("# TYPE rewind_http_requests_total counter\n");
        let _ = writeln!(output, "rewind_http_requests_total {}", self.total_requests.load(Ordering::Relaxed));

        output.push_str("# HELP rewind_operations_total Total number of record operations by type\n");
        output.push_str("# TYPE rewind_operations_total counter\n");
        for (op, counter) in [
            ("read", &self.total_reads),
            ("create", &self.total_creates),
            ("update", &self.total_updates),
            ("delete", &self.total_deletes),
            ("restore", &self.total_restores),
            ("undo", &self.total_undos),
            ("redo", &self.total_redos),
        ] {
            let _ = writeln!(
                output,
                "rewind_operations_total{{type=\"{}\"}} {}",
                op,
                counter.load(Ordering::Relaxed)
            );
        }

        output.push_str("# HELP rewind_rejected_writes_total Writes refused because this node is not an available primary\n");
        output.push_str("# TYPE rewind_rejected_writes_total counter\n");
        let _ = writeln!(output, "rewind_rejected_writes_total {}", self.total_rejected_writes.load(Ordering::Relaxed));

        output.push_str("# HELP rewind_full_syncs_total Full replication runs requested on this node\n");
        output.push_str("# TYPE rewind_full_syncs_total counter\n");
        let _ = writeln!(output, "rewind_full_syncs_total {}", self.total_full_syncs.load(Ordering::Relaxed));

        output.push_str("# HELP rewind_records_total Current number of records, deleted included\n");
        output.push_str("# TYPE rewind_records_total gauge\n");
        let _ = writeln!(output, "rewind_records_total {}", records);

        output.push_str("# HELP rewind_is_primary Whether this node is the declared primary\n");
        output.push_str("# TYPE rewind_is_primary gauge\n");
        let _ = writeln!(output, "rewind_is_primary {}", (node.role() == cluster::Role::Primary) as u8);

        output.push_str("# HELP rewind_replication_status Replication status per node (1 for the current state)\n");
        output.push_str("# TYPE rewind_replication_status gauge\n");
        for (peer, current) in &status {
            for state in [SyncStatus::Synced, SyncStatus::Pending, SyncStatus::Error] {
                let _ = writeln!(
                    output,
                    "rewind_replication_status{{node=\"{}\",status=\"{}\"}} {}",
                    peer,
                    state,
                    (*current == state) as u8
                );
            }
        }

        output.push_str("# HELP rewind_uptime_seconds Server uptime in seconds\n");
        output.push_str("# TYPE rewind_uptime_seconds counter\n");
        let _ = writeln!(output, "rewind_uptime_seconds {}", uptime_secs);

        output
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::tests::local_cluster;
    use storage::RecordInput;

    #[tokio::test]
    async fn test_prometheus_output() {
        let nodes = local_cluster(&["node_A", "node_B"], "node_A");
        nodes[0].create(&RecordInput::new("Alice", 30)).await.unwrap();

        let metrics = Metrics::new();
        Metrics::incr(&metrics.total_creates);

        let output = metrics.to_prometheus(&nodes[0]).await;
        assert!(output.contains("rewind_operations_total{type=\"create\"} 1"));
        assert!(output.contains("rewind_records_total 1"));
        assert!(output.contains("rewind_is_primary 1"));
        assert!(output.contains("rewind_replication_status{node=\"node_B\",status="));
    }
}
