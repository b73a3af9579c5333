use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use crate::error::Result;
use crate::keys::KeySpace;
use crate::node::NodeRegistry;
use crate::queue::TaskQueue;
use crate::store::CoordinationStore;

/// Leader-side detection of nodes that stopped heartbeating.
///
/// A node whose liveness marker has expired is dropped from the alive set and
/// whatever it still held in its processing list goes back onto the queue.
pub struct NodeMonitor {
    store: Arc<dyn CoordinationStore>,
    keys: KeySpace,
    registry: Arc<NodeRegistry>,
    queue: Arc<TaskQueue>,
    interval: Duration,
}

impl NodeMonitor {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        keys: KeySpace,
        registry: Arc<NodeRegistry>,
        queue: Arc<TaskQueue>,
        interval: Duration,
    ) -> Self {
        Self { store, keys, registry, queue, interval }
    }

    /// Returns the ids of the nodes found dead on this pass.
    pub async fn check_nodes(&self) -> Result<Vec<String>> {
        let me = self.registry.identity().as_str();
        let mut dead = Vec::new();
        for node in self.registry.alive_nodes().await? {
            if node == me || self.store.exists(&self.keys.node_liveness(&node)).await? {
                continue;
            }
            warn!(node = %node, "Node went offline");
            self.store.set_remove(&self.keys.alive_nodes(), &node).await?;
            let reclaimed = self.queue.reclaim_from_node(&node).await?;
            info!(node = %node, reclaimed, "Removed offline node");
            dead.push(node);
        }
        Ok(dead)
    }

    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {}
                }
                if *shutdown.borrow() {
                    break;
                }
                if !self.registry.is_leader() {
                    continue;
                }
                if let Err(e) = self.check_nodes().await {
                    warn!(error = %e, "Node check failed");
                }
            }
            debug!("Node monitor stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NodeConfig, QueueConfig};
    use crate::node::NodeIdentity;
    use crate::queue::Task;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn dead_node_is_removed_and_its_work_reclaimed() {
        let store = Arc::new(MemoryStore::new());
        let keys = KeySpace::new("test", "q");
        let config = NodeConfig {
            liveness_ttl_ms: 40,
            ..NodeConfig::default()
        };
        let leader = Arc::new(NodeRegistry::new(store.clone(), keys.clone(), NodeIdentity::new("a"), &NodeConfig::default()));
        let doomed = NodeRegistry::new(store.clone(), keys.clone(), NodeIdentity::new("b"), &config);
        let queue = Arc::new(TaskQueue::new(store.clone(), keys.clone(), QueueConfig::default()));

        leader.heartbeat_once().await;
        doomed.heartbeat_once().await;
        queue.enqueue(&Task::new("A", "X", "t")).await.unwrap();
        queue.poll_reliable("b").await.unwrap().unwrap();
        assert_eq!(queue.queue_len().await.unwrap(), 0);

        tokio::time::sleep(Duration::from_millis(80)).await;
        let monitor = NodeMonitor::new(store.clone(), keys, leader.clone(), queue.clone(), Duration::from_secs(1));
        assert_eq!(monitor.check_nodes().await.unwrap(), vec!["b".to_string()]);
        assert_eq!(leader.alive_nodes().await.unwrap(), vec!["a".to_string()]);
        assert_eq!(queue.queue_len().await.unwrap(), 1);

        assert!(monitor.check_nodes().await.unwrap().is_empty());
    }
}
