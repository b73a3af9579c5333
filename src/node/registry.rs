use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use crate::config::{NodeConfig, ms};
use crate::error::StoreError;
use crate::keys::KeySpace;
use crate::lock::DistributedLock;
use crate::node::NodeIdentity;
use crate::store::CoordinationStore;

/// Liveness and leader election for one node.
///
/// Every heartbeat refreshes this node's liveness marker and then contends
/// for the leader slot. The slot is just a lock whose owner is the node id,
/// so a leader that stops heartbeating loses it when the lease runs out.
pub struct NodeRegistry {
    store: Arc<dyn CoordinationStore>,
    lock: DistributedLock,
    keys: KeySpace,
    identity: NodeIdentity,
    heartbeat_interval: Duration,
    liveness_ttl: Duration,
    lease_ttl: Duration,
    leader: AtomicBool,
}

impl NodeRegistry {
    pub fn new(store: Arc<dyn CoordinationStore>, keys: KeySpace, identity: NodeIdentity, config: &NodeConfig) -> Self {
        Self {
            lock: DistributedLock::new(store.clone()),
            store,
            keys,
            identity,
            heartbeat_interval: ms(config.heartbeat_interval_ms),
            liveness_ttl: ms(config.liveness_ttl_ms),
            lease_ttl: ms(config.leader_lease_ttl_ms),
            leader: AtomicBool::new(false),
        }
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn is_leader(&self) -> bool {
        self.leader.load(Ordering::Acquire)
    }

    /// One heartbeat. A store failure leaves the leader flag as it was.
    pub async fn heartbeat_once(&self) {
        match self.beat().await {
            Ok(leading) => {
                let was = self.leader.swap(leading, Ordering::AcqRel);
                if leading && !was {
                    info!(node = %self.identity, "Became leader");
                } else if !leading && was {
                    info!(node = %self.identity, "Lost leadership");
                }
            }
            Err(e) => warn!(node = %self.identity, error = %e, "Heartbeat failed"),
        }
    }

    async fn beat(&self) -> Result<bool, StoreError> {
        let id = self.identity.as_str();
        self.store
            .set(&self.keys.node_liveness(id), "1", Some(self.liveness_ttl))
            .await?;
        self.store.set_add(&self.keys.alive_nodes(), id).await?;

        let leader_key = self.keys.leader();
        if self.lock.try_acquire(&leader_key, id, self.lease_ttl).await? {
            return Ok(true);
        }
        match self.store.get(&leader_key).await? {
            Some(current) if current == id => {
                self.store.expire_if_equals(&leader_key, id, self.lease_ttl).await
            }
            current => {
                debug!(node = %id, leader = ?current, "Following");
                Ok(false)
            }
        }
    }

    pub async fn alive_nodes(&self) -> Result<Vec<String>, StoreError> {
        self.store.set_members(&self.keys.alive_nodes()).await
    }

    /// Gives up the leader slot (if held) and leaves the alive set.
    pub async fn stop(&self) {
        let id = self.identity.as_str();
        if self.leader.swap(false, Ordering::AcqRel) {
            self.lock.release(&self.keys.leader(), id).await;
            info!(node = %id, "Released leadership");
        }
        if let Err(e) = self.store.set_remove(&self.keys.alive_nodes(), id).await {
            warn!(node = %id, error = %e, "Failed to leave alive set");
        }
        if let Err(e) = self.store.delete(&[self.keys.node_liveness(id)]).await {
            warn!(node = %id, error = %e, "Failed to clear liveness marker");
        }
    }

    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(node = %self.identity, "Heartbeat started");
            let mut ticker = tokio::time::interval(self.heartbeat_interval);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {}
                }
                if *shutdown.borrow() {
                    break;
                }
                self.heartbeat_once().await;
            }
            self.stop().await;
        })
    }
}
