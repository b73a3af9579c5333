use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use crate::config::{BootstrapConfig, ms};
use crate::keys::KeySpace;
use crate::lock::DistributedLock;
use crate::node::NodeIdentity;

const MIN_LOCK_TTL: Duration = Duration::from_secs(5);

/// Startup work that brings the queue in line with the system of record,
/// e.g. enqueueing every enabled job.
#[async_trait]
pub trait Reconciler: Send + Sync {
    async fn reconcile(&self) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapOutcome {
    Disabled,
    /// Another node holds the bootstrap lock.
    Skipped,
    Completed { attempt: u32 },
    GaveUp { attempts: u32 },
}

pub struct Bootstrapper {
    lock: DistributedLock,
    keys: KeySpace,
    node: NodeIdentity,
    config: BootstrapConfig,
}

impl Bootstrapper {
    pub fn new(lock: DistributedLock, keys: KeySpace, node: NodeIdentity, config: BootstrapConfig) -> Self {
        Self { lock, keys, node, config }
    }

    /// Runs reconciliation once. Never fails: the node starts either way and
    /// anything missed is picked up by recovery later.
    pub async fn run(&self, reconciler: Arc<dyn Reconciler>) -> BootstrapOutcome {
        if !self.config.enabled {
            info!(node = %self.node, "Bootstrap disabled");
            return BootstrapOutcome::Disabled;
        }

        if self.config.use_lock && !self.acquire_lock().await {
            info!(node = %self.node, lock = %self.config.lock_key, "Bootstrap handled by another node");
            return BootstrapOutcome::Skipped;
        }

        let attempts = self.config.retry_times.max(1);
        let interval = ms(self.config.retry_interval_ms);
        for attempt in 1..=attempts {
            info!(node = %self.node, attempt, attempts, "Bootstrap attempt");
            match reconciler.reconcile().await {
                Ok(()) => {
                    info!(node = %self.node, attempt, "Bootstrap completed");
                    return BootstrapOutcome::Completed { attempt };
                }
                Err(e) if attempt < attempts => {
                    warn!(node = %self.node, attempt, attempts, error = %e, "Bootstrap failed, retrying");
                    tokio::time::sleep(interval).await;
                }
                Err(e) => {
                    error!(node = %self.node, attempt, attempts, error = ?e, "Bootstrap gave up");
                }
            }
        }
        BootstrapOutcome::GaveUp { attempts }
    }

    // An unreachable store must not block startup, so that case counts as held.
    async fn acquire_lock(&self) -> bool {
        let key = self.keys.bootstrap_lock(&self.config.lock_key);
        let ttl = ms(self.config.lock_ttl_ms).max(MIN_LOCK_TTL);
        match self.lock.try_acquire(&key, self.node.as_str(), ttl).await {
            Ok(acquired) => acquired,
            Err(e) => {
                warn!(node = %self.node, error = %e, "Bootstrap lock unavailable, proceeding without it");
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FailsFirst {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Reconciler for FailsFirst {
        async fn reconcile(&self) -> anyhow::Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                anyhow::bail!("database not ready");
            }
            Ok(())
        }
    }

    fn bootstrapper(store: &Arc<MemoryStore>, node: &str, config: BootstrapConfig) -> Bootstrapper {
        Bootstrapper::new(
            DistributedLock::new(store.clone()),
            KeySpace::new("test", "q"),
            NodeIdentity::new(node),
            config,
        )
    }

    fn fast() -> BootstrapConfig {
        BootstrapConfig {
            retry_times: 3,
            retry_interval_ms: 5,
            ..BootstrapConfig::default()
        }
    }

    #[tokio::test]
    async fn retries_until_reconcile_succeeds() {
        let store = Arc::new(MemoryStore::new());
        let reconciler = Arc::new(FailsFirst { failures: 2, calls: AtomicU32::new(0) });
        let outcome = bootstrapper(&store, "a", fast()).run(reconciler).await;
        assert_eq!(outcome, BootstrapOutcome::Completed { attempt: 3 });
    }

    #[tokio::test]
    async fn gives_up_after_bounded_attempts() {
        let store = Arc::new(MemoryStore::new());
        let reconciler = Arc::new(FailsFirst { failures: 10, calls: AtomicU32::new(0) });
        let outcome = bootstrapper(&store, "a", fast()).run(reconciler.clone()).await;
        assert_eq!(outcome, BootstrapOutcome::GaveUp { attempts: 3 });
        assert_eq!(reconciler.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn only_one_node_bootstraps() {
        let store = Arc::new(MemoryStore::new());
        let reconciler = Arc::new(FailsFirst { failures: 0, calls: AtomicU32::new(0) });
        let first = bootstrapper(&store, "a", fast()).run(reconciler.clone()).await;
        let second = bootstrapper(&store, "b", fast()).run(reconciler.clone()).await;
        assert_eq!(first, BootstrapOutcome::Completed { attempt: 1 });
        assert_eq!(second, BootstrapOutcome::Skipped);
        assert_eq!(reconciler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn disabled_does_nothing() {
        let store = Arc::new(MemoryStore::new());
        let reconciler = Arc::new(FailsFirst { failures: 0, calls: AtomicU32::new(0) });
        let config = BootstrapConfig {
            enabled: false,
            ..fast()
        };
        let outcome = bootstrapper(&store, "a", config).run(reconciler.clone()).await;
        assert_eq!(outcome, BootstrapOutcome::Disabled);
        assert_eq!(reconciler.calls.load(Ordering::SeqCst), 0);
    }
}
