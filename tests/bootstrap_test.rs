mod common;

use async_trait::async_trait;
use common::FlakyStore;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use taskmesh::bootstrap::{BootstrapOutcome, Bootstrapper, Reconciler};
use taskmesh::config::BootstrapConfig;
use taskmesh::keys::KeySpace;
use taskmesh::lock::DistributedLock;
use taskmesh::node::NodeIdentity;
use taskmesh::store::CoordinationStore;

#[derive(Default)]
struct CountingReconciler {
    calls: AtomicU32,
}

#[async_trait]
impl Reconciler for CountingReconciler {
    async fn reconcile(&self) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn bootstrapper(store: Arc<dyn CoordinationStore>, node: &str) -> Bootstrapper {
    Bootstrapper::new(
        DistributedLock::new(store),
        KeySpace::new("money", "q"),
        NodeIdentity::new(node),
        BootstrapConfig {
            retry_times: 2,
            retry_interval_ms: 5,
            ..BootstrapConfig::default()
        },
    )
}

#[tokio::test]
async fn test_unreachable_store_degrades_to_unlocked_run() {
    let store = Arc::new(FlakyStore::new());
    store.set_down(true);
    let reconciler = Arc::new(CountingReconciler::default());

    // Both nodes run: neither can see the lock.
    let a = bootstrapper(store.clone(), "a").run(reconciler.clone()).await;
    let b = bootstrapper(store.clone(), "b").run(reconciler.clone()).await;
    assert_eq!(a, BootstrapOutcome::Completed { attempt: 1 });
    assert_eq!(b, BootstrapOutcome::Completed { attempt: 1 });
    assert_eq!(reconciler.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_lock_holder_runs_others_skip() {
    let store = Arc::new(FlakyStore::new());
    let reconciler = Arc::new(CountingReconciler::default());

    let outcomes = [
        bootstrapper(store.clone(), "a").run(reconciler.clone()).await,
        bootstrapper(store.clone(), "b").run(reconciler.clone()).await,
        bootstrapper(store.clone(), "c").run(reconciler.clone()).await,
    ];
    assert_eq!(outcomes[0], BootstrapOutcome::Completed { attempt: 1 });
    assert_eq!(outcomes[1], BootstrapOutcome::Skipped);
    assert_eq!(outcomes[2], BootstrapOutcome::Skipped);
    assert_eq!(reconciler.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_lockless_mode_always_runs() {
    let store: Arc<dyn CoordinationStore> = Arc::new(FlakyStore::new());
    let reconciler = Arc::new(CountingReconciler::default());
    let config = BootstrapConfig {
        use_lock: false,
        ..BootstrapConfig::default()
    };
    for node in ["a", "b"] {
        let outcome = Bootstrapper::new(
            DistributedLock::new(store.clone()),
            KeySpace::new("money", "q"),
            NodeIdentity::new(node),
            config.clone(),
        )
        .run(reconciler.clone())
        .await;
        assert_eq!(outcome, BootstrapOutcome::Completed { attempt: 1 });
    }
    assert_eq!(reconciler.calls.load(Ordering::SeqCst), 2);
}
