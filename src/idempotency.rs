use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use crate::keys::KeySpace;
use crate::store::CoordinationStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Guarded<T> {
    Executed(T),
    /// The key was seen inside the window; the work was not run.
    Duplicate,
}

/// Suppresses repeated side effects for the same dedup key.
///
/// A key is only recorded after the work succeeds, so a failed attempt can be
/// redelivered. The check and the mark are separate store calls: two
/// deliveries racing inside that gap both run.
pub struct IdempotencyGuard {
    store: Arc<dyn CoordinationStore>,
    keys: KeySpace,
    window: Duration,
}

impl IdempotencyGuard {
    pub fn new(store: Arc<dyn CoordinationStore>, keys: KeySpace, window: Duration) -> Self {
        Self { store, keys, window }
    }

    pub async fn execute<F, T, E>(&self, key: Option<&str>, work: F) -> Result<Guarded<T>, E>
    where
        F: Future<Output = Result<T, E>>,
    {
        let Some(key) = key.map(str::trim).filter(|k| !k.is_empty()) else {
            warn!("No dedup key, running without idempotency check");
            return work.await.map(Guarded::Executed);
        };
        let store_key = self.keys.idempotency(key);

        match self.store.exists(&store_key).await {
            Ok(true) => {
                debug!(key = %key, "Duplicate delivery skipped");
                return Ok(Guarded::Duplicate);
            }
            Ok(false) => {}
            Err(e) => warn!(key = %key, error = %e, "Idempotency check failed, running anyway"),
        }

        let output = work.await?;
        if let Err(e) = self.store.set(&store_key, "1", Some(self.window)).await {
            warn!(key = %key, error = %e, "Failed to record idempotency key");
        }
        Ok(Guarded::Executed(output))
    }
}

/// Something that consumes messages of type `M`.
#[async_trait]
pub trait MessageHandler<M: Send + Sync>: Send + Sync {
    async fn handle(&self, message: &M) -> anyhow::Result<()>;
}

type KeyFn<M> = Box<dyn Fn(&M) -> Option<String> + Send + Sync>;

/// Wraps a handler so each message runs at most once per dedup key.
pub struct Idempotent<M, H> {
    inner: H,
    guard: Arc<IdempotencyGuard>,
    key_fn: KeyFn<M>,
}

impl<M, H> Idempotent<M, H> {
    pub fn new<K>(inner: H, guard: Arc<IdempotencyGuard>, key_fn: K) -> Self
    where
        K: Fn(&M) -> Option<String> + Send + Sync + 'static,
    {
        Self {
            inner,
            guard,
            key_fn: Box::new(key_fn),
        }
    }
}

#[async_trait]
impl<M, H> MessageHandler<M> for Idempotent<M, H>
where
    M: Send + Sync + 'static,
    H: MessageHandler<M>,
{
    async fn handle(&self, message: &M) -> anyhow::Result<()> {
        let key = (self.key_fn)(message);
        self.guard
            .execute(key.as_deref(), self.inner.handle(message))
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn guard(window: Duration) -> IdempotencyGuard {
        IdempotencyGuard::new(Arc::new(MemoryStore::new()), KeySpace::new("test", "q"), window)
    }

    #[tokio::test]
    async fn second_run_inside_window_is_skipped() {
        let guard = guard(Duration::from_millis(60));
        let counter = AtomicUsize::new(0);
        let runs = &counter;
        let work = move || async move {
            runs.fetch_add(1, Ordering::SeqCst);
            Ok::<_, anyhow::Error>("done")
        };

        assert_eq!(guard.execute(Some("k"), work()).await.unwrap(), Guarded::Executed("done"));
        assert_eq!(guard.execute(Some("k"), work()).await.unwrap(), Guarded::Duplicate);
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(guard.execute(Some("k"), work()).await.unwrap(), Guarded::Executed("done"));
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failures_are_not_remembered() {
        let guard = guard(Duration::from_secs(60));
        let failed: Result<Guarded<()>, &str> = guard.execute(Some("k"), async { Err("nope") }).await;
        assert_eq!(failed, Err("nope"));

        let retried = guard.execute(Some("k"), async { Ok::<_, &str>(1) }).await;
        assert_eq!(retried, Ok(Guarded::Executed(1)));
    }

    #[tokio::test]
    async fn missing_key_runs_every_time() {
        let guard = guard(Duration::from_secs(60));
        for _ in 0..2 {
            let out = guard.execute(None, async { Ok::<_, ()>(()) }).await;
            assert_eq!(out, Ok(Guarded::Executed(())));
        }
        let out = guard.execute(Some("  "), async { Ok::<_, ()>(()) }).await;
        assert_eq!(out, Ok(Guarded::Executed(())));
    }

    struct Count(Arc<AtomicUsize>);

    #[async_trait]
    impl MessageHandler<(String, u32)> for Count {
        async fn handle(&self, _message: &(String, u32)) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn decorator_uses_the_key_function() {
        let calls = Arc::new(AtomicUsize::new(0));
        let handler = Idempotent::new(
            Count(calls.clone()),
            Arc::new(guard(Duration::from_secs(60))),
            |m: &(String, u32)| Some(m.0.clone()),
        );

        handler.handle(&("a".to_string(), 1)).await.unwrap();
        handler.handle(&("a".to_string(), 2)).await.unwrap();
        handler.handle(&("b".to_string(), 3)).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
