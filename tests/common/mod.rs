#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use taskmesh::StoreError;
use taskmesh::queue::Task;
use taskmesh::store::{CoordinationStore, CounterValue, MemoryStore};
use taskmesh::worker::TaskHandler;

/// MemoryStore that can be switched off to simulate an unreachable server,
/// or made slow for selected writes.
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    down: AtomicBool,
    slow_sets: Mutex<Option<(String, Duration)>>,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    /// Delays every `set` whose value contains `needle`.
    pub fn delay_sets_containing(&self, needle: &str, delay: Duration) {
        *self.slow_sets.lock().unwrap() = Some((needle.to_string(), delay));
    }

    fn set_delay(&self, value: &str) -> Option<Duration> {
        match &*self.slow_sets.lock().unwrap() {
            Some((needle, delay)) if value.contains(needle.as_str()) => Some(*delay),
            _ => None,
        }
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.down.load(Ordering::SeqCst) {
            Err(StoreError::Connection("connection refused".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl CoordinationStore for FlakyStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check()?;
        self.inner.get(key).await
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError> {
        self.check()?;
        self.inner.get_many(keys).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.check()?;
        if let Some(delay) = self.set_delay(value) {
            tokio::time::sleep(delay).await;
        }
        self.inner.set(key, value, ttl).await
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.check()?;
        self.inner.set_if_absent(key, value, ttl).await
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        self.check()?;
        self.inner.delete_if_equals(key, expected).await
    }

    async fn expire_if_equals(&self, key: &str, expected: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.check()?;
        self.inner.expire_if_equals(key, expected, ttl).await
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        self.check()?;
        self.inner.exists(key).await
    }

    async fn delete(&self, keys: &[String]) -> Result<usize, StoreError> {
        self.check()?;
        self.inner.delete(keys).await
    }

    async fn push_head(&self, list: &str, value: &str) -> Result<(), StoreError> {
        self.check()?;
        self.inner.push_head(list, value).await
    }

    async fn pop_tail(&self, list: &str) -> Result<Option<String>, StoreError> {
        self.check()?;
        self.inner.pop_tail(list).await
    }

    async fn pop_tail_push_head(&self, source: &str, destination: &str) -> Result<Option<String>, StoreError> {
        self.check()?;
        self.inner.pop_tail_push_head(source, destination).await
    }

    async fn list_remove(&self, list: &str, value: &str) -> Result<usize, StoreError> {
        self.check()?;
        self.inner.list_remove(list, value).await
    }

    async fn list_len(&self, list: &str) -> Result<usize, StoreError> {
        self.check()?;
        self.inner.list_len(list).await
    }

    async fn set_add(&self, set: &str, member: &str) -> Result<(), StoreError> {
        self.check()?;
        self.inner.set_add(set, member).await
    }

    async fn set_remove(&self, set: &str, member: &str) -> Result<(), StoreError> {
        self.check()?;
        self.inner.set_remove(set, member).await
    }

    async fn set_members(&self, set: &str) -> Result<Vec<String>, StoreError> {
        self.check()?;
        self.inner.set_members(set).await
    }

    async fn index_put(&self, index: &str, member: &str, score: i64) -> Result<(), StoreError> {
        self.check()?;
        self.inner.index_put(index, member, score).await
    }

    async fn index_range_desc(&self, index: &str, start: usize, stop: usize) -> Result<Vec<String>, StoreError> {
        self.check()?;
        self.inner.index_range_desc(index, start, stop).await
    }

    async fn index_range_asc(&self, index: &str, start: usize, stop: usize) -> Result<Vec<String>, StoreError> {
        self.check()?;
        self.inner.index_range_asc(index, start, stop).await
    }

    async fn index_remove(&self, index: &str, members: &[String]) -> Result<usize, StoreError> {
        self.check()?;
        self.inner.index_remove(index, members).await
    }

    async fn index_len(&self, index: &str) -> Result<usize, StoreError> {
        self.check()?;
        self.inner.index_len(index).await
    }

    async fn decrement_counter(&self, key: &str) -> Result<CounterValue, StoreError> {
        self.check()?;
        self.inner.decrement_counter(key).await
    }
}

/// One handler invocation.
#[derive(Debug, Clone)]
pub struct Run {
    pub resource_key: String,
    pub trace_id: String,
    pub started: Instant,
    pub finished: Instant,
}

/// Handler that sleeps for `work` and records when each call ran.
pub struct RecordingHandler {
    work: Duration,
    runs: Mutex<Vec<Run>>,
    running: Mutex<HashMap<String, usize>>,
    overlaps: Mutex<usize>,
}

impl RecordingHandler {
    pub fn new(work: Duration) -> Arc<Self> {
        Arc::new(Self {
            work,
            runs: Mutex::new(Vec::new()),
            running: Mutex::new(HashMap::new()),
            overlaps: Mutex::new(0),
        })
    }

    pub fn runs(&self) -> Vec<Run> {
        self.runs.lock().unwrap().clone()
    }

    pub fn runs_for(&self, resource_key: &str) -> Vec<Run> {
        self.runs()
            .into_iter()
            .filter(|r| r.resource_key == resource_key)
            .collect()
    }

    /// How many times a call started while another call for the same
    /// resource was still running.
    pub fn overlaps(&self) -> usize {
        *self.overlaps.lock().unwrap()
    }
}

#[async_trait]
impl TaskHandler for RecordingHandler {
    async fn handle(&self, task: &Task) -> anyhow::Result<String> {
        let started = Instant::now();
        {
            let mut running = self.running.lock().unwrap();
            let count = running.entry(task.resource_key.clone()).or_insert(0);
            if *count > 0 {
                *self.overlaps.lock().unwrap() += 1;
            }
            *count += 1;
        }

        tokio::time::sleep(self.work).await;

        {
            let mut running = self.running.lock().unwrap();
            if let Some(count) = running.get_mut(&task.resource_key) {
                *count -= 1;
            }
        }
        self.runs.lock().unwrap().push(Run {
            resource_key: task.resource_key.clone(),
            trace_id: task.trace_id.clone(),
            started,
            finished: Instant::now(),
        });
        Ok(format!("ok {}", task.resource_key))
    }
}

/// Polls `check` every 10 ms until it holds or `timeout` passes.
pub async fn wait_until<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
