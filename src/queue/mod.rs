pub mod cleanup;
pub mod task;

pub use cleanup::{ActiveCleanup, CleanupReport};
pub use task::{Task, TaskState, TaskStatus, now_millis};

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use crate::config::{QueueConfig, ms};
use crate::error::{CoordError, Result};
use crate::keys::{KeySpace, index_member};
use crate::store::{CoordinationStore, CounterValue};

const MAX_PAGE_PREALLOC: usize = 1024;

/// What `decrement_batch` reports back to the executor.
pub type BatchRemaining = CounterValue;

/// A task taken with [`TaskQueue::poll_reliable`].
///
/// The raw payload stays in the node's processing list until it is acked, so
/// a node that dies mid-execution leaves it behind for reclaim.
#[derive(Debug, Clone)]
pub struct Claim {
    pub task: Task,
    pub raw: String,
}

/// The canonical task queue plus the status records that shadow it.
///
/// Producers push onto the head and consumers pop from the tail, so delivery
/// is FIFO. Every status write also upserts `{resource_key}:{trace_id}` into
/// the status index, scored by update time, which is what the paginated view
/// and the cleanup sweep walk.
pub struct TaskQueue {
    store: Arc<dyn CoordinationStore>,
    keys: KeySpace,
    config: QueueConfig,
}

impl TaskQueue {
    pub fn new(store: Arc<dyn CoordinationStore>, keys: KeySpace, config: QueueConfig) -> Self {
        Self { store, keys, config }
    }

    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    pub async fn enqueue(&self, task: &Task) -> Result<()> {
        if task.resource_key.trim().is_empty() {
            return Err(CoordError::InvalidTask("resource_key is blank".to_string()));
        }
        if task.trace_id.trim().is_empty() {
            return Err(CoordError::InvalidTask("trace_id is blank".to_string()));
        }

        // Status first: a worker may finish the task before a later write would land.
        let payload = serde_json::to_string(task)?;
        self.update_status(&task.resource_key, TaskStatus::for_task(task, TaskState::Waiting))
            .await?;
        if let Err(e) = self.store.push_head(&self.keys.queue(), &payload).await {
            self.discard_waiting(task).await;
            return Err(e.into());
        }

        debug!(
            task_id = %task.task_id,
            resource_key = %task.resource_key,
            trace_id = %task.trace_id,
            "Task enqueued"
        );
        Ok(())
    }

    /// Drops the WAITING status of a task that never made it onto a transport.
    pub async fn discard_waiting(&self, task: &Task) {
        if let Err(e) = self.delete_status(&task.resource_key, &task.trace_id).await {
            warn!(task_id = %task.task_id, error = %e, "Failed to drop status of unqueued task");
        }
    }

    pub async fn poll(&self) -> Result<Option<Task>> {
        let Some(raw) = self.store.pop_tail(&self.keys.queue()).await? else {
            return Ok(None);
        };
        match serde_json::from_str::<Task>(&raw) {
            Ok(task) => Ok(Some(task)),
            Err(e) => {
                error!(error = %e, payload = %raw, "Dropping malformed queue entry");
                Ok(None)
            }
        }
    }

    /// Moves the next task into `node`'s processing list instead of removing it.
    pub async fn poll_reliable(&self, node: &str) -> Result<Option<Claim>> {
        let processing = self.keys.processing(node);
        let Some(raw) = self.store.pop_tail_push_head(&self.keys.queue(), &processing).await? else {
            return Ok(None);
        };
        match serde_json::from_str::<Task>(&raw) {
            Ok(task) => Ok(Some(Claim { task, raw })),
            Err(e) => {
                error!(error = %e, payload = %raw, "Dropping malformed queue entry");
                self.store.list_remove(&processing, &raw).await?;
                Ok(None)
            }
        }
    }

    pub async fn ack(&self, node: &str, claim: &Claim) -> Result<bool> {
        let removed = self.store.list_remove(&self.keys.processing(node), &claim.raw).await?;
        Ok(removed > 0)
    }

    /// Pushes everything a (dead) node still had in flight back onto the queue.
    pub async fn reclaim_from_node(&self, node: &str) -> Result<usize> {
        let processing = self.keys.processing(node);
        let queue = self.keys.queue();
        let mut moved = 0;
        while self.store.pop_tail_push_head(&processing, &queue).await?.is_some() {
            moved += 1;
        }
        if moved > 0 {
            info!(node = %node, moved, "Reclaimed in-flight tasks");
        }
        Ok(moved)
    }

    pub async fn queue_len(&self) -> Result<usize> {
        Ok(self.store.list_len(&self.keys.queue()).await?)
    }

    fn status_ttl(&self, state: TaskState) -> Duration {
        if state.is_terminal() {
            ms(self.config.terminal_status_ttl_ms)
        } else {
            ms(self.config.active_status_ttl_ms)
        }
    }

    pub async fn update_status(&self, resource_key: &str, mut status: TaskStatus) -> Result<()> {
        if status.trace_id.trim().is_empty() {
            warn!(resource_key = %resource_key, "Refusing status without trace id");
            return Err(CoordError::InvalidTask("trace_id is blank".to_string()));
        }
        status.resource_key = resource_key.to_string();
        status.last_update_time = now_millis();

        let payload = serde_json::to_string(&status)?;
        let key = self.keys.status(resource_key, &status.trace_id);
        self.store.set(&key, &payload, Some(self.status_ttl(status.state))).await?;
        self.store
            .index_put(
                &self.keys.status_index(),
                &index_member(resource_key, &status.trace_id),
                status.last_update_time,
            )
            .await?;
        Ok(())
    }

    pub async fn get_status(&self, resource_key: &str, trace_id: &str) -> Result<Option<TaskStatus>> {
        match self.store.get(&self.keys.status(resource_key, trace_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn delete_status(&self, resource_key: &str, trace_id: &str) -> Result<()> {
        let member = index_member(resource_key, trace_id);
        self.store.delete(&[self.keys.status_for_member(&member)]).await?;
        self.store.index_remove(&self.keys.status_index(), &[member]).await?;
        Ok(())
    }

    /// Drops the index. The records themselves run out on their TTL.
    pub async fn clear_all(&self) -> Result<()> {
        self.store.delete(&[self.keys.status_index()]).await?;
        info!(queue = %self.keys.queue_name(), "Status index cleared");
        Ok(())
    }

    pub async fn total_status_count(&self) -> Result<usize> {
        Ok(self.store.index_len(&self.keys.status_index()).await?)
    }

    /// Fetches the records behind `members`. Members whose record is gone or
    /// does not decode come back in the second vector.
    async fn resolve(&self, members: &[String]) -> Result<(Vec<TaskStatus>, Vec<String>)> {
        let keys: Vec<String> = members.iter().map(|m| self.keys.status_for_member(m)).collect();
        let values = self.store.get_many(&keys).await?;

        let mut found = Vec::with_capacity(members.len());
        let mut stale = Vec::new();
        let mut undecodable = Vec::new();
        for ((member, key), value) in members.iter().zip(keys).zip(values) {
            match value.map(|raw| serde_json::from_str::<TaskStatus>(&raw)) {
                Some(Ok(status)) => found.push(status),
                Some(Err(e)) => {
                    warn!(member = %member, error = %e, "Undecodable status record");
                    undecodable.push(key);
                    stale.push(member.clone());
                }
                None => stale.push(member.clone()),
            }
        }
        if !undecodable.is_empty() {
            self.store.delete(&undecodable).await?;
        }
        Ok((found, stale))
    }

    /// Newest-first page of statuses, 1-based.
    ///
    /// Index members whose record has expired are removed on the way, and the
    /// page is topped up from further down the index until it is full, the
    /// index runs out, or `page_fill_attempts` reads were made.
    pub async fn statuses_paginated(&self, page: usize, size: usize) -> Result<Vec<TaskStatus>> {
        if size == 0 {
            return Ok(Vec::new());
        }
        let index = self.keys.status_index();
        // A page past usize cannot hold anything.
        let Some(start) = (page.max(1) - 1).checked_mul(size) else {
            return Ok(Vec::new());
        };
        let mut out: Vec<TaskStatus> = Vec::with_capacity(size.min(MAX_PAGE_PREALLOC));

        for _ in 0..self.config.page_fill_attempts.max(1) {
            let missing = size - out.len();
            let cursor = start.saturating_add(out.len());
            let stop = cursor.saturating_add(missing - 1);
            let members = self.store.index_range_desc(&index, cursor, stop).await?;
            if members.is_empty() {
                break;
            }
            let exhausted = members.len() < missing;
            let (found, stale) = self.resolve(&members).await?;
            out.extend(found);

            if !stale.is_empty() {
                let removed = self.store.index_remove(&index, &stale).await?;
                debug!(removed, "Pruned stale status index entries");
            } else if exhausted {
                break;
            }
            if out.len() >= size {
                break;
            }
        }
        Ok(out)
    }

    /// Checks the index slice `[start, stop]` (oldest first) and removes
    /// members without a record. Returns `(scanned, removed)`.
    pub async fn prune_range(&self, start: usize, stop: usize) -> Result<(usize, usize)> {
        let index = self.keys.status_index();
        let members = self.store.index_range_asc(&index, start, stop).await?;
        if members.is_empty() {
            return Ok((0, 0));
        }
        let keys: Vec<String> = members.iter().map(|m| self.keys.status_for_member(m)).collect();
        let values = self.store.get_many(&keys).await?;
        let missing: Vec<String> = members
            .iter()
            .zip(values)
            .filter(|(_, value)| value.is_none())
            .map(|(member, _)| member.clone())
            .collect();
        let removed = self.store.index_remove(&index, &missing).await?;
        Ok((members.len(), removed))
    }

    pub async fn init_batch(&self, trace_id: &str, total: u64) -> Result<()> {
        let key = self.keys.batch(trace_id);
        if total == 0 {
            self.store.delete(&[key]).await?;
            return Ok(());
        }
        self.store
            .set(&key, &total.to_string(), Some(ms(self.config.batch_ttl_ms)))
            .await?;
        Ok(())
    }

    pub async fn decrement_batch(&self, trace_id: &str) -> Result<BatchRemaining> {
        let value = self.store.decrement_counter(&self.keys.batch(trace_id)).await?;
        if value == CounterValue::Corrupt {
            warn!(trace_id = %trace_id, "Batch counter was not a number and has been removed");
        }
        Ok(value)
    }

    /// Only one node gets to finish a batch whose counter went missing.
    pub async fn try_lock_recovery(&self, trace_id: &str, owner: &str) -> Result<bool> {
        let acquired = self
            .store
            .set_if_absent(
                &self.keys.batch_recovery(trace_id),
                owner,
                ms(self.config.recovery_lock_ttl_ms),
            )
            .await?;
        Ok(acquired)
    }

    pub async fn mark_active(&self, resource_key: &str, trace_id: &str) -> Result<()> {
        self.store
            .set(
                &self.keys.active(resource_key),
                trace_id,
                Some(ms(self.config.active_marker_ttl_ms)),
            )
            .await?;
        Ok(())
    }

    /// Which of `resource_keys` carry an activity marker. If the store cannot
    /// be read every key is reported active.
    pub async fn active_states(&self, resource_keys: &[String]) -> Vec<bool> {
        let keys: Vec<String> = resource_keys.iter().map(|k| self.keys.active(k)).collect();
        match self.store.get_many(&keys).await {
            Ok(values) => values.into_iter().map(|v| v.is_some()).collect(),
            Err(e) => {
                warn!(error = %e, "Activity lookup failed, assuming active");
                vec![true; resource_keys.len()]
            }
        }
    }

    /// Re-enqueues every WAITING status among the newest `recovery_scan_limit`.
    pub async fn recover_waiting_tasks(&self) -> Result<usize> {
        let limit = self.config.recovery_scan_limit;
        if limit == 0 {
            return Ok(0);
        }
        let members = self
            .store
            .index_range_desc(&self.keys.status_index(), 0, limit - 1)
            .await?;
        let (statuses, _) = self.resolve(&members).await?;

        let mut seen = HashSet::new();
        let mut recovered = 0;
        for status in statuses.into_iter().filter(|s| s.state == TaskState::Waiting) {
            if !seen.insert(index_member(&status.resource_key, &status.trace_id)) {
                continue;
            }
            let task_type = status
                .task_type
                .clone()
                .unwrap_or_else(|| self.config.default_task_type.clone());
            let task = Task::new(status.resource_key, task_type, status.trace_id);
            match self.enqueue(&task).await {
                Ok(()) => recovered += 1,
                Err(e) => error!(resource_key = %task.resource_key, error = %e, "Failed to re-enqueue"),
            }
        }
        if recovered > 0 {
            info!(recovered, "Recovered waiting tasks");
        }
        Ok(recovered)
    }
}
