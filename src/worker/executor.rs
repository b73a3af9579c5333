use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use crate::config::{LockConfig, WorkerConfig, ms};
use crate::keys::KeySpace;
use crate::lock::DistributedLock;
use crate::node::NodeIdentity;
use crate::queue::task::truncate_result;
use crate::queue::{Claim, Task, TaskQueue, TaskState, TaskStatus};
use crate::store::CounterValue;
use crate::worker::{BatchListener, HandlerRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// The task had no resource key.
    Dropped,
    /// Another worker holds the resource lock.
    Skipped,
    Succeeded,
    Failed,
}

/// Runs one task under its resource lock.
///
/// Lock, RUNNING, handler, SUCCESS/FAILED, then cleanup: release the lock,
/// drop the status record, count the task off its batch. Cleanup runs
/// whatever the handler did, including panicking or timing out.
pub struct TaskExecutor {
    queue: Arc<TaskQueue>,
    lock: DistributedLock,
    keys: KeySpace,
    node: NodeIdentity,
    handlers: Arc<HandlerRegistry>,
    listener: Option<Arc<dyn BatchListener>>,
    lock_ttl: Duration,
    lock_attempts: u32,
    lock_backoff: Duration,
    handler_timeout: Duration,
    retain_terminal_status: bool,
    result_max_len: usize,
}

impl TaskExecutor {
    pub fn new(
        queue: Arc<TaskQueue>,
        lock: DistributedLock,
        node: NodeIdentity,
        handlers: Arc<HandlerRegistry>,
        worker: &WorkerConfig,
        lock_config: &LockConfig,
    ) -> Self {
        Self {
            keys: queue.keys().clone(),
            queue,
            lock,
            node,
            handlers,
            listener: None,
            lock_ttl: ms(lock_config.ttl_ms),
            lock_attempts: lock_config.attempts,
            lock_backoff: ms(lock_config.retry_backoff_ms),
            handler_timeout: ms(worker.handler_timeout_ms),
            retain_terminal_status: worker.retain_terminal_status,
            result_max_len: worker.result_max_len,
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn BatchListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn node(&self) -> &NodeIdentity {
        &self.node
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    /// Executes a task taken with a reliable poll and acks it afterwards.
    pub async fn execute_claim(&self, claim: &Claim) -> ExecutionOutcome {
        let outcome = self.execute(&claim.task).await;
        if let Err(e) = self.queue.ack(self.node.as_str(), claim).await {
            warn!(task_id = %claim.task.task_id, error = %e, "Failed to ack task");
        }
        outcome
    }

    pub async fn execute(&self, task: &Task) -> ExecutionOutcome {
        if task.resource_key.trim().is_empty() {
            warn!(task_id = %task.task_id, trace_id = %task.trace_id, "Dropping task without resource key");
            return ExecutionOutcome::Dropped;
        }

        let lock_key = self.keys.resource_lock(&task.resource_key);
        // Per-execution token: two workers on one node must not release each other's lock.
        let owner = format!("{}:{}", self.node, task.task_id);
        let locked = self
            .lock
            .acquire_with_retry(&lock_key, &owner, self.lock_ttl, self.lock_attempts, self.lock_backoff)
            .await;
        if !locked {
            debug!(resource_key = %task.resource_key, trace_id = %task.trace_id, "Resource busy, skipping");
            self.write_status(task, TaskState::Skipped, Some("resource locked by another worker".to_string()))
                .await;
            self.finish_batch(&task.trace_id).await;
            return ExecutionOutcome::Skipped;
        }

        self.write_status(task, TaskState::Running, None).await;
        let (state, result) = self.run_holding_lock(task, &lock_key, &owner).await;
        self.write_status(task, state, Some(result)).await;

        self.lock.release(&lock_key, &owner).await;
        if !self.retain_terminal_status {
            if let Err(e) = self.queue.delete_status(&task.resource_key, &task.trace_id).await {
                warn!(resource_key = %task.resource_key, error = %e, "Failed to delete status");
            }
        }
        self.finish_batch(&task.trace_id).await;

        match state {
            TaskState::Success => ExecutionOutcome::Succeeded,
            _ => ExecutionOutcome::Failed,
        }
    }

    /// Runs the handler while renewing the resource lock every third of its TTL,
    /// so a handler slower than the TTL keeps exclusive access.
    async fn run_holding_lock(&self, task: &Task, lock_key: &str, owner: &str) -> (TaskState, String) {
        let work = self.run_handler(task);
        tokio::pin!(work);
        let period = (self.lock_ttl / 3).max(Duration::from_millis(1));
        let mut renewal = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            tokio::select! {
                outcome = &mut work => return outcome,
                _ = renewal.tick() => {
                    if !self.lock.renew(lock_key, owner, self.lock_ttl).await {
                        warn!(resource_key = %task.resource_key, lock = %lock_key, "Resource lock lost while task running");
                    }
                }
            }
        }
    }

    async fn run_handler(&self, task: &Task) -> (TaskState, String) {
        let Some(handler) = self.handlers.get(&task.task_type).cloned() else {
            warn!(task_type = %task.task_type, "No handler registered");
            return (TaskState::Failed, format!("no handler for task type {}", task.task_type));
        };

        // Own task so a panicking handler cannot skip the cleanup below.
        let owned = task.clone();
        let mut call = tokio::spawn(async move { handler.handle(&owned).await });
        match tokio::time::timeout(self.handler_timeout, &mut call).await {
            Ok(Ok(Ok(output))) => {
                info!(resource_key = %task.resource_key, trace_id = %task.trace_id, "Task succeeded");
                (TaskState::Success, truncate_result(&output, self.result_max_len))
            }
            Ok(Ok(Err(e))) => {
                error!(resource_key = %task.resource_key, trace_id = %task.trace_id, error = ?e, "Task failed");
                (TaskState::Failed, truncate_result(&format!("{:#}", e), self.result_max_len))
            }
            Ok(Err(join_error)) => {
                error!(resource_key = %task.resource_key, error = %join_error, "Handler panicked");
                (TaskState::Failed, "handler panicked".to_string())
            }
            Err(_) => {
                call.abort();
                error!(resource_key = %task.resource_key, "Task timed out after {:?}", self.handler_timeout);
                (TaskState::Failed, format!("timed out after {} ms", self.handler_timeout.as_millis()))
            }
        }
    }

    async fn write_status(&self, task: &Task, state: TaskState, result: Option<String>) {
        let mut status = TaskStatus::for_task(task, state).owned_by(self.node.as_str());
        status.last_result = result;
        if let Err(e) = self.queue.update_status(&task.resource_key, status).await {
            warn!(resource_key = %task.resource_key, state = %state, error = %e, "Failed to write status");
        }
    }

    async fn finish_batch(&self, trace_id: &str) {
        let remaining = match self.queue.decrement_batch(trace_id).await {
            Ok(remaining) => remaining,
            Err(e) => {
                warn!(trace_id = %trace_id, error = %e, "Failed to decrement batch");
                return;
            }
        };
        let Some(listener) = &self.listener else {
            return;
        };
        match remaining {
            CounterValue::Remaining(0) => {
                info!(trace_id = %trace_id, "Batch completed");
                listener.on_batch_complete(trace_id).await;
            }
            CounterValue::Remaining(_) => {}
            CounterValue::Absent | CounterValue::Corrupt => {
                match self.queue.try_lock_recovery(trace_id, self.node.as_str()).await {
                    Ok(true) => {
                        info!(trace_id = %trace_id, "Batch counter missing, completing via recovery lock");
                        listener.on_batch_complete(trace_id).await;
                    }
                    Ok(false) => {}
                    Err(e) => warn!(trace_id = %trace_id, error = %e, "Recovery lock failed"),
                }
            }
        }
    }
}
