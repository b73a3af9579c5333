use anyhow::{Context as AnyhowContext, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;
use crate::error::CoordError;
use crate::keys::KeySpace;

/// Which path `enqueue` takes to reach the workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Store-backed list polled by the worker pool.
    #[default]
    Queue,
    /// Publish to the message bus; the bus consumer executes.
    Bus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub namespace: String,
    pub redis_url: String,
    pub transport: TransportKind,
    pub node: NodeConfig,
    pub queue: QueueConfig,
    pub lock: LockConfig,
    pub worker: WorkerConfig,
    pub cleanup: CleanupConfig,
    pub idempotency: IdempotencyConfig,
    pub bootstrap: BootstrapConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            namespace: "money".to_string(),
            redis_url: "redis://127.0.0.1:6379/0".to_string(),
            transport: TransportKind::Queue,
            node: NodeConfig::default(),
            queue: QueueConfig::default(),
            lock: LockConfig::default(),
            worker: WorkerConfig::default(),
            cleanup: CleanupConfig::default(),
            idempotency: IdempotencyConfig::default(),
            bootstrap: BootstrapConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Fixed node id. When unset the host address is used.
    pub id: Option<String>,
    pub heartbeat_interval_ms: u64,
    pub liveness_ttl_ms: u64,
    pub leader_lease_ttl_ms: u64,
    /// How often the leader looks for dead nodes.
    pub monitor_interval_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: None,
            heartbeat_interval_ms: 10_000,
            liveness_ttl_ms: 30_000,
            leader_lease_ttl_ms: 30_000,
            monitor_interval_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub name: String,
    /// Retention of WAITING / RUNNING statuses.
    pub active_status_ttl_ms: u64,
    /// Retention of SUCCESS / FAILED / SKIPPED statuses.
    pub terminal_status_ttl_ms: u64,
    pub recovery_scan_limit: usize,
    /// Task type used when a recovered status does not record one.
    pub default_task_type: String,
    pub page_fill_attempts: usize,
    pub batch_ttl_ms: u64,
    pub recovery_lock_ttl_ms: u64,
    pub active_marker_ttl_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: "stock:refresh".to_string(),
            active_status_ttl_ms: 30 * 60 * 1000,
            terminal_status_ttl_ms: 5 * 60 * 1000,
            recovery_scan_limit: 1000,
            default_task_type: "REFRESH_PRICE".to_string(),
            page_fill_attempts: 10,
            batch_ttl_ms: 60 * 60 * 1000,
            recovery_lock_ttl_ms: 60_000,
            active_marker_ttl_ms: 5 * 60 * 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub ttl_ms: u64,
    pub attempts: u32,
    pub retry_backoff_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 60_000,
            attempts: 2,
            retry_backoff_ms: 80,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub poll_workers: usize,
    /// Size of the execution pool; also the number of backpressure permits.
    pub max_in_flight: usize,
    pub empty_queue_sleep_ms: u64,
    pub error_sleep_ms: u64,
    pub handler_timeout_ms: u64,
    /// Pop into a per-node processing list and ack after execution.
    pub reliable_poll: bool,
    /// Keep terminal statuses until their TTL instead of deleting them.
    pub retain_terminal_status: bool,
    pub recover_on_start: bool,
    pub result_max_len: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_workers: 2,
            max_in_flight: 16,
            empty_queue_sleep_ms: 200,
            error_sleep_ms: 300,
            handler_timeout_ms: 60_000,
            reliable_poll: false,
            retain_terminal_status: false,
            recover_on_start: true,
            result_max_len: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    pub interval_ms: u64,
    /// Index size below which the sweep does nothing.
    pub threshold: usize,
    pub chunk_size: usize,
    pub max_chunks: usize,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            threshold: 1000,
            chunk_size: 2000,
            max_chunks: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdempotencyConfig {
    pub window_ms: u64,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            window_ms: 24 * 60 * 60 * 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapConfig {
    pub enabled: bool,
    pub use_lock: bool,
    pub lock_key: String,
    pub lock_ttl_ms: u64,
    pub retry_times: u32,
    pub retry_interval_ms: u64,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            use_lock: true,
            lock_key: "mq:bootstrap:lock".to_string(),
            lock_ttl_ms: 60_000,
            retry_times: 10,
            retry_interval_ms: 3000,
        }
    }
}

pub fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

impl CoordinatorConfig {
    pub fn key_space(&self) -> KeySpace {
        KeySpace::new(self.namespace.clone(), self.queue.name.clone())
    }

    pub fn validate(&self) -> Result<(), CoordError> {
        let invalid = |field: &str, reason: &str| CoordError::InvalidConfig {
            field: field.to_string(),
            reason: reason.to_string(),
        };
        if self.namespace.trim().is_empty() {
            return Err(invalid("namespace", "must not be empty"));
        }
        if self.queue.name.trim().is_empty() {
            return Err(invalid("queue.name", "must not be empty"));
        }
        if self.worker.poll_workers == 0 {
            return Err(invalid("worker.poll_workers", "must be at least 1"));
        }
        if self.worker.max_in_flight == 0 {
            return Err(invalid("worker.max_in_flight", "must be at least 1"));
        }
        if self.node.heartbeat_interval_ms == 0 {
            return Err(invalid("node.heartbeat_interval_ms", "must be positive"));
        }
        if self.node.monitor_interval_ms == 0 {
            return Err(invalid("node.monitor_interval_ms", "must be positive"));
        }
        if self.cleanup.interval_ms == 0 {
            return Err(invalid("cleanup.interval_ms", "must be positive"));
        }
        if self.node.leader_lease_ttl_ms <= self.node.heartbeat_interval_ms {
            return Err(invalid("node.leader_lease_ttl_ms", "must exceed the heartbeat interval"));
        }
        if self.lock.ttl_ms == 0 {
            return Err(invalid("lock.ttl_ms", "must be positive"));
        }
        if self.cleanup.chunk_size == 0 {
            return Err(invalid("cleanup.chunk_size", "must be at least 1"));
        }
        Ok(())
    }
}

pub fn load_config_from_yaml(file_path: &str) -> Result<CoordinatorConfig> {
    let yaml_content = fs::read_to_string(file_path)
        .with_context(|| format!("Failed to read config file from {}", file_path))?;

    let config: CoordinatorConfig = serde_yaml::from_str(&yaml_content)
        .with_context(|| format!("Failed to deserialize config from {}", file_path))?;

    config.validate()
        .with_context(|| format!("Invalid config in {}", file_path))?;

    Ok(config)
}
