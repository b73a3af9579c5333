use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use crate::error::CoordError;
use crate::idempotency::{Idempotent, IdempotencyGuard, MessageHandler};
use crate::queue::Task;
use crate::worker::{ExecutionOutcome, TaskExecutor};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: String,
}

/// Fan-out transport that can stand in for the store-backed queue.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, topic: &str, payload: String) -> Result<(), CoordError>;
}

/// In-process bus over a bounded channel.
#[derive(Clone)]
pub struct ChannelBus {
    tx: mpsc::Sender<BusMessage>,
}

impl ChannelBus {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<BusMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl MessageBus for ChannelBus {
    async fn publish(&self, topic: &str, payload: String) -> Result<(), CoordError> {
        self.tx
            .send(BusMessage {
                topic: topic.to_string(),
                payload,
            })
            .await
            .map_err(|_| CoordError::Bus("channel closed".to_string()))
    }
}

struct ExecuteTask(Arc<TaskExecutor>);

#[async_trait]
impl MessageHandler<Task> for ExecuteTask {
    async fn handle(&self, task: &Task) -> anyhow::Result<()> {
        match self.0.execute(task).await {
            ExecutionOutcome::Dropped => anyhow::bail!("task {} has no resource key", task.task_id),
            _ => Ok(()),
        }
    }
}

/// Executes tasks arriving over a [`MessageBus`], at most once per task id.
pub struct BusConsumer {
    topic: String,
    handler: Box<dyn MessageHandler<Task>>,
    permits: Arc<Semaphore>,
}

impl BusConsumer {
    pub fn new(
        topic: impl Into<String>,
        executor: Arc<TaskExecutor>,
        guard: Arc<IdempotencyGuard>,
        max_in_flight: usize,
    ) -> Self {
        let handler = Idempotent::new(ExecuteTask(executor), guard, |task: &Task| {
            Some(task.task_id.clone())
        });
        Self {
            topic: topic.into(),
            handler: Box::new(handler),
            permits: Arc::new(Semaphore::new(max_in_flight.max(1))),
        }
    }

    pub async fn handle_message(&self, message: &BusMessage) -> anyhow::Result<()> {
        if message.topic != self.topic {
            debug!(topic = %message.topic, "Ignoring message for another topic");
            return Ok(());
        }
        let task: Task = serde_json::from_str(&message.payload)?;
        self.handler.handle(&task).await
    }

    pub fn spawn(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<BusMessage>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(topic = %self.topic, "Bus consumer started");
            let mut running = Vec::new();
            loop {
                let message = tokio::select! {
                    _ = shutdown.changed() => break,
                    message = rx.recv() => message,
                };
                let Some(message) = message else {
                    break;
                };
                let permit = match self.permits.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                let consumer = self.clone();
                running.retain(|h: &JoinHandle<()>| !h.is_finished());
                running.push(tokio::spawn(async move {
                    let _permit = permit;
                    if let Err(e) = consumer.handle_message(&message).await {
                        error!(error = %e, "Bus message failed");
                    }
                }));
            }
            for handle in running {
                if let Err(e) = handle.await {
                    warn!(error = %e, "Bus execution ended abnormally");
                }
            }
            info!(topic = %self.topic, "Bus consumer stopped");
        })
    }
}
