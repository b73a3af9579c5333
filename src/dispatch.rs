use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;
use crate::bus::MessageBus;
use crate::error::{CoordError, Result};
use crate::queue::{Task, TaskQueue, TaskState, TaskStatus};

/// Where `Dispatcher::enqueue` sends a task.
#[async_trait]
pub trait DispatchTransport: Send + Sync {
    async fn dispatch(&self, task: &Task) -> Result<()>;

    fn name(&self) -> &'static str;
}

/// Pushes onto the store-backed queue that the worker pool polls.
pub struct QueueTransport {
    queue: Arc<TaskQueue>,
}

impl QueueTransport {
    pub fn new(queue: Arc<TaskQueue>) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl DispatchTransport for QueueTransport {
    async fn dispatch(&self, task: &Task) -> Result<()> {
        self.queue.enqueue(task).await
    }

    fn name(&self) -> &'static str {
        "queue"
    }
}

/// Publishes task JSON on a bus topic. The WAITING status is still written so
/// status listings look the same whichever transport is active.
pub struct BusTransport {
    bus: Arc<dyn MessageBus>,
    queue: Arc<TaskQueue>,
    topic: String,
}

impl BusTransport {
    pub fn new(bus: Arc<dyn MessageBus>, queue: Arc<TaskQueue>, topic: impl Into<String>) -> Self {
        Self {
            bus,
            queue,
            topic: topic.into(),
        }
    }
}

#[async_trait]
impl DispatchTransport for BusTransport {
    async fn dispatch(&self, task: &Task) -> Result<()> {
        let payload = serde_json::to_string(task)?;
        self.queue
            .update_status(&task.resource_key, TaskStatus::for_task(task, TaskState::Waiting))
            .await?;
        if let Err(e) = self.bus.publish(&self.topic, payload).await {
            self.queue.discard_waiting(task).await;
            return Err(e);
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "bus"
    }
}

/// Entry point for producers.
pub struct Dispatcher {
    transport: Arc<dyn DispatchTransport>,
    queue: Arc<TaskQueue>,
}

impl Dispatcher {
    pub fn new(transport: Arc<dyn DispatchTransport>, queue: Arc<TaskQueue>) -> Self {
        Self { transport, queue }
    }

    pub fn transport_name(&self) -> &'static str {
        self.transport.name()
    }

    pub async fn enqueue(&self, resource_key: &str, task_type: &str, trace_id: &str) -> Result<Task> {
        if resource_key.trim().is_empty() {
            return Err(CoordError::InvalidTask("resource_key is blank".to_string()));
        }
        if trace_id.trim().is_empty() {
            return Err(CoordError::InvalidTask("trace_id is blank".to_string()));
        }
        let task = Task::new(resource_key, task_type, trace_id);
        self.transport.dispatch(&task).await?;
        Ok(task)
    }

    /// Starts a batch counter for `trace_id` and enqueues one task per key.
    /// Returns how many tasks were enqueued.
    pub async fn enqueue_batch(&self, trace_id: &str, task_type: &str, resource_keys: &[String]) -> Result<usize> {
        let keys: Vec<&String> = resource_keys.iter().filter(|k| !k.trim().is_empty()).collect();
        self.queue.init_batch(trace_id, keys.len() as u64).await?;
        for key in &keys {
            self.enqueue(key, task_type, trace_id).await?;
        }
        info!(trace_id = %trace_id, tasks = keys.len(), transport = self.transport.name(), "Batch enqueued");
        Ok(keys.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::ChannelBus;
    use crate::config::QueueConfig;
    use crate::keys::KeySpace;
    use crate::store::MemoryStore;

    fn queue() -> Arc<TaskQueue> {
        Arc::new(TaskQueue::new(
            Arc::new(MemoryStore::new()),
            KeySpace::new("test", "q"),
            QueueConfig::default(),
        ))
    }

    #[tokio::test]
    async fn queue_transport_enqueues() {
        let queue = queue();
        let dispatcher = Dispatcher::new(Arc::new(QueueTransport::new(queue.clone())), queue.clone());
        let task = dispatcher.enqueue("A", "X", "t1").await.unwrap();
        assert_eq!(queue.poll().await.unwrap(), Some(task));
        assert_eq!(dispatcher.transport_name(), "queue");
    }

    #[tokio::test]
    async fn bus_transport_publishes_and_tracks_status() {
        let queue = queue();
        let (bus, mut rx) = ChannelBus::new(8);
        let transport = BusTransport::new(Arc::new(bus), queue.clone(), "refresh");
        let dispatcher = Dispatcher::new(Arc::new(transport), queue.clone());

        let task = dispatcher.enqueue("A", "X", "t1").await.unwrap();
        let message = rx.recv().await.unwrap();
        assert_eq!(message.topic, "refresh");
        assert_eq!(serde_json::from_str::<Task>(&message.payload).unwrap(), task);
        assert_eq!(queue.queue_len().await.unwrap(), 0);
        assert_eq!(queue.get_status("A", "t1").await.unwrap().unwrap().state, TaskState::Waiting);
    }

    #[tokio::test]
    async fn failed_publish_leaves_no_waiting_status() {
        let queue = queue();
        let (bus, rx) = ChannelBus::new(8);
        drop(rx);
        let transport = BusTransport::new(Arc::new(bus), queue.clone(), "refresh");
        let dispatcher = Dispatcher::new(Arc::new(transport), queue.clone());

        let err = dispatcher.enqueue("A", "X", "t1").await.unwrap_err();
        assert!(matches!(err, CoordError::Bus(_)));
        assert!(queue.get_status("A", "t1").await.unwrap().is_none());
        assert_eq!(queue.recover_waiting_tasks().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn batch_skips_blank_keys() {
        let queue = queue();
        let dispatcher = Dispatcher::new(Arc::new(QueueTransport::new(queue.clone())), queue.clone());
        let keys = vec!["A".to_string(), " ".to_string(), "B".to_string()];
        assert_eq!(dispatcher.enqueue_batch("t1", "X", &keys).await.unwrap(), 2);
        assert_eq!(queue.queue_len().await.unwrap(), 2);
        assert!(dispatcher.enqueue("", "X", "t1").await.is_err());
    }
}
