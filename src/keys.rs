/// Key layout in the coordination store.
///
/// Everything lives under `{namespace}:`; task-related keys additionally
/// carry the queue name so several queues can share one store.
#[derive(Debug, Clone)]
pub struct KeySpace {
    namespace: String,
    queue: String,
}

impl KeySpace {
    pub fn new(namespace: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            queue: queue.into(),
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue
    }

    pub fn queue(&self) -> String {
        format!("{}:mq:task:{}", self.namespace, self.queue)
    }

    pub fn processing(&self, node_id: &str) -> String {
        format!("{}:mq:task:{}:processing:{}", self.namespace, self.queue, node_id)
    }

    pub fn alive_nodes(&self) -> String {
        format!("{}:mq:nodes:alive", self.namespace)
    }

    pub fn node_liveness(&self, node_id: &str) -> String {
        format!("{}:mq:nodes:ttl:{}", self.namespace, node_id)
    }

    pub fn leader(&self) -> String {
        format!("{}:scheduler:leader", self.namespace)
    }

    pub fn resource_lock(&self, resource_key: &str) -> String {
        format!("{}:{}:lock:{}", self.namespace, self.queue, resource_key)
    }

    pub fn status_prefix(&self) -> String {
        format!("{}:{}:status:", self.namespace, self.queue)
    }

    pub fn status(&self, resource_key: &str, trace_id: &str) -> String {
        format!("{}{}", self.status_prefix(), index_member(resource_key, trace_id))
    }

    /// Status key for an index member produced by [`index_member`].
    pub fn status_for_member(&self, member: &str) -> String {
        format!("{}{}", self.status_prefix(), member)
    }

    pub fn status_index(&self) -> String {
        format!("{}:{}:status:index", self.namespace, self.queue)
    }

    pub fn batch(&self, trace_id: &str) -> String {
        format!("{}:{}:batch:{}", self.namespace, self.queue, trace_id)
    }

    pub fn batch_recovery(&self, trace_id: &str) -> String {
        format!("{}:{}:recovery:{}", self.namespace, self.queue, trace_id)
    }

    pub fn active(&self, resource_key: &str) -> String {
        format!("{}:{}:active:{}", self.namespace, self.queue, resource_key)
    }

    pub fn idempotency(&self, dedup_key: &str) -> String {
        format!("{}:mq:idempotent:{}", self.namespace, dedup_key)
    }

    pub fn bootstrap_lock(&self, lock_name: &str) -> String {
        format!("{}:{}", self.namespace, lock_name)
    }
}

pub fn index_member(resource_key: &str, trace_id: &str) -> String {
    format!("{}:{}", resource_key, trace_id)
}
