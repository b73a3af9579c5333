use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// One unit of work for a resource.
///
/// `task_id` identifies this delivery; `trace_id` groups every task created
/// by the same trigger (and keys the batch counter and the status record).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub resource_key: String,
    pub task_type: String,
    pub trace_id: String,
    pub created_at: i64,
}

impl Task {
    pub fn new(resource_key: impl Into<String>, task_type: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self {
            task_id: Uuid::new_v4().to_string(),
            resource_key: resource_key.into(),
            task_type: task_type.into(),
            trace_id: trace_id.into(),
            created_at: now_millis(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Waiting,
    Running,
    Success,
    Failed,
    Skipped,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Success | TaskState::Failed | TaskState::Skipped)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Waiting => "WAITING",
            TaskState::Running => "RUNNING",
            TaskState::Success => "SUCCESS",
            TaskState::Failed => "FAILED",
            TaskState::Skipped => "SKIPPED",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Monitoring record for one (resource_key, trace_id) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub resource_key: String,
    pub trace_id: String,
    pub state: TaskState,
    #[serde(default)]
    pub owner_node: Option<String>,
    #[serde(default)]
    pub last_update_time: i64,
    #[serde(default)]
    pub last_result: Option<String>,
    /// Lets recovery rebuild the original task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_type: Option<String>,
}

impl TaskStatus {
    pub fn for_task(task: &Task, state: TaskState) -> Self {
        Self {
            resource_key: task.resource_key.clone(),
            trace_id: task.trace_id.clone(),
            state,
            owner_node: None,
            last_update_time: now_millis(),
            last_result: None,
            task_type: Some(task.task_type.clone()),
        }
    }

    pub fn owned_by(mut self, node: impl Into<String>) -> Self {
        self.owner_node = Some(node.into());
        self
    }

    pub fn with_result(mut self, result: impl Into<String>) -> Self {
        self.last_result = Some(result.into());
        self
    }
}

/// Cuts `text` to at most `max_chars` characters, on a char boundary.
pub fn truncate_result(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
