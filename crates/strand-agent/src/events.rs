//! Task event types

use serde::{Deserialize, Serialize};

use crate::{conversation::ApiMetrics, ui::UiMessage};

/// Events broadcast to observers while tasks run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    /// A task instance began running
    TaskStarted {
        task_id: String,
        instance_id: String,
        parent_id: Option<String>,
    },

    /// A UI message was appended
    MessageAdded { task_id: String, message: UiMessage },

    /// The last UI message changed (partial update or completion)
    MessageUpdated { task_id: String, message: UiMessage },

    /// A child task was created
    TaskSpawned { parent_id: String, child_id: String },

    TaskPaused { task_id: String },

    TaskUnpaused { task_id: String },

    /// The shared mode changed
    ModeChanged { mode: String },

    CheckpointSaved {
        task_id: String,
        to: String,
        from: Option<String>,
        is_first: bool,
    },

    /// Checkpoints are off for the rest of this task
    CheckpointsDisabled { task_id: String },

    TokenUsageUpdated { task_id: String, usage: ApiMetrics },

    TaskCompleted { task_id: String, usage: ApiMetrics },

    TaskAborted { task_id: String },
}

impl TaskEvent {
    /// Check if this ends a task
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskEvent::TaskCompleted { .. } | TaskEvent::TaskAborted { .. }
        )
    }

    pub fn task_id(&self) -> Option<&str> {
        match self {
            TaskEvent::TaskStarted { task_id, .. }
            | TaskEvent::MessageAdded { task_id, .. }
            | TaskEvent::MessageUpdated { task_id, .. }
            | TaskEvent::TaskPaused { task_id }
            | TaskEvent::TaskUnpaused { task_id }
            | TaskEvent::CheckpointSaved { task_id, .. }
            | TaskEvent::CheckpointsDisabled { task_id }
            | TaskEvent::TokenUsageUpdated { task_id, .. }
            | TaskEvent::TaskCompleted { task_id, .. }
            | TaskEvent::TaskAborted { task_id } => Some(task_id),
            TaskEvent::TaskSpawned { child_id, .. } => Some(child_id),
            TaskEvent::ModeChanged { .. } => None,
        }
    }
}
