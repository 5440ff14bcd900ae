//! Task configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Where the shadow repository for checkpoints lives
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStorage {
    /// One shadow repository per task
    #[default]
    Task,
    /// One shadow repository shared by every task in a workspace
    Workspace,
}

/// Knobs that shape how a task runs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    /// Approve read-only tools without asking
    pub auto_approve_read_only: bool,
    /// Approve workspace-mutating tools without asking
    pub auto_approve_mutating: bool,
    /// Retry failed provider requests without asking
    pub always_approve_resubmit: bool,
    /// Base backoff delay in seconds
    pub request_delay_seconds: u64,
    /// Minimum interval between provider calls in seconds
    pub rate_limit_seconds: u64,
    pub enable_checkpoints: bool,
    pub checkpoint_storage: CheckpointStorage,
    /// Consecutive mistakes before the user is asked to check in
    pub mistake_limit: u32,
    /// Mode slug a root task starts in
    pub mode: String,
    pub resume_poll_interval_ms: u64,
    pub checkpoint_init_timeout_ms: u64,
    pub checkpoint_poll_interval_ms: u64,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            auto_approve_read_only: false,
            auto_approve_mutating: false,
            always_approve_resubmit: false,
            request_delay_seconds: 5,
            rate_limit_seconds: 0,
            enable_checkpoints: true,
            checkpoint_storage: CheckpointStorage::Task,
            mistake_limit: 3,
            mode: "code".to_string(),
            resume_poll_interval_ms: 1_000,
            checkpoint_init_timeout_ms: 15_000,
            checkpoint_poll_interval_ms: 250,
        }
    }
}

impl TaskConfig {
    pub fn resume_poll_interval(&self) -> Duration {
        Duration::from_millis(self.resume_poll_interval_ms.max(1))
    }

    pub fn checkpoint_init_timeout(&self) -> Duration {
        Duration::from_millis(self.checkpoint_init_timeout_ms)
    }

    pub fn checkpoint_poll_interval(&self) -> Duration {
        Duration::from_millis(self.checkpoint_poll_interval_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: TaskConfig = serde_json::from_str(r#"{"rate_limit_seconds": 3}"#).unwrap();
        assert_eq!(config.rate_limit_seconds, 3);
        assert_eq!(config.request_delay_seconds, 5);
        assert_eq!(config.mistake_limit, 3);
        assert_eq!(config.resume_poll_interval(), Duration::from_secs(1));
        assert_eq!(config.checkpoint_storage, CheckpointStorage::Task);

        let config: TaskConfig =
            serde_json::from_str(r#"{"checkpoint_storage": "workspace"}"#).unwrap();
        assert_eq!(config.checkpoint_storage, CheckpointStorage::Workspace);
    }
}
