//! Process-wide lookup from task id to handle

use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::{events::TaskEvent, handle::TaskHandle, modes::DEFAULT_MODE};

struct Inner {
    handles: HashMap<String, TaskHandle>,
    /// Active tasks, root first, innermost child last
    stack: Vec<String>,
    mode: String,
}

/// Tasks refer to each other by id and resolve through here, so a task
/// that has been torn down simply stops being found.
#[derive(Clone)]
pub struct TaskRegistry {
    inner: Arc<Mutex<Inner>>,
    events: broadcast::Sender<TaskEvent>,
}

impl TaskRegistry {
    pub fn new(events: broadcast::Sender<TaskEvent>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                handles: HashMap::new(),
                stack: Vec::new(),
                mode: DEFAULT_MODE.to_string(),
            })),
            events,
        }
    }

    pub fn register(&self, handle: TaskHandle) {
        let mut inner = self.inner.lock();
        let id = handle.task_id().to_string();
        inner.stack.retain(|t| t != &id);
        inner.stack.push(id.clone());
        inner.handles.insert(id, handle);
    }

    pub fn get(&self, task_id: &str) -> Option<TaskHandle> {
        self.inner.lock().handles.get(task_id).cloned()
    }

    pub fn remove(&self, task_id: &str) -> Option<TaskHandle> {
        let mut inner = self.inner.lock();
        inner.stack.retain(|t| t != task_id);
        inner.handles.remove(task_id)
    }

    /// The innermost active task
    pub fn current(&self) -> Option<TaskHandle> {
        let inner = self.inner.lock();
        inner
            .stack
            .last()
            .and_then(|id| inner.handles.get(id).cloned())
    }

    pub fn stack(&self) -> Vec<String> {
        self.inner.lock().stack.clone()
    }

    pub fn mode(&self) -> String {
        self.inner.lock().mode.clone()
    }

    pub fn set_mode(&self, mode: &str) {
        let changed = {
            let mut inner = self.inner.lock();
            if inner.mode == mode {
                false
            } else {
                inner.mode = mode.to_string();
                true
            }
        };
        if changed {
            info!(mode, "Mode changed");
            let _ = self.events.send(TaskEvent::ModeChanged {
                mode: mode.to_string(),
            });
        }
    }

    /// Hand a finished child's result to its parent.
    ///
    /// The child is abandoned and leaves the stack. Returns `false` when the
    /// parent no longer exists.
    pub fn finish_subtask(&self, child: &TaskHandle, result: &str) -> bool {
        child.abandon();
        self.remove(child.task_id());

        let Some(parent_id) = child.parent_id() else {
            return false;
        };
        match self.get(parent_id) {
            Some(parent) => {
                info!(parent_id, child_id = child.task_id(), "Subtask finished");
                parent.resume_with(result);
                true
            }
            None => {
                warn!(
                    parent_id,
                    child_id = child.task_id(),
                    "Parent task is gone, dropping subtask result"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> (TaskRegistry, broadcast::Receiver<TaskEvent>) {
        let (tx, rx) = broadcast::channel(16);
        (TaskRegistry::new(tx), rx)
    }

    #[test]
    fn test_stack_tracks_nesting() {
        let (registry, _rx) = registry();
        registry.register(TaskHandle::new("root", None));
        registry.register(TaskHandle::new("child", Some("root".into())));
        assert_eq!(registry.stack(), vec!["root", "child"]);
        assert_eq!(registry.current().unwrap().task_id(), "child");
        registry.remove("child");
        assert_eq!(registry.current().unwrap().task_id(), "root");
        assert!(registry.get("child").is_none());
    }

    #[test]
    fn test_finish_subtask_resumes_parent() {
        let (registry, _rx) = registry();
        let parent = TaskHandle::new("root", None);
        parent.pause("code".into());
        let child = TaskHandle::new("child", Some("root".into()));
        registry.register(parent.clone());
        registry.register(child.clone());

        assert!(registry.finish_subtask(&child, "all done"));
        assert!(child.is_abandoned());
        assert!(!parent.is_paused());
        assert_eq!(parent.take_resume_message().as_deref(), Some("all done"));
        assert_eq!(registry.stack(), vec!["root"]);
    }

    #[test]
    fn test_finish_subtask_without_parent() {
        let (registry, _rx) = registry();
        let child = TaskHandle::new("child", Some("gone".into()));
        registry.register(child.clone());
        assert!(!registry.finish_subtask(&child, "x"));
        assert!(registry.stack().is_empty());
    }

    #[tokio::test]
    async fn test_mode_change_is_broadcast_once() {
        let (registry, mut rx) = registry();
        registry.set_mode("architect");
        registry.set_mode("architect");
        assert!(matches!(
            rx.recv().await.unwrap(),
            TaskEvent::ModeChanged { mode } if mode == "architect"
        ));
        assert!(rx.try_recv().is_err());
    }
}
