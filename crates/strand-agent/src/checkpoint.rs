//! Workspace checkpoints
//!
//! A [`CheckpointCoordinator`] owns one task's checkpoint service. The
//! service is initialized in the background; saves are fire-and-forget;
//! diff and restore wait a bounded time for initialization. The first
//! failure of any kind disables checkpoints for the rest of the task.
//!
//! Background work is counted so the task can [settle](CheckpointCoordinator::settle)
//! before its next turn and post each marker ahead of that turn's request.

use std::{path::Path, sync::Arc, time::Duration};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use strand_ai::Message;
use tokio::sync::{Notify, mpsc};
use tracing::{debug, info};

use crate::{
    breaker::CircuitBreaker,
    config::TaskConfig,
    conversation::ApiMetrics,
    error::Result,
    ui::{SayKind, UiMessage},
};

/// One file's contents on both sides of a diff
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    /// Path relative to the workspace
    pub path: String,
    pub before: String,
    pub after: String,
}

/// A versioning backend for the workspace
#[async_trait]
pub trait CheckpointService: Send + Sync {
    async fn init_shadow_store(&self) -> Result<()>;

    /// Snapshot the workspace. `None` when nothing changed since the last one.
    async fn save_checkpoint(&self, label: &str) -> Result<Option<String>>;

    /// Changes from `from` (the initial snapshot when `None`) to `to`
    async fn get_diff(&self, from: Option<&str>, to: &str) -> Result<Vec<FileChange>>;

    async fn restore_checkpoint(&self, id: &str) -> Result<()>;
}

/// Builds a service for one task's workspace
pub trait CheckpointServiceFactory: Send + Sync {
    fn create(&self, task_id: &str, workspace: &Path) -> Result<Arc<dyn CheckpointService>>;
}

/// What the coordinator reports back to its task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointEvent {
    Saved {
        to: String,
        from: Option<String>,
        is_first: bool,
    },
    /// Sent once, when checkpoints switch off
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointState {
    Uninitialized,
    Initializing,
    Ready,
    Disabled,
}

struct Inner {
    state: CheckpointState,
    service: Option<Arc<dyn CheckpointService>>,
    last: Option<String>,
    has_first: bool,
    /// Spawned init and save jobs still running
    in_flight: usize,
}

#[derive(Clone)]
pub struct CheckpointCoordinator {
    task_id: Arc<str>,
    inner: Arc<Mutex<Inner>>,
    breaker: CircuitBreaker,
    events: mpsc::UnboundedSender<CheckpointEvent>,
    idle: Arc<Notify>,
    init_timeout: Duration,
    poll_interval: Duration,
}

impl CheckpointCoordinator {
    pub fn new(
        task_id: &str,
        config: &TaskConfig,
    ) -> (Self, mpsc::UnboundedReceiver<CheckpointEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let state = if config.enable_checkpoints {
            CheckpointState::Uninitialized
        } else {
            CheckpointState::Disabled
        };
        let breaker = if config.enable_checkpoints {
            CircuitBreaker::new("checkpoints")
        } else {
            CircuitBreaker::opened("checkpoints")
        };
        let coordinator = Self {
            task_id: Arc::from(task_id),
            inner: Arc::new(Mutex::new(Inner {
                state,
                service: None,
                last: None,
                has_first: false,
                in_flight: 0,
            })),
            breaker,
            events,
            idle: Arc::new(Notify::new()),
            init_timeout: config.checkpoint_init_timeout(),
            poll_interval: config.checkpoint_poll_interval(),
        };
        (coordinator, rx)
    }

    pub fn state(&self) -> CheckpointState {
        self.inner.lock().state
    }

    pub fn is_enabled(&self) -> bool {
        self.breaker.is_closed()
    }

    /// Start initializing in the background.
    ///
    /// `last_marker` is the newest checkpoint already recorded for this task;
    /// without one an initial checkpoint is saved once the service is ready.
    pub fn initialize(
        &self,
        factory: &dyn CheckpointServiceFactory,
        workspace: &Path,
        last_marker: Option<String>,
    ) {
        {
            let mut inner = self.inner.lock();
            if inner.state != CheckpointState::Uninitialized || self.breaker.is_open() {
                return;
            }
            inner.state = CheckpointState::Initializing;
            inner.has_first = last_marker.is_some();
            inner.last = last_marker;
        }

        let service = match factory.create(&self.task_id, workspace) {
            Ok(service) => service,
            Err(e) => {
                self.disable(&format!("could not create service: {e}"));
                return;
            }
        };
        self.inner.lock().service = Some(service.clone());

        let coordinator = self.clone();
        let job = self.track();
        tokio::spawn(async move {
            let _job = job;
            if let Err(e) = service.init_shadow_store().await {
                coordinator.disable(&format!("init failed: {e}"));
                return;
            }
            let needs_first = {
                let mut inner = coordinator.inner.lock();
                if inner.state != CheckpointState::Initializing {
                    return;
                }
                inner.state = CheckpointState::Ready;
                !inner.has_first
            };
            info!(task_id = %coordinator.task_id, "Checkpoints ready");
            if needs_first {
                coordinator.save_now().await;
            }
        });
    }

    /// Save a checkpoint in the background. Never blocks the caller and
    /// never fails it; a failed save disables checkpoints.
    pub fn save(&self) {
        if self.breaker.is_open() || self.state() == CheckpointState::Uninitialized {
            return;
        }
        let coordinator = self.clone();
        let job = self.track();
        tokio::spawn(async move {
            let _job = job;
            coordinator.save_now().await;
        });
    }

    /// Count a background job until the returned guard drops
    fn track(&self) -> Job {
        self.inner.lock().in_flight += 1;
        Job {
            inner: self.inner.clone(),
            idle: self.idle.clone(),
        }
    }

    /// Wait for running init and save jobs, so their events are queued.
    /// A job still running after the init timeout disables checkpoints.
    pub async fn settle(&self) {
        let deadline = tokio::time::Instant::now() + self.init_timeout;
        loop {
            let notified = self.idle.notified();
            if self.inner.lock().in_flight == 0 {
                return;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                self.disable("timed out waiting for a checkpoint job");
                return;
            }
        }
    }

    async fn save_now(&self) {
        let Some(service) = self.ready_service().await else {
            return;
        };
        let label = format!(
            "Task: {}, Time: {}",
            self.task_id,
            chrono::Utc::now().timestamp_millis()
        );
        match service.save_checkpoint(&label).await {
            Ok(Some(to)) => {
                if self.breaker.is_open() {
                    return;
                }
                let (from, is_first) = {
                    let mut inner = self.inner.lock();
                    let is_first = !inner.has_first;
                    inner.has_first = true;
                    (inner.last.replace(to.clone()), is_first)
                };
                info!(task_id = %self.task_id, checkpoint = %to, "Checkpoint saved");
                let _ = self.events.send(CheckpointEvent::Saved { to, from, is_first });
            }
            Ok(None) => debug!(task_id = %self.task_id, "Nothing to checkpoint"),
            Err(e) => self.disable(&format!("save failed: {e}")),
        }
    }

    /// The service once ready. Waits up to the init timeout while
    /// initialization runs, and disables checkpoints if it takes longer.
    async fn ready_service(&self) -> Option<Arc<dyn CheckpointService>> {
        let deadline = tokio::time::Instant::now() + self.init_timeout;
        loop {
            if self.breaker.is_open() {
                return None;
            }
            {
                let inner = self.inner.lock();
                match inner.state {
                    CheckpointState::Ready => return inner.service.clone(),
                    CheckpointState::Uninitialized | CheckpointState::Disabled => return None,
                    CheckpointState::Initializing => {}
                }
            }
            if tokio::time::Instant::now() >= deadline {
                self.disable("timed out waiting for initialization");
                return None;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Diff the checkpoint `to` against `from`, or against the newest
    /// checkpoint recorded in `ui` before `ts` when `from` is `None`.
    pub async fn diff(
        &self,
        ts: i64,
        to: &str,
        from: Option<&str>,
        ui: &[UiMessage],
    ) -> Option<Vec<FileChange>> {
        let service = self.ready_service().await?;
        let implicit = previous_checkpoint(ui, ts);
        let from = from.map(str::to_string).or(implicit);
        match service.get_diff(from.as_deref(), to).await {
            Ok(changes) => Some(changes),
            Err(e) => {
                self.disable(&format!("diff failed: {e}"));
                None
            }
        }
    }

    /// Roll the workspace back to checkpoint `id`
    pub async fn restore(&self, id: &str) -> bool {
        let Some(service) = self.ready_service().await else {
            return false;
        };
        match service.restore_checkpoint(id).await {
            Ok(()) => {
                self.inner.lock().last = Some(id.to_string());
                info!(task_id = %self.task_id, checkpoint = id, "Checkpoint restored");
                true
            }
            Err(e) => {
                self.disable(&format!("restore failed: {e}"));
                false
            }
        }
    }

    /// Switch off for good. Notifies only on the transition.
    pub fn disable(&self, reason: &str) {
        if self.breaker.trip(reason) {
            let mut inner = self.inner.lock();
            inner.state = CheckpointState::Disabled;
            inner.service = None;
            drop(inner);
            let _ = self.events.send(CheckpointEvent::Disabled);
        }
    }

    /// Release the service
    pub fn dispose(&self) {
        self.inner.lock().service = None;
    }
}

struct Job {
    inner: Arc<Mutex<Inner>>,
    idle: Arc<Notify>,
}

impl Drop for Job {
    fn drop(&mut self) {
        let mut inner = self.inner.lock();
        inner.in_flight = inner.in_flight.saturating_sub(1);
        let idle = inner.in_flight == 0;
        drop(inner);
        if idle {
            self.idle.notify_waiters();
        }
    }
}

/// The newest `checkpoint_saved` marker strictly older than `ts`
pub fn previous_checkpoint(ui: &[UiMessage], ts: i64) -> Option<String> {
    ui.iter()
        .rev()
        .filter(|m| m.ts < ts && m.is_say(SayKind::CheckpointSaved))
        .find_map(|m| m.checkpoint.as_ref().map(|c| c.to.clone()))
}

/// What survives restoring to the UI entry at `ts`
pub struct RestoreCut {
    pub history: Vec<Message>,
    pub ui: Vec<UiMessage>,
    /// Usage of the API requests that were cut away
    pub removed: ApiMetrics,
}

/// History before `ts`, and the UI log through the entry at `ts`.
/// `None` when no UI entry has that timestamp.
pub fn cut_for_restore(history: &[Message], ui: &[UiMessage], ts: i64) -> Option<RestoreCut> {
    let index = ui.iter().position(|m| m.ts == ts)?;
    let kept_history = history
        .iter()
        .filter(|m| m.ts.is_none_or(|t| t < ts))
        .cloned()
        .collect();
    Some(RestoreCut {
        history: kept_history,
        ui: ui[..=index].to_vec(),
        removed: ApiMetrics::from_ui_messages(&ui[index + 1..]),
    })
}
