//! A cloneable handle for poking a task from outside its loop.

use parking_lot::Mutex;
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// All fields are `Arc`-wrapped, so cloning is cheap.
///
/// The cancellation token belongs to the current run instance. A task that
/// reloads itself from history after a failed stream gets a fresh token
/// and instance id; a user abort is sticky across instances.
#[derive(Clone)]
pub struct TaskHandle {
    task_id: Arc<str>,
    parent_id: Option<Arc<str>>,
    instance_id: Arc<Mutex<String>>,
    cancel: Arc<Mutex<CancellationToken>>,
    aborted: Arc<AtomicBool>,
    abandoned: Arc<AtomicBool>,
    disposed: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
    resume_notify: Arc<Notify>,
    paused_mode: Arc<Mutex<Option<String>>>,
    resume_message: Arc<Mutex<Option<String>>>,
}

impl TaskHandle {
    pub(crate) fn new(task_id: impl Into<String>, parent_id: Option<String>) -> Self {
        Self {
            task_id: Arc::from(task_id.into()),
            parent_id: parent_id.map(Arc::from),
            instance_id: Arc::new(Mutex::new(new_instance_id())),
            cancel: Arc::new(Mutex::new(CancellationToken::new())),
            aborted: Arc::new(AtomicBool::new(false)),
            abandoned: Arc::new(AtomicBool::new(false)),
            disposed: Arc::new(AtomicBool::new(false)),
            paused: Arc::new(AtomicBool::new(false)),
            resume_notify: Arc::new(Notify::new()),
            paused_mode: Arc::new(Mutex::new(None)),
            resume_message: Arc::new(Mutex::new(None)),
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.parent_id.as_deref()
    }

    pub fn instance_id(&self) -> String {
        self.instance_id.lock().clone()
    }

    /// Abort the task. Idempotent; the loop notices at its next suspension point.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
        self.cancel.lock().cancel();
        self.resume_notify.notify_waiters();
    }

    /// Abort because the task handed its result to its parent
    pub(crate) fn abandon(&self) {
        self.abandoned.store(true, Ordering::Release);
        self.abort();
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    pub fn is_abandoned(&self) -> bool {
        self.abandoned.load(Ordering::Acquire)
    }

    /// Token for the current instance; cancelled on abort
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.lock().clone()
    }

    /// Cancel only the current instance, leaving the task resumable
    pub(crate) fn cancel_instance(&self) {
        self.cancel.lock().cancel();
    }

    /// Start a fresh instance. Fails if the task was aborted.
    pub(crate) fn new_instance(&self) -> Result<String> {
        if self.is_aborted() {
            return Err(Error::Aborted);
        }
        *self.cancel.lock() = CancellationToken::new();
        let id = new_instance_id();
        *self.instance_id.lock() = id.clone();
        Ok(id)
    }

    /// Returns `true` exactly once, for whoever disposes the task
    pub(crate) fn mark_disposed(&self) -> bool {
        !self.disposed.swap(true, Ordering::AcqRel)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Pause, remembering the mode to return to
    pub(crate) fn pause(&self, mode: String) {
        *self.paused_mode.lock() = Some(mode);
        self.paused.store(true, Ordering::Release);
    }

    /// Clear the pause and hand over a child's result
    pub(crate) fn resume_with(&self, result: impl Into<String>) {
        *self.resume_message.lock() = Some(result.into());
        self.paused.store(false, Ordering::Release);
        self.resume_notify.notify_waiters();
    }

    pub(crate) fn take_resume_message(&self) -> Option<String> {
        self.resume_message.lock().take()
    }

    pub(crate) fn take_paused_mode(&self) -> Option<String> {
        self.paused_mode.lock().take()
    }

    /// Wait until the pause clears.
    ///
    /// Polls at `interval` and also wakes on resume, so a resume is seen
    /// within one interval. Only an abort ends the wait early.
    pub async fn wait_for_resume(&self, interval: Duration) -> Result<()> {
        let token = self.cancel_token();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            let notified = self.resume_notify.notified();
            if self.is_aborted() || token.is_cancelled() {
                return Err(Error::Aborted);
            }
            if !self.is_paused() {
                return Ok(());
            }
            tokio::select! {
                _ = token.cancelled() => return Err(Error::Aborted),
                _ = notified => {}
                _ = ticker.tick() => {}
            }
        }
    }
}

fn new_instance_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_resume_sees_resume() {
        let handle = TaskHandle::new("t", None);
        handle.pause("code".into());
        let waiter = handle.clone();
        let join = tokio::spawn(async move {
            waiter.wait_for_resume(Duration::from_secs(1)).await
        });
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(!join.is_finished());
        handle.resume_with("done");
        assert!(join.await.unwrap().is_ok());
        assert_eq!(handle.take_resume_message().as_deref(), Some("done"));
        assert_eq!(handle.take_paused_mode().as_deref(), Some("code"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_resume_cancelled_by_abort() {
        let handle = TaskHandle::new("t", None);
        handle.pause("code".into());
        let waiter = handle.clone();
        let join = tokio::spawn(async move {
            waiter.wait_for_resume(Duration::from_secs(1)).await
        });
        tokio::task::yield_now().await;
        handle.abort();
        assert!(matches!(join.await.unwrap(), Err(Error::Aborted)));
    }

    #[test]
    fn test_new_instance_after_cancel() {
        let handle = TaskHandle::new("t", None);
        let first = handle.instance_id();
        handle.cancel_instance();
        assert!(handle.cancel_token().is_cancelled());
        let second = handle.new_instance().unwrap();
        assert_ne!(first, second);
        assert!(!handle.cancel_token().is_cancelled());

        handle.abort();
        assert!(handle.new_instance().is_err());
        assert!(handle.mark_disposed());
        assert!(!handle.mark_disposed());
    }
}
