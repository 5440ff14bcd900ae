//! Conversation state: model-facing history, UI log and derived usage.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use strand_ai::Message;
use tracing::warn;

use crate::{
    error::Result,
    storage::Storage,
    ui::{ApiReqInfo, UiMessage},
};

/// Token and cost totals derived from the UI log
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiMetrics {
    pub total_tokens_in: u64,
    pub total_tokens_out: u64,
    pub total_cache_writes: u64,
    pub total_cache_reads: u64,
    pub total_cost: f64,
    /// Tokens counted by the most recent request that reported usage
    pub context_tokens: u64,
}

impl ApiMetrics {
    /// Recompute from every `api_req_started` entry in `messages`
    pub fn from_ui_messages(messages: &[UiMessage]) -> Self {
        let mut metrics = Self::default();
        let mut last: Option<ApiReqInfo> = None;
        for info in messages.iter().filter_map(UiMessage::api_req_info) {
            metrics.total_tokens_in += info.tokens_in.unwrap_or(0);
            metrics.total_tokens_out += info.tokens_out.unwrap_or(0);
            metrics.total_cache_writes += info.cache_writes.unwrap_or(0);
            metrics.total_cache_reads += info.cache_reads.unwrap_or(0);
            metrics.total_cost += info.cost.unwrap_or(0.0);
            if info.tokens_in.is_some() || info.tokens_out.is_some() {
                last = Some(info);
            }
        }
        metrics.context_tokens = last.map(|i| i.total_tokens()).unwrap_or(0);
        metrics
    }
}

#[derive(Default)]
struct Inner {
    history: Vec<Message>,
    ui: Vec<UiMessage>,
    last_ts: i64,
}

/// Owns a task's history and UI log and writes them through `Storage`.
///
/// Only the owning task mutates it; the mutex provides interior mutability
/// for the task's own concurrent reader and presenter.
pub struct ConversationStore {
    task_id: String,
    storage: Arc<dyn Storage>,
    inner: Mutex<Inner>,
    save_lock: tokio::sync::Mutex<()>,
}

impl ConversationStore {
    /// An empty store for a new task
    pub fn new(task_id: impl Into<String>, storage: Arc<dyn Storage>) -> Self {
        Self {
            task_id: task_id.into(),
            storage,
            inner: Mutex::new(Inner::default()),
            save_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Load both documents, falling back to empty on a read error
    pub async fn load(task_id: impl Into<String>, storage: Arc<dyn Storage>) -> Self {
        let store = Self::new(task_id, storage);
        let history = match store.storage.load_history(&store.task_id).await {
            Ok(history) => history.unwrap_or_default(),
            Err(e) => {
                warn!(task_id = %store.task_id, "Failed to load history, starting empty: {}", e);
                Vec::new()
            }
        };
        let ui = match store.storage.load_ui_messages(&store.task_id).await {
            Ok(ui) => ui.unwrap_or_default(),
            Err(e) => {
                warn!(
                    task_id = %store.task_id,
                    "Failed to load UI messages, starting empty: {}", e
                );
                Vec::new()
            }
        };
        {
            let mut inner = store.inner.lock();
            inner.last_ts = ui.iter().map(|m| m.ts).max().unwrap_or(0);
            inner.history = history;
            inner.ui = ui;
        }
        store
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn history(&self) -> Vec<Message> {
        self.inner.lock().history.clone()
    }

    pub fn ui_messages(&self) -> Vec<UiMessage> {
        self.inner.lock().ui.clone()
    }

    pub fn last_ui_message(&self) -> Option<UiMessage> {
        self.inner.lock().ui.last().cloned()
    }

    pub fn is_empty(&self) -> bool {
        let inner = self.inner.lock();
        inner.history.is_empty() && inner.ui.is_empty()
    }

    /// A timestamp strictly greater than any handed out before
    pub fn next_ts(&self) -> i64 {
        let mut inner = self.inner.lock();
        let ts = chrono::Utc::now().timestamp_millis().max(inner.last_ts + 1);
        inner.last_ts = ts;
        ts
    }

    pub async fn add_to_history(&self, mut message: Message) -> Result<()> {
        if message.ts.is_none() {
            message.ts = Some(chrono::Utc::now().timestamp_millis());
        }
        self.inner.lock().history.push(message);
        self.save_history().await
    }

    pub async fn overwrite_history(&self, history: Vec<Message>) -> Result<()> {
        self.inner.lock().history = history;
        self.save_history().await
    }

    /// Append a UI message, assigning its timestamp
    pub async fn add_ui_message(&self, mut message: UiMessage) -> Result<UiMessage> {
        message.ts = self.next_ts();
        self.inner.lock().ui.push(message.clone());
        self.save_ui().await?;
        Ok(message)
    }

    pub async fn overwrite_ui_messages(&self, messages: Vec<UiMessage>) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            let max_ts = messages.iter().map(|m| m.ts).max().unwrap_or(0);
            inner.last_ts = inner.last_ts.max(max_ts);
            inner.ui = messages;
        }
        self.save_ui().await
    }

    /// Replace the UI message with the same timestamp. Not persisted;
    /// call `save_ui` when the change should survive a crash.
    pub fn replace_ui_message(&self, message: UiMessage) -> bool {
        let mut inner = self.inner.lock();
        match inner.ui.iter_mut().rev().find(|m| m.ts == message.ts) {
            Some(slot) => {
                *slot = message;
                true
            }
            None => false,
        }
    }

    /// Usage totals, recomputed from the log on every call
    pub fn token_usage(&self) -> ApiMetrics {
        ApiMetrics::from_ui_messages(&self.inner.lock().ui)
    }

    pub async fn save_history(&self) -> Result<()> {
        let _guard = self.save_lock.lock().await;
        let snapshot = self.inner.lock().history.clone();
        self.storage.save_history(&self.task_id, &snapshot).await
    }

    pub async fn save_ui(&self) -> Result<()> {
        let _guard = self.save_lock.lock().await;
        let snapshot = self.inner.lock().ui.clone();
        self.storage.save_ui_messages(&self.task_id, &snapshot).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{storage::MemoryStorage, ui::SayKind};
    use strand_ai::Usage;

    fn api_req(tokens_in: u64, tokens_out: u64, cost: f64) -> UiMessage {
        let info = ApiReqInfo::default().with_usage(
            &Usage {
                input: tokens_in,
                output: tokens_out,
                ..Default::default()
            },
            cost,
        );
        UiMessage::say(SayKind::ApiReqStarted, Some(serde_json::to_string(&info).unwrap()))
    }

    #[test]
    fn test_metrics_sum_and_context_tokens() {
        let messages = vec![
            api_req(10, 5, 0.1),
            UiMessage::say(SayKind::Text, Some("hi".into())),
            api_req(20, 7, 0.2),
            UiMessage::say(SayKind::ApiReqStarted, Some("{}".into())),
        ];
        let metrics = ApiMetrics::from_ui_messages(&messages);
        assert_eq!(metrics.total_tokens_in, 30);
        assert_eq!(metrics.total_tokens_out, 12);
        assert!((metrics.total_cost - 0.3).abs() < 1e-9);
        assert_eq!(metrics.context_tokens, 27);
    }

    #[tokio::test]
    async fn test_store_persists_and_reloads() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let store = ConversationStore::new("t", storage.clone());
        store.add_to_history(Message::user("task")).await.unwrap();
        store.add_ui_message(api_req(1, 2, 0.0)).await.unwrap();

        let reloaded = ConversationStore::load("t", storage).await;
        assert_eq!(reloaded.history().len(), 1);
        assert_eq!(reloaded.token_usage().total_tokens_out, 2);
    }

    #[tokio::test]
    async fn test_timestamps_are_strictly_increasing() {
        let store = ConversationStore::new("t", Arc::new(MemoryStorage::new()));
        let a = store.add_ui_message(UiMessage::say(SayKind::Text, None)).await.unwrap();
        let b = store.add_ui_message(UiMessage::say(SayKind::Text, None)).await.unwrap();
        assert!(b.ts > a.ts);
    }

    #[tokio::test]
    async fn test_replace_ui_message_by_ts() {
        let store = ConversationStore::new("t", Arc::new(MemoryStorage::new()));
        let mut msg = store
            .add_ui_message(UiMessage::say(SayKind::Text, Some("a".into())))
            .await
            .unwrap();
        msg.text = Some("b".into());
        assert!(store.replace_ui_message(msg));
        assert_eq!(store.last_ui_message().unwrap().text.as_deref(), Some("b"));
    }
}
