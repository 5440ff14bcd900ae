//! Persistence for the two per-task documents
//!
//! Each task keeps a model-facing history and a UI message log. Both are
//! rewritten whole on every save.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use parking_lot::Mutex;
use strand_ai::Message;

use crate::{
    error::{Error, Result},
    ui::UiMessage,
};

pub const HISTORY_FILE: &str = "api_conversation_history.json";
pub const UI_MESSAGES_FILE: &str = "ui_messages.json";

/// Where task documents live
#[async_trait]
pub trait Storage: Send + Sync {
    /// `None` when the task has no saved history
    async fn load_history(&self, task_id: &str) -> Result<Option<Vec<Message>>>;

    async fn save_history(&self, task_id: &str, history: &[Message]) -> Result<()>;

    async fn load_ui_messages(&self, task_id: &str) -> Result<Option<Vec<UiMessage>>>;

    async fn save_ui_messages(&self, task_id: &str, messages: &[UiMessage]) -> Result<()>;

    /// Ids of every stored task
    async fn list_tasks(&self) -> Result<Vec<String>>;
}

/// JSON files under `<root>/<task_id>/`
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn task_dir(&self, task_id: &str) -> PathBuf {
        self.root.join(task_id)
    }

    async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write to a sibling temp file, then rename over the target.
    async fn write_json<T: serde::Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
        let parent = path
            .parent()
            .ok_or_else(|| Error::Storage(format!("no parent for {}", path.display())))?;
        tokio::fs::create_dir_all(parent).await?;
        let json = serde_json::to_string(value)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn load_history(&self, task_id: &str) -> Result<Option<Vec<Message>>> {
        Self::read_json(&self.task_dir(task_id).join(HISTORY_FILE)).await
    }

    async fn save_history(&self, task_id: &str, history: &[Message]) -> Result<()> {
        Self::write_json(&self.task_dir(task_id).join(HISTORY_FILE), history).await
    }

    async fn load_ui_messages(&self, task_id: &str) -> Result<Option<Vec<UiMessage>>> {
        Self::read_json(&self.task_dir(task_id).join(UI_MESSAGES_FILE)).await
    }

    async fn save_ui_messages(&self, task_id: &str, messages: &[UiMessage]) -> Result<()> {
        Self::write_json(&self.task_dir(task_id).join(UI_MESSAGES_FILE), messages).await
    }

    async fn list_tasks(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.path().join(HISTORY_FILE).exists() {
                ids.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        ids.sort();
        Ok(ids)
    }
}

/// In-process storage for tests and ephemeral runs
#[derive(Default)]
pub struct MemoryStorage {
    histories: Mutex<HashMap<String, Vec<Message>>>,
    ui_messages: Mutex<HashMap<String, Vec<UiMessage>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn load_history(&self, task_id: &str) -> Result<Option<Vec<Message>>> {
        Ok(self.histories.lock().get(task_id).cloned())
    }

    async fn save_history(&self, task_id: &str, history: &[Message]) -> Result<()> {
        self.histories
            .lock()
            .insert(task_id.to_string(), history.to_vec());
        Ok(())
    }

    async fn load_ui_messages(&self, task_id: &str) -> Result<Option<Vec<UiMessage>>> {
        Ok(self.ui_messages.lock().get(task_id).cloned())
    }

    async fn save_ui_messages(&self, task_id: &str, messages: &[UiMessage]) -> Result<()> {
        self.ui_messages
            .lock()
            .insert(task_id.to_string(), messages.to_vec());
        Ok(())
    }

    async fn list_tasks(&self) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self.histories.lock().keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}
