//! Ask/say plumbing between a task and whoever is watching it

use std::sync::Arc;

use async_trait::async_trait;
use strand_ai::Image;
use tokio::sync::broadcast;

use crate::{
    conversation::ConversationStore,
    error::{Error, Result},
    events::TaskEvent,
    handle::TaskHandle,
    ui::{AskKind, AskResponse, SayKind, UiKind, UiMessage},
};

/// The user side of an ask: shows the prompt, waits for an answer
#[async_trait]
pub trait UserChannel: Send + Sync {
    async fn ask(&self, task_id: &str, message: &UiMessage) -> AskResponse;
}

/// Posts UI messages for one task.
///
/// Every message lands in the UI log and goes out as a [`TaskEvent`]. A
/// partial message updates the last log entry when that entry is a partial
/// of the same kind; the next non-partial message of that kind completes it.
#[derive(Clone)]
pub struct Messenger {
    task_id: String,
    store: Arc<ConversationStore>,
    channel: Arc<dyn UserChannel>,
    events: broadcast::Sender<TaskEvent>,
    handle: TaskHandle,
}

impl Messenger {
    pub fn new(
        store: Arc<ConversationStore>,
        channel: Arc<dyn UserChannel>,
        events: broadcast::Sender<TaskEvent>,
        handle: TaskHandle,
    ) -> Self {
        Self {
            task_id: store.task_id().to_string(),
            store,
            channel,
            events,
            handle,
        }
    }

    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    pub async fn say(&self, kind: SayKind, text: impl Into<String>) -> Result<()> {
        self.post(UiKind::Say { say: kind }, Some(text.into()), Vec::new(), false)
            .await
            .map(|_| ())
    }

    pub async fn say_partial(&self, kind: SayKind, text: impl Into<String>) -> Result<()> {
        self.post(UiKind::Say { say: kind }, Some(text.into()), Vec::new(), true)
            .await
            .map(|_| ())
    }

    pub async fn say_with_images(
        &self,
        kind: SayKind,
        text: impl Into<String>,
        images: Vec<Image>,
    ) -> Result<()> {
        self.post(UiKind::Say { say: kind }, Some(text.into()), images, false)
            .await
            .map(|_| ())
    }

    /// Append a prepared message as-is, never merging it with a partial
    pub async fn say_message(&self, message: UiMessage) -> Result<UiMessage> {
        self.ensure_running()?;
        let message = self.store.add_ui_message(message).await?;
        self.emit_added(&message);
        Ok(message)
    }

    /// Ask the user and wait for the answer.
    ///
    /// A partial ask only updates the log and returns
    /// [`AskResponse::ignored`] immediately.
    pub async fn ask(
        &self,
        kind: AskKind,
        text: impl Into<String>,
        partial: bool,
    ) -> Result<AskResponse> {
        let message = self
            .post(UiKind::Ask { ask: kind }, Some(text.into()), Vec::new(), partial)
            .await?;
        if partial {
            return Ok(AskResponse::ignored());
        }

        let token = self.handle.cancel_token();
        tokio::select! {
            _ = token.cancelled() => Err(Error::Aborted),
            response = self.channel.ask(&self.task_id, &message) => {
                self.ensure_running()?;
                Ok(response)
            }
        }
    }

    /// Replace an existing entry (matched by timestamp) and persist the log
    pub async fn update(&self, message: UiMessage) -> Result<()> {
        if self.store.replace_ui_message(message.clone()) {
            self.store.save_ui().await?;
            self.emit_updated(&message);
        }
        Ok(())
    }

    /// Finish the last entry if it is still partial
    pub async fn complete_partial(&self) -> Result<()> {
        if let Some(mut last) = self.store.last_ui_message().filter(|m| m.partial) {
            last.partial = false;
            self.update(last).await?;
        }
        Ok(())
    }

    fn ensure_running(&self) -> Result<()> {
        if self.handle.is_aborted() {
            Err(Error::Aborted)
        } else {
            Ok(())
        }
    }

    async fn post(
        &self,
        kind: UiKind,
        text: Option<String>,
        images: Vec<Image>,
        partial: bool,
    ) -> Result<UiMessage> {
        self.ensure_running()?;

        let last = self
            .store
            .last_ui_message()
            .filter(|m| m.partial && m.kind == kind);

        if let Some(mut existing) = last {
            existing.text = text;
            existing.images = images;
            existing.partial = partial;
            self.store.replace_ui_message(existing.clone());
            if !partial {
                self.store.save_ui().await?;
            }
            self.emit_updated(&existing);
            return Ok(existing);
        }

        let mut message = match kind {
            UiKind::Say { say } => UiMessage::say(say, text),
            UiKind::Ask { ask } => UiMessage::ask(ask, text),
        };
        message.images = images;
        message.partial = partial;
        let message = self.store.add_ui_message(message).await?;
        self.emit_added(&message);
        Ok(message)
    }

    fn emit_added(&self, message: &UiMessage) {
        let _ = self.events.send(TaskEvent::MessageAdded {
            task_id: self.task_id.clone(),
            message: message.clone(),
        });
    }

    fn emit_updated(&self, message: &UiMessage) {
        let _ = self.events.send(TaskEvent::MessageUpdated {
            task_id: self.task_id.clone(),
            message: message.clone(),
        });
    }
}
