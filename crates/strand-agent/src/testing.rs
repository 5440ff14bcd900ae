//! Mocks shared by the unit tests

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
};

use async_trait::async_trait;
use parking_lot::Mutex;
use strand_ai::{ApiChunk, ApiHandler, ApiStream, Message, ModelInfo};
use tokio::sync::broadcast;

use crate::{
    conversation::ConversationStore,
    handle::TaskHandle,
    messenger::{Messenger, UserChannel},
    storage::MemoryStorage,
    ui::{AskResponse, UiMessage},
};

/// One scripted provider response
pub(crate) enum Script {
    Chunks(Vec<ApiChunk>),
    /// `create_message` succeeds but the first element fails
    FailFirst(strand_ai::Error),
    /// Yields the chunks, then fails mid-stream
    FailAfter(Vec<ApiChunk>, String),
    /// Yields the chunks, then never ends
    Stall(Vec<ApiChunk>),
}

/// Replays scripts in order; once they run out every call answers with
/// an `attempt_completion`.
pub(crate) struct MockApi {
    scripts: Mutex<VecDeque<Script>>,
    pub calls: AtomicU32,
    pub histories: Mutex<Vec<Vec<Message>>>,
    model: ModelInfo,
}

impl MockApi {
    pub(crate) fn new(scripts: impl IntoIterator<Item = Script>) -> Self {
        Self::with_model(scripts, ModelInfo::new("mock", 128_000))
    }

    pub(crate) fn with_model(scripts: impl IntoIterator<Item = Script>, model: ModelInfo) -> Self {
        Self {
            scripts: Mutex::new(scripts.into_iter().collect()),
            calls: AtomicU32::new(0),
            histories: Mutex::new(Vec::new()),
            model,
        }
    }
}

pub(crate) const DONE: &str = "<attempt_completion><result>done</result></attempt_completion>";

#[async_trait]
impl ApiHandler for MockApi {
    async fn create_message(
        &self,
        _system_prompt: &str,
        history: &[Message],
    ) -> strand_ai::Result<ApiStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.histories.lock().push(history.to_vec());
        let script = self
            .scripts
            .lock()
            .pop_front()
            .unwrap_or_else(|| Script::Chunks(vec![ApiChunk::text(DONE)]));

        let stream: ApiStream = match script {
            Script::Chunks(chunks) => Box::pin(async_stream::stream! {
                for chunk in chunks {
                    yield Ok::<_, strand_ai::Error>(chunk);
                }
            }),
            Script::FailFirst(error) => Box::pin(async_stream::stream! {
                yield Err::<ApiChunk, _>(error);
            }),
            Script::FailAfter(chunks, message) => Box::pin(async_stream::stream! {
                for chunk in chunks {
                    yield Ok::<_, strand_ai::Error>(chunk);
                }
                yield Err::<ApiChunk, _>(strand_ai::Error::Sse(message));
            }),
            Script::Stall(chunks) => Box::pin(async_stream::stream! {
                for chunk in chunks {
                    yield Ok::<_, strand_ai::Error>(chunk);
                }
                futures::future::pending::<()>().await;
            }),
        };
        Ok(stream)
    }

    fn model(&self) -> &ModelInfo {
        &self.model
    }
}

/// Answers asks from a queue, then with "yes"
#[derive(Default)]
pub(crate) struct ScriptedChannel {
    pub answers: Mutex<VecDeque<AskResponse>>,
    pub asked: Mutex<Vec<UiMessage>>,
}

impl ScriptedChannel {
    pub(crate) fn new(answers: impl IntoIterator<Item = AskResponse>) -> Self {
        Self {
            answers: Mutex::new(answers.into_iter().collect()),
            asked: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl UserChannel for ScriptedChannel {
    async fn ask(&self, _task_id: &str, message: &UiMessage) -> AskResponse {
        self.asked.lock().push(message.clone());
        self.answers.lock().pop_front().unwrap_or_else(AskResponse::yes)
    }
}

pub(crate) fn test_messenger(channel: Arc<dyn UserChannel>) -> (Messenger, TaskHandle) {
    let store = Arc::new(ConversationStore::new("t", Arc::new(MemoryStorage::new())));
    let (tx, _) = broadcast::channel(256);
    let handle = TaskHandle::new("t", None);
    (Messenger::new(store, channel, tx, handle.clone()), handle)
}
