//! Task lifecycle and the turn loop
//!
//! A turn sends the pending user content, streams the reply while a
//! presenter shows text and runs tools, then folds the tool results into
//! the next turn's input. The loop ends when the model completes the
//! task, the user aborts, or a child hands its result back to its parent.

use std::{
    collections::HashSet,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
};

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use strand_ai::{
    ApiChunk, ApiHandler, ApiStream, ContentBlock, Image, Message, ToolResultContent, Usage,
};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, instrument, warn};

use crate::{
    checkpoint::{
        self, CheckpointCoordinator, CheckpointEvent, CheckpointServiceFactory, FileChange,
    },
    config::TaskConfig,
    context_window,
    conversation::ConversationStore,
    dispatcher::{Dispatcher, PresentationQueue, SharedBlocks, TurnFlags, TurnState},
    error::{Error, Result},
    events::TaskEvent,
    handle::TaskHandle,
    messenger::{Messenger, UserChannel},
    modes, parser,
    registry::TaskRegistry,
    responses,
    retry::{RateLimiter, RetryController, RetryPolicy},
    storage::Storage,
    tool::Tool,
    tools,
    ui::{ApiReqInfo, AskKind, AskResponseKind, CancelReason, CheckpointMarker, SayKind, UiMessage},
};

const EMPTY_RESPONSE_NOTICE: &str = "Unexpected API Response: The language model did not provide any assistant messages. This may indicate an issue with the API or the model's output.";
const CHECKPOINTS_DISABLED_NOTICE: &str = "Checkpoints are disabled for this task after a failure. The task continues without them.";

/// Per-task sessions held outside the engine, such as terminals or an
/// open diff editor
#[async_trait]
pub trait TaskResources: Send + Sync {
    /// Release everything held for `task_id`
    async fn release(&self, task_id: &str);

    /// Revert an edit the user has not saved yet. Returns `true` if one
    /// was reverted.
    async fn revert_pending_edit(&self, _task_id: &str) -> bool {
        false
    }
}

/// Everything a task needs from its host. Children share their parent's.
#[derive(Clone)]
pub struct TaskEnvironment {
    pub api: Arc<dyn ApiHandler>,
    pub dispatcher: Arc<Dispatcher>,
    pub storage: Arc<dyn Storage>,
    pub channel: Arc<dyn UserChannel>,
    pub checkpoints: Option<Arc<dyn CheckpointServiceFactory>>,
    pub resources: Vec<Arc<dyn TaskResources>>,
    pub registry: TaskRegistry,
    pub config: TaskConfig,
    /// Base system prompt; the mode's role and tool list are added per turn
    pub system_prompt: String,
    pub cwd: PathBuf,
    pub events: broadcast::Sender<TaskEvent>,
    pub rate_limiter: Arc<RateLimiter>,
}

impl TaskEnvironment {
    /// An environment with only the built-in tools and default config
    pub fn new(
        api: Arc<dyn ApiHandler>,
        storage: Arc<dyn Storage>,
        channel: Arc<dyn UserChannel>,
    ) -> Self {
        let (events, _) = broadcast::channel(1024);
        let config = TaskConfig::default();
        let registry = TaskRegistry::new(events.clone());
        registry.set_mode(&config.mode);
        Self {
            api,
            dispatcher: Arc::new(Dispatcher::new(tools::built_in())),
            storage,
            channel,
            checkpoints: None,
            resources: Vec::new(),
            registry,
            config,
            system_prompt: String::new(),
            cwd: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            events,
            rate_limiter: Arc::new(RateLimiter::new()),
        }
    }

    /// Add tools on top of the built-in ones
    pub fn with_tools(mut self, extra: Vec<Arc<dyn Tool>>) -> Self {
        let mut all = tools::built_in();
        all.extend(extra);
        self.dispatcher = Arc::new(Dispatcher::new(all));
        self
    }

    pub fn with_config(mut self, config: TaskConfig) -> Self {
        self.registry.set_mode(&config.mode);
        self.config = config;
        self
    }

    pub fn with_checkpoints(mut self, factory: Arc<dyn CheckpointServiceFactory>) -> Self {
        self.checkpoints = Some(factory);
        self
    }

    pub fn with_resources(mut self, resources: Arc<dyn TaskResources>) -> Self {
        self.resources.push(resources);
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = cwd.into();
        self
    }

    /// Subscribe to events from every task in this environment
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }
}

/// How a task's loop ended
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// The model completed the task and the user accepted it
    Completed { result: Option<String> },
    Aborted,
    /// A child task handed its result to its parent
    Abandoned,
}

/// What to restore besides the workspace files
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreMode {
    FilesOnly,
    /// Also cut the conversation back to the checkpoint
    FilesAndTask,
}

/// State shared by a task's loop, its presenter and its tools
pub struct TaskContext {
    pub(crate) env: TaskEnvironment,
    pub(crate) handle: TaskHandle,
    pub(crate) messenger: Messenger,
    pub(crate) store: Arc<ConversationStore>,
    pub(crate) checkpoints: CheckpointCoordinator,
    mistakes: AtomicU32,
    children: Mutex<Vec<TaskHandle>>,
}

impl TaskContext {
    pub(crate) fn record_mistake(&self) -> u32 {
        self.mistakes.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn reset_mistakes(&self) {
        self.mistakes.store(0, Ordering::SeqCst);
    }

    fn mistakes(&self) -> u32 {
        self.mistakes.load(Ordering::SeqCst)
    }

    fn emit(&self, event: TaskEvent) {
        let _ = self.env.events.send(event);
    }

    /// Pause this task, switch to `mode` and start a child on `message`
    pub(crate) fn spawn_child(&self, mode: &str, message: &str) -> Result<String> {
        if self.handle.is_aborted() {
            return Err(Error::Aborted);
        }
        let task_id = self.handle.task_id().to_string();

        self.handle.pause(self.env.registry.mode());
        self.emit(TaskEvent::TaskPaused {
            task_id: task_id.clone(),
        });
        self.env.registry.set_mode(mode);

        let child = Task::new(self.env.clone(), Some(task_id.clone()));
        let child_id = child.id().to_string();
        self.children.lock().push(child.handle());
        self.emit(TaskEvent::TaskSpawned {
            parent_id: task_id,
            child_id: child_id.clone(),
        });

        let message = message.to_string();
        tokio::spawn(async move {
            match child.start(message, Vec::new()).await {
                Ok(outcome) => debug!(?outcome, "Sub-task ended"),
                Err(e) => warn!("Sub-task failed: {}", e),
            }
        });
        Ok(child_id)
    }

    /// Rewrite the payload of the `api_req_started` entry at `ts`
    async fn update_api_req(
        &self,
        ts: i64,
        update: impl FnOnce(ApiReqInfo) -> ApiReqInfo,
    ) -> Result<()> {
        let found = self.store.ui_messages().into_iter().rev().find(|m| m.ts == ts);
        let Some(mut message) = found else {
            return Ok(());
        };
        let info = update(message.api_req_info().unwrap_or_default());
        message.text = Some(serde_json::to_string(&info)?);
        self.messenger.update(message).await
    }

    /// Record an interrupted turn: revert unsaved edits, mark the request
    /// as cancelled and store what streamed so far plus `marker`.
    async fn abort_stream(&self, interrupted: Interrupted<'_>) -> Result<()> {
        let task_id = self.handle.task_id();
        for resources in &self.env.resources {
            if resources.revert_pending_edit(task_id).await {
                info!(task_id, "Reverted unsaved edit");
            }
        }

        let Interrupted {
            api_req_ts,
            reason,
            failure,
            mut blocks,
            marker,
            usage,
            cost,
        } = interrupted;
        self.update_api_req(api_req_ts, |info| ApiReqInfo {
            cancel_reason: Some(reason),
            streaming_failed_message: failure,
            ..info.with_usage(usage, cost)
        })
        .await?;
        self.messenger.complete_partial().await?;

        blocks.push(ContentBlock::text(marker));
        self.store.add_to_history(Message::assistant_blocks(blocks)).await
    }
}

struct Interrupted<'a> {
    api_req_ts: i64,
    reason: CancelReason,
    failure: Option<String>,
    blocks: Vec<ContentBlock>,
    marker: &'a str,
    usage: &'a Usage,
    cost: f64,
}

#[derive(Debug, Default)]
enum StreamEnd {
    #[default]
    Finished,
    InterruptedByRejection,
    InterruptedByToolUse,
    Cancelled,
    Failed(strand_ai::Error),
}

impl StreamEnd {
    /// Text appended to the stored assistant message
    fn marker(&self) -> Option<&'static str> {
        match self {
            StreamEnd::InterruptedByRejection => {
                Some(responses::INTERRUPTED_BY_FEEDBACK.trim_start())
            }
            StreamEnd::InterruptedByToolUse => {
                Some(responses::INTERRUPTED_BY_TOOL_USE.trim_start())
            }
            _ => None,
        }
    }
}

#[derive(Default)]
struct StreamRead {
    text: String,
    usage: Usage,
    end: StreamEnd,
}

/// Read the stream, re-parsing after every text chunk and requesting a
/// presentation pass. Stops early once the presenter has rejected or used
/// a tool, since nothing later in the message can run.
async fn read_stream(
    ctx: &TaskContext,
    mut stream: ApiStream,
    blocks: &SharedBlocks,
    queue: PresentationQueue,
    flags: &TurnFlags,
    id_prefix: &str,
) -> StreamRead {
    let token = ctx.handle.cancel_token();
    let vocabulary = ctx.env.dispatcher.vocabulary();
    let mut read = StreamRead::default();
    let mut reasoning = String::new();

    loop {
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => {
                read.end = StreamEnd::Cancelled;
                break;
            }
            next = stream.next() => next,
        };
        match next {
            None => break,
            Some(Err(e)) => {
                warn!(task_id = ctx.handle.task_id(), "Stream failed mid-response: {}", e);
                // Unblocks a presenter waiting on the user
                ctx.handle.cancel_instance();
                read.end = StreamEnd::Failed(e);
                break;
            }
            Some(Ok(ApiChunk::Usage(usage))) => read.usage.accumulate(&usage),
            Some(Ok(ApiChunk::Reasoning { text })) => {
                reasoning.push_str(&text);
                let shown = ctx.messenger.say_partial(SayKind::Reasoning, reasoning.clone()).await;
                if let Err(e) = shown {
                    debug!(task_id = ctx.handle.task_id(), "Failed to show reasoning: {}", e);
                }
            }
            Some(Ok(ApiChunk::Text { text })) => {
                if !reasoning.is_empty() {
                    let shown = ctx
                        .messenger
                        .say(SayKind::Reasoning, std::mem::take(&mut reasoning))
                        .await;
                    if let Err(e) = shown {
                        debug!(task_id = ctx.handle.task_id(), "Failed to show reasoning: {}", e);
                    }
                }
                read.text.push_str(&text);
                let parsed = parser::parse_assistant_message(&read.text, vocabulary, id_prefix);
                *blocks.lock() = parsed;
                queue.request();
            }
        }

        if flags.rejected() {
            read.end = StreamEnd::InterruptedByRejection;
            break;
        }
        if flags.tool_used() {
            read.end = StreamEnd::InterruptedByToolUse;
            break;
        }
    }

    parser::complete_all(&mut blocks.lock());
    queue.request();
    read
}

/// One line per block, for the `api_req_started` payload
fn format_request(content: &[ContentBlock]) -> String {
    content
        .iter()
        .map(|block| match block {
            ContentBlock::Text { text, .. } => text.clone(),
            ContentBlock::Image(_) => "[Image]".to_string(),
            ContentBlock::ToolUse { name, params, .. } => {
                strand_ai::providers::render_tool_use(name, params)
            }
            ContentBlock::ToolResult { content, is_error, .. } => {
                let body: Vec<&str> = content
                    .iter()
                    .map(|c| match c {
                        ToolResultContent::Text { text } => text.as_str(),
                        ToolResultContent::Image(_) => "[Image]",
                    })
                    .collect();
                let label = if *is_error { "[Tool (Error)]" } else { "[Tool]" };
                format!("{label}\n{}", body.join("\n"))
            }
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn interrupted_result(id: &str) -> ContentBlock {
    ContentBlock::tool_result(id, responses::TOOL_INTERRUPTED_ON_RESUME, false)
}

enum TurnEnd {
    Continue(Vec<ContentBlock>),
    Completed(Option<String>),
}

enum Start {
    Fresh { task: String, images: Vec<Image> },
    Resume,
}

/// One task: its conversation, checkpoints and place in the task tree
pub struct Task {
    ctx: Arc<TaskContext>,
    checkpoint_events: mpsc::UnboundedReceiver<CheckpointEvent>,
}

impl Task {
    /// A fresh task, registered with the environment's registry
    pub fn new(env: TaskEnvironment, parent_id: Option<String>) -> Self {
        let task_id = uuid::Uuid::new_v4().to_string();
        let store = ConversationStore::new(task_id.clone(), env.storage.clone());
        Self::build(env, task_id, parent_id, store)
    }

    /// Load a saved task without running it
    pub async fn resume(env: TaskEnvironment, task_id: &str) -> Result<Self> {
        let store = ConversationStore::load(task_id, env.storage.clone()).await;
        if store.is_empty() {
            return Err(Error::Storage(format!("no saved task with id {task_id}")));
        }
        Ok(Self::build(env, task_id.to_string(), None, store))
    }

    fn build(
        env: TaskEnvironment,
        task_id: String,
        parent_id: Option<String>,
        store: ConversationStore,
    ) -> Self {
        let handle = TaskHandle::new(task_id.clone(), parent_id);
        let store = Arc::new(store);
        let messenger = Messenger::new(
            store.clone(),
            env.channel.clone(),
            env.events.clone(),
            handle.clone(),
        );
        let (checkpoints, checkpoint_events) = CheckpointCoordinator::new(&task_id, &env.config);
        env.registry.register(handle.clone());
        Self {
            ctx: Arc::new(TaskContext {
                env,
                handle,
                messenger,
                store,
                checkpoints,
                mistakes: AtomicU32::new(0),
                children: Mutex::new(Vec::new()),
            }),
            checkpoint_events,
        }
    }

    pub fn id(&self) -> &str {
        self.ctx.handle.task_id()
    }

    pub fn handle(&self) -> TaskHandle {
        self.ctx.handle.clone()
    }

    pub fn store(&self) -> Arc<ConversationStore> {
        self.ctx.store.clone()
    }

    /// Run a new task on `task` until it ends
    #[instrument(skip_all, fields(task_id = %self.ctx.handle.task_id()))]
    pub async fn start(
        mut self,
        task: impl Into<String>,
        images: Vec<Image>,
    ) -> Result<TaskOutcome> {
        info!("Task started");
        self.run_loop(Start::Fresh {
            task: task.into(),
            images,
        })
        .await
    }

    /// Ask the user to resume a loaded task, then run it until it ends
    #[instrument(skip_all, fields(task_id = %self.ctx.handle.task_id()))]
    pub async fn run_resumed(mut self) -> Result<TaskOutcome> {
        info!("Task resumed");
        self.run_loop(Start::Resume).await
    }

    async fn run_loop(&mut self, start: Start) -> Result<TaskOutcome> {
        let mut start = Some(start);
        let result = loop {
            self.ctx.emit(TaskEvent::TaskStarted {
                task_id: self.id().to_string(),
                instance_id: self.ctx.handle.instance_id(),
                parent_id: self.ctx.handle.parent_id().map(str::to_string),
            });

            let input = match start.take() {
                Some(Start::Fresh { task, images }) => self.announce(task, images).await,
                Some(Start::Resume) | None => self.prepare_resume().await,
            };
            let run = match input {
                Ok(input) => self.run_turns(input).await,
                Err(e) => Err(e),
            };

            match run {
                Ok(outcome) => break Ok(outcome),
                Err(Error::StreamInterrupted(message)) => {
                    warn!(task_id = self.id(), "Reloading task from history: {}", message);
                    if self.ctx.handle.new_instance().is_err() {
                        break Ok(self.stopped_outcome());
                    }
                }
                Err(e) if e.is_aborted() => break Ok(self.stopped_outcome()),
                Err(e) => break Err(e),
            }
        };
        self.finish(&result).await;
        result
    }

    fn stopped_outcome(&self) -> TaskOutcome {
        if self.ctx.handle.is_abandoned() {
            TaskOutcome::Abandoned
        } else {
            TaskOutcome::Aborted
        }
    }

    async fn finish(&mut self, result: &Result<TaskOutcome>) {
        let task_id = self.id().to_string();
        match result {
            Ok(TaskOutcome::Completed { .. }) | Ok(TaskOutcome::Abandoned) => {
                info!(task_id, "Task completed");
                self.ctx.emit(TaskEvent::TaskCompleted {
                    task_id,
                    usage: self.ctx.store.token_usage(),
                });
            }
            Ok(TaskOutcome::Aborted) => {
                info!(task_id, "Task aborted");
                self.ctx.emit(TaskEvent::TaskAborted { task_id });
            }
            Err(e) => {
                warn!(task_id, "Task failed: {}", e);
                self.ctx.emit(TaskEvent::TaskAborted { task_id });
            }
        }
        if let Err(e) = self.post_checkpoint_events().await {
            debug!(task_id = %self.id(), "Failed to post final checkpoint markers: {}", e);
        }
        self.dispose().await;
    }

    /// Tear down once: abort children, release resources, leave the
    /// registry. A child that did not hand back a result still resumes
    /// its parent.
    pub async fn dispose(&self) {
        let ctx = &self.ctx;
        if !ctx.handle.mark_disposed() {
            return;
        }
        let task_id = ctx.handle.task_id();
        debug!(task_id, "Disposing task");

        let children = std::mem::take(&mut *ctx.children.lock());
        for child in children {
            child.abort();
        }
        for resources in &ctx.env.resources {
            if resources.revert_pending_edit(task_id).await {
                info!(task_id, "Reverted unsaved edit");
            }
            resources.release(task_id).await;
        }
        ctx.checkpoints.dispose();

        if ctx.handle.parent_id().is_some() && !ctx.handle.is_abandoned() {
            ctx.env.registry.finish_subtask(&ctx.handle, responses::SUBTASK_CANCELLED);
        } else {
            ctx.env.registry.remove(task_id);
        }
    }

    async fn announce(&mut self, task: String, images: Vec<Image>) -> Result<Vec<ContentBlock>> {
        self.init_checkpoints();
        self.ctx
            .messenger
            .say_with_images(SayKind::Text, task.clone(), images.clone())
            .await?;
        let mut content = vec![ContentBlock::text(format!("<task>\n{task}\n</task>"))];
        content.extend(images.into_iter().map(ContentBlock::Image));
        Ok(content)
    }

    fn init_checkpoints(&self) {
        let Some(factory) = &self.ctx.env.checkpoints else {
            return;
        };
        let last = self
            .ctx
            .store
            .ui_messages()
            .iter()
            .rev()
            .find_map(|m| m.checkpoint.as_ref().map(|c| c.to.clone()));
        self.ctx.checkpoints.initialize(factory.as_ref(), &self.ctx.env.cwd, last);
    }

    /// Clean up the saved logs, ask the user to resume and build the input
    /// for the first resumed turn
    async fn prepare_resume(&mut self) -> Result<Vec<ContentBlock>> {
        let ctx = self.ctx.clone();

        let mut ui = ctx.store.ui_messages();
        let is_resume_ask =
            |m: &UiMessage| m.is_ask(AskKind::ResumeTask) || m.is_ask(AskKind::ResumeCompletedTask);
        while ui.last().is_some_and(is_resume_ask) {
            ui.pop();
        }
        while ui.last().is_some_and(|m| m.is_say(SayKind::Reasoning)) {
            ui.pop();
        }
        // A request that never finished nor was cancelled carries nothing
        if ui
            .last()
            .and_then(UiMessage::api_req_info)
            .is_some_and(|info| info.cost.is_none() && info.cancel_reason.is_none())
        {
            ui.pop();
        }
        ctx.store.overwrite_ui_messages(ui.clone()).await?;

        let now = chrono::Utc::now().timestamp_millis();
        let last = ui.last();
        let completed = last.is_some_and(|m| m.is_ask(AskKind::CompletionResult));
        let ago = responses::time_ago(now - last.map(|m| m.ts).unwrap_or(now));

        self.init_checkpoints();

        let kind = if completed {
            AskKind::ResumeCompletedTask
        } else {
            AskKind::ResumeTask
        };
        let response = ctx.messenger.ask(kind, "", false).await?;
        if response.response == AskResponseKind::No {
            ctx.handle.abort();
            return Err(Error::Aborted);
        }
        let feedback = response.feedback().map(str::to_string);
        if let Some(text) = &feedback {
            ctx.messenger
                .say_with_images(SayKind::UserFeedback, text.clone(), response.images.clone())
                .await?;
        }

        // Every invocation left without a result gets an "interrupted" one
        let mut history = ctx.store.history();
        let mut content = Vec::new();
        if history.last().is_some_and(Message::is_user) {
            if let Some(user) = history.pop() {
                let answered: HashSet<&str> = user.tool_result_ids().into_iter().collect();
                if let Some(previous) = history.last().filter(|m| m.is_assistant()) {
                    content.extend(
                        previous
                            .tool_use_ids()
                            .into_iter()
                            .filter(|id| !answered.contains(id))
                            .map(interrupted_result),
                    );
                }
                content.extend(user.blocks());
            }
            ctx.store.overwrite_history(history).await?;
        } else if let Some(previous) = history.last().filter(|m| m.is_assistant()) {
            content.extend(previous.tool_use_ids().into_iter().map(interrupted_result));
        }

        let cwd = ctx.env.cwd.display().to_string();
        let mut text = responses::task_resumption(&ago, completed, &cwd);
        if let Some(feedback) = &feedback {
            text.push_str(&responses::new_instructions(feedback));
        }
        content.push(ContentBlock::text(text));
        content.extend(response.images.into_iter().map(ContentBlock::Image));
        Ok(content)
    }

    async fn run_turns(&mut self, mut input: Vec<ContentBlock>) -> Result<TaskOutcome> {
        loop {
            if self.ctx.handle.is_aborted() {
                return Err(Error::Aborted);
            }
            match self.run_turn(input).await? {
                TurnEnd::Completed(result) => return Ok(TaskOutcome::Completed { result }),
                TurnEnd::Continue(next) => input = next,
            }
        }
    }

    async fn run_turn(&mut self, mut user_content: Vec<ContentBlock>) -> Result<TurnEnd> {
        self.post_checkpoint_events().await?;
        let ctx = self.ctx.clone();
        let task_id = ctx.handle.task_id();
        let config = &ctx.env.config;

        if config.mistake_limit > 0 && ctx.mistakes() >= config.mistake_limit {
            let response = ctx
                .messenger
                .ask(AskKind::MistakeLimitReached, responses::MISTAKE_LIMIT_GUIDANCE, false)
                .await?;
            if let Some(text) = response.feedback() {
                ctx.messenger
                    .say_with_images(SayKind::UserFeedback, text, response.images.clone())
                    .await?;
                user_content.push(ContentBlock::text(responses::too_many_mistakes(Some(text))));
                user_content.extend(response.images.iter().cloned().map(ContentBlock::Image));
            }
            ctx.reset_mistakes();
        }

        if ctx.handle.is_paused() {
            info!(task_id, "Waiting for sub-task");
            ctx.handle.wait_for_resume(config.resume_poll_interval()).await?;
        }
        if let Some(mode) = ctx.handle.take_paused_mode() {
            ctx.env.registry.set_mode(&mode);
            ctx.emit(TaskEvent::TaskUnpaused {
                task_id: task_id.to_string(),
            });
        }
        if let Some(result) = ctx.handle.take_resume_message() {
            ctx.messenger.say(SayKind::SubtaskResult, result.clone()).await?;
            user_content.push(ContentBlock::text(responses::subtask_completed(&result)));
        }

        let info = ApiReqInfo {
            request: Some(format_request(&user_content)),
            ..Default::default()
        };
        let started = UiMessage::say(SayKind::ApiReqStarted, Some(serde_json::to_string(&info)?));
        let api_req = ctx.messenger.say_message(started).await?;
        ctx.store.add_to_history(Message::user_blocks(user_content)).await?;

        let model = ctx.env.api.model();
        let history = ctx.store.history();
        let previous_total = ctx.store.token_usage().context_tokens;
        if let Some(truncated) = context_window::manage(&history, previous_total, model) {
            info!(
                task_id,
                removed = history.len() - truncated.len(),
                "Truncated conversation to fit the context window"
            );
            ctx.store.overwrite_history(truncated).await?;
        }

        let system_prompt = modes::system_prompt(
            &ctx.env.system_prompt,
            &ctx.env.registry.mode(),
            ctx.env.dispatcher.tools(),
        );
        let retry = RetryController {
            api: ctx.env.api.as_ref(),
            messenger: &ctx.messenger,
            handle: &ctx.handle,
            limiter: &ctx.env.rate_limiter,
            policy: RetryPolicy::from_config(config),
        };
        let stream = retry.attempt(&system_prompt, &ctx.store.history()).await?;

        let blocks: SharedBlocks = Mutex::new(Vec::new());
        let (queue, requests) = PresentationQueue::new();
        let mut turn = TurnState::new();
        let flags = turn.flags();
        let id_prefix = format!("call_{}", &uuid::Uuid::new_v4().simple().to_string()[..12]);
        let dispatcher = ctx.env.dispatcher.clone();

        let (read, presented) = tokio::join!(
            read_stream(&ctx, stream, &blocks, queue, &flags, &id_prefix),
            dispatcher.run_presenter(&ctx, &mut turn, &blocks, requests),
        );
        let blocks = blocks.into_inner();
        let cost = read.usage.total_cost.unwrap_or_else(|| model.calculate_cost(&read.usage));

        if let StreamEnd::Failed(error) = &read.end {
            let message = error.to_string();
            let interrupted = Interrupted {
                api_req_ts: api_req.ts,
                reason: CancelReason::StreamingFailed,
                failure: Some(message.clone()),
                blocks,
                marker: responses::INTERRUPTED_BY_API_ERROR,
                usage: &read.usage,
                cost,
            };
            if let Err(e) = ctx.abort_stream(interrupted).await {
                warn!(task_id, "Failed to record interrupted turn: {}", e);
            }
            return Err(Error::StreamInterrupted(message));
        }
        if ctx.handle.is_abandoned() {
            return Err(Error::Aborted);
        }
        let cancelled = matches!(read.end, StreamEnd::Cancelled)
            || ctx.handle.is_aborted()
            || presented.as_ref().is_err_and(Error::is_aborted);
        if cancelled {
            let interrupted = Interrupted {
                api_req_ts: api_req.ts,
                reason: CancelReason::UserCancelled,
                failure: None,
                blocks,
                marker: responses::INTERRUPTED_BY_USER,
                usage: &read.usage,
                cost,
            };
            if let Err(e) = ctx.abort_stream(interrupted).await {
                warn!(task_id, "Failed to record interrupted turn: {}", e);
            }
            return Err(Error::Aborted);
        }
        presented?;

        ctx.update_api_req(api_req.ts, |info| info.with_usage(&read.usage, cost))
            .await?;
        ctx.emit(TaskEvent::TokenUsageUpdated {
            task_id: task_id.to_string(),
            usage: ctx.store.token_usage(),
        });
        if turn.checkpoint_possible {
            ctx.checkpoints.save();
        }
        ctx.messenger.complete_partial().await?;

        if read.text.trim().is_empty() {
            warn!(task_id, "Model returned an empty response");
            ctx.messenger.say(SayKind::Error, EMPTY_RESPONSE_NOTICE).await?;
            ctx.store
                .add_to_history(Message::assistant(responses::NO_RESPONSE))
                .await?;
            ctx.record_mistake();
            return Ok(TurnEnd::Continue(vec![ContentBlock::text(responses::no_tools_used())]));
        }

        let mut stored = blocks.clone();
        if let Some(marker) = read.end.marker() {
            stored.push(ContentBlock::text(marker));
        }
        ctx.store.add_to_history(Message::assistant_blocks(stored)).await?;

        turn.answer_remaining(&blocks);
        if turn.completed {
            return Ok(TurnEnd::Completed(turn.completion_result));
        }

        let used_tool = blocks.iter().any(|b| matches!(b, ContentBlock::ToolUse { .. }));
        let mut next = turn.user_content;
        if !used_tool {
            let count = ctx.record_mistake();
            debug!(task_id, mistakes = count, "No tool used");
            next.push(ContentBlock::text(responses::no_tools_used()));
        }
        Ok(TurnEnd::Continue(next))
    }

    /// Wait for background checkpoint jobs, then post a marker for every
    /// checkpoint saved since the last turn
    async fn post_checkpoint_events(&mut self) -> Result<()> {
        self.ctx.checkpoints.settle().await;
        while let Ok(event) = self.checkpoint_events.try_recv() {
            let task_id = self.id().to_string();
            match event {
                CheckpointEvent::Saved { to, from, is_first } => {
                    let mut message = UiMessage::say(SayKind::CheckpointSaved, Some(to.clone()));
                    message.checkpoint = Some(CheckpointMarker {
                        is_first,
                        from: from.clone(),
                        to: to.clone(),
                    });
                    self.ctx.messenger.say_message(message).await?;
                    self.ctx.emit(TaskEvent::CheckpointSaved {
                        task_id,
                        to,
                        from,
                        is_first,
                    });
                }
                CheckpointEvent::Disabled => {
                    self.ctx
                        .messenger
                        .say(SayKind::Error, CHECKPOINTS_DISABLED_NOTICE)
                        .await?;
                    self.ctx.emit(TaskEvent::CheckpointsDisabled { task_id });
                }
            }
        }
        Ok(())
    }

    /// Restore the workspace to the checkpoint marked at `ts`, optionally
    /// cutting the conversation back to that point. Returns `false` when
    /// there is no such checkpoint or the restore failed.
    pub async fn restore_checkpoint(&self, ts: i64, mode: RestoreMode) -> Result<bool> {
        let ctx = &self.ctx;
        let ui = ctx.store.ui_messages();
        let Some(to) = ui
            .iter()
            .find(|m| m.ts == ts)
            .and_then(|m| m.checkpoint.as_ref())
            .map(|c| c.to.clone())
        else {
            warn!(task_id = self.id(), ts, "No checkpoint at that timestamp");
            return Ok(false);
        };

        self.init_checkpoints();
        if !ctx.checkpoints.restore(&to).await {
            return Ok(false);
        }
        if mode == RestoreMode::FilesOnly {
            return Ok(true);
        }

        let Some(cut) = checkpoint::cut_for_restore(&ctx.store.history(), &ui, ts) else {
            return Ok(true);
        };
        ctx.store.overwrite_history(cut.history).await?;
        ctx.store.overwrite_ui_messages(cut.ui).await?;
        let deleted = ApiReqInfo {
            tokens_in: Some(cut.removed.total_tokens_in),
            tokens_out: Some(cut.removed.total_tokens_out),
            cache_writes: Some(cut.removed.total_cache_writes),
            cache_reads: Some(cut.removed.total_cache_reads),
            cost: Some(cut.removed.total_cost),
            ..Default::default()
        };
        ctx.messenger
            .say(SayKind::ApiReqDeleted, serde_json::to_string(&deleted)?)
            .await?;
        info!(task_id = self.id(), ts, "Task restored to checkpoint");
        Ok(true)
    }

    /// Changes made since the checkpoint before the one marked at `ts`
    pub async fn checkpoint_diff(&self, ts: i64) -> Option<Vec<FileChange>> {
        let ui = self.ctx.store.ui_messages();
        let to = ui.iter().find(|m| m.ts == ts)?.checkpoint.as_ref()?.to.clone();
        self.init_checkpoints();
        self.ctx.checkpoints.diff(ts, &to, None, &ui).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        checkpoint::CheckpointService,
        storage::MemoryStorage,
        testing::{MockApi, Script, ScriptedChannel},
        tool::{ToolCall, ToolGroup},
        ui::AskResponse,
    };
    use serde_json::{Value, json};

    struct CountingTool {
        name: &'static str,
        mutating: bool,
        runs: AtomicU32,
    }

    impl CountingTool {
        fn new(name: &'static str, mutating: bool) -> Arc<Self> {
            Arc::new(Self {
                name,
                mutating,
                runs: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl Tool for CountingTool {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "Counts its runs"
        }
        fn parameters_schema(&self) -> Value {
            json!({
                "type": "object",
                "properties": { "path": { "type": "string" } },
                "required": ["path"]
            })
        }
        fn group(&self) -> ToolGroup {
            if self.mutating { ToolGroup::Edit } else { ToolGroup::Read }
        }
        fn mutates_workspace(&self) -> bool {
            self.mutating
        }
        async fn execute(&self, call: &mut ToolCall<'_>) -> Result<()> {
            let path = call.param("path").unwrap_or_default().to_string();
            if !call.approve(AskKind::Tool, json!({ "path": path }).to_string()).await? {
                return Ok(());
            }
            self.runs.fetch_add(1, Ordering::SeqCst);
            call.push_result(format!("ran on {path}"));
            Ok(())
        }
    }

    /// Read-only tool that records the mistake count it sees
    #[derive(Default)]
    struct MistakeTally {
        seen: Mutex<Vec<u32>>,
    }

    #[async_trait]
    impl Tool for MistakeTally {
        fn name(&self) -> &str {
            "tally_mistakes"
        }
        fn description(&self) -> &str {
            "Reports the mistake count"
        }
        fn parameters_schema(&self) -> Value {
            json!({ "type": "object", "properties": {} })
        }
        async fn execute(&self, call: &mut ToolCall<'_>) -> Result<()> {
            self.seen.lock().push(call.ctx.mistakes());
            call.push_result("counted");
            Ok(())
        }
    }

    fn turn(text: &str) -> Script {
        Script::Chunks(vec![ApiChunk::text(text)])
    }

    const TALLY: &str = "<tally_mistakes></tally_mistakes>";

    #[derive(Default)]
    struct CountingResources {
        released: AtomicU32,
        reverted: AtomicU32,
    }

    #[async_trait]
    impl TaskResources for CountingResources {
        async fn release(&self, _task_id: &str) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
        async fn revert_pending_edit(&self, _task_id: &str) -> bool {
            self.reverted.fetch_add(1, Ordering::SeqCst);
            false
        }
    }

    fn config() -> TaskConfig {
        TaskConfig {
            enable_checkpoints: false,
            resume_poll_interval_ms: 10,
            ..Default::default()
        }
    }

    fn env(
        api: Arc<MockApi>,
        channel: Arc<ScriptedChannel>,
        tools: Vec<Arc<dyn Tool>>,
    ) -> TaskEnvironment {
        TaskEnvironment::new(api, Arc::new(MemoryStorage::new()), channel)
            .with_tools(tools)
            .with_config(config())
            .with_cwd("/work")
    }

    fn result_texts(message: &Message) -> Vec<String> {
        message
            .blocks()
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolResult { content, .. } => Some(
                    content
                        .iter()
                        .filter_map(|c| match c {
                            ToolResultContent::Text { text } => Some(text.as_str()),
                            _ => None,
                        })
                        .collect::<Vec<_>>()
                        .join("\n"),
                ),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_plain_text_turn_then_completion() {
        let api = Arc::new(MockApi::new([Script::Chunks(vec![
            ApiChunk::usage(10, 5),
            ApiChunk::text("Hello"),
            ApiChunk::text(" world"),
        ])]));
        let channel = Arc::new(ScriptedChannel::default());
        let task = Task::new(env(api.clone(), channel, vec![]), None);
        let store = task.store();

        let outcome = task.start("say hi", vec![]).await.unwrap();
        assert_eq!(
            outcome,
            TaskOutcome::Completed {
                result: Some("done".into())
            }
        );

        let history = store.history();
        assert_eq!(history[0].text(), "<task>\nsay hi\n</task>");
        assert_eq!(history[1].text(), "Hello world");
        assert_eq!(history[2].text(), responses::no_tools_used());
        assert_eq!(api.calls.load(Ordering::SeqCst), 2);

        let ui = store.ui_messages();
        let first = ui.iter().find_map(UiMessage::api_req_info).unwrap();
        assert_eq!(first.tokens_in, Some(10));
        assert_eq!(first.tokens_out, Some(5));
        assert_eq!(first.cost, Some(0.0));
        assert!(ui.iter().any(|m| {
            m.is_say(SayKind::Text) && m.text.as_deref() == Some("Hello world") && !m.partial
        }));
        assert!(ui.iter().any(|m| m.is_ask(AskKind::CompletionResult)));
    }

    #[tokio::test]
    async fn test_denial_skips_the_rest_of_the_message() {
        let tool = CountingTool::new("write_thing", true);
        let api = Arc::new(MockApi::new([Script::Chunks(vec![ApiChunk::text(
            "<write_thing><path>a</path></write_thing>\n<write_thing><path>b</path></write_thing>",
        )])]));
        let channel = Arc::new(ScriptedChannel::new([AskResponse::no()]));
        let task = Task::new(env(api.clone(), channel, vec![tool.clone()]), None);
        let store = task.store();

        task.start("edit", vec![]).await.unwrap();
        assert_eq!(tool.runs.load(Ordering::SeqCst), 0);

        let results = result_texts(&store.history()[2]);
        assert_eq!(results.len(), 2);
        assert!(results[0].contains(&responses::tool_denied()));
        assert!(results[1].contains("Skipping tool"));
        // A denial still counts as using a tool
        assert!(!store.history()[2].text().contains("You did not use a tool"));
    }

    #[tokio::test]
    async fn test_one_tool_per_message() {
        let tool = CountingTool::new("read_thing", false);
        let api = Arc::new(MockApi::new([Script::Chunks(vec![ApiChunk::text(
            "<read_thing><path>a</path></read_thing><read_thing><path>b</path></read_thing>",
        )])]));
        let channel = Arc::new(ScriptedChannel::default());
        let environment = env(api, channel, vec![tool.clone()]).with_config(TaskConfig {
            auto_approve_read_only: true,
            ..config()
        });
        let task = Task::new(environment, None);
        let store = task.store();

        task.start("read", vec![]).await.unwrap();
        assert_eq!(tool.runs.load(Ordering::SeqCst), 1);
        let results = result_texts(&store.history()[2]);
        assert!(results[0].contains("ran on a"));
        assert!(results[1].contains("was not executed"));
    }

    #[tokio::test]
    async fn test_child_task_resumes_parent_in_its_mode() {
        let api = Arc::new(MockApi::new([Script::Chunks(vec![ApiChunk::text(
            "<new_task><mode>ask</mode><message>look around</message></new_task>",
        )])]));
        let channel = Arc::new(ScriptedChannel::default());
        let environment = env(api.clone(), channel, vec![]);
        let registry = environment.registry.clone();
        let task = Task::new(environment, None);

        let outcome = task.start("delegate", vec![]).await.unwrap();
        assert!(matches!(outcome, TaskOutcome::Completed { .. }));
        assert_eq!(api.calls.load(Ordering::SeqCst), 3);
        assert_eq!(registry.mode(), "code");
        assert!(registry.stack().is_empty());

        let histories = api.histories.lock();
        // The child's first request
        assert!(histories[1][0].text().contains("look around"));
        let resumed = histories[2].last().unwrap().text();
        assert!(resumed.contains("[new_task completed] Result: done"));
    }

    #[tokio::test]
    async fn test_stream_failure_reloads_from_history() {
        let api = Arc::new(MockApi::new([Script::FailAfter(
            vec![ApiChunk::text("Let me")],
            "connection reset".into(),
        )]));
        let channel = Arc::new(ScriptedChannel::default());
        let task = Task::new(env(api.clone(), channel.clone(), vec![]), None);
        let store = task.store();

        let outcome = task.start("work", vec![]).await.unwrap();
        assert!(matches!(outcome, TaskOutcome::Completed { .. }));

        let history = store.history();
        assert!(history[1].text().contains("Let me"));
        assert!(history[1].text().contains(responses::INTERRUPTED_BY_API_ERROR));
        assert!(history[2].text().contains("[TASK RESUMPTION]"));

        let first = store.ui_messages().iter().find_map(UiMessage::api_req_info).unwrap();
        assert_eq!(first.cancel_reason, Some(CancelReason::StreamingFailed));
        assert!(channel.asked.lock()[0].is_ask(AskKind::ResumeTask));
    }

    #[tokio::test]
    async fn test_abort_mid_stream() {
        let api = Arc::new(MockApi::new([Script::Stall(vec![ApiChunk::text("thinking")])]));
        let channel = Arc::new(ScriptedChannel::default());
        let resources = Arc::new(CountingResources::default());
        let environment = env(api, channel, vec![]).with_resources(resources.clone());
        let mut events = environment.subscribe();
        let task = Task::new(environment, None);
        let handle = task.handle();
        let store = task.store();

        let join = tokio::spawn(task.start("think", vec![]));
        loop {
            if let TaskEvent::MessageAdded { message, .. } = events.recv().await.unwrap() {
                if message.is_say(SayKind::Text) && message.text.as_deref() == Some("thinking") {
                    break;
                }
            }
        }
        handle.abort();

        assert_eq!(join.await.unwrap().unwrap(), TaskOutcome::Aborted);
        assert_eq!(resources.released.load(Ordering::SeqCst), 1);
        assert!(resources.reverted.load(Ordering::SeqCst) >= 1);

        let info = store.ui_messages().iter().find_map(UiMessage::api_req_info).unwrap();
        assert_eq!(info.cancel_reason, Some(CancelReason::UserCancelled));
        let last = store.history().last().unwrap().text();
        assert!(last.contains(responses::INTERRUPTED_BY_USER));
    }

    #[tokio::test]
    async fn test_empty_response_counts_as_mistake() {
        let api = Arc::new(MockApi::new([Script::Chunks(vec![])]));
        let channel = Arc::new(ScriptedChannel::default());
        let task = Task::new(env(api, channel, vec![]), None);
        let store = task.store();

        task.start("anything", vec![]).await.unwrap();
        let history = store.history();
        assert_eq!(history[1].text(), responses::NO_RESPONSE);
        assert_eq!(history[2].text(), responses::no_tools_used());
        assert!(store.ui_messages().iter().any(|m| {
            m.is_say(SayKind::Error) && m.text.as_deref() == Some(EMPTY_RESPONSE_NOTICE)
        }));
    }

    #[tokio::test]
    async fn test_mistake_limit_asks_for_guidance() {
        let api = Arc::new(MockApi::new([Script::Chunks(vec![ApiChunk::text("hmm")])]));
        let channel = Arc::new(ScriptedChannel::new([AskResponse::message("try the tests first")]));
        let environment = env(api.clone(), channel.clone(), vec![]).with_config(TaskConfig {
            mistake_limit: 1,
            ..config()
        });
        let task = Task::new(environment, None);

        task.start("anything", vec![]).await.unwrap();
        assert!(channel.asked.lock()[0].is_ask(AskKind::MistakeLimitReached));
        let sent = api.histories.lock()[1].last().unwrap().text();
        assert!(sent.contains("try the tests first"));
    }

    #[tokio::test]
    async fn test_resume_answers_dangling_tool_use() {
        let storage = Arc::new(MemoryStorage::new());
        let mut params = serde_json::Map::new();
        params.insert("path".into(), json!("a.rs"));
        storage
            .save_history(
                "old",
                &[
                    Message::user("<task>\nfix\n</task>"),
                    Message::assistant_blocks(vec![ContentBlock::ToolUse {
                        id: "x_0".into(),
                        name: "read_thing".into(),
                        params,
                        partial: false,
                    }]),
                ],
            )
            .await
            .unwrap();
        let mut said = UiMessage::say(SayKind::Text, Some("fix".into()));
        said.ts = 1_000;
        storage.save_ui_messages("old", &[said]).await.unwrap();

        let api = Arc::new(MockApi::new([]));
        let channel = Arc::new(ScriptedChannel::default());
        let environment =
            TaskEnvironment::new(api.clone(), storage, channel.clone()).with_config(config());
        let task = Task::resume(environment, "old").await.unwrap();

        let outcome = task.run_resumed().await.unwrap();
        assert!(matches!(outcome, TaskOutcome::Completed { .. }));
        assert!(channel.asked.lock()[0].is_ask(AskKind::ResumeTask));

        let sent = api.histories.lock()[0].clone();
        let blocks = sent.last().unwrap().blocks();
        assert!(matches!(
            &blocks[0],
            ContentBlock::ToolResult { tool_use_id, .. } if tool_use_id == "x_0"
        ));
        assert!(blocks[1].as_text().unwrap().starts_with("[TASK RESUMPTION]"));
    }

    #[tokio::test]
    async fn test_resume_unknown_task_fails() {
        let api = Arc::new(MockApi::new([]));
        let environment = TaskEnvironment::new(
            api,
            Arc::new(MemoryStorage::new()),
            Arc::new(ScriptedChannel::default()),
        );
        assert!(matches!(Task::resume(environment, "missing").await, Err(Error::Storage(_))));
    }

    #[derive(Default)]
    struct RecordingService {
        saves: AtomicU32,
        restored: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CheckpointService for RecordingService {
        async fn init_shadow_store(&self) -> Result<()> {
            Ok(())
        }
        async fn save_checkpoint(&self, _label: &str) -> Result<Option<String>> {
            let n = self.saves.fetch_add(1, Ordering::SeqCst);
            Ok(Some(format!("c{n}")))
        }
        async fn get_diff(&self, from: Option<&str>, to: &str) -> Result<Vec<FileChange>> {
            Ok(vec![FileChange {
                path: format!("{}..{}", from.unwrap_or("base"), to),
                before: "a".into(),
                after: "b".into(),
            }])
        }
        async fn restore_checkpoint(&self, id: &str) -> Result<()> {
            self.restored.lock().push(id.to_string());
            Ok(())
        }
    }

    struct Factory(Arc<RecordingService>);

    impl CheckpointServiceFactory for Factory {
        fn create(
            &self,
            _task_id: &str,
            _workspace: &std::path::Path,
        ) -> Result<Arc<dyn CheckpointService>> {
            Ok(self.0.clone())
        }
    }

    fn at(ts: i64, mut message: UiMessage) -> UiMessage {
        message.ts = ts;
        message
    }

    fn api_req(tokens_in: u64, tokens_out: u64) -> UiMessage {
        let info = ApiReqInfo::default().with_usage(
            &Usage {
                input: tokens_in,
                output: tokens_out,
                ..Default::default()
            },
            0.0,
        );
        UiMessage::say(SayKind::ApiReqStarted, Some(serde_json::to_string(&info).unwrap()))
    }

    fn message_at(ts: i64, mut message: Message) -> Message {
        message.ts = Some(ts);
        message
    }

    #[tokio::test]
    async fn test_restore_cuts_task_back_to_checkpoint() {
        let storage = Arc::new(MemoryStorage::new());
        let mut marker = UiMessage::say(SayKind::CheckpointSaved, Some("c1".into()));
        marker.checkpoint = Some(CheckpointMarker {
            is_first: true,
            from: None,
            to: "c1".into(),
        });
        storage
            .save_ui_messages(
                "old",
                &[
                    at(1_000, UiMessage::say(SayKind::Text, Some("fix".into()))),
                    at(1_001, api_req(5, 5)),
                    at(1_002, marker),
                    at(1_003, api_req(7, 3)),
                    at(1_004, UiMessage::say(SayKind::Text, Some("more".into()))),
                ],
            )
            .await
            .unwrap();
        storage
            .save_history(
                "old",
                &[
                    message_at(1_000, Message::user("fix")),
                    message_at(1_001, Message::assistant("on it")),
                    message_at(1_003, Message::user("next")),
                    message_at(1_004, Message::assistant("more")),
                ],
            )
            .await
            .unwrap();

        let service = Arc::new(RecordingService::default());
        let environment = TaskEnvironment::new(
            Arc::new(MockApi::new([])),
            storage,
            Arc::new(ScriptedChannel::default()),
        )
        .with_checkpoints(Arc::new(Factory(service.clone())));
        let task = Task::resume(environment, "old").await.unwrap();

        let diff = task.checkpoint_diff(1_002).await.unwrap();
        assert_eq!(diff[0].path, "base..c1");

        assert!(task.restore_checkpoint(1_002, RestoreMode::FilesAndTask).await.unwrap());
        assert_eq!(*service.restored.lock(), vec!["c1".to_string()]);

        let store = task.store();
        assert_eq!(store.history().len(), 2);
        let ui = store.ui_messages();
        assert_eq!(ui.len(), 4);
        let deleted: ApiReqInfo = serde_json::from_str(ui[3].text.as_deref().unwrap()).unwrap();
        assert!(ui[3].is_say(SayKind::ApiReqDeleted));
        assert_eq!(deleted.tokens_in, Some(7));
        assert_eq!(store.token_usage().total_tokens_in, 5);

        assert!(!task.restore_checkpoint(1_001, RestoreMode::FilesOnly).await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_parameter_counts_a_mistake() {
        let tool = CountingTool::new("read_thing", false);
        let tally = Arc::new(MistakeTally::default());
        let api = Arc::new(MockApi::new([turn("<read_thing></read_thing>"), turn(TALLY)]));
        let channel = Arc::new(ScriptedChannel::default());
        let task = Task::new(env(api, channel, vec![tool.clone(), tally.clone()]), None);
        let store = task.store();

        task.start("read", vec![]).await.unwrap();
        assert_eq!(tool.runs.load(Ordering::SeqCst), 0);
        let results = result_texts(&store.history()[2]);
        assert!(results[0].contains(&responses::missing_tool_parameter_error("path")));
        assert_eq!(*tally.seen.lock(), vec![1]);
        assert!(store.ui_messages().iter().any(|m| m.is_say(SayKind::Error)));
    }

    #[tokio::test]
    async fn test_tool_outside_mode_is_rejected() {
        let tool = CountingTool::new("write_thing", true);
        let tally = Arc::new(MistakeTally::default());
        let api = Arc::new(MockApi::new([
            turn("<write_thing><path>a</path></write_thing>"),
            turn(TALLY),
        ]));
        let channel = Arc::new(ScriptedChannel::default());
        let tools: Vec<Arc<dyn Tool>> = vec![tool.clone(), tally.clone()];
        let environment = env(api, channel.clone(), tools).with_config(TaskConfig {
            mode: "ask".into(),
            ..config()
        });
        let task = Task::new(environment, None);
        let store = task.store();

        task.start("edit", vec![]).await.unwrap();
        assert_eq!(tool.runs.load(Ordering::SeqCst), 0);
        assert!(!channel.asked.lock().iter().any(|m| m.is_ask(AskKind::Tool)));
        let results = result_texts(&store.history()[2]);
        assert!(results[0].contains("Tool \"write_thing\" is not allowed in ask mode."));
        assert_eq!(*tally.seen.lock(), vec![1]);
    }

    #[tokio::test]
    async fn test_denial_leaves_mistakes_alone() {
        let tool = CountingTool::new("write_thing", true);
        let tally = Arc::new(MistakeTally::default());
        let api = Arc::new(MockApi::new([
            turn("<write_thing></write_thing>"),
            turn("<write_thing><path>a</path></write_thing>"),
            turn(TALLY),
        ]));
        let channel = Arc::new(ScriptedChannel::new([AskResponse::no()]));
        let task = Task::new(env(api, channel, vec![tool.clone(), tally.clone()]), None);
        let store = task.store();

        task.start("edit", vec![]).await.unwrap();
        assert_eq!(tool.runs.load(Ordering::SeqCst), 0);
        assert!(result_texts(&store.history()[4])[0].contains(&responses::tool_denied()));
        // One mistake from the missing path, none added or cleared by the denial
        assert_eq!(*tally.seen.lock(), vec![1]);
    }

    #[tokio::test]
    async fn test_checkpoint_marker_precedes_next_request() {
        let tool = CountingTool::new("write_thing", true);
        let service = Arc::new(RecordingService::default());
        let api = Arc::new(MockApi::new([
            turn("<write_thing><path>a</path></write_thing>"),
            turn("<write_thing><path>b</path></write_thing>"),
        ]));
        let channel = Arc::new(ScriptedChannel::default());
        let environment = env(api, channel, vec![tool.clone()])
            .with_config(TaskConfig {
                enable_checkpoints: true,
                ..config()
            })
            .with_checkpoints(Arc::new(Factory(service.clone())));
        let task = Task::new(environment, None);
        let store = task.store();

        task.start("edit", vec![]).await.unwrap();
        assert_eq!(tool.runs.load(Ordering::SeqCst), 2);

        let ui = store.ui_messages();
        let requests: Vec<usize> = (0..ui.len())
            .filter(|&i| ui[i].is_say(SayKind::ApiReqStarted))
            .collect();
        let markers: Vec<usize> = (0..ui.len())
            .filter(|&i| ui[i].is_say(SayKind::CheckpointSaved))
            .collect();
        assert_eq!(requests.len(), 3);
        assert_eq!(markers.len(), 3);
        for (marker, request) in markers.iter().zip(&requests) {
            assert!(marker < request);
        }
        assert!(markers[1] > requests[0] && markers[2] > requests[1]);

        let chain: Vec<_> = markers.iter().filter_map(|&i| ui[i].checkpoint.clone()).collect();
        assert!(chain[0].is_first);
        assert_eq!(chain[1].from.as_deref(), Some("c0"));
        assert_eq!(chain[2].to, "c2");
    }
}
