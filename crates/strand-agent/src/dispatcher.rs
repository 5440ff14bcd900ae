//! Tool dispatch and block presentation for one turn
//!
//! The stream reader re-parses the assistant text after every chunk and
//! requests a presentation pass. A single presenter drains those requests:
//! it walks the blocks from where it left off, shows text, runs each
//! complete tool invocation and stops at the first partial block. Requests
//! that arrive while a pass is running coalesce into one pending pass.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use parking_lot::Mutex;
use serde_json::{Map, Value};
use strand_ai::{ContentBlock, ToolResultContent};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{
    error::{Error, Result},
    modes,
    parser::{self, ParserVocabulary},
    responses,
    task::TaskContext,
    tool::{Tool, ToolCall, ToolOutput},
    ui::SayKind,
};

/// How an invocation's result came about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultKind {
    Executed,
    Denied,
    Error,
    /// Never reached the tool
    Skipped,
}

/// Flags the stream reader watches while the presenter sets them
#[derive(Debug, Default)]
pub struct TurnFlags {
    rejected: AtomicBool,
    tool_used: AtomicBool,
}

impl TurnFlags {
    pub fn set_rejected(&self) {
        self.rejected.store(true, Ordering::Release);
    }

    pub fn rejected(&self) -> bool {
        self.rejected.load(Ordering::Acquire)
    }

    pub fn set_tool_used(&self) {
        self.tool_used.store(true, Ordering::Release);
    }

    pub fn tool_used(&self) -> bool {
        self.tool_used.load(Ordering::Acquire)
    }
}

/// Everything a turn accumulates for the next turn's input
#[derive(Debug, Default)]
pub struct TurnState {
    pub(crate) user_content: Vec<ContentBlock>,
    answered: HashSet<String>,
    pub(crate) flags: Arc<TurnFlags>,
    /// A mutating tool ran successfully
    pub(crate) checkpoint_possible: bool,
    /// The task signalled completion
    pub(crate) completed: bool,
    pub(crate) completion_result: Option<String>,
    /// Feedback given with an approval, merged into the result
    pub(crate) approval_feedback: Option<String>,
}

impl TurnState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn flags(&self) -> Arc<TurnFlags> {
        self.flags.clone()
    }

    pub fn is_answered(&self, tool_use_id: &str) -> bool {
        self.answered.contains(tool_use_id)
    }

    pub fn push_text(&mut self, text: impl Into<String>) {
        self.user_content.push(ContentBlock::text(text));
    }

    /// Record the one result for `tool_use_id`. Returns `false` if it
    /// already had one.
    pub fn push_result(
        &mut self,
        tool_use_id: &str,
        description: &str,
        output: ToolOutput,
        kind: ResultKind,
        mutating: bool,
    ) -> bool {
        if !self.answered.insert(tool_use_id.to_string()) {
            return false;
        }

        let mut content = vec![ToolResultContent::Text {
            text: format!("{description} Result:"),
        }];
        match output {
            ToolOutput::Text(text) if text.trim().is_empty() => {
                content.push(ToolResultContent::Text {
                    text: responses::EMPTY_TOOL_RESULT.to_string(),
                })
            }
            ToolOutput::Text(text) => content.push(ToolResultContent::Text { text }),
            ToolOutput::Blocks(blocks) if blocks.is_empty() => {
                content.push(ToolResultContent::Text {
                    text: responses::EMPTY_TOOL_RESULT.to_string(),
                })
            }
            ToolOutput::Blocks(blocks) => content.extend(blocks),
        }
        if kind == ResultKind::Executed {
            if let Some(feedback) = self.approval_feedback.take() {
                content.push(ToolResultContent::Text { text: feedback });
            }
        }

        self.user_content.push(ContentBlock::ToolResult {
            tool_use_id: tool_use_id.to_string(),
            content,
            is_error: kind == ResultKind::Error,
        });

        match kind {
            ResultKind::Executed => {
                self.flags.set_tool_used();
                if mutating {
                    self.checkpoint_possible = true;
                }
            }
            ResultKind::Denied | ResultKind::Error => self.flags.set_tool_used(),
            ResultKind::Skipped => {}
        }
        true
    }

    /// Give every unanswered tool invocation in `blocks` an empty result
    pub(crate) fn answer_remaining(&mut self, blocks: &[ContentBlock]) {
        for block in blocks {
            if let ContentBlock::ToolUse { id, name, .. } = block {
                if !self.is_answered(id) {
                    self.push_result(
                        id,
                        &format!("[{name}]"),
                        ToolOutput::Text(String::new()),
                        ResultKind::Skipped,
                        false,
                    );
                }
            }
        }
    }
}

/// Sender half of the presentation work queue
#[derive(Clone)]
pub struct PresentationQueue {
    tx: mpsc::Sender<()>,
}

impl PresentationQueue {
    pub fn new() -> (Self, mpsc::Receiver<()>) {
        let (tx, rx) = mpsc::channel(1);
        (Self { tx }, rx)
    }

    /// Request a pass. Returns `false` when one is already pending.
    pub fn request(&self) -> bool {
        self.tx.try_send(()).is_ok()
    }
}

/// Blocks parsed so far, shared between the reader and the presenter
pub type SharedBlocks = Mutex<Vec<ContentBlock>>;

/// Tool lookup, parameter validation and per-block dispatch
pub struct Dispatcher {
    tools: Vec<Arc<dyn Tool>>,
    schema_cache: HashMap<String, Arc<jsonschema::Validator>>,
    vocabulary: ParserVocabulary,
}

impl Dispatcher {
    pub fn new(tools: Vec<Arc<dyn Tool>>) -> Self {
        let mut schema_cache = HashMap::new();
        let mut params = Vec::new();
        for tool in &tools {
            let schema = tool.parameters_schema();
            if let Some(props) = schema.get("properties").and_then(Value::as_object) {
                params.extend(props.keys().cloned());
            }
            match jsonschema::validator_for(&schema) {
                Ok(validator) => {
                    schema_cache.insert(tool.name().to_string(), Arc::new(validator));
                }
                Err(e) => {
                    warn!(
                        "Invalid tool parameter schema for '{}', skipping validation: {}",
                        tool.name(),
                        e
                    );
                }
            }
        }
        let vocabulary = ParserVocabulary::new(tools.iter().map(|t| t.name().to_string()), params);
        Self {
            tools,
            schema_cache,
            vocabulary,
        }
    }

    pub fn tools(&self) -> &[Arc<dyn Tool>] {
        &self.tools
    }

    pub fn vocabulary(&self) -> &ParserVocabulary {
        &self.vocabulary
    }

    pub fn find(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name)
    }

    /// Schema check for a complete invocation
    pub fn validate(&self, name: &str, params: &Map<String, Value>) -> Option<String> {
        let validator = self.schema_cache.get(name)?;
        let instance = Value::Object(params.clone());
        let errors: Vec<String> = validator
            .iter_errors(&instance)
            .map(|e| {
                let path = e.instance_path.to_string();
                if path.is_empty() {
                    e.to_string()
                } else {
                    format!("{}: {}", path, e)
                }
            })
            .collect();
        if errors.is_empty() {
            None
        } else {
            Some(Error::InvalidParameters(errors.join("\n")).to_string())
        }
    }

    /// Drain presentation requests until the reader hangs up, then make a
    /// final pass over the completed blocks.
    pub async fn run_presenter(
        &self,
        ctx: &TaskContext,
        turn: &mut TurnState,
        blocks: &SharedBlocks,
        mut requests: mpsc::Receiver<()>,
    ) -> Result<()> {
        let mut index = 0;
        while requests.recv().await.is_some() {
            self.present_pending(ctx, turn, blocks, &mut index).await?;
        }
        self.present_pending(ctx, turn, blocks, &mut index).await
    }

    async fn present_pending(
        &self,
        ctx: &TaskContext,
        turn: &mut TurnState,
        blocks: &SharedBlocks,
        index: &mut usize,
    ) -> Result<()> {
        loop {
            let block = blocks.lock().get(*index).cloned();
            let Some(block) = block else {
                return Ok(());
            };
            if ctx.handle.is_aborted() {
                return Err(Error::Aborted);
            }
            self.present_block(ctx, turn, &block).await?;
            if block.is_partial() {
                return Ok(());
            }
            *index += 1;
        }
    }

    /// Show or dispatch one block. Only an abort is returned as `Err`;
    /// every other failure becomes a tool result.
    pub async fn present_block(
        &self,
        ctx: &TaskContext,
        turn: &mut TurnState,
        block: &ContentBlock,
    ) -> Result<()> {
        match block {
            ContentBlock::Text { text, partial } => {
                if turn.flags.rejected() || turn.flags.tool_used() {
                    return Ok(());
                }
                let shown = parser::display_text(text, *partial);
                if shown.is_empty() {
                    if !partial {
                        ctx.messenger.complete_partial().await?;
                    }
                    return Ok(());
                }
                if *partial {
                    ctx.messenger.say_partial(SayKind::Text, shown).await
                } else {
                    ctx.messenger.say(SayKind::Text, shown).await
                }
            }
            ContentBlock::ToolUse {
                id,
                name,
                params,
                partial,
            } => self.dispatch(ctx, turn, id, name, params, *partial).await,
            _ => Ok(()),
        }
    }

    async fn dispatch(
        &self,
        ctx: &TaskContext,
        turn: &mut TurnState,
        id: &str,
        name: &str,
        params: &Map<String, Value>,
        partial: bool,
    ) -> Result<()> {
        let Some(tool) = self.find(name) else {
            if !partial {
                let message = Error::ToolNotFound(name.to_string()).to_string();
                let output = ToolOutput::Text(responses::tool_error(&message));
                turn.push_result(id, &format!("[{name}]"), output, ResultKind::Error, false);
            }
            return Ok(());
        };
        let description = tool.describe(params);

        if turn.flags.rejected() {
            let text = if partial {
                responses::interrupted_after_rejection(&description)
            } else {
                responses::skipped_after_rejection(&description)
            };
            turn.push_result(id, &description, ToolOutput::Text(text), ResultKind::Skipped, false);
            return Ok(());
        }

        if turn.flags.tool_used() {
            if !partial {
                turn.push_result(
                    id,
                    &description,
                    ToolOutput::Text(responses::not_executed_one_per_message(name)),
                    ResultKind::Skipped,
                    false,
                );
            }
            return Ok(());
        }

        let mode = ctx.env.registry.mode();
        if let Err(message) = modes::validate_tool_use(tool.as_ref(), &mode) {
            if !partial {
                ctx.record_mistake();
                ctx.messenger.say(SayKind::Error, message.clone()).await?;
                let output = ToolOutput::Text(responses::tool_error(&message));
                turn.push_result(id, &description, output, ResultKind::Error, false);
            }
            return Ok(());
        }

        let mut call = ToolCall {
            ctx,
            turn,
            tool: tool.as_ref(),
            id: id.to_string(),
            params: params.clone(),
            partial,
        };

        if partial {
            return match tool.preview(&mut call).await {
                Err(e) if e.is_aborted() => Err(e),
                Err(e) => {
                    debug!(tool = name, "Preview failed: {}", e);
                    Ok(())
                }
                Ok(()) => Ok(()),
            };
        }

        let schema = tool.parameters_schema();
        let missing = schema
            .get("required")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(Value::as_str)
            .find(|p| call.required(p).is_none())
            .map(str::to_string);
        if let Some(param) = missing {
            return call.missing_param(&param).await;
        }
        if let Some(message) = self.validate(name, params) {
            return call.invalid_param(&message).await;
        }

        debug!(tool = name, id, "Executing tool");
        match tool.execute(&mut call).await {
            Ok(()) => {}
            Err(e) if e.is_aborted() => return Err(e),
            Err(e) => call.handle_error(&format!("executing {name}"), &e).await?,
        }
        call.push_result(String::new());
        Ok(())
    }
}
