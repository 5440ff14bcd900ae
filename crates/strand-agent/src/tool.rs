//! Tool trait and the per-invocation call context

use async_trait::async_trait;
use serde_json::{Map, Value};
use strand_ai::{Image, ToolResultContent};

use crate::{
    dispatcher::{ResultKind, TurnState},
    error::{Error, Result},
    messenger::Messenger,
    parser, responses,
    task::TaskContext,
    ui::{AskKind, AskResponse, SayKind},
};

/// Which modes may use a tool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolGroup {
    Read,
    Edit,
    Command,
    /// Allowed in every mode
    Always,
}

/// What a tool hands back to the model
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutput {
    Text(String),
    Blocks(Vec<ToolResultContent>),
}

impl From<&str> for ToolOutput {
    fn from(text: &str) -> Self {
        ToolOutput::Text(text.to_string())
    }
}

impl From<String> for ToolOutput {
    fn from(text: String) -> Self {
        ToolOutput::Text(text)
    }
}

impl ToolOutput {
    /// Text plus images
    pub fn with_images(text: impl Into<String>, images: Vec<Image>) -> Self {
        let mut blocks = vec![ToolResultContent::Text { text: text.into() }];
        blocks.extend(images.into_iter().map(ToolResultContent::Image));
        ToolOutput::Blocks(blocks)
    }
}

/// Trait for executable tools.
///
/// `execute` runs once per complete invocation and reports back through
/// the [`ToolCall`]: ask for approval, push exactly one result. An `Err`
/// other than an abort becomes a tool-error result for the model.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name, also its XML tag
    fn name(&self) -> &str;

    /// Tool description for the model
    fn description(&self) -> &str;

    /// JSON Schema for parameters. Every property should be a string.
    fn parameters_schema(&self) -> Value;

    fn group(&self) -> ToolGroup {
        ToolGroup::Read
    }

    /// Whether a successful run may have changed the workspace
    fn mutates_workspace(&self) -> bool {
        false
    }

    /// Short label used in result headers, e.g. `[read_file for 'src/lib.rs']`
    fn describe(&self, _params: &Map<String, Value>) -> String {
        format!("[{}]", self.name())
    }

    /// Called while the invocation is still streaming. Nothing may run here;
    /// tools typically post a partial ask so the user sees progress.
    async fn preview(&self, _call: &mut ToolCall<'_>) -> Result<()> {
        Ok(())
    }

    async fn execute(&self, call: &mut ToolCall<'_>) -> Result<()>;
}

/// One invocation of a tool, with the hooks it needs to talk to the user
/// and report its result.
pub struct ToolCall<'a> {
    pub(crate) ctx: &'a TaskContext,
    pub(crate) turn: &'a mut TurnState,
    pub(crate) tool: &'a dyn Tool,
    pub(crate) id: String,
    pub(crate) params: Map<String, Value>,
    pub(crate) partial: bool,
}

impl<'a> ToolCall<'a> {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        self.tool.name()
    }

    pub fn task_id(&self) -> &str {
        self.ctx.handle.task_id()
    }

    pub fn is_partial(&self) -> bool {
        self.partial
    }

    pub fn params(&self) -> &Map<String, Value> {
        &self.params
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).and_then(Value::as_str)
    }

    /// A non-empty parameter value
    pub fn required(&self, name: &str) -> Option<&str> {
        self.param(name).filter(|v| !v.is_empty())
    }

    /// Parameter value with a half-streamed closing tag removed
    pub fn param_for_display(&self, name: &str) -> String {
        self.strip_partial_tag(name, self.param(name).unwrap_or_default())
    }

    pub fn strip_partial_tag(&self, tag: &str, text: &str) -> String {
        parser::strip_partial_tag(tag, text, self.partial)
    }

    pub fn description(&self) -> String {
        self.tool.describe(&self.params)
    }

    pub fn messenger(&self) -> &Messenger {
        &self.ctx.messenger
    }

    pub fn mode(&self) -> String {
        self.ctx.env.registry.mode()
    }

    pub fn cwd(&self) -> &std::path::Path {
        &self.ctx.env.cwd
    }

    pub fn cancel_token(&self) -> tokio_util::sync::CancellationToken {
        self.ctx.handle.cancel_token()
    }

    /// Whether this task is a child of another
    pub fn is_subtask(&self) -> bool {
        self.ctx.handle.parent_id().is_some()
    }

    fn auto_approved(&self) -> bool {
        let config = &self.ctx.env.config;
        if self.tool.mutates_workspace() {
            config.auto_approve_mutating
        } else {
            config.auto_approve_read_only
        }
    }

    /// Ask the user to approve this invocation.
    ///
    /// On denial the denial result is pushed and the turn is marked as
    /// rejected, so later invocations are skipped. Feedback given along with
    /// an approval is appended to the eventual result.
    pub async fn approve(&mut self, kind: AskKind, payload: impl Into<String>) -> Result<bool> {
        let payload = payload.into();
        if self.auto_approved() {
            self.ctx.messenger.say(SayKind::Tool, payload).await?;
            return Ok(true);
        }

        let response = self.ctx.messenger.ask(kind, payload, false).await?;
        if !response.is_yes() {
            let result = match response.feedback() {
                Some(text) => {
                    self.say_feedback(&response).await?;
                    responses::tool_denied_with_feedback(text)
                }
                None => responses::tool_denied(),
            };
            let output = ToolOutput::with_images(result, response.images);
            self.push(output, ResultKind::Denied);
            self.turn.flags.set_rejected();
            return Ok(false);
        }

        if let Some(text) = response.feedback() {
            self.say_feedback(&response).await?;
            self.turn.approval_feedback = Some(responses::tool_approved_with_feedback(text));
        }
        Ok(true)
    }

    async fn say_feedback(&self, response: &AskResponse) -> Result<()> {
        let text = response.text.clone().unwrap_or_default();
        self.ctx
            .messenger
            .say_with_images(SayKind::UserFeedback, text, response.images.clone())
            .await
    }

    pub async fn ask(&self, kind: AskKind, text: impl Into<String>) -> Result<AskResponse> {
        self.ctx.messenger.ask(kind, text, false).await
    }

    pub async fn ask_partial(&self, kind: AskKind, text: impl Into<String>) -> Result<()> {
        self.ctx.messenger.ask(kind, text, true).await.map(|_| ())
    }

    pub async fn say(&self, kind: SayKind, text: impl Into<String>) -> Result<()> {
        self.ctx.messenger.say(kind, text).await
    }

    pub async fn say_partial(&self, kind: SayKind, text: impl Into<String>) -> Result<()> {
        self.ctx.messenger.say_partial(kind, text).await
    }

    /// Push this invocation's result. Only the first push counts, and a
    /// counted push clears the mistake counter.
    pub fn push_result(&mut self, output: impl Into<ToolOutput>) -> bool {
        let pushed = self.push(output.into(), ResultKind::Executed);
        if pushed {
            self.ctx.reset_mistakes();
        }
        pushed
    }

    fn push(&mut self, output: ToolOutput, kind: ResultKind) -> bool {
        let description = self.description();
        let mutating = self.tool.mutates_workspace();
        self.turn
            .push_result(&self.id, &description, output, kind, mutating)
    }

    /// Report a failure to the user and the model
    pub async fn handle_error(&mut self, action: &str, error: &Error) -> Result<()> {
        if error.is_aborted() {
            return Err(Error::Aborted);
        }
        let message = format!("Error {action}:\n{error}");
        self.ctx.messenger.say(SayKind::Error, message.clone()).await?;
        self.push(ToolOutput::Text(responses::tool_error(&message)), ResultKind::Error);
        Ok(())
    }

    /// Reject the invocation for a missing parameter. Counts as a mistake.
    pub async fn missing_param(&mut self, param: &str) -> Result<()> {
        self.ctx.record_mistake();
        self.ctx
            .messenger
            .say(SayKind::Error, responses::missing_parameter_notice(self.tool.name(), param))
            .await?;
        let message = responses::missing_tool_parameter_error(param);
        self.push(ToolOutput::Text(responses::tool_error(&message)), ResultKind::Error);
        Ok(())
    }

    /// Report an invalid parameter value. Counts as a mistake.
    pub async fn invalid_param(&mut self, message: &str) -> Result<()> {
        self.ctx.record_mistake();
        self.ctx.messenger.say(SayKind::Error, message).await?;
        self.push(ToolOutput::Text(responses::tool_error(message)), ResultKind::Error);
        Ok(())
    }

    pub fn record_mistake(&self) {
        self.ctx.record_mistake();
    }

    /// Mark the task as done once this turn finishes
    pub fn complete_task(&mut self, result: Option<String>) {
        self.turn.completed = true;
        self.turn.completion_result = result;
    }

    /// Pause this task and start a child in `mode`. Returns the child id.
    pub fn spawn_child(&self, mode: &str, message: &str) -> Result<String> {
        self.ctx.spawn_child(mode, message)
    }

    /// Hand `result` to the parent and stop this task
    pub fn finish_subtask(&self, result: &str) -> bool {
        self.ctx.env.registry.finish_subtask(&self.ctx.handle, result)
    }
}
