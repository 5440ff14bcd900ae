//! attempt_completion: present the result and end the task

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::{
    error::Result,
    responses,
    tool::{Tool, ToolCall, ToolGroup},
    ui::{AskKind, SayKind},
};

pub struct AttemptCompletionTool;

impl AttemptCompletionTool {
    pub fn new() -> Self {
        Self
    }
}

impl Default for AttemptCompletionTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for AttemptCompletionTool {
    fn name(&self) -> &str {
        "attempt_completion"
    }

    fn description(&self) -> &str {
        "Present the final result of the task once it is done. The user may accept it or reply with feedback."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "result": {
                    "type": "string",
                    "description": "The result of the task, written as a final statement"
                }
            },
            "required": ["result"]
        })
    }

    fn group(&self) -> ToolGroup {
        ToolGroup::Always
    }

    async fn preview(&self, call: &mut ToolCall<'_>) -> Result<()> {
        let result = call.param_for_display("result");
        call.say_partial(SayKind::CompletionResult, result).await
    }

    async fn execute(&self, call: &mut ToolCall<'_>) -> Result<()> {
        let result = call.param("result").unwrap_or_default().to_string();
        call.say(SayKind::CompletionResult, result.clone()).await?;

        if call.is_subtask() {
            let response = call.ask(AskKind::FinishSubtask, "").await?;
            if response.is_yes() {
                call.push_result("");
                call.finish_subtask(&result);
                return Ok(());
            }
            return push_feedback(call, response.text, response.images).await;
        }

        let response = call.ask(AskKind::CompletionResult, "").await?;
        if response.is_yes() {
            call.push_result("");
            call.complete_task(Some(result));
            return Ok(());
        }
        push_feedback(call, response.text, response.images).await
    }
}

/// The user answered the result with feedback; the task goes on
async fn push_feedback(
    call: &mut ToolCall<'_>,
    text: Option<String>,
    images: Vec<strand_ai::Image>,
) -> Result<()> {
    let text = text.unwrap_or_default();
    call.messenger()
        .say_with_images(SayKind::UserFeedback, text.clone(), images.clone())
        .await?;
    call.push_result(crate::tool::ToolOutput::with_images(
        responses::completion_feedback(&text),
        images,
    ));
    Ok(())
}
