//! ask_followup_question: ask the user and hand the answer to the model

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::{
    error::Result,
    tool::{Tool, ToolCall, ToolGroup, ToolOutput},
    ui::{AskKind, SayKind},
};

pub struct AskFollowupTool;

impl AskFollowupTool {
    pub fn new() -> Self {
        Self
    }
}

impl Default for AskFollowupTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for AskFollowupTool {
    fn name(&self) -> &str {
        "ask_followup_question"
    }

    fn description(&self) -> &str {
        "Ask the user a question when the task cannot continue without more information."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "question": {
                    "type": "string",
                    "description": "The question to ask"
                },
                "follow_up": {
                    "type": "string",
                    "description": "Suggested answers, one <suggest> tag each"
                }
            },
            "required": ["question"]
        })
    }

    fn group(&self) -> ToolGroup {
        ToolGroup::Always
    }

    fn describe(&self, params: &serde_json::Map<String, Value>) -> String {
        let question = params.get("question").and_then(Value::as_str).unwrap_or_default();
        format!("[ask_followup_question for '{question}']")
    }

    async fn preview(&self, call: &mut ToolCall<'_>) -> Result<()> {
        let question = call.param_for_display("question");
        call.ask_partial(AskKind::Followup, question).await
    }

    async fn execute(&self, call: &mut ToolCall<'_>) -> Result<()> {
        let question = call.param("question").unwrap_or_default();
        let suggestions = suggestions(call.param("follow_up").unwrap_or_default());
        let payload = json!({ "question": question, "suggest": suggestions }).to_string();

        let response = call.ask(AskKind::Followup, payload).await?;
        let answer = response.text.clone().unwrap_or_default();
        call.messenger()
            .say_with_images(SayKind::UserFeedback, answer.clone(), response.images.clone())
            .await?;
        call.push_result(ToolOutput::with_images(
            format!("<answer>\n{answer}\n</answer>"),
            response.images,
        ));
        Ok(())
    }
}

/// Contents of every `<suggest>` tag
fn suggestions(follow_up: &str) -> Vec<String> {
    follow_up
        .split("<suggest>")
        .skip(1)
        .filter_map(|part| part.split_once("</suggest>"))
        .map(|(s, _)| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suggestions() {
        let follow_up = "\n<suggest>Use tabs</suggest>\n<suggest> Use spaces </suggest>\n<suggest>";
        assert_eq!(suggestions(follow_up), vec!["Use tabs", "Use spaces"]);
        assert!(suggestions("").is_empty());
    }
}
