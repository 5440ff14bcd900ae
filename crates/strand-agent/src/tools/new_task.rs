//! new_task: delegate work to a child task in another mode

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::{
    error::Result,
    modes,
    tool::{Tool, ToolCall, ToolGroup},
    ui::AskKind,
};

pub struct NewTaskTool;

impl NewTaskTool {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NewTaskTool {
    fn default() -> Self {
        Self::new()
    }
}

fn payload(mode: &str, message: &str) -> String {
    json!({ "tool": "newTask", "mode": mode, "content": message }).to_string()
}

#[async_trait]
impl Tool for NewTaskTool {
    fn name(&self) -> &str {
        "new_task"
    }

    fn description(&self) -> &str {
        "Start a sub-task in the given mode. This task pauses until the sub-task hands back its result."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "mode": {
                    "type": "string",
                    "description": "Slug of the mode the sub-task runs in"
                },
                "message": {
                    "type": "string",
                    "description": "Instructions for the sub-task"
                }
            },
            "required": ["mode", "message"]
        })
    }

    fn group(&self) -> ToolGroup {
        ToolGroup::Always
    }

    async fn preview(&self, call: &mut ToolCall<'_>) -> Result<()> {
        let text = payload(&call.param_for_display("mode"), &call.param_for_display("message"));
        call.ask_partial(AskKind::NewTask, text).await
    }

    async fn execute(&self, call: &mut ToolCall<'_>) -> Result<()> {
        let mode = call.param("mode").unwrap_or_default().to_string();
        let message = call.param("message").unwrap_or_default().to_string();

        let Some(target) = modes::get_mode(&mode) else {
            return call.invalid_param(&format!("Invalid mode: {mode}")).await;
        };

        if !call.approve(AskKind::NewTask, payload(&mode, &message)).await? {
            return Ok(());
        }

        let child_id = call.spawn_child(&mode, &message)?;
        tracing::info!(child_id, mode, "Spawned sub-task");
        call.push_result(format!(
            "Successfully created new task in {} mode with message: {}",
            target.name, message
        ));
        Ok(())
    }
}
