//! File writing tool
//!
//! The new content is written before the user is asked, so the diff can
//! be inspected in place. Until approval the edit is pending: a denial or
//! an abort puts the previous content back.

use std::{collections::HashMap, path::PathBuf, sync::Arc};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value, json};
use similar::TextDiff;
use strand_agent::{AskKind, Error, Result, TaskResources, Tool, ToolCall, ToolGroup};
use tokio::fs;
use tracing::{debug, warn};

use super::resolve;

struct PendingEdit {
    path: PathBuf,
    /// `None` when the file did not exist
    original: Option<String>,
}

/// Edits written but not yet approved, one per task
#[derive(Default)]
pub struct EditTracker {
    pending: Mutex<HashMap<String, PendingEdit>>,
}

impl EditTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn begin(&self, task_id: &str, path: PathBuf, original: Option<String>) {
        self.pending
            .lock()
            .insert(task_id.to_string(), PendingEdit { path, original });
    }

    /// Keep the edit
    fn commit(&self, task_id: &str) {
        self.pending.lock().remove(task_id);
    }

    /// Put back what was there before the pending edit
    pub async fn revert(&self, task_id: &str) -> Result<bool> {
        let edit = self.pending.lock().remove(task_id);
        let Some(edit) = edit else {
            return Ok(false);
        };
        match edit.original {
            Some(original) => fs::write(&edit.path, original).await?,
            None => fs::remove_file(&edit.path).await?,
        }
        debug!(task_id, path = %edit.path.display(), "Reverted pending edit");
        Ok(true)
    }

    pub fn has_pending(&self, task_id: &str) -> bool {
        self.pending.lock().contains_key(task_id)
    }
}

#[async_trait]
impl TaskResources for EditTracker {
    async fn release(&self, task_id: &str) {
        self.pending.lock().remove(task_id);
    }

    async fn revert_pending_edit(&self, task_id: &str) -> bool {
        match self.revert(task_id).await {
            Ok(reverted) => reverted,
            Err(e) => {
                warn!(task_id, "Failed to revert pending edit: {}", e);
                false
            }
        }
    }
}

/// Writes a whole file, creating parent directories
pub struct WriteToFileTool {
    edits: Arc<EditTracker>,
}

impl WriteToFileTool {
    pub fn new(edits: Arc<EditTracker>) -> Self {
        Self { edits }
    }
}

#[async_trait]
impl Tool for WriteToFileTool {
    fn name(&self) -> &str {
        "write_to_file"
    }

    fn description(&self) -> &str {
        "Write the complete content of a file, relative to the working directory. Creates the file and its parent directories if needed, and overwrites an existing file."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path to the file to write"
                },
                "content": {
                    "type": "string",
                    "description": "The full content of the file"
                }
            },
            "required": ["path", "content"]
        })
    }

    fn group(&self) -> ToolGroup {
        ToolGroup::Edit
    }

    fn mutates_workspace(&self) -> bool {
        true
    }

    fn describe(&self, params: &Map<String, Value>) -> String {
        let path = params.get("path").and_then(Value::as_str).unwrap_or_default();
        format!("[write_to_file for '{path}']")
    }

    async fn preview(&self, call: &mut ToolCall<'_>) -> Result<()> {
        let path = call.param_for_display("path");
        let exists = resolve(call.cwd(), &path).exists();
        let payload = json!({ "tool": payload_kind(exists), "path": path });
        call.ask_partial(AskKind::Tool, payload.to_string()).await
    }

    async fn execute(&self, call: &mut ToolCall<'_>) -> Result<()> {
        let path = call.param("path").unwrap_or_default().to_string();
        // Missing or empty parameters are rejected before execute
        let content = strip_code_fences(call.param("content").unwrap_or_default());
        let absolute = resolve(call.cwd(), &path);

        let original = fs::read_to_string(&absolute).await.ok();
        let diff = unified_diff(&path, original.as_deref().unwrap_or_default(), &content);

        if let Some(parent) = absolute.parent() {
            if let Err(e) = fs::create_dir_all(parent).await {
                return call.handle_error("creating directory", &Error::Io(e)).await;
            }
        }
        let exists = original.is_some();
        if let Err(e) = fs::write(&absolute, &content).await {
            return call.handle_error("writing file", &Error::Io(e)).await;
        }
        self.edits.begin(call.task_id(), absolute, original);

        let payload = json!({ "tool": payload_kind(exists), "path": path, "diff": diff });
        if !call.approve(AskKind::Tool, payload.to_string()).await? {
            self.edits.revert(call.task_id()).await?;
            return Ok(());
        }
        self.edits.commit(call.task_id());
        call.push_result(format!("The content was successfully saved to {path}."));
        Ok(())
    }
}

fn payload_kind(exists: bool) -> &'static str {
    if exists { "editedExistingFile" } else { "newFileCreated" }
}

/// Models sometimes wrap the file in a markdown fence
fn strip_code_fences(content: &str) -> String {
    let mut lines: Vec<&str> = content.lines().collect();
    if lines.first().is_some_and(|l| l.trim_start().starts_with("```")) {
        lines.remove(0);
    }
    if lines.last().is_some_and(|l| l.trim() == "```") {
        lines.pop();
    }
    let mut out = lines.join("\n");
    if !out.is_empty() && content.ends_with('\n') {
        out.push('\n');
    }
    out
}

fn unified_diff(path: &str, before: &str, after: &str) -> String {
    TextDiff::from_lines(before, after)
        .unified_diff()
        .context_radius(3)
        .header(path, path)
        .to_string()
}
