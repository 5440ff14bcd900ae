//! File reading tool

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use strand_agent::{AskKind, Error, Result, Tool, ToolCall};
use tokio::fs;

use super::resolve;

const MAX_LINES: usize = 2000;
const MAX_LINE_LENGTH: usize = 2000;

/// Reads a file with line numbers
pub struct ReadFileTool;

impl ReadFileTool {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ReadFileTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read the contents of a file, relative to the working directory. Output lines are prefixed with their line number."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path to the file to read"
                }
            },
            "required": ["path"]
        })
    }

    fn describe(&self, params: &Map<String, Value>) -> String {
        let path = params.get("path").and_then(Value::as_str).unwrap_or_default();
        format!("[read_file for '{path}']")
    }

    async fn preview(&self, call: &mut ToolCall<'_>) -> Result<()> {
        let payload = json!({ "tool": "readFile", "path": call.param_for_display("path") });
        call.ask_partial(AskKind::Tool, payload.to_string()).await
    }

    async fn execute(&self, call: &mut ToolCall<'_>) -> Result<()> {
        let path = call.param("path").unwrap_or_default().to_string();
        let absolute = resolve(call.cwd(), &path);
        let payload = json!({
            "tool": "readFile",
            "path": path,
            "content": absolute.display().to_string(),
        });
        if !call.approve(AskKind::Tool, payload.to_string()).await? {
            return Ok(());
        }

        match fs::read_to_string(&absolute).await {
            Ok(content) => {
                call.push_result(number_lines(&content));
                Ok(())
            }
            Err(e) => call.handle_error("reading file", &Error::Io(e)).await,
        }
    }
}

/// `N | line` for every line, capped at `MAX_LINES` lines
fn number_lines(content: &str) -> String {
    let lines: Vec<&str> = content.lines().collect();
    let width = lines.len().min(MAX_LINES).to_string().len();
    let mut output = lines
        .iter()
        .take(MAX_LINES)
        .enumerate()
        .map(|(i, line)| {
            let line = match line.char_indices().nth(MAX_LINE_LENGTH) {
                Some((cut, _)) => &line[..cut],
                None => line,
            };
            format!("{:>width$} | {}", i + 1, line)
        })
        .collect::<Vec<_>>()
        .join("\n");
    if lines.len() > MAX_LINES {
        output.push_str(&format!(
            "\n\n... ({} more lines not shown)",
            lines.len() - MAX_LINES
        ));
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_number_lines() {
        assert_eq!(number_lines("a\nb"), "1 | a\n2 | b");
        let long: String = (0..12).map(|i| format!("l{i}\n")).collect();
        assert!(number_lines(&long).starts_with(" 1 | l0"));
        assert_eq!(number_lines(""), "");
    }

    #[test]
    fn test_number_lines_caps_output() {
        let content = "x\n".repeat(MAX_LINES + 5);
        let output = number_lines(&content);
        assert!(output.ends_with("(5 more lines not shown)"));
    }
}
