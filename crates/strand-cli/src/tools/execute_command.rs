//! Shell command execution tool

use std::{collections::HashMap, process::Stdio, sync::Arc, time::Duration};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value, json};
use strand_agent::{AskKind, Error, Result, TaskResources, Tool, ToolCall, ToolGroup};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Command,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Maximum output size in bytes before truncation
const MAX_OUTPUT_SIZE: usize = 100_000;
/// Maximum number of lines before truncation
const MAX_OUTPUT_LINES: usize = 1000;
const DEFAULT_TIMEOUT_SECS: u64 = 600;

/// Commands still running, per task. Releasing a task kills them.
#[derive(Default)]
pub struct Terminals {
    running: Mutex<HashMap<String, CancellationToken>>,
}

impl Terminals {
    pub fn new() -> Self {
        Self::default()
    }

    /// A token cancelled by either the task's abort or its release
    fn open(&self, task_id: &str, parent: &CancellationToken) -> CancellationToken {
        let token = parent.child_token();
        self.running.lock().insert(task_id.to_string(), token.clone());
        token
    }

    fn close(&self, task_id: &str) {
        self.running.lock().remove(task_id);
    }
}

#[async_trait]
impl TaskResources for Terminals {
    async fn release(&self, task_id: &str) {
        if let Some(token) = self.running.lock().remove(task_id) {
            debug!(task_id, "Killing running command");
            token.cancel();
        }
    }
}

/// Runs a shell command in the working directory
pub struct ExecuteCommandTool {
    terminals: Arc<Terminals>,
}

impl ExecuteCommandTool {
    pub fn new(terminals: Arc<Terminals>) -> Self {
        Self { terminals }
    }
}

#[async_trait]
impl Tool for ExecuteCommandTool {
    fn name(&self) -> &str {
        "execute_command"
    }

    fn description(&self) -> &str {
        "Execute a shell command in the working directory. Returns stdout and stderr along with the exit code."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute"
                }
            },
            "required": ["command"]
        })
    }

    fn group(&self) -> ToolGroup {
        ToolGroup::Command
    }

    fn mutates_workspace(&self) -> bool {
        true
    }

    fn describe(&self, params: &Map<String, Value>) -> String {
        let command = params.get("command").and_then(Value::as_str).unwrap_or_default();
        format!("[execute_command for '{command}']")
    }

    async fn preview(&self, call: &mut ToolCall<'_>) -> Result<()> {
        let command = call.param_for_display("command");
        call.ask_partial(AskKind::Command, command).await
    }

    async fn execute(&self, call: &mut ToolCall<'_>) -> Result<()> {
        let command = call.param("command").unwrap_or_default().to_string();
        if !call.approve(AskKind::Command, command.clone()).await? {
            return Ok(());
        }

        let token = self.terminals.open(call.task_id(), &call.cancel_token());
        let timeout = Duration::from_secs(DEFAULT_TIMEOUT_SECS);
        let outcome = run(&command, call.cwd(), &token, timeout).await;
        self.terminals.close(call.task_id());

        match outcome {
            Ok(CommandOutcome::Cancelled) => Err(Error::Aborted),
            Ok(outcome) => {
                call.push_result(outcome.describe());
                Ok(())
            }
            Err(e) => call.handle_error("executing command", &Error::Io(e)).await,
        }
    }
}

#[derive(Debug, PartialEq)]
enum CommandOutcome {
    Exited { output: String, code: Option<i32> },
    TimedOut { output: String, secs: u64 },
    Cancelled,
}

impl CommandOutcome {
    fn describe(&self) -> String {
        match self {
            CommandOutcome::Exited { output, code: Some(0) } => {
                format!("Command executed.\nOutput:\n{output}")
            }
            CommandOutcome::Exited { output, code } => {
                let code = code.map(|c| c.to_string()).unwrap_or_else(|| "unknown".into());
                format!("Command executed.\nOutput:\n{output}\n\nCommand exited with code {code}")
            }
            CommandOutcome::TimedOut { output, secs } => format!(
                "Command is still running after {secs} seconds and was stopped.\n\
                 Output so far:\n{output}"
            ),
            CommandOutcome::Cancelled => "Command cancelled".to_string(),
        }
    }
}

/// Collects lines up to the size limits, then notes what was dropped
#[derive(Default)]
struct Captured {
    text: String,
    lines: usize,
    truncated: bool,
}

impl Captured {
    fn push(&mut self, line: &str) {
        if self.truncated {
            return;
        }
        if self.lines >= MAX_OUTPUT_LINES || self.text.len() + line.len() > MAX_OUTPUT_SIZE {
            self.truncated = true;
            return;
        }
        if !self.text.is_empty() {
            self.text.push('\n');
        }
        self.text.push_str(line);
        self.lines += 1;
    }

    fn finish(self, label: &str) -> String {
        let mut text = self.text;
        if self.truncated {
            text.push_str(&format!(
                "\n\n... ({label} truncated at {} lines / {}KB)",
                self.lines,
                MAX_OUTPUT_SIZE / 1024
            ));
        }
        text
    }
}

fn combine(stdout: Captured, stderr: Captured) -> String {
    let mut output = stdout.finish("stdout");
    let errors = stderr.finish("stderr");
    if !errors.is_empty() {
        if !output.is_empty() {
            output.push('\n');
        }
        output.push_str(&errors);
    }
    if output.is_empty() {
        output = "(no output)".to_string();
    }
    output
}

async fn run(
    command: &str,
    cwd: &std::path::Path,
    cancel: &CancellationToken,
    timeout: Duration,
) -> std::io::Result<CommandOutcome> {
    let (shell, shell_arg) = if cfg!(target_os = "windows") {
        ("cmd", "/C")
    } else {
        ("sh", "-c")
    };

    let mut child = Command::new(shell)
        .arg(shell_arg)
        .arg(command)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| std::io::Error::other("stdout not captured"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| std::io::Error::other("stderr not captured"))?;
    let mut stdout_lines = BufReader::new(stdout).lines();
    let mut stderr_lines = BufReader::new(stderr).lines();

    let mut out = Captured::default();
    let mut err = Captured::default();
    let mut stdout_open = true;
    let mut stderr_open = true;
    let deadline = tokio::time::Instant::now() + timeout;

    // Read both pipes to the end before waiting so no output is lost
    while stdout_open || stderr_open {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                return Ok(CommandOutcome::Cancelled);
            }
            _ = tokio::time::sleep_until(deadline) => {
                let _ = child.kill().await;
                return Ok(CommandOutcome::TimedOut {
                    output: combine(out, err),
                    secs: timeout.as_secs(),
                });
            }
            line = stdout_lines.next_line(), if stdout_open => match line? {
                Some(l) => out.push(&l),
                None => stdout_open = false,
            },
            line = stderr_lines.next_line(), if stderr_open => match line? {
                Some(l) => err.push(&l),
                None => stderr_open = false,
            },
        }
    }

    let status = tokio::select! {
        _ = cancel.cancelled() => {
            let _ = child.kill().await;
            return Ok(CommandOutcome::Cancelled);
        }
        status = child.wait() => status?,
    };
    Ok(CommandOutcome::Exited {
        output: combine(out, err),
        code: status.code(),
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    async fn sh(command: &str) -> CommandOutcome {
        let token = CancellationToken::new();
        run(command, &std::env::temp_dir(), &token, Duration::from_secs(30))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_collects_both_streams() {
        let outcome = sh("echo out; echo err >&2").await;
        assert_eq!(
            outcome,
            CommandOutcome::Exited {
                output: "out\nerr".into(),
                code: Some(0)
            }
        );
    }

    #[tokio::test]
    async fn test_exit_code_is_reported() {
        let outcome = sh("exit 3").await;
        let text = outcome.describe();
        assert!(text.contains("(no output)"));
        assert!(text.ends_with("Command exited with code 3"));
    }

    #[tokio::test]
    async fn test_release_kills_running_command() {
        let terminals = Arc::new(Terminals::new());
        let token = terminals.open("t", &CancellationToken::new());
        let releaser = terminals.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            releaser.release("t").await;
        });
        let outcome = run("sleep 30", &std::env::temp_dir(), &token, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(outcome, CommandOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_timeout_stops_command() {
        let token = CancellationToken::new();
        let timeout = Duration::from_millis(200);
        let outcome = run("echo started; sleep 30", &std::env::temp_dir(), &token, timeout)
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            CommandOutcome::TimedOut { ref output, .. } if output == "started"
        ));
    }

    #[test]
    fn test_output_is_truncated() {
        let mut captured = Captured::default();
        for i in 0..MAX_OUTPUT_LINES + 10 {
            captured.push(&format!("line {i}"));
        }
        let text = captured.finish("stdout");
        assert!(text.contains("stdout truncated at 1000 lines"));
    }
}
