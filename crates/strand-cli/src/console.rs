//! stdin/stdout front end: answers asks and prints what tasks say

use std::collections::HashSet;

use async_trait::async_trait;
use serde_json::Value;
use strand_agent::{AskKind, AskResponse, SayKind, TaskEvent, UiMessage, UserChannel, ui::UiKind};
use tokio::{
    io::{AsyncBufReadExt, BufReader, Lines, Stdin},
    sync::{Mutex, broadcast},
};

/// Asks on stdout, answers from stdin. End of input counts as "no".
pub struct ConsoleChannel {
    input: Mutex<Lines<BufReader<Stdin>>>,
}

impl ConsoleChannel {
    pub fn new() -> Self {
        Self {
            input: Mutex::new(BufReader::new(tokio::io::stdin()).lines()),
        }
    }
}

impl Default for ConsoleChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UserChannel for ConsoleChannel {
    async fn ask(&self, _task_id: &str, message: &UiMessage) -> AskResponse {
        let UiKind::Ask { ask } = message.kind else {
            return AskResponse::ignored();
        };
        let text = message.text.as_deref().unwrap_or_default();
        println!("\n{}", ask_prompt(ask, text));

        let mut input = self.input.lock().await;
        match input.next_line().await {
            Ok(Some(line)) => parse_answer(ask, text, &line),
            Ok(None) | Err(_) => AskResponse::no(),
        }
    }
}

fn field<'a>(payload: &'a Value, key: &str) -> &'a str {
    payload.get(key).and_then(Value::as_str).unwrap_or_default()
}

/// What the user sees for an ask
pub fn ask_prompt(kind: AskKind, text: &str) -> String {
    let payload: Value = serde_json::from_str(text).unwrap_or(Value::Null);
    match kind {
        AskKind::Followup => {
            let question = if payload.is_object() { field(&payload, "question") } else { text };
            let mut out = format!("? {question}");
            for (i, suggestion) in suggestions(&payload).iter().enumerate() {
                out.push_str(&format!("\n  {}. {}", i + 1, suggestion));
            }
            out.push_str("\n> ");
            out
        }
        AskKind::Command => format!("Run `{text}`? [Y/n or feedback] "),
        AskKind::Tool => {
            let mut out = format!(
                "Allow {} on {}?",
                field(&payload, "tool"),
                field(&payload, "path")
            );
            let diff = field(&payload, "diff");
            if !diff.is_empty() {
                out.push('\n');
                out.push_str(diff);
            }
            out.push_str(" [Y/n or feedback] ");
            out
        }
        AskKind::CompletionResult => "Accept the result? [Y or feedback] ".to_string(),
        AskKind::ApiReqFailed => format!("Request failed: {text}\nRetry? [Y/n] "),
        AskKind::ResumeTask => {
            "Resume the interrupted task? [Y/n or new instructions] ".to_string()
        }
        AskKind::ResumeCompletedTask => {
            "Resume the completed task? [Y/n or new instructions] ".to_string()
        }
        AskKind::MistakeLimitReached => {
            format!("The model is having trouble. {text}\nGuidance (empty to continue): ")
        }
        AskKind::FinishSubtask => {
            "Hand the sub-task result back to its parent? [Y or feedback] ".to_string()
        }
        AskKind::NewTask => format!(
            "Start a sub-task in {} mode: {}? [Y/n or feedback] ",
            field(&payload, "mode"),
            field(&payload, "content")
        ),
    }
}

fn suggestions(payload: &Value) -> Vec<&str> {
    payload
        .get("suggest")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default()
}

/// Map a typed line to a response. An empty line accepts, except for
/// follow-up questions, where a number picks a suggestion.
pub fn parse_answer(kind: AskKind, text: &str, line: &str) -> AskResponse {
    let line = line.trim();
    if kind == AskKind::Followup {
        let payload: Value = serde_json::from_str(text).unwrap_or(Value::Null);
        let picked = line
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|i| suggestions(&payload).get(i).map(|s| s.to_string()));
        return AskResponse::message(picked.unwrap_or_else(|| line.to_string()));
    }
    match line.to_ascii_lowercase().as_str() {
        "" | "y" | "yes" => AskResponse::yes(),
        "n" | "no" => AskResponse::no(),
        _ => AskResponse::message(line),
    }
}

/// Prints finished say messages from every task
pub struct Printer {
    printed: HashSet<(String, i64)>,
}

impl Printer {
    pub fn new() -> Self {
        Self {
            printed: HashSet::new(),
        }
    }

    /// Print events until the channel closes
    pub async fn run(mut self, mut events: broadcast::Receiver<TaskEvent>) {
        loop {
            match events.recv().await {
                Ok(event) => self.handle(&event),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    pub fn handle(&mut self, event: &TaskEvent) {
        match event {
            TaskEvent::MessageAdded { task_id, message }
            | TaskEvent::MessageUpdated { task_id, message } => {
                if let Some(line) = self.render(task_id, message) {
                    println!("{line}");
                }
            }
            TaskEvent::TaskSpawned { child_id, .. } => {
                println!("[sub-task {} started]", short(child_id))
            }
            TaskEvent::TaskCompleted { usage, .. } => println!(
                "[tokens: {} in, {} out | cost: ${:.4}]",
                usage.total_tokens_in, usage.total_tokens_out, usage.total_cost
            ),
            TaskEvent::CheckpointsDisabled { .. } => eprintln!("[checkpoints disabled]"),
            _ => {}
        }
    }

    /// One line per finished message, the first time it finishes
    fn render(&mut self, task_id: &str, message: &UiMessage) -> Option<String> {
        let UiKind::Say { say } = message.kind else {
            return None;
        };
        if message.partial {
            return None;
        }
        let text = message.text.as_deref().unwrap_or_default();
        // Request entries print once their cost is known
        let unpriced = message.api_req_info().is_none_or(|i| i.cost.is_none());
        if say == SayKind::ApiReqStarted && unpriced {
            return None;
        }
        if !self.printed.insert((task_id.to_string(), message.ts)) {
            return None;
        }
        let line = match say {
            SayKind::Text => text.to_string(),
            SayKind::Reasoning => format!("(thinking) {text}"),
            SayKind::Error => format!("error: {text}"),
            SayKind::CompletionResult => format!("\n== Result ==\n{text}"),
            SayKind::SubtaskResult => format!("[sub-task result] {text}"),
            SayKind::CheckpointSaved => format!("[checkpoint {} at {}]", short(text), message.ts),
            SayKind::Tool => format!("[auto-approved] {text}"),
            SayKind::ApiReqStarted => {
                let info = message.api_req_info()?;
                format!(
                    "[request: {} in, {} out, ${:.4}]",
                    info.tokens_in.unwrap_or(0),
                    info.tokens_out.unwrap_or(0),
                    info.cost.unwrap_or(0.0)
                )
            }
            SayKind::ApiReqRetryDelayed | SayKind::RateLimit | SayKind::ApiReqDeleted => {
                format!("[{text}]")
            }
            SayKind::UserFeedback | SayKind::ApiReqFinished | SayKind::ApiReqRetried => return None,
        };
        Some(line)
    }
}

impl Default for Printer {
    fn default() -> Self {
        Self::new()
    }
}

fn short(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}
