//! UI-facing message log entries

use serde::{Deserialize, Serialize};
use strand_ai::{Image, Usage};

/// Prompts that wait for a user response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AskKind {
    Followup,
    Command,
    Tool,
    CompletionResult,
    ApiReqFailed,
    ResumeTask,
    ResumeCompletedTask,
    MistakeLimitReached,
    FinishSubtask,
    NewTask,
}

/// Notices that never wait
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SayKind {
    Text,
    Reasoning,
    Error,
    ApiReqStarted,
    ApiReqFinished,
    ApiReqRetried,
    ApiReqRetryDelayed,
    ApiReqDeleted,
    CompletionResult,
    UserFeedback,
    CheckpointSaved,
    RateLimit,
    SubtaskResult,
    Tool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UiKind {
    Ask { ask: AskKind },
    Say { say: SayKind },
}

/// One entry in the UI message log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UiMessage {
    /// Milliseconds since the epoch, unique within one log
    pub ts: i64,
    #[serde(flatten)]
    pub kind: UiKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<Image>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub partial: bool,
    /// Set on checkpoint markers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<CheckpointMarker>,
}

impl UiMessage {
    pub fn say(say: SayKind, text: Option<String>) -> Self {
        Self {
            ts: 0,
            kind: UiKind::Say { say },
            text,
            images: Vec::new(),
            partial: false,
            checkpoint: None,
        }
    }

    pub fn ask(ask: AskKind, text: Option<String>) -> Self {
        Self {
            ts: 0,
            kind: UiKind::Ask { ask },
            text,
            images: Vec::new(),
            partial: false,
            checkpoint: None,
        }
    }

    pub fn is_say(&self, kind: SayKind) -> bool {
        self.kind == UiKind::Say { say: kind }
    }

    pub fn is_ask(&self, kind: AskKind) -> bool {
        self.kind == UiKind::Ask { ask: kind }
    }

    /// Decode the payload of an `api_req_started` entry
    pub fn api_req_info(&self) -> Option<ApiReqInfo> {
        if !self.is_say(SayKind::ApiReqStarted) {
            return None;
        }
        self.text
            .as_deref()
            .and_then(|t| serde_json::from_str(t).ok())
    }
}

/// Checkpoint metadata attached to a `checkpoint_saved` entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMarker {
    pub is_first: bool,
    pub from: Option<String>,
    pub to: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    StreamingFailed,
    UserCancelled,
}

/// Payload of an `api_req_started` entry, updated in place as the turn runs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiReqInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_in: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_out: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_writes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_reads: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<CancelReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub streaming_failed_message: Option<String>,
}

impl ApiReqInfo {
    pub fn with_usage(mut self, usage: &Usage, cost: f64) -> Self {
        self.tokens_in = Some(usage.input);
        self.tokens_out = Some(usage.output);
        self.cache_writes = Some(usage.cache_write);
        self.cache_reads = Some(usage.cache_read);
        self.cost = Some(cost);
        self
    }

    pub fn total_tokens(&self) -> u64 {
        self.tokens_in.unwrap_or(0)
            + self.tokens_out.unwrap_or(0)
            + self.cache_writes.unwrap_or(0)
            + self.cache_reads.unwrap_or(0)
    }
}

/// Which button the user pressed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AskResponseKind {
    Yes,
    No,
    /// Free-form reply
    Message,
    /// Partial asks never wait
    Ignored,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AskResponse {
    pub response: AskResponseKind,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub images: Vec<Image>,
}

impl AskResponse {
    pub fn yes() -> Self {
        Self::of(AskResponseKind::Yes, None)
    }

    pub fn no() -> Self {
        Self::of(AskResponseKind::No, None)
    }

    pub fn message(text: impl Into<String>) -> Self {
        Self::of(AskResponseKind::Message, Some(text.into()))
    }

    pub fn ignored() -> Self {
        Self::of(AskResponseKind::Ignored, None)
    }

    fn of(response: AskResponseKind, text: Option<String>) -> Self {
        Self {
            response,
            text,
            images: Vec::new(),
        }
    }

    pub fn is_yes(&self) -> bool {
        self.response == AskResponseKind::Yes
    }

    /// Non-empty reply text
    pub fn feedback(&self) -> Option<&str> {
        self.text.as_deref().filter(|t| !t.trim().is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ui_message_wire_shape() {
        let msg = UiMessage::ask(AskKind::Tool, Some("{}".into()));
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "ask");
        assert_eq!(json["ask"], "tool");
        assert!(json.get("partial").is_none());
        let back: UiMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_api_req_info_roundtrip_through_text() {
        let info = ApiReqInfo {
            request: Some("hi".into()),
            ..Default::default()
        }
        .with_usage(
            &Usage {
                input: 10,
                output: 5,
                ..Default::default()
            },
            0.25,
        );
        let msg = UiMessage::say(
            SayKind::ApiReqStarted,
            Some(serde_json::to_string(&info).unwrap()),
        );
        let text = msg.text.as_deref().unwrap();
        assert!(text.contains("\"tokensIn\":10"));
        assert_eq!(msg.api_req_info().unwrap().total_tokens(), 15);
    }
}
