//! Conversation types shared by providers and the task engine

use base64::Engine;
use serde::{Deserialize, Serialize};

/// Message roles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
    System,
}

/// Serializes raw image bytes as base64 inside the JSON documents.
mod base64_bytes {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// An image attached to a user message or a tool result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    pub media_type: String,
}

impl Image {
    pub fn new(data: Vec<u8>, media_type: impl Into<String>) -> Self {
        Self {
            data,
            media_type: media_type.into(),
        }
    }

    /// `data:` URL form used by OpenAI-style image parts
    pub fn to_data_url(&self) -> String {
        format!(
            "data:{};base64,{}",
            self.media_type,
            base64::engine::general_purpose::STANDARD.encode(&self.data)
        )
    }
}

/// Content inside a tool result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolResultContent {
    Text { text: String },
    Image(Image),
}

/// A typed unit of conversation content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Plain text
    Text {
        text: String,
        /// Still streaming
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        partial: bool,
    },
    /// Image with its media type
    Image(Image),
    /// The model asked for a tool to run
    ToolUse {
        id: String,
        name: String,
        /// Parameter name to value, as an object
        params: serde_json::Map<String, serde_json::Value>,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        partial: bool,
    },
    /// Result of a tool invocation, linked by id
    ToolResult {
        tool_use_id: String,
        content: Vec<ToolResultContent>,
        #[serde(default)]
        is_error: bool,
    },
}

impl ContentBlock {
    /// Create a complete text block
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text {
            text: text.into(),
            partial: false,
        }
    }

    /// Create a tool result with a single text entry
    pub fn tool_result(
        tool_use_id: impl Into<String>,
        text: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self::ToolResult {
            tool_use_id: tool_use_id.into(),
            content: vec![ToolResultContent::Text { text: text.into() }],
            is_error,
        }
    }

    /// Whether the block is still being streamed
    pub fn is_partial(&self) -> bool {
        match self {
            Self::Text { partial, .. } | Self::ToolUse { partial, .. } => *partial,
            _ => false,
        }
    }

    /// Mark a streamed block complete
    pub fn set_partial(&mut self, value: bool) {
        if let Self::Text { partial, .. } | Self::ToolUse { partial, .. } = self {
            *partial = value;
        }
    }

    /// Get text if this is a text block
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text, .. } => Some(text),
            _ => None,
        }
    }

    /// Get the id if this is a tool invocation
    pub fn tool_use_id(&self) -> Option<&str> {
        match self {
            Self::ToolUse { id, .. } => Some(id),
            _ => None,
        }
    }
}

/// Message body: plain text or ordered blocks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

/// One entry of the model-facing conversation history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
    /// Milliseconds since the epoch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<i64>,
}

impl Message {
    /// Create a user message with text content
    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, MessageContent::Text(text.into()))
    }

    /// Create a user message with multiple content blocks
    pub fn user_blocks(blocks: Vec<ContentBlock>) -> Self {
        Self::new(Role::User, MessageContent::Blocks(blocks))
    }

    /// Create an assistant message with text content
    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, MessageContent::Text(text.into()))
    }

    /// Create an assistant message with content blocks
    pub fn assistant_blocks(blocks: Vec<ContentBlock>) -> Self {
        Self::new(Role::Assistant, MessageContent::Blocks(blocks))
    }

    fn new(role: Role, content: MessageContent) -> Self {
        Self {
            role,
            content,
            ts: Some(chrono::Utc::now().timestamp_millis()),
        }
    }

    /// Content as blocks, converting plain text into a single text block
    pub fn blocks(&self) -> Vec<ContentBlock> {
        match &self.content {
            MessageContent::Text(text) => vec![ContentBlock::text(text.clone())],
            MessageContent::Blocks(blocks) => blocks.clone(),
        }
    }

    /// Get combined text content
    pub fn text(&self) -> String {
        match &self.content {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| b.as_text())
                .collect::<Vec<_>>()
                .join("\n\n"),
        }
    }

    /// Ids of every tool invocation in this message
    pub fn tool_use_ids(&self) -> Vec<&str> {
        match &self.content {
            MessageContent::Blocks(blocks) => {
                blocks.iter().filter_map(|b| b.tool_use_id()).collect()
            }
            MessageContent::Text(_) => vec![],
        }
    }

    /// Ids referenced by tool results in this message
    pub fn tool_result_ids(&self) -> Vec<&str> {
        match &self.content {
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::ToolResult { tool_use_id, .. } => Some(tool_use_id.as_str()),
                    _ => None,
                })
                .collect(),
            MessageContent::Text(_) => vec![],
        }
    }

    pub fn is_user(&self) -> bool {
        self.role == Role::User
    }

    pub fn is_assistant(&self) -> bool {
        self.role == Role::Assistant
    }
}

/// Token usage for one provider call
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub input: u64,
    pub output: u64,
    pub cache_write: u64,
    pub cache_read: u64,
    /// Cost reported by the provider, in dollars
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_cost: Option<f64>,
}

impl Usage {
    /// Sum of every token class
    pub fn total_tokens(&self) -> u64 {
        self.input + self.output + self.cache_write + self.cache_read
    }

    /// Fold another usage report into this one
    pub fn accumulate(&mut self, other: &Usage) {
        self.input += other.input;
        self.output += other.output;
        self.cache_write += other.cache_write;
        self.cache_read += other.cache_read;
        if let Some(cost) = other.total_cost {
            self.total_cost = Some(self.total_cost.unwrap_or(0.0) + cost);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_serializes_as_base64() {
        let block = ContentBlock::Image(Image::new(vec![1, 2, 3], "image/png"));
        let json = serde_json::to_value(&block).unwrap();
        assert_eq!(json["type"], "image");
        assert_eq!(json["data"], "AQID");
        let back: ContentBlock = serde_json::from_value(json).unwrap();
        assert_eq!(back, block);
    }

    #[test]
    fn test_plain_text_message_shape() {
        let msg = Message::user("hi");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "user");
        assert_eq!(json["content"], "hi");
    }

    #[test]
    fn test_tool_ids() {
        let mut params = serde_json::Map::new();
        params.insert("path".into(), "a.txt".into());
        let msg = Message::assistant_blocks(vec![
            ContentBlock::text("reading"),
            ContentBlock::ToolUse {
                id: "t-0".into(),
                name: "read_file".into(),
                params,
                partial: false,
            },
        ]);
        assert_eq!(msg.tool_use_ids(), vec!["t-0"]);
        let reply = Message::user_blocks(vec![ContentBlock::tool_result("t-0", "ok", false)]);
        assert_eq!(reply.tool_result_ids(), vec!["t-0"]);
    }

    #[test]
    fn test_usage_accumulate() {
        let mut total = Usage::default();
        total.accumulate(&Usage {
            input: 10,
            output: 5,
            ..Default::default()
        });
        total.accumulate(&Usage {
            input: 1,
            cache_read: 2,
            total_cost: Some(0.5),
            ..Default::default()
        });
        assert_eq!(total.input, 11);
        assert_eq!(total.total_tokens(), 18);
        assert_eq!(total.total_cost, Some(0.5));
    }
}
