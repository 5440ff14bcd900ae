//! OpenAI-compatible Chat Completions provider

use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest_eventsource::{Event, EventSource};
use serde::{Deserialize, Serialize};

use super::{ApiHandler, render_tool_use};
use crate::{
    error::{Error, Result},
    models::ModelInfo,
    stream::{ApiChunk, ApiStream},
    types::{ContentBlock, Message, MessageContent, Role, ToolResultContent, Usage},
};

/// Chat Completions client for any OpenAI-compatible endpoint
pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: ModelInfo,
}

impl OpenAiProvider {
    pub fn new(api_key: impl Into<String>, base_url: impl Into<String>, model: ModelInfo) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model,
        }
    }

    fn build_request(&self, system_prompt: &str, history: &[Message]) -> OpenAiRequest {
        let mut messages = vec![OpenAiMessage {
            role: "system",
            content: vec![Part::Text {
                text: system_prompt.to_string(),
            }],
        }];
        messages.extend(history.iter().map(convert_message));

        OpenAiRequest {
            model: self.model.id.clone(),
            messages,
            stream: true,
            stream_options: StreamOptions {
                include_usage: true,
            },
            max_tokens: self.model.max_tokens,
        }
    }
}

#[async_trait]
impl ApiHandler for OpenAiProvider {
    async fn create_message(&self, system_prompt: &str, history: &[Message]) -> Result<ApiStream> {
        let request = self.build_request(system_prompt, history);
        let url = format!("{}/chat/completions", self.base_url);

        let request_builder = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("content-type", "application/json")
            .json(&request);

        let event_source = EventSource::new(request_builder)
            .map_err(|e| Error::Sse(format!("Failed to create event source: {}", e)))?;

        Ok(Box::pin(create_stream(event_source)))
    }

    fn model(&self) -> &ModelInfo {
        &self.model
    }
}

fn convert_message(msg: &Message) -> OpenAiMessage {
    let role = match msg.role {
        Role::Assistant => "assistant",
        Role::System => "system",
        Role::User | Role::Tool => "user",
    };
    let blocks = match &msg.content {
        MessageContent::Text(text) => {
            return OpenAiMessage {
                role,
                content: vec![Part::Text { text: text.clone() }],
            };
        }
        MessageContent::Blocks(blocks) => blocks,
    };

    let mut content = Vec::new();
    for block in blocks {
        match block {
            ContentBlock::Text { text, .. } => content.push(Part::Text { text: text.clone() }),
            ContentBlock::Image(image) => content.push(Part::ImageUrl {
                image_url: ImageUrl {
                    url: image.to_data_url(),
                },
            }),
            ContentBlock::ToolUse { name, params, .. } => content.push(Part::Text {
                text: render_tool_use(name, params),
            }),
            ContentBlock::ToolResult { content: items, .. } => {
                for item in items {
                    content.push(match item {
                        ToolResultContent::Text { text } => Part::Text { text: text.clone() },
                        ToolResultContent::Image(image) => Part::ImageUrl {
                            image_url: ImageUrl {
                                url: image.to_data_url(),
                            },
                        },
                    });
                }
            }
        }
    }
    OpenAiMessage { role, content }
}

async fn status_error(response: reqwest::Response) -> Error {
    let status = response.status();
    let retry_after = response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let body = response.text().await.unwrap_or_default();
    classify_status(status.as_u16(), retry_after.as_deref(), body)
}

fn classify_status(status: u16, retry_after: Option<&str>, body: String) -> Error {
    match status {
        429 => Error::rate_limited(retry_after, &body),
        401 | 403 => Error::InvalidApiKey,
        _ => {
            let error = Error::api(format!("http_{status}"), body.clone());
            if error.is_context_overflow() {
                Error::ContextOverflow(body)
            } else {
                error
            }
        }
    }
}

fn create_stream(mut event_source: EventSource) -> impl futures::Stream<Item = Result<ApiChunk>> {
    stream! {
        while let Some(event) = event_source.next().await {
            match event {
                Ok(Event::Open) => {}
                Ok(Event::Message(msg)) => {
                    if msg.data == "[DONE]" {
                        break;
                    }

                    let chunk: StreamChunk = match serde_json::from_str(&msg.data) {
                        Ok(chunk) => chunk,
                        Err(e) => {
                            let detail = format!("Failed to parse chunk: {}", e);
                            yield Err(Error::UnexpectedResponse(detail));
                            break;
                        }
                    };

                    if let Some(error) = chunk.error {
                        let code = error.code.unwrap_or_else(|| "error".into());
                        yield Err(Error::api(code, error.message));
                        break;
                    }

                    for choice in &chunk.choices {
                        let delta = &choice.delta;
                        let reasoning =
                            delta.reasoning_content.as_ref().or(delta.reasoning.as_ref());
                        if let Some(text) = reasoning.filter(|t| !t.is_empty()) {
                            yield Ok(ApiChunk::Reasoning { text: text.clone() });
                        }
                        if let Some(text) = delta.content.as_ref().filter(|t| !t.is_empty()) {
                            yield Ok(ApiChunk::Text { text: text.clone() });
                        }
                    }

                    if let Some(usage) = chunk.usage {
                        let cache_read = usage
                            .prompt_tokens_details
                            .and_then(|d| d.cached_tokens)
                            .unwrap_or(0);
                        yield Ok(ApiChunk::Usage(Usage {
                            input: usage.prompt_tokens.saturating_sub(cache_read),
                            output: usage.completion_tokens,
                            cache_write: 0,
                            cache_read,
                            total_cost: usage.cost,
                        }));
                    }
                }
                Err(reqwest_eventsource::Error::StreamEnded) => break,
                Err(reqwest_eventsource::Error::InvalidStatusCode(_, response)) => {
                    yield Err(status_error(response).await);
                    break;
                }
                Err(e) => {
                    yield Err(Error::Sse(e.to_string()));
                    break;
                }
            }
        }
        event_source.close();
    }
}

// Request/Response types

#[derive(Debug, Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    stream: bool,
    stream_options: StreamOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Serialize)]
struct OpenAiMessage {
    role: &'static str,
    content: Vec<Part>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Part {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<StreamUsage>,
    #[serde(default)]
    error: Option<StreamError>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    content: Option<String>,
    reasoning_content: Option<String>,
    reasoning: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
    prompt_tokens_details: Option<PromptTokensDetails>,
    cost: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct PromptTokensDetails {
    cached_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct StreamError {
    message: String,
    code: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Image;

    fn provider() -> OpenAiProvider {
        OpenAiProvider::new("key", "https://example.test/v1/", ModelInfo::new("gpt-4o", 128_000))
    }

    #[test]
    fn test_status_classification() {
        assert!(matches!(classify_status(401, None, String::new()), Error::InvalidApiKey));
        assert!(matches!(
            classify_status(429, Some("3"), "{}".into()),
            Error::RateLimited { retry_after: Some(3) }
        ));
        let body = r#"{"error":{"code":"context_length_exceeded"}}"#;
        let overflow = classify_status(400, None, body.into());
        assert!(matches!(overflow, Error::ContextOverflow(_)));
        assert!(!overflow.is_retryable());
        let overloaded = classify_status(529, None, "server overloaded".into());
        assert!(matches!(overloaded, Error::Api { .. }));
        assert!(overloaded.is_retryable());
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        assert_eq!(provider().base_url, "https://example.test/v1");
    }

    #[test]
    fn test_request_renders_tool_blocks_as_text() {
        let mut params = serde_json::Map::new();
        params.insert("path".into(), "a.txt".into());
        let history = vec![
            Message::user("read a.txt"),
            Message::assistant_blocks(vec![ContentBlock::ToolUse {
                id: "t-0".into(),
                name: "read_file".into(),
                params,
                partial: false,
            }]),
            Message::user_blocks(vec![
                ContentBlock::tool_result("t-0", "[read_file for 'a.txt'] Result:", false),
                ContentBlock::Image(Image::new(vec![0], "image/png")),
            ]),
        ];
        let request = provider().build_request("sys", &history);
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(
            json["messages"][2]["content"][0]["text"],
            "<read_file>\n<path>a.txt</path>\n</read_file>"
        );
        assert_eq!(json["messages"][3]["content"][1]["type"], "image_url");
        assert_eq!(json["stream_options"]["include_usage"], true);
    }

    #[test]
    fn test_usage_chunk_deserializes() {
        let data = r#"{"choices":[],"usage":{"prompt_tokens":12,"completion_tokens":3,"prompt_tokens_details":{"cached_tokens":2}}}"#;
        let chunk: StreamChunk = serde_json::from_str(data).unwrap();
        let usage = chunk.usage.unwrap();
        assert_eq!(usage.prompt_tokens, 12);
        assert_eq!(usage.prompt_tokens_details.unwrap().cached_tokens, Some(2));
    }
}
