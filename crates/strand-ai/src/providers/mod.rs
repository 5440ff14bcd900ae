//! Provider implementations

pub mod openai;

use async_trait::async_trait;

use crate::{ApiStream, Error, Message, ModelInfo, Result};

/// A model provider the task engine can call
#[async_trait]
pub trait ApiHandler: Send + Sync {
    /// Start a streamed response for `history` under `system_prompt`.
    ///
    /// Failures can surface here or from any element of the returned stream.
    async fn create_message(&self, system_prompt: &str, history: &[Message]) -> Result<ApiStream>;

    /// Metadata for the model this handler talks to
    fn model(&self) -> &ModelInfo;
}

/// Get an API key from the provided value or an environment variable
pub fn get_api_key(provided: Option<&str>, env_var: &str) -> Result<String> {
    if let Some(key) = provided {
        return Ok(key.to_string());
    }

    std::env::var(env_var).map_err(|_| Error::InvalidApiKey)
}

/// Render a tool invocation the way the model wrote it
pub fn render_tool_use(name: &str, params: &serde_json::Map<String, serde_json::Value>) -> String {
    let mut out = format!("<{name}>\n");
    for (key, value) in params {
        let value = match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        out.push_str(&format!("<{key}>{value}</{key}>\n"));
    }
    out.push_str(&format!("</{name}>"));
    out
}
