//! Model metadata and pricing

use serde::{Deserialize, Serialize};

use crate::types::Usage;

/// Max output tokens assumed for thinking models that do not declare one
pub const THINKING_MODEL_DEFAULT_MAX_TOKENS: u32 = 16_384;

/// Cost information for a model (per million tokens)
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CostInfo {
    #[serde(default)]
    pub input: f64,
    #[serde(default)]
    pub output: f64,
    #[serde(default)]
    pub cache_write: f64,
    #[serde(default)]
    pub cache_read: f64,
}

/// Model definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Model identifier sent to the provider
    pub id: String,
    /// Context window size in tokens
    pub context_window: u32,
    /// Maximum output tokens, when the provider declares one
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Whether the model emits reasoning
    #[serde(default)]
    pub thinking: bool,
    #[serde(default)]
    pub supports_images: bool,
    #[serde(default)]
    pub cost: CostInfo,
}

impl ModelInfo {
    pub fn new(id: impl Into<String>, context_window: u32) -> Self {
        Self {
            id: id.into(),
            context_window,
            max_tokens: None,
            thinking: false,
            supports_images: false,
            cost: CostInfo::default(),
        }
    }

    /// Output tokens to reserve when budgeting the context window
    pub fn reserved_output_tokens(&self) -> u32 {
        match self.max_tokens {
            Some(max) => max,
            None if self.thinking => THINKING_MODEL_DEFAULT_MAX_TOKENS,
            None => self.context_window / 5,
        }
    }

    /// Dollar cost of a usage record at this model's prices
    pub fn calculate_cost(&self, usage: &Usage) -> f64 {
        let per_million = |tokens: u64, price: f64| tokens as f64 / 1_000_000.0 * price;
        per_million(usage.input, self.cost.input)
            + per_million(usage.output, self.cost.output)
            + per_million(usage.cache_write, self.cost.cache_write)
            + per_million(usage.cache_read, self.cost.cache_read)
    }
}

/// A handful of well-known models; anything else is configured explicitly.
pub fn get_model(id: &str) -> Option<ModelInfo> {
    let (context_window, max_tokens, thinking, cost) = match id {
        "gpt-4o" => (128_000, Some(16_384), false, (2.5, 10.0, 0.0, 1.25)),
        "gpt-4o-mini" => (128_000, Some(16_384), false, (0.15, 0.6, 0.0, 0.075)),
        "o3-mini" => (200_000, Some(100_000), true, (1.1, 4.4, 0.0, 0.55)),
        "deepseek-reasoner" => (64_000, None, true, (0.55, 2.19, 0.0, 0.14)),
        "deepseek-chat" => (64_000, Some(8_000), false, (0.27, 1.1, 0.0, 0.07)),
        _ => return None,
    };
    Some(ModelInfo {
        id: id.to_string(),
        context_window,
        max_tokens,
        thinking,
        supports_images: id.starts_with("gpt-4o"),
        cost: CostInfo {
            input: cost.0,
            output: cost.1,
            cache_write: cost.2,
            cache_read: cost.3,
        },
    })
}
