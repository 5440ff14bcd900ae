//! Configuration file support

use std::{fs, path::PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use strand_agent::TaskConfig;
use strand_ai::{CostInfo, ModelInfo};
use tracing::warn;

/// Configuration for strand
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub provider: ProviderConfig,
    /// How tasks run: approvals, retries, checkpoints, mode
    pub task: TaskConfig,
    /// Extra instructions appended to the built-in system prompt
    pub system_prompt_file: Option<PathBuf>,
}

/// An OpenAI-compatible endpoint and the model served there
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub base_url: String,
    pub model: String,
    /// Environment variable holding the API key
    pub api_key_env: String,
    /// Overrides for models `strand_ai::models::get_model` does not know
    pub context_window: Option<u32>,
    pub max_tokens: Option<u32>,
    /// Dollars per million tokens
    pub prices: Option<CostInfo>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            context_window: None,
            max_tokens: None,
            prices: None,
        }
    }
}

impl ProviderConfig {
    /// Model metadata: the known entry for `model`, with any configured
    /// overrides applied
    pub fn model_info(&self) -> ModelInfo {
        let mut model = strand_ai::models::get_model(&self.model)
            .unwrap_or_else(|| ModelInfo::new(&self.model, 128_000));
        if let Some(window) = self.context_window {
            model.context_window = window;
        }
        if self.max_tokens.is_some() {
            model.max_tokens = self.max_tokens;
        }
        if let Some(prices) = self.prices {
            model.cost = prices;
        }
        model
    }
}

impl Config {
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("strand")
    }

    /// `STRAND_CONFIG_PATH`, else `<config dir>/strand/config.toml`
    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("STRAND_CONFIG_PATH") {
            return PathBuf::from(path);
        }
        Self::config_dir().join("config.toml")
    }

    /// Where task documents and shadow repositories live
    pub fn data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("strand")
    }

    /// Load the config file. A missing or unreadable file yields defaults.
    pub fn load() -> Self {
        let path = Self::config_path();
        if !path.exists() {
            return Self::default();
        }
        match Self::read(&path) {
            Ok(config) => config,
            Err(e) => {
                warn!(path = %path.display(), "Ignoring config file: {:#}", e);
                Self::default()
            }
        }
    }

    fn read(path: &std::path::Path) -> Result<Self> {
        let content = fs::read_to_string(path).context("read config")?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("parse config")
    }

    /// Write a default config file if none exists
    pub fn init() -> Result<PathBuf> {
        let path = Self::config_path();
        if path.exists() {
            return Ok(path);
        }
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).context("create config directory")?;
        }
        let content = toml::to_string_pretty(&Self::default()).context("serialize config")?;
        fs::write(&path, content).context("write config")?;
        Ok(path)
    }

    /// Extra prompt text from `system_prompt_file`, if set and readable
    pub fn custom_instructions(&self) -> Option<String> {
        let path = self.system_prompt_file.as_ref()?;
        match fs::read_to_string(path) {
            Ok(text) => Some(text),
            Err(e) => {
                warn!(path = %path.display(), "Could not read system prompt file: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_agent::CheckpointStorage;

    #[test]
    fn test_parse_partial_config() {
        let config = Config::parse(
            r#"
            [provider]
            base_url = "http://localhost:11434/v1"
            model = "qwen2.5-coder"
            context_window = 32000
            prices = { input = 1.0, output = 2.0 }

            [task]
            auto_approve_read_only = true
            checkpoint_storage = "workspace"
            mistake_limit = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.provider.api_key_env, "OPENAI_API_KEY");
        assert!(config.task.auto_approve_read_only);
        assert!(!config.task.auto_approve_mutating);
        assert_eq!(config.task.mistake_limit, 5);
        assert_eq!(config.task.checkpoint_storage, CheckpointStorage::Workspace);

        let model = config.provider.model_info();
        assert_eq!(model.id, "qwen2.5-coder");
        assert_eq!(model.context_window, 32_000);
        assert_eq!(model.cost.output, 2.0);
        assert_eq!(model.cost.cache_read, 0.0);
    }

    #[test]
    fn test_known_model_keeps_its_metadata() {
        let config = Config::parse("[provider]\nmodel = \"gpt-4o-mini\"\n").unwrap();
        let model = config.provider.model_info();
        assert_eq!(model.context_window, 128_000);
        assert_eq!(model.max_tokens, Some(16_384));
    }

    #[test]
    fn test_bad_config_is_an_error() {
        assert!(Config::parse("task = 3").is_err());
    }
}
