//! strand-ai: provider contract for the strand task engine
//!
//! This crate defines the conversation message model, the streamed chunk
//! vocabulary a provider yields, model metadata with pricing, and an
//! OpenAI-compatible streaming provider.

pub mod error;
pub mod models;
pub mod providers;
pub mod stream;
pub mod types;

pub use error::{Error, Result};
pub use models::{CostInfo, ModelInfo};
pub use providers::ApiHandler;
pub use stream::{ApiChunk, ApiStream};
pub use types::*;
