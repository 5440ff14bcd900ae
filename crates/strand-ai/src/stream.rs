//! Streamed chunk types

use std::pin::Pin;

use serde::{Deserialize, Serialize};
use tokio_stream::Stream;

use crate::{error::Result, types::Usage};

/// One element of a provider response stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ApiChunk {
    /// Assistant text delta
    Text { text: String },
    /// Reasoning delta, shown but never stored in history
    Reasoning { text: String },
    /// Token counts for this call, possibly reported more than once
    Usage(Usage),
}

impl ApiChunk {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn usage(input: u64, output: u64) -> Self {
        Self::Usage(Usage {
            input,
            output,
            ..Default::default()
        })
    }
}

/// A provider response stream. Any element, including the first, may fail.
pub type ApiStream = Pin<Box<dyn Stream<Item = Result<ApiChunk>> + Send>>;
