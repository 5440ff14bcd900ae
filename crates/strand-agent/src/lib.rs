//! strand-agent: the task engine
//!
//! A [`Task`] repeatedly calls a model provider, re-parses the streamed
//! output into content blocks, dispatches tool invocations behind an
//! approval gate and folds the results into the next turn. Tasks can
//! spawn child tasks and pause until they finish, and can checkpoint the
//! workspace after mutating tools.

pub mod breaker;
pub mod checkpoint;
pub mod config;
pub mod context_window;
pub mod conversation;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod handle;
pub mod messenger;
pub mod modes;
pub mod parser;
pub mod registry;
pub mod responses;
pub mod retry;
pub mod storage;
pub mod task;
pub mod tool;
pub mod tools;
pub mod ui;

#[cfg(test)]
mod testing;

pub use breaker::CircuitBreaker;
pub use checkpoint::{
    CheckpointCoordinator, CheckpointService, CheckpointServiceFactory, FileChange,
};
pub use config::{CheckpointStorage, TaskConfig};
pub use conversation::{ApiMetrics, ConversationStore};
pub use error::{Error, Result};
pub use events::TaskEvent;
pub use handle::TaskHandle;
pub use messenger::{Messenger, UserChannel};
pub use registry::TaskRegistry;
pub use storage::{FileStorage, MemoryStorage, Storage};
pub use task::{RestoreMode, Task, TaskEnvironment, TaskOutcome, TaskResources};
pub use tool::{Tool, ToolCall, ToolGroup, ToolOutput};
pub use ui::{AskKind, AskResponse, AskResponseKind, SayKind, UiMessage};
