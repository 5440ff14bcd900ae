//! Tools every task carries

mod ask_followup;
mod attempt_completion;
mod new_task;

pub use ask_followup::AskFollowupTool;
pub use attempt_completion::AttemptCompletionTool;
pub use new_task::NewTaskTool;

use std::sync::Arc;

use crate::tool::Tool;

/// The control tools: completion, follow-up questions and sub-tasks
pub fn built_in() -> Vec<Arc<dyn Tool>> {
    vec![
        Arc::new(AttemptCompletionTool::new()),
        Arc::new(AskFollowupTool::new()),
        Arc::new(NewTaskTool::new()),
    ]
}
