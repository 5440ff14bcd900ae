//! Fixed texts fed back to the model

pub const INTERRUPTED_BY_FEEDBACK: &str = "\n\n[Response interrupted by user feedback]";
pub const INTERRUPTED_BY_TOOL_USE: &str = "\n\n[Response interrupted by a tool use result. Only one tool may be used at a time and should be placed at the end of the message.]";
pub const INTERRUPTED_BY_API_ERROR: &str = "[Response interrupted by API Error]";
pub const INTERRUPTED_BY_USER: &str = "[Response interrupted by user]";
pub const NO_RESPONSE: &str = "Failure: I did not provide a response.";
pub const TOOL_INTERRUPTED_ON_RESUME: &str = "Task was interrupted before this tool call could be completed.";
pub const EMPTY_TOOL_RESULT: &str = "(tool did not return anything)";
pub const SUBTASK_CANCELLED: &str = "The sub-task was cancelled before it finished.";

pub fn tool_denied() -> String {
    "The user denied this operation.".to_string()
}

pub fn tool_denied_with_feedback(feedback: &str) -> String {
    format!("The user denied this operation and provided the following feedback:\n<feedback>\n{feedback}\n</feedback>")
}

pub fn tool_approved_with_feedback(feedback: &str) -> String {
    format!("The user approved this operation and provided the following context:\n<feedback>\n{feedback}\n</feedback>")
}

pub fn tool_error(error: &str) -> String {
    format!("The tool execution failed with the following error:\n<error>\n{error}\n</error>")
}

pub fn skipped_after_rejection(description: &str) -> String {
    format!("Skipping tool {description} due to user rejecting a previous tool.")
}

pub fn interrupted_after_rejection(description: &str) -> String {
    format!("Tool {description} was interrupted and not executed due to user rejecting a previous tool.")
}

pub fn not_executed_one_per_message(name: &str) -> String {
    format!(
        "Tool [{name}] was not executed because a tool has already been used in this message. Only one tool may be used per message. You must assess the first tool's result before proceeding to use the next tool."
    )
}

pub fn missing_tool_parameter_error(param: &str) -> String {
    format!(
        "Missing value for required parameter '{param}'. Please retry with complete response.\n\nRemember to use the XML tag format: <tool_name><{param}>value</{param}></tool_name>"
    )
}

pub fn missing_parameter_notice(tool: &str, param: &str) -> String {
    format!("The assistant tried to use {tool} without value for required parameter '{param}'. Retrying...")
}

pub fn no_tools_used() -> String {
    "[ERROR] You did not use a tool in your previous response! Please retry with a tool use.\n\n\
     Tool uses are formatted as XML tags, one tool per message, placed at the end of the message.\n\n\
     # Next Steps\n\n\
     If you have completed the user's task, use the attempt_completion tool. \
     If you require additional information from the user, use the ask_followup_question tool. \
     Otherwise, proceed with the next step of the task. \
     (This is an automated message, so do not respond to it conversationally.)"
        .to_string()
}

pub fn too_many_mistakes(feedback: Option<&str>) -> String {
    match feedback {
        Some(f) => format!("You seem to be having trouble proceeding. The user has provided the following feedback to help guide you:\n<feedback>\n{f}\n</feedback>"),
        None => "You seem to be having trouble proceeding. Reassess the task and try a different approach.".to_string(),
    }
}

pub const MISTAKE_LIMIT_GUIDANCE: &str = "This may indicate a failure in the model's thought process or an inability to use a tool properly, which can be mitigated with some user guidance (e.g. \"Try breaking down the task into smaller steps\").";

pub fn completion_feedback(feedback: &str) -> String {
    format!(
        "The user has provided feedback on the results. Consider their input to continue the task, and then attempt completion again.\n<feedback>\n{feedback}\n</feedback>"
    )
}

pub fn subtask_completed(result: &str) -> String {
    format!("[new_task completed] Result: {result}")
}

pub fn task_resumption(ago: &str, interrupted_completed: bool, cwd: &str) -> String {
    let state = if interrupted_completed {
        "It may or may not be complete"
    } else {
        "It was not complete"
    };
    format!(
        "[TASK RESUMPTION] This task was interrupted {ago}. {state}, so reassess the task context. \
         The project state may have changed since then. The current working directory is '{cwd}'. \
         If the task has not been completed, retry the last step before the interruption and continue.\n\n\
         Note: if you previously attempted a tool use that has no result, assume it did not succeed and decide whether to retry it."
    )
}

pub fn new_instructions(text: &str) -> String {
    format!("\n\nNew instructions for task continuation:\n<user_message>\n{text}\n</user_message>")
}

/// "just now", "5 minutes ago", "2 hours ago", "3 days ago"
pub fn time_ago(elapsed_ms: i64) -> String {
    let minutes = elapsed_ms / 60_000;
    let hours = minutes / 60;
    let days = hours / 24;
    let plural = |n: i64, unit: &str| {
        if n == 1 {
            format!("1 {unit} ago")
        } else {
            format!("{n} {unit}s ago")
        }
    };
    if days > 0 {
        plural(days, "day")
    } else if hours > 0 {
        plural(hours, "hour")
    } else if minutes > 0 {
        plural(minutes, "minute")
    } else {
        "just now".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_ago() {
        assert_eq!(time_ago(10_000), "just now");
        assert_eq!(time_ago(60_000), "1 minute ago");
        assert_eq!(time_ago(3 * 3_600_000), "3 hours ago");
        assert_eq!(time_ago(49 * 3_600_000), "2 days ago");
    }
}
