//! Modes and the tools each one may use

use std::sync::Arc;

use crate::tool::{Tool, ToolGroup};

pub struct Mode {
    pub slug: &'static str,
    pub name: &'static str,
    pub role: &'static str,
    groups: &'static [ToolGroup],
}

impl Mode {
    /// Whether a tool in `group` may run in this mode
    pub fn allows(&self, group: ToolGroup) -> bool {
        group == ToolGroup::Always || self.groups.contains(&group)
    }
}

pub const DEFAULT_MODE: &str = "code";

pub static MODES: &[Mode] = &[
    Mode {
        slug: "code",
        name: "Code",
        role: "You are a software engineer who writes, edits and runs code to complete the task.",
        groups: &[ToolGroup::Read, ToolGroup::Edit, ToolGroup::Command],
    },
    Mode {
        slug: "architect",
        name: "Architect",
        role: "You plan changes and explain designs before any code is written.",
        groups: &[ToolGroup::Read],
    },
    Mode {
        slug: "ask",
        name: "Ask",
        role: "You answer questions about the code base without changing it.",
        groups: &[ToolGroup::Read],
    },
    Mode {
        slug: "debug",
        name: "Debug",
        role: "You diagnose failures methodically, adding instrumentation when needed.",
        groups: &[ToolGroup::Read, ToolGroup::Edit, ToolGroup::Command],
    },
    Mode {
        slug: "orchestrator",
        name: "Orchestrator",
        role: "You break work into sub-tasks and delegate each one with new_task.",
        groups: &[],
    },
];

pub fn get_mode(slug: &str) -> Option<&'static Mode> {
    MODES.iter().find(|m| m.slug == slug)
}

/// Check that `tool` may run in `mode`, returning the error text if not
pub fn validate_tool_use(tool: &dyn Tool, mode: &str) -> Result<(), String> {
    let Some(mode_info) = get_mode(mode) else {
        return Err(format!("Unknown mode: {mode}"));
    };
    if mode_info.allows(tool.group()) {
        Ok(())
    } else {
        Err(format!("Tool \"{}\" is not allowed in {} mode.", tool.name(), mode))
    }
}

/// System prompt for `mode`: the base prompt, the mode's role and a usage
/// line for every tool the mode allows.
pub fn system_prompt(base: &str, mode: &str, tools: &[Arc<dyn Tool>]) -> String {
    let mode_info = get_mode(mode).or_else(|| get_mode(DEFAULT_MODE));
    let mut prompt = String::new();
    if let Some(m) = mode_info {
        prompt.push_str(m.role);
        prompt.push_str("\n\n");
    }
    prompt.push_str(base);
    prompt.push_str("\n\n# Tools\n\nInvoke exactly one tool per message using XML tags, for example:\n<tool_name>\n<param>value</param>\n</tool_name>\n");

    for tool in tools {
        if mode_info.is_some_and(|m| !m.allows(tool.group())) {
            continue;
        }
        let schema = tool.parameters_schema();
        let params: Vec<String> = schema
            .get("properties")
            .and_then(|p| p.as_object())
            .map(|props| props.keys().map(|k| format!("<{k}>...</{k}>")).collect())
            .unwrap_or_default();
        prompt.push_str(&format!(
            "\n## {}\n{}\nUsage: <{}>{}</{}>\n",
            tool.name(),
            tool.description(),
            tool.name(),
            params.join(""),
            tool.name()
        ));
    }
    prompt
}
