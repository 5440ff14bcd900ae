//! Workspace tools

mod execute_command;
mod read_file;
mod write_to_file;

pub use execute_command::{ExecuteCommandTool, Terminals};
pub use read_file::ReadFileTool;
pub use write_to_file::{EditTracker, WriteToFileTool};

use std::path::{Path, PathBuf};

/// `path` against the working directory, with `~/` expanded
pub(crate) fn resolve(cwd: &Path, path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    cwd.join(path)
}
