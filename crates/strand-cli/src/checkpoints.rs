//! Shadow git repository for workspace checkpoints
//!
//! The workspace is versioned by a separate repository whose git dir lives
//! under the data directory, so the user's own `.git` is never touched.
//! Every git call passes `--git-dir` and `--work-tree` explicitly.

use std::{
    hash::{DefaultHasher, Hash, Hasher},
    path::{Path, PathBuf},
    process::Output,
    sync::Arc,
};

use async_trait::async_trait;
use strand_agent::{
    CheckpointService, CheckpointServiceFactory, CheckpointStorage, Error, FileChange, Result,
};
use tokio::process::Command;
use tracing::{debug, instrument};

/// Paths never snapshotted
const EXCLUDES: &[&str] = &[".git/", "node_modules/", "target/", "*.log"];

/// Runs git against one shadow git dir and one work tree
#[derive(Debug, Clone)]
pub struct ShadowGit {
    git_dir: PathBuf,
    workdir: PathBuf,
    /// Commits of one task carry its id so a shared repository can tell
    /// them apart
    task_id: String,
}

impl ShadowGit {
    pub fn new(
        git_dir: impl Into<PathBuf>,
        workdir: impl Into<PathBuf>,
        task_id: impl Into<String>,
    ) -> Self {
        Self {
            git_dir: git_dir.into(),
            workdir: workdir.into(),
            task_id: task_id.into(),
        }
    }

    pub fn git_dir(&self) -> &Path {
        &self.git_dir
    }

    async fn has_head(&self) -> Result<bool> {
        Ok(self.run(&["rev-parse", "--verify", "--quiet", "HEAD"]).await?.status.success())
    }

    async fn has_staged_changes(&self) -> Result<bool> {
        // Exit status 1 means there are differences
        let status = self.run(&["diff", "--cached", "--quiet"]).await?.status;
        Ok(!status.success())
    }

    async fn root_commit(&self) -> Result<String> {
        let out = self.run_capture(&["rev-list", "--max-parents=0", "HEAD"]).await?;
        out.lines()
            .last()
            .map(str::to_string)
            .ok_or_else(|| Error::Checkpoint("shadow repository has no commits".into()))
    }

    /// File contents at `commit`, empty when the file does not exist there
    async fn show(&self, commit: &str, path: &str) -> Result<String> {
        let object = format!("{commit}:{path}");
        let output = self.run(&["show", &object]).await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            Ok(String::new())
        }
    }

    async fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args).await?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Checkpoint(format!(
                "git {} failed: {}",
                args.join(" "),
                stderr.trim()
            )));
        }
        Ok(output)
    }

    async fn run(&self, args: &[&str]) -> Result<Output> {
        let output = Command::new("git")
            .arg("--git-dir")
            .arg(&self.git_dir)
            .arg("--work-tree")
            .arg(&self.workdir)
            .args(args)
            .current_dir(&self.workdir)
            .env("GIT_DIR", &self.git_dir)
            .env("GIT_WORK_TREE", &self.workdir)
            .output()
            .await
            .map_err(|e| Error::Checkpoint(format!("spawn git {}: {}", args.join(" "), e)))?;
        Ok(output)
    }
}

#[async_trait]
impl CheckpointService for ShadowGit {
    #[instrument(skip_all, fields(git_dir = %self.git_dir.display()))]
    async fn init_shadow_store(&self) -> Result<()> {
        if self.git_dir.join("HEAD").exists() {
            debug!("Reusing shadow repository");
            return Ok(());
        }
        tokio::fs::create_dir_all(&self.git_dir).await?;
        self.run_checked(&["init", "--quiet"]).await?;
        self.run_checked(&["config", "user.name", "strand"]).await?;
        self.run_checked(&["config", "user.email", "checkpoints@strand.local"]).await?;
        self.run_checked(&["config", "commit.gpgsign", "false"]).await?;

        let info = self.git_dir.join("info");
        tokio::fs::create_dir_all(&info).await?;
        tokio::fs::write(info.join("exclude"), EXCLUDES.join("\n") + "\n").await?;
        debug!("Created shadow repository");
        Ok(())
    }

    async fn save_checkpoint(&self, label: &str) -> Result<Option<String>> {
        self.run_checked(&["add", "--all", "--ignore-errors"]).await?;
        let first = !self.has_head().await?;
        if !first && !self.has_staged_changes().await? {
            return Ok(None);
        }
        let message = format!("{label} [{}]", self.task_id);
        self.run_checked(&["commit", "--quiet", "--allow-empty", "--no-verify", "-m", &message])
            .await?;
        let head = self.run_capture(&["rev-parse", "HEAD"]).await?;
        Ok(Some(head.trim().to_string()))
    }

    async fn get_diff(&self, from: Option<&str>, to: &str) -> Result<Vec<FileChange>> {
        let from = match from {
            Some(from) => from.to_string(),
            None => self.root_commit().await?,
        };
        let names = self.run_capture(&["diff", "--name-only", &from, to]).await?;
        let mut changes = Vec::new();
        for path in names.lines().filter(|l| !l.trim().is_empty()) {
            changes.push(FileChange {
                path: path.to_string(),
                before: self.show(&from, path).await?,
                after: self.show(to, path).await?,
            });
        }
        Ok(changes)
    }

    async fn restore_checkpoint(&self, id: &str) -> Result<()> {
        self.run_checked(&["clean", "--force", "-d"]).await?;
        self.run_checked(&["reset", "--hard", "--quiet", id]).await?;
        Ok(())
    }
}

/// Creates shadow repositories under `root`.
///
/// With [`CheckpointStorage::Task`] every task gets its own repository;
/// with [`CheckpointStorage::Workspace`] all tasks in a workspace share one.
pub struct GitCheckpoints {
    root: PathBuf,
    storage: CheckpointStorage,
}

impl GitCheckpoints {
    pub fn new(root: impl Into<PathBuf>, storage: CheckpointStorage) -> Self {
        Self {
            root: root.into(),
            storage,
        }
    }

    pub fn git_dir(&self, task_id: &str, workspace: &Path) -> PathBuf {
        match self.storage {
            CheckpointStorage::Task => self.root.join("tasks").join(task_id),
            CheckpointStorage::Workspace => {
                let mut hasher = DefaultHasher::new();
                workspace.hash(&mut hasher);
                self.root.join("workspaces").join(format!("{:016x}", hasher.finish()))
            }
        }
    }
}

impl CheckpointServiceFactory for GitCheckpoints {
    fn create(&self, task_id: &str, workspace: &Path) -> Result<Arc<dyn CheckpointService>> {
        if !workspace.is_dir() {
            return Err(Error::Checkpoint(format!(
                "workspace {} is not a directory",
                workspace.display()
            )));
        }
        if dirs::home_dir().is_some_and(|home| home == workspace) {
            return Err(Error::Checkpoint("refusing to checkpoint the home directory".into()));
        }
        Ok(Arc::new(ShadowGit::new(
            self.git_dir(task_id, workspace),
            workspace,
            task_id,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("strand-{name}-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn git_available() -> bool {
        std::process::Command::new("git")
            .arg("--version")
            .output()
            .is_ok_and(|o| o.status.success())
    }

    #[test]
    fn test_storage_layout() {
        let factory = GitCheckpoints::new("/data/checkpoints", CheckpointStorage::Task);
        assert_eq!(
            factory.git_dir("abc", Path::new("/work")),
            PathBuf::from("/data/checkpoints/tasks/abc")
        );

        let shared = GitCheckpoints::new("/data/checkpoints", CheckpointStorage::Workspace);
        let a = shared.git_dir("one", Path::new("/work"));
        assert_eq!(a, shared.git_dir("two", Path::new("/work")));
        assert_ne!(a, shared.git_dir("one", Path::new("/elsewhere")));
    }

    #[tokio::test]
    async fn test_save_diff_restore() {
        if !git_available() {
            return;
        }
        let workspace = scratch("ws");
        let data = scratch("data");
        let git = ShadowGit::new(data.join("shadow"), &workspace, "t1");
        git.init_shadow_store().await.unwrap();

        std::fs::write(workspace.join("a.txt"), "one\n").unwrap();
        let first = git.save_checkpoint("first").await.unwrap().unwrap();
        assert!(git.save_checkpoint("unchanged").await.unwrap().is_none());

        std::fs::write(workspace.join("a.txt"), "two\n").unwrap();
        std::fs::write(workspace.join("b.txt"), "new\n").unwrap();
        let second = git.save_checkpoint("second").await.unwrap().unwrap();

        let changes = git.get_diff(Some(&first), &second).await.unwrap();
        assert_eq!(changes.len(), 2);
        let a = changes.iter().find(|c| c.path == "a.txt").unwrap();
        assert_eq!((a.before.as_str(), a.after.as_str()), ("one\n", "two\n"));
        let b = changes.iter().find(|c| c.path == "b.txt").unwrap();
        assert!(b.before.is_empty());

        git.restore_checkpoint(&first).await.unwrap();
        assert_eq!(std::fs::read_to_string(workspace.join("a.txt")).unwrap(), "one\n");
        assert!(!workspace.join("b.txt").exists());
        // The workspace has no .git of its own
        assert!(!workspace.join(".git").exists());

        let _ = std::fs::remove_dir_all(&workspace);
        let _ = std::fs::remove_dir_all(&data);
    }
}
