//! strand - run, resume and inspect coding tasks from the terminal

mod checkpoints;
mod config;
mod console;
mod tools;

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use similar::TextDiff;
use strand_agent::{
    FileStorage, RestoreMode, SayKind, Storage, Task, TaskEnvironment, TaskOutcome, Tool,
    UiMessage, modes,
};
use strand_ai::providers::{get_api_key, openai::OpenAiProvider};
use tracing_subscriber::EnvFilter;

use crate::{
    checkpoints::GitCheckpoints,
    config::Config,
    console::{ConsoleChannel, Printer},
    tools::{EditTracker, ExecuteCommandTool, ReadFileTool, Terminals, WriteToFileTool},
};

/// strand - an approval-gated coding agent
#[derive(Parser, Debug)]
#[command(name = "strand")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Working directory
    #[arg(short, long, global = true)]
    working_dir: Option<PathBuf>,

    /// Model to use (overrides the config file)
    #[arg(short, long, global = true)]
    model: Option<String>,

    /// OpenAI-compatible endpoint (overrides the config file)
    #[arg(long, global = true)]
    base_url: Option<String>,

    /// Debug logging for the strand crates
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start a new task
    Run {
        goal: String,
        /// Mode to start in (code, architect, ask, debug, orchestrator)
        #[arg(long)]
        mode: Option<String>,
        /// Approve every tool without asking
        #[arg(short = 'y', long)]
        yes: bool,
        #[arg(long)]
        no_checkpoints: bool,
    },
    /// Resume a saved task
    Resume { task_id: String },
    /// List saved tasks
    List,
    /// Show the changes recorded by a checkpoint
    Diff {
        task_id: String,
        /// Timestamp of the checkpoint entry; the newest one by default
        #[arg(long)]
        ts: Option<i64>,
    },
    /// Roll the workspace (and by default the task) back to a checkpoint
    Restore {
        task_id: String,
        ts: i64,
        /// Leave the conversation untouched
        #[arg(long)]
        files_only: bool,
    },
    /// Write a default config file
    InitConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let mut cfg = Config::load();
    if let Some(model) = args.model {
        cfg.provider.model = model;
    }
    if let Some(base_url) = args.base_url {
        cfg.provider.base_url = base_url;
    }
    if let Some(ref dir) = args.working_dir {
        std::env::set_current_dir(dir)
            .with_context(|| format!("change directory to {}", dir.display()))?;
    }
    let cwd = std::env::current_dir().context("resolve working directory")?;

    match args.command {
        Commands::Run {
            goal,
            mode,
            yes,
            no_checkpoints,
        } => {
            if let Some(mode) = mode {
                if modes::get_mode(&mode).is_none() {
                    bail!("unknown mode '{mode}'");
                }
                cfg.task.mode = mode;
            }
            if yes {
                cfg.task.auto_approve_read_only = true;
                cfg.task.auto_approve_mutating = true;
            }
            if no_checkpoints {
                cfg.task.enable_checkpoints = false;
            }
            let env = build_environment(&cfg, cwd, true)?;
            let task = Task::new(env.clone(), None);
            run_task(env, task, |task| task.start(goal, Vec::new())).await
        }
        Commands::Resume { task_id } => {
            let env = build_environment(&cfg, cwd, true)?;
            let task = Task::resume(env.clone(), &task_id)
                .await
                .with_context(|| format!("load task {task_id}"))?;
            run_task(env, task, Task::run_resumed).await
        }
        Commands::List => list_tasks().await,
        Commands::Diff { task_id, ts } => {
            let env = build_environment(&cfg, cwd, false)?;
            show_diff(env, &task_id, ts).await
        }
        Commands::Restore {
            task_id,
            ts,
            files_only,
        } => {
            let env = build_environment(&cfg, cwd, false)?;
            let task = Task::resume(env, &task_id)
                .await
                .with_context(|| format!("load task {task_id}"))?;
            let mode = if files_only {
                RestoreMode::FilesOnly
            } else {
                RestoreMode::FilesAndTask
            };
            if task.restore_checkpoint(ts, mode).await? {
                println!("Restored checkpoint at {ts}.");
            } else {
                bail!("could not restore a checkpoint at {ts}");
            }
            task.dispose().await;
            Ok(())
        }
        Commands::InitConfig => {
            let path = Config::init()?;
            println!("Config file at: {}", path.display());
            Ok(())
        }
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("strand_ai=debug,strand_agent=debug,strand_cli=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Everything a task needs, wired to this terminal. Commands that never
/// call the model can run without an API key.
fn build_environment(cfg: &Config, cwd: PathBuf, require_key: bool) -> Result<TaskEnvironment> {
    let api_key = match get_api_key(None, &cfg.provider.api_key_env) {
        Ok(key) => key,
        Err(_) if !require_key => String::new(),
        Err(_) => bail!(
            "no API key found. Set it with: export {}=your-key",
            cfg.provider.api_key_env
        ),
    };
    let api = Arc::new(OpenAiProvider::new(
        api_key,
        &cfg.provider.base_url,
        cfg.provider.model_info(),
    ));
    let data_dir = Config::data_dir();
    let storage = Arc::new(FileStorage::new(data_dir.join("tasks")));

    let edits = Arc::new(EditTracker::new());
    let terminals = Arc::new(Terminals::new());
    let tools: Vec<Arc<dyn Tool>> = vec![
        Arc::new(ReadFileTool::new()),
        Arc::new(WriteToFileTool::new(edits.clone())),
        Arc::new(ExecuteCommandTool::new(terminals.clone())),
    ];

    let mut env = TaskEnvironment::new(api, storage, Arc::new(ConsoleChannel::new()))
        .with_tools(tools)
        .with_config(cfg.task.clone())
        .with_system_prompt(build_system_prompt(&cwd, cfg.custom_instructions()))
        .with_cwd(cwd)
        .with_resources(edits)
        .with_resources(terminals);
    if cfg.task.enable_checkpoints {
        env = env.with_checkpoints(Arc::new(GitCheckpoints::new(
            data_dir.join("checkpoints"),
            cfg.task.checkpoint_storage,
        )));
    }
    Ok(env)
}

/// Print events while `start` runs the task; Ctrl-C aborts the innermost
/// active subtask, then the task itself
async fn run_task<F, Fut>(env: TaskEnvironment, task: Task, start: F) -> Result<()>
where
    F: FnOnce(Task) -> Fut,
    Fut: std::future::Future<Output = strand_agent::Result<TaskOutcome>>,
{
    let printer = tokio::spawn(Printer::new().run(env.subscribe()));
    let handle = task.handle();
    let registry = env.registry.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            match registry.current() {
                Some(active) if active.task_id() != handle.task_id() => {
                    eprintln!("\nAborting subtask {}...", active.task_id());
                    active.abort();
                }
                _ => eprintln!("\nAborting..."),
            }
            handle.abort();
        }
    });

    let task_id = task.id().to_string();
    let outcome = start(task).await;
    drop(env);
    // Events already sent still print; give the printer a moment to drain
    let _ = tokio::time::timeout(Duration::from_secs(1), printer).await;

    match outcome? {
        TaskOutcome::Completed { .. } => println!("\nTask {task_id} completed."),
        TaskOutcome::Aborted | TaskOutcome::Abandoned => {
            println!("\nTask {task_id} stopped. Resume with: strand resume {task_id}")
        }
    }
    Ok(())
}

async fn list_tasks() -> Result<()> {
    let root = Config::data_dir().join("tasks");
    let storage = FileStorage::new(root.clone());
    let ids = storage.list_tasks().await.context("list tasks")?;
    if ids.is_empty() {
        println!("No saved tasks found.");
        println!("Tasks are stored in: {}", root.display());
        return Ok(());
    }

    let mut rows = Vec::new();
    for id in ids {
        let ui = storage.load_ui_messages(&id).await?.unwrap_or_default();
        let last = ui.last().map(|m| m.ts).unwrap_or(0);
        rows.push((last, id, summary(&ui)));
    }
    rows.sort_by(|a, b| b.0.cmp(&a.0));

    println!("{:<38} {:<20} Task", "ID", "Last active");
    println!("{}", "-".repeat(90));
    for (ts, id, text) in rows {
        let when = chrono::DateTime::from_timestamp_millis(ts)
            .map(|t| t.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_default();
        println!("{id:<38} {when:<20} {text}");
    }
    println!("\nResume with: strand resume <task-id>");
    Ok(())
}

/// The task's opening text, cut to one short line
fn summary(ui: &[UiMessage]) -> String {
    let text = ui
        .iter()
        .find(|m| m.is_say(SayKind::Text))
        .and_then(|m| m.text.as_deref())
        .unwrap_or_default();
    let line = text.lines().next().unwrap_or_default();
    match line.char_indices().nth(50) {
        Some((cut, _)) => format!("{}...", &line[..cut]),
        None => line.to_string(),
    }
}

async fn show_diff(env: TaskEnvironment, task_id: &str, ts: Option<i64>) -> Result<()> {
    let task = Task::resume(env, task_id)
        .await
        .with_context(|| format!("load task {task_id}"))?;
    let ui = task.store().ui_messages();
    let ts = match ts {
        Some(ts) => ts,
        None => match ui.iter().rev().find(|m| m.checkpoint.is_some()) {
            Some(marker) => marker.ts,
            None => bail!("task {task_id} has no checkpoints"),
        },
    };

    let Some(changes) = task.checkpoint_diff(ts).await else {
        task.dispose().await;
        bail!("no checkpoint diff available at {ts}");
    };
    if changes.is_empty() {
        println!("No changes.");
    }
    for change in changes {
        let diff = TextDiff::from_lines(&change.before, &change.after);
        print!(
            "{}",
            diff.unified_diff()
                .header(&format!("a/{}", change.path), &format!("b/{}", change.path))
        );
    }
    task.dispose().await;
    Ok(())
}

/// The base prompt; the mode's role and the tool list are added per turn
fn build_system_prompt(cwd: &std::path::Path, custom: Option<String>) -> String {
    let mut prompt = String::from(
        "You are strand, a software engineer working in the user's project.\n\n\
         Guidelines:\n\
         - Work step by step and use one tool per message; wait for its result before continuing\n\
         - Always read files before making edits\n\
         - write_to_file replaces the whole file, so include its complete content\n\
         - Warn before destructive commands\n\
         - When the task is done, call attempt_completion with a final result, not a question\n",
    );
    prompt.push_str(&format!("\nWorking directory: {}", cwd.display()));
    if let Some(custom) = custom {
        prompt.push_str("\n\n---\n\n# User's Custom Instructions\n\n");
        prompt.push_str(custom.trim());
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from([
            "strand", "-v", "run", "fix the tests", "--mode", "debug", "-y",
        ])
        .unwrap();
        assert!(args.verbose);
        match args.command {
            Commands::Run { goal, mode, yes, .. } => {
                assert_eq!(goal, "fix the tests");
                assert_eq!(mode.as_deref(), Some("debug"));
                assert!(yes);
            }
            other => panic!("unexpected command {other:?}"),
        }

        let args =
            Args::try_parse_from(["strand", "restore", "abc", "1700", "--files-only"]).unwrap();
        assert!(matches!(
            args.command,
            Commands::Restore { ts: 1700, files_only: true, .. }
        ));
    }

    #[test]
    fn test_summary() {
        let mut ui = vec![UiMessage::say(SayKind::ApiReqStarted, Some("{}".into()))];
        assert_eq!(summary(&ui), "");
        ui.push(UiMessage::say(SayKind::Text, Some(format!("{}\nsecond line", "x".repeat(60)))));
        assert_eq!(summary(&ui), format!("{}...", "x".repeat(50)));
    }

    #[test]
    fn test_system_prompt_includes_custom_instructions() {
        let prompt = build_system_prompt(std::path::Path::new("/work"), Some("Use tabs.\n".into()));
        assert!(prompt.contains("Working directory: /work"));
        assert!(prompt.ends_with("Use tabs."));
    }
}
