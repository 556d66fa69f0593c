//! `ralph` command-line interface.

use std::env;
use std::path::{Path, PathBuf};
use std::process::Command as ProcessCommand;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use ralph::core::reconcile::RuntimeStatus;
use ralph::core::validate::validate;
use ralph::engine::{CancelToken, ConfigOverrides, Engine, PreparedRun, RunOptions, RunSummary};
use ralph::events::{EventBus, RalphEvent};
use ralph::exit_codes;
use ralph::io::paths::{RalphPaths, resolve_path};
use ralph::io::plan_store::load_plan;
use ralph::io::registry::Registry;
use ralph::io::session_store::SessionStore;
use ralph::io::status::plan_runtime_status;
use ralph::logging;
use ralph::mcp::McpServer;
use serde::Serialize;
use tokio::io::BufReader;
use tokio::sync::broadcast::error::RecvError;

#[derive(Parser)]
#[command(
    name = "ralph",
    version,
    about = "Drive an AI coding agent through a task plan"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute the plan's tasks in dependency order.
    Run(RunArgs),
    /// Check the plan for malformed ids, unknown dependencies, and cycles.
    Validate(PlanArgs),
    /// List sessions recorded for the project.
    List {
        #[arg(short, long, default_value = ".")]
        directory: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Per-task runtime status and overall progress.
    Status {
        #[command(flatten)]
        plan: PlanArgs,
        #[arg(long)]
        json: bool,
    },
    /// Start the HTTP/SSE server (`ralph-server`).
    Server {
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,
        #[arg(long, default_value = "3001")]
        port: u16,
    },
    /// Completion side-channel spoken to by the agent over stdio.
    McpServer,
    /// Add a plan to the registry.
    Register(PlanArgs),
    /// Remove a plan from the registry.
    Unregister { plan_id: String },
    /// List registered plans.
    RegistryList {
        #[arg(long)]
        json: bool,
    },
    /// Registry totals.
    RegistryStats,
    /// Remove every registered plan.
    RegistryClear,
}

#[derive(Args, Debug, Clone)]
struct PlanArgs {
    /// Plan document, relative to the project directory.
    #[arg(default_value = "plan.md")]
    plan: PathBuf,
    /// Project root (holds `.ralph/`).
    #[arg(short, long, default_value = ".")]
    directory: PathBuf,
}

#[derive(Args, Debug, Clone)]
struct RunArgs {
    #[command(flatten)]
    plan: PlanArgs,
    /// Continue the latest session for this plan.
    #[arg(long)]
    resume: bool,
    /// Do not commit after each task.
    #[arg(long)]
    no_commit: bool,
    /// Run the verification command after each task.
    #[arg(long)]
    auto_test: bool,
    #[arg(long)]
    max_retries: Option<u32>,
    #[arg(long)]
    max_parallel: Option<usize>,
    /// Mark these task ids skipped before starting.
    #[arg(long, value_delimiter = ',')]
    skip: Vec<String>,
    /// Validate and print the execution order without running anything.
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() {
    logging::init();
    let cli = Cli::parse();
    let code = match execute(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

async fn execute(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Run(args) => cmd_run(args).await,
        Command::Validate(args) => cmd_validate(&args),
        Command::List { directory, json } => cmd_list(&directory, json),
        Command::Status { plan, json } => cmd_status(&plan, json),
        Command::Server { bind, port } => cmd_server(&bind, port),
        Command::McpServer => {
            McpServer::from_env()
                .serve(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
                .await?;
            Ok(exit_codes::OK)
        }
        Command::Register(args) => {
            let entry = Registry::open_default()?.register(&args.directory, &args.plan)?;
            println!(
                "registered {}  {} ({})",
                entry.plan_id,
                entry.title,
                entry.plan_path.display()
            );
            Ok(exit_codes::OK)
        }
        Command::Unregister { plan_id } => {
            if Registry::open_default()?.unregister(&plan_id)? {
                println!("unregistered {plan_id}");
                Ok(exit_codes::OK)
            } else {
                eprintln!("no registered plan with id {plan_id}");
                Ok(exit_codes::INVALID)
            }
        }
        Command::RegistryList { json } => {
            let plans = Registry::open_default()?.list()?;
            if json {
                print_json(&plans)?;
            } else if plans.is_empty() {
                println!("no registered plans");
            } else {
                for plan in plans {
                    println!(
                        "{}  {:<30} {:>3} tasks  {}",
                        plan.plan_id,
                        plan.title,
                        plan.total_tasks,
                        plan.plan_path.display()
                    );
                }
            }
            Ok(exit_codes::OK)
        }
        Command::RegistryStats => {
            print_json(&Registry::open_default()?.stats()?)?;
            Ok(exit_codes::OK)
        }
        Command::RegistryClear => {
            let removed = Registry::open_default()?.clear()?;
            println!("removed {removed} plan(s)");
            Ok(exit_codes::OK)
        }
    }
}

impl RunArgs {
    fn options(&self) -> RunOptions {
        RunOptions {
            plan_path: self.plan.plan.clone(),
            project_root: self.plan.directory.clone(),
            resume: self.resume,
            skip: self.skip.clone(),
            overrides: ConfigOverrides {
                no_commit: self.no_commit,
                auto_test: self.auto_test.then_some(true),
                max_retries: self.max_retries,
                max_parallel: self.max_parallel,
            },
        }
    }
}

async fn cmd_run(args: RunArgs) -> Result<i32> {
    let prepared = PreparedRun::load(&args.options())?;
    if args.dry_run {
        print_execution_order(&prepared)?;
        return Ok(exit_codes::OK);
    }

    let engine = Engine::for_config(&prepared.config, EventBus::default());
    let cancel = CancelToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("interrupted: stopping running tasks");
                cancel.cancel();
            }
        })
    };
    let mut rx = engine.bus().subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            }
        }
    });

    println!(
        "{} session {}",
        if prepared.resumed { "resuming" } else { "starting" },
        prepared.session_id()
    );
    let result = engine.run(prepared, cancel).await;
    drop(engine);
    interrupt.abort();
    let _ = printer.await;

    let summary = result?;
    print_summary(&summary);
    Ok(summary.exit_code())
}

fn print_execution_order(prepared: &PreparedRun) -> Result<()> {
    let order = prepared.execution_order()?;
    println!(
        "{}: {} task(s) in execution order",
        prepared.plan.project_name,
        order.len()
    );
    for (index, task) in order.iter().enumerate() {
        let deps = if task.dependencies.is_empty() {
            String::new()
        } else {
            format!("  (after {})", task.dependencies.join(", "))
        };
        let done = if task.status.is_done() { "  [done]" } else { "" };
        println!("{:>3}. {}  {}{deps}{done}", index + 1, task.id, task.title);
    }
    Ok(())
}

fn print_event(event: &RalphEvent) {
    match event {
        RalphEvent::TaskStarted {
            task_id,
            title,
            attempt,
            ..
        } => println!("[{task_id}] started (attempt {attempt}): {title}"),
        RalphEvent::TaskRetrying {
            task_id,
            attempt,
            error,
            ..
        } => println!("[{task_id}] retrying (attempt {attempt}): {error}"),
        RalphEvent::TaskCompleted {
            task_id, commit, ..
        } => match commit {
            Some(commit) => println!("[{task_id}] completed ({commit})"),
            None => println!("[{task_id}] completed"),
        },
        RalphEvent::TaskFailed {
            task_id,
            attempts,
            error,
            ..
        } => println!("[{task_id}] failed after {attempts} attempt(s): {error}"),
        RalphEvent::RunProgress {
            completed,
            total,
            progress,
            ..
        } => println!("progress: {completed}/{total} ({progress}%)"),
        RalphEvent::SessionChanged { .. }
        | RalphEvent::CheckpointCreated { .. }
        | RalphEvent::RunFinished { .. } => {}
    }
}

fn print_summary(summary: &RunSummary) {
    println!();
    println!("session   {}", summary.session_id);
    println!("completed {}", list_or_dash(&summary.completed_tasks));
    println!("failed    {}", list_or_dash(&summary.failed_tasks));
    if !summary.skipped_tasks.is_empty() {
        println!("skipped   {}", summary.skipped_tasks.join(", "));
    }
    if !summary.blocked_tasks.is_empty() {
        println!("blocked   {}", summary.blocked_tasks.join(", "));
    }
    if summary.cancelled {
        println!("run was cancelled; `ralph run --resume` continues it");
    }
}

fn list_or_dash(ids: &[String]) -> String {
    if ids.is_empty() {
        "-".to_string()
    } else {
        ids.join(", ")
    }
}

fn cmd_validate(args: &PlanArgs) -> Result<i32> {
    let plan_path = plan_path(args);
    let plan = load_plan(&plan_path)?;
    if plan.tasks.is_empty() {
        eprintln!("error: {} contains no tasks", plan_path.display());
        return Ok(exit_codes::INVALID);
    }
    let report = validate(&plan);
    for warning in &report.warnings {
        println!("warning: {warning}");
    }
    for error in &report.errors {
        println!("error: {error}");
    }
    if report.valid {
        println!("{}: {} task(s), valid", plan.project_name, plan.tasks.len());
        Ok(exit_codes::OK)
    } else {
        Ok(exit_codes::INVALID)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionRow {
    session_id: String,
    plan_path: PathBuf,
    completed: usize,
    failed: usize,
    skipped: usize,
    current_task_id: Option<String>,
    last_activity: String,
}

fn cmd_list(directory: &Path, json: bool) -> Result<i32> {
    let store = SessionStore::new(&RalphPaths::new(resolve_path(directory)));
    let rows: Vec<SessionRow> = store
        .list()?
        .into_iter()
        .map(|session| SessionRow {
            completed: session.completed_tasks.len(),
            failed: session.failed_tasks.len(),
            skipped: session.skipped_tasks.len(),
            current_task_id: session.current_task_id,
            last_activity: session.last_activity.to_rfc3339(),
            session_id: session.session_id,
            plan_path: session.plan_path,
        })
        .collect();
    if json {
        print_json(&rows)?;
        return Ok(exit_codes::OK);
    }
    if rows.is_empty() {
        println!("no sessions in {}", store.dir().display());
    }
    for row in rows {
        println!(
            "{}  {} done, {} failed, {} skipped  {}  {}",
            row.session_id,
            row.completed,
            row.failed,
            row.skipped,
            row.last_activity,
            row.plan_path.display()
        );
    }
    Ok(exit_codes::OK)
}

fn cmd_status(args: &PlanArgs, json: bool) -> Result<i32> {
    let root = resolve_path(&args.directory);
    let summary = plan_runtime_status(&root, &plan_path(args))?;
    if json {
        print_json(&summary)?;
        return Ok(exit_codes::OK);
    }
    println!(
        "{}: {}% ({}/{} completed)",
        summary.project_name, summary.progress, summary.counts.completed, summary.total
    );
    if let Some(session_id) = &summary.session_id {
        println!("session {session_id}");
    }
    if let Some(next) = &summary.next_task {
        println!("next {next}");
    }
    for task in &summary.tasks {
        println!("  {:<12} {}  {}", status_label(task.status), task.id, task.title);
    }
    Ok(exit_codes::OK)
}

fn status_label(status: RuntimeStatus) -> &'static str {
    match status {
        RuntimeStatus::Pending => "pending",
        RuntimeStatus::InProgress => "in-progress",
        RuntimeStatus::Completed => "completed",
        RuntimeStatus::Blocked => "blocked",
        RuntimeStatus::Failed => "failed",
    }
}

/// Hand off to the `ralph-server` binary installed next to this one.
fn cmd_server(bind: &str, port: u16) -> Result<i32> {
    let program = env::current_exe()
        .ok()
        .map(|exe| exe.with_file_name(format!("ralph-server{}", env::consts::EXE_SUFFIX)))
        .filter(|candidate| candidate.is_file())
        .unwrap_or_else(|| PathBuf::from("ralph-server"));
    let status = ProcessCommand::new(&program)
        .args(["--bind", bind, "--port", &port.to_string()])
        .status()
        .with_context(|| format!("start {}", program.display()))?;
    Ok(status.code().unwrap_or(exit_codes::INVALID))
}

fn plan_path(args: &PlanArgs) -> PathBuf {
    resolve_path(&resolve_path(&args.directory).join(&args.plan))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("serialize json")?
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run_with_overrides() {
        let cli = Cli::parse_from([
            "ralph",
            "run",
            "docs/plan.md",
            "--directory",
            "/proj",
            "--no-commit",
            "--max-parallel",
            "2",
            "--skip",
            "task-003,task-004",
        ]);
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        let options = args.options();
        assert_eq!(options.plan_path, PathBuf::from("docs/plan.md"));
        assert_eq!(options.project_root, PathBuf::from("/proj"));
        assert!(options.overrides.no_commit);
        assert_eq!(options.overrides.max_parallel, Some(2));
        assert_eq!(options.overrides.auto_test, None);
        assert_eq!(options.skip, vec!["task-003", "task-004"]);
        assert!(!args.dry_run);
    }

    #[test]
    fn plan_defaults_to_plan_md_in_cwd() {
        let cli = Cli::parse_from(["ralph", "status"]);
        let Command::Status { plan, json } = cli.command else {
            panic!("expected status");
        };
        assert_eq!(plan.plan, PathBuf::from("plan.md"));
        assert_eq!(plan.directory, PathBuf::from("."));
        assert!(!json);
    }

    #[test]
    fn parse_registry_commands() {
        assert!(matches!(
            Cli::parse_from(["ralph", "unregister", "ab12cd34"]).command,
            Command::Unregister { plan_id } if plan_id == "ab12cd34"
        ));
        assert!(matches!(
            Cli::parse_from(["ralph", "registry-stats"]).command,
            Command::RegistryStats
        ));
        assert!(matches!(
            Cli::parse_from(["ralph", "mcp-server"]).command,
            Command::McpServer
        ));
    }
}
