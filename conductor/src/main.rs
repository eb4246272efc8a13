//! Red-green-refactor orchestrator for three terminal coding agents.
//!
//! Reads the task list, drives each task through test-writer, implementer and
//! refactorer on per-phase branches, and merges finished work into the
//! default branch.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use conductor::console;
use conductor::core::command::HELP;
use conductor::exit_codes;
use conductor::io::config::{ConductorConfig, load_config};
use conductor::io::init::{ConductorPaths, InitOptions, init_project};
use conductor::io::llm::{DecisionClient, OllamaBackend};
use conductor::io::notifier::{Notifier, TmuxNotifier};
use conductor::io::run_state::load_pipeline_state;
use conductor::io::task_store::TaskStore;
use conductor::logging;
use conductor::looping::{LoopOptions, LoopStop, run_loop};
use conductor::pipeline::{Pipeline, branch_manager};
use conductor::signals::ShutdownSignal;

#[derive(Parser)]
#[command(
    name = "conductor",
    version,
    about = "Red-green-refactor orchestrator for terminal coding agents"
)]
struct Cli {
    /// Project root (defaults to the current directory).
    #[arg(long, global = true)]
    root: Option<PathBuf>,
    /// Config file (defaults to `<root>/.conductor/config.toml`).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.conductor/` scaffolding and the three agent workspaces.
    Setup {
        /// Overwrite an existing config file.
        #[arg(short, long)]
        force: bool,
    },
    /// Drive the pipeline until interrupted.
    Run {
        /// No console; exit once every task is completed or stuck.
        #[arg(long)]
        non_interactive: bool,
    },
    /// Print the persisted pipeline state and task counts.
    Status,
    /// Check the decision service and the tmux session.
    Health,
}

fn main() {
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let root = match cli.root {
        Some(root) => root,
        None => std::env::current_dir().context("resolve current directory")?,
    };
    let paths = ConductorPaths::new(root);
    let config_path = cli.config.unwrap_or_else(|| paths.config_path.clone());
    let config = load_config(&config_path)?;
    config
        .validate()
        .with_context(|| format!("invalid config {}", config_path.display()))?;

    match cli.command {
        Command::Setup { force } => cmd_setup(&paths, &config, force),
        Command::Run { non_interactive } => cmd_run(paths, config, non_interactive),
        Command::Status => cmd_status(&paths, &config),
        Command::Health => cmd_health(&config),
    }
}

fn cmd_setup(paths: &ConductorPaths, config: &ConductorConfig, force: bool) -> Result<i32> {
    logging::init(None)?;
    init_project(paths, config, &InitOptions { force })?;
    let created = branch_manager(config, paths)?.setup_workspaces()?;
    println!("Initialized {}", paths.conductor_dir.display());
    for dir in created {
        println!("Created workspace {}", dir.display());
    }
    Ok(exit_codes::OK)
}

fn cmd_run(paths: ConductorPaths, config: ConductorConfig, non_interactive: bool) -> Result<i32> {
    let log_file = paths.resolve(&config.logging.file);
    logging::init(Some(&log_file))?;

    let mut notifier = TmuxNotifier::new(&config.tmux, &config.agents);
    if notifier.session_available() {
        info!(session = %config.tmux.session_name, "tmux session found; agents will be woken");
    } else {
        warn!(session = %config.tmux.session_name, "tmux session not found; agents must check their mailboxes themselves");
    }
    let backend = OllamaBackend::new(&config.llm)?;
    let options = LoopOptions {
        interval: Duration::from_secs(config.polling.interval_secs),
        interactive: !non_interactive,
        log_file,
    };
    let model = config.llm.model.clone();
    let base_url = config.llm.base_url.clone();
    let allow_unavailable = config.llm.allow_unavailable;
    let mut pipeline = Pipeline::open(config, paths, notifier, backend)?;
    if !pipeline.decisions().health_check() {
        if !allow_unavailable {
            bail!(
                "decision model {model} is not available at {base_url}; start it, or set llm.allow_unavailable = true to run without it"
            );
        }
        warn!(model = %model, "decision service unavailable; unclassified verdicts will be flagged for review");
    }

    let shutdown = ShutdownSignal::install()?;

    let commands = if non_interactive {
        None
    } else {
        println!("{HELP}");
        Some(console::spawn_input()?)
    };
    let stop = run_loop(&mut pipeline, commands, shutdown.flag(), &options, |text| {
        println!("{text}");
    })?;

    let counts = pipeline.tasks().counts();
    info!(?stop, completed = counts.completed, stuck = counts.stuck, "conductor stopped");
    if stop == LoopStop::Finished && counts.stuck > 0 {
        return Ok(exit_codes::STUCK);
    }
    Ok(exit_codes::OK)
}

fn cmd_status(paths: &ConductorPaths, config: &ConductorConfig) -> Result<i32> {
    logging::init(None)?;
    let tasks = TaskStore::load(&paths.resolve(&config.tasks.file), config.tasks.max_attempts)?;
    let state = load_pipeline_state(&paths.run_state_path)?;

    println!("State: {}", state.state);
    match state.task_id.as_deref().and_then(|id| tasks.get(id)) {
        Some(task) => println!("Task: {} - {} (attempts {})", task.id, task.title, task.attempts),
        None => println!("Task: none"),
    }
    if let Some(pending) = &state.pending_merge {
        println!("Blocked on: {} ({})", pending.stage, pending.reason);
    }
    if let Some(reason) = &state.pending_assignment {
        println!("Blocked on: task branches ({reason})");
    }
    let counts = tasks.counts();
    println!(
        "Tasks: {} pending, {} in progress, {} completed, {} stuck",
        counts.pending, counts.in_progress, counts.completed, counts.stuck
    );
    Ok(exit_codes::OK)
}

fn cmd_health(config: &ConductorConfig) -> Result<i32> {
    logging::init(None)?;
    let client = DecisionClient::new(OllamaBackend::new(&config.llm)?, config.llm.model.clone(), "");
    let llm_ok = client.health_check();
    let mut notifier = TmuxNotifier::new(&config.tmux, &config.agents);
    let tmux_ok = notifier.session_available();

    println!(
        "decision service ({} at {}): {}",
        config.llm.model,
        config.llm.base_url,
        if llm_ok { "ok" } else { "unavailable" }
    );
    println!(
        "tmux session '{}': {}",
        config.tmux.session_name,
        if tmux_ok { "found" } else { "not found" }
    );
    Ok(if llm_ok { exit_codes::OK } else { exit_codes::INVALID })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run_flags() {
        let cli = Cli::parse_from(["conductor", "run", "--non-interactive"]);
        assert!(matches!(cli.command, Command::Run { non_interactive: true }));
        let cli = Cli::parse_from(["conductor", "--root", "/tmp/p", "run"]);
        assert_eq!(cli.root, Some(PathBuf::from("/tmp/p")));
        assert!(matches!(cli.command, Command::Run { non_interactive: false }));
    }

    #[test]
    fn global_config_after_subcommand() {
        let cli = Cli::parse_from(["conductor", "status", "--config", "other.toml"]);
        assert_eq!(cli.config, Some(PathBuf::from("other.toml")));
        assert!(matches!(cli.command, Command::Status));
    }

    #[test]
    fn parse_setup_force() {
        let cli = Cli::parse_from(["conductor", "setup", "-f"]);
        assert!(matches!(cli.command, Command::Setup { force: true }));
    }
}
