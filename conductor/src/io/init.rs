//! Project layout under `.conductor/` and the scaffolding written by
//! `conductor setup`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::info;

use crate::io::atomic::write_atomic;
use crate::io::config::{ConductorConfig, WorkspacesConfig, write_config};
use crate::task::{Task, TaskFile};

/// Ignore everything the orchestrator owns so it never shows up as untracked
/// work in the default workspace (and is never stashed by a merge).
const CONDUCTOR_GITIGNORE: &str = "*\n";

/// Canonical paths for a project root.
#[derive(Debug, Clone)]
pub struct ConductorPaths {
    pub root: PathBuf,
    pub conductor_dir: PathBuf,
    pub state_dir: PathBuf,
    pub gitignore_path: PathBuf,
    pub config_path: PathBuf,
    pub run_state_path: PathBuf,
}

impl ConductorPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let conductor_dir = root.join(".conductor");
        let state_dir = conductor_dir.join("state");
        Self {
            root,
            gitignore_path: conductor_dir.join(".gitignore"),
            config_path: conductor_dir.join("config.toml"),
            run_state_path: state_dir.join("run_state.json"),
            conductor_dir,
            state_dir,
        }
    }

    /// Resolve a configured path: absolute paths are kept, relative ones are
    /// joined onto the project root.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    /// Resolved test-writer, implementer and refactorer workspaces.
    pub fn workspaces(&self, config: &WorkspacesConfig) -> [PathBuf; 3] {
        [
            self.resolve(&config.test_writer),
            self.resolve(&config.implementer),
            self.resolve(&config.refactorer),
        ]
    }
}

/// Options for `init_project`.
#[derive(Debug, Clone, Default)]
pub struct InitOptions {
    /// Overwrite an existing config file.
    pub force: bool,
}

/// Create `.conductor/` scaffolding in `root`: state directory, ignore file,
/// default config and an example task list. Existing files are left alone
/// unless `force` is set (the task list is never overwritten).
pub fn init_project(
    paths: &ConductorPaths,
    config: &ConductorConfig,
    options: &InitOptions,
) -> Result<()> {
    if paths.conductor_dir.exists() && !paths.conductor_dir.is_dir() {
        return Err(anyhow!(
            "conductor setup: {} exists but is not a directory",
            paths.conductor_dir.display()
        ));
    }
    create_dir(&paths.conductor_dir)?;
    create_dir(&paths.state_dir)?;
    write_atomic(&paths.gitignore_path, CONDUCTOR_GITIGNORE)?;

    if options.force || !paths.config_path.exists() {
        write_config(&paths.config_path, config)?;
        info!(path = %paths.config_path.display(), "wrote config");
    }

    let tasks_path = paths.resolve(&config.tasks.file);
    if !tasks_path.exists() {
        write_example_tasks(&tasks_path)?;
        info!(path = %tasks_path.display(), "wrote example task list");
    }
    Ok(())
}

fn write_example_tasks(path: &Path) -> Result<()> {
    let mut example = Task::new("example-1", "Replace this task with real work");
    example.description = "Describe the behaviour the test-writer should pin down.".to_string();
    example.acceptance_criteria = vec!["A failing test exists before implementation".to_string()];
    let file = TaskFile {
        tasks: vec![example],
        ..TaskFile::default()
    };
    let mut buf = serde_json::to_string_pretty(&file).context("serialize example tasks")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create directory {}", path.display()))
}
