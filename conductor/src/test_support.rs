//! Test-only helpers: throwaway git repositories with agent workspaces,
//! scripted collaborators, and task fixtures.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, anyhow};
use serde_json::Value;
use tempfile::TempDir;

use crate::core::message::{Message, MessageContent};
use crate::core::types::{Role, TaskStatus};
use crate::io::branches::BranchManager;
use crate::io::config::ConductorConfig;
use crate::io::git::Git;
use crate::io::init::ConductorPaths;
use crate::io::llm::InferenceBackend;
use crate::io::mailbox::Mailbox;
use crate::io::notifier::{Notifier, NotifyOutcome};
use crate::pipeline::Pipeline;
use crate::task::{Task, TaskFile};

/// Create a task with a fixed title and the given status.
pub fn task_with_status(id: &str, status: TaskStatus) -> Task {
    let mut task = Task::new(id, format!("{id} title"));
    task.status = status;
    task
}

/// A temporary git repository on `main` with one commit (`README.md`) and an
/// ignored `.conductor/` directory.
pub struct TestRepo {
    _dir: TempDir,
    root: PathBuf,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("create temp dir")?;
        let root = dir.path().to_path_buf();
        git(&root, &["init", "-q"])?;
        git(&root, &["symbolic-ref", "HEAD", "refs/heads/main"])?;
        git(&root, &["config", "user.email", "conductor@example.com"])?;
        git(&root, &["config", "user.name", "Conductor Tests"])?;
        git(&root, &["config", "commit.gpgsign", "false"])?;

        let paths = ConductorPaths::new(&root);
        fs::create_dir_all(&paths.state_dir).context("create state dir")?;
        fs::write(&paths.gitignore_path, "*\n").context("write .conductor/.gitignore")?;
        fs::write(root.join("README.md"), "# fixture\n").context("write README")?;
        git(&root, &["add", "README.md"])?;
        git(&root, &["commit", "-q", "-m", "initial"])?;
        Ok(Self { _dir: dir, root })
    }

    /// A repository whose three agent workspaces already exist.
    pub fn with_workspaces() -> Result<Self> {
        let repo = Self::new()?;
        repo.branch_manager().setup_workspaces()?;
        Ok(repo)
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn paths(&self) -> ConductorPaths {
        ConductorPaths::new(&self.root)
    }

    /// Default config with a `main` default branch.
    pub fn config(&self) -> ConductorConfig {
        let mut config = ConductorConfig::default();
        config.git.default_branch = Some("main".to_string());
        config
    }

    pub fn branch_manager(&self) -> BranchManager {
        let config = self.config();
        let workspaces = self.paths().workspaces(&config.workspaces);
        BranchManager::new(&self.root, "main", workspaces, config.git)
    }

    pub fn workspace(&self, agent: Role) -> PathBuf {
        let config = self.config();
        let path = config.workspaces.path(agent).unwrap_or(Path::new("."));
        self.paths().resolve(path)
    }

    /// Write and commit `name` in `agent`'s workspace on whatever it has
    /// checked out.
    pub fn commit_file(&self, agent: Role, name: &str, contents: &str, msg: &str) -> Result<()> {
        commit_in(&self.workspace(agent), name, contents, msg)
    }

    /// Write and commit `name` in the project checkout.
    pub fn commit_default(&self, name: &str, contents: &str, msg: &str) -> Result<()> {
        commit_in(&self.root, name, contents, msg)
    }

    /// Write the task list at the configured location.
    pub fn write_tasks(&self, tasks: Vec<Task>) -> Result<PathBuf> {
        let path = self.paths().resolve(&self.config().tasks.file);
        let file = TaskFile {
            tasks,
            ..TaskFile::default()
        };
        let buf = serde_json::to_string_pretty(&file).context("serialize tasks")?;
        fs::write(&path, buf).with_context(|| format!("write {}", path.display()))?;
        Ok(path)
    }

    /// Drop a message into a mailbox as an agent would.
    pub fn agent_sends(&self, from: Role, to: Role, kind: &str, content: Value) -> Result<Message> {
        let mailbox = Mailbox::new(self.paths().resolve(&self.config().polling.mailbox_dir));
        mailbox.ensure_dirs()?;
        mailbox.send(from, to, &MessageContent::decode(kind, &content))
    }

    /// Controller over this repository with recording and scripted
    /// collaborators.
    pub fn pipeline<N: Notifier>(
        &self,
        config: ConductorConfig,
        notifier: N,
        backend: ScriptedBackend,
    ) -> Result<Pipeline<N, ScriptedBackend>> {
        Pipeline::open(config, self.paths(), notifier, backend)
    }
}

fn commit_in(dir: &Path, name: &str, contents: &str, msg: &str) -> Result<()> {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    fs::write(&path, contents).with_context(|| format!("write {}", path.display()))?;
    let repo = Git::new(dir);
    repo.add_all()?;
    if !repo.commit_staged(msg)? {
        return Err(anyhow!("nothing to commit for {name}"));
    }
    Ok(())
}

fn git(dir: &Path, args: &[&str]) -> Result<()> {
    let status = Command::new("git")
        .args(args)
        .current_dir(dir)
        .status()
        .with_context(|| format!("spawn git {args:?}"))?;
    if !status.success() {
        return Err(anyhow!("git {args:?} failed in {}", dir.display()));
    }
    Ok(())
}

/// One recorded notifier call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    Notify(Role),
    Nudge(Role),
    Clear(Role),
    Text(Role, String),
}

/// [`Notifier`] that records every call. With `offline` set it behaves like
/// a missing tmux session.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    pub signals: Vec<Signal>,
    pub offline: bool,
}

impl RecordingNotifier {
    pub fn offline() -> Self {
        Self {
            signals: Vec::new(),
            offline: true,
        }
    }

    pub fn notified(&self, agent: Role) -> usize {
        self.signals
            .iter()
            .filter(|s| **s == Signal::Notify(agent))
            .count()
    }

    fn outcome(&self) -> NotifyOutcome {
        if self.offline {
            NotifyOutcome::Failed("no tmux session".to_string())
        } else {
            NotifyOutcome::Sent
        }
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&mut self, agent: Role) -> NotifyOutcome {
        self.signals.push(Signal::Notify(agent));
        self.outcome()
    }

    fn nudge(&mut self, agent: Role) -> NotifyOutcome {
        self.signals.push(Signal::Nudge(agent));
        self.outcome()
    }

    fn clear_context(&mut self, agent: Role) -> NotifyOutcome {
        self.signals.push(Signal::Clear(agent));
        self.outcome()
    }

    fn send_text(&mut self, agent: Role, text: &str) -> NotifyOutcome {
        self.signals.push(Signal::Text(agent, text.to_string()));
        self.outcome()
    }

    fn session_available(&mut self) -> bool {
        !self.offline
    }
}

/// [`InferenceBackend`] that replays canned replies in order and records the
/// prompts it was given.
#[derive(Debug, Default)]
pub struct ScriptedBackend {
    replies: RefCell<VecDeque<String>>,
    failure: Option<String>,
    models: Vec<String>,
    prompts: RefCell<Vec<String>>,
}

impl ScriptedBackend {
    pub fn replies<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: RefCell::new(replies.into_iter().map(Into::into).collect()),
            ..Self::default()
        }
    }

    /// Every call fails with `reason`.
    pub fn failing(reason: &str) -> Self {
        Self {
            failure: Some(reason.to_string()),
            ..Self::default()
        }
    }

    pub fn with_models<I, S>(mut self, models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.models = models.into_iter().map(Into::into).collect();
        self
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.borrow().clone()
    }
}

impl InferenceBackend for ScriptedBackend {
    fn generate(&self, _system: &str, prompt: &str) -> Result<String> {
        self.prompts.borrow_mut().push(prompt.to_string());
        if let Some(reason) = &self.failure {
            return Err(anyhow!("{reason}"));
        }
        self.replies
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("no scripted reply left"))
    }

    fn list_models(&self) -> Result<Vec<String>> {
        if let Some(reason) = &self.failure {
            return Err(anyhow!("{reason}"));
        }
        Ok(self.models.clone())
    }
}
