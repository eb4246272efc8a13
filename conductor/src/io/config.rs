//! Orchestrator configuration stored under `.conductor/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::types::Role;
use crate::io::atomic::write_atomic;

/// Orchestrator configuration (TOML).
///
/// Every section defaults, so an empty or missing file is a valid config.
/// Relative paths are resolved against the project root.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConductorConfig {
    pub polling: PollingConfig,
    pub tasks: TasksConfig,
    pub llm: LlmConfig,
    pub tmux: TmuxConfig,
    pub agents: AgentsConfig,
    pub git: GitConfig,
    pub workspaces: WorkspacesConfig,
    pub pipeline: PipelineConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PollingConfig {
    /// Seconds between mailbox sweeps.
    pub interval_secs: u64,
    /// Root holding the `to_<role>` mailbox directories.
    pub mailbox_dir: PathBuf,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_secs: 5,
            mailbox_dir: PathBuf::from(".conductor/mailbox"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TasksConfig {
    /// JSON task list (`{"tasks": [...]}`).
    pub file: PathBuf,
    /// Failed cycles allowed before a task is marked stuck. 0 = unlimited.
    pub max_attempts: u32,
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            file: PathBuf::from(".conductor/tasks.json"),
            max_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LlmConfig {
    pub base_url: String,
    pub model: String,
    /// Append `/no_think` to prompts for models that honour it.
    pub disable_thinking: bool,
    pub temperature: f64,
    pub num_predict: u32,
    pub timeout_secs: u64,
    pub health_timeout_secs: u64,
    /// Recent mailbox messages included in decision context.
    pub history_messages: usize,
    /// Let `run` start when the model is not listed; unclassified verdicts
    /// are then flagged for review.
    pub allow_unavailable: bool,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            model: "qwen3:8b".to_string(),
            disable_thinking: false,
            temperature: 0.3,
            num_predict: 4096,
            timeout_secs: 60,
            health_timeout_secs: 5,
            history_messages: 6,
            allow_unavailable: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TmuxConfig {
    pub session_name: String,
    /// Text typed into an agent pane to wake it.
    pub nudge_prompt: String,
    /// Text typed to reset an agent's conversation before a new task.
    pub clear_command: String,
    pub nudge_cooldown_secs: u64,
    pub command_timeout_secs: u64,
    /// Gap between typing text and pressing Enter.
    pub submit_delay_ms: u64,
}

impl Default for TmuxConfig {
    fn default() -> Self {
        Self {
            session_name: "rgr".to_string(),
            nudge_prompt: "You have new messages. Use the check_messages MCP tool with your \
                           role to read and act on them."
                .to_string(),
            clear_command: "/clear".to_string(),
            nudge_cooldown_secs: 30,
            command_timeout_secs: 5,
            submit_delay_ms: 200,
        }
    }
}

/// A table given for one agent must name its pane; omitted agents keep the
/// defaults from [`AgentsConfig`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentConfig {
    /// tmux pane (or window) target within the session.
    pub pane: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentsConfig {
    pub test_writer: AgentConfig,
    pub implementer: AgentConfig,
    pub refactorer: AgentConfig,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        let pane = |p: &str| AgentConfig {
            pane: p.to_string(),
        };
        Self {
            test_writer: pane("0"),
            implementer: pane("1"),
            refactorer: pane("2"),
        }
    }
}

impl AgentsConfig {
    pub fn pane(&self, agent: Role) -> Option<&str> {
        match agent {
            Role::TestWriter => Some(&self.test_writer.pane),
            Role::Implementer => Some(&self.implementer.pane),
            Role::Refactorer => Some(&self.refactorer.pane),
            Role::Orchestrator => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GitConfig {
    pub timeout_secs: u64,
    /// Overrides the branch detected at startup.
    pub default_branch: Option<String>,
    pub test_branch_prefix: String,
    pub impl_branch_prefix: String,
    pub refactor_branch_prefix: String,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            default_branch: None,
            test_branch_prefix: "tests/".to_string(),
            impl_branch_prefix: "impl/".to_string(),
            refactor_branch_prefix: "refactor/".to_string(),
        }
    }
}

impl GitConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Branch name a given agent works on for `task_id`.
    pub fn branch_for(&self, agent: Role, task_id: &str) -> Option<String> {
        let prefix = match agent {
            Role::TestWriter => &self.test_branch_prefix,
            Role::Implementer => &self.impl_branch_prefix,
            Role::Refactorer => &self.refactor_branch_prefix,
            Role::Orchestrator => return None,
        };
        Some(format!("{prefix}{task_id}"))
    }
}

/// Checkout directories, one per agent. The project root is the default
/// workspace that receives finished work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkspacesConfig {
    pub test_writer: PathBuf,
    pub implementer: PathBuf,
    pub refactorer: PathBuf,
}

impl Default for WorkspacesConfig {
    fn default() -> Self {
        Self {
            test_writer: PathBuf::from(".conductor/workspaces/test_writer"),
            implementer: PathBuf::from(".conductor/workspaces/implementer"),
            refactorer: PathBuf::from(".conductor/workspaces/refactorer"),
        }
    }
}

impl WorkspacesConfig {
    pub fn path(&self, agent: Role) -> Option<&Path> {
        match agent {
            Role::TestWriter => Some(&self.test_writer),
            Role::Implementer => Some(&self.implementer),
            Role::Refactorer => Some(&self.refactorer),
            Role::Orchestrator => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Every Nth failed cycle asks the test-writer to re-check its tests
    /// instead of sending the implementer back. 0 disables re-validation.
    pub revalidate_tests_every: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    pub file: PathBuf,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            file: PathBuf::from(".conductor/conductor.log"),
        }
    }
}

impl ConductorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.polling.interval_secs == 0 {
            return Err(anyhow!("polling.interval_secs must be > 0"));
        }
        if self.llm.timeout_secs == 0 || self.llm.health_timeout_secs == 0 {
            return Err(anyhow!("llm timeouts must be > 0"));
        }
        if self.llm.model.trim().is_empty() {
            return Err(anyhow!("llm.model must not be empty"));
        }
        if !self.llm.base_url.starts_with("http://") && !self.llm.base_url.starts_with("https://")
        {
            return Err(anyhow!(
                "llm.base_url must be an http(s) url, got '{}'",
                self.llm.base_url
            ));
        }
        if self.tmux.session_name.trim().is_empty() {
            return Err(anyhow!("tmux.session_name must not be empty"));
        }
        if self.tmux.command_timeout_secs == 0 {
            return Err(anyhow!("tmux.command_timeout_secs must be > 0"));
        }
        if self.git.timeout_secs == 0 {
            return Err(anyhow!("git.timeout_secs must be > 0"));
        }
        for agent in Role::AGENTS {
            if self.agents.pane(agent).is_some_and(|p| p.trim().is_empty()) {
                return Err(anyhow!("agents.{agent}.pane must not be empty"));
            }
        }
        let prefixes = [
            &self.git.test_branch_prefix,
            &self.git.impl_branch_prefix,
            &self.git.refactor_branch_prefix,
        ];
        if prefixes.iter().any(|p| p.trim().is_empty()) {
            return Err(anyhow!("git branch prefixes must not be empty"));
        }
        if prefixes[0] == prefixes[1] || prefixes[1] == prefixes[2] || prefixes[0] == prefixes[2] {
            return Err(anyhow!("git branch prefixes must be distinct"));
        }
        let workspaces = [
            &self.workspaces.test_writer,
            &self.workspaces.implementer,
            &self.workspaces.refactorer,
        ];
        if workspaces[0] == workspaces[1]
            || workspaces[1] == workspaces[2]
            || workspaces[0] == workspaces[2]
        {
            return Err(anyhow!("workspaces must be three distinct directories"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `ConductorConfig::default()`.
pub fn load_config(path: &Path) -> Result<ConductorConfig> {
    if !path.exists() {
        let cfg = ConductorConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: ConductorConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &ConductorConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, ConductorConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let mut cfg = ConductorConfig::default();
        cfg.git.default_branch = Some("trunk".to_string());
        cfg.pipeline.revalidate_tests_every = 2;
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "[tasks]\nmax_attempts = 5\n\n[tmux]\nsession_name = \"work\"\n")
            .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.tasks.max_attempts, 5);
        assert_eq!(cfg.tmux.session_name, "work");
        assert_eq!(cfg.tmux.nudge_cooldown_secs, 30);
        assert_eq!(cfg.polling, PollingConfig::default());
    }

    #[test]
    fn agent_table_overrides_only_that_agent() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "[agents.implementer]\npane = \"dev\"\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.agents.implementer.pane, "dev");
        assert_eq!(cfg.agents.test_writer, AgentsConfig::default().test_writer);
        assert!(!cfg.llm.allow_unavailable);
    }

    #[test]
    fn agent_table_without_pane_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "[agents.refactorer]\n").expect("write");
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        let mut cfg = ConductorConfig::default();
        cfg.polling.interval_secs = 0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("interval_secs"));
    }

    #[test]
    fn shared_workspace_is_rejected() {
        let mut cfg = ConductorConfig::default();
        cfg.workspaces.refactorer = cfg.workspaces.implementer.clone();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn branch_names_use_prefixes() {
        let git = GitConfig::default();
        assert_eq!(
            git.branch_for(Role::Implementer, "t-1").as_deref(),
            Some("impl/t-1")
        );
        assert_eq!(git.branch_for(Role::Orchestrator, "t-1"), None);
    }
}
