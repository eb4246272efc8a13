//! Best-effort agent wake signals.
//!
//! Signals go through `tmux send-keys`. Nothing here ever fails the caller: a
//! missing binary, a missing session or a timeout is logged and reported as
//! [`NotifyOutcome::Failed`], and the pipeline carries on. Agents that were not
//! woken still find their messages on their next manual check.

use std::process::Command;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, warn};

use crate::core::cooldown::Cooldown;
use crate::core::types::Role;
use crate::io::config::{AgentsConfig, TmuxConfig};
use crate::io::process::run_command_with_timeout;

const TMUX_OUTPUT_LIMIT_BYTES: usize = 16 * 1024;

/// What happened to a signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyOutcome {
    Sent,
    /// Rate limited; the agent was signalled recently.
    Suppressed { remaining: Duration },
    /// Could not deliver; carries the diagnostic.
    Failed(String),
}

impl NotifyOutcome {
    pub fn is_sent(&self) -> bool {
        matches!(self, NotifyOutcome::Sent)
    }
}

/// Delivery channel for agent signals.
pub trait Notifier {
    /// Rate-limited wake signal.
    fn notify(&mut self, agent: Role) -> NotifyOutcome;

    /// Operator-requested wake signal; ignores and restarts the cooldown.
    fn nudge(&mut self, agent: Role) -> NotifyOutcome;

    /// Reset the agent's conversation before a new task.
    fn clear_context(&mut self, agent: Role) -> NotifyOutcome;

    /// Type arbitrary text into the agent's terminal and submit it.
    fn send_text(&mut self, agent: Role, text: &str) -> NotifyOutcome;

    /// Whether the multiplexer session exists.
    fn session_available(&mut self) -> bool;
}

/// [`Notifier`] backed by a tmux session with one pane per agent.
#[derive(Debug, Clone)]
pub struct TmuxNotifier {
    binary: String,
    session: String,
    agents: AgentsConfig,
    nudge_prompt: String,
    clear_command: String,
    submit_delay: Duration,
    timeout: Duration,
    cooldown: Cooldown,
}

impl TmuxNotifier {
    pub fn new(tmux: &TmuxConfig, agents: &AgentsConfig) -> Self {
        Self {
            binary: "tmux".to_string(),
            session: tmux.session_name.clone(),
            agents: agents.clone(),
            nudge_prompt: tmux.nudge_prompt.clone(),
            clear_command: tmux.clear_command.clone(),
            submit_delay: Duration::from_millis(tmux.submit_delay_ms),
            timeout: Duration::from_secs(tmux.command_timeout_secs),
            cooldown: Cooldown::new(Duration::from_secs(tmux.nudge_cooldown_secs)),
        }
    }

    /// Use a different tmux executable (or a deliberately missing one).
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    fn target(&self, agent: Role) -> String {
        match self.agents.pane(agent) {
            Some(pane) => format!("{}:{}", self.session, pane),
            None => format!("{}:{}", self.session, agent),
        }
    }

    /// Type `text` literally, pause, then press Enter. Terminal UIs drop the
    /// submit if it arrives in the same burst as the text.
    fn type_and_submit(&self, agent: Role, text: &str) -> NotifyOutcome {
        let target = self.target(agent);
        if let Err(reason) = self.tmux(&["send-keys", "-t", &target, "-l", text]) {
            warn!(agent = %agent, target = %target, reason = %reason, "tmux send-keys failed");
            return NotifyOutcome::Failed(reason);
        }
        thread::sleep(self.submit_delay);
        if let Err(reason) = self.tmux(&["send-keys", "-t", &target, "Enter"]) {
            warn!(agent = %agent, target = %target, reason = %reason, "tmux submit failed");
            return NotifyOutcome::Failed(reason);
        }
        NotifyOutcome::Sent
    }

    fn tmux(&self, args: &[&str]) -> Result<(), String> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args);
        let output = run_command_with_timeout(cmd, self.timeout, TMUX_OUTPUT_LIMIT_BYTES)
            .map_err(|err| format!("{err:#}"))?;
        if output.success() {
            Ok(())
        } else {
            Err(output.diagnostic())
        }
    }
}

impl Notifier for TmuxNotifier {
    #[instrument(skip_all, fields(agent = %agent))]
    fn notify(&mut self, agent: Role) -> NotifyOutcome {
        let now = Instant::now();
        if let Some(remaining) = self.cooldown.remaining(agent, now) {
            debug!(remaining_secs = remaining.as_secs(), "nudge suppressed by cooldown");
            return NotifyOutcome::Suppressed { remaining };
        }
        let outcome = self.type_and_submit(agent, &self.nudge_prompt);
        if outcome.is_sent() {
            self.cooldown.record(agent, now);
            info!("agent nudged");
        }
        outcome
    }

    fn nudge(&mut self, agent: Role) -> NotifyOutcome {
        self.cooldown.reset(agent);
        self.notify(agent)
    }

    #[instrument(skip_all, fields(agent = %agent))]
    fn clear_context(&mut self, agent: Role) -> NotifyOutcome {
        if self.clear_command.trim().is_empty() {
            return NotifyOutcome::Sent;
        }
        let outcome = self.type_and_submit(agent, &self.clear_command);
        if outcome.is_sent() {
            // A fresh conversation should be woken straight away.
            self.cooldown.reset(agent);
            debug!("agent context cleared");
        }
        outcome
    }

    fn send_text(&mut self, agent: Role, text: &str) -> NotifyOutcome {
        self.type_and_submit(agent, text)
    }

    fn session_available(&mut self) -> bool {
        match self.tmux(&["has-session", "-t", &self.session]) {
            Ok(()) => true,
            Err(reason) => {
                debug!(session = %self.session, reason = %reason, "tmux session not available");
                false
            }
        }
    }
}
