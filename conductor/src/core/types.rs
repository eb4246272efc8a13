//! Shared deterministic types for the pipeline core.
//!
//! These types define stable contracts between the controller, the mailbox
//! and the persisted state files. Their serialized names are part of the
//! on-disk format and must not change.

use std::fmt;
use std::str::FromStr;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

/// A participant in the mailbox protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Orchestrator,
    #[serde(alias = "test-writer", alias = "tests")]
    TestWriter,
    #[serde(alias = "impl", alias = "dev")]
    Implementer,
    #[serde(alias = "refactor", alias = "qa")]
    Refactorer,
}

impl Role {
    /// The three agent roles, in pipeline order.
    pub const AGENTS: [Role; 3] = [Role::TestWriter, Role::Implementer, Role::Refactorer];

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Orchestrator => "orchestrator",
            Role::TestWriter => "test_writer",
            Role::Implementer => "implementer",
            Role::Refactorer => "refactorer",
        }
    }

    /// Name of the mailbox directory holding messages addressed to this role.
    pub fn mailbox_dir_name(self) -> String {
        format!("to_{}", self.as_str())
    }

    pub fn is_agent(self) -> bool {
        self != Role::Orchestrator
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = anyhow::Error;

    /// Accepts the canonical names plus the short forms operators type.
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "orchestrator" => Ok(Role::Orchestrator),
            "test_writer" | "tests" | "test" | "tw" | "red" => Ok(Role::TestWriter),
            "implementer" | "impl" | "dev" | "green" => Ok(Role::Implementer),
            "refactorer" | "refactor" | "qa" => Ok(Role::Refactorer),
            other => Err(anyhow!(
                "unknown agent '{other}' (expected test_writer, implementer or refactorer)"
            )),
        }
    }
}

/// Lifecycle status of a task in the task list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Stuck,
}

impl TaskStatus {
    /// Completed and stuck tasks are never selected again.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Stuck)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Stuck => "stuck",
        }
    }
}

/// Red-Green-Refactor controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RgrState {
    Idle,
    WaitingTests,
    WaitingImplementation,
    WaitingRefactor,
    Blocked,
}

impl RgrState {
    pub const ALL: [RgrState; 5] = [
        RgrState::Idle,
        RgrState::WaitingTests,
        RgrState::WaitingImplementation,
        RgrState::WaitingRefactor,
        RgrState::Blocked,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RgrState::Idle => "IDLE",
            RgrState::WaitingTests => "WAITING_TESTS",
            RgrState::WaitingImplementation => "WAITING_IMPLEMENTATION",
            RgrState::WaitingRefactor => "WAITING_REFACTOR",
            RgrState::Blocked => "BLOCKED",
        }
    }
}

impl fmt::Display for RgrState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which forward merge a blocked pipeline is waiting to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStage {
    /// Test branch into the implementation workspace.
    TestsIntoImplementation,
    /// Implementation branch into the refactor workspace.
    ImplementationIntoRefactor,
    /// Refactor branch into the default branch.
    RefactorIntoDefault,
}

impl MergeStage {
    /// State the pipeline returns to if the merge is retried and fails again.
    pub fn waiting_state(self) -> RgrState {
        match self {
            MergeStage::TestsIntoImplementation => RgrState::WaitingTests,
            MergeStage::ImplementationIntoRefactor => RgrState::WaitingImplementation,
            MergeStage::RefactorIntoDefault => RgrState::WaitingRefactor,
        }
    }
}

impl fmt::Display for MergeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            MergeStage::TestsIntoImplementation => "tests -> implementation",
            MergeStage::ImplementationIntoRefactor => "implementation -> refactor",
            MergeStage::RefactorIntoDefault => "refactor -> default",
        };
        f.write_str(label)
    }
}

/// Refactorer's classification of a completed cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Fail,
    /// Anything the controller cannot classify on its own.
    Unrecognized(String),
}

impl Verdict {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pass" | "passed" | "approved" | "ok" => Verdict::Pass,
            "fail" | "failed" | "fix_required" | "rejected" => Verdict::Fail,
            _ => Verdict::Unrecognized(raw.to_string()),
        }
    }
}
