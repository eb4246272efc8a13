//! Mailbox message model.
//!
//! A [`Message`] is the on-disk record: an immutable fact written once by its
//! sender. Its payload is kept as raw JSON so a message round-trips exactly as
//! the agent wrote it; [`MessageContent`] is the typed view decoded from the
//! `type` tag. Decoding never fails: anything unrecognised (or recognised but
//! missing required fields) becomes [`MessageContent::Unknown`].

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::types::{Role, Verdict};

/// A message as stored in a mailbox directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub from: Role,
    pub to: Role,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub content: Value,
    pub timestamp: String,
    #[serde(default)]
    pub read: bool,
}

impl Message {
    /// Typed view of the payload.
    pub fn body(&self) -> MessageContent {
        MessageContent::decode(&self.kind, &self.content)
    }

    /// Task id referenced by the payload, if the sender included one.
    pub fn task_id(&self) -> Option<&str> {
        self.content.get("task_id").and_then(Value::as_str)
    }

    /// Verdict carried by a refactorer report.
    ///
    /// Falls back to the raw `verdict`/`status` fields so an agent that picked
    /// a different `type` tag is still classified.
    pub fn verdict(&self) -> Verdict {
        if let MessageContent::RefactorVerdict(report) = self.body() {
            return Verdict::parse(&report.verdict);
        }
        if self.kind == "fix_required" {
            return Verdict::Fail;
        }
        ["verdict", "status", "result"]
            .iter()
            .find_map(|key| self.content.get(*key).and_then(Value::as_str))
            .map(Verdict::parse)
            .unwrap_or_else(|| Verdict::Unrecognized(self.kind.clone()))
    }
}

/// Work handed to the test-writer at the start of a cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAssignment {
    pub task_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub branch: String,
    #[serde(default)]
    pub attempt: u32,
    #[serde(default)]
    pub instructions: String,
}

/// Report that a phase finished, as sent by an agent or forwarded by the
/// orchestrator to the next phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkReport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub summary: String,
    #[serde(default)]
    pub files_changed: Vec<String>,
    #[serde(default, alias = "test_instructions")]
    pub notes: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub branch: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub instructions: String,
}

/// Refactorer's judgement on the cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefactorVerdict {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(alias = "status")]
    pub verdict: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default, alias = "bugs")]
    pub issues: Vec<Value>,
}

/// Instructions sent back to the implementer after a failed cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixRequired {
    pub task_id: String,
    pub attempt: u32,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub issues: Vec<Value>,
    #[serde(default)]
    pub instructions: String,
}

/// Request for the test-writer to re-check its branch after repeated failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevalidateTests {
    pub task_id: String,
    pub attempt: u32,
    #[serde(default)]
    pub issues: Vec<Value>,
    #[serde(default)]
    pub instructions: String,
}

/// Completion broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllDone {
    pub message: String,
    #[serde(default)]
    pub completed: usize,
    #[serde(default)]
    pub stuck: usize,
}

/// Typed message payload keyed by the message `type` tag.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageContent {
    TaskAssignment(TaskAssignment),
    TestsReady(WorkReport),
    ImplementationReady(WorkReport),
    RefactorVerdict(RefactorVerdict),
    FixRequired(FixRequired),
    RevalidateTests(RevalidateTests),
    AllDone(AllDone),
    Unknown { kind: String, content: Value },
}

impl MessageContent {
    pub fn decode(kind: &str, content: &Value) -> Self {
        fn typed<T: DeserializeOwned>(content: &Value) -> Option<T> {
            serde_json::from_value(content.clone()).ok()
        }

        let decoded = match kind {
            "task_assignment" => typed(content).map(MessageContent::TaskAssignment),
            "tests_ready" => typed(content).map(MessageContent::TestsReady),
            "implementation_ready" => typed(content).map(MessageContent::ImplementationReady),
            "refactor_verdict" => typed(content).map(MessageContent::RefactorVerdict),
            "fix_required" => typed(content).map(MessageContent::FixRequired),
            "revalidate_tests" => typed(content).map(MessageContent::RevalidateTests),
            "all_done" => typed(content).map(MessageContent::AllDone),
            _ => None,
        };
        decoded.unwrap_or_else(|| MessageContent::Unknown {
            kind: kind.to_string(),
            content: content.clone(),
        })
    }

    /// The `type` tag this payload is written under.
    pub fn kind(&self) -> &str {
        match self {
            MessageContent::TaskAssignment(_) => "task_assignment",
            MessageContent::TestsReady(_) => "tests_ready",
            MessageContent::ImplementationReady(_) => "implementation_ready",
            MessageContent::RefactorVerdict(_) => "refactor_verdict",
            MessageContent::FixRequired(_) => "fix_required",
            MessageContent::RevalidateTests(_) => "revalidate_tests",
            MessageContent::AllDone(_) => "all_done",
            MessageContent::Unknown { kind, .. } => kind,
        }
    }

    pub fn to_value(&self) -> Result<Value> {
        let value = match self {
            MessageContent::TaskAssignment(c) => serde_json::to_value(c),
            MessageContent::TestsReady(c) | MessageContent::ImplementationReady(c) => {
                serde_json::to_value(c)
            }
            MessageContent::RefactorVerdict(c) => serde_json::to_value(c),
            MessageContent::FixRequired(c) => serde_json::to_value(c),
            MessageContent::RevalidateTests(c) => serde_json::to_value(c),
            MessageContent::AllDone(c) => serde_json::to_value(c),
            MessageContent::Unknown { content, .. } => Ok(content.clone()),
        };
        value.with_context(|| format!("serialize {} content", self.kind()))
    }
}

/// Extract a phase report from whatever an agent sent.
///
/// Agents do not always use the canonical tag, so any payload with a
/// `summary` is accepted and the rest of the fields default.
pub fn work_report_from(message: &Message) -> WorkReport {
    match message.body() {
        MessageContent::TestsReady(report) | MessageContent::ImplementationReady(report) => report,
        _ => WorkReport {
            task_id: message.task_id().map(str::to_string),
            summary: message
                .content
                .get("summary")
                .and_then(Value::as_str)
                .or_else(|| message.content.get("message").and_then(Value::as_str))
                .unwrap_or_default()
                .to_string(),
            files_changed: message
                .content
                .get("files_changed")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            notes: String::new(),
            branch: String::new(),
            instructions: String::new(),
        },
    }
}
