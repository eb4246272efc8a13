//! Pipeline state persisted between restarts.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::message::Message;
use crate::core::types::{MergeStage, RgrState};
use crate::io::atomic::write_atomic;

/// A merge that failed and is waiting for the operator to `resume`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingMerge {
    pub stage: MergeStage,
    /// Report that triggered the merge; replayed once the merge succeeds.
    pub trigger: Message,
    /// Diagnostic from the last attempt.
    #[serde(default)]
    pub reason: String,
}

/// Controller bookkeeping (`.conductor/state/run_state.json`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineState {
    pub state: RgrState,
    /// Task the controller is bound to, if any.
    pub task_id: Option<String>,
    pub pending_merge: Option<PendingMerge>,
    /// Why branch preparation for the bound task failed; `resume` retries it.
    #[serde(default)]
    pub pending_assignment: Option<String>,
    /// Set once the completion broadcast went out.
    #[serde(default)]
    pub all_done_sent: bool,
    /// Ids of agent messages already routed, so a restart does not replay them.
    #[serde(default)]
    pub routed: Vec<String>,
}

impl Default for PipelineState {
    fn default() -> Self {
        Self {
            state: RgrState::Idle,
            task_id: None,
            pending_merge: None,
            pending_assignment: None,
            all_done_sent: false,
            routed: Vec::new(),
        }
    }
}

/// Load pipeline state; a missing file means a fresh start.
pub fn load_pipeline_state(path: &Path) -> Result<PipelineState> {
    if !path.exists() {
        debug!(path = %path.display(), "no run state, starting idle");
        return Ok(PipelineState::default());
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read run state {}", path.display()))?;
    let state: PipelineState = serde_json::from_str(&contents)
        .with_context(|| format!("parse run state {}", path.display()))?;
    debug!(state = %state.state, task_id = ?state.task_id, "run state loaded");
    Ok(state)
}

/// Atomically write pipeline state to disk.
pub fn write_pipeline_state(path: &Path, state: &PipelineState) -> Result<()> {
    debug!(path = %path.display(), state = %state.state, task_id = ?state.task_id, "writing run state");
    let mut buf = serde_json::to_string_pretty(state).context("serialize run state")?;
    buf.push('\n');
    write_atomic(path, &buf).with_context(|| format!("write run state {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Role;
    use serde_json::json;

    #[test]
    fn missing_file_is_idle() {
        let temp = tempfile::tempdir().expect("tempdir");
        let state = load_pipeline_state(&temp.path().join("run_state.json")).expect("load");
        assert_eq!(state, PipelineState::default());
    }

    #[test]
    fn blocked_state_round_trips_with_trigger() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state").join("run_state.json");
        let state = PipelineState {
            state: RgrState::Blocked,
            task_id: Some("t1".to_string()),
            pending_merge: Some(PendingMerge {
                stage: MergeStage::TestsIntoImplementation,
                trigger: Message {
                    id: "20260101T000000000000Z-test_writer-tests_ready".to_string(),
                    from: Role::TestWriter,
                    to: Role::Implementer,
                    kind: "tests_ready".to_string(),
                    content: json!({"task_id": "t1", "summary": "tests"}),
                    timestamp: "2026-01-01T00:00:00Z".to_string(),
                    read: false,
                },
                reason: "conflict in src/lib.rs".to_string(),
            }),
            pending_assignment: None,
            all_done_sent: false,
            routed: vec!["earlier".to_string()],
        };

        write_pipeline_state(&path, &state).expect("write");
        assert_eq!(load_pipeline_state(&path).expect("load"), state);
        let raw = fs::read_to_string(&path).expect("read");
        assert!(raw.contains("\"BLOCKED\""));
        assert!(raw.contains("\"tests_into_implementation\""));
    }
}
