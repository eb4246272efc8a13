//! Task list storage with schema validation and atomic rewrites.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow};
use jsonschema::validator_for;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::selector::{current_task, exceeds_limit, status_counts};
use crate::core::types::TaskStatus;
use crate::io::atomic::write_atomic;
use crate::task::{Task, TaskFile};

const TASKS_SCHEMA: &str = include_str!("../../schemas/tasks.schema.json");

/// Result of recording a failed cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// The task may be attempted again; carries the new attempt count.
    Retry { attempts: u32 },
    /// The task ran out of attempts and is now stuck.
    Stuck { attempts: u32 },
}

/// Totals per task status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TaskCounts {
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub stuck: usize,
}

impl TaskCounts {
    pub fn total(&self) -> usize {
        self.pending + self.in_progress + self.completed + self.stuck
    }
}

/// In-memory task list backed by a JSON file.
///
/// Every mutation rewrites the whole file before returning.
#[derive(Debug)]
pub struct TaskStore {
    path: PathBuf,
    file: TaskFile,
    max_attempts: u32,
}

impl TaskStore {
    /// Load and validate the task list.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn load(path: &Path, max_attempts: u32) -> Result<Self> {
        let contents =
            fs::read_to_string(path).with_context(|| format!("read tasks {}", path.display()))?;
        let value: Value = serde_json::from_str(&contents)
            .with_context(|| format!("parse tasks {}", path.display()))?;
        validate_schema(&value).with_context(|| format!("validate tasks {}", path.display()))?;
        let file: TaskFile = serde_json::from_value(value)
            .with_context(|| format!("deserialize tasks {}", path.display()))?;

        let in_progress = file
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::InProgress)
            .count();
        if in_progress > 1 {
            warn!(in_progress, "more than one task in progress; the first one wins");
        }
        let mut seen = std::collections::HashSet::new();
        if let Some(dup) = file.tasks.iter().find(|t| !seen.insert(t.id.as_str())) {
            return Err(anyhow!("duplicate task id '{}' in {}", dup.id, path.display()));
        }

        debug!(tasks = file.tasks.len(), "tasks loaded");
        Ok(Self {
            path: path.to_path_buf(),
            file,
            max_attempts,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn tasks(&self) -> &[Task] {
        &self.file.tasks
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.file.tasks.iter().find(|t| t.id == id)
    }

    /// First task that is pending or in progress.
    pub fn current_task(&self) -> Option<&Task> {
        current_task(&self.file.tasks).map(|(_, task)| task)
    }

    /// Mark a task in progress.
    pub fn start(&mut self, id: &str) -> Result<()> {
        self.set_status(id, TaskStatus::InProgress)
    }

    /// Mark a task completed.
    pub fn advance(&mut self, id: &str) -> Result<()> {
        self.set_status(id, TaskStatus::Completed)?;
        info!(task_id = id, "task completed");
        Ok(())
    }

    /// Record a failed cycle. Past the attempt limit the task becomes stuck.
    #[instrument(skip_all, fields(task_id = id))]
    pub fn fail(&mut self, id: &str) -> Result<FailOutcome> {
        let max_attempts = self.max_attempts;
        let task = self.task_mut(id)?;
        task.attempts += 1;
        let attempts = task.attempts;
        let outcome = if exceeds_limit(attempts, max_attempts) {
            task.status = TaskStatus::Stuck;
            FailOutcome::Stuck { attempts }
        } else {
            FailOutcome::Retry { attempts }
        };
        self.save()?;
        info!(attempts, max_attempts, ?outcome, "recorded failed cycle");
        Ok(outcome)
    }

    /// Give up on a task (operator skip or human flag).
    pub fn mark_stuck(&mut self, id: &str) -> Result<()> {
        self.set_status(id, TaskStatus::Stuck)?;
        warn!(task_id = id, "task marked stuck");
        Ok(())
    }

    pub fn counts(&self) -> TaskCounts {
        let (pending, in_progress, completed, stuck) = status_counts(&self.file.tasks);
        TaskCounts {
            pending,
            in_progress,
            completed,
            stuck,
        }
    }

    /// True when every task is completed or stuck (vacuously true if empty).
    pub fn all_terminal(&self) -> bool {
        self.file.tasks.iter().all(|t| t.status.is_terminal())
    }

    fn set_status(&mut self, id: &str, status: TaskStatus) -> Result<()> {
        let task = self.task_mut(id)?;
        if task.status == status {
            return Ok(());
        }
        task.status = status;
        self.save()
    }

    fn task_mut(&mut self, id: &str) -> Result<&mut Task> {
        let path = self.path.display().to_string();
        self.file
            .tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| anyhow!("unknown task '{id}' in {path}"))
    }

    fn save(&self) -> Result<()> {
        let mut buf = serde_json::to_string_pretty(&self.file).context("serialize tasks")?;
        buf.push('\n');
        write_atomic(&self.path, &buf)
            .with_context(|| format!("write tasks {}", self.path.display()))
    }
}

fn validate_schema(value: &Value) -> Result<()> {
    static VALIDATOR: LazyLock<Result<jsonschema::Validator, String>> = LazyLock::new(|| {
        let schema: Value = serde_json::from_str(TASKS_SCHEMA).map_err(|err| err.to_string())?;
        validator_for(&schema).map_err(|err| err.to_string())
    });
    let validator = VALIDATOR
        .as_ref()
        .map_err(|err| anyhow!("invalid tasks schema: {err}"))?;
    let messages: Vec<String> = validator
        .iter_errors(value)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        return Err(anyhow!(
            "tasks schema validation failed: {}",
            messages.join("; ")
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write_tasks(dir: &Path, value: Value) -> PathBuf {
        let path = dir.join("tasks.json");
        fs::write(&path, serde_json::to_string_pretty(&value).expect("json")).expect("write");
        path
    }

    fn two_tasks(dir: &Path) -> PathBuf {
        write_tasks(
            dir,
            json!({
                "project": "demo",
                "tasks": [
                    {"id": "t1", "title": "first", "acceptance_criteria": ["works"]},
                    {"id": "t2", "title": "second"}
                ]
            }),
        )
    }

    #[test]
    fn mutations_persist_and_keep_extra_keys() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = two_tasks(temp.path());
        let mut store = TaskStore::load(&path, 3).expect("load");

        assert_eq!(store.current_task().map(|t| t.id.as_str()), Some("t1"));
        store.start("t1").expect("start");
        store.advance("t1").expect("advance");

        let reloaded = TaskStore::load(&path, 3).expect("reload");
        assert_eq!(reloaded.get("t1").map(|t| t.status), Some(TaskStatus::Completed));
        assert_eq!(reloaded.current_task().map(|t| t.id.as_str()), Some("t2"));
        let raw: Value =
            serde_json::from_str(&fs::read_to_string(&path).expect("read")).expect("json");
        assert_eq!(raw["project"], "demo");
    }

    #[test]
    fn fail_retries_until_limit_is_exceeded() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = two_tasks(temp.path());
        let mut store = TaskStore::load(&path, 2).expect("load");
        store.start("t1").expect("start");

        assert_eq!(store.fail("t1").expect("fail"), FailOutcome::Retry { attempts: 1 });
        assert_eq!(store.fail("t1").expect("fail"), FailOutcome::Retry { attempts: 2 });
        assert_eq!(store.fail("t1").expect("fail"), FailOutcome::Stuck { attempts: 3 });

        let reloaded = TaskStore::load(&path, 2).expect("reload");
        let task = reloaded.get("t1").expect("t1");
        assert_eq!(task.status, TaskStatus::Stuck);
        assert_eq!(task.attempts, 3);
    }

    #[test]
    fn zero_max_attempts_never_sticks() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = two_tasks(temp.path());
        let mut store = TaskStore::load(&path, 0).expect("load");
        for _ in 0..10 {
            assert!(matches!(store.fail("t1").expect("fail"), FailOutcome::Retry { .. }));
        }
    }

    #[test]
    fn counts_and_terminal_check() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = two_tasks(temp.path());
        let mut store = TaskStore::load(&path, 3).expect("load");
        assert!(!store.all_terminal());

        store.start("t1").expect("start");
        store.mark_stuck("t2").expect("stuck");
        let counts = store.counts();
        assert_eq!((counts.in_progress, counts.stuck, counts.total()), (1, 1, 2));

        store.advance("t1").expect("advance");
        assert!(store.all_terminal());
    }

    #[test]
    fn schema_rejects_task_without_title() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = write_tasks(temp.path(), json!({"tasks": [{"id": "t1"}]}));
        let err = TaskStore::load(&path, 3).unwrap_err();
        assert!(format!("{err:#}").contains("tasks schema validation failed"));
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = write_tasks(
            temp.path(),
            json!({"tasks": [{"id": "t1", "title": "a"}, {"id": "t1", "title": "b"}]}),
        );
        let err = TaskStore::load(&path, 3).unwrap_err();
        assert!(err.to_string().contains("duplicate task id 't1'"));
    }

    #[test]
    fn unknown_task_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = two_tasks(temp.path());
        let mut store = TaskStore::load(&path, 3).expect("load");
        assert!(store.advance("missing").is_err());
    }
}
