use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::types::TaskStatus;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default = "default_status")]
    pub status: TaskStatus,
    #[serde(default)]
    pub attempts: u32,
}

/// On-disk task list. Keys other than `tasks` are kept as-is on rewrite.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default)]
pub struct TaskFile {
    pub tasks: Vec<Task>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_status() -> TaskStatus {
    TaskStatus::Pending
}

impl Task {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            acceptance_criteria: Vec::new(),
            status: TaskStatus::Pending,
            attempts: 0,
        }
    }
}
