//! Prompt rendering for the decision service.

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;
use serde_json::Value;

use crate::core::message::Message;
use crate::core::types::RgrState;
use crate::io::task_store::TaskCounts;
use crate::task::Task;

const DECISION_SYSTEM_TEMPLATE: &str = include_str!("prompts/decision_system.md");
const CONSOLE_SYSTEM_TEMPLATE: &str = include_str!("prompts/console_system.md");
const DECISION_CONTEXT_TEMPLATE: &str = include_str!("prompts/decision_context.md");
const CONSOLE_CONTEXT_TEMPLATE: &str = include_str!("prompts/console_context.md");

#[derive(Debug, Clone, Serialize)]
struct CountsContext {
    pending: usize,
    in_progress: usize,
    completed: usize,
    stuck: usize,
}

/// Everything the decision service sees about an unclassified event.
#[derive(Debug, Clone)]
pub struct DecisionInputs<'a> {
    pub state: RgrState,
    pub task: Option<&'a Task>,
    pub max_attempts: u32,
    pub counts: TaskCounts,
    pub event_type: &'a str,
    pub event_data: &'a Value,
    /// Most recent mailbox traffic, oldest first.
    pub history: &'a [Message],
}

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    pub fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("decision_system", DECISION_SYSTEM_TEMPLATE)
            .context("load decision_system template")?;
        env.add_template("console_system", CONSOLE_SYSTEM_TEMPLATE)
            .context("load console_system template")?;
        env.add_template("decision_context", DECISION_CONTEXT_TEMPLATE)
            .context("load decision_context template")?;
        env.add_template("console_context", CONSOLE_CONTEXT_TEMPLATE)
            .context("load console_context template")?;
        Ok(Self { env })
    }

    /// Fixed instruction for pipeline decisions.
    pub fn decision_system(&self) -> Result<String> {
        self.render("decision_system", context! {})
    }

    /// Fixed instruction for free-text console input.
    pub fn console_system(&self) -> Result<String> {
        self.render("console_system", context! {})
    }

    pub fn decision_context(&self, inputs: &DecisionInputs<'_>) -> Result<String> {
        let event_data =
            serde_json::to_string_pretty(inputs.event_data).context("serialize event data")?;
        let history = if inputs.history.is_empty() {
            None
        } else {
            Some(serde_json::to_string_pretty(inputs.history).context("serialize history")?)
        };
        let counts = CountsContext {
            pending: inputs.counts.pending,
            in_progress: inputs.counts.in_progress,
            completed: inputs.counts.completed,
            stuck: inputs.counts.stuck,
        };
        self.render(
            "decision_context",
            context! {
                state => inputs.state.as_str(),
                task => inputs.task,
                max_attempts => inputs.max_attempts,
                counts => counts,
                event_type => inputs.event_type,
                event_data => event_data,
                history => history,
            },
        )
    }

    pub fn console_context(&self, status: &str, input: &str) -> Result<String> {
        self.render(
            "console_context",
            context! {
                status => status.trim(),
                input => input.trim(),
            },
        )
    }

    fn render(&self, name: &str, ctx: minijinja::Value) -> Result<String> {
        let template = self
            .env
            .get_template(name)
            .with_context(|| format!("template {name}"))?;
        let rendered = template
            .render(ctx)
            .with_context(|| format!("render {name}"))?;
        Ok(rendered.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Role;
    use serde_json::json;

    fn engine() -> PromptEngine {
        PromptEngine::new().expect("templates")
    }

    #[test]
    fn decision_context_lists_task_and_event() {
        let mut task = Task::new("t1", "Parse headers");
        task.attempts = 2;
        task.acceptance_criteria = vec!["rejects empty input".to_string()];
        let data = json!({"verdict": "partial", "summary": "half done"});
        let rendered = engine()
            .decision_context(&DecisionInputs {
                state: RgrState::WaitingRefactor,
                task: Some(&task),
                max_attempts: 3,
                counts: TaskCounts {
                    pending: 1,
                    in_progress: 1,
                    completed: 4,
                    stuck: 0,
                },
                event_type: "refactor_verdict",
                event_data: &data,
                history: &[],
            })
            .expect("render");

        assert!(rendered.contains("Pipeline state: WAITING_REFACTOR"));
        assert!(rendered.contains("Current task: t1 (Parse headers)"));
        assert!(rendered.contains("acceptance: rejects empty input"));
        assert!(rendered.contains("Attempts: 2/3"));
        assert!(rendered.contains("Type: refactor_verdict"));
        assert!(rendered.contains("\"verdict\": \"partial\""));
        assert!(rendered.contains("No messages yet."));
    }

    #[test]
    fn decision_context_includes_history_json() {
        let data = json!({});
        let history = vec![Message {
            id: "m1".to_string(),
            from: Role::Implementer,
            to: Role::Refactorer,
            kind: "implementation_ready".to_string(),
            content: json!({"summary": "green"}),
            timestamp: "2026-01-01T00:00:00Z".to_string(),
            read: false,
        }];
        let rendered = engine()
            .decision_context(&DecisionInputs {
                state: RgrState::WaitingRefactor,
                task: None,
                max_attempts: 0,
                counts: TaskCounts::default(),
                event_type: "chatter",
                event_data: &data,
                history: &history,
            })
            .expect("render");
        assert!(rendered.contains("Current task: none"));
        assert!(rendered.contains("\"implementation_ready\""));
        assert!(!rendered.contains("No messages yet."));
    }

    #[test]
    fn system_prompts_name_every_action() {
        let decision = engine().decision_system().expect("render");
        for action in ["send_to_implementer", "next_task", "flag_human", "done"] {
            assert!(decision.contains(action), "missing {action}");
        }
        let console = engine().console_system().expect("render");
        assert!(console.contains("\"action\": \"nudge\""));
    }
}
