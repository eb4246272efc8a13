//! Decision payloads returned by the inference service.
//!
//! Raw replies are untrusted text: they may carry `<think>` blocks, markdown
//! fences, or simply not be JSON. Everything here is pure so the fail-safe
//! behaviour can be tested without a server.

use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::types::Role;

const DECISION_SCHEMA: &str = include_str!("../../schemas/decision.schema.json");

/// Action the decision service may choose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionAction {
    SendToTestWriter,
    SendToImplementer,
    SendToRefactorer,
    NextTask,
    FlagHuman,
    Done,
}

/// A routing decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub action: DecisionAction,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub reasoning: String,
}

impl Decision {
    /// Fail-safe decision used whenever a usable reply cannot be obtained.
    pub fn flag_human(message: impl Into<String>, reasoning: impl Into<String>) -> Self {
        Self {
            action: DecisionAction::FlagHuman,
            message: message.into(),
            reasoning: reasoning.into(),
        }
    }
}

/// Interpretation of free-text operator input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ConsoleIntent {
    /// Print text back to the operator.
    Reply { text: String },
    /// Type `text` into an agent's terminal.
    Message { agent: Role, text: String },
    Nudge { agent: Role },
    Skip,
    Pause,
    Resume,
    Status,
}

pub const FREEFORM_APOLOGY: &str =
    "Sorry, I couldn't process that. Try a direct command or type 'help'.";

impl ConsoleIntent {
    pub fn apology() -> Self {
        ConsoleIntent::Reply {
            text: FREEFORM_APOLOGY.to_string(),
        }
    }
}

/// Remove thinking markup and markdown fences from a model reply.
pub fn sanitize_reply(raw: &str) -> String {
    static THINK_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?s)<think>.*?</think>").expect("think regex is valid"));

    let without_thinking = THINK_RE.replace_all(raw, "");
    strip_code_fence(without_thinking.trim()).to_string()
}

fn strip_code_fence(text: &str) -> &str {
    let body = if let Some((_, rest)) = text.split_once("```json") {
        rest
    } else if let Some((_, rest)) = text.split_once("```") {
        rest
    } else {
        return text;
    };
    body.split_once("```")
        .map(|(inner, _)| inner)
        .unwrap_or(body)
        .trim()
}

/// Parse a raw reply into a [`Decision`], validating it against the decision
/// schema first.
pub fn parse_decision(raw: &str) -> Result<Decision> {
    static VALIDATOR: LazyLock<jsonschema::Validator> = LazyLock::new(|| {
        let schema: Value =
            serde_json::from_str(DECISION_SCHEMA).expect("decision schema should be valid json");
        jsonschema::validator_for(&schema).expect("decision schema should compile")
    });

    let cleaned = sanitize_reply(raw);
    let value: Value = serde_json::from_str(&cleaned)
        .with_context(|| format!("parse decision json: {}", preview(&cleaned, 200)))?;
    let errors: Vec<String> = VALIDATOR
        .iter_errors(&value)
        .map(|err| err.to_string())
        .collect();
    if !errors.is_empty() {
        return Err(anyhow!("decision schema validation failed: {}", errors.join("; ")));
    }
    serde_json::from_value(value).context("deserialize decision")
}

/// Parse a raw reply into a [`ConsoleIntent`].
pub fn parse_console_intent(raw: &str) -> Result<ConsoleIntent> {
    let cleaned = sanitize_reply(raw);
    serde_json::from_str(&cleaned)
        .with_context(|| format!("parse console intent: {}", preview(&cleaned, 200)))
}

/// First `max` characters of `text`, for log lines.
pub fn preview(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
