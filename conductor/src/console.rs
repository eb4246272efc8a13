//! Operator console.
//!
//! A reader thread turns stdin into trimmed, non-empty lines on a channel; the
//! main loop drains the channel and calls [`dispatch`] for each line.

use std::fs;
use std::io::{self, BufRead};
use std::path::Path;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;

use anyhow::{Context, Result};
use tracing::debug;

use crate::core::command::{Command, HELP};
use crate::core::decision::ConsoleIntent;
use crate::io::llm::InferenceBackend;
use crate::io::notifier::Notifier;
use crate::pipeline::Pipeline;

/// Start the stdin reader. The channel closes when stdin does.
pub fn spawn_input() -> Result<Receiver<String>> {
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name("console-input".to_string())
        .spawn(move || forward_lines(io::stdin().lock(), &tx))
        .context("spawn console input thread")?;
    Ok(rx)
}

/// Send every trimmed, non-empty line of `reader` down `tx`.
pub fn forward_lines<R: BufRead>(reader: R, tx: &Sender<String>) {
    for line in reader.lines() {
        let Ok(line) = line else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if tx.send(line.to_string()).is_err() {
            break;
        }
    }
    debug!("console input closed");
}

/// Execute one console line and return the text to show the operator.
pub fn dispatch<N: Notifier, B: InferenceBackend>(
    pipeline: &mut Pipeline<N, B>,
    line: &str,
    log_file: &Path,
) -> Result<String> {
    match Command::parse(line) {
        Command::Status => Ok(pipeline.status_report()),
        Command::ListTasks => Ok(pipeline.task_list()),
        Command::SkipCurrent => pipeline.skip_current(),
        Command::Nudge(agent) => Ok(pipeline.nudge(agent)),
        Command::Message(agent, text) => Ok(pipeline.message_agent(agent, &text)),
        Command::Pause => Ok(pipeline.pause()),
        Command::Resume => pipeline.resume(),
        Command::ShowLog(lines) => tail(log_file, lines),
        Command::Help => Ok(HELP.to_string()),
        Command::Usage(usage) => Ok(usage.to_string()),
        Command::FreeText(text) => {
            let intent = pipeline.interpret(&text)?;
            debug!(?intent, "free text interpreted");
            apply_intent(pipeline, intent)
        }
    }
}

/// Carry out an interpreted intent with the same primitives the verbs use.
pub fn apply_intent<N: Notifier, B: InferenceBackend>(
    pipeline: &mut Pipeline<N, B>,
    intent: ConsoleIntent,
) -> Result<String> {
    match intent {
        ConsoleIntent::Reply { text } => Ok(text),
        ConsoleIntent::Message { agent, .. } | ConsoleIntent::Nudge { agent }
            if !agent.is_agent() =>
        {
            Ok(format!("{agent} has no terminal to signal."))
        }
        ConsoleIntent::Message { agent, text } => Ok(pipeline.message_agent(agent, &text)),
        ConsoleIntent::Nudge { agent } => Ok(pipeline.nudge(agent)),
        ConsoleIntent::Skip => pipeline.skip_current(),
        ConsoleIntent::Pause => Ok(pipeline.pause()),
        ConsoleIntent::Resume => pipeline.resume(),
        ConsoleIntent::Status => Ok(pipeline.status_report()),
    }
}

/// Last `lines` lines of the log file.
fn tail(path: &Path, lines: usize) -> Result<String> {
    if !path.exists() {
        return Ok(format!("No log file at {}.", path.display()));
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read log {}", path.display()))?;
    let all: Vec<&str> = contents.lines().collect();
    let start = all.len().saturating_sub(lines);
    Ok(all[start..].join("\n"))
}
