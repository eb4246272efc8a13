//! Operator console verbs.

use crate::core::types::Role;

/// A parsed console line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Status,
    ListTasks,
    SkipCurrent,
    Nudge(Role),
    Message(Role, String),
    Pause,
    Resume,
    ShowLog(usize),
    Help,
    /// Recognised verb with bad arguments; carries the usage line to print.
    Usage(&'static str),
    /// Not a verb: hand the whole line to the decision client.
    FreeText(String),
}

pub const DEFAULT_LOG_LINES: usize = 20;

pub const HELP: &str = "\
commands:
  status                   show pipeline state and current task
  list-tasks               list every task with status and attempts
  skip-current             mark the current task stuck and move on
  nudge <agent>            wake an agent (test_writer, implementer, refactorer)
  message <agent> <text>   type text into an agent's terminal
  pause                    stop routing mailbox messages
  resume                   resume routing; retries a blocked step
  show-log [n]             print the last n log lines (default 20)
  help                     show this help
anything else is interpreted by the decision service";

impl Command {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        let (verb, rest) = match line.split_once(char::is_whitespace) {
            Some((verb, rest)) => (verb, rest.trim()),
            None => (line, ""),
        };

        match verb.to_ascii_lowercase().as_str() {
            "status" if rest.is_empty() => Command::Status,
            "list-tasks" | "tasks" if rest.is_empty() => Command::ListTasks,
            "skip-current" | "skip" if rest.is_empty() => Command::SkipCurrent,
            "pause" if rest.is_empty() => Command::Pause,
            "resume" if rest.is_empty() => Command::Resume,
            "help" | "?" if rest.is_empty() => Command::Help,
            "nudge" => match rest.parse::<Role>() {
                Ok(agent) if agent.is_agent() => Command::Nudge(agent),
                _ => Command::Usage("usage: nudge <agent>"),
            },
            "message" | "msg" => {
                let Some((agent, text)) = rest.split_once(char::is_whitespace) else {
                    return Command::Usage("usage: message <agent> <text>");
                };
                match agent.parse::<Role>() {
                    Ok(agent) if agent.is_agent() && !text.trim().is_empty() => {
                        Command::Message(agent, text.trim().to_string())
                    }
                    _ => Command::Usage("usage: message <agent> <text>"),
                }
            }
            "show-log" | "log" => {
                if rest.is_empty() {
                    return Command::ShowLog(DEFAULT_LOG_LINES);
                }
                match rest.parse::<usize>() {
                    Ok(n) if n > 0 => Command::ShowLog(n),
                    _ => Command::Usage("usage: show-log [n]"),
                }
            }
            _ => Command::FreeText(line.to_string()),
        }
    }
}
