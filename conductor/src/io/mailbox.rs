//! File-based mailboxes: one directory per recipient, one JSON file per
//! message.
//!
//! A [`Mailbox`] is also the watcher: it remembers which messages it has
//! surfaced, so [`Mailbox::poll`] returns each message at most once for the
//! lifetime of the value. The `read` flag inside the file is never consulted.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use tracing::{debug, info, instrument, warn};

use crate::core::message::{Message, MessageContent};
use crate::core::types::Role;
use crate::io::atomic::{TEMP_SUFFIX, write_atomic};

const MESSAGE_EXTENSION: &str = "json";

/// Every mailbox directory, orchestrator included.
pub const RECIPIENTS: [Role; 4] = [
    Role::Orchestrator,
    Role::TestWriter,
    Role::Implementer,
    Role::Refactorer,
];

#[derive(Debug)]
pub struct Mailbox {
    root: PathBuf,
    seen_ids: HashSet<String>,
    seen_files: HashSet<PathBuf>,
    warned: HashSet<PathBuf>,
}

impl Mailbox {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            seen_ids: HashSet::new(),
            seen_files: HashSet::new(),
            warned: HashSet::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dir(&self, recipient: Role) -> PathBuf {
        self.root.join(recipient.mailbox_dir_name())
    }

    /// Create every mailbox directory.
    pub fn ensure_dirs(&self) -> Result<()> {
        for recipient in RECIPIENTS {
            let dir = self.dir(recipient);
            fs::create_dir_all(&dir)
                .with_context(|| format!("create mailbox {}", dir.display()))?;
        }
        Ok(())
    }

    /// Durably write a new message into `to`'s mailbox.
    #[instrument(skip_all, fields(from = %from, to = %to, kind = content.kind()))]
    pub fn send(&self, from: Role, to: Role, content: &MessageContent) -> Result<Message> {
        let now = Utc::now();
        let dir = self.dir(to);
        let base_id = format!(
            "{}-{}-{}",
            now.format("%Y%m%dT%H%M%S%6fZ"),
            from,
            file_safe(content.kind())
        );
        let id = unique_id(&dir, &base_id);

        let message = Message {
            id: id.clone(),
            from,
            to,
            kind: content.kind().to_string(),
            content: content.to_value()?,
            timestamp: now.to_rfc3339_opts(SecondsFormat::Micros, true),
            read: false,
        };
        let mut buf = serde_json::to_string_pretty(&message).context("serialize message")?;
        buf.push('\n');
        let path = dir.join(format!("{id}.{MESSAGE_EXTENSION}"));
        write_atomic(&path, &buf).with_context(|| format!("write message {}", path.display()))?;
        info!(id = %message.id, "message sent");
        Ok(message)
    }

    /// Messages in `recipient`'s mailbox not yet surfaced by this watcher, in
    /// file name order. Files are read lazily as the iterator advances; a
    /// message counts as surfaced only once the iterator yields it.
    pub fn poll(&mut self, recipient: Role) -> Result<Poll<'_>> {
        let paths = list_message_files(&self.dir(recipient))?;
        Ok(Poll {
            paths: paths.into_iter(),
            seen_ids: &mut self.seen_ids,
            seen_files: &mut self.seen_files,
            warned: &mut self.warned,
        })
    }

    /// Poll every mailbox and return what surfaced, oldest first. The
    /// directory a file was found in decides `to`.
    pub fn poll_all(&mut self) -> Result<Vec<Message>> {
        let mut messages = Vec::new();
        for recipient in RECIPIENTS {
            for mut message in self.poll(recipient)? {
                if message.to != recipient {
                    debug!(id = %message.id, claimed = %message.to, mailbox = %recipient, "recipient taken from mailbox");
                    message.to = recipient;
                }
                messages.push(message);
            }
        }
        messages.sort_by(|a, b| {
            timestamp_key(a)
                .cmp(&timestamp_key(b))
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(messages)
    }

    /// The newest of the messages surfaced by this call.
    pub fn latest(&mut self, recipient: Role) -> Result<Option<Message>> {
        Ok(self.poll(recipient)?.max_by(|a, b| {
            timestamp_key(a)
                .cmp(&timestamp_key(b))
                .then_with(|| a.id.cmp(&b.id))
        }))
    }

    /// Every readable message in every mailbox, oldest first. Does not mark
    /// anything as surfaced.
    pub fn history(&mut self) -> Result<Vec<Message>> {
        let mut messages = Vec::new();
        for recipient in RECIPIENTS {
            for path in list_message_files(&self.dir(recipient))? {
                if let Some(message) = read_message(&path, &mut self.warned) {
                    messages.push(message);
                }
            }
        }
        messages.sort_by(|a, b| {
            timestamp_key(a)
                .cmp(&timestamp_key(b))
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(messages)
    }

    /// Delete every message file for `recipient`. Returns how many were
    /// removed.
    pub fn clear(&mut self, recipient: Role) -> Result<usize> {
        let mut removed = 0;
        for path in list_message_files(&self.dir(recipient))? {
            fs::remove_file(&path).with_context(|| format!("remove {}", path.display()))?;
            removed += 1;
        }
        info!(recipient = %recipient, removed, "mailbox cleared");
        Ok(removed)
    }

    /// Treat these ids as already surfaced (used when resuming a run).
    pub fn mark_seen<I, S>(&mut self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.seen_ids.extend(ids.into_iter().map(Into::into));
    }
}

/// Lazy iterator returned by [`Mailbox::poll`].
pub struct Poll<'a> {
    paths: std::vec::IntoIter<PathBuf>,
    seen_ids: &'a mut HashSet<String>,
    seen_files: &'a mut HashSet<PathBuf>,
    warned: &'a mut HashSet<PathBuf>,
}

impl Iterator for Poll<'_> {
    type Item = Message;

    fn next(&mut self) -> Option<Message> {
        for path in self.paths.by_ref() {
            if self.seen_files.contains(&path) {
                continue;
            }
            let Some(message) = read_message(&path, self.warned) else {
                // Possibly half-written by a non-atomic sender; retried next poll.
                continue;
            };
            self.seen_files.insert(path);
            if !self.seen_ids.insert(message.id.clone()) {
                debug!(id = %message.id, "duplicate message id skipped");
                continue;
            }
            return Some(message);
        }
        None
    }
}

fn list_message_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let entries = fs::read_dir(dir).with_context(|| format!("read mailbox {}", dir.display()))?;
    let mut paths = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("read mailbox entry in {}", dir.display()))?;
        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with('.') || name.ends_with(TEMP_SUFFIX) {
            continue;
        }
        if path.extension().and_then(|e| e.to_str()) != Some(MESSAGE_EXTENSION) {
            continue;
        }
        if path.is_file() {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

/// Parse one message file. Unreadable or malformed files are reported once
/// per path and skipped.
fn read_message(path: &Path, warned: &mut HashSet<PathBuf>) -> Option<Message> {
    let parsed = fs::read_to_string(path)
        .with_context(|| format!("read message {}", path.display()))
        .and_then(|contents| {
            serde_json::from_str::<Message>(&contents)
                .with_context(|| format!("parse message {}", path.display()))
        });
    match parsed {
        Ok(message) => Some(message),
        Err(err) => {
            if warned.insert(path.to_path_buf()) {
                warn!(error = %format!("{err:#}"), "skipping malformed message");
            }
            None
        }
    }
}

/// Sort key: parseable RFC 3339 timestamps chronologically, unparseable ones
/// first.
fn timestamp_key(message: &Message) -> (Option<DateTime<Utc>>, &str) {
    let parsed = DateTime::parse_from_rfc3339(&message.timestamp)
        .ok()
        .map(|ts| ts.with_timezone(&Utc));
    (parsed, message.timestamp.as_str())
}

fn unique_id(dir: &Path, base: &str) -> String {
    let taken = |id: &str| dir.join(format!("{id}.{MESSAGE_EXTENSION}")).exists();
    if !taken(base) {
        return base.to_string();
    }
    (2u32..)
        .map(|n| format!("{base}-{n}"))
        .find(|id| !taken(id))
        .unwrap_or_else(|| base.to_string())
}

fn file_safe(kind: &str) -> String {
    kind.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::message::WorkReport;
    use serde_json::json;

    fn report(summary: &str) -> MessageContent {
        MessageContent::TestsReady(WorkReport {
            task_id: Some("t1".to_string()),
            summary: summary.to_string(),
            files_changed: vec![],
            notes: String::new(),
            branch: String::new(),
            instructions: String::new(),
        })
    }

    fn write_raw(dir: &Path, name: &str, contents: &str) {
        fs::create_dir_all(dir).expect("mkdir");
        fs::write(dir.join(name), contents).expect("write");
    }

    #[test]
    fn poll_surfaces_each_message_once() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut mailbox = Mailbox::new(temp.path());
        mailbox
            .send(Role::TestWriter, Role::Implementer, &report("first"))
            .expect("send");

        let first: Vec<_> = mailbox.poll(Role::Implementer).expect("poll").collect();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].from, Role::TestWriter);
        assert_eq!(first[0].kind, "tests_ready");

        let second: Vec<_> = mailbox.poll(Role::Implementer).expect("poll").collect();
        assert!(second.is_empty());

        mailbox
            .send(Role::TestWriter, Role::Implementer, &report("second"))
            .expect("send");
        let third: Vec<_> = mailbox.poll(Role::Implementer).expect("poll").collect();
        assert_eq!(third.len(), 1);
        assert_eq!(third[0].content["summary"], "second");
    }

    #[test]
    fn fresh_watcher_sees_messages_again_regardless_of_read_flag() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = temp.path().join("to_refactorer");
        write_raw(
            &dir,
            "a.json",
            &json!({
                "id": "a", "from": "implementer", "to": "refactorer",
                "type": "implementation_ready", "content": {"summary": "done"},
                "timestamp": "2026-01-01T00:00:00Z", "read": true
            })
            .to_string(),
        );

        let mut first = Mailbox::new(temp.path());
        assert_eq!(first.poll(Role::Refactorer).expect("poll").count(), 1);
        let mut second = Mailbox::new(temp.path());
        assert_eq!(second.poll(Role::Refactorer).expect("poll").count(), 1);
    }

    #[test]
    fn poll_is_lazy_and_only_marks_yielded_messages() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut mailbox = Mailbox::new(temp.path());
        for summary in ["one", "two", "three"] {
            mailbox
                .send(Role::Refactorer, Role::Implementer, &report(summary))
                .expect("send");
        }
        let taken: Vec<_> = mailbox.poll(Role::Implementer).expect("poll").take(1).collect();
        assert_eq!(taken[0].content["summary"], "one");
        let rest: Vec<_> = mailbox.poll(Role::Implementer).expect("poll").collect();
        assert_eq!(rest.len(), 2);
    }

    #[test]
    fn malformed_and_temp_files_are_skipped() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = temp.path().join("to_implementer");
        write_raw(&dir, "broken.json", "{not json");
        write_raw(&dir, "inflight.json.tmp", "{}");
        write_raw(&dir, "notes.txt", "hello");

        let mut mailbox = Mailbox::new(temp.path());
        assert_eq!(mailbox.poll(Role::Implementer).expect("poll").count(), 0);
        assert_eq!(mailbox.poll(Role::Implementer).expect("poll").count(), 0);
        assert_eq!(mailbox.warned.len(), 1);
    }

    #[test]
    fn repaired_file_is_surfaced_later() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = temp.path().join("to_implementer");
        write_raw(&dir, "late.json", "{\"id\": ");
        let mut mailbox = Mailbox::new(temp.path());
        assert_eq!(mailbox.poll(Role::Implementer).expect("poll").count(), 0);

        write_raw(
            &dir,
            "late.json",
            &json!({
                "id": "late", "from": "test_writer", "to": "implementer",
                "type": "tests_ready", "content": {"summary": "ok"},
                "timestamp": "2026-01-01T00:00:00Z"
            })
            .to_string(),
        );
        assert_eq!(mailbox.poll(Role::Implementer).expect("poll").count(), 1);
    }

    #[test]
    fn latest_picks_newest_timestamp() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = temp.path().join("to_implementer");
        for (name, ts) in [
            ("b.json", "2026-01-02T00:00:00Z"),
            ("a.json", "2026-01-03T00:00:00+00:00"),
            ("c.json", "2026-01-01T00:00:00Z"),
        ] {
            write_raw(
                &dir,
                name,
                &json!({
                    "id": name, "from": "test_writer", "to": "implementer",
                    "type": "tests_ready", "content": {}, "timestamp": ts
                })
                .to_string(),
            );
        }
        let mut mailbox = Mailbox::new(temp.path());
        let latest = mailbox.latest(Role::Implementer).expect("latest").expect("message");
        assert_eq!(latest.id, "a.json");
        assert!(mailbox.latest(Role::Implementer).expect("latest").is_none());
    }

    #[test]
    fn history_spans_mailboxes_in_time_order() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut mailbox = Mailbox::new(temp.path());
        let a = mailbox
            .send(Role::Orchestrator, Role::TestWriter, &report("a"))
            .expect("send");
        let b = mailbox
            .send(Role::TestWriter, Role::Implementer, &report("b"))
            .expect("send");
        let history = mailbox.history().expect("history");
        let ids: Vec<_> = history.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec![a.id.as_str(), b.id.as_str()]);
        assert_eq!(mailbox.poll(Role::TestWriter).expect("poll").count(), 1);
    }

    #[test]
    fn same_instant_sends_get_distinct_ids() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = temp.path().join("to_implementer");
        fs::create_dir_all(&dir).expect("mkdir");
        fs::write(dir.join("x.json"), "{}").expect("write");
        assert_eq!(unique_id(&dir, "x"), "x-2");
        assert_eq!(unique_id(&dir, "y"), "y");
    }

    #[test]
    fn clear_removes_message_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut mailbox = Mailbox::new(temp.path());
        mailbox
            .send(Role::Orchestrator, Role::Refactorer, &report("x"))
            .expect("send");
        assert_eq!(mailbox.clear(Role::Refactorer).expect("clear"), 1);
        assert!(mailbox.history().expect("history").is_empty());
    }

    #[test]
    fn mark_seen_suppresses_known_ids() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut writer = Mailbox::new(temp.path());
        let sent = writer
            .send(Role::TestWriter, Role::Implementer, &report("x"))
            .expect("send");
        let mut watcher = Mailbox::new(temp.path());
        watcher.mark_seen([sent.id]);
        assert_eq!(watcher.poll(Role::Implementer).expect("poll").count(), 0);
    }

    #[test]
    fn poll_all_merges_mailboxes_by_timestamp() {
        let temp = tempfile::tempdir().expect("tempdir");
        let raw = |id: &str, from: &str, to: &str, timestamp: &str| {
            json!({
                "id": id, "from": from, "to": to,
                "type": "chatter", "content": {},
                "timestamp": timestamp
            })
            .to_string()
        };
        write_raw(
            &temp.path().join("to_refactorer"),
            "late.json",
            &raw("late", "implementer", "refactorer", "2026-01-01T00:00:05Z"),
        );
        write_raw(
            &temp.path().join("to_implementer"),
            "early.json",
            &raw("early", "test_writer", "implementer", "2026-01-01T00:00:01+00:00"),
        );
        write_raw(
            &temp.path().join("to_orchestrator"),
            "middle.json",
            &raw("middle", "refactorer", "orchestrator", "2026-01-01T01:00:03+01:00"),
        );

        let mut mailbox = Mailbox::new(temp.path());
        let ids: Vec<String> = mailbox
            .poll_all()
            .expect("poll")
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec!["early", "middle", "late"]);
        assert!(mailbox.poll_all().expect("poll").is_empty());
    }

    #[test]
    fn poll_all_trusts_the_mailbox_over_the_to_field() {
        let temp = tempfile::tempdir().expect("tempdir");
        write_raw(
            &temp.path().join("to_test_writer"),
            "q.json",
            &json!({
                "id": "q", "from": "implementer", "to": "refactorer",
                "type": "question", "content": {},
                "timestamp": "2026-01-01T00:00:00Z"
            })
            .to_string(),
        );
        let mut mailbox = Mailbox::new(temp.path());
        let messages = mailbox.poll_all().expect("poll");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].to, Role::TestWriter);
    }
}
