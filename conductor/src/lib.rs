//! Red-green-refactor orchestration for three terminal coding agents.
//!
//! A test-writer, an implementer and a refactorer each work in their own git
//! worktree and talk through file mailboxes. The orchestrator routes their
//! reports, merges each phase's branch forward, and wakes agents through tmux.
//!
//! - **[`core`]**: Pure, deterministic logic (messages, the transition table,
//!   console verbs, decision parsing). No I/O.
//! - **[`io`]**: Side effects (filesystem, git, tmux, HTTP, config).
//!
//! [`pipeline`] ties the two together; [`console`] and [`looping`] implement
//! the `run` command.

pub mod console;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod looping;
pub mod pipeline;
pub mod signals;
pub mod task;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
