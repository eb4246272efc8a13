//! Side effects: filesystem, git, tmux, HTTP and configuration.

pub mod atomic;
pub mod branches;
pub mod config;
pub mod git;
pub mod init;
pub mod llm;
pub mod mailbox;
pub mod notifier;
pub mod process;
pub mod prompt;
pub mod run_state;
pub mod task_store;
