//! Stable exit codes for conductor CLI commands.

/// Command succeeded; for `run`, every task completed.
pub const OK: i32 = 0;
/// Invalid config or task list, an unhealthy service, or any other error.
pub const INVALID: i32 = 1;
/// `run` finished but at least one task ended stuck.
pub const STUCK: i32 = 3;
