//! Git adapter for the branch manager.
//!
//! Every invocation goes through [`run_command_with_timeout`], so a wedged git
//! process fails that single call instead of stalling the poll loop.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tracing::{debug, instrument, warn};

use crate::io::process::{CommandOutput, DEFAULT_OUTPUT_LIMIT_BYTES, run_command_with_timeout};

pub const DEFAULT_GIT_TIMEOUT: Duration = Duration::from_secs(30);

/// One repository checkout (the project root or an agent worktree).
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
    timeout: Duration,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            timeout: DEFAULT_GIT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Name of the checked-out branch. Detached HEAD is an error.
    #[instrument(skip_all, fields(workdir = %self.workdir.display()))]
    pub fn current_branch(&self) -> Result<String> {
        let name = self.run_capture(&["symbolic-ref", "--quiet", "--short", "HEAD"]);
        let Ok(name) = name.map(|out| out.trim().to_string()) else {
            warn!(workdir = %self.workdir.display(), "HEAD is detached");
            return Err(anyhow!(
                "detached HEAD in {} (check out a branch first)",
                self.workdir.display()
            ));
        };
        debug!(branch = %name, "checked-out branch");
        Ok(name)
    }

    /// Resolve a revision to a full commit id.
    pub fn rev_parse(&self, rev: &str) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--verify", rev])?;
        Ok(out.trim().to_string())
    }

    /// Modified, staged and untracked paths (ignored files excluded).
    pub fn changed_paths(&self) -> Result<Vec<String>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        Ok(out
            .lines()
            .filter_map(|line| line.get(3..))
            .map(|path| match path.split_once(" -> ") {
                Some((_, renamed)) => renamed.to_string(),
                None => path.to_string(),
            })
            .collect())
    }

    pub fn is_clean(&self) -> Result<bool> {
        Ok(self.changed_paths()?.is_empty())
    }

    /// True if `refs/heads/<branch>` exists.
    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let output = self.run(&[
            "show-ref",
            "--verify",
            "--quiet",
            &format!("refs/heads/{branch}"),
        ])?;
        if output.timed_out {
            return Err(anyhow!("git show-ref {branch} timed out"));
        }
        Ok(output.status.success())
    }

    #[instrument(skip_all, fields(branch = %branch))]
    pub fn checkout_branch(&self, branch: &str) -> Result<()> {
        self.run_checked(&["checkout", "--quiet", branch])?;
        Ok(())
    }

    /// Detach HEAD at `rev`, leaving every branch free to be moved or deleted.
    pub fn checkout_detached(&self, rev: &str) -> Result<()> {
        self.run_checked(&["checkout", "--detach", rev])?;
        Ok(())
    }

    /// Create `branch` at `start_point` and check it out.
    #[instrument(skip_all, fields(branch = %branch, start_point = %start_point))]
    pub fn checkout_new_branch(&self, branch: &str, start_point: &str) -> Result<()> {
        debug!(branch, start_point, "creating and checking out new branch");
        self.run_checked(&["checkout", "-b", branch, start_point])?;
        Ok(())
    }

    /// Force-delete a local branch.
    pub fn delete_branch(&self, branch: &str) -> Result<()> {
        self.run_checked(&["branch", "-D", branch])?;
        Ok(())
    }

    /// Merge `source` into HEAD with a merge commit.
    ///
    /// Returns the raw output; callers inspect it to tell conflicts apart from
    /// other failures.
    #[instrument(skip_all, fields(source = %source))]
    pub fn merge_no_ff(&self, source: &str, message: &str) -> Result<CommandOutput> {
        self.run(&["merge", "--no-ff", "--no-edit", "-m", message, source])
    }

    /// Paths with unresolved conflicts.
    pub fn conflicted_files(&self) -> Result<Vec<String>> {
        let out = self.run_capture(&["diff", "--name-only", "--diff-filter=U"])?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// True while a merge is in progress (MERGE_HEAD exists).
    pub fn merge_in_progress(&self) -> Result<bool> {
        let output = self.run(&["rev-parse", "-q", "--verify", "MERGE_HEAD"])?;
        Ok(output.success())
    }

    pub fn merge_abort(&self) -> Result<()> {
        self.run_checked(&["merge", "--abort"])?;
        Ok(())
    }

    /// Stash tracked and untracked changes.
    ///
    /// Returns `false` (and creates nothing) when the worktree is clean.
    pub fn stash_push_all(&self, message: &str) -> Result<bool> {
        let changed = self.changed_paths()?;
        if changed.is_empty() {
            return Ok(false);
        }
        debug!(paths = changed.len(), "stashing local changes");
        self.run_checked(&["stash", "push", "--include-untracked", "-m", message])?;
        Ok(true)
    }

    pub fn stash_pop(&self) -> Result<()> {
        self.run_checked(&["stash", "pop", "--index"])?;
        Ok(())
    }

    pub fn stash_drop(&self) -> Result<()> {
        self.run_checked(&["stash", "drop"])?;
        Ok(())
    }

    /// Add a linked worktree at `path`, detached at `rev`.
    pub fn worktree_add_detached(&self, path: &Path, rev: &str) -> Result<()> {
        let path = path.to_string_lossy();
        self.run_checked(&["worktree", "add", "--detach", &path, rev])?;
        Ok(())
    }

    /// `git add --all`.
    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "--all"])?;
        Ok(())
    }

    /// Commit the index. `Ok(false)` when nothing is staged.
    pub fn commit_staged(&self, message: &str) -> Result<bool> {
        let staged = self.run(&["diff", "--cached", "--quiet"])?;
        if staged.success() {
            return Ok(false);
        }
        self.run_checked(&["commit", "--quiet", "-m", message])?;
        Ok(true)
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(output.stdout_str())
    }

    fn run_checked(&self, args: &[&str]) -> Result<CommandOutput> {
        let output = self.run(args)?;
        if !output.success() {
            return Err(anyhow!(
                "git {} failed in {}: {}",
                args.join(" "),
                self.workdir.display(),
                output.diagnostic()
            ));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<CommandOutput> {
        let mut cmd = Command::new("git");
        cmd.args(args).current_dir(&self.workdir);
        run_command_with_timeout(cmd, self.timeout, DEFAULT_OUTPUT_LIMIT_BYTES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestRepo;
    use std::fs;

    #[test]
    fn changed_paths_lists_edits_and_untracked_files() {
        let repo = TestRepo::new().expect("repo");
        let git = Git::new(repo.path());
        assert!(git.is_clean().expect("status"));

        fs::write(repo.path().join("README.md"), "changed\n").expect("write");
        fs::create_dir_all(repo.path().join("notes")).expect("mkdir");
        fs::write(repo.path().join("notes/todo.txt"), "x\n").expect("write");
        let mut paths = git.changed_paths().expect("status");
        paths.sort();
        assert_eq!(paths, vec!["README.md".to_string(), "notes/todo.txt".to_string()]);
    }

    #[test]
    fn stash_round_trip_restores_untracked_files() {
        let repo = TestRepo::new().expect("repo");
        let git = Git::new(repo.path());
        fs::write(repo.path().join("scratch.txt"), "wip\n").expect("write");

        assert!(git.stash_push_all("test stash").expect("stash"));
        assert!(git.is_clean().expect("status"));
        git.stash_pop().expect("pop");
        assert_eq!(
            fs::read_to_string(repo.path().join("scratch.txt")).expect("read"),
            "wip\n"
        );
    }

    #[test]
    fn stash_on_clean_tree_is_a_no_op() {
        let repo = TestRepo::new().expect("repo");
        let git = Git::new(repo.path());
        assert!(!git.stash_push_all("nothing").expect("stash"));
    }

    #[test]
    fn detached_checkout_is_reported_as_error_by_current_branch() {
        let repo = TestRepo::new().expect("repo");
        let git = Git::new(repo.path());
        git.checkout_detached("HEAD").expect("detach");
        let err = git.current_branch().unwrap_err();
        assert!(err.to_string().contains("detached HEAD"));
    }
}
