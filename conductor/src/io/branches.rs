//! Per-task branch lifecycle across the three agent workspaces.
//!
//! Workspaces are linked worktrees of the project repository, so branches
//! created in one are visible to the others and merges need no fetch. Merges
//! never force-resolve: a conflict is aborted and reported, leaving the
//! workspace as it was before the attempt.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{info, instrument, warn};

use crate::core::types::Role;
use crate::io::config::GitConfig;
use crate::io::git::Git;

/// Result of a merge attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged,
    /// The merge was aborted; these paths conflicted.
    Conflict { files: Vec<String> },
    /// Anything else (missing branch, dirty tree, timeout, ...).
    Failed { reason: String },
}

impl MergeOutcome {
    pub fn is_merged(&self) -> bool {
        matches!(self, MergeOutcome::Merged)
    }

    /// One-line diagnostic for logs and the console.
    pub fn describe(&self) -> String {
        match self {
            MergeOutcome::Merged => "merged".to_string(),
            MergeOutcome::Conflict { files } if files.is_empty() => "merge conflict".to_string(),
            MergeOutcome::Conflict { files } => format!("merge conflict in {}", files.join(", ")),
            MergeOutcome::Failed { reason } => format!("merge failed: {reason}"),
        }
    }
}

/// Return the branch checked out in `repo`. Detached HEAD is an error.
pub fn detect_default_branch(repo: &Path, timeout: Duration) -> Result<String> {
    Git::new(repo)
        .with_timeout(timeout)
        .current_branch()
        .context("detect default branch")
}

#[derive(Debug, Clone)]
pub struct BranchManager {
    repo: PathBuf,
    default_branch: String,
    test_workspace: PathBuf,
    impl_workspace: PathBuf,
    refactor_workspace: PathBuf,
    git: GitConfig,
}

impl BranchManager {
    /// `workspaces` are absolute paths for the test-writer, implementer and
    /// refactorer, in that order.
    pub fn new(
        repo: impl Into<PathBuf>,
        default_branch: impl Into<String>,
        workspaces: [PathBuf; 3],
        git: GitConfig,
    ) -> Self {
        let [test_workspace, impl_workspace, refactor_workspace] = workspaces;
        Self {
            repo: repo.into(),
            default_branch: default_branch.into(),
            test_workspace,
            impl_workspace,
            refactor_workspace,
            git,
        }
    }

    pub fn repo(&self) -> &Path {
        &self.repo
    }

    pub fn default_branch(&self) -> &str {
        &self.default_branch
    }

    pub fn workspace(&self, agent: Role) -> Result<&Path> {
        match agent {
            Role::TestWriter => Ok(&self.test_workspace),
            Role::Implementer => Ok(&self.impl_workspace),
            Role::Refactorer => Ok(&self.refactor_workspace),
            Role::Orchestrator => Err(anyhow!("the orchestrator has no workspace")),
        }
    }

    pub fn branch(&self, agent: Role, task_id: &str) -> Result<String> {
        self.git
            .branch_for(agent, task_id)
            .ok_or_else(|| anyhow!("the orchestrator has no branch"))
    }

    fn git_at(&self, dir: &Path) -> Git {
        Git::new(dir).with_timeout(self.git.timeout())
    }

    /// Create any missing workspace as a linked worktree detached at the
    /// default branch. Returns the workspaces that were created.
    #[instrument(skip_all)]
    pub fn setup_workspaces(&self) -> Result<Vec<PathBuf>> {
        let repo = self.git_at(&self.repo);
        let mut created = Vec::new();
        for agent in Role::AGENTS {
            let dir = self.workspace(agent)?;
            if dir.join(".git").exists() {
                continue;
            }
            if dir.exists()
                && fs::read_dir(dir)
                    .with_context(|| format!("read {}", dir.display()))?
                    .next()
                    .is_some()
            {
                return Err(anyhow!(
                    "workspace {} exists but is not a git checkout",
                    dir.display()
                ));
            }
            if let Some(parent) = dir.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create directory {}", parent.display()))?;
            }
            repo.worktree_add_detached(dir, &self.default_branch)
                .with_context(|| format!("create {agent} workspace"))?;
            info!(agent = %agent, path = %dir.display(), "workspace created");
            created.push(dir.to_path_buf());
        }
        Ok(created)
    }

    /// Cut fresh `tests/`, `impl/` and `refactor/` branches for `task_id` from
    /// the default branch tip, replacing any left over from an earlier run.
    #[instrument(skip_all, fields(task_id = %task_id))]
    pub fn create_task_branches(&self, task_id: &str) -> Result<()> {
        for agent in Role::AGENTS {
            let dir = self.workspace(agent)?;
            let branch = self.branch(agent, task_id)?;
            let git = self.git_at(dir);
            git.checkout_detached(&self.default_branch)
                .with_context(|| format!("reset {agent} workspace to {}", self.default_branch))?;
            if git.branch_exists(&branch)? {
                git.delete_branch(&branch)
                    .with_context(|| format!("delete stale branch {branch}"))?;
            }
            git.checkout_new_branch(&branch, &self.default_branch)
                .with_context(|| format!("create branch {branch}"))?;
            info!(agent = %agent, branch = %branch, "task branch ready");
        }
        Ok(())
    }

    /// Merge `source` into whatever `workspace` has checked out.
    #[instrument(skip_all, fields(workspace = %workspace, source = %source))]
    pub fn merge_forward(&self, workspace: Role, source: &str) -> MergeOutcome {
        let dir = match self.workspace(workspace) {
            Ok(dir) => dir,
            Err(err) => {
                return MergeOutcome::Failed {
                    reason: err.to_string(),
                };
            }
        };
        let outcome = merge_or_abort(&self.git_at(dir), source);
        log_outcome(&outcome, source);
        outcome
    }

    /// Merge `source` into the default branch of the project checkout.
    ///
    /// Local changes are stashed first. On success the stash is dropped; on
    /// any failure the original branch and the stashed changes are restored.
    #[instrument(skip_all, fields(source = %source))]
    pub fn merge_into_default(&self, source: &str) -> MergeOutcome {
        let git = self.git_at(&self.repo);
        let original = git.current_branch().ok();

        let stashed = match git.stash_push_all(&format!("conductor: before merging {source}")) {
            Ok(stashed) => stashed,
            Err(err) => {
                return MergeOutcome::Failed {
                    reason: format!("stash local changes: {err:#}"),
                };
            }
        };

        if original.as_deref() != Some(self.default_branch.as_str()) {
            if let Err(err) = git.checkout_branch(&self.default_branch) {
                let mut reason = format!("checkout {}: {err:#}", self.default_branch);
                restore(&git, None, stashed, &mut reason);
                let outcome = MergeOutcome::Failed { reason };
                log_outcome(&outcome, source);
                return outcome;
            }
        }

        let outcome = match merge_or_abort(&git, source) {
            MergeOutcome::Merged => {
                if stashed {
                    if let Err(err) = git.stash_drop() {
                        warn!(error = %format!("{err:#}"), "could not drop pre-merge stash");
                    }
                }
                MergeOutcome::Merged
            }
            MergeOutcome::Conflict { files } => {
                let mut reason = String::new();
                restore(&git, restore_target(&original, &self.default_branch), stashed, &mut reason);
                if !reason.is_empty() {
                    warn!(%reason, "restore after conflict was incomplete");
                }
                MergeOutcome::Conflict { files }
            }
            MergeOutcome::Failed { mut reason } => {
                restore(&git, restore_target(&original, &self.default_branch), stashed, &mut reason);
                MergeOutcome::Failed { reason }
            }
        };
        log_outcome(&outcome, source);
        outcome
    }
}

fn restore_target<'a>(original: &'a Option<String>, default_branch: &str) -> Option<&'a str> {
    original.as_deref().filter(|b| *b != default_branch)
}

/// Put the checkout back: switch to `branch` (if any) and pop the stash.
/// Problems are appended to `reason`; a stash that cannot be popped stays in
/// the stash list.
fn restore(git: &Git, branch: Option<&str>, stashed: bool, reason: &mut String) {
    if let Some(branch) = branch {
        if let Err(err) = git.checkout_branch(branch) {
            reason.push_str(&format!("; checkout {branch} failed: {err:#}"));
        }
    }
    if stashed {
        if let Err(err) = git.stash_pop() {
            reason.push_str(&format!(
                "; local changes remain in `git stash list`: {err:#}"
            ));
        }
    }
}

fn merge_or_abort(git: &Git, source: &str) -> MergeOutcome {
    let target = git
        .current_branch()
        .unwrap_or_else(|_| "HEAD".to_string());
    let message = format!("Merge {source} into {target}");
    let output = match git.merge_no_ff(source, &message) {
        Ok(output) => output,
        Err(err) => {
            return MergeOutcome::Failed {
                reason: format!("{err:#}"),
            };
        }
    };
    if output.success() {
        return MergeOutcome::Merged;
    }

    let files = git.conflicted_files().unwrap_or_default();
    match git.merge_in_progress() {
        Ok(true) => {
            if let Err(err) = git.merge_abort() {
                warn!(error = %format!("{err:#}"), "merge --abort failed");
            }
        }
        Ok(false) => {}
        Err(err) => warn!(error = %format!("{err:#}"), "could not check merge state"),
    }
    if files.is_empty() {
        MergeOutcome::Failed {
            reason: output.diagnostic(),
        }
    } else {
        MergeOutcome::Conflict { files }
    }
}

fn log_outcome(outcome: &MergeOutcome, source: &str) {
    match outcome {
        MergeOutcome::Merged => info!(source, "merge succeeded"),
        other => warn!(source, outcome = %other.describe(), "merge did not complete"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestRepo;

    #[test]
    fn task_branches_are_cut_from_default_and_recreated() {
        let repo = TestRepo::with_workspaces().expect("repo");
        let manager = repo.branch_manager();

        manager.create_task_branches("t1").expect("branches");
        let test_ws = Git::new(manager.workspace(Role::TestWriter).expect("ws"));
        assert_eq!(test_ws.current_branch().expect("branch"), "tests/t1");

        repo.commit_file(Role::TestWriter, "stale.txt", "old\n", "stale work")
            .expect("commit");
        manager.create_task_branches("t1").expect("recreate");
        assert_eq!(test_ws.current_branch().expect("branch"), "tests/t1");
        assert!(
            !manager
                .workspace(Role::TestWriter)
                .expect("ws")
                .join("stale.txt")
                .exists()
        );
        assert_eq!(
            test_ws.rev_parse("HEAD").expect("head"),
            Git::new(repo.path()).rev_parse("main").expect("main")
        );
    }

    #[test]
    fn forward_merge_brings_tests_into_implementation() {
        let repo = TestRepo::with_workspaces().expect("repo");
        let manager = repo.branch_manager();
        manager.create_task_branches("t1").expect("branches");
        repo.commit_file(Role::TestWriter, "tests.txt", "red\n", "add tests")
            .expect("commit");

        let outcome = manager.merge_forward(Role::Implementer, "tests/t1");
        assert_eq!(outcome, MergeOutcome::Merged);
        assert!(
            manager
                .workspace(Role::Implementer)
                .expect("ws")
                .join("tests.txt")
                .exists()
        );
    }

    #[test]
    fn conflict_is_aborted_and_workspace_left_clean() {
        let repo = TestRepo::with_workspaces().expect("repo");
        let manager = repo.branch_manager();
        manager.create_task_branches("t1").expect("branches");
        repo.commit_file(Role::TestWriter, "shared.txt", "from tests\n", "tests")
            .expect("commit");
        repo.commit_file(Role::Implementer, "shared.txt", "from impl\n", "impl")
            .expect("commit");

        let outcome = manager.merge_forward(Role::Implementer, "tests/t1");
        assert_eq!(
            outcome,
            MergeOutcome::Conflict {
                files: vec!["shared.txt".to_string()]
            }
        );
        let impl_ws = Git::new(manager.workspace(Role::Implementer).expect("ws"));
        assert!(impl_ws.is_clean().expect("status"));
        assert!(!impl_ws.merge_in_progress().expect("merge state"));
    }

    #[test]
    fn missing_source_branch_fails_without_conflict() {
        let repo = TestRepo::with_workspaces().expect("repo");
        let manager = repo.branch_manager();
        manager.create_task_branches("t1").expect("branches");
        assert!(matches!(
            manager.merge_forward(Role::Refactorer, "impl/nope"),
            MergeOutcome::Failed { .. }
        ));
    }

    #[test]
    fn merge_into_default_drops_stash_on_success() {
        let repo = TestRepo::with_workspaces().expect("repo");
        let manager = repo.branch_manager();
        manager.create_task_branches("t1").expect("branches");
        repo.commit_file(Role::Refactorer, "feature.txt", "done\n", "feature")
            .expect("commit");
        fs::write(repo.path().join("scratch.txt"), "local\n").expect("write");

        assert_eq!(manager.merge_into_default("refactor/t1"), MergeOutcome::Merged);
        let git = Git::new(repo.path());
        assert_eq!(git.current_branch().expect("branch"), "main");
        assert!(repo.path().join("feature.txt").exists());
        assert!(git.is_clean().expect("status"));
    }

    #[test]
    fn merge_into_default_restores_local_changes_on_conflict() {
        let repo = TestRepo::with_workspaces().expect("repo");
        let manager = repo.branch_manager();
        manager.create_task_branches("t1").expect("branches");
        repo.commit_file(Role::Refactorer, "README.md", "refactored\n", "refactor")
            .expect("commit");
        repo.commit_default("README.md", "operator edit\n", "edit on main")
            .expect("commit main");
        fs::write(repo.path().join("notes.txt"), "uncommitted\n").expect("write");

        let outcome = manager.merge_into_default("refactor/t1");
        assert!(matches!(outcome, MergeOutcome::Conflict { .. }), "{outcome:?}");
        assert_eq!(
            fs::read_to_string(repo.path().join("notes.txt")).expect("read"),
            "uncommitted\n"
        );
        assert!(!Git::new(repo.path()).merge_in_progress().expect("state"));
    }

    #[test]
    fn merge_into_default_restores_local_changes_on_failure() {
        let repo = TestRepo::with_workspaces().expect("repo");
        let manager = repo.branch_manager();
        fs::write(repo.path().join("README.md"), "dirty tracked edit\n").expect("write");

        let outcome = manager.merge_into_default("refactor/does-not-exist");
        assert!(matches!(outcome, MergeOutcome::Failed { .. }), "{outcome:?}");
        assert_eq!(
            fs::read_to_string(repo.path().join("README.md")).expect("read"),
            "dirty tracked edit\n"
        );
    }

    #[test]
    fn setup_is_idempotent() {
        let repo = TestRepo::with_workspaces().expect("repo");
        assert!(repo.branch_manager().setup_workspaces().expect("setup").is_empty());
    }
}
