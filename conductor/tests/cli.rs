//! CLI tests for `conductor`.
//!
//! Spawns the binary inside fixture repositories and checks exit codes and
//! printed summaries. The decision service points at a closed port so no test
//! depends on a running model server; fixtures opt into running without it.

use std::process::{Command, Output};

use conductor::core::types::{RgrState, TaskStatus};
use conductor::exit_codes;
use conductor::io::config::write_config;
use conductor::io::run_state::load_pipeline_state;
use conductor::task::Task;
use conductor::test_support::{TestRepo, task_with_status};

/// Fixture repository with an unreachable decision service and a fast poll.
fn fixture(tasks: Vec<Task>) -> TestRepo {
    fixture_with(tasks, true)
}

fn fixture_with(tasks: Vec<Task>, allow_unavailable: bool) -> TestRepo {
    let repo = TestRepo::with_workspaces().expect("repo");
    let mut config = repo.config();
    config.llm.allow_unavailable = allow_unavailable;
    config.llm.base_url = "http://127.0.0.1:9".to_string();
    config.llm.timeout_secs = 1;
    config.llm.health_timeout_secs = 1;
    config.polling.interval_secs = 1;
    config.tmux.session_name = "conductor-cli-test-no-such-session".to_string();
    write_config(&repo.paths().config_path, &config).expect("config");
    repo.write_tasks(tasks).expect("tasks");
    repo
}

fn conductor(repo: &TestRepo, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_conductor"))
        .current_dir(repo.path())
        .args(args)
        .output()
        .expect("spawn conductor")
}

#[test]
fn setup_creates_scaffolding_and_workspaces() {
    let repo = TestRepo::new().expect("repo");
    let output = conductor(&repo, &["setup"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));

    let paths = repo.paths();
    assert!(paths.config_path.exists());
    for dir in paths.workspaces(&repo.config().workspaces) {
        assert!(dir.join(".git").exists(), "{} is not a worktree", dir.display());
        assert!(dir.join("README.md").exists());
    }
}

#[test]
fn status_reports_state_and_counts() {
    let repo = fixture(vec![
        task_with_status("t1", TaskStatus::Completed),
        task_with_status("t2", TaskStatus::Pending),
    ]);
    let output = conductor(&repo, &["status"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("State: IDLE"), "{stdout}");
    assert!(stdout.contains("Task: none"), "{stdout}");
    assert!(
        stdout.contains("Tasks: 1 pending, 0 in progress, 1 completed, 0 stuck"),
        "{stdout}"
    );
}

#[test]
fn non_interactive_run_exits_ok_when_everything_completed() {
    let repo = fixture(vec![task_with_status("t1", TaskStatus::Completed)]);
    let output = conductor(&repo, &["run", "--non-interactive"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("All tasks finished: 1 completed, 0 stuck."), "{stdout}");

    let state = load_pipeline_state(&repo.paths().run_state_path).expect("state");
    assert_eq!(state.state, RgrState::Idle);
    assert!(state.all_done_sent);
    assert!(repo.path().join(".conductor/conductor.log").exists());
}

#[test]
fn non_interactive_run_reports_stuck_tasks() {
    let repo = fixture(vec![
        task_with_status("t1", TaskStatus::Completed),
        task_with_status("t2", TaskStatus::Stuck),
    ]);
    let output = conductor(&repo, &["run", "--non-interactive"]);
    assert_eq!(output.status.code(), Some(exit_codes::STUCK));
}

#[test]
fn run_refuses_to_start_without_decision_model() {
    let repo = fixture_with(vec![task_with_status("t1", TaskStatus::Pending)], false);
    let output = conductor(&repo, &["run", "--non-interactive"]);
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("is not available at http://127.0.0.1:9"), "{stderr}");
    assert!(stderr.contains("llm.allow_unavailable = true"), "{stderr}");

    let state = load_pipeline_state(&repo.paths().run_state_path).expect("state");
    assert!(state.task_id.is_none());
}

#[test]
fn health_fails_without_decision_service() {
    let repo = fixture(Vec::new());
    let output = conductor(&repo, &["health"]);
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("unavailable"), "{stdout}");
    assert!(stdout.contains("not found"), "{stdout}");
}

#[test]
fn malformed_task_list_is_rejected() {
    let repo = fixture(Vec::new());
    std::fs::write(repo.path().join(".conductor/tasks.json"), "{not json").expect("write");
    let output = conductor(&repo, &["status"]);
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
}
