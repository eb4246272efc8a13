//! Deterministic task selection.

use crate::core::types::TaskStatus;
use crate::task::Task;

/// Find the first task (in list order) that is pending or in progress.
///
/// Returns `None` when every task is completed or stuck.
pub fn current_task(tasks: &[Task]) -> Option<(usize, &Task)> {
    tasks
        .iter()
        .enumerate()
        .find(|(_, task)| !task.status.is_terminal())
}

/// True once a task has used more attempts than allowed.
///
/// `max_attempts == 0` means unlimited.
pub fn exceeds_limit(attempts: u32, max_attempts: u32) -> bool {
    max_attempts != 0 && attempts > max_attempts
}

/// Count of tasks per status: (pending, in_progress, completed, stuck).
pub fn status_counts(tasks: &[Task]) -> (usize, usize, usize, usize) {
    tasks
        .iter()
        .fold((0, 0, 0, 0), |(p, i, c, s), task| match task.status {
            TaskStatus::Pending => (p + 1, i, c, s),
            TaskStatus::InProgress => (p, i + 1, c, s),
            TaskStatus::Completed => (p, i, c + 1, s),
            TaskStatus::Stuck => (p, i, c, s + 1),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::task_with_status;

    #[test]
    fn selects_first_non_terminal_task() {
        let tasks = vec![
            task_with_status("a", TaskStatus::Completed),
            task_with_status("b", TaskStatus::Stuck),
            task_with_status("c", TaskStatus::Pending),
            task_with_status("d", TaskStatus::InProgress),
        ];
        let (idx, task) = current_task(&tasks).expect("open task");
        assert_eq!(idx, 2);
        assert_eq!(task.id, "c");
    }

    #[test]
    fn all_terminal_selects_nothing() {
        let tasks = vec![
            task_with_status("a", TaskStatus::Completed),
            task_with_status("b", TaskStatus::Stuck),
        ];
        assert!(current_task(&tasks).is_none());
    }

    #[test]
    fn limit_is_exceeded_only_past_max() {
        assert!(!exceeds_limit(3, 3));
        assert!(exceeds_limit(4, 3));
        assert!(!exceeds_limit(1_000, 0));
    }

    #[test]
    fn counts_each_status() {
        let tasks = vec![
            task_with_status("a", TaskStatus::Completed),
            task_with_status("b", TaskStatus::InProgress),
            task_with_status("c", TaskStatus::Pending),
            task_with_status("d", TaskStatus::Pending),
        ];
        assert_eq!(status_counts(&tasks), (2, 1, 1, 0));
    }
}
