//! Exhaustive transition table for the Red-Green-Refactor controller.
//!
//! `plan` is pure: it only says what the controller should do for a given
//! state/event pair. Every pair is spelled out (no wildcard arms), so adding a
//! state or an event is a compile error until the table covers it.

use crate::core::message::Message;
use crate::core::types::{MergeStage, RgrState, Role, Verdict};

/// Inputs that can drive a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A pending task is available for assignment.
    TaskAssigned,
    /// Test-writer reported its branch ready.
    TestsReady,
    /// Implementer reported its branch ready.
    ImplementationReady,
    /// Refactorer reported a verdict.
    Verdict(Verdict),
    /// Operator asked to resume after manual repair.
    OperatorResume,
    /// Operator asked to abandon the current task.
    OperatorSkip,
}

impl Event {
    pub fn label(&self) -> &'static str {
        match self {
            Event::TaskAssigned => "task_assigned",
            Event::TestsReady => "tests_ready",
            Event::ImplementationReady => "implementation_ready",
            Event::Verdict(Verdict::Pass) => "verdict_pass",
            Event::Verdict(Verdict::Fail) => "verdict_fail",
            Event::Verdict(Verdict::Unrecognized(_)) => "verdict_unrecognized",
            Event::OperatorResume => "operator_resume",
            Event::OperatorSkip => "operator_skip",
        }
    }
}

/// What the controller must do in response to an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Cut branches, write the assignment, wake the test-writer.
    AssignTask,
    /// Run a forward merge; success continues the pipeline, failure blocks it.
    Merge(MergeStage),
    /// Count a failed cycle and either retry or give up on the task.
    RecordFailure,
    /// Ask the decision client what an unclassified report means.
    ConsultDecision,
    /// Re-run the merge or task assignment that blocked the pipeline.
    RetryBlockedStep,
    /// Mark the current task stuck and move on.
    SkipTask,
    /// Defined no-op.
    Ignore(&'static str),
}

const NO_TASK: &str = "no task in flight";
const ALREADY_ASSIGNED: &str = "a task is already assigned";
const OUT_OF_PHASE: &str = "report does not match the current phase";
const BLOCKED: &str = "pipeline is blocked";
const NOT_BLOCKED: &str = "pipeline is not blocked";

/// Event carried by a mailbox message, keyed on who sent it and whose mailbox
/// it landed in. Anything else is traffic between agents (or the
/// orchestrator's own output) and is refused with the reason.
pub fn report_event(message: &Message) -> Result<Event, &'static str> {
    match (message.from, message.to) {
        (Role::TestWriter, Role::Implementer) => Ok(Event::TestsReady),
        (Role::Implementer, Role::Refactorer) => Ok(Event::ImplementationReady),
        (Role::Refactorer, Role::Implementer | Role::Orchestrator) => {
            Ok(Event::Verdict(message.verdict()))
        }
        (Role::Orchestrator, _) => Err("written by the orchestrator"),
        (Role::TestWriter, Role::Orchestrator | Role::TestWriter | Role::Refactorer)
        | (Role::Implementer, Role::Orchestrator | Role::TestWriter | Role::Implementer)
        | (Role::Refactorer, Role::TestWriter | Role::Refactorer) => {
            Err("not a phase report for this mailbox")
        }
    }
}

pub fn plan(state: RgrState, event: &Event) -> Step {
    match (state, event) {
        (RgrState::Idle, Event::TaskAssigned) => Step::AssignTask,
        (
            RgrState::Idle,
            Event::TestsReady | Event::ImplementationReady | Event::Verdict(_),
        ) => Step::Ignore(NO_TASK),
        (RgrState::Idle, Event::OperatorResume) => Step::Ignore(NOT_BLOCKED),
        (RgrState::Idle, Event::OperatorSkip) => Step::Ignore(NO_TASK),

        (RgrState::WaitingTests, Event::TestsReady) => {
            Step::Merge(MergeStage::TestsIntoImplementation)
        }
        (RgrState::WaitingTests, Event::ImplementationReady | Event::Verdict(_)) => {
            Step::Ignore(OUT_OF_PHASE)
        }

        (RgrState::WaitingImplementation, Event::ImplementationReady) => {
            Step::Merge(MergeStage::ImplementationIntoRefactor)
        }
        (RgrState::WaitingImplementation, Event::TestsReady | Event::Verdict(_)) => {
            Step::Ignore(OUT_OF_PHASE)
        }

        (RgrState::WaitingRefactor, Event::Verdict(Verdict::Pass)) => {
            Step::Merge(MergeStage::RefactorIntoDefault)
        }
        (RgrState::WaitingRefactor, Event::Verdict(Verdict::Fail)) => Step::RecordFailure,
        (RgrState::WaitingRefactor, Event::Verdict(Verdict::Unrecognized(_))) => {
            Step::ConsultDecision
        }
        (RgrState::WaitingRefactor, Event::TestsReady | Event::ImplementationReady) => {
            Step::Ignore(OUT_OF_PHASE)
        }

        (
            RgrState::WaitingTests | RgrState::WaitingImplementation | RgrState::WaitingRefactor,
            Event::TaskAssigned,
        ) => Step::Ignore(ALREADY_ASSIGNED),
        (
            RgrState::WaitingTests | RgrState::WaitingImplementation | RgrState::WaitingRefactor,
            Event::OperatorResume,
        ) => Step::Ignore(NOT_BLOCKED),
        (
            RgrState::WaitingTests
            | RgrState::WaitingImplementation
            | RgrState::WaitingRefactor
            | RgrState::Blocked,
            Event::OperatorSkip,
        ) => Step::SkipTask,

        (RgrState::Blocked, Event::OperatorResume) => Step::RetryBlockedStep,
        (RgrState::Blocked, Event::TaskAssigned) => Step::Ignore(BLOCKED),
        (
            RgrState::Blocked,
            Event::TestsReady | Event::ImplementationReady | Event::Verdict(_),
        ) => Step::Ignore(BLOCKED),
    }
}
