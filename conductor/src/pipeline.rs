//! The RGR controller.
//!
//! [`Pipeline`] owns every collaborator and is the only thing that mutates
//! tasks, branches and run state. Agent reports are turned into [`Event`]s by
//! sender and mailbox, the pure transition table picks a [`Step`], and the step is carried
//! out here. Run state is written after every transition so a restarted
//! controller resumes where it stopped.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::decision::{ConsoleIntent, DecisionAction};
use crate::core::message::{
    AllDone, FixRequired, Message, MessageContent, RevalidateTests, TaskAssignment, WorkReport,
    work_report_from,
};
use crate::core::transitions::{Event, Step, plan, report_event};
use crate::core::types::{MergeStage, RgrState, Role};
use crate::io::branches::{BranchManager, detect_default_branch};
use crate::io::config::ConductorConfig;
use crate::io::init::ConductorPaths;
use crate::io::llm::{DecisionClient, InferenceBackend};
use crate::io::mailbox::Mailbox;
use crate::io::notifier::{Notifier, NotifyOutcome};
use crate::io::prompt::{DecisionInputs, PromptEngine};
use crate::io::run_state::{
    PendingMerge, PipelineState, load_pipeline_state, write_pipeline_state,
};
use crate::io::task_store::{FailOutcome, TaskStore};

const TEST_WRITER_INSTRUCTIONS: &str = "Write failing tests that pin down this task on your \
    branch and commit them. Do not implement the feature. When done, send tests_ready with a \
    summary and the files you changed.";
const IMPLEMENTER_INSTRUCTIONS: &str = "Failing tests for this task are merged into your \
    branch. Make them pass without editing the tests, commit, then send implementation_ready \
    with a summary and the files you changed.";
const REFACTORER_INSTRUCTIONS: &str = "The implementation is merged into your branch. Run the \
    tests, refactor while keeping them green, commit, then send refactor_verdict with verdict \
    pass or fail and any issues found.";
const FIX_INSTRUCTIONS: &str = "The refactorer rejected this attempt. Fix the listed issues on \
    your branch, commit, then send implementation_ready again.";
const REVALIDATE_INSTRUCTIONS: &str = "This task keeps failing review. Re-check your tests \
    against the acceptance criteria, correct them if they are wrong, commit, then send \
    tests_ready again.";

/// Build the branch manager for a project, detecting the default branch
/// unless the config names one.
pub fn branch_manager(config: &ConductorConfig, paths: &ConductorPaths) -> Result<BranchManager> {
    let default_branch = match &config.git.default_branch {
        Some(branch) => branch.clone(),
        None => detect_default_branch(&paths.root, config.git.timeout())?,
    };
    Ok(BranchManager::new(
        &paths.root,
        default_branch,
        paths.workspaces(&config.workspaces),
        config.git.clone(),
    ))
}

pub struct Pipeline<N: Notifier, B: InferenceBackend> {
    config: ConductorConfig,
    paths: ConductorPaths,
    tasks: TaskStore,
    mailbox: Mailbox,
    branches: BranchManager,
    notifier: N,
    decisions: DecisionClient<B>,
    prompts: PromptEngine,
    state: PipelineState,
    paused: bool,
    notices: Vec<String>,
}

impl<N: Notifier, B: InferenceBackend> Pipeline<N, B> {
    /// Load tasks and run state and wire up the collaborators.
    ///
    /// Messages routed by an earlier run are not routed again; ids whose
    /// files are gone are dropped from that record. A run state
    /// bound to a task that no longer exists or is already terminal is reset
    /// to idle.
    #[instrument(skip_all, fields(root = %paths.root.display()))]
    pub fn open(config: ConductorConfig, paths: ConductorPaths, notifier: N, backend: B) -> Result<Self> {
        config.validate()?;
        let tasks = TaskStore::load(&paths.resolve(&config.tasks.file), config.tasks.max_attempts)?;
        let branches = branch_manager(&config, &paths)?;
        let mut mailbox = Mailbox::new(paths.resolve(&config.polling.mailbox_dir));
        mailbox.ensure_dirs()?;
        let prompts = PromptEngine::new()?;
        let decisions = DecisionClient::new(
            backend,
            config.llm.model.clone(),
            prompts.decision_system()?,
        );

        let mut state = load_pipeline_state(&paths.run_state_path)?;
        let present: HashSet<String> = mailbox.history()?.into_iter().map(|m| m.id).collect();
        let before = state.routed.len();
        state.routed.retain(|id| present.contains(id));
        if state.routed.len() != before {
            debug!(dropped = before - state.routed.len(), "forgot routed ids with no file");
        }
        mailbox.mark_seen(state.routed.iter().cloned());
        let stale = match &state.task_id {
            Some(id) => tasks.get(id).is_none_or(|task| task.status.is_terminal()),
            None => state.state != RgrState::Idle,
        };
        if stale {
            warn!(state = %state.state, task_id = ?state.task_id, "run state does not match the task list; starting idle");
            state.state = RgrState::Idle;
            state.task_id = None;
            state.pending_merge = None;
            state.pending_assignment = None;
        }
        info!(
            state = %state.state,
            task_id = ?state.task_id,
            default_branch = %branches.default_branch(),
            tasks = tasks.tasks().len(),
            "pipeline ready"
        );

        let pipeline = Self {
            config,
            paths,
            tasks,
            mailbox,
            branches,
            notifier,
            decisions,
            prompts,
            state,
            paused: false,
            notices: Vec::new(),
        };
        pipeline.save()?;
        Ok(pipeline)
    }

    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    pub fn tasks(&self) -> &TaskStore {
        &self.tasks
    }

    pub fn branches(&self) -> &BranchManager {
        &self.branches
    }

    pub fn notifier(&self) -> &N {
        &self.notifier
    }

    pub fn decisions(&self) -> &DecisionClient<B> {
        &self.decisions
    }

    pub fn config(&self) -> &ConductorConfig {
        &self.config
    }

    pub fn paused(&self) -> bool {
        self.paused
    }

    /// Idle with every task completed or stuck.
    pub fn is_finished(&self) -> bool {
        self.state.state == RgrState::Idle && self.tasks.all_terminal()
    }

    /// Operator-facing notices produced since the last call.
    pub fn take_notices(&mut self) -> Vec<String> {
        std::mem::take(&mut self.notices)
    }

    /// One pass of the loop: route new mailbox traffic, then assign work or
    /// announce completion when idle. Does nothing while paused.
    pub fn tick(&mut self) -> Result<()> {
        if self.paused {
            return Ok(());
        }
        for message in self.mailbox.poll_all()? {
            self.route(message)?;
        }
        if self.state.state == RgrState::Idle {
            if self.tasks.current_task().is_some() {
                self.handle(Event::TaskAssigned, None)?;
            } else {
                self.finish_all()?;
            }
        }
        Ok(())
    }

    #[instrument(skip_all, fields(id = %message.id, from = %message.from, to = %message.to, kind = %message.kind))]
    fn route(&mut self, message: Message) -> Result<()> {
        if message.from == Role::Orchestrator {
            debug!("own message skipped");
            return Ok(());
        }
        self.state.routed.push(message.id.clone());
        let event = match report_event(&message) {
            Ok(event) => event,
            Err(reason) => {
                info!(reason, "message not routed");
                return self.save();
            }
        };

        if let (Some(theirs), Some(ours)) = (message.task_id(), self.state.task_id.as_deref()) {
            if theirs != ours {
                info!(task_id = theirs, current = ours, "message for another task ignored");
                return self.save();
            }
        }
        info!(event = event.label(), "agent report received");
        self.handle(event, Some(message))?;
        self.save()
    }

    fn handle(&mut self, event: Event, trigger: Option<Message>) -> Result<()> {
        let step = plan(self.state.state, &event);
        debug!(state = %self.state.state, event = event.label(), ?step, "planned step");
        match step {
            Step::AssignTask => self.assign_next(),
            Step::Merge(stage) => {
                let trigger =
                    trigger.ok_or_else(|| anyhow!("{stage} merge needs a triggering report"))?;
                self.run_merge(stage, trigger)
            }
            Step::RecordFailure => self.record_failure(trigger.as_ref()),
            Step::ConsultDecision => self.consult(trigger.as_ref()),
            Step::RetryBlockedStep => self.retry_blocked_step(),
            Step::SkipTask => self.skip_task(),
            Step::Ignore(reason) => {
                info!(state = %self.state.state, event = event.label(), reason, "event ignored");
                Ok(())
            }
        }
    }

    /// Bind the next open task: fresh branches, clean agent contexts, an
    /// assignment for the test-writer. A task whose branches cannot be
    /// prepared blocks the pipeline and stays pending.
    fn assign_next(&mut self) -> Result<()> {
        let Some(task) = self.tasks.current_task().cloned() else {
            return self.finish_all();
        };
        info!(task_id = %task.id, title = %task.title, attempts = task.attempts, "assigning task");
        if let Err(err) = self
            .branches
            .create_task_branches(&task.id)
            .with_context(|| format!("prepare branches for task {}", task.id))
        {
            let reason = format!("{err:#}");
            self.notice(format!(
                "BLOCKED: could not prepare branches for task {}: {reason}. Fix the workspaces, then type 'resume' or 'skip-current'.",
                task.id
            ));
            self.state.pending_merge = None;
            self.state.pending_assignment = Some(reason);
            return self.enter(RgrState::Blocked, Some(task.id));
        }
        for agent in Role::AGENTS {
            self.notifier.clear_context(agent);
        }
        self.tasks.start(&task.id)?;

        let assignment = MessageContent::TaskAssignment(TaskAssignment {
            task_id: task.id.clone(),
            title: task.title.clone(),
            description: task.description.clone(),
            acceptance_criteria: task.acceptance_criteria.clone(),
            branch: self.branches.branch(Role::TestWriter, &task.id)?,
            attempt: task.attempts,
            instructions: TEST_WRITER_INSTRUCTIONS.to_string(),
        });
        self.mailbox
            .send(Role::Orchestrator, Role::TestWriter, &assignment)?;
        self.state.all_done_sent = false;
        self.enter(RgrState::WaitingTests, Some(task.id))?;
        self.notifier.notify(Role::TestWriter);
        Ok(())
    }

    #[instrument(skip_all, fields(stage = %stage))]
    fn run_merge(&mut self, stage: MergeStage, trigger: Message) -> Result<()> {
        let task_id = self.bound_task()?;
        let outcome = match stage {
            MergeStage::TestsIntoImplementation => {
                let source = self.branches.branch(Role::TestWriter, &task_id)?;
                self.branches.merge_forward(Role::Implementer, &source)
            }
            MergeStage::ImplementationIntoRefactor => {
                let source = self.branches.branch(Role::Implementer, &task_id)?;
                self.branches.merge_forward(Role::Refactorer, &source)
            }
            MergeStage::RefactorIntoDefault => {
                let source = self.branches.branch(Role::Refactorer, &task_id)?;
                self.branches.merge_into_default(&source)
            }
        };

        if !outcome.is_merged() {
            let reason = outcome.describe();
            let target = self.merge_target(stage)?.display().to_string();
            self.notice(format!(
                "BLOCKED: {stage} merge for task {task_id}: {reason}. Resolve it in {target}, then type 'resume' or 'skip-current'."
            ));
            self.state.pending_merge = Some(PendingMerge {
                stage,
                trigger,
                reason,
            });
            self.state.pending_assignment = None;
            return self.enter(RgrState::Blocked, Some(task_id));
        }

        match stage {
            MergeStage::TestsIntoImplementation => {
                self.forward(
                    Role::Implementer,
                    &trigger,
                    &task_id,
                    IMPLEMENTER_INSTRUCTIONS,
                    MessageContent::TestsReady,
                )?;
                self.enter(RgrState::WaitingImplementation, Some(task_id))?;
                self.notifier.notify(Role::Implementer);
            }
            MergeStage::ImplementationIntoRefactor => {
                self.forward(
                    Role::Refactorer,
                    &trigger,
                    &task_id,
                    REFACTORER_INSTRUCTIONS,
                    MessageContent::ImplementationReady,
                )?;
                self.enter(RgrState::WaitingRefactor, Some(task_id))?;
                self.notifier.notify(Role::Refactorer);
            }
            MergeStage::RefactorIntoDefault => {
                self.tasks.advance(&task_id)?;
                self.notice(format!(
                    "Task {task_id} completed and merged into {}.",
                    self.branches.default_branch()
                ));
                self.enter(RgrState::Idle, None)?;
                self.assign_next()?;
            }
        }
        Ok(())
    }

    fn merge_target(&self, stage: MergeStage) -> Result<&Path> {
        match stage {
            MergeStage::TestsIntoImplementation => self.branches.workspace(Role::Implementer),
            MergeStage::ImplementationIntoRefactor => self.branches.workspace(Role::Refactorer),
            MergeStage::RefactorIntoDefault => Ok(self.branches.repo()),
        }
    }

    /// Pass an agent's report on to the next agent, pointed at its branch.
    fn forward(
        &mut self,
        to: Role,
        trigger: &Message,
        task_id: &str,
        instructions: &str,
        wrap: fn(WorkReport) -> MessageContent,
    ) -> Result<()> {
        let mut report = work_report_from(trigger);
        report.task_id = Some(task_id.to_string());
        report.branch = self.branches.branch(to, task_id)?;
        report.instructions = instructions.to_string();
        self.mailbox.send(Role::Orchestrator, to, &wrap(report))?;
        Ok(())
    }

    fn record_failure(&mut self, trigger: Option<&Message>) -> Result<()> {
        let task_id = self.bound_task()?;
        let (summary, issues) = trigger.map(failure_details).unwrap_or_default();
        match self.tasks.fail(&task_id)? {
            FailOutcome::Stuck { attempts } => {
                self.notice(format!(
                    "HUMAN REVIEW NEEDED: task {task_id} failed {attempts} times and is marked stuck."
                ));
                self.enter(RgrState::Idle, None)?;
                self.assign_next()
            }
            FailOutcome::Retry { attempts } => {
                let every = self.config.pipeline.revalidate_tests_every;
                if every > 0 && attempts % every == 0 {
                    info!(task_id = %task_id, attempts, "asking the test-writer to re-validate");
                    let content = MessageContent::RevalidateTests(RevalidateTests {
                        task_id: task_id.clone(),
                        attempt: attempts,
                        issues,
                        instructions: REVALIDATE_INSTRUCTIONS.to_string(),
                    });
                    self.mailbox
                        .send(Role::Orchestrator, Role::TestWriter, &content)?;
                    self.enter(RgrState::WaitingTests, Some(task_id))?;
                    self.notifier.notify(Role::TestWriter);
                } else {
                    info!(task_id = %task_id, attempts, "sending the implementer back");
                    let message = if summary.is_empty() {
                        "The refactorer found problems. Check your messages and fix them.".to_string()
                    } else {
                        summary
                    };
                    let content = MessageContent::FixRequired(FixRequired {
                        task_id: task_id.clone(),
                        attempt: attempts,
                        message,
                        issues,
                        instructions: FIX_INSTRUCTIONS.to_string(),
                    });
                    self.mailbox
                        .send(Role::Orchestrator, Role::Implementer, &content)?;
                    self.enter(RgrState::WaitingImplementation, Some(task_id))?;
                    self.notifier.notify(Role::Implementer);
                }
                Ok(())
            }
        }
    }

    /// Ask the decision service about a report the table cannot classify.
    /// Only `flag_human` is acted on.
    fn consult(&mut self, trigger: Option<&Message>) -> Result<()> {
        let task_id = self.bound_task()?;
        let trigger = trigger.ok_or_else(|| anyhow!("unclassified verdict without a report"))?;
        let history = self.mailbox.history()?;
        let recent = &history[history.len().saturating_sub(self.config.llm.history_messages)..];
        let context = self.prompts.decision_context(&DecisionInputs {
            state: self.state.state,
            task: self.tasks.get(&task_id),
            max_attempts: self.tasks.max_attempts(),
            counts: self.tasks.counts(),
            event_type: &trigger.kind,
            event_data: &trigger.content,
            history: recent,
        })?;

        let decision = self.decisions.decide(&context);
        match decision.action {
            DecisionAction::FlagHuman => {
                self.tasks.mark_stuck(&task_id)?;
                let detail = if decision.message.is_empty() {
                    decision.reasoning.as_str()
                } else {
                    decision.message.as_str()
                };
                self.notice(format!("HUMAN REVIEW NEEDED: task {task_id}: {detail}"));
                self.enter(RgrState::Idle, None)?;
                self.assign_next()
            }
            other => {
                info!(action = ?other, reasoning = %decision.reasoning, "decision not acted on");
                Ok(())
            }
        }
    }

    fn retry_blocked_step(&mut self) -> Result<()> {
        if let Some(pending) = self.state.pending_merge.take() {
            info!(stage = %pending.stage, previous = %pending.reason, "retrying merge");
            self.state.state = pending.stage.waiting_state();
            return self.run_merge(pending.stage, pending.trigger);
        }
        if let Some(previous) = self.state.pending_assignment.take() {
            info!(task_id = ?self.state.task_id, %previous, "retrying task assignment");
            self.enter(RgrState::Idle, None)?;
            return self.assign_next();
        }
        warn!("blocked with nothing to retry; returning to idle");
        self.enter(RgrState::Idle, None)
    }

    fn skip_task(&mut self) -> Result<()> {
        let task_id = self.bound_task()?;
        self.tasks.mark_stuck(&task_id)?;
        self.enter(RgrState::Idle, None)?;
        self.assign_next()
    }

    /// Broadcast `all_done` once every task is terminal.
    fn finish_all(&mut self) -> Result<()> {
        if self.state.all_done_sent || !self.tasks.all_terminal() {
            return Ok(());
        }
        let counts = self.tasks.counts();
        let message = format!(
            "All tasks finished: {} completed, {} stuck.",
            counts.completed, counts.stuck
        );
        let content = MessageContent::AllDone(AllDone {
            message: message.clone(),
            completed: counts.completed,
            stuck: counts.stuck,
        });
        for agent in Role::AGENTS {
            self.mailbox.send(Role::Orchestrator, agent, &content)?;
            self.notifier.notify(agent);
        }
        info!(completed = counts.completed, stuck = counts.stuck, "all tasks processed");
        self.notice(message);
        self.state.all_done_sent = true;
        self.save()
    }

    fn enter(&mut self, next: RgrState, task_id: Option<String>) -> Result<()> {
        if self.state.state != next {
            info!(from = %self.state.state, to = %next, task_id = ?task_id, "state transition");
        }
        self.state.state = next;
        self.state.task_id = task_id;
        if next != RgrState::Blocked {
            self.state.pending_merge = None;
            self.state.pending_assignment = None;
        }
        self.save()
    }

    fn bound_task(&self) -> Result<String> {
        self.state
            .task_id
            .clone()
            .ok_or_else(|| anyhow!("no task bound in state {}", self.state.state))
    }

    fn notice(&mut self, text: String) {
        warn!(notice = %text, "operator notice");
        self.notices.push(text);
    }

    fn save(&self) -> Result<()> {
        write_pipeline_state(&self.paths.run_state_path, &self.state)
    }

    // Operator primitives. Each returns the text to print.

    pub fn pause(&mut self) -> String {
        if self.paused {
            return "Already paused.".to_string();
        }
        self.paused = true;
        info!("routing paused");
        "Paused. Mailboxes are not polled until 'resume'.".to_string()
    }

    /// Lift a pause and retry whatever blocked the pipeline.
    pub fn resume(&mut self) -> Result<String> {
        let was_paused = std::mem::replace(&mut self.paused, false);
        if was_paused {
            info!("routing resumed");
        }
        if self.state.state == RgrState::Blocked {
            self.handle(Event::OperatorResume, None)?;
            return Ok(if self.state.state == RgrState::Blocked {
                "Still blocked.".to_string()
            } else {
                format!("Unblocked; now {}.", self.state.state)
            });
        }
        Ok(if was_paused {
            "Resumed.".to_string()
        } else {
            "Not paused.".to_string()
        })
    }

    /// Mark the bound task stuck and move on.
    pub fn skip_current(&mut self) -> Result<String> {
        let Some(task_id) = self.state.task_id.clone() else {
            return Ok("No task in flight.".to_string());
        };
        self.handle(Event::OperatorSkip, None)?;
        Ok(format!("Skipped task {task_id}; it is marked stuck."))
    }

    pub fn nudge(&mut self, agent: Role) -> String {
        let outcome = self.notifier.nudge(agent);
        describe_signal(agent, &outcome, "Nudged")
    }

    pub fn message_agent(&mut self, agent: Role, text: &str) -> String {
        let outcome = self.notifier.send_text(agent, text);
        describe_signal(agent, &outcome, "Sent text to")
    }

    pub fn status_report(&self) -> String {
        let mut lines = Vec::new();
        let paused = if self.paused { " (paused)" } else { "" };
        lines.push(format!("State: {}{paused}", self.state.state));
        match self.state.task_id.as_deref().and_then(|id| self.tasks.get(id)) {
            Some(task) => {
                let max = match self.tasks.max_attempts() {
                    0 => "unlimited".to_string(),
                    n => n.to_string(),
                };
                lines.push(format!(
                    "Task: {} - {} (attempts {}/{max})",
                    task.id, task.title, task.attempts
                ));
                let branches: Vec<String> = Role::AGENTS
                    .iter()
                    .filter_map(|agent| self.branches.branch(*agent, &task.id).ok())
                    .collect();
                lines.push(format!("Branches: {}", branches.join(", ")));
            }
            None => lines.push("Task: none".to_string()),
        }
        if let Some(pending) = &self.state.pending_merge {
            lines.push(format!("Blocked on: {} ({})", pending.stage, pending.reason));
        }
        if let Some(reason) = &self.state.pending_assignment {
            lines.push(format!("Blocked on: task branches ({reason})"));
        }
        let counts = self.tasks.counts();
        lines.push(format!(
            "Tasks: {} pending, {} in progress, {} completed, {} stuck",
            counts.pending, counts.in_progress, counts.completed, counts.stuck
        ));
        lines.join("\n")
    }

    pub fn task_list(&self) -> String {
        if self.tasks.tasks().is_empty() {
            return "No tasks.".to_string();
        }
        self.tasks
            .tasks()
            .iter()
            .map(|task| {
                let marker = if self.state.task_id.as_deref() == Some(task.id.as_str()) {
                    '*'
                } else {
                    ' '
                };
                format!(
                    "{marker} {:<11} {}  {} (attempts {})",
                    task.status.as_str(),
                    task.id,
                    task.title,
                    task.attempts
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Interpret free text through the decision service.
    pub fn interpret(&self, input: &str) -> Result<ConsoleIntent> {
        let system = self.prompts.console_system()?;
        let context = self.prompts.console_context(&self.status_report(), input)?;
        Ok(self.decisions.decide_freeform(&system, &context))
    }
}

/// Summary and issue list from a failing verdict, whatever its shape.
fn failure_details(message: &Message) -> (String, Vec<Value>) {
    match message.body() {
        MessageContent::RefactorVerdict(verdict) => (verdict.summary, verdict.issues),
        MessageContent::FixRequired(fix) => (fix.message, fix.issues),
        _ => {
            let summary = ["summary", "message"]
                .iter()
                .find_map(|key| message.content.get(*key).and_then(Value::as_str))
                .unwrap_or_default()
                .to_string();
            let issues = ["issues", "bugs"]
                .iter()
                .find_map(|key| message.content.get(*key).and_then(Value::as_array))
                .cloned()
                .unwrap_or_default();
            (summary, issues)
        }
    }
}

fn describe_signal(agent: Role, outcome: &NotifyOutcome, verb: &str) -> String {
    match outcome {
        NotifyOutcome::Sent => format!("{verb} {agent}."),
        NotifyOutcome::Suppressed { remaining } => format!(
            "{agent} was signalled recently; try again in {}s.",
            remaining.as_secs().max(1)
        ),
        NotifyOutcome::Failed(reason) => format!("Could not reach {agent}: {reason}"),
    }
}
