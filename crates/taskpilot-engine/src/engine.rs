//! Task engine: the single entry point that moves tasks through their
//! lifecycle.
//!
//! Every mutating operation takes the task's lock, loads the task fresh
//! from storage and persists each step outcome and transition before the
//! next one runs. A step is written as in-progress before its side effect
//! starts, so a crash leaves a marker that recovery can act on.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use taskpilot_core::config::TaskPilotConfig;
use taskpilot_core::sensitive::redact_value;
use taskpilot_core::types::{
    ActionKind, ConfirmationStatus, CostEntry, LogEntry, LogEvent, MemoryHit, Plan, PlanStep,
    Speaker, StepStatus, Subtask, Suspension, SuspensionKind, Task, TaskFilter, TaskPriority,
    TaskState, Timestamp, TranscriptTurn, Usage, User, VaultSummary, WorkingContext,
};
use taskpilot_memory::MemoryGateway;

use crate::collaborators::{CallHandle, CallStatus, Collaborators, InteractionEvent};
use crate::error::{EngineError, Result, ToolError};
use crate::governor::SafetyGovernor;
use crate::locks::TaskLocks;
use crate::monitor::{SelfMonitor, TurnSignal, Verdict};
use crate::orchestrator::{Preparation, StepOutcome, ToolOrchestrator};
use crate::planner::Planner;
use crate::state_machine::{next_state, validate_transition, Trigger};
use crate::tools::{ToolContext, ToolRegistry};

/// Longest goal `create_task` accepts, in characters.
pub const MAX_GOAL_CHARS: usize = 2_000;
const TITLE_CHARS: usize = 80;

/// How far a single `execute` call may go.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Stop after one tool invocation.
    Step,
    /// Continue until the task suspends or reaches a terminal state.
    #[default]
    Run,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TransitionRecord {
    pub from: TaskState,
    pub to: TaskState,
    pub trigger: Trigger,
}

/// What one engine call did to a task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub task_id: Uuid,
    pub state: TaskState,
    pub steps_executed: usize,
    pub transitions: Vec<TransitionRecord>,
    pub suspension: Option<SuspensionKind>,
}

impl RunReport {
    pub fn is_suspended(&self) -> bool {
        self.suspension.is_some()
    }

    /// The pending confirmation the task is parked on, if any.
    pub fn pending_confirmation(&self) -> Option<Uuid> {
        match self.suspension {
            Some(SuspensionKind::AwaitingConfirmation {
                confirmation_id, ..
            }) => Some(confirmation_id),
            _ => None,
        }
    }
}

/// Full read view of a task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskView {
    pub task: Task,
    /// Every plan version, oldest first.
    pub plans: Vec<Plan>,
    pub logs: Vec<LogEntry>,
    pub cost: f64,
    pub cost_entries: Vec<CostEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub expired_confirmations: usize,
    /// Tasks resumed after their confirmation was decided or expired.
    pub resumed: usize,
    pub input_timeouts: usize,
    pub purged_contexts: usize,
    pub pruned_locks: usize,
    pub errors: usize,
}

/// Result of one unit of work inside a run.
enum Tick {
    /// A tool was dispatched.
    Stepped,
    /// The task moved on without dispatching a tool.
    Advanced,
    /// Suspended or terminal; nothing more to do in this run.
    Halted,
}

/// A task loaded under its lock, plus what has happened to it so far.
struct Session {
    task: Task,
    user: User,
    working: WorkingContext,
    steps_executed: usize,
    transitions: Vec<TransitionRecord>,
}

impl Session {
    fn finish(self) -> RunReport {
        RunReport {
            task_id: self.task.id,
            state: self.task.state,
            steps_executed: self.steps_executed,
            transitions: self.transitions,
            suspension: self.task.suspension.map(|s| s.kind),
        }
    }

    fn var_flag(&self, key: &str) -> bool {
        self.working
            .vars
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    fn plan_id(&self) -> Result<Uuid> {
        self.task
            .plan
            .as_ref()
            .map(|p| p.id)
            .ok_or_else(|| EngineError::Corrupt(format!("Task {} has no active plan", self.task.id)))
    }
}

fn ensure_active(task: &Task) -> Result<()> {
    if task.state.is_terminal() {
        return Err(EngineError::TerminalTask(task.id, task.state));
    }
    Ok(())
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max.saturating_sub(3)).collect();
    out.push_str("...");
    out
}

/// Plain-text outcome recorded in memory and sent to the user.
fn compose_summary(task: &Task, working: &WorkingContext) -> String {
    let mut summary = format!("{}.", task.goal.trim().trim_end_matches('.'));
    let company = working.var_str("company").unwrap_or("the company");
    if let Some(number) = working.var_str("called_number") {
        summary.push_str(&format!(" Called {} at {}.", company, number));
    }
    if working.has_var("email_sent") {
        if let Some(recipient) = working.var_str("recipient") {
            summary.push_str(&format!(" Replied to {} by email.", recipient));
        }
    }
    match working.var_str("confirmation_reference") {
        Some(reference) => {
            summary.push_str(&format!(" Confirmation reference: {}.", reference));
        }
        None if working.has_var("called_number") => {
            summary.push_str(" The call ended without a reference number.");
        }
        None => {}
    }
    summary
}

fn signal_name(signal: &TurnSignal) -> &'static str {
    match signal {
        TurnSignal::Completion { .. } => "completion",
        TurnSignal::MissingCredential => "missing_credential",
        TurnSignal::InvalidContact => "invalid_contact",
        TurnSignal::Confusion => "confusion",
        TurnSignal::Continue => "continue",
    }
}

pub struct TaskEngine {
    config: TaskPilotConfig,
    memory: Arc<MemoryGateway>,
    collaborators: Collaborators,
    planner: Planner,
    orchestrator: ToolOrchestrator,
    monitor: SelfMonitor,
    locks: TaskLocks,
}

impl TaskEngine {
    /// Engine with the built-in tool handlers.
    pub fn new(
        config: TaskPilotConfig,
        memory: Arc<MemoryGateway>,
        collaborators: Collaborators,
    ) -> Result<Self> {
        let registry = ToolRegistry::with_defaults(&config.orchestrator);
        Self::with_registry(config, memory, collaborators, registry)
    }

    /// Engine with a caller-supplied registry. Fails if the configuration
    /// is invalid or any action lacks a handler.
    pub fn with_registry(
        config: TaskPilotConfig,
        memory: Arc<MemoryGateway>,
        collaborators: Collaborators,
        registry: ToolRegistry,
    ) -> Result<Self> {
        config.validate()?;
        registry.validate()?;

        let orchestrator = ToolOrchestrator::new(
            registry,
            SafetyGovernor::new(config.governor.clone()),
            config.orchestrator.clone(),
            config.pricing.clone(),
        );
        Ok(Self {
            planner: Planner::new(config.planner.clone()),
            monitor: SelfMonitor::new(config.monitor.clone()),
            locks: TaskLocks::new(Duration::from_millis(config.engine.lock_wait_ms)),
            orchestrator,
            config,
            memory,
            collaborators,
        })
    }

    pub fn config(&self) -> &TaskPilotConfig {
        &self.config
    }

    pub fn memory(&self) -> &Arc<MemoryGateway> {
        &self.memory
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    pub fn orchestrator(&self) -> &ToolOrchestrator {
        &self.orchestrator
    }

    // =========================================================================
    // Users, vault and memory
    // =========================================================================

    pub fn create_user(&self, email: &str, name: &str, phone: Option<String>) -> Result<User> {
        let email = email.trim();
        if email.is_empty() || !email.contains('@') {
            return Err(EngineError::InvalidInput(format!(
                "'{}' is not an email address",
                email
            )));
        }
        let name = name.trim();
        if name.is_empty() {
            return Err(EngineError::InvalidInput("Name must not be empty".into()));
        }
        if self.memory.users().find_by_email(email)?.is_some() {
            return Err(EngineError::Conflict(format!(
                "A user with email {} already exists",
                email
            )));
        }

        let user = User::new(email, name, phone);
        self.memory.users().create(&user)?;
        info!(user_id = %user.id, "User created");
        Ok(user)
    }

    pub fn get_user(&self, user_id: Uuid) -> Result<User> {
        self.memory
            .users()
            .find_by_id(user_id)?
            .ok_or_else(|| EngineError::NotFound(format!("User {}", user_id)))
    }

    /// Remove a user with their tasks, credentials and memories.
    pub fn delete_user(&self, user_id: Uuid) -> Result<()> {
        if !self.memory.delete_user(user_id)? {
            return Err(EngineError::NotFound(format!("User {}", user_id)));
        }
        Ok(())
    }

    pub fn store_credentials(
        &self,
        user_id: Uuid,
        company: &str,
        account_number: &str,
        secret: &str,
        metadata: &Value,
    ) -> Result<VaultSummary> {
        self.get_user(user_id)?;
        Ok(self
            .memory
            .store_credentials(user_id, company, account_number, secret, metadata)?)
    }

    pub async fn append_memory(&self, user_id: Uuid, content: &str, metadata: Value) -> Result<Uuid> {
        self.get_user(user_id)?;
        Ok(self.memory.remember(user_id, content, metadata).await?)
    }

    pub async fn query_memory(
        &self,
        user_id: Uuid,
        query: &str,
        limit: Option<usize>,
        min_similarity: Option<f64>,
    ) -> Result<Vec<MemoryHit>> {
        self.get_user(user_id)?;
        Ok(self
            .memory
            .recall(user_id, query, limit, min_similarity)
            .await?)
    }

    // =========================================================================
    // Task lifecycle
    // =========================================================================

    /// Register a new goal in INIT. Nothing runs until `execute`.
    pub fn create_task(
        &self,
        user_id: Uuid,
        goal: &str,
        priority: TaskPriority,
        metadata: Value,
    ) -> Result<Task> {
        let goal = goal.trim();
        if goal.is_empty() {
            return Err(EngineError::InvalidInput("Goal must not be empty".into()));
        }
        if goal.chars().count() > MAX_GOAL_CHARS {
            return Err(EngineError::InvalidInput(format!(
                "Goal exceeds {} characters",
                MAX_GOAL_CHARS
            )));
        }
        let metadata = match metadata {
            Value::Null => json!({}),
            Value::Object(_) => metadata,
            _ => {
                return Err(EngineError::InvalidInput(
                    "Metadata must be a JSON object".into(),
                ))
            }
        };

        let user = self.get_user(user_id)?;
        if !user.is_active {
            return Err(EngineError::InvalidInput(format!(
                "User {} is inactive",
                user_id
            )));
        }

        let task = Task::new(user.id, goal.to_string(), priority, metadata);
        self.memory.tasks().create(&task)?;
        info!(task_id = %task.id, user_id = %user.id, priority = %task.priority.as_str(), "Task created");
        Ok(task)
    }

    pub fn get(&self, task_id: Uuid) -> Result<TaskView> {
        let task = self.memory.tasks().get(task_id)?;
        Ok(TaskView {
            plans: self.memory.tasks().plans(task_id)?,
            logs: self.memory.tasks().logs(task_id)?,
            cost: self.memory.ledger().total(task_id)?,
            cost_entries: self.memory.ledger().entries(task_id)?,
            task,
        })
    }

    pub fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        Ok(self.memory.tasks().list(filter)?)
    }

    /// Advance a task until it suspends, terminates, or (in step mode)
    /// dispatches one tool.
    pub async fn execute(&self, task_id: Uuid, mode: ExecutionMode) -> Result<RunReport> {
        let _guard = self.locks.acquire(task_id).await?;
        let mut s = self.load(task_id)?;
        ensure_active(&s.task)?;
        self.drive(&mut s, mode).await?;
        Ok(s.finish())
    }

    /// Replace the active plan. A pending confirmation for the old plan is
    /// abandoned. The new plan is not run.
    pub async fn replan(&self, task_id: Uuid, reason: &str) -> Result<Plan> {
        let _guard = self.locks.acquire(task_id).await?;
        let mut s = self.load(task_id)?;
        ensure_active(&s.task)?;
        if s.task.state == TaskState::Init {
            return Err(EngineError::InvalidInput(format!(
                "Task {} has not been planned yet",
                task_id
            )));
        }

        if matches!(
            s.task.suspension.as_ref().map(|x| &x.kind),
            Some(SuspensionKind::AwaitingConfirmation { .. })
        ) {
            self.resume(&mut s, "replanned")?;
        }
        self.replan_in_place(&mut s, reason).await?;
        if s.task.state.is_terminal() {
            return Err(EngineError::TerminalTask(task_id, s.task.state));
        }
        s.task
            .plan
            .clone()
            .ok_or_else(|| EngineError::Corrupt(format!("Task {} has no active plan", task_id)))
    }

    /// Stop a task. Mid-interaction cancellation escalates; anything else
    /// fails the task.
    pub async fn cancel(&self, task_id: Uuid, reason: Option<&str>) -> Result<RunReport> {
        let _guard = self.locks.acquire(task_id).await?;
        let mut s = self.load(task_id)?;
        ensure_active(&s.task)?;

        let reason = reason.unwrap_or("cancelled by user");
        self.log(
            task_id,
            LogEvent::TaskCancelled,
            json!({"reason": reason, "state": s.task.state}),
        )?;
        self.transition(&mut s, Trigger::Cancelled, json!({"reason": reason}))
            .await?;
        Ok(s.finish())
    }

    /// Record the user's decision on a gated step and continue the task.
    pub async fn confirm(
        &self,
        task_id: Uuid,
        confirmation_id: Uuid,
        approved: bool,
    ) -> Result<RunReport> {
        let _guard = self.locks.acquire(task_id).await?;
        let mut s = self.load(task_id)?;
        ensure_active(&s.task)?;

        let confirmation = self
            .memory
            .confirmations()
            .find(confirmation_id)?
            .filter(|c| c.task_id == task_id)
            .ok_or_else(|| EngineError::NotFound(format!("Confirmation {}", confirmation_id)))?;
        let status = if approved {
            ConfirmationStatus::Approved
        } else {
            ConfirmationStatus::Denied
        };
        self.memory.confirmations().decide(confirmation_id, status)?;
        self.log(
            task_id,
            LogEvent::ConfirmationRecorded,
            json!({
                "confirmation_id": confirmation_id,
                "plan_id": confirmation.plan_id,
                "step_index": confirmation.step_index,
                "action": confirmation.action,
                "decision": status,
            }),
        )?;
        info!(task_id = %task_id, confirmation_id = %confirmation_id, decision = %status, "Confirmation recorded");

        let waiting = matches!(
            s.task.suspension.as_ref().map(|x| &x.kind),
            Some(SuspensionKind::AwaitingConfirmation { confirmation_id: c, .. }) if *c == confirmation_id
        );
        if waiting {
            self.resume(&mut s, "confirmation recorded")?;
        }
        self.drive(&mut s, ExecutionMode::Run).await?;
        Ok(s.finish())
    }

    /// Feed an external event (counterpart turn, call status, email reply,
    /// input timeout) into a task and continue it.
    pub async fn handle_event(&self, task_id: Uuid, event: InteractionEvent) -> Result<RunReport> {
        let _guard = self.locks.acquire(task_id).await?;
        let mut s = self.load(task_id)?;
        ensure_active(&s.task)?;
        debug!(task_id = %task_id, kind = event.kind(), state = %s.task.state, "Interaction event");

        match event {
            InteractionEvent::Turn { text } => self.on_turn(&mut s, &text, "call").await?,
            InteractionEvent::EmailReply { body, .. } => {
                self.on_turn(&mut s, &body, "email").await?
            }
            InteractionEvent::CallStatus { status } => self.on_call_status(&mut s, status).await?,
            InteractionEvent::InputTimeout => self.on_input_timeout(&mut s).await?,
        }
        self.drive(&mut s, ExecutionMode::Run).await?;
        Ok(s.finish())
    }

    /// Realign a task's stored state with its log after a crash.
    pub async fn recover(&self, task_id: Uuid) -> Result<Option<TaskState>> {
        let _guard = self.locks.acquire(task_id).await?;
        let repaired = self.memory.tasks().recover(task_id)?;
        if let Some(state) = repaired {
            warn!(task_id = %task_id, state = %state, "Recovered task state from log");
            self.memory.forget_working(task_id);
        }
        Ok(repaired)
    }

    /// Run `recover` over every unfinished task. Returns how many were
    /// repaired.
    pub async fn recover_all(&self) -> Result<usize> {
        let mut repaired = 0;
        for task in self.memory.tasks().unfinished()? {
            match self.recover(task.id).await {
                Ok(Some(_)) => repaired += 1,
                Ok(None) => {}
                Err(e) => warn!(task_id = %task.id, error = %e, "Recovery failed"),
            }
        }
        Ok(repaired)
    }

    /// Periodic housekeeping: expire stale confirmations, resume tasks
    /// whose confirmation was settled, time out input waits, and drop
    /// expired working contexts and idle locks.
    pub async fn sweep(&self) -> Result<SweepReport> {
        let mut report = SweepReport {
            expired_confirmations: self
                .memory
                .confirmations()
                .expire_stale(self.config.governor.confirmation_timeout_secs)?,
            ..SweepReport::default()
        };

        for task in self.memory.tasks().suspended()? {
            let Some(suspension) = task.suspension else {
                continue;
            };
            let outcome = match suspension.kind {
                SuspensionKind::AwaitingConfirmation {
                    confirmation_id, ..
                } => {
                    let settled = self
                        .memory
                        .confirmations()
                        .find(confirmation_id)?
                        .map_or(true, |c| c.status != ConfirmationStatus::Pending);
                    if !settled {
                        continue;
                    }
                    let outcome = self.execute(task.id, ExecutionMode::Run).await;
                    if outcome.is_ok() {
                        report.resumed += 1;
                    }
                    outcome
                }
                SuspensionKind::AwaitingInput => {
                    let due = task.state == TaskState::AwaitingUserInput
                        && suspension.since.elapsed_secs()
                            >= self.config.monitor.input_timeout_secs;
                    if !due {
                        continue;
                    }
                    let outcome = self
                        .handle_event(task.id, InteractionEvent::InputTimeout)
                        .await;
                    if outcome.is_ok() {
                        report.input_timeouts += 1;
                    }
                    outcome
                }
            };
            match outcome {
                Ok(_) => {}
                Err(EngineError::LockContention(_)) => {
                    debug!(task_id = %task.id, "Task busy, sweeping next round");
                }
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "Sweep failed for task");
                    report.errors += 1;
                }
            }
        }

        report.purged_contexts = self.memory.purge_working();
        report.pruned_locks = self.locks.prune();
        debug!(?report, "Sweep finished");
        Ok(report)
    }

    // =========================================================================
    // Run loop
    // =========================================================================

    fn load(&self, task_id: Uuid) -> Result<Session> {
        let task = self.memory.tasks().get(task_id)?;
        let user = self.get_user(task.user_id)?;
        let working = self.memory.working_context(&task)?;
        Ok(Session {
            task,
            user,
            working,
            steps_executed: 0,
            transitions: Vec::new(),
        })
    }

    async fn drive(&self, s: &mut Session, mode: ExecutionMode) -> Result<()> {
        let max = self.config.engine.max_iterations_per_run;
        let mut iterations = 0u32;

        while !s.task.state.is_terminal() {
            if !self.ready_to_run(s)? {
                break;
            }
            if iterations >= max {
                warn!(task_id = %s.task.id, iterations, "Run exceeded iteration limit");
                self.transition(
                    s,
                    Trigger::Escalate,
                    json!({"reason": format!("no progress after {} iterations", iterations)}),
                )
                .await?;
                break;
            }
            iterations += 1;

            match self.tick(s).await? {
                Tick::Stepped if mode == ExecutionMode::Step => break,
                Tick::Halted => break,
                Tick::Stepped | Tick::Advanced => {}
            }
        }
        Ok(())
    }

    /// False while the task is parked. A confirmation that has been decided
    /// or expired releases the task.
    fn ready_to_run(&self, s: &mut Session) -> Result<bool> {
        let Some(suspension) = s.task.suspension.as_ref() else {
            return Ok(true);
        };
        match suspension.kind {
            SuspensionKind::AwaitingInput => Ok(false),
            SuspensionKind::AwaitingConfirmation {
                confirmation_id, ..
            } => {
                let pending = self
                    .memory
                    .confirmations()
                    .find(confirmation_id)?
                    .is_some_and(|c| c.status == ConfirmationStatus::Pending);
                if pending {
                    return Ok(false);
                }
                self.resume(s, "confirmation settled")?;
                Ok(true)
            }
        }
    }

    async fn tick(&self, s: &mut Session) -> Result<Tick> {
        let state = s.task.state;
        match state {
            TaskState::Init => return self.intake(s).await,
            TaskState::AwaitingUserInput => {
                self.suspend(s, SuspensionKind::AwaitingInput)?;
                return Ok(Tick::Halted);
            }
            _ => {}
        }

        let next = match s.task.plan.as_ref() {
            Some(plan) => plan.next_unsettled(state),
            None => {
                return Err(EngineError::Corrupt(format!(
                    "Task {} is in {} without a plan",
                    s.task.id, state
                )))
            }
        };
        match next {
            Some(index) => self.run_step(s, index).await,
            None => self.complete_phase(s).await,
        }
    }

    async fn intake(&self, s: &mut Session) -> Result<Tick> {
        let outcome = match self
            .planner
            .plan(
                self.collaborators.reasoning.as_ref(),
                &s.task,
                &s.user,
                &s.working,
                None,
            )
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(task_id = %s.task.id, error = %e, "Intake failed");
                self.log(
                    s.task.id,
                    LogEvent::FailureDetected,
                    json!({"stage": "intake", "error": e.to_string()}),
                )?;
                self.transition(s, Trigger::IntakeError, json!({"reason": e.to_string()}))
                    .await?;
                return Ok(Tick::Halted);
            }
        };

        if outcome.low_confidence {
            let reason = format!(
                "intent {} classified with confidence {:.2}, below {:.2}",
                outcome.plan.intent,
                outcome.plan.intent_confidence,
                self.planner.config().intent_confidence_threshold
            );
            self.transition(s, Trigger::Escalate, json!({"reason": reason}))
                .await?;
            return Ok(Tick::Halted);
        }

        let plan = outcome.plan;
        self.memory.tasks().install_plan(&plan)?;
        self.log(
            s.task.id,
            LogEvent::IntentConfirmed,
            json!({
                "intent": plan.intent,
                "confidence": plan.intent_confidence,
                "plan_id": plan.id,
                "tokens": outcome.tokens,
                "context": outcome.context,
            }),
        )?;
        s.working.merge(&outcome.context);
        let plan_id = plan.id;
        self.adopt_plan(s, plan);
        self.transition(s, Trigger::IntentConfirmed, json!({"plan_id": plan_id}))
            .await?;
        Ok(Tick::Advanced)
    }

    fn adopt_plan(&self, s: &mut Session, plan: Plan) {
        s.working.plan = Some(plan.clone());
        s.task.plan = Some(plan);
        self.memory.save_working(&s.working);
    }

    // =========================================================================
    // Steps
    // =========================================================================

    async fn run_step(&self, s: &mut Session, index: usize) -> Result<Tick> {
        let plan_id = s.plan_id()?;
        let step = s
            .task
            .plan
            .as_ref()
            .and_then(|p| p.step(index))
            .cloned()
            .ok_or_else(|| EngineError::Corrupt(format!("Plan {} has no step {}", plan_id, index)))?;

        if step.status == StepStatus::InProgress {
            let idempotent = self
                .orchestrator
                .registry()
                .descriptor(step.action)
                .is_some_and(|d| d.idempotent);
            if !idempotent {
                warn!(
                    task_id = %s.task.id,
                    step_index = index,
                    action = %step.action,
                    "Found interrupted step with unknown outcome"
                );
                let err = ToolError::external("interrupted before its outcome was recorded", false);
                return self.settle_failure(s, &step, err).await;
            }
            debug!(task_id = %s.task.id, step_index = index, "Re-running interrupted idempotent step");
        }

        let preparation =
            self.orchestrator
                .prepare(&s.task, plan_id, &step, &s.working, &self.memory)?;
        let prepared = match preparation {
            Preparation::Ready(prepared) => prepared,
            Preparation::Outcome(outcome) => return self.settle(s, &step, outcome).await,
        };

        let attempt = self.update_step(s, index, StepStatus::InProgress, None)?;
        self.log(
            s.task.id,
            LogEvent::ToolInvoked,
            json!({
                "plan_id": plan_id,
                "step_index": index,
                "subtask": step.subtask,
                "action": step.action,
                "description": prepared.description,
                "attempt": attempt,
            }),
        )?;

        let outcome = {
            let ctx = ToolContext {
                task: &s.task,
                user: &s.user,
                working: &s.working,
                memory: &self.memory,
                collaborators: &self.collaborators,
            };
            self.orchestrator
                .invoke(&prepared, &ctx, plan_id, index)
                .await
        };
        s.steps_executed += 1;
        self.settle(s, &step, outcome).await
    }

    async fn settle(&self, s: &mut Session, step: &PlanStep, outcome: StepOutcome) -> Result<Tick> {
        let plan_id = s.plan_id()?;
        match outcome {
            StepOutcome::Completed {
                result, context, ..
            } => {
                // The log carries the context; write it before the step row.
                self.log(
                    s.task.id,
                    LogEvent::ToolResult,
                    json!({
                        "plan_id": plan_id,
                        "step_index": step.index,
                        "action": step.action,
                        "result": result,
                        "context": context,
                    }),
                )?;
                s.working.merge(&context);
                // A dialed call only counts as a success once it concludes.
                if step.subtask != Subtask::PlaceCall {
                    self.monitor.record_success(&mut s.task.monitor, step.subtask);
                }
                self.update_step(
                    s,
                    step.index,
                    StepStatus::Completed,
                    Some(redact_value(&result)),
                )?;
                Ok(Tick::Stepped)
            }
            StepOutcome::AwaitingConfirmation {
                confirmation_id,
                reason,
                created,
            } => {
                if created {
                    self.log(
                        s.task.id,
                        LogEvent::ConfirmationRequested,
                        json!({
                            "confirmation_id": confirmation_id,
                            "plan_id": plan_id,
                            "step_index": step.index,
                            "action": step.action,
                            "reason": reason,
                        }),
                    )?;
                }
                self.suspend(
                    s,
                    SuspensionKind::AwaitingConfirmation {
                        confirmation_id,
                        step_index: step.index,
                    },
                )?;
                Ok(Tick::Halted)
            }
            StepOutcome::Failed(err) => self.settle_failure(s, step, err).await,
        }
    }

    async fn settle_failure(&self, s: &mut Session, step: &PlanStep, err: ToolError) -> Result<Tick> {
        warn!(
            task_id = %s.task.id,
            step_index = step.index,
            action = %step.action,
            kind = err.kind(),
            error = %err,
            "Step failed"
        );
        self.update_step(
            s,
            step.index,
            StepStatus::Failed,
            Some(json!({"error": err.to_string(), "kind": err.kind()})),
        )?;
        self.log(
            s.task.id,
            LogEvent::ToolFailed,
            json!({
                "plan_id": s.plan_id()?,
                "step_index": step.index,
                "action": step.action,
                "error": err.to_string(),
                "kind": err.kind(),
            }),
        )?;
        self.handle_tool_failure(s, step.subtask, err).await
    }

    /// Set a step's status and persist the task. Returns the step's attempt
    /// count.
    fn update_step(
        &self,
        s: &mut Session,
        index: usize,
        status: StepStatus,
        result: Option<Value>,
    ) -> Result<u32> {
        let task_id = s.task.id;
        let step = s
            .task
            .plan
            .as_mut()
            .and_then(|p| p.step_mut(index))
            .ok_or_else(|| EngineError::Corrupt(format!("Task {} has no step {}", task_id, index)))?;
        step.status = status;
        if status == StepStatus::InProgress {
            step.attempts += 1;
        }
        if result.is_some() {
            step.result = result;
        }
        let attempts = step.attempts;

        s.task.updated_at = Timestamp::now();
        s.working.plan = s.task.plan.clone();
        self.memory.tasks().save(&s.task)?;
        self.memory.save_working(&s.working);
        Ok(attempts)
    }

    // =========================================================================
    // Failure handling and replanning
    // =========================================================================

    async fn handle_tool_failure(
        &self,
        s: &mut Session,
        subtask: Subtask,
        err: ToolError,
    ) -> Result<Tick> {
        let reason = err.to_string();
        self.log(
            s.task.id,
            LogEvent::FailureDetected,
            json!({"stage": "tool", "subtask": subtask, "error": reason, "kind": err.kind()}),
        )?;

        let state = s.task.state;
        let trigger = match &err {
            ToolError::Unrecoverable(_) => Some(Trigger::CriticalError),
            // Transient summary failures go through the monitor like any other.
            ToolError::Validation(_) if state == TaskState::Summarize => {
                Some(Trigger::SummaryFailed)
            }
            ToolError::Validation(_) if state == TaskState::ReadyToExecute => {
                Some(Trigger::ToolValidationRejected)
            }
            _ => None,
        };
        if let Some(trigger) = trigger {
            self.transition(s, trigger, json!({"reason": reason})).await?;
            return Ok(Tick::Halted);
        }

        let verdict = self
            .monitor
            .record_failure(&mut s.task.monitor, subtask, &reason);
        self.memory.tasks().save(&s.task)?;
        self.apply_verdict(s, verdict).await
    }

    async fn apply_verdict(&self, s: &mut Session, verdict: Verdict) -> Result<Tick> {
        match verdict {
            Verdict::Escalate(reason) => {
                self.transition(s, Trigger::Escalate, json!({"reason": reason}))
                    .await?;
                Ok(Tick::Halted)
            }
            Verdict::Replan(reason) => self.replan_in_place(s, &reason).await,
        }
    }

    /// Install the next plan version without changing state. A planning
    /// failure ends the task through the current phase's dead end.
    async fn replan_in_place(&self, s: &mut Session, reason: &str) -> Result<Tick> {
        let planned = self
            .planner
            .plan(
                self.collaborators.reasoning.as_ref(),
                &s.task,
                &s.user,
                &s.working,
                Some(reason),
            )
            .await;

        match planned {
            Ok(outcome) => {
                self.memory.tasks().install_plan(&outcome.plan)?;
                info!(
                    task_id = %s.task.id,
                    version = outcome.plan.version,
                    steps = outcome.plan.steps.len(),
                    reason,
                    "Plan replaced"
                );
                s.task.monitor.replans += 1;
                s.task.updated_at = Timestamp::now();
                self.adopt_plan(s, outcome.plan);
                self.memory.tasks().save(&s.task)?;
                Ok(Tick::Advanced)
            }
            Err(e) => {
                warn!(task_id = %s.task.id, error = %e, "Replanning failed");
                self.log(
                    s.task.id,
                    LogEvent::FailureDetected,
                    json!({"stage": "planning", "error": e.to_string()}),
                )?;
                let trigger = match s.task.state {
                    TaskState::Init => Trigger::IntakeError,
                    TaskState::GatherInfo => Trigger::GatheringExhausted,
                    TaskState::Research => Trigger::NoValidContact,
                    _ => Trigger::Escalate,
                };
                self.transition(s, trigger, json!({"reason": e.to_string()}))
                    .await?;
                Ok(Tick::Halted)
            }
        }
    }

    // =========================================================================
    // Phase completion
    // =========================================================================

    async fn complete_phase(&self, s: &mut Session) -> Result<Tick> {
        match s.task.state {
            TaskState::GatherInfo => {
                if s.var_flag("credential_required") && !s.working.has_var("credential_id") {
                    self.transition(
                        s,
                        Trigger::GatheringExhausted,
                        json!({"reason": "credentials are required but none are on file"}),
                    )
                    .await?;
                    return Ok(Tick::Halted);
                }
                self.transition(s, Trigger::RequiredDataPresent, json!({}))
                    .await?;
                Ok(Tick::Advanced)
            }
            TaskState::Research => self.conclude_research(s).await,
            TaskState::ReadyToExecute => {
                let channel = s.working.vars.get("interaction_channel").cloned();
                self.transition(s, Trigger::FirstToolDispatched, json!({"channel": channel}))
                    .await?;
                Ok(Tick::Advanced)
            }
            TaskState::CallInProgress => self.check_interaction(s).await,
            TaskState::Summarize => {
                self.transition(s, Trigger::SummaryDelivered, json!({}))
                    .await?;
                Ok(Tick::Halted)
            }
            state => Err(EngineError::Corrupt(format!(
                "Task {} has no phase work in {}",
                s.task.id, state
            ))),
        }
    }

    async fn conclude_research(&self, s: &mut Session) -> Result<Tick> {
        let contact = s
            .working
            .var_str("contact_number")
            .or_else(|| s.working.var_str("contact_email"))
            .map(str::to_string);
        if let Some(contact) = contact {
            self.transition(s, Trigger::ValidContactFound, json!({"contact": contact}))
                .await?;
            return Ok(Tick::Advanced);
        }

        s.task.monitor.research_attempts += 1;
        let attempts = s.task.monitor.research_attempts;
        if attempts >= self.planner.config().max_research_attempts {
            self.transition(
                s,
                Trigger::NoValidContact,
                json!({"reason": format!("no usable contact after {} research attempts", attempts)}),
            )
            .await?;
            return Ok(Tick::Halted);
        }
        self.memory.tasks().save(&s.task)?;
        self.replan_in_place(s, "no usable contact found").await
    }

    /// All interaction steps ran: conclude, or wait for the counterpart.
    async fn check_interaction(&self, s: &mut Session) -> Result<Tick> {
        if s.var_flag("interaction_concluded") {
            return self.enter_summarize(s, None).await;
        }

        if let Some(call_id) = s.working.var_str("call_id").map(str::to_string) {
            let handle = CallHandle { id: call_id };
            match self.collaborators.telephony.call_status(&handle).await {
                Ok(CallStatus::Completed) => return self.enter_summarize(s, None).await,
                Ok(CallStatus::Failed) => return self.call_failed(s).await,
                Ok(status) => debug!(task_id = %s.task.id, status = %status, "Call still live"),
                Err(e) => warn!(task_id = %s.task.id, error = %e, "Call status unavailable"),
            }
        }

        self.transition(s, Trigger::AwaitingCounterpart, json!({}))
            .await?;
        self.suspend(s, SuspensionKind::AwaitingInput)?;
        Ok(Tick::Halted)
    }

    /// Close the interaction, compose the summary and move to SUMMARIZE.
    async fn enter_summarize(&self, s: &mut Session, reference: Option<String>) -> Result<Tick> {
        let mut context = self.close_call(s).await;
        context.insert("interaction_concluded".into(), json!(true));
        if let Some(reference) = reference {
            context.insert("confirmation_reference".into(), json!(reference));
        }
        s.working.merge(&Value::Object(context.clone()));
        context.insert("summary".into(), json!(compose_summary(&s.task, &s.working)));
        self.monitor
            .record_success(&mut s.task.monitor, Subtask::PlaceCall);

        let trigger = if s.task.state == TaskState::AwaitingUserInput {
            Trigger::InputSignalsCompletion
        } else {
            Trigger::InteractionConcluded
        };
        self.transition(s, trigger, json!({"context": context}))
            .await?;
        Ok(Tick::Advanced)
    }

    /// Hang up a live call and bill its duration. Returns the context
    /// updates that retire the call.
    async fn close_call(&self, s: &mut Session) -> Map<String, Value> {
        let mut updates = Map::new();
        let Some(call_id) = s.working.var_str("call_id").map(str::to_string) else {
            return updates;
        };

        let handle = CallHandle {
            id: call_id.clone(),
        };
        if let Err(e) = self.collaborators.telephony.hang_up(&handle).await {
            warn!(task_id = %s.task.id, call_id = %call_id, error = %e, "Hang-up failed");
        }

        let started = s.working.vars.get("call_started_at").and_then(Value::as_i64);
        if let (Some(started), Some(plan)) = (started, s.task.plan.as_ref()) {
            let step_index = plan
                .steps
                .iter()
                .find(|st| st.action == ActionKind::PlaceCall)
                .map_or(0, |st| st.index);
            let usage = Usage {
                duration_secs: Timestamp(started).elapsed_secs() as f64,
                ..Usage::default()
            };
            self.orchestrator.record_cost(
                &self.memory,
                s.task.id,
                plan.id,
                step_index,
                ActionKind::PlaceCall,
                usage,
            );
        }
        info!(task_id = %s.task.id, call_id = %call_id, "Call closed");

        updates.insert("call_id".into(), Value::Null);
        updates.insert("call_started_at".into(), Value::Null);
        updates.insert("last_call_id".into(), json!(call_id));
        s.working.merge(&Value::Object(updates.clone()));
        updates
    }

    /// The call dropped: redial through RESEARCH unless the failure budget
    /// is spent.
    async fn call_failed(&self, s: &mut Session) -> Result<Tick> {
        let verdict =
            self.monitor
                .record_failure(&mut s.task.monitor, Subtask::PlaceCall, "call dropped");
        let reason = match verdict {
            Verdict::Escalate(_) => return self.apply_verdict(s, verdict).await,
            Verdict::Replan(reason) => reason,
        };

        self.reopen(s).await?;
        let context = self.close_call(s).await;
        self.transition(
            s,
            Trigger::ContactInvalid,
            json!({"reason": reason, "redial": true, "context": context}),
        )
        .await?;
        self.replan_in_place(s, &reason).await
    }

    // =========================================================================
    // Interaction events
    // =========================================================================

    async fn on_turn(&self, s: &mut Session, text: &str, channel: &str) -> Result<()> {
        if !s.task.state.is_interactive() {
            return Err(EngineError::InvalidInput(format!(
                "Task {} is not in an interaction ({})",
                s.task.id, s.task.state
            )));
        }
        let text = text.trim();
        if text.is_empty() {
            return Err(EngineError::InvalidInput("Turn text must not be empty".into()));
        }

        s.working.transcript.push(TranscriptTurn {
            speaker: Speaker::Counterpart,
            text: text.to_string(),
            at: Timestamp::now(),
        });
        let signal = self.monitor.classify_turn(text);
        let looping = matches!(signal, TurnSignal::Continue | TurnSignal::Confusion)
            && self.monitor.detect_loop(&s.working.transcript);
        let stalled = looping || signal == TurnSignal::Confusion;

        let mut context = Map::new();
        if let TurnSignal::Completion {
            reference: Some(reference),
        } = &signal
        {
            context.insert("confirmation_reference".into(), json!(reference));
        }
        self.log(
            s.task.id,
            LogEvent::InteractionTurn,
            json!({
                "channel": channel,
                "speaker": Speaker::Counterpart,
                "signal": signal_name(&signal),
                "looping": looping,
                "chars": text.chars().count(),
                "context": context,
            }),
        )?;
        self.memory.save_working(&s.working);
        self.resume(s, "counterpart input")?;

        match signal {
            TurnSignal::Completion { reference } => {
                self.enter_summarize(s, reference).await?;
            }
            TurnSignal::MissingCredential => {
                let reason = "counterpart asked for account credentials";
                self.reopen(s).await?;
                let mut context = self.close_call(s).await;
                context.insert("credential_required".into(), json!(true));
                context.insert("credentials_checked".into(), Value::Null);
                self.transition(
                    s,
                    Trigger::MissingCredential,
                    json!({"reason": reason, "context": context}),
                )
                .await?;
                self.replan_in_place(s, reason).await?;
            }
            TurnSignal::InvalidContact => {
                let reason = "counterpart says this is the wrong contact";
                self.reopen(s).await?;
                let mut invalid = s.working.var_list("invalid_contacts");
                if let Some(number) = s.working.var_str("contact_number") {
                    invalid.push(number.to_string());
                }
                let mut context = self.close_call(s).await;
                context.insert("invalid_contacts".into(), json!(invalid));
                context.insert("contact_number".into(), Value::Null);
                context.insert("contact_source".into(), Value::Null);
                self.transition(
                    s,
                    Trigger::ContactInvalid,
                    json!({"reason": reason, "context": context}),
                )
                .await?;
                self.replan_in_place(s, reason).await?;
            }
            TurnSignal::Confusion | TurnSignal::Continue if stalled => {
                let reason = if looping {
                    "conversation is going in circles"
                } else {
                    "counterpart did not understand the request"
                };
                let verdict =
                    self.monitor
                        .record_failure(&mut s.task.monitor, Subtask::RequestAction, reason);
                self.memory.tasks().save(&s.task)?;
                if let Verdict::Replan(_) = verdict {
                    self.reopen(s).await?;
                }
                self.apply_verdict(s, verdict).await?;
            }
            TurnSignal::Confusion | TurnSignal::Continue => {
                self.reopen(s).await?;
            }
        }
        Ok(())
    }

    async fn on_call_status(&self, s: &mut Session, status: CallStatus) -> Result<()> {
        if !s.task.state.is_interactive() {
            debug!(task_id = %s.task.id, status = %status, "Ignoring call status outside an interaction");
            return Ok(());
        }
        match status {
            CallStatus::Completed => {
                self.resume(s, "call completed")?;
                self.enter_summarize(s, None).await?;
            }
            CallStatus::Failed => {
                self.resume(s, "call failed")?;
                self.call_failed(s).await?;
            }
            CallStatus::Ringing | CallStatus::InProgress => {}
        }
        Ok(())
    }

    async fn on_input_timeout(&self, s: &mut Session) -> Result<()> {
        if s.task.state != TaskState::AwaitingUserInput {
            debug!(task_id = %s.task.id, state = %s.task.state, "Input timeout no longer applies");
            return Ok(());
        }
        self.resume(s, "input timeout")?;
        s.task.monitor.input_timeouts += 1;
        let count = s.task.monitor.input_timeouts;
        let max = self.monitor.config().max_input_timeouts;
        self.log(
            s.task.id,
            LogEvent::FailureDetected,
            json!({"stage": "interaction", "error": "input timeout", "count": count}),
        )?;

        if count < max {
            let reason = format!("no counterpart input, retrying ({}/{})", count, max);
            let context = self.close_call(s).await;
            self.transition(
                s,
                Trigger::InputTimeoutRetry,
                json!({"reason": reason, "context": context}),
            )
            .await?;
            self.replan_in_place(s, &reason).await?;
        } else {
            self.transition(
                s,
                Trigger::InputTimeoutExhausted,
                json!({"reason": format!("no counterpart input after {} timeouts", count)}),
            )
            .await?;
        }
        Ok(())
    }

    /// Leave AWAITING_USER_INPUT for CALL_IN_PROGRESS.
    async fn reopen(&self, s: &mut Session) -> Result<()> {
        if s.task.state == TaskState::AwaitingUserInput {
            self.transition(s, Trigger::InputReceived, json!({})).await?;
        }
        Ok(())
    }

    // =========================================================================
    // Transitions, suspension and logging
    // =========================================================================

    /// Fire `trigger`, persisting the transition atomically with its log
    /// entry. `detail.context`, if present, is merged into the working
    /// context once committed.
    async fn transition(&self, s: &mut Session, trigger: Trigger, detail: Value) -> Result<()> {
        let from = s.task.state;
        let to = next_state(from, trigger)?;
        validate_transition(from, to)?;

        s.task.state = to;
        s.task.updated_at = Timestamp::now();
        let suspension = if to.is_terminal() {
            s.task.suspension.take()
        } else {
            None
        };
        if let Err(e) =
            self.memory
                .tasks()
                .commit_transition(&s.task, from, trigger.as_str(), detail.clone())
        {
            s.task.state = from;
            if suspension.is_some() {
                s.task.suspension = suspension;
            }
            return Err(e.into());
        }
        info!(task_id = %s.task.id, from = %from, to = %to, trigger = %trigger, "State transition");

        if let Some(updates) = detail.get("context") {
            s.working.merge(updates);
        }
        s.working.plan = s.task.plan.clone();
        s.transitions.push(TransitionRecord { from, to, trigger });

        if to.is_terminal() {
            self.finalize(s, from, trigger, &detail).await?;
        } else {
            self.memory.save_working(&s.working);
        }
        Ok(())
    }

    async fn finalize(
        &self,
        s: &mut Session,
        from: TaskState,
        trigger: Trigger,
        detail: &Value,
    ) -> Result<()> {
        let task_id = s.task.id;
        let reason = detail
            .get("reason")
            .and_then(Value::as_str)
            .unwrap_or(trigger.as_str())
            .to_string();

        match s.task.state {
            TaskState::Completed => {
                let cost = self.memory.ledger().total(task_id)?;
                self.log(
                    task_id,
                    LogEvent::TaskCompleted,
                    json!({
                        "summary": s.working.vars.get("summary"),
                        "confirmation_reference": s.working.vars.get("confirmation_reference"),
                        "cost": cost,
                    }),
                )?;
                info!(task_id = %task_id, cost, "Task completed");
            }
            state => {
                self.close_call(s).await;
                let event = if state == TaskState::Failed {
                    LogEvent::TaskFailed
                } else {
                    LogEvent::TaskEscalated
                };
                self.log(
                    task_id,
                    event,
                    json!({"from": from, "trigger": trigger, "reason": reason}),
                )?;
                warn!(task_id = %task_id, state = %state, reason = %reason, "Task ended without completing");
                self.notify_user(s, &reason).await?;
            }
        }
        self.memory.forget_working(task_id);
        Ok(())
    }

    /// Email the user why the task stopped and what was tried.
    async fn notify_user(&self, s: &Session, reason: &str) -> Result<()> {
        let title = s
            .working
            .var_str("task_title")
            .map(str::to_string)
            .unwrap_or_else(|| truncate(&s.task.goal, TITLE_CHARS));
        let failed = s.task.state == TaskState::Failed;
        let subject = if failed {
            format!("Task failed: {}", title)
        } else {
            format!("Task needs your attention: {}", title)
        };

        let attempted: Vec<String> = self
            .memory
            .tasks()
            .logs(s.task.id)?
            .into_iter()
            .filter(|e| e.event == LogEvent::ToolInvoked)
            .filter_map(|e| {
                e.payload
                    .get("description")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .collect();

        let mut body = format!(
            "Hi {},\n\nYour request \"{}\" {}.\nReason: {}\n",
            s.user.name,
            s.task.goal,
            if failed {
                "could not be completed"
            } else {
                "needs your attention"
            },
            reason
        );
        if !attempted.is_empty() {
            body.push_str("\nActions taken:\n");
            for action in &attempted {
                body.push_str(&format!("- {}\n", action));
            }
        }

        match self
            .collaborators
            .mail
            .send(&s.user.email, &subject, &body)
            .await
        {
            Ok(()) => {
                self.log(
                    s.task.id,
                    LogEvent::UserNotified,
                    json!({
                        "channel": "email",
                        "to": s.user.email,
                        "subject": subject,
                        "state": s.task.state,
                    }),
                )?;
            }
            Err(e) => warn!(task_id = %s.task.id, error = %e, "Failed to notify user"),
        }
        Ok(())
    }

    fn suspend(&self, s: &mut Session, kind: SuspensionKind) -> Result<()> {
        if s.task.suspension.as_ref().is_some_and(|x| x.kind == kind) {
            return Ok(());
        }
        s.task.suspension = Some(Suspension {
            kind: kind.clone(),
            since: Timestamp::now(),
        });
        s.task.updated_at = Timestamp::now();
        self.memory.tasks().save(&s.task)?;
        self.log(
            s.task.id,
            LogEvent::TaskSuspended,
            json!({"state": s.task.state, "suspension": kind}),
        )?;
        info!(task_id = %s.task.id, state = %s.task.state, "Task suspended");
        Ok(())
    }

    fn resume(&self, s: &mut Session, reason: &str) -> Result<()> {
        let Some(previous) = s.task.suspension.take() else {
            return Ok(());
        };
        s.task.updated_at = Timestamp::now();
        self.memory.tasks().save(&s.task)?;
        self.log(
            s.task.id,
            LogEvent::TaskResumed,
            json!({
                "reason": reason,
                "suspension": previous.kind,
                "waited_secs": previous.since.elapsed_secs(),
            }),
        )?;
        debug!(task_id = %s.task.id, reason, "Task resumed");
        Ok(())
    }

    fn log(&self, task_id: Uuid, event: LogEvent, payload: Value) -> Result<()> {
        self.memory.tasks().append_log(task_id, event, payload)?;
        Ok(())
    }
}
