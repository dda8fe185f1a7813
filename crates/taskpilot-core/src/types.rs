//! Domain types shared by storage, memory, engine and API crates.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::TaskPilotError;

// =============================================================================
// Timestamp
// =============================================================================

/// Unix timestamp in seconds (UTC).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub fn now() -> Self {
        Self(Utc::now().timestamp())
    }

    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt.timestamp())
    }

    pub fn to_datetime(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.0, 0).unwrap_or_default()
    }

    /// Seconds elapsed since this timestamp (never negative).
    pub fn elapsed_secs(&self) -> u64 {
        (Timestamp::now().0 - self.0).max(0) as u64
    }
}

// =============================================================================
// Task lifecycle
// =============================================================================

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Init,
    GatherInfo,
    Research,
    ReadyToExecute,
    CallInProgress,
    AwaitingUserInput,
    Summarize,
    Completed,
    Failed,
    Escalated,
}

impl TaskState {
    pub const ALL: [TaskState; 10] = [
        TaskState::Init,
        TaskState::GatherInfo,
        TaskState::Research,
        TaskState::ReadyToExecute,
        TaskState::CallInProgress,
        TaskState::AwaitingUserInput,
        TaskState::Summarize,
        TaskState::Completed,
        TaskState::Failed,
        TaskState::Escalated,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Init => "init",
            TaskState::GatherInfo => "gather_info",
            TaskState::Research => "research",
            TaskState::ReadyToExecute => "ready_to_execute",
            TaskState::CallInProgress => "call_in_progress",
            TaskState::AwaitingUserInput => "awaiting_user_input",
            TaskState::Summarize => "summarize",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Escalated => "escalated",
        }
    }

    /// COMPLETED, FAILED and ESCALATED have no outgoing transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Escalated
        )
    }

    /// States in which a live interaction (call or email thread) is open.
    pub fn is_interactive(&self) -> bool {
        matches!(self, TaskState::CallInProgress | TaskState::AwaitingUserInput)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = TaskPilotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskState::ALL
            .iter()
            .copied()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| TaskPilotError::InvalidInput(format!("Unknown task state: {}", s)))
    }
}

/// Priority attached to a task at intake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

impl TaskPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPriority::Low => "low",
            TaskPriority::Medium => "medium",
            TaskPriority::High => "high",
            TaskPriority::Urgent => "urgent",
        }
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskPriority {
    type Err = TaskPilotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(TaskPriority::Low),
            "medium" => Ok(TaskPriority::Medium),
            "high" => Ok(TaskPriority::High),
            "urgent" => Ok(TaskPriority::Urgent),
            other => Err(TaskPilotError::InvalidInput(format!(
                "Unknown priority: {}",
                other
            ))),
        }
    }
}

// =============================================================================
// Actions and plans
// =============================================================================

/// Closed set of actions a plan step can dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    RetrieveCredentials,
    RecallMemory,
    WebSearch,
    PlaceCall,
    SendText,
    SendEmail,
    NotifyUser,
    Remember,
}

impl ActionKind {
    pub const ALL: [ActionKind; 8] = [
        ActionKind::RetrieveCredentials,
        ActionKind::RecallMemory,
        ActionKind::WebSearch,
        ActionKind::PlaceCall,
        ActionKind::SendText,
        ActionKind::SendEmail,
        ActionKind::NotifyUser,
        ActionKind::Remember,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::RetrieveCredentials => "retrieve_credentials",
            ActionKind::RecallMemory => "recall_memory",
            ActionKind::WebSearch => "web_search",
            ActionKind::PlaceCall => "place_call",
            ActionKind::SendText => "send_text",
            ActionKind::SendEmail => "send_email",
            ActionKind::NotifyUser => "notify_user",
            ActionKind::Remember => "remember",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionKind {
    type Err = TaskPilotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ActionKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| TaskPilotError::InvalidInput(format!("Unknown action: {}", s)))
    }
}

/// Intermediate level of the plan hierarchy: goal -> subtask -> step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Subtask {
    RetrieveCredentials,
    RecallHistory,
    ResearchContact,
    PlaceCall,
    Authenticate,
    RequestAction,
    SendEmail,
    NotifyUser,
    PersistRecord,
}

impl Subtask {
    pub fn as_str(&self) -> &'static str {
        match self {
            Subtask::RetrieveCredentials => "retrieve_credentials",
            Subtask::RecallHistory => "recall_history",
            Subtask::ResearchContact => "research_contact",
            Subtask::PlaceCall => "place_call",
            Subtask::Authenticate => "authenticate",
            Subtask::RequestAction => "request_action",
            Subtask::SendEmail => "send_email",
            Subtask::NotifyUser => "notify_user",
            Subtask::PersistRecord => "persist_record",
        }
    }
}

impl fmt::Display for Subtask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution status of a single plan step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn is_settled(&self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Failed)
    }
}

/// One planned tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub index: usize,
    pub subtask: Subtask,
    /// State in which this step is dispatched.
    pub phase: TaskState,
    pub action: ActionKind,
    pub arguments: Value,
    pub confidence: f64,
    pub status: StepStatus,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

/// An immutable, versioned sequence of steps.
///
/// After creation only step status, attempts and result change, and only
/// while the plan is the task's active plan. A replan writes a new version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: Uuid,
    pub task_id: Uuid,
    pub version: u32,
    pub intent: String,
    pub intent_confidence: f64,
    /// Failure reason that seeded this plan, if it came from a replan.
    pub reason: Option<String>,
    pub steps: Vec<PlanStep>,
    pub created_at: Timestamp,
    #[serde(default)]
    pub superseded_at: Option<Timestamp>,
}

impl Plan {
    /// Index of the first unsettled step for the given phase.
    pub fn next_unsettled(&self, phase: TaskState) -> Option<usize> {
        self.steps
            .iter()
            .find(|s| s.phase == phase && !s.status.is_settled())
            .map(|s| s.index)
    }

    /// True when every step of the phase completed (vacuously true if none).
    pub fn phase_complete(&self, phase: TaskState) -> bool {
        self.steps
            .iter()
            .filter(|s| s.phase == phase)
            .all(|s| s.status == StepStatus::Completed)
    }

    pub fn step(&self, index: usize) -> Option<&PlanStep> {
        self.steps.get(index)
    }

    pub fn step_mut(&mut self, index: usize) -> Option<&mut PlanStep> {
        self.steps.get_mut(index)
    }

    pub fn contains_action(&self, action: ActionKind) -> bool {
        self.steps.iter().any(|s| s.action == action)
    }
}

// =============================================================================
// Task record
// =============================================================================

/// Why a task is parked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SuspensionKind {
    /// Waiting for a counterpart turn, call status or email reply.
    AwaitingInput,
    /// Waiting for the user to approve a gated step.
    AwaitingConfirmation { confirmation_id: Uuid, step_index: usize },
}

/// Persisted suspend marker; resumption reads it back by task id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Suspension {
    #[serde(flatten)]
    pub kind: SuspensionKind,
    pub since: Timestamp,
}

/// Failure counters maintained by the self-monitoring loop.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorState {
    /// Subtask of the most recent failure.
    pub failing_subtask: Option<Subtask>,
    /// Consecutive failures on `failing_subtask`.
    pub consecutive_failures: u32,
    pub total_failures: u32,
    pub input_timeouts: u32,
    pub research_attempts: u32,
    pub replans: u32,
}

/// One user goal and its execution lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub user_id: Uuid,
    pub goal: String,
    pub state: TaskState,
    pub priority: TaskPriority,
    /// The active plan, if one has been produced.
    pub plan: Option<Plan>,
    pub metadata: Value,
    pub monitor: MonitorState,
    pub suspension: Option<Suspension>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub archived_at: Option<Timestamp>,
}

impl Task {
    pub fn new(user_id: Uuid, goal: String, priority: TaskPriority, metadata: Value) -> Self {
        let now = Timestamp::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            goal,
            state: TaskState::Init,
            priority,
            plan: None,
            metadata,
            monitor: MonitorState::default(),
            suspension: None,
            created_at: now,
            updated_at: now,
            archived_at: None,
        }
    }

    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }
}

/// Filters for listing tasks.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub user_id: Option<Uuid>,
    pub state: Option<TaskState>,
    pub priority: Option<TaskPriority>,
    pub skip: u64,
    pub limit: Option<u64>,
}

// =============================================================================
// Task log
// =============================================================================

/// Event type of an append-only task log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogEvent {
    TaskCreated,
    IntentConfirmed,
    PlanCreated,
    PlanSuperseded,
    ToolInvoked,
    ToolResult,
    ToolFailed,
    StateTransition,
    ConfirmationRequested,
    ConfirmationRecorded,
    InteractionTurn,
    FailureDetected,
    TaskSuspended,
    TaskResumed,
    TaskCancelled,
    TaskEscalated,
    TaskFailed,
    TaskCompleted,
    UserNotified,
    StateRecovered,
}

impl LogEvent {
    pub const ALL: [LogEvent; 20] = [
        LogEvent::TaskCreated,
        LogEvent::IntentConfirmed,
        LogEvent::PlanCreated,
        LogEvent::PlanSuperseded,
        LogEvent::ToolInvoked,
        LogEvent::ToolResult,
        LogEvent::ToolFailed,
        LogEvent::StateTransition,
        LogEvent::ConfirmationRequested,
        LogEvent::ConfirmationRecorded,
        LogEvent::InteractionTurn,
        LogEvent::FailureDetected,
        LogEvent::TaskSuspended,
        LogEvent::TaskResumed,
        LogEvent::TaskCancelled,
        LogEvent::TaskEscalated,
        LogEvent::TaskFailed,
        LogEvent::TaskCompleted,
        LogEvent::UserNotified,
        LogEvent::StateRecovered,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LogEvent::TaskCreated => "task_created",
            LogEvent::IntentConfirmed => "intent_confirmed",
            LogEvent::PlanCreated => "plan_created",
            LogEvent::PlanSuperseded => "plan_superseded",
            LogEvent::ToolInvoked => "tool_invoked",
            LogEvent::ToolResult => "tool_result",
            LogEvent::ToolFailed => "tool_failed",
            LogEvent::StateTransition => "state_transition",
            LogEvent::ConfirmationRequested => "confirmation_requested",
            LogEvent::ConfirmationRecorded => "confirmation_recorded",
            LogEvent::InteractionTurn => "interaction_turn",
            LogEvent::FailureDetected => "failure_detected",
            LogEvent::TaskSuspended => "task_suspended",
            LogEvent::TaskResumed => "task_resumed",
            LogEvent::TaskCancelled => "task_cancelled",
            LogEvent::TaskEscalated => "task_escalated",
            LogEvent::TaskFailed => "task_failed",
            LogEvent::TaskCompleted => "task_completed",
            LogEvent::UserNotified => "user_notified",
            LogEvent::StateRecovered => "state_recovered",
        }
    }
}

impl fmt::Display for LogEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogEvent {
    type Err = TaskPilotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LogEvent::ALL
            .iter()
            .copied()
            .find(|event| event.as_str() == s)
            .ok_or_else(|| TaskPilotError::InvalidInput(format!("Unknown log event: {}", s)))
    }
}

/// Immutable audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: Uuid,
    pub task_id: Uuid,
    /// Per-task sequence number, strictly increasing.
    pub seq: i64,
    pub event: LogEvent,
    pub payload: Value,
    pub timestamp: Timestamp,
}

// =============================================================================
// Users, vault, semantic memory
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub name: String,
    pub phone: Option<String>,
    pub is_active: bool,
    pub created_at: Timestamp,
}

impl User {
    pub fn new(email: impl Into<String>, name: impl Into<String>, phone: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            email: email.into().trim().to_ascii_lowercase(),
            name: name.into(),
            phone,
            is_active: true,
            created_at: Timestamp::now(),
        }
    }
}

/// Decrypted vault credentials. Only constructed right before tool use.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub id: Uuid,
    pub company: String,
    pub account_number: String,
    pub secret: String,
    pub metadata: Value,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("id", &self.id)
            .field("company", &self.company)
            .field("account_number", &crate::sensitive::mask_account(&self.account_number))
            .field("secret", &"[SECRET_REDACTED]")
            .finish()
    }
}

/// Vault entry metadata without the secret.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VaultSummary {
    pub id: Uuid,
    pub user_id: Uuid,
    pub company: String,
    pub account_hint: String,
    pub metadata: Value,
    pub updated_at: Timestamp,
}

/// Normalize a company name into the vault key.
pub fn normalize_company(company: &str) -> String {
    company
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_ascii_lowercase()
}

/// A stored semantic memory record (embedding held by the index).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemanticRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub content: String,
    pub metadata: Value,
    pub created_at: Timestamp,
}

/// A semantic recall hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryHit {
    pub id: Uuid,
    pub content: String,
    pub metadata: Value,
    pub score: f64,
}

// =============================================================================
// Confirmations and cost
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationStatus {
    Pending,
    Approved,
    Denied,
    Expired,
}

impl ConfirmationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfirmationStatus::Pending => "pending",
            ConfirmationStatus::Approved => "approved",
            ConfirmationStatus::Denied => "denied",
            ConfirmationStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for ConfirmationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConfirmationStatus {
    type Err = TaskPilotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ConfirmationStatus::Pending),
            "approved" => Ok(ConfirmationStatus::Approved),
            "denied" => Ok(ConfirmationStatus::Denied),
            "expired" => Ok(ConfirmationStatus::Expired),
            other => Err(TaskPilotError::InvalidInput(format!(
                "Unknown confirmation status: {}",
                other
            ))),
        }
    }
}

/// Explicit user decision on a gated plan step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Confirmation {
    pub id: Uuid,
    pub task_id: Uuid,
    pub plan_id: Uuid,
    pub step_index: usize,
    pub action: ActionKind,
    pub description: String,
    pub status: ConfirmationStatus,
    pub requested_at: Timestamp,
    pub decided_at: Option<Timestamp>,
}

/// Usage reported by a tool invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub tokens: u64,
    pub duration_secs: f64,
    /// Action-specific billable units (emails sent, searches run).
    pub units: f64,
}

/// One row of a task's running cost ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostEntry {
    pub task_id: Uuid,
    pub plan_id: Uuid,
    pub step_index: usize,
    pub action: ActionKind,
    pub usage: Usage,
    pub cost: f64,
    pub recorded_at: Timestamp,
}

// =============================================================================
// Working context
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    Agent,
    Counterpart,
    User,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptTurn {
    pub speaker: Speaker,
    pub text: String,
    pub at: Timestamp,
}

/// Ephemeral per-task state: active plan, context variables and transcript.
///
/// A cache only. Everything except the live transcript can be rebuilt from
/// the task record and its log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkingContext {
    pub task_id: Uuid,
    pub plan: Option<Plan>,
    pub vars: BTreeMap<String, Value>,
    pub transcript: Vec<TranscriptTurn>,
}

impl WorkingContext {
    pub fn new(task_id: Uuid) -> Self {
        Self {
            task_id,
            plan: None,
            vars: BTreeMap::new(),
            transcript: Vec::new(),
        }
    }

    pub fn var_str(&self, key: &str) -> Option<&str> {
        self.vars.get(key).and_then(|v| v.as_str())
    }

    pub fn has_var(&self, key: &str) -> bool {
        self.vars.get(key).is_some_and(|v| !v.is_null())
    }

    pub fn set_var(&mut self, key: impl Into<String>, value: Value) {
        self.vars.insert(key.into(), value);
    }

    /// Merge an object of updates into the variables. `null` removes a key.
    pub fn merge(&mut self, updates: &Value) {
        if let Some(map) = updates.as_object() {
            for (key, value) in map {
                if value.is_null() {
                    self.vars.remove(key);
                } else {
                    self.vars.insert(key.clone(), value.clone());
                }
            }
        }
    }

    /// String values of an array variable.
    pub fn var_list(&self, key: &str) -> Vec<String> {
        self.vars
            .get(key)
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }
}
