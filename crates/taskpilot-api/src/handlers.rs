//! Route handler functions for all API endpoints.
//!
//! Each handler extracts path/query/body parameters via axum extractors,
//! calls the task engine and returns a JSON response.

use std::str::FromStr;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use taskpilot_core::types::{
    LogEntry, MemoryHit, Plan, Task, TaskFilter, TaskPriority, TaskState, Timestamp, VaultSummary,
};
use taskpilot_engine::{
    CallStatus, ExecutionMode, InboundMail, InteractionEvent, RunReport, TaskView, MAX_GOAL_CHARS,
};

use crate::error::ApiError;
use crate::state::AppState;

const DEFAULT_LIST_LIMIT: u64 = 50;
const MAX_LIST_LIMIT: u64 = 500;
const EMAIL_BODY_CHARS: usize = 500;
const EMAIL_SUBJECT_CHARS: usize = 200;
const NO_SUBJECT: &str = "(no subject)";
const EMAIL_POLL_LIMIT: usize = 20;

// =============================================================================
// Request types
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub email: String,
    pub name: String,
    #[serde(default)]
    pub phone: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    pub user_id: Uuid,
    pub goal: String,
    #[serde(default)]
    pub priority: Option<TaskPriority>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct ListTasksParams {
    pub user_id: Option<Uuid>,
    pub state: Option<TaskState>,
    pub priority: Option<TaskPriority>,
    pub skip: Option<u64>,
    pub limit: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct ExecuteParams {
    pub mode: Option<ExecutionMode>,
}

#[derive(Debug, Deserialize)]
pub struct ReplanRequest {
    pub reason: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ConfirmRequest {
    pub approved: bool,
}

#[derive(Debug, Deserialize)]
pub struct StoreCredentialsRequest {
    pub user_id: Uuid,
    pub company: String,
    pub account_number: String,
    pub secret: String,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Debug, Deserialize)]
pub struct AppendMemoryRequest {
    pub user_id: Uuid,
    pub content: String,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Debug, Deserialize)]
pub struct MemorySearchParams {
    pub user_id: Uuid,
    pub q: String,
    pub limit: Option<usize>,
    pub min_similarity: Option<f64>,
}

/// Normalized voice webhook payload.
#[derive(Debug, Deserialize)]
pub struct VoiceEventRequest {
    pub task_id: Uuid,
    /// `turn` or `status`.
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

// =============================================================================
// Response types
// =============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateTaskResponse {
    pub status: String,
    pub task_id: Uuid,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct TaskSummary {
    pub id: Uuid,
    pub user_id: Uuid,
    pub goal: String,
    pub state: TaskState,
    pub priority: TaskPriority,
    pub suspended: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Task> for TaskSummary {
    fn from(task: Task) -> Self {
        Self {
            id: task.id,
            user_id: task.user_id,
            goal: task.goal,
            state: task.state,
            priority: task.priority,
            suspended: task.suspension.is_some(),
            created_at: task.created_at.to_datetime(),
            updated_at: task.updated_at.to_datetime(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TaskListResponse {
    pub tasks: Vec<TaskSummary>,
    pub count: usize,
}

#[derive(Debug, Serialize)]
pub struct TaskLogsResponse {
    pub task_id: Uuid,
    pub logs: Vec<LogEntry>,
}

#[derive(Debug, Serialize)]
pub struct MemorySearchResponse {
    pub results: Vec<MemoryHit>,
}

#[derive(Debug, Serialize)]
pub struct EmailIntakeResponse {
    /// `continued` for a reply to an existing task, `created` otherwise.
    pub status: String,
    pub task_id: Uuid,
    pub report: RunReport,
}

#[derive(Debug, Serialize)]
pub struct EmailPollResponse {
    pub processed: usize,
    pub failed: usize,
    pub results: Vec<EmailIntakeResponse>,
}

// =============================================================================
// Health
// =============================================================================

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
    })
}

// =============================================================================
// Users
// =============================================================================

/// POST /users
pub async fn create_user(
    State(state): State<AppState>,
    Json(req): Json<CreateUserRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let user = state.engine.create_user(&req.email, &req.name, req.phone)?;
    Ok((StatusCode::CREATED, Json(json!(user))))
}

/// DELETE /users/{id}: removes the user's tasks, credentials and memories
/// with it.
pub async fn delete_user(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    state.engine.delete_user(id)?;
    info!(user_id = %id, "User deleted");
    Ok(Json(json!({"status": "deleted", "user_id": id})))
}

// =============================================================================
// Tasks
// =============================================================================

/// POST /tasks
pub async fn create_task(
    State(state): State<AppState>,
    Json(req): Json<CreateTaskRequest>,
) -> Result<(StatusCode, Json<CreateTaskResponse>), ApiError> {
    let task = state.engine.create_task(
        req.user_id,
        &req.goal,
        req.priority.unwrap_or_default(),
        req.metadata.unwrap_or(Value::Null),
    )?;
    Ok((
        StatusCode::CREATED,
        Json(CreateTaskResponse {
            status: "created".to_string(),
            task_id: task.id,
            message: "Task created; execute it to start planning".to_string(),
        }),
    ))
}

/// GET /tasks?user_id&state&priority&skip&limit
pub async fn list_tasks(
    State(state): State<AppState>,
    Query(params): Query<ListTasksParams>,
) -> Result<Json<TaskListResponse>, ApiError> {
    let filter = TaskFilter {
        user_id: params.user_id,
        state: params.state,
        priority: params.priority,
        skip: params.skip.unwrap_or(0),
        limit: Some(params.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT)),
    };
    let tasks: Vec<TaskSummary> = state
        .engine
        .list_tasks(&filter)?
        .into_iter()
        .map(TaskSummary::from)
        .collect();
    Ok(Json(TaskListResponse {
        count: tasks.len(),
        tasks,
    }))
}

/// GET /tasks/{id}
pub async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<TaskView>, ApiError> {
    Ok(Json(state.engine.get(id)?))
}

/// GET /tasks/{id}/logs
pub async fn task_logs(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<TaskLogsResponse>, ApiError> {
    let view = state.engine.get(id)?;
    Ok(Json(TaskLogsResponse {
        task_id: id,
        logs: view.logs,
    }))
}

/// POST /tasks/{id}/execute?mode=step|run
pub async fn execute_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(params): Query<ExecuteParams>,
) -> Result<Json<RunReport>, ApiError> {
    let mode = params.mode.unwrap_or_default();
    Ok(Json(state.engine.execute(id, mode).await?))
}

/// POST /tasks/{id}/replan
pub async fn replan_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<ReplanRequest>,
) -> Result<Json<Plan>, ApiError> {
    if req.reason.trim().is_empty() {
        return Err(ApiError::BadRequest("reason must not be empty".into()));
    }
    Ok(Json(state.engine.replan(id, req.reason.trim()).await?))
}

/// POST /tasks/{id}/cancel
pub async fn cancel_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<CancelRequest>,
) -> Result<Json<RunReport>, ApiError> {
    let reason = req.reason.as_deref().map(str::trim).filter(|r| !r.is_empty());
    Ok(Json(state.engine.cancel(id, reason).await?))
}

/// POST /tasks/{id}/confirmations/{cid}
pub async fn confirm_step(
    State(state): State<AppState>,
    Path((id, confirmation_id)): Path<(Uuid, Uuid)>,
    Json(req): Json<ConfirmRequest>,
) -> Result<Json<RunReport>, ApiError> {
    Ok(Json(
        state
            .engine
            .confirm(id, confirmation_id, req.approved)
            .await?,
    ))
}

// =============================================================================
// Vault and memory
// =============================================================================

/// POST /vault. The secret is encrypted at rest and never echoed.
pub async fn store_credentials(
    State(state): State<AppState>,
    Json(req): Json<StoreCredentialsRequest>,
) -> Result<(StatusCode, Json<VaultSummary>), ApiError> {
    let metadata = if req.metadata.is_null() {
        json!({})
    } else {
        req.metadata
    };
    let summary = state.engine.store_credentials(
        req.user_id,
        &req.company,
        &req.account_number,
        &req.secret,
        &metadata,
    )?;
    Ok((StatusCode::CREATED, Json(summary)))
}

/// POST /memory
pub async fn append_memory(
    State(state): State<AppState>,
    Json(req): Json<AppendMemoryRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let metadata = if req.metadata.is_null() {
        json!({})
    } else {
        req.metadata
    };
    let id = state
        .engine
        .append_memory(req.user_id, &req.content, metadata)
        .await?;
    Ok((StatusCode::CREATED, Json(json!({"id": id}))))
}

/// GET /memory/search?user_id&q&limit&min_similarity
pub async fn search_memory(
    State(state): State<AppState>,
    Query(params): Query<MemorySearchParams>,
) -> Result<Json<MemorySearchResponse>, ApiError> {
    if params.q.trim().is_empty() {
        return Err(ApiError::BadRequest("q must not be empty".into()));
    }
    let results = state
        .engine
        .query_memory(params.user_id, &params.q, params.limit, params.min_similarity)
        .await?;
    Ok(Json(MemorySearchResponse { results }))
}

// =============================================================================
// Intake webhooks
// =============================================================================

/// POST /voice/events
pub async fn voice_event(
    State(state): State<AppState>,
    Json(req): Json<VoiceEventRequest>,
) -> Result<Json<RunReport>, ApiError> {
    let event = match req.kind.as_str() {
        "turn" => InteractionEvent::Turn {
            text: req
                .text
                .ok_or_else(|| ApiError::BadRequest("turn events need text".into()))?,
        },
        "status" => {
            let status = req
                .status
                .ok_or_else(|| ApiError::BadRequest("status events need a status".into()))?;
            InteractionEvent::CallStatus {
                status: CallStatus::from_str(&status)?,
            }
        }
        other => {
            return Err(ApiError::BadRequest(format!(
                "Unknown voice event type '{}'",
                other
            )))
        }
    };
    Ok(Json(state.engine.handle_event(req.task_id, event).await?))
}

/// POST /email/inbound
pub async fn email_inbound(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> Result<Json<EmailIntakeResponse>, ApiError> {
    let mail = parse_inbound(&payload)?;
    Ok(Json(intake_email(&state, mail).await?))
}

/// POST /email/poll
pub async fn email_poll(State(state): State<AppState>) -> Result<Json<EmailPollResponse>, ApiError> {
    let inbox = state
        .engine
        .collaborators()
        .mail
        .poll_unread(EMAIL_POLL_LIMIT)
        .await
        .map_err(|e| ApiError::ServiceUnavailable(format!("Mail polling failed: {}", e)))?;

    let processed = inbox.len();
    let mut results = Vec::with_capacity(processed);
    for mail in inbox {
        let sender = mail.sender.clone();
        match intake_email(&state, mail).await {
            Ok(result) => results.push(result),
            Err(e) => warn!(sender = %sender, error = %e, "Skipping inbound email"),
        }
    }
    Ok(Json(EmailPollResponse {
        processed,
        failed: processed - results.len(),
        results,
    }))
}

fn first_str<'a>(payload: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|k| payload.get(*k).and_then(Value::as_str))
        .map(str::trim)
        .find(|s| !s.is_empty())
}

/// Accept the field spellings of the common inbound-mail webhooks.
fn parse_inbound(payload: &Value) -> Result<InboundMail, ApiError> {
    let sender = first_str(payload, &["from", "sender", "From"])
        .ok_or_else(|| ApiError::UnprocessableEntity("Inbound email has no sender".into()))?;
    Ok(InboundMail {
        sender: sender.to_string(),
        subject: first_str(payload, &["subject", "Subject"])
            .unwrap_or(NO_SUBJECT)
            .to_string(),
        body: first_str(payload, &["text", "plain", "body-plain", "body"])
            .unwrap_or_default()
            .to_string(),
        attachments: Vec::new(),
        received_at: Timestamp::now(),
    })
}

/// `Jane Doe <jane@example.com>` -> `jane@example.com`.
fn sender_address(sender: &str) -> &str {
    match (sender.rfind('<'), sender.rfind('>')) {
        (Some(start), Some(end)) if start < end => sender[start + 1..end].trim(),
        _ => sender.trim(),
    }
}

/// Task id tagged into a subject as `[task:<uuid>]`.
fn tagged_task(subject: &str) -> Option<Uuid> {
    let start = subject.find("[task:")? + "[task:".len();
    let len = subject[start..].find(']')?;
    Uuid::parse_str(subject[start..start + len].trim()).ok()
}

/// Goal text for a task opened from an email. Subject and body are clipped
/// so the goal stays within [`MAX_GOAL_CHARS`].
fn email_goal(address: &str, subject: &str, body: &str) -> String {
    let excerpt: String = body.chars().take(EMAIL_BODY_CHARS).collect();
    format!("Email from {}: {}\n\n{}", address, clip_subject(subject), excerpt)
        .chars()
        .take(MAX_GOAL_CHARS)
        .collect()
}

fn clip_subject(subject: &str) -> String {
    subject.chars().take(EMAIL_SUBJECT_CHARS).collect()
}

/// Continue a tagged task with the reply, or open a new task for the
/// message and run it.
async fn intake_email(state: &AppState, mail: InboundMail) -> Result<EmailIntakeResponse, ApiError> {
    let address = sender_address(&mail.sender);
    let user = state
        .engine
        .memory()
        .users()
        .find_by_email(address)?
        .ok_or_else(|| ApiError::NotFound(format!("No user with email {}", address)))?;

    if let Some(task_id) = tagged_task(&mail.subject) {
        let task = state.engine.get(task_id)?.task;
        if task.user_id != user.id {
            return Err(ApiError::NotFound(format!("Task {}", task_id)));
        }
        let report = state
            .engine
            .handle_event(
                task_id,
                InteractionEvent::EmailReply {
                    sender: address.to_string(),
                    subject: mail.subject,
                    body: mail.body,
                },
            )
            .await?;
        return Ok(EmailIntakeResponse {
            status: "continued".to_string(),
            task_id,
            report,
        });
    }

    let goal = email_goal(address, &mail.subject, &mail.body);
    let task = state.engine.create_task(
        user.id,
        &goal,
        TaskPriority::default(),
        json!({"source": "email", "sender": address, "subject": clip_subject(&mail.subject)}),
    )?;
    info!(task_id = %task.id, sender = %address, "Task created from email");
    let report = state.engine.execute(task.id, ExecutionMode::Run).await?;
    Ok(EmailIntakeResponse {
        status: "created".to_string(),
        task_id: task.id,
        report,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_inbound_accepts_webhook_spellings() {
        let mail = parse_inbound(&json!({
            "From": "Jane Doe <jane@example.com>",
            "Subject": "Lease",
            "body-plain": "Please renew.",
        }))
        .unwrap();
        assert_eq!(mail.sender, "Jane Doe <jane@example.com>");
        assert_eq!(mail.subject, "Lease");
        assert_eq!(mail.body, "Please renew.");

        let mail = parse_inbound(&json!({"sender": "a@b.com", "text": "hi"})).unwrap();
        assert_eq!(mail.subject, "(no subject)");
        assert_eq!(mail.body, "hi");

        let mail = parse_inbound(&json!({"from": "a@b.com", "subject": "  ", "plain": "hello"}))
            .unwrap();
        assert_eq!(mail.subject, "(no subject)");
        assert_eq!(mail.body, "hello");

        assert!(matches!(
            parse_inbound(&json!({"subject": "no sender"})),
            Err(ApiError::UnprocessableEntity(_))
        ));
    }

    #[test]
    fn test_email_goal_stays_within_limit() {
        let subject = "s".repeat(3_000);
        let body = "b".repeat(3_000);
        let goal = email_goal("jane@example.com", &subject, &body);
        assert!(goal.chars().count() <= MAX_GOAL_CHARS);
        assert!(goal.starts_with("Email from jane@example.com: sss"));
        assert!(goal.contains(&"s".repeat(EMAIL_SUBJECT_CHARS)));
        assert!(!goal.contains(&"s".repeat(EMAIL_SUBJECT_CHARS + 1)));
        assert!(goal.ends_with(&"b".repeat(EMAIL_BODY_CHARS)));

        let address = format!("{}@example.com", "a".repeat(3_000));
        let goal = email_goal(&address, "Lease", "Please renew.");
        assert_eq!(goal.chars().count(), MAX_GOAL_CHARS);

        let goal = email_goal("jane@example.com", "Lease", "Please renew.");
        assert_eq!(goal, "Email from jane@example.com: Lease\n\nPlease renew.");
    }

    #[test]
    fn test_sender_address() {
        assert_eq!(sender_address("Jane Doe <jane@example.com>"), "jane@example.com");
        assert_eq!(sender_address(" jane@example.com "), "jane@example.com");
    }

    #[test]
    fn test_tagged_task() {
        let id = Uuid::new_v4();
        assert_eq!(tagged_task(&format!("Re: bill [task:{}]", id)), Some(id));
        assert_eq!(tagged_task("Re: bill [task:not-a-uuid]"), None);
        assert_eq!(tagged_task("Re: bill"), None);
    }
}
