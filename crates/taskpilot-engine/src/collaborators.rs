//! Capability interfaces for the external services the engine drives.
//!
//! Concrete vendors (LLM, telephony, mail, search) live outside the core.
//! The engine only sees these traits, injected through [`Collaborators`].

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use taskpilot_core::error::TaskPilotError;
use taskpilot_core::sensitive::mask_account;
use taskpilot_core::types::Timestamp;

use crate::error::ToolError;

/// Failure reported by a collaborator.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CollaboratorError {
    #[error("Transient failure: {0}")]
    Transient(String),
    #[error("Rate limited: {0}")]
    RateLimited(String),
    #[error("Request rejected: {0}")]
    Rejected(String),
}

impl From<CollaboratorError> for ToolError {
    fn from(err: CollaboratorError) -> Self {
        let retryable = !matches!(err, CollaboratorError::Rejected(_));
        ToolError::external(err.to_string(), retryable)
    }
}

// =============================================================================
// Reasoning
// =============================================================================

/// A tool-call style intent extracted by the reasoning service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredIntent {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Inference {
    pub text: String,
    #[serde(default)]
    pub intent: Option<StructuredIntent>,
    pub confidence: f64,
    #[serde(default)]
    pub tokens: u64,
}

#[async_trait]
pub trait ReasoningService: Send + Sync {
    async fn infer(&self, prompt: &str, context: &Value) -> Result<Inference, CollaboratorError>;
}

// =============================================================================
// Telephony
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallHandle {
    pub id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Ringing,
    InProgress,
    Completed,
    Failed,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Ringing => "ringing",
            CallStatus::InProgress => "in_progress",
            CallStatus::Completed => "completed",
            CallStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CallStatus {
    type Err = TaskPilotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ringing" => Ok(CallStatus::Ringing),
            "in_progress" | "in-progress" => Ok(CallStatus::InProgress),
            "completed" => Ok(CallStatus::Completed),
            "failed" | "busy" | "no-answer" => Ok(CallStatus::Failed),
            other => Err(TaskPilotError::InvalidInput(format!(
                "Unknown call status: {}",
                other
            ))),
        }
    }
}

/// What the voice agent needs to know when the call connects.
///
/// Carries decrypted credentials, so it is built right before dialing and
/// never logged.
#[derive(Clone, PartialEq)]
pub struct CallBrief {
    pub company: String,
    pub objective: String,
    pub caller_name: String,
    pub account_number: Option<String>,
    pub secret: Option<String>,
}

impl fmt::Debug for CallBrief {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallBrief")
            .field("company", &self.company)
            .field("objective", &self.objective)
            .field("caller_name", &self.caller_name)
            .field("account_number", &self.account_number.as_deref().map(mask_account))
            .field("secret", &self.secret.as_ref().map(|_| "[SECRET_REDACTED]"))
            .finish()
    }
}

#[async_trait]
pub trait TelephonyChannel: Send + Sync {
    async fn place_call(&self, number: &str, brief: &CallBrief)
        -> Result<CallHandle, CollaboratorError>;

    async fn send_text(&self, call: &CallHandle, text: &str) -> Result<(), CollaboratorError>;

    async fn hang_up(&self, call: &CallHandle) -> Result<(), CollaboratorError>;

    async fn call_status(&self, call: &CallHandle) -> Result<CallStatus, CollaboratorError>;
}

// =============================================================================
// Mail and search
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMail {
    pub sender: String,
    pub subject: String,
    pub body: String,
    #[serde(default)]
    pub attachments: Vec<String>,
    pub received_at: Timestamp,
}

#[async_trait]
pub trait MailChannel: Send + Sync {
    async fn poll_unread(&self, limit: usize) -> Result<Vec<InboundMail>, CollaboratorError>;

    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), CollaboratorError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub url: String,
    pub snippet: String,
    pub rank: u32,
}

#[async_trait]
pub trait SearchService: Send + Sync {
    async fn search(&self, query: &str) -> Result<Vec<SearchResult>, CollaboratorError>;
}

/// The full set of injected capabilities.
#[derive(Clone)]
pub struct Collaborators {
    pub reasoning: Arc<dyn ReasoningService>,
    pub telephony: Arc<dyn TelephonyChannel>,
    pub mail: Arc<dyn MailChannel>,
    pub search: Arc<dyn SearchService>,
}

// =============================================================================
// Inbound events
// =============================================================================

/// External input that resumes or steers a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InteractionEvent {
    /// A counterpart utterance on the live call.
    Turn { text: String },
    CallStatus { status: CallStatus },
    EmailReply {
        sender: String,
        subject: String,
        body: String,
    },
    /// Raised by the sweeper when an input wait runs out.
    InputTimeout,
}

impl InteractionEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            InteractionEvent::Turn { .. } => "turn",
            InteractionEvent::CallStatus { .. } => "call_status",
            InteractionEvent::EmailReply { .. } => "email_reply",
            InteractionEvent::InputTimeout => "input_timeout",
        }
    }
}
