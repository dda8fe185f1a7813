//! Scripted in-process collaborators and fixtures.
//!
//! Shared by the engine's unit tests and the API integration tests. Every
//! fake records what it was asked to do so tests can assert on side effects.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::{json, Value};

use taskpilot_core::config::{MemoryConfig, PolicyDecision, PolicyOverride, TaskPilotConfig};
use taskpilot_core::types::{ActionKind, Task, TaskPriority, User, WorkingContext};
use taskpilot_memory::MemoryGateway;

use crate::collaborators::{
    CallBrief, CallHandle, CallStatus, CollaboratorError, Collaborators, InboundMail, Inference,
    MailChannel, ReasoningService, SearchResult, SearchService, StructuredIntent,
    TelephonyChannel,
};
use crate::engine::TaskEngine;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// =============================================================================
// Reasoning
// =============================================================================

/// Replays queued responses, then falls back to a fixed inference.
pub struct ScriptedReasoning {
    script: Mutex<VecDeque<Result<Inference, CollaboratorError>>>,
    fallback: Option<Inference>,
    calls: AtomicUsize,
}

impl ScriptedReasoning {
    pub fn new(script: Vec<Result<Inference, CollaboratorError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Always classify as `name` with the given arguments.
    pub fn with_intent(name: &str, arguments: Value, confidence: f64) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Some(Inference {
                text: String::new(),
                intent: Some(StructuredIntent {
                    name: name.to_string(),
                    arguments,
                }),
                confidence,
                tokens: 120,
            }),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn push(&self, response: Result<Inference, CollaboratorError>) {
        lock(&self.script).push_back(response);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReasoningService for ScriptedReasoning {
    async fn infer(&self, _prompt: &str, _context: &Value) -> Result<Inference, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(response) = lock(&self.script).pop_front() {
            return response;
        }
        self.fallback
            .clone()
            .ok_or_else(|| CollaboratorError::Rejected("script exhausted".into()))
    }
}

// =============================================================================
// Telephony
// =============================================================================

struct TelephonyState {
    calls: Vec<(String, CallBrief)>,
    texts: Vec<(String, String)>,
    hung_up: Vec<String>,
    status: CallStatus,
    fail_next_call: Option<CollaboratorError>,
    fail_texts: Option<CollaboratorError>,
}

pub struct FakeTelephony {
    state: Mutex<TelephonyState>,
}

impl Default for FakeTelephony {
    fn default() -> Self {
        Self {
            state: Mutex::new(TelephonyState {
                calls: Vec::new(),
                texts: Vec::new(),
                hung_up: Vec::new(),
                status: CallStatus::InProgress,
                fail_next_call: None,
                fail_texts: None,
            }),
        }
    }
}

impl FakeTelephony {
    pub fn placed_calls(&self) -> Vec<(String, CallBrief)> {
        lock(&self.state).calls.clone()
    }

    pub fn sent_texts(&self) -> Vec<(String, String)> {
        lock(&self.state).texts.clone()
    }

    pub fn hung_up(&self) -> Vec<String> {
        lock(&self.state).hung_up.clone()
    }

    pub fn fail_next_call(&self, err: CollaboratorError) {
        lock(&self.state).fail_next_call = Some(err);
    }

    /// Fail every `send_text` until cleared with `None`.
    pub fn fail_texts(&self, err: Option<CollaboratorError>) {
        lock(&self.state).fail_texts = err;
    }

    /// Status reported for every call.
    pub fn set_status(&self, status: CallStatus) {
        lock(&self.state).status = status;
    }
}

#[async_trait]
impl TelephonyChannel for FakeTelephony {
    async fn place_call(
        &self,
        number: &str,
        brief: &CallBrief,
    ) -> Result<CallHandle, CollaboratorError> {
        let mut state = lock(&self.state);
        if let Some(err) = state.fail_next_call.take() {
            return Err(err);
        }
        state.calls.push((number.to_string(), brief.clone()));
        Ok(CallHandle {
            id: format!("call-{}", state.calls.len()),
        })
    }

    async fn send_text(&self, call: &CallHandle, text: &str) -> Result<(), CollaboratorError> {
        let mut state = lock(&self.state);
        if let Some(err) = state.fail_texts.clone() {
            return Err(err);
        }
        state.texts.push((call.id.clone(), text.to_string()));
        Ok(())
    }

    async fn hang_up(&self, call: &CallHandle) -> Result<(), CollaboratorError> {
        lock(&self.state).hung_up.push(call.id.clone());
        Ok(())
    }

    async fn call_status(&self, _call: &CallHandle) -> Result<CallStatus, CollaboratorError> {
        Ok(lock(&self.state).status)
    }
}

// =============================================================================
// Mail and search
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct SentMail {
    pub to: String,
    pub subject: String,
    pub body: String,
}

#[derive(Default)]
pub struct FakeMail {
    sent: Mutex<Vec<SentMail>>,
    inbox: Mutex<VecDeque<InboundMail>>,
    failure: Mutex<Option<CollaboratorError>>,
    fail_next: Mutex<Option<CollaboratorError>>,
}

impl FakeMail {
    pub fn sent(&self) -> Vec<SentMail> {
        lock(&self.sent).clone()
    }

    /// Queue a message for `poll_unread`.
    pub fn deliver(&self, mail: InboundMail) {
        lock(&self.inbox).push_back(mail);
    }

    pub fn fail_sends(&self, err: Option<CollaboratorError>) {
        *lock(&self.failure) = err;
    }

    /// Fail only the next `send`.
    pub fn fail_next_send(&self, err: CollaboratorError) {
        *lock(&self.fail_next) = Some(err);
    }
}

#[async_trait]
impl MailChannel for FakeMail {
    async fn poll_unread(&self, limit: usize) -> Result<Vec<InboundMail>, CollaboratorError> {
        let mut inbox = lock(&self.inbox);
        let n = limit.min(inbox.len());
        Ok(inbox.drain(..n).collect())
    }

    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), CollaboratorError> {
        if let Some(err) = lock(&self.fail_next).take() {
            return Err(err);
        }
        if let Some(err) = lock(&self.failure).clone() {
            return Err(err);
        }
        lock(&self.sent).push(SentMail {
            to: to.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
        });
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeSearch {
    results: Mutex<Vec<SearchResult>>,
    failure: Mutex<Option<CollaboratorError>>,
    queries: Mutex<Vec<String>>,
}

impl FakeSearch {
    pub fn set_results(&self, results: Vec<SearchResult>) {
        *lock(&self.results) = results;
    }

    /// Fail every search until cleared.
    pub fn fail_with(&self, err: CollaboratorError) {
        *lock(&self.failure) = Some(err);
    }

    pub fn clear_failure(&self) {
        *lock(&self.failure) = None;
    }

    pub fn queries(&self) -> Vec<String> {
        lock(&self.queries).clone()
    }
}

#[async_trait]
impl SearchService for FakeSearch {
    async fn search(&self, query: &str) -> Result<Vec<SearchResult>, CollaboratorError> {
        lock(&self.queries).push(query.to_string());
        if let Some(err) = lock(&self.failure).clone() {
            return Err(err);
        }
        Ok(lock(&self.results).clone())
    }
}

// =============================================================================
// Fixtures
// =============================================================================

pub struct Fakes {
    pub reasoning: Arc<ScriptedReasoning>,
    pub telephony: Arc<FakeTelephony>,
    pub mail: Arc<FakeMail>,
    pub search: Arc<FakeSearch>,
}

impl Fakes {
    pub fn new(reasoning: ScriptedReasoning) -> Self {
        Self {
            reasoning: Arc::new(reasoning),
            telephony: Arc::new(FakeTelephony::default()),
            mail: Arc::new(FakeMail::default()),
            search: Arc::new(FakeSearch::default()),
        }
    }

    /// Fakes preloaded for the Comcast cancellation walkthrough.
    pub fn comcast() -> Self {
        let fakes = Self::new(ScriptedReasoning::with_intent(
            "cancel_service",
            json!({"company": "Comcast"}),
            0.92,
        ));
        fakes.search.set_results(comcast_search_results());
        fakes
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            reasoning: self.reasoning.clone(),
            telephony: self.telephony.clone(),
            mail: self.mail.clone(),
            search: self.search.clone(),
        }
    }
}

pub fn comcast_search_results() -> Vec<SearchResult> {
    vec![SearchResult {
        url: "https://www.xfinity.com/support/contact-us".into(),
        snippet: "Call Xfinity customer service at 1-800-934-6489, available 24/7.".into(),
        rank: 1,
    }]
}

/// Configuration with millisecond backoff and a short lock wait.
pub fn test_config() -> TaskPilotConfig {
    let mut config = TaskPilotConfig::default();
    config.orchestrator.base_backoff_ms = 1;
    config.orchestrator.max_backoff_ms = 4;
    config.engine.lock_wait_ms = 50;
    config
}

/// [`test_config`] plus an override that lets calls to Comcast through
/// without confirmation.
pub fn comcast_config() -> TaskPilotConfig {
    let mut config = test_config();
    config.governor.overrides.push(PolicyOverride {
        user_id: None,
        company: Some("Comcast".into()),
        action: Some(ActionKind::PlaceCall),
        decision: PolicyDecision::Allow,
    });
    config
}

pub fn test_user() -> User {
    User::new("jane@example.com", "Jane Doe", Some("+1 555 010 0100".into()))
}

/// Everything a tool handler needs, backed by an in-memory gateway.
pub struct ToolFixture {
    pub memory: MemoryGateway,
    pub task: Task,
    pub user: User,
    pub working: WorkingContext,
    pub fakes: Fakes,
}

pub fn tool_fixture() -> ToolFixture {
    let memory =
        MemoryGateway::in_memory(MemoryConfig::default()).expect("in-memory gateway");
    let user = test_user();
    memory.users().create(&user).expect("create user");
    let task = Task::new(
        user.id,
        "Cancel my Comcast internet".into(),
        TaskPriority::Medium,
        json!({}),
    );
    memory.tasks().create(&task).expect("create task");
    let working = WorkingContext::new(task.id);
    ToolFixture {
        memory,
        task,
        user,
        working,
        fakes: Fakes::new(ScriptedReasoning::new(Vec::new())),
    }
}

/// A full engine over an in-memory gateway with one registered user.
pub struct EngineFixture {
    pub engine: Arc<TaskEngine>,
    pub memory: Arc<MemoryGateway>,
    pub user: User,
    pub fakes: Fakes,
}

pub fn engine_fixture(config: TaskPilotConfig, fakes: Fakes) -> EngineFixture {
    let memory = Arc::new(
        MemoryGateway::in_memory(config.memory.clone()).expect("in-memory gateway"),
    );
    let user = test_user();
    memory.users().create(&user).expect("create user");
    let engine = TaskEngine::new(config, Arc::clone(&memory), fakes.collaborators())
        .expect("engine with default registry");
    EngineFixture {
        engine: Arc::new(engine),
        memory,
        user,
        fakes,
    }
}
