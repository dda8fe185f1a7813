//! Intent classification and plan construction.
//!
//! The reasoning service only classifies the goal into a known intent and
//! extracts its arguments. The step sequence for each intent is fixed here,
//! so every plan is built from the closed action set with template
//! arguments resolved against the working context at dispatch time.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use taskpilot_core::config::PlannerConfig;
use taskpilot_core::types::{
    ActionKind, Plan, PlanStep, StepStatus, Subtask, Task, TaskState, Timestamp, User,
    WorkingContext,
};
use uuid::Uuid;

use crate::collaborators::{Inference, ReasoningService, StructuredIntent};
use crate::error::PlanningError;

pub const INTENT_CANCEL_SERVICE: &str = "cancel_service";
pub const INTENT_CONTACT_COMPANY: &str = "contact_company";
pub const INTENT_REPLY_EMAIL: &str = "reply_email";

pub const KNOWN_INTENTS: [&str; 3] = [
    INTENT_CANCEL_SERVICE,
    INTENT_CONTACT_COMPANY,
    INTENT_REPLY_EMAIL,
];

const TITLE_CHARS: usize = 80;

const SEARCH_QUERIES: [&str; 3] = [
    "{{company}} customer service phone number",
    "{{company}} support contact number",
    "how to reach {{company}} by phone",
];

/// Result of one planning request.
#[derive(Debug, Clone)]
pub struct PlanOutcome {
    pub plan: Plan,
    /// Context variables to merge before the plan runs. Empty on replan.
    pub context: Value,
    /// Intent confidence fell below the configured threshold.
    pub low_confidence: bool,
    /// Reasoning tokens spent.
    pub tokens: u64,
}

#[derive(Debug, Deserialize)]
struct TextIntent {
    #[serde(alias = "name")]
    intent: String,
    #[serde(default)]
    arguments: Value,
    #[serde(default)]
    confidence: Option<f64>,
}

/// A classified intent with validated arguments.
#[derive(Debug, Clone, PartialEq)]
struct Classified {
    name: String,
    arguments: Map<String, Value>,
    confidence: f64,
    /// Scores the model gave individual steps, keyed by subtask or action.
    step_confidence: BTreeMap<String, f64>,
}

impl Classified {
    /// A step's own score, else the intent confidence. Subtask keys win over
    /// action keys because `send_text` covers more than one subtask.
    fn step_confidence(&self, subtask: Subtask, action: ActionKind) -> f64 {
        self.step_confidence
            .get(subtask.as_str())
            .or_else(|| self.step_confidence.get(action.as_str()))
            .copied()
            .unwrap_or(self.confidence)
    }
}

/// Read the optional `step_confidence` object the model may attach to the
/// intent arguments.
fn parse_step_confidence(value: Option<Value>) -> Result<BTreeMap<String, f64>, PlanningError> {
    let map = match value {
        None | Some(Value::Null) => return Ok(BTreeMap::new()),
        Some(Value::Object(map)) => map,
        Some(other) => {
            return Err(PlanningError::Malformed(format!(
                "step_confidence must be an object, got {}",
                other
            )))
        }
    };
    map.into_iter()
        .map(|(key, score)| match score.as_f64() {
            Some(score) if (0.0..=1.0).contains(&score) => Ok((key, score)),
            _ => Err(PlanningError::Malformed(format!(
                "step confidence for '{}' must be within 0..1, got {}",
                key, score
            ))),
        })
        .collect()
}

/// Rank of a phase along the happy path. Steps ranked before the task's
/// current state are never scheduled.
fn phase_rank(state: TaskState) -> u8 {
    match state {
        TaskState::Init => 0,
        TaskState::GatherInfo => 1,
        TaskState::Research => 2,
        TaskState::ReadyToExecute => 3,
        TaskState::CallInProgress | TaskState::AwaitingUserInput => 4,
        TaskState::Summarize => 5,
        TaskState::Completed | TaskState::Failed | TaskState::Escalated => 6,
    }
}

fn build_prompt(goal: &str, reason: Option<&str>) -> String {
    let mut prompt = format!(
        "Classify the user's goal into exactly one intent and extract its arguments.\n\
         Intents:\n\
         - {}: company (required), request\n\
         - {}: company (required), request\n\
         - {}: recipient (required email), subject, body (required)\n\
         Respond with a tool call, or JSON {{\"intent\": ..., \"arguments\": {{...}}}}.\n\n\
         Goal: {}",
        INTENT_CANCEL_SERVICE, INTENT_CONTACT_COMPANY, INTENT_REPLY_EMAIL, goal
    );
    if let Some(reason) = reason {
        prompt.push_str(&format!("\nPrevious attempt failed: {}", reason));
    }
    prompt
}

/// Pull the first JSON object out of free text.
fn parse_text_intent(text: &str) -> Option<TextIntent> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&text[start..=end]).ok()
}

fn arg_str<'a>(args: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    args.get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

pub struct Planner {
    config: PlannerConfig,
}

impl Planner {
    pub fn new(config: PlannerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    /// Produce the next plan version for `task`.
    ///
    /// On a replan the intent recorded in the working context is reused and
    /// the reasoning service is not consulted. Steps whose work is already
    /// reflected in the context are skipped.
    pub async fn plan(
        &self,
        reasoning: &dyn ReasoningService,
        task: &Task,
        user: &User,
        working: &WorkingContext,
        reason: Option<&str>,
    ) -> Result<PlanOutcome, PlanningError> {
        let (classified, context, tokens) = match self.recorded_intent(working) {
            Some(classified) => (classified, json!({}), 0),
            None => {
                let (classified, tokens) = self.classify(reasoning, task, reason).await?;
                let context = self.initial_context(task, user, &classified);
                (classified, context, tokens)
            }
        };

        let mut merged = working.clone();
        merged.merge(&context);
        let steps = self.build_steps(&classified, task, &merged);

        let plan = Plan {
            id: Uuid::new_v4(),
            task_id: task.id,
            version: task.plan.as_ref().map_or(1, |p| p.version + 1),
            intent: classified.name.clone(),
            intent_confidence: classified.confidence,
            reason: reason.map(str::to_string),
            steps,
            created_at: Timestamp::now(),
            superseded_at: None,
        };
        let low_confidence = classified.confidence < self.config.intent_confidence_threshold;

        info!(
            task_id = %task.id,
            intent = %plan.intent,
            version = plan.version,
            steps = plan.steps.len(),
            confidence = plan.intent_confidence,
            "Plan built"
        );
        Ok(PlanOutcome {
            plan,
            context,
            low_confidence,
            tokens,
        })
    }

    fn recorded_intent(&self, working: &WorkingContext) -> Option<Classified> {
        let name = working.var_str("intent")?;
        if !KNOWN_INTENTS.contains(&name) {
            return None;
        }
        let confidence = working
            .vars
            .get("intent_confidence")
            .and_then(|v| v.as_f64())
            .unwrap_or(1.0);
        let step_confidence: BTreeMap<String, f64> = working
            .vars
            .get("step_confidence")
            .and_then(|v| v.as_object())
            .map(|scores| {
                scores
                    .iter()
                    .filter_map(|(k, v)| v.as_f64().map(|score| (k.clone(), score)))
                    .collect()
            })
            .unwrap_or_default();
        Some(Classified {
            name: name.to_string(),
            arguments: Map::new(),
            confidence,
            step_confidence,
        })
    }

    async fn classify(
        &self,
        reasoning: &dyn ReasoningService,
        task: &Task,
        reason: Option<&str>,
    ) -> Result<(Classified, u64), PlanningError> {
        let prompt = build_prompt(&task.goal, reason);
        let context = json!({
            "goal": task.goal,
            "metadata": task.metadata,
            "intents": KNOWN_INTENTS,
        });

        let attempts = self.config.max_planning_attempts.max(1);
        let mut tokens = 0;
        let mut last = String::new();
        for attempt in 1..=attempts {
            let result = match reasoning.infer(&prompt, &context).await {
                Ok(inference) => {
                    tokens += inference.tokens;
                    self.interpret(task, inference)
                }
                Err(e) => Err(PlanningError::Reasoning(e.to_string())),
            };
            match result {
                Ok(classified) => {
                    debug!(
                        task_id = %task.id,
                        intent = %classified.name,
                        attempt,
                        "Intent classified"
                    );
                    return Ok((classified, tokens));
                }
                Err(e) => {
                    warn!(task_id = %task.id, attempt, error = %e, "Planning attempt failed");
                    last = e.to_string();
                }
            }
        }
        Err(PlanningError::Exhausted { attempts, last })
    }

    fn interpret(&self, task: &Task, inference: Inference) -> Result<Classified, PlanningError> {
        let (intent, confidence) = match inference.intent {
            Some(StructuredIntent { name, arguments }) => (
                TextIntent {
                    intent: name,
                    arguments,
                    confidence: None,
                },
                inference.confidence,
            ),
            None => {
                let parsed = parse_text_intent(&inference.text).ok_or_else(|| {
                    PlanningError::Malformed("no intent in reasoning output".into())
                })?;
                let confidence = parsed.confidence.unwrap_or(inference.confidence);
                (parsed, confidence)
            }
        };

        if !KNOWN_INTENTS.contains(&intent.intent.as_str()) {
            return Err(PlanningError::Malformed(format!(
                "unknown intent '{}'",
                intent.intent
            )));
        }
        if !(0.0..=1.0).contains(&confidence) {
            return Err(PlanningError::Malformed(format!(
                "confidence {} out of range",
                confidence
            )));
        }

        let mut arguments = match intent.arguments {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(PlanningError::Malformed(format!(
                    "arguments must be an object, got {}",
                    other
                )))
            }
        };
        let step_confidence = parse_step_confidence(arguments.remove("step_confidence"))?;
        // Caller-supplied hints fill gaps the model left.
        if let Some(hints) = task.metadata.as_object() {
            for key in ["company", "recipient", "subject"] {
                if arg_str(&arguments, key).is_none() {
                    if let Some(value) = hints.get(key).filter(|v| v.is_string()) {
                        arguments.insert(key.to_string(), value.clone());
                    }
                }
            }
        }

        match intent.intent.as_str() {
            INTENT_REPLY_EMAIL => {
                if arg_str(&arguments, "recipient").is_none() {
                    return Err(PlanningError::Malformed("reply_email needs a recipient".into()));
                }
                if arg_str(&arguments, "body").is_none() {
                    return Err(PlanningError::Malformed("reply_email needs a body".into()));
                }
            }
            _ => {
                if arg_str(&arguments, "company").is_none() {
                    return Err(PlanningError::Malformed(format!(
                        "{} needs a company",
                        intent.intent
                    )));
                }
            }
        }

        Ok(Classified {
            name: intent.intent,
            arguments,
            confidence,
            step_confidence,
        })
    }

    fn initial_context(&self, task: &Task, user: &User, classified: &Classified) -> Value {
        let args = &classified.arguments;
        let title: String = task.goal.chars().take(TITLE_CHARS).collect();
        let mut vars = json!({
            "intent": classified.name,
            "intent_confidence": classified.confidence,
            "step_confidence": classified.step_confidence,
            "user_name": user.name,
            "user_email": user.email,
            "task_title": title,
            "credential_required": args
                .get("credential_required")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
        });

        match classified.name.as_str() {
            INTENT_REPLY_EMAIL => {
                let recipient = arg_str(args, "recipient").unwrap_or_default();
                let subject = arg_str(args, "subject")
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("Re: {}", title));
                vars["recipient"] = json!(recipient);
                vars["contact_email"] = json!(recipient);
                vars["subject"] = json!(subject);
                vars["body"] = json!(arg_str(args, "body").unwrap_or_default());
                vars["request"] = json!(task.goal);
                if let Some(company) = arg_str(args, "company") {
                    vars["company"] = json!(company);
                }
            }
            name => {
                let company = arg_str(args, "company").unwrap_or_default();
                let request = match arg_str(args, "request") {
                    Some(request) => request.to_string(),
                    None if name == INTENT_CANCEL_SERVICE => {
                        format!("I would like to cancel my {} service.", company)
                    }
                    None => task.goal.clone(),
                };
                vars["company"] = json!(company);
                vars["request"] = json!(request);
            }
        }
        vars
    }

    fn build_steps(
        &self,
        classified: &Classified,
        task: &Task,
        working: &WorkingContext,
    ) -> Vec<PlanStep> {
        let research_query = SEARCH_QUERIES
            [(task.monitor.research_attempts as usize) % SEARCH_QUERIES.len()];

        let template: Vec<(Subtask, TaskState, ActionKind, Value)> = match classified
            .name
            .as_str()
        {
            INTENT_REPLY_EMAIL => vec![
                (
                    Subtask::RecallHistory,
                    TaskState::GatherInfo,
                    ActionKind::RecallMemory,
                    json!({"query": "{{recipient}} {{subject}}"}),
                ),
                (
                    Subtask::SendEmail,
                    TaskState::ReadyToExecute,
                    ActionKind::SendEmail,
                    json!({"to": "{{recipient}}", "subject": "{{subject}}", "body": "{{body}}"}),
                ),
                (
                    Subtask::PersistRecord,
                    TaskState::Summarize,
                    ActionKind::Remember,
                    json!({"content": "{{summary}}"}),
                ),
            ],
            _ => vec![
                (
                    Subtask::RetrieveCredentials,
                    TaskState::GatherInfo,
                    ActionKind::RetrieveCredentials,
                    json!({"company": "{{company}}"}),
                ),
                (
                    Subtask::RecallHistory,
                    TaskState::GatherInfo,
                    ActionKind::RecallMemory,
                    json!({"query": "{{company}} contact number outcome"}),
                ),
                (
                    Subtask::ResearchContact,
                    TaskState::Research,
                    ActionKind::WebSearch,
                    json!({"query": research_query}),
                ),
                (
                    Subtask::PlaceCall,
                    TaskState::ReadyToExecute,
                    ActionKind::PlaceCall,
                    json!({
                        "number": "{{contact_number}}",
                        "company": "{{company}}",
                        "objective": "{{request}}",
                    }),
                ),
                (
                    Subtask::Authenticate,
                    TaskState::CallInProgress,
                    ActionKind::SendText,
                    json!({"text": "Hello, I'm an assistant calling on behalf of {{user_name}}, the account holder."}),
                ),
                (
                    Subtask::RequestAction,
                    TaskState::CallInProgress,
                    ActionKind::SendText,
                    json!({"text": "{{request}}"}),
                ),
                (
                    Subtask::PersistRecord,
                    TaskState::Summarize,
                    ActionKind::Remember,
                    json!({"content": "{{summary}}"}),
                ),
                (
                    Subtask::NotifyUser,
                    TaskState::Summarize,
                    ActionKind::NotifyUser,
                    json!({"subject": "Task completed: {{task_title}}", "body": "{{summary}}"}),
                ),
            ],
        };

        let current = phase_rank(task.state);
        template
            .into_iter()
            .filter(|(_, phase, _, _)| phase_rank(*phase) >= current)
            .filter(|(subtask, _, _, _)| !already_done(*subtask, working))
            .enumerate()
            .map(|(index, (subtask, phase, action, arguments))| PlanStep {
                index,
                subtask,
                phase,
                action,
                arguments,
                confidence: classified.step_confidence(subtask, action),
                status: StepStatus::Pending,
                attempts: 0,
                result: None,
            })
            .collect()
    }
}

/// Subtasks whose effect is already present in the working context.
fn already_done(subtask: Subtask, working: &WorkingContext) -> bool {
    match subtask {
        Subtask::RetrieveCredentials => working.has_var("credentials_checked"),
        Subtask::RecallHistory => working.has_var("memory_checked"),
        Subtask::ResearchContact => working.has_var("contact_number"),
        Subtask::PlaceCall => working.has_var("call_id"),
        Subtask::SendEmail => working.has_var("email_sent"),
        Subtask::PersistRecord => working.has_var("outcome_recorded"),
        Subtask::NotifyUser => working.has_var("user_notified"),
        _ => false,
    }
}
