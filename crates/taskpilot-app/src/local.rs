//! Local collaborators for running without vendor accounts.
//!
//! Reasoning is a keyword classifier over the goal text. Telephony and
//! mail only log what they would send; counterpart turns and call status
//! arrive through the `/voice/events` webhook instead.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};
use tracing::{debug, info};

use taskpilot_engine::{
    CallBrief, CallHandle, CallStatus, CollaboratorError, Collaborators, InboundMail, Inference,
    MailChannel, ReasoningService, SearchResult, SearchService, StructuredIntent,
    TelephonyChannel,
};

fn company_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"\b(?:[Mm]y|[Ww]ith|[Ff]rom|[Cc]all|[Cc]ontact|[Rr]each|[Cc]ancel)\s+([A-Z][\w&.-]*(?:\s+[A-Z][\w&.-]*)*)",
        )
        .expect("Invalid company regex")
    })
}

fn email_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").expect("Invalid email regex")
    })
}

fn cancel_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(?:cancel|terminate|close|discontinue|unsubscribe)\b")
            .expect("Invalid cancel regex")
    })
}

fn contact_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(?:call|contact|reach|phone|dispute|ask)\b").expect("Invalid contact regex")
    })
}

fn reply_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(?:reply|respond|email|write|tell)\b").expect("Invalid reply regex")
    })
}

/// Build the collaborator set used by the server binary.
pub fn local_collaborators() -> Collaborators {
    Collaborators {
        reasoning: Arc::new(KeywordReasoning),
        telephony: Arc::new(LoggingTelephony::default()),
        mail: Arc::new(LoggingMail),
        search: Arc::new(OfflineSearch),
    }
}

// =============================================================================
// Reasoning
// =============================================================================

/// Classifies goals by keyword. Unrecognized goals come back without an
/// intent, which the planner treats as unclassifiable.
pub struct KeywordReasoning;

impl KeywordReasoning {
    fn classify(goal: &str) -> Option<(StructuredIntent, f64)> {
        let company = company_re()
            .captures(goal)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim_end_matches(['.', ',']).to_string());

        if let Some(recipient) = email_re().find(goal).filter(|_| reply_re().is_match(goal)) {
            let body = goal
                .split_once(':')
                .map(|(_, rest)| rest.trim())
                .filter(|rest| !rest.is_empty())
                .unwrap_or(goal);
            let intent = StructuredIntent {
                name: "reply_email".into(),
                arguments: json!({
                    "recipient": recipient.as_str(),
                    "subject": "Following up",
                    "body": body,
                }),
            };
            return Some((intent, 0.75));
        }

        let company = company?;
        let (name, confidence) = if cancel_re().is_match(goal) {
            ("cancel_service", 0.8)
        } else if contact_re().is_match(goal) {
            ("contact_company", 0.7)
        } else {
            return None;
        };
        let intent = StructuredIntent {
            name: name.into(),
            arguments: json!({"company": company, "request": goal}),
        };
        Some((intent, confidence))
    }
}

#[async_trait]
impl ReasoningService for KeywordReasoning {
    async fn infer(&self, prompt: &str, context: &Value) -> Result<Inference, CollaboratorError> {
        let goal = context
            .get("goal")
            .and_then(Value::as_str)
            .unwrap_or(prompt);
        let tokens = (prompt.split_whitespace().count() as u64).max(1);

        Ok(match Self::classify(goal) {
            Some((intent, confidence)) => {
                debug!(intent = %intent.name, confidence, "Goal classified");
                Inference {
                    text: String::new(),
                    intent: Some(intent),
                    confidence,
                    tokens,
                }
            }
            None => Inference {
                text: "No matching intent".into(),
                intent: None,
                confidence: 0.0,
                tokens,
            },
        })
    }
}

// =============================================================================
// Telephony and mail
// =============================================================================

/// Logs outbound calls and texts. Every call stays in progress until a
/// status event closes it.
#[derive(Default)]
pub struct LoggingTelephony {
    placed: AtomicUsize,
}

#[async_trait]
impl TelephonyChannel for LoggingTelephony {
    async fn place_call(
        &self,
        number: &str,
        brief: &CallBrief,
    ) -> Result<CallHandle, CollaboratorError> {
        let n = self.placed.fetch_add(1, Ordering::SeqCst) + 1;
        let handle = CallHandle {
            id: format!("local-call-{}", n),
        };
        info!(call_id = %handle.id, number, company = %brief.company, "Outbound call placed");
        Ok(handle)
    }

    async fn send_text(&self, call: &CallHandle, text: &str) -> Result<(), CollaboratorError> {
        info!(call_id = %call.id, chars = text.chars().count(), "Speaking on call");
        Ok(())
    }

    async fn hang_up(&self, call: &CallHandle) -> Result<(), CollaboratorError> {
        info!(call_id = %call.id, "Call hung up");
        Ok(())
    }

    async fn call_status(&self, _call: &CallHandle) -> Result<CallStatus, CollaboratorError> {
        Ok(CallStatus::InProgress)
    }
}

/// Logs outbound mail. Inbound mail arrives through `/email/inbound`.
pub struct LoggingMail;

#[async_trait]
impl MailChannel for LoggingMail {
    async fn poll_unread(&self, _limit: usize) -> Result<Vec<InboundMail>, CollaboratorError> {
        Ok(Vec::new())
    }

    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), CollaboratorError> {
        info!(to, subject, chars = body.chars().count(), "Mail sent");
        Ok(())
    }
}

/// Search with no backing index.
pub struct OfflineSearch;

#[async_trait]
impl SearchService for OfflineSearch {
    async fn search(&self, query: &str) -> Result<Vec<SearchResult>, CollaboratorError> {
        debug!(query, "Offline search returns no results");
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn infer(goal: &str) -> Inference {
        KeywordReasoning
            .infer("Classify", &json!({"goal": goal}))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_cancel_goal_extracts_company() {
        let inference = infer("Please cancel my Comcast account.").await;
        let intent = inference.intent.unwrap();
        assert_eq!(intent.name, "cancel_service");
        assert_eq!(intent.arguments["company"], "Comcast");
        assert!(inference.confidence >= 0.6);
    }

    #[tokio::test]
    async fn test_contact_goal() {
        let intent = infer("Call Verizon Wireless about the roaming charge")
            .await
            .intent
            .unwrap();
        assert_eq!(intent.name, "contact_company");
        assert_eq!(intent.arguments["company"], "Verizon Wireless");
    }

    #[tokio::test]
    async fn test_reply_goal_uses_address_and_body() {
        let intent = infer("Email landlord@example.com: I will renew the lease")
            .await
            .intent
            .unwrap();
        assert_eq!(intent.name, "reply_email");
        assert_eq!(intent.arguments["recipient"], "landlord@example.com");
        assert_eq!(intent.arguments["body"], "I will renew the lease");
    }

    #[tokio::test]
    async fn test_unrecognized_goal_has_no_intent() {
        let inference = infer("what is the weather").await;
        assert!(inference.intent.is_none());
        assert_eq!(inference.confidence, 0.0);
    }

    #[tokio::test]
    async fn test_logging_telephony_numbers_calls() {
        let telephony = LoggingTelephony::default();
        let brief = CallBrief {
            company: "Comcast".into(),
            objective: "cancel".into(),
            caller_name: "Jane".into(),
            account_number: None,
            secret: None,
        };
        let first = telephony.place_call("1-800-934-6489", &brief).await.unwrap();
        let second = telephony.place_call("1-800-934-6489", &brief).await.unwrap();
        assert_eq!(first.id, "local-call-1");
        assert_eq!(second.id, "local-call-2");
        assert_eq!(
            telephony.call_status(&first).await.unwrap(),
            CallStatus::InProgress
        );
    }
}
