//! Semantic memory handlers: recall prior outcomes, persist new ones.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use taskpilot_core::types::ActionKind;

use crate::error::ToolError;
use crate::tools::{
    contact_update, extract_phone_numbers, parse_args, require_non_empty, RiskClass,
    ToolContext, ToolDescriptor, ToolHandler, ToolOutput,
};

const MAX_RECALL_LIMIT: usize = 20;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RecallArgs {
    query: String,
    #[serde(default)]
    limit: Option<usize>,
}

/// Recalls the user's prior notes and pulls any phone numbers out of them.
pub struct RecallMemoryHandler {
    timeout: Duration,
}

impl RecallMemoryHandler {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl ToolHandler for RecallMemoryHandler {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            action: ActionKind::RecallMemory,
            risk: RiskClass::Informational,
            idempotent: true,
            timeout: self.timeout,
        }
    }

    fn validate(&self, args: &Value) -> Result<(), ToolError> {
        let args: RecallArgs = parse_args(args)?;
        require_non_empty("query", &args.query)?;
        match args.limit {
            Some(0) => Err(ToolError::Validation("limit must be at least 1".into())),
            Some(n) if n > MAX_RECALL_LIMIT => Err(ToolError::Validation(format!(
                "limit must be at most {}",
                MAX_RECALL_LIMIT
            ))),
            _ => Ok(()),
        }
    }

    fn describe(&self, args: &Value) -> String {
        let query = args.get("query").and_then(|v| v.as_str()).unwrap_or("?");
        format!("Recall prior notes about \"{}\"", query)
    }

    async fn invoke(&self, args: &Value, ctx: &ToolContext<'_>) -> Result<ToolOutput, ToolError> {
        let args: RecallArgs = parse_args(args)?;
        let hits = ctx
            .memory
            .recall(ctx.user.id, &args.query, args.limit, None)
            .await?;

        let invalid = ctx.working.var_list("invalid_contacts");
        let notes: Vec<&str> = hits.iter().map(|h| h.content.as_str()).collect();
        let numbers = extract_phone_numbers(&notes.join("\n"), &invalid);

        let mut context = json!({
            "memory_checked": true,
            "memory_notes": notes,
        });
        if let Some(number) = contact_update(ctx.working, &numbers) {
            context["contact_number"] = json!(number);
            context["contact_source"] = json!("memory");
        }

        Ok(ToolOutput::new(
            json!({
                "hits": hits.iter().map(|h| json!({"content": h.content, "score": h.score})).collect::<Vec<_>>(),
                "phone_numbers": numbers,
            }),
            context,
        ))
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RememberArgs {
    content: String,
    #[serde(default)]
    metadata: Option<Value>,
}

/// Appends an outcome note to the user's semantic memory.
pub struct RememberHandler {
    timeout: Duration,
}

impl RememberHandler {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl ToolHandler for RememberHandler {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            action: ActionKind::Remember,
            risk: RiskClass::Informational,
            idempotent: false,
            timeout: self.timeout,
        }
    }

    fn validate(&self, args: &Value) -> Result<(), ToolError> {
        let args: RememberArgs = parse_args(args)?;
        require_non_empty("content", &args.content)?;
        match args.metadata {
            Some(ref m) if !m.is_object() => {
                Err(ToolError::Validation("metadata must be an object".into()))
            }
            _ => Ok(()),
        }
    }

    fn describe(&self, args: &Value) -> String {
        let content = args.get("content").and_then(|v| v.as_str()).unwrap_or("");
        let preview: String = content.chars().take(60).collect();
        format!("Remember: {}", preview)
    }

    async fn invoke(&self, args: &Value, ctx: &ToolContext<'_>) -> Result<ToolOutput, ToolError> {
        let args: RememberArgs = parse_args(args)?;
        let mut metadata = match args.metadata {
            Some(Value::Object(map)) => Value::Object(map),
            _ => json!({}),
        };
        metadata["task_id"] = json!(ctx.task.id);
        if let Some(company) = ctx.working.var_str("company") {
            metadata["company"] = json!(company);
        }

        let id = ctx
            .memory
            .remember(ctx.user.id, &args.content, metadata)
            .await?;
        Ok(ToolOutput::new(
            json!({"memory_id": id}),
            json!({"outcome_recorded": true}),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{tool_fixture, ToolFixture};

    #[test]
    fn test_recall_validation() {
        let handler = RecallMemoryHandler::new(Duration::from_secs(5));
        assert!(handler.validate(&json!({"query": "comcast"})).is_ok());
        assert!(handler.validate(&json!({"query": "comcast", "limit": 5})).is_ok());
        assert!(handler.validate(&json!({"query": "comcast", "limit": 0})).is_err());
        assert!(handler.validate(&json!({"query": "comcast", "limit": 500})).is_err());
        assert!(handler.validate(&json!({"query": " "})).is_err());
        assert!(handler.validate(&json!({"q": "comcast"})).is_err());
    }

    #[test]
    fn test_remember_validation() {
        let handler = RememberHandler::new(Duration::from_secs(5));
        assert!(handler.validate(&json!({"content": "done"})).is_ok());
        assert!(handler
            .validate(&json!({"content": "done", "metadata": {"k": 1}}))
            .is_ok());
        assert!(handler
            .validate(&json!({"content": "done", "metadata": [1]}))
            .is_err());
        assert!(handler.validate(&json!({"content": ""})).is_err());
    }

    #[tokio::test]
    async fn test_recall_extracts_known_number() {
        let ToolFixture {
            memory,
            task,
            user,
            working,
            fakes,
        } = tool_fixture();
        memory
            .remember(
                user.id,
                "Comcast support reached at 800-934-6489 last year",
                json!({}),
            )
            .await
            .unwrap();
        let collaborators = fakes.collaborators();
        let ctx = ToolContext {
            task: &task,
            user: &user,
            working: &working,
            memory: &memory,
            collaborators: &collaborators,
        };

        let handler = RecallMemoryHandler::new(Duration::from_secs(5));
        let out = handler
            .invoke(&json!({"query": "comcast support reached"}), &ctx)
            .await
            .unwrap();
        assert_eq!(out.result["phone_numbers"], json!(["800-934-6489"]));
        assert_eq!(out.context["contact_number"], "800-934-6489");
        assert_eq!(out.context["memory_checked"], true);
    }

    #[tokio::test]
    async fn test_recall_skips_invalid_contacts() {
        let ToolFixture {
            memory,
            task,
            user,
            mut working,
            fakes,
        } = tool_fixture();
        memory
            .remember(user.id, "Comcast number 800-934-6489", json!({}))
            .await
            .unwrap();
        working.set_var("invalid_contacts", json!(["8009346489"]));
        let collaborators = fakes.collaborators();
        let ctx = ToolContext {
            task: &task,
            user: &user,
            working: &working,
            memory: &memory,
            collaborators: &collaborators,
        };

        let handler = RecallMemoryHandler::new(Duration::from_secs(5));
        let out = handler
            .invoke(&json!({"query": "comcast number"}), &ctx)
            .await
            .unwrap();
        assert_eq!(out.result["phone_numbers"], json!([]));
        assert!(out.context.get("contact_number").is_none());
    }

    #[tokio::test]
    async fn test_remember_tags_task() {
        let ToolFixture {
            memory,
            task,
            user,
            mut working,
            fakes,
        } = tool_fixture();
        working.set_var("company", json!("Comcast"));
        let collaborators = fakes.collaborators();
        let ctx = ToolContext {
            task: &task,
            user: &user,
            working: &working,
            memory: &memory,
            collaborators: &collaborators,
        };

        let handler = RememberHandler::new(Duration::from_secs(5));
        handler
            .invoke(&json!({"content": "Cancelled Comcast, ref CX123"}), &ctx)
            .await
            .unwrap();

        let hits = memory
            .recall(user.id, "comcast cancelled", None, Some(0.0))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].metadata["task_id"], json!(task.id));
        assert_eq!(hits[0].metadata["company"], "Comcast");
    }
}
