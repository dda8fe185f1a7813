//! Vault lookup handler.
//!
//! Never decrypts. It reports whether credentials exist for the company and
//! exposes only the masked account hint; `place_call` decrypts just in time.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use taskpilot_core::types::ActionKind;

use crate::error::ToolError;
use crate::tools::{
    parse_args, require_non_empty, RiskClass, ToolContext, ToolDescriptor, ToolHandler,
    ToolOutput,
};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RetrieveCredentialsArgs {
    company: String,
}

pub struct RetrieveCredentialsHandler {
    timeout: Duration,
}

impl RetrieveCredentialsHandler {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl ToolHandler for RetrieveCredentialsHandler {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            action: ActionKind::RetrieveCredentials,
            risk: RiskClass::Informational,
            idempotent: true,
            timeout: self.timeout,
        }
    }

    fn validate(&self, args: &Value) -> Result<(), ToolError> {
        let args: RetrieveCredentialsArgs = parse_args(args)?;
        require_non_empty("company", &args.company)
    }

    fn describe(&self, args: &Value) -> String {
        let company = args.get("company").and_then(|v| v.as_str()).unwrap_or("?");
        format!("Look up stored credentials for {}", company)
    }

    async fn invoke(&self, args: &Value, ctx: &ToolContext<'_>) -> Result<ToolOutput, ToolError> {
        let args: RetrieveCredentialsArgs = parse_args(args)?;
        let summary = ctx.memory.credential_summary(ctx.user.id, &args.company)?;

        let output = match summary {
            Some(summary) => ToolOutput::new(
                json!({
                    "found": true,
                    "credential_id": summary.id,
                    "account_hint": summary.account_hint,
                }),
                json!({
                    "credentials_checked": true,
                    "credential_id": summary.id,
                    "account_hint": summary.account_hint,
                }),
            ),
            None => ToolOutput::new(
                json!({"found": false}),
                json!({"credentials_checked": true, "credential_id": null}),
            ),
        };
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{tool_fixture, ToolFixture};

    #[test]
    fn test_validate_rejects_unknown_fields() {
        let handler = RetrieveCredentialsHandler::new(Duration::from_secs(5));
        assert!(handler.validate(&json!({"company": "Comcast"})).is_ok());
        assert!(handler.validate(&json!({"company": ""})).is_err());
        assert!(handler.validate(&json!({})).is_err());
        assert!(handler
            .validate(&json!({"company": "Comcast", "pin": "1234"}))
            .is_err());
    }

    #[tokio::test]
    async fn test_invoke_without_vault_entry() {
        let ToolFixture {
            memory,
            task,
            user,
            working,
            fakes,
        } = tool_fixture();
        let collaborators = fakes.collaborators();
        let ctx = ToolContext {
            task: &task,
            user: &user,
            working: &working,
            memory: &memory,
            collaborators: &collaborators,
        };

        let handler = RetrieveCredentialsHandler::new(Duration::from_secs(5));
        let out = handler
            .invoke(&json!({"company": "Comcast"}), &ctx)
            .await
            .unwrap();
        assert_eq!(out.result["found"], false);
        assert_eq!(out.context["credentials_checked"], true);
    }

    #[tokio::test]
    async fn test_invoke_returns_masked_hint_only() {
        let ToolFixture {
            memory,
            task,
            user,
            working,
            fakes,
        } = tool_fixture();
        memory
            .store_credentials(user.id, "Comcast", "8771234567", "2468", &json!({}))
            .unwrap();
        let collaborators = fakes.collaborators();
        let ctx = ToolContext {
            task: &task,
            user: &user,
            working: &working,
            memory: &memory,
            collaborators: &collaborators,
        };

        let handler = RetrieveCredentialsHandler::new(Duration::from_secs(5));
        let out = handler
            .invoke(&json!({"company": "comcast"}), &ctx)
            .await
            .unwrap();
        assert_eq!(out.result["found"], true);
        let rendered = out.result.to_string() + &out.context.to_string();
        assert!(!rendered.contains("2468"));
        assert!(!rendered.contains("8771234567"));
        assert!(out.context["account_hint"].as_str().unwrap().ends_with("4567"));
    }
}
