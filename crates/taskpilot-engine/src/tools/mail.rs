//! Outbound mail handlers.

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

fn check_address(to: &str) -> Result<(), ToolError> {
    let valid = match to.trim().split_once('@') {
        Some((local, domain)) => !local.is_empty() && domain.contains('.'),
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(ToolError::Validation(format!("'{}' is not an email address", to)))
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SendEmailArgs {
    to: String,
    subject: String,
    body: String,
}

/// Sends an email to a counterpart. One send concludes the exchange.
pub struct SendEmailHandler {
    timeout: Duration,
}

impl SendEmailHandler {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl ToolHandler for SendEmailHandler {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            action: ActionKind::SendEmail,
            risk: RiskClass::Communication,
            idempotent: false,
            timeout: self.timeout,
        }
    }

    fn validate(&self, args: &Value) -> Result<(), ToolError> {
        let args: SendEmailArgs = parse_args(args)?;
        check_address(&args.to)?;
        require_non_empty("subject", &args.subject)?;
        require_non_empty("body", &args.body)
    }

    fn describe(&self, args: &Value) -> String {
        let to = args.get("to").and_then(|v| v.as_str()).unwrap_or("?");
        let subject = args.get("subject").and_then(|v| v.as_str()).unwrap_or("");
        format!("Email {}: {}", to, subject)
    }

    async fn invoke(&self, args: &Value, ctx: &ToolContext<'_>) -> Result<ToolOutput, ToolError> {
        let args: SendEmailArgs = parse_args(args)?;
        ctx.collaborators
            .mail
            .send(args.to.trim(), &args.subject, &args.body)
            .await?;
        Ok(ToolOutput::new(
            json!({"sent": true, "to": args.to}),
            json!({
                "email_sent": true,
                "interaction_channel": "email",
                "interaction_concluded": true,
            }),
        )
        .with_units(1.0))
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct NotifyUserArgs {
    subject: String,
    body: String,
}

/// Mails the task owner. The recipient always comes from the user record.
pub struct NotifyUserHandler {
    timeout: Duration,
}

impl NotifyUserHandler {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl ToolHandler for NotifyUserHandler {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            action: ActionKind::NotifyUser,
            risk: RiskClass::Informational,
            idempotent: false,
            timeout: self.timeout,
        }
    }

    fn validate(&self, args: &Value) -> Result<(), ToolError> {
        let args: NotifyUserArgs = parse_args(args)?;
        require_non_empty("subject", &args.subject)?;
        require_non_empty("body", &args.body)
    }

    fn describe(&self, args: &Value) -> String {
        let subject = args.get("subject").and_then(|v| v.as_str()).unwrap_or("");
        format!("Notify user: {}", subject)
    }

    async fn invoke(&self, args: &Value, ctx: &ToolContext<'_>) -> Result<ToolOutput, ToolError> {
        let args: NotifyUserArgs = parse_args(args)?;
        ctx.collaborators
            .mail
            .send(&ctx.user.email, &args.subject, &args.body)
            .await?;
        Ok(ToolOutput::new(
            json!({"notified": ctx.user.email}),
            json!({"user_notified": true}),
        )
        .with_units(1.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{tool_fixture, ToolFixture};

    #[test]
    fn test_check_address() {
        assert!(check_address("support@comcast.com").is_ok());
        assert!(check_address(" a@b.io ").is_ok());
        assert!(check_address("no-at-sign").is_err());
        assert!(check_address("@nolocal.com").is_err());
        assert!(check_address("user@localhost").is_err());
    }

    #[test]
    fn test_send_email_validation() {
        let handler = SendEmailHandler::new(Duration::from_secs(5));
        assert!(handler
            .validate(&json!({"to": "a@b.com", "subject": "Re: bill", "body": "Thanks"}))
            .is_ok());
        assert!(handler
            .validate(&json!({"to": "a@b.com", "subject": "", "body": "Thanks"}))
            .is_err());
        assert!(handler
            .validate(&json!({"to": "a@b.com", "subject": "s", "body": "b", "cc": "x@y.z"}))
            .is_err());
    }

    #[tokio::test]
    async fn test_send_email_concludes_interaction() {
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

        let out = SendEmailHandler::new(Duration::from_secs(5))
            .invoke(
                &json!({"to": "billing@acme.com", "subject": "Re: invoice", "body": "Paid."}),
                &ctx,
            )
            .await
            .unwrap();
        assert_eq!(out.context["interaction_concluded"], true);
        let sent = fakes.mail.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "billing@acme.com");
    }

    #[tokio::test]
    async fn test_notify_user_uses_owner_address() {
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

        NotifyUserHandler::new(Duration::from_secs(5))
            .invoke(&json!({"subject": "Done", "body": "All set"}), &ctx)
            .await
            .unwrap();
        let sent = fakes.mail.sent();
        assert_eq!(sent[0].to, user.email);
        assert_eq!(sent[0].subject, "Done");
    }
}
