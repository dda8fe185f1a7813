//! Telephony handlers: dial out and speak into the live call.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use taskpilot_core::types::{ActionKind, Timestamp};

use crate::collaborators::{CallBrief, CallHandle};
use crate::error::ToolError;
use crate::tools::{
    looks_like_phone, parse_args, require_non_empty, RiskClass, ToolContext, ToolDescriptor,
    ToolHandler, ToolOutput,
};

const MAX_TEXT_CHARS: usize = 2_000;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PlaceCallArgs {
    number: String,
    company: String,
    objective: String,
}

/// Places an outbound call. Vault credentials for the company are decrypted
/// into the call brief only here, right before dialing.
pub struct PlaceCallHandler {
    timeout: Duration,
}

impl PlaceCallHandler {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl ToolHandler for PlaceCallHandler {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            action: ActionKind::PlaceCall,
            risk: RiskClass::AccountChange,
            idempotent: false,
            timeout: self.timeout,
        }
    }

    fn validate(&self, args: &Value) -> Result<(), ToolError> {
        let args: PlaceCallArgs = parse_args(args)?;
        require_non_empty("company", &args.company)?;
        require_non_empty("objective", &args.objective)?;
        if !looks_like_phone(&args.number) {
            return Err(ToolError::Validation(format!(
                "'{}' is not a dialable number",
                args.number
            )));
        }
        Ok(())
    }

    fn describe(&self, args: &Value) -> String {
        let company = args.get("company").and_then(|v| v.as_str()).unwrap_or("?");
        let number = args.get("number").and_then(|v| v.as_str()).unwrap_or("?");
        let objective = args.get("objective").and_then(|v| v.as_str()).unwrap_or("");
        format!("Call {} at {}: {}", company, number, objective)
    }

    async fn invoke(&self, args: &Value, ctx: &ToolContext<'_>) -> Result<ToolOutput, ToolError> {
        let args: PlaceCallArgs = parse_args(args)?;
        let credentials = ctx.memory.reveal_credentials(ctx.user.id, &args.company)?;

        let brief = CallBrief {
            company: args.company.clone(),
            objective: args.objective.clone(),
            caller_name: ctx.user.name.clone(),
            account_number: credentials.as_ref().map(|c| c.account_number.clone()),
            secret: credentials.map(|c| c.secret),
        };
        let handle = ctx
            .collaborators
            .telephony
            .place_call(&args.number, &brief)
            .await?;

        Ok(ToolOutput::new(
            json!({"call_id": handle.id, "number": args.number}),
            json!({
                "call_id": handle.id,
                "called_number": args.number,
                "call_started_at": Timestamp::now().0,
                "interaction_channel": "call",
            }),
        ))
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SendTextArgs {
    text: String,
}

/// Speaks one turn into the active call.
pub struct SendTextHandler {
    timeout: Duration,
}

impl SendTextHandler {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl ToolHandler for SendTextHandler {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            action: ActionKind::SendText,
            risk: RiskClass::Communication,
            idempotent: false,
            timeout: self.timeout,
        }
    }

    fn validate(&self, args: &Value) -> Result<(), ToolError> {
        let args: SendTextArgs = parse_args(args)?;
        require_non_empty("text", &args.text)?;
        if args.text.chars().count() > MAX_TEXT_CHARS {
            return Err(ToolError::Validation(format!(
                "text exceeds {} characters",
                MAX_TEXT_CHARS
            )));
        }
        Ok(())
    }

    fn describe(&self, args: &Value) -> String {
        let text = args.get("text").and_then(|v| v.as_str()).unwrap_or("");
        let preview: String = text.chars().take(80).collect();
        format!("Say on call: {}", preview)
    }

    async fn invoke(&self, args: &Value, ctx: &ToolContext<'_>) -> Result<ToolOutput, ToolError> {
        let args: SendTextArgs = parse_args(args)?;
        let call_id = ctx
            .working
            .var_str("call_id")
            .ok_or_else(|| ToolError::Validation("No active call".into()))?;
        let handle = CallHandle {
            id: call_id.to_string(),
        };

        ctx.collaborators
            .telephony
            .send_text(&handle, &args.text)
            .await?;
        Ok(ToolOutput::new(
            json!({"delivered": true, "call_id": call_id}),
            json!({"last_agent_turn": args.text}),
        ))
    }
}
