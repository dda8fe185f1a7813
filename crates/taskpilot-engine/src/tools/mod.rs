//! Tool handler registry and trait definition.
//!
//! Every [`ActionKind`] maps to one typed handler. Handlers parse their
//! arguments into a `deny_unknown_fields` struct, so a malformed step fails
//! validation before any external side effect.

pub mod call;
pub mod credentials;
pub mod mail;
pub mod memory;
pub mod search;

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use taskpilot_core::config::OrchestratorConfig;
use taskpilot_core::types::{ActionKind, Task, Usage, User, WorkingContext};
use taskpilot_memory::MemoryGateway;

use crate::collaborators::Collaborators;
use crate::error::{EngineError, ToolError};

/// Risk category used by the safety governor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskClass {
    Informational,
    Communication,
    AccountChange,
}

/// Static capability descriptor of a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToolDescriptor {
    pub action: ActionKind,
    pub risk: RiskClass,
    pub idempotent: bool,
    pub timeout: Duration,
}

/// Everything a handler may read while it runs.
pub struct ToolContext<'a> {
    pub task: &'a Task,
    pub user: &'a User,
    pub working: &'a WorkingContext,
    pub memory: &'a MemoryGateway,
    pub collaborators: &'a Collaborators,
}

/// Normalized success payload of a handler.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolOutput {
    pub result: Value,
    /// Working-context updates; `null` values remove keys.
    pub context: Value,
    pub usage: Usage,
}

impl ToolOutput {
    pub fn new(result: Value, context: Value) -> Self {
        Self {
            result,
            context,
            usage: Usage::default(),
        }
    }

    pub fn with_units(mut self, units: f64) -> Self {
        self.usage.units = units;
        self
    }
}

#[async_trait]
pub trait ToolHandler: Send + Sync {
    fn descriptor(&self) -> ToolDescriptor;

    /// Parse and check rendered arguments. Must not touch anything external.
    fn validate(&self, args: &Value) -> Result<(), ToolError>;

    /// Human-readable summary used for confirmations and the audit log.
    fn describe(&self, args: &Value) -> String;

    async fn invoke(&self, args: &Value, ctx: &ToolContext<'_>) -> Result<ToolOutput, ToolError>;
}

/// Parse `args` into a handler's typed argument struct.
pub fn parse_args<T: DeserializeOwned>(args: &Value) -> Result<T, ToolError> {
    serde_json::from_value(args.clone()).map_err(|e| ToolError::Validation(e.to_string()))
}

pub(crate) fn require_non_empty(field: &str, value: &str) -> Result<(), ToolError> {
    if value.trim().is_empty() {
        return Err(ToolError::Validation(format!("{} must not be empty", field)));
    }
    Ok(())
}

/// Registry of typed handlers keyed by action kind.
#[derive(Default)]
pub struct ToolRegistry {
    handlers: HashMap<ActionKind, Arc<dyn ToolHandler>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in handler for every action kind.
    pub fn with_defaults(config: &OrchestratorConfig) -> Self {
        let default_timeout = Duration::from_secs(config.default_timeout_secs);
        let call_timeout = Duration::from_secs(config.call_timeout_secs);

        let mut registry = Self::new();
        registry.register(Arc::new(credentials::RetrieveCredentialsHandler::new(
            default_timeout,
        )));
        registry.register(Arc::new(memory::RecallMemoryHandler::new(default_timeout)));
        registry.register(Arc::new(memory::RememberHandler::new(default_timeout)));
        registry.register(Arc::new(search::WebSearchHandler::new(default_timeout)));
        registry.register(Arc::new(call::PlaceCallHandler::new(call_timeout)));
        registry.register(Arc::new(call::SendTextHandler::new(default_timeout)));
        registry.register(Arc::new(mail::SendEmailHandler::new(default_timeout)));
        registry.register(Arc::new(mail::NotifyUserHandler::new(default_timeout)));
        registry
    }

    /// Insert or replace the handler for its descriptor's action.
    pub fn register(&mut self, handler: Arc<dyn ToolHandler>) {
        self.handlers.insert(handler.descriptor().action, handler);
    }

    pub fn get(&self, action: ActionKind) -> Option<Arc<dyn ToolHandler>> {
        self.handlers.get(&action).cloned()
    }

    pub fn descriptor(&self, action: ActionKind) -> Option<ToolDescriptor> {
        self.handlers.get(&action).map(|h| h.descriptor())
    }

    /// Startup check: every action kind has a handler with a usable timeout.
    pub fn validate(&self) -> Result<(), EngineError> {
        for action in ActionKind::ALL {
            let handler = self.handlers.get(&action).ok_or_else(|| {
                EngineError::Config(format!("No handler registered for action {}", action))
            })?;
            let descriptor = handler.descriptor();
            if descriptor.action != action {
                return Err(EngineError::Config(format!(
                    "Handler for {} describes itself as {}",
                    action, descriptor.action
                )));
            }
            if descriptor.timeout.is_zero() {
                return Err(EngineError::Config(format!(
                    "Handler for {} has a zero timeout",
                    action
                )));
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

// =============================================================================
// Argument templates
// =============================================================================

fn template_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z0-9_]+)\s*\}\}").expect("Invalid template regex")
    })
}

/// Substitute `{{name}}` references with working-context variables.
///
/// A string that is exactly one reference takes the variable's JSON value;
/// otherwise values are interpolated as text. An unknown variable is a
/// validation error.
pub fn render_arguments(template: &Value, ctx: &WorkingContext) -> Result<Value, ToolError> {
    match template {
        Value::String(s) => render_string(s, ctx),
        Value::Array(items) => items
            .iter()
            .map(|item| render_arguments(item, ctx))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, item) in map {
                out.insert(key.clone(), render_arguments(item, ctx)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn render_string(s: &str, ctx: &WorkingContext) -> Result<Value, ToolError> {
    let re = template_re();
    let lookup = |name: &str| {
        ctx.vars
            .get(name)
            .filter(|v| !v.is_null())
            .ok_or_else(|| ToolError::Validation(format!("Unresolved variable {{{{{}}}}}", name)))
    };

    if let Some(caps) = re.captures(s) {
        if caps.get(0).map(|m| m.as_str()) == Some(s.trim()) {
            return lookup(&caps[1]).cloned();
        }
    }

    let mut out = String::with_capacity(s.len());
    let mut last = 0;
    for caps in re.captures_iter(s) {
        let whole = match caps.get(0) {
            Some(m) => m,
            None => continue,
        };
        out.push_str(&s[last..whole.start()]);
        match lookup(&caps[1])? {
            Value::String(text) => out.push_str(text),
            other => out.push_str(&other.to_string()),
        }
        last = whole.end();
    }
    out.push_str(&s[last..]);
    Ok(Value::String(out))
}

// =============================================================================
// Phone numbers
// =============================================================================

fn phone_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?:\+?1[\s.-]?)?\(?\b\d{3}\)?[\s.-]?\d{3}[\s.-]?\d{4}\b")
            .expect("Invalid phone regex")
    })
}

/// Digits of a phone number with a leading US country code stripped.
pub fn normalize_phone(number: &str) -> String {
    let digits: String = number.chars().filter(|c| c.is_ascii_digit()).collect();
    match digits.strip_prefix('1') {
        Some(rest) if digits.len() == 11 => rest.to_string(),
        _ => digits,
    }
}

/// True if the string is plausibly a dialable phone number.
pub fn looks_like_phone(number: &str) -> bool {
    let allowed = number
        .chars()
        .all(|c| c.is_ascii_digit() || " +-().".contains(c));
    let digits = number.chars().filter(|c| c.is_ascii_digit()).count();
    allowed && (7..=15).contains(&digits)
}

/// Phone numbers found in `text`, in order, skipping duplicates and any
/// number in `exclude`.
pub fn extract_phone_numbers(text: &str, exclude: &[String]) -> Vec<String> {
    let excluded: Vec<String> = exclude.iter().map(|n| normalize_phone(n)).collect();
    let mut seen: Vec<String> = Vec::new();
    let mut found = Vec::new();
    for m in phone_re().find_iter(text) {
        let number = m.as_str().trim().to_string();
        let key = normalize_phone(&number);
        if excluded.contains(&key) || seen.contains(&key) {
            continue;
        }
        seen.push(key);
        found.push(number);
    }
    found
}

/// The contact to record from fresh candidates, unless the working context
/// already holds a usable one.
pub(crate) fn contact_update(ctx: &WorkingContext, candidates: &[String]) -> Option<String> {
    let invalid: Vec<String> = ctx
        .var_list("invalid_contacts")
        .iter()
        .map(|n| normalize_phone(n))
        .collect();
    let current_ok = ctx
        .var_str("contact_number")
        .is_some_and(|n| !invalid.contains(&normalize_phone(n)));
    if current_ok {
        return None;
    }
    candidates.first().cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn ctx_with(vars: Value) -> WorkingContext {
        let mut ctx = WorkingContext::new(Uuid::new_v4());
        ctx.merge(&vars);
        ctx
    }

    // =====================================================================
    // Registry
    // =====================================================================

    #[test]
    fn test_default_registry_covers_every_action() {
        let registry = ToolRegistry::with_defaults(&OrchestratorConfig::default());
        assert_eq!(registry.len(), ActionKind::ALL.len());
        assert!(registry.validate().is_ok());
        for action in ActionKind::ALL {
            assert_eq!(registry.descriptor(action).unwrap().action, action);
        }
    }

    #[test]
    fn test_incomplete_registry_fails_validation() {
        let mut registry = ToolRegistry::new();
        assert!(registry.is_empty());
        registry.register(Arc::new(search::WebSearchHandler::new(Duration::from_secs(5))));
        let err = registry.validate().unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
        assert!(err.to_string().contains("retrieve_credentials"));
    }

    #[test]
    fn test_zero_timeout_fails_validation() {
        let config = OrchestratorConfig {
            default_timeout_secs: 0,
            ..OrchestratorConfig::default()
        };
        let registry = ToolRegistry::with_defaults(&config);
        assert!(registry.validate().is_err());
    }

    #[test]
    fn test_descriptors_match_risk_table() {
        let registry = ToolRegistry::with_defaults(&OrchestratorConfig::default());
        let place = registry.descriptor(ActionKind::PlaceCall).unwrap();
        assert_eq!(place.risk, RiskClass::AccountChange);
        assert!(!place.idempotent);
        assert_eq!(place.timeout, Duration::from_secs(120));

        let search = registry.descriptor(ActionKind::WebSearch).unwrap();
        assert_eq!(search.risk, RiskClass::Informational);
        assert!(search.idempotent);

        for action in [
            ActionKind::PlaceCall,
            ActionKind::SendText,
            ActionKind::SendEmail,
            ActionKind::NotifyUser,
            ActionKind::Remember,
        ] {
            assert!(!registry.descriptor(action).unwrap().idempotent, "{}", action);
        }
    }

    // =====================================================================
    // Templates
    // =====================================================================

    #[test]
    fn test_render_whole_value_keeps_type() {
        let ctx = ctx_with(json!({"limit": 3, "company": "Comcast"}));
        let out = render_arguments(&json!({"limit": "{{limit}}", "q": "{{ company }}"}), &ctx)
            .unwrap();
        assert_eq!(out, json!({"limit": 3, "q": "Comcast"}));
    }

    #[test]
    fn test_render_interpolates_text() {
        let ctx = ctx_with(json!({"company": "Comcast", "attempt": 2}));
        let out = render_arguments(
            &json!(["{{company}} phone number (try {{attempt}})", 7, null]),
            &ctx,
        )
        .unwrap();
        assert_eq!(out, json!(["Comcast phone number (try 2)", 7, null]));
    }

    #[test]
    fn test_render_unknown_variable_is_validation_error() {
        let ctx = ctx_with(json!({"contact_number": null}));
        let err = render_arguments(&json!({"number": "{{contact_number}}"}), &ctx).unwrap_err();
        assert!(matches!(err, ToolError::Validation(_)));
        assert!(err.to_string().contains("{{contact_number}}"));
    }

    #[test]
    fn test_render_without_templates_is_identity() {
        let ctx = ctx_with(json!({}));
        let args = json!({"text": "plain", "nested": {"n": 1}});
        assert_eq!(render_arguments(&args, &ctx).unwrap(), args);
    }

    // =====================================================================
    // Phone numbers
    // =====================================================================

    #[test]
    fn test_extract_phone_numbers_formats() {
        let text = "Call 1-800-934-6489 or (800) 266-2278. Fax 800.555.0100.";
        let found = extract_phone_numbers(text, &[]);
        assert_eq!(found, vec!["1-800-934-6489", "(800) 266-2278", "800.555.0100"]);
    }

    #[test]
    fn test_extract_phone_numbers_dedup_and_exclude() {
        let text = "800-934-6489, +1 800 934 6489, 888-555-1234";
        let found = extract_phone_numbers(text, &["18889995555".into()]);
        assert_eq!(found, vec!["800-934-6489", "888-555-1234"]);

        let found = extract_phone_numbers(text, &["(800) 934-6489".into()]);
        assert_eq!(found, vec!["888-555-1234"]);
    }

    #[test]
    fn test_normalize_phone() {
        assert_eq!(normalize_phone("+1 (800) 934-6489"), "8009346489");
        assert_eq!(normalize_phone("800-934-6489"), "8009346489");
        assert_eq!(normalize_phone("44 20 7946 0958"), "442079460958");
    }

    #[test]
    fn test_looks_like_phone() {
        assert!(looks_like_phone("1-800-934-6489"));
        assert!(looks_like_phone("+44 20 7946 0958"));
        assert!(!looks_like_phone("call me"));
        assert!(!looks_like_phone("12345"));
        assert!(!looks_like_phone(""));
    }

    #[test]
    fn test_contact_update_respects_existing_valid_contact() {
        let candidates = vec!["888-555-1234".to_string()];
        let ctx = ctx_with(json!({"contact_number": "800-934-6489"}));
        assert_eq!(contact_update(&ctx, &candidates), None);

        let ctx = ctx_with(json!({
            "contact_number": "800-934-6489",
            "invalid_contacts": ["18009346489"]
        }));
        assert_eq!(
            contact_update(&ctx, &candidates),
            Some("888-555-1234".to_string())
        );

        let ctx = ctx_with(json!({}));
        assert_eq!(contact_update(&ctx, &[]), None);
    }
}
