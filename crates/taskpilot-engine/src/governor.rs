//! Safety governor: risk assessment for every tool dispatch.
//!
//! Rules are evaluated in a fixed order and the first one that decides
//! wins: overrides, blocked actions, sensitive arguments, step confidence,
//! irreversible risk, then allow.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use taskpilot_core::config::{GovernorConfig, PolicyDecision, PolicyOverride};
use taskpilot_core::sensitive;
use taskpilot_core::types::{normalize_company, ActionKind};

use crate::tools::RiskClass;

/// Machine-readable reason attached to every assessment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskReason {
    Informational,
    IrreversibleAction,
    SensitiveArgument,
    LowConfidence,
    BlockedAction,
    PolicyOverride,
}

impl RiskReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskReason::Informational => "informational",
            RiskReason::IrreversibleAction => "irreversible_action",
            RiskReason::SensitiveArgument => "sensitive_argument",
            RiskReason::LowConfidence => "low_confidence",
            RiskReason::BlockedAction => "blocked_action",
            RiskReason::PolicyOverride => "policy_override",
        }
    }
}

impl fmt::Display for RiskReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assessment {
    pub decision: PolicyDecision,
    pub reason: RiskReason,
}

impl Assessment {
    fn new(decision: PolicyDecision, reason: RiskReason) -> Self {
        Self { decision, reason }
    }
}

/// Inputs to one assessment.
#[derive(Debug, Clone, Copy)]
pub struct AssessmentRequest<'a> {
    pub user_id: Uuid,
    pub company: Option<&'a str>,
    pub action: ActionKind,
    pub risk: RiskClass,
    pub arguments: &'a Value,
    pub step_confidence: f64,
}

fn financial_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b(?:payments?|pay|charge|refund|wire|transfer|purchase|buy|upgrade|downgrade|bank\s+account|routing\s+number)\b",
        )
        .expect("Invalid financial keyword regex")
    })
}

fn mentions_financial_change(value: &Value) -> bool {
    match value {
        Value::String(s) => financial_re().is_match(s),
        Value::Array(items) => items.iter().any(mentions_financial_change),
        Value::Object(map) => map.values().any(mentions_financial_change),
        _ => false,
    }
}

pub struct SafetyGovernor {
    config: GovernorConfig,
}

impl SafetyGovernor {
    pub fn new(config: GovernorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GovernorConfig {
        &self.config
    }

    pub fn assess(&self, request: &AssessmentRequest<'_>) -> Assessment {
        if let Some(rule) = self
            .config
            .overrides
            .iter()
            .find(|rule| override_matches(rule, request))
        {
            return Assessment::new(rule.decision, RiskReason::PolicyOverride);
        }

        if self.config.blocked_actions.contains(&request.action) {
            return Assessment::new(PolicyDecision::Deny, RiskReason::BlockedAction);
        }

        if !sensitive::find_in_value(request.arguments).is_empty()
            && self.config.sensitive_arguments != PolicyDecision::Allow
        {
            return Assessment::new(
                self.config.sensitive_arguments,
                RiskReason::SensitiveArgument,
            );
        }

        if request.step_confidence < self.config.step_confidence_threshold {
            return Assessment::new(PolicyDecision::RequireConfirmation, RiskReason::LowConfidence);
        }

        let irreversible = request.risk == RiskClass::AccountChange
            || (request.risk != RiskClass::Informational
                && mentions_financial_change(request.arguments));
        if irreversible && self.config.irreversible != PolicyDecision::Allow {
            return Assessment::new(self.config.irreversible, RiskReason::IrreversibleAction);
        }

        Assessment::new(PolicyDecision::Allow, RiskReason::Informational)
    }
}

fn override_matches(rule: &PolicyOverride, request: &AssessmentRequest<'_>) -> bool {
    let user_ok = rule.user_id.map_or(true, |id| id == request.user_id);
    let action_ok = rule.action.map_or(true, |a| a == request.action);
    let company_ok = match (&rule.company, request.company) {
        (None, _) => true,
        (Some(wanted), Some(actual)) => normalize_company(wanted) == normalize_company(actual),
        (Some(_), None) => false,
    };
    user_ok && action_ok && company_ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request<'a>(
        action: ActionKind,
        risk: RiskClass,
        arguments: &'a Value,
        confidence: f64,
    ) -> AssessmentRequest<'a> {
        AssessmentRequest {
            user_id: Uuid::nil(),
            company: Some("Comcast"),
            action,
            risk,
            arguments,
            step_confidence: confidence,
        }
    }

    fn governor() -> SafetyGovernor {
        SafetyGovernor::new(GovernorConfig::default())
    }

    // =====================================================================
    // Default rules
    // =====================================================================

    #[test]
    fn test_informational_allowed() {
        let args = json!({"query": "Comcast phone number"});
        let a = governor().assess(&request(
            ActionKind::WebSearch,
            RiskClass::Informational,
            &args,
            0.9,
        ));
        assert_eq!(a, Assessment::new(PolicyDecision::Allow, RiskReason::Informational));
    }

    #[test]
    fn test_account_change_requires_confirmation() {
        let args = json!({"number": "800-934-6489", "company": "Comcast", "objective": "Cancel"});
        let a = governor().assess(&request(
            ActionKind::PlaceCall,
            RiskClass::AccountChange,
            &args,
            0.9,
        ));
        assert_eq!(a.decision, PolicyDecision::RequireConfirmation);
        assert_eq!(a.reason, RiskReason::IrreversibleAction);
    }

    #[test]
    fn test_financial_keyword_in_communication_is_irreversible() {
        let args = json!({"text": "Please process a refund to my card"});
        let a = governor().assess(&request(
            ActionKind::SendText,
            RiskClass::Communication,
            &args,
            0.9,
        ));
        assert_eq!(a.reason, RiskReason::IrreversibleAction);

        let benign = json!({"text": "I'd like to cancel my service"});
        let a = governor().assess(&request(
            ActionKind::SendText,
            RiskClass::Communication,
            &benign,
            0.9,
        ));
        assert_eq!(a.decision, PolicyDecision::Allow);
    }

    #[test]
    fn test_sensitive_argument_denied() {
        let args = json!({"text": "My card is 4111 1111 1111 1111"});
        let a = governor().assess(&request(
            ActionKind::SendText,
            RiskClass::Communication,
            &args,
            0.9,
        ));
        assert_eq!(a, Assessment::new(PolicyDecision::Deny, RiskReason::SensitiveArgument));

        let args = json!({"to": "a@b.com", "subject": "s", "body": "b", "password": "hunter2"});
        let a = governor().assess(&request(
            ActionKind::SendEmail,
            RiskClass::Communication,
            &args,
            0.9,
        ));
        assert_eq!(a.reason, RiskReason::SensitiveArgument);
    }

    #[test]
    fn test_blocked_action_denied() {
        let config = GovernorConfig {
            blocked_actions: vec![ActionKind::SendEmail],
            ..GovernorConfig::default()
        };
        let args = json!({});
        let a = SafetyGovernor::new(config).assess(&request(
            ActionKind::SendEmail,
            RiskClass::Communication,
            &args,
            1.0,
        ));
        assert_eq!(a, Assessment::new(PolicyDecision::Deny, RiskReason::BlockedAction));
    }

    // =====================================================================
    // Overrides
    // =====================================================================

    #[test]
    fn test_company_override_wins_first() {
        let config = GovernorConfig {
            blocked_actions: vec![ActionKind::PlaceCall],
            overrides: vec![PolicyOverride {
                user_id: None,
                company: Some("  COMCAST ".into()),
                action: Some(ActionKind::PlaceCall),
                decision: PolicyDecision::Allow,
            }],
            ..GovernorConfig::default()
        };
        let args = json!({});
        let a = SafetyGovernor::new(config).assess(&request(
            ActionKind::PlaceCall,
            RiskClass::AccountChange,
            &args,
            0.1,
        ));
        assert_eq!(a, Assessment::new(PolicyDecision::Allow, RiskReason::PolicyOverride));
    }

    #[test]
    fn test_override_selectors_must_all_match() {
        let user = Uuid::new_v4();
        let rule = PolicyOverride {
            user_id: Some(user),
            company: Some("verizon".into()),
            action: None,
            decision: PolicyDecision::Deny,
        };
        let args = json!({});
        let mut req = request(ActionKind::WebSearch, RiskClass::Informational, &args, 0.9);
        assert!(!override_matches(&rule, &req));
        req.user_id = user;
        assert!(!override_matches(&rule, &req));
        req.company = Some("Verizon");
        assert!(override_matches(&rule, &req));
        req.company = None;
        assert!(!override_matches(&rule, &req));
    }

    #[test]
    fn test_configured_allow_falls_through() {
        let config = GovernorConfig {
            sensitive_arguments: PolicyDecision::Allow,
            irreversible: PolicyDecision::Allow,
            ..GovernorConfig::default()
        };
        let args = json!({"secret": "x"});
        let a = SafetyGovernor::new(config).assess(&request(
            ActionKind::PlaceCall,
            RiskClass::AccountChange,
            &args,
            0.9,
        ));
        assert_eq!(a, Assessment::new(PolicyDecision::Allow, RiskReason::Informational));
    }

    // =====================================================================
    // Threshold properties
    // =====================================================================

    #[test]
    fn test_step_confidence_threshold_property() {
        let args = json!({"query": "x"});
        for threshold in [0.0, 0.25, 0.5, 0.75, 0.9, 1.0] {
            let gov = SafetyGovernor::new(GovernorConfig {
                step_confidence_threshold: threshold,
                ..GovernorConfig::default()
            });
            for confidence in [0.0, 0.1, 0.3, 0.5, 0.6, 0.8, 0.95, 1.0] {
                let a = gov.assess(&request(
                    ActionKind::WebSearch,
                    RiskClass::Informational,
                    &args,
                    confidence,
                ));
                if confidence < threshold {
                    assert_eq!(
                        a,
                        Assessment::new(PolicyDecision::RequireConfirmation, RiskReason::LowConfidence),
                        "threshold {} confidence {}",
                        threshold,
                        confidence
                    );
                } else {
                    assert_eq!(a.decision, PolicyDecision::Allow);
                }
            }
        }
    }

    #[test]
    fn test_low_confidence_never_downgrades_deny() {
        let args = json!({"text": "SSN 123-45-6789"});
        for confidence in [0.0, 0.4, 1.0] {
            let a = governor().assess(&request(
                ActionKind::SendText,
                RiskClass::Communication,
                &args,
                confidence,
            ));
            assert_eq!(a.decision, PolicyDecision::Deny);
        }
    }

    #[test]
    fn test_reason_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&RiskReason::IrreversibleAction).unwrap(),
            "\"irreversible_action\""
        );
        assert_eq!(RiskReason::PolicyOverride.to_string(), "policy_override");
    }
}
