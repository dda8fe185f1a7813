//! Task state machine with validated transitions.
//!
//! INIT -> GATHER_INFO -> RESEARCH -> READY_TO_EXECUTE -> CALL_IN_PROGRESS
//! <-> AWAITING_USER_INPUT -> SUMMARIZE -> COMPLETED, with FAILED and
//! ESCALATED reachable from every non-terminal state.

use std::fmt;

use serde::{Deserialize, Serialize};
use taskpilot_core::types::TaskState;

use crate::error::EngineError;

/// Named reason for a state change. Each variant is one row of the
/// transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    IntentConfirmed,
    IntakeError,
    RequiredDataPresent,
    GatheringExhausted,
    ValidContactFound,
    NoValidContact,
    FirstToolDispatched,
    ToolValidationRejected,
    AwaitingCounterpart,
    InteractionConcluded,
    MissingCredential,
    ContactInvalid,
    InputReceived,
    InputSignalsCompletion,
    InputTimeoutRetry,
    InputTimeoutExhausted,
    SummaryDelivered,
    SummaryFailed,
    /// Unrecoverable, high-risk or repeated failure.
    Escalate,
    /// Critical or internal error.
    CriticalError,
    /// External cancellation: ESCALATED mid-interaction, FAILED otherwise.
    Cancelled,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::IntentConfirmed => "intent_confirmed",
            Trigger::IntakeError => "intake_error",
            Trigger::RequiredDataPresent => "required_data_present",
            Trigger::GatheringExhausted => "gathering_exhausted",
            Trigger::ValidContactFound => "valid_contact_found",
            Trigger::NoValidContact => "no_valid_contact",
            Trigger::FirstToolDispatched => "first_tool_dispatched",
            Trigger::ToolValidationRejected => "tool_validation_rejected",
            Trigger::AwaitingCounterpart => "awaiting_counterpart",
            Trigger::InteractionConcluded => "interaction_concluded",
            Trigger::MissingCredential => "missing_credential",
            Trigger::ContactInvalid => "contact_invalid",
            Trigger::InputReceived => "input_received",
            Trigger::InputSignalsCompletion => "input_signals_completion",
            Trigger::InputTimeoutRetry => "input_timeout_retry",
            Trigger::InputTimeoutExhausted => "input_timeout_exhausted",
            Trigger::SummaryDelivered => "summary_delivered",
            Trigger::SummaryFailed => "summary_failed",
            Trigger::Escalate => "escalate",
            Trigger::CriticalError => "critical_error",
            Trigger::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolve the target state for `trigger` fired in `from`.
pub fn next_state(from: TaskState, trigger: Trigger) -> Result<TaskState, EngineError> {
    use TaskState::*;

    if from.is_terminal() {
        return Err(EngineError::UnexpectedTrigger(from, trigger));
    }

    let to = match (from, trigger) {
        (_, Trigger::Escalate) => Some(Escalated),
        (_, Trigger::CriticalError) => Some(Failed),
        (state, Trigger::Cancelled) => Some(if state.is_interactive() {
            Escalated
        } else {
            Failed
        }),
        (Init, Trigger::IntentConfirmed) => Some(GatherInfo),
        (Init, Trigger::IntakeError) => Some(Failed),
        (GatherInfo, Trigger::RequiredDataPresent) => Some(Research),
        (GatherInfo, Trigger::GatheringExhausted) => Some(Failed),
        (Research, Trigger::ValidContactFound) => Some(ReadyToExecute),
        (Research, Trigger::NoValidContact) => Some(Failed),
        (ReadyToExecute, Trigger::FirstToolDispatched) => Some(CallInProgress),
        (ReadyToExecute, Trigger::ToolValidationRejected) => Some(Failed),
        (CallInProgress, Trigger::AwaitingCounterpart) => Some(AwaitingUserInput),
        (CallInProgress, Trigger::InteractionConcluded) => Some(Summarize),
        (CallInProgress, Trigger::MissingCredential) => Some(GatherInfo),
        (CallInProgress, Trigger::ContactInvalid) => Some(Research),
        (AwaitingUserInput, Trigger::InputReceived) => Some(CallInProgress),
        (AwaitingUserInput, Trigger::InputSignalsCompletion) => Some(Summarize),
        (AwaitingUserInput, Trigger::InputTimeoutRetry) => Some(Research),
        (AwaitingUserInput, Trigger::InputTimeoutExhausted) => Some(Escalated),
        (Summarize, Trigger::SummaryDelivered) => Some(Completed),
        (Summarize, Trigger::SummaryFailed) => Some(Failed),
        _ => None,
    };

    to.ok_or(EngineError::UnexpectedTrigger(from, trigger))
}

/// Validate that a state transition is allowed.
pub fn validate_transition(from: TaskState, to: TaskState) -> Result<(), EngineError> {
    use TaskState::*;

    let valid = !from.is_terminal()
        && (matches!(to, Escalated | Failed)
            || matches!(
                (from, to),
                (Init, GatherInfo)
                    | (GatherInfo, Research)
                    | (Research, ReadyToExecute)
                    | (ReadyToExecute, CallInProgress)
                    | (CallInProgress, AwaitingUserInput)
                    | (CallInProgress, Summarize)
                    | (CallInProgress, GatherInfo)
                    | (CallInProgress, Research)
                    | (AwaitingUserInput, CallInProgress)
                    | (AwaitingUserInput, Summarize)
                    | (AwaitingUserInput, Research)
                    | (Summarize, Completed)
            ));

    if valid {
        Ok(())
    } else {
        Err(EngineError::InvalidTransition(from, to))
    }
}

pub fn is_terminal(state: TaskState) -> bool {
    state.is_terminal()
}

/// Check that a logged sequence of `(from, to)` pairs is a connected path
/// from INIT through valid transitions.
pub fn is_valid_path(transitions: &[(TaskState, TaskState)]) -> bool {
    let mut current = TaskState::Init;
    for (from, to) in transitions {
        if *from != current || validate_transition(*from, *to).is_err() {
            return false;
        }
        current = *to;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use TaskState::*;

    const ALL_TRIGGERS: [Trigger; 21] = [
        Trigger::IntentConfirmed,
        Trigger::IntakeError,
        Trigger::RequiredDataPresent,
        Trigger::GatheringExhausted,
        Trigger::ValidContactFound,
        Trigger::NoValidContact,
        Trigger::FirstToolDispatched,
        Trigger::ToolValidationRejected,
        Trigger::AwaitingCounterpart,
        Trigger::InteractionConcluded,
        Trigger::MissingCredential,
        Trigger::ContactInvalid,
        Trigger::InputReceived,
        Trigger::InputSignalsCompletion,
        Trigger::InputTimeoutRetry,
        Trigger::InputTimeoutExhausted,
        Trigger::SummaryDelivered,
        Trigger::SummaryFailed,
        Trigger::Escalate,
        Trigger::CriticalError,
        Trigger::Cancelled,
    ];

    // =====================================================================
    // Table rows
    // =====================================================================

    #[test]
    fn test_happy_path_triggers() {
        let path = [
            (Init, Trigger::IntentConfirmed, GatherInfo),
            (GatherInfo, Trigger::RequiredDataPresent, Research),
            (Research, Trigger::ValidContactFound, ReadyToExecute),
            (ReadyToExecute, Trigger::FirstToolDispatched, CallInProgress),
            (CallInProgress, Trigger::InteractionConcluded, Summarize),
            (Summarize, Trigger::SummaryDelivered, Completed),
        ];
        for (from, trigger, to) in path {
            assert_eq!(next_state(from, trigger).unwrap(), to);
        }
    }

    #[test]
    fn test_interaction_rows() {
        assert_eq!(
            next_state(CallInProgress, Trigger::AwaitingCounterpart).unwrap(),
            AwaitingUserInput
        );
        assert_eq!(
            next_state(CallInProgress, Trigger::MissingCredential).unwrap(),
            GatherInfo
        );
        assert_eq!(
            next_state(CallInProgress, Trigger::ContactInvalid).unwrap(),
            Research
        );
        assert_eq!(
            next_state(AwaitingUserInput, Trigger::InputReceived).unwrap(),
            CallInProgress
        );
        assert_eq!(
            next_state(AwaitingUserInput, Trigger::InputSignalsCompletion).unwrap(),
            Summarize
        );
        assert_eq!(
            next_state(AwaitingUserInput, Trigger::InputTimeoutRetry).unwrap(),
            Research
        );
        assert_eq!(
            next_state(AwaitingUserInput, Trigger::InputTimeoutExhausted).unwrap(),
            Escalated
        );
    }

    #[test]
    fn test_failure_rows() {
        assert_eq!(next_state(Init, Trigger::IntakeError).unwrap(), Failed);
        assert_eq!(next_state(GatherInfo, Trigger::GatheringExhausted).unwrap(), Failed);
        assert_eq!(next_state(Research, Trigger::NoValidContact).unwrap(), Failed);
        assert_eq!(
            next_state(ReadyToExecute, Trigger::ToolValidationRejected).unwrap(),
            Failed
        );
        assert_eq!(next_state(Summarize, Trigger::SummaryFailed).unwrap(), Failed);
    }

    #[test]
    fn test_escalate_and_critical_from_every_non_terminal() {
        for state in TaskState::ALL.iter().filter(|s| !s.is_terminal()) {
            assert_eq!(next_state(*state, Trigger::Escalate).unwrap(), Escalated);
            assert_eq!(next_state(*state, Trigger::CriticalError).unwrap(), Failed);
        }
    }

    #[test]
    fn test_cancel_depends_on_interaction() {
        assert_eq!(next_state(Research, Trigger::Cancelled).unwrap(), Failed);
        assert_eq!(next_state(Init, Trigger::Cancelled).unwrap(), Failed);
        assert_eq!(next_state(CallInProgress, Trigger::Cancelled).unwrap(), Escalated);
        assert_eq!(
            next_state(AwaitingUserInput, Trigger::Cancelled).unwrap(),
            Escalated
        );
    }

    #[test]
    fn test_trigger_in_wrong_state_rejected() {
        let err = next_state(Init, Trigger::SummaryDelivered).unwrap_err();
        assert!(matches!(
            err,
            EngineError::UnexpectedTrigger(Init, Trigger::SummaryDelivered)
        ));
        assert!(next_state(Research, Trigger::InputReceived).is_err());
        assert!(next_state(Summarize, Trigger::IntentConfirmed).is_err());
    }

    // =====================================================================
    // Terminality
    // =====================================================================

    #[test]
    fn test_terminal_states_accept_no_trigger() {
        for state in [Completed, Failed, Escalated] {
            assert!(is_terminal(state));
            for trigger in ALL_TRIGGERS {
                assert!(next_state(state, trigger).is_err());
            }
            for to in TaskState::ALL {
                assert!(validate_transition(state, to).is_err());
            }
        }
    }

    #[test]
    fn test_every_trigger_result_passes_validation() {
        for from in TaskState::ALL {
            for trigger in ALL_TRIGGERS {
                if let Ok(to) = next_state(from, trigger) {
                    assert!(
                        validate_transition(from, to).is_ok(),
                        "{} --{}--> {} not in table",
                        from,
                        trigger,
                        to
                    );
                }
            }
        }
    }

    #[test]
    fn test_every_valid_transition_has_a_trigger() {
        for from in TaskState::ALL {
            for to in TaskState::ALL {
                if validate_transition(from, to).is_ok() {
                    assert!(
                        ALL_TRIGGERS
                            .iter()
                            .any(|t| next_state(from, *t).ok() == Some(to)),
                        "{} -> {} has no trigger",
                        from,
                        to
                    );
                }
            }
        }
    }

    // =====================================================================
    // Invalid transitions
    // =====================================================================

    #[test]
    fn test_no_self_transitions() {
        for state in TaskState::ALL {
            if !matches!(state, Failed | Escalated) {
                assert!(validate_transition(state, state).is_err());
            }
        }
    }

    #[test]
    fn test_skipping_phases_invalid() {
        assert!(validate_transition(Init, Research).is_err());
        assert!(validate_transition(GatherInfo, ReadyToExecute).is_err());
        assert!(validate_transition(Research, CallInProgress).is_err());
        assert!(validate_transition(ReadyToExecute, Summarize).is_err());
        assert!(validate_transition(Init, Completed).is_err());
        assert!(validate_transition(Summarize, Research).is_err());
    }

    #[test]
    fn test_invalid_transition_error_names_states() {
        let err = validate_transition(Failed, Research).unwrap_err();
        assert_eq!(err.to_string(), "Invalid state transition: failed -> research");
    }

    // =====================================================================
    // Paths
    // =====================================================================

    #[test]
    fn test_valid_path_check() {
        assert!(is_valid_path(&[
            (Init, GatherInfo),
            (GatherInfo, Research),
            (Research, ReadyToExecute),
            (ReadyToExecute, CallInProgress),
            (CallInProgress, AwaitingUserInput),
            (AwaitingUserInput, CallInProgress),
            (CallInProgress, Research),
            (Research, Failed),
        ]));
        assert!(is_valid_path(&[]));
        assert!(!is_valid_path(&[(GatherInfo, Research)]));
        assert!(!is_valid_path(&[(Init, GatherInfo), (Research, ReadyToExecute)]));
        assert!(!is_valid_path(&[(Init, Escalated), (Escalated, Research)]));
    }

    #[test]
    fn test_trigger_display() {
        assert_eq!(Trigger::InputTimeoutRetry.to_string(), "input_timeout_retry");
        let json = serde_json::to_string(&Trigger::ContactInvalid).unwrap();
        assert_eq!(json, "\"contact_invalid\"");
    }
}
