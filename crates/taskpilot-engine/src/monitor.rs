//! Self-monitoring loop: failure counting, turn classification and loop
//! detection.
//!
//! The monitor never changes task state itself. It updates the task's
//! [`MonitorState`] counters and returns a [`Verdict`] the engine acts on.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use taskpilot_core::config::MonitorConfig;
use taskpilot_core::types::{MonitorState, Speaker, Subtask, TranscriptTurn};

/// What the engine should do after a failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", content = "reason", rename_all = "snake_case")]
pub enum Verdict {
    Replan(String),
    Escalate(String),
}

/// Classification of one counterpart utterance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnSignal {
    /// The counterpart reports the request done.
    Completion { reference: Option<String> },
    /// The counterpart asks for account details we did not supply.
    MissingCredential,
    /// Wrong number, wrong department or a dead line.
    InvalidContact,
    /// The counterpart did not understand the agent.
    Confusion,
    Continue,
}

fn completion_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b(?:has been|have been|is now|was|is)\s+(?:successfully\s+)?(?:cancell?ed|processed|completed|closed|terminated|taken care of)\b",
        )
        .expect("Invalid completion regex")
    })
}

fn reference_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b(?:confirmation|reference|ticket|case)\s*(?:number|no\.?|#|id|code)?\s*(?:is|:)?\s*#?([A-Z0-9][A-Z0-9-]{3,})",
        )
        .expect("Invalid reference regex")
    })
}

fn invalid_contact_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b(?:wrong number|wrong department|reached the wrong|no one (?:here )?by that name|not in service|been disconnected|does not handle|doesn't handle|can't help you with that here)\b",
        )
        .expect("Invalid contact regex")
    })
}

fn missing_credential_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b(?:need|verify|provide|confirm|what is|what's)\b.{0,40}\b(?:account number|pin|passcode|security (?:code|answer|question)|password|last four)\b",
        )
        .expect("Invalid credential regex")
    })
}

fn confusion_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)(?:\bi (?:don't|do not) understand\b|\b(?:could|can) you (?:please )?repeat\b|\bsay that again\b|\bsorry,? what\b|\bpardon\b)",
        )
        .expect("Invalid confusion regex")
    })
}

fn reference_in(text: &str) -> Option<String> {
    reference_re()
        .captures_iter(text)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().trim_end_matches('-').to_string())
        .find(|r| r.chars().any(|c| c.is_ascii_digit()))
}

fn normalize_utterance(text: &str) -> String {
    text.split_whitespace()
        .map(|w| {
            w.trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase()
        })
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

pub struct SelfMonitor {
    config: MonitorConfig,
}

impl SelfMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Count a failure against `subtask`.
    ///
    /// Consecutive failures are tracked per subtask: a failure on a
    /// different subtask restarts the count at one.
    pub fn record_failure(
        &self,
        state: &mut MonitorState,
        subtask: Subtask,
        reason: &str,
    ) -> Verdict {
        state.total_failures += 1;
        if state.failing_subtask == Some(subtask) {
            state.consecutive_failures += 1;
        } else {
            state.failing_subtask = Some(subtask);
            state.consecutive_failures = 1;
        }

        if state.consecutive_failures >= self.config.max_consecutive_failures {
            warn!(
                subtask = subtask.as_str(),
                failures = state.consecutive_failures,
                "Consecutive failure limit reached"
            );
            Verdict::Escalate(format!(
                "{} failed {} times in a row: {}",
                subtask.as_str(),
                state.consecutive_failures,
                reason
            ))
        } else {
            debug!(
                subtask = subtask.as_str(),
                failures = state.consecutive_failures,
                "Failure recorded, replanning"
            );
            Verdict::Replan(format!("{} failed: {}", subtask.as_str(), reason))
        }
    }

    /// Clear the consecutive count once the failing subtask succeeds.
    pub fn record_success(&self, state: &mut MonitorState, subtask: Subtask) {
        if state.failing_subtask == Some(subtask) {
            state.failing_subtask = None;
            state.consecutive_failures = 0;
        }
    }

    pub fn classify_turn(&self, text: &str) -> TurnSignal {
        if completion_re().is_match(text) {
            return TurnSignal::Completion {
                reference: reference_in(text),
            };
        }
        if let Some(reference) = reference_in(text) {
            return TurnSignal::Completion {
                reference: Some(reference),
            };
        }
        if invalid_contact_re().is_match(text) {
            return TurnSignal::InvalidContact;
        }
        if missing_credential_re().is_match(text) {
            return TurnSignal::MissingCredential;
        }
        if confusion_re().is_match(text) {
            return TurnSignal::Confusion;
        }
        TurnSignal::Continue
    }

    /// True when the last `loop_repeat_threshold` counterpart turns say the
    /// same thing. Thresholds below two disable detection.
    pub fn detect_loop(&self, transcript: &[TranscriptTurn]) -> bool {
        let n = self.config.loop_repeat_threshold as usize;
        if n < 2 {
            return false;
        }
        let recent: Vec<String> = transcript
            .iter()
            .rev()
            .filter(|t| t.speaker == Speaker::Counterpart)
            .take(n)
            .map(|t| normalize_utterance(&t.text))
            .collect();
        recent.len() == n && !recent[0].is_empty() && recent.iter().all(|r| r == &recent[0])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskpilot_core::types::Timestamp;

    fn monitor(max: u32) -> SelfMonitor {
        SelfMonitor::new(MonitorConfig {
            max_consecutive_failures: max,
            ..MonitorConfig::default()
        })
    }

    fn turn(speaker: Speaker, text: &str) -> TranscriptTurn {
        TranscriptTurn {
            speaker,
            text: text.to_string(),
            at: Timestamp::now(),
        }
    }

    // =====================================================================
    // Failure counting
    // =====================================================================

    #[test]
    fn test_escalates_at_default_limit() {
        let m = monitor(3);
        let mut state = MonitorState::default();
        assert!(matches!(
            m.record_failure(&mut state, Subtask::ResearchContact, "timeout"),
            Verdict::Replan(_)
        ));
        assert!(matches!(
            m.record_failure(&mut state, Subtask::ResearchContact, "timeout"),
            Verdict::Replan(_)
        ));
        let verdict = m.record_failure(&mut state, Subtask::ResearchContact, "timeout");
        assert!(matches!(verdict, Verdict::Escalate(ref r) if r.contains("3 times")));
        assert_eq!(state.total_failures, 3);
    }

    #[test]
    fn test_consecutive_limit_property() {
        for max in 1..=6u32 {
            let m = monitor(max);
            let mut state = MonitorState::default();
            for attempt in 1..=max {
                let verdict = m.record_failure(&mut state, Subtask::PlaceCall, "busy");
                if attempt < max {
                    assert!(matches!(verdict, Verdict::Replan(_)), "max {} attempt {}", max, attempt);
                } else {
                    assert!(matches!(verdict, Verdict::Escalate(_)), "max {} attempt {}", max, attempt);
                }
            }
        }
    }

    #[test]
    fn test_different_subtask_resets_count() {
        let m = monitor(3);
        let mut state = MonitorState::default();
        m.record_failure(&mut state, Subtask::ResearchContact, "x");
        m.record_failure(&mut state, Subtask::ResearchContact, "x");
        let verdict = m.record_failure(&mut state, Subtask::PlaceCall, "x");
        assert!(matches!(verdict, Verdict::Replan(_)));
        assert_eq!(state.consecutive_failures, 1);
        assert_eq!(state.failing_subtask, Some(Subtask::PlaceCall));
        assert_eq!(state.total_failures, 3);
    }

    #[test]
    fn test_success_clears_only_failing_subtask() {
        let m = monitor(3);
        let mut state = MonitorState::default();
        m.record_failure(&mut state, Subtask::PlaceCall, "x");
        m.record_failure(&mut state, Subtask::PlaceCall, "x");

        m.record_success(&mut state, Subtask::RecallHistory);
        assert_eq!(state.consecutive_failures, 2);

        m.record_success(&mut state, Subtask::PlaceCall);
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(state.failing_subtask, None);
        assert!(matches!(
            m.record_failure(&mut state, Subtask::PlaceCall, "x"),
            Verdict::Replan(_)
        ));
    }

    // =====================================================================
    // Turn classification
    // =====================================================================

    #[test]
    fn test_classify_completion_with_reference() {
        let m = monitor(3);
        let signal =
            m.classify_turn("Your service has been cancelled. Your confirmation number is CX48213.");
        assert_eq!(
            signal,
            TurnSignal::Completion {
                reference: Some("CX48213".into())
            }
        );
    }

    #[test]
    fn test_classify_completion_without_reference() {
        let m = monitor(3);
        assert_eq!(
            m.classify_turn("Okay, that account is now closed."),
            TurnSignal::Completion { reference: None }
        );
        // A reference needs at least one digit.
        assert_eq!(
            m.classify_turn("Your request has been processed, reference is ABCDEF."),
            TurnSignal::Completion { reference: None }
        );
    }

    #[test]
    fn test_classify_signals() {
        let m = monitor(3);
        assert_eq!(
            m.classify_turn("Sorry, you have the wrong number."),
            TurnSignal::InvalidContact
        );
        assert_eq!(
            m.classify_turn("I need to verify the account number first."),
            TurnSignal::MissingCredential
        );
        assert_eq!(
            m.classify_turn("I don't understand what you're asking."),
            TurnSignal::Confusion
        );
        assert_eq!(
            m.classify_turn("Sure, let me pull up the account."),
            TurnSignal::Continue
        );
    }

    #[test]
    fn test_completion_checked_first() {
        let m = monitor(3);
        let signal = m.classify_turn(
            "I don't understand why, but your service is cancelled, ticket #A1234.",
        );
        assert_eq!(
            signal,
            TurnSignal::Completion {
                reference: Some("A1234".into())
            }
        );
    }

    // =====================================================================
    // Loop detection
    // =====================================================================

    #[test]
    fn test_detect_loop() {
        let m = monitor(3);
        let mut transcript = vec![
            turn(Speaker::Counterpart, "Please hold."),
            turn(Speaker::Agent, "Okay."),
            turn(Speaker::Counterpart, "please hold"),
        ];
        assert!(!m.detect_loop(&transcript));
        transcript.push(turn(Speaker::Agent, "Still here."));
        transcript.push(turn(Speaker::Counterpart, "Please   HOLD!"));
        assert!(m.detect_loop(&transcript));

        transcript.push(turn(Speaker::Counterpart, "Thanks for holding."));
        assert!(!m.detect_loop(&transcript));
    }

    #[test]
    fn test_loop_threshold_property() {
        for threshold in 2..=5u32 {
            let m = SelfMonitor::new(MonitorConfig {
                loop_repeat_threshold: threshold,
                ..MonitorConfig::default()
            });
            let mut transcript = Vec::new();
            for i in 1..=threshold {
                transcript.push(turn(Speaker::Counterpart, "Can I have your name?"));
                assert_eq!(m.detect_loop(&transcript), i == threshold);
            }
        }
    }

    #[test]
    fn test_verdict_serialization() {
        let json = serde_json::to_value(Verdict::Escalate("x".into())).unwrap();
        assert_eq!(json["verdict"], "escalate");
        assert_eq!(json["reason"], "x");
    }
}
