//! Tool orchestrator: render, validate, gate, invoke, retry, and price.
//!
//! Execution is split in two so the engine can persist the step as
//! in-progress between the checks and the side effect:
//! [`ToolOrchestrator::prepare`] does everything that touches nothing
//! external, then [`ToolOrchestrator::invoke`] runs the handler.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use taskpilot_core::config::{OrchestratorConfig, PolicyDecision, PricingConfig};
use taskpilot_core::error::TaskPilotError;
use taskpilot_core::types::{
    ActionKind, Confirmation, ConfirmationStatus, CostEntry, PlanStep, Task, Timestamp, Usage,
    WorkingContext,
};
use taskpilot_memory::MemoryGateway;

use crate::error::{EngineError, ToolError};
use crate::governor::{AssessmentRequest, RiskReason, SafetyGovernor};
use crate::tools::{render_arguments, ToolContext, ToolDescriptor, ToolHandler, ToolRegistry};

/// Typed result of one step dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Completed {
        result: Value,
        context: Value,
        usage: Usage,
    },
    AwaitingConfirmation {
        confirmation_id: Uuid,
        reason: RiskReason,
        /// False when an existing pending request was found.
        created: bool,
    },
    Failed(ToolError),
}

/// A step that passed every pre-dispatch check.
pub struct PreparedStep {
    pub handler: Arc<dyn ToolHandler>,
    pub args: Value,
    pub descriptor: ToolDescriptor,
    pub description: String,
}

pub enum Preparation {
    Ready(PreparedStep),
    Outcome(StepOutcome),
}

/// Cost of a usage report under the configured prices.
pub fn price(pricing: &PricingConfig, action: ActionKind, usage: &Usage) -> f64 {
    let mut cost = usage.tokens as f64 / 1000.0 * pricing.per_1k_tokens;
    if action == ActionKind::PlaceCall {
        cost += usage.duration_secs / 60.0 * pricing.per_call_minute;
    }
    cost += match action {
        ActionKind::SendEmail | ActionKind::NotifyUser => usage.units * pricing.per_email,
        ActionKind::WebSearch => usage.units * pricing.per_search,
        _ => 0.0,
    };
    cost
}

fn is_zero(usage: &Usage) -> bool {
    usage.tokens == 0 && usage.duration_secs == 0.0 && usage.units == 0.0
}

pub struct ToolOrchestrator {
    registry: ToolRegistry,
    governor: SafetyGovernor,
    config: OrchestratorConfig,
    pricing: PricingConfig,
}

impl ToolOrchestrator {
    pub fn new(
        registry: ToolRegistry,
        governor: SafetyGovernor,
        config: OrchestratorConfig,
        pricing: PricingConfig,
    ) -> Self {
        Self {
            registry,
            governor,
            config,
            pricing,
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn governor(&self) -> &SafetyGovernor {
        &self.governor
    }

    /// Delay before retry number `attempt + 1`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.min(20);
        let ms = self
            .config
            .base_backoff_ms
            .saturating_mul(factor)
            .min(self.config.max_backoff_ms);
        Duration::from_millis(ms)
    }

    /// Render, validate and assess a step, consulting the confirmation
    /// ledger for gated steps. Only the ledger is written.
    pub fn prepare(
        &self,
        task: &Task,
        plan_id: Uuid,
        step: &PlanStep,
        working: &WorkingContext,
        memory: &MemoryGateway,
    ) -> Result<Preparation, EngineError> {
        let Some(handler) = self.registry.get(step.action) else {
            return Ok(Preparation::Outcome(StepOutcome::Failed(
                ToolError::Unrecoverable(format!("No handler for {}", step.action)),
            )));
        };
        let descriptor = handler.descriptor();

        let args = match render_arguments(&step.arguments, working) {
            Ok(args) => args,
            Err(e) => return Ok(Preparation::Outcome(StepOutcome::Failed(e))),
        };
        if let Err(e) = handler.validate(&args) {
            debug!(task_id = %task.id, action = %step.action, error = %e, "Step failed validation");
            return Ok(Preparation::Outcome(StepOutcome::Failed(e)));
        }
        let description = handler.describe(&args);

        let assessment = self.governor.assess(&AssessmentRequest {
            user_id: task.user_id,
            company: working.var_str("company"),
            action: step.action,
            risk: descriptor.risk,
            arguments: &args,
            step_confidence: step.confidence,
        });
        debug!(
            task_id = %task.id,
            action = %step.action,
            decision = %assessment.decision,
            reason = %assessment.reason,
            "Step assessed"
        );

        match assessment.decision {
            PolicyDecision::Allow => {}
            PolicyDecision::Deny => {
                return Ok(Preparation::Outcome(StepOutcome::Failed(
                    ToolError::RiskDenied(assessment.reason.to_string()),
                )));
            }
            PolicyDecision::RequireConfirmation => {
                if let Some(outcome) = self.confirmation_gate(
                    task,
                    plan_id,
                    step,
                    &description,
                    assessment.reason,
                    memory,
                )? {
                    return Ok(Preparation::Outcome(outcome));
                }
            }
        }

        Ok(Preparation::Ready(PreparedStep {
            handler,
            args,
            descriptor,
            description,
        }))
    }

    /// `None` when an approval is on record and the step may run.
    fn confirmation_gate(
        &self,
        task: &Task,
        plan_id: Uuid,
        step: &PlanStep,
        description: &str,
        reason: RiskReason,
        memory: &MemoryGateway,
    ) -> Result<Option<StepOutcome>, EngineError> {
        let timeout_secs = self.governor.config().confirmation_timeout_secs;
        let existing = memory.confirmations().find_for_step(plan_id, step.index)?;

        let status = match existing {
            None => {
                let confirmation = Confirmation {
                    id: Uuid::new_v4(),
                    task_id: task.id,
                    plan_id,
                    step_index: step.index,
                    action: step.action,
                    description: description.to_string(),
                    status: ConfirmationStatus::Pending,
                    requested_at: Timestamp::now(),
                    decided_at: None,
                };
                memory.confirmations().create(&confirmation)?;
                info!(
                    task_id = %task.id,
                    confirmation_id = %confirmation.id,
                    action = %step.action,
                    "Confirmation requested"
                );
                return Ok(Some(StepOutcome::AwaitingConfirmation {
                    confirmation_id: confirmation.id,
                    reason,
                    created: true,
                }));
            }
            Some(c) if c.status == ConfirmationStatus::Pending => {
                if c.requested_at.elapsed_secs() < timeout_secs {
                    return Ok(Some(StepOutcome::AwaitingConfirmation {
                        confirmation_id: c.id,
                        reason,
                        created: false,
                    }));
                }
                match memory.confirmations().decide(c.id, ConfirmationStatus::Expired) {
                    Ok(decided) => decided.status,
                    // Decided concurrently; honor whatever was recorded.
                    Err(TaskPilotError::Conflict(_)) => memory
                        .confirmations()
                        .find(c.id)?
                        .map_or(ConfirmationStatus::Expired, |c| c.status),
                    Err(e) => return Err(e.into()),
                }
            }
            Some(c) => c.status,
        };

        Ok(match status {
            ConfirmationStatus::Approved => None,
            ConfirmationStatus::Denied => Some(StepOutcome::Failed(ToolError::RiskDenied(
                "confirmation denied by user".into(),
            ))),
            ConfirmationStatus::Expired | ConfirmationStatus::Pending => Some(
                StepOutcome::Failed(ToolError::RiskDenied("confirmation expired".into())),
            ),
        })
    }

    /// Run a prepared step with its timeout. Idempotent actions are retried
    /// on transient errors; everything else runs exactly once.
    pub async fn invoke(
        &self,
        prepared: &PreparedStep,
        ctx: &ToolContext<'_>,
        plan_id: Uuid,
        step_index: usize,
    ) -> StepOutcome {
        let descriptor = prepared.descriptor;
        let mut attempt: u32 = 0;

        loop {
            let started = Instant::now();
            let result = match tokio::time::timeout(
                descriptor.timeout,
                prepared.handler.invoke(&prepared.args, ctx),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(ToolError::Timeout(descriptor.timeout.as_secs())),
            };
            let elapsed_ms = started.elapsed().as_millis() as u64;

            match result {
                Ok(output) => {
                    info!(
                        target: "audit",
                        task_id = %ctx.task.id,
                        action = %descriptor.action,
                        step_index,
                        attempt,
                        elapsed_ms,
                        outcome = "completed",
                        "{}",
                        prepared.description
                    );
                    if !is_zero(&output.usage) {
                        self.record_cost(
                            ctx.memory,
                            ctx.task.id,
                            plan_id,
                            step_index,
                            descriptor.action,
                            output.usage,
                        );
                    }
                    return StepOutcome::Completed {
                        result: output.result,
                        context: output.context,
                        usage: output.usage,
                    };
                }
                Err(e) => {
                    info!(
                        target: "audit",
                        task_id = %ctx.task.id,
                        action = %descriptor.action,
                        step_index,
                        attempt,
                        elapsed_ms,
                        outcome = e.kind(),
                        "{}",
                        prepared.description
                    );
                    let retry = descriptor.idempotent
                        && e.is_retryable()
                        && attempt < self.config.max_retries;
                    if !retry {
                        return StepOutcome::Failed(e);
                    }
                    let delay = self.backoff(attempt);
                    warn!(
                        task_id = %ctx.task.id,
                        action = %descriptor.action,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying idempotent action"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Append a ledger row. Ledger failures never fail the step.
    pub fn record_cost(
        &self,
        memory: &MemoryGateway,
        task_id: Uuid,
        plan_id: Uuid,
        step_index: usize,
        action: ActionKind,
        usage: Usage,
    ) -> f64 {
        let cost = price(&self.pricing, action, &usage);
        let entry = CostEntry {
            task_id,
            plan_id,
            step_index,
            action,
            usage,
            cost,
            recorded_at: Timestamp::now(),
        };
        if let Err(e) = memory.ledger().record(&entry) {
            warn!(task_id = %task_id, action = %action, error = %e, "Failed to record cost");
        }
        cost
    }
}
