//! Task engine for TaskPilot.
//!
//! Drives each task through its lifecycle state machine: plans it, runs
//! tool steps behind the safety governor, watches for repeated failures
//! and suspends on confirmations or counterpart input.

pub mod collaborators;
pub mod engine;
pub mod error;
pub mod governor;
pub mod locks;
pub mod monitor;
pub mod orchestrator;
pub mod planner;
pub mod state_machine;
pub mod sweeper;
pub mod testing;
pub mod tools;

pub use collaborators::{
    CallBrief, CallHandle, CallStatus, CollaboratorError, Collaborators, InboundMail, Inference,
    InteractionEvent, MailChannel, ReasoningService, SearchResult, SearchService,
    StructuredIntent, TelephonyChannel,
};
pub use engine::{
    ExecutionMode, RunReport, SweepReport, TaskEngine, TaskView, TransitionRecord, MAX_GOAL_CHARS,
};
pub use error::{EngineError, PlanningError, Result, ToolError};
pub use governor::{Assessment, RiskReason, SafetyGovernor};
pub use monitor::{SelfMonitor, TurnSignal, Verdict};
pub use orchestrator::{StepOutcome, ToolOrchestrator};
pub use planner::{PlanOutcome, Planner};
pub use state_machine::Trigger;
pub use sweeper::Sweeper;
pub use tools::{RiskClass, ToolContext, ToolDescriptor, ToolHandler, ToolOutput, ToolRegistry};
