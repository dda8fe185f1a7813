use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{Result, TaskPilotError};
use crate::types::ActionKind;

/// Top-level configuration for TaskPilot.
///
/// Loaded from `~/.taskpilot/config.toml` by default. Every threshold and
/// retry bound the engine uses lives here rather than in code.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskPilotConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub planner: PlannerConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub governor: GovernorConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub pricing: PricingConfig,
}

impl TaskPilotConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: TaskPilotConfig = toml::from_str(&content)?;
        config.validate()?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Load configuration, falling back to defaults if the file is missing
    /// or invalid.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "Failed to load config from {}: {}. Using defaults.",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Save the current configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }

    /// Reject values that would make the engine misbehave.
    pub fn validate(&self) -> Result<()> {
        let unit = |name: &str, v: f64| {
            if (0.0..=1.0).contains(&v) {
                Ok(())
            } else {
                Err(TaskPilotError::Config(format!(
                    "{} must be within [0, 1], got {}",
                    name, v
                )))
            }
        };
        unit(
            "planner.intent_confidence_threshold",
            self.planner.intent_confidence_threshold,
        )?;
        unit(
            "governor.step_confidence_threshold",
            self.governor.step_confidence_threshold,
        )?;
        unit("memory.min_similarity", self.memory.min_similarity)?;
        if self.monitor.max_consecutive_failures == 0 {
            return Err(TaskPilotError::Config(
                "monitor.max_consecutive_failures must be at least 1".into(),
            ));
        }
        if self.planner.max_planning_attempts == 0 {
            return Err(TaskPilotError::Config(
                "planner.max_planning_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Data directory for the SQLite database and vault key.
    pub data_dir: String,
    /// Log level: trace, debug, info, warn, error.
    pub log_level: String,
    /// HTTP API port.
    pub port: u16,
    /// Bearer token for the HTTP API; generated under `data_dir` if unset.
    pub api_token: Option<String>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: "~/.taskpilot/data".to_string(),
            log_level: "info".to_string(),
            port: 3030,
            api_token: None,
        }
    }
}

impl GeneralConfig {
    /// Data directory with a leading `~/` expanded against `$HOME`.
    pub fn data_path(&self) -> PathBuf {
        if let Some(rest) = self.data_dir.strip_prefix("~/") {
            if let Ok(home) = std::env::var("HOME") {
                return PathBuf::from(home).join(rest);
            }
        }
        PathBuf::from(&self.data_dir)
    }
}

/// Planner policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// Intents classified below this confidence are escalated at intake.
    pub intent_confidence_threshold: f64,
    /// Reasoning calls per planning request before giving up.
    pub max_planning_attempts: u32,
    /// Research rounds without a usable contact before failing the task.
    pub max_research_attempts: u32,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            intent_confidence_threshold: 0.6,
            max_planning_attempts: 3,
            max_research_attempts: 3,
        }
    }
}

/// Self-monitoring policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Consecutive failures on one subtask that force escalation.
    pub max_consecutive_failures: u32,
    /// Identical counterpart utterances in a row that count as looping.
    pub loop_repeat_threshold: u32,
    /// Input timeouts tolerated before escalating.
    pub max_input_timeouts: u32,
    /// Seconds a task may wait for counterpart input.
    pub input_timeout_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 3,
            loop_repeat_threshold: 3,
            max_input_timeouts: 2,
            input_timeout_secs: 600,
        }
    }
}

/// Tool execution policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Automatic retries for idempotent actions.
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub default_timeout_secs: u64,
    pub call_timeout_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff_ms: 200,
            max_backoff_ms: 5_000,
            default_timeout_secs: 30,
            call_timeout_secs: 120,
        }
    }
}

/// Outcome of a governor rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyDecision {
    Allow,
    RequireConfirmation,
    Deny,
}

impl PolicyDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyDecision::Allow => "allow",
            PolicyDecision::RequireConfirmation => "require_confirmation",
            PolicyDecision::Deny => "deny",
        }
    }
}

impl std::fmt::Display for PolicyDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A per-user, per-company or per-action policy override.
///
/// Every populated selector must match; an override with no selectors
/// matches everything.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyOverride {
    #[serde(default)]
    pub user_id: Option<Uuid>,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub action: Option<ActionKind>,
    pub decision: PolicyDecision,
}

/// Safety governor policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorConfig {
    /// Steps planned below this confidence need confirmation.
    pub step_confidence_threshold: f64,
    /// Decision for irreversible account or financial changes.
    pub irreversible: PolicyDecision,
    /// Decision when outbound arguments carry sensitive data.
    pub sensitive_arguments: PolicyDecision,
    /// Seconds a pending confirmation stays valid.
    pub confirmation_timeout_secs: u64,
    pub blocked_actions: Vec<ActionKind>,
    pub overrides: Vec<PolicyOverride>,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            step_confidence_threshold: 0.5,
            irreversible: PolicyDecision::RequireConfirmation,
            sensitive_arguments: PolicyDecision::Deny,
            confirmation_timeout_secs: 900,
            blocked_actions: Vec::new(),
            overrides: Vec::new(),
        }
    }
}

/// Memory tier settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Expiry of working-context entries.
    pub working_ttl_secs: u64,
    pub embedding_dimensions: usize,
    pub default_limit: usize,
    pub min_similarity: f64,
    /// Hex-encoded 32-byte vault key. A key file under `data_dir` is used
    /// when unset.
    pub vault_key: Option<String>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            working_ttl_secs: 86_400,
            embedding_dimensions: 384,
            default_limit: 5,
            min_similarity: 0.3,
            vault_key: None,
        }
    }
}

/// Execution loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Bounded wait for the per-task lock.
    pub lock_wait_ms: u64,
    /// Loop iterations allowed in a single run before escalating.
    pub max_iterations_per_run: u32,
    /// Background sweep interval for input and confirmation timeouts.
    pub sweep_interval_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_wait_ms: 2_000,
            max_iterations_per_run: 64,
            sweep_interval_secs: 30,
        }
    }
}

/// Unit prices for the cost ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PricingConfig {
    pub per_call_minute: f64,
    pub per_1k_tokens: f64,
    pub per_email: f64,
    pub per_search: f64,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            per_call_minute: 0.05,
            per_1k_tokens: 0.01,
            per_email: 0.001,
            per_search: 0.005,
        }
    }
}
