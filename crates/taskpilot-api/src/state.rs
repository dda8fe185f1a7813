//! Application state shared across all route handlers.

use std::sync::Arc;
use std::time::Instant;

use taskpilot_engine::TaskEngine;

/// Shared application state, passed to handlers via axum's `State`
/// extractor. Cloning is cheap.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<TaskEngine>,
    /// Bearer token required on every route except `/health`.
    pub api_token: String,
    /// Server start time for uptime calculation.
    pub start_time: Instant,
}

impl AppState {
    pub fn new(engine: Arc<TaskEngine>, api_token: impl Into<String>) -> Self {
        Self {
            engine,
            api_token: api_token.into(),
            start_time: Instant::now(),
        }
    }

    /// HTTP port from the engine's configuration.
    pub fn port(&self) -> u16 {
        self.engine.config().general.port
    }
}
