//! Background sweeper for confirmation and input timeouts.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{info, warn};

use crate::engine::TaskEngine;

/// Periodically runs [`TaskEngine::sweep`] until shut down.
pub struct Sweeper {
    engine: Arc<TaskEngine>,
    interval: Duration,
    shutdown: Arc<Notify>,
}

impl Sweeper {
    /// Sweep at the engine's configured interval.
    pub fn new(engine: Arc<TaskEngine>) -> Self {
        let interval = Duration::from_secs(engine.config().engine.sweep_interval_secs.max(1));
        Self::with_interval(engine, interval)
    }

    pub fn with_interval(engine: Arc<TaskEngine>, interval: Duration) -> Self {
        Self {
            engine,
            interval,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Sleep, sweep, repeat. Returns on shutdown signal.
    pub async fn run(&self) {
        info!(interval_secs = self.interval.as_secs(), "Sweeper started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    match self.engine.sweep().await {
                        Ok(report) if report.errors > 0 => {
                            warn!(errors = report.errors, "Sweep finished with errors");
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "Sweep failed"),
                    }
                }
                _ = self.shutdown.notified() => {
                    info!("Sweeper stopped");
                    return;
                }
            }
        }
    }

    /// Signal the sweeper to shut down gracefully.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }
}
