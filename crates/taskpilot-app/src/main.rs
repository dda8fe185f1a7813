//! TaskPilot server binary - composition root.
//!
//! 1. Parse CLI flags and load configuration from TOML
//! 2. Open the SQLite store, vault key and memory gateway
//! 3. Build the task engine over the local collaborators
//! 4. Repair tasks left mid-transition and start the timeout sweeper
//! 5. Serve the axum REST API until ctrl-c

mod cli;
mod local;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use taskpilot_api::auth::load_or_generate_token;
use taskpilot_api::routes;
use taskpilot_api::state::AppState;
use taskpilot_core::config::TaskPilotConfig;
use taskpilot_engine::{Sweeper, TaskEngine};
use taskpilot_memory::{HashingEmbedding, InMemoryWorkingStore, MemoryGateway};
use taskpilot_storage::{Database, VaultCipher};

use crate::cli::CliArgs;

fn init_tracing(level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

fn open_memory(
    config: &TaskPilotConfig,
    data_dir: &Path,
) -> Result<MemoryGateway, Box<dyn std::error::Error>> {
    let db_path = data_dir.join("taskpilot.db");
    let db = Arc::new(Database::new(&db_path)?);
    tracing::info!(path = %db_path.display(), "SQLite database opened");

    let cipher = match config.memory.vault_key.as_deref() {
        Some(key) => VaultCipher::from_hex(key)?,
        None => VaultCipher::load_or_create_key_file(&data_dir.join("vault.key"))?,
    };

    let working = Arc::new(InMemoryWorkingStore::new(Duration::from_secs(
        config.memory.working_ttl_secs,
    )));
    let embedder = Arc::new(HashingEmbedding::new(config.memory.embedding_dimensions));

    Ok(MemoryGateway::open(
        db,
        cipher,
        embedder,
        working,
        config.memory.clone(),
    )?)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    let config_file: PathBuf = args.resolve_config_path();
    let mut config = TaskPilotConfig::load_or_default(&config_file);
    args.apply(&mut config);

    init_tracing(&config.general.log_level);
    tracing::info!("Starting TaskPilot v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(path = %config_file.display(), "Configuration resolved");

    if args.write_config {
        config.save(&config_file)?;
        return Ok(());
    }

    let data_dir = config.general.data_path();
    if let Err(e) = std::fs::create_dir_all(&data_dir) {
        tracing::error!(path = %data_dir.display(), error = %e, "Failed to create data directory");
        return Err(e.into());
    }

    let memory = Arc::new(open_memory(&config, &data_dir)?);
    let engine = Arc::new(TaskEngine::new(
        config.clone(),
        Arc::clone(&memory),
        local::local_collaborators(),
    )?);
    tracing::info!("Task engine ready");

    match engine.recover_all().await {
        Ok(0) => {}
        Ok(repaired) => tracing::warn!(repaired, "Repaired tasks interrupted mid-transition"),
        Err(e) => tracing::error!(error = %e, "Task recovery failed"),
    }

    let sweeper = Arc::new(Sweeper::new(Arc::clone(&engine)));
    let sweeper_task = {
        let sweeper = Arc::clone(&sweeper);
        tokio::spawn(async move { sweeper.run().await })
    };

    let token = match config.general.api_token.clone() {
        Some(token) => token,
        None => load_or_generate_token(&data_dir.join("api_token")),
    };
    let state = AppState::new(Arc::clone(&engine), token);

    let served = tokio::select! {
        result = routes::start_server(&config, state) => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown requested");
            Ok(())
        }
    };

    sweeper.shutdown();
    if let Err(e) = sweeper_task.await {
        tracing::warn!(error = %e, "Sweeper task ended abnormally");
    }

    if let Err(ref e) = served {
        tracing::error!(error = %e, "API server stopped");
        tracing::error!("Try: TASKPILOT_PORT={} taskpilot", config.general.port.saturating_add(1));
    }
    Ok(served?)
}
