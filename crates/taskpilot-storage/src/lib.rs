//! TaskPilot storage crate - SQLite persistence for the durable store.
//!
//! Provides a WAL-mode SQLite database with migrations and repositories for
//! users, tasks with their plan versions and append-only log, the encrypted
//! credential vault, confirmations, the cost ledger and semantic memory.

pub mod confirmations;
pub mod db;
pub mod ledger;
pub mod migrations;
pub mod semantic;
pub mod tasks;
pub mod users;
pub mod vault;

pub use confirmations::ConfirmationRepository;
pub use db::Database;
pub use ledger::CostLedger;
pub use semantic::SemanticRepository;
pub use tasks::TaskRepository;
pub use users::UserRepository;
pub use vault::{SealedSecret, VaultCipher, VaultRepository};
