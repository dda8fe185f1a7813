//! Shared foundations for TaskPilot: configuration, the common error type,
//! domain records and sensitive-data handling.

pub mod config;
pub mod error;
pub mod sensitive;
pub mod types;

pub use config::TaskPilotConfig;
pub use error::{Result, TaskPilotError};
pub use types::*;
