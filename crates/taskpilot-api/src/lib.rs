//! TaskPilot API crate - axum HTTP server and route handlers.
//!
//! Exposes task intake, execution control, confirmations, the credential
//! vault, semantic memory and the voice/email webhooks over REST.

pub mod auth;
pub mod error;
pub mod handlers;
pub mod routes;
pub mod state;

pub use error::ApiError;
pub use routes::{create_router, start_server};
pub use state::AppState;
