//! Router setup with all API routes and middleware.
//!
//! Configures the axum Router with CORS, tracing, compression,
//! and all endpoint handlers.

use axum::extract::DefaultBodyLimit;
use axum::http::{header, HeaderValue, Method};
use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::compression::CompressionLayer;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use taskpilot_core::config::TaskPilotConfig;
use taskpilot_core::error::TaskPilotError;

use crate::handlers;
use crate::state::AppState;

/// Create the axum Router with all routes and middleware.
pub fn create_router(state: AppState) -> Router {
    // Local dashboards only: the API port and port+1 for a dev server.
    let port = state.port();
    let dev_port = port.saturating_add(1);
    let origins: Vec<HeaderValue> = [port, dev_port]
        .iter()
        .flat_map(|p| {
            [
                format!("http://127.0.0.1:{}", p),
                format!("http://localhost:{}", p),
            ]
        })
        .filter_map(|origin| HeaderValue::from_str(&origin).ok())
        .collect();
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION, header::ACCEPT]);

    let public_routes = Router::new().route("/health", get(handlers::health));

    let protected_routes = Router::new()
        .route("/users", post(handlers::create_user))
        .route("/users/{id}", delete(handlers::delete_user))
        .route(
            "/tasks",
            get(handlers::list_tasks).post(handlers::create_task),
        )
        .route("/tasks/{id}", get(handlers::get_task))
        .route("/tasks/{id}/logs", get(handlers::task_logs))
        .route("/tasks/{id}/execute", post(handlers::execute_task))
        .route("/tasks/{id}/replan", post(handlers::replan_task))
        .route("/tasks/{id}/cancel", post(handlers::cancel_task))
        .route(
            "/tasks/{id}/confirmations/{confirmation_id}",
            post(handlers::confirm_step),
        )
        .route("/vault", post(handlers::store_credentials))
        .route("/memory", post(handlers::append_memory))
        .route("/memory/search", get(handlers::search_memory))
        .route("/voice/events", post(handlers::voice_event))
        .route("/email/inbound", post(handlers::email_inbound))
        .route("/email/poll", post(handlers::email_poll))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            crate::auth::require_auth,
        ));

    public_routes
        .merge(protected_routes)
        .layer(DefaultBodyLimit::max(1024 * 1024))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Start the HTTP server on the configured address.
///
/// Binds to 127.0.0.1 (localhost only) on the port from config.
pub async fn start_server(config: &TaskPilotConfig, state: AppState) -> Result<(), TaskPilotError> {
    let addr = format!("127.0.0.1:{}", config.general.port);
    let router = create_router(state);

    tracing::info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| TaskPilotError::Api(format!("Failed to bind {}: {}", addr, e)))?;

    axum::serve(listener, router)
        .await
        .map_err(|e| TaskPilotError::Api(format!("Server error: {}", e)))?;

    Ok(())
}
