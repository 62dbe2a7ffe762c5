use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use super::handlers;
use super::state::AppState;

// API Routes - JSON over HTTP, no authentication
pub fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        .nest(
            "/api",
            Router::new()
                // Question answering
                .route("/ask", post(handlers::api::ask))
                .route("/ask/stream", post(handlers::api::ask_stream))

                // Cache management
                .route("/cache/invalidate", post(handlers::api::invalidate_cache))

                // Conversation sessions
                .route(
                    "/sessions/{user_id}",
                    get(handlers::api::get_sessions)
                        .post(handlers::api::start_session)
                        .delete(handlers::api::end_session),
                )
                .route("/sessions/{user_id}/history", get(handlers::api::get_history))

                // System status
                .route("/status", get(handlers::api::system_status))
        )
}
