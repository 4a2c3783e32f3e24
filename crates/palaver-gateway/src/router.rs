use axum::routing::{get, post};
use axum::Router;

use crate::api;
use crate::state::SharedState;
use crate::ws;

/// Build the application router with all routes.
pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(api::health))
        .route("/api/chat", post(api::chat))
        .route("/api/chat/stream", get(ws::ws_handler))
        .route("/api/conversations", get(api::list_conversations))
        .route(
            "/api/conversations/{id}",
            get(api::get_conversation).delete(api::delete_conversation),
        )
        .with_state(state)
}
