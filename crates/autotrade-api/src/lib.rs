pub mod conversations;
pub mod devices;
pub mod error;
pub mod messages;
pub mod middleware;
pub mod state;
pub mod ws;

use axum::{
    Json, Router,
    extract::State,
    middleware as axum_middleware,
    response::IntoResponse,
    routing::{get, post, put},
};
use serde_json::json;

use crate::middleware::require_auth;
use crate::state::AppState;

/// Every chat route plus the unauthenticated `/health` probe.
pub fn router(state: AppState) -> Router {
    let protected_routes = Router::new()
        .route("/chat/ws", get(ws::ws_upgrade))
        .route(
            "/chat/conversations",
            get(conversations::list_conversations).post(conversations::start_conversation),
        )
        .route("/chat/conversations/{id}", get(conversations::get_conversation))
        .route("/chat/conversations/{id}/messages", get(messages::get_messages))
        .route("/chat/conversations/{id}/read", put(messages::mark_read))
        .route(
            "/chat/device",
            post(devices::register_device).delete(devices::unregister_device),
        )
        .layer(axum_middleware::from_fn_with_state(state.clone(), require_auth))
        .with_state(state.clone());

    Router::new()
        .route("/health", get(health))
        .with_state(state)
        .merge(protected_routes)
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "online": state.hub.online_count().await,
    }))
}
