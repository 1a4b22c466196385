use axum::{
    Extension,
    extract::{State, WebSocketUpgrade},
    response::IntoResponse,
};

use autotrade_gateway::connection::{self, MAX_MESSAGE_SIZE};
use autotrade_types::api::Claims;

use crate::state::AppState;

/// The token was validated by `require_auth` before the upgrade.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let hub = state.hub.clone();
    ws.max_message_size(MAX_MESSAGE_SIZE)
        .max_frame_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| connection::handle_connection(socket, hub, claims.sub))
}
