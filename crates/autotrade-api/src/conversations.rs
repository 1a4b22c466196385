use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use uuid::Uuid;

use autotrade_types::api::{Claims, PageQuery, StartConversationRequest};

use crate::error;
use crate::state::AppState;

pub async fn list_conversations(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<PageQuery>,
) -> Result<impl IntoResponse, StatusCode> {
    let conversations = state
        .chat
        .list_conversations(claims.sub, query.page, query.page_size)
        .await
        .map_err(error::status)?;
    Ok(Json(conversations))
}

/// The caller is always a participant. Returns the existing conversation
/// when one already covers the same people (and subject).
pub async fn start_conversation(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<StartConversationRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    if !req.participant_ids.iter().any(|id| *id != claims.sub && !id.is_nil()) {
        return Err(StatusCode::BAD_REQUEST);
    }

    let mut participants = req.participant_ids;
    participants.push(claims.sub);

    let conversation = state
        .chat
        .start_conversation(participants, req.subject, req.metadata.unwrap_or_default())
        .await
        .map_err(error::status)?;

    Ok((StatusCode::CREATED, Json(conversation)))
}

pub async fn get_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let conversation = state
        .chat
        .get_conversation(conversation_id)
        .await
        .map_err(error::status)?;

    if !conversation.participants.iter().any(|p| p.user_id == claims.sub) {
        return Err(StatusCode::FORBIDDEN);
    }
    Ok(Json(conversation))
}
