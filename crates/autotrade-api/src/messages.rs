use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use uuid::Uuid;

use autotrade_gateway::Audience;
use autotrade_types::api::{Claims, MarkReadRequest, MarkReadResponse, PageQuery};
use autotrade_types::wire::{WireKind, WireMessage};

use crate::error;
use crate::state::AppState;

pub async fn get_messages(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Query(query): Query<PageQuery>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let member = state
        .chat
        .is_participant(conversation_id, claims.sub)
        .await
        .map_err(error::status)?;
    if !member {
        return Err(StatusCode::FORBIDDEN);
    }

    let history = state
        .chat
        .history(conversation_id, query.page, query.page_size)
        .await
        .map_err(error::status)?;
    Ok(Json(history))
}

/// Same effect as a `read_receipt` frame; live participants are told too.
pub async fn mark_read(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<MarkReadRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let affected = state
        .chat
        .mark_read_up_to(claims.sub, conversation_id, req.message_id)
        .await
        .map_err(error::status)?;

    if affected > 0 {
        let receipt = WireMessage::new(WireKind::ReadReceipt, conversation_id, claims.sub)
            .with_content(req.message_id.to_string());
        state.hub.route(receipt, Audience::Participants);
    }

    Ok(Json(MarkReadResponse { affected }))
}
