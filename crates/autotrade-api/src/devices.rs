use axum::{Extension, Json, extract::State, http::StatusCode, response::IntoResponse};
use serde_json::json;
use tracing::debug;

use autotrade_types::api::{Claims, RegisterDeviceRequest, UnregisterDeviceRequest};
use autotrade_types::models::DeviceType;

use crate::error;
use crate::state::AppState;

pub async fn register_device(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<RegisterDeviceRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let device_type: DeviceType = req.device_type.parse().map_err(|e| {
        debug!("{}", e);
        StatusCode::BAD_REQUEST
    })?;

    state
        .chat
        .register_device(claims.sub, req.fcm_token, device_type)
        .await
        .map_err(error::status)?;

    Ok(Json(json!({ "message": "Device registered successfully" })))
}

pub async fn unregister_device(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<UnregisterDeviceRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let removed = state
        .chat
        .unregister_device(claims.sub, req.fcm_token)
        .await
        .map_err(error::status)?;

    Ok(Json(json!({ "removed": removed })))
}
