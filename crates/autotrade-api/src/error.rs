use axum::http::StatusCode;
use tracing::{debug, error};

use autotrade_chat::ChatError;

/// Maps a service failure onto the response status. Storage failures are
/// logged here so handlers can just `map_err(error::status)`.
pub fn status(err: ChatError) -> StatusCode {
    match err {
        ChatError::NotFound(what) => {
            debug!("{} not found", what);
            StatusCode::NOT_FOUND
        }
        ChatError::InvalidInput(reason) => {
            debug!("Invalid input: {}", reason);
            StatusCode::BAD_REQUEST
        }
        ChatError::Forbidden => StatusCode::FORBIDDEN,
        ChatError::Storage(e) => {
            error!("Chat storage failure: {:#}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}
