use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{ChatMessage, Subject};

// -- JWT Claims --

/// Claims of the access tokens issued by the auth module. Shared by the REST
/// middleware and the socket upgrade endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub exp: usize,
}

// -- Conversations --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StartConversationRequest {
    pub participant_ids: Vec<Uuid>,
    #[serde(default)]
    pub subject: Option<Subject>,
    #[serde(default)]
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
}

/// One row of a user's chat list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject_title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject_image_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject_price: Option<f64>,
    pub last_message_at: Option<chrono::DateTime<chrono::Utc>>,
    pub unread_count: i64,
    pub other_user_id: Option<Uuid>,
    pub other_user_name: Option<String>,
    pub other_user_avatar: Option<String>,
    pub last_message_content: Option<String>,
    pub last_message_sender_id: Option<Uuid>,
    pub last_message_time: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct PageQuery {
    pub page: Option<i64>,
    pub page_size: Option<i64>,
}

// -- Messages --

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatHistory {
    pub messages: Vec<ChatMessage>,
    pub total_count: i64,
    pub page: i64,
    pub page_size: i64,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MarkReadRequest {
    pub message_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MarkReadResponse {
    pub affected: usize,
}

// -- Devices --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegisterDeviceRequest {
    pub fcm_token: String,
    #[serde(default)]
    pub device_type: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UnregisterDeviceRequest {
    pub fcm_token: String,
}
