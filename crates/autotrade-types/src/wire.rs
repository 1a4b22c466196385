use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

/// Kind tag of a frame exchanged over the chat socket.
///
/// Serialized as the plain `type` string. Tags the server does not know
/// decode to [`WireKind::Unknown`] instead of failing the whole frame.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum WireKind {
    /// A new chat message (persisted)
    Message,
    /// Typing indicator (ephemeral)
    Typing,
    /// Mark messages up to `content` (a message id) as read
    ReadReceipt,
    /// Recipient confirms delivery of message `content`
    MessageDelivered,
    /// Recipient saw everything in the conversation
    MessagesSeen,
    /// Client asks for its total unread count
    UnreadGet,
    /// Server pushes the total unread count (`content` = decimal total)
    UnreadUpdate,
    /// Server tells a client to refresh its conversation list
    ConversationUpdated,
    Unknown(String),
}

impl WireKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Message => "message",
            Self::Typing => "typing",
            Self::ReadReceipt => "read_receipt",
            Self::MessageDelivered => "message:delivered",
            Self::MessagesSeen => "messages:seen",
            Self::UnreadGet => "unread:get",
            Self::UnreadUpdate => "unread:update",
            Self::ConversationUpdated => "conversation:updated",
            Self::Unknown(other) => other,
        }
    }
}

impl From<String> for WireKind {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "message" => Self::Message,
            "typing" => Self::Typing,
            "read_receipt" => Self::ReadReceipt,
            "message:delivered" => Self::MessageDelivered,
            "messages:seen" => Self::MessagesSeen,
            "unread:get" => Self::UnreadGet,
            "unread:update" => Self::UnreadUpdate,
            "conversation:updated" => Self::ConversationUpdated,
            _ => Self::Unknown(tag),
        }
    }
}

impl From<WireKind> for String {
    fn from(kind: WireKind) -> Self {
        match kind {
            WireKind::Unknown(tag) => tag,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for WireKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// JSON envelope carried by every text frame on the chat socket.
///
/// `sender_id` and `timestamp` are always overwritten by the server for
/// inbound frames; whatever the client put there is ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    #[serde(rename = "type")]
    pub kind: WireKind,
    /// Id of the stored message; set by the server on routed `message`
    /// frames so recipients can acknowledge delivery.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<Uuid>,
    #[serde(default)]
    pub conversation_id: Uuid,
    #[serde(default, deserialize_with = "server_set_sender")]
    pub sender_id: Uuid,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub media_url: String,
    #[serde(default = "Utc::now", deserialize_with = "server_set_timestamp")]
    pub timestamp: DateTime<Utc>,
}

// The server overwrites `sender_id` and `timestamp` on every inbound frame,
// so whatever a client sends there (null, "", junk) must not fail the decode.

fn server_set_sender<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Uuid, D::Error> {
    let raw = serde_json::Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(raw).unwrap_or_default())
}

fn server_set_timestamp<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
    let raw = serde_json::Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(raw).unwrap_or_else(|_| Utc::now()))
}

impl WireMessage {
    pub fn new(kind: WireKind, conversation_id: Uuid, sender_id: Uuid) -> Self {
        Self {
            kind,
            message_id: None,
            conversation_id,
            sender_id,
            content: String::new(),
            message_type: String::new(),
            media_url: String::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    /// Server-originated total unread count for the receiving user.
    pub fn unread_update(total: i64) -> Self {
        Self::new(WireKind::UnreadUpdate, Uuid::nil(), Uuid::nil()).with_content(total.to_string())
    }

    /// Echo of a chat message telling a client its conversation list changed.
    pub fn conversation_updated(msg: &WireMessage) -> Self {
        Self {
            kind: WireKind::ConversationUpdated,
            message_id: msg.message_id,
            conversation_id: msg.conversation_id,
            sender_id: msg.sender_id,
            content: msg.content.clone(),
            message_type: msg.message_type.clone(),
            media_url: String::new(),
            timestamp: msg.timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_known_and_unknown_kinds() {
        let frame = r#"{"type":"messages:seen","conversation_id":"6f1c1f56-1b5e-4a47-9a57-6bd1f2a4c1de"}"#;
        let msg: WireMessage = serde_json::from_str(frame).unwrap();
        assert_eq!(msg.kind, WireKind::MessagesSeen);
        assert!(msg.content.is_empty());

        let msg: WireMessage = serde_json::from_str(r#"{"type":"reaction:add"}"#).unwrap();
        assert_eq!(msg.kind, WireKind::Unknown("reaction:add".into()));
        assert_eq!(msg.conversation_id, Uuid::nil());
    }

    #[test]
    fn junk_in_server_set_fields_does_not_reject_the_frame() {
        let conv = "6f1c1f56-1b5e-4a47-9a57-6bd1f2a4c1de";
        for (sender, timestamp) in [("null", "null"), (r#""""#, r#""""#), ("42", r#""yesterday""#)] {
            let frame = format!(
                r#"{{"type":"message","conversation_id":"{conv}","content":"hi","sender_id":{sender},"timestamp":{timestamp}}}"#
            );
            let msg: WireMessage = serde_json::from_str(&frame).unwrap();
            assert_eq!(msg.kind, WireKind::Message);
            assert_eq!(msg.content, "hi");
            assert_eq!(msg.sender_id, Uuid::nil());
            assert!(msg.timestamp > DateTime::<Utc>::default());
        }
    }

    #[test]
    fn server_set_fields_survive_a_round_trip() {
        let sender = Uuid::new_v4();
        let msg = WireMessage::new(WireKind::Typing, Uuid::new_v4(), sender);
        let back: WireMessage = serde_json::from_str(&serde_json::to_string(&msg).unwrap()).unwrap();
        assert_eq!(back.sender_id, sender);
        assert_eq!(back.timestamp, msg.timestamp);
    }

    #[test]
    fn empty_optional_fields_are_omitted() {
        let json = serde_json::to_value(WireMessage::unread_update(7)).unwrap();
        assert_eq!(json["type"], "unread:update");
        assert_eq!(json["content"], "7");
        assert!(json.get("media_url").is_none());
        assert!(json.get("message_type").is_none());
    }

    #[test]
    fn conversation_update_keeps_preview() {
        let conv = Uuid::new_v4();
        let sender = Uuid::new_v4();
        let msg = WireMessage::new(WireKind::Message, conv, sender).with_content("hi");
        let echo = WireMessage::conversation_updated(&msg);
        assert_eq!(echo.kind.as_str(), "conversation:updated");
        assert_eq!(echo.conversation_id, conv);
        assert_eq!(echo.sender_id, sender);
        assert_eq!(echo.content, "hi");
    }
}
