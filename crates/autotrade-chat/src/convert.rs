//! Row → model conversion. Corrupt columns are logged and replaced with
//! defaults rather than failing a whole page.

use chrono::{DateTime, NaiveDateTime, Utc};
use tracing::warn;
use uuid::Uuid;

use autotrade_db::models::{ConversationListRow, ConversationRow, MessageRow, ParticipantRow};
use autotrade_types::api::ConversationSummary;
use autotrade_types::models::{ChatMessage, Conversation, Participant, Subject};

pub(crate) fn parse_uuid(raw: &str, what: &str) -> Uuid {
    raw.parse().unwrap_or_else(|e| {
        warn!("Corrupt {} '{}': {}", what, raw, e);
        Uuid::default()
    })
}

pub(crate) fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    raw.parse::<DateTime<Utc>>()
        .or_else(|_| {
            // Rows written by SQLite's datetime('now') have no timezone.
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
        .unwrap_or_else(|e| {
            warn!("Corrupt timestamp '{}': {}", raw, e);
            DateTime::default()
        })
}

fn parse_opt_uuid(raw: Option<&str>, what: &str) -> Option<Uuid> {
    raw.map(|s| parse_uuid(s, what))
}

fn parse_opt_timestamp(raw: Option<&str>) -> Option<DateTime<Utc>> {
    raw.map(parse_timestamp)
}

pub(crate) fn message(row: MessageRow) -> ChatMessage {
    ChatMessage {
        id: parse_uuid(&row.id, "message id"),
        conversation_id: parse_uuid(&row.conversation_id, "conversation_id"),
        sender_id: parse_uuid(&row.sender_id, "sender_id"),
        message_type: row.message_type.parse().unwrap_or_else(|e| {
            warn!("{} on message '{}'", e, row.id);
            Default::default()
        }),
        status: row.status.parse().unwrap_or_else(|e| {
            warn!("{} on message '{}'", e, row.id);
            autotrade_types::models::MessageStatus::Sent
        }),
        content: row.content,
        media_url: row.media_url,
        is_read: row.is_read,
        delivered_at: parse_opt_timestamp(row.delivered_at.as_deref()),
        seen_at: parse_opt_timestamp(row.seen_at.as_deref()),
        created_at: parse_timestamp(&row.created_at),
    }
}

pub(crate) fn participant(row: ParticipantRow) -> Participant {
    Participant {
        user_id: parse_uuid(&row.user_id, "participant user_id"),
        last_read_message_id: parse_opt_uuid(row.last_read_message_id.as_deref(), "last_read_message_id"),
        unread_count: row.unread_count,
        joined_at: parse_timestamp(&row.joined_at),
    }
}

pub(crate) fn conversation(row: ConversationRow, participants: Vec<ParticipantRow>) -> Conversation {
    let subject = row.subject_id.as_deref().map(|id| Subject {
        id: parse_uuid(id, "subject_id"),
        title: row.subject_title.clone().unwrap_or_default(),
        seller_id: parse_opt_uuid(row.subject_seller_id.as_deref(), "subject_seller_id"),
        image_url: row.subject_image_url.clone(),
        price: row.subject_price,
    });

    let metadata = serde_json::from_str(&row.metadata).unwrap_or_else(|e| {
        warn!("Corrupt metadata on conversation '{}': {}", row.id, e);
        serde_json::Map::new()
    });

    Conversation {
        id: parse_uuid(&row.id, "conversation id"),
        subject,
        metadata,
        created_at: parse_timestamp(&row.created_at),
        updated_at: parse_timestamp(&row.updated_at),
        last_message_at: parse_opt_timestamp(row.last_message_at.as_deref()),
        participants: participants.into_iter().map(participant).collect(),
    }
}

pub(crate) fn summary(row: ConversationListRow) -> ConversationSummary {
    ConversationSummary {
        id: parse_uuid(&row.id, "conversation id"),
        subject_id: parse_opt_uuid(row.subject_id.as_deref(), "subject_id"),
        subject_title: row.subject_title,
        subject_image_url: row.subject_image_url,
        subject_price: row.subject_price,
        last_message_at: parse_opt_timestamp(row.last_message_at.as_deref()),
        unread_count: row.unread_count,
        other_user_id: parse_opt_uuid(row.other_user_id.as_deref(), "other_user_id"),
        other_user_name: row.other_user_name,
        other_user_avatar: row.other_user_avatar,
        last_message_content: row.last_message_content,
        last_message_sender_id: parse_opt_uuid(row.last_message_sender_id.as_deref(), "last_message_sender_id"),
        last_message_time: parse_opt_timestamp(row.last_message_time.as_deref()),
    }
}
