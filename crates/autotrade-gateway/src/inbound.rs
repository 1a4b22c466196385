//! What the server does with each kind of frame a client sends.

use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

use autotrade_chat::ChatError;
use autotrade_types::wire::{WireKind, WireMessage};

use crate::hub::{Audience, Hub};

/// Handles one decoded frame from `user_id`. Failures are logged and the
/// frame is dropped; the connection stays up.
pub async fn handle_frame(hub: &Hub, user_id: Uuid, mut frame: WireMessage) {
    frame.sender_id = user_id;
    frame.timestamp = Utc::now();
    let service = hub.service();

    match frame.kind {
        WireKind::Message => match service.save_message(&frame).await {
            Ok(saved) => {
                debug!("Saved message {} in {}", saved.id, saved.conversation_id);
                frame.message_id = Some(saved.id);
                frame.message_type = saved.message_type.as_str().to_string();
                hub.route(frame, Audience::Participants);
            }
            Err(e) => log_rejected(&frame, user_id, e),
        },

        WireKind::Typing => hub.route(frame, Audience::Participants),

        WireKind::ReadReceipt => {
            let Some(message_id) = referenced_message(&frame, user_id) else {
                return;
            };
            match service.mark_read_up_to(user_id, frame.conversation_id, message_id).await {
                Ok(0) => debug!("Read receipt from {} changed nothing", user_id),
                Ok(_) => hub.route(frame, Audience::Participants),
                Err(e) => log_rejected(&frame, user_id, e),
            }
        }

        WireKind::MessageDelivered => {
            let Some(message_id) = referenced_message(&frame, user_id) else {
                return;
            };
            match service.mark_delivered(user_id, message_id).await {
                Ok(receipt) if receipt.affected > 0 => {
                    frame.conversation_id = receipt.conversation_id;
                    hub.route(frame, Audience::Users(vec![receipt.sender_id]));
                }
                Ok(_) => debug!("Message {} already delivered", message_id),
                Err(e) => log_rejected(&frame, user_id, e),
            }
        }

        WireKind::MessagesSeen => match service.mark_conversation_seen(frame.conversation_id, user_id).await {
            Ok(affected) => {
                if affected > 0 {
                    frame.content = user_id.to_string();
                    hub.route(frame, Audience::Participants);
                }
                send_unread_total(hub, user_id).await;
            }
            Err(e) => log_rejected(&frame, user_id, e),
        },

        WireKind::UnreadGet => send_unread_total(hub, user_id).await,

        WireKind::UnreadUpdate | WireKind::ConversationUpdated => {
            debug!("Ignoring server-only frame {} from {}", frame.kind, user_id);
        }

        WireKind::Unknown(ref kind) => debug!("Ignoring unknown frame type '{}' from {}", kind, user_id),
    }
}

async fn send_unread_total(hub: &Hub, user_id: Uuid) {
    match hub.service().total_unread(user_id).await {
        Ok(total) => hub.send_to(user_id, WireMessage::unread_update(total)),
        Err(e) => warn!("Failed to load unread total for {}: {}", user_id, e),
    }
}

fn referenced_message(frame: &WireMessage, user_id: Uuid) -> Option<Uuid> {
    match frame.content.trim().parse() {
        Ok(id) => Some(id),
        Err(_) => {
            warn!("{} from {} has no valid message id: '{}'", frame.kind, user_id, frame.content);
            None
        }
    }
}

fn log_rejected(frame: &WireMessage, user_id: Uuid, err: ChatError) {
    match err {
        ChatError::Storage(e) => warn!("Failed to handle {} from {}: {:#}", frame.kind, user_id, e),
        other => debug!("Rejected {} from {}: {}", frame.kind, user_id, other),
    }
}
