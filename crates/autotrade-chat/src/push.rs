use std::collections::HashMap;

use futures_util::future::BoxFuture;
use tracing::info;
use uuid::Uuid;

use autotrade_types::wire::WireMessage;

/// Push bodies longer than this are cut and suffixed with "...".
const MAX_BODY_CHARS: usize = 100;

#[derive(Debug, Clone, PartialEq)]
pub struct PushNotification {
    pub title: String,
    pub body: String,
    pub data: HashMap<String, String>,
}

impl PushNotification {
    /// Notification for a chat message that did not reach its recipient live.
    pub fn chat_message(msg: &WireMessage) -> Self {
        let body = if msg.content.chars().count() > MAX_BODY_CHARS {
            let head: String = msg.content.chars().take(MAX_BODY_CHARS - 3).collect();
            format!("{head}...")
        } else {
            msg.content.clone()
        };

        let data = HashMap::from([
            ("conversation_id".to_string(), msg.conversation_id.to_string()),
            ("sender_id".to_string(), msg.sender_id.to_string()),
            ("type".to_string(), "chat_message".to_string()),
        ]);

        Self {
            title: "New Message".to_string(),
            body,
            data,
        }
    }
}

/// Delivers a notification to every registered device of the given users.
/// Best effort: callers log failures and move on.
pub trait PushNotifier: Send + Sync {
    fn send_to_users<'a>(
        &'a self,
        user_ids: &'a [Uuid],
        notification: &'a PushNotification,
    ) -> BoxFuture<'a, anyhow::Result<()>>;
}

/// Stand-in used when no push gateway is configured.
pub struct LogNotifier;

impl PushNotifier for LogNotifier {
    fn send_to_users<'a>(
        &'a self,
        user_ids: &'a [Uuid],
        notification: &'a PushNotification,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            info!(
                "Push not configured; dropping '{}' for {} user(s)",
                notification.title,
                user_ids.len()
            );
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autotrade_types::wire::WireKind;

    #[test]
    fn long_bodies_are_truncated_to_limit() {
        let msg = WireMessage::new(WireKind::Message, Uuid::new_v4(), Uuid::new_v4())
            .with_content("x".repeat(250));
        let n = PushNotification::chat_message(&msg);
        assert_eq!(n.body.chars().count(), MAX_BODY_CHARS);
        assert!(n.body.ends_with("..."));
        assert_eq!(n.title, "New Message");
        assert_eq!(n.data["type"], "chat_message");
        assert_eq!(n.data["conversation_id"], msg.conversation_id.to_string());
    }

    #[test]
    fn short_and_multibyte_bodies_survive() {
        let exact = "é".repeat(MAX_BODY_CHARS);
        let msg = WireMessage::new(WireKind::Message, Uuid::new_v4(), Uuid::new_v4())
            .with_content(exact.clone());
        assert_eq!(PushNotification::chat_message(&msg).body, exact);
    }
}
