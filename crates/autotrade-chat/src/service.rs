use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::anyhow;
use chrono::Utc;
use tracing::{debug, error, warn};
use uuid::Uuid;

use autotrade_db::Database;
use autotrade_db::format_timestamp;
use autotrade_db::models::{NewConversation, NewMessage};
use autotrade_types::api::{ChatHistory, ConversationSummary};
use autotrade_types::models::{ChatMessage, Conversation, DeviceType, MessageType, Subject};
use autotrade_types::wire::WireMessage;

use crate::convert;
use crate::error::{ChatError, Result};
use crate::push::{PushNotification, PushNotifier};

pub const DEFAULT_HISTORY_PAGE_SIZE: i64 = 50;
pub const MAX_PAGE_SIZE: i64 = 100;
pub const DEFAULT_LIST_PAGE_SIZE: i64 = 20;

/// Outcome of a `message:delivered` receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReceipt {
    /// 1 when the message moved from `sent` to `delivered`, 0 otherwise.
    pub affected: usize,
    pub conversation_id: Uuid,
    /// Author of the message, the one who wants the confirmation.
    pub sender_id: Uuid,
}

/// Sole writer of persisted chat state. Shared by the HTTP handlers and the
/// socket hub; every database call runs on the blocking pool.
#[derive(Clone)]
pub struct ChatService {
    db: Arc<Database>,
    notifier: Arc<dyn PushNotifier>,
}

impl ChatService {
    pub fn new(db: Arc<Database>, notifier: Arc<dyn PushNotifier>) -> Self {
        Self { db, notifier }
    }

    async fn blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(db.as_ref()))
            .await
            .map_err(|e| ChatError::Storage(anyhow!("spawn_blocking join error: {}", e)))?
            .map_err(ChatError::Storage)
    }

    // -- Conversations --

    /// Returns the conversation between exactly these users (about `subject`,
    /// if one is given), creating it when none exists.
    pub async fn start_conversation(
        &self,
        participant_ids: Vec<Uuid>,
        subject: Option<Subject>,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) -> Result<Conversation> {
        let members: BTreeSet<Uuid> = participant_ids.into_iter().filter(|id| !id.is_nil()).collect();
        if members.is_empty() {
            return Err(ChatError::InvalidInput("a conversation needs at least one participant".into()));
        }

        let members: Vec<String> = members.iter().map(Uuid::to_string).collect();
        let metadata = serde_json::Value::Object(metadata).to_string();

        let conversation_id = self
            .blocking(move |db| {
                let id = Uuid::new_v4().to_string();
                let created_at = format_timestamp(Utc::now());
                let subject_id = subject.as_ref().map(|s| s.id.to_string());
                let seller_id = subject.as_ref().and_then(|s| s.seller_id).map(|id| id.to_string());

                let (id, created) = db.find_or_create_conversation(&NewConversation {
                    id: &id,
                    subject_id: subject_id.as_deref(),
                    subject_title: subject.as_ref().map(|s| s.title.as_str()),
                    subject_seller_id: seller_id.as_deref(),
                    subject_image_url: subject.as_ref().and_then(|s| s.image_url.as_deref()),
                    subject_price: subject.as_ref().and_then(|s| s.price),
                    metadata: &metadata,
                    participant_ids: &members,
                    created_at: &created_at,
                })?;

                if created {
                    debug!("Created conversation {} with {} participant(s)", id, members.len());
                }
                Ok(id)
            })
            .await?;

        self.get_conversation(convert::parse_uuid(&conversation_id, "conversation id"))
            .await
    }

    pub async fn get_conversation(&self, conversation_id: Uuid) -> Result<Conversation> {
        let cid = conversation_id.to_string();
        let found = self
            .blocking(move |db| {
                let Some(row) = db.get_conversation(&cid)? else {
                    return Ok(None);
                };
                let participants = db.get_participants(&cid)?;
                Ok(Some((row, participants)))
            })
            .await?;

        let (row, participants) = found.ok_or(ChatError::NotFound("conversation"))?;
        Ok(convert::conversation(row, participants))
    }

    /// One page of the user's chat list, most recent activity first.
    pub async fn list_conversations(
        &self,
        user_id: Uuid,
        page: Option<i64>,
        page_size: Option<i64>,
    ) -> Result<Vec<ConversationSummary>> {
        let (page, page_size) = clamp_page(page, page_size, DEFAULT_LIST_PAGE_SIZE);
        let uid = user_id.to_string();
        let rows = self
            .blocking(move |db| db.list_conversations(&uid, page_size, page_offset(page, page_size)))
            .await?;
        Ok(rows.into_iter().map(convert::summary).collect())
    }

    pub async fn participant_ids(&self, conversation_id: Uuid) -> Result<Vec<Uuid>> {
        let cid = conversation_id.to_string();
        let ids = self.blocking(move |db| db.get_participant_ids(&cid)).await?;
        Ok(ids
            .iter()
            .map(|id| convert::parse_uuid(id, "participant user_id"))
            .collect())
    }

    pub async fn is_participant(&self, conversation_id: Uuid, user_id: Uuid) -> Result<bool> {
        let (cid, uid) = (conversation_id.to_string(), user_id.to_string());
        self.blocking(move |db| db.is_participant(&cid, &uid)).await
    }

    /// Fails with `Forbidden` for non-members and `NotFound` for unknown
    /// conversations.
    async fn require_participant(&self, conversation_id: Uuid, user_id: Uuid) -> Result<()> {
        let (cid, uid) = (conversation_id.to_string(), user_id.to_string());
        let (member, exists) = self
            .blocking(move |db| {
                if db.is_participant(&cid, &uid)? {
                    return Ok((true, true));
                }
                Ok((false, db.get_conversation(&cid)?.is_some()))
            })
            .await?;

        match (member, exists) {
            (true, _) => Ok(()),
            (false, true) => Err(ChatError::Forbidden),
            (false, false) => Err(ChatError::NotFound("conversation")),
        }
    }

    // -- Messages --

    /// Persists an inbound `message` frame. The row and the conversation's
    /// activity bump are one transaction; the unread increment that follows
    /// is best effort and never undoes the send.
    pub async fn save_message(&self, msg: &WireMessage) -> Result<ChatMessage> {
        let message_type: MessageType = msg.message_type.parse().map_err(ChatError::InvalidInput)?;
        self.require_participant(msg.conversation_id, msg.sender_id).await?;

        let id = Uuid::new_v4().to_string();
        let cid = msg.conversation_id.to_string();
        let sender = msg.sender_id.to_string();
        let content = msg.content.clone();
        let media_url = (!msg.media_url.is_empty()).then(|| msg.media_url.clone());
        let created_at = format_timestamp(msg.timestamp);

        let (saved, row) = {
            let (id, cid, sender) = (id.clone(), cid.clone(), sender.clone());
            self.blocking(move |db| {
                let saved = db.insert_message(&NewMessage {
                    id: &id,
                    conversation_id: &cid,
                    sender_id: &sender,
                    content: &content,
                    message_type: message_type.as_str(),
                    media_url: media_url.as_deref(),
                    created_at: &created_at,
                })?;
                let row = if saved { db.get_message(&id)? } else { None };
                Ok((saved, row))
            })
            .await?
        };

        if !saved {
            return Err(ChatError::NotFound("conversation"));
        }
        let row = row.ok_or(ChatError::NotFound("message"))?;

        if let Err(e) = self.blocking(move |db| db.increment_unread(&cid, &sender)).await {
            error!("Failed to increment unread counters for message {}: {}", id, e);
        }

        Ok(convert::message(row))
    }

    /// Newest first. `page` starts at 1; the size is clamped to
    /// [`MAX_PAGE_SIZE`].
    pub async fn history(
        &self,
        conversation_id: Uuid,
        page: Option<i64>,
        page_size: Option<i64>,
    ) -> Result<ChatHistory> {
        let (page, page_size) = clamp_page(page, page_size, DEFAULT_HISTORY_PAGE_SIZE);
        let cid = conversation_id.to_string();

        let (total_count, rows) = self
            .blocking(move |db| {
                let total = db.count_messages(&cid)?;
                let rows = db.get_messages(&cid, page_size, page_offset(page, page_size))?;
                Ok((total, rows))
            })
            .await?;

        Ok(ChatHistory {
            messages: rows.into_iter().map(convert::message).collect(),
            total_count,
            page,
            page_size,
        })
    }

    /// Flags messages from others up to `message_id` as read. Returns how
    /// many rows changed so callers can skip no-op receipts.
    pub async fn mark_read_up_to(&self, user_id: Uuid, conversation_id: Uuid, message_id: Uuid) -> Result<usize> {
        self.require_participant(conversation_id, user_id).await?;

        let (cid, uid, mid) = (conversation_id.to_string(), user_id.to_string(), message_id.to_string());
        self.blocking(move |db| db.mark_read_up_to(&cid, &uid, &mid))
            .await?
            .ok_or(ChatError::NotFound("message"))
    }

    /// `sent` → `delivered`; a no-op for messages already delivered or seen
    /// and for receipts the author sends about their own message. Only
    /// members of the message's conversation may acknowledge it.
    pub async fn mark_delivered(&self, user_id: Uuid, message_id: Uuid) -> Result<DeliveryReceipt> {
        let mid = message_id.to_string();
        let row = {
            let mid = mid.clone();
            self.blocking(move |db| db.get_message(&mid)).await?
        }
        .ok_or(ChatError::NotFound("message"))?;

        let conversation_id = convert::parse_uuid(&row.conversation_id, "conversation_id");
        let sender_id = convert::parse_uuid(&row.sender_id, "sender_id");
        self.require_participant(conversation_id, user_id).await?;

        let affected = if sender_id == user_id {
            0
        } else {
            self.blocking(move |db| db.mark_delivered(&mid, &format_timestamp(Utc::now())))
                .await?
        };

        Ok(DeliveryReceipt {
            affected,
            conversation_id,
            sender_id,
        })
    }

    /// Everything from others in the conversation becomes `seen` and the
    /// viewer's unread counter drops to zero. Returns the number of messages
    /// that changed.
    pub async fn mark_conversation_seen(&self, conversation_id: Uuid, user_id: Uuid) -> Result<usize> {
        self.require_participant(conversation_id, user_id).await?;

        let (cid, uid) = (conversation_id.to_string(), user_id.to_string());
        self.blocking(move |db| db.mark_conversation_seen(&cid, &uid, &format_timestamp(Utc::now())))
            .await
    }

    // -- Unread counters --

    pub async fn total_unread(&self, user_id: Uuid) -> Result<i64> {
        let uid = user_id.to_string();
        self.blocking(move |db| db.total_unread(&uid)).await
    }

    pub async fn unread_count(&self, conversation_id: Uuid, user_id: Uuid) -> Result<i64> {
        let (cid, uid) = (conversation_id.to_string(), user_id.to_string());
        self.blocking(move |db| db.get_unread_count(&cid, &uid))
            .await?
            .ok_or(ChatError::NotFound("participant"))
    }

    pub async fn reset_unread(&self, conversation_id: Uuid, user_id: Uuid) -> Result<()> {
        let (cid, uid) = (conversation_id.to_string(), user_id.to_string());
        match self.blocking(move |db| db.reset_unread(&cid, &uid)).await? {
            0 => Err(ChatError::NotFound("participant")),
            _ => Ok(()),
        }
    }

    // -- Devices --

    pub async fn register_device(&self, user_id: Uuid, token: String, device_type: DeviceType) -> Result<()> {
        if token.trim().is_empty() {
            return Err(ChatError::InvalidInput("device token is empty".into()));
        }
        let uid = user_id.to_string();
        self.blocking(move |db| {
            let now = format_timestamp(Utc::now());
            db.upsert_device(&Uuid::new_v4().to_string(), &uid, &token, device_type.as_str(), &now)
        })
        .await
    }

    /// Returns whether a registration was removed.
    pub async fn unregister_device(&self, user_id: Uuid, token: String) -> Result<bool> {
        let uid = user_id.to_string();
        let removed = self.blocking(move |db| db.delete_device(&uid, &token)).await?;
        Ok(removed > 0)
    }

    // -- Push --

    /// Best-effort push for recipients the hub could not reach live.
    /// Failures are logged, never returned.
    pub async fn send_push(&self, missed: Vec<Uuid>, msg: &WireMessage) {
        if missed.is_empty() {
            return;
        }
        let notification = PushNotification::chat_message(msg);
        if let Err(e) = self.notifier.send_to_users(&missed, &notification).await {
            warn!("Failed to send push notifications: {}", e);
        }
    }
}

/// Page floor 1; size defaults when missing or non-positive and is capped at
/// [`MAX_PAGE_SIZE`].
fn clamp_page(page: Option<i64>, page_size: Option<i64>, default_size: i64) -> (i64, i64) {
    let page = page.unwrap_or(1).max(1);
    let page_size = match page_size {
        Some(n) if n > 0 => n.min(MAX_PAGE_SIZE),
        _ => default_size,
    };
    (page, page_size)
}

/// Rows to skip before `page`. Saturates, so absurd page numbers just
/// land past the end and come back empty.
fn page_offset(page: i64, page_size: i64) -> i64 {
    (page - 1).saturating_mul(page_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use autotrade_types::models::MessageStatus;
    use autotrade_types::wire::WireKind;
    use futures_util::future::BoxFuture;

    #[derive(Default)]
    struct RecordingNotifier {
        calls: Mutex<Vec<(Vec<Uuid>, PushNotification)>>,
        fail: bool,
    }

    impl PushNotifier for RecordingNotifier {
        fn send_to_users<'a>(
            &'a self,
            user_ids: &'a [Uuid],
            notification: &'a PushNotification,
        ) -> BoxFuture<'a, anyhow::Result<()>> {
            self.calls
                .lock()
                .unwrap()
                .push((user_ids.to_vec(), notification.clone()));
            let fail = self.fail;
            Box::pin(async move {
                if fail {
                    Err(anyhow!("gateway unavailable"))
                } else {
                    Ok(())
                }
            })
        }
    }

    fn service() -> (ChatService, Arc<RecordingNotifier>, Arc<Database>) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let notifier = Arc::new(RecordingNotifier::default());
        (ChatService::new(db.clone(), notifier.clone()), notifier, db)
    }

    fn text(conversation_id: Uuid, sender_id: Uuid, content: &str) -> WireMessage {
        WireMessage::new(WireKind::Message, conversation_id, sender_id).with_content(content)
    }

    #[tokio::test]
    async fn start_conversation_is_idempotent_per_participant_set() {
        let (svc, _, _) = service();
        let (buyer, seller) = (Uuid::new_v4(), Uuid::new_v4());

        let first = svc
            .start_conversation(vec![buyer, seller, buyer], None, Default::default())
            .await
            .unwrap();
        assert_eq!(first.participants.len(), 2);

        let second = svc
            .start_conversation(vec![seller, buyer], None, Default::default())
            .await
            .unwrap();
        assert_eq!(first.id, second.id);

        let err = svc
            .start_conversation(vec![], None, Default::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn subject_and_metadata_round_trip() {
        let (svc, _, _) = service();
        let (buyer, seller) = (Uuid::new_v4(), Uuid::new_v4());
        let subject = Subject {
            id: Uuid::new_v4(),
            title: "2017 Civic, 80k km".into(),
            seller_id: Some(seller),
            image_url: Some("https://cdn.example/civic.jpg".into()),
            price: Some(14500.0),
        };
        let mut metadata = serde_json::Map::new();
        metadata.insert("source".into(), "listing_page".into());

        let conv = svc
            .start_conversation(vec![buyer, seller], Some(subject.clone()), metadata)
            .await
            .unwrap();
        assert_eq!(conv.subject.as_ref(), Some(&subject));
        assert_eq!(conv.metadata["source"], "listing_page");

        // A different listing between the same people is its own thread.
        let other = Subject { id: Uuid::new_v4(), ..subject };
        let conv2 = svc
            .start_conversation(vec![buyer, seller], Some(other), Default::default())
            .await
            .unwrap();
        assert_ne!(conv.id, conv2.id);
    }

    #[tokio::test]
    async fn save_message_bumps_unread_for_others_only() {
        let (svc, _, _) = service();
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let conv = svc
            .start_conversation(vec![a, b, c], None, Default::default())
            .await
            .unwrap();

        let saved = svc.save_message(&text(conv.id, a, "hi")).await.unwrap();
        assert_eq!(saved.status, MessageStatus::Sent);
        assert_eq!(saved.sender_id, a);
        assert_eq!(saved.content, "hi");

        svc.save_message(&text(conv.id, b, "hello")).await.unwrap();

        assert_eq!(svc.unread_count(conv.id, a).await.unwrap(), 1);
        assert_eq!(svc.unread_count(conv.id, b).await.unwrap(), 1);
        assert_eq!(svc.unread_count(conv.id, c).await.unwrap(), 2);

        let refreshed = svc.get_conversation(conv.id).await.unwrap();
        assert!(refreshed.last_message_at.is_some());
    }

    #[tokio::test]
    async fn save_message_rejects_outsiders_and_bad_types() {
        let (svc, _, _) = service();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let conv = svc
            .start_conversation(vec![a, b], None, Default::default())
            .await
            .unwrap();

        let err = svc
            .save_message(&text(conv.id, Uuid::new_v4(), "spam"))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Forbidden));

        let err = svc
            .save_message(&text(Uuid::new_v4(), a, "nowhere"))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::NotFound("conversation")));

        let mut video = text(conv.id, a, "clip");
        video.message_type = "video".into();
        assert!(matches!(
            svc.save_message(&video).await.unwrap_err(),
            ChatError::InvalidInput(_)
        ));

        assert_eq!(svc.history(conv.id, None, None).await.unwrap().total_count, 0);
    }

    #[tokio::test]
    async fn history_is_newest_first_and_clamped() {
        let (svc, _, _) = service();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let conv = svc
            .start_conversation(vec![a, b], None, Default::default())
            .await
            .unwrap();

        let start = Utc::now();
        for i in 0..5 {
            let mut msg = text(conv.id, a, &format!("m{i}"));
            msg.timestamp = start + chrono::Duration::milliseconds(i);
            svc.save_message(&msg).await.unwrap();
        }

        let page = svc.history(conv.id, Some(0), Some(2)).await.unwrap();
        assert_eq!(page.page, 1);
        assert_eq!(page.total_count, 5);
        let contents: Vec<_> = page.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["m4", "m3"]);

        let last = svc.history(conv.id, Some(3), Some(2)).await.unwrap();
        assert_eq!(last.messages.len(), 1);
        assert_eq!(last.messages[0].content, "m0");

        let big = svc.history(conv.id, None, Some(10_000)).await.unwrap();
        assert_eq!(big.page_size, MAX_PAGE_SIZE);
        let default = svc.history(conv.id, None, Some(-3)).await.unwrap();
        assert_eq!(default.page_size, DEFAULT_HISTORY_PAGE_SIZE);
    }

    #[tokio::test]
    async fn huge_page_numbers_return_empty_pages() {
        let (svc, _, _) = service();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let conv = svc
            .start_conversation(vec![a, b], None, Default::default())
            .await
            .unwrap();
        svc.save_message(&text(conv.id, a, "hi")).await.unwrap();

        let history = svc.history(conv.id, Some(i64::MAX), Some(50)).await.unwrap();
        assert!(history.messages.is_empty());
        assert_eq!(history.total_count, 1);
        assert_eq!(history.page, i64::MAX);

        let chats = svc.list_conversations(a, Some(i64::MAX), Some(i64::MAX)).await.unwrap();
        assert!(chats.is_empty());
        assert_eq!(page_offset(i64::MAX, MAX_PAGE_SIZE), i64::MAX);
    }

    #[tokio::test]
    async fn delivery_is_monotonic() {
        let (svc, _, _) = service();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let conv = svc
            .start_conversation(vec![a, b], None, Default::default())
            .await
            .unwrap();
        let msg = svc.save_message(&text(conv.id, a, "hi")).await.unwrap();

        assert_eq!(svc.mark_delivered(a, msg.id).await.unwrap().affected, 0);
        let outsider = Uuid::new_v4();
        assert!(matches!(
            svc.mark_delivered(outsider, msg.id).await.unwrap_err(),
            ChatError::Forbidden
        ));

        let receipt = svc.mark_delivered(b, msg.id).await.unwrap();
        assert_eq!(receipt.affected, 1);
        assert_eq!(receipt.sender_id, a);
        assert_eq!(receipt.conversation_id, conv.id);

        assert_eq!(svc.mark_conversation_seen(conv.id, b).await.unwrap(), 1);
        assert_eq!(svc.mark_delivered(b, msg.id).await.unwrap().affected, 0);

        let stored = svc.history(conv.id, None, None).await.unwrap().messages.remove(0);
        assert_eq!(stored.status, MessageStatus::Seen);
        assert!(stored.seen_at.is_some());
        assert!(stored.delivered_at.is_some());

        assert!(matches!(
            svc.mark_delivered(b, Uuid::new_v4()).await.unwrap_err(),
            ChatError::NotFound("message")
        ));
    }

    #[tokio::test]
    async fn seen_twice_affects_nothing_and_keeps_counter_at_zero() {
        let (svc, _, _) = service();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let conv = svc
            .start_conversation(vec![a, b], None, Default::default())
            .await
            .unwrap();
        svc.save_message(&text(conv.id, a, "one")).await.unwrap();
        svc.save_message(&text(conv.id, a, "two")).await.unwrap();
        assert_eq!(svc.total_unread(b).await.unwrap(), 2);

        assert_eq!(svc.mark_conversation_seen(conv.id, b).await.unwrap(), 2);
        assert_eq!(svc.mark_conversation_seen(conv.id, b).await.unwrap(), 0);
        assert_eq!(svc.unread_count(conv.id, b).await.unwrap(), 0);
        assert_eq!(svc.total_unread(b).await.unwrap(), 0);

        let err = svc.mark_conversation_seen(conv.id, Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, ChatError::Forbidden));
    }

    #[tokio::test]
    async fn read_up_to_reports_affected_rows() {
        let (svc, _, _) = service();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let conv = svc
            .start_conversation(vec![a, b], None, Default::default())
            .await
            .unwrap();
        let msg = svc.save_message(&text(conv.id, a, "hi")).await.unwrap();

        assert_eq!(svc.mark_read_up_to(b, conv.id, msg.id).await.unwrap(), 1);
        assert_eq!(svc.mark_read_up_to(b, conv.id, msg.id).await.unwrap(), 0);
        // The author's own message is not "read" by the author.
        assert_eq!(svc.mark_read_up_to(a, conv.id, msg.id).await.unwrap(), 0);
        assert!(matches!(
            svc.mark_read_up_to(b, conv.id, Uuid::new_v4()).await.unwrap_err(),
            ChatError::NotFound("message")
        ));
    }

    #[tokio::test]
    async fn total_unread_sums_conversations_and_reset_zeroes_one() {
        let (svc, _, _) = service();
        let (me, x, y) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let with_x = svc.start_conversation(vec![me, x], None, Default::default()).await.unwrap();
        let with_y = svc.start_conversation(vec![me, y], None, Default::default()).await.unwrap();

        svc.save_message(&text(with_x.id, x, "1")).await.unwrap();
        svc.save_message(&text(with_y.id, y, "2")).await.unwrap();
        svc.save_message(&text(with_y.id, y, "3")).await.unwrap();
        assert_eq!(svc.total_unread(me).await.unwrap(), 3);

        svc.reset_unread(with_y.id, me).await.unwrap();
        assert_eq!(svc.total_unread(me).await.unwrap(), 1);
        assert!(matches!(
            svc.reset_unread(with_y.id, x).await.unwrap_err(),
            ChatError::NotFound("participant")
        ));
    }

    #[tokio::test]
    async fn chat_list_orders_by_latest_activity() {
        let (svc, _, db) = service();
        let (me, dealer, private_seller) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        db.upsert_user(&dealer.to_string(), "City Motors", Some("https://cdn.example/cm.png"))
            .unwrap();

        let older = svc.start_conversation(vec![me, dealer], None, Default::default()).await.unwrap();
        let newer = svc
            .start_conversation(vec![me, private_seller], None, Default::default())
            .await
            .unwrap();

        // Activity in the older thread moves it to the top.
        let mut msg = text(older.id, dealer, "Still interested?");
        msg.timestamp = Utc::now() + chrono::Duration::seconds(5);
        svc.save_message(&msg).await.unwrap();

        let list = svc.list_conversations(me, None, None).await.unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].id, older.id);
        assert_eq!(list[0].other_user_id, Some(dealer));
        assert_eq!(list[0].other_user_name.as_deref(), Some("City Motors"));
        assert_eq!(list[0].last_message_content.as_deref(), Some("Still interested?"));
        assert_eq!(list[0].unread_count, 1);
        assert_eq!(list[1].id, newer.id);
        assert!(list[1].last_message_content.is_none());

        let second_page = svc.list_conversations(me, Some(2), Some(1)).await.unwrap();
        assert_eq!(second_page.len(), 1);
        assert_eq!(second_page[0].id, newer.id);
    }

    #[tokio::test]
    async fn devices_register_and_unregister() {
        let (svc, _, db) = service();
        let user = Uuid::new_v4();
        svc.register_device(user, "tok-123".into(), DeviceType::Ios).await.unwrap();
        assert_eq!(db.get_device_tokens(&[user.to_string()]).unwrap(), vec!["tok-123".to_string()]);

        assert!(svc.unregister_device(user, "tok-123".into()).await.unwrap());
        assert!(!svc.unregister_device(user, "tok-123".into()).await.unwrap());
        assert!(matches!(
            svc.register_device(user, "  ".into(), DeviceType::Web).await.unwrap_err(),
            ChatError::InvalidInput(_)
        ));
    }

    #[tokio::test]
    async fn push_failures_are_swallowed() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let notifier = Arc::new(RecordingNotifier {
            fail: true,
            ..Default::default()
        });
        let svc = ChatService::new(db, notifier.clone());
        let msg = text(Uuid::new_v4(), Uuid::new_v4(), "are you there?");
        let offline = Uuid::new_v4();

        svc.send_push(vec![offline], &msg).await;
        svc.send_push(vec![], &msg).await;

        let calls = notifier.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, vec![offline]);
        assert_eq!(calls[0].1.body, "are you there?");
    }
}
