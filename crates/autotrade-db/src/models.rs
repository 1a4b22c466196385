/// Database row types. Each maps directly to a SQLite row.
/// Distinct from autotrade-types models to keep the DB layer independent.

pub struct ConversationRow {
    pub id: String,
    pub subject_id: Option<String>,
    pub subject_title: Option<String>,
    pub subject_seller_id: Option<String>,
    pub subject_image_url: Option<String>,
    pub subject_price: Option<f64>,
    pub metadata: String,
    pub created_at: String,
    pub updated_at: String,
    pub last_message_at: Option<String>,
}

/// Everything needed to insert a conversation; the participants go in the
/// same transaction.
pub struct NewConversation<'a> {
    pub id: &'a str,
    pub subject_id: Option<&'a str>,
    pub subject_title: Option<&'a str>,
    pub subject_seller_id: Option<&'a str>,
    pub subject_image_url: Option<&'a str>,
    pub subject_price: Option<f64>,
    pub metadata: &'a str,
    pub participant_ids: &'a [String],
    pub created_at: &'a str,
}

pub struct ParticipantRow {
    pub conversation_id: String,
    pub user_id: String,
    pub last_read_message_id: Option<String>,
    pub unread_count: i64,
    pub joined_at: String,
}

/// Chat list entry for one user, joined in a single query.
pub struct ConversationListRow {
    pub id: String,
    pub subject_id: Option<String>,
    pub subject_title: Option<String>,
    pub subject_image_url: Option<String>,
    pub subject_price: Option<f64>,
    pub last_message_at: Option<String>,
    pub unread_count: i64,
    pub other_user_id: Option<String>,
    pub other_user_name: Option<String>,
    pub other_user_avatar: Option<String>,
    pub last_message_content: Option<String>,
    pub last_message_sender_id: Option<String>,
    pub last_message_time: Option<String>,
}

pub struct MessageRow {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub content: String,
    pub message_type: String,
    pub media_url: Option<String>,
    pub is_read: bool,
    pub status: String,
    pub delivered_at: Option<String>,
    pub seen_at: Option<String>,
    pub created_at: String,
}

pub struct NewMessage<'a> {
    pub id: &'a str,
    pub conversation_id: &'a str,
    pub sender_id: &'a str,
    pub content: &'a str,
    pub message_type: &'a str,
    pub media_url: Option<&'a str>,
    pub created_at: &'a str,
}
