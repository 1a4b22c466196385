use crate::models::{
    ConversationListRow, ConversationRow, MessageRow, NewConversation, NewMessage, ParticipantRow,
};
use crate::Database;
use anyhow::Result;
use rusqlite::Connection;
use rusqlite::types::ToSql;

const MESSAGE_COLUMNS: &str = "id, conversation_id, sender_id, content, message_type, media_url, \
     is_read, status, delivered_at, seen_at, created_at";

impl Database {
    // -- Users --

    pub fn upsert_user(&self, id: &str, full_name: &str, avatar_url: Option<&str>) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, full_name, avatar_url) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET full_name = excluded.full_name, avatar_url = excluded.avatar_url",
                rusqlite::params![id, full_name, avatar_url],
            )?;
            Ok(())
        })
    }

    // -- Conversations --

    /// Returns the conversation linking exactly `participant_ids` (and the
    /// subject, when one is given), creating it if none exists. Lookup and
    /// insert run in one transaction. The flag is `true` when a new
    /// conversation was created.
    pub fn find_or_create_conversation(&self, new: &NewConversation<'_>) -> Result<(String, bool)> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            if let Some(existing) =
                query_conversation_by_participants(&tx, new.participant_ids, new.subject_id)?
            {
                return Ok((existing, false));
            }

            tx.execute(
                "INSERT INTO conversations (id, subject_id, subject_title, subject_seller_id,
                    subject_image_url, subject_price, metadata, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
                rusqlite::params![
                    new.id,
                    new.subject_id,
                    new.subject_title,
                    new.subject_seller_id,
                    new.subject_image_url,
                    new.subject_price,
                    new.metadata,
                    new.created_at,
                ],
            )?;

            for user_id in new.participant_ids {
                tx.execute(
                    "INSERT INTO conversation_participants (conversation_id, user_id, joined_at)
                     VALUES (?1, ?2, ?3)",
                    (new.id, user_id, new.created_at),
                )?;
            }

            tx.commit()?;
            Ok((new.id.to_string(), true))
        })
    }

    pub fn get_conversation(&self, id: &str) -> Result<Option<ConversationRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, subject_id, subject_title, subject_seller_id, subject_image_url,
                        subject_price, metadata, created_at, updated_at, last_message_at
                 FROM conversations WHERE id = ?1",
                [id],
                |row| {
                    Ok(ConversationRow {
                        id: row.get(0)?,
                        subject_id: row.get(1)?,
                        subject_title: row.get(2)?,
                        subject_seller_id: row.get(3)?,
                        subject_image_url: row.get(4)?,
                        subject_price: row.get(5)?,
                        metadata: row.get(6)?,
                        created_at: row.get(7)?,
                        updated_at: row.get(8)?,
                        last_message_at: row.get(9)?,
                    })
                },
            )
            .optional()
        })
    }

    pub fn get_participants(&self, conversation_id: &str) -> Result<Vec<ParticipantRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT conversation_id, user_id, last_read_message_id, unread_count, joined_at
                 FROM conversation_participants
                 WHERE conversation_id = ?1
                 ORDER BY joined_at, user_id",
            )?;

            let rows = stmt
                .query_map([conversation_id], |row| {
                    Ok(ParticipantRow {
                        conversation_id: row.get(0)?,
                        user_id: row.get(1)?,
                        last_read_message_id: row.get(2)?,
                        unread_count: row.get(3)?,
                        joined_at: row.get(4)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    pub fn get_participant_ids(&self, conversation_id: &str) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT user_id FROM conversation_participants WHERE conversation_id = ?1",
            )?;
            let ids = stmt
                .query_map([conversation_id], |row| row.get(0))?
                .collect::<std::result::Result<Vec<String>, _>>()?;
            Ok(ids)
        })
    }

    pub fn is_participant(&self, conversation_id: &str, user_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM conversation_participants WHERE conversation_id = ?1 AND user_id = ?2",
                    (conversation_id, user_id),
                    |row| row.get(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
    }

    /// One page of a user's conversations, most recent activity first.
    pub fn list_conversations(
        &self,
        user_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ConversationListRow>> {
        self.with_conn(|conn| {
            // One row per conversation: the "other" participant is the earliest
            // joiner that isn't the caller; the last message comes from a
            // correlated subquery.
            let mut stmt = conn.prepare(
                "SELECT c.id, c.subject_id, c.subject_title, c.subject_image_url, c.subject_price,
                        c.last_message_at, cp.unread_count,
                        other.user_id, u.full_name, u.avatar_url,
                        lm.content, lm.sender_id, lm.created_at
                 FROM conversations c
                 INNER JOIN conversation_participants cp
                     ON cp.conversation_id = c.id AND cp.user_id = ?1
                 LEFT JOIN conversation_participants other
                     ON other.conversation_id = c.id
                     AND other.user_id = (
                         SELECT p.user_id FROM conversation_participants p
                         WHERE p.conversation_id = c.id AND p.user_id != ?1
                         ORDER BY p.joined_at, p.user_id
                         LIMIT 1
                     )
                 LEFT JOIN users u ON u.id = other.user_id
                 LEFT JOIN messages lm
                     ON lm.id = (
                         SELECT m.id FROM messages m
                         WHERE m.conversation_id = c.id
                         ORDER BY m.created_at DESC, m.rowid DESC
                         LIMIT 1
                     )
                 ORDER BY COALESCE(c.last_message_at, c.updated_at) DESC, c.id
                 LIMIT ?2 OFFSET ?3",
            )?;

            let rows = stmt
                .query_map(rusqlite::params![user_id, limit, offset], |row| {
                    Ok(ConversationListRow {
                        id: row.get(0)?,
                        subject_id: row.get(1)?,
                        subject_title: row.get(2)?,
                        subject_image_url: row.get(3)?,
                        subject_price: row.get(4)?,
                        last_message_at: row.get(5)?,
                        unread_count: row.get(6)?,
                        other_user_id: row.get(7)?,
                        other_user_name: row.get(8)?,
                        other_user_avatar: row.get(9)?,
                        last_message_content: row.get(10)?,
                        last_message_sender_id: row.get(11)?,
                        last_message_time: row.get(12)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    // -- Messages --

    /// Inserts the message and bumps the conversation's activity timestamps
    /// in one transaction. Returns `false` (and writes nothing) when the
    /// conversation does not exist.
    pub fn insert_message(&self, msg: &NewMessage<'_>) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let touched = tx.execute(
                "UPDATE conversations SET last_message_at = ?2, updated_at = ?2 WHERE id = ?1",
                (msg.conversation_id, msg.created_at),
            )?;
            if touched == 0 {
                return Ok(false);
            }

            tx.execute(
                "INSERT INTO messages (id, conversation_id, sender_id, content, message_type, media_url, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    msg.id,
                    msg.conversation_id,
                    msg.sender_id,
                    msg.content,
                    msg.message_type,
                    msg.media_url,
                    msg.created_at,
                ],
            )?;

            tx.commit()?;
            Ok(true)
        })
    }

    /// Relative increment for everyone in the conversation except the sender.
    pub fn increment_unread(&self, conversation_id: &str, sender_id: &str) -> Result<usize> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE conversation_participants SET unread_count = unread_count + 1
                 WHERE conversation_id = ?1 AND user_id != ?2",
                (conversation_id, sender_id),
            )?;
            Ok(n)
        })
    }

    pub fn count_messages(&self, conversation_id: &str) -> Result<i64> {
        self.with_conn(|conn| {
            let n = conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE conversation_id = ?1",
                [conversation_id],
                |row| row.get(0),
            )?;
            Ok(n)
        })
    }

    /// Newest first.
    pub fn get_messages(&self, conversation_id: &str, limit: i64, offset: i64) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE conversation_id = ?1
                 ORDER BY created_at DESC, rowid DESC
                 LIMIT ?2 OFFSET ?3"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(rusqlite::params![conversation_id, limit, offset], map_message_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn get_message(&self, id: &str) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1");
            conn.query_row(&sql, [id], map_message_row).optional()
        })
    }

    /// Flags every message from other senders up to and including
    /// `message_id` as read and records it as the participant's read
    /// pointer. Returns `None` when the message is not in the conversation.
    pub fn mark_read_up_to(
        &self,
        conversation_id: &str,
        user_id: &str,
        message_id: &str,
    ) -> Result<Option<usize>> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let cutoff: Option<String> = tx
                .query_row(
                    "SELECT created_at FROM messages WHERE id = ?1 AND conversation_id = ?2",
                    (message_id, conversation_id),
                    |row| row.get(0),
                )
                .optional()?;
            let Some(cutoff) = cutoff else {
                return Ok(None);
            };

            let affected = tx.execute(
                "UPDATE messages SET is_read = 1
                 WHERE conversation_id = ?1 AND sender_id != ?2 AND is_read = 0 AND created_at <= ?3",
                (conversation_id, user_id, &cutoff),
            )?;

            tx.execute(
                "UPDATE conversation_participants SET last_read_message_id = ?3
                 WHERE conversation_id = ?1 AND user_id = ?2",
                (conversation_id, user_id, message_id),
            )?;

            tx.commit()?;
            Ok(Some(affected))
        })
    }

    /// `sent` → `delivered`. Anything already delivered or seen is left alone.
    pub fn mark_delivered(&self, message_id: &str, at: &str) -> Result<usize> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE messages SET status = 'delivered', delivered_at = ?2
                 WHERE id = ?1 AND status = 'sent'",
                (message_id, at),
            )?;
            Ok(n)
        })
    }

    /// Advances every not-yet-seen message from other senders to `seen` and
    /// zeroes the viewer's unread counter, atomically.
    pub fn mark_conversation_seen(&self, conversation_id: &str, user_id: &str, at: &str) -> Result<usize> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let affected = tx.execute(
                "UPDATE messages
                 SET status = 'seen', seen_at = ?3, is_read = 1,
                     delivered_at = COALESCE(delivered_at, ?3)
                 WHERE conversation_id = ?1 AND sender_id != ?2 AND status != 'seen'",
                (conversation_id, user_id, at),
            )?;

            tx.execute(
                "UPDATE conversation_participants SET unread_count = 0
                 WHERE conversation_id = ?1 AND user_id = ?2",
                (conversation_id, user_id),
            )?;

            tx.commit()?;
            Ok(affected)
        })
    }

    // -- Unread counters --

    pub fn reset_unread(&self, conversation_id: &str, user_id: &str) -> Result<usize> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE conversation_participants SET unread_count = 0
                 WHERE conversation_id = ?1 AND user_id = ?2",
                (conversation_id, user_id),
            )?;
            Ok(n)
        })
    }

    pub fn get_unread_count(&self, conversation_id: &str, user_id: &str) -> Result<Option<i64>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT unread_count FROM conversation_participants
                 WHERE conversation_id = ?1 AND user_id = ?2",
                (conversation_id, user_id),
                |row| row.get(0),
            )
            .optional()
        })
    }

    pub fn total_unread(&self, user_id: &str) -> Result<i64> {
        self.with_conn(|conn| {
            let total = conn.query_row(
                "SELECT COALESCE(SUM(unread_count), 0) FROM conversation_participants WHERE user_id = ?1",
                [user_id],
                |row| row.get(0),
            )?;
            Ok(total)
        })
    }

    // -- Devices --

    pub fn upsert_device(&self, id: &str, user_id: &str, token: &str, device_type: &str, now: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO user_devices (id, user_id, token, device_type, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                 ON CONFLICT(user_id, token) DO UPDATE
                 SET device_type = excluded.device_type, updated_at = excluded.updated_at",
                rusqlite::params![id, user_id, token, device_type, now],
            )?;
            Ok(())
        })
    }

    pub fn delete_device(&self, user_id: &str, token: &str) -> Result<usize> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "DELETE FROM user_devices WHERE user_id = ?1 AND token = ?2",
                (user_id, token),
            )?;
            Ok(n)
        })
    }

    /// Batch-fetch push tokens for a set of users.
    pub fn get_device_tokens(&self, user_ids: &[String]) -> Result<Vec<String>> {
        if user_ids.is_empty() {
            return Ok(vec![]);
        }

        self.with_conn(|conn| {
            let sql = format!(
                "SELECT DISTINCT token FROM user_devices WHERE user_id IN ({})",
                placeholders(1, user_ids.len())
            );

            let mut stmt = conn.prepare(&sql)?;
            let params: Vec<&dyn ToSql> = user_ids.iter().map(|id| id as &dyn ToSql).collect();

            let tokens = stmt
                .query_map(params.as_slice(), |row| row.get(0))?
                .collect::<std::result::Result<Vec<String>, _>>()?;

            Ok(tokens)
        })
    }
}

fn query_conversation_by_participants(
    conn: &Connection,
    participant_ids: &[String],
    subject_id: Option<&str>,
) -> Result<Option<String>> {
    let n = participant_ids.len();
    let size = n as i64;

    // Exact set match: same member count, and every member is in the set.
    let mut sql = format!(
        "SELECT c.id FROM conversations c
         WHERE (SELECT COUNT(*) FROM conversation_participants p
                WHERE p.conversation_id = c.id) = ?{count}
           AND (SELECT COUNT(*) FROM conversation_participants p
                WHERE p.conversation_id = c.id AND p.user_id IN ({ids})) = ?{count}",
        count = n + 1,
        ids = placeholders(1, n),
    );
    if subject_id.is_some() {
        sql.push_str(&format!(" AND c.subject_id = ?{}", n + 2));
    }
    sql.push_str(" ORDER BY c.created_at LIMIT 1");

    let mut params: Vec<&dyn ToSql> = participant_ids.iter().map(|id| id as &dyn ToSql).collect();
    params.push(&size);
    if let Some(subject) = subject_id.as_ref() {
        params.push(subject);
    }

    conn.query_row(&sql, params.as_slice(), |row| row.get(0))
        .optional()
}

fn map_message_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        sender_id: row.get(2)?,
        content: row.get(3)?,
        message_type: row.get(4)?,
        media_url: row.get(5)?,
        is_read: row.get(6)?,
        status: row.get(7)?,
        delivered_at: row.get(8)?,
        seen_at: row.get(9)?,
        created_at: row.get(10)?,
    })
}

/// `?start, ?start+1, ...` for `len` parameters.
fn placeholders(start: usize, len: usize) -> String {
    (start..start + len)
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
