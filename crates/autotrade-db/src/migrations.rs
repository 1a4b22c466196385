use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        -- Profiles are written by the auth module; chat only reads them.
        CREATE TABLE IF NOT EXISTS users (
            id          TEXT PRIMARY KEY,
            full_name   TEXT NOT NULL DEFAULT '',
            avatar_url  TEXT
        );

        CREATE TABLE IF NOT EXISTS conversations (
            id                  TEXT PRIMARY KEY,
            subject_id          TEXT,
            subject_title       TEXT,
            subject_seller_id   TEXT,
            subject_image_url   TEXT,
            subject_price       REAL,
            metadata            TEXT NOT NULL DEFAULT '{}',
            created_at          TEXT NOT NULL,
            updated_at          TEXT NOT NULL,
            last_message_at     TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_conversations_subject
            ON conversations(subject_id);

        CREATE TABLE IF NOT EXISTS conversation_participants (
            conversation_id         TEXT NOT NULL REFERENCES conversations(id),
            user_id                 TEXT NOT NULL,
            last_read_message_id    TEXT,
            unread_count            INTEGER NOT NULL DEFAULT 0 CHECK (unread_count >= 0),
            joined_at               TEXT NOT NULL,
            PRIMARY KEY (conversation_id, user_id)
        );

        CREATE INDEX IF NOT EXISTS idx_participants_user
            ON conversation_participants(user_id);

        CREATE TABLE IF NOT EXISTS messages (
            id              TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL REFERENCES conversations(id),
            sender_id       TEXT NOT NULL,
            content         TEXT NOT NULL DEFAULT '',
            message_type    TEXT NOT NULL DEFAULT 'text',
            media_url       TEXT,
            is_read         INTEGER NOT NULL DEFAULT 0,
            status          TEXT NOT NULL DEFAULT 'sent'
                            CHECK (status IN ('sent', 'delivered', 'seen')),
            delivered_at    TEXT,
            seen_at         TEXT,
            created_at      TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON messages(conversation_id, created_at);

        CREATE TABLE IF NOT EXISTS user_devices (
            id          TEXT PRIMARY KEY,
            user_id     TEXT NOT NULL,
            token       TEXT NOT NULL,
            device_type TEXT NOT NULL DEFAULT 'android',
            created_at  TEXT NOT NULL,
            updated_at  TEXT NOT NULL,
            UNIQUE(user_id, token)
        );

        CREATE INDEX IF NOT EXISTS idx_user_devices_user
            ON user_devices(user_id);
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
