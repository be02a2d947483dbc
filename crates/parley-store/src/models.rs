//! Persistent data model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A registered account.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct User {
    /// Server-assigned id. 0 is reserved for the system pseudo-user and
    /// never appears in this table.
    pub id: i64,
    /// Unique name, 3-20 chars of `[A-Za-z0-9_-]`.
    pub username: String,
    /// Argon2id PHC string; never reversible.
    pub password_hash: String,
    /// Mirror of live-session membership, kept for audit only.
    pub is_online: bool,
    /// Banned users cannot authenticate or send.
    pub is_banned: bool,
    /// Registration time.
    pub created_at: DateTime<Utc>,
}

/// A chat group. Private two-party chats are ordinary groups with
/// `is_private_chat` set.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct ChatGroup {
    /// Server-assigned id.
    pub id: i64,
    /// Unique name, at most 50 chars.
    pub name: String,
    /// Two-party private chat marker.
    pub is_private_chat: bool,
    /// Banned groups refuse new messages.
    pub is_banned: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Kind of a persisted message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum MessageKind {
    /// Ordinary user chat.
    Text,
    /// Server-originated notice.
    System,
    /// Assistant reply.
    Ai,
    /// File-announcement message.
    File,
}

impl MessageKind {
    /// Wire/storage spelling.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::System => "system",
            MessageKind::Ai => "ai",
            MessageKind::File => "file",
        }
    }
}

/// A persisted message. Append-only; rows are never mutated.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct StoredMessage {
    /// Monotone id; total order within a group.
    pub id: i64,
    /// Owning group.
    pub group_id: i64,
    /// Author; 0 for system.
    pub sender_id: i64,
    /// Body, at most [`crate::MAX_CONTENT_LEN`] chars.
    pub content: String,
    /// Message kind.
    pub message_type: MessageKind,
    /// Insert time.
    pub timestamp: DateTime<Utc>,
}

/// One row of [`crate::Store::get_history`]: a message joined to its
/// sender's current username.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct HistoryRow {
    /// Message id.
    pub message_id: i64,
    /// Owning group.
    pub group_id: i64,
    /// Author id.
    pub sender_id: i64,
    /// Author name, `system` for the pseudo-user.
    pub sender_username: String,
    /// Body.
    pub content: String,
    /// Message kind.
    pub message_type: MessageKind,
    /// Insert time.
    pub timestamp: DateTime<Utc>,
}

/// A queued frame for an offline recipient.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct OfflineMessage {
    /// Queue row id; drain order.
    pub id: i64,
    /// Recipient.
    pub user_id: i64,
    /// Opaque frame JSON to replay verbatim.
    pub payload: String,
    /// Enqueue time.
    pub created_at: DateTime<Utc>,
    /// Set exactly once by drain.
    pub is_delivered: bool,
}

/// Metadata of a completed upload.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct FileRecord {
    /// Row id.
    pub id: i64,
    /// Public transfer identifier.
    pub file_id: String,
    /// Name the uploader gave the file.
    pub original_filename: String,
    /// Server-chosen path under the storage root; unique.
    pub server_filepath: String,
    /// Byte length of the stored file.
    pub file_size: i64,
    /// MD5 of the stored bytes, lowercase hex.
    pub checksum: String,
    /// Uploading user.
    pub uploader_id: i64,
    /// Group the file was shared in.
    pub group_id: i64,
    /// Completion time.
    pub upload_time: DateTime<Utc>,
    /// The `file`-typed chat message announcing this upload.
    pub message_id: Option<i64>,
}
