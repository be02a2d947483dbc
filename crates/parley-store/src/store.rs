//! Typed operations over the SQLite store.
//!
//! All state lives in one [`SqlitePool`]; [`Store`] is a cheap cloneable
//! handle. Every mutation is a single transaction - cascading deletes
//! collect orphaned file paths inside the transaction and hand them back
//! for post-commit unlink, so the database never references a file that
//! was removed first.

use crate::error::StoreError;
use crate::models::{
    ChatGroup, FileRecord, HistoryRow, MessageKind, OfflineMessage, StoredMessage, User,
};
use crate::password::{dummy_verify, hash_password, verify_password};
use crate::{MAX_CONTENT_LEN, PUBLIC_GROUP, Result, SYSTEM_SENDER};
use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    username      TEXT NOT NULL UNIQUE,
    password_hash TEXT NOT NULL,
    is_online     INTEGER NOT NULL DEFAULT 0,
    is_banned     INTEGER NOT NULL DEFAULT 0,
    created_at    TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS groups (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    name            TEXT NOT NULL UNIQUE,
    is_private_chat INTEGER NOT NULL DEFAULT 0,
    is_banned       INTEGER NOT NULL DEFAULT 0,
    created_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS group_members (
    group_id  INTEGER NOT NULL REFERENCES groups(id) ON DELETE CASCADE,
    user_id   INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    joined_at TEXT NOT NULL,
    PRIMARY KEY (group_id, user_id)
);

CREATE TABLE IF NOT EXISTS messages (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    group_id     INTEGER NOT NULL REFERENCES groups(id) ON DELETE CASCADE,
    sender_id    INTEGER NOT NULL,
    content      TEXT NOT NULL,
    message_type TEXT NOT NULL,
    timestamp    TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_messages_group_time
    ON messages(group_id, timestamp DESC);

CREATE TABLE IF NOT EXISTS offline_messages (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id      INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    payload      TEXT NOT NULL,
    created_at   TEXT NOT NULL,
    is_delivered INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_offline_user_delivered
    ON offline_messages(user_id, is_delivered);

CREATE TABLE IF NOT EXISTS files (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    file_id           TEXT NOT NULL UNIQUE,
    original_filename TEXT NOT NULL,
    server_filepath   TEXT NOT NULL UNIQUE,
    file_size         INTEGER NOT NULL,
    checksum          TEXT NOT NULL,
    uploader_id       INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    group_id          INTEGER NOT NULL REFERENCES groups(id) ON DELETE CASCADE,
    upload_time       TEXT NOT NULL,
    message_id        INTEGER
);
"#;

/// Row counts for operational logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    /// Registered accounts.
    pub users: i64,
    /// Chat groups, public group included.
    pub groups: i64,
    /// Persisted messages.
    pub messages: i64,
    /// Completed uploads.
    pub files: i64,
    /// Offline messages awaiting delivery.
    pub offline_pending: i64,
}

/// Deadline for taking a pool connection and for SQLite lock waits.
/// Expiry surfaces as [`StoreError::Timeout`] instead of blocking the
/// caller indefinitely.
const DB_DEADLINE: std::time::Duration = std::time::Duration::from_secs(5);

/// Handle to the persistent store.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db) if db.kind() == sqlx::error::ErrorKind::UniqueViolation
    )
}

fn valid_username(name: &str) -> bool {
    (3..=20).contains(&name.len())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

impl Store {
    /// Open (and create if missing) a store at the given path.
    ///
    /// Bootstraps the schema and seeds the reserved public group on first
    /// boot.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrated.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(DB_DEADLINE)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(DB_DEADLINE)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.bootstrap().await?;
        Ok(store)
    }

    /// Open an in-memory store. Test wiring; state dies with the handle.
    ///
    /// # Errors
    ///
    /// Returns an error if bootstrap fails.
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .in_memory(true)
            .foreign_keys(true)
            .busy_timeout(DB_DEADLINE);

        // Exactly one long-lived connection, or each checkout would see its
        // own empty database.
        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .acquire_timeout(DB_DEADLINE)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.bootstrap().await?;
        Ok(store)
    }

    async fn bootstrap(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;

        sqlx::query(
            "INSERT OR IGNORE INTO groups (name, is_private_chat, is_banned, created_at)
             VALUES (?, 0, 0, ?)",
        )
        .bind(PUBLIC_GROUP)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ============ Users ============

    /// Create a user and add them to the public group, atomically.
    ///
    /// # Errors
    ///
    /// `UserExists` on a duplicate name, `InvalidInput` on a malformed one.
    pub async fn create_user(&self, username: &str, password: &str) -> Result<i64> {
        if !valid_username(username) {
            return Err(StoreError::invalid_input(
                "username must be 3-20 chars of letters, digits, underscore or dash",
            ));
        }

        // Hash outside the transaction; argon2 is deliberately slow.
        let hash = hash_password(password)?;
        let now = Utc::now();

        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            "INSERT INTO users (username, password_hash, is_online, is_banned, created_at)
             VALUES (?, ?, 0, 0, ?)",
        )
        .bind(username)
        .bind(&hash)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::UserExists(username.to_string())
            } else {
                StoreError::Database(e)
            }
        })?;

        let user_id = inserted.last_insert_rowid();

        let public_id: i64 = sqlx::query_scalar("SELECT id FROM groups WHERE name = ?")
            .bind(PUBLIC_GROUP)
            .fetch_one(&mut *tx)
            .await?;

        sqlx::query(
            "INSERT OR IGNORE INTO group_members (group_id, user_id, joined_at) VALUES (?, ?, ?)",
        )
        .bind(public_id)
        .bind(user_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!(user_id, username, "user created");
        Ok(user_id)
    }

    /// Verify credentials. Returns the user on a password match regardless
    /// of ban state; the caller decides what a banned account may do.
    ///
    /// Unknown usernames still burn a hash verification so response timing
    /// does not leak account existence.
    ///
    /// # Errors
    ///
    /// Returns an error only on database failure.
    pub async fn authenticate(&self, username: &str, password: &str) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE username = ?")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;

        match user {
            None => {
                dummy_verify(password);
                Ok(None)
            }
            Some(u) => {
                if verify_password(password, &u.password_hash) {
                    Ok(Some(u))
                } else {
                    Ok(None)
                }
            }
        }
    }

    /// Fetch a user by id.
    ///
    /// # Errors
    ///
    /// `UserNotFound` if absent.
    pub async fn get_user(&self, user_id: i64) -> Result<User> {
        sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::UserNotFound)
    }

    /// Fetch a user by name, if present.
    ///
    /// # Errors
    ///
    /// Returns an error only on database failure.
    pub async fn get_user_by_name(&self, username: &str) -> Result<Option<User>> {
        Ok(
            sqlx::query_as::<_, User>("SELECT * FROM users WHERE username = ?")
                .bind(username)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    /// Mirror live-session state into the audit column.
    ///
    /// # Errors
    ///
    /// Returns an error only on database failure.
    pub async fn set_online(&self, user_id: i64, online: bool) -> Result<()> {
        sqlx::query("UPDATE users SET is_online = ? WHERE id = ?")
            .bind(online)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Ban a user. Banned users cannot authenticate or send.
    ///
    /// # Errors
    ///
    /// `UserNotFound` if absent.
    pub async fn ban_user(&self, user_id: i64) -> Result<()> {
        self.set_user_ban(user_id, true).await
    }

    /// Lift a user ban.
    ///
    /// # Errors
    ///
    /// `UserNotFound` if absent.
    pub async fn unban_user(&self, user_id: i64) -> Result<()> {
        self.set_user_ban(user_id, false).await
    }

    async fn set_user_ban(&self, user_id: i64, banned: bool) -> Result<()> {
        let result = sqlx::query("UPDATE users SET is_banned = ? WHERE id = ?")
            .bind(banned)
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::UserNotFound);
        }
        Ok(())
    }

    /// Rename a user and/or replace their password.
    ///
    /// # Errors
    ///
    /// `UserNotFound`, `UserExists` on a name collision, `InvalidInput` on
    /// a malformed name.
    pub async fn update_user(
        &self,
        user_id: i64,
        new_username: Option<&str>,
        new_password: Option<&str>,
    ) -> Result<()> {
        let new_hash = new_password.map(hash_password).transpose()?;

        let mut tx = self.pool.begin().await?;

        let exists: Option<i64> = sqlx::query_scalar("SELECT id FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(StoreError::UserNotFound);
        }

        if let Some(name) = new_username {
            if !valid_username(name) {
                return Err(StoreError::invalid_input(
                    "username must be 3-20 chars of letters, digits, underscore or dash",
                ));
            }
            sqlx::query("UPDATE users SET username = ? WHERE id = ?")
                .bind(name)
                .bind(user_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| {
                    if is_unique_violation(&e) {
                        StoreError::UserExists(name.to_string())
                    } else {
                        StoreError::Database(e)
                    }
                })?;
        }

        if let Some(hash) = new_hash {
            sqlx::query("UPDATE users SET password_hash = ? WHERE id = ?")
                .bind(hash)
                .bind(user_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Delete a user, cascading memberships, authored messages, offline
    /// queue and uploaded files. Returns the orphaned file paths for
    /// post-commit unlink.
    ///
    /// # Errors
    ///
    /// `UserNotFound` if absent.
    pub async fn delete_user(&self, user_id: i64) -> Result<Vec<String>> {
        let mut tx = self.pool.begin().await?;

        let exists: Option<i64> = sqlx::query_scalar("SELECT id FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(StoreError::UserNotFound);
        }

        let orphans: Vec<String> =
            sqlx::query_scalar("SELECT server_filepath FROM files WHERE uploader_id = ?")
                .bind(user_id)
                .fetch_all(&mut *tx)
                .await?;

        sqlx::query("DELETE FROM files WHERE uploader_id = ?")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM group_members WHERE user_id = ?")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM messages WHERE sender_id = ?")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM offline_messages WHERE user_id = ?")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM users WHERE id = ?")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        tracing::info!(user_id, orphans = orphans.len(), "user deleted");
        Ok(orphans)
    }

    // ============ Groups ============

    /// Create a group.
    ///
    /// # Errors
    ///
    /// `GroupExists` on a duplicate name, `InvalidInput` on a malformed one.
    pub async fn create_group(&self, name: &str, is_private_chat: bool) -> Result<ChatGroup> {
        if name.is_empty() || name.len() > 50 {
            return Err(StoreError::invalid_input(
                "group name must be 1-50 characters",
            ));
        }

        let now = Utc::now();
        let inserted = sqlx::query(
            "INSERT INTO groups (name, is_private_chat, is_banned, created_at)
             VALUES (?, ?, 0, ?)",
        )
        .bind(name)
        .bind(is_private_chat)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::GroupExists(name.to_string())
            } else {
                StoreError::Database(e)
            }
        })?;

        tracing::info!(group = name, is_private_chat, "group created");
        self.get_group(inserted.last_insert_rowid()).await
    }

    /// Fetch a group by id.
    ///
    /// # Errors
    ///
    /// `GroupNotFound` if absent.
    pub async fn get_group(&self, group_id: i64) -> Result<ChatGroup> {
        sqlx::query_as::<_, ChatGroup>("SELECT * FROM groups WHERE id = ?")
            .bind(group_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::GroupNotFound)
    }

    /// Fetch a group by name, if present.
    ///
    /// # Errors
    ///
    /// Returns an error only on database failure.
    pub async fn get_group_by_name(&self, name: &str) -> Result<Option<ChatGroup>> {
        Ok(
            sqlx::query_as::<_, ChatGroup>("SELECT * FROM groups WHERE name = ?")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    /// The reserved public group.
    ///
    /// # Errors
    ///
    /// Returns an error if the seed row is missing, which means bootstrap
    /// never ran.
    pub async fn public_group(&self) -> Result<ChatGroup> {
        self.get_group_by_name(PUBLIC_GROUP)
            .await?
            .ok_or(StoreError::GroupNotFound)
    }

    /// Ban a group; it refuses new messages until unbanned.
    ///
    /// # Errors
    ///
    /// `GroupNotFound` if absent.
    pub async fn ban_group(&self, group_id: i64) -> Result<()> {
        self.set_group_ban(group_id, true).await
    }

    /// Lift a group ban.
    ///
    /// # Errors
    ///
    /// `GroupNotFound` if absent.
    pub async fn unban_group(&self, group_id: i64) -> Result<()> {
        self.set_group_ban(group_id, false).await
    }

    async fn set_group_ban(&self, group_id: i64, banned: bool) -> Result<()> {
        let result = sqlx::query("UPDATE groups SET is_banned = ? WHERE id = ?")
            .bind(banned)
            .bind(group_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::GroupNotFound);
        }
        Ok(())
    }

    /// Delete a group, cascading memberships, messages and files. Returns
    /// orphaned file paths for post-commit unlink.
    ///
    /// # Errors
    ///
    /// `GroupNotFound` if absent.
    pub async fn delete_group(&self, group_id: i64) -> Result<Vec<String>> {
        let mut tx = self.pool.begin().await?;

        let exists: Option<i64> = sqlx::query_scalar("SELECT id FROM groups WHERE id = ?")
            .bind(group_id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(StoreError::GroupNotFound);
        }

        let orphans: Vec<String> =
            sqlx::query_scalar("SELECT server_filepath FROM files WHERE group_id = ?")
                .bind(group_id)
                .fetch_all(&mut *tx)
                .await?;

        sqlx::query("DELETE FROM files WHERE group_id = ?")
            .bind(group_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM group_members WHERE group_id = ?")
            .bind(group_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM messages WHERE group_id = ?")
            .bind(group_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM groups WHERE id = ?")
            .bind(group_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(orphans)
    }

    // ============ Membership ============

    /// Add a user to a group. Idempotent.
    ///
    /// # Errors
    ///
    /// `UserNotFound` / `GroupNotFound` when either side is missing.
    pub async fn add_member(&self, group_id: i64, user_id: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let group: Option<i64> = sqlx::query_scalar("SELECT id FROM groups WHERE id = ?")
            .bind(group_id)
            .fetch_optional(&mut *tx)
            .await?;
        if group.is_none() {
            return Err(StoreError::GroupNotFound);
        }

        let user: Option<i64> = sqlx::query_scalar("SELECT id FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(&mut *tx)
            .await?;
        if user.is_none() {
            return Err(StoreError::UserNotFound);
        }

        sqlx::query(
            "INSERT OR IGNORE INTO group_members (group_id, user_id, joined_at) VALUES (?, ?, ?)",
        )
        .bind(group_id)
        .bind(user_id)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Remove a user from a group.
    ///
    /// # Errors
    ///
    /// `NotAMember` if there was no such membership.
    pub async fn remove_member(&self, group_id: i64, user_id: i64) -> Result<()> {
        let result = sqlx::query("DELETE FROM group_members WHERE group_id = ? AND user_id = ?")
            .bind(group_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotAMember(group_id));
        }
        Ok(())
    }

    /// Whether a user belongs to a group.
    ///
    /// # Errors
    ///
    /// Returns an error only on database failure.
    pub async fn is_member(&self, group_id: i64, user_id: i64) -> Result<bool> {
        let row: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM group_members WHERE group_id = ? AND user_id = ?",
        )
        .bind(group_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    /// All members of a group, joined to their user rows.
    ///
    /// # Errors
    ///
    /// Returns an error only on database failure.
    pub async fn list_members(&self, group_id: i64) -> Result<Vec<User>> {
        Ok(sqlx::query_as::<_, User>(
            "SELECT u.* FROM users u
             JOIN group_members gm ON gm.user_id = u.id
             WHERE gm.group_id = ?
             ORDER BY u.username",
        )
        .bind(group_id)
        .fetch_all(&self.pool)
        .await?)
    }

    /// All groups a user belongs to.
    ///
    /// # Errors
    ///
    /// Returns an error only on database failure.
    pub async fn list_user_groups(&self, user_id: i64) -> Result<Vec<ChatGroup>> {
        Ok(sqlx::query_as::<_, ChatGroup>(
            "SELECT g.* FROM groups g
             JOIN group_members gm ON gm.group_id = g.id
             WHERE gm.user_id = ?
             ORDER BY g.id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?)
    }

    // ============ Messages ============

    /// Persist a message. Returns `(message_id, timestamp)`.
    ///
    /// # Errors
    ///
    /// `GroupNotFound`, `GroupBanned`, `MessageTooLong`, `UserNotFound`
    /// when the sender is neither the system pseudo-user nor a known
    /// user, `UserBanned` for a banned sender.
    pub async fn save_message(
        &self,
        group_id: i64,
        sender_id: i64,
        content: &str,
        kind: MessageKind,
    ) -> Result<(i64, DateTime<Utc>)> {
        let chars = content.chars().count();
        if chars > MAX_CONTENT_LEN {
            return Err(StoreError::MessageTooLong(chars));
        }

        let mut tx = self.pool.begin().await?;

        let group = sqlx::query_as::<_, ChatGroup>("SELECT * FROM groups WHERE id = ?")
            .bind(group_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StoreError::GroupNotFound)?;
        if group.is_banned {
            return Err(StoreError::GroupBanned);
        }

        if sender_id != SYSTEM_SENDER {
            let banned: Option<bool> =
                sqlx::query_scalar("SELECT is_banned FROM users WHERE id = ?")
                    .bind(sender_id)
                    .fetch_optional(&mut *tx)
                    .await?;
            match banned {
                None => return Err(StoreError::UserNotFound),
                Some(true) => return Err(StoreError::UserBanned),
                Some(false) => {}
            }
        }

        let now = Utc::now();
        let inserted = sqlx::query(
            "INSERT INTO messages (group_id, sender_id, content, message_type, timestamp)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(group_id)
        .bind(sender_id)
        .bind(content)
        .bind(kind.as_str())
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok((inserted.last_insert_rowid(), now))
    }

    /// Page through a group's history.
    ///
    /// Returns up to `limit` messages with id below `before_id` (latest
    /// when absent) in ascending id order, each joined to its sender's
    /// username, plus whether older messages remain.
    ///
    /// # Errors
    ///
    /// `GroupNotFound` if the group is missing.
    pub async fn get_history(
        &self,
        group_id: i64,
        limit: u32,
        before_id: Option<i64>,
    ) -> Result<(Vec<HistoryRow>, bool)> {
        // Existence check keeps "empty history" and "no such group" apart.
        self.get_group(group_id).await?;

        let fetch = i64::from(limit) + 1;
        let mut rows = sqlx::query_as::<_, HistoryRow>(
            "SELECT m.id AS message_id, m.group_id, m.sender_id,
                    COALESCE(u.username, 'system') AS sender_username,
                    m.content, m.message_type, m.timestamp
             FROM messages m
             LEFT JOIN users u ON u.id = m.sender_id
             WHERE m.group_id = ? AND (? IS NULL OR m.id < ?)
             ORDER BY m.id DESC
             LIMIT ?",
        )
        .bind(group_id)
        .bind(before_id)
        .bind(before_id)
        .bind(fetch)
        .fetch_all(&self.pool)
        .await?;

        let has_more = rows.len() as i64 > i64::from(limit);
        if has_more {
            rows.truncate(limit as usize);
        }
        rows.reverse();
        Ok((rows, has_more))
    }

    /// Fetch one message by id.
    ///
    /// # Errors
    ///
    /// Returns an error only on database failure.
    pub async fn get_message(&self, message_id: i64) -> Result<Option<StoredMessage>> {
        Ok(
            sqlx::query_as::<_, StoredMessage>("SELECT * FROM messages WHERE id = ?")
                .bind(message_id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    // ============ Files ============

    /// Persist metadata of a completed upload.
    ///
    /// # Errors
    ///
    /// Returns an error on referential or database failure.
    #[allow(clippy::too_many_arguments)]
    pub async fn save_file_metadata(
        &self,
        file_id: &str,
        original_filename: &str,
        server_filepath: &str,
        file_size: i64,
        checksum: &str,
        uploader_id: i64,
        group_id: i64,
        message_id: Option<i64>,
    ) -> Result<i64> {
        let inserted = sqlx::query(
            "INSERT INTO files (file_id, original_filename, server_filepath, file_size,
                                checksum, uploader_id, group_id, upload_time, message_id)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(file_id)
        .bind(original_filename)
        .bind(server_filepath)
        .bind(file_size)
        .bind(checksum)
        .bind(uploader_id)
        .bind(group_id)
        .bind(Utc::now())
        .bind(message_id)
        .execute(&self.pool)
        .await?;

        Ok(inserted.last_insert_rowid())
    }

    /// Fetch file metadata by public id.
    ///
    /// # Errors
    ///
    /// `FileNotFound` if absent.
    pub async fn get_file(&self, file_id: &str) -> Result<FileRecord> {
        sqlx::query_as::<_, FileRecord>("SELECT * FROM files WHERE file_id = ?")
            .bind(file_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::FileNotFound)
    }

    /// All files shared in a group, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error only on database failure.
    pub async fn list_group_files(&self, group_id: i64) -> Result<Vec<FileRecord>> {
        Ok(sqlx::query_as::<_, FileRecord>(
            "SELECT * FROM files WHERE group_id = ? ORDER BY id DESC",
        )
        .bind(group_id)
        .fetch_all(&self.pool)
        .await?)
    }

    // ============ Offline queue ============

    /// Queue a frame for an offline recipient.
    ///
    /// # Errors
    ///
    /// Returns an error only on database failure.
    pub async fn enqueue_offline(&self, user_id: i64, payload: &str) -> Result<i64> {
        let inserted = sqlx::query(
            "INSERT INTO offline_messages (user_id, payload, created_at, is_delivered)
             VALUES (?, ?, ?, 0)",
        )
        .bind(user_id)
        .bind(payload)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(inserted.last_insert_rowid())
    }

    /// Atomically take up to `limit` undelivered messages in insertion
    /// order, marking them delivered. Each row is returned at most once
    /// across reconnects.
    ///
    /// # Errors
    ///
    /// Returns an error only on database failure.
    pub async fn drain_offline(&self, user_id: i64, limit: u32) -> Result<Vec<OfflineMessage>> {
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query_as::<_, OfflineMessage>(
            "SELECT * FROM offline_messages
             WHERE user_id = ? AND is_delivered = 0
             ORDER BY id ASC
             LIMIT ?",
        )
        .bind(user_id)
        .bind(i64::from(limit))
        .fetch_all(&mut *tx)
        .await?;

        for row in &rows {
            sqlx::query("UPDATE offline_messages SET is_delivered = 1 WHERE id = ?")
                .bind(row.id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(rows)
    }

    /// Reap delivered rows older than the retention window. Returns the
    /// number of rows removed.
    ///
    /// # Errors
    ///
    /// Returns an error only on database failure.
    pub async fn reap_offline(&self, retention: Duration) -> Result<u64> {
        let cutoff = Utc::now() - retention;
        let result =
            sqlx::query("DELETE FROM offline_messages WHERE is_delivered = 1 AND created_at < ?")
                .bind(cutoff)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    // ============ Operational ============

    /// Row counts for startup and periodic logging.
    ///
    /// # Errors
    ///
    /// Returns an error only on database failure.
    pub async fn stats(&self) -> Result<StoreStats> {
        let users: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users")
            .fetch_one(&self.pool)
            .await?;
        let groups: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM groups")
            .fetch_one(&self.pool)
            .await?;
        let messages: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages")
            .fetch_one(&self.pool)
            .await?;
        let files: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM files")
            .fetch_one(&self.pool)
            .await?;
        let offline_pending: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM offline_messages WHERE is_delivered = 0")
                .fetch_one(&self.pool)
                .await?;

        Ok(StoreStats {
            users,
            groups,
            messages,
            files,
            offline_pending,
        })
    }

    /// Compact the database file.
    ///
    /// # Errors
    ///
    /// Returns an error only on database failure.
    pub async fn vacuum(&self) -> Result<()> {
        sqlx::query("VACUUM").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> Store {
        Store::open_in_memory().await.unwrap()
    }

    #[tokio::test]
    async fn test_public_group_seeded() {
        let s = store().await;
        let public = s.public_group().await.unwrap();
        assert_eq!(public.name, PUBLIC_GROUP);
        assert!(!public.is_private_chat);
    }

    #[tokio::test]
    async fn test_create_user_joins_public() {
        let s = store().await;
        let id = s.create_user("alice", "secret1").await.unwrap();
        let public = s.public_group().await.unwrap();

        assert!(s.is_member(public.id, id).await.unwrap());
        let groups = s.list_user_groups(id).await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].name, PUBLIC_GROUP);
    }

    #[tokio::test]
    async fn test_duplicate_username_rejected() {
        let s = store().await;
        s.create_user("alice", "secret1").await.unwrap();
        let err = s.create_user("alice", "other77").await.unwrap_err();
        assert!(matches!(err, StoreError::UserExists(_)));
    }

    #[tokio::test]
    async fn test_username_validation() {
        let s = store().await;
        assert!(matches!(
            s.create_user("ab", "secret1").await.unwrap_err(),
            StoreError::InvalidInput(_)
        ));
        assert!(matches!(
            s.create_user("has space", "secret1").await.unwrap_err(),
            StoreError::InvalidInput(_)
        ));
        s.create_user("ok_name-1", "secret1").await.unwrap();
    }

    #[tokio::test]
    async fn test_authenticate() {
        let s = store().await;
        let id = s.create_user("alice", "secret1").await.unwrap();

        let user = s.authenticate("alice", "secret1").await.unwrap().unwrap();
        assert_eq!(user.id, id);

        assert!(s.authenticate("alice", "wrong77").await.unwrap().is_none());
        assert!(s.authenticate("nobody", "secret1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_banned_user_still_authenticates_at_store_level() {
        let s = store().await;
        let id = s.create_user("alice", "secret1").await.unwrap();
        s.ban_user(id).await.unwrap();

        // Ban policy is the auth service's call; the store just reports.
        let user = s.authenticate("alice", "secret1").await.unwrap().unwrap();
        assert!(user.is_banned);

        s.unban_user(id).await.unwrap();
        let user = s.authenticate("alice", "secret1").await.unwrap().unwrap();
        assert!(!user.is_banned);
    }

    #[tokio::test]
    async fn test_update_user() {
        let s = store().await;
        let id = s.create_user("alice", "secret1").await.unwrap();

        s.update_user(id, Some("alicia"), Some("newpass7"))
            .await
            .unwrap();

        assert!(s.authenticate("alice", "secret1").await.unwrap().is_none());
        let user = s
            .authenticate("alicia", "newpass7")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(user.id, id);
    }

    #[tokio::test]
    async fn test_save_message_and_history_paging() {
        let s = store().await;
        let alice = s.create_user("alice", "secret1").await.unwrap();
        let public = s.public_group().await.unwrap();

        let mut ids = Vec::new();
        for i in 0..5 {
            let (id, _) = s
                .save_message(public.id, alice, &format!("msg {i}"), MessageKind::Text)
                .await
                .unwrap();
            ids.push(id);
        }

        let last = s.get_message(ids[4]).await.unwrap().unwrap();
        assert_eq!(last.content, "msg 4");
        assert_eq!(last.message_type, MessageKind::Text);

        // Latest page.
        let (page, has_more) = s.get_history(public.id, 3, None).await.unwrap();
        assert!(has_more);
        assert_eq!(page.len(), 3);
        assert_eq!(page[0].content, "msg 2");
        assert_eq!(page[2].content, "msg 4");
        assert_eq!(page[0].sender_username, "alice");
        assert!(page.windows(2).all(|w| w[0].message_id < w[1].message_id));

        // Older page.
        let (older, has_more) = s
            .get_history(public.id, 3, Some(page[0].message_id))
            .await
            .unwrap();
        assert!(!has_more);
        assert_eq!(older.len(), 2);
        assert_eq!(older[0].content, "msg 0");
    }

    #[tokio::test]
    async fn test_system_sender_in_history() {
        let s = store().await;
        let public = s.public_group().await.unwrap();
        s.save_message(public.id, SYSTEM_SENDER, "maintenance soon", MessageKind::System)
            .await
            .unwrap();

        let (page, _) = s.get_history(public.id, 10, None).await.unwrap();
        assert_eq!(page[0].sender_username, "system");
        assert_eq!(page[0].message_type, MessageKind::System);
    }

    #[tokio::test]
    async fn test_message_too_long() {
        let s = store().await;
        let alice = s.create_user("alice", "secret1").await.unwrap();
        let public = s.public_group().await.unwrap();

        let long = "x".repeat(MAX_CONTENT_LEN + 1);
        let err = s
            .save_message(public.id, alice, &long, MessageKind::Text)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::MessageTooLong(_)));
    }

    #[tokio::test]
    async fn test_banned_sender_cannot_send() {
        let s = store().await;
        let alice = s.create_user("alice", "secret1").await.unwrap();
        let public = s.public_group().await.unwrap();
        s.ban_user(alice).await.unwrap();

        let err = s
            .save_message(public.id, alice, "hi", MessageKind::Text)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UserBanned));
    }

    #[tokio::test]
    async fn test_banned_group_refuses_messages() {
        let s = store().await;
        let alice = s.create_user("alice", "secret1").await.unwrap();
        let group = s.create_group("dev", false).await.unwrap();
        s.ban_group(group.id).await.unwrap();

        let err = s
            .save_message(group.id, alice, "hi", MessageKind::Text)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::GroupBanned));

        s.unban_group(group.id).await.unwrap();
        s.save_message(group.id, alice, "hi", MessageKind::Text)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_membership_idempotent_add_and_remove() {
        let s = store().await;
        let alice = s.create_user("alice", "secret1").await.unwrap();
        let group = s.create_group("dev", false).await.unwrap();

        s.add_member(group.id, alice).await.unwrap();
        s.add_member(group.id, alice).await.unwrap();
        assert_eq!(s.list_members(group.id).await.unwrap().len(), 1);

        s.remove_member(group.id, alice).await.unwrap();
        assert!(matches!(
            s.remove_member(group.id, alice).await.unwrap_err(),
            StoreError::NotAMember(_)
        ));
    }

    #[tokio::test]
    async fn test_offline_queue_drain_once() {
        let s = store().await;
        let bob = s.create_user("bobby", "secret1").await.unwrap();

        s.enqueue_offline(bob, r#"{"type":"private","content":"one"}"#)
            .await
            .unwrap();
        s.enqueue_offline(bob, r#"{"type":"private","content":"two"}"#)
            .await
            .unwrap();

        let drained = s.drain_offline(bob, 100).await.unwrap();
        assert_eq!(drained.len(), 2);
        assert!(drained[0].payload.contains("one"));
        assert!(drained[1].payload.contains("two"));

        // Second drain delivers nothing.
        assert!(s.drain_offline(bob, 100).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_offline_reap_only_delivered() {
        let s = store().await;
        let bob = s.create_user("bobby", "secret1").await.unwrap();

        s.enqueue_offline(bob, "{}").await.unwrap();
        s.enqueue_offline(bob, "{}").await.unwrap();
        let drained = s.drain_offline(bob, 1).await.unwrap();
        assert_eq!(drained.len(), 1);

        // Everything is younger than the cutoff with a negative window.
        let reaped = s.reap_offline(Duration::seconds(-60)).await.unwrap();
        assert_eq!(reaped, 1);

        // The undelivered row survives.
        assert_eq!(s.drain_offline(bob, 100).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_file_metadata_roundtrip() {
        let s = store().await;
        let alice = s.create_user("alice", "secret1").await.unwrap();
        let public = s.public_group().await.unwrap();

        s.save_file_metadata(
            "abc123",
            "notes.txt",
            "/srv/files/abc123.dat",
            42,
            "0123456789abcdef0123456789abcdef",
            alice,
            public.id,
            None,
        )
        .await
        .unwrap();

        let file = s.get_file("abc123").await.unwrap();
        assert_eq!(file.original_filename, "notes.txt");
        assert_eq!(file.file_size, 42);

        let listed = s.list_group_files(public.id).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].file_id, "abc123");

        assert!(matches!(
            s.get_file("missing").await.unwrap_err(),
            StoreError::FileNotFound
        ));
    }

    #[tokio::test]
    async fn test_delete_user_cascades() {
        let s = store().await;
        let alice = s.create_user("alice", "secret1").await.unwrap();
        let public = s.public_group().await.unwrap();

        s.save_message(public.id, alice, "hi", MessageKind::Text)
            .await
            .unwrap();
        s.enqueue_offline(alice, "{}").await.unwrap();
        s.save_file_metadata(
            "f1",
            "a.txt",
            "/srv/files/f1.dat",
            1,
            "00000000000000000000000000000000",
            alice,
            public.id,
            None,
        )
        .await
        .unwrap();

        let orphans = s.delete_user(alice).await.unwrap();
        assert_eq!(orphans, vec!["/srv/files/f1.dat".to_string()]);

        assert!(matches!(
            s.get_user(alice).await.unwrap_err(),
            StoreError::UserNotFound
        ));
        let (history, _) = s.get_history(public.id, 10, None).await.unwrap();
        assert!(history.is_empty());
        assert!(s.list_group_files(public.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_group_cascades() {
        let s = store().await;
        let alice = s.create_user("alice", "secret1").await.unwrap();
        let group = s.create_group("dev", false).await.unwrap();
        s.add_member(group.id, alice).await.unwrap();
        s.save_message(group.id, alice, "hi", MessageKind::Text)
            .await
            .unwrap();

        s.delete_group(group.id).await.unwrap();
        assert!(matches!(
            s.get_group(group.id).await.unwrap_err(),
            StoreError::GroupNotFound
        ));
        assert!(s.list_user_groups(alice).await.unwrap().len() == 1); // public only
    }

    #[tokio::test]
    async fn test_stats() {
        let s = store().await;
        s.create_user("alice", "secret1").await.unwrap();
        let stats = s.stats().await.unwrap();
        assert_eq!(stats.users, 1);
        assert_eq!(stats.groups, 1);
        assert_eq!(stats.messages, 0);

        s.vacuum().await.unwrap();
    }
}
