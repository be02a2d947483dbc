//! Wire message types.
//!
//! One tagged enum covers every frame on the wire; `#[serde(tag = "type")]`
//! puts the selector into the JSON object itself, so
//! `{"type":"chat","group_id":1,"content":"hi"}` decodes to
//! [`WireMessage::Chat`].
//!
//! Several messages travel both directions with different field subsets
//! (a client `chat` has no sender, the fanned-out copy does). Those fields
//! are `Option` with `skip_serializing_if` so each direction stays minimal
//! on the wire.

use crate::error_code::ErrorCode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A user as seen in `user_list` frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserEntry {
    /// Server-assigned user id.
    pub user_id: i64,
    /// Display name.
    pub username: String,
    /// Whether the user currently holds a live session.
    pub online: bool,
    /// Whether the user is connected but idle.
    #[serde(default)]
    pub away: bool,
}

/// A historical message as carried by `history_response`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Message id, monotone within the group.
    pub message_id: i64,
    /// Group the message belongs to.
    pub group_id: i64,
    /// Author id; 0 is the system pseudo-user.
    pub sender_id: i64,
    /// Author name at send time.
    pub sender_username: String,
    /// Message body.
    pub content: String,
    /// One of `text`, `system`, `ai`, `file`.
    pub message_type: String,
    /// Persisted send time.
    pub timestamp: DateTime<Utc>,
}

/// File metadata as carried by `download_response` and file listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileInfo {
    /// Transfer/file identifier.
    pub file_id: String,
    /// Name the uploader gave the file.
    pub original_filename: String,
    /// Size in bytes.
    pub file_size: u64,
    /// MD5 of the full file, lowercase hex.
    pub checksum: String,
    /// Uploader's username.
    pub uploader: String,
    /// Group the file was shared in.
    pub group_id: i64,
    /// Completion time of the upload.
    pub upload_time: DateTime<Utc>,
}

/// Every frame exchanged between client and server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    /// S→C greeting sent on accept, before authentication.
    NicknameRequest {
        /// Prompt text.
        message: String,
    },

    /// C→S account creation.
    Register {
        /// Desired username.
        username: String,
        /// Plaintext password (hashed server-side, never stored).
        password: String,
    },

    /// S→C registration outcome.
    RegisterResponse {
        /// Whether the account was created.
        success: bool,
        /// New user id on success.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<i64>,
        /// Human-readable detail.
        message: String,
    },

    /// C→S authentication.
    Login {
        /// Account name.
        username: String,
        /// Plaintext password.
        password: String,
    },

    /// S→C login outcome.
    LoginResponse {
        /// Whether the session was established.
        success: bool,
        /// Authenticated user id on success.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<i64>,
        /// Echoed username on success.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        /// Opaque session token bound to this connection.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_token: Option<String>,
        /// Number of offline messages about to be delivered.
        #[serde(default)]
        offline_count: u32,
        /// Human-readable detail.
        message: String,
    },

    /// C→S end of session.
    Logout,

    /// Group chat message. C→S carries `group_id` + `content`; the
    /// fanned-out S→C copy adds sender identity and persistence info.
    Chat {
        /// Target group.
        group_id: i64,
        /// Message body, at most 2000 characters.
        content: String,
        /// Author id (server-filled).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_id: Option<i64>,
        /// Author name (server-filled).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_username: Option<String>,
        /// Persisted send time (server-filled).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<DateTime<Utc>>,
        /// Persisted message id (server-filled).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<i64>,
    },

    /// Direct message. C→S carries `target_user` + `content`; the
    /// delivered S→C copy adds sender identity.
    Private {
        /// Recipient username (client-filled).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_user: Option<String>,
        /// Message body, at most 2000 characters.
        content: String,
        /// Author id (server-filled).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_id: Option<i64>,
        /// Author name (server-filled).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_username: Option<String>,
        /// Send time (server-filled).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<DateTime<Utc>>,
        /// Persisted message id (server-filled).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<i64>,
    },

    /// S→C system notice.
    System {
        /// Notice text.
        content: String,
        /// Emission time.
        timestamp: DateTime<Utc>,
    },

    /// S→C membership/presence update.
    UserList {
        /// Current members with presence flags.
        users: Vec<UserEntry>,
        /// What changed.
        message: String,
    },

    /// C→S liveness probe. `timestamp` is the sender's clock in Unix
    /// milliseconds, echoed back in `pong` for latency measurement.
    Ping {
        /// Sender clock, Unix millis.
        timestamp: i64,
    },

    /// S→C liveness reply.
    Pong {
        /// Echoed `ping` timestamp.
        timestamp: i64,
    },

    /// C→S join a group by id or by name.
    JoinGroup {
        /// Target group id.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        group_id: Option<i64>,
        /// Target group name, used when `group_id` is absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },

    /// C→S leave a group.
    LeaveGroup {
        /// Group to leave.
        group_id: i64,
    },

    /// C→S create a group. A private chat is a group with
    /// `is_private = true` and exactly one named peer.
    CreateGroup {
        /// Group name.
        name: String,
        /// Whether this is a two-party private chat.
        #[serde(default)]
        is_private: bool,
        /// Usernames to add besides the creator.
        #[serde(default)]
        members: Vec<String>,
    },

    /// S→C outcome of a group operation.
    GroupResponse {
        /// Whether the operation succeeded.
        success: bool,
        /// Affected group id.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        group_id: Option<i64>,
        /// Affected group name.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        /// Human-readable detail.
        message: String,
    },

    /// C→S history paging request.
    HistoryRequest {
        /// Group to page through.
        group_id: i64,
        /// Maximum messages to return.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<u32>,
        /// Return only messages with id strictly below this.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        before_id: Option<i64>,
    },

    /// S→C history page, ascending by message id.
    HistoryResponse {
        /// Group the page belongs to.
        group_id: i64,
        /// Messages in ascending id order.
        messages: Vec<HistoryEntry>,
        /// Whether older messages remain before the first entry.
        has_more: bool,
    },

    /// C→S start an upload.
    UploadRequest {
        /// Client-side file name.
        filename: String,
        /// Total size in bytes.
        file_size: u64,
        /// Declared MIME type.
        mime_type: String,
        /// MD5 of the full file, lowercase hex.
        checksum: String,
        /// Requested chunk size in bytes.
        chunk_size: usize,
        /// Group the finished file is announced in.
        group_id: i64,
    },

    /// S→C upload handshake / completion outcome.
    UploadResponse {
        /// Whether the request was accepted.
        success: bool,
        /// Assigned transfer id.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file_id: Option<String>,
        /// Effective chunk size.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        chunk_size: Option<usize>,
        /// Number of chunks the server expects.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        total_chunks: Option<u64>,
        /// Failure code when `success` is false.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_code: Option<ErrorCode>,
        /// Human-readable detail.
        message: String,
    },

    /// C→S one upload chunk. `data` is base64; `chunk_checksum` is the
    /// MD5 of the raw chunk bytes.
    UploadChunk {
        /// Transfer id from `upload_response`.
        file_id: String,
        /// Zero-based chunk index.
        chunk_index: u64,
        /// Base64-encoded chunk bytes.
        data: String,
        /// MD5 of the raw bytes, lowercase hex.
        chunk_checksum: String,
    },

    /// C→S all chunks sent; verify and finalize.
    UploadComplete {
        /// Transfer id.
        file_id: String,
    },

    /// C→S start a download.
    DownloadRequest {
        /// File to fetch.
        file_id: String,
        /// First byte to send (resume support).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        range_start: Option<u64>,
        /// Last byte to send, inclusive.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        range_end: Option<u64>,
    },

    /// S→C download handshake.
    DownloadResponse {
        /// Whether the download was accepted.
        success: bool,
        /// Metadata of the file about to be streamed.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file: Option<FileInfo>,
        /// Chunk size the server will use.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        chunk_size: Option<usize>,
        /// Number of chunks that will follow.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        total_chunks: Option<u64>,
        /// Failure code when `success` is false.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_code: Option<ErrorCode>,
        /// Human-readable detail.
        message: String,
    },

    /// S→C one download chunk, same encoding as `upload_chunk`.
    DownloadChunk {
        /// Transfer id.
        file_id: String,
        /// Zero-based chunk index.
        chunk_index: u64,
        /// Base64-encoded chunk bytes.
        data: String,
        /// MD5 of the raw bytes, lowercase hex.
        chunk_checksum: String,
    },

    /// C→S acknowledgement that the download finished client-side.
    DownloadComplete {
        /// Transfer id.
        file_id: String,
    },

    /// S→C unilateral close because the account logged in elsewhere.
    ForceLogout {
        /// Why the session ends.
        reason: String,
    },

    /// S→C the server is shutting down.
    ServerShutdown {
        /// Why the server is going away.
        reason: String,
    },

    /// S→C any failed operation.
    Error {
        /// Machine-readable code.
        code: ErrorCode,
        /// Human-readable detail.
        message: String,
    },
}

impl WireMessage {
    /// Wire `type` tag of this message.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            WireMessage::NicknameRequest { .. } => "nickname_request",
            WireMessage::Register { .. } => "register",
            WireMessage::RegisterResponse { .. } => "register_response",
            WireMessage::Login { .. } => "login",
            WireMessage::LoginResponse { .. } => "login_response",
            WireMessage::Logout => "logout",
            WireMessage::Chat { .. } => "chat",
            WireMessage::Private { .. } => "private",
            WireMessage::System { .. } => "system",
            WireMessage::UserList { .. } => "user_list",
            WireMessage::Ping { .. } => "ping",
            WireMessage::Pong { .. } => "pong",
            WireMessage::JoinGroup { .. } => "join_group",
            WireMessage::LeaveGroup { .. } => "leave_group",
            WireMessage::CreateGroup { .. } => "create_group",
            WireMessage::GroupResponse { .. } => "group_response",
            WireMessage::HistoryRequest { .. } => "history_request",
            WireMessage::HistoryResponse { .. } => "history_response",
            WireMessage::UploadRequest { .. } => "upload_request",
            WireMessage::UploadResponse { .. } => "upload_response",
            WireMessage::UploadChunk { .. } => "upload_chunk",
            WireMessage::UploadComplete { .. } => "upload_complete",
            WireMessage::DownloadRequest { .. } => "download_request",
            WireMessage::DownloadResponse { .. } => "download_response",
            WireMessage::DownloadChunk { .. } => "download_chunk",
            WireMessage::DownloadComplete { .. } => "download_complete",
            WireMessage::ForceLogout { .. } => "force_logout",
            WireMessage::ServerShutdown { .. } => "server_shutdown",
            WireMessage::Error { .. } => "error",
        }
    }

    /// Whether a client may send this before authenticating.
    #[must_use]
    pub fn allowed_before_auth(&self) -> bool {
        matches!(
            self,
            WireMessage::Register { .. }
                | WireMessage::Login { .. }
                | WireMessage::Ping { .. }
                | WireMessage::Pong { .. }
        )
    }

    /// Build an `error` frame.
    #[must_use]
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        WireMessage::Error {
            code,
            message: message.into(),
        }
    }
}
