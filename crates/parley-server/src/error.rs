//! Server error types and their wire mapping.

use parley_proto::{ErrorCode, ProtocolError};
use parley_store::StoreError;
use std::borrow::Cow;
use thiserror::Error;

/// Errors raised by server components.
///
/// Every variant maps onto a wire [`ErrorCode`]; handlers convert one of
/// these into a single `error` frame. Transport failures never become
/// frames - they close the connection instead.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Request failed validation.
    #[error("invalid input: {0}")]
    InvalidInput(Cow<'static, str>),

    /// Operation requires an authenticated session.
    #[error("authentication required")]
    AuthRequired,

    /// Unknown username or wrong password.
    #[error("invalid credentials")]
    InvalidCredentials,

    /// Account is banned.
    #[error("user is banned")]
    UserBanned,

    /// No such user.
    #[error("user not found")]
    UserNotFound,

    /// Group name already taken.
    #[error("group already exists: {0}")]
    GroupExists(String),

    /// No such group.
    #[error("group not found")]
    GroupNotFound,

    /// Group refuses new messages.
    #[error("group is banned")]
    GroupBanned,

    /// Sender is not a member of the target group.
    #[error("not a member of group {0}")]
    NotAMember(i64),

    /// Username already taken.
    #[error("user already exists: {0}")]
    UserExists(String),

    /// Message content exceeds the length cap.
    #[error("message too long")]
    MessageTooLong,

    /// Declared file size exceeds the configured maximum.
    #[error("file too large: {size} bytes (max {max})")]
    FileTooLarge {
        /// Declared size.
        size: u64,
        /// Configured cap.
        max: u64,
    },

    /// File extension or MIME type is not allowed.
    #[error("file type blocked: {0}")]
    FileTypeBlocked(Cow<'static, str>),

    /// Checksum or size verification failed.
    #[error("file corrupt: {0}")]
    FileCorrupt(Cow<'static, str>),

    /// A transfer of this direction is already in flight.
    #[error("transfer already in progress")]
    Busy,

    /// Router queue is at capacity.
    #[error("router queue full")]
    QueueFull,

    /// Too many requests.
    #[error("rate limited")]
    RateLimited,

    /// Operation exceeded its deadline.
    #[error("operation timed out: {0}")]
    Timeout(Cow<'static, str>),

    /// Wire codec failure.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// File I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Anything unexpected.
    #[error("internal error: {0}")]
    Internal(Cow<'static, str>),
}

impl ServerError {
    /// Wire code for this error.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            ServerError::InvalidInput(_) => ErrorCode::InvalidInput,
            ServerError::AuthRequired => ErrorCode::AuthRequired,
            ServerError::InvalidCredentials => ErrorCode::InvalidCredentials,
            ServerError::UserBanned => ErrorCode::UserBanned,
            ServerError::UserNotFound => ErrorCode::UserNotFound,
            ServerError::GroupExists(_) => ErrorCode::GroupExists,
            ServerError::GroupNotFound => ErrorCode::GroupNotFound,
            ServerError::GroupBanned => ErrorCode::GroupBanned,
            ServerError::NotAMember(_) => ErrorCode::NotAMember,
            ServerError::UserExists(_) => ErrorCode::UserExists,
            ServerError::MessageTooLong => ErrorCode::MessageTooLong,
            ServerError::FileTooLarge { .. } => ErrorCode::FileTooLarge,
            ServerError::FileTypeBlocked(_) => ErrorCode::FileTypeBlocked,
            ServerError::FileCorrupt(_) => ErrorCode::FileCorrupt,
            ServerError::Busy => ErrorCode::Busy,
            ServerError::QueueFull => ErrorCode::QueueFull,
            ServerError::RateLimited => ErrorCode::RateLimited,
            ServerError::Timeout(_) => ErrorCode::Timeout,
            ServerError::Protocol(_) | ServerError::Io(_) | ServerError::Internal(_) => {
                ErrorCode::Internal
            }
        }
    }

    /// Create an invalid-input error with static context.
    #[must_use]
    pub const fn invalid_input(context: &'static str) -> Self {
        ServerError::InvalidInput(Cow::Borrowed(context))
    }

    /// Create a timeout error with static context.
    #[must_use]
    pub const fn timeout(context: &'static str) -> Self {
        ServerError::Timeout(Cow::Borrowed(context))
    }

    /// Create an internal error with static context.
    #[must_use]
    pub const fn internal(context: &'static str) -> Self {
        ServerError::Internal(Cow::Borrowed(context))
    }
}

impl From<StoreError> for ServerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::UserExists(name) => ServerError::UserExists(name),
            StoreError::UserNotFound => ServerError::UserNotFound,
            StoreError::UserBanned => ServerError::UserBanned,
            StoreError::GroupExists(name) => ServerError::GroupExists(name),
            StoreError::GroupNotFound => ServerError::GroupNotFound,
            StoreError::GroupBanned => ServerError::GroupBanned,
            StoreError::NotAMember(group) => ServerError::NotAMember(group),
            StoreError::MessageTooLong(_) => ServerError::MessageTooLong,
            StoreError::FileNotFound => ServerError::InvalidInput(Cow::Borrowed("file not found")),
            StoreError::InvalidInput(ctx) => ServerError::InvalidInput(ctx),
            StoreError::PasswordHash(e) => ServerError::Internal(Cow::Owned(e)),
            StoreError::Timeout(e) => ServerError::Timeout(Cow::Owned(e)),
            StoreError::Database(e) => ServerError::Internal(Cow::Owned(e.to_string())),
        }
    }
}
