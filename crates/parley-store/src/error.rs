//! Store error types.

use std::borrow::Cow;
use thiserror::Error;

/// Domain errors raised by the store.
///
/// Handlers map these onto wire error codes; only `Database` and
/// `PasswordHash` represent unexpected infrastructure failures.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Username already taken.
    #[error("user already exists: {0}")]
    UserExists(String),

    /// No user with that id or name.
    #[error("user not found")]
    UserNotFound,

    /// User is banned from authenticating and sending.
    #[error("user is banned")]
    UserBanned,

    /// Group name already taken.
    #[error("group already exists: {0}")]
    GroupExists(String),

    /// No group with that id or name.
    #[error("group not found")]
    GroupNotFound,

    /// Group refuses new messages.
    #[error("group is banned")]
    GroupBanned,

    /// User is not a member of the group.
    #[error("not a member of group {0}")]
    NotAMember(i64),

    /// Message content exceeds [`crate::MAX_CONTENT_LEN`].
    #[error("message too long: {0} chars (max 2000)")]
    MessageTooLong(usize),

    /// No file with that id.
    #[error("file not found")]
    FileNotFound,

    /// Input failed validation before reaching SQL.
    #[error("invalid input: {0}")]
    InvalidInput(Cow<'static, str>),

    /// Password hashing or verification infrastructure failed.
    #[error("password hash error: {0}")]
    PasswordHash(String),

    /// The database did not yield a connection within the deadline.
    #[error("database timeout: {0}")]
    Timeout(String),

    /// Underlying database failure.
    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            // Lock contention past the acquire deadline is a typed
            // timeout, not an opaque internal failure.
            sqlx::Error::PoolTimedOut => {
                StoreError::Timeout("connection acquire timed out".to_string())
            }
            other => StoreError::Database(other),
        }
    }
}

impl StoreError {
    /// Create an invalid-input error with static context.
    #[must_use]
    pub const fn invalid_input(context: &'static str) -> Self {
        StoreError::InvalidInput(Cow::Borrowed(context))
    }
}
