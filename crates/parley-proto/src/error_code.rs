//! Error codes surfaced to clients in `error` frames.

use serde::{Deserialize, Serialize};

/// Machine-readable error code carried by an `error` frame.
///
/// Codes are stable protocol surface; the accompanying `message` field is
/// human-readable and free to change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Request failed basic validation (missing field, bad format).
    InvalidInput,
    /// Operation requires an authenticated session.
    AuthRequired,
    /// Unknown username or wrong password (never distinguished).
    InvalidCredentials,
    /// Username already taken.
    UserExists,
    /// Account is banned.
    UserBanned,
    /// No such user.
    UserNotFound,
    /// Group name already taken.
    GroupExists,
    /// No such group.
    GroupNotFound,
    /// Group refuses new messages.
    GroupBanned,
    /// Sender is not a member of the target group.
    NotAMember,
    /// Message content exceeds the length cap.
    MessageTooLong,
    /// Declared file size exceeds the configured maximum.
    FileTooLarge,
    /// File extension or MIME type is not allowed.
    FileTypeBlocked,
    /// Checksum or size verification failed.
    FileCorrupt,
    /// A transfer of this direction is already in flight on the connection.
    Busy,
    /// Router queue is at capacity.
    QueueFull,
    /// Too many requests.
    RateLimited,
    /// Operation exceeded its deadline.
    Timeout,
    /// Unexpected server failure.
    Internal,
}

impl ErrorCode {
    /// Wire representation of the code.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidInput => "INVALID_INPUT",
            ErrorCode::AuthRequired => "AUTH_REQUIRED",
            ErrorCode::InvalidCredentials => "INVALID_CREDENTIALS",
            ErrorCode::UserExists => "USER_EXISTS",
            ErrorCode::UserBanned => "USER_BANNED",
            ErrorCode::UserNotFound => "USER_NOT_FOUND",
            ErrorCode::GroupExists => "GROUP_EXISTS",
            ErrorCode::GroupNotFound => "GROUP_NOT_FOUND",
            ErrorCode::GroupBanned => "GROUP_BANNED",
            ErrorCode::NotAMember => "NOT_A_MEMBER",
            ErrorCode::MessageTooLong => "MESSAGE_TOO_LONG",
            ErrorCode::FileTooLarge => "FILE_TOO_LARGE",
            ErrorCode::FileTypeBlocked => "FILE_TYPE_BLOCKED",
            ErrorCode::FileCorrupt => "FILE_CORRUPT",
            ErrorCode::Busy => "BUSY",
            ErrorCode::QueueFull => "QUEUE_FULL",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::Internal => "INTERNAL",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serde_matches_as_str() {
        let codes = [
            ErrorCode::InvalidInput,
            ErrorCode::AuthRequired,
            ErrorCode::InvalidCredentials,
            ErrorCode::UserExists,
            ErrorCode::UserBanned,
            ErrorCode::UserNotFound,
            ErrorCode::GroupExists,
            ErrorCode::GroupNotFound,
            ErrorCode::GroupBanned,
            ErrorCode::NotAMember,
            ErrorCode::MessageTooLong,
            ErrorCode::FileTooLarge,
            ErrorCode::FileTypeBlocked,
            ErrorCode::FileCorrupt,
            ErrorCode::Busy,
            ErrorCode::QueueFull,
            ErrorCode::RateLimited,
            ErrorCode::Timeout,
            ErrorCode::Internal,
        ];

        for code in codes {
            let json = serde_json::to_string(&code).unwrap();
            assert_eq!(json, format!("\"{}\"", code.as_str()));

            let back: ErrorCode = serde_json::from_str(&json).unwrap();
            assert_eq!(back, code);
        }
    }
}
