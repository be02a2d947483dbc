//! Persistence layer for the Parley chat server.
//!
//! One [`Store`] owns all durable state: users, groups, memberships,
//! message history, the per-user offline queue, and file metadata. Every
//! component of the server holds a cheap clone of the store handle; every
//! mutating operation runs inside a single transaction.
//!
//! The backing engine is SQLite via `sqlx`. Operations are typed - callers
//! never see SQL, only domain values and [`StoreError`] variants.

pub mod error;
pub mod models;
pub mod password;
pub mod store;

pub use error::StoreError;
pub use models::{
    ChatGroup, FileRecord, HistoryRow, MessageKind, OfflineMessage, StoredMessage, User,
};
pub use store::{Store, StoreStats};

/// Maximum chat message length in characters.
pub const MAX_CONTENT_LEN: usize = 2000;

/// Reserved name of the group every user joins at registration.
pub const PUBLIC_GROUP: &str = "public";

/// Sender id of the system pseudo-user.
pub const SYSTEM_SENDER: i64 = 0;

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
