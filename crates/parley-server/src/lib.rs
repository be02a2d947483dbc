//! Server core for the Parley chat system.
//!
//! A single long-running TCP process: the accept loop spawns one
//! cooperative task per client connection, which reads length-framed JSON
//! messages, dispatches them to the auth service, group manager, message
//! router, file-transfer coordinator or assistant relay, and writes
//! responses back through a bounded per-connection outbound queue.
//!
//! Shared state is explicit: everything reachable from a connection task
//! hangs off one [`ServerContext`], constructed once at startup (tests
//! wire an in-memory store instead).
//!
//! # Architecture
//!
//! ```text
//! AcceptLoop ──spawn──▶ ConnectionHandler (per client)
//!                         │ decode frames (parley-proto)
//!                         ├─▶ AuthService ──▶ Store
//!                         ├─▶ GroupManager ─▶ Store + SessionRegistry
//!                         ├─▶ MessageRouter ─▶ SessionRegistry fan-out,
//!                         │                    offline queue on miss
//!                         ├─▶ FileTransferCoordinator ─▶ temp files,
//!                         │                    Store on completion
//!                         └─▶ AiRelay ──▶ LLM provider, reply via router
//! ```

pub mod ai;
pub mod auth;
pub mod config;
pub mod context;
pub mod error;
pub mod groups;
pub mod handler;
pub mod router;
pub mod server;
pub mod session;
pub mod transfer;

pub use config::ServerConfig;
pub use context::ServerContext;
pub use error::ServerError;
pub use server::ChatServer;

/// Result type for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;
