//! Server configuration.

use crate::error::ServerError;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Runtime configuration for the chat server.
///
/// Loaded from a TOML file; every field has a default so a missing file or
/// sparse config still yields a runnable server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen host.
    #[serde(default = "default_host")]
    pub host: String,
    /// Listen port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Maximum concurrent client connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Maximum accepted upload size in bytes.
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    /// Chunk size offered to downloads, bytes.
    #[serde(default = "default_chunk_size")]
    pub chunk_size_default: usize,
    /// Whether the assistant relay is active.
    #[serde(default)]
    pub ai_enabled: bool,
    /// API key for the LLM provider.
    #[serde(default)]
    pub ai_api_key: String,
    /// Base URL of an OpenAI-compatible endpoint.
    #[serde(default = "default_ai_endpoint")]
    pub ai_endpoint: String,
    /// Model name sent to the provider.
    #[serde(default = "default_ai_model")]
    pub ai_model: String,
    /// Deadline for one provider call, seconds.
    #[serde(default = "default_ai_deadline")]
    pub ai_deadline_seconds: u64,
    /// Provider retry budget.
    #[serde(default = "default_ai_retries")]
    pub ai_max_retries: u32,
    /// Rolling-context cap, messages per conversation.
    #[serde(default = "default_ai_context")]
    pub ai_context_window: usize,
    /// Days delivered offline messages are kept before reaping.
    #[serde(default = "default_offline_retention")]
    pub offline_retention_days: u32,
    /// Liveness sweep cadence, seconds.
    #[serde(default = "default_ping_interval")]
    pub ping_interval_seconds: u64,
    /// Minutes without activity before a user shows as away.
    #[serde(default = "default_idle_away")]
    pub idle_away_minutes: u64,
    /// Minutes without a ping before a session is torn down.
    #[serde(default = "default_session_timeout")]
    pub session_timeout_minutes: u64,
    /// Root directory for uploaded files and temp chunks.
    #[serde(default = "default_storage_root")]
    pub storage_root: PathBuf,
    /// SQLite database path.
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

// Default values

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8888
}

fn default_max_connections() -> usize {
    1024
}

fn default_max_file_size() -> u64 {
    100 * 1024 * 1024 // 100 MiB
}

fn default_chunk_size() -> usize {
    256 * 1024 // 256 KiB
}

fn default_ai_endpoint() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_ai_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_ai_deadline() -> u64 {
    30
}

fn default_ai_retries() -> u32 {
    2
}

fn default_ai_context() -> usize {
    10
}

fn default_offline_retention() -> u32 {
    7
}

fn default_ping_interval() -> u64 {
    60
}

fn default_idle_away() -> u64 {
    10
}

fn default_session_timeout() -> u64 {
    5
}

fn default_storage_root() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("parley/files")
}

fn default_database_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("parley/parley.db")
}

impl Default for ServerConfig {
    fn default() -> Self {
        // Serde defaults are the single source of truth.
        toml::from_str("").expect("empty config must deserialize")
    }
}

impl ServerConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ServerError> {
        let contents = std::fs::read_to_string(path)?;
        toml::from_str(&contents)
            .map_err(|e| ServerError::InvalidInput(format!("config parse error: {e}").into()))
    }

    /// The socket address to bind.
    ///
    /// # Errors
    ///
    /// Returns an error if host/port do not form a valid address.
    pub fn listen_addr(&self) -> Result<SocketAddr, ServerError> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|_| ServerError::invalid_input("invalid host/port"))
    }

    /// Provider call deadline.
    #[must_use]
    pub fn ai_deadline(&self) -> Duration {
        Duration::from_secs(self.ai_deadline_seconds)
    }

    /// Session liveness threshold.
    #[must_use]
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_minutes * 60)
    }

    /// Idle-away threshold.
    #[must_use]
    pub fn idle_away(&self) -> Duration {
        Duration::from_secs(self.idle_away_minutes * 60)
    }

    /// Validate invariants that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first offending field.
    pub fn validate(&self) -> Result<(), ServerError> {
        self.listen_addr()?;

        if self.max_connections == 0 {
            return Err(ServerError::invalid_input("max_connections must be > 0"));
        }
        if self.max_file_size == 0 {
            return Err(ServerError::invalid_input("max_file_size must be > 0"));
        }
        if !(1024..=1024 * 1024).contains(&self.chunk_size_default) {
            return Err(ServerError::invalid_input(
                "chunk_size_default must be between 1 KiB and 1 MiB",
            ));
        }
        if self.ai_enabled && self.ai_api_key.is_empty() {
            return Err(ServerError::invalid_input(
                "ai_enabled requires ai_api_key",
            ));
        }
        if self.session_timeout_minutes == 0 {
            return Err(ServerError::invalid_input(
                "session_timeout_minutes must be > 0",
            ));
        }
        Ok(())
    }
}
