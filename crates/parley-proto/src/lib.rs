//! Wire protocol for the Parley chat server.
//!
//! Every message on the wire is a **frame**: a 4-byte big-endian length
//! prefix followed by that many bytes of UTF-8 JSON. The JSON object always
//! carries a string `type` field selecting the handler on the receiving
//! side.
//!
//! ```text
//! +--------------------+------------------------------+
//! | Length (4 bytes)   | JSON payload                 |
//! | big-endian u32     | (variable length)            |
//! +--------------------+------------------------------+
//! ```
//!
//! The codec guarantees that frames never tear across reads: the decoder
//! buffers partial input and only yields complete payloads. Ill-formed JSON
//! inside a well-delimited frame fails that frame alone; a corrupt or
//! oversize length prefix is unrecoverable and the connection must be
//! closed.

pub mod error;
pub mod error_code;
pub mod frame;
pub mod message;

pub use error::ProtocolError;
pub use error_code::ErrorCode;
pub use frame::{FrameDecoder, encode_frame, read_frame, write_frame};
pub use message::{FileInfo, HistoryEntry, UserEntry, WireMessage};

/// Maximum frame payload size: 16 MiB. A length prefix above this closes
/// the connection with a protocol error.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Length prefix size in bytes.
pub const FRAME_HEADER_LEN: usize = 4;
