//! Chunked file transfer coordination.
//!
//! Uploads and downloads are indexed state machines living beside chat
//! traffic on the same connection. A connection may hold at most one
//! upload and one download at a time; additional requests are refused
//! with `BUSY`.
//!
//! Upload integrity is checksum-bound, not order-bound: chunks may arrive
//! out of order, duplicates are idempotent, every chunk carries its own
//! MD5, and completion verifies both the declared size and the MD5 of the
//! assembled file before anything is persisted. A failed verification
//! deletes the temp file; nothing partial ever reaches the store.

use crate::error::ServerError;
use crate::session::ConnectionId;
use crate::Result;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use dashmap::DashMap;
use md5::{Digest, Md5};
use parley_store::{FileRecord, Store};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::sync::Mutex;

/// Smallest accepted chunk size: 1 KiB.
pub const MIN_CHUNK_SIZE: usize = 1024;

/// Largest accepted chunk size: 1 MiB.
pub const MAX_CHUNK_SIZE: usize = 1024 * 1024;

/// Longest accepted filename.
pub const MAX_FILENAME_LEN: usize = 255;

/// Extensions refused outright: executables and scripts.
const BLOCKED_EXTENSIONS: &[&str] = &[
    "exe", "dll", "so", "dylib", "bat", "cmd", "com", "scr", "msi", "ps1", "sh", "bash", "vbs",
    "jar", "pif", "app",
];

/// Exact MIME types accepted besides the allowed prefixes.
const ALLOWED_MIME_EXACT: &[&str] = &[
    "application/pdf",
    "application/zip",
    "application/gzip",
    "application/json",
    "application/octet-stream",
];

/// MIME prefixes accepted wholesale.
const ALLOWED_MIME_PREFIXES: &[&str] = &["text/", "image/", "audio/", "video/"];

fn md5_hex(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn filename_ok(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_FILENAME_LEN
        && !name.contains("..")
        && !name.contains('/')
        && !name.contains('\\')
        && !name.chars().any(|c| c.is_control())
}

fn extension_blocked(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| {
            let ext = ext.to_ascii_lowercase();
            BLOCKED_EXTENSIONS.contains(&ext.as_str())
        })
}

fn mime_allowed(mime: &str) -> bool {
    let mime = mime.to_ascii_lowercase();
    ALLOWED_MIME_EXACT.contains(&mime.as_str())
        || ALLOWED_MIME_PREFIXES.iter().any(|p| mime.starts_with(p))
}

/// What the leading bytes say the file really is.
fn sniff_magic(bytes: &[u8]) -> Option<&'static str> {
    const TABLE: &[(&[u8], &str)] = &[
        (b"\x89PNG\r\n\x1a\n", "image/png"),
        (b"\xff\xd8\xff", "image/jpeg"),
        (b"GIF87a", "image/gif"),
        (b"GIF89a", "image/gif"),
        (b"%PDF", "application/pdf"),
        (b"PK\x03\x04", "application/zip"),
        (b"\x1f\x8b", "application/gzip"),
    ];
    TABLE
        .iter()
        .find(|(magic, _)| bytes.starts_with(magic))
        .map(|(_, mime)| *mime)
}

/// Magic bytes that are never acceptable regardless of declared type.
fn looks_executable(bytes: &[u8]) -> bool {
    bytes.starts_with(b"MZ")
        || bytes.starts_with(b"\x7fELF")
        || bytes.starts_with(b"\xfe\xed\xfa\xce")
        || bytes.starts_with(b"\xfe\xed\xfa\xcf")
        || bytes.starts_with(b"\xcf\xfa\xed\xfe")
        || bytes.starts_with(b"#!")
}

/// Whether the sniffed type contradicts the declared one.
///
/// Types our table cannot sniff pass; the MIME allowlist already bounds
/// what is accepted.
fn magic_agrees(declared: &str, first_bytes: &[u8]) -> bool {
    if looks_executable(first_bytes) {
        return false;
    }
    match sniff_magic(first_bytes) {
        Some(actual) => {
            let declared = declared.to_ascii_lowercase();
            declared == actual || declared == "application/octet-stream"
        }
        None => true,
    }
}

/// Handshake reply data for an accepted upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTicket {
    /// Assigned transfer id.
    pub file_id: String,
    /// Effective chunk size.
    pub chunk_size: usize,
    /// Chunks the server expects.
    pub total_chunks: u64,
}

/// A verified, renamed, ready-to-persist upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedUpload {
    /// Transfer id, now the public file id.
    pub file_id: String,
    /// Name the uploader gave the file.
    pub filename: String,
    /// Verified size in bytes.
    pub file_size: u64,
    /// Verified MD5, lowercase hex.
    pub checksum: String,
    /// Declared MIME type.
    pub mime_type: String,
    /// Uploading user.
    pub uploader_id: i64,
    /// Target group.
    pub group_id: i64,
    /// Final path under the storage root.
    pub final_path: PathBuf,
}

/// One chunk of an in-flight download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadChunk {
    /// Transfer id.
    pub file_id: String,
    /// Zero-based chunk index.
    pub chunk_index: u64,
    /// Base64-encoded bytes.
    pub data: String,
    /// MD5 of the raw bytes, lowercase hex.
    pub checksum: String,
}

struct UploadState {
    conn_id: ConnectionId,
    uploader_id: i64,
    group_id: i64,
    filename: String,
    mime_type: String,
    declared_size: u64,
    declared_checksum: String,
    chunk_size: usize,
    total_chunks: u64,
    temp_path: PathBuf,
    file: File,
    received: HashSet<u64>,
    sniff_done: bool,
}

struct DownloadState {
    file_id: String,
    file: File,
    file_size: u64,
    chunk_size: usize,
    next_chunk: u64,
    end_chunk: u64,
}

/// Coordinator of all in-flight transfers.
pub struct FileTransferCoordinator {
    store: Store,
    storage_root: PathBuf,
    max_file_size: u64,
    download_chunk_size: usize,
    uploads: DashMap<String, Arc<Mutex<UploadState>>>,
    upload_by_conn: DashMap<ConnectionId, String>,
    downloads: DashMap<ConnectionId, Arc<Mutex<DownloadState>>>,
}

impl FileTransferCoordinator {
    /// Create a coordinator rooted at `storage_root`.
    pub fn new(
        store: Store,
        storage_root: PathBuf,
        max_file_size: u64,
        download_chunk_size: usize,
    ) -> Self {
        Self {
            store,
            storage_root,
            max_file_size,
            download_chunk_size,
            uploads: DashMap::new(),
            upload_by_conn: DashMap::new(),
            downloads: DashMap::new(),
        }
    }

    fn temp_dir(&self) -> PathBuf {
        self.storage_root.join("tmp")
    }

    fn files_dir(&self) -> PathBuf {
        self.storage_root.join("files")
    }

    /// Validate an upload request and open its temp file.
    ///
    /// # Errors
    ///
    /// `Busy` when this connection already uploads, `InvalidInput` /
    /// `FileTooLarge` / `FileTypeBlocked` on failed validation.
    #[allow(clippy::too_many_arguments)]
    pub async fn begin_upload(
        &self,
        conn_id: ConnectionId,
        uploader_id: i64,
        group_id: i64,
        filename: &str,
        file_size: u64,
        mime_type: &str,
        checksum: &str,
        chunk_size: usize,
    ) -> Result<UploadTicket> {
        if self.upload_by_conn.contains_key(&conn_id) {
            return Err(ServerError::Busy);
        }

        if !filename_ok(filename) {
            return Err(ServerError::invalid_input(
                "filename empty, too long, or contains forbidden characters",
            ));
        }
        if extension_blocked(filename) {
            return Err(ServerError::FileTypeBlocked(
                "executable and script extensions are not accepted".into(),
            ));
        }
        if !mime_allowed(mime_type) {
            return Err(ServerError::FileTypeBlocked(
                format!("MIME type not allowed: {mime_type}").into(),
            ));
        }
        if file_size == 0 {
            return Err(ServerError::invalid_input("file size must be positive"));
        }
        if file_size > self.max_file_size {
            return Err(ServerError::FileTooLarge {
                size: file_size,
                max: self.max_file_size,
            });
        }
        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&chunk_size) {
            return Err(ServerError::invalid_input(
                "chunk size must be between 1 KiB and 1 MiB",
            ));
        }
        let checksum = checksum.to_ascii_lowercase();
        if checksum.len() != 32 || !checksum.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ServerError::invalid_input("checksum must be 32 hex chars"));
        }

        // Deterministic id over the request plus time, so a re-sent
        // request never collides with a live transfer.
        let nanos = chrono::Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_default();
        let file_id = md5_hex(format!("{filename}|{file_size}|{checksum}|{nanos}").as_bytes());

        let total_chunks = file_size.div_ceil(chunk_size as u64);
        let temp_path = self.temp_dir().join(format!("{file_id}.part"));

        tokio::fs::create_dir_all(self.temp_dir()).await?;
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .await?;
        // Pre-allocate so out-of-order positioned writes land in place.
        file.set_len(file_size).await?;

        let state = UploadState {
            conn_id,
            uploader_id,
            group_id,
            filename: filename.to_string(),
            mime_type: mime_type.to_string(),
            declared_size: file_size,
            declared_checksum: checksum,
            chunk_size,
            total_chunks,
            temp_path,
            file,
            received: HashSet::new(),
            sniff_done: false,
        };

        self.uploads
            .insert(file_id.clone(), Arc::new(Mutex::new(state)));
        self.upload_by_conn.insert(conn_id, file_id.clone());

        tracing::info!(
            file_id = %file_id,
            filename,
            file_size,
            total_chunks,
            "upload accepted"
        );
        Ok(UploadTicket {
            file_id,
            chunk_size,
            total_chunks,
        })
    }

    fn upload_state(&self, file_id: &str) -> Result<Arc<Mutex<UploadState>>> {
        self.uploads
            .get(file_id)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| ServerError::invalid_input("unknown upload id"))
    }

    /// Verify and write one upload chunk. Out-of-order arrival is fine;
    /// duplicates are idempotent.
    ///
    /// # Errors
    ///
    /// `InvalidInput` for unknown ids, foreign connections, bad indexes
    /// or undecodable data; `FileCorrupt` on a chunk checksum or length
    /// mismatch; `FileTypeBlocked` when the leading bytes contradict the
    /// declared type (the upload is aborted).
    pub async fn put_chunk(
        &self,
        conn_id: ConnectionId,
        file_id: &str,
        chunk_index: u64,
        data_base64: &str,
        chunk_checksum: &str,
    ) -> Result<()> {
        let state = self.upload_state(file_id)?;
        let mut state = state.lock().await;

        if state.conn_id != conn_id {
            return Err(ServerError::invalid_input(
                "upload belongs to another connection",
            ));
        }
        if chunk_index >= state.total_chunks {
            return Err(ServerError::invalid_input("chunk index out of range"));
        }

        let data = BASE64
            .decode(data_base64)
            .map_err(|_| ServerError::invalid_input("chunk data is not valid base64"))?;

        if md5_hex(&data) != chunk_checksum.to_ascii_lowercase() {
            return Err(ServerError::FileCorrupt("chunk checksum mismatch".into()));
        }

        let offset = chunk_index * state.chunk_size as u64;
        let expected_len = if chunk_index == state.total_chunks - 1 {
            (state.declared_size - offset) as usize
        } else {
            state.chunk_size
        };
        if data.len() != expected_len {
            return Err(ServerError::FileCorrupt("chunk length mismatch".into()));
        }

        if chunk_index == 0 && !state.sniff_done {
            state.sniff_done = true;
            if !magic_agrees(&state.mime_type, &data) {
                let mime = state.mime_type.clone();
                drop(state);
                self.abort_upload(file_id).await;
                return Err(ServerError::FileTypeBlocked(
                    format!("file content does not match declared type {mime}").into(),
                ));
            }
        }

        if state.received.contains(&chunk_index) {
            return Ok(());
        }

        state.file.seek(SeekFrom::Start(offset)).await?;
        state.file.write_all(&data).await?;
        state.received.insert(chunk_index);

        Ok(())
    }

    /// Verify the assembled file and move it into place.
    ///
    /// On any verification failure the temp file is deleted and nothing
    /// is persisted.
    ///
    /// # Errors
    ///
    /// `FileCorrupt` on missing chunks, size mismatch or checksum
    /// mismatch.
    pub async fn complete_upload(
        &self,
        conn_id: ConnectionId,
        file_id: &str,
    ) -> Result<CompletedUpload> {
        let state_arc = self.upload_state(file_id)?;
        {
            let state = state_arc.lock().await;
            if state.conn_id != conn_id {
                return Err(ServerError::invalid_input(
                    "upload belongs to another connection",
                ));
            }
        }

        let result = self.verify_and_finalize(file_id, &state_arc).await;
        if result.is_err() {
            self.abort_upload(file_id).await;
        } else {
            self.forget_upload(file_id).await;
        }
        result
    }

    async fn verify_and_finalize(
        &self,
        file_id: &str,
        state_arc: &Arc<Mutex<UploadState>>,
    ) -> Result<CompletedUpload> {
        let mut state = state_arc.lock().await;

        if state.received.len() as u64 != state.total_chunks {
            return Err(ServerError::FileCorrupt(
                format!(
                    "incomplete upload: {}/{} chunks received",
                    state.received.len(),
                    state.total_chunks
                )
                .into(),
            ));
        }

        state.file.flush().await?;
        state.file.sync_all().await?;

        let on_disk = tokio::fs::metadata(&state.temp_path).await?.len();
        if on_disk != state.declared_size {
            return Err(ServerError::FileCorrupt("size mismatch".into()));
        }

        // Stream the whole file back through MD5; never trust the chunks
        // alone.
        let mut reader = File::open(&state.temp_path).await?;
        let mut hasher = Md5::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        let actual = hex::encode(hasher.finalize());
        if actual != state.declared_checksum {
            return Err(ServerError::FileCorrupt("file checksum mismatch".into()));
        }

        tokio::fs::create_dir_all(self.files_dir()).await?;
        let final_path = self.files_dir().join(format!("{file_id}.dat"));
        tokio::fs::rename(&state.temp_path, &final_path).await?;

        tracing::info!(
            file_id,
            filename = %state.filename,
            size = state.declared_size,
            "upload verified and stored"
        );

        Ok(CompletedUpload {
            file_id: file_id.to_string(),
            filename: state.filename.clone(),
            file_size: state.declared_size,
            checksum: state.declared_checksum.clone(),
            mime_type: state.mime_type.clone(),
            uploader_id: state.uploader_id,
            group_id: state.group_id,
            final_path,
        })
    }

    async fn forget_upload(&self, file_id: &str) {
        if let Some((_, state)) = self.uploads.remove(file_id) {
            let state = state.lock().await;
            self.upload_by_conn
                .remove_if(&state.conn_id, |_, id| id == file_id);
        }
    }

    async fn abort_upload(&self, file_id: &str) {
        if let Some((_, state)) = self.uploads.remove(file_id) {
            let state = state.lock().await;
            self.upload_by_conn
                .remove_if(&state.conn_id, |_, id| id == file_id);
            if let Err(e) = tokio::fs::remove_file(&state.temp_path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(file_id, error = %e, "failed to remove temp file");
                }
            }
            tracing::info!(file_id, "upload aborted, temp file removed");
        }
    }

    /// Start a download, optionally restricted to a byte range (range
    /// bounds are mapped onto the chunk grid for resumption).
    ///
    /// # Errors
    ///
    /// `Busy` when this connection already downloads, `InvalidInput` for
    /// unknown files or a bad range.
    pub async fn begin_download(
        &self,
        conn_id: ConnectionId,
        file_id: &str,
        range_start: Option<u64>,
        range_end: Option<u64>,
    ) -> Result<(FileRecord, usize, u64)> {
        if self.downloads.contains_key(&conn_id) {
            return Err(ServerError::Busy);
        }

        let record = self.store.get_file(file_id).await?;
        let file_size = record.file_size as u64;
        let chunk_size = self.download_chunk_size;
        let last_chunk = file_size.div_ceil(chunk_size as u64).saturating_sub(1);

        let start = range_start.unwrap_or(0);
        let end = range_end.unwrap_or(file_size.saturating_sub(1));
        if start > end || end >= file_size {
            return Err(ServerError::invalid_input("invalid byte range"));
        }
        let next_chunk = start / chunk_size as u64;
        let end_chunk = (end / chunk_size as u64).min(last_chunk);

        let file = File::open(&record.server_filepath).await?;
        let state = DownloadState {
            file_id: file_id.to_string(),
            file,
            file_size,
            chunk_size,
            next_chunk,
            end_chunk,
        };
        self.downloads
            .insert(conn_id, Arc::new(Mutex::new(state)));

        let total = end_chunk - next_chunk + 1;
        tracing::info!(file_id, conn_id, total, "download started");
        Ok((record, chunk_size, total))
    }

    /// Read the next chunk of this connection's download. Returns `None`
    /// once the range is exhausted.
    ///
    /// # Errors
    ///
    /// `InvalidInput` when no download is in flight.
    pub async fn next_download_chunk(
        &self,
        conn_id: ConnectionId,
    ) -> Result<Option<DownloadChunk>> {
        let state = self
            .downloads
            .get(&conn_id)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| ServerError::invalid_input("no download in flight"))?;
        let mut state = state.lock().await;

        if state.next_chunk > state.end_chunk {
            return Ok(None);
        }

        let index = state.next_chunk;
        let offset = index * state.chunk_size as u64;
        let len = (state.file_size - offset).min(state.chunk_size as u64) as usize;

        let mut data = vec![0u8; len];
        state.file.seek(SeekFrom::Start(offset)).await?;
        state.file.read_exact(&mut data).await?;
        state.next_chunk += 1;

        Ok(Some(DownloadChunk {
            file_id: state.file_id.clone(),
            chunk_index: index,
            checksum: md5_hex(&data),
            data: BASE64.encode(data),
        }))
    }

    /// Client acknowledged the download; free the slot.
    pub fn complete_download(&self, conn_id: ConnectionId, file_id: &str) {
        self.downloads
            .remove_if(&conn_id, |_, state| match state.try_lock() {
                Ok(s) => s.file_id == file_id,
                Err(_) => false,
            });
    }

    /// Connection went away: cancel its transfers and delete any partial
    /// upload.
    pub async fn cancel_connection(&self, conn_id: ConnectionId) {
        self.downloads.remove(&conn_id);
        if let Some((_, file_id)) = self.upload_by_conn.remove(&conn_id) {
            self.abort_upload(&file_id).await;
        }
    }
}
